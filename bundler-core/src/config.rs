use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

const ENV_BUNDLER_CONFIG_OBJECT: &str = "BUNDLER_CONFIG_OBJECT";
const ENV_MAX_BUNDLE_SIZE: &str = "BUNDLER_MAX_BUNDLE_SIZE";
const ENV_MAX_BUNDLE_TIME_MS: &str = "BUNDLER_MAX_BUNDLE_TIME_MS";
const ENV_EXECUTION_MODE: &str = "BUNDLER_EXECUTION_MODE";
const ENV_MAX_KEY_DRAIN_ITERATIONS: &str = "BUNDLER_MAX_KEY_DRAIN_ITERATIONS";
const ENV_MAILBOX_SIZE: &str = "BUNDLER_MAILBOX_SIZE";

pub(crate) const DEFAULT_MAX_BUNDLE_SIZE: usize = 100_000;
pub(crate) const DEFAULT_MAX_BUNDLE_TIME_MS: u64 = 1000;
const DEFAULT_MAILBOX_SIZE: usize = 500;
/// Lower bound for the period of the time-based flush check.
const MIN_CHECK_PERIOD: Duration = Duration::from_millis(1);

/// How the operator receives its records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Records of different keys arrive interleaved.
    #[default]
    Streaming,
    /// Records are grouped and sorted by key, every key must be fully processed (timers
    /// included) before the next key starts.
    Batch,
}

impl FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "streaming" => Ok(ExecutionMode::Streaming),
            "batch" => Ok(ExecutionMode::Batch),
            other => Err(Error::Config(format!("unknown execution mode: {other}"))),
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Streaming => write!(f, "streaming"),
            ExecutionMode::Batch => write!(f, "batch"),
        }
    }
}

/// BundleConfig is the raw, user supplied configuration. The thresholds are kept signed so that
/// invalid values can be detected and replaced, see [Thresholds].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BundleConfig {
    pub max_bundle_size: i64,
    pub max_bundle_time_ms: i64,
    pub execution_mode: ExecutionMode,
    /// Upper bound on flush iterations while draining a key in batch mode. None means the drain
    /// runs until the bundle is empty.
    pub max_key_drain_iterations: Option<usize>,
    pub mailbox_size: usize,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            max_bundle_size: DEFAULT_MAX_BUNDLE_SIZE as i64,
            max_bundle_time_ms: DEFAULT_MAX_BUNDLE_TIME_MS as i64,
            execution_mode: ExecutionMode::default(),
            max_key_drain_iterations: None,
            mailbox_size: DEFAULT_MAILBOX_SIZE,
        }
    }
}

impl BundleConfig {
    /// Loads the configuration from the process environment.
    pub fn load() -> Result<Self> {
        let vars: HashMap<String, String> = env::vars().collect();
        vars.try_into()
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds::from_config(self)
    }

    /// Rejects the values that cannot be replaced by a default. Thresholds are not checked here,
    /// [Thresholds::from_config] falls back for them.
    pub fn validate(&self) -> Result<()> {
        if self.mailbox_size == 0 {
            return Err(Error::Config("mailbox size must be positive".to_string()));
        }
        if self.max_key_drain_iterations == Some(0) {
            return Err(Error::Config(
                "max key drain iterations must be positive, leave it unset for no bound"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(env_vars: &HashMap<String, String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Debug,
{
    env_vars
        .get(name)
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("parsing {name}(set to '{value}'): {e:?}")))
        })
        .transpose()
}

/// The config object is applied first, individual env variables override its fields.
impl TryFrom<HashMap<String, String>> for BundleConfig {
    type Error = Error;

    fn try_from(env_vars: HashMap<String, String>) -> Result<Self> {
        let mut config = match env_vars.get(ENV_BUNDLER_CONFIG_OBJECT) {
            Some(encoded) => {
                let decoded = BASE64_STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                    Error::Config(format!("decoding {ENV_BUNDLER_CONFIG_OBJECT}: {e:?}"))
                })?;
                serde_json::from_slice::<BundleConfig>(&decoded).map_err(|e| {
                    Error::Config(format!("parsing {ENV_BUNDLER_CONFIG_OBJECT}: {e:?}"))
                })?
            }
            None => BundleConfig::default(),
        };

        if let Some(size) = parse_env(&env_vars, ENV_MAX_BUNDLE_SIZE)? {
            config.max_bundle_size = size;
        }
        if let Some(time_ms) = parse_env(&env_vars, ENV_MAX_BUNDLE_TIME_MS)? {
            config.max_bundle_time_ms = time_ms;
        }
        if let Some(mode) = parse_env(&env_vars, ENV_EXECUTION_MODE)? {
            config.execution_mode = mode;
        }
        if let Some(iterations) = parse_env(&env_vars, ENV_MAX_KEY_DRAIN_ITERATIONS)? {
            config.max_key_drain_iterations = Some(iterations);
        }
        if let Some(mailbox_size) = parse_env(&env_vars, ENV_MAILBOX_SIZE)? {
            config.mailbox_size = mailbox_size;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Thresholds that trigger a flush of the current bundle. Immutable once built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub max_bundle_size: usize,
    pub max_bundle_duration: Duration,
}

impl Thresholds {
    /// Builds the thresholds, falling back to the defaults for non-positive values.
    pub fn from_config(config: &BundleConfig) -> Self {
        let max_bundle_size = if config.max_bundle_size <= 0 {
            warn!(
                configured = config.max_bundle_size,
                default = DEFAULT_MAX_BUNDLE_SIZE,
                "Invalid value for the maximum bundle size, using the default"
            );
            DEFAULT_MAX_BUNDLE_SIZE
        } else {
            info!(
                max_bundle_size = config.max_bundle_size,
                "The maximum bundle size is configured"
            );
            config.max_bundle_size as usize
        };

        let max_bundle_time_ms = if config.max_bundle_time_ms <= 0 {
            warn!(
                configured = config.max_bundle_time_ms,
                default = DEFAULT_MAX_BUNDLE_TIME_MS,
                "Invalid value for the maximum bundle time, using the default"
            );
            DEFAULT_MAX_BUNDLE_TIME_MS
        } else {
            info!(
                max_bundle_time_ms = config.max_bundle_time_ms,
                "The maximum bundle time is configured"
            );
            config.max_bundle_time_ms as u64
        };

        Self {
            max_bundle_size,
            max_bundle_duration: Duration::from_millis(max_bundle_time_ms),
        }
    }

    /// Period of the time-based flush check.
    pub fn check_period(&self) -> Duration {
        self.max_bundle_duration.max(MIN_CHECK_PERIOD)
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_bundle_size: DEFAULT_MAX_BUNDLE_SIZE,
            max_bundle_duration: Duration::from_millis(DEFAULT_MAX_BUNDLE_TIME_MS),
        }
    }
}
