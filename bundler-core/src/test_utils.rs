use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::keyed::KeyChangeListener;
use crate::message::Watermark;
use crate::worker::Worker;

/// Everything the [RecordingWorker] observed, shared with the test.
#[derive(Debug, Default)]
pub(crate) struct WorkerLog {
    pub(crate) opened: bool,
    pub(crate) closed: bool,
    pub(crate) processed: Vec<String>,
    pub(crate) finalize_calls: usize,
    /// Sizes of the bundles handed to `finalize_bundle`, including empty ones.
    pub(crate) bundle_sizes: Vec<usize>,
    pub(crate) fail_finalize: bool,
    pub(crate) fail_close: bool,
}

/// RecordingWorker echoes every record of a bundle when the bundle is finalized.
pub(crate) struct RecordingWorker {
    bundle: Vec<String>,
    log: Arc<Mutex<WorkerLog>>,
}

impl RecordingWorker {
    pub(crate) fn new() -> (Self, Arc<Mutex<WorkerLog>>) {
        let log = Arc::new(Mutex::new(WorkerLog::default()));
        (
            Self {
                bundle: Vec::new(),
                log: Arc::clone(&log),
            },
            log,
        )
    }
}

impl Worker for RecordingWorker {
    type Input = String;
    type Output = String;

    async fn open(&mut self) -> Result<()> {
        self.log.lock().unwrap().opened = true;
        Ok(())
    }

    async fn process(&mut self, record: String) -> Result<()> {
        self.log.lock().unwrap().processed.push(record.clone());
        self.bundle.push(record);
        Ok(())
    }

    async fn finalize_bundle(&mut self) -> Result<Vec<String>> {
        let mut log = self.log.lock().unwrap();
        log.finalize_calls += 1;
        log.bundle_sizes.push(self.bundle.len());
        if log.fail_finalize {
            return Err(Error::Worker("finalize failed".to_string()));
        }
        Ok(std::mem::take(&mut self.bundle))
    }

    async fn close(&mut self) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.closed = true;
        if log.fail_close {
            return Err(Error::Worker("close failed".to_string()));
        }
        Ok(())
    }
}

/// TimerListener mimics a keyed timer service. A firing listener fires the timers of the key it
/// leaves, every firing is logged and `key` has `count` timers producing one record each. A
/// passive listener only logs the keys selected.
pub(crate) struct TimerListener {
    prefix: &'static str,
    fires_timers: bool,
    current: Option<String>,
    timers: HashMap<String, usize>,
    produced: usize,
    log: Arc<Mutex<Vec<String>>>,
    watermarks: Arc<Mutex<Vec<Watermark>>>,
}

impl TimerListener {
    fn build(prefix: &'static str, fires_timers: bool, timers: HashMap<String, usize>) -> Self {
        Self {
            prefix,
            fires_timers,
            current: None,
            timers,
            produced: 0,
            log: Arc::new(Mutex::new(Vec::new())),
            watermarks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn firing(
        prefix: &'static str,
        key: &str,
        count: usize,
    ) -> (Self, Arc<Mutex<Vec<String>>>) {
        let listener = Self::build(prefix, true, HashMap::from([(key.to_string(), count)]));
        let log = Arc::clone(&listener.log);
        (listener, log)
    }

    pub(crate) fn passive() -> (Self, Arc<Mutex<Vec<String>>>) {
        let listener = Self::build("passive", false, HashMap::new());
        let log = Arc::clone(&listener.log);
        (listener, log)
    }

    pub(crate) fn watermarks(&self) -> Arc<Mutex<Vec<Watermark>>> {
        Arc::clone(&self.watermarks)
    }
}

impl KeyChangeListener<String, String> for TimerListener {
    fn fires_timers_on_key_change(&self) -> bool {
        self.fires_timers
    }

    fn key_selected(&mut self, key: Option<&String>) -> Vec<String> {
        if !self.fires_timers {
            if let Some(key) = key {
                self.log.lock().unwrap().push(key.clone());
            }
            self.current = key.cloned();
            return vec![];
        }

        if self.current.as_ref() == key {
            return vec![];
        }

        let mut fired = vec![];
        if let Some(previous) = self.current.take() {
            self.log.lock().unwrap().push(previous.clone());
            if let Some(remaining) = self.timers.get_mut(&previous) {
                if *remaining > 0 {
                    *remaining -= 1;
                    fired.push(format!("{}-{}-{}", self.prefix, previous, self.produced));
                    self.produced += 1;
                }
            }
        }
        self.current = key.cloned();
        fired
    }

    fn advance_watermark(&mut self, watermark: Watermark) {
        self.watermarks.lock().unwrap().push(watermark);
    }
}
