//! Bundling for operators that hand their records to an expensive worker. Records are collected
//! into bundles and the worker is only invoked once per bundle:
//! - when the bundle reached the maximum size
//! - when the maximum bundle time passed since the last flush
//! - before a checkpoint barrier, so no buffered record is missing from the snapshot
//! - at a key boundary in batch execution, and on the final watermark
//!
//! Watermarks are held back while a bundle is open so that records inside the worker never become
//! late downstream.

mod error;
pub use crate::error::{Error, Result};

/// Configuration of the bundle thresholds and the execution mode.
pub mod config;
pub use crate::config::{BundleConfig, ExecutionMode, Thresholds};

mod bundle;
pub use crate::bundle::controller::BundleController;

mod keyed;
pub use crate::keyed::{KeyChangeListener, KeyChangeListenerRegistry};

mod message;
pub use crate::message::{StreamElement, Watermark};

mod operator;
pub use crate::operator::{BundleHandle, BundleStatus};

mod watermark;

/// The worker executing the user logic.
pub mod worker;
pub use crate::worker::Worker;

#[cfg(test)]
mod test_utils;
