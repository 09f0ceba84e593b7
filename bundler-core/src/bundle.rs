//! A bundle is the set of records admitted since the last flush. It is flushed when it reaches the
//! maximum size, when the maximum bundle time elapsed, before a checkpoint barrier, and when the
//! watermark or the key boundary requires it.

/// Size and time triggered flushing of the current bundle.
pub(crate) mod controller;

/// Counters of the current bundle.
pub(crate) mod state;

/// Periodic trigger for the time based flush.
pub(crate) mod timer;
