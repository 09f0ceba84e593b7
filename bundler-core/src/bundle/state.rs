use std::time::Duration;

use tokio::time::Instant;

/// BundleState tracks the records admitted since the last flush. Mutated only by the
/// [super::controller::BundleController] which owns it.
#[derive(Debug)]
pub(crate) struct BundleState {
    pending_count: usize,
    last_flush: Instant,
}

impl BundleState {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            pending_count: 0,
            last_flush: now,
        }
    }

    pub(crate) fn record_admitted(&mut self) {
        self.pending_count += 1;
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending_count
    }

    /// A bundle with nothing pending is finished.
    pub(crate) fn is_finished(&self) -> bool {
        self.pending_count == 0
    }

    pub(crate) fn last_flush(&self) -> Instant {
        self.last_flush
    }

    pub(crate) fn since_last_flush(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_flush)
    }

    pub(crate) fn reset(&mut self, now: Instant) {
        self.pending_count = 0;
        self.last_flush = now;
    }
}
