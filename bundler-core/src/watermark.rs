//! Watermarks cannot simply pass through the operator. Records of the current bundle are still
//! inside the worker, so forwarding a watermark before the bundle is finished could turn those
//! records "late" downstream although they were on time.
//!
//! Two ways out: finish the bundle on every watermark (lower latency), or hold the watermark until
//! the bundle finishes on its own (higher throughput, bundles are not cut by every watermark).
//! The [WatermarkGate] does the latter. Only the final watermark forces a flush.

use tracing::debug;

use crate::message::Watermark;

/// What to do with an incoming watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GateDecision {
    /// Nothing is buffered, forward right away.
    Forward,
    /// The bundle is not finished, the watermark is held until the next flush.
    Hold,
    /// The final watermark, flush unconditionally and forward.
    Terminal,
    /// Received after the final watermark.
    AfterTerminal,
}

/// WatermarkGate holds back at most one watermark while the bundle is not finished.
#[derive(Debug, Default)]
pub(crate) struct WatermarkGate {
    pending: Option<Watermark>,
    terminated: bool,
}

impl WatermarkGate {
    pub(crate) fn on_watermark(&mut self, watermark: Watermark, bundle_finished: bool) -> GateDecision {
        if self.terminated {
            return GateDecision::AfterTerminal;
        }

        if watermark.is_terminal() {
            self.terminated = true;
            return GateDecision::Terminal;
        }

        if bundle_finished {
            return GateDecision::Forward;
        }

        // watermarks never go backwards, so only the latest one is worth holding
        if let Some(previous) = self.pending.replace(watermark) {
            debug!(%previous, current = %watermark, "Pending watermark superseded");
        }
        GateDecision::Hold
    }

    /// Releases the held watermark, called once the bundle is finished.
    pub(crate) fn take_pending(&mut self) -> Option<Watermark> {
        self.pending.take()
    }

    pub(crate) fn pending(&self) -> Option<Watermark> {
        self.pending
    }

    #[cfg(test)]
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated
    }
}
