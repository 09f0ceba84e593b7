use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bundle::state::BundleState;
use crate::config::Thresholds;
use crate::error::Result;
use crate::keyed::KeyChangeListenerRegistry;
use crate::message::{Downstream, StreamElement, Watermark};
use crate::watermark::{GateDecision, WatermarkGate};
use crate::worker::Worker;

/// BundleController decides when the current bundle is flushed. It is the only owner of the
/// [BundleState] and of the worker. It is not shared between tasks, the operator actor owning it
/// is the single place where records, watermarks, barriers, key switches and timer ticks are
/// applied.
pub struct BundleController<W: Worker, K> {
    worker: W,
    state: BundleState,
    thresholds: Thresholds,
    gate: WatermarkGate,
    listeners: KeyChangeListenerRegistry<K, W::Input>,
    downstream: Downstream<W::Output>,
}

impl<W, K> BundleController<W, K>
where
    W: Worker,
{
    pub fn new(
        worker: W,
        thresholds: Thresholds,
        listeners: KeyChangeListenerRegistry<K, W::Input>,
        downstream: mpsc::Sender<StreamElement<W::Output>>,
    ) -> Self {
        Self {
            worker,
            state: BundleState::new(Instant::now()),
            thresholds,
            gate: WatermarkGate::default(),
            listeners,
            downstream: Downstream::new(downstream),
        }
    }

    /// Hands the record over to the worker. The caller is expected to follow up with
    /// [Self::check_by_count].
    pub async fn admit(&mut self, record: W::Input) -> Result<()> {
        self.worker.process(record).await?;
        self.state.record_admitted();
        trace!(pending = self.state.pending_count(), "Record admitted");
        Ok(())
    }

    /// Flushes once the bundle reached the maximum size.
    pub async fn check_by_count(&mut self) -> Result<()> {
        if self.state.pending_count() >= self.thresholds.max_bundle_size {
            debug!(
                pending = self.state.pending_count(),
                "Maximum bundle size reached, flushing"
            );
            self.flush().await?;
        }
        Ok(())
    }

    /// Flushes once the maximum bundle time passed since the last flush.
    pub async fn check_by_time(&mut self) -> Result<()> {
        if self.state.since_last_flush(Instant::now()) >= self.thresholds.max_bundle_duration {
            self.flush().await?;
        }
        Ok(())
    }

    /// Finishes the current bundle, a no-op when nothing is pending.
    pub async fn flush(&mut self) -> Result<()> {
        if self.state.is_finished() {
            return Ok(());
        }
        self.finish_bundle().await
    }

    /// Finishes the current bundle even if it is empty. The results are emitted in order, the
    /// state is reset and a held watermark is released before returning. A worker error leaves
    /// the state untouched and is returned as is, it is not retried.
    pub(crate) async fn finish_bundle(&mut self) -> Result<()> {
        let outputs = self.worker.finalize_bundle().await?;
        let flushed = self.state.pending_count();
        let emitted = outputs.len();
        for output in outputs {
            self.downstream.emit_record(output).await?;
        }
        self.state.reset(Instant::now());
        debug!(flushed, emitted, "Bundle finished");

        if let Some(watermark) = self.gate.take_pending() {
            self.forward_watermark(watermark).await?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_finished()
    }

    pub fn pending_count(&self) -> usize {
        self.state.pending_count()
    }

    pub fn last_flush(&self) -> Instant {
        self.state.last_flush()
    }

    pub fn pending_watermark(&self) -> Option<Watermark> {
        self.gate.pending()
    }

    /// Runs the watermark through the gate. Held watermarks are forwarded by the next flush.
    pub(crate) fn observe_watermark(&mut self, watermark: Watermark) -> GateDecision {
        let bundle_finished = self.state.is_finished();
        self.gate.on_watermark(watermark, bundle_finished)
    }

    /// Advances the listeners to the watermark and sends it downstream.
    pub(crate) async fn forward_watermark(&mut self, watermark: Watermark) -> Result<()> {
        self.listeners.advance_watermark(watermark);
        self.downstream.emit_watermark(watermark).await
    }

    pub(crate) fn listeners_mut(&mut self) -> &mut KeyChangeListenerRegistry<K, W::Input> {
        &mut self.listeners
    }

    pub(crate) async fn open_worker(&mut self) -> Result<()> {
        self.worker.open().await?;
        self.state.reset(Instant::now());
        Ok(())
    }

    pub(crate) async fn close_worker(&mut self) -> Result<()> {
        self.worker.close().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::Error;
    use crate::test_utils::{RecordingWorker, TimerListener};

    type TestController = BundleController<RecordingWorker, String>;

    fn controller(
        max_bundle_size: usize,
        max_bundle_duration: Duration,
    ) -> (
        TestController,
        std::sync::Arc<std::sync::Mutex<crate::test_utils::WorkerLog>>,
        mpsc::Receiver<StreamElement<String>>,
    ) {
        let (worker, log) = RecordingWorker::new();
        let (tx, rx) = mpsc::channel(100);
        let thresholds = Thresholds {
            max_bundle_size,
            max_bundle_duration,
        };
        (
            BundleController::new(worker, thresholds, KeyChangeListenerRegistry::new(), tx),
            log,
            rx,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<StreamElement<String>>) -> Vec<StreamElement<String>> {
        let mut elements = vec![];
        while let Ok(element) = rx.try_recv() {
            elements.push(element);
        }
        elements
    }

    fn record(s: &str) -> StreamElement<String> {
        StreamElement::Record(s.to_string())
    }

    #[tokio::test]
    async fn test_flush_by_count() {
        let (mut controller, log, mut rx) = controller(3, Duration::from_secs(60));

        for r in ["a", "b"] {
            controller.admit(r.to_string()).await.unwrap();
            controller.check_by_count().await.unwrap();
        }
        assert!(!controller.is_empty());
        assert_eq!(log.lock().unwrap().finalize_calls, 0);

        controller.admit("c".to_string()).await.unwrap();
        controller.check_by_count().await.unwrap();
        assert!(controller.is_empty());
        assert_eq!(log.lock().unwrap().finalize_calls, 1);
        assert_eq!(drain(&mut rx), vec![record("a"), record("b"), record("c")]);
    }

    #[tokio::test]
    async fn test_flush_exactly_at_threshold() {
        let (mut controller, log, _rx) = controller(4, Duration::from_secs(60));

        for i in 0..10 {
            controller.admit(i.to_string()).await.unwrap();
            controller.check_by_count().await.unwrap();
        }
        // flushed at the 4th and the 8th record, 2 still pending
        assert_eq!(log.lock().unwrap().bundle_sizes, vec![4, 4]);
        assert_eq!(controller.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_flush_on_empty_bundle_is_noop() {
        let (mut controller, log, mut rx) = controller(3, Duration::from_secs(60));
        let last_flush = controller.last_flush();

        controller.flush().await.unwrap();
        controller.flush().await.unwrap();

        assert_eq!(log.lock().unwrap().finalize_calls, 0);
        assert_eq!(controller.last_flush(), last_flush);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_by_time() {
        let (mut controller, log, mut rx) = controller(100, Duration::from_millis(100));
        let start = controller.last_flush();

        controller.admit("a".to_string()).await.unwrap();
        tokio::time::advance(Duration::from_millis(99)).await;
        controller.check_by_time().await.unwrap();
        assert_eq!(log.lock().unwrap().finalize_calls, 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        controller.check_by_time().await.unwrap();
        assert_eq!(log.lock().unwrap().finalize_calls, 1);
        assert!(controller.is_empty());
        assert_eq!(controller.last_flush() - start, Duration::from_millis(100));
        assert_eq!(drain(&mut rx), vec![record("a")]);

        // due again, but nothing is pending
        tokio::time::advance(Duration::from_millis(150)).await;
        controller.check_by_time().await.unwrap();
        assert_eq!(log.lock().unwrap().finalize_calls, 1);
    }

    #[tokio::test]
    async fn test_held_watermark_released_after_flush() {
        let (mut controller, _log, mut rx) = controller(3, Duration::from_secs(60));
        let w1 = Watermark::from_millis(1_000);
        let w2 = Watermark::from_millis(2_000);

        controller.admit("a".to_string()).await.unwrap();
        controller.admit("b".to_string()).await.unwrap();
        assert_eq!(controller.observe_watermark(w1), GateDecision::Hold);
        assert_eq!(controller.pending_watermark(), Some(w1));
        assert!(drain(&mut rx).is_empty());

        controller.flush().await.unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![record("a"), record("b"), StreamElement::Watermark(w1)]
        );
        assert_eq!(controller.pending_watermark(), None);

        // w2 arrives after a new record and is superseded before the flush
        controller.admit("c".to_string()).await.unwrap();
        assert_eq!(controller.observe_watermark(w2), GateDecision::Hold);
        let w3 = Watermark::from_millis(3_000);
        assert_eq!(controller.observe_watermark(w3), GateDecision::Hold);
        controller.flush().await.unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![record("c"), StreamElement::Watermark(w3)]
        );
    }

    #[tokio::test]
    async fn test_forwarded_watermark_advances_listeners() {
        let (worker, _log) = RecordingWorker::new();
        let (listener, _) = TimerListener::passive();
        let watermarks = listener.watermarks();
        let mut registry = KeyChangeListenerRegistry::new();
        registry.register(listener);
        let (tx, mut rx) = mpsc::channel(10);
        let mut controller: TestController =
            BundleController::new(worker, Thresholds::default(), registry, tx);

        let wm = Watermark::from_millis(42);
        assert_eq!(controller.observe_watermark(wm), GateDecision::Forward);
        controller.forward_watermark(wm).await.unwrap();

        assert_eq!(watermarks.lock().unwrap().as_slice(), [wm]);
        assert_eq!(drain(&mut rx), vec![StreamElement::Watermark(wm)]);
    }

    #[tokio::test]
    async fn test_worker_failure_propagates() {
        let (mut controller, log, mut rx) = controller(2, Duration::from_secs(60));
        log.lock().unwrap().fail_finalize = true;

        controller.admit("a".to_string()).await.unwrap();
        controller.admit("b".to_string()).await.unwrap();
        let err = controller.check_by_count().await.unwrap_err();

        assert_eq!(err, Error::Worker("finalize failed".to_string()));
        // nothing was emitted and the bundle is still pending
        assert_eq!(controller.pending_count(), 2);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_finish_bundle_invokes_worker_when_empty() {
        let (mut controller, log, _rx) = controller(2, Duration::from_secs(60));
        controller.finish_bundle().await.unwrap();
        assert_eq!(log.lock().unwrap().bundle_sizes, vec![0]);
    }
}
