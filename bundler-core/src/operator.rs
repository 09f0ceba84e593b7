use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bundle::controller::BundleController;
use crate::bundle::timer::FlushTimer;
use crate::config::BundleConfig;
use crate::error::{Error, Result};
use crate::keyed::{KeyBoundaryFlusher, KeyChangeListenerRegistry};
use crate::message::{StreamElement, Watermark};
use crate::watermark::GateDecision;
use crate::worker::Worker;

/// Snapshot of the current bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleStatus {
    pub pending_count: usize,
    pub last_flush: Instant,
    pub pending_watermark: Option<Watermark>,
}

/// Operations of the processing path, applied in order by the [BundleActor].
enum Operation<K, I> {
    ProcessElement(I),
    ProcessWatermark(Watermark),
    PrepareSnapshot { checkpoint_id: u64 },
    SetCurrentKey(Option<K>),
    Finish,
}

/// Messages that can be sent to the [BundleActor].
enum OperatorMessage<K, I> {
    Apply {
        operation: Operation<K, I>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Status {
        respond_to: oneshot::Sender<Result<BundleStatus>>,
    },
    Close {
        respond_to: oneshot::Sender<Result<()>>,
    },
}

/// BundleActor owns the [BundleController] and applies the operations one at a time, whether
/// they come from the processing path or from the [FlushTimer].
///
/// Error handling: a failure while flushing is fatal. The error is returned to the caller that
/// triggered it (or logged if it was a timer tick), the cancellation token is cancelled to let the
/// upstream know, and every later request is answered with the same error. Only `close` is still
/// served so the resources can be released.
struct BundleActor<W: Worker, K> {
    controller: BundleController<W, K>,
    key_flusher: KeyBoundaryFlusher<K>,
    timer: FlushTimer,
    cln_token: CancellationToken,
    /// this the final state of the component (any error will set this as Err)
    final_result: Result<()>,
}

impl<W, K> BundleActor<W, K>
where
    W: Worker + 'static,
    K: PartialEq + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<OperatorMessage<K, W::Input>>,
        mut ticks: mpsc::Receiver<Instant>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                biased;
                Some(_) = ticks.recv() => {
                    self.on_tick().await;
                }
                message = mailbox.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    if self.handle_message(message).await {
                        break;
                    }
                }
            }
        }

        // every handle is gone or the operator was closed
        self.timer.cancel().await;
        info!(status = ?self.final_result, "Bundle operator stopped");
        self.final_result
    }

    /// Handles a message, returns true once the operator is closed.
    async fn handle_message(&mut self, message: OperatorMessage<K, W::Input>) -> bool {
        match message {
            OperatorMessage::Apply {
                operation,
                respond_to,
            } => {
                let result = self.apply(operation).await;
                let _ = respond_to.send(result);
            }
            OperatorMessage::Status { respond_to } => {
                let result = self.final_result.clone().map(|_| BundleStatus {
                    pending_count: self.controller.pending_count(),
                    last_flush: self.controller.last_flush(),
                    pending_watermark: self.controller.pending_watermark(),
                });
                let _ = respond_to.send(result);
            }
            OperatorMessage::Close { respond_to } => {
                self.close().await;
                let _ = respond_to.send(self.final_result.clone());
                return true;
            }
        }
        false
    }

    /// Applies the operation unless the operator already failed, a failure is recorded.
    async fn apply(&mut self, operation: Operation<K, W::Input>) -> Result<()> {
        self.final_result.clone()?;

        let result = match operation {
            Operation::ProcessElement(record) => self.process_element(record).await,
            Operation::ProcessWatermark(watermark) => self.process_watermark(watermark).await,
            Operation::PrepareSnapshot { checkpoint_id } => {
                self.prepare_snapshot(checkpoint_id).await
            }
            Operation::SetCurrentKey(key) => {
                self.key_flusher
                    .set_current_key(&mut self.controller, key)
                    .await
            }
            Operation::Finish => self.controller.flush().await,
        };

        if let Err(e) = &result {
            self.fail(e.clone());
        }
        result
    }

    fn fail(&mut self, e: Error) {
        error!(?e, "Bundle operator failed, shutting down");
        self.cln_token.cancel();
        self.final_result = Err(e);
    }

    async fn on_tick(&mut self) {
        if self.final_result.is_err() {
            return;
        }
        if let Err(e) = self.controller.check_by_time().await {
            self.fail(e);
        }
    }

    async fn process_element(&mut self, record: W::Input) -> Result<()> {
        self.controller.admit(record).await?;
        self.controller.check_by_count().await
    }

    async fn process_watermark(&mut self, watermark: Watermark) -> Result<()> {
        match self.controller.observe_watermark(watermark) {
            GateDecision::Terminal => {
                self.controller.finish_bundle().await?;
                self.key_flusher.drain_final(&mut self.controller).await?;
                self.controller.forward_watermark(watermark).await
            }
            GateDecision::Forward => self.controller.forward_watermark(watermark).await,
            GateDecision::Hold => {
                debug!(%watermark, "Holding watermark until the bundle is finished");
                Ok(())
            }
            GateDecision::AfterTerminal => {
                warn!(%watermark, "Ignoring watermark received after the final watermark");
                Ok(())
            }
        }
    }

    async fn prepare_snapshot(&mut self, checkpoint_id: u64) -> Result<()> {
        debug!(
            checkpoint_id,
            pending = self.controller.pending_count(),
            "Flushing before the checkpoint barrier"
        );
        self.controller.flush().await
    }

    /// Releases the timer and the worker. Failures here are logged, they never replace the
    /// outcome of the operator.
    async fn close(&mut self) {
        self.timer.cancel().await;
        if !self.controller.is_empty() {
            warn!(
                pending = self.controller.pending_count(),
                "Closing with records that were never flushed"
            );
        }
        if let Err(e) = self.controller.close_worker().await {
            warn!(?e, "Failed to close the worker");
        }
    }
}

/// Handle to the bundling operator. It is the processing path of the operator, every call waits
/// until the actor applied it, so a flush triggered by a call backpressures the caller.
pub struct BundleHandle<K, I> {
    sender: mpsc::Sender<OperatorMessage<K, I>>,
}

impl<K, I> Clone for BundleHandle<K, I> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<K, I> BundleHandle<K, I>
where
    K: PartialEq + Send + Sync + 'static,
    I: Send + 'static,
{
    /// Opens the worker, arms the flush timer and starts the operator. The returned join handle
    /// resolves to the final state of the operator once it is closed or all handles are dropped.
    /// `cln_token` is cancelled when the operator fails.
    pub async fn open<W>(
        config: &BundleConfig,
        worker: W,
        listeners: KeyChangeListenerRegistry<K, I>,
        downstream: mpsc::Sender<StreamElement<W::Output>>,
        cln_token: CancellationToken,
    ) -> Result<(Self, JoinHandle<Result<()>>)>
    where
        W: Worker<Input = I> + 'static,
    {
        config.validate()?;
        let thresholds = config.thresholds();
        let mut controller = BundleController::new(worker, thresholds, listeners, downstream);
        controller.open_worker().await?;

        let (timer, ticks) = FlushTimer::start(thresholds.check_period());
        let (sender, mailbox) = mpsc::channel(config.mailbox_size);

        let actor = BundleActor {
            controller,
            key_flusher: KeyBoundaryFlusher::new(
                config.execution_mode,
                config.max_key_drain_iterations,
            ),
            timer,
            cln_token,
            final_result: Ok(()),
        };

        info!(
            max_bundle_size = thresholds.max_bundle_size,
            max_bundle_duration = ?thresholds.max_bundle_duration,
            execution_mode = %config.execution_mode,
            "Bundle operator started"
        );
        let handle = tokio::spawn(async move { actor.run(mailbox, ticks).await });
        Ok((Self { sender }, handle))
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<Result<T>>) -> OperatorMessage<K, I>,
    ) -> Result<T> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(message(respond_to))
            .await
            .map_err(|_| Error::Terminated("bundle operator is not running".to_string()))?;
        response
            .await
            .map_err(|e| Error::ActorPatternRecv(e.to_string()))?
    }

    async fn apply(&self, operation: Operation<K, I>) -> Result<()> {
        self.request(|respond_to| OperatorMessage::Apply {
            operation,
            respond_to,
        })
        .await
    }

    /// Admits a record to the current bundle, flushing it if it is full.
    pub async fn process_element(&self, record: I) -> Result<()> {
        self.apply(Operation::ProcessElement(record)).await
    }

    /// Forwards the watermark, or holds it until the current bundle is finished.
    pub async fn process_watermark(&self, watermark: Watermark) -> Result<()> {
        self.apply(Operation::ProcessWatermark(watermark)).await
    }

    /// Flushes the current bundle, returns once every buffered record was emitted.
    pub async fn prepare_snapshot_pre_barrier(&self, checkpoint_id: u64) -> Result<()> {
        self.apply(Operation::PrepareSnapshot { checkpoint_id })
            .await
    }

    /// Switches the current key. In batch mode the bundle of the previous key is drained first.
    pub async fn set_current_key(&self, key: Option<K>) -> Result<()> {
        self.apply(Operation::SetCurrentKey(key)).await
    }

    pub async fn status(&self) -> Result<BundleStatus> {
        self.request(|respond_to| OperatorMessage::Status { respond_to })
            .await
    }

    pub async fn is_bundle_finished(&self) -> Result<bool> {
        Ok(self.status().await?.pending_count == 0)
    }

    /// Flushes whatever is left at the end of the input.
    pub async fn finish(&self) -> Result<()> {
        self.apply(Operation::Finish).await
    }

    /// Cancels the flush timer, closes the worker and stops the operator. Unflushed records are
    /// dropped, call [Self::finish] first.
    pub async fn close(&self) -> Result<()> {
        self.request(|respond_to| OperatorMessage::Close { respond_to })
            .await
    }
}
