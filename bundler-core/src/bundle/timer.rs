use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, warn};

/// FlushTimer ticks every `period` and posts the tick to the operator. It never touches the bundle
/// itself, the operator runs the time check when it picks the tick up.
pub(crate) struct FlushTimer {
    cln_token: CancellationToken,
    handle: Option<AbortOnDropHandle<()>>,
}

impl FlushTimer {
    /// Starts the timer. The first tick happens one `period` from now.
    pub(crate) fn start(period: Duration) -> (Self, mpsc::Receiver<Instant>) {
        // a single slot, ticks that pile up while a flush is running are coalesced
        let (tick_tx, tick_rx) = mpsc::channel(1);
        let cln_token = CancellationToken::new();

        let token = cln_token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    tick = interval.tick() => {
                        if let Err(TrySendError::Closed(_)) = tick_tx.try_send(tick) {
                            break;
                        }
                    }
                }
            }
            debug!("Flush timer stopped");
        });

        (
            Self {
                cln_token,
                handle: Some(AbortOnDropHandle::new(handle)),
            },
            tick_rx,
        )
    }

    /// Stops the timer and waits for its task to exit. Failures are only logged.
    pub(crate) async fn cancel(&mut self) {
        self.cln_token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(?e, "Flush timer task did not exit cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_every_period() {
        let (mut timer, mut ticks) = FlushTimer::start(Duration::from_millis(100));
        let start = Instant::now();

        let first = ticks.recv().await.unwrap();
        assert_eq!(first - start, Duration::from_millis(100));
        let second = ticks.recv().await.unwrap();
        assert_eq!(second - first, Duration::from_millis(100));

        timer.cancel().await;
        assert!(ticks.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_are_coalesced() {
        let (mut timer, mut ticks) = FlushTimer::start(Duration::from_millis(10));

        // nobody consumes the ticks for a while
        tokio::time::sleep(Duration::from_millis(55)).await;
        assert!(ticks.recv().await.is_some());
        assert!(ticks.try_recv().is_err());

        timer.cancel().await;
        // cancelling twice is harmless
        timer.cancel().await;
    }
}
