//! Key boundaries in batch execution. Records arrive grouped and sorted by key and every key has
//! to be completely processed, timers included, before the next key starts. A single flush is not
//! enough for that: timers fired for the old key may put new records into the bundle, so the
//! bundle is flushed and the timers are replayed until it stays empty.

use tracing::{debug, warn};

use crate::bundle::controller::BundleController;
use crate::config::ExecutionMode;
use crate::error::{Error, Result};
use crate::message::Watermark;
use crate::worker::Worker;

/// Log a diagnostic every N drain iterations, a drain that never ends is otherwise silent.
const DRAIN_WARN_INTERVAL: usize = 1000;

/// KeyChangeListener is notified whenever the current key of the operator changes. Timer services
/// implement it to fire the timers registered for a key.
pub trait KeyChangeListener<K, R>: Send {
    /// Whether selecting a new key fires the timers of the key being left behind. Only these
    /// listeners are replayed while draining a key.
    fn fires_timers_on_key_change(&self) -> bool {
        false
    }

    /// `key` became the current key. Returns the records produced by the timers that fired, they
    /// are admitted to the current bundle.
    fn key_selected(&mut self, key: Option<&K>) -> Vec<R>;

    /// Called before a watermark is forwarded downstream.
    fn advance_watermark(&mut self, _watermark: Watermark) {}
}

/// Explicit registry of [KeyChangeListener]s.
pub struct KeyChangeListenerRegistry<K, R> {
    listeners: Vec<Box<dyn KeyChangeListener<K, R>>>,
}

impl<K, R> Default for KeyChangeListenerRegistry<K, R> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<K, R> KeyChangeListenerRegistry<K, R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: impl KeyChangeListener<K, R> + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn key_selected(&mut self, key: Option<&K>) -> Vec<R> {
        self.listeners
            .iter_mut()
            .flat_map(|listener| listener.key_selected(key))
            .collect()
    }

    /// Replays the timers of `current_key`: the timer firing listeners see a switch to `new_key`
    /// and back.
    pub(crate) fn fire_timers(&mut self, current_key: Option<&K>, new_key: Option<&K>) -> Vec<R> {
        let mut fired = Vec::new();
        for listener in self
            .listeners
            .iter_mut()
            .filter(|listener| listener.fires_timers_on_key_change())
        {
            fired.extend(listener.key_selected(new_key));
            fired.extend(listener.key_selected(current_key));
        }
        fired
    }

    pub(crate) fn advance_watermark(&mut self, watermark: Watermark) {
        for listener in self.listeners.iter_mut() {
            listener.advance_watermark(watermark);
        }
    }
}

/// KeyBoundaryFlusher drains the bundle before the current key changes in batch mode. In streaming
/// mode it only tracks the current key.
pub(crate) struct KeyBoundaryFlusher<K> {
    mode: ExecutionMode,
    current_key: Option<K>,
    max_iterations: Option<usize>,
}

impl<K> KeyBoundaryFlusher<K>
where
    K: PartialEq + Send + Sync + 'static,
{
    pub(crate) fn new(mode: ExecutionMode, max_iterations: Option<usize>) -> Self {
        Self {
            mode,
            current_key: None,
            max_iterations,
        }
    }

    #[cfg(test)]
    pub(crate) fn current_key(&self) -> Option<&K> {
        self.current_key.as_ref()
    }

    /// Switches to `new_key`, draining the bundle of the previous key first when needed.
    pub(crate) async fn set_current_key<W>(
        &mut self,
        controller: &mut BundleController<W, K>,
        new_key: Option<K>,
    ) -> Result<()>
    where
        W: Worker,
    {
        self.drain_if_needed(controller, new_key.as_ref()).await?;
        self.current_key = new_key;

        let fired = controller
            .listeners_mut()
            .key_selected(self.current_key.as_ref());
        for record in fired {
            controller.admit(record).await?;
            controller.check_by_count().await?;
        }
        Ok(())
    }

    /// Flushes and replays the timers of the current key until the bundle stays empty, when the
    /// key changes in batch mode. Returns the number of flushes.
    pub(crate) async fn drain_if_needed<W>(
        &mut self,
        controller: &mut BundleController<W, K>,
        new_key: Option<&K>,
    ) -> Result<usize>
    where
        W: Worker,
    {
        if self.mode != ExecutionMode::Batch || self.current_key.as_ref() == new_key {
            return Ok(0);
        }
        self.drain(controller, new_key).await
    }

    /// Fires the timers of the current key at the end of the input and drains whatever they
    /// produce. No key switch follows, so the timers are fired at least once even when the bundle
    /// is already empty. Returns the number of flushes.
    pub(crate) async fn drain_final<W>(
        &mut self,
        controller: &mut BundleController<W, K>,
    ) -> Result<usize>
    where
        W: Worker,
    {
        if self.mode != ExecutionMode::Batch || self.current_key.is_none() {
            return Ok(0);
        }

        let fired = controller
            .listeners_mut()
            .fire_timers(self.current_key.as_ref(), None);
        for record in fired {
            controller.admit(record).await?;
        }
        self.drain(controller, None).await
    }

    /// There is no bound unless `max_iterations` is configured, a worker that keeps producing work
    /// for the same key keeps us here.
    async fn drain<W>(
        &mut self,
        controller: &mut BundleController<W, K>,
        new_key: Option<&K>,
    ) -> Result<usize>
    where
        W: Worker,
    {
        let mut iterations = 0;
        while !controller.is_empty() {
            if let Some(max) = self.max_iterations {
                if iterations >= max {
                    return Err(Error::KeyDrain(format!(
                        "bundle still holds {} records after {iterations} flushes",
                        controller.pending_count()
                    )));
                }
            }

            controller.flush().await?;
            let fired = controller
                .listeners_mut()
                .fire_timers(self.current_key.as_ref(), new_key);
            for record in fired {
                controller.admit(record).await?;
            }

            iterations += 1;
            if iterations % DRAIN_WARN_INTERVAL == 0 {
                warn!(
                    iterations,
                    pending = controller.pending_count(),
                    "Bundle keeps getting refilled while draining the current key"
                );
            }
        }

        if iterations > 0 {
            debug!(iterations, "Drained the bundle of the current key");
        }
        Ok(iterations)
    }
}
