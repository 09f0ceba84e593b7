use crate::error::Result;

/// Worker backed by an external command, invoked once per bundle.
pub mod command;

/// Worker executes the user logic on a bundle of records. Invoking it is expensive, hence the
/// records are handed over one by one with [Worker::process] and the results are only produced
/// once the bundle is finalized.
#[trait_variant::make(Send)]
pub trait Worker: Send {
    type Input: Send + 'static;
    type Output: Send + 'static;

    /// Creates the runtime that executes the user logic. Called once before the first record.
    async fn open(&mut self) -> Result<()>;

    /// Adds a record to the current bundle.
    async fn process(&mut self, record: Self::Input) -> Result<()>;

    /// Processes everything handed over since the last call and returns the results in
    /// admission order. Must be a cheap no-op when nothing is pending.
    async fn finalize_bundle(&mut self) -> Result<Vec<Self::Output>>;

    /// Releases the runtime.
    async fn close(&mut self) -> Result<()>;
}
