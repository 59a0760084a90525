use crate::error::PipelineError;

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

/// The receiving half of a transaction stream.
///
/// Receivers are cloneable; every clone competes for the same items, which is
/// how several workers share one upstream input.
pub type TransactionReceiver<T> = async_channel::Receiver<T>;

/// The sending half of a transaction stream.
pub type TransactionSender<T> = async_channel::Sender<T>;

/// Capacity used for every channel a pool creates.
///
/// The smallest capacity a channel can have, so a slow consumer pushes back
/// through the pool onto worker outputs almost immediately.
pub const PIPELINE_CHANNEL_CAPACITY: usize = 1;

/// Creates a transaction channel with [`PIPELINE_CHANNEL_CAPACITY`].
pub fn transaction_channel<T>() -> (TransactionSender<T>, TransactionReceiver<T>) {
  async_channel::bounded(PIPELINE_CHANNEL_CAPACITY)
}

/// A processing unit that reads transactions from a shared input and emits
/// them on its own output.
///
/// [`Pool`](crate::Pool) implements this trait as well, so pools can be nested
/// anywhere a single worker is expected.
pub trait Worker<T>: Send + Sync {
  /// Binds the worker to an input stream and starts processing.
  ///
  /// # Errors
  /// Implementations return [`PipelineError::AlreadyStarted`] when called twice.
  fn start_receiving(&self, input: TransactionReceiver<T>) -> Result<(), PipelineError>;

  /// Returns the stream this worker emits processed transactions on.
  ///
  /// The stream must close once the worker has shut down.
  fn transaction_chan(&self) -> TransactionReceiver<T>;

  /// Requests shutdown without waiting for it. Idempotent.
  fn close_async(&self);

  /// Waits until the worker has fully shut down.
  ///
  /// # Errors
  /// Returns [`PipelineError::Timeout`] if `timeout` elapses first.
  fn wait_for_close(&self, timeout: Duration) -> BoxFuture<'_, Result<(), PipelineError>>;
}

impl<T, W: Worker<T> + ?Sized> Worker<T> for Box<W> {
  fn start_receiving(&self, input: TransactionReceiver<T>) -> Result<(), PipelineError> {
    (**self).start_receiving(input)
  }

  fn transaction_chan(&self) -> TransactionReceiver<T> {
    (**self).transaction_chan()
  }

  fn close_async(&self) {
    (**self).close_async()
  }

  fn wait_for_close(&self, timeout: Duration) -> BoxFuture<'_, Result<(), PipelineError>> {
    (**self).wait_for_close(timeout)
  }
}

impl<T, W: Worker<T> + ?Sized> Worker<T> for Arc<W> {
  fn start_receiving(&self, input: TransactionReceiver<T>) -> Result<(), PipelineError> {
    (**self).start_receiving(input)
  }

  fn transaction_chan(&self) -> TransactionReceiver<T> {
    (**self).transaction_chan()
  }

  fn close_async(&self) {
    (**self).close_async()
  }

  fn wait_for_close(&self, timeout: Duration) -> BoxFuture<'_, Result<(), PipelineError>> {
    (**self).wait_for_close(timeout)
  }
}
