use crate::error::PipelineError;
use crate::metrics::PoolMetrics;
use crate::worker::{
  transaction_channel, TransactionReceiver, TransactionSender, Worker, PIPELINE_CHANNEL_CAPACITY,
};

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use opentelemetry::metrics::Meter;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, info, info_span, trace, warn, Instrument};

/// How long teardown waits on a worker before asking it again.
pub const WORKER_CLOSE_POLL: Duration = Duration::from_secs(1);

type WorkerSet<T> = Arc<[Box<dyn Worker<T>>]>;

/// A pool of pipeline workers sharing one input stream.
///
/// Every worker reads from the same input. Their outputs are merged into the
/// single stream returned by [`Pool::transaction_chan`]. Transactions are
/// forwarded by value and never inspected, so any response path they carry
/// stays coupled to them. Order is preserved only along the path through a
/// single worker.
///
/// A pool is single-use: it is started once, closed once and never restarted.
pub struct Pool<T: Send + 'static> {
  pool_name: Arc<str>,
  workers: WorkerSet<T>,
  running: Arc<AtomicBool>,
  started: AtomicBool,
  output_tx: TransactionSender<T>,
  output_rx: TransactionReceiver<T>,
  shutdown_token: CancellationToken,
  closed_token: CancellationToken,
  metrics: Arc<PoolMetrics>,
  tokio_handle: TokioHandle,
}

impl<T: Send + 'static> fmt::Debug for Pool<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pool")
      .field("pool_name", &self.pool_name)
      .field("workers", &self.workers.len())
      .field("running", &self.is_running())
      .field("started", &self.is_started())
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> Pool<T> {
  /// Builds a pool of `threads` workers by calling `factory` once per slot, in
  /// slot order. No worker is started until [`Pool::start_receiving`].
  ///
  /// Counters are registered on `meter` and tagged with `pool_name`.
  ///
  /// # Errors
  /// Returns `PipelineError::WorkerConstruction` for the first slot whose
  /// factory call fails. Workers built for earlier slots are dropped.
  pub fn new<W, E, F>(
    mut factory: F,
    threads: usize,
    tokio_handle: TokioHandle,
    pool_name: &str,
    meter: &Meter,
  ) -> Result<Self, PipelineError>
  where
    W: Worker<T> + 'static,
    E: Display,
    F: FnMut() -> Result<W, E>,
  {
    let mut workers: Vec<Box<dyn Worker<T>>> = Vec::with_capacity(threads);
    for slot in 0..threads {
      match factory() {
        Ok(worker) => workers.push(Box::new(worker)),
        Err(e) => {
          debug!(%pool_name, slot, "Worker factory failed: {}", e);
          return Err(PipelineError::WorkerConstruction {
            slot,
            reason: e.to_string(),
          });
        }
      }
    }

    let (output_tx, output_rx) = transaction_channel();
    debug!(%pool_name, threads, "Pipeline pool constructed.");

    Ok(Self {
      pool_name: Arc::from(pool_name),
      workers: workers.into(),
      running: Arc::new(AtomicBool::new(true)),
      started: AtomicBool::new(false),
      output_tx,
      output_rx,
      shutdown_token: CancellationToken::new(),
      closed_token: CancellationToken::new(),
      metrics: Arc::new(PoolMetrics::new(meter, pool_name)),
      tokio_handle,
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn worker_count(&self) -> usize {
    self.workers.len()
  }

  /// False once shutdown has been requested or teardown has begun.
  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::Acquire)
  }

  pub fn is_started(&self) -> bool {
    self.started.load(Ordering::Acquire)
  }

  /// True once teardown has finished and the output stream is closed.
  pub fn is_closed(&self) -> bool {
    self.closed_token.is_cancelled()
  }

  /// Binds the pool to `input` and launches the coordination loop.
  ///
  /// # Errors
  /// Returns `PipelineError::AlreadyStarted` if the pool was already bound;
  /// the original binding is kept.
  pub fn start_receiving(&self, input: TransactionReceiver<T>) -> Result<(), PipelineError> {
    if self
      .started
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      warn!(pool_name = %self.pool_name, "StartReceiving called on a pool that is already started.");
      return Err(PipelineError::AlreadyStarted);
    }

    let loop_span = info_span!("pipeline_pool", pool_name = %self.pool_name);
    self.tokio_handle.spawn(
      run_coordination_loop(
        self.pool_name.clone(),
        self.workers.clone(),
        input,
        self.running.clone(),
        self.output_tx.clone(),
        self.shutdown_token.clone(),
        self.closed_token.clone(),
        self.metrics.clone(),
        self.tokio_handle.clone(),
      )
      .instrument(loop_span),
    );
    Ok(())
  }

  /// Returns the merged output stream. Closed exactly once, at the end of teardown.
  pub fn transaction_chan(&self) -> TransactionReceiver<T> {
    self.output_rx.clone()
  }

  /// Requests shutdown without waiting for it. Only the first call has an effect.
  pub fn close_async(&self) {
    if self
      .running
      .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      info!(pool_name = %self.pool_name, "Close requested. Broadcasting cancellation.");
      self.shutdown_token.cancel();
    } else {
      trace!(pool_name = %self.pool_name, "Close already in progress.");
    }
  }

  /// Waits until teardown has finished or `timeout` elapses.
  ///
  /// Timing out does not interrupt teardown, which carries on in the background.
  ///
  /// # Errors
  /// Returns `PipelineError::Timeout` if the pool has not closed within `timeout`.
  pub async fn wait_for_close(&self, timeout: Duration) -> Result<(), PipelineError> {
    tokio::time::timeout(timeout, self.closed_token.cancelled())
      .await
      .map_err(|_| PipelineError::Timeout)
  }
}

impl<T: Send + 'static> Worker<T> for Pool<T> {
  fn start_receiving(&self, input: TransactionReceiver<T>) -> Result<(), PipelineError> {
    Pool::start_receiving(self, input)
  }

  fn transaction_chan(&self) -> TransactionReceiver<T> {
    Pool::transaction_chan(self)
  }

  fn close_async(&self) {
    Pool::close_async(self)
  }

  fn wait_for_close(&self, timeout: Duration) -> BoxFuture<'_, Result<(), PipelineError>> {
    Pool::wait_for_close(self, timeout).boxed()
  }
}

impl<T: Send + 'static> Drop for Pool<T> {
  fn drop(&mut self) {
    if self.running.load(Ordering::Acquire) {
      info!(
        pool_name = %self.pool_name,
        "Pool dropped while still running. Initiating implicit shutdown."
      );
      self.close_async();
    }
  }
}

#[allow(clippy::too_many_arguments)]
async fn run_coordination_loop<T: Send + 'static>(
  pool_name: Arc<str>,
  workers: WorkerSet<T>,
  input: TransactionReceiver<T>,
  running: Arc<AtomicBool>,
  output_tx: TransactionSender<T>,
  shutdown_token: CancellationToken,
  closed_token: CancellationToken,
  metrics: Arc<PoolMetrics>,
  tokio_handle: TokioHandle,
) {
  info!(workers = workers.len(), "Coordination loop started.");

  let (internal_tx, mut internal_rx) = mpsc::channel::<T>(PIPELINE_CHANNEL_CAPACITY);
  let remaining = Arc::new(AtomicUsize::new(workers.len()));

  for (slot, worker) in workers.iter().enumerate() {
    if let Err(e) = worker.start_receiving(input.clone()) {
      error!(%pool_name, slot, "Failed to start pipeline worker: {}", e);
      metrics.incr_worker_start_failures();
      remaining.fetch_sub(1, Ordering::AcqRel);
      continue;
    }
    metrics.incr_workers_started();

    tokio_handle.spawn(
      run_relay(
        worker.transaction_chan(),
        internal_tx.clone(),
        remaining.clone(),
        shutdown_token.clone(),
        metrics.clone(),
      )
      .instrument(debug_span!("pipeline_relay", %pool_name, slot)),
    );
  }
  // From here on the fan-in channel closes when the last relay drops its sender.
  drop(internal_tx);
  drop(input);

  loop {
    if !running.load(Ordering::Acquire) && remaining.load(Ordering::Acquire) == 0 {
      debug!("No workers remain and the pool is no longer running.");
      break;
    }

    tokio::select! {
      biased;

      _ = shutdown_token.cancelled() => {
        debug!("Cancellation received. Coordination loop exiting.");
        break;
      }

      next = internal_rx.recv() => {
        let Some(txn) = next else {
          debug!("Fan-in channel closed. All relays have finished.");
          break;
        };

        let forwarded = tokio::select! {
          biased;
          _ = shutdown_token.cancelled() => false,
          sent = output_tx.send(txn) => sent.is_ok(),
        };
        if !forwarded {
          debug!("Transaction in hand dropped while forwarding downstream.");
          metrics.incr_transactions_dropped();
          break;
        }
        metrics.incr_transactions_forwarded();
      }
    }
  }

  // Relays still forwarding see a closed channel and switch to discarding.
  // recv returns None only after in-flight sends have landed or failed.
  internal_rx.close();
  while internal_rx.recv().await.is_some() {
    metrics.incr_transactions_dropped();
  }
  drop(internal_rx);

  teardown(
    &workers,
    &running,
    &shutdown_token,
    &output_tx,
    &closed_token,
    &metrics,
  )
  .await;
}

/// Drains one worker's output onto the shared fan-in channel.
///
/// Once a forward loses to cancellation, the relay keeps reading and
/// discarding until the worker closes its output, so a worker blocked on
/// emitting can still reach its own shutdown.
async fn run_relay<T: Send + 'static>(
  worker_rx: TransactionReceiver<T>,
  internal_tx: mpsc::Sender<T>,
  remaining: Arc<AtomicUsize>,
  shutdown_token: CancellationToken,
  metrics: Arc<PoolMetrics>,
) {
  trace!("Relay started.");
  let mut forwarding = true;

  while let Ok(txn) = worker_rx.recv().await {
    if !forwarding {
      metrics.incr_transactions_dropped();
      continue;
    }

    let forwarded = tokio::select! {
      biased;
      _ = shutdown_token.cancelled() => false,
      sent = internal_tx.send(txn) => sent.is_ok(),
    };
    if !forwarded {
      debug!("Relay dropped an in-hand transaction during shutdown. Discarding until the worker closes.");
      metrics.incr_transactions_dropped();
      forwarding = false;
    }
  }

  drop(internal_tx);
  if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
    debug!("Last relay exited. Fan-in channel closed.");
  } else {
    trace!("Relay exited.");
  }
}

async fn teardown<T: Send + 'static>(
  workers: &WorkerSet<T>,
  running: &AtomicBool,
  shutdown_token: &CancellationToken,
  output_tx: &TransactionSender<T>,
  closed_token: &CancellationToken,
  metrics: &PoolMetrics,
) {
  // Races with close_async; whichever clears the flag fires the signal.
  if running.swap(false, Ordering::AcqRel) {
    shutdown_token.cancel();
  }

  for worker in workers.iter() {
    worker.close_async();
  }

  // Workers may still hold the shared input, so nothing is closed until every
  // one of them confirms.
  for (slot, worker) in workers.iter().enumerate() {
    let mut attempt: u64 = 0;
    while let Err(e) = worker.wait_for_close(WORKER_CLOSE_POLL).await {
      attempt += 1;
      metrics.incr_close_wait_retries();
      warn!(slot, attempt, "Worker has not closed yet ({}). Retrying.", e);
    }
  }

  output_tx.close();
  closed_token.cancel();
  info!("Pipeline pool closed.");
}
