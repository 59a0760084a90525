#![allow(dead_code)]

use parking_lot::Mutex;
use pipeline_pool::{
  transaction_channel, PipelineError, TransactionReceiver, TransactionSender, Worker,
};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::future::BoxFuture;
use futures::FutureExt;
use opentelemetry::metrics::{Meter, MeterProvider};
use opentelemetry_sdk::metrics::data::{AggregatedMetrics, MetricData};
use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// Helper to initialize tracing for tests; Once keeps it to a single init per binary.
pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,pipeline_pool=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

/// Collects the pool's OpenTelemetry counters in memory.
pub struct MetricsHarness {
  exporter: InMemoryMetricExporter,
  provider: SdkMeterProvider,
  meter: Meter,
}

impl MetricsHarness {
  pub fn new() -> Self {
    let exporter = InMemoryMetricExporter::default();
    let reader = PeriodicReader::builder(exporter.clone()).build();
    let provider = SdkMeterProvider::builder().with_reader(reader).build();
    let meter = provider.meter("pipeline_pool_tests");
    Self { exporter, provider, meter }
  }

  pub fn meter(&self) -> &Meter {
    &self.meter
  }

  /// Current cumulative value of a `pipeline_pool.*` counter, summed over pools.
  pub fn counter(&self, name: &str) -> u64 {
    self.provider.force_flush().expect("metrics flush failed");
    let exported = self.exporter.get_finished_metrics().expect("metrics export failed");
    let Some(latest) = exported.last() else { return 0 };

    let full_name = format!("pipeline_pool.{name}");
    let mut total = 0;
    for scope in latest.scope_metrics() {
      for metric in scope.metrics() {
        if metric.name() != full_name {
          continue;
        }
        if let AggregatedMetrics::U64(MetricData::Sum(sum)) = metric.data() {
          total += sum.data_points().map(|point| point.value()).sum::<u64>();
        }
      }
    }
    total
  }
}

/// A worker that forwards whatever it reads, optionally pausing a random
/// number of milliseconds per item and lingering before it reports closed.
///
/// An unraced worker emits with a plain send that ignores its own shutdown,
/// so it only stops once somebody takes the item it is holding.
pub struct PassThrough<T: Send + 'static> {
  input: Mutex<Option<TransactionReceiver<T>>>,
  output_tx: TransactionSender<T>,
  output_rx: TransactionReceiver<T>,
  shutdown: CancellationToken,
  closed: CancellationToken,
  max_jitter_ms: u64,
  close_delay: Duration,
  races_emit: bool,
}

impl<T: Send + 'static> PassThrough<T> {
  pub fn new() -> Self {
    Self::with_timing(0, Duration::ZERO)
  }

  pub fn unraced() -> Self {
    Self {
      races_emit: false,
      ..Self::new()
    }
  }

  pub fn with_timing(max_jitter_ms: u64, close_delay: Duration) -> Self {
    let (output_tx, output_rx) = transaction_channel();
    Self {
      input: Mutex::new(None),
      output_tx,
      output_rx,
      shutdown: CancellationToken::new(),
      closed: CancellationToken::new(),
      max_jitter_ms,
      close_delay,
      races_emit: true,
    }
  }
}

impl<T: Send + 'static> Worker<T> for PassThrough<T> {
  fn start_receiving(&self, input: TransactionReceiver<T>) -> Result<(), PipelineError> {
    {
      let mut bound = self.input.lock();
      if bound.is_some() {
        return Err(PipelineError::AlreadyStarted);
      }
      *bound = Some(input.clone());
    }

    let output_tx = self.output_tx.clone();
    let shutdown = self.shutdown.clone();
    let closed = self.closed.clone();
    let max_jitter_ms = self.max_jitter_ms;
    let close_delay = self.close_delay;
    let races_emit = self.races_emit;

    tokio::spawn(async move {
      loop {
        let next = tokio::select! {
          biased;
          _ = shutdown.cancelled() => break,
          next = input.recv() => next,
        };
        let Ok(txn) = next else { break };

        if max_jitter_ms > 0 {
          let pause = rand::rng().random_range(0..=max_jitter_ms);
          sleep(Duration::from_millis(pause)).await;
        }

        if !races_emit {
          if output_tx.send(txn).await.is_err() {
            break;
          }
          continue;
        }

        tokio::select! {
          biased;
          _ = shutdown.cancelled() => break,
          sent = output_tx.send(txn) => if sent.is_err() { break },
        }
      }

      if !close_delay.is_zero() {
        sleep(close_delay).await;
      }
      output_tx.close();
      closed.cancel();
    });
    Ok(())
  }

  fn transaction_chan(&self) -> TransactionReceiver<T> {
    self.output_rx.clone()
  }

  fn close_async(&self) {
    self.shutdown.cancel();
    if self.input.lock().is_none() {
      self.output_tx.close();
      self.closed.cancel();
    }
  }

  fn wait_for_close(&self, timeout: Duration) -> BoxFuture<'_, Result<(), PipelineError>> {
    async move {
      tokio::time::timeout(timeout, self.closed.cancelled())
        .await
        .map_err(|_| PipelineError::Timeout)
    }
    .boxed()
  }
}

/// Refuses to start; records that the pool still asked it to close.
pub struct FailingStart<T: Send + 'static> {
  output_rx: TransactionReceiver<T>,
  close_requested: Arc<AtomicBool>,
  closed: CancellationToken,
}

impl<T: Send + 'static> FailingStart<T> {
  pub fn new(close_requested: Arc<AtomicBool>) -> Self {
    let (output_tx, output_rx) = transaction_channel();
    output_tx.close();
    Self {
      output_rx,
      close_requested,
      closed: CancellationToken::new(),
    }
  }
}

impl<T: Send + 'static> Worker<T> for FailingStart<T> {
  fn start_receiving(&self, _input: TransactionReceiver<T>) -> Result<(), PipelineError> {
    Err(PipelineError::AlreadyStarted)
  }

  fn transaction_chan(&self) -> TransactionReceiver<T> {
    self.output_rx.clone()
  }

  fn close_async(&self) {
    self.close_requested.store(true, Ordering::SeqCst);
    self.closed.cancel();
  }

  fn wait_for_close(&self, timeout: Duration) -> BoxFuture<'_, Result<(), PipelineError>> {
    async move {
      tokio::time::timeout(timeout, self.closed.cancelled())
        .await
        .map_err(|_| PipelineError::Timeout)
    }
    .boxed()
  }
}

pub fn pass_through_factory<T: Send + 'static>() -> impl FnMut() -> Result<PassThrough<T>, PipelineError> {
  || Ok(PassThrough::new())
}

/// Sends every item on `tx` from a background task.
pub fn feed<T: Send + 'static>(tx: TransactionSender<T>, items: Vec<T>) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    for item in items {
      if tx.send(item).await.is_err() {
        tracing::warn!("Input channel closed before all items were sent.");
        return;
      }
    }
  })
}

/// Receives exactly `count` items from `rx`, panicking if that takes longer than `within`.
pub async fn collect<T>(rx: &TransactionReceiver<T>, count: usize, within: Duration) -> Vec<T> {
  tokio::time::timeout(within, async {
    let mut items = Vec::with_capacity(count);
    while items.len() < count {
      match rx.recv().await {
        Ok(item) => items.push(item),
        Err(_) => break,
      }
    }
    items
  })
  .await
  .expect("timed out collecting pool output")
}
