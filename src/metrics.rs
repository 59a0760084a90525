use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::KeyValue;

/// OpenTelemetry counters a pool reports into while it runs.
///
/// Built from a caller-supplied [`Meter`]; the pool never creates a meter
/// provider of its own. Every data point is tagged with the pool's name.
#[derive(Clone)]
pub(crate) struct PoolMetrics {
  workers_started: Counter<u64>,
  worker_start_failures: Counter<u64>,
  transactions_forwarded: Counter<u64>,
  transactions_dropped: Counter<u64>,
  close_wait_retries: Counter<u64>,
  attributes: [KeyValue; 1],
}

impl PoolMetrics {
  pub(crate) fn new(meter: &Meter, pool_name: &str) -> Self {
    Self {
      workers_started: meter
        .u64_counter("pipeline_pool.workers_started")
        .with_description("Workers that started receiving")
        .build(),
      worker_start_failures: meter
        .u64_counter("pipeline_pool.worker_start_failures")
        .with_description("Workers excluded because they failed to start")
        .build(),
      transactions_forwarded: meter
        .u64_counter("pipeline_pool.transactions_forwarded")
        .with_description("Transactions delivered on the pool output")
        .build(),
      transactions_dropped: meter
        .u64_counter("pipeline_pool.transactions_dropped")
        .with_description("Transactions lost to the shutdown race")
        .build(),
      close_wait_retries: meter
        .u64_counter("pipeline_pool.close_wait_retries")
        .with_description("Teardown waits that timed out and were retried")
        .build(),
      attributes: [KeyValue::new("pool.name", pool_name.to_string())],
    }
  }

  pub(crate) fn incr_workers_started(&self) {
    self.workers_started.add(1, &self.attributes);
  }

  pub(crate) fn incr_worker_start_failures(&self) {
    self.worker_start_failures.add(1, &self.attributes);
  }

  pub(crate) fn incr_transactions_forwarded(&self) {
    self.transactions_forwarded.add(1, &self.attributes);
  }

  pub(crate) fn incr_transactions_dropped(&self) {
    self.transactions_dropped.add(1, &self.attributes);
  }

  pub(crate) fn incr_close_wait_retries(&self) {
    self.close_wait_retries.add(1, &self.attributes);
  }
}
