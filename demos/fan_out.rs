use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use pipeline_pool::{
  transaction_channel, PipelineError, Pool, Response, Transaction, TransactionReceiver,
  TransactionSender, Worker,
};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Upper-cases every payload it reads.
struct Shouter {
  input: Mutex<Option<TransactionReceiver<Transaction<String>>>>,
  output_tx: TransactionSender<Transaction<String>>,
  output_rx: TransactionReceiver<Transaction<String>>,
  shutdown: CancellationToken,
  closed: CancellationToken,
}

impl Shouter {
  fn new() -> Self {
    let (output_tx, output_rx) = transaction_channel();
    Self {
      input: Mutex::new(None),
      output_tx,
      output_rx,
      shutdown: CancellationToken::new(),
      closed: CancellationToken::new(),
    }
  }
}

impl Worker<Transaction<String>> for Shouter {
  fn start_receiving(&self, input: TransactionReceiver<Transaction<String>>) -> Result<(), PipelineError> {
    let mut bound = self.input.lock();
    if bound.is_some() {
      return Err(PipelineError::AlreadyStarted);
    }
    *bound = Some(input.clone());

    let output_tx = self.output_tx.clone();
    let shutdown = self.shutdown.clone();
    let closed = self.closed.clone();
    tokio::spawn(async move {
      loop {
        let next = tokio::select! {
          biased;
          _ = shutdown.cancelled() => break,
          next = input.recv() => next,
        };
        let Ok(txn) = next else { break };
        let txn = txn.map(|text| text.to_uppercase());
        tokio::select! {
          biased;
          _ = shutdown.cancelled() => break,
          sent = output_tx.send(txn) => if sent.is_err() { break },
        }
      }
      output_tx.close();
      closed.cancel();
    });
    Ok(())
  }

  fn transaction_chan(&self) -> TransactionReceiver<Transaction<String>> {
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

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();
  info!("--- Fan-out Pool Example ---");

  // No meter provider is installed, so counters go to the global no-op meter.
  let meter = opentelemetry::global::meter("fan_out");
  let pool = Pool::new(
    || Ok::<_, PipelineError>(Shouter::new()),
    4,
    Handle::current(),
    "fan_out_pool",
    &meter,
  )?;

  let (tx, rx) = transaction_channel();
  pool.start_receiving(rx)?;

  let out = pool.transaction_chan();
  let sink = tokio::spawn(async move {
    while let Ok(txn) = out.recv().await {
      info!("Sink received: {}", txn.payload());
      if let Err(e) = txn.respond(Response::Ack) {
        tracing::warn!("Originator went away before the ack: {}", e);
      }
    }
    info!("Pool output closed.");
  });

  for word in ["alpha", "beta", "gamma", "delta", "epsilon"] {
    let (txn, response_rx) = Transaction::new(word.to_string());
    tx.send(txn).await.map_err(|_| PipelineError::Disconnected)?;
    info!("'{}' acknowledged with {:?}", word, response_rx.recv().await?);
  }

  pool.close_async();
  pool.wait_for_close(Duration::from_secs(2)).await?;
  if let Err(e) = sink.await {
    tracing::error!("Sink task failed: {:?}", e);
  }

  info!("--- Fan-out Pool Example End ---");
  Ok(())
}
