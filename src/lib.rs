//! A Tokio-based pipeline worker pool that fans one upstream stream of
//! transactions out to parallel workers and merges their output back into a
//! single stream, with race-free startup and shutdown.

mod error;
mod metrics;
mod pool;
mod transaction;
mod worker;

pub use error::PipelineError;
pub use pool::{Pool, WORKER_CLOSE_POLL};
pub use transaction::{Responder, Response, ResponseReceiver, Transaction};
pub use worker::{
  transaction_channel, TransactionReceiver, TransactionSender, Worker, PIPELINE_CHANNEL_CAPACITY,
};
