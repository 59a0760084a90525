use thiserror::Error;

/// Errors that can occur within a pipeline pool or one of its workers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
  #[error("Pipeline has already been bound to an input channel")]
  AlreadyStarted,

  #[error("Timed out waiting for the pipeline to close")]
  Timeout,

  #[error("Failed to construct pipeline worker for slot {slot}: {reason}")]
  WorkerConstruction { slot: usize, reason: String },

  #[error("Response path is disconnected (the other end was dropped)")]
  Disconnected,
}
