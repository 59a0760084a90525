use crate::error::PipelineError;

use std::fmt;

use tokio::sync::oneshot;

/// The outcome a downstream consumer reports back to a transaction's originator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
  Ack,
  Nack(String),
}

/// One message in flight, coupled to the private path its response travels on.
///
/// A pool forwards transactions by value and never looks inside, so the
/// response path stays attached to the payload from source to sink.
pub struct Transaction<P> {
  payload: P,
  response_tx: oneshot::Sender<Response>,
}

impl<P: fmt::Debug> fmt::Debug for Transaction<P> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Transaction")
      .field("payload", &self.payload)
      .field("awaiting_response", &!self.response_tx.is_closed())
      .finish()
  }
}

impl<P> Transaction<P> {
  /// Creates a transaction and the receiver its originator awaits the response on.
  pub fn new(payload: P) -> (Self, ResponseReceiver) {
    let (response_tx, response_rx) = oneshot::channel();
    (Self { payload, response_tx }, ResponseReceiver { rx: response_rx })
  }

  pub fn payload(&self) -> &P {
    &self.payload
  }

  pub fn payload_mut(&mut self) -> &mut P {
    &mut self.payload
  }

  /// Consumes the transaction, returning the payload and a detached responder.
  pub fn into_parts(self) -> (P, Responder) {
    (self.payload, Responder { tx: self.response_tx })
  }

  /// Replaces the payload while keeping the response path.
  pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> Transaction<Q> {
    Transaction {
      payload: f(self.payload),
      response_tx: self.response_tx,
    }
  }

  /// Sends `response` to the originator, consuming the transaction.
  ///
  /// # Errors
  /// Returns `PipelineError::Disconnected` if the originator dropped its receiver.
  pub fn respond(self, response: Response) -> Result<(), PipelineError> {
    self.response_tx.send(response).map_err(|_| PipelineError::Disconnected)
  }
}

/// The response half of a transaction after [`Transaction::into_parts`].
#[derive(Debug)]
pub struct Responder {
  tx: oneshot::Sender<Response>,
}

impl Responder {
  /// # Errors
  /// Returns `PipelineError::Disconnected` if the originator dropped its receiver.
  pub fn respond(self, response: Response) -> Result<(), PipelineError> {
    self.tx.send(response).map_err(|_| PipelineError::Disconnected)
  }
}

/// Held by the originator of a transaction to await its response.
#[derive(Debug)]
pub struct ResponseReceiver {
  rx: oneshot::Receiver<Response>,
}

impl ResponseReceiver {
  /// Awaits the response for the transaction this receiver was created with.
  ///
  /// # Errors
  /// Returns `PipelineError::Disconnected` if the transaction was dropped
  /// without a response, for example when it was lost during shutdown.
  pub async fn recv(self) -> Result<Response, PipelineError> {
    match self.rx.await {
      Ok(response) => Ok(response),
      Err(_) => {
        tracing::debug!("Transaction dropped before a response was sent.");
        Err(PipelineError::Disconnected)
      }
    }
  }
}
