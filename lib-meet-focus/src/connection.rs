use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::messages::SignalingMessage;

/// Transport failure of a single request. Contained to the operation that
/// was in flight; the conference as a whole survives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
  #[error("request timed out")]
  Timeout,
  #[error("peer unreachable")]
  Unreachable,
  #[error("malformed reply")]
  MalformedReply,
}

/// A typed message arriving over the substrate, with an optional responder
/// for request semantics. Dropping the responder without replying lets the
/// substrate synthesize an error for the requester.
#[derive(Debug)]
pub struct InboundMessage {
  pub from: String,
  pub message: SignalingMessage,
  pub responder: Option<oneshot::Sender<SignalingMessage>>,
}

impl InboundMessage {
  pub fn respond(&mut self, response: SignalingMessage) {
    if let Some(responder) = self.responder.take() {
      let _ = responder.send(response);
    }
  }
}

/// The abstract signaling substrate the focus runs on. Implementations map
/// typed messages onto whatever wire representation they use; the core
/// never sees it.
///
/// Ordering contract: two `send` calls completed in sequence by one caller
/// are delivered to the recipient in that sequence.
#[async_trait]
pub trait SignalingConnection: Send + Sync {
  /// The address peers use to reach this focus.
  fn local_jid(&self) -> &str;

  /// Fire-and-forget delivery.
  async fn send(&self, to: &str, message: SignalingMessage) -> anyhow::Result<()>;

  /// Send a request and await the typed reply.
  async fn request(
    &self,
    to: &str,
    message: SignalingMessage,
    timeout: Duration,
  ) -> Result<SignalingMessage, RequestError>;

  /// The stream of inbound messages addressed to the focus. May be called
  /// once; subsequent calls return a closed channel.
  async fn subscribe(&self) -> mpsc::Receiver<InboundMessage>;
}
