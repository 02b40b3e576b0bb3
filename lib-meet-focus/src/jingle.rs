use std::{fmt, future::Future, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use thiserror::Error;
use tokio::{task::JoinHandle, time};
use tracing::debug;

use crate::{
  connection::SignalingConnection,
  messages::{ContentInfo, SignalingMessage, TerminateReason, TransportDescription},
  source::ConferenceSourceMap,
  util::generate_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JingleState {
  Created,
  OfferSent,
  Established,
  Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JingleError {
  #[error("{event} not valid in state {state:?}")]
  InvalidState {
    state: JingleState,
    event: &'static str,
  },
  #[error("duplicate session-accept")]
  DuplicateAccept,
}

/// The negotiation session between the focus and one peer.
///
/// `Created → OfferSent → Established → Terminated`; `Terminated` is
/// terminal. A session sitting in `OfferSent` longer than the expiration
/// timeout fires the expiry callback; establishment cancels the timer.
/// Messages are transmitted in submission order through the substrate.
pub struct JingleSession {
  sid: String,
  peer: String,
  state: JingleState,
  connection: Arc<dyn SignalingConnection>,
  expiration: Option<JoinHandle<()>>,
}

impl fmt::Debug for JingleSession {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JingleSession")
      .field("sid", &self.sid)
      .field("peer", &self.peer)
      .field("state", &self.state)
      .finish()
  }
}

impl JingleSession {
  pub fn new(peer: impl Into<String>, connection: Arc<dyn SignalingConnection>) -> Self {
    Self {
      sid: generate_id(),
      peer: peer.into(),
      state: JingleState::Created,
      connection,
      expiration: None,
    }
  }

  pub fn sid(&self) -> &str {
    &self.sid
  }

  pub fn peer(&self) -> &str {
    &self.peer
  }

  pub fn state(&self) -> JingleState {
    self.state
  }

  pub fn is_established(&self) -> bool {
    self.state == JingleState::Established
  }

  /// Transmits session-initiate and arms the expiration timer.
  pub async fn send_initiate<F>(
    &mut self,
    contents: Vec<ContentInfo>,
    sources: ConferenceSourceMap,
    transport: TransportDescription,
    expiration_timeout: Duration,
    on_expired: F,
  ) -> Result<()>
  where
    F: Future<Output = ()> + Send + 'static,
  {
    if self.state != JingleState::Created {
      bail!(JingleError::InvalidState {
        state: self.state,
        event: "session-initiate",
      });
    }
    self
      .connection
      .send(
        &self.peer,
        SignalingMessage::SessionInitiate {
          sid: self.sid.clone(),
          contents,
          sources,
          transport,
        },
      )
      .await?;
    self.state = JingleState::OfferSent;
    debug!(sid = %self.sid, peer = %self.peer, "sent session-initiate");
    self.expiration = Some(tokio::spawn(async move {
      time::sleep(expiration_timeout).await;
      on_expired.await;
    }));
    Ok(())
  }

  /// Registers the peer's session-accept. A second accept is rejected.
  pub fn handle_accept(&mut self) -> Result<(), JingleError> {
    match self.state {
      JingleState::OfferSent => {
        self.cancel_expiration();
        self.state = JingleState::Established;
        debug!(sid = %self.sid, peer = %self.peer, "session established");
        Ok(())
      },
      JingleState::Established => Err(JingleError::DuplicateAccept),
      state => Err(JingleError::InvalidState {
        state,
        event: "session-accept",
      }),
    }
  }

  /// Validity check for inbound mid-session messages.
  pub fn ensure_established(&self, event: &'static str) -> Result<(), JingleError> {
    if self.state == JingleState::Established {
      Ok(())
    }
    else {
      Err(JingleError::InvalidState {
        state: self.state,
        event,
      })
    }
  }

  pub async fn send_add(&self, sources: ConferenceSourceMap) -> Result<()> {
    self.ensure_established("source-add")?;
    self
      .connection
      .send(
        &self.peer,
        SignalingMessage::SourceAdd {
          sid: self.sid.clone(),
          sources,
        },
      )
      .await
  }

  pub async fn send_remove(&self, sources: ConferenceSourceMap) -> Result<()> {
    self.ensure_established("source-remove")?;
    self
      .connection
      .send(
        &self.peer,
        SignalingMessage::SourceRemove {
          sid: self.sid.clone(),
          sources,
        },
      )
      .await
  }

  /// Moves to `Terminated` from any state, telling the peer when an offer
  /// had been sent.
  pub async fn terminate(&mut self, reason: TerminateReason) -> Result<()> {
    if self.state == JingleState::Terminated {
      return Ok(());
    }
    self.cancel_expiration();
    let announced = matches!(self.state, JingleState::OfferSent | JingleState::Established);
    self.state = JingleState::Terminated;
    debug!(sid = %self.sid, peer = %self.peer, ?reason, "session terminated");
    if announced {
      self
        .connection
        .send(
          &self.peer,
          SignalingMessage::SessionTerminate {
            sid: self.sid.clone(),
            reason,
          },
        )
        .await?;
    }
    Ok(())
  }

  /// Marks the session terminated without notifying the peer; used when the
  /// peer itself terminated.
  pub fn mark_terminated(&mut self) {
    self.cancel_expiration();
    self.state = JingleState::Terminated;
  }

  fn cancel_expiration(&mut self) {
    if let Some(task) = self.expiration.take() {
      task.abort();
    }
  }
}

impl Drop for JingleSession {
  fn drop(&mut self) {
    self.cancel_expiration();
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex as StdMutex;

  use async_trait::async_trait;
  use tokio::sync::mpsc;

  use super::*;
  use crate::connection::{InboundMessage, RequestError};

  struct RecordingConnection {
    sent: StdMutex<Vec<(String, SignalingMessage)>>,
  }

  impl RecordingConnection {
    fn new() -> Arc<Self> {
      Arc::new(Self {
        sent: StdMutex::new(vec![]),
      })
    }

    fn sent_kinds(&self) -> Vec<&'static str> {
      self
        .sent
        .lock()
        .unwrap()
        .iter()
        .map(|(_, message)| message.kind())
        .collect()
    }
  }

  #[async_trait]
  impl SignalingConnection for RecordingConnection {
    fn local_jid(&self) -> &str {
      "focus@auth.example.com/focus"
    }

    async fn send(&self, to: &str, message: SignalingMessage) -> Result<()> {
      self.sent.lock().unwrap().push((to.to_owned(), message));
      Ok(())
    }

    async fn request(
      &self,
      _to: &str,
      _message: SignalingMessage,
      _timeout: Duration,
    ) -> Result<SignalingMessage, RequestError> {
      Err(RequestError::Unreachable)
    }

    async fn subscribe(&self) -> mpsc::Receiver<InboundMessage> {
      mpsc::channel(1).1
    }
  }

  fn offer() -> (Vec<ContentInfo>, ConferenceSourceMap, TransportDescription) {
    (vec![], ConferenceSourceMap::new(), TransportDescription::default())
  }

  #[tokio::test(start_paused = true)]
  async fn full_lifecycle() {
    let connection = RecordingConnection::new();
    let mut session = JingleSession::new("room@muc.example.com/a", connection.clone());
    assert_eq!(session.state(), JingleState::Created);

    let (contents, sources, transport) = offer();
    session
      .send_initiate(contents, sources, transport, Duration::from_secs(30), async {})
      .await
      .unwrap();
    assert_eq!(session.state(), JingleState::OfferSent);

    session.handle_accept().unwrap();
    assert!(session.is_established());

    session.send_add(ConferenceSourceMap::new()).await.unwrap();
    session.terminate(TerminateReason::Success).await.unwrap();
    assert_eq!(session.state(), JingleState::Terminated);

    assert_eq!(
      connection.sent_kinds(),
      vec!["session-initiate", "source-add", "session-terminate"]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn duplicate_accept_is_rejected() {
    let connection = RecordingConnection::new();
    let mut session = JingleSession::new("room@muc.example.com/a", connection);
    let (contents, sources, transport) = offer();
    session
      .send_initiate(contents, sources, transport, Duration::from_secs(30), async {})
      .await
      .unwrap();
    session.handle_accept().unwrap();
    assert_eq!(session.handle_accept(), Err(JingleError::DuplicateAccept));
  }

  #[tokio::test(start_paused = true)]
  async fn accept_before_offer_is_invalid() {
    let connection = RecordingConnection::new();
    let mut session = JingleSession::new("room@muc.example.com/a", connection);
    assert!(matches!(
      session.handle_accept(),
      Err(JingleError::InvalidState { .. })
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn source_add_requires_establishment() {
    let connection = RecordingConnection::new();
    let session = JingleSession::new("room@muc.example.com/a", connection);
    assert!(session.send_add(ConferenceSourceMap::new()).await.is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn expiration_fires_when_accept_never_arrives() {
    let connection = RecordingConnection::new();
    let mut session = JingleSession::new("room@muc.example.com/a", connection);
    let (fired_tx, fired_rx) = tokio::sync::oneshot::channel();
    let (contents, sources, transport) = offer();
    session
      .send_initiate(contents, sources, transport, Duration::from_secs(30), async move {
        let _ = fired_tx.send(());
      })
      .await
      .unwrap();
    time::advance(Duration::from_secs(31)).await;
    fired_rx.await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn establishment_cancels_the_expiration_timer() {
    let connection = RecordingConnection::new();
    let mut session = JingleSession::new("room@muc.example.com/a", connection);
    let (fired_tx, mut fired_rx) = tokio::sync::oneshot::channel::<()>();
    let (contents, sources, transport) = offer();
    session
      .send_initiate(contents, sources, transport, Duration::from_secs(30), async move {
        let _ = fired_tx.send(());
      })
      .await
      .unwrap();
    session.handle_accept().unwrap();
    time::advance(Duration::from_secs(60)).await;
    assert!(fired_rx.try_recv().is_err());
  }

  #[tokio::test(start_paused = true)]
  async fn terminate_before_offer_stays_silent() {
    let connection = RecordingConnection::new();
    let mut session = JingleSession::new("room@muc.example.com/a", connection.clone());
    session.terminate(TerminateReason::Gone).await.unwrap();
    assert!(connection.sent_kinds().is_empty());
  }
}
