use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use jid::{BareJid, FullJid};
use tokio::{
  sync::{mpsc, Mutex},
  time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
  bridge::BridgeRegistry,
  conference::Conference,
  config::FocusConfig,
  connection::{InboundMessage, SignalingConnection},
  error::ConferenceError,
  messages::{ConferenceRequest, SignalingMessage},
  muc::ChatRoomProvider,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
  pub healthy: bool,
  pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusStatistics {
  pub conferences: usize,
  pub participants: usize,
  pub bridges: usize,
  pub graceful_shutdown: bool,
}

struct VersionPin {
  version: String,
  until: Instant,
}

struct FocusInner {
  conferences: HashMap<String, Conference>,
  pins: HashMap<String, VersionPin>,
  graceful_shutdown: bool,
  ended_rx: Option<mpsc::Receiver<String>>,
}

/// The focus itself: owns every conference, the bridge registry, and the
/// inbound message dispatch.
#[derive(Clone)]
pub struct FocusManager {
  connection: Arc<dyn SignalingConnection>,
  rooms: Arc<dyn ChatRoomProvider>,
  config: Arc<FocusConfig>,
  registry: Arc<Mutex<BridgeRegistry>>,
  inner: Arc<Mutex<FocusInner>>,
  ended_tx: mpsc::Sender<String>,
}

impl FocusManager {
  pub fn new(
    connection: Arc<dyn SignalingConnection>,
    rooms: Arc<dyn ChatRoomProvider>,
    config: Arc<FocusConfig>,
  ) -> Self {
    let (ended_tx, ended_rx) = mpsc::channel(16);
    let registry = Arc::new(Mutex::new(BridgeRegistry::new(config.bridge.clone())));
    Self {
      connection,
      rooms,
      config,
      registry,
      inner: Arc::new(Mutex::new(FocusInner {
        conferences: HashMap::new(),
        pins: HashMap::new(),
        graceful_shutdown: false,
        ended_rx: Some(ended_rx),
      })),
      ended_tx,
    }
  }

  /// Consume the inbound message stream until the substrate closes it.
  pub async fn run(&self) -> Result<()> {
    let mut inbound = self.connection.subscribe().await;
    let mut ended_rx = self
      .inner
      .lock()
      .await
      .ended_rx
      .take()
      .ok_or_else(|| anyhow::anyhow!("focus manager already running"))?;
    info!(jid = %self.connection.local_jid(), "focus running");
    loop {
      tokio::select! {
        message = inbound.recv() => match message {
          Some(message) => self.dispatch(message).await,
          None => break,
        },
        Some(room) = ended_rx.recv() => {
          debug!(room = %room, "dropping ended conference");
          self.inner.lock().await.conferences.remove(&room);
        },
      }
    }
    info!("inbound message stream closed, focus stopping");
    Ok(())
  }

  async fn dispatch(&self, mut inbound: InboundMessage) {
    let from = inbound.from.clone();
    match inbound.message.clone() {
      SignalingMessage::ConferenceRequest(request) => {
        let response = match self.conference_request(request).await {
          Ok(response) => SignalingMessage::ConferenceRequest(response),
          Err(e) => SignalingMessage::Error {
            condition: e.to_string(),
          },
        };
        inbound.respond(response);
      },
      SignalingMessage::BridgeStatusReport(report) => {
        self.registry.lock().await.handle_report(report);
        inbound.respond(SignalingMessage::Ack);
      },
      message => {
        let room = match bare_jid(&from) {
          Some(room) => room,
          None => {
            warn!(from = %from, "message from an address with no room part");
            return;
          },
        };
        let conference = self.inner.lock().await.conferences.get(&room).cloned();
        let result = match conference {
          Some(conference) => conference.handle_message(&from, message).await,
          None => Err(ConferenceError::ConferenceEnded.to_string()),
        };
        match result {
          Ok(()) => inbound.respond(SignalingMessage::Ack),
          Err(condition) => {
            debug!(from = %from, condition = %condition, "rejecting inbound message");
            inbound.respond(SignalingMessage::Error { condition });
          },
        }
      },
    }
  }

  /// Create-or-join. The response mirrors the request, with `ready` set
  /// once the focus is in the room; unknown properties echo back opaquely.
  pub async fn conference_request(
    &self,
    request: ConferenceRequest,
  ) -> Result<ConferenceRequest, ConferenceError> {
    let room = request.room.clone();
    {
      let inner = self.inner.lock().await;
      if inner.graceful_shutdown && !inner.conferences.contains_key(&room) {
        return Err(ConferenceError::GracefulShutdown);
      }
    }
    if !self.health().await.healthy && !self.inner.lock().await.conferences.contains_key(&room) {
      // Infrastructure failure: running conferences continue, new ones are
      // refused.
      return Err(ConferenceError::NoBridgeAvailable);
    }

    let conference = self.conference(&room).await;
    let conference = match conference {
      Some(conference) => conference,
      None => self.create_conference(&room).await?,
    };
    if conference.is_ended().await {
      return Err(ConferenceError::ConferenceEnded);
    }

    Ok(ConferenceRequest {
      room,
      ready: Some(true),
      session_id: request.session_id,
      identity: None,
      machine_uid: None,
      vnode: request.vnode,
      focus_jid: Some(self.connection.local_jid().to_owned()),
      properties: request.properties,
    })
  }

  async fn create_conference(&self, room: &str) -> Result<Conference, ConferenceError> {
    let chat_room = self
      .rooms
      .room(room)
      .await
      .map_err(|_| ConferenceError::ConferenceEnded)?;
    let conference = Conference::start(
      room.to_owned(),
      self.connection.clone(),
      chat_room,
      self.config.clone(),
      self.registry.clone(),
      self.ended_tx.clone(),
    )
    .await
    .map_err(|e| {
      warn!(room = %room, "failed to start conference: {:?}", e);
      ConferenceError::ConferenceEnded
    })?;

    let mut inner = self.inner.lock().await;
    if let Some(pin) = inner.pins.get(room) {
      if pin.until > Instant::now() {
        conference.set_pinned_version(Some(pin.version.clone())).await;
      }
    }
    inner
      .conferences
      .insert(room.to_owned(), conference.clone());
    info!(room = %room, "conference created");
    Ok(conference)
  }

  pub async fn conference(&self, room: &str) -> Option<Conference> {
    self.inner.lock().await.conferences.get(room).cloned()
  }

  pub async fn conference_count(&self) -> usize {
    self.inner.lock().await.conferences.len()
  }

  /// Unhealthy when the bridge registry has been empty beyond the grace
  /// period; running conferences keep running, new ones are refused.
  pub async fn health(&self) -> HealthStatus {
    let empty_for = {
      let mut registry = self.registry.lock().await;
      registry.prune();
      registry.empty_duration()
    };
    match empty_for {
      Some(duration) if duration >= self.config.health.empty_registry_grace_period => {
        HealthStatus {
          healthy: false,
          message: Some(format!(
            "no bridges for {}s",
            duration.as_secs()
          )),
        }
      },
      _ => HealthStatus {
        healthy: true,
        message: None,
      },
    }
  }

  pub async fn statistics(&self) -> FocusStatistics {
    let (conferences, graceful_shutdown) = {
      let inner = self.inner.lock().await;
      (inner.conferences.values().cloned().collect::<Vec<_>>(), inner.graceful_shutdown)
    };
    let mut participants = 0;
    for conference in &conferences {
      participants += conference.participant_count().await;
    }
    FocusStatistics {
      conferences: conferences.len(),
      participants,
      bridges: self.registry.lock().await.len(),
      graceful_shutdown,
    }
  }

  /// Pin a room to a bridge version for `duration`.
  pub async fn pin_version(&self, room: &str, version: String, duration: Duration) {
    let mut inner = self.inner.lock().await;
    inner.pins.insert(
      room.to_owned(),
      VersionPin {
        version: version.clone(),
        until: Instant::now() + duration,
      },
    );
    if let Some(conference) = inner.conferences.get(room) {
      conference.set_pinned_version(Some(version)).await;
    }
    info!(room = %room, "pinned conference to a bridge version");
  }

  pub async fn unpin_version(&self, room: &str) {
    let mut inner = self.inner.lock().await;
    inner.pins.remove(room);
    if let Some(conference) = inner.conferences.get(room) {
      conference.set_pinned_version(None).await;
    }
  }

  /// While set, new conferences are refused and running ones drain.
  pub async fn set_graceful_shutdown(&self, enabled: bool) {
    self.inner.lock().await.graceful_shutdown = enabled;
    if enabled {
      info!("graceful shutdown enabled, refusing new conferences");
    }
  }

  pub async fn graceful_shutdown(&self) -> bool {
    self.inner.lock().await.graceful_shutdown
  }

  pub fn registry(&self) -> Arc<Mutex<BridgeRegistry>> {
    self.registry.clone()
  }
}

fn bare_jid(jid: &str) -> Option<String> {
  jid
    .parse::<FullJid>()
    .ok()
    .map(|full| BareJid::from(full).to_string())
}
