use std::{collections::HashMap, fmt, sync::Arc};

use anyhow::Result;
use futures::stream::StreamExt;
use jid::FullJid;
use tokio::{
  sync::{mpsc, Mutex, Semaphore},
  time::Instant,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::{
  bridge::{select_bridge, BridgeRegistry, SelectionInput},
  colibri::ColibriSessionManager,
  config::FocusConfig,
  connection::SignalingConnection,
  error::ConferenceError,
  jingle::{JingleError, JingleSession, JingleState},
  messages::{SignalingMessage, TerminateReason, TransportDescription},
  muc::{ChatRoom, ChatRoomEvent, ChatRoomMember, MemberRole},
  participant::{InviteState, Participant},
  signaling::UpdateAction,
  source::{ConferenceSourceMap, EndpointSourceSet, MediaType},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConferenceState {
  Starting,
  Running,
  Ending,
}

/// The signaling controller for one room: reacts to membership changes,
/// drives participants through invitation, owns the validated source map,
/// and fans source changes out to everyone else.
#[derive(Clone)]
pub struct Conference {
  room: String,
  connection: Arc<dyn SignalingConnection>,
  chat_room: Arc<dyn ChatRoom>,
  config: Arc<FocusConfig>,
  registry: Arc<Mutex<BridgeRegistry>>,
  colibri: Arc<ColibriSessionManager>,
  invite_workers: Arc<Semaphore>,
  inner: Arc<Mutex<ConferenceInner>>,
  ended_tx: mpsc::Sender<String>,
}

struct ConferenceInner {
  state: ConferenceState,
  participants: HashMap<String, Participant>,
  sources: crate::validation::ValidatingSourceMap,
  /// Participant count per bridge carrying this conference.
  bridges: HashMap<String, usize>,
  /// Version locked in by the first selected bridge.
  version_constraint: Option<String>,
  /// Version requested by an operator pin; takes precedence.
  pinned_version: Option<String>,
  created_at: Instant,
}

impl fmt::Debug for Conference {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Conference").field("room", &self.room).finish()
  }
}

impl Conference {
  /// Joins the room and starts reacting to its membership.
  #[tracing::instrument(level = "info", skip_all, fields(room = %room), err)]
  pub async fn start(
    room: String,
    connection: Arc<dyn SignalingConnection>,
    chat_room: Arc<dyn ChatRoom>,
    config: Arc<FocusConfig>,
    registry: Arc<Mutex<BridgeRegistry>>,
    ended_tx: mpsc::Sender<String>,
  ) -> Result<Self> {
    let events = chat_room.join().await?;
    let colibri = Arc::new(ColibriSessionManager::new(
      connection.clone(),
      room.clone(),
      config.bridge.allocate_timeout,
    ));
    let conference = Self {
      room,
      connection,
      chat_room: chat_room.clone(),
      invite_workers: Arc::new(Semaphore::new(config.conference.invite_workers)),
      colibri,
      registry,
      inner: Arc::new(Mutex::new(ConferenceInner {
        state: ConferenceState::Starting,
        participants: HashMap::new(),
        sources: crate::validation::ValidatingSourceMap::new(config.source_limits()),
        bridges: HashMap::new(),
        version_constraint: None,
        pinned_version: None,
        created_at: Instant::now(),
      })),
      config,
      ended_tx,
    };

    if let Err(e) = chat_room.publish_presence_extension("ready", "true").await {
      warn!("failed to publish focus presence: {:?}", e);
    }

    tokio::spawn(conference.clone().run(events));
    conference.schedule_end_check();
    Ok(conference)
  }

  pub fn room(&self) -> &str {
    &self.room
  }

  pub async fn participant_count(&self) -> usize {
    self.inner.lock().await.participants.len()
  }

  /// Immutable snapshot of everything currently advertised in the room.
  pub async fn sources(&self) -> ConferenceSourceMap {
    self.inner.lock().await.sources.snapshot().clone()
  }

  pub async fn is_ended(&self) -> bool {
    self.inner.lock().await.state == ConferenceState::Ending
  }

  pub async fn has_colibri_allocation(&self, endpoint_id: &str) -> bool {
    self.colibri.has_allocation(endpoint_id).await
  }

  pub async fn colibri_allocation_count(&self) -> usize {
    self.colibri.allocation_count().await
  }

  /// Pin (or unpin) the bridge version this conference may use.
  pub async fn set_pinned_version(&self, version: Option<String>) {
    self.inner.lock().await.pinned_version = version;
  }

  async fn run(self, events: mpsc::Receiver<ChatRoomEvent>) {
    let mut events = ReceiverStream::new(events);
    while let Some(event) = events.next().await {
      match event {
        ChatRoomEvent::MemberJoined(member) => self.on_member_joined(member).await,
        ChatRoomEvent::MemberLeft { endpoint_id } => {
          info!(endpoint = %endpoint_id, "member left");
          self.remove_participant(&endpoint_id, None).await;
        },
        ChatRoomEvent::MemberRoleChanged { endpoint_id, role } => {
          self.on_member_role_changed(&endpoint_id, role).await;
        },
        ChatRoomEvent::PresenceUpdated(member) => {
          let mut inner = self.inner.lock().await;
          if let Some(participant) = inner.participants.get_mut(&member.endpoint_id) {
            participant.member = member;
          }
        },
        ChatRoomEvent::RoomDestroyed => {
          info!("room destroyed");
          self.end().await;
          return;
        },
      }
    }
    debug!("membership event stream closed");
  }

  async fn on_member_joined(&self, member: ChatRoomMember) {
    let endpoint_id = member.endpoint_id.clone();
    {
      let mut inner = self.inner.lock().await;
      if inner.state == ConferenceState::Ending {
        warn!(endpoint = %endpoint_id, "ignoring join, conference ended");
        return;
      }
      if inner.participants.contains_key(&endpoint_id) {
        return;
      }
      if inner.state == ConferenceState::Starting {
        inner.state = ConferenceState::Running;
      }
      info!(endpoint = %endpoint_id, "member joined");
      inner
        .participants
        .insert(endpoint_id.clone(), Participant::new(member));
    }
    tokio::spawn(self.clone().run_invite(endpoint_id));
  }

  async fn on_member_role_changed(&self, endpoint_id: &str, role: MemberRole) {
    let mut inner = self.inner.lock().await;
    if let Some(participant) = inner.participants.get_mut(endpoint_id) {
      debug!(endpoint = %endpoint_id, ?role, "member role changed");
      participant.member.role = role;
    }
  }

  /// The invite task: bridge selection, slot allocation, offer.
  async fn run_invite(self, endpoint_id: String) {
    let _permit = match self.invite_workers.clone().acquire_owned().await {
      Ok(permit) => permit,
      Err(_) => return,
    };

    let cancelled = {
      let inner = self.inner.lock().await;
      match inner.participants.get(&endpoint_id) {
        Some(participant) => participant.cancelled.clone(),
        None => return,
      }
    };

    // Bridge selection: failing and lost bridges are excluded up front,
    // then the selector works on a consistent picture of this conference.
    let selected = {
      let mut registry = self.registry.lock().await;
      registry.prune();
      let inner = self.inner.lock().await;
      let participant = match inner.participants.get(&endpoint_id) {
        Some(participant) => participant,
        None => return,
      };
      let version_constraint = inner
        .pinned_version
        .as_deref()
        .or(inner.version_constraint.as_deref());
      let candidates = registry.operational();
      select_bridge(
        &candidates,
        SelectionInput {
          conference_bridges: &inner.bridges,
          participant_region: participant.region(),
          version_constraint,
          required_features: None,
          high_stress_threshold: registry.high_stress_threshold(),
        },
      )
      .map(|bridge| (bridge.jid.clone(), bridge.version.clone()))
    };

    let (bridge_jid, bridge_version) = match selected {
      Some(selected) => selected,
      None => {
        error!(endpoint = %endpoint_id, "no bridge available");
        self.reject_participant(&endpoint_id, "no bridge available").await;
        return;
      },
    };

    // Reserve the spot on the bridge and build the offer.
    let (contents, initial_sources) = {
      let mut inner = self.inner.lock().await;
      let snapshot = inner.sources.snapshot().without(&endpoint_id);
      let participant = match inner.participants.get_mut(&endpoint_id) {
        Some(participant) => participant,
        None => return,
      };
      participant.invite_state = InviteState::Inviting;
      participant.bridge = Some(bridge_jid.clone());
      let contents = self
        .config
        .offer_contents(participant.supports_video(), participant.supports_data());
      *inner.bridges.entry(bridge_jid.clone()).or_insert(0) += 1;
      if inner.version_constraint.is_none() {
        inner.version_constraint = bridge_version;
      }
      (contents, snapshot)
    };

    let allocation = match self
      .colibri
      .allocate(&bridge_jid, &endpoint_id, contents.clone(), initial_sources)
      .await
    {
      Ok(allocation) => allocation,
      Err(e) => {
        warn!(endpoint = %endpoint_id, bridge = %bridge_jid, error = %e, "bridge allocation failed");
        self.registry.lock().await.mark_failing(&bridge_jid);
        self.reject_participant(&endpoint_id, "bridge allocation failed").await;
        return;
      },
    };

    if cancelled.load(std::sync::atomic::Ordering::SeqCst) {
      // The participant left while we were talking to the bridge; unwind.
      debug!(endpoint = %endpoint_id, "invite cancelled, expiring allocation");
      self.colibri.expire(&endpoint_id).await;
      return;
    }

    // Offer: the conference as this participant will see it.
    let send_result = {
      let mut inner = self.inner.lock().await;
      let snapshot = inner.sources.snapshot().without(&endpoint_id);
      let participant = match inner.participants.get_mut(&endpoint_id) {
        Some(participant) => participant,
        None => {
          drop(inner);
          self.colibri.expire(&endpoint_id).await;
          return;
        },
      };
      let offer_sources = participant.signaling.reset(snapshot);
      let mut session = JingleSession::new(participant.occupant_jid(), self.connection.clone());
      let expired = {
        let conference = self.clone();
        let endpoint_id = endpoint_id.clone();
        async move {
          conference.on_session_expired(&endpoint_id).await;
        }
      };
      let result = session
        .send_initiate(
          contents,
          offer_sources,
          allocation.transport.clone(),
          self.config.jingle.session_timeout,
          expired,
        )
        .await;
      participant.jingle = Some(session);
      result
    };

    if let Err(e) = send_result {
      warn!(endpoint = %endpoint_id, "failed to send session-initiate: {:?}", e);
      self.remove_participant(&endpoint_id, None).await;
    }
  }

  /// Rejection before a session existed: tell the member and forget it.
  async fn reject_participant(&self, endpoint_id: &str, condition: &str) {
    let occupant = {
      let inner = self.inner.lock().await;
      inner
        .participants
        .get(endpoint_id)
        .map(|participant| participant.occupant_jid().to_owned())
    };
    if let Some(occupant) = occupant {
      let _ = self
        .connection
        .send(
          &occupant,
          SignalingMessage::Error {
            condition: condition.to_owned(),
          },
        )
        .await;
    }
    self.remove_participant(endpoint_id, None).await;
  }

  async fn on_session_expired(&self, endpoint_id: &str) {
    let stale = {
      let inner = self.inner.lock().await;
      inner
        .participants
        .get(endpoint_id)
        .and_then(|participant| participant.jingle.as_ref())
        .map(|session| session.state() == JingleState::OfferSent)
        .unwrap_or(false)
    };
    if stale {
      warn!(endpoint = %endpoint_id, "session-accept never arrived, removing participant");
      self.remove_participant(endpoint_id, Some(TerminateReason::Timeout)).await;
    }
  }

  /// Removes a participant, unwinds its resources, and tells everyone else
  /// its sources are gone. `notify` carries the terminate reason to send to
  /// the peer, or `None` when the peer is already gone.
  async fn remove_participant(&self, endpoint_id: &str, notify: Option<TerminateReason>) {
    let now_empty = {
      let mut inner = self.inner.lock().await;
      let mut participant = match inner.participants.remove(endpoint_id) {
        Some(participant) => participant,
        None => return,
      };
      participant.cancel();
      participant.invite_state = InviteState::Terminating;

      if let Some(bridge) = participant.bridge.take() {
        if let Some(count) = inner.bridges.get_mut(&bridge) {
          *count = count.saturating_sub(1);
          if *count == 0 {
            inner.bridges.remove(&bridge);
          }
        }
      }

      if let Some(removed) = inner.sources.remove_endpoint(endpoint_id) {
        let delta = ConferenceSourceMap::from_endpoint(endpoint_id, removed);
        if !delta.is_empty() {
          self.fan_out(&mut inner, None, None, Some(&delta)).await;
        }
      }

      match notify {
        Some(reason) => {
          if let Some(mut session) = participant.jingle.take() {
            if let Err(e) = session.terminate(reason).await {
              debug!("failed to send session-terminate: {:?}", e);
            }
          }
        },
        None => {
          if let Some(session) = participant.jingle.as_mut() {
            session.mark_terminated();
          }
        },
      }

      inner.state == ConferenceState::Running && inner.participants.is_empty()
    };

    self.colibri.expire(endpoint_id).await;

    if now_empty {
      self.end_when_past_grace().await;
    }
  }

  /// Ends immediately when past the initial grace window, otherwise checks
  /// again at the deadline.
  async fn end_when_past_grace(&self) {
    let deadline = {
      let inner = self.inner.lock().await;
      if inner.state != ConferenceState::Running || !inner.participants.is_empty() {
        return;
      }
      inner.created_at + self.config.conference.single_participant_timeout
    };
    if Instant::now() >= deadline {
      self.end().await;
    }
    else {
      self.schedule_end_check();
    }
  }

  fn schedule_end_check(&self) {
    let conference = self.clone();
    tokio::spawn(async move {
      let deadline = {
        let inner = conference.inner.lock().await;
        inner.created_at + conference.config.conference.single_participant_timeout
      };
      tokio::time::sleep_until(deadline).await;
      let empty = {
        let inner = conference.inner.lock().await;
        inner.state != ConferenceState::Ending && inner.participants.is_empty()
      };
      if empty {
        conference.end().await;
      }
    });
  }

  /// Releases everything and notifies the owner. Idempotent.
  pub async fn end(&self) {
    let participants = {
      let mut inner = self.inner.lock().await;
      if inner.state == ConferenceState::Ending {
        return;
      }
      inner.state = ConferenceState::Ending;
      inner.bridges.clear();
      inner.participants.drain().collect::<Vec<_>>()
    };
    info!(room = %self.room, "conference ended");
    for (_, mut participant) in participants {
      participant.cancel();
      if let Some(mut session) = participant.jingle.take() {
        let _ = session.terminate(TerminateReason::Gone).await;
      }
    }
    self.colibri.expire_conference().await;
    if let Err(e) = self.chat_room.leave().await {
      debug!("failed to leave room: {:?}", e);
    }
    let _ = self.ended_tx.send(self.room.clone()).await;
  }

  /// Routes an inbound peer message. The error string becomes the error
  /// condition reported back to the sender.
  pub async fn handle_message(&self, from: &str, message: SignalingMessage) -> Result<(), String> {
    let endpoint_id = occupant_resource(from).ok_or("invalid sender address")?;
    if self.is_ended().await {
      return Err(ConferenceError::ConferenceEnded.to_string());
    }
    match message {
      SignalingMessage::SessionAccept {
        sid,
        sources,
        transport,
      } => {
        self
          .handle_session_accept(&endpoint_id, &sid, sources, transport)
          .await
      },
      SignalingMessage::SourceAdd { sid, sources } => {
        self.handle_source_add(&endpoint_id, &sid, sources).await
      },
      SignalingMessage::SourceRemove { sid, sources } => {
        self.handle_source_remove(&endpoint_id, &sid, sources).await
      },
      SignalingMessage::TransportInfo { sid, transport } => {
        self.handle_transport_info(&endpoint_id, &sid, transport).await
      },
      SignalingMessage::SessionTerminate { sid, .. } => {
        self.handle_peer_terminate(&endpoint_id, &sid).await
      },
      other => Err(format!("unexpected message: {}", other.kind())),
    }
  }

  async fn handle_session_accept(
    &self,
    endpoint_id: &str,
    sid: &str,
    sources: ConferenceSourceMap,
    transport: TransportDescription,
  ) -> Result<(), String> {
    let (accepted, deferred) = {
      let mut inner = self.inner.lock().await;
      let participant = inner
        .participants
        .get_mut(endpoint_id)
        .ok_or("unknown participant")?;
      let session = participant.jingle.as_mut().ok_or("no session")?;
      if session.sid() != sid {
        return Err("unknown session".to_owned());
      }
      match session.handle_accept() {
        Ok(()) => {},
        Err(JingleError::DuplicateAccept) => {
          return Err(JingleError::DuplicateAccept.to_string());
        },
        Err(e) => return Err(e.to_string()),
      }
      participant.invite_state = InviteState::Established;
      let deferred = std::mem::take(&mut participant.deferred_sources);

      let set = flatten(sources);
      let accepted = if set.is_empty() {
        EndpointSourceSet::default()
      }
      else {
        self
          .ingest(&mut inner, endpoint_id, set)
          .map_err(|e| e.to_string())?
      };

      if !accepted.is_empty() {
        let delta = ConferenceSourceMap::from_endpoint(endpoint_id, accepted.clone());
        self.fan_out(&mut inner, Some(endpoint_id), Some(&delta), None).await;
      }

      // Everything signaled to the room while this invite was in flight.
      self.flush_participant(&mut inner, endpoint_id).await;

      (accepted, deferred)
    };

    self.colibri.update_transport(endpoint_id, transport).await.ok();
    if !accepted.is_empty() {
      let delta = ConferenceSourceMap::from_endpoint(endpoint_id, accepted);
      if let Err(e) = self.colibri.update_sources(endpoint_id, delta, ConferenceSourceMap::new()).await {
        warn!(endpoint = %endpoint_id, error = %e, "failed to push accepted sources to the bridge");
      }
    }

    // Sources the peer signaled before its accept landed.
    if !deferred.is_empty() {
      let set = flatten(deferred);
      if let Err(e) = self.add_established_sources(endpoint_id, set).await {
        warn!(endpoint = %endpoint_id, "deferred source-add rejected: {}", e);
      }
    }
    Ok(())
  }

  async fn handle_source_add(
    &self,
    endpoint_id: &str,
    sid: &str,
    sources: ConferenceSourceMap,
  ) -> Result<(), String> {
    let state = {
      let mut inner = self.inner.lock().await;
      let participant = inner
        .participants
        .get_mut(endpoint_id)
        .ok_or("unknown participant")?;
      let session = participant.jingle.as_ref().ok_or("no session")?;
      if session.sid() != sid {
        return Err("unknown session".to_owned());
      }
      let state = session.state();
      if state == JingleState::OfferSent {
        // Deferred until the session is established.
        debug!(endpoint = %endpoint_id, "deferring source-add until session-accept");
        participant.deferred_sources += sources.clone();
        return Ok(());
      }
      state
    };
    if state != JingleState::Established {
      return Err(
        JingleError::InvalidState {
          state,
          event: "source-add",
        }
        .to_string(),
      );
    }
    self.add_established_sources(endpoint_id, flatten(sources)).await
  }

  async fn add_established_sources(
    &self,
    endpoint_id: &str,
    set: EndpointSourceSet,
  ) -> Result<(), String> {
    if set.is_empty() {
      return Ok(());
    }
    let accepted = {
      let mut inner = self.inner.lock().await;
      if !inner.participants.contains_key(endpoint_id) {
        return Err("unknown participant".to_owned());
      }
      let accepted = self
        .ingest(&mut inner, endpoint_id, set)
        .map_err(|e| e.to_string())?;
      if !accepted.is_empty() {
        let delta = ConferenceSourceMap::from_endpoint(endpoint_id, accepted.clone());
        self.fan_out(&mut inner, Some(endpoint_id), Some(&delta), None).await;
      }
      accepted
    };
    if !accepted.is_empty() {
      let delta = ConferenceSourceMap::from_endpoint(endpoint_id, accepted);
      if let Err(e) = self
        .colibri
        .update_sources(endpoint_id, delta, ConferenceSourceMap::new())
        .await
      {
        warn!(endpoint = %endpoint_id, error = %e, "failed to push source-add to the bridge");
      }
    }
    Ok(())
  }

  async fn handle_source_remove(
    &self,
    endpoint_id: &str,
    sid: &str,
    sources: ConferenceSourceMap,
  ) -> Result<(), String> {
    let removed = {
      let mut inner = self.inner.lock().await;
      let participant = inner
        .participants
        .get_mut(endpoint_id)
        .ok_or("unknown participant")?;
      let session = participant.jingle.as_ref().ok_or("no session")?;
      if session.sid() != sid {
        return Err("unknown session".to_owned());
      }
      session
        .ensure_established("source-remove")
        .map_err(|e| e.to_string())?;
      let set = flatten(sources);
      let removed = inner
        .sources
        .try_remove(endpoint_id, &set)
        .map_err(|e| e.to_string())?;
      if !removed.is_empty() {
        let delta = ConferenceSourceMap::from_endpoint(endpoint_id, removed.clone());
        self.fan_out(&mut inner, Some(endpoint_id), None, Some(&delta)).await;
      }
      removed
    };
    if !removed.is_empty() {
      let delta = ConferenceSourceMap::from_endpoint(endpoint_id, removed);
      if let Err(e) = self
        .colibri
        .update_sources(endpoint_id, ConferenceSourceMap::new(), delta)
        .await
      {
        warn!(endpoint = %endpoint_id, error = %e, "failed to push source-remove to the bridge");
      }
    }
    Ok(())
  }

  async fn handle_transport_info(
    &self,
    endpoint_id: &str,
    sid: &str,
    transport: TransportDescription,
  ) -> Result<(), String> {
    {
      let inner = self.inner.lock().await;
      let participant = inner
        .participants
        .get(endpoint_id)
        .ok_or("unknown participant")?;
      let session = participant.jingle.as_ref().ok_or("no session")?;
      if session.sid() != sid {
        return Err("unknown session".to_owned());
      }
      session
        .ensure_established("transport-info")
        .map_err(|e| e.to_string())?;
    }
    self
      .colibri
      .update_transport(endpoint_id, transport)
      .await
      .map_err(|e| e.to_string())
  }

  async fn handle_peer_terminate(&self, endpoint_id: &str, sid: &str) -> Result<(), String> {
    {
      let inner = self.inner.lock().await;
      let participant = inner
        .participants
        .get(endpoint_id)
        .ok_or("unknown participant")?;
      let session = participant.jingle.as_ref().ok_or("no session")?;
      if session.sid() != sid {
        return Err("unknown session".to_owned());
      }
    }
    info!(endpoint = %endpoint_id, "peer terminated its session");
    self.remove_participant(endpoint_id, None).await;
    Ok(())
  }

  /// Sender-limit gate plus validator ingest. The limit is checked before
  /// the validator sees anything.
  fn ingest(
    &self,
    inner: &mut ConferenceInner,
    endpoint_id: &str,
    set: EndpointSourceSet,
  ) -> Result<EndpointSourceSet, ConferenceError> {
    for media_type in [MediaType::Audio, MediaType::Video] {
      if !set.has_media_type(media_type) {
        continue;
      }
      let already_sending = inner
        .sources
        .snapshot()
        .get(endpoint_id)
        .map(|held| held.has_media_type(media_type))
        .unwrap_or(false);
      if already_sending {
        continue;
      }
      let senders = inner
        .sources
        .snapshot()
        .iter()
        .filter(|(_, held)| held.has_media_type(media_type))
        .count();
      let limit = match media_type {
        MediaType::Audio => self.config.conference.max_audio_senders,
        MediaType::Video => self.config.conference.max_video_senders,
        MediaType::Application => continue,
      };
      if senders >= limit {
        return Err(ConferenceError::SenderCountExceeded(media_type));
      }
    }
    Ok(inner.sources.try_add(endpoint_id, set)?)
  }

  /// Queue deltas for every other participant and flush established ones.
  async fn fan_out(
    &self,
    inner: &mut ConferenceInner,
    exclude: Option<&str>,
    added: Option<&ConferenceSourceMap>,
    removed: Option<&ConferenceSourceMap>,
  ) {
    for (endpoint_id, participant) in inner.participants.iter_mut() {
      if Some(endpoint_id.as_str()) == exclude {
        continue;
      }
      if let Some(delta) = added {
        participant.signaling.add_sources(delta.clone());
      }
      if let Some(delta) = removed {
        participant.signaling.remove_sources(delta);
      }
      if participant.invite_state != InviteState::Established {
        continue;
      }
      let updates = participant.signaling.update();
      let session = match participant.jingle.as_ref() {
        Some(session) if session.is_established() => session,
        _ => continue,
      };
      for update in updates {
        let result = match update.action {
          UpdateAction::Add => session.send_add(update.sources).await,
          UpdateAction::Remove => session.send_remove(update.sources).await,
        };
        if let Err(e) = result {
          warn!(endpoint = %endpoint_id, "failed to fan out source update: {:?}", e);
        }
      }
    }
  }

  /// Flush one participant's queue (used right after establishment).
  async fn flush_participant(&self, inner: &mut ConferenceInner, endpoint_id: &str) {
    if let Some(participant) = inner.participants.get_mut(endpoint_id) {
      let updates = participant.signaling.update();
      if let Some(session) = participant.jingle.as_ref() {
        for update in updates {
          let result = match update.action {
            UpdateAction::Add => session.send_add(update.sources).await,
            UpdateAction::Remove => session.send_remove(update.sources).await,
          };
          if let Err(e) = result {
            warn!(endpoint = %endpoint_id, "failed to flush source update: {:?}", e);
          }
        }
      }
    }
  }
}

fn occupant_resource(occupant_jid: &str) -> Option<String> {
  occupant_jid
    .parse::<FullJid>()
    .ok()
    .map(|occupant| occupant.resource)
}

/// Collapse a per-endpoint map a peer sent into one set; a peer only ever
/// signals its own sources.
fn flatten(map: ConferenceSourceMap) -> EndpointSourceSet {
  let mut set = EndpointSourceSet::default();
  for (_, endpoint_set) in map.iter() {
    set += endpoint_set.clone();
  }
  set
}
