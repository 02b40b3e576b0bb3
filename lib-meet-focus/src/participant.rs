use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use crate::{
  jingle::JingleSession,
  muc::{features, ChatRoomMember},
  signaling::{SignalingOptions, SourceSignaling},
  source::ConferenceSourceMap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteState {
  Idle,
  Inviting,
  Established,
  Terminating,
}

/// One conference member and everything the focus holds for it: the
/// signaling queue towards it, its negotiation session, and the id of the
/// bridge it was placed on. Owned exclusively by its conference.
pub struct Participant {
  pub(crate) member: ChatRoomMember,
  pub(crate) signaling: SourceSignaling,
  pub(crate) invite_state: InviteState,
  pub(crate) jingle: Option<JingleSession>,
  /// Weak reference by id; the registry owns the bridge.
  pub(crate) bridge: Option<String>,
  /// Cooperative cancellation for the invite task.
  pub(crate) cancelled: Arc<AtomicBool>,
  /// Sources the peer signaled before its session-accept arrived; flushed
  /// through the validator on establishment.
  pub(crate) deferred_sources: ConferenceSourceMap,
}

impl Participant {
  pub(crate) fn new(member: ChatRoomMember) -> Self {
    // A member that advertises no capabilities at all is assumed to be a
    // full client.
    let advertises = !member.features.is_empty();
    let options = SignalingOptions {
      audio: !advertises || member.supports(features::AUDIO),
      video: !advertises || member.supports(features::VIDEO),
      strip_simulcast: advertises && !member.supports(features::SIMULCAST),
      supports_multiple_video_streams: !advertises
        || member.supports(features::RECEIVE_MULTIPLE_VIDEO_STREAMS),
    };
    Self {
      member,
      signaling: SourceSignaling::new(options),
      invite_state: InviteState::Idle,
      jingle: None,
      bridge: None,
      cancelled: Arc::new(AtomicBool::new(false)),
      deferred_sources: ConferenceSourceMap::new(),
    }
  }

  pub fn endpoint_id(&self) -> &str {
    &self.member.endpoint_id
  }

  pub fn occupant_jid(&self) -> &str {
    &self.member.occupant_jid
  }

  pub fn region(&self) -> Option<&str> {
    self.member.region.as_deref()
  }

  pub fn invite_state(&self) -> InviteState {
    self.invite_state
  }

  pub(crate) fn supports_video(&self) -> bool {
    self.signaling.options().video
  }

  pub(crate) fn supports_data(&self) -> bool {
    self.member.features.is_empty() || self.member.supports(features::SCTP)
  }

  pub(crate) fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  pub(crate) fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }
}
