use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Capability advertisements looked for in member presence.
pub mod features {
  pub const AUDIO: &str = "urn:xmpp:jingle:apps:rtp:audio";
  pub const VIDEO: &str = "urn:xmpp:jingle:apps:rtp:video";
  pub const SCTP: &str = "http://jitsi.org/protocol/colibri#sctp";
  pub const SIMULCAST: &str = "http://jitsi.org/simulcast";
  pub const RECEIVE_MULTIPLE_VIDEO_STREAMS: &str =
    "http://jitsi.org/receive-multiple-video-streams";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberRole {
  Owner,
  Moderator,
  Participant,
  Visitor,
}

/// A room occupant as seen through presence.
#[derive(Debug, Clone)]
pub struct ChatRoomMember {
  /// Full occupant address, `room@muc.domain/endpoint`.
  pub occupant_jid: String,
  /// The resource part; doubles as the endpoint id in the source map.
  pub endpoint_id: String,
  pub role: MemberRole,
  pub region: Option<String>,
  pub stats_id: Option<String>,
  pub features: HashSet<String>,
}

impl ChatRoomMember {
  pub fn supports(&self, feature: &str) -> bool {
    self.features.contains(feature)
  }
}

/// Membership changes delivered to the conference controller. A tagged
/// variant rather than a listener interface, so the controller needs no
/// relationship with the substrate's types.
#[derive(Debug, Clone)]
pub enum ChatRoomEvent {
  MemberJoined(ChatRoomMember),
  MemberLeft { endpoint_id: String },
  MemberRoleChanged { endpoint_id: String, role: MemberRole },
  PresenceUpdated(ChatRoomMember),
  RoomDestroyed,
}

/// A multi-user chat room the focus has access to.
#[async_trait]
pub trait ChatRoom: Send + Sync {
  /// Bare room address.
  fn room_jid(&self) -> &str;

  /// Join the room. Events flow on the returned channel until the room is
  /// left or destroyed.
  async fn join(&self) -> anyhow::Result<mpsc::Receiver<ChatRoomEvent>>;

  async fn leave(&self) -> anyhow::Result<()>;

  /// Publish a key/value extension in the focus's own presence.
  async fn publish_presence_extension(&self, name: &str, value: &str) -> anyhow::Result<()>;
}

/// Hands out room handles; one per conference.
#[async_trait]
pub trait ChatRoomProvider: Send + Sync {
  async fn room(&self, room_jid: &str) -> anyhow::Result<std::sync::Arc<dyn ChatRoom>>;
}
