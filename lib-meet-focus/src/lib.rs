mod bridge;
mod colibri;
mod conference;
mod config;
mod connection;
mod error;
mod focus;
mod jingle;
mod messages;
mod muc;
mod participant;
mod signaling;
mod source;
mod util;
mod validation;

pub use crate::{
  bridge::{select_bridge, Bridge, BridgeRegistry, SelectionInput},
  colibri::{ColibriAllocation, ColibriError, ColibriSessionManager},
  conference::Conference,
  config::{
    BridgeOptions, CodecOptions, ConferenceOptions, FocusConfig, HealthOptions, JingleOptions,
    RtpExtensionOptions,
  },
  connection::{InboundMessage, RequestError, SignalingConnection},
  error::ConferenceError,
  focus::{FocusManager, FocusStatistics, HealthStatus},
  jingle::{JingleError, JingleSession, JingleState},
  messages::{
    BridgeStatusReport, CodecInfo, ColibriAllocateRequest, ColibriAllocateResponse,
    ColibriExpireRequest, ColibriUpdateRequest, ConferenceRequest, ContentInfo, RtpExtensionInfo,
    SignalingMessage, TerminateReason, TransportDescription,
  },
  muc::{features, ChatRoom, ChatRoomEvent, ChatRoomMember, ChatRoomProvider, MemberRole},
  participant::{InviteState, Participant},
  signaling::{SignalingOptions, SignalingUpdate, SourceSignaling, UpdateAction},
  source::{
    ConferenceSourceMap, EndpointSourceSet, MediaType, Semantics, Source, SourceGroup, VideoType,
  },
  validation::{SourceLimits, ValidatingSourceMap, ValidationError},
};

#[cfg(feature = "tracing-subscriber")]
pub fn init_tracing(level: tracing::Level) {
  tracing_subscriber::fmt()
    .with_max_level(level)
    .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
    .with_target(false)
    .init();
}
