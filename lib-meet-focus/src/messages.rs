use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::source::{ConferenceSourceMap, MediaType};

/// Request to create or join a conference, addressed to the focus. The JSON
/// encoding below is the documented one; the IQ representation used on the
/// signaling substrate maps onto the same fields. Unknown properties travel
/// opaquely in `properties`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConferenceRequest {
  pub room: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ready: Option<bool>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub session_id: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub identity: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub machine_uid: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub vnode: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub focus_jid: Option<String>,
  #[serde(skip_serializing_if = "HashMap::is_empty")]
  pub properties: HashMap<String, String>,
}

impl ConferenceRequest {
  pub fn to_json(&self) -> serde_json::Result<String> {
    serde_json::to_string(self)
  }

  pub fn from_json(json: &str) -> serde_json::Result<Self> {
    serde_json::from_str(json)
  }
}

/// One negotiated codec inside an offered content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecInfo {
  pub name: String,
  pub clock_rate: u32,
  pub channels: u16,
  pub payload_type: i32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rtx_payload_type: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpExtensionInfo {
  pub uri: String,
  pub id: u8,
}

/// One media content of an offer: audio, video, or the data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
  pub media_type: MediaType,
  pub codecs: Vec<CodecInfo>,
  pub rtp_extensions: Vec<RtpExtensionInfo>,
}

/// ICE/DTLS transport details, opaque to the focus: produced by bridges and
/// peers, forwarded without interpretation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportDescription(pub serde_json::Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminateReason {
  Success,
  Timeout,
  ConnectivityError,
  Gone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColibriAllocateRequest {
  pub conference_id: String,
  pub room: String,
  /// Set by the first allocation for a conference on a bridge; tells the
  /// bridge to create the conference object.
  pub create: bool,
  pub endpoint_id: String,
  pub contents: Vec<ContentInfo>,
  pub initial_sources: ConferenceSourceMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColibriAllocateResponse {
  pub session_id: String,
  pub transport: TransportDescription,
  pub sources: ConferenceSourceMap,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub relay_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColibriUpdateRequest {
  pub conference_id: String,
  pub endpoint_id: String,
  pub sources_to_add: ConferenceSourceMap,
  pub sources_to_remove: ConferenceSourceMap,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub transport: Option<TransportDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColibriExpireRequest {
  pub conference_id: String,
  /// Expire one endpoint, or the whole conference when absent.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub endpoint_id: Option<String>,
}

/// Periodic load/health report published by a bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatusReport {
  pub jid: String,
  pub stress: f64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub region: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub relay_id: Option<String>,
  #[serde(default, skip_serializing_if = "HashSet::is_empty")]
  pub features: HashSet<String>,
}

/// Every typed message exchanged through the signaling substrate. The
/// substrate adapter is responsible for the wire representation; the core
/// never sees XML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
  ConferenceRequest(ConferenceRequest),
  SessionInitiate {
    sid: String,
    contents: Vec<ContentInfo>,
    sources: ConferenceSourceMap,
    transport: TransportDescription,
  },
  SessionAccept {
    sid: String,
    sources: ConferenceSourceMap,
    transport: TransportDescription,
  },
  SourceAdd {
    sid: String,
    sources: ConferenceSourceMap,
  },
  SourceRemove {
    sid: String,
    sources: ConferenceSourceMap,
  },
  TransportInfo {
    sid: String,
    transport: TransportDescription,
  },
  SessionTerminate {
    sid: String,
    reason: TerminateReason,
  },
  ColibriAllocate(ColibriAllocateRequest),
  ColibriAllocateResponse(ColibriAllocateResponse),
  ColibriUpdate(ColibriUpdateRequest),
  ColibriExpire(ColibriExpireRequest),
  BridgeStatusReport(BridgeStatusReport),
  /// Positive acknowledgement of a request that has no payload to return.
  Ack,
  /// Error reply carried back to the requester.
  Error {
    condition: String,
  },
}

impl SignalingMessage {
  /// Short name for logs and error messages.
  pub fn kind(&self) -> &'static str {
    match self {
      SignalingMessage::ConferenceRequest(_) => "conference-request",
      SignalingMessage::SessionInitiate { .. } => "session-initiate",
      SignalingMessage::SessionAccept { .. } => "session-accept",
      SignalingMessage::SourceAdd { .. } => "source-add",
      SignalingMessage::SourceRemove { .. } => "source-remove",
      SignalingMessage::TransportInfo { .. } => "transport-info",
      SignalingMessage::SessionTerminate { .. } => "session-terminate",
      SignalingMessage::ColibriAllocate(_) => "colibri-allocate",
      SignalingMessage::ColibriAllocateResponse(_) => "colibri-allocate-response",
      SignalingMessage::ColibriUpdate(_) => "colibri-update",
      SignalingMessage::ColibriExpire(_) => "colibri-expire",
      SignalingMessage::BridgeStatusReport(_) => "bridge-status-report",
      SignalingMessage::Ack => "ack",
      SignalingMessage::Error { .. } => "error",
    }
  }
}
