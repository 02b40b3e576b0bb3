//! Conversion between the library's typed messages and XMPP stanzas.
//!
//! The focus element and the Jingle/SSMA payloads follow the Jitsi Meet
//! wire conventions. Transport descriptions are opaque to the focus and
//! travel as XEP-0335 JSON containers inside the transport element, as do
//! the colibri payloads exchanged with bridges.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Context, Result};
use lib_meet_focus::{
  BridgeStatusReport, ConferenceRequest, ConferenceSourceMap, ContentInfo, EndpointSourceSet,
  MediaType, Semantics, SignalingMessage, Source, SourceGroup, TerminateReason,
  TransportDescription, VideoType,
};
use xmpp_parsers::{
  iq::{IqGetPayload, IqResultPayload, IqSetPayload},
  Element,
};

pub(crate) mod ns {
  pub(crate) const FOCUS: &str = "http://jitsi.org/protocol/focus";
  pub(crate) const JINGLE: &str = "urn:xmpp:jingle:1";
  pub(crate) const JINGLE_RTP: &str = "urn:xmpp:jingle:apps:rtp:1";
  pub(crate) const JINGLE_SSMA: &str = "urn:xmpp:jingle:apps:rtp:ssma:0";
  pub(crate) const JINGLE_ICE_UDP: &str = "urn:xmpp:jingle:transports:ice-udp:1";
  pub(crate) const RTP_HDREXT: &str = "urn:xmpp:jingle:apps:rtp:rtp-hdrext:0";
  pub(crate) const JITSI_MEET: &str = "http://jitsi.org/jitmeet";
  pub(crate) const JSON: &str = "urn:xmpp:json:0";
  pub(crate) const COLIBRI: &str = "jitsi:colibri2";
  pub(crate) const COLIBRI_STATS: &str = "http://jitsi.org/protocol/colibri";
}

/// Raw element carried as an IQ payload.
pub(crate) struct Stanza(pub(crate) Element);

impl TryFrom<Element> for Stanza {
  type Error = xmpp_parsers::Error;

  fn try_from(element: Element) -> Result<Stanza, xmpp_parsers::Error> {
    Ok(Stanza(element))
  }
}

impl From<Stanza> for Element {
  fn from(stanza: Stanza) -> Element {
    stanza.0
  }
}

impl IqSetPayload for Stanza {}
impl IqGetPayload for Stanza {}
impl IqResultPayload for Stanza {}

fn json_element(value: &serde_json::Value) -> Element {
  Element::builder("json", ns::JSON)
    .append(value.to_string())
    .build()
}

fn json_child(element: &Element) -> Option<serde_json::Value> {
  element
    .get_child("json", ns::JSON)
    .and_then(|child| serde_json::from_str(&child.text()).ok())
}

/// Builds the stanza payload for an outbound typed message.
pub(crate) fn build_payload(message: &SignalingMessage) -> Result<Element> {
  Ok(match message {
    SignalingMessage::ConferenceRequest(request) => build_conference(request),
    SignalingMessage::SessionInitiate {
      sid,
      contents,
      sources,
      transport,
    } => build_jingle_offer(sid, contents, sources, transport),
    SignalingMessage::SessionAccept {
      sid,
      sources,
      transport,
    } => jingle(
      "session-accept",
      sid,
      [sources_content(sources), transport_content(transport)],
    ),
    SignalingMessage::SourceAdd { sid, sources } => {
      jingle("source-add", sid, [sources_content(sources)])
    },
    SignalingMessage::SourceRemove { sid, sources } => {
      jingle("source-remove", sid, [sources_content(sources)])
    },
    SignalingMessage::TransportInfo { sid, transport } => {
      jingle("transport-info", sid, [transport_content(transport)])
    },
    SignalingMessage::SessionTerminate { sid, reason } => {
      let reason_name = match reason {
        TerminateReason::Success => "success",
        TerminateReason::Timeout => "expired",
        TerminateReason::ConnectivityError => "connectivity-error",
        TerminateReason::Gone => "gone",
      };
      jingle(
        "session-terminate",
        sid,
        [Element::builder("reason", ns::JINGLE)
          .append(Element::builder(reason_name, ns::JINGLE).build())
          .build()],
      )
    },
    SignalingMessage::ColibriAllocate(_)
    | SignalingMessage::ColibriAllocateResponse(_)
    | SignalingMessage::ColibriUpdate(_)
    | SignalingMessage::ColibriExpire(_) => Element::builder("colibri2", ns::COLIBRI)
      .append(json_element(&serde_json::to_value(message)?))
      .build(),
    SignalingMessage::BridgeStatusReport(_)
    | SignalingMessage::Ack
    | SignalingMessage::Error { .. } => {
      return Err(anyhow!("{} has no IQ payload representation", message.kind()));
    },
  })
}

/// Parses an inbound IQ payload into a typed message.
pub(crate) fn parse_payload(element: &Element) -> Result<SignalingMessage> {
  if element.is("conference", ns::FOCUS) {
    return Ok(SignalingMessage::ConferenceRequest(parse_conference(
      element,
    )?));
  }
  if element.is("jingle", ns::JINGLE) {
    return parse_jingle(element);
  }
  if element.is("colibri2", ns::COLIBRI) {
    let value = json_child(element).context("colibri2 payload with no JSON body")?;
    return Ok(serde_json::from_value(value)?);
  }
  Err(anyhow!(
    "unrecognized payload: {} ({})",
    element.name(),
    element.ns()
  ))
}

fn build_conference(request: &ConferenceRequest) -> Element {
  let mut builder = Element::builder("conference", ns::FOCUS).attr("room", &request.room);
  if let Some(ready) = request.ready {
    builder = builder.attr("ready", ready.to_string());
  }
  if let Some(session_id) = &request.session_id {
    builder = builder.attr("session-id", session_id);
  }
  if let Some(identity) = &request.identity {
    builder = builder.attr("identity", identity);
  }
  if let Some(machine_uid) = &request.machine_uid {
    builder = builder.attr("machine-uid", machine_uid);
  }
  if let Some(vnode) = &request.vnode {
    builder = builder.attr("vnode", vnode);
  }
  if let Some(focus_jid) = &request.focus_jid {
    builder = builder.attr("focusjid", focus_jid);
  }
  for (name, value) in &request.properties {
    builder = builder.append(
      Element::builder("property", ns::FOCUS)
        .attr("name", name)
        .attr("value", value)
        .build(),
    );
  }
  builder.build()
}

fn parse_conference(element: &Element) -> Result<ConferenceRequest> {
  let mut properties = HashMap::new();
  for child in element.children() {
    if child.is("property", ns::FOCUS) {
      if let (Some(name), Some(value)) = (child.attr("name"), child.attr("value")) {
        properties.insert(name.to_owned(), value.to_owned());
      }
    }
  }
  Ok(ConferenceRequest {
    room: element
      .attr("room")
      .context("conference element without room")?
      .to_owned(),
    ready: element.attr("ready").and_then(|ready| ready.parse().ok()),
    session_id: element.attr("session-id").map(str::to_owned),
    identity: element.attr("identity").map(str::to_owned),
    machine_uid: element.attr("machine-uid").map(str::to_owned),
    vnode: element.attr("vnode").map(str::to_owned),
    focus_jid: element.attr("focusjid").map(str::to_owned),
    properties,
  })
}

fn jingle(action: &str, sid: &str, children: impl IntoIterator<Item = Element>) -> Element {
  children
    .into_iter()
    .fold(
      Element::builder("jingle", ns::JINGLE)
        .attr("action", action)
        .attr("sid", sid),
      |builder, child| builder.append(child),
    )
    .build()
}

fn transport_element(transport: &TransportDescription) -> Element {
  Element::builder("transport", ns::JINGLE_ICE_UDP)
    .append(json_element(&transport.0))
    .build()
}

fn transport_content(transport: &TransportDescription) -> Element {
  Element::builder("content", ns::JINGLE)
    .attr("creator", "initiator")
    .attr("name", "transport")
    .append(transport_element(transport))
    .build()
}

fn build_jingle_offer(
  sid: &str,
  contents: &[ContentInfo],
  sources: &ConferenceSourceMap,
  transport: &TransportDescription,
) -> Element {
  let mut content_elements = Vec::new();
  for content in contents {
    let name = content.media_type.to_string();
    let mut children = Vec::new();
    for codec in &content.codecs {
      children.push(
        Element::builder("payload-type", ns::JINGLE_RTP)
          .attr("id", codec.payload_type.to_string())
          .attr("name", &codec.name)
          .attr("clockrate", codec.clock_rate.to_string())
          .attr("channels", codec.channels.to_string())
          .build(),
      );
      if let Some(rtx) = codec.rtx_payload_type {
        children.push(
          Element::builder("payload-type", ns::JINGLE_RTP)
            .attr("id", rtx.to_string())
            .attr("name", "rtx")
            .attr("clockrate", codec.clock_rate.to_string())
            .append(
              Element::builder("parameter", ns::JINGLE_RTP)
                .attr("name", "apt")
                .attr("value", codec.payload_type.to_string())
                .build(),
            )
            .build(),
        );
      }
    }
    for extension in &content.rtp_extensions {
      children.push(
        Element::builder("rtp-hdrext", ns::RTP_HDREXT)
          .attr("id", extension.id.to_string())
          .attr("uri", &extension.uri)
          .build(),
      );
    }
    children.extend(media_source_elements(sources, content.media_type));

    let description = children
      .into_iter()
      .fold(
        Element::builder("description", ns::JINGLE_RTP).attr("media", &name),
        |builder, child| builder.append(child),
      )
      .build();
    content_elements.push(
      Element::builder("content", ns::JINGLE)
        .attr("creator", "initiator")
        .attr("name", &name)
        .attr("senders", "both")
        .append(description)
        .append(transport_element(transport))
        .build(),
    );
  }
  jingle("session-initiate", sid, content_elements)
}

/// A single content carrying every signaled source, used for source-add,
/// source-remove and session-accept payloads.
fn sources_content(sources: &ConferenceSourceMap) -> Element {
  let mut children = Vec::new();
  for media_type in [MediaType::Audio, MediaType::Video, MediaType::Application] {
    children.extend(media_source_elements(sources, media_type));
  }
  let description = children
    .into_iter()
    .fold(
      Element::builder("description", ns::JINGLE_RTP),
      |builder, child| builder.append(child),
    )
    .build();
  Element::builder("content", ns::JINGLE)
    .attr("creator", "initiator")
    .attr("name", "sources")
    .append(description)
    .build()
}

fn media_source_elements(sources: &ConferenceSourceMap, media_type: MediaType) -> Vec<Element> {
  let mut elements = Vec::new();
  for (endpoint, set) in sources.iter() {
    for source in &set.sources {
      if source.media_type != media_type {
        continue;
      }
      let mut builder = Element::builder("source", ns::JINGLE_SSMA)
        .attr("ssrc", source.ssrc.to_string())
        .attr("media", media_type.to_string())
        .append(
          Element::builder("ssrc-info", ns::JITSI_MEET)
            .attr("owner", endpoint)
            .build(),
        );
      if let Some(name) = &source.name {
        builder = builder.attr("name", name);
      }
      if let Some(video_type) = source.video_type {
        let video_type = match video_type {
          VideoType::Camera => "camera",
          VideoType::Desktop => "desktop",
        };
        builder = builder.attr("videoType", video_type);
      }
      if let Some(msid) = &source.msid {
        builder = builder.append(
          Element::builder("parameter", ns::JINGLE_SSMA)
            .attr("name", "msid")
            .attr("value", msid)
            .build(),
        );
      }
      elements.push(builder.build());
    }
    // Groups ride with the video content; signaling only groups video
    // sources keeps them from being emitted once per media type.
    if media_type == MediaType::Video {
      for group in &set.groups {
        let builder = group.ssrcs.iter().fold(
          Element::builder("ssrc-group", ns::JINGLE_SSMA)
            .attr("semantics", group.semantics.to_string())
            .attr("owner", endpoint.as_str()),
          |builder, ssrc| {
            builder.append(
              Element::builder("source", ns::JINGLE_SSMA)
                .attr("ssrc", ssrc.to_string())
                .build(),
            )
          },
        );
        elements.push(builder.build());
      }
    }
  }
  elements
}

fn parse_jingle(element: &Element) -> Result<SignalingMessage> {
  let action = element
    .attr("action")
    .context("jingle element without action")?;
  let sid = element
    .attr("sid")
    .context("jingle element without sid")?
    .to_owned();

  let mut sources = ConferenceSourceMap::new();
  let mut transport = TransportDescription::default();
  for content in element.children().filter(|child| child.is("content", ns::JINGLE)) {
    for child in content.children() {
      if child.is("description", ns::JINGLE_RTP) {
        let media = child.attr("media").and_then(parse_media_type);
        collect_sources(child, media, &mut sources);
      }
      else if child.is("transport", ns::JINGLE_ICE_UDP) {
        if let Some(value) = json_child(child) {
          transport = TransportDescription(value);
        }
      }
    }
  }

  Ok(match action {
    "session-accept" => SignalingMessage::SessionAccept {
      sid,
      sources,
      transport,
    },
    "source-add" => SignalingMessage::SourceAdd { sid, sources },
    "source-remove" => SignalingMessage::SourceRemove { sid, sources },
    "transport-info" => SignalingMessage::TransportInfo { sid, transport },
    "session-terminate" => {
      let reason = element
        .get_child("reason", ns::JINGLE)
        .and_then(|reason| reason.children().next())
        .map(|condition| match condition.name() {
          "success" => TerminateReason::Success,
          "expired" => TerminateReason::Timeout,
          "connectivity-error" => TerminateReason::ConnectivityError,
          _ => TerminateReason::Gone,
        })
        .unwrap_or(TerminateReason::Gone);
      SignalingMessage::SessionTerminate { sid, reason }
    },
    other => return Err(anyhow!("unsupported jingle action: {}", other)),
  })
}

fn parse_media_type(media: &str) -> Option<MediaType> {
  match media {
    "audio" => Some(MediaType::Audio),
    "video" => Some(MediaType::Video),
    "application" => Some(MediaType::Application),
    _ => None,
  }
}

fn collect_sources(
  description: &Element,
  description_media: Option<MediaType>,
  sources: &mut ConferenceSourceMap,
) {
  for child in description.children() {
    if child.is("source", ns::JINGLE_SSMA) {
      let ssrc = match child.attr("ssrc").and_then(|ssrc| ssrc.parse().ok()) {
        Some(ssrc) => ssrc,
        None => continue,
      };
      let media_type = match child
        .attr("media")
        .and_then(parse_media_type)
        .or(description_media)
      {
        Some(media_type) => media_type,
        None => continue,
      };
      let mut source = Source::new(ssrc, media_type);
      if let Some(name) = child.attr("name") {
        source = source.with_name(name);
      }
      source.video_type = match child.attr("videoType") {
        Some("desktop") => Some(VideoType::Desktop),
        Some("camera") => Some(VideoType::Camera),
        _ => None,
      };
      for parameter in child.children() {
        if parameter.name() == "parameter" && parameter.attr("name") == Some("msid") {
          if let Some(value) = parameter.attr("value") {
            source = source.with_msid(value);
          }
        }
      }
      let owner = source_owner(child);
      sources.add_endpoint(owner, EndpointSourceSet::from_sources([source]));
    }
    else if child.is("ssrc-group", ns::JINGLE_SSMA) {
      let semantics = match child.attr("semantics") {
        Some("SIM") => Semantics::Sim,
        Some("FID") => Semantics::Fid,
        Some("FEC-FR") => Semantics::FecFr,
        _ => continue,
      };
      let ssrcs: Vec<u32> = child
        .children()
        .filter(|source| source.is("source", ns::JINGLE_SSMA))
        .filter_map(|source| source.attr("ssrc").and_then(|ssrc| ssrc.parse().ok()))
        .collect();
      let owner = child.attr("owner").unwrap_or("").to_owned();
      sources.add_endpoint(
        owner,
        EndpointSourceSet::new([], [SourceGroup::new(semantics, ssrcs)]),
      );
    }
  }
}

/// The advertised owner of a source; the occupant resource when a full
/// occupant jid was signaled.
fn source_owner(source: &Element) -> String {
  let owner = source
    .children()
    .find(|child| child.is("ssrc-info", ns::JITSI_MEET))
    .and_then(|info| info.attr("owner"))
    .unwrap_or("");
  match owner.rsplit_once('/') {
    Some((_, resource)) => resource.to_owned(),
    None => owner.to_owned(),
  }
}

/// Extracts a bridge status report from brewery MUC presence.
pub(crate) fn parse_bridge_stats(from: &str, presence: &Element) -> Option<BridgeStatusReport> {
  let stats = presence
    .children()
    .find(|child| child.is("stats", ns::COLIBRI_STATS))?;
  let mut report = BridgeStatusReport {
    jid: from.to_owned(),
    stress: 0.0,
    region: None,
    version: None,
    relay_id: None,
    features: HashSet::new(),
  };
  for stat in stats.children() {
    let (name, value) = match (stat.attr("name"), stat.attr("value")) {
      (Some(name), Some(value)) => (name, value),
      _ => continue,
    };
    match name {
      "stress_level" | "stress" => {
        if let Ok(stress) = value.parse() {
          report.stress = stress;
        }
      },
      "region" => report.region = Some(value.to_owned()),
      "version" => report.version = Some(value.to_owned()),
      "relay_id" => report.relay_id = Some(value.to_owned()),
      _ => {},
    }
  }
  for feature in presence.children().filter(|child| child.name() == "feature") {
    if let Some(var) = feature.attr("var") {
      report.features.insert(var.to_owned());
    }
  }
  Some(report)
}
