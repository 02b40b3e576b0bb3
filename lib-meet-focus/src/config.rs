use std::{collections::HashMap, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::{
  messages::{CodecInfo, ContentInfo, RtpExtensionInfo},
  source::MediaType,
  validation::SourceLimits,
};

mod duration_secs {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer};

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Ok(Duration::from_secs_f64(secs))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConferenceOptions {
  pub max_audio_senders: usize,
  pub max_video_senders: usize,
  pub max_sources_per_endpoint: usize,
  pub max_groups_per_endpoint: usize,
  #[serde(with = "duration_secs")]
  pub single_participant_timeout: Duration,
  pub invite_workers: usize,
}

impl Default for ConferenceOptions {
  fn default() -> Self {
    Self {
      max_audio_senders: 999,
      max_video_senders: 999,
      max_sources_per_endpoint: 20,
      max_groups_per_endpoint: 20,
      single_participant_timeout: Duration::from_secs(20),
      invite_workers: 8,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeOptions {
  #[serde(with = "duration_secs")]
  pub failure_reset_threshold: Duration,
  pub high_stress_threshold: f64,
  /// A bridge that has not reported for this long is considered offline.
  #[serde(with = "duration_secs")]
  pub lost_timeout: Duration,
  #[serde(with = "duration_secs")]
  pub allocate_timeout: Duration,
}

impl Default for BridgeOptions {
  fn default() -> Self {
    Self {
      failure_reset_threshold: Duration::from_secs(60),
      high_stress_threshold: 0.8,
      lost_timeout: Duration::from_secs(90),
      allocate_timeout: Duration::from_secs(15),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JingleOptions {
  /// How long a session may sit past OfferSent before it is torn down.
  #[serde(with = "duration_secs")]
  pub session_timeout: Duration,
}

impl Default for JingleOptions {
  fn default() -> Self {
    Self {
      session_timeout: Duration::from_secs(30),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthOptions {
  /// An empty bridge registry older than this makes the focus unhealthy.
  #[serde(with = "duration_secs")]
  pub empty_registry_grace_period: Duration,
}

impl Default for HealthOptions {
  fn default() -> Self {
    Self {
      empty_registry_grace_period: Duration::from_secs(120),
    }
  }
}

/// One codec row. A payload type of -1 disables the codec, matching the
/// legacy configuration convention.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodecOptions {
  pub enabled: bool,
  pub payload_type: i32,
  pub rtx_payload_type: i32,
  pub clock_rate: u32,
  pub channels: u16,
}

impl Default for CodecOptions {
  fn default() -> Self {
    Self {
      enabled: false,
      payload_type: -1,
      rtx_payload_type: -1,
      clock_rate: 90000,
      channels: 1,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtpExtensionOptions {
  pub enabled: bool,
  pub id: u8,
}

impl Default for RtpExtensionOptions {
  fn default() -> Self {
    Self { enabled: false, id: 0 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FocusConfig {
  pub conference: ConferenceOptions,
  pub bridge: BridgeOptions,
  pub jingle: JingleOptions,
  pub health: HealthOptions,
  pub codecs: HashMap<String, CodecOptions>,
  pub rtp_extensions: HashMap<String, RtpExtensionOptions>,
}

impl Default for FocusConfig {
  fn default() -> Self {
    let mut codecs = HashMap::new();
    codecs.insert(
      "opus".to_owned(),
      CodecOptions {
        enabled: true,
        payload_type: 111,
        rtx_payload_type: -1,
        clock_rate: 48000,
        channels: 2,
      },
    );
    codecs.insert(
      "vp8".to_owned(),
      CodecOptions {
        enabled: true,
        payload_type: 100,
        rtx_payload_type: 96,
        ..Default::default()
      },
    );
    codecs.insert(
      "vp9".to_owned(),
      CodecOptions {
        enabled: true,
        payload_type: 101,
        rtx_payload_type: 97,
        ..Default::default()
      },
    );
    codecs.insert(
      "h264".to_owned(),
      CodecOptions {
        enabled: false,
        payload_type: 107,
        rtx_payload_type: 99,
        ..Default::default()
      },
    );

    let mut rtp_extensions = HashMap::new();
    rtp_extensions.insert(
      "ssrc-audio-level".to_owned(),
      RtpExtensionOptions { enabled: true, id: 1 },
    );
    rtp_extensions.insert(
      "transport-cc".to_owned(),
      RtpExtensionOptions { enabled: true, id: 5 },
    );

    Self {
      conference: ConferenceOptions::default(),
      bridge: BridgeOptions::default(),
      jingle: JingleOptions::default(),
      health: HealthOptions::default(),
      codecs,
      rtp_extensions,
    }
  }
}

impl FocusConfig {
  /// Loads the hierarchical configuration, then lays legacy flat properties
  /// over it. Legacy values win when both name the same setting.
  pub fn load(json: Option<&str>, legacy: &HashMap<String, String>) -> anyhow::Result<Self> {
    let mut config: FocusConfig = match json {
      Some(json) => serde_json::from_str(json)?,
      None => FocusConfig::default(),
    };
    config.apply_legacy(legacy);
    Ok(config)
  }

  /// Applies the legacy flat key namespace. Unknown or unparseable entries
  /// are logged and skipped.
  pub fn apply_legacy(&mut self, properties: &HashMap<String, String>) {
    for (key, value) in properties {
      if !self.apply_legacy_entry(key, value) {
        warn!(key, value, "ignoring unrecognized legacy configuration entry");
      }
    }
  }

  fn apply_legacy_entry(&mut self, key: &str, value: &str) -> bool {
    fn set<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
      match value.parse() {
        Ok(parsed) => {
          *slot = parsed;
          true
        },
        Err(_) => false,
      }
    }
    fn set_duration(slot: &mut Duration, value: &str) -> bool {
      match value.parse::<f64>() {
        Ok(secs) if secs >= 0.0 => {
          *slot = Duration::from_secs_f64(secs);
          true
        },
        _ => false,
      }
    }

    match key {
      "conference.maxAudioSenders" => set(&mut self.conference.max_audio_senders, value),
      "conference.maxVideoSenders" => set(&mut self.conference.max_video_senders, value),
      "conference.maxSourcesPerEndpoint" => {
        set(&mut self.conference.max_sources_per_endpoint, value)
      },
      "conference.maxGroupsPerEndpoint" => {
        set(&mut self.conference.max_groups_per_endpoint, value)
      },
      "conference.singleParticipantTimeout" => {
        set_duration(&mut self.conference.single_participant_timeout, value)
      },
      "conference.inviteWorkers" => set(&mut self.conference.invite_workers, value),
      "bridge.failureResetThreshold" => {
        set_duration(&mut self.bridge.failure_reset_threshold, value)
      },
      "bridge.highStressThreshold" => set(&mut self.bridge.high_stress_threshold, value),
      "bridge.lostTimeout" => set_duration(&mut self.bridge.lost_timeout, value),
      "bridge.allocateTimeout" => set_duration(&mut self.bridge.allocate_timeout, value),
      "jingle.sessionTimeout" => set_duration(&mut self.jingle.session_timeout, value),
      "health.emptyRegistryGracePeriod" => {
        set_duration(&mut self.health.empty_registry_grace_period, value)
      },
      _ => self.apply_legacy_table_entry(key, value),
    }
  }

  fn apply_legacy_table_entry(&mut self, key: &str, value: &str) -> bool {
    let mut parts = key.splitn(3, '.');
    let (table, name, field) = match (parts.next(), parts.next(), parts.next()) {
      (Some(table), Some(name), Some(field)) => (table, name, field),
      _ => return false,
    };
    match table {
      "codec" => {
        let entry = self.codecs.entry(name.to_owned()).or_default();
        match field {
          "enabled" => value.parse().map(|parsed| entry.enabled = parsed).is_ok(),
          "payloadType" => value.parse().map(|parsed| entry.payload_type = parsed).is_ok(),
          "rtxPayloadType" => value
            .parse()
            .map(|parsed| entry.rtx_payload_type = parsed)
            .is_ok(),
          _ => false,
        }
      },
      "rtpExtensions" => {
        let entry = self.rtp_extensions.entry(name.to_owned()).or_default();
        match field {
          "enabled" => value.parse().map(|parsed| entry.enabled = parsed).is_ok(),
          "id" => value.parse().map(|parsed| entry.id = parsed).is_ok(),
          _ => false,
        }
      },
      _ => false,
    }
  }

  pub fn source_limits(&self) -> SourceLimits {
    SourceLimits {
      max_sources_per_endpoint: self.conference.max_sources_per_endpoint,
      max_groups_per_endpoint: self.conference.max_groups_per_endpoint,
    }
  }

  /// The media contents offered to a participant with the given
  /// capabilities: audio always, video and the data channel only when the
  /// participant advertises support.
  pub fn offer_contents(&self, video: bool, data: bool) -> Vec<ContentInfo> {
    let mut contents = vec![ContentInfo {
      media_type: MediaType::Audio,
      codecs: self.enabled_codecs(&["opus"]),
      rtp_extensions: self.enabled_extensions(),
    }];
    if video {
      contents.push(ContentInfo {
        media_type: MediaType::Video,
        codecs: self.enabled_codecs(&["vp8", "vp9", "h264"]),
        rtp_extensions: self.enabled_extensions(),
      });
    }
    if data {
      contents.push(ContentInfo {
        media_type: MediaType::Application,
        codecs: vec![],
        rtp_extensions: vec![],
      });
    }
    contents
  }

  fn enabled_codecs(&self, names: &[&str]) -> Vec<CodecInfo> {
    names
      .iter()
      .filter_map(|name| self.codecs.get(*name).map(|options| (*name, options)))
      .filter(|(_, options)| options.enabled && options.payload_type >= 0)
      .map(|(name, options)| CodecInfo {
        name: name.to_owned(),
        clock_rate: options.clock_rate,
        channels: options.channels,
        payload_type: options.payload_type,
        rtx_payload_type: Some(options.rtx_payload_type).filter(|pt| *pt >= 0),
      })
      .collect()
  }

  fn enabled_extensions(&self) -> Vec<RtpExtensionInfo> {
    let mut extensions: Vec<RtpExtensionInfo> = self
      .rtp_extensions
      .iter()
      .filter(|(_, options)| options.enabled)
      .map(|(uri, options)| RtpExtensionInfo {
        uri: uri.clone(),
        id: options.id,
      })
      .collect();
    extensions.sort_by_key(|extension| extension.id);
    extensions
  }
}
