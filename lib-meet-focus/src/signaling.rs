use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::source::{ConferenceSourceMap, MediaType, VideoType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateAction {
  Add,
  Remove,
}

/// One signaling message worth of source changes for a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingUpdate {
  pub action: UpdateAction,
  pub sources: ConferenceSourceMap,
}

/// What a recipient is willing and able to receive. Fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct SignalingOptions {
  pub audio: bool,
  pub video: bool,
  pub strip_simulcast: bool,
  pub supports_multiple_video_streams: bool,
}

impl Default for SignalingOptions {
  fn default() -> Self {
    Self {
      audio: true,
      video: true,
      strip_simulcast: false,
      supports_multiple_video_streams: true,
    }
  }
}

/// Per-recipient queue of source updates.
///
/// Adds and removes accumulate into a believed conference state; `update`
/// projects that state through the recipient's options and emits the
/// minimal Remove/Add pair taking the recipient from what it last saw to
/// the projection. Consecutive same-action deltas coalesce, add/remove
/// pairs on the same source cancel, and a remove-then-add of identical
/// content produces nothing.
#[derive(Debug, Clone, Default)]
pub struct SourceSignaling {
  options: SignalingOptions,
  /// Conference state including not-yet-flushed changes, unprojected.
  state: ConferenceSourceMap,
  /// The projection the recipient has actually been told about.
  signaled: ConferenceSourceMap,
}

impl SourceSignaling {
  pub fn new(options: SignalingOptions) -> Self {
    Self {
      options,
      state: ConferenceSourceMap::new(),
      signaled: ConferenceSourceMap::new(),
    }
  }

  pub fn options(&self) -> &SignalingOptions {
    &self.options
  }

  /// Enqueue sources to add.
  pub fn add_sources(&mut self, delta: ConferenceSourceMap) {
    self.state += delta;
  }

  /// Enqueue sources to remove.
  pub fn remove_sources(&mut self, delta: &ConferenceSourceMap) {
    self.state -= delta;
  }

  /// Drop everything pending and replace the recipient's known state with
  /// `snapshot`. Returns the projection of the snapshot, i.e. exactly what
  /// the recipient is now assumed to know.
  pub fn reset(&mut self, snapshot: ConferenceSourceMap) -> ConferenceSourceMap {
    self.state = snapshot;
    self.signaled = self.project(&self.state);
    self.signaled.clone()
  }

  /// Flush: the minimal ordered list of updates bringing the recipient up
  /// to date. Empty when nothing changed; calling twice without intervening
  /// mutations yields nothing the second time.
  pub fn update(&mut self) -> Vec<SignalingUpdate> {
    let target = self.project(&self.state);
    let removes = self.signaled.clone() - &target;
    let adds = target.clone() - &self.signaled;

    let mut updates = Vec::new();
    if !removes.is_empty() {
      updates.push(SignalingUpdate {
        action: UpdateAction::Remove,
        sources: removes,
      });
    }
    if !adds.is_empty() {
      updates.push(SignalingUpdate {
        action: UpdateAction::Add,
        sources: adds,
      });
    }
    trace!(updates = updates.len(), "flushed source signaling queue");
    self.signaled = target;
    updates
  }

  fn project(&self, map: &ConferenceSourceMap) -> ConferenceSourceMap {
    let mut projected = map.clone();
    projected.retain_sources(|_, source| match source.media_type {
      MediaType::Audio => self.options.audio,
      MediaType::Video => self.options.video,
      MediaType::Application => true,
    });
    if self.options.strip_simulcast {
      projected = projected.strip_simulcast();
    }
    if !self.options.supports_multiple_video_streams {
      projected = single_video_stream(projected);
    }
    projected
  }
}

/// Restrict each remote endpoint to one visible video stream, preferring a
/// desktop source over a camera source. RTX partners tied to the selected
/// source by a group are kept with it.
fn single_video_stream(mut map: ConferenceSourceMap) -> ConferenceSourceMap {
  let mut keep_per_endpoint: Vec<(String, HashSet<u32>)> = Vec::new();
  for (endpoint, set) in map.iter() {
    let best = set
      .sources
      .iter()
      .filter(|s| s.media_type == MediaType::Video)
      .min_by_key(|s| {
        let rank = match s.video_type {
          Some(VideoType::Desktop) => 0,
          _ => 1,
        };
        (rank, s.ssrc)
      });
    let best = match best {
      Some(source) => source,
      None => continue,
    };

    // Grow the kept set along groups so the selected stream keeps its
    // redundancy partners.
    let mut keep: HashSet<u32> = [best.ssrc].into_iter().collect();
    loop {
      let before = keep.len();
      for group in &set.groups {
        if group.ssrcs.iter().any(|ssrc| keep.contains(ssrc)) {
          keep.extend(group.ssrcs.iter().copied());
        }
      }
      if keep.len() == before {
        break;
      }
    }
    keep_per_endpoint.push((endpoint.clone(), keep));
  }

  map.retain_sources(|endpoint, source| {
    if source.media_type != MediaType::Video {
      return true;
    }
    keep_per_endpoint
      .iter()
      .find(|(e, _)| e == endpoint)
      .map(|(_, keep)| keep.contains(&source.ssrc))
      .unwrap_or(false)
  });
  map
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::{EndpointSourceSet, Semantics, Source, SourceGroup};

  fn audio(ssrc: u32) -> Source {
    Source::new(ssrc, MediaType::Audio).with_msid(format!("a{ssrc}"))
  }

  fn camera(ssrc: u32) -> Source {
    Source::new(ssrc, MediaType::Video)
      .with_msid(format!("v{ssrc}"))
      .with_video_type(VideoType::Camera)
  }

  fn desktop(ssrc: u32) -> Source {
    Source::new(ssrc, MediaType::Video)
      .with_msid(format!("d{ssrc}"))
      .with_video_type(VideoType::Desktop)
  }

  fn map_of(endpoint: &str, sources: Vec<Source>) -> ConferenceSourceMap {
    ConferenceSourceMap::from_endpoint(endpoint, EndpointSourceSet::from_sources(sources))
  }

  #[test]
  fn consecutive_adds_coalesce_into_one_update() {
    let mut queue = SourceSignaling::new(SignalingOptions::default());
    queue.add_sources(map_of("a", vec![audio(1)]));
    queue.add_sources(map_of("a", vec![camera(2)]));
    let updates = queue.update();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].action, UpdateAction::Add);
    assert_eq!(updates[0].sources.get("a").unwrap().sources.len(), 2);
  }

  #[test]
  fn add_then_remove_of_same_source_cancels() {
    let mut queue = SourceSignaling::new(SignalingOptions::default());
    queue.add_sources(map_of("a", vec![audio(1)]));
    queue.remove_sources(&map_of("a", vec![audio(1)]));
    assert!(queue.update().is_empty());
  }

  #[test]
  fn remove_then_identical_add_cancels() {
    let mut queue = SourceSignaling::new(SignalingOptions::default());
    queue.reset(map_of("a", vec![audio(1)]));
    queue.remove_sources(&map_of("a", vec![audio(1)]));
    queue.add_sources(map_of("a", vec![audio(1)]));
    assert!(queue.update().is_empty());
  }

  #[test]
  fn remove_then_different_add_becomes_a_replacement_pair() {
    let mut queue = SourceSignaling::new(SignalingOptions::default());
    queue.reset(map_of("a", vec![audio(1)]));
    queue.remove_sources(&map_of("a", vec![audio(1)]));
    queue.add_sources(map_of("a", vec![audio(2)]));
    let updates = queue.update();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].action, UpdateAction::Remove);
    assert_eq!(updates[1].action, UpdateAction::Add);
  }

  #[test]
  fn update_is_idempotent_without_mutations() {
    let mut queue = SourceSignaling::new(SignalingOptions::default());
    queue.add_sources(map_of("a", vec![audio(1), camera(2)]));
    assert!(!queue.update().is_empty());
    assert!(queue.update().is_empty());
  }

  #[test]
  fn audio_only_recipient_never_sees_video() {
    let mut queue = SourceSignaling::new(SignalingOptions {
      video: false,
      ..Default::default()
    });
    queue.add_sources(map_of("a", vec![audio(1), camera(2)]));
    let updates = queue.update();
    let set = updates[0].sources.get("a").unwrap();
    assert_eq!(set.sources.len(), 1);
    assert_eq!(set.sources.iter().next().unwrap().media_type, MediaType::Audio);
  }

  #[test]
  fn simulcast_is_stripped_for_recipients_that_want_it() {
    let mut queue = SourceSignaling::new(SignalingOptions {
      strip_simulcast: true,
      ..Default::default()
    });
    let set = EndpointSourceSet::new(
      (1..=3).map(|ssrc| Source::new(ssrc, MediaType::Video).with_msid("m")),
      [SourceGroup::new(Semantics::Sim, [1, 2, 3])],
    );
    queue.add_sources(ConferenceSourceMap::from_endpoint("a", set));
    let updates = queue.update();
    let visible = updates[0].sources.get("a").unwrap();
    assert_eq!(visible.sources.len(), 1);
    assert_eq!(visible.sources.iter().next().unwrap().ssrc, 1);
    assert!(visible.groups.is_empty());
  }

  #[test]
  fn single_stream_recipient_gets_desktop_over_camera() {
    let mut queue = SourceSignaling::new(SignalingOptions {
      supports_multiple_video_streams: false,
      ..Default::default()
    });
    queue.add_sources(map_of("a", vec![camera(1)]));
    let updates = queue.update();
    assert_eq!(updates[0].sources.get("a").unwrap().sources.len(), 1);

    // Desktop appears: the camera is swapped out in a single flush.
    queue.add_sources(map_of("a", vec![desktop(2)]));
    let updates = queue.update();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].action, UpdateAction::Remove);
    assert_eq!(
      updates[0].sources.get("a").unwrap().sources.iter().next().unwrap().ssrc,
      1
    );
    assert_eq!(updates[1].action, UpdateAction::Add);
    assert_eq!(
      updates[1].sources.get("a").unwrap().sources.iter().next().unwrap().ssrc,
      2
    );

    // Desktop goes away again: swap back to the camera.
    queue.remove_sources(&map_of("a", vec![desktop(2)]));
    let updates = queue.update();
    assert_eq!(updates.len(), 2);
    assert_eq!(
      updates[1].sources.get("a").unwrap().sources.iter().next().unwrap().ssrc,
      1
    );
  }

  #[test]
  fn single_stream_selection_keeps_rtx_partners() {
    let mut queue = SourceSignaling::new(SignalingOptions {
      supports_multiple_video_streams: false,
      ..Default::default()
    });
    let set = EndpointSourceSet::new(
      [
        Source::new(1, MediaType::Video).with_msid("m"),
        Source::new(2, MediaType::Video).with_msid("m"),
        desktop(10),
      ],
      [SourceGroup::new(Semantics::Fid, [1, 2])],
    );
    queue.add_sources(ConferenceSourceMap::from_endpoint("a", set));
    let updates = queue.update();
    let visible = updates[0].sources.get("a").unwrap();
    // Desktop wins; the camera FID pair is suppressed entirely.
    let ssrcs: HashSet<u32> = visible.sources.iter().map(|s| s.ssrc).collect();
    assert_eq!(ssrcs, [10].into_iter().collect());
  }

  #[test]
  fn reset_replaces_known_state_and_drops_pending() {
    let mut queue = SourceSignaling::new(SignalingOptions::default());
    queue.add_sources(map_of("a", vec![audio(1)]));
    let snapshot = map_of("b", vec![audio(5)]);
    let known = queue.reset(snapshot.clone());
    assert_eq!(known, snapshot);
    // Nothing pending after a reset.
    assert!(queue.update().is_empty());
  }

  #[test]
  fn audio_and_application_pass_through_single_stream_projection() {
    let mut queue = SourceSignaling::new(SignalingOptions {
      supports_multiple_video_streams: false,
      ..Default::default()
    });
    queue.add_sources(map_of("a", vec![audio(1), camera(2), camera(3)]));
    let updates = queue.update();
    let visible = updates[0].sources.get("a").unwrap();
    let ssrcs: HashSet<u32> = visible.sources.iter().map(|s| s.ssrc).collect();
    assert_eq!(ssrcs, [1, 2].into_iter().collect());
  }
}
