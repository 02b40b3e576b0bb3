use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::source::{ConferenceSourceMap, EndpointSourceSet, MediaType, Semantics};

/// Why a source add or remove was rejected. Nothing is mutated when one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
  #[error("invalid ssrc: {0}")]
  InvalidSsrc(u32),
  #[error("ssrc {0} is already in use")]
  SsrcAlreadyUsed(u32),
  #[error("too many sources for endpoint: {count} > {limit}")]
  SsrcLimitExceeded { count: usize, limit: usize },
  #[error("too many source groups for endpoint: {count} > {limit}")]
  GroupLimitExceeded { count: usize, limit: usize },
  #[error("grouped source {0} has no msid")]
  RequiredParameterMissing(u32),
  #[error("sources in group {0} have differing msids")]
  GroupMsidMismatch(String),
  #[error("FID group {0} must contain exactly two ssrcs")]
  InvalidFidGroup(String),
  #[error("msid already in use: {0}")]
  MsidConflict(String),
  #[error("group references unknown ssrc {0}")]
  MissingSourceForGroup(u32),
  #[error("source does not exist: {0}")]
  SourceDoesNotExist(u32),
  #[error("source group does not exist: {0}")]
  SourceGroupDoesNotExist(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SourceLimits {
  pub max_sources_per_endpoint: usize,
  pub max_groups_per_endpoint: usize,
}

impl Default for SourceLimits {
  fn default() -> Self {
    Self {
      max_sources_per_endpoint: 20,
      max_groups_per_endpoint: 20,
    }
  }
}

/// The conference-wide source map together with the invariants that guard
/// every mutation. All changes go through [`try_add`](Self::try_add) and
/// [`try_remove`](Self::try_remove); both are atomic.
#[derive(Debug, Clone, Default)]
pub struct ValidatingSourceMap {
  map: ConferenceSourceMap,
  limits: SourceLimits,
}

impl ValidatingSourceMap {
  pub fn new(limits: SourceLimits) -> Self {
    Self {
      map: ConferenceSourceMap::new(),
      limits,
    }
  }

  /// An immutable view of the current conference sources.
  pub fn snapshot(&self) -> &ConferenceSourceMap {
    &self.map
  }

  /// Attempts to add `set` to `endpoint`'s entry. On success returns the
  /// newly accepted sources and groups; entries the endpoint already held
  /// are deduplicated and excluded from the return.
  pub fn try_add(
    &mut self,
    endpoint: &str,
    set: EndpointSourceSet,
  ) -> Result<EndpointSourceSet, ValidationError> {
    let existing = self.map.get(endpoint).cloned().unwrap_or_default();

    let mut accepted = EndpointSourceSet::default();
    // Sources only compare equal on (ssrc, media type), so one batch can
    // smuggle the same ssrc in twice under different media types; an ssrc
    // may appear at most once per endpoint no matter the media type.
    let mut batch_media: HashMap<u32, MediaType> = HashMap::new();
    for source in &set.sources {
      if source.ssrc == 0 {
        return Err(ValidationError::InvalidSsrc(source.ssrc));
      }
      if let Some(media_type) = batch_media.insert(source.ssrc, source.media_type) {
        if media_type != source.media_type {
          return Err(ValidationError::SsrcAlreadyUsed(source.ssrc));
        }
      }
      match existing.sources.get(source) {
        Some(held) if held.msid == source.msid => {
          debug!(ssrc = source.ssrc, "deduplicating already-signaled source");
        },
        Some(_) => return Err(ValidationError::SsrcAlreadyUsed(source.ssrc)),
        None => {
          accepted.sources.insert(source.clone());
        },
      }
    }
    // Empty groups are silently dropped; duplicates are not re-added.
    for group in &set.groups {
      if group.is_empty() {
        debug!(%group, "dropping empty source group");
        continue;
      }
      if !existing.groups.contains(group) {
        accepted.groups.insert(group.clone());
      }
    }

    if accepted.is_empty() {
      return Ok(accepted);
    }

    // Conference-wide ssrc uniqueness: an ssrc may only reappear with the
    // exact same (endpoint, media type, msid) triple.
    for source in &accepted.sources {
      for (other_endpoint, other_set) in self.map.iter() {
        if let Some(held) = other_set.source_by_ssrc(source.ssrc) {
          if other_endpoint != endpoint
            || held.media_type != source.media_type
            || held.msid != source.msid
          {
            return Err(ValidationError::SsrcAlreadyUsed(source.ssrc));
          }
        }
      }
    }

    let candidate = existing + accepted.clone();
    self.validate_endpoint(endpoint, &candidate)?;

    if candidate.sources.len() > self.limits.max_sources_per_endpoint {
      return Err(ValidationError::SsrcLimitExceeded {
        count: candidate.sources.len(),
        limit: self.limits.max_sources_per_endpoint,
      });
    }
    if candidate.groups.len() > self.limits.max_groups_per_endpoint {
      return Err(ValidationError::GroupLimitExceeded {
        count: candidate.groups.len(),
        limit: self.limits.max_groups_per_endpoint,
      });
    }

    self.map.remove_endpoint(endpoint);
    self.map.add_endpoint(endpoint, candidate);
    Ok(accepted)
  }

  /// Attempts to remove `set` from `endpoint`'s entry. Partial removals are
  /// permitted as long as the remaining state still satisfies the
  /// invariants. Removing an empty set is a no-op.
  pub fn try_remove(
    &mut self,
    endpoint: &str,
    set: &EndpointSourceSet,
  ) -> Result<EndpointSourceSet, ValidationError> {
    if set.is_empty() {
      return Ok(EndpointSourceSet::default());
    }

    let existing = self.map.get(endpoint).cloned().unwrap_or_default();
    let mut removed = EndpointSourceSet::default();
    for source in &set.sources {
      match existing.sources.get(source) {
        Some(held) => {
          removed.sources.insert(held.clone());
        },
        None => return Err(ValidationError::SourceDoesNotExist(source.ssrc)),
      }
    }
    for group in &set.groups {
      if existing.groups.contains(group) {
        removed.groups.insert(group.clone());
      }
      else {
        return Err(ValidationError::SourceGroupDoesNotExist(group.to_string()));
      }
    }

    let remaining = existing - &removed;
    self.validate_endpoint(endpoint, &remaining)?;

    self.map.remove_endpoint(endpoint);
    self.map.add_endpoint(endpoint, remaining);
    Ok(removed)
  }

  /// Drops everything the endpoint advertised, without invariant checks
  /// (an endpoint leaving cannot invalidate the others).
  pub fn remove_endpoint(&mut self, endpoint: &str) -> Option<EndpointSourceSet> {
    self.map.remove_endpoint(endpoint)
  }

  /// Checks the candidate state of one endpoint against the group and msid
  /// invariants. Violations are collected in one pass; the first by check
  /// order is returned.
  fn validate_endpoint(
    &self,
    endpoint: &str,
    candidate: &EndpointSourceSet,
  ) -> Result<(), ValidationError> {
    let mut violations: Vec<ValidationError> = Vec::new();

    for group in &candidate.groups {
      if group.semantics == Semantics::Fid && group.ssrcs.len() != 2 {
        violations.push(ValidationError::InvalidFidGroup(group.to_string()));
        continue;
      }
      let mut group_msid: Option<&str> = None;
      for ssrc in &group.ssrcs {
        match candidate.source_by_ssrc(*ssrc) {
          None => violations.push(ValidationError::MissingSourceForGroup(*ssrc)),
          Some(source) => match (&source.msid, group_msid) {
            (None, _) => violations.push(ValidationError::RequiredParameterMissing(*ssrc)),
            (Some(msid), None) => group_msid = Some(msid),
            (Some(msid), Some(first)) if msid != first => {
              violations.push(ValidationError::GroupMsidMismatch(group.to_string()));
            },
            _ => {},
          },
        }
      }
    }

    // Non-grouped sources of one media type must have distinct msids,
    // here and on every other endpoint.
    let grouped = candidate.grouped_ssrcs();
    let mut seen: HashMap<(MediaType, &str), u32> = HashMap::new();
    for source in &candidate.sources {
      if grouped.contains(&source.ssrc) {
        continue;
      }
      if let Some(msid) = &source.msid {
        if seen
          .insert((source.media_type, msid.as_str()), source.ssrc)
          .is_some()
        {
          violations.push(ValidationError::MsidConflict(msid.clone()));
        }
      }
    }
    for (other_endpoint, other_set) in self.map.iter() {
      if other_endpoint == endpoint {
        continue;
      }
      let other_grouped = other_set.grouped_ssrcs();
      for source in &other_set.sources {
        if other_grouped.contains(&source.ssrc) {
          continue;
        }
        if let Some(msid) = &source.msid {
          if seen.contains_key(&(source.media_type, msid.as_str())) {
            violations.push(ValidationError::MsidConflict(msid.clone()));
          }
        }
      }
    }

    match violations.into_iter().next() {
      Some(violation) => Err(violation),
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::{Source, SourceGroup};

  fn audio(ssrc: u32, msid: &str) -> Source {
    Source::new(ssrc, MediaType::Audio).with_msid(msid)
  }

  fn video(ssrc: u32, msid: &str) -> Source {
    Source::new(ssrc, MediaType::Video).with_msid(msid)
  }

  fn map() -> ValidatingSourceMap {
    ValidatingSourceMap::new(SourceLimits::default())
  }

  #[test]
  fn accepts_a_plain_endpoint_set() {
    let mut sources = map();
    let accepted = sources
      .try_add(
        "a",
        EndpointSourceSet::from_sources([audio(1, "a0"), video(2, "v0")]),
      )
      .unwrap();
    assert_eq!(accepted.sources.len(), 2);
    assert_eq!(sources.snapshot().get("a").unwrap().sources.len(), 2);
  }

  #[test]
  fn rejects_ssrc_zero() {
    let mut sources = map();
    assert_eq!(
      sources.try_add("a", EndpointSourceSet::from_sources([audio(0, "m")])),
      Err(ValidationError::InvalidSsrc(0))
    );
  }

  #[test]
  fn deduplicates_already_held_sources() {
    let mut sources = map();
    sources
      .try_add("a", EndpointSourceSet::from_sources([audio(1, "m")]))
      .unwrap();
    let accepted = sources
      .try_add(
        "a",
        EndpointSourceSet::from_sources([audio(1, "m"), audio(2, "m2")]),
      )
      .unwrap();
    let ssrcs: Vec<u32> = accepted.sources.iter().map(|s| s.ssrc).collect();
    assert_eq!(ssrcs, vec![2]);
  }

  #[test]
  fn rejects_ssrc_reuse_across_endpoints() {
    let mut sources = map();
    sources
      .try_add("a", EndpointSourceSet::from_sources([audio(1, "m")]))
      .unwrap();
    assert_eq!(
      sources.try_add("b", EndpointSourceSet::from_sources([audio(1, "m")])),
      Err(ValidationError::SsrcAlreadyUsed(1))
    );
  }

  #[test]
  fn rejects_ssrc_reuse_with_different_media_type() {
    let mut sources = map();
    sources
      .try_add("a", EndpointSourceSet::from_sources([audio(1, "m")]))
      .unwrap();
    assert_eq!(
      sources.try_add("a", EndpointSourceSet::from_sources([video(1, "m")])),
      Err(ValidationError::SsrcAlreadyUsed(1))
    );
  }

  #[test]
  fn rejects_one_batch_reusing_an_ssrc_across_media_types() {
    let mut sources = map();
    let set = EndpointSourceSet::from_sources([audio(5, "a0"), video(5, "v0")]);
    assert_eq!(
      sources.try_add("a", set),
      Err(ValidationError::SsrcAlreadyUsed(5))
    );
    // The failed add left nothing behind.
    assert!(sources.snapshot().is_empty());
  }

  #[test]
  fn rejects_fid_group_of_wrong_size() {
    let mut sources = map();
    let set = EndpointSourceSet::new(
      [video(1, "m"), video(2, "m"), video(3, "m")],
      [SourceGroup::new(Semantics::Fid, [1, 2, 3])],
    );
    assert!(matches!(
      sources.try_add("a", set),
      Err(ValidationError::InvalidFidGroup(_))
    ));
  }

  #[test]
  fn rejects_group_with_unknown_ssrc() {
    let mut sources = map();
    let set = EndpointSourceSet::new(
      [video(1, "m")],
      [SourceGroup::new(Semantics::Fid, [1, 99])],
    );
    assert_eq!(
      sources.try_add("a", set),
      Err(ValidationError::MissingSourceForGroup(99))
    );
  }

  #[test]
  fn rejects_group_with_msid_mismatch() {
    let mut sources = map();
    let set = EndpointSourceSet::new(
      [video(1, "m0"), video(2, "m1")],
      [SourceGroup::new(Semantics::Fid, [1, 2])],
    );
    assert!(matches!(
      sources.try_add("a", set),
      Err(ValidationError::GroupMsidMismatch(_))
    ));
  }

  #[test]
  fn rejects_grouped_source_without_msid() {
    let mut sources = map();
    let set = EndpointSourceSet::new(
      [Source::new(1, MediaType::Video), video(2, "m")],
      [SourceGroup::new(Semantics::Fid, [1, 2])],
    );
    assert_eq!(
      sources.try_add("a", set),
      Err(ValidationError::RequiredParameterMissing(1))
    );
  }

  #[test]
  fn rejects_msid_conflict_within_endpoint() {
    let mut sources = map();
    let set = EndpointSourceSet::from_sources([video(1, "m"), video(2, "m")]);
    assert_eq!(
      sources.try_add("a", set),
      Err(ValidationError::MsidConflict("m".to_owned()))
    );
  }

  #[test]
  fn rejects_msid_conflict_across_endpoints() {
    let mut sources = map();
    sources
      .try_add("a", EndpointSourceSet::from_sources([video(1, "m")]))
      .unwrap();
    assert_eq!(
      sources.try_add("b", EndpointSourceSet::from_sources([video(2, "m")])),
      Err(ValidationError::MsidConflict("m".to_owned()))
    );
  }

  #[test]
  fn audio_and_video_may_share_an_msid() {
    let mut sources = map();
    sources
      .try_add(
        "a",
        EndpointSourceSet::from_sources([audio(1, "m"), video(2, "m")]),
      )
      .unwrap();
  }

  #[test]
  fn sources_without_msid_never_conflict() {
    let mut sources = map();
    sources
      .try_add(
        "a",
        EndpointSourceSet::from_sources([
          Source::new(1, MediaType::Video),
          Source::new(2, MediaType::Video),
        ]),
      )
      .unwrap();
  }

  #[test]
  fn enforces_source_limit() {
    let mut sources = ValidatingSourceMap::new(SourceLimits {
      max_sources_per_endpoint: 2,
      max_groups_per_endpoint: 2,
    });
    sources
      .try_add(
        "a",
        EndpointSourceSet::from_sources([audio(1, "a0"), video(2, "v0")]),
      )
      .unwrap();
    assert_eq!(
      sources.try_add("a", EndpointSourceSet::from_sources([audio(3, "a1")])),
      Err(ValidationError::SsrcLimitExceeded { count: 3, limit: 2 })
    );
    // Nothing was mutated by the failed add.
    assert_eq!(sources.snapshot().get("a").unwrap().sources.len(), 2);
  }

  #[test]
  fn drops_empty_groups_on_add() {
    let mut sources = map();
    let accepted = sources
      .try_add(
        "a",
        EndpointSourceSet::new([video(1, "m")], [SourceGroup::new(Semantics::Sim, [])]),
      )
      .unwrap();
    assert!(accepted.groups.is_empty());
    assert!(sources.snapshot().get("a").unwrap().groups.is_empty());
  }

  #[test]
  fn add_then_remove_restores_previous_state() {
    let mut sources = map();
    sources
      .try_add("a", EndpointSourceSet::from_sources([audio(1, "a0")]))
      .unwrap();
    let before = sources.snapshot().clone();

    let set = EndpointSourceSet::new(
      [video(10, "v0"), video(11, "v0")],
      [SourceGroup::new(Semantics::Fid, [10, 11])],
    );
    sources.try_add("a", set.clone()).unwrap();
    sources.try_remove("a", &set).unwrap();
    assert_eq!(sources.snapshot(), &before);
  }

  #[test]
  fn remove_of_unknown_source_fails() {
    let mut sources = map();
    sources
      .try_add("a", EndpointSourceSet::from_sources([audio(1, "m")]))
      .unwrap();
    assert_eq!(
      sources.try_remove("a", &EndpointSourceSet::from_sources([audio(2, "m")])),
      Err(ValidationError::SourceDoesNotExist(2))
    );
  }

  #[test]
  fn remove_of_unknown_group_fails() {
    let mut sources = map();
    sources
      .try_add("a", EndpointSourceSet::from_sources([video(1, "m")]))
      .unwrap();
    let removal = EndpointSourceSet::new([], [SourceGroup::new(Semantics::Fid, [1, 2])]);
    assert!(matches!(
      sources.try_remove("a", &removal),
      Err(ValidationError::SourceGroupDoesNotExist(_))
    ));
  }

  #[test]
  fn remove_leaving_dangling_group_reference_fails() {
    let mut sources = map();
    let set = EndpointSourceSet::new(
      [video(1, "m"), video(2, "m")],
      [SourceGroup::new(Semantics::Fid, [1, 2])],
    );
    sources.try_add("a", set).unwrap();
    let result = sources.try_remove("a", &EndpointSourceSet::from_sources([video(2, "m")]));
    assert!(matches!(
      result,
      Err(ValidationError::MissingSourceForGroup(2) | ValidationError::MsidConflict(_))
    ));
    // Atomicity: failed removal left the map untouched.
    assert_eq!(sources.snapshot().get("a").unwrap().sources.len(), 2);
  }

  #[test]
  fn group_may_be_removed_without_its_sources() {
    let mut sources = map();
    let set = EndpointSourceSet::new(
      [audio(1, "m"), video(2, "m"), video(3, "m")],
      [SourceGroup::new(Semantics::Fid, [2, 3])],
    );
    sources.try_add("a", set).unwrap();
    // Removing the group alone leaves 2 and 3 non-grouped with the same
    // msid, which violates the msid invariant.
    let removal = EndpointSourceSet::new([], [SourceGroup::new(Semantics::Fid, [2, 3])]);
    assert!(sources.try_remove("a", &removal).is_err());

    // Removing the group together with one of its sources keeps the rest
    // valid.
    let removal = EndpointSourceSet::new(
      [video(3, "m")],
      [SourceGroup::new(Semantics::Fid, [2, 3])],
    );
    sources.try_remove("a", &removal).unwrap();
    assert_eq!(sources.snapshot().get("a").unwrap().sources.len(), 2);
  }

  #[test]
  fn removing_an_empty_set_is_a_no_op() {
    let mut sources = map();
    let removed = sources
      .try_remove("a", &EndpointSourceSet::default())
      .unwrap();
    assert!(removed.is_empty());
  }
}
