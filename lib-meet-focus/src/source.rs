use std::{
  collections::{HashMap, HashSet},
  fmt,
  hash::{Hash, Hasher},
  ops::{Add, AddAssign, Sub, SubAssign},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
  Audio,
  Video,
  Application,
}

impl fmt::Display for MediaType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MediaType::Audio => write!(f, "audio"),
      MediaType::Video => write!(f, "video"),
      MediaType::Application => write!(f, "application"),
    }
  }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoType {
  Camera,
  Desktop,
}

/// One logical media stream, identified on the wire by its ssrc.
///
/// Two sources are equal iff their ssrc and media type are equal; the
/// remaining fields are descriptive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
  pub ssrc: u32,
  pub media_type: MediaType,
  pub name: Option<String>,
  pub msid: Option<String>,
  pub video_type: Option<VideoType>,
}

impl Source {
  pub fn new(ssrc: u32, media_type: MediaType) -> Self {
    Self {
      ssrc,
      media_type,
      name: None,
      msid: None,
      video_type: None,
    }
  }

  pub fn with_msid(mut self, msid: impl Into<String>) -> Self {
    self.msid = Some(msid.into());
    self
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_video_type(mut self, video_type: VideoType) -> Self {
    self.video_type = Some(video_type);
    self
  }
}

impl PartialEq for Source {
  fn eq(&self, other: &Self) -> bool {
    self.ssrc == other.ssrc && self.media_type == other.media_type
  }
}

impl Eq for Source {}

impl Hash for Source {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.ssrc.hash(state);
    self.media_type.hash(state);
  }
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum Semantics {
  #[serde(rename = "SIM")]
  Sim,
  #[serde(rename = "FID")]
  Fid,
  #[serde(rename = "FEC-FR")]
  FecFr,
}

impl fmt::Display for Semantics {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Semantics::Sim => write!(f, "SIM"),
      Semantics::Fid => write!(f, "FID"),
      Semantics::FecFr => write!(f, "FEC-FR"),
    }
  }
}

/// A group tying several ssrcs together (simulcast layers, RTX pairing,
/// forward error correction). Order of the ssrcs is significant: the first
/// ssrc of a SIM group is the primary layer.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceGroup {
  pub semantics: Semantics,
  pub ssrcs: Vec<u32>,
}

impl SourceGroup {
  pub fn new(semantics: Semantics, ssrcs: impl IntoIterator<Item = u32>) -> Self {
    Self {
      semantics,
      ssrcs: ssrcs.into_iter().collect(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.ssrcs.is_empty()
  }
}

impl fmt::Display for SourceGroup {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{:?}", self.semantics, self.ssrcs)
  }
}

/// All sources and groups advertised by a single endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSourceSet {
  pub sources: HashSet<Source>,
  pub groups: HashSet<SourceGroup>,
}

impl EndpointSourceSet {
  pub fn new(
    sources: impl IntoIterator<Item = Source>,
    groups: impl IntoIterator<Item = SourceGroup>,
  ) -> Self {
    Self {
      sources: sources.into_iter().collect(),
      groups: groups.into_iter().collect(),
    }
  }

  pub fn from_sources(sources: impl IntoIterator<Item = Source>) -> Self {
    Self::new(sources, [])
  }

  pub fn is_empty(&self) -> bool {
    self.sources.is_empty() && self.groups.is_empty()
  }

  pub fn source_by_ssrc(&self, ssrc: u32) -> Option<&Source> {
    self.sources.iter().find(|s| s.ssrc == ssrc)
  }

  /// The ssrcs grouped by at least one group in this set.
  pub fn grouped_ssrcs(&self) -> HashSet<u32> {
    self
      .groups
      .iter()
      .flat_map(|g| g.ssrcs.iter().copied())
      .collect()
  }

  pub fn has_media_type(&self, media_type: MediaType) -> bool {
    self.sources.iter().any(|s| s.media_type == media_type)
  }

  /// Removes all SIM groups, keeping only the primary layer of each
  /// simulcast ladder together with its paired RTX source (if any).
  /// Idempotent: a set without SIM groups is returned unchanged.
  pub fn strip_simulcast(&self) -> Self {
    if !self.groups.iter().any(|g| g.semantics == Semantics::Sim) {
      return self.clone();
    }

    let mut primaries: HashSet<u32> = HashSet::new();
    let mut stripped: HashSet<u32> = HashSet::new();
    for group in &self.groups {
      if group.semantics == Semantics::Sim {
        primaries.extend(group.ssrcs.first().copied());
        stripped.extend(group.ssrcs.iter().skip(1).copied());
      }
    }

    // A non-SIM group referencing a stripped layer goes away together with
    // the partner sources it introduced.
    let (kept_groups, dropped_groups): (HashSet<SourceGroup>, HashSet<SourceGroup>) = self
      .groups
      .iter()
      .filter(|g| g.semantics != Semantics::Sim)
      .cloned()
      .partition(|g| !g.ssrcs.iter().any(|ssrc| stripped.contains(ssrc)));
    let kept_ssrcs: HashSet<u32> = kept_groups
      .iter()
      .flat_map(|g| g.ssrcs.iter().copied())
      .collect();

    let mut removed = stripped;
    for group in &dropped_groups {
      removed.extend(
        group
          .ssrcs
          .iter()
          .copied()
          .filter(|ssrc| !primaries.contains(ssrc) && !kept_ssrcs.contains(ssrc)),
      );
    }

    let sources = self
      .sources
      .iter()
      .filter(|s| !removed.contains(&s.ssrc))
      .cloned()
      .collect();
    Self {
      sources,
      groups: kept_groups,
    }
  }
}

impl Add for EndpointSourceSet {
  type Output = EndpointSourceSet;

  fn add(mut self, rhs: EndpointSourceSet) -> EndpointSourceSet {
    self += rhs;
    self
  }
}

impl AddAssign for EndpointSourceSet {
  fn add_assign(&mut self, rhs: EndpointSourceSet) {
    for source in rhs.sources {
      self.sources.replace(source);
    }
    self.groups.extend(rhs.groups);
  }
}

impl Sub<&EndpointSourceSet> for EndpointSourceSet {
  type Output = EndpointSourceSet;

  fn sub(mut self, rhs: &EndpointSourceSet) -> EndpointSourceSet {
    self -= rhs;
    self
  }
}

impl SubAssign<&EndpointSourceSet> for EndpointSourceSet {
  fn sub_assign(&mut self, rhs: &EndpointSourceSet) {
    for source in &rhs.sources {
      self.sources.remove(source);
    }
    for group in &rhs.groups {
      self.groups.remove(group);
    }
  }
}

impl FromIterator<Source> for EndpointSourceSet {
  fn from_iter<I: IntoIterator<Item = Source>>(iter: I) -> Self {
    Self::from_sources(iter)
  }
}

/// All media advertised in a conference, keyed by endpoint id.
///
/// The map itself enforces nothing; [`crate::validation::ValidatingSourceMap`]
/// is the mutation path that upholds the conference invariants.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConferenceSourceMap(HashMap<String, EndpointSourceSet>);

impl ConferenceSourceMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_endpoint(endpoint: impl Into<String>, set: EndpointSourceSet) -> Self {
    let mut map = Self::new();
    map.add_endpoint(endpoint, set);
    map
  }

  pub fn add_endpoint(&mut self, endpoint: impl Into<String>, set: EndpointSourceSet) {
    if set.is_empty() {
      return;
    }
    *self.0.entry(endpoint.into()).or_default() += set;
  }

  pub fn remove_endpoint(&mut self, endpoint: &str) -> Option<EndpointSourceSet> {
    self.0.remove(endpoint)
  }

  pub fn get(&self, endpoint: &str) -> Option<&EndpointSourceSet> {
    self.0.get(endpoint)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &EndpointSourceSet)> {
    self.0.iter()
  }

  pub fn endpoints(&self) -> impl Iterator<Item = &String> {
    self.0.keys()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Total number of sources across all endpoints.
  pub fn source_count(&self) -> usize {
    self.0.values().map(|set| set.sources.len()).sum()
  }

  /// A copy of this map without the named endpoint.
  pub fn without(&self, endpoint: &str) -> Self {
    let mut copy = self.clone();
    copy.0.remove(endpoint);
    copy
  }

  pub fn strip_simulcast(&self) -> Self {
    Self(
      self
        .0
        .iter()
        .map(|(endpoint, set)| (endpoint.clone(), set.strip_simulcast()))
        .collect(),
    )
  }

  /// Retains only sources satisfying the predicate, dropping groups that
  /// lose a member and endpoints that end up empty.
  pub fn retain_sources(&mut self, mut keep: impl FnMut(&str, &Source) -> bool) {
    for (endpoint, set) in self.0.iter_mut() {
      set.sources.retain(|source| keep(endpoint, source));
      let remaining: HashSet<u32> = set.sources.iter().map(|s| s.ssrc).collect();
      set
        .groups
        .retain(|group| group.ssrcs.iter().all(|ssrc| remaining.contains(ssrc)));
    }
    self.0.retain(|_, set| !set.is_empty());
  }
}

impl Add for ConferenceSourceMap {
  type Output = ConferenceSourceMap;

  fn add(mut self, rhs: ConferenceSourceMap) -> ConferenceSourceMap {
    self += rhs;
    self
  }
}

impl AddAssign for ConferenceSourceMap {
  fn add_assign(&mut self, rhs: ConferenceSourceMap) {
    for (endpoint, set) in rhs.0 {
      self.add_endpoint(endpoint, set);
    }
  }
}

impl Sub<&ConferenceSourceMap> for ConferenceSourceMap {
  type Output = ConferenceSourceMap;

  fn sub(mut self, rhs: &ConferenceSourceMap) -> ConferenceSourceMap {
    self -= rhs;
    self
  }
}

impl SubAssign<&ConferenceSourceMap> for ConferenceSourceMap {
  fn sub_assign(&mut self, rhs: &ConferenceSourceMap) {
    for (endpoint, set) in &rhs.0 {
      if let Some(existing) = self.0.get_mut(endpoint) {
        *existing -= set;
        if existing.is_empty() {
          self.0.remove(endpoint);
        }
      }
    }
  }
}

impl fmt::Display for ConferenceSourceMap {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let entries = self.0.iter().map(|(endpoint, set)| {
      let mut ssrcs: Vec<u32> = set.sources.iter().map(|s| s.ssrc).collect();
      ssrcs.sort_unstable();
      format!("{}:{:?}", endpoint, ssrcs)
    });
    write!(f, "{}", itertools::join(entries, ", "))
  }
}

impl FromIterator<(String, EndpointSourceSet)> for ConferenceSourceMap {
  fn from_iter<I: IntoIterator<Item = (String, EndpointSourceSet)>>(iter: I) -> Self {
    let mut map = Self::new();
    for (endpoint, set) in iter {
      map.add_endpoint(endpoint, set);
    }
    map
  }
}
