use std::collections::{HashMap, HashSet};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{config::BridgeOptions, messages::BridgeStatusReport};

/// A media bridge known to the focus, as described by its status reports.
#[derive(Debug, Clone)]
pub struct Bridge {
  pub jid: String,
  pub region: Option<String>,
  pub version: Option<String>,
  pub relay_id: Option<String>,
  pub stress: f64,
  pub features: HashSet<String>,
  pub last_report: Instant,
  pub failing_until: Option<Instant>,
}

impl Bridge {
  pub fn is_failing(&self, now: Instant) -> bool {
    self.failing_until.map(|until| now < until).unwrap_or(false)
  }

  fn is_lost(&self, now: Instant, lost_timeout: std::time::Duration) -> bool {
    now.saturating_duration_since(self.last_report) > lost_timeout
  }

  /// Stress in hundredths, the comparison precision for selection.
  fn stress_level(&self) -> i64 {
    (self.stress * 100.0).round() as i64
  }
}

/// Tracks every bridge the focus has heard from. Bridges that stop
/// reporting are dropped; bridges that fail an allocation sit out a
/// failure-reset window.
#[derive(Debug)]
pub struct BridgeRegistry {
  bridges: HashMap<String, Bridge>,
  options: BridgeOptions,
  empty_since: Option<Instant>,
}

impl BridgeRegistry {
  pub fn new(options: BridgeOptions) -> Self {
    Self {
      bridges: HashMap::new(),
      options,
      empty_since: Some(Instant::now()),
    }
  }

  pub fn handle_report(&mut self, report: BridgeStatusReport) {
    let now = Instant::now();
    let jid = report.jid.clone();
    let entry = self.bridges.entry(jid.clone()).or_insert_with(|| {
      info!(bridge = %jid, "discovered bridge");
      Bridge {
        jid,
        region: None,
        version: None,
        relay_id: None,
        stress: 0.0,
        features: HashSet::new(),
        last_report: now,
        failing_until: None,
      }
    });
    entry.stress = report.stress.clamp(0.0, 1.0);
    entry.region = report.region;
    entry.version = report.version;
    entry.relay_id = report.relay_id;
    entry.features = report.features;
    entry.last_report = now;
    self.empty_since = None;
  }

  /// Marks a bridge ineligible until the failure-reset window elapses.
  pub fn mark_failing(&mut self, jid: &str) {
    if let Some(bridge) = self.bridges.get_mut(jid) {
      warn!(bridge = %jid, "marking bridge as failing");
      bridge.failing_until = Some(Instant::now() + self.options.failure_reset_threshold);
    }
  }

  /// Drops bridges that have stopped reporting.
  pub fn prune(&mut self) {
    let now = Instant::now();
    let lost_timeout = self.options.lost_timeout;
    self.bridges.retain(|jid, bridge| {
      let lost = bridge.is_lost(now, lost_timeout);
      if lost {
        info!(bridge = %jid, "removing bridge, no report within the lost timeout");
      }
      !lost
    });
    if self.bridges.is_empty() && self.empty_since.is_none() {
      self.empty_since = Some(now);
    }
  }

  pub fn get(&self, jid: &str) -> Option<&Bridge> {
    self.bridges.get(jid)
  }

  pub fn len(&self) -> usize {
    self.bridges.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bridges.is_empty()
  }

  /// How long the registry has been empty, if it is.
  pub fn empty_duration(&self) -> Option<std::time::Duration> {
    if self.bridges.is_empty() {
      self.empty_since.map(|since| since.elapsed())
    }
    else {
      None
    }
  }

  /// Bridges eligible for new allocations right now.
  pub fn operational(&self) -> Vec<&Bridge> {
    let now = Instant::now();
    self
      .bridges
      .values()
      .filter(|bridge| !bridge.is_failing(now) && !bridge.is_lost(now, self.options.lost_timeout))
      .collect()
  }

  pub fn high_stress_threshold(&self) -> f64 {
    self.options.high_stress_threshold
  }
}

/// Everything the selector looks at. Pure: the same input always yields the
/// same bridge.
#[derive(Debug, Clone, Copy)]
pub struct SelectionInput<'a> {
  /// Participant counts per bridge already carrying this conference.
  pub conference_bridges: &'a HashMap<String, usize>,
  pub participant_region: Option<&'a str>,
  /// Version every bridge in this conference must run: a pinned version, or
  /// the version of the first bridge selected.
  pub version_constraint: Option<&'a str>,
  pub required_features: Option<&'a HashSet<String>>,
  pub high_stress_threshold: f64,
}

/// Picks a bridge for a new participant.
///
/// Pass 1 keeps only version-compatible, feature-complete candidates (the
/// caller already excluded failing and lost bridges). Pass 2 prefers a
/// bridge this conference is on when it is not overstressed, then the least
/// stressed bridge in the participant's region, then the least stressed
/// bridge overall. Stress ties within 0.01 break on region match, then jid
/// order.
pub fn select_bridge<'a>(candidates: &[&'a Bridge], input: SelectionInput<'_>) -> Option<&'a Bridge> {
  let eligible: Vec<&Bridge> = candidates
    .iter()
    .copied()
    .filter(|bridge| match input.version_constraint {
      Some(version) => bridge.version.as_deref() == Some(version),
      None => true,
    })
    .filter(|bridge| match input.required_features {
      Some(required) => required.iter().all(|feature| bridge.features.contains(feature)),
      None => true,
    })
    .collect();

  let region_match =
    |bridge: &Bridge| bridge.region.as_deref() == input.participant_region && input.participant_region.is_some();
  let rank = |bridge: &&Bridge| {
    (
      bridge.stress_level(),
      if region_match(bridge) { 0 } else { 1 },
      bridge.jid.clone(),
    )
  };

  let in_conference = eligible
    .iter()
    .copied()
    .filter(|bridge| input.conference_bridges.contains_key(&bridge.jid))
    .filter(|bridge| bridge.stress < input.high_stress_threshold)
    .min_by_key(rank);
  if let Some(bridge) = in_conference {
    debug!(bridge = %bridge.jid, "selected a bridge already in the conference");
    return Some(bridge);
  }

  let in_region = eligible
    .iter()
    .copied()
    .filter(|bridge| region_match(bridge))
    .min_by_key(rank);
  if let Some(bridge) = in_region {
    return Some(bridge);
  }

  eligible.into_iter().min_by_key(|bridge| rank(&bridge))
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use maplit::hashmap;

  use super::*;

  fn report(jid: &str, stress: f64, region: &str) -> BridgeStatusReport {
    BridgeStatusReport {
      jid: jid.to_owned(),
      stress,
      region: Some(region.to_owned()),
      version: Some("2.1".to_owned()),
      relay_id: None,
      features: HashSet::new(),
    }
  }

  fn registry() -> BridgeRegistry {
    BridgeRegistry::new(BridgeOptions::default())
  }

  #[tokio::test(start_paused = true)]
  async fn reports_create_and_update_bridges() {
    let mut bridges = registry();
    bridges.handle_report(report("jvb-a@example.com", 0.1, "us-east"));
    bridges.handle_report(report("jvb-a@example.com", 0.4, "us-east"));
    assert_eq!(bridges.len(), 1);
    assert_eq!(bridges.get("jvb-a@example.com").unwrap().stress, 0.4);
  }

  #[tokio::test(start_paused = true)]
  async fn silent_bridges_are_pruned() {
    let mut bridges = registry();
    bridges.handle_report(report("jvb-a@example.com", 0.1, "us-east"));
    tokio::time::advance(Duration::from_secs(91)).await;
    bridges.prune();
    assert!(bridges.is_empty());
    assert!(bridges.empty_duration().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn failing_bridges_recover_after_the_reset_window() {
    let mut bridges = registry();
    bridges.handle_report(report("jvb-a@example.com", 0.1, "us-east"));
    bridges.mark_failing("jvb-a@example.com");
    assert!(bridges.operational().is_empty());
    tokio::time::advance(Duration::from_secs(61)).await;
    // Keep the bridge from also going lost while time advances.
    bridges.handle_report(report("jvb-a@example.com", 0.1, "us-east"));
    assert_eq!(bridges.operational().len(), 1);
  }

  fn bridge(jid: &str, stress: f64, region: &str) -> Bridge {
    Bridge {
      jid: jid.to_owned(),
      region: Some(region.to_owned()),
      version: Some("2.1".to_owned()),
      relay_id: None,
      stress,
      features: HashSet::new(),
      last_report: Instant::now(),
      failing_until: None,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn prefers_region_match_over_global_stress() {
    let a = bridge("a@example.com", 0.1, "rA");
    let b = bridge("b@example.com", 0.3, "rB");
    let c = bridge("c@example.com", 0.8, "rC");
    let empty = HashMap::new();
    let selected = select_bridge(
      &[&a, &b, &c],
      SelectionInput {
        conference_bridges: &empty,
        participant_region: Some("rC"),
        version_constraint: None,
        required_features: None,
        high_stress_threshold: 0.9,
      },
    )
    .unwrap();
    assert_eq!(selected.jid, "c@example.com");
  }

  #[tokio::test(start_paused = true)]
  async fn falls_back_to_lowest_stress_when_region_bridge_is_gone() {
    let a = bridge("a@example.com", 0.1, "rA");
    let b = bridge("b@example.com", 0.3, "rB");
    let empty = HashMap::new();
    let selected = select_bridge(
      &[&a, &b],
      SelectionInput {
        conference_bridges: &empty,
        participant_region: Some("rC"),
        version_constraint: None,
        required_features: None,
        high_stress_threshold: 0.9,
      },
    )
    .unwrap();
    assert_eq!(selected.jid, "a@example.com");
  }

  #[tokio::test(start_paused = true)]
  async fn prefers_a_conference_bridge_below_the_stress_threshold() {
    let a = bridge("a@example.com", 0.1, "rA");
    let b = bridge("b@example.com", 0.5, "rB");
    let load = hashmap! { "b@example.com".to_owned() => 3 };
    let selected = select_bridge(
      &[&a, &b],
      SelectionInput {
        conference_bridges: &load,
        participant_region: None,
        version_constraint: None,
        required_features: None,
        high_stress_threshold: 0.8,
      },
    )
    .unwrap();
    assert_eq!(selected.jid, "b@example.com");
  }

  #[tokio::test(start_paused = true)]
  async fn overstressed_conference_bridge_is_passed_over() {
    let a = bridge("a@example.com", 0.1, "rA");
    let b = bridge("b@example.com", 0.9, "rB");
    let load = hashmap! { "b@example.com".to_owned() => 3 };
    let selected = select_bridge(
      &[&a, &b],
      SelectionInput {
        conference_bridges: &load,
        participant_region: None,
        version_constraint: None,
        required_features: None,
        high_stress_threshold: 0.8,
      },
    )
    .unwrap();
    assert_eq!(selected.jid, "a@example.com");
  }

  #[tokio::test(start_paused = true)]
  async fn version_constraint_is_a_hard_filter() {
    let mut a = bridge("a@example.com", 0.1, "rA");
    a.version = Some("2.0".to_owned());
    let b = bridge("b@example.com", 0.9, "rB");
    let empty = HashMap::new();
    let selected = select_bridge(
      &[&a, &b],
      SelectionInput {
        conference_bridges: &empty,
        participant_region: None,
        version_constraint: Some("2.1"),
        required_features: None,
        high_stress_threshold: 0.8,
      },
    )
    .unwrap();
    assert_eq!(selected.jid, "b@example.com");

    let none = select_bridge(
      &[&a],
      SelectionInput {
        conference_bridges: &empty,
        participant_region: None,
        version_constraint: Some("2.1"),
        required_features: None,
        high_stress_threshold: 0.8,
      },
    );
    assert!(none.is_none());
  }

  #[tokio::test(start_paused = true)]
  async fn stress_ties_break_on_region_then_jid() {
    let a = bridge("a@example.com", 0.304, "rA");
    let b = bridge("b@example.com", 0.301, "rB");
    let empty = HashMap::new();
    // Within 0.01 the stresses tie; region match wins.
    let selected = select_bridge(
      &[&a, &b],
      SelectionInput {
        conference_bridges: &empty,
        participant_region: Some("rA"),
        version_constraint: None,
        required_features: None,
        high_stress_threshold: 0.9,
      },
    )
    .unwrap();
    assert_eq!(selected.jid, "a@example.com");

    // No region preference: jid order decides.
    let selected = select_bridge(
      &[&b, &a],
      SelectionInput {
        conference_bridges: &empty,
        participant_region: None,
        version_constraint: None,
        required_features: None,
        high_stress_threshold: 0.9,
      },
    )
    .unwrap();
    assert_eq!(selected.jid, "a@example.com");
  }

  #[tokio::test(start_paused = true)]
  async fn selector_is_deterministic() {
    let a = bridge("a@example.com", 0.5, "rA");
    let b = bridge("b@example.com", 0.5, "rB");
    let c = bridge("c@example.com", 0.5, "rC");
    let empty = HashMap::new();
    let input = SelectionInput {
      conference_bridges: &empty,
      participant_region: Some("rB"),
      version_constraint: None,
      required_features: None,
      high_stress_threshold: 0.9,
    };
    let first = select_bridge(&[&a, &b, &c], input).unwrap().jid.clone();
    for _ in 0..10 {
      assert_eq!(select_bridge(&[&c, &a, &b], input).unwrap().jid, first);
    }
  }
}
