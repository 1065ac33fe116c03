//! Timeline assembly — per-target event and profile history.
//!
//! The [`TimelineLedger`] is append-only: events and profiles are recorded
//! with a global insertion sequence and never edited. Reading a timeline runs
//! it through [`TimelineAssembler::merge`], which orders by
//! `(timestamp, kind priority, insertion sequence)` and drops repeats of the
//! same `(target, kind, timestamp)`.
//!
//! The cross-target profile feed keeps only the most recent `feed_limit`
//! profiles; per-target histories are kept whole.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::model::{CascadeId, ClusterId, RiskProfile, RiskTarget, TimelineEvent, Timestamp};
use crate::population::PopulationSummary;

/// An event tagged with its insertion sequence.
#[derive(Clone, Debug, PartialEq)]
pub struct SequencedEvent {
    /// Global insertion order.
    pub seq: u64,
    /// The event.
    pub event: TimelineEvent,
}

/// Orders and deduplicates timeline events.
pub struct TimelineAssembler;

impl TimelineAssembler {
    /// Chronological, deduplicated event sequence.
    pub fn merge(events: impl IntoIterator<Item = SequencedEvent>) -> Vec<TimelineEvent> {
        let mut all: Vec<SequencedEvent> = events.into_iter().collect();
        all.sort_by(|a, b| {
            (a.event.timestamp, a.event.kind.priority(), a.seq).cmp(&(b.event.timestamp, b.event.kind.priority(), b.seq))
        });
        let mut seen: BTreeSet<(RiskTarget, &'static str, Timestamp)> = BTreeSet::new();
        all.into_iter()
            .filter(|s| seen.insert((s.event.target.clone(), s.event.kind.label(), s.event.timestamp)))
            .map(|s| s.event)
            .collect()
    }
}

/// Everything known about one target, ready for export.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RiskBundle {
    /// The cascade or cluster.
    pub target: RiskTarget,
    /// Most recent profile.
    pub latest: Option<RiskProfile>,
    /// Every profile, oldest first.
    pub history: Vec<RiskProfile>,
    /// Ordered timeline (a cascade's includes its associated clusters' events).
    pub events: Vec<TimelineEvent>,
    /// Content population, for cascades.
    pub population: Option<PopulationSummary>,
}

/// Append-only store of published events and profiles.
#[derive(Debug, Default)]
pub struct TimelineLedger {
    next_seq: u64,
    events: BTreeMap<RiskTarget, Vec<SequencedEvent>>,
    profiles: BTreeMap<RiskTarget, Vec<RiskProfile>>,
    feed: VecDeque<RiskProfile>,
    feed_limit: Option<usize>,
    associations: BTreeMap<CascadeId, BTreeSet<ClusterId>>,
}

impl TimelineLedger {
    /// Empty ledger with an unbounded feed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty ledger whose feed keeps at most `limit` profiles.
    pub fn with_feed_limit(limit: usize) -> Self {
        Self { feed_limit: Some(limit.max(1)), ..Self::default() }
    }

    /// Append an event.
    pub fn record_event(&mut self, event: TimelineEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.entry(event.target.clone()).or_default().push(SequencedEvent { seq, event });
    }

    /// Append a profile.
    pub fn record_profile(&mut self, profile: RiskProfile) {
        self.profiles.entry(profile.target.clone()).or_default().push(profile.clone());
        self.feed.push_back(profile);
        if let Some(limit) = self.feed_limit {
            while self.feed.len() > limit {
                self.feed.pop_front();
            }
        }
    }

    /// Remember that `cluster` acted on `cascade`.
    pub fn associate(&mut self, cascade: CascadeId, cluster: ClusterId) {
        self.associations.entry(cascade).or_default().insert(cluster);
    }

    /// True if anything was ever recorded for `target`.
    pub fn knows(&self, target: &RiskTarget) -> bool {
        self.events.contains_key(target) || self.profiles.contains_key(target)
    }

    /// Most recent profile of `target`.
    pub fn latest_profile(&self, target: &RiskTarget) -> Option<&RiskProfile> {
        self.profiles.get(target).and_then(|p| p.last())
    }

    /// Every profile of `target`, oldest first.
    pub fn profiles(&self, target: &RiskTarget) -> &[RiskProfile] {
        self.profiles.get(target).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Profiles generated strictly after `since`, in publication order.
    ///
    /// Profiles already dropped from a bounded feed are not returned.
    pub fn profiles_since(&self, since: Timestamp) -> Vec<RiskProfile> {
        // feed is appended in window order, so generation times are non-decreasing
        let start = self.feed.partition_point(|p| p.generated_at <= since);
        self.feed.range(start..).cloned().collect()
    }

    /// Merged timeline of `target` alone.
    pub fn timeline(&self, target: &RiskTarget) -> Vec<TimelineEvent> {
        TimelineAssembler::merge(self.events.get(target).into_iter().flatten().cloned())
    }

    /// Clusters associated with a cascade.
    pub fn clusters_of(&self, cascade: &CascadeId) -> impl Iterator<Item = &ClusterId> {
        self.associations.get(cascade).into_iter().flatten()
    }

    /// Profile history plus merged timeline. Cascade bundles include the
    /// events of associated clusters.
    pub fn bundle(&self, target: &RiskTarget, population: Option<PopulationSummary>) -> RiskBundle {
        let mut sources: Vec<RiskTarget> = vec![target.clone()];
        if let RiskTarget::Cascade(id) = target {
            sources.extend(self.clusters_of(id).map(|c| RiskTarget::Cluster(c.clone())));
        }
        let events = TimelineAssembler::merge(
            sources.iter().flat_map(|t| self.events.get(t).into_iter().flatten().cloned()),
        );
        let history = self.profiles(target).to_vec();
        RiskBundle { target: target.clone(), latest: history.last().cloned(), history, events, population }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CascadeState, FactorBreakdown, TimelineEventKind};
    use crate::window::WindowId;

    fn cascade() -> RiskTarget {
        RiskTarget::Cascade(CascadeId::new("c:r"))
    }

    fn ev(target: RiskTarget, kind: TimelineEventKind, ts: Timestamp) -> TimelineEvent {
        TimelineEvent { target, kind, timestamp: ts, summary: String::new() }
    }

    fn profile(score: f32, at: Timestamp) -> RiskProfile {
        RiskProfile {
            target: cascade(),
            score,
            factors: FactorBreakdown::default(),
            confidence: 0.5,
            window: WindowId(0),
            generated_at: at,
        }
    }

    #[test]
    fn test_merge_orders_by_time_then_priority() {
        let mut l = TimelineLedger::new();
        let crossing = TimelineEventKind::ScoreThresholdCrossed { threshold: 0.5, rising: true, score: 0.6 };
        let transition = TimelineEventKind::StateTransition { from: CascadeState::Emerging, to: CascadeState::Amplifying };
        l.record_event(ev(cascade(), crossing, 100));
        l.record_event(ev(cascade(), transition, 100));
        l.record_event(ev(cascade(), TimelineEventKind::ClusterFormed, 50));

        let labels: Vec<&str> = l.timeline(&cascade()).iter().map(|e| e.kind.label()).collect();
        assert_eq!(labels, vec!["cluster_formed", "state_transition", "score_threshold_crossed"]);
    }

    #[test]
    fn test_merge_deduplicates_same_kind_and_time() {
        let mut l = TimelineLedger::new();
        let mut first = ev(cascade(), TimelineEventKind::ClusterFormed, 10);
        first.summary = "first".into();
        l.record_event(first);
        l.record_event(ev(cascade(), TimelineEventKind::ClusterFormed, 10));
        let t = l.timeline(&cascade());
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].summary, "first");
    }

    #[test]
    fn test_profiles_since_is_strict() {
        let mut l = TimelineLedger::new();
        l.record_profile(profile(0.2, 100));
        l.record_profile(profile(0.4, 200));
        l.record_profile(profile(0.9, 300));
        let since: Vec<Timestamp> = l.profiles_since(200).iter().map(|p| p.generated_at).collect();
        assert_eq!(since, vec![300]);
        assert_eq!(l.latest_profile(&cascade()).map(|p| p.score), Some(0.9));
        assert_eq!(l.profiles_since(i64::MIN).len(), 3);
    }

    #[test]
    fn test_bounded_feed_drops_oldest_profiles() {
        let mut l = TimelineLedger::with_feed_limit(2);
        for (i, at) in [100, 200, 300].into_iter().enumerate() {
            l.record_profile(profile(0.1 * i as f32, at));
        }
        let feed: Vec<Timestamp> = l.profiles_since(i64::MIN).iter().map(|p| p.generated_at).collect();
        assert_eq!(feed, vec![200, 300]);
        // target history is untouched
        assert_eq!(l.profiles(&cascade()).len(), 3);
    }

    #[test]
    fn test_cascade_bundle_includes_cluster_events() {
        let mut l = TimelineLedger::new();
        let k = ClusterId::new("w1-abc");
        l.associate(CascadeId::new("c:r"), k.clone());
        l.record_event(ev(RiskTarget::Cluster(k), TimelineEventKind::ClusterFormed, 5));
        l.record_profile(profile(0.7, 10));
        let b = l.bundle(&cascade(), None);
        assert_eq!(b.events.len(), 1);
        assert_eq!(b.history.len(), 1);
        assert_eq!(b.latest.as_ref().map(|p| p.score), Some(0.7));
        assert!(l.knows(&cascade()));
    }
}
