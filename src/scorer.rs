/*
 * This source code is licensed under the Business Source License 1.1.
 */

//! Explainable risk scoring for cascades and clusters.
//!
//! ```text
//! score = w_d · density + w_s · synchrony + w_a · anomaly      (w_d + w_s + w_a = 1)
//! ```
//!
//! Every factor is clamped to `[0, 1]` before weighting and every weight is
//! non-negative, so the score is bounded and monotone non-decreasing in each
//! factor. The breakdown carries both the raw factor values and the weighted
//! contributions.
//!
//! # Factors
//!
//! - **density**: share of a cascade's window participants that sit in a
//!   coordination cluster.
//! - **synchrony**: `exp(−σ / scale)` where σ is the standard deviation of
//!   posting offsets from the latest preceding cascade milestone.
//! - **anomaly**: fingerprint deviation from the population baseline.
//!
//! Confidence grows with the number of actors and units behind the evidence
//! and saturates at 1.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ScorerConfigError;
use crate::model::{
    latest_milestone, ActorId, CascadeId, CoordinationCluster, FactorBreakdown, RiskProfile, RiskTarget, TimelineEvent,
    TimelineEventKind, Timestamp,
};
use crate::window::{SnapshotUnit, WindowSnapshot};

/// Tolerance on the weight sum.
const WEIGHT_TOLERANCE: f32 = 1e-6;

// ─── Configuration ───────────────────────────────────────────────────────────

/// Convex factor weights.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScoringWeights {
    /// Cluster density weight. Default 0.40.
    pub density: f32,
    /// Synchrony weight. Default 0.35.
    pub synchrony: f32,
    /// Anomaly weight. Default 0.25.
    pub anomaly: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self { density: 0.40, synchrony: 0.35, anomaly: 0.25 }
    }
}

impl ScoringWeights {
    /// Validated weights.
    pub fn new(density: f32, synchrony: f32, anomaly: f32) -> Result<Self, ScorerConfigError> {
        let w = Self { density, synchrony, anomaly };
        w.validate()?;
        Ok(w)
    }

    /// Reject negative, non-finite, or non-convex weights.
    pub fn validate(&self) -> Result<(), ScorerConfigError> {
        for (name, v) in [("density", self.density), ("synchrony", self.synchrony), ("anomaly", self.anomaly)] {
            if !v.is_finite() || v < 0.0 {
                return Err(ScorerConfigError::InvalidWeight(name));
            }
        }
        let sum = self.density + self.synchrony + self.anomaly;
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ScorerConfigError::NotConvex(sum));
        }
        Ok(())
    }
}

/// Scorer settings.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScorerConfig {
    /// Factor weights.
    pub weights: ScoringWeights,
    /// σ at which synchrony falls to 1/e. Default 5 min.
    pub synchrony_scale_ms: f64,
    /// |z| at which an anomaly feature saturates. Default 3.
    pub z_cap: f64,
    /// Actors at which the actor half of confidence reaches 63%. Default 10.
    pub actor_scale: f32,
    /// Units at which the unit half of confidence reaches 63%. Default 20.
    pub unit_scale: f32,
    /// Score thresholds whose crossings are timeline events. Default 0.5, 0.8.
    pub thresholds: Vec<f32>,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            synchrony_scale_ms: 300_000.0,
            z_cap: 3.0,
            actor_scale: 10.0,
            unit_scale: 20.0,
            thresholds: vec![0.5, 0.8],
        }
    }
}

/// Raw factor values, each expected in [0, 1].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RiskFactors {
    /// Cluster density.
    pub density: f32,
    /// Posting synchrony.
    pub synchrony: f32,
    /// Baseline anomaly.
    pub anomaly: f32,
}

/// Everything the scorer may look at for one closed window.
#[derive(Clone, Copy, Debug)]
pub struct WindowEvidence<'a> {
    /// Frozen window.
    pub snapshot: &'a WindowSnapshot,
    /// Clusters detected in the window.
    pub clusters: &'a [CoordinationCluster],
    /// Per-actor anomaly in [0, 1].
    pub anomaly: &'a BTreeMap<ActorId, f32>,
    /// Generation timestamp for the profiles.
    pub generated_at: Timestamp,
}

impl WindowEvidence<'_> {
    fn mean_anomaly<'b>(&self, actors: impl IntoIterator<Item = &'b ActorId>) -> f32 {
        let (sum, n) = actors
            .into_iter()
            .fold((0.0f32, 0usize), |(s, n), a| (s + self.anomaly.get(a).copied().unwrap_or(0.0), n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f32
        }
    }

    fn offsets<'b>(&self, units: impl IntoIterator<Item = &'b SnapshotUnit>) -> Vec<f64> {
        units
            .into_iter()
            .map(|u| {
                let anchor = self
                    .snapshot
                    .milestones
                    .get(&u.cascade)
                    .map_or(u.timestamp, |m| latest_milestone(m, u.timestamp));
                (u.timestamp - anchor) as f64
            })
            .collect()
    }
}

// ─── Scorer ──────────────────────────────────────────────────────────────────

/// Computes immutable [`RiskProfile`]s.
#[derive(Clone, Debug)]
pub struct RiskScorer {
    config: ScorerConfig,
}

impl RiskScorer {
    /// Scorer with validated weights.
    pub fn new(config: ScorerConfig) -> Result<Self, ScorerConfigError> {
        config.weights.validate()?;
        Ok(Self { config })
    }

    /// Settings in use.
    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Weighted score and its breakdown.
    pub fn combine(&self, f: RiskFactors) -> (f32, FactorBreakdown) {
        let unit = |x: f32| if x.is_finite() { x.clamp(0.0, 1.0) } else { 0.0 };
        let (d, s, a) = (unit(f.density), unit(f.synchrony), unit(f.anomaly));
        let w = &self.config.weights;
        let mut contributions = BTreeMap::new();
        contributions.insert("density".to_owned(), w.density * d);
        contributions.insert("synchrony".to_owned(), w.synchrony * s);
        contributions.insert("anomaly".to_owned(), w.anomaly * a);
        let score = (w.density * d + w.synchrony * s + w.anomaly * a).clamp(0.0, 1.0);
        (score, FactorBreakdown { density: d, synchrony: s, anomaly: a, contributions })
    }

    /// Saturating confidence from sample size.
    pub fn confidence(&self, actors: usize, units: usize) -> f32 {
        let sat = |n: usize, scale: f32| 1.0 - (-(n as f32) / scale.max(f32::EPSILON)).exp();
        (0.5 * sat(actors, self.config.actor_scale) + 0.5 * sat(units, self.config.unit_scale)).clamp(0.0, 1.0)
    }

    /// `exp(−σ / scale)` of the offsets; 0 with fewer than two offsets.
    pub fn synchrony(&self, offsets: &[f64]) -> f32 {
        if offsets.len() < 2 {
            return 0.0;
        }
        let n = offsets.len() as f64;
        let mean = offsets.iter().sum::<f64>() / n;
        let sigma = (offsets.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();
        (-sigma / self.config.synchrony_scale_ms.max(1.0)).exp() as f32
    }

    /// Profile of one cascade's activity in the window.
    pub fn score_cascade(&self, cascade: &CascadeId, ev: &WindowEvidence<'_>) -> RiskProfile {
        let participants = ev.snapshot.participants(cascade);
        let units: Vec<&SnapshotUnit> = ev.snapshot.units_in(cascade).collect();

        let clustered = participants
            .iter()
            .filter(|a| ev.clusters.iter().any(|c| c.members.contains(*a)))
            .count();
        let density = if participants.is_empty() { 0.0 } else { clustered as f32 / participants.len() as f32 };

        let (mut weighted, mut weight) = (0.0f32, 0usize);
        for cluster in ev.clusters.iter().filter(|c| c.cascades.contains(cascade)) {
            let member_units: Vec<&SnapshotUnit> =
                units.iter().copied().filter(|u| cluster.members.contains(&u.actor)).collect();
            weighted += self.synchrony(&ev.offsets(member_units.iter().copied())) * member_units.len() as f32;
            weight += member_units.len();
        }
        let synchrony = if weight == 0 { 0.0 } else { weighted / weight as f32 };

        let anomaly = ev.mean_anomaly(&participants);
        self.profile(
            RiskTarget::Cascade(cascade.clone()),
            RiskFactors { density, synchrony, anomaly },
            participants.len(),
            units.len(),
            ev,
        )
    }

    /// Profile of one cluster.
    pub fn score_cluster(&self, cluster: &CoordinationCluster, ev: &WindowEvidence<'_>) -> RiskProfile {
        let participants: BTreeSet<ActorId> =
            cluster.cascades.iter().flat_map(|c| ev.snapshot.participants(c)).collect();
        let density = if participants.is_empty() {
            0.0
        } else {
            cluster.members.iter().filter(|m| participants.contains(*m)).count() as f32 / participants.len() as f32
        };
        let units: Vec<&SnapshotUnit> =
            ev.snapshot.units.iter().filter(|u| cluster.members.contains(&u.actor)).collect();
        let synchrony = self.synchrony(&ev.offsets(units.iter().copied()));
        let anomaly = ev.mean_anomaly(&cluster.members);
        self.profile(
            RiskTarget::Cluster(cluster.id.clone()),
            RiskFactors { density, synchrony, anomaly },
            cluster.size(),
            units.len(),
            ev,
        )
    }

    /// Profiles of every touched cascade (id order) followed by every cluster.
    pub fn score_window(&self, ev: &WindowEvidence<'_>) -> Vec<RiskProfile> {
        let mut out: Vec<RiskProfile> = ev.snapshot.cascades().iter().map(|c| self.score_cascade(c, ev)).collect();
        out.extend(ev.clusters.iter().map(|c| self.score_cluster(c, ev)));
        out
    }

    fn profile(
        &self,
        target: RiskTarget,
        factors: RiskFactors,
        actors: usize,
        units: usize,
        ev: &WindowEvidence<'_>,
    ) -> RiskProfile {
        let (score, factors) = self.combine(factors);
        RiskProfile {
            target,
            score,
            factors,
            confidence: self.confidence(actors, units),
            window: ev.snapshot.span.id,
            generated_at: ev.generated_at,
        }
    }

    /// Threshold crossings between the target's previous score and `profile`.
    ///
    /// A target with no previous profile is treated as having scored 0.
    pub fn threshold_crossings(&self, previous: Option<f32>, profile: &RiskProfile) -> Vec<TimelineEvent> {
        let before = previous.unwrap_or(0.0);
        let after = profile.score;
        let mut thresholds = self.config.thresholds.clone();
        thresholds.sort_by(f32::total_cmp);
        if after < before {
            thresholds.reverse();
        }
        thresholds
            .into_iter()
            .filter_map(|t| {
                let rising = before < t && after >= t;
                let falling = before >= t && after < t;
                (rising || falling).then(|| TimelineEvent {
                    target: profile.target.clone(),
                    kind: TimelineEventKind::ScoreThresholdCrossed { threshold: t, rising, score: after },
                    timestamp: profile.generated_at,
                    summary: format!(
                        "score {} {t:.2}: {before:.3} -> {after:.3}",
                        if rising { "rose above" } else { "fell below" }
                    ),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterId, PropagationKind, UnitId};
    use crate::signature::ContentSignature;
    use crate::window::{WindowId, WindowSpan};

    fn scorer() -> RiskScorer {
        RiskScorer::new(ScorerConfig::default()).unwrap()
    }

    #[test]
    fn test_weights_must_be_convex() {
        assert!(ScoringWeights::new(0.4, 0.35, 0.25).is_ok());
        assert_eq!(ScoringWeights::new(0.5, 0.5, 0.5), Err(ScorerConfigError::NotConvex(1.5)));
        assert_eq!(ScoringWeights::new(-0.1, 0.6, 0.5), Err(ScorerConfigError::InvalidWeight("density")));
        let bad = ScorerConfig { weights: ScoringWeights { density: 1.0, synchrony: 1.0, anomaly: 0.0 }, ..Default::default() };
        assert!(RiskScorer::new(bad).is_err());
    }

    #[test]
    fn test_score_is_monotone_in_each_factor() {
        let s = scorer();
        let base = RiskFactors { density: 0.3, synchrony: 0.3, anomaly: 0.3 };
        let (b, _) = s.combine(base);
        for bump in [
            RiskFactors { density: 0.9, ..base },
            RiskFactors { synchrony: 0.9, ..base },
            RiskFactors { anomaly: 0.9, ..base },
        ] {
            assert!(s.combine(bump).0 >= b);
        }
    }

    #[test]
    fn test_score_bounded_and_explained() {
        let s = scorer();
        let (score, f) = s.combine(RiskFactors { density: 5.0, synchrony: f32::NAN, anomaly: -1.0 });
        assert!((0.0..=1.0).contains(&score));
        assert_eq!(f.synchrony, 0.0);
        let total: f32 = f.contributions.values().sum();
        assert!((total - score).abs() < 1e-6);
    }

    #[test]
    fn test_confidence_saturates() {
        let s = scorer();
        assert_eq!(s.confidence(0, 0), 0.0);
        assert!(s.confidence(5, 10) < s.confidence(50, 100));
        assert!(s.confidence(10_000, 10_000) <= 1.0);
    }

    #[test]
    fn test_synchrony_tight_vs_loose() {
        let s = scorer();
        assert!(s.synchrony(&[1_000.0, 1_500.0, 2_000.0]) > 0.99);
        assert!(s.synchrony(&[0.0, 600_000.0]) < 0.4);
        assert_eq!(s.synchrony(&[5.0]), 0.0);
    }

    #[test]
    fn test_threshold_crossings_both_directions() {
        let s = scorer();
        let mut p = RiskProfile {
            target: RiskTarget::Cascade(CascadeId::new("c:x")),
            score: 0.85,
            factors: FactorBreakdown::default(),
            confidence: 1.0,
            window: WindowId(0),
            generated_at: 10,
        };
        let up = s.threshold_crossings(None, &p);
        assert_eq!(up.len(), 2);
        assert!(matches!(up[0].kind, TimelineEventKind::ScoreThresholdCrossed { threshold, rising: true, .. } if threshold == 0.5));

        p.score = 0.6;
        let down = s.threshold_crossings(Some(0.85), &p);
        assert_eq!(down.len(), 1);
        assert!(matches!(down[0].kind, TimelineEventKind::ScoreThresholdCrossed { rising: false, .. }));
        assert!(s.threshold_crossings(Some(0.6), &p).is_empty());
    }

    #[test]
    fn test_cascade_density_counts_clustered_participants() {
        let cascade = CascadeId::new("c:r");
        let unit = |id: &str, actor: &str, ts: i64| SnapshotUnit {
            id: UnitId::new(id),
            actor: ActorId::new(actor),
            cascade: cascade.clone(),
            timestamp: ts,
            signature: ContentSignature::new(vec![1.0]),
            parent_actor: None,
            relation: PropagationKind::Share,
        };
        let mut snap = WindowSnapshot::empty(WindowSpan { id: WindowId(0), start: 0, end: 120_000 });
        snap.units = vec![unit("r", "seed", 0), unit("1", "a", 1_000), unit("2", "b", 1_200), unit("3", "c", 90_000)];
        snap.milestones.insert(cascade.clone(), vec![0]);
        let cluster = CoordinationCluster {
            id: ClusterId::new("k"),
            window: WindowId(0),
            members: ["a", "b"].iter().map(|s| ActorId::new(*s)).collect(),
            similarity: 0.99,
            density: 1.0,
            cascades: [cascade.clone()].into_iter().collect(),
            predecessors: vec![],
        };
        let anomaly = BTreeMap::new();
        let clusters = [cluster];
        let ev = WindowEvidence { snapshot: &snap, clusters: &clusters, anomaly: &anomaly, generated_at: 120_000 };

        let p = scorer().score_cascade(&cascade, &ev);
        assert!((p.factors.density - 0.5).abs() < 1e-6);
        assert!(p.factors.synchrony > 0.99);
        assert_eq!(p.generated_at, 120_000);

        let all = scorer().score_window(&ev);
        assert_eq!(all.len(), 2);
        assert!(matches!(all[1].target, RiskTarget::Cluster(_)));
    }
}
