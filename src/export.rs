//! CTI export — a STIX-like bundle of one target's risk picture.
//!
//! ```text
//! bundle
//!  ├─ x-narrative-risk-profile    one per published profile, oldest first
//!  ├─ x-narrative-timeline-event  one per timeline event, in timeline order
//!  └─ x-narrative-population      cascades only
//! ```
//!
//! Object identifiers are `<type>--<16 hex digits>`, an FNV-1a hash of the
//! target and the object's natural key, so re-exporting the same bundle yields
//! the same identifiers. Bundle ids hash the target and its latest profile.
//!
//! Requires the `serde` feature.

use std::collections::BTreeMap;

use crate::model::{RiskProfile, RiskTarget, TimelineEvent, TimelineEventKind, Timestamp};
use crate::population::{FormatCounts, PopulationSummary};
use crate::signature::fnv1a64;
use crate::timeline::RiskBundle;

/// STIX-like spec version stamped on every bundle.
pub const CTI_SPEC_VERSION: &str = "2.1";

fn object_id(kind: &str, parts: &[&[u8]]) -> String {
    format!("{kind}--{:016x}", fnv1a64(parts.iter().copied()))
}

fn target_ref(target: &RiskTarget) -> String {
    match target {
        RiskTarget::Cascade(id) => format!("cascade:{id}"),
        RiskTarget::Cluster(id) => format!("cluster:{id}"),
    }
}

/// A bundle of CTI objects about one target.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct CtiBundle {
    /// Always `"bundle"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Deterministic bundle id.
    pub id: String,
    /// Format version, [`CTI_SPEC_VERSION`].
    pub spec_version: String,
    /// Contained objects.
    pub objects: Vec<CtiObject>,
}

/// One CTI object.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum CtiObject {
    /// A risk profile.
    #[serde(rename = "x-narrative-risk-profile")]
    RiskProfile(RiskProfileRecord),
    /// A timeline event.
    #[serde(rename = "x-narrative-timeline-event")]
    TimelineEvent(TimelineEventRecord),
    /// A cascade content census.
    #[serde(rename = "x-narrative-population")]
    Population(PopulationRecord),
}

impl CtiObject {
    /// Object identifier.
    pub fn id(&self) -> &str {
        match self {
            CtiObject::RiskProfile(r) => &r.id,
            CtiObject::TimelineEvent(r) => &r.id,
            CtiObject::Population(r) => &r.id,
        }
    }
}

/// Serialisable [`RiskProfile`].
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct RiskProfileRecord {
    /// Object id.
    pub id: String,
    /// `cascade:<id>` or `cluster:<id>`.
    pub target_ref: String,
    /// Risk score [0, 1].
    pub score: f32,
    /// Confidence [0, 1].
    pub confidence: f32,
    /// Evidence window index.
    pub window: i64,
    /// Generation timestamp (ms).
    pub created: Timestamp,
    /// Raw factor values.
    pub factors: BTreeMap<String, f32>,
    /// Weighted contributions.
    pub contributions: BTreeMap<String, f32>,
}

impl From<&RiskProfile> for RiskProfileRecord {
    fn from(p: &RiskProfile) -> Self {
        let target_ref = target_ref(&p.target);
        let mut factors = BTreeMap::new();
        factors.insert("density".to_owned(), p.factors.density);
        factors.insert("synchrony".to_owned(), p.factors.synchrony);
        factors.insert("anomaly".to_owned(), p.factors.anomaly);
        Self {
            id: object_id("x-narrative-risk-profile", &[target_ref.as_bytes(), &p.generated_at.to_le_bytes()]),
            target_ref,
            score: p.score,
            confidence: p.confidence,
            window: p.window.0,
            created: p.generated_at,
            factors,
            contributions: p.factors.contributions.clone(),
        }
    }
}

/// Serialisable [`TimelineEvent`].
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct TimelineEventRecord {
    /// Object id.
    pub id: String,
    /// `cascade:<id>` or `cluster:<id>`.
    pub target_ref: String,
    /// Event label, e.g. `cluster_formed`.
    pub event_kind: String,
    /// When it happened (ms).
    pub timestamp: Timestamp,
    /// Human-readable summary.
    pub summary: String,
    /// Structured payload.
    pub detail: TimelineEventKind,
}

impl From<&TimelineEvent> for TimelineEventRecord {
    fn from(e: &TimelineEvent) -> Self {
        let target_ref = target_ref(&e.target);
        let label = e.kind.label();
        Self {
            id: object_id(
                "x-narrative-timeline-event",
                &[target_ref.as_bytes(), label.as_bytes(), &e.timestamp.to_le_bytes()],
            ),
            target_ref,
            event_kind: label.to_owned(),
            timestamp: e.timestamp,
            summary: e.summary.clone(),
            detail: e.kind.clone(),
        }
    }
}

/// Serialisable [`PopulationSummary`].
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct PopulationRecord {
    /// Object id.
    pub id: String,
    /// `cascade:<id>`.
    pub target_ref: String,
    /// Units counted.
    pub unit_count: u64,
    /// First unit timestamp.
    pub first_seen: Option<Timestamp>,
    /// Last unit timestamp.
    pub last_seen: Option<Timestamp>,
    /// Units per platform.
    pub platforms: BTreeMap<String, u64>,
    /// Units per format.
    pub formats: FormatCounts,
    /// Distinct landing pages.
    pub landing_pages: Vec<String>,
    /// Reported impressions.
    pub impressions_total: f64,
    /// Largest per-unit impression reports as `(unit id, impressions)`.
    pub impressions_detail: Vec<(String, f64)>,
    /// Key author ids.
    pub key_ids: Vec<String>,
    /// True when `key_ids` was capped.
    pub key_ids_truncated: bool,
    /// Units per claim label.
    pub claims: BTreeMap<String, u64>,
}

impl PopulationRecord {
    fn new(target: &RiskTarget, p: &PopulationSummary) -> Self {
        let target_ref = target_ref(target);
        Self {
            id: object_id("x-narrative-population", &[target_ref.as_bytes()]),
            target_ref,
            unit_count: p.unit_count,
            first_seen: p.first_unit.as_ref().map(|(_, t)| *t),
            last_seen: p.last_unit.as_ref().map(|(_, t)| *t),
            platforms: p.platforms.clone(),
            formats: p.formats.clone(),
            landing_pages: p.landing_pages.iter().cloned().collect(),
            impressions_total: p.impressions_total,
            impressions_detail: p.impressions_detail.iter().map(|(u, n)| (u.as_str().to_owned(), *n)).collect(),
            key_ids: p.key_ids.iter().map(|a| a.as_str().to_owned()).collect(),
            key_ids_truncated: p.key_ids_truncated,
            claims: p.claims.clone(),
        }
    }
}

impl CtiBundle {
    /// Export a [`RiskBundle`].
    pub fn from_risk_bundle(bundle: &RiskBundle) -> Self {
        let mut objects: Vec<CtiObject> = bundle
            .history
            .iter()
            .map(|p| CtiObject::RiskProfile(RiskProfileRecord::from(p)))
            .collect();
        objects.extend(bundle.events.iter().map(|e| CtiObject::TimelineEvent(TimelineEventRecord::from(e))));
        if let Some(pop) = &bundle.population {
            objects.push(CtiObject::Population(PopulationRecord::new(&bundle.target, pop)));
        }

        let target_ref = target_ref(&bundle.target);
        let latest = bundle.latest.as_ref().map_or(i64::MIN, |p| p.generated_at);
        Self {
            kind: "bundle".to_owned(),
            id: object_id("bundle", &[target_ref.as_bytes(), &latest.to_le_bytes()]),
            spec_version: CTI_SPEC_VERSION.to_owned(),
            objects,
        }
    }

    /// Number of contained objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Look up an object by id.
    pub fn find(&self, id: &str) -> Option<&CtiObject> {
        self.objects.iter().find(|o| o.id() == id)
    }

    /// Contained risk profiles.
    pub fn profiles(&self) -> impl Iterator<Item = &RiskProfileRecord> {
        self.objects.iter().filter_map(|o| match o {
            CtiObject::RiskProfile(r) => Some(r),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CascadeId, FactorBreakdown, TimelineEventKind};
    use crate::window::WindowId;

    fn sample() -> RiskBundle {
        let target = RiskTarget::Cascade(CascadeId::new("c:r"));
        let profile = RiskProfile {
            target: target.clone(),
            score: 0.82,
            factors: FactorBreakdown { density: 0.9, synchrony: 0.8, anomaly: 0.7, ..Default::default() },
            confidence: 0.6,
            window: WindowId(3),
            generated_at: 480_000,
        };
        let event = TimelineEvent {
            target: target.clone(),
            kind: TimelineEventKind::ScoreThresholdCrossed { threshold: 0.8, rising: true, score: 0.82 },
            timestamp: 480_000,
            summary: "score rose past 0.8".into(),
        };
        RiskBundle {
            target,
            latest: Some(profile.clone()),
            history: vec![profile],
            events: vec![event],
            population: Some(PopulationSummary::default()),
        }
    }

    #[test]
    fn test_bundle_layout_and_stable_ids() {
        let a = CtiBundle::from_risk_bundle(&sample());
        let b = CtiBundle::from_risk_bundle(&sample());
        assert_eq!(a, b);
        assert_eq!(a.kind, "bundle");
        assert_eq!(a.spec_version, CTI_SPEC_VERSION);
        assert_eq!(a.object_count(), 3);
        assert!(a.id.starts_with("bundle--"));
        assert!(matches!(a.objects[0], CtiObject::RiskProfile(_)));
        assert!(matches!(a.objects[2], CtiObject::Population(_)));

        let p = a.profiles().next().unwrap();
        assert_eq!(p.target_ref, "cascade:c:r");
        assert_eq!(p.factors.get("density"), Some(&0.9));
        assert!(a.find(&p.id).is_some());
        assert!(a.find("x-narrative-risk-profile--0000000000000000").is_none());
    }

    #[test]
    fn test_json_carries_type_tags() {
        let bundle = CtiBundle::from_risk_bundle(&sample());
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["type"], "bundle");
        assert_eq!(json["objects"][0]["type"], "x-narrative-risk-profile");
        assert_eq!(json["objects"][1]["type"], "x-narrative-timeline-event");
        assert_eq!(json["objects"][1]["event_kind"], "score_threshold_crossed");
        assert_eq!(json["objects"][1]["detail"]["type"], "score_threshold_crossed");
        assert_eq!(json["objects"][2]["type"], "x-narrative-population");

        let back: CtiBundle = serde_json::from_value(json).unwrap();
        assert_eq!(back, bundle);
    }
}
