//! Object model — actors, narrative units, cascades, clusters, profiles, events.
//!
//! Pure data. Behaviour lives in the component modules; the few methods here
//! only maintain the invariants of the struct they sit on.
//!
//! # Invariants
//!
//! - Every [`NarrativeUnit`] belongs to exactly one [`Cascade`].
//! - A cascade's arrival history is strictly ordered by bucket.
//! - A [`CoordinationCluster`] has at least two members, all active in its window.
//! - A [`RiskProfile`] is never mutated; every recomputation is a new value.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::cascade::TrackerState;
use crate::fingerprint::Fingerprint;
use crate::population::PopulationSummary;
use crate::signature::ContentSignature;
use crate::window::WindowId;

/// Unix time in milliseconds.
pub type Timestamp = i64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(transparent))]
        pub struct $name(pub String);

        impl $name {
            /// Build an identifier from anything string-like.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier text.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Stable account identifier as reported by the normalizer.
    ActorId
);
string_id!(
    /// Narrative unit (post, article, comment) identifier.
    UnitId
);
string_id!(
    /// Cascade identifier, derived from the root unit: `c:<root-unit-id>`.
    CascadeId
);
string_id!(
    /// Coordination cluster identifier: `w<window>-<member digest>`.
    ClusterId
);

impl CascadeId {
    /// The identifier of the cascade rooted at `root`.
    pub fn for_root(root: &UnitId) -> Self {
        Self(format!("c:{}", root.0))
    }
}

// ─── Ingestion input ─────────────────────────────────────────────────────────

/// How a child unit propagates its parent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PropagationKind {
    /// Plain share / link post.
    #[default]
    Share,
    /// Quote with commentary.
    Quote,
    /// Native repost / retweet / crosspost.
    Repost,
    /// Reply or comment.
    Reply,
}

/// Media format of a unit, as classified by the normalizer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ContentFormat {
    /// Text-only or link post.
    #[default]
    Text,
    /// Image or gallery post.
    Image,
    /// Video post.
    Video,
}

/// A claim or topic label attached upstream. Carried, never interpreted.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Claim {
    /// Claim / topic label.
    pub label: String,
    /// Upstream extractor confidence, if any.
    pub confidence: Option<f32>,
}

impl Claim {
    /// A label with no confidence attached.
    pub fn label(label: impl Into<String>) -> Self {
        Self { label: label.into(), confidence: None }
    }
}

/// A normalized narrative object as delivered by the normalization collaborator.
///
/// Required fields are `Option`s so that their absence can be reported as a
/// structured validation error instead of a deserialization failure.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NormalizedObject {
    /// Unit identifier (required).
    pub id: Option<String>,
    /// Authoring actor identifier (required).
    pub actor_id: Option<String>,
    /// Publication time, Unix ms (required).
    pub timestamp: Option<Timestamp>,
    /// Content-similarity signature (required, fixed length).
    pub signature: Option<Vec<f32>>,
    /// Parent unit, for shares/quotes/replies.
    pub parent_id: Option<String>,
    /// Edge kind towards the parent.
    pub relation: PropagationKind,
    /// Claim / topic labels.
    pub claims: Vec<Claim>,
    /// Sentiment / emotion and other passthrough attributes.
    pub attributes: BTreeMap<String, String>,
    /// Platform of origin.
    pub platform: Option<String>,
    /// Account age estimate in days.
    pub account_age_days: Option<f32>,
    /// Media format.
    pub format: Option<ContentFormat>,
    /// Outbound landing pages referenced by the unit.
    pub landing_pages: Vec<String>,
    /// Reported impressions / views.
    pub impressions: Option<f64>,
}

// ─── Narrative unit ──────────────────────────────────────────────────────────

/// An immutable narrative unit accepted into the graph.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NarrativeUnit {
    /// Unit identifier.
    pub id: UnitId,
    /// Authoring actor.
    pub actor: ActorId,
    /// Publication time.
    pub timestamp: Timestamp,
    /// Content-similarity signature.
    pub signature: ContentSignature,
    /// Claim / topic labels.
    pub claims: Vec<Claim>,
    /// Weak parent reference — resolved by id lookup, never owned.
    pub parent: Option<UnitId>,
    /// Edge kind towards the parent (meaningless for roots).
    pub relation: PropagationKind,
    /// Passthrough attributes.
    pub attributes: BTreeMap<String, String>,
    /// Platform of origin.
    pub platform: Option<String>,
    /// Media format.
    pub format: ContentFormat,
    /// Landing pages.
    pub landing_pages: Vec<String>,
    /// Reported impressions.
    pub impressions: Option<f64>,
}

impl NarrativeUnit {
    /// True if this unit starts a cascade.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

// ─── Actor ───────────────────────────────────────────────────────────────────

/// An observed account.
///
/// Created on first observed unit; fingerprints are added once per closed
/// window in which the actor was active. Never deleted — only archived.
#[derive(Clone, Debug)]
pub struct Actor {
    /// Actor identifier.
    pub id: ActorId,
    /// Platform of origin (first non-empty value seen).
    pub platform: Option<String>,
    /// Latest account-age estimate in days.
    pub account_age_days: Option<f32>,
    /// First unit timestamp.
    pub first_seen: Timestamp,
    /// Most recent unit timestamp.
    pub last_seen: Timestamp,
    /// Number of accepted units.
    pub unit_count: u64,
    /// Per-window behavioural fingerprints.
    pub fingerprints: BTreeMap<WindowId, Fingerprint>,
    /// Set after a period of inactivity.
    pub archived: bool,
}

impl Actor {
    /// A fresh actor first seen at `ts`.
    pub fn new(id: ActorId, ts: Timestamp) -> Self {
        Self {
            id,
            platform: None,
            account_age_days: None,
            first_seen: ts,
            last_seen: ts,
            unit_count: 0,
            fingerprints: BTreeMap::new(),
            archived: false,
        }
    }

    /// Record a new unit authored by this actor.
    pub fn observe(&mut self, ts: Timestamp, platform: Option<&str>, account_age_days: Option<f32>) {
        self.first_seen = self.first_seen.min(ts);
        self.last_seen = self.last_seen.max(ts);
        self.unit_count += 1;
        self.archived = false;
        if self.platform.is_none() {
            self.platform = platform.map(str::to_owned);
        }
        if account_age_days.is_some() {
            self.account_age_days = account_age_days;
        }
    }
}

// ─── Cascade ─────────────────────────────────────────────────────────────────

/// Lifecycle state of a cascade. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CascadeState {
    /// Newly rooted, arrivals not yet accelerating.
    Emerging,
    /// Sustained positive growth in arrival rate.
    Amplifying,
    /// Growth has stalled at a plateau.
    Peaked,
    /// Sustained decline in arrival rate.
    Decaying,
    /// Quiescent. Accepts no further units.
    Archived,
}

impl fmt::Display for CascadeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CascadeState::Emerging => "emerging",
            CascadeState::Amplifying => "amplifying",
            CascadeState::Peaked => "peaked",
            CascadeState::Decaying => "decaying",
            CascadeState::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// One arrival-rate history entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArrivalBucket {
    /// Bucket index (`timestamp.div_euclid(bucket_ms)`).
    pub bucket: i64,
    /// Units that arrived in the bucket.
    pub count: u32,
}

/// The propagation tree of one root unit.
#[derive(Clone, Debug)]
pub struct Cascade {
    /// Cascade identifier.
    pub id: CascadeId,
    /// Root unit.
    pub root: UnitId,
    /// Archived cascade this one was spawned from by a late arrival.
    pub parent_cascade: Option<CascadeId>,
    /// Member units in acceptance order (root first).
    pub members: Vec<UnitId>,
    /// Current lifecycle state.
    pub state: CascadeState,
    /// Arrival-rate history, strictly ordered by bucket.
    pub history: Vec<ArrivalBucket>,
    /// Root timestamp followed by every state-transition timestamp.
    pub milestones: Vec<Timestamp>,
    /// Content population statistics.
    pub population: PopulationSummary,
    /// Set when an internal invariant violation isolated this cascade.
    pub halted: bool,
    pub(crate) tracker: TrackerState,
}

impl Cascade {
    /// A new cascade rooted at `root`.
    pub fn new(root: &NarrativeUnit, parent_cascade: Option<CascadeId>) -> Self {
        Self {
            id: CascadeId::for_root(&root.id),
            root: root.id.clone(),
            parent_cascade,
            members: Vec::new(),
            state: CascadeState::Emerging,
            history: Vec::new(),
            milestones: vec![root.timestamp],
            population: PopulationSummary::default(),
            halted: false,
            tracker: TrackerState::default(),
        }
    }

    /// Append a member and count it in its arrival bucket.
    pub fn attach(&mut self, unit: &NarrativeUnit, bucket_ms: i64) {
        self.members.push(unit.id.clone());
        self.record_arrival(unit.timestamp.div_euclid(bucket_ms));
        self.population.record(unit);
    }

    /// Increment `bucket`, inserting it in order if absent.
    pub fn record_arrival(&mut self, bucket: i64) {
        match self.history.binary_search_by_key(&bucket, |b| b.bucket) {
            Ok(i) => self.history[i].count = self.history[i].count.saturating_add(1),
            Err(i) => self.history.insert(i, ArrivalBucket { bucket, count: 1 }),
        }
    }

    /// Arrivals in `bucket` (0 for gaps).
    pub fn count_at(&self, bucket: i64) -> u32 {
        self.history
            .binary_search_by_key(&bucket, |b| b.bucket)
            .map_or(0, |i| self.history[i].count)
    }

    /// Total accepted units.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True if no unit has been attached yet.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Latest milestone at or before `ts`.
    pub fn milestone_before(&self, ts: Timestamp) -> Timestamp {
        latest_milestone(&self.milestones, ts)
    }
}

/// Latest entry of a sorted milestone list that is `<= ts`; the first entry otherwise.
pub(crate) fn latest_milestone(milestones: &[Timestamp], ts: Timestamp) -> Timestamp {
    match milestones.partition_point(|&m| m <= ts) {
        0 => milestones.first().copied().unwrap_or(ts),
        i => milestones[i - 1],
    }
}

// ─── Coordination cluster ────────────────────────────────────────────────────

/// A set of actors whose fingerprints indicate coordinated activity in one window.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CoordinationCluster {
    /// Deterministic identifier.
    pub id: ClusterId,
    /// Formation window.
    pub window: WindowId,
    /// Members (≥ 2), ordered.
    pub members: BTreeSet<ActorId>,
    /// Mean pairwise fingerprint cosine similarity.
    pub similarity: f32,
    /// Fraction of member pairs joined in the thresholded similarity graph.
    pub density: f32,
    /// Cascades the members posted into during the window.
    pub cascades: BTreeSet<CascadeId>,
    /// Prior-window clusters linked by overlap, best first.
    pub predecessors: Vec<ClusterId>,
}

impl CoordinationCluster {
    /// Number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Jaccard overlap of member sets.
    pub fn jaccard(&self, other: &Self) -> f32 {
        let inter = self.members.intersection(&other.members).count();
        let union = self.members.len() + other.members.len() - inter;
        if union == 0 {
            0.0
        } else {
            inter as f32 / union as f32
        }
    }
}

// ─── Risk profile ────────────────────────────────────────────────────────────

/// What a profile or event is about.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", content = "id", rename_all = "snake_case"))]
pub enum RiskTarget {
    /// A narrative cascade.
    Cascade(CascadeId),
    /// A coordination cluster.
    Cluster(ClusterId),
}

impl RiskTarget {
    /// Identifier text regardless of kind.
    pub fn id_str(&self) -> &str {
        match self {
            RiskTarget::Cascade(id) => id.as_str(),
            RiskTarget::Cluster(id) => id.as_str(),
        }
    }
}

impl fmt::Display for RiskTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTarget::Cascade(id) => write!(f, "cascade {id}"),
            RiskTarget::Cluster(id) => write!(f, "cluster {id}"),
        }
    }
}

/// Raw factor values and their weighted contributions.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FactorBreakdown {
    /// Fraction of participants in a coordination cluster [0, 1].
    pub density: f32,
    /// Posting-time synchrony [0, 1].
    pub synchrony: f32,
    /// Fingerprint anomaly magnitude [0, 1].
    pub anomaly: f32,
    /// factor name → weight × value.
    pub contributions: BTreeMap<String, f32>,
}

/// An immutable, explainable risk assessment.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RiskProfile {
    /// Scored cascade or cluster.
    pub target: RiskTarget,
    /// Risk score [0, 1].
    pub score: f32,
    /// Factor breakdown.
    pub factors: FactorBreakdown,
    /// Sample-size confidence [0, 1].
    pub confidence: f32,
    /// Window the evidence came from.
    pub window: WindowId,
    /// Generation timestamp — the version of this profile.
    pub generated_at: Timestamp,
}

// ─── Timeline ────────────────────────────────────────────────────────────────

/// What happened.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum TimelineEventKind {
    /// Cascade lifecycle transition.
    StateTransition {
        /// Previous state.
        from: CascadeState,
        /// New state.
        to: CascadeState,
    },
    /// A cluster with no predecessor appeared.
    ClusterFormed,
    /// A cluster linked to two or more prior clusters.
    ClusterMerged {
        /// The prior clusters that merged.
        from: Vec<ClusterId>,
    },
    /// A prior cluster had no successor.
    ClusterDissolved,
    /// A score crossed a configured threshold.
    ScoreThresholdCrossed {
        /// The threshold crossed.
        threshold: f32,
        /// True for an upward crossing.
        rising: bool,
        /// Score after the crossing.
        score: f32,
    },
}

impl TimelineEventKind {
    /// Ordering priority among events sharing a timestamp (lower first).
    pub fn priority(&self) -> u8 {
        match self {
            TimelineEventKind::StateTransition { .. } => 0,
            TimelineEventKind::ClusterFormed => 1,
            TimelineEventKind::ClusterMerged { .. } => 2,
            TimelineEventKind::ClusterDissolved => 3,
            TimelineEventKind::ScoreThresholdCrossed { .. } => 4,
        }
    }

    /// Short label, used for deduplication and export.
    pub fn label(&self) -> &'static str {
        match self {
            TimelineEventKind::StateTransition { .. } => "state_transition",
            TimelineEventKind::ClusterFormed => "cluster_formed",
            TimelineEventKind::ClusterMerged { .. } => "cluster_merged",
            TimelineEventKind::ClusterDissolved => "cluster_dissolved",
            TimelineEventKind::ScoreThresholdCrossed { .. } => "score_threshold_crossed",
        }
    }
}

/// A discrete, timestamped change recorded for analyst review.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TimelineEvent {
    /// Cascade or cluster the event is about.
    pub target: RiskTarget,
    /// Event kind.
    pub kind: TimelineEventKind,
    /// When it happened.
    pub timestamp: Timestamp,
    /// Human-readable payload summary.
    pub summary: String,
}
