//! The engine façade: ingestion, window closure, analysis, publication, queries.
//!
//! ```text
//! producers ──ingest──▶ NarrativeGraph
//!                           │ close_ready_windows(now)
//!                           ▼
//!              sweep orphans · freeze ready windows            (barrier)
//!                           │
//!        ┌──────────────────┼──────────────────┐  rayon, one task per window
//!        ▼                  ▼                  ▼
//!   fingerprints ─▶ clusters ─▶ anomaly ─▶ risk profiles
//!        └──────────────────┼──────────────────┘
//!                           ▼  shutdown? → Cancelled, nothing published
//!       advance cascades · link clusters · threshold crossings   (window order)
//!                           ▼
//!                  TimelineLedger · WindowReport
//! ```
//!
//! All windows of one batch are scored against the same baseline snapshot,
//! taken before analysis; the baseline then absorbs each window in order.
//!
//! Long stretches without units are closed without analysis (see
//! [`ClosePlan`]); querying such a window yields an empty report. Published
//! reports and the profile feed are bounded by `report_retention` and
//! `feed_retention`.
//!
//! # Invariants
//!
//! - A window is published completely or not at all.
//! - Profiles are versioned by their window end; nothing published is edited.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::baseline::{BaselinePrior, PopulationBaseline};
use crate::cascade::{CascadeThresholds, CascadeTracker};
use crate::cluster::{link_clusters, ClusterConfig, ClusterDetection, ClusterDetector, DegenerateReason};
use crate::error::{DeferredRejection, EngineError, IngestError, WindowNotReadyError};
use crate::fingerprint::{CollectiveCadence, Fingerprint, FingerprintConfig, FingerprintExtractor};
use crate::graph::{GraphConfig, IngestOutcome, NarrativeGraph};
use crate::model::{ActorId, CoordinationCluster, NormalizedObject, RiskProfile, RiskTarget, TimelineEvent, Timestamp};
use crate::scorer::{RiskScorer, ScorerConfig, WindowEvidence};
use crate::timeline::{RiskBundle, TimelineLedger};
use crate::window::{ClosePlan, WindowConfig, WindowId, WindowSnapshot, WindowSpan};

/// Every tunable, grouped by component.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Graph and ingestion settings.
    pub graph: GraphConfig,
    /// Analysis window settings.
    pub window: WindowConfig,
    /// Cascade lifecycle thresholds.
    pub cascade: CascadeThresholds,
    /// Fingerprint weights.
    pub fingerprint: FingerprintConfig,
    /// Clustering semantics.
    pub cluster: ClusterConfig,
    /// Risk scoring.
    pub scorer: ScorerConfig,
    /// Population baseline prior.
    pub baseline: BaselinePrior,
    /// Silence after which an actor is archived. Default 7 days.
    pub actor_inactivity_ms: i64,
    /// Published window reports kept for [`CoordinationEngine::window_report`]. Default 1024.
    pub report_retention: usize,
    /// Profiles kept in the cross-target feed. Default 100 000.
    pub feed_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            graph: GraphConfig::default(),
            window: WindowConfig::default(),
            cascade: CascadeThresholds::default(),
            fingerprint: FingerprintConfig::default(),
            cluster: ClusterConfig::default(),
            scorer: ScorerConfig::default(),
            baseline: BaselinePrior::default(),
            actor_inactivity_ms: 7 * 24 * 3_600_000,
            report_retention: 1_024,
            feed_retention: 100_000,
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let bad = |m: &str| Err(EngineError::InvalidConfig(m.to_owned()));
        if self.graph.signature_dim == 0 {
            return bad("signature_dim must be positive");
        }
        if self.graph.bucket_ms <= 0 || self.window.length_ms <= 0 {
            return bad("bucket and window lengths must be positive");
        }
        if self.window.length_ms % self.graph.bucket_ms != 0 {
            return bad("window length must be a multiple of the bucket width");
        }
        if self.window.grace_ms < 0 || self.graph.orphan_grace_ms < 0 {
            return bad("grace periods must not be negative");
        }
        if self.graph.orphan_grace_ms > self.window.grace_ms {
            return bad("orphan grace must not exceed window grace");
        }
        if self.graph.max_future_skew_ms < 0 || self.graph.max_past_skew_ms < self.window.length_ms + self.window.grace_ms {
            return bad("past skew must cover a window and its grace; future skew must not be negative");
        }
        if self.report_retention == 0 || self.feed_retention == 0 {
            return bad("retention limits must be positive");
        }
        if !(self.cluster.similarity_threshold.is_finite() && (-1.0..=1.0).contains(&self.cluster.similarity_threshold)) {
            return bad("similarity threshold must lie in [-1, 1]");
        }
        self.scorer.weights.validate()?;
        Ok(())
    }
}

/// Everything published for one closed window.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WindowReport {
    /// Window bounds.
    pub span: WindowSpan,
    /// Units analysed.
    pub unit_count: usize,
    /// Actors fingerprinted.
    pub actor_count: usize,
    /// Clusters, with predecessors linked.
    pub clusters: Vec<CoordinationCluster>,
    /// Set when the window was degenerate.
    pub degenerate: Option<DegenerateReason>,
    /// Profiles generated at window end.
    pub profiles: Vec<RiskProfile>,
    /// Events recorded at publication, in recording order.
    pub events: Vec<TimelineEvent>,
}

impl WindowReport {
    /// Report of a window closed without any units.
    pub fn empty(span: WindowSpan) -> Self {
        Self {
            span,
            unit_count: 0,
            actor_count: 0,
            clusters: Vec::new(),
            degenerate: None,
            profiles: Vec::new(),
            events: Vec::new(),
        }
    }
}

/// Parallel-stage output awaiting publication.
struct WindowAnalysis {
    snapshot: WindowSnapshot,
    fingerprints: BTreeMap<ActorId, Fingerprint>,
    detection: ClusterDetection,
    profiles: Vec<RiskProfile>,
}

#[derive(Debug, Default)]
struct CloseCursor {
    plan: Option<ClosePlan>,
    last_clusters: Vec<CoordinationCluster>,
}

#[derive(Debug, Default)]
struct ReportStore {
    reports: BTreeMap<WindowId, Arc<WindowReport>>,
    /// Every window before this one is closed.
    closed_before: Option<WindowId>,
    /// Reports before this window were dropped.
    evicted_before: Option<WindowId>,
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Concurrent coordinated-behaviour detection engine. Share via `Arc`.
pub struct CoordinationEngine {
    config: EngineConfig,
    graph: NarrativeGraph,
    tracker: CascadeTracker,
    extractor: FingerprintExtractor,
    detector: ClusterDetector,
    scorer: RiskScorer,
    baseline: Mutex<PopulationBaseline>,
    ledger: RwLock<TimelineLedger>,
    reports: RwLock<ReportStore>,
    cursor: Mutex<CloseCursor>,
    swept: Mutex<Vec<DeferredRejection>>,
    shutdown: AtomicBool,
}

impl CoordinationEngine {
    /// Engine with validated settings.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            graph: NarrativeGraph::new(config.graph.clone()),
            tracker: CascadeTracker::new(config.cascade.clone(), config.graph.bucket_ms),
            extractor: FingerprintExtractor::new(config.fingerprint.clone()),
            detector: ClusterDetector::new(config.cluster.clone()),
            scorer: RiskScorer::new(config.scorer.clone())?,
            baseline: Mutex::new(PopulationBaseline::new(config.baseline.clone())),
            ledger: RwLock::new(TimelineLedger::with_feed_limit(config.feed_retention)),
            reports: RwLock::new(ReportStore::default()),
            cursor: Mutex::new(CloseCursor::default()),
            swept: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            config,
        })
    }

    /// Settings in use.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The live graph (read access for inspection).
    pub fn graph(&self) -> &NarrativeGraph {
        &self.graph
    }

    /// Accept one normalized object from any producer thread.
    pub fn ingest(&self, obj: NormalizedObject, now: Timestamp) -> Result<IngestOutcome, IngestError> {
        self.graph.ingest(obj, now)
    }

    /// Drain buffered units rejected after their ingestion call returned:
    /// children refused when their parent arrived, then orphans expired at
    /// window closure.
    pub fn take_deferred_rejections(&self) -> Vec<DeferredRejection> {
        let mut out = self.graph.take_deferred_rejections();
        out.append(&mut self.swept.lock());
        out
    }

    /// Stop: in-flight and future window analysis is discarded.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// True once [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    // ── Window closure ─────────────────────────────────

    /// Close, analyse, and publish every window ready at `now`.
    ///
    /// Returns the published reports in window order. A shutdown observed
    /// before publication discards the whole batch.
    pub fn close_ready_windows(&self, now: Timestamp) -> Result<Vec<Arc<WindowReport>>, EngineError> {
        let mut cursor = self.cursor.lock();
        let orphans = self.graph.sweep_orphans(now);
        if !orphans.is_empty() {
            warn!(count = orphans.len(), "orphans rejected before window closure");
            self.swept.lock().extend(orphans.into_iter().map(DeferredRejection::from));
        }

        let start = match cursor.plan {
            Some(plan) => plan,
            None => match self.graph.earliest_timestamp() {
                Some(t) => ClosePlan::starting_at(self.config.window.window_of(t), self.empty_tail()),
                None => return Ok(Vec::new()),
            },
        };
        let (snapshots, plan) = self.graph.freeze_ready(&self.config.window, start, now);
        let ids = snapshots.first().zip(snapshots.last()).map(|(a, b)| (a.span.id, b.span.id));
        let Some((first, last)) = ids else {
            if plan.next > start.next {
                self.commit(&mut cursor, plan);
            }
            return Ok(Vec::new());
        };

        let baseline = self.baseline.lock().clone();
        let analyses: Vec<Option<WindowAnalysis>> =
            snapshots.into_par_iter().map(|snap| self.analyse(snap, &baseline)).collect();

        if self.is_shut_down() || analyses.iter().any(Option::is_none) {
            warn!(first = %first, last = %last, "window analysis cancelled by shutdown");
            return Err(EngineError::Cancelled { first, last });
        }

        let mut published = Vec::with_capacity(analyses.len());
        for analysis in analyses.into_iter().flatten() {
            published.push(self.publish(analysis, &mut cursor));
        }
        self.commit(&mut cursor, plan);
        Ok(published)
    }

    /// Empty windows still published after activity: enough for a quiet
    /// cascade to reach archival inside a report.
    fn empty_tail(&self) -> i64 {
        let quiet_ms = i64::from(self.config.cascade.quiescence_buckets.max(1)) * self.config.graph.bucket_ms;
        let length = self.config.window.length_ms;
        (quiet_ms + length - 1) / length
    }

    fn commit(&self, cursor: &mut CloseCursor, plan: ClosePlan) {
        cursor.plan = Some(plan);
        self.reports.write().closed_before = Some(plan.next);
    }

    fn analyse(&self, snapshot: WindowSnapshot, baseline: &PopulationBaseline) -> Option<WindowAnalysis> {
        let fingerprints = self.extractor.extract_all(&snapshot);
        if self.is_shut_down() {
            return None;
        }
        let detection = self.detector.detect_clusters(&fingerprints, &snapshot);
        if self.is_shut_down() {
            return None;
        }
        let anomaly = self.anomaly(&fingerprints, &detection.clusters, &snapshot, baseline);
        let evidence = WindowEvidence {
            snapshot: &snapshot,
            clusters: &detection.clusters,
            anomaly: &anomaly,
            generated_at: snapshot.span.end,
        };
        let profiles = self.scorer.score_window(&evidence);
        if self.is_shut_down() {
            return None;
        }
        Some(WindowAnalysis { snapshot, fingerprints, detection, profiles })
    }

    /// Per-actor anomaly. Cluster members missing a cadence of their own are
    /// scored on their cluster's pooled cadence.
    fn anomaly(
        &self,
        fingerprints: &BTreeMap<ActorId, Fingerprint>,
        clusters: &[CoordinationCluster],
        snapshot: &WindowSnapshot,
        baseline: &PopulationBaseline,
    ) -> BTreeMap<ActorId, f32> {
        let mut cadence: BTreeMap<&ActorId, CollectiveCadence> = BTreeMap::new();
        for cluster in clusters {
            let timestamps: Vec<Timestamp> = snapshot
                .units
                .iter()
                .filter(|u| cluster.members.contains(&u.actor))
                .map(|u| u.timestamp)
                .collect();
            let group = CollectiveCadence::from_timestamps(&timestamps);
            for member in &cluster.members {
                cadence.insert(member, group);
            }
        }

        let z_cap = self.config.scorer.z_cap;
        fingerprints
            .iter()
            .map(|(actor, fp)| {
                let scalars = cadence.get(actor).map_or(fp.scalars(), |group| group.fill(fp.scalars()));
                (actor.clone(), baseline.anomaly(&scalars, z_cap))
            })
            .collect()
    }

    fn publish(&self, analysis: WindowAnalysis, cursor: &mut CloseCursor) -> Arc<WindowReport> {
        let WindowAnalysis { snapshot, fingerprints, detection, profiles } = analysis;
        let span = snapshot.span;

        let mut events = self.graph.advance_cascades(span.end, &self.tracker);
        let mut clusters = detection.clusters;
        events.extend(link_clusters(&cursor.last_clusters, &mut clusters, self.config.cluster.overlap_threshold, span.end));

        {
            let mut ledger = self.ledger.write();
            for profile in &profiles {
                let previous = ledger.latest_profile(&profile.target).map(|p| p.score);
                events.extend(self.scorer.threshold_crossings(previous, profile));
                ledger.record_profile(profile.clone());
            }
            for cluster in &clusters {
                for cascade in &cluster.cascades {
                    ledger.associate(cascade.clone(), cluster.id.clone());
                }
            }
            for event in &events {
                ledger.record_event(event.clone());
            }
        }

        self.graph.record_fingerprints(fingerprints.values());
        let scalars: Vec<_> = fingerprints.values().map(Fingerprint::scalars).collect();
        self.baseline.lock().update(&scalars);
        self.graph.archive_inactive_actors(span.end, self.config.actor_inactivity_ms);

        let report = Arc::new(WindowReport {
            span,
            unit_count: snapshot.units.len(),
            actor_count: fingerprints.len(),
            clusters: clusters.clone(),
            degenerate: detection.degenerate,
            profiles,
            events,
        });
        cursor.last_clusters = clusters;
        {
            let mut store = self.reports.write();
            store.reports.insert(span.id, Arc::clone(&report));
            while store.reports.len() > self.config.report_retention {
                let Some((evicted, _)) = store.reports.pop_first() else {
                    break;
                };
                store.evicted_before = Some(WindowId(evicted.0 + 1));
            }
        }

        info!(
            window = %span.id,
            units = report.unit_count,
            clusters = report.clusters.len(),
            profiles = report.profiles.len(),
            events = report.events.len(),
            "window published"
        );
        report
    }

    // ── Queries ────────────────────────────────────────

    fn known(&self, target: &RiskTarget) -> bool {
        let in_graph = match target {
            RiskTarget::Cascade(id) => self.graph.cascade(id).is_some(),
            RiskTarget::Cluster(_) => false,
        };
        in_graph || self.ledger.read().knows(target)
    }

    /// Current profile of a cascade or cluster, if one has been published.
    pub fn latest_profile(&self, target: &RiskTarget) -> Result<Option<RiskProfile>, EngineError> {
        if !self.known(target) {
            return Err(EngineError::UnknownTarget(target.to_string()));
        }
        Ok(self.ledger.read().latest_profile(target).cloned())
    }

    /// Ordered timeline of a target.
    pub fn timeline(&self, target: &RiskTarget) -> Result<Vec<TimelineEvent>, EngineError> {
        if !self.known(target) {
            return Err(EngineError::UnknownTarget(target.to_string()));
        }
        Ok(self.ledger.read().timeline(target))
    }

    /// Profile + history + timeline (+ population for cascades).
    pub fn bundle(&self, target: &RiskTarget) -> Result<RiskBundle, EngineError> {
        if !self.known(target) {
            return Err(EngineError::UnknownTarget(target.to_string()));
        }
        let population = match target {
            RiskTarget::Cascade(id) => self.graph.population(id),
            RiskTarget::Cluster(_) => None,
        };
        Ok(self.ledger.read().bundle(target, population))
    }

    /// Every profile generated strictly after `since`.
    pub fn profiles_since(&self, since: Timestamp) -> Vec<RiskProfile> {
        self.ledger.read().profiles_since(since)
    }

    /// The published report of a window.
    ///
    /// A window closed without analysis because it held no units yields an
    /// empty report.
    pub fn window_report(&self, id: WindowId) -> Result<Arc<WindowReport>, EngineError> {
        let store = self.reports.read();
        if let Some(report) = store.reports.get(&id) {
            return Ok(Arc::clone(report));
        }
        if store.evicted_before.is_some_and(|e| id < e) {
            return Err(EngineError::ReportEvicted(id));
        }
        if store.closed_before.is_some_and(|c| id < c) {
            return Ok(Arc::new(WindowReport::empty(self.config.window.span(id))));
        }
        Err(WindowNotReadyError { window: id, ready_at: self.config.window.ready_at(id) }.into())
    }
}
