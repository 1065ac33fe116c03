//! Narrative graph — actors, units, and cascades under streaming updates.
//!
//! Units are keyed by identity; parent references are identifier lookups, never
//! ownership. Each cascade sits behind its own mutex so unrelated cascades are
//! mutated in parallel, while a graph-wide commit gate turns window freezing
//! and cascade advancement into a barrier:
//!
//! ```text
//! ingest ─── read(gate) ──▶ validate · reserve id · lock cascade · attach
//! freeze ─── write(gate) ─▶ snapshot windows · move the closed watermark
//! advance ── write(gate) ─▶ step every cascade's lifecycle
//! ```
//!
//! Children whose parent has not arrived yet wait in a pending buffer and are
//! attached, in arrival order, as soon as the parent is accepted. Anything
//! still waiting after the grace period is rejected by [`NarrativeGraph::sweep_orphans`].
//! A child that cannot be attached when its parent arrives (its window closed
//! meanwhile, or its cascade halted) is kept for
//! [`NarrativeGraph::take_deferred_rejections`].
//!
//! # Invariants
//!
//! - A unit id is accepted at most once, even under concurrent duplicates.
//! - Every accepted unit is a member of exactly one cascade.
//! - Nothing is ever accepted into a closed window.
//! - A rejection leaves the graph untouched.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::cascade::CascadeTracker;
use crate::error::{DeferredRejection, IngestError, OrphanReferenceError, ValidationError};
use crate::fingerprint::Fingerprint;
use crate::model::{
    Actor, ActorId, Cascade, CascadeId, CascadeState, NarrativeUnit, NormalizedObject, TimelineEvent, Timestamp,
    UnitId,
};
use crate::population::PopulationSummary;
use crate::signature::ContentSignature;
use crate::window::{ActorMeta, ClosePlan, SnapshotUnit, WindowConfig, WindowId, WindowSnapshot, WindowSpan};

/// Graph settings.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GraphConfig {
    /// Required signature length. Default 16.
    pub signature_dim: usize,
    /// Arrival-rate bucket width in ms. Default 60 s.
    pub bucket_ms: i64,
    /// Accepted clock skew into the future. Default 5 min.
    pub max_future_skew_ms: i64,
    /// Oldest accepted timestamp, relative to the engine clock. Default 7 days.
    pub max_past_skew_ms: i64,
    /// How long a child may wait for its parent. Default 20 s.
    pub orphan_grace_ms: i64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            signature_dim: 16,
            bucket_ms: 60_000,
            max_future_skew_ms: 300_000,
            max_past_skew_ms: 7 * 24 * 3_600_000,
            orphan_grace_ms: 20_000,
        }
    }
}

/// Result of a successful ingestion call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The unit joined `cascade`; `spawned` when it rooted a new one.
    Accepted {
        /// Cascade the unit now belongs to.
        cascade: CascadeId,
        /// True if the unit started a new cascade.
        spawned: bool,
    },
    /// The id was already accepted or is already waiting. Nothing changed.
    Duplicate,
    /// Waiting for `parent` to arrive.
    Buffered {
        /// The unresolved parent.
        parent: UnitId,
    },
}

#[derive(Clone, Debug)]
struct UnitEntry {
    unit: NarrativeUnit,
    cascade: CascadeId,
}

#[derive(Clone, Debug)]
struct PendingUnit {
    unit: NarrativeUnit,
    account_age_days: Option<f32>,
    received_at: Timestamp,
}

#[derive(Debug, Default)]
struct PendingBuffer {
    by_parent: BTreeMap<UnitId, Vec<UnitId>>,
    entries: BTreeMap<UnitId, PendingUnit>,
}

impl PendingBuffer {
    fn push(&mut self, parent: UnitId, p: PendingUnit) {
        self.by_parent.entry(parent).or_default().push(p.unit.id.clone());
        self.entries.insert(p.unit.id.clone(), p);
    }

    fn take_children(&mut self, parent: &UnitId) -> Vec<PendingUnit> {
        self.by_parent
            .remove(parent)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect()
    }

    fn expire(&mut self, now: Timestamp, grace_ms: i64) -> Vec<PendingUnit> {
        let expired: Vec<UnitId> = self
            .entries
            .iter()
            .filter(|(_, p)| now.saturating_sub(p.received_at) >= grace_ms)
            .map(|(id, _)| id.clone())
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(p) = self.entries.remove(&id) {
                if let Some(parent) = &p.unit.parent {
                    if let Some(waiting) = self.by_parent.get_mut(parent) {
                        waiting.retain(|w| *w != id);
                        if waiting.is_empty() {
                            self.by_parent.remove(parent);
                        }
                    }
                }
                out.push(p);
            }
        }
        out
    }
}

// ─── Graph ───────────────────────────────────────────────────────────────────

/// Concurrent graph of actors, narrative units, and cascades.
#[derive(Debug)]
pub struct NarrativeGraph {
    config: GraphConfig,
    units: DashMap<UnitId, UnitEntry>,
    cascades: DashMap<CascadeId, Arc<Mutex<Cascade>>>,
    actors: DashMap<ActorId, Actor>,
    by_bucket: DashMap<i64, Vec<UnitId>>,
    pending: Mutex<PendingBuffer>,
    deferred_rejections: Mutex<Vec<DeferredRejection>>,
    commit_gate: RwLock<()>,
    closed_until: AtomicI64,
    earliest: AtomicI64,
}

impl NarrativeGraph {
    /// Empty graph.
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            units: DashMap::new(),
            cascades: DashMap::new(),
            actors: DashMap::new(),
            by_bucket: DashMap::new(),
            pending: Mutex::new(PendingBuffer::default()),
            deferred_rejections: Mutex::new(Vec::new()),
            commit_gate: RwLock::new(()),
            closed_until: AtomicI64::new(i64::MIN),
            earliest: AtomicI64::new(i64::MAX),
        }
    }

    /// Settings in use.
    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    // ── Ingestion ──────────────────────────────────────

    /// Validate and insert one normalized object.
    pub fn ingest(&self, obj: NormalizedObject, now: Timestamp) -> Result<IngestOutcome, IngestError> {
        let (unit, account_age_days) = self.validate(obj, now)?;
        let _gate = self.commit_gate.read();
        self.check_open(unit.timestamp)?;

        if self.units.contains_key(&unit.id) {
            return Ok(IngestOutcome::Duplicate);
        }
        {
            let mut pending = self.pending.lock();
            if pending.entries.contains_key(&unit.id) {
                return Ok(IngestOutcome::Duplicate);
            }
            if let Some(parent) = unit.parent.clone() {
                if !self.is_resolved(&parent) {
                    debug!(unit = %unit.id, %parent, "buffered until parent arrives");
                    pending.push(parent.clone(), PendingUnit { unit, account_age_days, received_at: now });
                    return Ok(IngestOutcome::Buffered { parent });
                }
            }
        }

        let id = unit.id.clone();
        match self.attach(unit, account_age_days, now)? {
            None => Ok(IngestOutcome::Duplicate),
            Some((cascade, spawned)) => {
                self.release_children(id);
                Ok(IngestOutcome::Accepted { cascade, spawned })
            }
        }
    }

    fn validate(&self, obj: NormalizedObject, now: Timestamp) -> Result<(NarrativeUnit, Option<f32>), ValidationError> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let id = non_empty(obj.id).ok_or(ValidationError::MissingField("id"))?;
        let actor = non_empty(obj.actor_id).ok_or(ValidationError::MissingField("actor_id"))?;
        let timestamp = obj.timestamp.ok_or(ValidationError::MissingField("timestamp"))?;
        let signature = ContentSignature::new(obj.signature.ok_or(ValidationError::MissingField("signature"))?);

        if signature.dim() != self.config.signature_dim {
            return Err(ValidationError::SignatureLength { expected: self.config.signature_dim, found: signature.dim() });
        }
        if !signature.is_finite() {
            return Err(ValidationError::SignatureNotFinite);
        }
        let parent = non_empty(obj.parent_id).map(UnitId::new);
        if parent.as_ref().is_some_and(|p| p.as_str() == id) {
            return Err(ValidationError::SelfParent(UnitId::new(id)));
        }
        if timestamp > now.saturating_add(self.config.max_future_skew_ms) {
            return Err(ValidationError::TimestampSkew { timestamp, now, max_skew_ms: self.config.max_future_skew_ms });
        }
        if timestamp < now.saturating_sub(self.config.max_past_skew_ms) {
            return Err(ValidationError::TimestampSkew { timestamp, now, max_skew_ms: self.config.max_past_skew_ms });
        }
        self.check_open(timestamp)?;

        let unit = NarrativeUnit {
            id: UnitId::new(id),
            actor: ActorId::new(actor),
            timestamp,
            signature,
            claims: obj.claims,
            parent,
            relation: obj.relation,
            attributes: obj.attributes,
            platform: non_empty(obj.platform),
            format: obj.format.unwrap_or_default(),
            landing_pages: obj.landing_pages,
            impressions: obj.impressions,
        };
        Ok((unit, obj.account_age_days.filter(|d| d.is_finite())))
    }

    fn check_open(&self, timestamp: Timestamp) -> Result<(), ValidationError> {
        let closed_until = self.closed_until.load(Ordering::Acquire);
        if timestamp < closed_until {
            return Err(ValidationError::StaleTimestamp { timestamp, closed_until });
        }
        Ok(())
    }

    /// Parent accepted and its cascade published.
    fn is_resolved(&self, parent: &UnitId) -> bool {
        let cascade = self.units.get(parent).map(|e| e.cascade.clone());
        cascade.is_some_and(|c| self.cascades.contains_key(&c))
    }

    /// Claim `unit`'s id. False if someone else already holds it.
    fn reserve(&self, unit: &NarrativeUnit, cascade: &CascadeId) -> bool {
        match self.units.entry(unit.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(UnitEntry { unit: unit.clone(), cascade: cascade.clone() });
                true
            }
        }
    }

    fn spawn(&self, unit: &NarrativeUnit, parent_cascade: Option<CascadeId>) -> Option<CascadeId> {
        let id = CascadeId::for_root(&unit.id);
        if !self.reserve(unit, &id) {
            return None;
        }
        let mut cascade = Cascade::new(unit, parent_cascade);
        cascade.attach(unit, self.config.bucket_ms);
        self.cascades.insert(id.clone(), Arc::new(Mutex::new(cascade)));
        Some(id)
    }

    /// Insert a unit whose parent (if any) is resolved. `None` on a lost duplicate race.
    ///
    /// `buffered_at` is when the unit entered the graph's hands: the ingestion
    /// clock, or the buffering time of a released child.
    fn attach(
        &self,
        unit: NarrativeUnit,
        account_age_days: Option<f32>,
        buffered_at: Timestamp,
    ) -> Result<Option<(CascadeId, bool)>, IngestError> {
        let placed = match &unit.parent {
            None => self.spawn(&unit, None).map(|c| (c, true)),
            Some(parent) => {
                let parent_cascade = self.units.get(parent).map(|e| e.cascade.clone());
                let handle = parent_cascade
                    .as_ref()
                    .and_then(|c| self.cascades.get(c).map(|r| Arc::clone(r.value())));
                let (Some(parent_cascade), Some(handle)) = (parent_cascade, handle) else {
                    return Err(OrphanReferenceError { unit: unit.id.clone(), parent: parent.clone(), buffered_at }.into());
                };

                let mut cascade = handle.lock();
                if cascade.halted {
                    return Err(IngestError::CascadeHalted(cascade.id.clone()));
                }
                if cascade.state == CascadeState::Archived {
                    drop(cascade);
                    let spawned = self.spawn(&unit, Some(parent_cascade.clone()));
                    if let Some(child) = &spawned {
                        debug!(unit = %unit.id, archived = %parent_cascade, cascade = %child, "late arrival spawned child cascade");
                    }
                    spawned.map(|c| (c, true))
                } else if self.reserve(&unit, &parent_cascade) {
                    cascade.attach(&unit, self.config.bucket_ms);
                    Some((parent_cascade, false))
                } else {
                    None
                }
            }
        };
        let Some((cascade, spawned)) = placed else {
            return Ok(None);
        };

        self.actors
            .entry(unit.actor.clone())
            .or_insert_with(|| Actor::new(unit.actor.clone(), unit.timestamp))
            .observe(unit.timestamp, unit.platform.as_deref(), account_age_days);
        self.by_bucket
            .entry(unit.timestamp.div_euclid(self.config.bucket_ms))
            .or_default()
            .push(unit.id.clone());
        self.earliest.fetch_min(unit.timestamp, Ordering::AcqRel);

        debug!(unit = %unit.id, actor = %unit.actor, %cascade, spawned, "unit accepted");
        Ok(Some((cascade, spawned)))
    }

    /// Attach every unit transitively waiting on `root`, in arrival order.
    fn release_children(&self, root: UnitId) {
        let mut queue = VecDeque::from([root]);
        let mut rejected = Vec::new();
        while let Some(parent) = queue.pop_front() {
            let waiting = self.pending.lock().take_children(&parent);
            for p in waiting {
                let id = p.unit.id.clone();
                let attached = match self.check_open(p.unit.timestamp) {
                    Ok(()) => self.attach(p.unit, p.account_age_days, p.received_at),
                    Err(e) => Err(e.into()),
                };
                match attached {
                    Ok(Some(_)) => queue.push_back(id),
                    // accepted concurrently under the same id; its own release handles the children
                    Ok(None) => debug!(unit = %id, "released child was a duplicate"),
                    Err(reason) => {
                        warn!(unit = %id, %parent, error = %reason, "released child rejected");
                        rejected.push(DeferredRejection { unit: id, parent: parent.clone(), reason });
                    }
                }
            }
        }
        if !rejected.is_empty() {
            self.deferred_rejections.lock().append(&mut rejected);
        }
    }

    /// Drain the children rejected on release since the last call, oldest first.
    ///
    /// Rejected units are in no cascade and may be submitted again.
    pub fn take_deferred_rejections(&self) -> Vec<DeferredRejection> {
        std::mem::take(&mut *self.deferred_rejections.lock())
    }

    /// Reject every buffered unit that waited at least the grace period.
    ///
    /// Rejected units are in no cascade and may be submitted again.
    pub fn sweep_orphans(&self, now: Timestamp) -> Vec<OrphanReferenceError> {
        let expired = self.pending.lock().expire(now, self.config.orphan_grace_ms);
        expired
            .into_iter()
            .filter_map(|p| {
                let parent = p.unit.parent?;
                let err = OrphanReferenceError { unit: p.unit.id, parent, buffered_at: p.received_at };
                warn!(unit = %err.unit, parent = %err.parent, "orphan rejected");
                Some(err)
            })
            .collect()
    }

    // ── Window barrier ─────────────────────────────────

    /// Snapshot every window ready at `now`, resuming at `plan.next`, and
    /// close everything before the returned plan's `next`, atomically.
    ///
    /// Empty windows past the plan's tail are closed without a snapshot; the
    /// plan jumps straight to the next window holding a unit.
    pub fn freeze_ready(&self, window: &WindowConfig, mut plan: ClosePlan, now: Timestamp) -> (Vec<WindowSnapshot>, ClosePlan) {
        let _gate = self.commit_gate.write();
        let bm = self.config.bucket_ms;
        let horizon = window.horizon(now);
        let mut snapshots = Vec::new();
        let mut w = plan.next;
        while w < horizon {
            let span = window.span(w);
            let active = self.has_units_in(span);
            if active {
                plan.last_active = Some(w);
            }
            if active || plan.publishes_empty(w) {
                snapshots.push(self.build_snapshot(span));
                w = WindowId(w.0 + 1);
            } else {
                let next_active = self.first_bucket_from(span.end.div_euclid(bm)).map(|b| window.window_of(b * bm));
                w = next_active.map_or(horizon, |n| n.min(horizon));
            }
        }
        if w > plan.next {
            self.closed_until.fetch_max(window.span(w).start, Ordering::AcqRel);
            debug!(from = %plan.next, to = %w, snapshots = snapshots.len(), "windows closed");
        }
        plan.next = w;
        (snapshots, plan)
    }

    fn has_units_in(&self, span: WindowSpan) -> bool {
        let bm = self.config.bucket_ms;
        (span.start.div_euclid(bm)..=(span.end - 1).div_euclid(bm))
            .any(|b| self.by_bucket.get(&b).is_some_and(|ids| !ids.is_empty()))
    }

    /// Lowest occupied bucket at or after `bucket`.
    fn first_bucket_from(&self, bucket: i64) -> Option<i64> {
        self.by_bucket.iter().map(|r| *r.key()).filter(|b| *b >= bucket).min()
    }

    /// A frozen view of one window without closing it.
    pub fn snapshot(&self, span: WindowSpan) -> WindowSnapshot {
        let _gate = self.commit_gate.write();
        self.build_snapshot(span)
    }

    fn build_snapshot(&self, span: WindowSpan) -> WindowSnapshot {
        let bm = self.config.bucket_ms;
        let mut ids: Vec<UnitId> = Vec::new();
        for bucket in span.start.div_euclid(bm)..=(span.end - 1).div_euclid(bm) {
            if let Some(b) = self.by_bucket.get(&bucket) {
                ids.extend(b.iter().cloned());
            }
        }

        let mut units: Vec<SnapshotUnit> = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(entry) = self.units.get(&id).map(|e| e.value().clone()) else {
                continue;
            };
            if !span.contains(entry.unit.timestamp) {
                continue;
            }
            let parent_actor = entry
                .unit
                .parent
                .as_ref()
                .and_then(|p| self.units.get(p).map(|e| e.unit.actor.clone()));
            units.push(SnapshotUnit {
                id: entry.unit.id,
                actor: entry.unit.actor,
                cascade: entry.cascade,
                timestamp: entry.unit.timestamp,
                signature: entry.unit.signature,
                parent_actor,
                relation: entry.unit.relation,
            });
        }
        units.sort_by(|a, b| (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id)));

        let mut actors: BTreeMap<ActorId, ActorMeta> = BTreeMap::new();
        for actor in units.iter().flat_map(|u| std::iter::once(&u.actor).chain(u.parent_actor.as_ref())) {
            if actors.contains_key(actor) {
                continue;
            }
            let meta = self
                .actors
                .get(actor)
                .map(|a| ActorMeta { account_age_days: a.account_age_days, platform: a.platform.clone() })
                .unwrap_or_default();
            actors.insert(actor.clone(), meta);
        }

        let touched: BTreeSet<CascadeId> = units.iter().map(|u| u.cascade.clone()).collect();
        let milestones = touched
            .into_iter()
            .filter_map(|c| {
                let handle = self.cascades.get(&c).map(|r| Arc::clone(r.value()))?;
                let m = handle.lock().milestones.clone();
                Some((c, m))
            })
            .collect();

        WindowSnapshot { span, units, actors, milestones }
    }

    /// Step every live cascade through all buckets closed by `through`.
    ///
    /// A cascade whose history violates ordering is halted and skipped; the
    /// rest proceed.
    pub fn advance_cascades(&self, through: Timestamp, tracker: &CascadeTracker) -> Vec<TimelineEvent> {
        let _gate = self.commit_gate.write();
        let mut events = Vec::new();
        for id in self.cascade_ids() {
            let Some(handle) = self.cascades.get(&id).map(|r| Arc::clone(r.value())) else {
                continue;
            };
            let mut cascade = handle.lock();
            match tracker.advance(&mut cascade, through) {
                Ok(mut ev) => events.append(&mut ev),
                Err(fault) => {
                    cascade.halted = true;
                    error!(cascade = %id, error = %fault, "cascade halted");
                }
            }
        }
        events
    }

    /// Store per-window fingerprints on their actors.
    pub fn record_fingerprints<'a>(&self, fingerprints: impl IntoIterator<Item = &'a Fingerprint>) {
        for fp in fingerprints {
            if let Some(mut actor) = self.actors.get_mut(&fp.actor) {
                actor.fingerprints.insert(fp.window, fp.clone());
            }
        }
    }

    /// Archive actors silent for at least `inactivity_ms`. Returns how many were archived.
    pub fn archive_inactive_actors(&self, now: Timestamp, inactivity_ms: i64) -> usize {
        let mut archived = 0;
        for mut actor in self.actors.iter_mut() {
            if !actor.archived && now.saturating_sub(actor.last_seen) >= inactivity_ms {
                actor.archived = true;
                archived += 1;
            }
        }
        archived
    }

    // ── Queries ────────────────────────────────────────

    /// Copy of a cascade.
    pub fn cascade(&self, id: &CascadeId) -> Option<Cascade> {
        let handle = self.cascades.get(id).map(|r| Arc::clone(r.value()))?;
        let c = handle.lock().clone();
        Some(c)
    }

    /// Population summary of a cascade.
    pub fn population(&self, id: &CascadeId) -> Option<PopulationSummary> {
        let handle = self.cascades.get(id).map(|r| Arc::clone(r.value()))?;
        let p = handle.lock().population.clone();
        Some(p)
    }

    /// All cascade ids, sorted.
    pub fn cascade_ids(&self) -> Vec<CascadeId> {
        let mut ids: Vec<CascadeId> = self.cascades.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Cascade an accepted unit belongs to.
    pub fn cascade_of(&self, unit: &UnitId) -> Option<CascadeId> {
        self.units.get(unit).map(|e| e.cascade.clone())
    }

    /// Copy of an accepted unit.
    pub fn unit(&self, id: &UnitId) -> Option<NarrativeUnit> {
        self.units.get(id).map(|e| e.unit.clone())
    }

    /// Copy of an actor.
    pub fn actor(&self, id: &ActorId) -> Option<Actor> {
        self.actors.get(id).map(|a| a.value().clone())
    }

    /// Accepted unit count.
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Ids currently waiting for a parent, sorted.
    pub fn pending_orphans(&self) -> Vec<UnitId> {
        self.pending.lock().entries.keys().cloned().collect()
    }

    /// Timestamp of the earliest accepted unit.
    pub fn earliest_timestamp(&self) -> Option<Timestamp> {
        let t = self.earliest.load(Ordering::Acquire);
        (t != i64::MAX).then_some(t)
    }

    /// End of the last closed window (`i64::MIN` while nothing is closed).
    pub fn closed_until(&self) -> Timestamp {
        self.closed_until.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::CascadeThresholds;
    use crate::model::{ArrivalBucket, PropagationKind, RiskTarget};

    fn graph() -> NarrativeGraph {
        NarrativeGraph::new(GraphConfig { signature_dim: 2, ..Default::default() })
    }

    fn obj(id: &str, actor: &str, ts: i64, parent: Option<&str>) -> NormalizedObject {
        NormalizedObject {
            id: Some(id.into()),
            actor_id: Some(actor.into()),
            timestamp: Some(ts),
            signature: Some(vec![1.0, 0.0]),
            parent_id: parent.map(str::to_owned),
            relation: PropagationKind::Repost,
            ..Default::default()
        }
    }

    #[test]
    fn test_root_spawns_cascade_and_child_joins() {
        let g = graph();
        let r = g.ingest(obj("r", "a", 1_000, None), 1_000).unwrap();
        assert_eq!(r, IngestOutcome::Accepted { cascade: CascadeId::new("c:r"), spawned: true });
        let c = g.ingest(obj("c1", "b", 2_000, Some("r")), 2_000).unwrap();
        assert_eq!(c, IngestOutcome::Accepted { cascade: CascadeId::new("c:r"), spawned: false });
        assert_eq!(g.cascade(&CascadeId::new("c:r")).unwrap().len(), 2);
        assert_eq!(g.actor(&ActorId::new("b")).unwrap().unit_count, 1);
    }

    #[test]
    fn test_validation_rejects_without_mutation() {
        let g = graph();
        let mut bad = obj("x", "a", 0, None);
        bad.signature = Some(vec![1.0]);
        assert!(matches!(
            g.ingest(bad, 0),
            Err(IngestError::Validation(ValidationError::SignatureLength { expected: 2, found: 1 }))
        ));
        let mut nan = obj("x", "a", 0, None);
        nan.signature = Some(vec![f32::NAN, 0.0]);
        assert_eq!(g.ingest(nan, 0), Err(IngestError::Validation(ValidationError::SignatureNotFinite)));
        let mut missing = obj("x", "a", 0, None);
        missing.actor_id = Some("  ".into());
        assert_eq!(g.ingest(missing, 0), Err(IngestError::Validation(ValidationError::MissingField("actor_id"))));
        assert!(matches!(
            g.ingest(obj("x", "a", 10_000_000, None), 0),
            Err(IngestError::Validation(ValidationError::TimestampSkew { .. }))
        ));
        let week = 7 * 24 * 3_600_000;
        assert_eq!(
            g.ingest(obj("x", "a", 0, None), week + 1),
            Err(IngestError::Validation(ValidationError::TimestampSkew { timestamp: 0, now: week + 1, max_skew_ms: week }))
        );
        assert!(matches!(
            g.ingest(obj("x", "a", 0, Some("x")), 0),
            Err(IngestError::Validation(ValidationError::SelfParent(_)))
        ));
        assert_eq!(g.unit_count(), 0);
        assert!(g.cascade_ids().is_empty());
    }

    #[test]
    fn test_buffered_chain_resolves_in_order() {
        let g = graph();
        assert_eq!(
            g.ingest(obj("gc", "c", 3_000, Some("c1")), 3_000).unwrap(),
            IngestOutcome::Buffered { parent: UnitId::new("c1") }
        );
        assert!(matches!(g.ingest(obj("c1", "b", 2_000, Some("r")), 3_100).unwrap(), IngestOutcome::Buffered { .. }));
        g.ingest(obj("r", "a", 1_000, None), 3_200).unwrap();

        let c = g.cascade(&CascadeId::new("c:r")).unwrap();
        let members: Vec<&str> = c.members.iter().map(|m| m.as_str()).collect();
        assert_eq!(members, vec!["r", "c1", "gc"]);
        assert!(g.pending_orphans().is_empty());
    }

    #[test]
    fn test_sweep_rejects_expired_orphans_only() {
        let g = graph();
        g.ingest(obj("old", "a", 0, Some("ghost")), 0).unwrap();
        g.ingest(obj("new", "a", 15_000, Some("ghost")), 15_000).unwrap();
        let rejected = g.sweep_orphans(20_000);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].unit, UnitId::new("old"));
        assert_eq!(g.pending_orphans(), vec![UnitId::new("new")]);
        assert!(g.cascade_of(&UnitId::new("old")).is_none());
    }

    #[test]
    fn test_freeze_closes_window() {
        let g = graph();
        g.ingest(obj("r", "a", 1_000, None), 1_000).unwrap();
        g.ingest(obj("c", "b", 119_000, Some("r")), 119_000).unwrap();
        let window = WindowConfig::default();
        let (snaps, plan) = g.freeze_ready(&window, ClosePlan::starting_at(WindowId(0), 1), 150_000);
        assert_eq!(snaps.len(), 1);
        assert_eq!(plan.next, WindowId(1));
        assert_eq!(snaps[0].units.len(), 2);
        assert_eq!(snaps[0].units[1].parent_actor, Some(ActorId::new("a")));
        assert_eq!(g.closed_until(), 120_000);
        assert!(matches!(
            g.ingest(obj("late", "b", 100_000, Some("r")), 150_000),
            Err(IngestError::Validation(ValidationError::StaleTimestamp { .. }))
        ));
    }

    #[test]
    fn test_freeze_ready_skips_empty_gap() {
        let g = graph();
        let window = WindowConfig::default();
        let far = 1_000 * 120_000;
        g.ingest(obj("a", "x", 1_000, None), 1_000).unwrap();
        g.ingest(obj("b", "y", far + 1_000, None), far + 1_000).unwrap();

        let (snaps, plan) = g.freeze_ready(&window, ClosePlan::starting_at(WindowId(0), 2), far + 150_000);
        let ids: Vec<i64> = snaps.iter().map(|s| s.span.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 1_000]);
        assert_eq!(plan.next, WindowId(1_001));
        assert_eq!(plan.last_active, Some(WindowId(1_000)));
        assert_eq!(g.closed_until(), far + 120_000);

        // a skipped window is closed all the same
        assert!(matches!(
            g.ingest(obj("mid", "z", 500 * 120_000, None), far + 150_000),
            Err(IngestError::Validation(ValidationError::StaleTimestamp { .. }))
        ));
        let (none, same) = g.freeze_ready(&window, plan, far + 150_000);
        assert!(none.is_empty());
        assert_eq!(same, plan);
    }

    #[test]
    fn test_halted_cascade_rejects_while_others_continue() {
        let g = graph();
        let tracker = CascadeTracker::new(CascadeThresholds::default(), 60_000);
        g.ingest(obj("a", "x", 1_000, None), 1_000).unwrap();
        g.ingest(obj("b", "y", 2_000, None), 2_000).unwrap();
        let a = CascadeId::new("c:a");
        let b = CascadeId::new("c:b");
        // break the ordering of c:a's arrival history
        let handle = g.cascades.get(&a).map(|r| Arc::clone(r.value())).unwrap();
        handle.lock().history.push(ArrivalBucket { bucket: -4, count: 1 });

        g.advance_cascades(120_000, &tracker);
        assert!(g.cascade(&a).unwrap().halted);
        assert!(!g.cascade(&b).unwrap().halted);

        assert_eq!(g.ingest(obj("a1", "z", 130_000, Some("a")), 130_000), Err(IngestError::CascadeHalted(a.clone())));
        assert!(g.cascade_of(&UnitId::new("a1")).is_none());
        assert_eq!(
            g.ingest(obj("b1", "z", 130_000, Some("b")), 130_000).unwrap(),
            IngestOutcome::Accepted { cascade: b.clone(), spawned: false }
        );

        // c:b goes quiet and archives; c:a stays frozen where it halted
        let events = g.advance_cascades(10 * 60_000, &tracker);
        assert!(!events.is_empty());
        assert!(events.iter().all(|e| e.target == RiskTarget::Cascade(b.clone())));
        assert_eq!(g.cascade(&b).unwrap().state, CascadeState::Archived);
        assert_eq!(g.cascade(&a).unwrap().state, CascadeState::Emerging);
    }

    #[test]
    fn test_child_released_into_closed_window_is_reported() {
        let g = graph();
        let window = WindowConfig::default();
        g.ingest(obj("c", "b", 100_000, Some("p")), 100_000).unwrap();
        // window 0 closes while the child still waits
        g.freeze_ready(&window, ClosePlan::starting_at(WindowId(0), 1), 150_000);
        assert_eq!(g.closed_until(), 120_000);
        assert!(g.take_deferred_rejections().is_empty());

        let out = g.ingest(obj("p", "a", 130_000, None), 150_000).unwrap();
        assert_eq!(out, IngestOutcome::Accepted { cascade: CascadeId::new("c:p"), spawned: true });
        let rejected = g.take_deferred_rejections();
        assert_eq!(rejected.len(), 1);
        assert_eq!((rejected[0].unit.as_str(), rejected[0].parent.as_str()), ("c", "p"));
        assert!(matches!(rejected[0].reason, IngestError::Validation(ValidationError::StaleTimestamp { .. })));
        assert!(g.cascade_of(&UnitId::new("c")).is_none());
        assert!(g.pending_orphans().is_empty());
        assert!(g.take_deferred_rejections().is_empty());
    }

    #[test]
    fn test_unpublished_parent_cascade_reports_ingestion_time() {
        let g = graph();
        g.ingest(obj("p", "a", 1_000, None), 1_000).unwrap();
        // the parent is accepted but its cascade is not visible
        g.cascades.remove(&CascadeId::new("c:p"));
        let (unit, _) = g.validate(obj("c", "b", 2_000, Some("p")), 5_000).unwrap();
        assert_eq!(
            g.attach(unit, None, 5_000),
            Err(IngestError::Orphan(OrphanReferenceError {
                unit: UnitId::new("c"),
                parent: UnitId::new("p"),
                buffered_at: 5_000,
            }))
        );
        assert_eq!(g.unit_count(), 1);
    }
}
