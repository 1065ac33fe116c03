/*
 * This source code is licensed under the Business Source License 1.1.
 */

//! Coordination cluster detection over one window's fingerprints.
//!
//! # Algorithm
//!
//! 1. Pairwise cosine similarity of fingerprint vectors (rows in parallel).
//! 2. Edge `i — j` when similarity is strictly above `similarity_threshold`.
//! 3. Connected components via union-find.
//! 4. A component whose internal edge density is below `density_floor` is
//!    split by label propagation: actors visited in id order, each adopting
//!    the label with the largest similarity-weighted vote among its
//!    neighbours, ties to the lowest label.
//! 5. Groups smaller than `min_size` (never less than 2) or below the density
//!    floor are discarded.
//!
//! Cross-window continuity is a best-overlap linkage ([`link_clusters`]); no
//! cluster object survives past its window.
//!
//! # Invariants
//!
//! - Identical fingerprints produce identical membership and identifiers.
//! - Clusters of one window are disjoint and have at least two members.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;
use tracing::debug;

use crate::fingerprint::Fingerprint;
use crate::model::{ActorId, ClusterId, CoordinationCluster, RiskTarget, TimelineEvent, TimelineEventKind, Timestamp};
use crate::signature::{cosine, fnv1a64};
use crate::window::{WindowId, WindowSnapshot};

/// Tunable clustering semantics.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusterConfig {
    /// τ_sim: edges require similarity strictly above this. Default 0.85.
    pub similarity_threshold: f32,
    /// Minimum fraction of member pairs joined by an edge. Default 0.5.
    pub density_floor: f32,
    /// Minimum members; values below 2 are treated as 2. Default 2.
    pub min_size: usize,
    /// Minimum Jaccard overlap for cross-window linkage. Default 0.3.
    pub overlap_threshold: f32,
    /// Label propagation sweep limit. Default 20.
    pub max_label_iterations: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            density_floor: 0.5,
            min_size: 2,
            overlap_threshold: 0.3,
            max_label_iterations: 20,
        }
    }
}

/// Why a window produced no clusters without anything being wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DegenerateReason {
    /// Fewer than two active actors.
    TooFewActors,
    /// No fingerprint carries any signal.
    NoSignal,
}

/// Clusters found in one window.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterDetection {
    /// Window analysed.
    pub window: WindowId,
    /// Disjoint clusters, ordered by lowest member id.
    pub clusters: Vec<CoordinationCluster>,
    /// Set when the window was degenerate (result is then empty).
    pub degenerate: Option<DegenerateReason>,
}

impl ClusterDetection {
    fn degenerate(window: WindowId, reason: DegenerateReason) -> Self {
        Self { window, clusters: Vec::new(), degenerate: Some(reason) }
    }

    /// Cluster containing `actor`, if any.
    pub fn cluster_of(&self, actor: &ActorId) -> Option<&CoordinationCluster> {
        self.clusters.iter().find(|c| c.members.contains(actor))
    }
}

// ─── Union-find ──────────────────────────────────────────────────────────────

struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect(), rank: vec![0; n] }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            core::cmp::Ordering::Less => self.parent[ra] = rb,
            core::cmp::Ordering::Greater => self.parent[rb] = ra,
            core::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] = self.rank[ra].saturating_add(1);
            }
        }
    }
}

// ─── Detector ────────────────────────────────────────────────────────────────

/// Deterministic coordination cluster detector.
#[derive(Clone, Debug, Default)]
pub struct ClusterDetector {
    config: ClusterConfig,
}

impl ClusterDetector {
    /// Detector with the given settings.
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    /// Configured settings.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Group the window's actors into coordination clusters.
    pub fn detect_clusters(
        &self,
        fingerprints: &BTreeMap<ActorId, Fingerprint>,
        snapshot: &WindowSnapshot,
    ) -> ClusterDetection {
        let window = snapshot.span.id;
        if fingerprints.len() < 2 {
            return ClusterDetection::degenerate(window, DegenerateReason::TooFewActors);
        }
        let actors: Vec<&Fingerprint> = fingerprints.values().filter(|fp| fp.has_signal()).collect();
        if actors.is_empty() {
            return ClusterDetection::degenerate(window, DegenerateReason::NoSignal);
        }

        let n = actors.len();
        let sim: Vec<Vec<f32>> = (0..n)
            .into_par_iter()
            .map(|i| {
                (0..n)
                    .map(|j| if i == j { 1.0 } else { cosine(&actors[i].vector, &actors[j].vector) })
                    .collect()
            })
            .collect();
        let tau = self.config.similarity_threshold;
        let edge = |i: usize, j: usize| i != j && sim[i][j] > tau;

        let mut uf = UnionFind::new(n);
        for i in 0..n {
            for j in (i + 1)..n {
                if edge(i, j) {
                    uf.union(i, j);
                }
            }
        }
        // indices are in actor-id order, so each group is too
        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut root_first: BTreeMap<usize, usize> = BTreeMap::new();
        for i in 0..n {
            let r = uf.find(i);
            let first = *root_first.entry(r).or_insert(i);
            components.entry(first).or_default().push(i);
        }

        let min_size = self.config.min_size.max(2);
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for comp in components.into_values() {
            if comp.len() < min_size {
                continue;
            }
            if density(&comp, &edge) >= self.config.density_floor {
                groups.push(comp);
            } else {
                for community in self.propagate_labels(&comp, &sim, &edge) {
                    if community.len() >= min_size && density(&community, &edge) >= self.config.density_floor {
                        groups.push(community);
                    }
                }
            }
        }
        groups.sort_by_key(|g| g[0]);

        let clusters: Vec<CoordinationCluster> = groups
            .iter()
            .map(|g| {
                let members: BTreeSet<ActorId> = g.iter().map(|&i| actors[i].actor.clone()).collect();
                let cascades = snapshot
                    .units
                    .iter()
                    .filter(|u| members.contains(&u.actor))
                    .map(|u| u.cascade.clone())
                    .collect();
                CoordinationCluster {
                    id: cluster_id(window, &members),
                    window,
                    similarity: mean_similarity(g, &sim),
                    density: density(g, &edge),
                    members,
                    cascades,
                    predecessors: Vec::new(),
                }
            })
            .collect();

        debug!(window = %window, actors = n, clusters = clusters.len(), "clusters detected");
        ClusterDetection { window, clusters, degenerate: None }
    }

    /// Split a sparse component into communities.
    fn propagate_labels(
        &self,
        comp: &[usize],
        sim: &[Vec<f32>],
        edge: &impl Fn(usize, usize) -> bool,
    ) -> Vec<Vec<usize>> {
        let mut label: BTreeMap<usize, usize> = comp.iter().map(|&i| (i, i)).collect();
        for _ in 0..self.config.max_label_iterations.max(1) {
            let mut changed = false;
            for &i in comp {
                let mut votes: BTreeMap<usize, f32> = BTreeMap::new();
                for &j in comp {
                    if edge(i, j) {
                        *votes.entry(label[&j]).or_default() += sim[i][j];
                    }
                }
                // BTreeMap iterates ascending, so strict `>` keeps the lowest label on ties
                let mut best: Option<(usize, f32)> = None;
                for (&l, &w) in &votes {
                    if best.map_or(true, |(_, bw)| w > bw) {
                        best = Some((l, w));
                    }
                }
                if let Some((l, _)) = best {
                    if label[&i] != l {
                        label.insert(i, l);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, l) in label {
            groups.entry(l).or_default().push(i);
        }
        groups.into_values().collect()
    }
}

fn density(group: &[usize], edge: &impl Fn(usize, usize) -> bool) -> f32 {
    let k = group.len();
    if k < 2 {
        return 0.0;
    }
    let mut links = 0usize;
    for (a, &i) in group.iter().enumerate() {
        for &j in &group[a + 1..] {
            if edge(i, j) {
                links += 1;
            }
        }
    }
    links as f32 / (k * (k - 1) / 2) as f32
}

fn mean_similarity(group: &[usize], sim: &[Vec<f32>]) -> f32 {
    let k = group.len();
    if k < 2 {
        return 0.0;
    }
    let mut total = 0.0f64;
    for (a, &i) in group.iter().enumerate() {
        for &j in &group[a + 1..] {
            total += f64::from(sim[i][j]);
        }
    }
    (total / (k * (k - 1) / 2) as f64) as f32
}

/// `w<window>-<fnv1a64 of sorted member ids>`.
pub fn cluster_id(window: WindowId, members: &BTreeSet<ActorId>) -> ClusterId {
    let h = fnv1a64(members.iter().map(|m| m.as_str().as_bytes()));
    ClusterId::new(format!("w{}-{h:016x}", window.0))
}

// ─── Cross-window linkage ────────────────────────────────────────────────────

/// Link `current` clusters to the previous window's clusters by Jaccard overlap.
///
/// Fills each cluster's `predecessors` (best overlap first, then id) and
/// returns formed / merged / dissolved events stamped at `at`. A cluster with
/// exactly one predecessor is a continuation and emits nothing.
pub fn link_clusters(
    prior: &[CoordinationCluster],
    current: &mut [CoordinationCluster],
    overlap_threshold: f32,
    at: Timestamp,
) -> Vec<TimelineEvent> {
    let mut events = Vec::new();
    let mut continued: BTreeSet<ClusterId> = BTreeSet::new();

    for cluster in current.iter_mut() {
        let mut preds: Vec<(f32, &CoordinationCluster)> = prior
            .iter()
            .map(|p| (cluster.jaccard(p), p))
            .filter(|(j, _)| *j >= overlap_threshold && *j > 0.0)
            .collect();
        preds.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        cluster.predecessors = preds.iter().map(|(_, p)| p.id.clone()).collect();
        continued.extend(cluster.predecessors.iter().cloned());

        let target = RiskTarget::Cluster(cluster.id.clone());
        match cluster.predecessors.len() {
            0 => events.push(TimelineEvent {
                target,
                kind: TimelineEventKind::ClusterFormed,
                timestamp: at,
                summary: format!(
                    "formed with {} members (similarity {:.2}, density {:.2}) across {} cascade(s)",
                    cluster.size(),
                    cluster.similarity,
                    cluster.density,
                    cluster.cascades.len()
                ),
            }),
            1 => {}
            k => events.push(TimelineEvent {
                target,
                kind: TimelineEventKind::ClusterMerged { from: cluster.predecessors.clone() },
                timestamp: at,
                summary: format!("merged {k} prior clusters into {} members", cluster.size()),
            }),
        }
    }

    for p in prior.iter().filter(|p| !continued.contains(&p.id)) {
        events.push(TimelineEvent {
            target: RiskTarget::Cluster(p.id.clone()),
            kind: TimelineEventKind::ClusterDissolved,
            timestamp: at,
            summary: format!("dissolved after window {} ({} members)", p.window, p.size()),
        });
    }
    events
}
