/*
 * This source code is licensed under the Business Source License 1.1.
 */

//! Behavioural fingerprints — per actor, per closed window.
//!
//! A fingerprint summarises *how* an actor behaved inside one frozen
//! [`WindowSnapshot`], in three blocks:
//!
//! | Block   | Raw features                                         |
//! |---------|------------------------------------------------------|
//! | cadence | inter-post interval mean/variance, burstiness, count |
//! | content | centroid of the signatures posted in-window          |
//! | network | in/out-degree, local clustering coefficient          |
//!
//! The raw features are kept for explanation. The combined `vector` is what
//! the cluster detector compares: each block is squashed into `[0, 1]` and
//! scaled by its block weight so that no block dominates by magnitude alone.
//!
//! # Invariants
//!
//! - Pure in the snapshot: the same snapshot yields bit-identical fingerprints.
//! - The network graph is restricted to edges whose child unit is in the window.
//! - Self-propagation (an actor sharing its own unit) is not an edge.
//!
//! [`CollectiveCadence`] pools the arrival rhythm of a whole cluster. A member
//! with a single post has no cadence of its own and borrows the cluster's.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use rayon::prelude::*;

use crate::model::{ActorId, Timestamp};
use crate::signature::{centroid, normalize};
use crate::window::{WindowId, WindowSnapshot};

/// Block weights and squashing scales for the combined vector.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FingerprintConfig {
    /// Weight of the content block. Default 0.6.
    pub content_weight: f32,
    /// Weight of the cadence block. Default 0.25.
    pub cadence_weight: f32,
    /// Weight of the network block. Default 0.15.
    pub network_weight: f32,
    /// Interval at which the posting-rate feature reaches 0.5. Default 60 s.
    pub interval_scale_ms: f64,
    /// Post count at which the intensity feature reaches 0.5. Default 4.
    pub intensity_scale: f32,
    /// Degree at which the degree features reach 0.5. Default 4.
    pub degree_scale: f32,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            content_weight: 0.6,
            cadence_weight: 0.25,
            network_weight: 0.15,
            interval_scale_ms: 60_000.0,
            intensity_scale: 4.0,
            degree_scale: 4.0,
        }
    }
}

/// One actor's behaviour in one window.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Fingerprint {
    /// Actor described.
    pub actor: ActorId,
    /// Window the fingerprint was computed for.
    pub window: WindowId,
    /// Units authored in the window.
    pub post_count: u32,
    /// Mean inter-post interval in ms (`None` with fewer than two posts).
    pub mean_interval_ms: Option<f64>,
    /// Population variance of the inter-post intervals.
    pub interval_variance: Option<f64>,
    /// Goh–Barabási burstiness in [-1, 1]; `None` with fewer than two intervals.
    pub burstiness: Option<f32>,
    /// Mean of the signatures posted in-window.
    pub content_centroid: Vec<f32>,
    /// Distinct actors that propagated this actor's units in-window.
    pub in_degree: u32,
    /// Distinct actors whose units this actor propagated in-window.
    pub out_degree: u32,
    /// Local clustering coefficient on the undirected window graph.
    pub clustering_coefficient: f32,
    /// Account age at freeze time.
    pub account_age_days: Option<f32>,
    /// Weighted, squashed feature vector used for similarity.
    pub vector: Vec<f32>,
}

/// Scalar features tracked by the population baseline.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FingerprintScalars {
    /// `ln(1 + mean interval in seconds)`.
    pub log_interval: Option<f64>,
    /// Burstiness index.
    pub burstiness: Option<f64>,
    /// `ln(1 + post count)`.
    pub log_posts: f64,
    /// `ln(1 + account age in days)`.
    pub log_account_age: Option<f64>,
}

impl Fingerprint {
    /// Baseline-facing scalars.
    pub fn scalars(&self) -> FingerprintScalars {
        FingerprintScalars {
            log_interval: self.mean_interval_ms.map(log_interval),
            burstiness: self.burstiness.map(f64::from),
            log_posts: f64::from(self.post_count).ln_1p(),
            log_account_age: self.account_age_days.map(|d| f64::from(d.max(0.0)).ln_1p()),
        }
    }

    /// True when the combined vector carries any direction at all.
    pub fn has_signal(&self) -> bool {
        self.vector.iter().any(|x| *x != 0.0)
    }
}

/// `ln(1 + seconds)` of an interval in ms.
fn log_interval(ms: f64) -> f64 {
    (ms / 1_000.0).max(0.0).ln_1p()
}

// ─── Collective cadence ──────────────────────────────────────────────────────

/// Inter-arrival rhythm of a group of actors posting as one.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CollectiveCadence {
    /// Mean gap between consecutive posts of the group, in ms.
    pub mean_interval_ms: Option<f64>,
    /// Burstiness of those gaps.
    pub burstiness: Option<f32>,
}

impl CollectiveCadence {
    /// Cadence of the pooled `timestamps`, in any order.
    pub fn from_timestamps(timestamps: &[Timestamp]) -> Self {
        let mut ts = timestamps.to_vec();
        ts.sort_unstable();
        let intervals: Vec<f64> = ts.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
        Self { mean_interval_ms: mean_variance(&intervals).0, burstiness: burstiness(&intervals) }
    }

    /// `own` with its missing cadence scalars taken from the group.
    pub fn fill(&self, own: FingerprintScalars) -> FingerprintScalars {
        FingerprintScalars {
            log_interval: own.log_interval.or(self.mean_interval_ms.map(log_interval)),
            burstiness: own.burstiness.or(self.burstiness.map(f64::from)),
            ..own
        }
    }
}

// ─── Window index ────────────────────────────────────────────────────────────

/// Per-window lookup tables shared by every actor's extraction.
struct SnapshotIndex<'a> {
    units_by_actor: HashMap<&'a ActorId, Vec<usize>>,
    out_neighbours: HashMap<&'a ActorId, BTreeSet<&'a ActorId>>,
    in_neighbours: HashMap<&'a ActorId, BTreeSet<&'a ActorId>>,
}

impl<'a> SnapshotIndex<'a> {
    fn build(snapshot: &'a WindowSnapshot) -> Self {
        let mut units_by_actor: HashMap<&ActorId, Vec<usize>> = HashMap::new();
        let mut out_neighbours: HashMap<&ActorId, BTreeSet<&ActorId>> = HashMap::new();
        let mut in_neighbours: HashMap<&ActorId, BTreeSet<&ActorId>> = HashMap::new();

        for (i, unit) in snapshot.units.iter().enumerate() {
            units_by_actor.entry(&unit.actor).or_default().push(i);
            if let Some(parent) = unit.parent_actor.as_ref().filter(|p| **p != unit.actor) {
                out_neighbours.entry(&unit.actor).or_default().insert(parent);
                in_neighbours.entry(parent).or_default().insert(&unit.actor);
            }
        }
        Self { units_by_actor, out_neighbours, in_neighbours }
    }

    fn neighbours(&self, actor: &ActorId) -> BTreeSet<&'a ActorId> {
        let mut set = BTreeSet::new();
        if let Some(out) = self.out_neighbours.get(actor) {
            set.extend(out.iter().copied());
        }
        if let Some(inc) = self.in_neighbours.get(actor) {
            set.extend(inc.iter().copied());
        }
        set
    }

    fn linked(&self, a: &ActorId, b: &ActorId) -> bool {
        let has = |x: &ActorId, y: &ActorId| self.out_neighbours.get(x).is_some_and(|s| s.contains(y));
        has(a, b) || has(b, a)
    }

    fn clustering_coefficient(&self, actor: &ActorId) -> f32 {
        let nbrs: Vec<&ActorId> = self.neighbours(actor).into_iter().collect();
        let k = nbrs.len();
        if k < 2 {
            return 0.0;
        }
        let mut links = 0usize;
        for i in 0..k {
            for j in (i + 1)..k {
                if self.linked(nbrs[i], nbrs[j]) {
                    links += 1;
                }
            }
        }
        links as f32 / (k * (k - 1) / 2) as f32
    }
}

// ─── Extractor ───────────────────────────────────────────────────────────────

/// Computes fingerprints from frozen window snapshots.
#[derive(Clone, Debug, Default)]
pub struct FingerprintExtractor {
    config: FingerprintConfig,
}

impl FingerprintExtractor {
    /// Extractor with the given weights.
    pub fn new(config: FingerprintConfig) -> Self {
        Self { config }
    }

    /// Configured weights.
    pub fn config(&self) -> &FingerprintConfig {
        &self.config
    }

    /// Fingerprint of one actor, or `None` if it authored nothing in the window.
    pub fn compute_fingerprint(&self, actor: &ActorId, snapshot: &WindowSnapshot) -> Option<Fingerprint> {
        let index = SnapshotIndex::build(snapshot);
        self.extract(&index, actor, snapshot)
    }

    /// Fingerprints of every active actor, computed in parallel, keyed in id order.
    pub fn extract_all(&self, snapshot: &WindowSnapshot) -> BTreeMap<ActorId, Fingerprint> {
        let index = SnapshotIndex::build(snapshot);
        let actors: Vec<ActorId> = snapshot.active_actors().into_iter().collect();
        actors
            .par_iter()
            .filter_map(|actor| self.extract(&index, actor, snapshot))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|fp| (fp.actor.clone(), fp))
            .collect()
    }

    fn extract(&self, index: &SnapshotIndex<'_>, actor: &ActorId, snapshot: &WindowSnapshot) -> Option<Fingerprint> {
        let positions = index.units_by_actor.get(actor)?;
        let units: Vec<_> = positions.iter().map(|&i| &snapshot.units[i]).collect();

        // units are already ordered by (timestamp, id)
        let intervals: Vec<f64> = units
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp) as f64)
            .collect();
        let (mean, variance) = mean_variance(&intervals);
        let burstiness = burstiness(&intervals);

        let content_centroid = centroid(units.iter().map(|u| u.signature.as_slice())).unwrap_or_default();
        let in_degree = index.in_neighbours.get(actor).map_or(0, |s| s.len()) as u32;
        let out_degree = index.out_neighbours.get(actor).map_or(0, |s| s.len()) as u32;
        let clustering_coefficient = index.clustering_coefficient(actor);

        let mut fp = Fingerprint {
            actor: actor.clone(),
            window: snapshot.span.id,
            post_count: units.len() as u32,
            mean_interval_ms: mean,
            interval_variance: variance,
            burstiness,
            content_centroid,
            in_degree,
            out_degree,
            clustering_coefficient,
            account_age_days: snapshot.actors.get(actor).and_then(|m| m.account_age_days),
            vector: Vec::new(),
        };
        fp.vector = self.combine(&fp);
        Some(fp)
    }

    /// Build the weighted similarity vector from raw features.
    fn combine(&self, fp: &Fingerprint) -> Vec<f32> {
        let c = &self.config;
        let mut content = fp.content_centroid.clone();
        normalize(&mut content);

        let intensity = squash(fp.post_count as f32, c.intensity_scale);
        let cadence = match fp.mean_interval_ms {
            Some(mean) => {
                let rate = (1.0 / (1.0 + mean.max(0.0) / c.interval_scale_ms.max(1.0))) as f32;
                let regularity = (1.0 - fp.burstiness.unwrap_or(0.0)) / 2.0;
                [rate, regularity, intensity]
            }
            None => [0.0, 0.0, intensity],
        };
        let network = [
            squash(fp.in_degree as f32, c.degree_scale),
            squash(fp.out_degree as f32, c.degree_scale),
            fp.clustering_coefficient,
        ];

        let mut v = Vec::with_capacity(content.len() + 6);
        v.extend(content.iter().map(|x| x * c.content_weight));
        v.extend(cadence.iter().map(|x| x * c.cadence_weight));
        v.extend(network.iter().map(|x| x * c.network_weight));
        v
    }
}

/// `x / (x + scale)`, in [0, 1) for non-negative `x`.
fn squash(x: f32, scale: f32) -> f32 {
    let s = scale.max(f32::EPSILON);
    x.max(0.0) / (x.max(0.0) + s)
}

fn mean_variance(xs: &[f64]) -> (Option<f64>, Option<f64>) {
    if xs.is_empty() {
        return (None, None);
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    (Some(mean), Some(var))
}

/// Goh–Barabási burstiness `(σ − μ) / (σ + μ)`.
fn burstiness(intervals: &[f64]) -> Option<f32> {
    if intervals.len() < 2 {
        return None;
    }
    let (mean, var) = mean_variance(intervals);
    let (mu, sigma) = (mean?, var?.sqrt());
    if mu + sigma <= 0.0 {
        return None;
    }
    Some(((sigma - mu) / (sigma + mu)) as f32)
}
