//! # narrascope-core
//!
//! Coordinated amplification detection for narrative cascades.
//!
//! ---
//!
//! ## This is not a content classifier. It is a behaviour detector.
//!
//! Nothing here reads text. Content arrives as a fixed-length similarity
//! signature computed upstream; claims and sentiment are carried through
//! untouched. What the engine looks at is *how* content spreads.
//!
//! **Cascades** — every root post starts a propagation tree. Its arrival rate
//! is bucketed and walked through a forward-only lifecycle:
//! emerging, amplifying, peaked, decaying, archived.
//!
//! **Fingerprints** — for every actor active in a closed window, a vector of
//! posting cadence, content centroid, and network position.
//! > "Fifty accounts that post the same thing, two seconds apart, from week-old
//! > profiles, are not fifty people."
//!
//! **Clusters** — a thresholded similarity graph over fingerprints, split into
//! deterministic communities. Same input, same clusters, same identifiers.
//!
//! **Risk** — a convex, monotone combination of cluster density, posting
//! synchrony, and baseline anomaly, with every contribution visible.
//!
//! ---
//!
//! ## The pipeline
//!
//! ```text
//! NormalizedObject → NarrativeGraph → WindowSnapshot → Fingerprint → CoordinationCluster
//!                         │                                                │
//!                   CascadeTracker                                    RiskScorer
//!                         └──────────────→ TimelineLedger ←───────────────┘
//!                                               │
//!                                          RiskBundle → CtiBundle
//! ```
//!
//! ## Module overview
//!
//! | Module | Key types | What it does |
//! |--------|-----------|--------------|
//! | [`model`] | [`NarrativeUnit`], [`Cascade`], [`RiskProfile`] | Object model and identifiers |
//! | [`signature`] | [`ContentSignature`] | Cosine similarity, centroids, stable FNV-1a digests |
//! | [`graph`] | [`NarrativeGraph`], [`IngestOutcome`] | Concurrent ingestion, orphan buffering, window freeze |
//! | [`window`] | [`WindowConfig`], [`WindowSnapshot`] | Epoch-aligned analysis windows |
//! | [`cascade`] | [`CascadeTracker`], [`CascadeThresholds`] | Lifecycle state machine from arrival-rate slope |
//! | [`fingerprint`] | [`FingerprintExtractor`], [`Fingerprint`] | Per-actor cadence, content, network features |
//! | [`baseline`] | [`PopulationBaseline`] | Rolling organic baseline for anomaly z-scores |
//! | [`cluster`] | [`ClusterDetector`], [`link_clusters`] | Deterministic coordination clusters and cross-window linkage |
//! | [`scorer`] | [`RiskScorer`], [`ScoringWeights`] | Explainable bounded risk scores |
//! | [`timeline`] | [`TimelineLedger`], [`RiskBundle`] | Ordered, deduplicated timelines |
//! | [`population`] | [`PopulationSummary`] | Format, platform, landing-page and reach census per cascade |
//! | [`engine`] | [`CoordinationEngine`], [`EngineConfig`] | Concurrent façade: ingest, close windows, query |
//! | [`export`] | [`export::CtiBundle`] | STIX-like CTI bundle (requires `serde` feature) |
//!
//! ## Concurrency
//!
//! [`CoordinationEngine`] is `Send + Sync`; share it behind an `Arc` and call
//! [`CoordinationEngine::ingest`] from any number of producer threads. Window
//! closure is a barrier; analysis runs on the rayon pool.
//!
//! ## Logging
//!
//! Emits `tracing` events and never installs a subscriber.
//!
//! ## License
//!
//! Business Source License 1.1.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod baseline;
pub mod cascade;
pub mod cluster;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod graph;
pub mod model;
pub mod population;
pub mod scorer;
pub mod signature;
pub mod timeline;
pub mod window;

#[cfg(feature = "serde")]
pub mod export;

pub use baseline::{BaselinePrior, PopulationBaseline};
pub use cascade::{CascadeThresholds, CascadeTracker};
pub use cluster::{link_clusters, ClusterConfig, ClusterDetection, ClusterDetector, DegenerateReason};
pub use engine::{CoordinationEngine, EngineConfig, WindowReport};
pub use error::{
    DeferredRejection, EngineError, IngestError, OrphanReferenceError, ScorerConfigError, ValidationError,
    WindowNotReadyError,
};
pub use fingerprint::{CollectiveCadence, Fingerprint, FingerprintConfig, FingerprintExtractor};
pub use graph::{GraphConfig, IngestOutcome, NarrativeGraph};
pub use model::{
    Actor, ActorId, Cascade, CascadeId, CascadeState, Claim, ClusterId, ContentFormat, CoordinationCluster,
    FactorBreakdown, NarrativeUnit, NormalizedObject, PropagationKind, RiskProfile, RiskTarget, TimelineEvent,
    TimelineEventKind, Timestamp, UnitId,
};
pub use population::PopulationSummary;
pub use scorer::{RiskScorer, ScorerConfig, ScoringWeights};
pub use signature::ContentSignature;
pub use timeline::{RiskBundle, TimelineLedger};
pub use window::{WindowConfig, WindowId, WindowSnapshot};
