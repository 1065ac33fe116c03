//! Error types.
//!
//! Recoverable problems are rejections at the ingestion boundary and never
//! mutate state. Degenerate clustering windows are not errors at all — they
//! come back as an empty [`ClusterDetection`](crate::cluster::ClusterDetection)
//! tagged with a reason.

use thiserror::Error;

use crate::model::{CascadeId, Timestamp, UnitId};
use crate::window::WindowId;

/// Malformed or missing input fields. No state was mutated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// A required field is absent or empty.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// Signature length differs from the configured dimension.
    #[error("malformed signature: expected {expected} components, found {found}")]
    SignatureLength {
        /// Configured dimension.
        expected: usize,
        /// Received length.
        found: usize,
    },

    /// Signature contains NaN or infinite components.
    #[error("malformed signature: non-finite component")]
    SignatureNotFinite,

    /// A unit cannot be its own parent.
    #[error("unit {0} references itself as parent")]
    SelfParent(UnitId),

    /// Timestamp is too far ahead of, or behind, the engine clock.
    #[error("timestamp {timestamp} is more than {max_skew_ms} ms away from engine clock {now}")]
    TimestampSkew {
        /// Received timestamp.
        timestamp: Timestamp,
        /// Engine clock at ingestion.
        now: Timestamp,
        /// Accepted skew in the offending direction.
        max_skew_ms: i64,
    },

    /// Timestamp falls inside a window that is already closed.
    #[error("timestamp {timestamp} falls in a closed window (closed until {closed_until})")]
    StaleTimestamp {
        /// Received timestamp.
        timestamp: Timestamp,
        /// End of the last closed window.
        closed_until: Timestamp,
    },
}

/// A buffered unit whose parent never arrived within the grace period.
///
/// The unit is in no cascade and may be re-submitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("orphan reference: unit {unit} waited for parent {parent} since {buffered_at}")]
pub struct OrphanReferenceError {
    /// The rejected unit.
    pub unit: UnitId,
    /// The parent that never resolved.
    pub parent: UnitId,
    /// When the unit was buffered.
    pub buffered_at: Timestamp,
}

/// A buffered unit rejected after its ingestion call had already returned:
/// when its parent arrived, or when the orphan sweep expired it.
///
/// The unit is in no cascade and may be re-submitted.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("buffered unit {unit} (parent {parent}) rejected: {reason}")]
pub struct DeferredRejection {
    /// The rejected unit.
    pub unit: UnitId,
    /// The parent it was waiting for.
    pub parent: UnitId,
    /// Why it could not be attached.
    #[source]
    pub reason: IngestError,
}

impl From<OrphanReferenceError> for DeferredRejection {
    fn from(err: OrphanReferenceError) -> Self {
        Self { unit: err.unit.clone(), parent: err.parent.clone(), reason: IngestError::Orphan(err) }
    }
}

/// Query for a window that has not been closed and published yet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("window {window} is not closed yet; retry after {ready_at}")]
pub struct WindowNotReadyError {
    /// The requested window.
    pub window: WindowId,
    /// Earliest time the window can be closed.
    pub ready_at: Timestamp,
}

/// Why a unit was rejected at ingestion.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    /// Input failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Parent reference unresolved after the grace period.
    #[error(transparent)]
    Orphan(#[from] OrphanReferenceError),

    /// The target cascade was halted by an internal fault.
    #[error("cascade {0} is halted")]
    CascadeHalted(CascadeId),
}

/// Engine-level failures surfaced to callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The requested window is still open.
    #[error(transparent)]
    WindowNotReady(#[from] WindowNotReadyError),

    /// The window's report was dropped by report retention.
    #[error("report of window {0} is no longer retained")]
    ReportEvicted(WindowId),

    /// Window analysis was cancelled by shutdown; nothing was published.
    #[error("analysis of windows {first}..={last} cancelled by shutdown")]
    Cancelled {
        /// First window of the cancelled batch.
        first: WindowId,
        /// Last window of the cancelled batch.
        last: WindowId,
    },

    /// No cascade or cluster with that identifier is known.
    #[error("unknown target {0}")]
    UnknownTarget(String),

    /// Configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Risk scorer weights that do not form a convex combination.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScorerConfigError {
    /// A weight is negative or not finite.
    #[error("weight `{0}` must be a finite, non-negative number")]
    InvalidWeight(&'static str),

    /// Weights do not sum to one.
    #[error("weights sum to {0}, expected 1.0")]
    NotConvex(f32),
}

impl From<ScorerConfigError> for EngineError {
    fn from(err: ScorerConfigError) -> Self {
        EngineError::InvalidConfig(err.to_string())
    }
}
