//! Analysis windows and frozen window snapshots.
//!
//! Time is cut into fixed, epoch-aligned windows `[start, end)`. A window is
//! *ready* once `end + grace` has passed; only then is it frozen into a
//! [`WindowSnapshot`] and handed to the analysis stages, which never look at
//! the live graph.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{ActorId, CascadeId, PropagationKind, Timestamp, UnitId};
use crate::signature::ContentSignature;

/// Index of an epoch-aligned analysis window (`start / length`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize), serde(transparent))]
pub struct WindowId(pub i64);

impl core::fmt::Display for WindowId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Window length and closure grace.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WindowConfig {
    /// Window length in ms. Must be a multiple of the arrival bucket. Default 2 min.
    pub length_ms: i64,
    /// Time after `end` during which late ingestion is still accepted. Default 30 s.
    pub grace_ms: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self { length_ms: 120_000, grace_ms: 30_000 }
    }
}

impl WindowConfig {
    /// First window that is not ready at `now`.
    pub fn horizon(&self, now: Timestamp) -> WindowId {
        self.window_of(now.saturating_sub(self.grace_ms))
    }

    /// The window containing `ts`.
    pub fn window_of(&self, ts: Timestamp) -> WindowId {
        WindowId(ts.div_euclid(self.length_ms))
    }

    /// Time span of a window.
    pub fn span(&self, id: WindowId) -> WindowSpan {
        let start = id.0 * self.length_ms;
        WindowSpan { id, start, end: start + self.length_ms }
    }

    /// Earliest time at which `id` may be closed.
    pub fn ready_at(&self, id: WindowId) -> Timestamp {
        self.span(id).end + self.grace_ms
    }
}

/// Where window closure resumes.
///
/// Windows without units are still published for `tail` windows after the
/// last window that had any, so quiet cascades archive and clusters dissolve
/// on time. Further empty windows are closed without a report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClosePlan {
    /// First window not yet closed.
    pub next: WindowId,
    /// Last window seen with at least one unit.
    pub last_active: Option<WindowId>,
    /// Empty windows published after the last active one.
    pub tail: i64,
}

impl ClosePlan {
    /// Plan starting at `next` with nothing seen yet.
    pub fn starting_at(next: WindowId, tail: i64) -> Self {
        Self { next, last_active: None, tail: tail.max(1) }
    }

    /// True if an empty window `id` still gets a report.
    pub fn publishes_empty(&self, id: WindowId) -> bool {
        self.last_active.is_some_and(|a| id.0 - a.0 <= self.tail)
    }
}

/// A window with its bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WindowSpan {
    /// Window index.
    pub id: WindowId,
    /// Inclusive start, Unix ms.
    pub start: Timestamp,
    /// Exclusive end, Unix ms.
    pub end: Timestamp,
}

impl WindowSpan {
    /// True if `ts` lies in `[start, end)`.
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// One unit as seen by the analysis stages.
#[derive(Clone, Debug)]
pub struct SnapshotUnit {
    /// Unit identifier.
    pub id: UnitId,
    /// Author.
    pub actor: ActorId,
    /// Cascade the unit belongs to.
    pub cascade: CascadeId,
    /// Publication time.
    pub timestamp: Timestamp,
    /// Content signature.
    pub signature: ContentSignature,
    /// Author of the parent unit, if the unit propagates another.
    pub parent_actor: Option<ActorId>,
    /// Propagation edge kind.
    pub relation: PropagationKind,
}

/// Per-actor attributes captured at freeze time.
#[derive(Clone, Debug, Default)]
pub struct ActorMeta {
    /// Account age estimate in days.
    pub account_age_days: Option<f32>,
    /// Platform of origin.
    pub platform: Option<String>,
}

/// A frozen, read-only view of one closed window.
#[derive(Clone, Debug)]
pub struct WindowSnapshot {
    /// Window bounds.
    pub span: WindowSpan,
    /// Units published inside the window, ordered by (timestamp, id).
    pub units: Vec<SnapshotUnit>,
    /// Attributes of every actor referenced by `units` (authors and parent authors).
    pub actors: BTreeMap<ActorId, ActorMeta>,
    /// Milestones of every cascade touched by the window.
    pub milestones: BTreeMap<CascadeId, Vec<Timestamp>>,
}

impl WindowSnapshot {
    /// An empty snapshot for `span`.
    pub fn empty(span: WindowSpan) -> Self {
        Self { span, units: Vec::new(), actors: BTreeMap::new(), milestones: BTreeMap::new() }
    }

    /// Actors that authored at least one unit in the window, in id order.
    pub fn active_actors(&self) -> BTreeSet<ActorId> {
        self.units.iter().map(|u| u.actor.clone()).collect()
    }

    /// Cascades touched by the window, in id order.
    pub fn cascades(&self) -> BTreeSet<CascadeId> {
        self.units.iter().map(|u| u.cascade.clone()).collect()
    }

    /// Units of one cascade.
    pub fn units_in<'a>(&'a self, cascade: &'a CascadeId) -> impl Iterator<Item = &'a SnapshotUnit> + 'a {
        self.units.iter().filter(move |u| &u.cascade == cascade)
    }

    /// Distinct authors of one cascade's window units.
    pub fn participants(&self, cascade: &CascadeId) -> BTreeSet<ActorId> {
        self.units_in(cascade).map(|u| u.actor.clone()).collect()
    }

    /// True when the window saw no units.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
