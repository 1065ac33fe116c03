/*
 * This source code is licensed under the Business Source License 1.1.
 */

//! Cascade lifecycle tracking from arrival-rate statistics.
//!
//! Each cascade moves through five states, forward only:
//!
//! ```text
//! Emerging ──rise──▶ Amplifying ──plateau──▶ Peaked ──decline──▶ Decaying ──quiet──▶ Archived
//! ```
//!
//! The tracker consumes one closed arrival bucket at a time. The *slope* is the
//! mean first difference over a short trailing window of bucket counts, held in
//! a fixed-capacity deque so the hot path never allocates.
//!
//! - **rise**: slope ≥ `rise_slope` for `sustain_buckets` consecutive buckets.
//! - **plateau**: relative slope (slope / current count) ≤ `plateau_tolerance`.
//! - **decline**: slope ≤ −`decline_slope` for `sustain_buckets` consecutive buckets.
//! - **quiet**: `quiescence_buckets` consecutive empty buckets, from any live state.
//!
//! At most one transition happens per bucket, so the sequence is never skipped
//! by a single noisy bucket.

use heapless::Deque;
use thiserror::Error;
use tracing::debug;

use crate::model::{Cascade, CascadeState, RiskTarget, TimelineEvent, TimelineEventKind, Timestamp};

/// Largest supported trailing slope window (in buckets).
pub const MAX_SLOPE_WINDOW: usize = 15;

/// Capacity of the trailing count buffer: a window of `w` slopes needs `w + 1` counts.
const TRAIL_CAPACITY: usize = MAX_SLOPE_WINDOW + 1;

// ─── Thresholds ──────────────────────────────────────────────────────────────

/// Configurable transition thresholds.
///
/// Quiescence is checked before every other rule and applies in any live
/// state. A cascade that goes quiet while still `Emerging` or `Amplifying`
/// moves straight to `Archived`, so an archived cascade need not have passed
/// through `Peaked` or `Decaying`.
///
/// Defaults are calibrated for per-minute buckets on mid-sized platforms and
/// should be re-tuned against real traffic.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CascadeThresholds {
    /// Trailing buckets the slope is averaged over. Clamped to `1..=MAX_SLOPE_WINDOW`. Default 2.
    pub slope_window: usize,
    /// Consecutive buckets a rise or decline must hold. Default 2.
    pub sustain_buckets: u32,
    /// Minimum slope (arrivals per bucket, per bucket) that counts as rising. Default 1.0.
    pub rise_slope: f32,
    /// Relative slope at or below which growth has plateaued. Default 0.2.
    pub plateau_tolerance: f32,
    /// Magnitude of negative slope that counts as declining. Default 1.0.
    pub decline_slope: f32,
    /// Consecutive empty buckets before archival. Default 5.
    pub quiescence_buckets: u32,
}

impl Default for CascadeThresholds {
    fn default() -> Self {
        Self {
            slope_window: 2,
            sustain_buckets: 2,
            rise_slope: 1.0,
            plateau_tolerance: 0.2,
            decline_slope: 1.0,
            quiescence_buckets: 5,
        }
    }
}

// ─── Tracker state ───────────────────────────────────────────────────────────

/// Per-cascade running statistics. Lives inside [`Cascade`].
#[derive(Clone, Debug)]
pub struct TrackerState {
    /// Next bucket to evaluate; `None` until the first evaluation.
    pub(crate) next_bucket: Option<i64>,
    recent: Deque<u32, TRAIL_CAPACITY>,
    rise_run: u32,
    decline_run: u32,
    zero_run: u32,
    last_slope: Option<f32>,
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            next_bucket: None,
            recent: Deque::new(),
            rise_run: 0,
            decline_run: 0,
            zero_run: 0,
            last_slope: None,
        }
    }
}

impl TrackerState {
    /// Slope computed at the most recent step, if enough history existed.
    pub fn last_slope(&self) -> Option<f32> {
        self.last_slope
    }

    fn push(&mut self, count: u32, window: usize) {
        while self.recent.len() > window {
            self.recent.pop_front();
        }
        if self.recent.is_full() {
            self.recent.pop_front();
        }
        // capacity was just ensured above
        let _ = self.recent.push_back(count);
    }

    fn slope(&self) -> Option<f32> {
        let n = self.recent.len();
        if n < 2 {
            return None;
        }
        let first = *self.recent.front()? as f32;
        let last = *self.recent.back()? as f32;
        Some((last - first) / (n - 1) as f32)
    }
}

/// One lifecycle transition observed during replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Bucket at whose close the transition fired.
    pub bucket: i64,
    /// Previous state.
    pub from: CascadeState,
    /// New state.
    pub to: CascadeState,
}

/// Internal invariant violations. Fatal for the affected cascade only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CascadeFault {
    /// Arrival history is not strictly ordered by bucket.
    #[error("arrival history out of order at bucket {0}")]
    HistoryOutOfOrder(i64),
    /// A cascade exists with no member units.
    #[error("cascade has no members")]
    Empty,
}

// ─── Tracker ─────────────────────────────────────────────────────────────────

/// Advances cascade lifecycle state machines.
#[derive(Clone, Debug)]
pub struct CascadeTracker {
    thresholds: CascadeThresholds,
    bucket_ms: i64,
}

impl CascadeTracker {
    /// Build a tracker for a given bucket granularity.
    pub fn new(thresholds: CascadeThresholds, bucket_ms: i64) -> Self {
        Self { thresholds, bucket_ms: bucket_ms.max(1) }
    }

    /// Configured thresholds.
    pub fn thresholds(&self) -> &CascadeThresholds {
        &self.thresholds
    }

    /// Feed one closed bucket; returns the new state if a transition fired.
    pub fn step(&self, current: CascadeState, st: &mut TrackerState, count: u32) -> Option<CascadeState> {
        let th = &self.thresholds;
        st.push(count, th.slope_window.clamp(1, MAX_SLOPE_WINDOW));
        st.zero_run = if count == 0 { st.zero_run + 1 } else { 0 };
        let slope = st.slope();
        st.last_slope = slope;

        if current == CascadeState::Archived {
            return None;
        }
        if st.zero_run >= th.quiescence_buckets.max(1) {
            return Some(CascadeState::Archived);
        }
        let slope = slope?;

        match current {
            CascadeState::Emerging => {
                st.rise_run = if slope >= th.rise_slope { st.rise_run + 1 } else { 0 };
                (st.rise_run >= th.sustain_buckets.max(1)).then_some(CascadeState::Amplifying)
            }
            CascadeState::Amplifying => {
                let relative = slope / (count.max(1) as f32);
                (relative <= th.plateau_tolerance).then_some(CascadeState::Peaked)
            }
            CascadeState::Peaked => {
                st.decline_run = if slope <= -th.decline_slope { st.decline_run + 1 } else { 0 };
                (st.decline_run >= th.sustain_buckets.max(1)).then_some(CascadeState::Decaying)
            }
            CascadeState::Decaying | CascadeState::Archived => None,
        }
    }

    /// Run a synthetic count sequence from `Emerging` and report every transition.
    ///
    /// Bucket indices in the result are positions in `counts`.
    pub fn replay(&self, counts: &[u32]) -> Vec<Transition> {
        let mut st = TrackerState::default();
        let mut state = CascadeState::Emerging;
        let mut out = Vec::new();
        for (i, &c) in counts.iter().enumerate() {
            if let Some(next) = self.step(state, &mut st, c) {
                out.push(Transition { bucket: i as i64, from: state, to: next });
                state = next;
            }
        }
        out
    }

    /// Evaluate every bucket of `cascade` that closed at or before `through`.
    ///
    /// Empty buckets count as zero arrivals. Each transition is recorded as a
    /// milestone and returned as a timeline event stamped at the bucket's end.
    pub fn advance(&self, cascade: &mut Cascade, through: Timestamp) -> Result<Vec<TimelineEvent>, CascadeFault> {
        let mut events = Vec::new();
        if cascade.state == CascadeState::Archived || cascade.halted {
            return Ok(events);
        }
        verify(cascade)?;
        let Some(first_recorded) = cascade.history.first().map(|b| b.bucket) else {
            return Ok(events);
        };

        let start = cascade.tracker.next_bucket.unwrap_or(first_recorded);
        let last = through.div_euclid(self.bucket_ms) - 1;
        let mut bucket = start;
        while bucket <= last {
            let count = cascade.count_at(bucket);
            let mut st = core::mem::take(&mut cascade.tracker);
            let next = self.step(cascade.state, &mut st, count);
            let slope = st.last_slope;
            cascade.tracker = st;

            if let Some(to) = next {
                let from = cascade.state;
                let at = (bucket + 1) * self.bucket_ms;
                cascade.state = to;
                cascade.milestones.push(at);
                debug!(cascade = %cascade.id, %from, %to, bucket, count, "cascade transition");
                events.push(TimelineEvent {
                    target: RiskTarget::Cascade(cascade.id.clone()),
                    kind: TimelineEventKind::StateTransition { from, to },
                    timestamp: at,
                    summary: format!(
                        "{from} -> {to}: {count} arrivals in bucket {bucket}, slope {:.2}",
                        slope.unwrap_or(0.0)
                    ),
                });
                if to == CascadeState::Archived {
                    bucket += 1;
                    break;
                }
            }
            bucket += 1;
        }
        cascade.tracker.next_bucket = Some(bucket.max(start));
        Ok(events)
    }
}

/// Check the structural invariants the tracker relies on.
pub fn verify(cascade: &Cascade) -> Result<(), CascadeFault> {
    if cascade.members.is_empty() {
        return Err(CascadeFault::Empty);
    }
    for pair in cascade.history.windows(2) {
        if pair[1].bucket <= pair[0].bucket {
            return Err(CascadeFault::HistoryOutOfOrder(pair[1].bucket));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActorId, ArrivalBucket, ContentFormat, NarrativeUnit, PropagationKind, UnitId};
    use crate::signature::ContentSignature;
    use std::collections::BTreeMap;

    fn tracker() -> CascadeTracker {
        CascadeTracker::new(CascadeThresholds::default(), 60_000)
    }

    fn unit(id: &str, ts: Timestamp) -> NarrativeUnit {
        NarrativeUnit {
            id: UnitId::new(id),
            actor: ActorId::new("a"),
            timestamp: ts,
            signature: ContentSignature::new(vec![1.0]),
            claims: vec![],
            parent: None,
            relation: PropagationKind::Share,
            attributes: BTreeMap::new(),
            platform: None,
            format: ContentFormat::Text,
            landing_pages: vec![],
            impressions: None,
        }
    }

    #[test]
    fn test_threshold_defaults() {
        let th = CascadeThresholds::default();
        assert_eq!(th.slope_window, 2);
        assert_eq!(th.quiescence_buckets, 5);
        assert!((th.plateau_tolerance - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_single_noisy_bucket_does_not_amplify() {
        let t = tracker();
        // one spike then back down: rise is not sustained
        let tr = t.replay(&[1, 1, 6, 1, 1, 1]);
        assert!(tr.iter().all(|x| x.to != CascadeState::Amplifying), "{tr:?}");
    }

    #[test]
    fn test_quiet_emerging_cascade_archives() {
        let t = tracker();
        let tr = t.replay(&[1, 0, 0, 0, 0, 0]);
        assert_eq!(tr.len(), 1);
        assert_eq!(tr[0].from, CascadeState::Emerging);
        assert_eq!(tr[0].to, CascadeState::Archived);
        assert_eq!(tr[0].bucket, 5);
    }

    #[test]
    fn test_archived_is_terminal() {
        let t = tracker();
        let mut st = TrackerState::default();
        for c in [5, 9, 20, 0, 0] {
            assert_eq!(t.step(CascadeState::Archived, &mut st, c), None);
        }
    }

    #[test]
    fn test_advance_treats_gaps_as_zero_and_stamps_bucket_end() {
        let t = tracker();
        let root = unit("r", 0);
        let mut c = Cascade::new(&root, None);
        c.attach(&root, 60_000);
        // buckets 1..=5 empty; archival at the close of bucket 5
        let events = t.advance(&mut c, 10 * 60_000).unwrap();
        assert_eq!(c.state, CascadeState::Archived);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, 6 * 60_000);
        assert_eq!(c.milestones, vec![0, 6 * 60_000]);
    }

    #[test]
    fn test_advance_is_incremental() {
        let t = tracker();
        let root = unit("r", 0);
        let mut c = Cascade::new(&root, None);
        c.attach(&root, 60_000);
        assert!(t.advance(&mut c, 2 * 60_000).unwrap().is_empty());
        assert_eq!(c.tracker.next_bucket, Some(2));
        // re-advancing to the same boundary evaluates nothing new
        assert!(t.advance(&mut c, 2 * 60_000).unwrap().is_empty());
        assert_eq!(c.tracker.next_bucket, Some(2));
    }

    #[test]
    fn test_verify_detects_unordered_history() {
        let root = unit("r", 0);
        let mut c = Cascade::new(&root, None);
        c.attach(&root, 60_000);
        c.history.push(ArrivalBucket { bucket: -4, count: 1 });
        assert_eq!(verify(&c), Err(CascadeFault::HistoryOutOfOrder(-4)));
        assert!(tracker().advance(&mut c, 60_000).is_err());
        // once halted it is left alone
        c.halted = true;
        assert_eq!(tracker().advance(&mut c, 60_000), Ok(Vec::new()));
    }
}
