//! Content population statistics per cascade.
//!
//! A running census of what a narrative is made of: how many units, over what
//! span, in which formats and on which platforms, where it links out to, and
//! how many impressions it collected. Updated on every accepted unit; carried
//! into the risk bundle so analysts see the reach next to the risk.
//!
//! Per-unit detail is bounded: the key accounts are the first
//! [`MAX_KEY_IDS`] author ids in id order, and the impression detail keeps the
//! [`MAX_IMPRESSION_DETAIL`] largest reports. Both are independent of arrival
//! order.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{ActorId, ContentFormat, NarrativeUnit, Timestamp, UnitId};

/// Key account ids kept per cascade.
pub const MAX_KEY_IDS: usize = 256;

/// Per-unit impression entries kept per cascade.
pub const MAX_IMPRESSION_DETAIL: usize = 64;

/// Counts per media format.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FormatCounts {
    /// Text / link units.
    pub text: u64,
    /// Image / gallery units.
    pub image: u64,
    /// Video units.
    pub video: u64,
}

impl FormatCounts {
    fn bump(&mut self, format: ContentFormat) {
        match format {
            ContentFormat::Text => self.text += 1,
            ContentFormat::Image => self.image += 1,
            ContentFormat::Video => self.video += 1,
        }
    }

    /// The most frequent format; ties resolve text → image → video.
    pub fn dominant(&self) -> ContentFormat {
        if self.video > self.text.max(self.image) {
            ContentFormat::Video
        } else if self.image > self.text {
            ContentFormat::Image
        } else {
            ContentFormat::Text
        }
    }
}

/// Running census of a cascade's content.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PopulationSummary {
    /// Units counted.
    pub unit_count: u64,
    /// Earliest unit (id, timestamp).
    pub first_unit: Option<(UnitId, Timestamp)>,
    /// Latest unit (id, timestamp).
    pub last_unit: Option<(UnitId, Timestamp)>,
    /// Units per platform.
    pub platforms: BTreeMap<String, u64>,
    /// Units per media format.
    pub formats: FormatCounts,
    /// Distinct landing pages referenced.
    pub landing_pages: BTreeSet<String>,
    /// Sum of reported impressions.
    pub impressions_total: f64,
    /// Units that reported impressions.
    pub impressions_reported: u64,
    /// Largest per-unit impression reports, descending, ties by unit id.
    pub impressions_detail: Vec<(UnitId, f64)>,
    /// Authors that carried the narrative, capped at [`MAX_KEY_IDS`].
    pub key_ids: BTreeSet<ActorId>,
    /// True once an author was left out of `key_ids` by the cap.
    pub key_ids_truncated: bool,
    /// Units per claim / topic label.
    pub claims: BTreeMap<String, u64>,
}

impl PopulationSummary {
    /// Count one unit.
    pub fn record(&mut self, unit: &NarrativeUnit) {
        self.unit_count += 1;

        let ts = unit.timestamp;
        let earlier = self.first_unit.as_ref().map_or(true, |(id, t)| (ts, &unit.id) < (*t, id));
        if earlier {
            self.first_unit = Some((unit.id.clone(), ts));
        }
        let later = self.last_unit.as_ref().map_or(true, |(id, t)| (ts, &unit.id) > (*t, id));
        if later {
            self.last_unit = Some((unit.id.clone(), ts));
        }

        let platform = unit.platform.as_deref().unwrap_or("unknown");
        *self.platforms.entry(platform.to_owned()).or_default() += 1;
        self.formats.bump(unit.format);

        for page in &unit.landing_pages {
            if !page.is_empty() {
                self.landing_pages.insert(page.clone());
            }
        }

        if let Some(imp) = unit.impressions.filter(|v| v.is_finite() && *v >= 0.0) {
            self.impressions_total += imp;
            self.impressions_reported += 1;
            self.impressions_detail.push((unit.id.clone(), imp));
            self.impressions_detail.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            self.impressions_detail.truncate(MAX_IMPRESSION_DETAIL);
        }

        if self.key_ids.insert(unit.actor.clone()) && self.key_ids.len() > MAX_KEY_IDS {
            self.key_ids.pop_last();
            self.key_ids_truncated = true;
        }

        for claim in &unit.claims {
            *self.claims.entry(claim.label.clone()).or_default() += 1;
        }
    }

    /// Time between first and last unit in ms (0 when fewer than two units).
    pub fn span_ms(&self) -> i64 {
        match (&self.first_unit, &self.last_unit) {
            (Some((_, a)), Some((_, b))) => b - a,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActorId, Claim, PropagationKind};
    use crate::signature::ContentSignature;

    fn unit(id: &str, ts: Timestamp, format: ContentFormat, imp: Option<f64>) -> NarrativeUnit {
        NarrativeUnit {
            id: UnitId::new(id),
            actor: ActorId::new(format!("acct-{id}")),
            timestamp: ts,
            signature: ContentSignature::new(vec![1.0]),
            claims: vec![Claim::label("election")],
            parent: None,
            relation: PropagationKind::Share,
            attributes: BTreeMap::new(),
            platform: Some("reddit".into()),
            format,
            landing_pages: vec!["https://example.org/a".into(), String::new()],
            impressions: imp,
        }
    }

    #[test]
    fn test_population_counts_formats_and_span() {
        let mut p = PopulationSummary::default();
        p.record(&unit("b", 2_000, ContentFormat::Video, Some(10.0)));
        p.record(&unit("a", 1_000, ContentFormat::Text, None));
        p.record(&unit("c", 3_000, ContentFormat::Video, Some(f64::NAN)));

        assert_eq!(p.unit_count, 3);
        assert_eq!(p.formats, FormatCounts { text: 1, image: 0, video: 2 });
        assert_eq!(p.formats.dominant(), ContentFormat::Video);
        assert_eq!(p.first_unit, Some((UnitId::new("a"), 1_000)));
        assert_eq!(p.last_unit, Some((UnitId::new("c"), 3_000)));
        assert_eq!(p.span_ms(), 2_000);
        assert_eq!(p.impressions_total, 10.0);
        assert_eq!(p.impressions_reported, 1);
        assert_eq!(p.landing_pages.len(), 1);
        assert_eq!(p.platforms.get("reddit"), Some(&3));
        assert_eq!(p.claims.get("election"), Some(&3));
        assert_eq!(p.impressions_detail, vec![(UnitId::new("b"), 10.0)]);
        assert_eq!(p.key_ids.len(), 3);
        assert!(!p.key_ids_truncated);
    }

    #[test]
    fn test_detail_is_bounded_and_order_free() {
        let n = MAX_KEY_IDS.max(MAX_IMPRESSION_DETAIL) + 10;
        let units: Vec<NarrativeUnit> =
            (0..n).map(|i| unit(&format!("u{i:04}"), i as Timestamp, ContentFormat::Text, Some(i as f64))).collect();

        let mut forward = PopulationSummary::default();
        units.iter().for_each(|u| forward.record(u));
        let mut backward = PopulationSummary::default();
        units.iter().rev().for_each(|u| backward.record(u));

        assert_eq!(forward, backward);
        assert_eq!(forward.key_ids.len(), MAX_KEY_IDS);
        assert!(forward.key_ids_truncated);
        assert_eq!(forward.key_ids.first(), Some(&ActorId::new("acct-u0000")));
        assert_eq!(forward.impressions_detail.len(), MAX_IMPRESSION_DETAIL);
        assert_eq!(forward.impressions_detail[0], (UnitId::new(format!("u{:04}", n - 1)), (n - 1) as f64));
        assert_eq!(forward.impressions_reported, n as u64);
    }
}
