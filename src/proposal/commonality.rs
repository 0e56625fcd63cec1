//! Commonality Scorer
//!
//! Pure weighted-overlap scoring of two tag profiles across the eleven ontology
//! dimensions. Per dimension, `overlap` is the Jaccard index of the two term sets
//! and `confidence` the mean confidence both sides give the shared terms. The
//! weighted score is the weight-sum of the overlaps.

use crate::model::{ConfidenceBucket, DimensionScore, Link, Tag};
use std::collections::{BTreeMap, BTreeSet};

/// Dimension weights; they sum to 1.0.
pub const DIMENSION_WEIGHTS: [(&str, f64); 11] = [
    ("ritual_intent", 0.18),
    ("ritual_actions", 0.18),
    ("materials_tools", 0.13),
    ("invocation_structure", 0.13),
    ("time_timing", 0.09),
    ("location_setting", 0.08),
    ("exchange_offering", 0.08),
    ("protection_boundary", 0.06),
    ("divination_modality", 0.04),
    ("ritual_actors", 0.02),
    ("outcome_claim", 0.01),
];

/// Candidates below this score never become links.
pub const MIN_LINK_SCORE: f64 = 0.35;
pub const HIGH_CONFIDENCE: f64 = 0.75;
pub const MEDIUM_CONFIDENCE: f64 = 0.55;

/// Dimensions a link needs at medium-or-higher confidence before approval.
pub const REQUIRED_STRONG_DIMENSIONS: usize = 2;

/// `dimension -> term -> confidence` for one passage.
pub type TagProfile = BTreeMap<String, BTreeMap<String, f64>>;

/// Build a profile from tags, keeping the highest confidence per term.
pub fn profile<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> TagProfile {
    let mut profile = TagProfile::new();
    for tag in tags {
        let slot = profile
            .entry(tag.dimension.clone())
            .or_default()
            .entry(tag.term.clone())
            .or_insert(0.0);
        *slot = slot.max(tag.confidence);
    }
    profile
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommonalityScore {
    pub weighted_score: f64,
    pub bucket: ConfidenceBucket,
    pub dimensions: BTreeMap<String, DimensionScore>,
}

impl CommonalityScore {
    /// Dimensions with shared terms at medium-or-higher confidence.
    pub fn strong_dimensions(&self) -> usize {
        strong_dimensions(&self.dimensions)
    }
}

pub fn strong_dimensions(dimensions: &BTreeMap<String, DimensionScore>) -> usize {
    dimensions
        .values()
        .filter(|d| d.overlap > 0.0 && d.confidence >= MEDIUM_CONFIDENCE)
        .count()
}

pub fn bucket_for(score: f64) -> ConfidenceBucket {
    if score >= HIGH_CONFIDENCE {
        ConfidenceBucket::High
    } else if score >= MEDIUM_CONFIDENCE {
        ConfidenceBucket::Medium
    } else {
        ConfidenceBucket::Exploratory
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn score_dimension(a: Option<&BTreeMap<String, f64>>, b: Option<&BTreeMap<String, f64>>) -> DimensionScore {
    let (Some(a), Some(b)) = (a, b) else {
        return DimensionScore {
            overlap: 0.0,
            confidence: 0.0,
        };
    };
    let left: BTreeSet<&String> = a.keys().collect();
    let right: BTreeSet<&String> = b.keys().collect();
    let shared: Vec<&String> = left.intersection(&right).copied().collect();
    let union = left.union(&right).count();
    if shared.is_empty() || union == 0 {
        return DimensionScore {
            overlap: 0.0,
            confidence: 0.0,
        };
    }
    let confidence = shared
        .iter()
        .map(|term| (a[*term] + b[*term]) / 2.0)
        .sum::<f64>()
        / shared.len() as f64;
    DimensionScore {
        overlap: round4(shared.len() as f64 / union as f64),
        confidence: round4(confidence.clamp(0.0, 1.0)),
    }
}

/// Score two profiles. Always returns a score in [0, 1].
pub fn score(a: &TagProfile, b: &TagProfile) -> CommonalityScore {
    let mut dimensions = BTreeMap::new();
    let mut weighted = 0.0;
    for (dimension, weight) in DIMENSION_WEIGHTS {
        let dim = score_dimension(a.get(dimension), b.get(dimension));
        weighted += weight * dim.overlap;
        dimensions.insert(dimension.to_string(), dim);
    }
    let weighted_score = round4(weighted.clamp(0.0, 1.0));
    CommonalityScore {
        weighted_score,
        bucket: bucket_for(weighted_score),
        dimensions,
    }
}

/// Score a candidate pair; `None` if it falls below [`MIN_LINK_SCORE`].
pub fn evaluate(a: &TagProfile, b: &TagProfile) -> Option<CommonalityScore> {
    let scored = score(a, b);
    (scored.weighted_score >= MIN_LINK_SCORE).then_some(scored)
}

/// Why a link cannot be approved, if it cannot.
pub fn approval_blocker(link: &Link, notes: Option<&str>) -> Option<String> {
    if link.bucket == ConfidenceBucket::Exploratory {
        return Some(format!(
            "link {} scored {} and is exploratory only",
            link.link_id, link.weighted_score
        ));
    }
    let strong = strong_dimensions(&link.dimension_scores);
    if strong < REQUIRED_STRONG_DIMENSIONS {
        return Some(format!(
            "link {} has {} dimension(s) at medium+ confidence; {} required",
            link.link_id, strong, REQUIRED_STRONG_DIMENSIONS
        ));
    }
    if notes.map_or(true, |n| n.trim().is_empty()) {
        return Some(format!(
            "approving link {} requires a reviewer note addressing non-equivalence",
            link.link_id
        ));
    }
    None
}
