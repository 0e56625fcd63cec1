//! Extraction & Quality Service
//!
//! Turns parsed source text into passage evidence: segmentation with span
//! locators, translation assessment, usability and relevance scoring, and the
//! auto-reprocess decision.

pub mod extraction;
pub mod relevance;
pub mod segment;
pub mod translation;
pub mod usability;

pub use extraction::{Extracted, Extraction};
pub use relevance::{classify_relevance, score_relevance, DEFAULT_ACCEPT_THRESHOLD, DEFAULT_FILTER_THRESHOLD};
pub use segment::{locator_matches, segment, Segment, SpanLocator};
pub use translation::{status_for_ratio, untranslated_ratio, HeuristicTranslator, DEFAULT_UNTRANSLATED_RATIO_THRESHOLD};
pub use usability::score_usability;

use crate::capability::{Assessment, CapabilityError, Translator};
use crate::model::{ProfileLexicons, QualityUpdate};
use regex_lite::Regex;
use serde::Serialize;
use std::sync::OnceLock;

/// Passages below this usability score are queued for reprocessing.
pub const DEFAULT_USABILITY_REPROCESS_THRESHOLD: f64 = 0.60;
pub const DEFAULT_MIN_PASSAGE_LENGTH: usize = 180;
pub const DEFAULT_MAX_PASSAGES_PER_SOURCE: usize = 200;

/// Quality version of the compiled-in settings, used when no profile is active.
pub const BUILTIN_QUALITY_VERSION: &str = "builtin";

/// Thresholds, lexicons and segmentation limits for one extraction or
/// reprocess pass.
///
/// A pass works from one snapshot taken when it starts; editing the tuning
/// profile mid-pass does not change the rules under it. `quality_version`
/// names the snapshot and is recorded on every passage the pass creates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySettings {
    pub quality_version: String,
    pub relevance_accept_threshold: f64,
    pub relevance_filter_threshold: f64,
    pub usability_reprocess_threshold: f64,
    pub untranslated_ratio_threshold: f64,
    pub lexicon: ProfileLexicons,
    pub min_passage_length: usize,
    pub max_passages_per_source: usize,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            quality_version: BUILTIN_QUALITY_VERSION.to_string(),
            relevance_accept_threshold: DEFAULT_ACCEPT_THRESHOLD,
            relevance_filter_threshold: DEFAULT_FILTER_THRESHOLD,
            usability_reprocess_threshold: DEFAULT_USABILITY_REPROCESS_THRESHOLD,
            untranslated_ratio_threshold: DEFAULT_UNTRANSLATED_RATIO_THRESHOLD,
            lexicon: ProfileLexicons::default(),
            min_passage_length: DEFAULT_MIN_PASSAGE_LENGTH,
            max_passages_per_source: DEFAULT_MAX_PASSAGES_PER_SOURCE,
        }
    }
}

pub(crate) fn clamp(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

pub(crate) fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Lowercased word tokens.
pub(crate) fn word_tokens(text: &str) -> Vec<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"[A-Za-z][A-Za-z0-9'-]*").unwrap())
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Reject translator output that could not be stored as passage quality.
fn check_assessment(assessment: &Assessment) -> Result<(), CapabilityError> {
    for (field, value) in [
        ("confidence", assessment.confidence),
        ("untranslated_ratio", assessment.untranslated_ratio),
    ] {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(CapabilityError::InvalidOutput(format!("{} {} is outside [0, 1]", field, value)));
        }
    }
    if assessment.translated_text.trim().is_empty() {
        return Err(CapabilityError::InvalidOutput("translated_text is empty".into()));
    }
    if assessment.detected_language.trim().is_empty() {
        return Err(CapabilityError::InvalidOutput("detected_language is empty".into()));
    }
    Ok(())
}

/// Run the translator over an excerpt and score the result.
///
/// Usability is measured on the original excerpt (it is about the witness, not
/// the translation); relevance on the translated text. Out-of-contract
/// translator output comes back as [`CapabilityError::InvalidOutput`].
pub async fn assess_excerpt(
    translator: &dyn Translator,
    excerpt: &str,
    settings: &QualitySettings,
) -> Result<QualityUpdate, CapabilityError> {
    let assessment = translator.assess(excerpt).await?;
    check_assessment(&assessment)?;
    let relevance_score = score_relevance(&assessment.translated_text, &settings.lexicon);
    Ok(QualityUpdate {
        translation_status: status_for_ratio(assessment.untranslated_ratio, settings.untranslated_ratio_threshold),
        untranslated_ratio: assessment.untranslated_ratio,
        usability_score: score_usability(excerpt),
        relevance_score,
        relevance_state: classify_relevance(relevance_score, settings),
        detected_language: assessment.detected_language,
        language_confidence: assessment.confidence,
        normalized_excerpt: assessment.translated_text,
    })
}

/// Reason code for an automatic reprocess, if the scores call for one.
pub fn auto_reprocess_reason(
    untranslated_ratio: f64,
    usability_score: f64,
    settings: &QualitySettings,
) -> Option<&'static str> {
    if untranslated_ratio > settings.untranslated_ratio_threshold {
        Some("untranslated_ratio")
    } else if usability_score < settings.usability_reprocess_threshold {
        Some("low_usability")
    } else {
        None
    }
}
