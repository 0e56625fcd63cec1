//! Language detection, archaic-English normalization and the untranslated ratio
//!
//! `HeuristicTranslator` is the built-in `Translator`: it recognizes Old and Middle
//! English markers, modernizes archaic pronouns and verb forms, and reports
//! everything it cannot place as undetermined (`und`).

use super::round4;
use crate::capability::{Assessment, CapabilityError, Translator};
use crate::model::vocabulary::CANONICAL_LANGUAGE;
use crate::model::TranslationStatus;
use async_trait::async_trait;
use regex_lite::Regex;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Passages above this ratio need reprocessing unless a tuning profile says otherwise.
pub const DEFAULT_UNTRANSLATED_RATIO_THRESHOLD: f64 = 0.20;

const ARCHAIC_MARKERS: &[&str] = &["þ", "ð", "æ", "hwæt", "thou", "hath", "doth", "yclept", "whan", "ye "];
const OLD_ENGLISH_MARKERS: &[&str] = &["þ", "ð", "hwæt", "iclept", "ge-"];

const PROTECTED_TOKENS: &[&str] = &["ritual", "psalm", "oracle", "amulet", "sigil", "incantation", "liturgy"];

const STOP_TOKENS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "upon", "unto", "are", "was",
    "were", "shall", "should", "would", "could",
];

const ENGLISH_HINTS: &[&str] = &[
    "ritual", "invocation", "offering", "circle", "boundary", "dawn", "night", "ceremony",
    "chant", "blessing", "protection", "healing", "passage", "modern", "language", "oracle",
    "sacred", "altar", "prayer", "spirit", "water", "fire", "temple", "household", "scribe",
    "oath", "vow", "offered",
];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[A-Za-z0-9'-]+").unwrap())
}

fn archaic_replacements() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            ("thou", "you"),
            ("thee", "you"),
            ("thy", "your"),
            ("thine", "yours"),
            ("hath", "has"),
            ("doth", "does"),
            ("art", "are"),
        ]
        .into_iter()
        .map(|(word, modern)| (Regex::new(&format!(r"(?i)\b{}\b", word)).unwrap(), modern))
        .collect()
    })
}

fn english_hints() -> &'static HashSet<&'static str> {
    static HINTS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    HINTS.get_or_init(|| STOP_TOKENS.iter().chain(ENGLISH_HINTS.iter()).copied().collect())
}

fn tokens(text: &str) -> Vec<String> {
    token_pattern()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// ASCII-dominant text is assumed English; anything else is undetermined.
fn guess_language(text: &str) -> &'static str {
    let total = text.chars().count().max(1) as f64;
    let ascii = text.chars().filter(|c| c.is_ascii()).count() as f64;
    if ascii / total > 0.95 {
        CANONICAL_LANGUAGE
    } else {
        "und"
    }
}

/// Detected language code and confidence.
pub fn detect_language(text: &str) -> (&'static str, f64) {
    let lowered = text.to_lowercase();
    if ARCHAIC_MARKERS.iter().any(|m| lowered.contains(m)) {
        if OLD_ENGLISH_MARKERS.iter().any(|m| lowered.contains(m)) {
            return ("ang", 0.9);
        }
        return ("enm", 0.76);
    }

    if guess_language(text) == CANONICAL_LANGUAGE {
        let long: Vec<String> = tokens(text).into_iter().filter(|t| t.len() > 2).collect();
        if !long.is_empty() {
            let hits = long.iter().filter(|t| english_hints().contains(t.as_str())).count();
            if (hits as f64 / long.len() as f64) < 0.28 {
                return ("und", 0.58);
            }
        }
        return (CANONICAL_LANGUAGE, 0.88);
    }
    ("und", 0.64)
}

fn is_ignorable(token: &str) -> bool {
    token.len() < 3
        || token.chars().all(|c| c.is_ascii_digit())
        || PROTECTED_TOKENS.contains(&token)
        || STOP_TOKENS.contains(&token)
}

/// Fraction of meaningful source tokens that survive unchanged into the translation.
///
/// Always 0 when the source is already in the canonical language.
pub fn untranslated_ratio(source: &str, translated: &str, detected_language: &str) -> f64 {
    let translated = normalize(translated);
    if translated.is_empty() {
        return 1.0;
    }
    if detected_language.eq_ignore_ascii_case(CANONICAL_LANGUAGE) {
        return 0.0;
    }
    let source_tokens: Vec<String> = tokens(source).into_iter().filter(|t| !is_ignorable(t)).collect();
    if source_tokens.is_empty() {
        return 0.0;
    }
    let translated_tokens: HashSet<String> = tokens(&translated).into_iter().collect();
    let untranslated = source_tokens
        .iter()
        .filter(|t| translated_tokens.contains(*t))
        .count();
    round4((untranslated as f64 / source_tokens.len() as f64).clamp(0.0, 1.0))
}

pub fn status_for_ratio(ratio: f64, threshold: f64) -> TranslationStatus {
    if ratio > threshold {
        TranslationStatus::NeedsReprocess
    } else {
        TranslationStatus::Translated
    }
}

/// Built-in translator for English-family sources.
#[derive(Debug, Clone, Default)]
pub struct HeuristicTranslator;

impl HeuristicTranslator {
    pub fn new() -> Self {
        Self
    }

    fn modernize(text: &str) -> String {
        archaic_replacements()
            .iter()
            .fold(text.to_string(), |acc, (pattern, modern)| {
                pattern.replace_all(&acc, *modern).into_owned()
            })
    }
}

#[async_trait]
impl Translator for HeuristicTranslator {
    fn name(&self) -> &str {
        "heuristic_translation"
    }

    async fn assess(&self, text: &str) -> Result<Assessment, CapabilityError> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Err(CapabilityError::InvocationFailed("empty excerpt".into()));
        }
        let (language, confidence) = detect_language(&normalized);
        let translated = if language == "ang" || language == "enm" {
            normalize(&Self::modernize(&normalized))
        } else {
            normalized.clone()
        };
        let ratio = untranslated_ratio(&normalized, &translated, language);
        Ok(Assessment {
            translated_text: translated,
            detected_language: language.to_string(),
            confidence,
            untranslated_ratio: ratio,
        })
    }
}
