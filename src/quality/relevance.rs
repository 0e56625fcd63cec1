//! Topical relevance against ritual-domain signal

use super::{clamp, round4, word_tokens};
use crate::model::vocabulary;
use super::QualitySettings;
use crate::model::{ProfileLexicons, RelevanceState};
use std::collections::HashSet;
use std::sync::OnceLock;

pub const DEFAULT_ACCEPT_THRESHOLD: f64 = 0.50;
pub const DEFAULT_FILTER_THRESHOLD: f64 = 0.30;

const RITUAL_KEYWORDS: &[&str] = &[
    "ritual", "magic", "magical", "mystic", "mysticism", "pagan", "occult", "esoteric",
    "incantation", "invocation", "offering", "libation", "divination", "sigil", "amulet",
    "altar", "ceremony", "prayer", "spell", "curse", "blessing", "oracle", "deity",
    "ancestor", "spirit", "temple", "sanctuary", "liturgy", "recitation", "anointing",
    "consecrate", "apotropaic", "votive",
];

const NOISE_KEYWORDS: &[&str] = &[
    "table", "contents", "index", "chapter", "copyright", "isbn", "navigation", "header",
    "footer", "advertisement", "appendix", "preface", "publisher", "project", "gutenberg",
    "http", "www", "click", "download", "menu", "breadcrumb", "sidebar",
];

const NOISE_PHRASES: &[&str] = &[
    "table of contents",
    "all rights reserved",
    "project gutenberg",
    "chapter one",
    "chapter 1",
    "page number",
    "copyright notice",
    "navigation menu",
];

fn ontology_lexicon() -> &'static HashSet<&'static str> {
    static LEXICON: OnceLock<HashSet<&'static str>> = OnceLock::new();
    LEXICON.get_or_init(|| vocabulary::lexicon_parts().collect())
}

fn positive_lexicon() -> &'static HashSet<&'static str> {
    static LEXICON: OnceLock<HashSet<&'static str>> = OnceLock::new();
    LEXICON.get_or_init(|| {
        ontology_lexicon()
            .iter()
            .copied()
            .chain(RITUAL_KEYWORDS.iter().copied())
            .collect()
    })
}

pub fn score_relevance(text: &str, extras: &ProfileLexicons) -> f64 {
    let lowered = text.to_lowercase();
    let tokens = word_tokens(&lowered);
    let total_tokens = tokens.len().max(1) as f64;

    let positive_hits = tokens
        .iter()
        .filter(|t| positive_lexicon().contains(t.as_str()) || extras.positive_keywords.contains(t.as_str()))
        .count();
    let ontology_hits = tokens.iter().filter(|t| ontology_lexicon().contains(t.as_str())).count();
    let negative_hits = tokens
        .iter()
        .filter(|t| NOISE_KEYWORDS.contains(&t.as_str()) || extras.noise_keywords.contains(t.as_str()))
        .count();
    let ritual_hits = tokens.iter().filter(|t| RITUAL_KEYWORDS.contains(&t.as_str())).count();
    let tradition_hits = vocabulary::TRADITIONS
        .iter()
        .filter(|tag| lowered.contains(*tag) || lowered.contains(&tag.replace('_', " ")))
        .count();

    let phrase_hits = NOISE_PHRASES.iter().filter(|p| lowered.contains(**p)).count()
        + extras
            .noise_phrases
            .iter()
            .filter(|p| !NOISE_PHRASES.iter().any(|builtin| *builtin == p.as_str()))
            .filter(|p| lowered.contains(p.as_str()))
            .count();
    let phrase_penalty = (phrase_hits as f64 * 0.12).min(0.36);

    let categories_present = [ritual_hits, ontology_hits, tradition_hits]
        .iter()
        .filter(|hits| **hits > 0)
        .count();
    let coherence = clamp(categories_present as f64 / 3.0);

    let weighted = 0.22
        + positive_hits as f64 / total_tokens * 5.0
        + ontology_hits as f64 / total_tokens * 3.0
        + coherence * 0.18
        - negative_hits as f64 / total_tokens * 4.4
        - phrase_penalty;
    round4(clamp(weighted))
}

pub fn classify_relevance(score: f64, settings: &QualitySettings) -> RelevanceState {
    if score < settings.relevance_filter_threshold {
        RelevanceState::Filtered
    } else if score < settings.relevance_accept_threshold {
        RelevanceState::Borderline
    } else {
        RelevanceState::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builtin() -> QualitySettings {
        QualitySettings::default()
    }

    #[test]
    fn ritual_passage_is_accepted() {
        let text = "The priest performs the invocation at the altar and pours a libation \
                    as an offering to the ancestor spirit before dawn.";
        let score = score_relevance(text, &ProfileLexicons::default());
        assert_eq!(classify_relevance(score, &builtin()), RelevanceState::Accepted, "{}", score);
    }

    #[test]
    fn front_matter_is_filtered() {
        let text = "Table of contents. Chapter one. Copyright notice. All rights reserved \
                    by the publisher. Download the index from www.";
        let score = score_relevance(text, &ProfileLexicons::default());
        assert_eq!(classify_relevance(score, &builtin()), RelevanceState::Filtered, "{}", score);
    }

    #[test]
    fn threshold_boundaries() {
        let settings = builtin();
        assert_eq!(classify_relevance(0.50, &settings), RelevanceState::Accepted);
        assert_eq!(classify_relevance(0.4999, &settings), RelevanceState::Borderline);
        assert_eq!(classify_relevance(0.30, &settings), RelevanceState::Borderline);
        assert_eq!(classify_relevance(0.2999, &settings), RelevanceState::Filtered);
    }

    #[test]
    fn custom_thresholds_move_the_boundaries() {
        let settings = QualitySettings {
            relevance_accept_threshold: 0.8,
            relevance_filter_threshold: 0.6,
            ..builtin()
        };
        assert_eq!(classify_relevance(0.7, &settings), RelevanceState::Borderline);
        assert_eq!(classify_relevance(0.5, &settings), RelevanceState::Filtered);
        assert_eq!(classify_relevance(0.8, &settings), RelevanceState::Accepted);
    }

    #[test]
    fn lexicon_extras_shift_the_score() {
        let text = "The villagers keep the hearth cake and the barley stone through winter.";
        let plain = score_relevance(text, &ProfileLexicons::default());

        let positive = ProfileLexicons {
            positive_keywords: ["hearth", "barley"].into_iter().map(String::from).collect(),
            ..ProfileLexicons::default()
        };
        assert!(score_relevance(text, &positive) > plain);

        let noisy = ProfileLexicons {
            noise_keywords: ["winter".to_string()].into(),
            noise_phrases: ["hearth cake".to_string()].into(),
            ..ProfileLexicons::default()
        };
        assert!(score_relevance(text, &noisy) < plain);
    }
}
