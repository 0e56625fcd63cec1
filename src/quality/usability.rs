//! Structural usability score
//!
//! Penalizes OCR debris, control characters, replacement glyphs, symbol runs and
//! repetitive token streams. Output is in [0, 1]; higher is more readable.

use super::{clamp, round4, word_tokens};
use std::collections::HashSet;

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_control(c: char) -> bool {
    matches!(c, '\u{0}'..='\u{8}' | '\u{b}' | '\u{c}' | '\u{e}'..='\u{1f}' | '\u{7f}')
}

fn is_noisy_symbol(c: char) -> bool {
    !is_word_char(c) && !c.is_whitespace() && !".,;:!?\"'()-\n".contains(c)
}

/// Characters inside runs of three or more consecutive symbols.
fn symbol_cluster_chars(text: &str) -> usize {
    let mut total = 0;
    let mut run = 0;
    for c in text.chars() {
        if !is_word_char(c) && !c.is_whitespace() {
            run += 1;
        } else {
            if run >= 3 {
                total += run;
            }
            run = 0;
        }
    }
    if run >= 3 {
        total += run;
    }
    total
}

pub fn score_usability(text: &str) -> f64 {
    if text.is_empty() {
        return 0.0;
    }

    let length = text.chars().count().max(1) as f64;
    let tokens = word_tokens(text);
    let total_tokens = tokens.len().max(1) as f64;

    let printable_ratio = text.chars().filter(|c| !c.is_control()).count() as f64 / length;
    let control_ratio = text.chars().filter(|c| is_control(*c)).count() as f64 / length;
    let replacement_ratio =
        (text.matches('\u{fffd}').count() + text.matches("ï¿½").count()) as f64 / length;
    let alpha_token_ratio = tokens
        .iter()
        .filter(|t| t.chars().any(|c| c.is_alphabetic()))
        .count() as f64
        / total_tokens;
    let digit_token_ratio = tokens
        .iter()
        .filter(|t| t.chars().all(|c| c.is_ascii_digit()))
        .count() as f64
        / total_tokens;
    let unique_ratio = tokens.iter().collect::<HashSet<_>>().len() as f64 / total_tokens;
    let punctuation_ratio = text
        .chars()
        .filter(|c| !is_word_char(*c) && !c.is_whitespace())
        .count() as f64
        / length;
    let noisy_symbol_ratio = text.chars().filter(|c| is_noisy_symbol(*c)).count() as f64 / length;
    let symbol_cluster_ratio = symbol_cluster_chars(text) as f64 / length;
    let average_word_length =
        tokens.iter().map(|t| t.chars().count()).sum::<usize>() as f64 / total_tokens;

    let printable = clamp((printable_ratio - 0.85) / 0.15);
    let control = clamp(1.0 - control_ratio / 0.02);
    let replacement = clamp(1.0 - replacement_ratio / 0.03);
    let alpha = clamp((alpha_token_ratio - 0.45) / 0.55);
    let digit = clamp(1.0 - digit_token_ratio / 0.12);
    let repetition = clamp((unique_ratio - 0.18) / 0.82);
    let punctuation = clamp(1.0 - punctuation_ratio / 0.28);
    let noisy_symbols = clamp(1.0 - noisy_symbol_ratio / 0.04);
    let symbol_clusters = clamp(1.0 - symbol_cluster_ratio / 0.06);
    let word_length = clamp(1.0 - (average_word_length - 6.0).abs() / 8.0);

    let weighted = printable * 0.12
        + control * 0.08
        + replacement * 0.12
        + alpha * 0.12
        + digit * 0.05
        + repetition * 0.10
        + punctuation * 0.10
        + noisy_symbols * 0.14
        + symbol_clusters * 0.07
        + word_length * 0.10;
    let noise_penalty =
        (noisy_symbol_ratio * 0.55 + symbol_cluster_ratio * 0.35 + replacement_ratio * 0.8).min(0.35);

    round4(clamp(weighted - noise_penalty))
}
