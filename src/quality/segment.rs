//! Passage segmentation and span locators
//!
//! A locator names a line range on a page: `p2:l14-19`. Pages are split on form
//! feeds; lines are 1-based within their page.

use std::fmt;
use std::str::FromStr;

/// Fallback passages are truncated to this many characters.
pub const FALLBACK_MAX_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanLocator {
    pub page: u32,
    pub line_start: u32,
    pub line_end: u32,
}

impl fmt::Display for SpanLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}:l{}-{}", self.page, self.line_start, self.line_end)
    }
}

impl FromStr for SpanLocator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || format!("invalid locator: {}", s);
        let (page, lines) = s.split_once(':').ok_or_else(bad)?;
        let page: u32 = page.strip_prefix('p').ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let (start, end) = lines
            .strip_prefix('l')
            .ok_or_else(bad)?
            .split_once('-')
            .ok_or_else(bad)?;
        let line_start: u32 = start.parse().map_err(|_| bad())?;
        let line_end: u32 = end.parse().map_err(|_| bad())?;
        if page == 0 || line_start == 0 || line_end < line_start {
            return Err(bad());
        }
        Ok(Self {
            page,
            line_start,
            line_end,
        })
    }
}

impl SpanLocator {
    /// The raw lines this locator covers, or `None` if it points outside the text.
    pub fn resolve<'a>(&self, text: &'a str) -> Option<Vec<&'a str>> {
        let page = text.split('\u{c}').nth(self.page as usize - 1)?;
        let lines: Vec<&str> = page.split('\n').collect();
        if self.line_end as usize > lines.len() {
            return None;
        }
        Some(lines[self.line_start as usize - 1..self.line_end as usize].to_vec())
    }
}

/// One detected passage span.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub locator: SpanLocator,
    /// Whitespace-compacted text of the span
    pub text: String,
}

pub fn compact(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split text into paragraph segments of at least `min_length` characters.
///
/// When no paragraph is long enough, the first non-empty page becomes a single
/// fallback segment truncated to [`FALLBACK_MAX_CHARS`].
pub fn segment(text: &str, min_length: usize, max_segments: usize) -> Vec<Segment> {
    let mut segments = Vec::new();

    'pages: for (page_idx, page) in text.split('\u{c}').enumerate() {
        let mut start: Option<usize> = None;
        let lines: Vec<&str> = page.split('\n').collect();
        for idx in 0..=lines.len() {
            let blank = idx == lines.len() || lines[idx].trim().is_empty();
            match (blank, start) {
                (false, None) => start = Some(idx),
                (true, Some(first)) => {
                    let body = compact(&lines[first..idx].join(" "));
                    if body.chars().count() >= min_length {
                        segments.push(Segment {
                            locator: SpanLocator {
                                page: page_idx as u32 + 1,
                                line_start: first as u32 + 1,
                                line_end: idx as u32,
                            },
                            text: body,
                        });
                        if segments.len() >= max_segments {
                            break 'pages;
                        }
                    }
                    start = None;
                }
                _ => {}
            }
        }
    }

    if segments.is_empty() {
        if let Some(fallback) = fallback_segment(text) {
            segments.push(fallback);
        }
    }
    segments
}

fn fallback_segment(text: &str) -> Option<Segment> {
    for (page_idx, page) in text.split('\u{c}').enumerate() {
        let lines: Vec<&str> = page.split('\n').collect();
        let (Some(first), Some(last)) = (
            lines.iter().position(|l| !l.trim().is_empty()),
            lines.iter().rposition(|l| !l.trim().is_empty()),
        ) else {
            continue;
        };
        let body: String = compact(&lines[first..=last].join(" "))
            .chars()
            .take(FALLBACK_MAX_CHARS)
            .collect();
        if body.is_empty() {
            continue;
        }
        return Some(Segment {
            locator: SpanLocator {
                page: page_idx as u32 + 1,
                line_start: first as u32 + 1,
                line_end: last as u32 + 1,
            },
            text: body,
        });
    }
    None
}

/// True if `locator` resolves inside `text` and the span starts with `excerpt`.
pub fn locator_matches(locator: &str, text: &str, excerpt: &str) -> bool {
    let Ok(span) = locator.parse::<SpanLocator>() else {
        return false;
    };
    match span.resolve(text) {
        Some(lines) => !excerpt.is_empty() && compact(&lines.join(" ")).starts_with(excerpt),
        None => false,
    }
}
