//! Consumed capabilities: parser, translator, proposal client, source reader
//!
//! The pipeline owns durability and validation; the work behind these traits is
//! pluggable. Built-in implementations cover plain text and markdown parsing,
//! filesystem and in-memory source bytes, and a scripted proposal client for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use pulldown_cmark::{Event, Options, Parser as MarkdownParser, TagEnd};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

/// Errors from an external capability call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    #[error("capability not available: {0}")]
    Unavailable(String),
    #[error("invocation failed: {0}")]
    InvocationFailed(String),
    /// The call returned, but with values outside their contract.
    #[error("invalid output: {0}")]
    InvalidOutput(String),
}

// === Parser ===

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("no extractable text")]
    NoText,
    #[error("malformed input: {0}")]
    Malformed(String),
}

impl ParseError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::NoText => "no_text",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Given raw bytes and a format hint, produce normalized text.
#[async_trait]
pub trait Parser: Send + Sync {
    fn name(&self) -> &str;

    async fn parse(&self, bytes: &[u8], format_hint: &str) -> Result<String, ParseError>;
}

/// Parser for `txt` and `md` sources.
///
/// Output keeps paragraph breaks (blank lines) and page breaks (form feeds) so the
/// segmenter can build locators; everything else is whitespace-normalized.
#[derive(Debug, Clone, Default)]
pub struct BuiltinParser;

impl BuiltinParser {
    pub fn new() -> Self {
        Self
    }

    fn decode(bytes: &[u8]) -> Result<String, ParseError> {
        let text = std::str::from_utf8(bytes).map_err(|e| ParseError::Malformed(e.to_string()))?;
        Ok(text.trim_start_matches('\u{feff}').replace("\r\n", "\n").replace('\r', "\n"))
    }

    fn markdown_to_text(source: &str) -> String {
        let mut out = String::new();
        for event in MarkdownParser::new_ext(source, Options::empty()) {
            match event {
                Event::Text(text) | Event::Code(text) => out.push_str(&text),
                Event::SoftBreak | Event::HardBreak => out.push('\n'),
                Event::End(TagEnd::Paragraph)
                | Event::End(TagEnd::Heading(_))
                | Event::End(TagEnd::Item)
                | Event::End(TagEnd::CodeBlock)
                | Event::End(TagEnd::BlockQuote) => out.push_str("\n\n"),
                _ => {}
            }
        }
        out
    }
}

#[async_trait]
impl Parser for BuiltinParser {
    fn name(&self) -> &str {
        "builtin_text"
    }

    async fn parse(&self, bytes: &[u8], format_hint: &str) -> Result<String, ParseError> {
        let hint = format_hint.trim_start_matches('.').to_ascii_lowercase();
        let text = match hint.as_str() {
            "txt" | "text" => Self::decode(bytes)?,
            "md" | "markdown" => Self::markdown_to_text(&Self::decode(bytes)?),
            other => return Err(ParseError::UnsupportedFormat(other.to_string())),
        };
        let normalized = normalize_layout(&text);
        if normalized.trim().is_empty() {
            return Err(ParseError::NoText);
        }
        Ok(normalized)
    }
}

/// Collapse runs of spaces inside lines and strip trailing whitespace, keeping
/// newlines and form feeds.
pub fn normalize_layout(text: &str) -> String {
    text.split('\n')
        .map(|line| {
            line.split('\u{c}')
                .map(|part| part.split_whitespace().collect::<Vec<_>>().join(" "))
                .collect::<Vec<_>>()
                .join("\u{c}")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

// === Translator ===

/// Result of a translation/quality assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub translated_text: String,
    pub detected_language: String,
    pub confidence: f64,
    pub untranslated_ratio: f64,
}

#[async_trait]
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    async fn assess(&self, text: &str) -> Result<Assessment, CapabilityError>;
}

// === Proposal client ===

/// A nearby passage offered to the proposal capability as link context.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPassage {
    pub passage_id: String,
    pub text_id: String,
    pub text: String,
}

/// Input for one proposal call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalRequest {
    pub passage_id: String,
    pub text_id: String,
    pub text: String,
    pub original_language: String,
    pub peers: Vec<PeerPassage>,
    pub prompt: String,
}

/// AI or heuristic proposal capability. Returns the raw (untrusted) response body.
#[async_trait]
pub trait ProposalClient: Send + Sync {
    fn model_name(&self) -> &str;

    async fn propose(&self, request: &ProposalRequest) -> Result<String, CapabilityError>;

    /// Second chance after a malformed response.
    async fn repair(&self, request: &ProposalRequest, raw: &str, error: &str) -> Result<String, CapabilityError>;
}

/// Proposal client that replays canned responses in order.
///
/// Each call to `propose` or `repair` consumes the next entry; an exhausted script
/// reports `Unavailable`.
#[derive(Debug, Default)]
pub struct ScriptedProposer {
    script: Mutex<VecDeque<Result<String, CapabilityError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, raw: impl Into<String>) -> Self {
        self.script.lock().unwrap().push_back(Ok(raw.into()));
        self
    }

    pub fn with_failure(self, error: CapabilityError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    /// Names of the calls made so far (`propose` / `repair`).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self, call: &str) -> Result<String, CapabilityError> {
        self.calls.lock().unwrap().push(call.to_string());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CapabilityError::Unavailable("script exhausted".into())))
    }
}

#[async_trait]
impl ProposalClient for ScriptedProposer {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn propose(&self, _request: &ProposalRequest) -> Result<String, CapabilityError> {
        self.next("propose")
    }

    async fn repair(&self, _request: &ProposalRequest, _raw: &str, _error: &str) -> Result<String, CapabilityError> {
        self.next("repair")
    }
}

// === Source bytes ===

/// Where the raw bytes of a registered source are read from.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn read(&self, locator: &str) -> std::io::Result<Vec<u8>>;
}

/// Reads sources from the filesystem, relative locators resolved against `root`.
#[derive(Debug, Clone)]
pub struct FsSourceReader {
    root: PathBuf,
}

impl FsSourceReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SourceReader for FsSourceReader {
    async fn read(&self, locator: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.root.join(locator)).await
    }
}

/// In-memory source bytes keyed by locator.
#[derive(Debug, Default)]
pub struct MemorySourceReader {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemorySourceReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, locator: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.blobs.insert(locator.into(), bytes.into());
    }
}

#[async_trait]
impl SourceReader for MemorySourceReader {
    async fn read(&self, locator: &str) -> std::io::Result<Vec<u8>> {
        self.blobs
            .get(locator)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, locator.to_string()))
    }
}
