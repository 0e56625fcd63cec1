//! Persisted record types
//!
//! These mirror the Evidence Store rows one-to-one. Components never mutate them
//! directly; every change goes through a store operation.

use super::ids::*;
use super::state::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Canonical work. Sources are witnesses of a text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub text_id: TextId,
    pub title: String,
    pub origin_region: Option<String>,
    pub tradition_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A witness-level copy of a text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: SourceId,
    pub text_id: TextId,
    /// Where the raw bytes live (a path or a reader key)
    pub locator: String,
    pub format_hint: String,
    pub source_sha256: String,
    pub normalized_sha256: String,
    pub witness_group_id: Option<GroupId>,
    pub is_duplicate_of: Option<SourceId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: JobId,
    pub source_id: SourceId,
    pub idempotency_key: String,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub error_code: Option<String>,
    pub error_context: Option<serde_json::Value>,
    pub parser_name: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One claim of an ingestion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttempt {
    pub attempt_id: AttemptId,
    pub job_id: JobId,
    pub attempt_number: u32,
    /// `running`, `completed` or `failed`
    pub outcome: String,
    pub error_code: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub passage_id: PassageId,
    pub source_id: SourceId,
    pub text_id: TextId,
    pub locator: String,
    pub original_excerpt: String,
    pub normalized_excerpt: String,
    pub detected_language: String,
    pub language_confidence: f64,
    pub translation_status: TranslationStatus,
    pub untranslated_ratio: f64,
    pub usability_score: f64,
    pub relevance_score: f64,
    pub relevance_state: RelevanceState,
    pub reviewer_state: ReviewerState,
    pub publish_state: PublishState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Live quality fields written back to a passage after a reprocess attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityUpdate {
    pub normalized_excerpt: String,
    pub detected_language: String,
    pub language_confidence: f64,
    pub translation_status: TranslationStatus,
    pub untranslated_ratio: f64,
    pub usability_score: f64,
    pub relevance_score: f64,
    pub relevance_state: RelevanceState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprocessJob {
    pub job_id: ReprocessJobId,
    pub passage_id: PassageId,
    pub status: ReprocessStatus,
    pub trigger_mode: ReprocessTriggerMode,
    pub trigger_reason_code: String,
    pub notes: Option<String>,
    pub idempotency_key: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub error_code: Option<String>,
    /// Set while `running`; the claimant's token for finishing the attempt
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full before/after record of one translation attempt on a passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRevision {
    pub revision_id: RevisionId,
    pub passage_id: PassageId,
    pub reprocess_job_id: ReprocessJobId,
    pub attempt_number: u32,
    /// `original_excerpt` or `sibling:<passage_id>`
    pub source_variant: String,
    pub before_text: String,
    pub after_text: String,
    pub before_ratio: f64,
    pub after_ratio: f64,
    pub detected_language: String,
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub tag_id: TagId,
    pub dimension: String,
    pub term: String,
    pub confidence: f64,
    pub rationale: Option<String>,
    pub evidence_ids: Vec<PassageId>,
    pub trace_id: TraceId,
    pub reviewer_state: ReviewerState,
    pub publish_state: PublishState,
    pub created_at: DateTime<Utc>,
}

/// Overlap and confidence for one ontology dimension of a link candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScore {
    pub overlap: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub link_id: LinkId,
    pub source_passage_id: PassageId,
    pub target_passage_id: PassageId,
    pub relation_type: RelationType,
    pub weighted_score: f64,
    pub bucket: ConfidenceBucket,
    pub dimension_scores: BTreeMap<String, DimensionScore>,
    pub rationale: Option<String>,
    pub evidence_ids: Vec<PassageId>,
    pub trace_id: TraceId,
    pub reviewer_state: ReviewerState,
    pub publish_state: PublishState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub flag_id: FlagId,
    pub flag_type: String,
    pub severity: String,
    pub rationale: String,
    pub evidence_ids: Vec<PassageId>,
    pub trace_id: TraceId,
    pub reviewer_state: ReviewerState,
    pub publish_state: PublishState,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of one proposal-generation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalTrace {
    pub trace_id: TraceId,
    pub object_type: String,
    pub object_id: String,
    pub proposal_type: String,
    pub idempotency_key: String,
    pub model_name: String,
    pub prompt_version: String,
    pub prompt_hash: String,
    pub response_hash: String,
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Tag term proposed outside the controlled vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTerm {
    pub term_id: PendingTermId,
    pub dimension: String,
    pub term: String,
    pub evidence_ids: Vec<PassageId>,
    pub rationale: Option<String>,
    pub trace_id: Option<TraceId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WitnessGroup {
    pub group_id: GroupId,
    pub text_id: TextId,
    pub status: GroupStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WitnessMember {
    pub group_id: GroupId,
    pub source_id: SourceId,
    pub role: MemberRole,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// One passage feeding a consolidated passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contributor {
    pub passage_id: PassageId,
    pub source_id: SourceId,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedPassage {
    pub consolidated_id: ConsolidatedId,
    pub group_id: GroupId,
    /// Hash of the sorted contributing passage ids
    pub cluster_key: String,
    pub merged_text: String,
    pub contributors: Vec<Contributor>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub review_id: ReviewId,
    pub object_type: ReviewableType,
    pub object_id: String,
    pub decision: ReviewDecisionKind,
    pub reviewer_id: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub audit_id: AuditId,
    pub actor: String,
    pub action: String,
    pub object_type: String,
    pub object_id: String,
    pub previous_state: Option<String>,
    pub new_state: Option<String>,
    pub correlation_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        object_type: impl Into<String>,
        object_id: impl Into<String>,
    ) -> Self {
        Self {
            audit_id: AuditId::new(),
            actor: actor.into(),
            action: action.into(),
            object_type: object_type.into(),
            object_id: object_id.into(),
            previous_state: None,
            new_state: None,
            correlation_id: None,
            details: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_transition(mut self, previous: Option<&str>, new: Option<&str>) -> Self {
        self.previous_state = previous.map(str::to_string);
        self.new_state = new.map(str::to_string);
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Immutable snapshot written when an object is published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishPackage {
    pub package_id: PackageId,
    pub object_type: ReviewableType,
    pub object_id: String,
    pub content_hash: String,
    pub snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Score cutoffs a tuning profile applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileThresholds {
    pub relevance_accept: f64,
    /// Never above `relevance_accept`
    pub relevance_filter: f64,
    pub usability_reprocess: f64,
    pub untranslated_ratio: f64,
}

/// Extra terms scored on top of the built-in relevance lexicons.
///
/// Entries are stored trimmed and lowercased. Keywords match whole tokens,
/// phrases match anywhere in the lowercased text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileLexicons {
    pub positive_keywords: BTreeSet<String>,
    pub noise_keywords: BTreeSet<String>,
    pub noise_phrases: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSegmentation {
    pub min_passage_length: usize,
    /// Falls back to the pipeline configuration when unset
    pub max_passages_per_source: Option<usize>,
}

/// Named, versioned extraction tuning. Exactly one profile is the default, and
/// extraction and reprocessing run under a snapshot of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningProfile {
    pub profile_id: ProfileId,
    pub name: String,
    pub is_default: bool,
    /// Bumped on every content change
    pub version: u32,
    pub thresholds: ProfileThresholds,
    pub lexicons: ProfileLexicons,
    pub segmentation: ProfileSegmentation,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Operator input for creating or replacing a profile's content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileDraft {
    pub name: String,
    #[serde(default)]
    pub thresholds: ProfileThresholds,
    #[serde(default)]
    pub lexicons: ProfileLexicons,
    #[serde(default)]
    pub segmentation: ProfileSegmentation,
}
