//! Proposal sink: per-item validation and persistence of a parsed bundle
//!
//! The sink is where untrusted proposals meet the evidence store. Each tag, flag
//! and link nomination is checked on its own; a bad item is rejected with a reason
//! while the rest of the bundle commits. Partial success is the normal case.
//!
//! Storage errors are not rejections: they abort the surrounding transaction.

use crate::error::CurationResult;
use crate::model::vocabulary::{is_approved_term, is_dimension, is_flag_type};
use crate::model::*;
use crate::store::{insert_audit, passages, proposals};
use super::payload::{FlagProposal, LinkProposal, ProposalBundle, TagProposal};
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeSet;

const SEVERITIES: &[&str] = &["low", "medium", "high"];

/// Why an individual proposal item was not persisted as proposed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectionReason {
    /// No evidence ids were given
    MissingEvidence,
    /// Evidence id outside the passages this item may cite
    ForeignEvidence(String),
    /// Dimension is not one of the ontology dimensions
    UnknownDimension(String),
    /// Term outside the controlled vocabulary; queued as a pending term
    OutOfVocabulary { dimension: String, term: String },
    InvalidFlagType(String),
    InvalidSeverity(String),
    MissingRationale,
    /// The passage already carries a flag of this type
    DuplicateFlag(String),
    InvalidRelationType(String),
    /// Link target does not resolve to a passage
    UnknownTarget(String),
    SelfLink,
}

impl RejectionReason {
    /// Error code this rejection maps to in the shared taxonomy.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MissingEvidence | Self::ForeignEvidence(_) | Self::MissingRationale => "traceability_error",
            Self::UnknownDimension(_) | Self::OutOfVocabulary { .. } => "vocabulary_error",
            Self::UnknownTarget(_) => "referential_error",
            Self::InvalidFlagType(_)
            | Self::InvalidSeverity(_)
            | Self::DuplicateFlag(_)
            | Self::InvalidRelationType(_)
            | Self::SelfLink => "validation_error",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEvidence => write!(f, "no evidence ids"),
            Self::ForeignEvidence(id) => write!(f, "evidence id {} is not citable here", id),
            Self::UnknownDimension(dim) => write!(f, "unknown ontology dimension: {}", dim),
            Self::OutOfVocabulary { dimension, term } => {
                write!(f, "{}/{} is not in the vocabulary (queued for review)", dimension, term)
            }
            Self::InvalidFlagType(t) => write!(f, "invalid flag type: {}", t),
            Self::InvalidSeverity(s) => write!(f, "invalid severity: {}", s),
            Self::MissingRationale => write!(f, "rationale is required"),
            Self::DuplicateFlag(t) => write!(f, "passage already flagged {}", t),
            Self::InvalidRelationType(rel) => write!(f, "invalid relation type: {}", rel),
            Self::UnknownTarget(id) => write!(f, "link target {} not found", id),
            Self::SelfLink => write!(f, "a passage cannot link to itself"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    /// Which item was rejected, e.g. `tag time_timing/dawn_operation`
    pub description: String,
    pub reason: RejectionReason,
}

impl Rejection {
    pub fn new(description: impl Into<String>, reason: RejectionReason) -> Self {
        Self {
            description: description.into(),
            reason,
        }
    }
}

/// A link nomination that passed validation. It still has to be scored before
/// it becomes a link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkNomination {
    pub target_passage_id: PassageId,
    pub relation_type: RelationType,
    pub rationale: Option<String>,
}

/// What one `apply` committed and what it turned away.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SinkResult {
    pub tags: Vec<TagId>,
    pub flags: Vec<FlagId>,
    pub pending_terms: Vec<PendingTermId>,
    pub nominations: Vec<LinkNomination>,
    pub rejections: Vec<Rejection>,
}

impl SinkResult {
    /// True if no items were rejected
    pub fn is_fully_committed(&self) -> bool {
        self.rejections.is_empty()
    }
}

/// Writes one passage's proposals under one trace.
pub struct ProposalSink<'a> {
    conn: &'a Connection,
    passage: &'a Passage,
    trace_id: &'a TraceId,
    actor: &'a str,
}

impl<'a> ProposalSink<'a> {
    pub fn new(conn: &'a Connection, passage: &'a Passage, trace_id: &'a TraceId, actor: &'a str) -> Self {
        Self {
            conn,
            passage,
            trace_id,
            actor,
        }
    }

    pub fn apply(&self, bundle: &ProposalBundle) -> CurationResult<SinkResult> {
        let mut result = SinkResult::default();
        for tag in &bundle.tags {
            self.apply_tag(tag, &mut result)?;
        }
        let mut flagged: BTreeSet<String> = BTreeSet::new();
        for flag in &bundle.flags {
            self.apply_flag(flag, &mut flagged, &mut result)?;
        }
        for link in &bundle.links {
            self.apply_link(link, &mut result)?;
        }
        Ok(result)
    }

    fn apply_tag(&self, proposal: &TagProposal, result: &mut SinkResult) -> CurationResult<()> {
        let description = format!("tag {}/{}", proposal.ontology_dimension, proposal.controlled_term);
        let evidence = match clean_evidence(&proposal.evidence_ids, &[&self.passage.passage_id]) {
            Ok(evidence) => evidence,
            Err(reason) => {
                result.rejections.push(Rejection::new(description, reason));
                return Ok(());
            }
        };
        if !is_dimension(&proposal.ontology_dimension) {
            result.rejections.push(Rejection::new(
                description,
                RejectionReason::UnknownDimension(proposal.ontology_dimension.clone()),
            ));
            return Ok(());
        }
        let now = Utc::now();

        if !is_approved_term(&proposal.ontology_dimension, &proposal.controlled_term) {
            let term = PendingTerm {
                term_id: PendingTermId::new(),
                dimension: proposal.ontology_dimension.clone(),
                term: proposal.controlled_term.clone(),
                evidence_ids: evidence,
                rationale: proposal.rationale_note.clone(),
                trace_id: Some(self.trace_id.clone()),
                created_at: now,
            };
            proposals::insert_pending_term(self.conn, &term)?;
            insert_audit(
                self.conn,
                &AuditEvent::new(self.actor, "create", "pending_term", term.term_id.as_str())
                    .with_correlation(self.passage.passage_id.as_str()),
            )?;
            result.pending_terms.push(term.term_id);
            result.rejections.push(Rejection::new(
                description,
                RejectionReason::OutOfVocabulary {
                    dimension: proposal.ontology_dimension.clone(),
                    term: proposal.controlled_term.clone(),
                },
            ));
            return Ok(());
        }

        let tag = Tag {
            tag_id: TagId::new(),
            dimension: proposal.ontology_dimension.clone(),
            term: proposal.controlled_term.clone(),
            confidence: proposal.confidence,
            rationale: proposal.rationale_note.clone(),
            evidence_ids: evidence,
            trace_id: self.trace_id.clone(),
            reviewer_state: ReviewerState::Proposed,
            publish_state: PublishState::Blocked,
            created_at: now,
        };
        proposals::insert_tag(self.conn, &tag)?;
        insert_audit(
            self.conn,
            &AuditEvent::new(self.actor, "create", "tag", tag.tag_id.as_str())
                .with_transition(None, Some(ReviewerState::Proposed.as_str()))
                .with_correlation(self.passage.passage_id.as_str()),
        )?;
        result.tags.push(tag.tag_id);
        Ok(())
    }

    fn apply_flag(
        &self,
        proposal: &FlagProposal,
        flagged: &mut BTreeSet<String>,
        result: &mut SinkResult,
    ) -> CurationResult<()> {
        let description = format!("flag {}", proposal.flag_type);
        let reject = |result: &mut SinkResult, reason| {
            result.rejections.push(Rejection::new(description.clone(), reason));
            Ok(())
        };
        if !is_flag_type(&proposal.flag_type) {
            return reject(result, RejectionReason::InvalidFlagType(proposal.flag_type.clone()));
        }
        if !SEVERITIES.contains(&proposal.severity.as_str()) {
            return reject(result, RejectionReason::InvalidSeverity(proposal.severity.clone()));
        }
        if proposal.rationale.trim().is_empty() {
            return reject(result, RejectionReason::MissingRationale);
        }
        let evidence = match clean_evidence(&proposal.evidence_ids, &[&self.passage.passage_id]) {
            Ok(evidence) => evidence,
            Err(reason) => return reject(result, reason),
        };
        let already_flagged = flagged.contains(&proposal.flag_type)
            || !proposals::flags_for_passage(self.conn, &self.passage.passage_id, &proposal.flag_type)?.is_empty();
        if already_flagged {
            return reject(result, RejectionReason::DuplicateFlag(proposal.flag_type.clone()));
        }

        let flag = Flag {
            flag_id: FlagId::new(),
            flag_type: proposal.flag_type.clone(),
            severity: proposal.severity.clone(),
            rationale: proposal.rationale.trim().to_string(),
            evidence_ids: evidence,
            trace_id: self.trace_id.clone(),
            reviewer_state: ReviewerState::Proposed,
            publish_state: PublishState::Blocked,
            created_at: Utc::now(),
        };
        proposals::insert_flag(self.conn, &flag)?;
        insert_audit(
            self.conn,
            &AuditEvent::new(self.actor, "create", "flag", flag.flag_id.as_str())
                .with_transition(None, Some(ReviewerState::Proposed.as_str()))
                .with_correlation(self.passage.passage_id.as_str()),
        )?;
        flagged.insert(flag.flag_type);
        result.flags.push(flag.flag_id);
        Ok(())
    }

    fn apply_link(&self, proposal: &LinkProposal, result: &mut SinkResult) -> CurationResult<()> {
        let description = format!("link to {}", proposal.target_passage_id);
        let relation_type: RelationType = match proposal.relation_type.parse() {
            Ok(rel) => rel,
            Err(_) => {
                result.rejections.push(Rejection::new(
                    description,
                    RejectionReason::InvalidRelationType(proposal.relation_type.clone()),
                ));
                return Ok(());
            }
        };
        let target = PassageId::from_string(proposal.target_passage_id.trim());
        if target == self.passage.passage_id {
            result.rejections.push(Rejection::new(description, RejectionReason::SelfLink));
            return Ok(());
        }
        if passages::find_passage(self.conn, &target)?.is_none() {
            result.rejections.push(Rejection::new(
                description,
                RejectionReason::UnknownTarget(target.to_string()),
            ));
            return Ok(());
        }
        if let Err(reason) = clean_evidence(&proposal.evidence_ids, &[&self.passage.passage_id, &target]) {
            result.rejections.push(Rejection::new(description, reason));
            return Ok(());
        }
        result.nominations.push(LinkNomination {
            target_passage_id: target,
            relation_type,
            rationale: proposal.rationale_note.clone(),
        });
        Ok(())
    }
}

/// Trim, dedupe and check evidence ids against the passages an item may cite.
fn clean_evidence(raw: &[String], allowed: &[&PassageId]) -> Result<Vec<PassageId>, RejectionReason> {
    let mut seen = BTreeSet::new();
    let mut evidence = Vec::new();
    for id in raw.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
        if !allowed.iter().any(|allowed| allowed.as_str() == id) {
            return Err(RejectionReason::ForeignEvidence(id.to_string()));
        }
        if seen.insert(id) {
            evidence.push(PassageId::from_string(id));
        }
    }
    if evidence.is_empty() {
        return Err(RejectionReason::MissingEvidence);
    }
    Ok(evidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::payload::parse_bundle;
    use crate::store::{count_audit_events, sources, OpenStore, SqliteStore};

    fn seed_passage(store: &SqliteStore, id: &str) -> Passage {
        let now = Utc::now();
        let text_id = TextId::new();
        let source_id = SourceId::new();
        let passage = Passage {
            passage_id: PassageId::from_string(id),
            source_id: source_id.clone(),
            text_id: text_id.clone(),
            locator: "p1:l1-2".into(),
            original_excerpt: "At dawn pour the libation at the threshold.".into(),
            normalized_excerpt: "At dawn pour the libation at the threshold.".into(),
            detected_language: "eng".into(),
            language_confidence: 0.9,
            translation_status: TranslationStatus::Translated,
            untranslated_ratio: 0.0,
            usability_score: 0.8,
            relevance_score: 0.7,
            relevance_state: RelevanceState::Accepted,
            reviewer_state: ReviewerState::Proposed,
            publish_state: PublishState::Blocked,
            created_at: now,
            updated_at: now,
        };
        store
            .read(|conn| {
                sources::insert_text(
                    conn,
                    &Text {
                        text_id: text_id.clone(),
                        title: format!("Text of {}", id),
                        origin_region: None,
                        tradition_tags: vec![],
                        created_at: now,
                    },
                )?;
                sources::insert_source(
                    conn,
                    &Source {
                        source_id: source_id.clone(),
                        text_id: text_id.clone(),
                        locator: format!("{}.txt", id),
                        format_hint: "txt".into(),
                        source_sha256: format!("{}-raw", id),
                        normalized_sha256: format!("{}-norm", id),
                        witness_group_id: None,
                        is_duplicate_of: None,
                        created_at: now,
                    },
                )?;
                passages::insert_passage_if_absent(conn, &passage)
            })
            .unwrap();
        passage
    }

    fn apply(store: &SqliteStore, passage: &Passage, raw: &str) -> SinkResult {
        let bundle = parse_bundle(raw).unwrap();
        store
            .transaction(|tx| -> CurationResult<SinkResult> {
                let trace = proposals::internal_trace(
                    "passage",
                    passage.passage_id.as_str(),
                    "bundle",
                    format!("test:{}", TraceId::new()),
                    "test",
                    Utc::now(),
                );
                proposals::insert_trace(tx, &trace)?;
                ProposalSink::new(tx, passage, &trace.trace_id, "tester").apply(&bundle)
            })
            .unwrap()
    }

    // === Scenario: valid items commit alongside rejected ones ===

    #[test]
    fn partial_success() {
        let store = SqliteStore::open_in_memory().unwrap();
        let passage = seed_passage(&store, "psg_a");
        let result = apply(
            &store,
            &passage,
            r#"{"tags": [
                {"ontology_dimension": "time_timing", "controlled_term": "dawn_operation",
                 "confidence": 0.68, "evidence_ids": ["psg_a"]},
                {"ontology_dimension": "time_timing", "controlled_term": "solar_marker",
                 "confidence": 0.5, "evidence_ids": []}
            ]}"#,
        );
        assert_eq!(result.tags.len(), 1);
        assert_eq!(result.rejections.len(), 1);
        assert_eq!(result.rejections[0].reason, RejectionReason::MissingEvidence);
        assert_eq!(result.rejections[0].reason.error_code(), "traceability_error");
        assert!(!result.is_fully_committed());

        let stored = store.read(|c| proposals::find_tag(c, &result.tags[0])).unwrap().unwrap();
        assert_eq!(stored.evidence_ids, vec![passage.passage_id.clone()]);
        let audits = store
            .read(|c| count_audit_events(c, result.tags[0].as_str(), "create"))
            .unwrap();
        assert_eq!(audits, 1);
    }

    // === Scenario: out-of-vocabulary term goes to the pending queue ===

    #[test]
    fn out_of_vocabulary_becomes_pending_term() {
        let store = SqliteStore::open_in_memory().unwrap();
        let passage = seed_passage(&store, "psg_a");
        let result = apply(
            &store,
            &passage,
            r#"{"tags": [{"ontology_dimension": "ritual_actions", "controlled_term": "ecstatic_dance",
                          "confidence": 0.6, "evidence_ids": ["psg_a"]}]}"#,
        );
        assert!(result.tags.is_empty());
        assert_eq!(result.pending_terms.len(), 1);
        assert_eq!(result.rejections[0].reason.error_code(), "vocabulary_error");
        let pending = store.read(proposals::pending_terms).unwrap();
        assert_eq!(pending[0].term, "ecstatic_dance");
    }

    #[test]
    fn evidence_from_another_passage_is_refused_for_tags() {
        let store = SqliteStore::open_in_memory().unwrap();
        let passage = seed_passage(&store, "psg_a");
        seed_passage(&store, "psg_b");
        let result = apply(
            &store,
            &passage,
            r#"{"tags": [{"ontology_dimension": "time_timing", "controlled_term": "dawn_operation",
                          "confidence": 0.7, "evidence_ids": ["psg_b"]}]}"#,
        );
        assert_eq!(
            result.rejections[0].reason,
            RejectionReason::ForeignEvidence("psg_b".into())
        );
    }

    #[test]
    fn flags_are_validated_and_not_doubled() {
        let store = SqliteStore::open_in_memory().unwrap();
        let passage = seed_passage(&store, "psg_a");
        let result = apply(
            &store,
            &passage,
            r#"{"flags": [
                {"flag_type": "provenance_gap", "severity": "medium", "rationale": "No colophon.",
                 "evidence_ids": ["psg_a"]},
                {"flag_type": "provenance_gap", "severity": "low", "rationale": "Again.",
                 "evidence_ids": ["psg_a"]},
                {"flag_type": "made_up", "severity": "low", "rationale": "x", "evidence_ids": ["psg_a"]},
                {"flag_type": "date_uncertainty", "severity": "medium", "rationale": "  ",
                 "evidence_ids": ["psg_a"]}
            ]}"#,
        );
        assert_eq!(result.flags.len(), 1);
        let reasons: Vec<_> = result.rejections.iter().map(|r| r.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                RejectionReason::DuplicateFlag("provenance_gap".into()),
                RejectionReason::InvalidFlagType("made_up".into()),
                RejectionReason::MissingRationale,
            ]
        );
    }

    #[test]
    fn link_nominations_are_checked() {
        let store = SqliteStore::open_in_memory().unwrap();
        let passage = seed_passage(&store, "psg_a");
        seed_passage(&store, "psg_b");
        let result = apply(
            &store,
            &passage,
            r#"{"links": [
                {"target_passage_id": "psg_b", "evidence_ids": ["psg_a", "psg_b", "psg_a"]},
                {"target_passage_id": "psg_a", "evidence_ids": ["psg_a"]},
                {"target_passage_id": "psg_missing", "evidence_ids": ["psg_a"]},
                {"target_passage_id": "psg_b", "relation_type": "contradicts", "evidence_ids": ["psg_a"]}
            ]}"#,
        );
        assert_eq!(result.nominations.len(), 1);
        assert_eq!(result.nominations[0].relation_type, RelationType::SharesPatternWith);
        assert_eq!(result.rejections.len(), 3);
        assert_eq!(result.rejections[0].reason, RejectionReason::SelfLink);
        assert_eq!(result.rejections[1].reason.error_code(), "referential_error");
    }

    #[test]
    fn clean_evidence_dedupes_and_trims() {
        let a = PassageId::from_string("psg_a");
        let ids = vec![" psg_a ".to_string(), "psg_a".to_string(), "".to_string()];
        assert_eq!(clean_evidence(&ids, &[&a]).unwrap(), vec![a.clone()]);
        assert_eq!(clean_evidence(&[], &[&a]), Err(RejectionReason::MissingEvidence));
    }
}
