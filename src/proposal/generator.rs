//! Proposal generation for one passage, and link creation for scored pairs
//!
//! Flow for a passage: build the versioned prompt, call the capability, parse the
//! raw response, and on a malformed response make exactly one repair call. Every
//! attempt leaves a trace row. A parsed bundle is applied through the
//! [`ProposalSink`]; link nominations that survive are re-scored locally and only
//! pairs at or above the link threshold become links.

use super::commonality::{self, CommonalityScore};
use super::payload::{parse_bundle, ProposalBundle};
use super::sink::{ProposalSink, Rejection};
use crate::capability::{PeerPassage, ProposalClient, ProposalRequest};
use crate::config::PipelineConfig;
use crate::error::{CurationError, CurationResult};
use crate::model::vocabulary::ONTOLOGY;
use crate::model::*;
use crate::store::{insert_audit, passages, proposals, SqliteStore};
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Proposal type recorded on passage-level traces.
pub const BUNDLE: &str = "bundle";

const PEER_LIMIT: usize = 10;
const PROMPT_TEXT_CHARS: usize = 2800;
const PROMPT_PEER_CHARS: usize = 320;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposalOutcome {
    Skipped { reason: String },
    Proposed(ProposalReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalReport {
    pub trace_id: TraceId,
    pub retry_count: u32,
    pub tags: Vec<TagId>,
    pub flags: Vec<FlagId>,
    pub pending_terms: Vec<PendingTermId>,
    pub links: Vec<LinkId>,
    /// Nominations that scored below the link threshold
    pub discarded_links: usize,
    pub rejections: Vec<Rejection>,
}

/// What happened to one candidate pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum LinkDisposition {
    Created { link_id: LinkId, score: f64, bucket: ConfidenceBucket },
    Existing { link_id: LinkId },
    Discarded { score: f64 },
}

pub struct ProposalGenerator<'a> {
    store: &'a SqliteStore,
    client: &'a dyn ProposalClient,
    prompt_version: String,
    actor: String,
    include_filtered: bool,
}

impl<'a> ProposalGenerator<'a> {
    pub fn new(store: &'a SqliteStore, client: &'a dyn ProposalClient, config: &PipelineConfig) -> Self {
        Self {
            store,
            client,
            prompt_version: config.prompt_version.clone(),
            actor: config.operator_id.clone(),
            include_filtered: false,
        }
    }

    /// Also propose for passages the relevance gate filtered out.
    pub fn with_filtered(mut self, include: bool) -> Self {
        self.include_filtered = include;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub async fn propose_for_passage(&self, passage_id: &PassageId) -> CurationResult<ProposalOutcome> {
        let (passage, peers, prior_attempts, done) = self.store.read(|conn| -> CurationResult<_> {
            let passage = passages::find_passage(conn, passage_id)?
                .ok_or_else(|| CurationError::not_found("passage", passage_id.as_str()))?;
            let peers = passages::peer_passages(conn, &passage.text_id, PEER_LIMIT)?;
            let prior = proposals::traces_for_object(conn, passage_id.as_str())?
                .iter()
                .filter(|t| t.proposal_type == BUNDLE)
                .count();
            let done = proposals::has_successful_trace(conn, passage_id.as_str(), BUNDLE)?;
            Ok((passage, peers, prior, done))
        })?;

        if passage.relevance_state == RelevanceState::Filtered && !self.include_filtered {
            debug!(passage_id = %passage_id, "skipping filtered passage");
            return Ok(ProposalOutcome::Skipped {
                reason: "filtered".to_string(),
            });
        }
        if done {
            return Ok(ProposalOutcome::Skipped {
                reason: "already_proposed".to_string(),
            });
        }

        let request = ProposalRequest {
            passage_id: passage.passage_id.to_string(),
            text_id: passage.text_id.to_string(),
            text: passage.normalized_excerpt.clone(),
            original_language: passage.detected_language.clone(),
            peers: peers
                .iter()
                .filter(|peer| peer.passage_id != passage.passage_id)
                .map(|peer| PeerPassage {
                    passage_id: peer.passage_id.to_string(),
                    text_id: peer.text_id.to_string(),
                    text: peer.normalized_excerpt.clone(),
                })
                .collect(),
            prompt: String::new(),
        };
        let request = ProposalRequest {
            prompt: build_prompt(&request),
            ..request
        };
        let key = format!("{}:{}:{}", BUNDLE, passage_id, prior_attempts);

        let raw = match self.client.propose(&request).await {
            Ok(raw) => raw,
            Err(err) => {
                return Err(self.record_failure(&passage, &key, &request.prompt, "", 0, "proposal_unavailable", &err.to_string()));
            }
        };

        let (prompt, raw, bundle, retry_count) = match parse_bundle(&raw) {
            Ok(bundle) => (request.prompt.clone(), raw, bundle, 0),
            Err(first) => {
                warn!(passage_id = %passage_id, error = %first, "malformed proposal, attempting repair");
                let repair = ProposalRequest {
                    prompt: build_repair_prompt(&request.prompt, &raw, &first.to_string()),
                    ..request.clone()
                };
                let repaired = match self.client.repair(&repair, &raw, &first.to_string()).await {
                    Ok(repaired) => repaired,
                    Err(err) => {
                        return Err(self.record_failure(&passage, &key, &repair.prompt, &raw, 1, "proposal_unavailable", &err.to_string()));
                    }
                };
                match parse_bundle(&repaired) {
                    Ok(bundle) => (repair.prompt, repaired, bundle, 1),
                    Err(second) => {
                        let reason = format!("first: {}; after repair: {}", first, second);
                        return Err(self.record_failure(&passage, &key, &repair.prompt, &repaired, 1, "proposal_malformed", &reason));
                    }
                }
            }
        };

        let report = self.store.transaction(|tx| -> CurationResult<ProposalReport> {
            let trace = ProposalTrace {
                trace_id: TraceId::new(),
                object_type: "passage".to_string(),
                object_id: passage.passage_id.to_string(),
                proposal_type: BUNDLE.to_string(),
                idempotency_key: key.clone(),
                model_name: self.client.model_name().to_string(),
                prompt_version: self.prompt_version.clone(),
                prompt_hash: sha256_hex(prompt.as_bytes()),
                response_hash: sha256_hex(raw.as_bytes()),
                retry_count,
                failure_reason: None,
                created_at: Utc::now(),
            };
            proposals::insert_trace(tx, &trace)?;
            self.apply_bundle(tx, &passage, &trace, &bundle)
        })?;

        info!(
            passage_id = %passage_id,
            tags = report.tags.len(),
            flags = report.flags.len(),
            links = report.links.len(),
            rejected = report.rejections.len(),
            "proposals recorded"
        );
        Ok(ProposalOutcome::Proposed(report))
    }

    fn apply_bundle(
        &self,
        conn: &Connection,
        passage: &Passage,
        trace: &ProposalTrace,
        bundle: &ProposalBundle,
    ) -> CurationResult<ProposalReport> {
        let sunk = ProposalSink::new(conn, passage, &trace.trace_id, &self.actor).apply(bundle)?;
        let mut links = Vec::new();
        let mut discarded_links = 0;
        for nomination in &sunk.nominations {
            let disposition = link_pair(
                conn,
                &passage.passage_id,
                &nomination.target_passage_id,
                nomination.relation_type,
                nomination.rationale.as_deref(),
                Some(&trace.trace_id),
                &self.actor,
            )?;
            match disposition {
                LinkDisposition::Created { link_id, .. } => links.push(link_id),
                LinkDisposition::Existing { .. } => {}
                LinkDisposition::Discarded { .. } => discarded_links += 1,
            }
        }
        Ok(ProposalReport {
            trace_id: trace.trace_id.clone(),
            retry_count: trace.retry_count,
            tags: sunk.tags,
            flags: sunk.flags,
            pending_terms: sunk.pending_terms,
            links,
            discarded_links,
            rejections: sunk.rejections,
        })
    }

    /// Write the failed-attempt trace on its own and hand back the error to raise.
    #[allow(clippy::too_many_arguments)]
    fn record_failure(
        &self,
        passage: &Passage,
        key: &str,
        prompt: &str,
        raw: &str,
        retry_count: u32,
        code: &str,
        reason: &str,
    ) -> CurationError {
        let trace = ProposalTrace {
            trace_id: TraceId::new(),
            object_type: "passage".to_string(),
            object_id: passage.passage_id.to_string(),
            proposal_type: BUNDLE.to_string(),
            idempotency_key: key.to_string(),
            model_name: self.client.model_name().to_string(),
            prompt_version: self.prompt_version.clone(),
            prompt_hash: sha256_hex(prompt.as_bytes()),
            response_hash: sha256_hex(raw.as_bytes()),
            retry_count,
            failure_reason: Some(reason.to_string()),
            created_at: Utc::now(),
        };
        let written = self.store.transaction(|tx| -> CurationResult<()> {
            proposals::insert_trace(tx, &trace)?;
            insert_audit(
                tx,
                &AuditEvent::new(&self.actor, "proposal_failed", "passage", passage.passage_id.as_str())
                    .with_details(serde_json::json!({ "trace_id": trace.trace_id, "code": code, "reason": reason })),
            )?;
            Ok(())
        });
        if let Err(err) = written {
            return err;
        }
        warn!(passage_id = %passage.passage_id, code, reason, "proposal attempt failed");
        CurationError::TransientProcessing {
            code: code.to_string(),
            message: reason.to_string(),
        }
    }

    /// Score explicit candidate pairs and persist the ones that clear the threshold.
    pub fn propose_links(&self, pairs: &[(PassageId, PassageId)]) -> CurationResult<Vec<LinkDisposition>> {
        self.store.transaction(|tx| {
            pairs
                .iter()
                .map(|(a, b)| link_pair(tx, a, b, RelationType::SharesPatternWith, None, None, &self.actor))
                .collect()
        })
    }
}

/// Score one pair from its non-rejected tags and create the link if it clears
/// [`commonality::MIN_LINK_SCORE`]. An existing link between the pair, in either
/// direction, is reported instead of duplicated.
pub(crate) fn link_pair(
    conn: &Connection,
    source: &PassageId,
    target: &PassageId,
    relation_type: RelationType,
    rationale: Option<&str>,
    nominated_by: Option<&TraceId>,
    actor: &str,
) -> CurationResult<LinkDisposition> {
    if source == target {
        return Err(CurationError::validation("target_passage_id", "a passage cannot link to itself"));
    }
    for id in [source, target] {
        if passages::find_passage(conn, id)?.is_none() {
            return Err(CurationError::not_found("passage", id.as_str()));
        }
    }
    if let Some(link_id) = proposals::find_link_between(conn, source, target)? {
        return Ok(LinkDisposition::Existing { link_id });
    }

    let profile_of = |id: &PassageId| -> CurationResult<commonality::TagProfile> {
        let tags = proposals::tags_for_passage(conn, id)?;
        Ok(commonality::profile(
            tags.iter().filter(|t| t.reviewer_state != ReviewerState::Rejected),
        ))
    };
    let (a, b) = (profile_of(source)?, profile_of(target)?);
    let Some(CommonalityScore {
        weighted_score,
        bucket,
        dimensions,
    }) = commonality::evaluate(&a, &b)
    else {
        let score = commonality::score(&a, &b).weighted_score;
        debug!(%source, %target, score, "link candidate below threshold");
        return Ok(LinkDisposition::Discarded { score });
    };

    let now = Utc::now();
    let link_id = LinkId::new();
    let (lo, hi) = if source < target { (source, target) } else { (target, source) };
    let trace = proposals::internal_trace(
        "link",
        link_id.as_str(),
        "commonality",
        format!("commonality:{}:{}", lo, hi),
        "commonality_scorer",
        now,
    );
    proposals::insert_trace(conn, &trace)?;
    proposals::insert_link(
        conn,
        &Link {
            link_id: link_id.clone(),
            source_passage_id: source.clone(),
            target_passage_id: target.clone(),
            relation_type,
            weighted_score,
            bucket,
            dimension_scores: dimensions,
            rationale: rationale.map(str::to_string),
            evidence_ids: vec![source.clone(), target.clone()],
            trace_id: trace.trace_id,
            reviewer_state: ReviewerState::Proposed,
            publish_state: PublishState::Blocked,
            created_at: now,
        },
    )?;
    insert_audit(
        conn,
        &AuditEvent::new(actor, "create", "link", link_id.as_str())
            .with_transition(None, Some(ReviewerState::Proposed.as_str()))
            .with_correlation(source.as_str())
            .with_details(serde_json::json!({
                "weighted_score": weighted_score,
                "bucket": bucket,
                "nominated_by": nominated_by,
            })),
    )?;
    Ok(LinkDisposition::Created {
        link_id,
        score: weighted_score,
        bucket,
    })
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The versioned proposal prompt: allowed terms, passage text and peer context.
pub fn build_prompt(request: &ProposalRequest) -> String {
    let allowed: BTreeMap<&str, Vec<&str>> = ONTOLOGY
        .iter()
        .map(|(dimension, terms)| {
            let mut terms = terms.to_vec();
            terms.sort_unstable();
            (*dimension, terms)
        })
        .collect();
    let allowed = serde_json::to_string(&allowed).unwrap_or_default();
    let peers = request
        .peers
        .iter()
        .take(PEER_LIMIT)
        .map(|peer| format!("- {}: {}", peer.passage_id, truncate(&peer.text, PROMPT_PEER_CHARS)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "You are proposing structured ritual-analysis metadata.\n\
         Return strictly JSON with keys tags, links, flags.\n\
         Each tag/link/flag must include evidence_ids with valid passage IDs from the provided passage IDs.\n\
         Do not return markdown, prose, or extra keys.\n\
         Only use ontology terms from this map:\n\
         {}\n\
         Passage ID: {}\n\
         Passage text: {}\n\
         Candidate peer passages for cross-cultural linking:\n\
         {}\n",
        allowed,
        request.passage_id,
        truncate(&request.text, PROMPT_TEXT_CHARS),
        peers
    )
}

pub fn build_repair_prompt(original_prompt: &str, raw_response: &str, error: &str) -> String {
    format!(
        "Repair this invalid JSON response and return strictly valid JSON only.\n\
         Follow the original schema requirements and preserve only valid objects.\n\
         Original prompt:\n{}\n\
         Invalid response:\n{}\n\
         Validation error:\n{}\n",
        original_prompt, raw_response, error
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityError, ScriptedProposer};
    use crate::proposal::HeuristicProposer;
    use crate::store::{count_audit_events, sources, OpenStore};

    struct Fixture {
        store: SqliteStore,
        config: PipelineConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: SqliteStore::open_in_memory().unwrap(),
                config: PipelineConfig::default(),
            }
        }

        fn passage(&self, id: &str, text: &str, language: &str) -> Passage {
            let now = Utc::now();
            let text_id = TextId::new();
            let source_id = SourceId::new();
            let passage = Passage {
                passage_id: PassageId::from_string(id),
                source_id: source_id.clone(),
                text_id: text_id.clone(),
                locator: "p1:l1-1".into(),
                original_excerpt: text.into(),
                normalized_excerpt: text.into(),
                detected_language: language.into(),
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
            self.store
                .read(|conn| {
                    sources::insert_text(
                        conn,
                        &Text {
                            text_id: text_id.clone(),
                            title: id.to_string(),
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

        fn tag(&self, passage: &PassageId, dimension: &str, term: &str, confidence: f64) {
            self.store
                .transaction(|tx| -> CurationResult<()> {
                    let trace = proposals::internal_trace(
                        "tag",
                        "seed",
                        "seed",
                        format!("seed:{}", TagId::new()),
                        "test",
                        Utc::now(),
                    );
                    proposals::insert_trace(tx, &trace)?;
                    proposals::insert_tag(
                        tx,
                        &Tag {
                            tag_id: TagId::new(),
                            dimension: dimension.into(),
                            term: term.into(),
                            confidence,
                            rationale: None,
                            evidence_ids: vec![passage.clone()],
                            trace_id: trace.trace_id,
                            reviewer_state: ReviewerState::Proposed,
                            publish_state: PublishState::Blocked,
                            created_at: Utc::now(),
                        },
                    )?;
                    Ok(())
                })
                .unwrap();
        }

        fn traces(&self, passage: &PassageId) -> Vec<ProposalTrace> {
            self.store
                .read(|c| proposals::traces_for_object(c, passage.as_str()))
                .unwrap()
        }
    }

    const VALID: &str = r#"{"tags": [{"ontology_dimension": "time_timing",
        "controlled_term": "dawn_operation", "confidence": 0.68, "evidence_ids": ["psg_a"]}]}"#;

    // === Scenario: well-formed response on the first call ===

    #[tokio::test]
    async fn first_call_success_writes_one_trace() {
        let fx = Fixture::new();
        let p = fx.passage("psg_a", "At dawn the priest pours out water.", "eng");
        let client = ScriptedProposer::new().with_response(VALID);
        let generator = ProposalGenerator::new(&fx.store, &client, &fx.config);

        let outcome = generator.propose_for_passage(&p.passage_id).await.unwrap();
        let ProposalOutcome::Proposed(report) = outcome else {
            panic!("expected proposals");
        };
        assert_eq!(report.tags.len(), 1);
        assert_eq!(report.retry_count, 0);
        let traces = fx.traces(&p.passage_id);
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].idempotency_key, "bundle:psg_a:0");
        assert_eq!(traces[0].model_name, "scripted");
        assert!(traces[0].failure_reason.is_none());
    }

    // === Scenario: malformed then repaired ===

    #[tokio::test]
    async fn malformed_response_is_repaired_once() {
        let fx = Fixture::new();
        let p = fx.passage("psg_a", "At dawn the priest pours out water.", "eng");
        let client = ScriptedProposer::new()
            .with_response("Sure! Here are your tags: dawn")
            .with_response(VALID);
        let generator = ProposalGenerator::new(&fx.store, &client, &fx.config);

        let ProposalOutcome::Proposed(report) = generator.propose_for_passage(&p.passage_id).await.unwrap() else {
            panic!("expected proposals");
        };
        assert_eq!(report.retry_count, 1);
        assert_eq!(client.calls(), vec!["propose", "repair"]);
        assert_eq!(fx.traces(&p.passage_id)[0].retry_count, 1);
    }

    // === Scenario: malformed twice raises with a failure trace ===

    #[tokio::test]
    async fn malformed_after_repair_fails_with_trace() {
        let fx = Fixture::new();
        let p = fx.passage("psg_a", "At dawn the priest pours out water.", "eng");
        let client = ScriptedProposer::new().with_response("nope").with_response("still nope");
        let generator = ProposalGenerator::new(&fx.store, &client, &fx.config);

        let err = generator.propose_for_passage(&p.passage_id).await.unwrap_err();
        assert_eq!(err.code(), "transient_processing_error");
        let traces = fx.traces(&p.passage_id);
        assert_eq!(traces.len(), 1);
        assert!(traces[0].failure_reason.as_deref().unwrap().contains("after repair"));
        let tags = fx.store.read(|c| proposals::tags_for_passage(c, &p.passage_id)).unwrap();
        assert!(tags.is_empty());

        // A later attempt gets its own key and can succeed.
        let client = ScriptedProposer::new().with_response(VALID);
        let generator = ProposalGenerator::new(&fx.store, &client, &fx.config);
        generator.propose_for_passage(&p.passage_id).await.unwrap();
        let keys: Vec<_> = fx.traces(&p.passage_id).into_iter().map(|t| t.idempotency_key).collect();
        assert!(keys.contains(&"bundle:psg_a:1".to_string()));
    }

    #[tokio::test]
    async fn unavailable_capability_is_transient() {
        let fx = Fixture::new();
        let p = fx.passage("psg_a", "At dawn.", "eng");
        let client = ScriptedProposer::new().with_failure(CapabilityError::Unavailable("offline".into()));
        let generator = ProposalGenerator::new(&fx.store, &client, &fx.config);
        let err = generator.propose_for_passage(&p.passage_id).await.unwrap_err();
        assert!(matches!(err, CurationError::TransientProcessing { ref code, .. } if code == "proposal_unavailable"));
        let failures = fx
            .store
            .read(|c| count_audit_events(c, p.passage_id.as_str(), "proposal_failed"))
            .unwrap();
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn already_proposed_and_filtered_passages_are_skipped() {
        let fx = Fixture::new();
        let p = fx.passage("psg_a", "At dawn the priest pours out water.", "eng");
        let client = HeuristicProposer::new();
        let generator = ProposalGenerator::new(&fx.store, &client, &fx.config);
        assert!(matches!(
            generator.propose_for_passage(&p.passage_id).await.unwrap(),
            ProposalOutcome::Proposed(_)
        ));
        assert_eq!(
            generator.propose_for_passage(&p.passage_id).await.unwrap(),
            ProposalOutcome::Skipped {
                reason: "already_proposed".into()
            }
        );

        let filtered = fx.passage("psg_f", "Table of contents.", "eng");
        fx.store
            .read(|c| {
                c.execute(
                    "UPDATE passages SET relevance_state = 'filtered' WHERE passage_id = ?1",
                    [filtered.passage_id.as_str()],
                )
            })
            .unwrap();
        assert_eq!(
            generator.propose_for_passage(&filtered.passage_id).await.unwrap(),
            ProposalOutcome::Skipped { reason: "filtered".into() }
        );
    }

    // === Scenario: link candidates at 0.80 and 0.40 ===

    #[test]
    fn high_pair_links_and_low_pair_stays_exploratory() {
        let fx = Fixture::new();
        let a = fx.passage("psg_a", "a", "eng").passage_id;
        let b = fx.passage("psg_b", "b", "eng").passage_id;
        let c = fx.passage("psg_c", "c", "eng").passage_id;
        // a and b share every heavy dimension: 0.18+0.18+0.13+0.13+0.09+0.08+0.01 = 0.80
        for (dimension, term) in [
            ("ritual_intent", "healing"),
            ("ritual_actions", "anointing"),
            ("materials_tools", "plant_materia"),
            ("invocation_structure", "deity_address"),
            ("time_timing", "dawn_operation"),
            ("location_setting", "temple_sanctuary"),
            ("outcome_claim", "healing_claim"),
        ] {
            fx.tag(&a, dimension, term, 0.8);
            fx.tag(&b, dimension, term, 0.8);
        }
        // a and c: 0.18+0.13+0.09 = 0.40
        for (dimension, term) in [
            ("ritual_intent", "healing"),
            ("materials_tools", "plant_materia"),
            ("time_timing", "dawn_operation"),
        ] {
            fx.tag(&c, dimension, term, 0.8);
        }

        let client = HeuristicProposer::new();
        let generator = ProposalGenerator::new(&fx.store, &client, &fx.config);
        let results = generator
            .propose_links(&[(a.clone(), b.clone()), (a.clone(), c.clone())])
            .unwrap();
        let LinkDisposition::Created { link_id, score, bucket } = &results[0] else {
            panic!("expected a link, got {:?}", results[0]);
        };
        assert_eq!(*score, 0.8);
        assert_eq!(*bucket, ConfidenceBucket::High);
        let LinkDisposition::Created { score, bucket, .. } = &results[1] else {
            panic!("expected a link, got {:?}", results[1]);
        };
        assert_eq!(*score, 0.4);
        assert_eq!(*bucket, ConfidenceBucket::Exploratory);

        let link = fx.store.read(|c| proposals::find_link(c, link_id)).unwrap().unwrap();
        assert_eq!(link.evidence_ids, vec![a.clone(), b.clone()]);
        assert_eq!(
            fx.store.read(|c| proposals::get_trace(c, &link.trace_id)).unwrap().model_name,
            "commonality_scorer"
        );

        // Re-proposing the same pair in reverse is not a second link.
        let again = generator.propose_links(&[(b.clone(), a.clone())]).unwrap();
        assert!(matches!(again[0], LinkDisposition::Existing { .. }));
    }

    #[test]
    fn untagged_pair_is_discarded() {
        let fx = Fixture::new();
        let a = fx.passage("psg_a", "a", "eng").passage_id;
        let b = fx.passage("psg_b", "b", "eng").passage_id;
        let client = HeuristicProposer::new();
        let generator = ProposalGenerator::new(&fx.store, &client, &fx.config);
        let results = generator.propose_links(&[(a, b)]).unwrap();
        assert_eq!(results, vec![LinkDisposition::Discarded { score: 0.0 }]);
        assert_eq!(fx.store.read(proposals::count_links).unwrap(), 0);
    }

    #[test]
    fn prompt_truncates_and_lists_peers() {
        let request = ProposalRequest {
            passage_id: "psg_a".into(),
            text_id: "txt_a".into(),
            text: "x".repeat(5000),
            original_language: "eng".into(),
            peers: vec![PeerPassage {
                passage_id: "psg_b".into(),
                text_id: "txt_b".into(),
                text: "y".repeat(1000),
            }],
            prompt: String::new(),
        };
        let prompt = build_prompt(&request);
        assert!(prompt.contains(&format!("Passage text: {}\n", "x".repeat(2800))));
        assert!(prompt.contains(&format!("- psg_b: {}\n", "y".repeat(320))));
        assert!(prompt.contains("\"time_timing\""));
    }
}
