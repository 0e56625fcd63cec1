//! Keyword heuristic proposal capability
//!
//! Deterministic stand-in for a model-backed proposer. It answers with a JSON
//! bundle built from keyword hits in the normalized passage, so the rest of the
//! pipeline sees the same untrusted payload path either way.

use super::payload::{FlagProposal, LinkProposal, ProposalBundle, TagProposal};
use crate::capability::{CapabilityError, ProposalClient, ProposalRequest};
use crate::model::vocabulary::{CANONICAL_LANGUAGE, UNCERTAIN_TRANSLATION};
use async_trait::async_trait;
use std::collections::HashSet;

/// `(needle, dimension, term)`; a needle matches anywhere in the lowercased text.
const KEYWORDS: &[(&str, &str, &str)] = &[
    ("dawn", "time_timing", "dawn_operation"),
    ("night", "time_timing", "night_operation"),
    ("offering", "exchange_offering", "food_offering"),
    ("libation", "exchange_offering", "liquid_libation"),
    ("circle", "protection_boundary", "circle_boundary"),
    ("protect", "ritual_intent", "protection"),
    ("divin", "ritual_intent", "divination"),
    ("invoke", "ritual_actions", "invocation"),
];

const KEYWORD_CONFIDENCE: f64 = 0.68;
const FALLBACK_CONFIDENCE: f64 = 0.51;
const MAX_TAGS: usize = 3;
const PEER_MIN_SIMILARITY: f64 = 0.35;

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicProposer;

impl HeuristicProposer {
    pub fn new() -> Self {
        Self
    }

    pub fn bundle_for(&self, request: &ProposalRequest) -> ProposalBundle {
        let text = request.text.to_lowercase();
        let evidence = vec![request.passage_id.clone()];

        let mut tags: Vec<TagProposal> = KEYWORDS
            .iter()
            .filter(|(needle, _, _)| text.contains(needle))
            .map(|(_, dimension, term)| TagProposal {
                ontology_dimension: dimension.to_string(),
                controlled_term: term.to_string(),
                confidence: KEYWORD_CONFIDENCE,
                evidence_ids: evidence.clone(),
                rationale_note: None,
            })
            .collect();
        if tags.is_empty() {
            tags.push(TagProposal {
                ontology_dimension: "outcome_claim".to_string(),
                controlled_term: "uncertain_or_symbolic".to_string(),
                confidence: FALLBACK_CONFIDENCE,
                evidence_ids: evidence.clone(),
                rationale_note: None,
            });
        }
        tags.truncate(MAX_TAGS);

        let mut flags = Vec::new();
        if request.original_language != CANONICAL_LANGUAGE {
            flags.push(FlagProposal {
                flag_type: UNCERTAIN_TRANSLATION.to_string(),
                severity: "medium".to_string(),
                rationale: "Passage normalized into canonical English representation from non-English original."
                    .to_string(),
                evidence_ids: evidence.clone(),
            });
        }

        let own = tokens(&request.text);
        let best = request
            .peers
            .iter()
            .filter(|peer| peer.text_id != request.text_id && peer.passage_id != request.passage_id)
            .map(|peer| (peer, jaccard(&own, &tokens(&peer.text))))
            .fold(None, |best: Option<(_, f64)>, (peer, score)| match best {
                Some((_, top)) if top >= score => best,
                _ => Some((peer, score)),
            });
        let links = match best {
            Some((peer, score)) if score >= PEER_MIN_SIMILARITY => vec![LinkProposal {
                target_passage_id: peer.passage_id.clone(),
                relation_type: "sharesPatternWith".to_string(),
                weighted_similarity_score: Some((score * 10_000.0).round() / 10_000.0),
                evidence_ids: vec![request.passage_id.clone(), peer.passage_id.clone()],
                rationale_note: None,
            }],
            _ => Vec::new(),
        };

        ProposalBundle { tags, links, flags }
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|token| token.chars().count() > 2)
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    a.intersection(b).count() as f64 / a.union(b).count() as f64
}

#[async_trait]
impl ProposalClient for HeuristicProposer {
    fn model_name(&self) -> &str {
        "heuristic"
    }

    async fn propose(&self, request: &ProposalRequest) -> Result<String, CapabilityError> {
        serde_json::to_string(&self.bundle_for(request)).map_err(|e| CapabilityError::InvocationFailed(e.to_string()))
    }

    async fn repair(&self, request: &ProposalRequest, _raw: &str, _error: &str) -> Result<String, CapabilityError> {
        self.propose(request).await
    }
}
