//! Schema for untrusted proposal payloads
//!
//! A proposal capability returns JSON text. Nothing in it is trusted until it
//! parses into [`ProposalBundle`]: unknown keys are refused, numeric fields are
//! range-checked. Referential checks (evidence ids, vocabulary) happen later in
//! the sink, per item.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagProposal {
    pub ontology_dimension: String,
    pub controlled_term: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    #[serde(default)]
    pub rationale_note: Option<String>,
}

/// A link nomination. The pair is re-scored locally; any score the capability
/// sends is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkProposal {
    pub target_passage_id: String,
    #[serde(default = "default_relation")]
    pub relation_type: String,
    #[serde(default)]
    pub weighted_similarity_score: Option<f64>,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    #[serde(default)]
    pub rationale_note: Option<String>,
}

fn default_relation() -> String {
    "sharesPatternWith".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlagProposal {
    pub flag_type: String,
    pub severity: String,
    pub rationale: String,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProposalBundle {
    #[serde(default)]
    pub tags: Vec<TagProposal>,
    #[serde(default)]
    pub links: Vec<LinkProposal>,
    #[serde(default)]
    pub flags: Vec<FlagProposal>,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{field} = {value} is outside [0, 1]")]
    OutOfRange { field: String, value: f64 },
}

/// Parse and range-check a raw capability response.
pub fn parse_bundle(raw: &str) -> Result<ProposalBundle, PayloadError> {
    let bundle: ProposalBundle = serde_json::from_str(raw.trim())?;
    for (idx, tag) in bundle.tags.iter().enumerate() {
        check_unit(format!("tags[{}].confidence", idx), tag.confidence)?;
    }
    for (idx, link) in bundle.links.iter().enumerate() {
        if let Some(score) = link.weighted_similarity_score {
            check_unit(format!("links[{}].weighted_similarity_score", idx), score)?;
        }
    }
    Ok(bundle)
}

fn check_unit(field: String, value: f64) -> Result<(), PayloadError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(PayloadError::OutOfRange { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_bundle() {
        let raw = r#"{
            "tags": [{"ontology_dimension": "time_timing", "controlled_term": "dawn_operation",
                      "confidence": 0.68, "evidence_ids": ["psg_a"]}],
            "links": [{"target_passage_id": "psg_b", "evidence_ids": ["psg_a", "psg_b"]}],
            "flags": []
        }"#;
        let bundle = parse_bundle(raw).unwrap();
        assert_eq!(bundle.tags.len(), 1);
        assert_eq!(bundle.links[0].relation_type, "sharesPatternWith");
    }

    #[test]
    fn missing_sections_default_to_empty() {
        assert_eq!(parse_bundle("{}").unwrap(), ProposalBundle::default());
    }

    #[test]
    fn unknown_keys_are_refused() {
        assert!(matches!(
            parse_bundle(r#"{"tags": [], "summary": "extra"}"#),
            Err(PayloadError::Json(_))
        ));
    }

    #[test]
    fn prose_is_malformed() {
        assert!(parse_bundle("Here are the tags you asked for").is_err());
    }

    #[test]
    fn confidence_out_of_range_is_refused() {
        let raw = r#"{"tags": [{"ontology_dimension": "time_timing",
                                "controlled_term": "dawn_operation", "confidence": 1.4}]}"#;
        assert!(matches!(parse_bundle(raw), Err(PayloadError::OutOfRange { .. })));
    }
}
