//! Dedup & Witness Engine
//!
//! Registration fingerprints a source twice: sha256 of the raw bytes, and sha256 of
//! the parsed, whitespace-compacted text (truncated to `fingerprint_max_chars`).
//! The raw hash decides exact duplicates; the normalized hash decides alternate
//! witnesses of an already registered work.

use crate::capability::{ParseError, Parser};
use crate::config::PipelineConfig;
use crate::error::{CurationError, CurationResult, ErrorReport};
use crate::model::vocabulary::{is_region, is_tradition};
use crate::model::*;
use crate::quality::segment::compact;
use crate::store::{insert_audit, sources, SqliteStore};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Everything needed to register one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInput {
    /// Defaults to a title inferred from the locator
    #[serde(default)]
    pub title: Option<String>,
    pub locator: String,
    pub format_hint: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub origin_region: Option<String>,
    #[serde(default)]
    pub tradition_tags: Vec<String>,
}

impl SourceInput {
    pub fn new(locator: impl Into<String>, format_hint: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            locator: locator.into(),
            format_hint: format_hint.into(),
            bytes: bytes.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.origin_region = Some(region.into());
        self
    }

    pub fn with_traditions<I, S>(mut self, traditions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tradition_tags = traditions.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub source_sha256: String,
    pub normalized_sha256: String,
}

/// Fingerprint raw bytes through the parser capability.
pub async fn fingerprint(
    parser: &dyn Parser,
    bytes: &[u8],
    format_hint: &str,
    max_chars: usize,
) -> Result<Fingerprint, ParseError> {
    let parsed = parser.parse(bytes, format_hint).await?;
    let mut normalized = compact(&parsed);
    if max_chars > 0 {
        if let Some((idx, _)) = normalized.char_indices().nth(max_chars) {
            normalized.truncate(idx);
        }
    }
    Ok(Fingerprint {
        source_sha256: sha256_hex(bytes),
        normalized_sha256: sha256_hex(normalized.as_bytes()),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Registration {
    pub outcome: RegisterOutcome,
    /// The new source, or the existing one for an exact duplicate
    pub source: Source,
}

/// Outcome of one item in a batch registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItem {
    pub locator: String,
    pub outcome: Option<RegisterOutcome>,
    pub source_id: Option<SourceId>,
    pub error: Option<ErrorReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub created: usize,
    pub exact_duplicate: usize,
    pub alternate_witness: usize,
    pub failed: usize,
    pub items: Vec<BatchItem>,
}

pub struct Registrar<'a> {
    store: &'a SqliteStore,
    parser: &'a dyn Parser,
    fingerprint_max_chars: usize,
    actor: String,
}

impl<'a> Registrar<'a> {
    pub fn new(store: &'a SqliteStore, parser: &'a dyn Parser, config: &PipelineConfig) -> Self {
        Self {
            store,
            parser,
            fingerprint_max_chars: config.fingerprint_max_chars,
            actor: config.operator_id.clone(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub async fn register(&self, input: &SourceInput) -> CurationResult<Registration> {
        validate(input)?;
        let print = fingerprint(self.parser, &input.bytes, &input.format_hint, self.fingerprint_max_chars)
            .await
            .map_err(|e| CurationError::validation("content", format!("{} ({}): {}", self.parser.name(), e.kind(), e)))?;

        let registration = self
            .store
            .transaction(|tx| resolve_and_insert(tx, input, &print, &self.actor, Utc::now()))?;
        info!(
            source_id = %registration.source.source_id,
            outcome = %registration.outcome,
            locator = %input.locator,
            "registered source"
        );
        Ok(registration)
    }

    /// Register every input; individual failures are reported, never raised.
    pub async fn register_batch(&self, inputs: &[SourceInput]) -> BatchReport {
        let mut report = BatchReport::default();
        for input in inputs {
            match self.register(input).await {
                Ok(registration) => {
                    match registration.outcome {
                        RegisterOutcome::Created => report.created += 1,
                        RegisterOutcome::ExactDuplicate => report.exact_duplicate += 1,
                        RegisterOutcome::AlternateWitness => report.alternate_witness += 1,
                    }
                    report.items.push(BatchItem {
                        locator: input.locator.clone(),
                        outcome: Some(registration.outcome),
                        source_id: Some(registration.source.source_id),
                        error: None,
                    });
                }
                Err(err) => {
                    warn!(locator = %input.locator, error = %err, "batch item failed");
                    report.failed += 1;
                    report.items.push(BatchItem {
                        locator: input.locator.clone(),
                        outcome: None,
                        source_id: None,
                        error: Some(err.report()),
                    });
                }
            }
        }
        report
    }
}

fn validate(input: &SourceInput) -> CurationResult<()> {
    if input.locator.trim().is_empty() {
        return Err(CurationError::validation("locator", "must not be empty"));
    }
    if input.format_hint.trim().is_empty() {
        return Err(CurationError::validation("format_hint", "must not be empty"));
    }
    if let Some(region) = &input.origin_region {
        if !is_region(region) {
            return Err(CurationError::validation("origin_region", format!("unknown region: {}", region)));
        }
    }
    if let Some(bad) = input.tradition_tags.iter().find(|t| !is_tradition(t)) {
        return Err(CurationError::validation("tradition_tags", format!("unknown tradition: {}", bad)));
    }
    Ok(())
}

fn infer_title(locator: &str) -> String {
    let stem = Path::new(locator)
        .file_stem()
        .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
        .unwrap_or_default();
    let stem = stem.trim();
    if stem.is_empty() {
        "Untitled Source".to_string()
    } else {
        stem.to_string()
    }
}

fn resolve_and_insert(
    conn: &Connection,
    input: &SourceInput,
    print: &Fingerprint,
    actor: &str,
    now: DateTime<Utc>,
) -> CurationResult<Registration> {
    if let Some(existing) = sources::find_by_source_hash(conn, &print.source_sha256)? {
        return Ok(Registration {
            outcome: RegisterOutcome::ExactDuplicate,
            source: existing,
        });
    }

    let mut source = Source {
        source_id: SourceId::new(),
        text_id: TextId::new(),
        locator: input.locator.clone(),
        format_hint: input.format_hint.trim_start_matches('.').to_ascii_lowercase(),
        source_sha256: print.source_sha256.clone(),
        normalized_sha256: print.normalized_sha256.clone(),
        witness_group_id: None,
        is_duplicate_of: None,
        created_at: now,
    };

    let (outcome, role, reason) = match sources::find_by_normalized_hash(conn, &print.normalized_sha256)? {
        Some(witness) => {
            source.text_id = witness.text_id.clone();
            source.witness_group_id = Some(ensure_group(conn, &witness, actor, now)?);
            (RegisterOutcome::AlternateWitness, MemberRole::Secondary, "normalized_text_match")
        }
        None => {
            let text = Text {
                text_id: source.text_id.clone(),
                title: input.title.clone().unwrap_or_else(|| infer_title(&input.locator)),
                origin_region: input.origin_region.clone(),
                tradition_tags: input.tradition_tags.clone(),
                created_at: now,
            };
            sources::insert_text(conn, &text)?;
            insert_audit(
                conn,
                &AuditEvent::new(actor, "register_text", "text", text.text_id.as_str())
                    .with_details(serde_json::json!({ "locator": input.locator })),
            )?;
            let group = new_group(conn, &text.text_id, actor, now)?;
            source.witness_group_id = Some(group);
            (RegisterOutcome::Created, MemberRole::Primary, "first_witness")
        }
    };

    sources::insert_source(conn, &source)?;
    let group_id = source
        .witness_group_id
        .clone()
        .ok_or_else(|| CurationError::validation("witness_group_id", "group assignment missing"))?;
    sources::insert_member(
        conn,
        &WitnessMember {
            group_id: group_id.clone(),
            source_id: source.source_id.clone(),
            role,
            reason: reason.to_string(),
            created_at: now,
        },
    )?;
    insert_audit(
        conn,
        &AuditEvent::new(actor, "register_source", "source", source.source_id.as_str())
            .with_details(serde_json::json!({
                "outcome": outcome,
                "witness_group_id": group_id,
                "role": role,
            })),
    )?;
    Ok(Registration { outcome, source })
}

fn new_group(conn: &Connection, text_id: &TextId, actor: &str, now: DateTime<Utc>) -> CurationResult<GroupId> {
    let group = WitnessGroup {
        group_id: GroupId::new(),
        text_id: text_id.clone(),
        status: GroupStatus::Active,
        created_at: now,
    };
    sources::insert_group(conn, &group)?;
    insert_audit(
        conn,
        &AuditEvent::new(actor, "create", "witness_group", group.group_id.as_str())
            .with_transition(None, Some(GroupStatus::Active.as_str())),
    )?;
    Ok(group.group_id)
}

/// The matched source's group, created with the match as primary if it has none.
fn ensure_group(conn: &Connection, witness: &Source, actor: &str, now: DateTime<Utc>) -> CurationResult<GroupId> {
    if let Some(group_id) = &witness.witness_group_id {
        return Ok(group_id.clone());
    }
    let group_id = new_group(conn, &witness.text_id, actor, now)?;
    sources::set_source_group(conn, &witness.source_id, &group_id)?;
    sources::insert_member(
        conn,
        &WitnessMember {
            group_id: group_id.clone(),
            source_id: witness.source_id.clone(),
            role: MemberRole::Primary,
            reason: "first_witness".to_string(),
            created_at: now,
        },
    )?;
    Ok(group_id)
}

/// Mark `source_id` as a duplicate of `canonical_id`.
///
/// The target must be a root with a matching normalized fingerprint, and nothing
/// may already point at the source, so the duplicate graph stays depth one.
pub fn link_duplicate(
    store: &SqliteStore,
    source_id: &SourceId,
    canonical_id: &SourceId,
    actor: &str,
) -> CurationResult<Source> {
    if source_id == canonical_id {
        return Err(CurationError::validation("canonical_id", "a source cannot duplicate itself"));
    }
    store.transaction(|tx| {
        let source = sources::find_source(tx, source_id)?
            .ok_or_else(|| CurationError::not_found("source", source_id.as_str()))?;
        let canonical = sources::find_source(tx, canonical_id)?
            .ok_or_else(|| CurationError::not_found("source", canonical_id.as_str()))?;
        if source.is_duplicate_of.as_ref() == Some(canonical_id) {
            return Ok(source);
        }
        if source.normalized_sha256 != canonical.normalized_sha256 {
            return Err(CurationError::validation(
                "canonical_id",
                "fingerprints differ; only matching witnesses can be linked",
            ));
        }
        if canonical.is_duplicate_of.is_some() {
            return Err(CurationError::policy(format!(
                "{} is itself a duplicate; link to its root instead",
                canonical_id
            )));
        }
        if source.is_duplicate_of.is_some() || sources::count_sources_pointing_at(tx, source_id)? > 0 {
            return Err(CurationError::policy(format!(
                "{} already takes part in a duplicate link",
                source_id
            )));
        }
        sources::set_duplicate_of(tx, source_id, canonical_id)?;
        insert_audit(
            tx,
            &AuditEvent::new(actor, "link_duplicate", "source", source_id.as_str())
                .with_transition(None, Some(canonical_id.as_str())),
        )?;
        Ok(sources::get_source(tx, source_id)?)
    })
}

/// Make `source_id` the primary member of its group, demoting the current one.
pub fn promote_primary(
    store: &SqliteStore,
    group_id: &GroupId,
    source_id: &SourceId,
    actor: &str,
) -> CurationResult<Vec<WitnessMember>> {
    store.transaction(|tx| {
        sources::get_group(tx, group_id)?;
        let members = sources::group_members(tx, group_id)?;
        let target = members
            .iter()
            .find(|m| &m.source_id == source_id)
            .ok_or_else(|| CurationError::not_found("witness_member", source_id.as_str()))?;
        if target.role == MemberRole::Primary {
            return Ok(members);
        }
        let previous = members.iter().find(|m| m.role == MemberRole::Primary).map(|m| m.source_id.clone());
        if let Some(previous) = &previous {
            sources::set_member_role(tx, group_id, previous, MemberRole::Secondary)?;
        }
        sources::set_member_role(tx, group_id, source_id, MemberRole::Primary)?;
        insert_audit(
            tx,
            &AuditEvent::new(actor, "promote_primary", "witness_group", group_id.as_str())
                .with_transition(previous.as_ref().map(SourceId::as_str), Some(source_id.as_str())),
        )?;
        Ok(sources::group_members(tx, group_id)?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::BuiltinParser;
    use crate::store::{count_audit_events, OpenStore};

    const RITE: &str = "At dawn the priest pours a libation upon the threshold stone.\n\nThen he invokes the guardians.";

    fn setup() -> (SqliteStore, BuiltinParser, PipelineConfig) {
        (SqliteStore::open_in_memory().unwrap(), BuiltinParser::new(), PipelineConfig::default())
    }

    // === Scenario: identical bytes twice ===

    #[tokio::test]
    async fn identical_bytes_are_an_exact_duplicate() {
        let (store, parser, config) = setup();
        let registrar = Registrar::new(&store, &parser, &config);
        let first = registrar.register(&SourceInput::new("rite.txt", "txt", RITE)).await.unwrap();
        assert_eq!(first.outcome, RegisterOutcome::Created);

        let second = registrar
            .register(&SourceInput::new("copy/rite.txt", "txt", RITE))
            .await
            .unwrap();
        assert_eq!(second.outcome, RegisterOutcome::ExactDuplicate);
        assert_eq!(second.source.source_id, first.source.source_id);
        let all = store.read(|c| sources::sources_for_text(c, &first.source.text_id)).unwrap();
        assert_eq!(all.len(), 1);
    }

    // === Scenario: same work, different layout ===

    #[tokio::test]
    async fn layout_variant_is_an_alternate_witness() {
        let (store, parser, config) = setup();
        let registrar = Registrar::new(&store, &parser, &config);
        let first = registrar.register(&SourceInput::new("rite.txt", "txt", RITE)).await.unwrap();
        let rescanned = RITE.replace(' ', "  ");
        let second = registrar
            .register(&SourceInput::new("scan/rite.txt", "txt", rescanned))
            .await
            .unwrap();

        assert_eq!(second.outcome, RegisterOutcome::AlternateWitness);
        assert_eq!(second.source.text_id, first.source.text_id);
        assert_eq!(second.source.witness_group_id, first.source.witness_group_id);
        let group = first.source.witness_group_id.clone().unwrap();
        let members = store.read(|c| sources::group_members(c, &group)).unwrap();
        let roles: Vec<_> = members.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![MemberRole::Primary, MemberRole::Secondary]);
    }

    #[tokio::test]
    async fn created_source_gets_text_and_group() {
        let (store, parser, config) = setup();
        let registrar = Registrar::new(&store, &parser, &config);
        let input = SourceInput::new("hymns/morning_hymn.md", "md", "# Hymn\n\nPraise at dawn.")
            .with_region("south_asia")
            .with_traditions(["vedic_ritual"]);
        let registered = registrar.register(&input).await.unwrap();
        let text = store.read(|c| sources::get_text(c, &registered.source.text_id)).unwrap();
        assert_eq!(text.title, "morning hymn");
        assert_eq!(text.origin_region.as_deref(), Some("south_asia"));
        let audits = store
            .read(|c| count_audit_events(c, registered.source.source_id.as_str(), "register_source"))
            .unwrap();
        assert_eq!(audits, 1);
    }

    #[tokio::test]
    async fn unknown_region_is_a_validation_error() {
        let (store, parser, config) = setup();
        let registrar = Registrar::new(&store, &parser, &config);
        let err = registrar
            .register(&SourceInput::new("a.txt", "txt", RITE).with_region("atlantis"))
            .await
            .unwrap_err();
        assert_eq!(err.report().details["field"], "origin_region");
    }

    #[tokio::test]
    async fn batch_reports_per_item_failures() {
        let (store, parser, config) = setup();
        let registrar = Registrar::new(&store, &parser, &config);
        let report = registrar
            .register_batch(&[
                SourceInput::new("a.txt", "txt", RITE),
                SourceInput::new("a-again.txt", "txt", RITE),
                SourceInput::new("b.pdf", "pdf", vec![0x25, 0x50, 0x44, 0x46]),
                SourceInput::new("c.txt", "txt", "A different rite entirely."),
            ])
            .await;
        assert_eq!(report.created, 2);
        assert_eq!(report.exact_duplicate, 1);
        assert_eq!(report.failed, 1);
        let failed = report.items.iter().find(|i| i.locator == "b.pdf").unwrap();
        assert_eq!(failed.error.as_ref().unwrap().error_code, "validation_error");
    }

    #[test]
    fn fingerprint_truncation_ignores_trailing_text() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let parser = BuiltinParser::new();
        let a = rt.block_on(fingerprint(&parser, b"abcdef tail one", "txt", 6)).unwrap();
        let b = rt.block_on(fingerprint(&parser, b"abcdef tail two", "txt", 6)).unwrap();
        assert_eq!(a.normalized_sha256, b.normalized_sha256);
        assert_ne!(a.source_sha256, b.source_sha256);
    }

    #[tokio::test]
    async fn duplicate_links_stay_depth_one() {
        let (store, parser, config) = setup();
        let registrar = Registrar::new(&store, &parser, &config);
        let root = registrar.register(&SourceInput::new("a.txt", "txt", RITE)).await.unwrap().source;
        let b = registrar
            .register(&SourceInput::new("b.txt", "txt", RITE.replace(' ', "  ")))
            .await
            .unwrap()
            .source;
        let c = registrar
            .register(&SourceInput::new("c.txt", "txt", RITE.replace(' ', "   ")))
            .await
            .unwrap()
            .source;

        let linked = link_duplicate(&store, &b.source_id, &root.source_id, "op").unwrap();
        assert_eq!(linked.is_duplicate_of, Some(root.source_id.clone()));

        let err = link_duplicate(&store, &c.source_id, &b.source_id, "op").unwrap_err();
        assert_eq!(err.code(), "policy_violation");
        let err = link_duplicate(&store, &root.source_id, &c.source_id, "op").unwrap_err();
        assert_eq!(err.code(), "policy_violation");

        let other = registrar
            .register(&SourceInput::new("d.txt", "txt", "Something unrelated."))
            .await
            .unwrap()
            .source;
        let err = link_duplicate(&store, &other.source_id, &root.source_id, "op").unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test]
    async fn promote_primary_swaps_roles() {
        let (store, parser, config) = setup();
        let registrar = Registrar::new(&store, &parser, &config);
        let root = registrar.register(&SourceInput::new("a.txt", "txt", RITE)).await.unwrap().source;
        let alt = registrar
            .register(&SourceInput::new("b.txt", "txt", RITE.replace(' ', "  ")))
            .await
            .unwrap()
            .source;
        let group = root.witness_group_id.clone().unwrap();

        let members = promote_primary(&store, &group, &alt.source_id, "op").unwrap();
        let primary: Vec<_> = members.iter().filter(|m| m.role == MemberRole::Primary).collect();
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].source_id, alt.source_id);
        assert_eq!(
            store.read(|c| count_audit_events(c, group.as_str(), "promote_primary")).unwrap(),
            1
        );
    }
}
