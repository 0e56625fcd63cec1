//! Review & Audit State Machine
//!
//! `proposed -> {approved, rejected, needs_revision}`, with `needs_revision`
//! returning to `proposed` on resubmission. Every decision writes one
//! [`ReviewDecision`] and exactly one audit event in the same transaction as the
//! state change. Policy checks run before anything is written.
//!
//! Publishing recomputes eligibility from scratch: the object must be approved and
//! every dependency (evidence passages, witness quality) must still be valid.

use crate::error::{CurationError, CurationResult, ErrorReport};
use crate::model::*;
use crate::proposal::approval_blocker;
use crate::store::{insert_audit, passages, proposals, review, sources, SqliteStore};
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

/// A reviewable object loaded with its current state.
#[derive(Debug, Clone, PartialEq)]
pub enum Reviewable {
    Passage(Passage),
    Tag(Tag),
    Link(Link),
    Flag(Flag),
}

impl Reviewable {
    pub fn load(conn: &Connection, object_type: ReviewableType, object_id: &str) -> CurationResult<Self> {
        let found = match object_type {
            ReviewableType::Passage => {
                passages::find_passage(conn, &PassageId::from_string(object_id))?.map(Self::Passage)
            }
            ReviewableType::Tag => proposals::find_tag(conn, &TagId::from_string(object_id))?.map(Self::Tag),
            ReviewableType::Link => proposals::find_link(conn, &LinkId::from_string(object_id))?.map(Self::Link),
            ReviewableType::Flag => proposals::find_flag(conn, &FlagId::from_string(object_id))?.map(Self::Flag),
        };
        found.ok_or_else(|| CurationError::not_found(object_type.as_str(), object_id))
    }

    pub fn object_type(&self) -> ReviewableType {
        match self {
            Self::Passage(_) => ReviewableType::Passage,
            Self::Tag(_) => ReviewableType::Tag,
            Self::Link(_) => ReviewableType::Link,
            Self::Flag(_) => ReviewableType::Flag,
        }
    }

    pub fn object_id(&self) -> &str {
        match self {
            Self::Passage(p) => p.passage_id.as_str(),
            Self::Tag(t) => t.tag_id.as_str(),
            Self::Link(l) => l.link_id.as_str(),
            Self::Flag(f) => f.flag_id.as_str(),
        }
    }

    pub fn reviewer_state(&self) -> ReviewerState {
        match self {
            Self::Passage(p) => p.reviewer_state,
            Self::Tag(t) => t.reviewer_state,
            Self::Link(l) => l.reviewer_state,
            Self::Flag(f) => f.reviewer_state,
        }
    }

    pub fn publish_state(&self) -> PublishState {
        match self {
            Self::Passage(p) => p.publish_state,
            Self::Tag(t) => t.publish_state,
            Self::Link(l) => l.publish_state,
            Self::Flag(f) => f.publish_state,
        }
    }

    pub fn to_json(&self) -> CurationResult<serde_json::Value> {
        let value = match self {
            Self::Passage(p) => serde_json::to_value(p),
            Self::Tag(t) => serde_json::to_value(t),
            Self::Link(l) => serde_json::to_value(l),
            Self::Flag(f) => serde_json::to_value(f),
        };
        Ok(value.map_err(crate::store::StorageError::from)?)
    }

    /// Publish state an approval lands in. Passages that were filtered, could
    /// not be translated or come from a duplicate source stay blocked even when
    /// approved.
    fn approved_publish_state(&self, conn: &Connection) -> CurationResult<PublishState> {
        Ok(match self {
            Self::Passage(p) if passage_problem(conn, p)?.is_some() => PublishState::Blocked,
            _ => PublishState::Eligible,
        })
    }

    fn transition(
        &self,
        conn: &Connection,
        to: ReviewerState,
        publish_state: PublishState,
    ) -> CurationResult<()> {
        let from = self.reviewer_state();
        let changed = match self {
            Self::Passage(p) => {
                passages::transition_passage_review(conn, &p.passage_id, from, to, publish_state, Utc::now())?
            }
            other => proposals::transition_proposal_review(
                conn,
                other.object_type(),
                other.object_id(),
                from,
                to,
                publish_state,
            )?,
        };
        if changed == 0 {
            return Err(crate::store::StorageError::Conflict(format!(
                "{} {} changed state concurrently",
                self.object_type(),
                self.object_id()
            ))
            .into());
        }
        Ok(())
    }
}

fn passage_problem(conn: &Connection, passage: &Passage) -> CurationResult<Option<String>> {
    if passage.relevance_state == RelevanceState::Filtered {
        return Ok(Some(format!("passage {} was filtered as off-topic", passage.passage_id)));
    }
    if passage.translation_status == TranslationStatus::Unresolved {
        return Ok(Some(format!("passage {} has an unresolved translation", passage.passage_id)));
    }
    let source = sources::get_source(conn, &passage.source_id)?;
    if let Some(canonical) = source.is_duplicate_of {
        return Ok(Some(format!(
            "passage {} comes from source {}, a duplicate of {}",
            passage.passage_id, source.source_id, canonical
        )));
    }
    Ok(None)
}

/// Apply one review decision.
pub fn decide(
    store: &SqliteStore,
    object_type: ReviewableType,
    object_id: &str,
    decision: ReviewDecisionKind,
    reviewer_id: &str,
    notes: Option<&str>,
) -> CurationResult<ReviewDecision> {
    check_decision_policy(decision, reviewer_id, notes)?;
    let recorded = store.transaction(|tx| decide_in(tx, object_type, object_id, decision, reviewer_id, notes))?;
    info!(
        object_type = %object_type,
        object_id,
        decision = %decision,
        reviewer = reviewer_id,
        "review decision recorded"
    );
    Ok(recorded)
}

fn check_decision_policy(decision: ReviewDecisionKind, reviewer_id: &str, notes: Option<&str>) -> CurationResult<()> {
    if reviewer_id.trim().is_empty() {
        return Err(CurationError::validation("reviewer_id", "must not be empty"));
    }
    if decision.requires_notes() && notes.map_or(true, |n| n.trim().is_empty()) {
        return Err(CurationError::policy(format!("notes are required for {}", decision)));
    }
    Ok(())
}

fn decide_in(
    conn: &Connection,
    object_type: ReviewableType,
    object_id: &str,
    decision: ReviewDecisionKind,
    reviewer_id: &str,
    notes: Option<&str>,
) -> CurationResult<ReviewDecision> {
    let object = Reviewable::load(conn, object_type, object_id)?;
    if object.publish_state() == PublishState::Published {
        return Err(CurationError::policy(format!("{} {} is already published", object_type, object_id)));
    }
    if decision == ReviewDecisionKind::Approve {
        if let Reviewable::Link(link) = &object {
            if let Some(blocker) = approval_blocker(link, notes) {
                return Err(CurationError::policy(blocker));
            }
        }
    }

    let target = decision.target_state();
    let publish_state = match target {
        ReviewerState::Approved => object.approved_publish_state(conn)?,
        _ => PublishState::Blocked,
    };
    object.transition(conn, target, publish_state)?;

    let notes = notes.map(str::trim).filter(|n| !n.is_empty());
    let recorded = ReviewDecision {
        review_id: ReviewId::new(),
        object_type,
        object_id: object_id.to_string(),
        decision,
        reviewer_id: reviewer_id.to_string(),
        notes: notes.map(str::to_string),
        created_at: Utc::now(),
    };
    review::insert_decision(conn, &recorded)?;
    insert_audit(
        conn,
        &AuditEvent::new(reviewer_id, "review_decision", object_type.as_str(), object_id)
            .with_transition(Some(object.reviewer_state().as_str()), Some(target.as_str()))
            .with_correlation(recorded.review_id.as_str())
            .with_details(serde_json::json!({
                "decision": decision,
                "notes": notes,
                "publish_state": publish_state,
            })),
    )?;
    Ok(recorded)
}

/// Per-id outcome of a bulk decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkItem {
    pub object_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_id: Option<ReviewId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkReport {
    pub succeeded: usize,
    pub failed: usize,
    pub items: Vec<BulkItem>,
}

/// Apply the same decision to many objects. Each id commits on its own, so one
/// failure never rolls back the others. The notes rule is checked once for the
/// whole call since it applies uniformly.
pub fn bulk_decide(
    store: &SqliteStore,
    object_type: ReviewableType,
    object_ids: &[String],
    decision: ReviewDecisionKind,
    reviewer_id: &str,
    notes: Option<&str>,
) -> CurationResult<BulkReport> {
    check_decision_policy(decision, reviewer_id, notes)?;

    let mut report = BulkReport::default();
    for object_id in object_ids {
        let item = match store.transaction(|tx| decide_in(tx, object_type, object_id, decision, reviewer_id, notes)) {
            Ok(recorded) => {
                report.succeeded += 1;
                BulkItem {
                    object_id: object_id.clone(),
                    review_id: Some(recorded.review_id),
                    error: None,
                }
            }
            Err(err) => {
                debug!(object_id = %object_id, error = %err, "bulk decision item failed");
                report.failed += 1;
                BulkItem {
                    object_id: object_id.clone(),
                    review_id: None,
                    error: Some(err.report()),
                }
            }
        };
        report.items.push(item);
    }
    info!(
        object_type = %object_type,
        decision = %decision,
        succeeded = report.succeeded,
        failed = report.failed,
        "bulk review decision"
    );
    Ok(report)
}

/// `needs_revision -> proposed` after the object was corrected.
pub fn resubmit(
    store: &SqliteStore,
    object_type: ReviewableType,
    object_id: &str,
    actor: &str,
    notes: Option<&str>,
) -> CurationResult<()> {
    store.transaction(|tx| -> CurationResult<()> {
        let object = Reviewable::load(tx, object_type, object_id)?;
        if object.reviewer_state() != ReviewerState::NeedsRevision {
            return Err(CurationError::policy(format!(
                "{} {} is {}, only needs_revision objects can be resubmitted",
                object_type,
                object_id,
                object.reviewer_state()
            )));
        }
        object.transition(tx, ReviewerState::Proposed, PublishState::Blocked)?;
        insert_audit(
            tx,
            &AuditEvent::new(actor, "resubmit", object_type.as_str(), object_id)
                .with_transition(Some(ReviewerState::NeedsRevision.as_str()), Some(ReviewerState::Proposed.as_str()))
                .with_details(serde_json::json!({ "notes": notes })),
        )?;
        Ok(())
    })?;
    info!(object_type = %object_type, object_id, "resubmitted for review");
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published(PublishPackage),
    AlreadyPublished(PublishPackage),
    Skipped { reason: String },
}

/// Why an object cannot be published right now.
fn publish_blocker(conn: &Connection, object: &Reviewable) -> CurationResult<Option<String>> {
    if object.reviewer_state() != ReviewerState::Approved {
        return Ok(Some(format!(
            "{} {} is {}, not approved",
            object.object_type(),
            object.object_id(),
            object.reviewer_state()
        )));
    }
    let evidence = match object {
        Reviewable::Passage(p) => return passage_problem(conn, p),
        Reviewable::Tag(t) => &t.evidence_ids,
        Reviewable::Link(l) => &l.evidence_ids,
        Reviewable::Flag(f) => &f.evidence_ids,
    };
    if evidence.is_empty() {
        return Ok(Some(format!("{} {} has no evidence", object.object_type(), object.object_id())));
    }
    for passage_id in evidence {
        let Some(passage) = passages::find_passage(conn, passage_id)? else {
            return Ok(Some(format!("evidence passage {} is missing", passage_id)));
        };
        if passage.reviewer_state != ReviewerState::Approved {
            return Ok(Some(format!("evidence passage {} is not approved", passage_id)));
        }
        if let Some(problem) = passage_problem(conn, &passage)? {
            return Ok(Some(problem));
        }
    }
    Ok(None)
}

/// Snapshot of an object plus the evidence it stands on.
fn build_snapshot(conn: &Connection, object: &Reviewable) -> CurationResult<serde_json::Value> {
    let mut snapshot = serde_json::json!({
        "object_type": object.object_type(),
        "object": object.to_json()?,
    });
    match object {
        Reviewable::Passage(p) => {
            let source = sources::get_source(conn, &p.source_id)?;
            let text = sources::get_text(conn, &p.text_id)?;
            snapshot["source"] = serde_json::json!({
                "source_id": source.source_id,
                "locator": source.locator,
                "source_sha256": source.source_sha256,
            });
            snapshot["text"] = serde_json::json!({
                "text_id": text.text_id,
                "title": text.title,
                "origin_region": text.origin_region,
                "tradition_tags": text.tradition_tags,
            });
        }
        Reviewable::Tag(Tag { evidence_ids, .. })
        | Reviewable::Link(Link { evidence_ids, .. })
        | Reviewable::Flag(Flag { evidence_ids, .. }) => {
            let mut evidence = Vec::with_capacity(evidence_ids.len());
            for passage_id in evidence_ids {
                let passage = passages::get_passage(conn, passage_id)?;
                evidence.push(serde_json::json!({
                    "passage_id": passage.passage_id,
                    "locator": passage.locator,
                    "normalized_excerpt": passage.normalized_excerpt,
                }));
            }
            snapshot["evidence"] = serde_json::Value::Array(evidence);
        }
    }
    Ok(snapshot)
}

/// Publish an approved, dependency-complete object as an immutable package.
pub fn publish(
    store: &SqliteStore,
    object_type: ReviewableType,
    object_id: &str,
    actor: &str,
) -> CurationResult<PublishOutcome> {
    let outcome = store.transaction(|tx| -> CurationResult<PublishOutcome> {
        if let Some(existing) = review::find_package(tx, object_type, object_id)? {
            return Ok(PublishOutcome::AlreadyPublished(existing));
        }
        let object = Reviewable::load(tx, object_type, object_id)?;
        if let Some(reason) = publish_blocker(tx, &object)? {
            return Ok(PublishOutcome::Skipped { reason });
        }

        let snapshot = build_snapshot(tx, &object)?;
        let canonical = serde_json::to_string(&snapshot).map_err(crate::store::StorageError::from)?;
        let package = PublishPackage {
            package_id: PackageId::new(),
            object_type,
            object_id: object_id.to_string(),
            content_hash: sha256_hex(canonical.as_bytes()),
            snapshot,
            created_at: Utc::now(),
        };
        review::insert_package(tx, &package)?;
        match &object {
            Reviewable::Passage(p) => {
                passages::set_passage_publish_state(tx, &p.passage_id, PublishState::Published, Utc::now())?;
            }
            other => {
                proposals::set_proposal_publish_state(tx, object_type, other.object_id(), PublishState::Published)?;
            }
        }
        insert_audit(
            tx,
            &AuditEvent::new(actor, "publish", object_type.as_str(), object_id)
                .with_transition(Some(object.publish_state().as_str()), Some(PublishState::Published.as_str()))
                .with_correlation(package.package_id.as_str())
                .with_details(serde_json::json!({ "content_hash": package.content_hash })),
        )?;
        Ok(PublishOutcome::Published(package))
    })?;

    match &outcome {
        PublishOutcome::Published(package) => {
            info!(object_type = %object_type, object_id, package_id = %package.package_id, "published")
        }
        PublishOutcome::AlreadyPublished(_) => debug!(object_type = %object_type, object_id, "already published"),
        PublishOutcome::Skipped { reason } => info!(object_type = %object_type, object_id, reason = %reason, "publish skipped"),
    }
    Ok(outcome)
}

/// One page of objects awaiting review, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewQueue {
    pub object_type: ReviewableType,
    pub items: Vec<serde_json::Value>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

pub fn review_queue(
    store: &SqliteStore,
    object_type: ReviewableType,
    page: usize,
    page_size: usize,
) -> CurationResult<ReviewQueue> {
    let page = page.max(1);
    let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1) * page_size;

    store.read(|conn| -> CurationResult<ReviewQueue> {
        let total = review::count_in_review_state(conn, object_type, ReviewerState::Proposed)?;
        let items = match object_type {
            ReviewableType::Passage => passages::passages_in_review_state(conn, ReviewerState::Proposed, page_size, offset)?
                .into_iter()
                .map(|p| Reviewable::Passage(p).to_json())
                .collect::<CurationResult<Vec<_>>>()?,
            _ => proposals::proposals_in_review_state(conn, object_type, ReviewerState::Proposed, page_size, offset)?
                .iter()
                .map(|id| Reviewable::load(conn, object_type, id)?.to_json())
                .collect::<CurationResult<Vec<_>>>()?,
        };
        Ok(ReviewQueue {
            object_type,
            items,
            total,
            page,
            page_size,
        })
    })
}
