//! Proposal traces, tags, links, flags, their evidence rows and pending vocabulary
//!
//! Every tag/link/flag insert writes its evidence rows in the same call and refuses
//! an empty evidence set; the foreign key on `proposal_evidence.passage_id` refuses
//! evidence that does not resolve. Run inserts inside `SqliteStore::transaction` so a
//! refused evidence set also rolls back the object row.

use super::sqlite::json_col;
use super::traits::{StorageError, StorageResult};
use crate::model::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

// === Traces ===

const TRACE_COLUMNS: &str = "trace_id, object_type, object_id, proposal_type, idempotency_key, \
     model_name, prompt_version, prompt_hash, response_hash, retry_count, failure_reason, created_at";

fn trace_from_row(row: &Row<'_>) -> rusqlite::Result<ProposalTrace> {
    Ok(ProposalTrace {
        trace_id: row.get(0)?,
        object_type: row.get(1)?,
        object_id: row.get(2)?,
        proposal_type: row.get(3)?,
        idempotency_key: row.get(4)?,
        model_name: row.get(5)?,
        prompt_version: row.get(6)?,
        prompt_hash: row.get(7)?,
        response_hash: row.get(8)?,
        retry_count: row.get(9)?,
        failure_reason: row.get(10)?,
        created_at: row.get(11)?,
    })
}

/// Insert a trace. A reused idempotency key is a `Conflict`.
pub fn insert_trace(conn: &Connection, trace: &ProposalTrace) -> StorageResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO proposal_traces ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            TRACE_COLUMNS
        ),
        params![
            trace.trace_id,
            trace.object_type,
            trace.object_id,
            trace.proposal_type,
            trace.idempotency_key,
            trace.model_name,
            trace.prompt_version,
            trace.prompt_hash,
            trace.response_hash,
            trace.retry_count,
            trace.failure_reason,
            trace.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn find_trace_by_key(conn: &Connection, key: &str) -> StorageResult<Option<ProposalTrace>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM proposal_traces WHERE idempotency_key = ?1", TRACE_COLUMNS),
            params![key],
            trace_from_row,
        )
        .optional()?)
}

pub fn get_trace(conn: &Connection, trace_id: &TraceId) -> StorageResult<ProposalTrace> {
    conn.query_row(
        &format!("SELECT {} FROM proposal_traces WHERE trace_id = ?1", TRACE_COLUMNS),
        params![trace_id],
        trace_from_row,
    )
    .optional()?
    .ok_or_else(|| StorageError::not_found("trace", trace_id.as_str()))
}

pub fn traces_for_object(conn: &Connection, object_id: &str) -> StorageResult<Vec<ProposalTrace>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM proposal_traces WHERE object_id = ?1 ORDER BY created_at, rowid",
        TRACE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![object_id], trace_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// True if a proposal of this type already succeeded for the object.
pub fn has_successful_trace(conn: &Connection, object_id: &str, proposal_type: &str) -> StorageResult<bool> {
    Ok(conn.query_row(
        "SELECT COUNT(*) > 0 FROM proposal_traces
         WHERE object_id = ?1 AND proposal_type = ?2 AND failure_reason IS NULL",
        params![object_id, proposal_type],
        |row| row.get(0),
    )?)
}

// === Evidence ===

fn insert_evidence(
    conn: &Connection,
    object_type: &str,
    object_id: &str,
    evidence_ids: &[PassageId],
) -> StorageResult<()> {
    if evidence_ids.is_empty() {
        return Err(StorageError::MissingEvidence(format!("{} {}", object_type, object_id)));
    }
    for (position, passage_id) in evidence_ids.iter().enumerate() {
        conn.execute(
            "INSERT INTO proposal_evidence (object_type, object_id, passage_id, position)
             VALUES (?1, ?2, ?3, ?4) ON CONFLICT DO NOTHING",
            params![object_type, object_id, passage_id, position as i64],
        )
        .map_err(StorageError::classify)?;
    }
    Ok(())
}

pub fn evidence_for(conn: &Connection, object_type: &str, object_id: &str) -> StorageResult<Vec<PassageId>> {
    let mut stmt = conn.prepare(
        "SELECT passage_id FROM proposal_evidence WHERE object_type = ?1 AND object_id = ?2 ORDER BY position",
    )?;
    let rows = stmt
        .query_map(params![object_type, object_id], |row| row.get(0))?
        .collect::<Result<Vec<PassageId>, _>>()?;
    Ok(rows)
}

// === Tags ===

const TAG_COLUMNS: &str =
    "tag_id, dimension, term, confidence, rationale, trace_id, reviewer_state, publish_state, created_at";

fn tag_from_row(row: &Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag {
        tag_id: row.get(0)?,
        dimension: row.get(1)?,
        term: row.get(2)?,
        confidence: row.get(3)?,
        rationale: row.get(4)?,
        trace_id: row.get(5)?,
        reviewer_state: row.get(6)?,
        publish_state: row.get(7)?,
        created_at: row.get(8)?,
        evidence_ids: Vec::new(),
    })
}

pub fn insert_tag(conn: &Connection, tag: &Tag) -> StorageResult<()> {
    conn.execute(
        &format!("INSERT INTO tags ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)", TAG_COLUMNS),
        params![
            tag.tag_id,
            tag.dimension,
            tag.term,
            tag.confidence,
            tag.rationale,
            tag.trace_id,
            tag.reviewer_state,
            tag.publish_state,
            tag.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    insert_evidence(conn, "tag", tag.tag_id.as_str(), &tag.evidence_ids)
}

pub fn find_tag(conn: &Connection, tag_id: &TagId) -> StorageResult<Option<Tag>> {
    let tag = conn
        .query_row(
            &format!("SELECT {} FROM tags WHERE tag_id = ?1", TAG_COLUMNS),
            params![tag_id],
            tag_from_row,
        )
        .optional()?;
    match tag {
        Some(mut tag) => {
            tag.evidence_ids = evidence_for(conn, "tag", tag.tag_id.as_str())?;
            Ok(Some(tag))
        }
        None => Ok(None),
    }
}

/// Tags whose evidence includes the passage.
pub fn tags_for_passage(conn: &Connection, passage_id: &PassageId) -> StorageResult<Vec<Tag>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tags WHERE tag_id IN (
             SELECT object_id FROM proposal_evidence WHERE object_type = 'tag' AND passage_id = ?1
         ) ORDER BY created_at, rowid",
        TAG_COLUMNS
    ))?;
    let mut tags = stmt
        .query_map(params![passage_id], tag_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for tag in &mut tags {
        tag.evidence_ids = evidence_for(conn, "tag", tag.tag_id.as_str())?;
    }
    Ok(tags)
}

// === Links ===

const LINK_COLUMNS: &str = "link_id, source_passage_id, target_passage_id, relation_type, \
     weighted_score, bucket, dimension_scores, rationale, trace_id, reviewer_state, publish_state, created_at";

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<Link> {
    Ok(Link {
        link_id: row.get(0)?,
        source_passage_id: row.get(1)?,
        target_passage_id: row.get(2)?,
        relation_type: row.get(3)?,
        weighted_score: row.get(4)?,
        bucket: row.get(5)?,
        dimension_scores: json_col(row, 6)?,
        rationale: row.get(7)?,
        trace_id: row.get(8)?,
        reviewer_state: row.get(9)?,
        publish_state: row.get(10)?,
        created_at: row.get(11)?,
        evidence_ids: Vec::new(),
    })
}

pub fn insert_link(conn: &Connection, link: &Link) -> StorageResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO links ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            LINK_COLUMNS
        ),
        params![
            link.link_id,
            link.source_passage_id,
            link.target_passage_id,
            link.relation_type,
            link.weighted_score,
            link.bucket,
            serde_json::to_string(&link.dimension_scores)?,
            link.rationale,
            link.trace_id,
            link.reviewer_state,
            link.publish_state,
            link.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    insert_evidence(conn, "link", link.link_id.as_str(), &link.evidence_ids)
}

pub fn find_link(conn: &Connection, link_id: &LinkId) -> StorageResult<Option<Link>> {
    let link = conn
        .query_row(
            &format!("SELECT {} FROM links WHERE link_id = ?1", LINK_COLUMNS),
            params![link_id],
            link_from_row,
        )
        .optional()?;
    match link {
        Some(mut link) => {
            link.evidence_ids = evidence_for(conn, "link", link.link_id.as_str())?;
            Ok(Some(link))
        }
        None => Ok(None),
    }
}

/// Existing link between two passages in either direction.
pub fn find_link_between(conn: &Connection, a: &PassageId, b: &PassageId) -> StorageResult<Option<LinkId>> {
    Ok(conn
        .query_row(
            "SELECT link_id FROM links
             WHERE (source_passage_id = ?1 AND target_passage_id = ?2)
                OR (source_passage_id = ?2 AND target_passage_id = ?1)
             LIMIT 1",
            params![a, b],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn count_links(conn: &Connection) -> StorageResult<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM links", [], |row| row.get(0))?;
    Ok(count as usize)
}

// === Flags ===

const FLAG_COLUMNS: &str =
    "flag_id, flag_type, severity, rationale, trace_id, reviewer_state, publish_state, created_at";

fn flag_from_row(row: &Row<'_>) -> rusqlite::Result<Flag> {
    Ok(Flag {
        flag_id: row.get(0)?,
        flag_type: row.get(1)?,
        severity: row.get(2)?,
        rationale: row.get(3)?,
        trace_id: row.get(4)?,
        reviewer_state: row.get(5)?,
        publish_state: row.get(6)?,
        created_at: row.get(7)?,
        evidence_ids: Vec::new(),
    })
}

pub fn insert_flag(conn: &Connection, flag: &Flag) -> StorageResult<()> {
    conn.execute(
        &format!("INSERT INTO flags ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)", FLAG_COLUMNS),
        params![
            flag.flag_id,
            flag.flag_type,
            flag.severity,
            flag.rationale,
            flag.trace_id,
            flag.reviewer_state,
            flag.publish_state,
            flag.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    insert_evidence(conn, "flag", flag.flag_id.as_str(), &flag.evidence_ids)
}

pub fn find_flag(conn: &Connection, flag_id: &FlagId) -> StorageResult<Option<Flag>> {
    let flag = conn
        .query_row(
            &format!("SELECT {} FROM flags WHERE flag_id = ?1", FLAG_COLUMNS),
            params![flag_id],
            flag_from_row,
        )
        .optional()?;
    match flag {
        Some(mut flag) => {
            flag.evidence_ids = evidence_for(conn, "flag", flag.flag_id.as_str())?;
            Ok(Some(flag))
        }
        None => Ok(None),
    }
}

/// Flags of one type whose evidence includes the passage.
pub fn flags_for_passage(conn: &Connection, passage_id: &PassageId, flag_type: &str) -> StorageResult<Vec<Flag>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM flags WHERE flag_type = ?2 AND flag_id IN (
             SELECT object_id FROM proposal_evidence WHERE object_type = 'flag' AND passage_id = ?1
         ) ORDER BY created_at, rowid",
        FLAG_COLUMNS
    ))?;
    let mut flags = stmt
        .query_map(params![passage_id, flag_type], flag_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    for flag in &mut flags {
        flag.evidence_ids = evidence_for(conn, "flag", flag.flag_id.as_str())?;
    }
    Ok(flags)
}

// === Review transitions shared by tags, links and flags ===

fn proposal_table(object_type: ReviewableType) -> Option<(&'static str, &'static str)> {
    match object_type {
        ReviewableType::Tag => Some(("tags", "tag_id")),
        ReviewableType::Link => Some(("links", "link_id")),
        ReviewableType::Flag => Some(("flags", "flag_id")),
        ReviewableType::Passage => None,
    }
}

/// Current reviewer state of a tag, link or flag.
pub fn proposal_review_state(
    conn: &Connection,
    object_type: ReviewableType,
    object_id: &str,
) -> StorageResult<Option<ReviewerState>> {
    let (table, key) = proposal_table(object_type)
        .ok_or_else(|| StorageError::Conflict(format!("{} is not a proposal type", object_type)))?;
    Ok(conn
        .query_row(
            &format!("SELECT reviewer_state FROM {} WHERE {} = ?1", table, key),
            params![object_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Conditional review transition for a tag, link or flag.
pub fn transition_proposal_review(
    conn: &Connection,
    object_type: ReviewableType,
    object_id: &str,
    from: ReviewerState,
    to: ReviewerState,
    publish_state: PublishState,
) -> StorageResult<usize> {
    let (table, key) = proposal_table(object_type)
        .ok_or_else(|| StorageError::Conflict(format!("{} is not a proposal type", object_type)))?;
    Ok(conn
        .execute(
            &format!(
                "UPDATE {} SET reviewer_state = ?3, publish_state = ?4 WHERE {} = ?1 AND reviewer_state = ?2",
                table, key
            ),
            params![object_id, from, to, publish_state],
        )
        .map_err(StorageError::classify)?)
}

pub fn set_proposal_publish_state(
    conn: &Connection,
    object_type: ReviewableType,
    object_id: &str,
    publish_state: PublishState,
) -> StorageResult<usize> {
    let (table, key) = proposal_table(object_type)
        .ok_or_else(|| StorageError::Conflict(format!("{} is not a proposal type", object_type)))?;
    Ok(conn
        .execute(
            &format!("UPDATE {} SET publish_state = ?2 WHERE {} = ?1", table, key),
            params![object_id, publish_state],
        )
        .map_err(StorageError::classify)?)
}

/// Ids of proposal objects in the given state, oldest first.
pub fn proposals_in_review_state(
    conn: &Connection,
    object_type: ReviewableType,
    state: ReviewerState,
    limit: usize,
    offset: usize,
) -> StorageResult<Vec<String>> {
    let (table, key) = proposal_table(object_type)
        .ok_or_else(|| StorageError::Conflict(format!("{} is not a proposal type", object_type)))?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} WHERE reviewer_state = ?1 ORDER BY created_at, rowid LIMIT ?2 OFFSET ?3",
        key, table
    ))?;
    let rows = stmt
        .query_map(params![state, limit as i64, offset as i64], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(rows)
}

// === Pending vocabulary ===

pub fn insert_pending_term(conn: &Connection, term: &PendingTerm) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO vocabulary_pending_terms (term_id, dimension, term, rationale, trace_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            term.term_id,
            term.dimension,
            term.term,
            term.rationale,
            term.trace_id,
            term.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    insert_evidence(conn, "pending_term", term.term_id.as_str(), &term.evidence_ids)
}

pub fn pending_terms(conn: &Connection) -> StorageResult<Vec<PendingTerm>> {
    let mut stmt = conn.prepare(
        "SELECT term_id, dimension, term, rationale, trace_id, created_at
         FROM vocabulary_pending_terms ORDER BY created_at, rowid",
    )?;
    let mut terms = stmt
        .query_map([], |row| {
            Ok(PendingTerm {
                term_id: row.get(0)?,
                dimension: row.get(1)?,
                term: row.get(2)?,
                rationale: row.get(3)?,
                trace_id: row.get(4)?,
                created_at: row.get(5)?,
                evidence_ids: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for term in &mut terms {
        term.evidence_ids = evidence_for(conn, "pending_term", term.term_id.as_str())?;
    }
    Ok(terms)
}

/// Build a trace row for pipeline-internal proposals (no external capability call).
pub fn internal_trace(
    object_type: &str,
    object_id: &str,
    proposal_type: &str,
    idempotency_key: String,
    model_name: &str,
    now: DateTime<Utc>,
) -> ProposalTrace {
    ProposalTrace {
        trace_id: TraceId::new(),
        object_type: object_type.to_string(),
        object_id: object_id.to_string(),
        proposal_type: proposal_type.to_string(),
        idempotency_key,
        model_name: model_name.to_string(),
        prompt_version: "internal".to_string(),
        prompt_hash: String::new(),
        response_hash: String::new(),
        retry_count: 0,
        failure_reason: None,
        created_at: now,
    }
}
