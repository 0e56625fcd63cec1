//! Review decisions and publish packages

use super::sqlite::json_col;
use super::traits::{StorageError, StorageResult};
use crate::model::*;
use rusqlite::{params, Connection, OptionalExtension};

pub fn insert_decision(conn: &Connection, decision: &ReviewDecision) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO review_decisions (review_id, object_type, object_id, decision, reviewer_id, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            decision.review_id,
            decision.object_type,
            decision.object_id,
            decision.decision,
            decision.reviewer_id,
            decision.notes,
            decision.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn decisions_for(conn: &Connection, object_id: &str) -> StorageResult<Vec<ReviewDecision>> {
    let mut stmt = conn.prepare(
        "SELECT review_id, object_type, object_id, decision, reviewer_id, notes, created_at
         FROM review_decisions WHERE object_id = ?1 ORDER BY created_at, rowid",
    )?;
    let rows = stmt
        .query_map(params![object_id], |row| {
            Ok(ReviewDecision {
                review_id: row.get(0)?,
                object_type: row.get(1)?,
                object_id: row.get(2)?,
                decision: row.get(3)?,
                reviewer_id: row.get(4)?,
                notes: row.get(5)?,
                created_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Latest non-empty reviewer note on an object.
pub fn latest_note(conn: &Connection, object_id: &str) -> StorageResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT notes FROM review_decisions
             WHERE object_id = ?1 AND length(trim(coalesce(notes, ''))) > 0
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
            params![object_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Number of objects of a reviewable type in the given reviewer state.
pub fn count_in_review_state(
    conn: &Connection,
    object_type: ReviewableType,
    state: ReviewerState,
) -> StorageResult<usize> {
    let table = match object_type {
        ReviewableType::Passage => "passages",
        ReviewableType::Tag => "tags",
        ReviewableType::Link => "links",
        ReviewableType::Flag => "flags",
    };
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE reviewer_state = ?1", table),
        params![state],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

pub fn insert_package(conn: &Connection, package: &PublishPackage) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO publish_packages (package_id, object_type, object_id, content_hash, snapshot, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            package.package_id,
            package.object_type,
            package.object_id,
            package.content_hash,
            serde_json::to_string(&package.snapshot)?,
            package.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn find_package(
    conn: &Connection,
    object_type: ReviewableType,
    object_id: &str,
) -> StorageResult<Option<PublishPackage>> {
    Ok(conn
        .query_row(
            "SELECT package_id, object_type, object_id, content_hash, snapshot, created_at
             FROM publish_packages WHERE object_type = ?1 AND object_id = ?2",
            params![object_type, object_id],
            |row| {
                Ok(PublishPackage {
                    package_id: row.get(0)?,
                    object_type: row.get(1)?,
                    object_id: row.get(2)?,
                    content_hash: row.get(3)?,
                    snapshot: json_col(row, 4)?,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()?)
}
