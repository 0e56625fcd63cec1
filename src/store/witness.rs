//! Consolidated passages

use super::traits::{StorageError, StorageResult};
use crate::model::*;
use rusqlite::{params, Connection, OptionalExtension};

/// Insert a consolidated passage with its contributors unless the group already has
/// one with the same cluster key. Returns the stored id and whether it was created.
pub fn insert_consolidated_if_absent(
    conn: &Connection,
    consolidated: &ConsolidatedPassage,
) -> StorageResult<(ConsolidatedId, bool)> {
    let inserted = conn
        .execute(
            "INSERT INTO consolidated_passages (consolidated_id, group_id, cluster_key, merged_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(group_id, cluster_key) DO NOTHING",
            params![
                consolidated.consolidated_id,
                consolidated.group_id,
                consolidated.cluster_key,
                consolidated.merged_text,
                consolidated.created_at,
            ],
        )
        .map_err(StorageError::classify)?;

    if inserted == 0 {
        let existing: ConsolidatedId = conn.query_row(
            "SELECT consolidated_id FROM consolidated_passages WHERE group_id = ?1 AND cluster_key = ?2",
            params![consolidated.group_id, consolidated.cluster_key],
            |row| row.get(0),
        )?;
        return Ok((existing, false));
    }

    for contributor in &consolidated.contributors {
        conn.execute(
            "INSERT INTO consolidated_contributors (consolidated_id, passage_id, source_id, similarity)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                consolidated.consolidated_id,
                contributor.passage_id,
                contributor.source_id,
                contributor.similarity,
            ],
        )
        .map_err(StorageError::classify)?;
    }
    Ok((consolidated.consolidated_id.clone(), true))
}

/// Drop consolidated passages of a group whose cluster key is not in `keep`.
pub fn remove_stale_consolidations(conn: &Connection, group_id: &GroupId, keep: &[String]) -> StorageResult<usize> {
    let existing = consolidated_keys(conn, group_id)?;
    let mut removed = 0;
    for (id, key) in existing {
        if !keep.contains(&key) {
            removed += conn.execute(
                "DELETE FROM consolidated_passages WHERE consolidated_id = ?1",
                params![id],
            )?;
        }
    }
    Ok(removed)
}

fn consolidated_keys(conn: &Connection, group_id: &GroupId) -> StorageResult<Vec<(ConsolidatedId, String)>> {
    let mut stmt = conn.prepare(
        "SELECT consolidated_id, cluster_key FROM consolidated_passages WHERE group_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![group_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn consolidated_for_group(conn: &Connection, group_id: &GroupId) -> StorageResult<Vec<ConsolidatedPassage>> {
    let mut stmt = conn.prepare(
        "SELECT consolidated_id, group_id, cluster_key, merged_text, created_at
         FROM consolidated_passages WHERE group_id = ?1 ORDER BY created_at, rowid",
    )?;
    let mut rows = stmt
        .query_map(params![group_id], |row| {
            Ok(ConsolidatedPassage {
                consolidated_id: row.get(0)?,
                group_id: row.get(1)?,
                cluster_key: row.get(2)?,
                merged_text: row.get(3)?,
                created_at: row.get(4)?,
                contributors: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut contrib_stmt = conn.prepare(
        "SELECT passage_id, source_id, similarity FROM consolidated_contributors
         WHERE consolidated_id = ?1 ORDER BY passage_id",
    )?;
    for consolidated in &mut rows {
        consolidated.contributors = contrib_stmt
            .query_map(params![consolidated.consolidated_id], |row| {
                Ok(Contributor {
                    passage_id: row.get(0)?,
                    source_id: row.get(1)?,
                    similarity: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(rows)
}

pub fn find_consolidated(conn: &Connection, id: &ConsolidatedId) -> StorageResult<Option<GroupId>> {
    Ok(conn
        .query_row(
            "SELECT group_id FROM consolidated_passages WHERE consolidated_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?)
}
