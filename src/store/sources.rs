//! Texts, sources and witness groups

use super::sqlite::json_col;
use super::traits::{StorageError, StorageResult};
use crate::model::*;
use rusqlite::{params, Connection, OptionalExtension, Row};

const SOURCE_COLUMNS: &str = "source_id, text_id, locator, format_hint, source_sha256, \
     normalized_sha256, witness_group_id, is_duplicate_of, created_at";

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        source_id: row.get(0)?,
        text_id: row.get(1)?,
        locator: row.get(2)?,
        format_hint: row.get(3)?,
        source_sha256: row.get(4)?,
        normalized_sha256: row.get(5)?,
        witness_group_id: row.get(6)?,
        is_duplicate_of: row.get(7)?,
        created_at: row.get(8)?,
    })
}

pub fn insert_text(conn: &Connection, text: &Text) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO texts (text_id, title, origin_region, tradition_tags, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            text.text_id,
            text.title,
            text.origin_region,
            serde_json::to_string(&text.tradition_tags)?,
            text.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn get_text(conn: &Connection, text_id: &TextId) -> StorageResult<Text> {
    conn.query_row(
        "SELECT text_id, title, origin_region, tradition_tags, created_at FROM texts WHERE text_id = ?1",
        params![text_id],
        |row| {
            Ok(Text {
                text_id: row.get(0)?,
                title: row.get(1)?,
                origin_region: row.get(2)?,
                tradition_tags: json_col(row, 3)?,
                created_at: row.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StorageError::not_found("text", text_id.as_str()))
}

pub fn insert_source(conn: &Connection, source: &Source) -> StorageResult<()> {
    conn.execute(
        &format!("INSERT INTO sources ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)", SOURCE_COLUMNS),
        params![
            source.source_id,
            source.text_id,
            source.locator,
            source.format_hint,
            source.source_sha256,
            source.normalized_sha256,
            source.witness_group_id,
            source.is_duplicate_of,
            source.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn get_source(conn: &Connection, source_id: &SourceId) -> StorageResult<Source> {
    find_source(conn, source_id)?.ok_or_else(|| StorageError::not_found("source", source_id.as_str()))
}

pub fn find_source(conn: &Connection, source_id: &SourceId) -> StorageResult<Option<Source>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM sources WHERE source_id = ?1", SOURCE_COLUMNS),
            params![source_id],
            source_from_row,
        )
        .optional()?)
}

pub fn find_by_source_hash(conn: &Connection, sha256: &str) -> StorageResult<Option<Source>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM sources WHERE source_sha256 = ?1", SOURCE_COLUMNS),
            params![sha256],
            source_from_row,
        )
        .optional()?)
}

/// Oldest source with the given normalized-text fingerprint.
pub fn find_by_normalized_hash(conn: &Connection, sha256: &str) -> StorageResult<Option<Source>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM sources WHERE normalized_sha256 = ?1 ORDER BY created_at, rowid LIMIT 1",
                SOURCE_COLUMNS
            ),
            params![sha256],
            source_from_row,
        )
        .optional()?)
}

pub fn sources_for_text(conn: &Connection, text_id: &TextId) -> StorageResult<Vec<Source>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sources WHERE text_id = ?1 ORDER BY created_at, rowid",
        SOURCE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![text_id], source_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count_sources_pointing_at(conn: &Connection, source_id: &SourceId) -> StorageResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sources WHERE is_duplicate_of = ?1",
        params![source_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

pub fn set_duplicate_of(conn: &Connection, source_id: &SourceId, canonical: &SourceId) -> StorageResult<()> {
    conn.execute(
        "UPDATE sources SET is_duplicate_of = ?2 WHERE source_id = ?1",
        params![source_id, canonical],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn set_source_group(conn: &Connection, source_id: &SourceId, group_id: &GroupId) -> StorageResult<()> {
    conn.execute(
        "UPDATE sources SET witness_group_id = ?2 WHERE source_id = ?1",
        params![source_id, group_id],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn insert_group(conn: &Connection, group: &WitnessGroup) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO witness_groups (group_id, text_id, status, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![group.group_id, group.text_id, group.status, group.created_at],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn get_group(conn: &Connection, group_id: &GroupId) -> StorageResult<WitnessGroup> {
    conn.query_row(
        "SELECT group_id, text_id, status, created_at FROM witness_groups WHERE group_id = ?1",
        params![group_id],
        |row| {
            Ok(WitnessGroup {
                group_id: row.get(0)?,
                text_id: row.get(1)?,
                status: row.get(2)?,
                created_at: row.get(3)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StorageError::not_found("witness_group", group_id.as_str()))
}

pub fn insert_member(conn: &Connection, member: &WitnessMember) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO witness_members (group_id, source_id, role, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            member.group_id,
            member.source_id,
            member.role,
            member.reason,
            member.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn group_members(conn: &Connection, group_id: &GroupId) -> StorageResult<Vec<WitnessMember>> {
    let mut stmt = conn.prepare(
        "SELECT group_id, source_id, role, reason, created_at FROM witness_members
         WHERE group_id = ?1 ORDER BY created_at, rowid",
    )?;
    let rows = stmt
        .query_map(params![group_id], |row| {
            Ok(WitnessMember {
                group_id: row.get(0)?,
                source_id: row.get(1)?,
                role: row.get(2)?,
                reason: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn set_member_role(
    conn: &Connection,
    group_id: &GroupId,
    source_id: &SourceId,
    role: MemberRole,
) -> StorageResult<usize> {
    let changed = conn
        .execute(
            "UPDATE witness_members SET role = ?3 WHERE group_id = ?1 AND source_id = ?2",
            params![group_id, source_id, role],
        )
        .map_err(StorageError::classify)?;
    Ok(changed)
}
