//! Tuning profiles
//!
//! The partial unique index on `is_default` keeps at most one default row;
//! [`set_default`] clears the old default before marking the new one.

use super::sqlite::json_col;
use super::traits::{StorageError, StorageResult};
use crate::model::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const PROFILE_COLUMNS: &str = "profile_id, name, is_default, version, thresholds, lexicons, segmentation, \
     created_by, updated_by, created_at, updated_at";

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<TuningProfile> {
    Ok(TuningProfile {
        profile_id: row.get(0)?,
        name: row.get(1)?,
        is_default: row.get(2)?,
        version: row.get(3)?,
        thresholds: json_col(row, 4)?,
        lexicons: json_col(row, 5)?,
        segmentation: json_col(row, 6)?,
        created_by: row.get(7)?,
        updated_by: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

pub fn insert_profile(conn: &Connection, profile: &TuningProfile) -> StorageResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO tuning_profiles ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            PROFILE_COLUMNS
        ),
        params![
            profile.profile_id,
            profile.name,
            profile.is_default,
            profile.version,
            serde_json::to_string(&profile.thresholds)?,
            serde_json::to_string(&profile.lexicons)?,
            serde_json::to_string(&profile.segmentation)?,
            profile.created_by,
            profile.updated_by,
            profile.created_at,
            profile.updated_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn find_profile(conn: &Connection, profile_id: &ProfileId) -> StorageResult<Option<TuningProfile>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM tuning_profiles WHERE profile_id = ?1", PROFILE_COLUMNS),
            params![profile_id],
            profile_from_row,
        )
        .optional()?)
}

pub fn get_profile(conn: &Connection, profile_id: &ProfileId) -> StorageResult<TuningProfile> {
    find_profile(conn, profile_id)?.ok_or_else(|| StorageError::not_found("tuning_profile", profile_id.as_str()))
}

pub fn find_default(conn: &Connection) -> StorageResult<Option<TuningProfile>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM tuning_profiles WHERE is_default = 1", PROFILE_COLUMNS),
            [],
            profile_from_row,
        )
        .optional()?)
}

/// Profiles oldest first.
pub fn list_profiles(conn: &Connection) -> StorageResult<Vec<TuningProfile>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM tuning_profiles ORDER BY created_at, rowid",
        PROFILE_COLUMNS
    ))?;
    let rows = stmt.query_map([], profile_from_row)?.collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Replace a profile's content and bump its version.
pub fn update_content(conn: &Connection, profile: &TuningProfile) -> StorageResult<()> {
    let changed = conn
        .execute(
            "UPDATE tuning_profiles
             SET name = ?2, version = ?3, thresholds = ?4, lexicons = ?5, segmentation = ?6,
                 updated_by = ?7, updated_at = ?8
             WHERE profile_id = ?1 AND version = ?3 - 1",
            params![
                profile.profile_id,
                profile.name,
                profile.version,
                serde_json::to_string(&profile.thresholds)?,
                serde_json::to_string(&profile.lexicons)?,
                serde_json::to_string(&profile.segmentation)?,
                profile.updated_by,
                profile.updated_at,
            ],
        )
        .map_err(StorageError::classify)?;
    if changed == 0 {
        return Err(StorageError::Conflict(format!(
            "tuning profile {} changed since version {}",
            profile.profile_id,
            profile.version.saturating_sub(1)
        )));
    }
    Ok(())
}

/// Unmark the current default, if any.
pub fn clear_default(conn: &Connection) -> StorageResult<()> {
    conn.execute("UPDATE tuning_profiles SET is_default = 0 WHERE is_default = 1", [])?;
    Ok(())
}

/// Make `profile_id` the only default profile.
pub fn set_default(
    conn: &Connection,
    profile_id: &ProfileId,
    actor: &str,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    conn.execute(
        "UPDATE tuning_profiles SET is_default = 0 WHERE is_default = 1 AND profile_id <> ?1",
        params![profile_id],
    )?;
    let changed = conn
        .execute(
            "UPDATE tuning_profiles SET is_default = 1, updated_by = ?2, updated_at = ?3 WHERE profile_id = ?1",
            params![profile_id, actor, now],
        )
        .map_err(StorageError::classify)?;
    if changed == 0 {
        return Err(StorageError::not_found("tuning_profile", profile_id.as_str()));
    }
    Ok(())
}

pub fn count_defaults(conn: &Connection) -> StorageResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tuning_profiles WHERE is_default = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}
