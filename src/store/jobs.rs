//! Ingestion jobs, job attempts, reprocess jobs and translation revisions
//!
//! Claims are single conditional `UPDATE ... RETURNING` statements: a job only moves
//! to `running` if it is still `pending` at write time, so two competing claimants
//! can never both win the same row. The claim time doubles as a claim token:
//! completing or failing a running job requires the `claimed_at` the claimant was
//! handed, so a worker whose claim was swept cannot finish someone else's re-claim.

use super::sqlite::sql_timestamp;
use super::traits::{StorageError, StorageResult};
use crate::model::*;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const JOB_COLUMNS: &str = "job_id, source_id, idempotency_key, status, attempt_count, \
     max_attempts, error_code, error_context, parser_name, claimed_at, created_at, updated_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<IngestionJob> {
    Ok(IngestionJob {
        job_id: row.get(0)?,
        source_id: row.get(1)?,
        idempotency_key: row.get(2)?,
        status: row.get(3)?,
        attempt_count: row.get(4)?,
        max_attempts: row.get(5)?,
        error_code: row.get(6)?,
        error_context: row.get(7)?,
        parser_name: row.get(8)?,
        claimed_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Insert a job unless its idempotency key already exists; returns the stored job
/// and whether it was newly created.
pub fn insert_job_if_absent(conn: &Connection, job: &IngestionJob) -> StorageResult<(IngestionJob, bool)> {
    let inserted = conn
        .execute(
            &format!(
                "INSERT INTO ingestion_jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(idempotency_key) DO NOTHING",
                JOB_COLUMNS
            ),
            params![
                job.job_id,
                job.source_id,
                job.idempotency_key,
                job.status,
                job.attempt_count,
                job.max_attempts,
                job.error_code,
                job.error_context,
                job.parser_name,
                job.claimed_at.map(sql_timestamp),
                job.created_at,
                job.updated_at,
            ],
        )
        .map_err(StorageError::classify)?;
    let stored = find_job_by_key(conn, &job.idempotency_key)?
        .ok_or_else(|| StorageError::not_found("ingestion_job", job.idempotency_key.as_str()))?;
    Ok((stored, inserted == 1))
}

pub fn find_job_by_key(conn: &Connection, key: &str) -> StorageResult<Option<IngestionJob>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM ingestion_jobs WHERE idempotency_key = ?1", JOB_COLUMNS),
            params![key],
            job_from_row,
        )
        .optional()?)
}

pub fn get_job(conn: &Connection, job_id: &JobId) -> StorageResult<IngestionJob> {
    conn.query_row(
        &format!("SELECT {} FROM ingestion_jobs WHERE job_id = ?1", JOB_COLUMNS),
        params![job_id],
        job_from_row,
    )
    .optional()?
    .ok_or_else(|| StorageError::not_found("ingestion_job", job_id.as_str()))
}

pub fn jobs_with_status(conn: &Connection, status: JobStatus) -> StorageResult<Vec<IngestionJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ingestion_jobs WHERE status = ?1 ORDER BY created_at, rowid",
        JOB_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![status], job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Atomically move the oldest pending job to `running`.
pub fn claim_next_job(conn: &Connection, now: DateTime<Utc>) -> StorageResult<Option<IngestionJob>> {
    Ok(conn
        .query_row(
            &format!(
                r#"
                UPDATE ingestion_jobs SET status = 'running', claimed_at = ?1, updated_at = ?2
                WHERE job_id = (
                    SELECT job_id FROM ingestion_jobs WHERE status = 'pending'
                    ORDER BY created_at, rowid LIMIT 1
                ) AND status = 'pending'
                RETURNING {}
                "#,
                JOB_COLUMNS
            ),
            params![sql_timestamp(now), now],
            job_from_row,
        )
        .optional()?)
}

/// `running -> completed` for the holder of `claimed_at`. Returns the number of
/// rows changed (0 if the job is not running under that claim).
pub fn mark_job_completed(
    conn: &Connection,
    job_id: &JobId,
    claimed_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StorageResult<usize> {
    Ok(conn.execute(
        "UPDATE ingestion_jobs SET status = 'completed', claimed_at = NULL, updated_at = ?3
         WHERE job_id = ?1 AND status = 'running' AND claimed_at = ?2",
        params![job_id, sql_timestamp(claimed_at), now],
    )?)
}

/// Record a failed attempt on a job running under `claimed_at` and move it to
/// `next_status`.
#[allow(clippy::too_many_arguments)]
pub fn record_job_failure(
    conn: &Connection,
    job_id: &JobId,
    claimed_at: DateTime<Utc>,
    next_status: JobStatus,
    attempt_count: u32,
    error_code: &str,
    error_context: &serde_json::Value,
    parser_name: Option<&str>,
    now: DateTime<Utc>,
) -> StorageResult<usize> {
    Ok(conn
        .execute(
            r#"
            UPDATE ingestion_jobs
            SET status = ?2, attempt_count = ?3, error_code = ?4, error_context = ?5,
                parser_name = COALESCE(?6, parser_name), claimed_at = NULL, updated_at = ?7
            WHERE job_id = ?1 AND status = 'running' AND claimed_at = ?8
            "#,
            params![
                job_id,
                next_status,
                attempt_count,
                error_code,
                error_context,
                parser_name,
                now,
                sql_timestamp(claimed_at),
            ],
        )
        .map_err(StorageError::classify)?)
}

/// `dead_letter -> pending` with a fresh attempt budget.
pub fn requeue_dead_letter_job(
    conn: &Connection,
    job_id: &JobId,
    error_context: &serde_json::Value,
    now: DateTime<Utc>,
) -> StorageResult<usize> {
    Ok(conn.execute(
        r#"
        UPDATE ingestion_jobs
        SET status = 'pending', attempt_count = 0, error_context = ?2, claimed_at = NULL, updated_at = ?3
        WHERE job_id = ?1 AND status = 'dead_letter'
        "#,
        params![job_id, error_context, now],
    )?)
}

/// Running jobs claimed before `cutoff`.
pub fn stale_running_jobs(conn: &Connection, cutoff: DateTime<Utc>) -> StorageResult<Vec<IngestionJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM ingestion_jobs WHERE status = 'running' AND claimed_at < ?1 ORDER BY claimed_at",
        JOB_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![sql_timestamp(cutoff)], job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn insert_attempt(conn: &Connection, attempt: &JobAttempt) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO job_attempts (attempt_id, job_id, attempt_number, outcome, error_code, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            attempt.attempt_id,
            attempt.job_id,
            attempt.attempt_number,
            attempt.outcome,
            attempt.error_code,
            attempt.started_at,
            attempt.finished_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

/// Close attempt `attempt_number` of a job if it is still open.
pub fn close_attempt(
    conn: &Connection,
    job_id: &JobId,
    attempt_number: u32,
    outcome: &str,
    error_code: Option<&str>,
    now: DateTime<Utc>,
) -> StorageResult<usize> {
    Ok(conn.execute(
        "UPDATE job_attempts SET outcome = ?3, error_code = ?4, finished_at = ?5
         WHERE job_id = ?1 AND attempt_number = ?2 AND outcome = 'running'",
        params![job_id, attempt_number, outcome, error_code, now],
    )?)
}

pub fn attempts_for_job(conn: &Connection, job_id: &JobId) -> StorageResult<Vec<JobAttempt>> {
    let mut stmt = conn.prepare(
        "SELECT attempt_id, job_id, attempt_number, outcome, error_code, started_at, finished_at
         FROM job_attempts WHERE job_id = ?1 ORDER BY started_at, rowid",
    )?;
    let rows = stmt
        .query_map(params![job_id], |row| {
            Ok(JobAttempt {
                attempt_id: row.get(0)?,
                job_id: row.get(1)?,
                attempt_number: row.get(2)?,
                outcome: row.get(3)?,
                error_code: row.get(4)?,
                started_at: row.get(5)?,
                finished_at: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// === Reprocess jobs ===

const REPROCESS_COLUMNS: &str = "job_id, passage_id, status, trigger_mode, trigger_reason_code, \
     notes, idempotency_key, attempt_count, max_attempts, error_code, claimed_at, created_at, updated_at";

fn reprocess_from_row(row: &Row<'_>) -> rusqlite::Result<ReprocessJob> {
    Ok(ReprocessJob {
        job_id: row.get(0)?,
        passage_id: row.get(1)?,
        status: row.get(2)?,
        trigger_mode: row.get(3)?,
        trigger_reason_code: row.get(4)?,
        notes: row.get(5)?,
        idempotency_key: row.get(6)?,
        attempt_count: row.get(7)?,
        max_attempts: row.get(8)?,
        error_code: row.get(9)?,
        claimed_at: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

/// Filter for listing reprocess jobs
#[derive(Debug, Clone, Default)]
pub struct ReprocessFilter {
    pub status: Option<ReprocessStatus>,
    pub trigger_mode: Option<ReprocessTriggerMode>,
    pub passage_id: Option<PassageId>,
    pub limit: Option<usize>,
}

impl ReprocessFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ReprocessStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_trigger_mode(mut self, mode: ReprocessTriggerMode) -> Self {
        self.trigger_mode = Some(mode);
        self
    }

    pub fn with_passage(mut self, passage_id: PassageId) -> Self {
        self.passage_id = Some(passage_id);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Insert a reprocess job. Fails with `Conflict` if the passage already has an open
/// job or the idempotency key was used before.
pub fn insert_reprocess_job(conn: &Connection, job: &ReprocessJob) -> StorageResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO reprocess_jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            REPROCESS_COLUMNS
        ),
        params![
            job.job_id,
            job.passage_id,
            job.status,
            job.trigger_mode,
            job.trigger_reason_code,
            job.notes,
            job.idempotency_key,
            job.attempt_count,
            job.max_attempts,
            job.error_code,
            job.claimed_at.map(sql_timestamp),
            job.created_at,
            job.updated_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn get_reprocess_job(conn: &Connection, job_id: &ReprocessJobId) -> StorageResult<ReprocessJob> {
    conn.query_row(
        &format!("SELECT {} FROM reprocess_jobs WHERE job_id = ?1", REPROCESS_COLUMNS),
        params![job_id],
        reprocess_from_row,
    )
    .optional()?
    .ok_or_else(|| StorageError::not_found("reprocess_job", job_id.as_str()))
}

pub fn find_open_reprocess(conn: &Connection, passage_id: &PassageId) -> StorageResult<Option<ReprocessJob>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM reprocess_jobs WHERE passage_id = ?1 AND status IN ('pending', 'running')",
                REPROCESS_COLUMNS
            ),
            params![passage_id],
            reprocess_from_row,
        )
        .optional()?)
}

pub fn find_reprocess_by_key(conn: &Connection, key: &str) -> StorageResult<Option<ReprocessJob>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM reprocess_jobs WHERE idempotency_key = ?1", REPROCESS_COLUMNS),
            params![key],
            reprocess_from_row,
        )
        .optional()?)
}

/// Atomically move the oldest pending reprocess job to `running`.
pub fn claim_next_reprocess(conn: &Connection, now: DateTime<Utc>) -> StorageResult<Option<ReprocessJob>> {
    Ok(conn
        .query_row(
            &format!(
                r#"
                UPDATE reprocess_jobs SET status = 'running', claimed_at = ?1, updated_at = ?2
                WHERE job_id = (
                    SELECT job_id FROM reprocess_jobs WHERE status = 'pending'
                    ORDER BY created_at, rowid LIMIT 1
                ) AND status = 'pending'
                RETURNING {}
                "#,
                REPROCESS_COLUMNS
            ),
            params![sql_timestamp(now), now],
            reprocess_from_row,
        )
        .optional()?)
}

/// Move a reprocess job running under `claimed_at` to its next state after an
/// attempt.
#[allow(clippy::too_many_arguments)]
pub fn finish_reprocess_attempt(
    conn: &Connection,
    job_id: &ReprocessJobId,
    claimed_at: DateTime<Utc>,
    next_status: ReprocessStatus,
    attempt_count: u32,
    error_code: Option<&str>,
    now: DateTime<Utc>,
) -> StorageResult<usize> {
    Ok(conn
        .execute(
            r#"
            UPDATE reprocess_jobs
            SET status = ?2, attempt_count = ?3, error_code = ?4, claimed_at = NULL, updated_at = ?5
            WHERE job_id = ?1 AND status = 'running' AND claimed_at = ?6
            "#,
            params![job_id, next_status, attempt_count, error_code, now, sql_timestamp(claimed_at)],
        )
        .map_err(StorageError::classify)?)
}

/// Running reprocess jobs claimed before `cutoff`.
pub fn stale_running_reprocess(conn: &Connection, cutoff: DateTime<Utc>) -> StorageResult<Vec<ReprocessJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM reprocess_jobs WHERE status = 'running' AND claimed_at < ?1 ORDER BY claimed_at",
        REPROCESS_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![sql_timestamp(cutoff)], reprocess_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_reprocess_jobs(conn: &Connection, filter: &ReprocessFilter) -> StorageResult<Vec<ReprocessJob>> {
    let mut sql = format!("SELECT {} FROM reprocess_jobs WHERE 1 = 1", REPROCESS_COLUMNS);
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(status) = filter.status {
        values.push(Box::new(status));
        sql.push_str(&format!(" AND status = ?{}", values.len()));
    }
    if let Some(mode) = filter.trigger_mode {
        values.push(Box::new(mode));
        sql.push_str(&format!(" AND trigger_mode = ?{}", values.len()));
    }
    if let Some(passage_id) = &filter.passage_id {
        values.push(Box::new(passage_id.clone()));
        sql.push_str(&format!(" AND passage_id = ?{}", values.len()));
    }
    sql.push_str(" ORDER BY created_at, rowid");
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let params_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_refs.as_slice(), reprocess_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn insert_revision(conn: &Connection, revision: &TranslationRevision) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO translation_revisions
            (revision_id, passage_id, reprocess_job_id, attempt_number, source_variant, before_text,
             after_text, before_ratio, after_ratio, detected_language, accepted, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            revision.revision_id,
            revision.passage_id,
            revision.reprocess_job_id,
            revision.attempt_number,
            revision.source_variant,
            revision.before_text,
            revision.after_text,
            revision.before_ratio,
            revision.after_ratio,
            revision.detected_language,
            revision.accepted,
            revision.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn revisions_for_passage(conn: &Connection, passage_id: &PassageId) -> StorageResult<Vec<TranslationRevision>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT revision_id, passage_id, reprocess_job_id, attempt_number, source_variant, before_text,
               after_text, before_ratio, after_ratio, detected_language, accepted, created_at
        FROM translation_revisions WHERE passage_id = ?1 ORDER BY created_at, rowid
        "#,
    )?;
    let rows = stmt
        .query_map(params![passage_id], |row| {
            Ok(TranslationRevision {
                revision_id: row.get(0)?,
                passage_id: row.get(1)?,
                reprocess_job_id: row.get(2)?,
                attempt_number: row.get(3)?,
                source_variant: row.get(4)?,
                before_text: row.get(5)?,
                after_text: row.get(6)?,
                before_ratio: row.get(7)?,
                after_ratio: row.get(8)?,
                detected_language: row.get(9)?,
                accepted: row.get(10)?,
                created_at: row.get(11)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
