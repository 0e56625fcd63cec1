//! SQLite Evidence Store
//!
//! One database file holds every pipeline entity. Cross-entity invariants
//! (idempotency keys, one open reprocess job per passage, one primary member per
//! witness group, evidence foreign keys, append-only audit ledger) are enforced by
//! the schema itself so no caller can bypass them.

use super::traits::{OpenStore, StorageError, StorageResult};
use crate::model::AuditEvent;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, Row, Transaction};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed Evidence Store
///
/// Thread-safe via an internal mutex on the connection. Multi-row state changes go
/// through [`SqliteStore::transaction`].
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Initialize the database schema
    ///
    /// Tables are created with `IF NOT EXISTS`, then column migrations run for
    /// databases created by earlier versions.
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS texts (
                text_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                origin_region TEXT,
                tradition_tags TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS witness_groups (
                group_id TEXT PRIMARY KEY,
                text_id TEXT NOT NULL REFERENCES texts(text_id),
                status TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sources (
                source_id TEXT PRIMARY KEY,
                text_id TEXT NOT NULL REFERENCES texts(text_id),
                locator TEXT NOT NULL,
                format_hint TEXT NOT NULL,
                source_sha256 TEXT NOT NULL UNIQUE,
                normalized_sha256 TEXT NOT NULL,
                witness_group_id TEXT REFERENCES witness_groups(group_id),
                is_duplicate_of TEXT REFERENCES sources(source_id),
                created_at TEXT NOT NULL,
                CHECK (is_duplicate_of IS NULL OR is_duplicate_of <> source_id)
            );
            CREATE INDEX IF NOT EXISTS idx_sources_normalized ON sources(normalized_sha256);

            -- Duplicate graph stays depth one: target must be a root with a matching
            -- fingerprint, and a source that others point at cannot become a duplicate.
            CREATE TRIGGER IF NOT EXISTS sources_duplicate_guard
            BEFORE UPDATE OF is_duplicate_of ON sources
            WHEN NEW.is_duplicate_of IS NOT NULL
            BEGIN
                SELECT RAISE(ABORT, 'duplicate target fingerprint mismatch')
                WHERE (SELECT normalized_sha256 FROM sources WHERE source_id = NEW.is_duplicate_of)
                    IS NOT NEW.normalized_sha256;
                SELECT RAISE(ABORT, 'duplicate target is itself a duplicate')
                WHERE (SELECT is_duplicate_of FROM sources WHERE source_id = NEW.is_duplicate_of)
                    IS NOT NULL;
                SELECT RAISE(ABORT, 'source already has duplicates pointing at it')
                WHERE EXISTS (SELECT 1 FROM sources WHERE is_duplicate_of = NEW.source_id);
            END;

            CREATE TABLE IF NOT EXISTS witness_members (
                group_id TEXT NOT NULL REFERENCES witness_groups(group_id),
                source_id TEXT NOT NULL UNIQUE REFERENCES sources(source_id),
                role TEXT NOT NULL CHECK (role IN ('primary', 'secondary')),
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (group_id, source_id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_witness_one_primary
                ON witness_members(group_id) WHERE role = 'primary';

            CREATE TABLE IF NOT EXISTS ingestion_jobs (
                job_id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL REFERENCES sources(source_id),
                idempotency_key TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                error_code TEXT,
                error_context TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (max_attempts >= 1),
                CHECK (attempt_count BETWEEN 0 AND max_attempts)
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON ingestion_jobs(status, created_at);

            CREATE TABLE IF NOT EXISTS job_attempts (
                attempt_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES ingestion_jobs(job_id),
                attempt_number INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                error_code TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_job ON job_attempts(job_id);

            CREATE TABLE IF NOT EXISTS passages (
                passage_id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL REFERENCES sources(source_id),
                text_id TEXT NOT NULL REFERENCES texts(text_id),
                locator TEXT NOT NULL,
                original_excerpt TEXT NOT NULL,
                normalized_excerpt TEXT NOT NULL,
                detected_language TEXT NOT NULL,
                language_confidence REAL NOT NULL CHECK (language_confidence BETWEEN 0 AND 1),
                translation_status TEXT NOT NULL,
                untranslated_ratio REAL NOT NULL CHECK (untranslated_ratio BETWEEN 0 AND 1),
                usability_score REAL NOT NULL CHECK (usability_score BETWEEN 0 AND 1),
                relevance_score REAL NOT NULL CHECK (relevance_score BETWEEN 0 AND 1),
                relevance_state TEXT NOT NULL,
                reviewer_state TEXT NOT NULL,
                publish_state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (publish_state = 'blocked' OR reviewer_state = 'approved')
            );
            CREATE INDEX IF NOT EXISTS idx_passages_source ON passages(source_id);
            CREATE INDEX IF NOT EXISTS idx_passages_review ON passages(reviewer_state, created_at);

            CREATE TABLE IF NOT EXISTS reprocess_jobs (
                job_id TEXT PRIMARY KEY,
                passage_id TEXT NOT NULL REFERENCES passages(passage_id),
                status TEXT NOT NULL,
                trigger_mode TEXT NOT NULL,
                trigger_reason_code TEXT NOT NULL,
                notes TEXT,
                idempotency_key TEXT NOT NULL UNIQUE,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                error_code TEXT,
                claimed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (max_attempts BETWEEN 1 AND 2),
                CHECK (attempt_count BETWEEN 0 AND max_attempts)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_reprocess_one_open
                ON reprocess_jobs(passage_id) WHERE status IN ('pending', 'running');

            CREATE TABLE IF NOT EXISTS tuning_profiles (
                profile_id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE CHECK (length(trim(name)) > 0),
                is_default INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1 CHECK (version >= 1),
                thresholds TEXT NOT NULL,
                lexicons TEXT NOT NULL,
                segmentation TEXT NOT NULL,
                created_by TEXT NOT NULL,
                updated_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tuning_one_default
                ON tuning_profiles(is_default) WHERE is_default = 1;

            CREATE TABLE IF NOT EXISTS translation_revisions (
                revision_id TEXT PRIMARY KEY,
                passage_id TEXT NOT NULL REFERENCES passages(passage_id),
                reprocess_job_id TEXT NOT NULL REFERENCES reprocess_jobs(job_id),
                attempt_number INTEGER NOT NULL,
                source_variant TEXT NOT NULL,
                before_text TEXT NOT NULL,
                after_text TEXT NOT NULL,
                before_ratio REAL NOT NULL,
                after_ratio REAL NOT NULL,
                detected_language TEXT NOT NULL,
                accepted INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS proposal_traces (
                trace_id TEXT PRIMARY KEY,
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                proposal_type TEXT NOT NULL,
                idempotency_key TEXT NOT NULL UNIQUE,
                model_name TEXT NOT NULL,
                prompt_version TEXT NOT NULL,
                prompt_hash TEXT NOT NULL,
                response_hash TEXT NOT NULL,
                retry_count INTEGER NOT NULL,
                failure_reason TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_traces_object ON proposal_traces(object_type, object_id);

            CREATE TABLE IF NOT EXISTS tags (
                tag_id TEXT PRIMARY KEY,
                dimension TEXT NOT NULL,
                term TEXT NOT NULL,
                confidence REAL NOT NULL CHECK (confidence BETWEEN 0 AND 1),
                rationale TEXT,
                trace_id TEXT NOT NULL REFERENCES proposal_traces(trace_id),
                reviewer_state TEXT NOT NULL,
                publish_state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                CHECK (publish_state = 'blocked' OR reviewer_state = 'approved')
            );

            CREATE TABLE IF NOT EXISTS links (
                link_id TEXT PRIMARY KEY,
                source_passage_id TEXT NOT NULL REFERENCES passages(passage_id),
                target_passage_id TEXT NOT NULL REFERENCES passages(passage_id),
                relation_type TEXT NOT NULL,
                weighted_score REAL NOT NULL CHECK (weighted_score >= 0.35 AND weighted_score <= 1),
                bucket TEXT NOT NULL,
                dimension_scores TEXT NOT NULL,
                rationale TEXT,
                trace_id TEXT NOT NULL REFERENCES proposal_traces(trace_id),
                reviewer_state TEXT NOT NULL,
                publish_state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                CHECK (source_passage_id <> target_passage_id),
                CHECK (publish_state = 'blocked' OR reviewer_state = 'approved')
            );

            CREATE TABLE IF NOT EXISTS flags (
                flag_id TEXT PRIMARY KEY,
                flag_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                rationale TEXT NOT NULL CHECK (length(trim(rationale)) > 0),
                trace_id TEXT NOT NULL REFERENCES proposal_traces(trace_id),
                reviewer_state TEXT NOT NULL,
                publish_state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                CHECK (publish_state = 'blocked' OR reviewer_state = 'approved')
            );

            -- Evidence rows for tags, links, flags and pending terms
            CREATE TABLE IF NOT EXISTS proposal_evidence (
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                passage_id TEXT NOT NULL REFERENCES passages(passage_id),
                position INTEGER NOT NULL,
                PRIMARY KEY (object_type, object_id, passage_id)
            );
            CREATE INDEX IF NOT EXISTS idx_evidence_passage ON proposal_evidence(passage_id);

            CREATE TABLE IF NOT EXISTS vocabulary_pending_terms (
                term_id TEXT PRIMARY KEY,
                dimension TEXT NOT NULL,
                term TEXT NOT NULL,
                rationale TEXT,
                trace_id TEXT REFERENCES proposal_traces(trace_id),
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS consolidated_passages (
                consolidated_id TEXT PRIMARY KEY,
                group_id TEXT NOT NULL REFERENCES witness_groups(group_id),
                cluster_key TEXT NOT NULL,
                merged_text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (group_id, cluster_key)
            );

            CREATE TABLE IF NOT EXISTS consolidated_contributors (
                consolidated_id TEXT NOT NULL
                    REFERENCES consolidated_passages(consolidated_id) ON DELETE CASCADE,
                passage_id TEXT NOT NULL REFERENCES passages(passage_id),
                source_id TEXT NOT NULL REFERENCES sources(source_id),
                similarity REAL NOT NULL CHECK (similarity BETWEEN 0 AND 1),
                PRIMARY KEY (consolidated_id, passage_id)
            );

            CREATE TABLE IF NOT EXISTS review_decisions (
                review_id TEXT PRIMARY KEY,
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                decision TEXT NOT NULL,
                reviewer_id TEXT NOT NULL,
                notes TEXT,
                created_at TEXT NOT NULL,
                CHECK (decision = 'approve' OR length(trim(coalesce(notes, ''))) > 0)
            );
            CREATE INDEX IF NOT EXISTS idx_reviews_object ON review_decisions(object_type, object_id);

            CREATE TABLE IF NOT EXISTS audit_events (
                audit_id TEXT PRIMARY KEY,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                previous_state TEXT,
                new_state TEXT,
                correlation_id TEXT,
                details TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_object ON audit_events(object_id, created_at);

            CREATE TRIGGER IF NOT EXISTS audit_events_no_update
            BEFORE UPDATE ON audit_events
            BEGIN
                SELECT RAISE(ABORT, 'audit_events is append-only');
            END;
            CREATE TRIGGER IF NOT EXISTS audit_events_no_delete
            BEFORE DELETE ON audit_events
            BEGIN
                SELECT RAISE(ABORT, 'audit_events is append-only');
            END;

            CREATE TABLE IF NOT EXISTS publish_packages (
                package_id TEXT PRIMARY KEY,
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (object_type, object_id)
            );
            CREATE TRIGGER IF NOT EXISTS publish_packages_immutable
            BEFORE UPDATE ON publish_packages
            BEGIN
                SELECT RAISE(ABORT, 'publish packages are immutable');
            END;
            "#,
        )?;

        Self::migrate_job_diagnostics(conn)?;

        Ok(())
    }

    /// Migration: job columns added after the first schema
    ///
    /// SQLite doesn't support ALTER TABLE ADD COLUMN IF NOT EXISTS,
    /// so we check if columns exist first using table_info pragma.
    fn migrate_job_diagnostics(conn: &Connection) -> StorageResult<()> {
        for (table, column, ddl) in [
            ("ingestion_jobs", "parser_name", "ALTER TABLE ingestion_jobs ADD COLUMN parser_name TEXT"),
            ("ingestion_jobs", "claimed_at", "ALTER TABLE ingestion_jobs ADD COLUMN claimed_at TEXT"),
            ("reprocess_jobs", "claimed_at", "ALTER TABLE reprocess_jobs ADD COLUMN claimed_at TEXT"),
        ] {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
                    params![table, column],
                    |row| row.get(0),
                )
                .unwrap_or(false);
            if !exists {
                conn.execute(ddl, [])?;
            }
        }
        Ok(())
    }

    /// Run read-only (or single-statement) work against the connection.
    pub fn read<T, E>(&self, f: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Run `f` inside one transaction; commits on `Ok`, rolls back on `Err`.
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StorageError>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(StorageError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(StorageError::from)?;
        Ok(value)
    }

    /// Audit trail for one object, oldest first.
    pub fn audit_trail(&self, object_id: &str) -> StorageResult<Vec<AuditEvent>> {
        self.read(|conn| audit_trail(conn, object_id))
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Fixed-width RFC 3339 text (microseconds, `+00:00`) for timestamps that SQL
/// compares as strings, such as claim times against a sweep cutoff.
pub fn sql_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Decode a JSON text column.
pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Append one event to the audit ledger.
pub fn insert_audit(conn: &Connection, event: &AuditEvent) -> StorageResult<()> {
    conn.execute(
        r#"
        INSERT INTO audit_events
            (audit_id, actor, action, object_type, object_id, previous_state,
             new_state, correlation_id, details, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            event.audit_id,
            event.actor,
            event.action,
            event.object_type,
            event.object_id,
            event.previous_state,
            event.new_state,
            event.correlation_id,
            serde_json::to_string(&event.details)?,
            event.created_at,
        ],
    )
    .map_err(StorageError::classify)?;
    Ok(())
}

pub fn audit_trail(conn: &Connection, object_id: &str) -> StorageResult<Vec<AuditEvent>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT audit_id, actor, action, object_type, object_id, previous_state,
               new_state, correlation_id, details, created_at
        FROM audit_events WHERE object_id = ?1
        ORDER BY created_at, rowid
        "#,
    )?;
    let events = stmt
        .query_map(params![object_id], |row| {
            Ok(AuditEvent {
                audit_id: row.get(0)?,
                actor: row.get(1)?,
                action: row.get(2)?,
                object_type: row.get(3)?,
                object_id: row.get(4)?,
                previous_state: row.get(5)?,
                new_state: row.get(6)?,
                correlation_id: row.get(7)?,
                details: json_col(row, 8)?,
                created_at: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

pub fn count_audit_events(conn: &Connection, object_id: &str, action: &str) -> StorageResult<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM audit_events WHERE object_id = ?1 AND action = ?2",
        params![object_id, action],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}
