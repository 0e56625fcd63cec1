//! Ingestion Job Engine
//!
//! `pending -> running -> {completed | pending (retry) | dead_letter}`. Every
//! transition is a single conditional UPDATE plus its audit event inside one
//! transaction, so a job can only be claimed, completed or failed by whoever
//! currently holds it in `running`. Holding is proven by the claim time handed out
//! by [`JobEngine::claim_next`]; a claim swept as stale is void.

use crate::config::PipelineConfig;
use crate::error::{CurationError, CurationResult, JobFailure, ProcessingError};
use crate::model::*;
use crate::store::{insert_audit, jobs, sources, SqliteStore, StorageError};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{info, warn};

/// Which dead-letter jobs an operator requeue applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum RequeueTarget {
    One(JobId),
    All,
}

pub struct JobEngine<'a> {
    store: &'a SqliteStore,
    max_attempts: u32,
    actor: String,
}

impl<'a> JobEngine<'a> {
    pub fn new(store: &'a SqliteStore, config: &PipelineConfig) -> Self {
        Self {
            store,
            max_attempts: config.max_job_attempts,
            actor: config.operator_id.clone(),
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Create a pending job for a source, or return the job already holding `key`.
    ///
    /// Without an explicit key the source id is the key, so one source maps to
    /// one logical ingestion request.
    pub fn enqueue(&self, source_id: &SourceId, key: Option<&str>) -> CurationResult<IngestionJob> {
        let key = match key.map(str::trim) {
            Some("") => return Err(CurationError::validation("idempotency_key", "must not be empty")),
            Some(key) => key.to_string(),
            None => format!("ingest:{}", source_id),
        };

        let (job, created) = self.store.transaction(|tx| -> CurationResult<_> {
            if let Some(existing) = jobs::find_job_by_key(tx, &key)? {
                return Ok((existing, false));
            }
            sources::find_source(tx, source_id)?
                .ok_or_else(|| CurationError::not_found("source", source_id.as_str()))?;

            let now = Utc::now();
            let (job, created) = jobs::insert_job_if_absent(
                tx,
                &IngestionJob {
                    job_id: JobId::new(),
                    source_id: source_id.clone(),
                    idempotency_key: key.clone(),
                    status: JobStatus::Pending,
                    attempt_count: 0,
                    max_attempts: self.max_attempts,
                    error_code: None,
                    error_context: None,
                    parser_name: None,
                    claimed_at: None,
                    created_at: now,
                    updated_at: now,
                },
            )?;
            if created {
                insert_audit(
                    tx,
                    &AuditEvent::new(&self.actor, "job_created", "ingestion_job", job.job_id.as_str())
                        .with_transition(None, Some(JobStatus::Pending.as_str()))
                        .with_correlation(source_id.as_str())
                        .with_details(serde_json::json!({ "idempotency_key": key })),
                )?;
            }
            Ok((job, created))
        })?;

        if created {
            info!(job_id = %job.job_id, source_id = %source_id, "ingestion job enqueued");
        }
        Ok(job)
    }

    /// Claim the oldest pending job. At most one caller wins any given job.
    pub fn claim_next(&self) -> CurationResult<Option<IngestionJob>> {
        let claimed = self.store.transaction(|tx| -> CurationResult<_> {
            let now = Utc::now();
            let Some(job) = jobs::claim_next_job(tx, now)? else {
                return Ok(None);
            };
            jobs::insert_attempt(
                tx,
                &JobAttempt {
                    attempt_id: AttemptId::new(),
                    job_id: job.job_id.clone(),
                    attempt_number: job.attempt_count + 1,
                    outcome: JobStatus::Running.as_str().to_string(),
                    error_code: None,
                    started_at: now,
                    finished_at: None,
                },
            )?;
            insert_audit(
                tx,
                &AuditEvent::new(&self.actor, "job_claimed", "ingestion_job", job.job_id.as_str())
                    .with_transition(Some(JobStatus::Pending.as_str()), Some(JobStatus::Running.as_str()))
                    .with_correlation(job.source_id.as_str())
                    .with_details(serde_json::json!({ "attempt_number": job.attempt_count + 1 })),
            )?;
            Ok(Some(job))
        })?;

        if let Some(job) = &claimed {
            info!(job_id = %job.job_id, attempt = job.attempt_count + 1, "ingestion job claimed");
        }
        Ok(claimed)
    }

    /// `running -> completed` for the job as it was handed out by `claim_next`.
    pub fn complete(&self, claim: &IngestionJob, details: serde_json::Value) -> CurationResult<IngestionJob> {
        let job_id = &claim.job_id;
        let job = self.store.transaction(|tx| -> CurationResult<_> {
            let now = Utc::now();
            let job = jobs::get_job(tx, job_id)?;
            let claimed_at = claim_token(claim, &job)?;
            if jobs::mark_job_completed(tx, job_id, claimed_at, now)? == 0 {
                return Err(claim_lost(&job).into());
            }
            jobs::close_attempt(tx, job_id, job.attempt_count + 1, JobStatus::Completed.as_str(), None, now)?;
            insert_audit(
                tx,
                &AuditEvent::new(&self.actor, "job_completed", "ingestion_job", job_id.as_str())
                    .with_transition(Some(JobStatus::Running.as_str()), Some(JobStatus::Completed.as_str()))
                    .with_correlation(job.source_id.as_str())
                    .with_details(details),
            )?;
            Ok(jobs::get_job(tx, job_id)?)
        })?;
        info!(job_id = %job_id, "ingestion job completed");
        Ok(job)
    }

    /// Record a failed attempt of a claimed job. The job returns to `pending` while
    /// attempts remain, otherwise it moves to `dead_letter` with its diagnostics
    /// frozen.
    pub fn fail(&self, claim: &IngestionJob, failure: &JobFailure) -> CurationResult<IngestionJob> {
        let job_id = &claim.job_id;
        let job = self.store.transaction(|tx| fail_in(tx, claim, failure, &self.actor))?;
        match job.status {
            JobStatus::DeadLetter => warn!(
                job_id = %job_id,
                error_code = %failure.error_code,
                attempts = job.attempt_count,
                "ingestion job dead-lettered"
            ),
            _ => warn!(
                job_id = %job_id,
                error_code = %failure.error_code,
                attempts = job.attempt_count,
                "ingestion job failed, will retry"
            ),
        }
        Ok(job)
    }

    /// Operator action: move dead-letter jobs back to `pending` with a fresh attempt
    /// budget. The reason is mandatory and kept in the job's error context.
    pub fn requeue_dead_letter(&self, target: &RequeueTarget, reason: &str) -> CurationResult<Vec<IngestionJob>> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(CurationError::policy("requeueing a dead-letter job requires a reason"));
        }

        let requeued = self.store.transaction(|tx| -> CurationResult<_> {
            let candidates = match target {
                RequeueTarget::One(job_id) => {
                    let job = jobs::get_job(tx, job_id)?;
                    if job.status != JobStatus::DeadLetter {
                        return Err(CurationError::policy(format!(
                            "job {} is {}, only dead_letter jobs can be requeued",
                            job_id, job.status
                        )));
                    }
                    vec![job]
                }
                RequeueTarget::All => jobs::jobs_with_status(tx, JobStatus::DeadLetter)?,
            };

            let now = Utc::now();
            let mut requeued = Vec::with_capacity(candidates.len());
            for job in candidates {
                let context = serde_json::json!({
                    "requeue_reason": reason,
                    "previous_error_code": job.error_code,
                    "previous_error_context": job.error_context,
                    "previous_attempt_count": job.attempt_count,
                });
                if jobs::requeue_dead_letter_job(tx, &job.job_id, &context, now)? == 0 {
                    continue;
                }
                insert_audit(
                    tx,
                    &AuditEvent::new(&self.actor, "requeue_dead_letter", "ingestion_job", job.job_id.as_str())
                        .with_transition(Some(JobStatus::DeadLetter.as_str()), Some(JobStatus::Pending.as_str()))
                        .with_correlation(job.source_id.as_str())
                        .with_details(serde_json::json!({ "reason": reason })),
                )?;
                requeued.push(jobs::get_job(tx, &job.job_id)?);
            }
            Ok(requeued)
        })?;

        info!(count = requeued.len(), reason, "dead-letter jobs requeued");
        Ok(requeued)
    }

    /// Fail every running job claimed longer ago than `timeout`, returning them to
    /// the retry path.
    pub fn sweep_stale(&self, timeout: std::time::Duration) -> CurationResult<Vec<IngestionJob>> {
        let timeout_secs = timeout.as_secs();
        let cutoff = Utc::now() - Duration::seconds(timeout_secs as i64);
        let failure = JobFailure::from(&ProcessingError::Timeout(timeout_secs));

        let swept = self.store.transaction(|tx| -> CurationResult<_> {
            let mut swept = Vec::new();
            for job in jobs::stale_running_jobs(tx, cutoff)? {
                swept.push(fail_in(tx, &job, &failure, &self.actor)?);
            }
            Ok(swept)
        })?;
        for job in &swept {
            warn!(job_id = %job.job_id, status = %job.status, "stale ingestion job swept");
        }
        Ok(swept)
    }

    pub fn get(&self, job_id: &JobId) -> CurationResult<IngestionJob> {
        Ok(self.store.read(|c| jobs::get_job(c, job_id))?)
    }

    pub fn attempts(&self, job_id: &JobId) -> CurationResult<Vec<JobAttempt>> {
        Ok(self.store.read(|c| {
            jobs::get_job(c, job_id)?;
            jobs::attempts_for_job(c, job_id)
        })?)
    }
}

fn claim_lost(job: &IngestionJob) -> StorageError {
    match job.status {
        JobStatus::Running => StorageError::Conflict(format!("job {} was re-claimed by another worker", job.job_id)),
        status => StorageError::Conflict(format!("job {} is {}, not running", job.job_id, status)),
    }
}

/// The claim time a caller holds, or a conflict if it never held a claim.
fn claim_token(claim: &IngestionJob, current: &IngestionJob) -> CurationResult<DateTime<Utc>> {
    claim.claimed_at.ok_or_else(|| claim_lost(current).into())
}

fn fail_in(conn: &Connection, claim: &IngestionJob, failure: &JobFailure, actor: &str) -> CurationResult<IngestionJob> {
    let now = Utc::now();
    let job_id = &claim.job_id;
    let job = jobs::get_job(conn, job_id)?;
    let claimed_at = claim_token(claim, &job)?;
    let attempt_count = job.attempt_count + 1;
    let next = if attempt_count >= job.max_attempts {
        JobStatus::DeadLetter
    } else {
        JobStatus::Pending
    };

    let changed = jobs::record_job_failure(
        conn,
        job_id,
        claimed_at,
        next,
        attempt_count,
        &failure.error_code,
        &failure.error_context,
        failure.parser_name.as_deref(),
        now,
    )?;
    if changed == 0 {
        return Err(claim_lost(&job).into());
    }
    jobs::close_attempt(conn, job_id, attempt_count, JobStatus::Failed.as_str(), Some(&failure.error_code), now)?;
    insert_audit(
        conn,
        &AuditEvent::new(actor, "job_failed", "ingestion_job", job_id.as_str())
            .with_transition(Some(JobStatus::Running.as_str()), Some(next.as_str()))
            .with_correlation(job.source_id.as_str())
            .with_details(serde_json::json!({
                "error_code": failure.error_code,
                "error_context": failure.error_context,
                "parser_name": failure.parser_name,
                "attempt_count": attempt_count,
            })),
    )?;
    Ok(jobs::get_job(conn, job_id)?)
}
