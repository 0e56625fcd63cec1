//! Reprocess Queue
//!
//! Bounded-retry translation work scoped to one passage. A job is claimed,
//! tried against each source variant (the passage's own excerpt, then the closest
//! passage in a sibling witness of the same text) and then either completes,
//! returns to `pending`, or exhausts its two attempts. Exhaustion marks the
//! passage `unresolved` and attaches exactly one `uncertain_translation` flag.

use crate::capability::{CapabilityError, Translator};
use crate::error::{CurationError, CurationResult};
use crate::model::vocabulary::UNCERTAIN_TRANSLATION;
use crate::model::*;
use crate::quality::{assess_excerpt, QualitySettings};
use crate::store::{insert_audit, jobs, passages, proposals, ReprocessFilter, SqliteStore, StorageError};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{error, info, warn};

pub const REPROCESS_MAX_ATTEMPTS: u32 = 2;

/// Minimum token overlap for a sibling passage to count as an alternate variant.
pub const SIBLING_MIN_SIMILARITY: f64 = 0.12;

const ORIGINAL_VARIANT: &str = "original_excerpt";

/// Result of asking for a passage to be reprocessed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequeueOutcome {
    Queued(ReprocessJob),
    /// The passage already has a pending or running job.
    AlreadyOpen(ReprocessJob),
    /// The automatic trigger for this passage fired before.
    AlreadyTriggered(ReprocessJob),
    /// Attempts are exhausted; the passage carries an uncertain-translation flag.
    Unresolved { flag_id: FlagId },
}

/// Queue a passage for reprocessing.
pub fn requeue(
    store: &SqliteStore,
    passage_id: &PassageId,
    trigger_mode: ReprocessTriggerMode,
    reason_code: &str,
    notes: Option<&str>,
    actor: &str,
) -> CurationResult<RequeueOutcome> {
    store.transaction(|tx| enqueue(tx, passage_id, trigger_mode, reason_code, notes, actor))
}

/// Queue inside an existing transaction.
///
/// Automatic triggers use one idempotency key per passage, so a passage is
/// auto-queued at most once no matter how often it is re-extracted.
pub(crate) fn enqueue(
    conn: &Connection,
    passage_id: &PassageId,
    trigger_mode: ReprocessTriggerMode,
    reason_code: &str,
    notes: Option<&str>,
    actor: &str,
) -> CurationResult<RequeueOutcome> {
    if reason_code.trim().is_empty() {
        return Err(CurationError::validation("trigger_reason_code", "a reason code is required"));
    }
    let passage = passages::find_passage(conn, passage_id)?
        .ok_or_else(|| CurationError::not_found("passage", passage_id.as_str()))?;
    let now = Utc::now();

    if passage.translation_status == TranslationStatus::Unresolved {
        let flag_id = ensure_uncertain_flag(conn, passage_id, actor, now)?;
        return Ok(RequeueOutcome::Unresolved { flag_id });
    }
    if let Some(open) = jobs::find_open_reprocess(conn, passage_id)? {
        return Ok(RequeueOutcome::AlreadyOpen(open));
    }

    let job_id = ReprocessJobId::new();
    let idempotency_key = match trigger_mode {
        ReprocessTriggerMode::AutoThreshold => format!("reprocess:auto:{}", passage_id),
        ReprocessTriggerMode::Manual => format!("reprocess:manual:{}:{}", passage_id, job_id),
    };
    if let Some(existing) = jobs::find_reprocess_by_key(conn, &idempotency_key)? {
        return Ok(RequeueOutcome::AlreadyTriggered(existing));
    }

    let job = ReprocessJob {
        job_id,
        passage_id: passage_id.clone(),
        status: ReprocessStatus::Pending,
        trigger_mode,
        trigger_reason_code: reason_code.to_string(),
        notes: notes.map(str::to_string),
        idempotency_key,
        attempt_count: 0,
        max_attempts: REPROCESS_MAX_ATTEMPTS,
        error_code: None,
        claimed_at: None,
        created_at: now,
        updated_at: now,
    };
    jobs::insert_reprocess_job(conn, &job)?;
    insert_audit(
        conn,
        &AuditEvent::new(actor, "reprocess_queued", "reprocess_job", job.job_id.as_str())
            .with_transition(None, Some(ReprocessStatus::Pending.as_str()))
            .with_correlation(passage_id.as_str())
            .with_details(serde_json::json!({
                "trigger_mode": trigger_mode,
                "reason_code": reason_code,
            })),
    )?;
    info!(job_id = %job.job_id, passage_id = %passage_id, mode = %trigger_mode, reason = reason_code, "reprocess queued");
    Ok(RequeueOutcome::Queued(job))
}

/// The passage's `uncertain_translation` flag, created on first use.
pub(crate) fn ensure_uncertain_flag(
    conn: &Connection,
    passage_id: &PassageId,
    actor: &str,
    now: DateTime<Utc>,
) -> CurationResult<FlagId> {
    if let Some(existing) = proposals::flags_for_passage(conn, passage_id, UNCERTAIN_TRANSLATION)?
        .into_iter()
        .next()
    {
        return Ok(existing.flag_id);
    }

    let flag_id = FlagId::new();
    let trace = proposals::internal_trace(
        "flag",
        flag_id.as_str(),
        "reprocess_exhausted",
        format!("reprocess_exhausted:{}", passage_id),
        "reprocess_queue",
        now,
    );
    proposals::insert_trace(conn, &trace)?;
    proposals::insert_flag(
        conn,
        &Flag {
            flag_id: flag_id.clone(),
            flag_type: UNCERTAIN_TRANSLATION.to_string(),
            severity: "high".to_string(),
            rationale: "Translation stayed above the untranslated threshold after all reprocess attempts."
                .to_string(),
            evidence_ids: vec![passage_id.clone()],
            trace_id: trace.trace_id,
            reviewer_state: ReviewerState::Proposed,
            publish_state: PublishState::Blocked,
            created_at: now,
        },
    )?;
    insert_audit(
        conn,
        &AuditEvent::new(actor, "create", "flag", flag_id.as_str())
            .with_transition(None, Some(ReviewerState::Proposed.as_str()))
            .with_correlation(passage_id.as_str()),
    )?;
    Ok(flag_id)
}

// === Running jobs ===

/// What one claimed reprocess job did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReprocessRun {
    /// The job after the attempt was recorded
    pub job: ReprocessJob,
    pub revisions: Vec<TranslationRevision>,
    pub accepted: bool,
}

fn variant_tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|word| {
            word.trim_matches(|c: char| ".,:;!?()[]{}<>\"'".contains(c))
                .to_lowercase()
        })
        .filter(|word| word.chars().count() > 2)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    a.intersection(b).count() as f64 / a.union(b).count() as f64
}

/// Closest passage of the same text in a different source.
fn sibling_variant(conn: &Connection, passage: &Passage) -> CurationResult<Option<(PassageId, String)>> {
    let own = variant_tokens(&passage.original_excerpt);
    let best = passages::passages_for_text(conn, &passage.text_id)?
        .into_iter()
        .filter(|other| other.source_id != passage.source_id)
        .map(|other| {
            let score = jaccard(&own, &variant_tokens(&other.original_excerpt));
            (score, other)
        })
        .filter(|(score, _)| *score >= SIBLING_MIN_SIMILARITY)
        .max_by(|a, b| a.0.total_cmp(&b.0));
    Ok(best.map(|(_, other)| (other.passage_id, other.original_excerpt)))
}

/// Claim the oldest pending reprocess job and run one attempt.
///
/// Once a job is claimed it always leaves `running`: an error anywhere in the
/// attempt is recorded against the job, which returns to `pending` or, on its
/// last attempt, ends `unresolved`.
pub async fn run_next(
    store: &SqliteStore,
    translator: &dyn Translator,
    settings: &QualitySettings,
    actor: &str,
) -> CurationResult<Option<ReprocessRun>> {
    let Some(job) = store.transaction(|tx| jobs::claim_next_reprocess(tx, Utc::now()))? else {
        return Ok(None);
    };
    let err = match attempt(store, translator, settings, &job, actor).await {
        Ok(run) => return Ok(Some(run)),
        Err(err) => err,
    };
    let current = store.read(|conn| jobs::get_reprocess_job(conn, &job.job_id))?;
    let job = if current.status == ReprocessStatus::Running && current.claimed_at == job.claimed_at {
        warn!(job_id = %job.job_id, passage_id = %job.passage_id, error = %err, "reprocess attempt failed");
        store.transaction(|tx| abandon(tx, &job, err.code(), actor))?
    } else {
        warn!(job_id = %job.job_id, status = %current.status, error = %err, "reprocess claim lost; attempt discarded");
        current
    };
    Ok(Some(ReprocessRun {
        job,
        revisions: Vec::new(),
        accepted: false,
    }))
}

async fn attempt(
    store: &SqliteStore,
    translator: &dyn Translator,
    settings: &QualitySettings,
    job: &ReprocessJob,
    actor: &str,
) -> CurationResult<ReprocessRun> {
    let attempt_number = job.attempt_count + 1;

    let Some(passage) = store.read(|conn| passages::find_passage(conn, &job.passage_id))? else {
        warn!(job_id = %job.job_id, passage_id = %job.passage_id, "reprocess target is missing");
        let job = store.transaction(|tx| -> CurationResult<ReprocessJob> {
            finish(tx, job, ReprocessStatus::Failed, attempt_number, Some("passage_missing"), actor)
        })?;
        return Ok(ReprocessRun {
            job,
            revisions: Vec::new(),
            accepted: false,
        });
    };

    let mut variants = vec![(ORIGINAL_VARIANT.to_string(), passage.original_excerpt.clone())];
    if let Some((sibling_id, text)) = store.read(|conn| sibling_variant(conn, &passage))? {
        variants.push((format!("sibling:{}", sibling_id), text));
    }

    let mut revisions = Vec::new();
    let mut accepted_update = None;
    let mut error_code = "untranslated_ratio_exceeded";
    for (variant, text) in variants {
        let update = match assess_excerpt(translator, &text, settings).await {
            Ok(update) => update,
            Err(err) => {
                warn!(job_id = %job.job_id, variant = %variant, error = %err, "translator failed on variant");
                error_code = match err {
                    CapabilityError::InvalidOutput(_) => "invalid_translation",
                    _ => "capability_failure",
                };
                continue;
            }
        };
        let accepted = update.untranslated_ratio <= settings.untranslated_ratio_threshold;
        revisions.push(TranslationRevision {
            revision_id: RevisionId::new(),
            passage_id: passage.passage_id.clone(),
            reprocess_job_id: job.job_id.clone(),
            attempt_number,
            source_variant: variant,
            before_text: passage.normalized_excerpt.clone(),
            after_text: update.normalized_excerpt.clone(),
            before_ratio: passage.untranslated_ratio,
            after_ratio: update.untranslated_ratio,
            detected_language: update.detected_language.clone(),
            accepted,
            created_at: Utc::now(),
        });
        if accepted {
            accepted_update = Some(update);
            break;
        }
    }

    let accepted = accepted_update.is_some();
    let job = store.transaction(|tx| -> CurationResult<ReprocessJob> {
        for revision in &revisions {
            jobs::insert_revision(tx, revision)?;
        }
        let now = Utc::now();
        match accepted_update {
            Some(update) => {
                let update = QualityUpdate {
                    translation_status: TranslationStatus::Translated,
                    ..update
                };
                passages::update_quality(tx, &passage.passage_id, &update, now)?;
                insert_audit(
                    tx,
                    &AuditEvent::new(actor, "quality_update", "passage", passage.passage_id.as_str())
                        .with_transition(
                            Some(passage.translation_status.as_str()),
                            Some(TranslationStatus::Translated.as_str()),
                        )
                        .with_correlation(job.job_id.as_str())
                        .with_details(serde_json::json!({
                            "before_ratio": passage.untranslated_ratio,
                            "after_ratio": update.untranslated_ratio,
                            "quality_version": settings.quality_version,
                        })),
                )?;
                finish(tx, job, ReprocessStatus::Completed, attempt_number, None, actor)
            }
            None if attempt_number >= job.max_attempts => exhaust(tx, job, &passage, error_code, actor),
            None => finish(tx, job, ReprocessStatus::Pending, attempt_number, Some(error_code), actor),
        }
    })?;

    info!(
        job_id = %job.job_id,
        passage_id = %job.passage_id,
        status = %job.status,
        attempt = attempt_number,
        quality_version = %settings.quality_version,
        "reprocess attempt finished"
    );
    Ok(ReprocessRun {
        job,
        revisions,
        accepted,
    })
}

/// Last attempt used up: the passage becomes `unresolved` and gets its flag.
fn exhaust(
    conn: &Connection,
    job: &ReprocessJob,
    passage: &Passage,
    error_code: &str,
    actor: &str,
) -> CurationResult<ReprocessJob> {
    let now = Utc::now();
    passages::set_translation_status(conn, &passage.passage_id, TranslationStatus::Unresolved, now)?;
    insert_audit(
        conn,
        &AuditEvent::new(actor, "quality_update", "passage", passage.passage_id.as_str())
            .with_transition(
                Some(passage.translation_status.as_str()),
                Some(TranslationStatus::Unresolved.as_str()),
            )
            .with_correlation(job.job_id.as_str()),
    )?;
    ensure_uncertain_flag(conn, &passage.passage_id, actor, now)?;
    finish(conn, job, ReprocessStatus::Unresolved, job.attempt_count + 1, Some(error_code), actor)
}

/// Close a claimed job whose attempt could not run to the end.
fn abandon(conn: &Connection, job: &ReprocessJob, error_code: &str, actor: &str) -> CurationResult<ReprocessJob> {
    let attempt_number = job.attempt_count + 1;
    if attempt_number < job.max_attempts {
        return finish(conn, job, ReprocessStatus::Pending, attempt_number, Some(error_code), actor);
    }
    match passages::find_passage(conn, &job.passage_id)? {
        Some(passage) => exhaust(conn, job, &passage, error_code, actor),
        None => finish(conn, job, ReprocessStatus::Failed, attempt_number, Some("passage_missing"), actor),
    }
}

/// Return reprocess jobs whose claim is older than `timeout`.
///
/// A claim that outlives its worker counts as a failed attempt with code
/// `timeout`, so a job that keeps hanging still exhausts its attempts.
pub fn sweep_stale(store: &SqliteStore, timeout: Duration, actor: &str) -> CurationResult<Vec<ReprocessJob>> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(timeout)
            .map_err(|_| CurationError::validation("timeout", "reprocess timeout is out of range"))?;
    let stale = store.read(|conn| jobs::stale_running_reprocess(conn, cutoff))?;
    let mut swept = Vec::with_capacity(stale.len());
    for job in stale {
        match store.transaction(|tx| abandon(tx, &job, "timeout", actor)) {
            Ok(job) => {
                warn!(job_id = %job.job_id, status = %job.status, "reclaimed stale reprocess job");
                swept.push(job);
            }
            // finished or re-claimed between the scan and this write
            Err(CurationError::Storage(StorageError::Conflict(reason))) => {
                info!(job_id = %job.job_id, %reason, "stale reprocess job moved on");
            }
            Err(err) => {
                error!(job_id = %job.job_id, error = %err, "failed to sweep stale reprocess job");
                return Err(err);
            }
        }
    }
    Ok(swept)
}

fn finish(
    conn: &Connection,
    job: &ReprocessJob,
    next_status: ReprocessStatus,
    attempt_count: u32,
    error_code: Option<&str>,
    actor: &str,
) -> CurationResult<ReprocessJob> {
    let Some(claimed_at) = job.claimed_at else {
        return Err(StorageError::Conflict(format!("reprocess job {} carries no claim", job.job_id)).into());
    };
    let now = Utc::now();
    let changed =
        jobs::finish_reprocess_attempt(conn, &job.job_id, claimed_at, next_status, attempt_count, error_code, now)?;
    if changed == 0 {
        return Err(StorageError::Conflict(format!(
            "reprocess job {} is no longer held by this claim",
            job.job_id
        ))
        .into());
    }
    insert_audit(
        conn,
        &AuditEvent::new(actor, "reprocess_attempt", "reprocess_job", job.job_id.as_str())
            .with_transition(Some(ReprocessStatus::Running.as_str()), Some(next_status.as_str()))
            .with_correlation(job.passage_id.as_str())
            .with_details(serde_json::json!({
                "attempt": attempt_count,
                "error_code": error_code,
            })),
    )?;
    Ok(jobs::get_reprocess_job(conn, &job.job_id)?)
}

// === Inspection ===

pub fn list(store: &SqliteStore, filter: &ReprocessFilter) -> CurationResult<Vec<ReprocessJob>> {
    Ok(store.read(|conn| jobs::list_reprocess_jobs(conn, filter))?)
}

/// Quality fields, reprocess history and flags of one passage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySummary {
    pub passage_id: PassageId,
    pub translation_status: TranslationStatus,
    pub detected_language: String,
    pub untranslated_ratio: f64,
    pub usability_score: f64,
    pub relevance_score: f64,
    pub relevance_state: RelevanceState,
    pub jobs: Vec<ReprocessJob>,
    pub revisions: Vec<TranslationRevision>,
    pub uncertain_flags: Vec<FlagId>,
}

pub fn quality_summary(store: &SqliteStore, passage_id: &PassageId) -> CurationResult<QualitySummary> {
    store.read(|conn| {
        let passage = passages::find_passage(conn, passage_id)?
            .ok_or_else(|| CurationError::not_found("passage", passage_id.as_str()))?;
        let jobs = jobs::list_reprocess_jobs(conn, &ReprocessFilter::new().with_passage(passage_id.clone()))?;
        let revisions = jobs::revisions_for_passage(conn, passage_id)?;
        let uncertain_flags = proposals::flags_for_passage(conn, passage_id, UNCERTAIN_TRANSLATION)?
            .into_iter()
            .map(|flag| flag.flag_id)
            .collect();
        Ok(QualitySummary {
            passage_id: passage.passage_id,
            translation_status: passage.translation_status,
            detected_language: passage.detected_language,
            untranslated_ratio: passage.untranslated_ratio,
            usability_score: passage.usability_score,
            relevance_score: passage.relevance_score,
            relevance_state: passage.relevance_state,
            jobs,
            revisions,
            uncertain_flags,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Assessment, CapabilityError};
    use crate::store::{count_audit_events, sources, OpenStore};
    use async_trait::async_trait;

    /// Translator that never gets below the threshold.
    struct Stubborn;

    #[async_trait]
    impl Translator for Stubborn {
        fn name(&self) -> &str {
            "stubborn"
        }

        async fn assess(&self, text: &str) -> Result<Assessment, CapabilityError> {
            Ok(Assessment {
                translated_text: text.to_string(),
                detected_language: "lat".into(),
                confidence: 0.6,
                untranslated_ratio: 0.5,
            })
        }
    }

    /// Translator that succeeds on any text.
    struct Fluent;

    #[async_trait]
    impl Translator for Fluent {
        fn name(&self) -> &str {
            "fluent"
        }

        async fn assess(&self, text: &str) -> Result<Assessment, CapabilityError> {
            Ok(Assessment {
                translated_text: format!("translated: {}", text),
                detected_language: "lat".into(),
                confidence: 0.9,
                untranslated_ratio: 0.05,
            })
        }
    }

    fn store_with_passage(excerpt: &str) -> (SqliteStore, Passage) {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = Utc::now();
        let text_id = TextId::new();
        let source_id = SourceId::new();
        let passage = Passage {
            passage_id: PassageId::new(),
            source_id: source_id.clone(),
            text_id: text_id.clone(),
            locator: "p1:l1-1".into(),
            original_excerpt: excerpt.into(),
            normalized_excerpt: excerpt.into(),
            detected_language: "lat".into(),
            language_confidence: 0.6,
            translation_status: TranslationStatus::NeedsReprocess,
            untranslated_ratio: 0.35,
            usability_score: 0.9,
            relevance_score: 0.7,
            relevance_state: RelevanceState::Accepted,
            reviewer_state: ReviewerState::Proposed,
            publish_state: PublishState::Blocked,
            created_at: now,
            updated_at: now,
        };
        store
            .transaction(|tx| -> CurationResult<()> {
                sources::insert_text(
                    tx,
                    &Text {
                        text_id: text_id.clone(),
                        title: "Carmen".into(),
                        origin_region: None,
                        tradition_tags: vec![],
                        created_at: now,
                    },
                )?;
                sources::insert_source(
                    tx,
                    &Source {
                        source_id: source_id.clone(),
                        text_id: text_id.clone(),
                        locator: "carmen.txt".into(),
                        format_hint: "txt".into(),
                        source_sha256: "c".repeat(64),
                        normalized_sha256: "d".repeat(64),
                        witness_group_id: None,
                        is_duplicate_of: None,
                        created_at: now,
                    },
                )?;
                passages::insert_passage_if_absent(tx, &passage)?;
                Ok(())
            })
            .unwrap();
        (store, passage)
    }

    #[test]
    fn manual_requeue_is_not_doubled_while_open() {
        let (store, passage) = store_with_passage("vinum libamus");
        let first = requeue(&store, &passage.passage_id, ReprocessTriggerMode::Manual, "operator", None, "ops").unwrap();
        let second = requeue(&store, &passage.passage_id, ReprocessTriggerMode::Manual, "operator", None, "ops").unwrap();
        assert!(matches!(first, RequeueOutcome::Queued(_)));
        assert!(matches!(second, RequeueOutcome::AlreadyOpen(_)));
        assert_eq!(list(&store, &ReprocessFilter::new()).unwrap().len(), 1);
    }

    #[test]
    fn missing_passage_is_referential() {
        let (store, _) = store_with_passage("vinum libamus");
        let err = requeue(
            &store,
            &PassageId::from_string("psg_missing"),
            ReprocessTriggerMode::Manual,
            "operator",
            None,
            "ops",
        )
        .unwrap_err();
        assert_eq!(err.code(), "referential_error");
    }

    #[tokio::test]
    async fn accepted_attempt_updates_passage() {
        let (store, passage) = store_with_passage("vinum libamus");
        requeue(&store, &passage.passage_id, ReprocessTriggerMode::Manual, "operator", None, "ops").unwrap();

        let run = run_next(&store, &Fluent, &QualitySettings::default(), "worker").await.unwrap().unwrap();
        assert!(run.accepted);
        assert_eq!(run.job.status, ReprocessStatus::Completed);
        assert_eq!(run.revisions.len(), 1);
        assert_eq!(run.revisions[0].source_variant, "original_excerpt");

        let summary = quality_summary(&store, &passage.passage_id).unwrap();
        assert_eq!(summary.translation_status, TranslationStatus::Translated);
        assert_eq!(summary.untranslated_ratio, 0.05);
        assert!(summary.uncertain_flags.is_empty());
    }

    // === Scenario: exhausted attempts leave the passage unresolved with one flag ===
    #[tokio::test]
    async fn exhaustion_marks_unresolved_and_flags_once() {
        let (store, passage) = store_with_passage("vinum libamus");
        requeue(&store, &passage.passage_id, ReprocessTriggerMode::AutoThreshold, "untranslated_ratio", None, "ops")
            .unwrap();

        let first = run_next(&store, &Stubborn, &QualitySettings::default(), "worker").await.unwrap().unwrap();
        assert_eq!(first.job.status, ReprocessStatus::Pending);
        assert_eq!(first.job.attempt_count, 1);

        let second = run_next(&store, &Stubborn, &QualitySettings::default(), "worker").await.unwrap().unwrap();
        assert_eq!(second.job.status, ReprocessStatus::Unresolved);
        assert_eq!(second.job.attempt_count, 2);
        assert!(run_next(&store, &Stubborn, &QualitySettings::default(), "worker").await.unwrap().is_none());

        // a third trigger does not queue; it reuses the existing flag
        let third = requeue(&store, &passage.passage_id, ReprocessTriggerMode::Manual, "operator", None, "ops").unwrap();
        let flag_id = match &third {
            RequeueOutcome::Unresolved { flag_id } => flag_id.clone(),
            other => panic!("expected unresolved, got {:?}", other),
        };

        let summary = quality_summary(&store, &passage.passage_id).unwrap();
        assert_eq!(summary.translation_status, TranslationStatus::Unresolved);
        assert_eq!(summary.uncertain_flags, vec![flag_id.clone()]);
        assert_eq!(summary.jobs.len(), 1);
        assert_eq!(summary.revisions.len(), 2);

        let flag = store
            .read(|conn| proposals::find_flag(conn, &flag_id))
            .unwrap()
            .unwrap();
        assert_eq!(flag.severity, "high");
        assert_eq!(flag.evidence_ids, vec![passage.passage_id.clone()]);
        assert_eq!(
            store.read(|conn| count_audit_events(conn, flag_id.as_str(), "create")).unwrap(),
            1
        );
    }

    fn job_for(store: &SqliteStore, passage: &Passage) -> ReprocessJob {
        list(store, &ReprocessFilter::new().with_passage(passage.passage_id.clone()))
            .unwrap()
            .remove(0)
    }

    // === Scenario: an error after the claim never strands a running job ===
    #[tokio::test]
    async fn storage_failure_mid_attempt_returns_job_to_pending() {
        let (store, passage) = store_with_passage("vinum libamus");
        requeue(&store, &passage.passage_id, ReprocessTriggerMode::Manual, "operator", None, "ops").unwrap();
        store
            .read(|c| {
                c.execute_batch(
                    "CREATE TRIGGER refuse_revisions BEFORE INSERT ON translation_revisions \
                     BEGIN SELECT RAISE(ABORT, 'revisions are frozen'); END;",
                )
            })
            .unwrap();

        let run = run_next(&store, &Fluent, &QualitySettings::default(), "worker").await.unwrap().unwrap();
        assert!(!run.accepted);
        assert_eq!(run.job.status, ReprocessStatus::Pending);
        assert_eq!(run.job.attempt_count, 1);
        assert_eq!(run.job.claimed_at, None);
        assert!(run.job.error_code.is_some());

        let summary = quality_summary(&store, &passage.passage_id).unwrap();
        assert_eq!(summary.translation_status, TranslationStatus::NeedsReprocess);
        assert!(summary.revisions.is_empty());

        store.read(|c| c.execute_batch("DROP TRIGGER refuse_revisions")).unwrap();
        let retry = run_next(&store, &Fluent, &QualitySettings::default(), "worker").await.unwrap().unwrap();
        assert!(retry.accepted);
        assert_eq!(retry.job.status, ReprocessStatus::Completed);
        assert_eq!(retry.job.attempt_count, 2);
    }

    #[tokio::test]
    async fn out_of_range_assessment_is_an_invalid_translation() {
        struct Overconfident;

        #[async_trait]
        impl Translator for Overconfident {
            fn name(&self) -> &str {
                "overconfident"
            }

            async fn assess(&self, text: &str) -> Result<Assessment, CapabilityError> {
                Ok(Assessment {
                    translated_text: text.to_string(),
                    detected_language: "lat".into(),
                    confidence: 1.5,
                    untranslated_ratio: 0.0,
                })
            }
        }

        let (store, passage) = store_with_passage("vinum libamus");
        requeue(&store, &passage.passage_id, ReprocessTriggerMode::Manual, "operator", None, "ops").unwrap();

        let run = run_next(&store, &Overconfident, &QualitySettings::default(), "worker")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.job.status, ReprocessStatus::Pending);
        assert_eq!(run.job.error_code.as_deref(), Some("invalid_translation"));
        assert!(run.revisions.is_empty());
        let stored = store.read(|c| passages::get_passage(c, &passage.passage_id)).unwrap();
        assert_eq!(stored.language_confidence, 0.6);
    }

    #[tokio::test]
    async fn ratio_threshold_comes_from_the_settings() {
        let (store, passage) = store_with_passage("vinum libamus");
        requeue(&store, &passage.passage_id, ReprocessTriggerMode::Manual, "operator", None, "ops").unwrap();
        let strict = QualitySettings {
            untranslated_ratio_threshold: 0.01,
            ..QualitySettings::default()
        };

        let run = run_next(&store, &Fluent, &strict, "worker").await.unwrap().unwrap();
        assert!(!run.accepted);
        assert_eq!(run.job.status, ReprocessStatus::Pending);
        assert_eq!(run.revisions.len(), 1);
        assert!(!run.revisions[0].accepted);
    }

    // === Scenario: a worker dies holding a reprocess claim ===
    #[tokio::test]
    async fn stale_claims_are_swept_until_exhausted() {
        let (store, passage) = store_with_passage("vinum libamus");
        requeue(&store, &passage.passage_id, ReprocessTriggerMode::Manual, "operator", None, "ops").unwrap();

        store.transaction(|tx| jobs::claim_next_reprocess(tx, Utc::now())).unwrap().unwrap();
        assert!(sweep_stale(&store, Duration::from_secs(3600), "sweeper").unwrap().is_empty());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let swept = sweep_stale(&store, Duration::ZERO, "sweeper").unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status, ReprocessStatus::Pending);
        assert_eq!(swept[0].attempt_count, 1);
        assert_eq!(swept[0].error_code.as_deref(), Some("timeout"));

        store.transaction(|tx| jobs::claim_next_reprocess(tx, Utc::now())).unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let swept = sweep_stale(&store, Duration::ZERO, "sweeper").unwrap();
        assert_eq!(swept[0].status, ReprocessStatus::Unresolved);
        assert_eq!(swept[0].attempt_count, 2);

        let summary = quality_summary(&store, &passage.passage_id).unwrap();
        assert_eq!(summary.translation_status, TranslationStatus::Unresolved);
        assert_eq!(summary.uncertain_flags.len(), 1);
        assert!(run_next(&store, &Fluent, &QualitySettings::default(), "worker").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_claimant_cannot_finish_a_reclaimed_job() {
        let (store, passage) = store_with_passage("vinum libamus");
        requeue(&store, &passage.passage_id, ReprocessTriggerMode::Manual, "operator", None, "ops").unwrap();

        let stale = store.transaction(|tx| jobs::claim_next_reprocess(tx, Utc::now())).unwrap().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        sweep_stale(&store, Duration::ZERO, "sweeper").unwrap();
        let fresh = store.transaction(|tx| jobs::claim_next_reprocess(tx, Utc::now())).unwrap().unwrap();
        assert_ne!(fresh.claimed_at, stale.claimed_at);

        let err = store
            .transaction(|tx| finish(tx, &stale, ReprocessStatus::Completed, 1, None, "late"))
            .unwrap_err();
        assert_eq!(err.code(), "conflict");
        let current = job_for(&store, &passage);
        assert_eq!(current.status, ReprocessStatus::Running);
        assert_eq!(current.attempt_count, 1);

        let done = store
            .transaction(|tx| finish(tx, &fresh, ReprocessStatus::Completed, 2, None, "worker"))
            .unwrap();
        assert_eq!(done.status, ReprocessStatus::Completed);
        assert_eq!(done.claimed_at, None);
        assert_eq!(
            store.read(|c| count_audit_events(c, done.job_id.as_str(), "reprocess_attempt")).unwrap(),
            2
        );
    }

    #[test]
    fn variant_tokens_strip_punctuation() {
        let tokens = variant_tokens("The (Altar), at DAWN!");
        assert!(tokens.contains("altar"));
        assert!(tokens.contains("dawn"));
        assert!(tokens.contains("the"));
        assert!(!tokens.contains("at"));
    }
}
