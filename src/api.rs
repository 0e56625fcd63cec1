//! Transport-independent API layer.
//!
//! `CurationApi` is the single entry point for consumer-facing operations. A CLI,
//! an HTTP layer or a test harness calls these methods and never reaches into the
//! store or the pipeline components directly. Every failure crosses this boundary
//! as an [`ErrorReport`], never as a raw internal error.

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::dedup::{self, BatchReport, Registrar, Registration, SourceInput};
use crate::error::{CurationError, ErrorReport, JobFailure, ProcessingError};
use crate::ingest::{Capabilities, CycleReport, JobEngine, RequeueTarget, Worker};
use crate::model::*;
use crate::proposal::{LinkDisposition, ProposalGenerator, ProposalOutcome};
use crate::quality::extraction::ExtractionSummary;
use crate::quality::{Extraction, QualitySettings};
use crate::reprocess::{self, QualitySummary, ReprocessRun, RequeueOutcome};
use crate::review::{self, BulkReport, PublishOutcome, ReviewQueue, Reviewable};
use crate::store::{
    jobs, proposals, sources, tuning as tuning_store, witness as witness_store, ReprocessFilter, SqliteStore,
};
use crate::tuning;
use crate::witness::{self, ConsolidationReport};

pub type ApiResult<T> = Result<T, ErrorReport>;

fn processing_report(err: &ProcessingError) -> ErrorReport {
    match err {
        ProcessingError::Curation(inner) => inner.report(),
        other => {
            let failure = JobFailure::from(other);
            ErrorReport {
                error_code: "transient_processing_error".to_string(),
                details: serde_json::json!({
                    "code": failure.error_code,
                    "context": failure.error_context,
                    "parser_name": failure.parser_name,
                }),
            }
        }
    }
}

/// Single entry point for all consumer-facing operations.
#[derive(Clone)]
pub struct CurationApi {
    store: Arc<SqliteStore>,
    capabilities: Capabilities,
    config: PipelineConfig,
}

impl CurationApi {
    pub fn new(store: Arc<SqliteStore>, capabilities: Capabilities, config: PipelineConfig) -> Self {
        Self {
            store,
            capabilities,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A worker sharing this API's store, capabilities and configuration.
    pub fn worker(&self) -> Worker {
        Worker::new(self.store.clone(), self.capabilities.clone(), self.config.clone())
    }

    fn engine(&self, actor: &str) -> JobEngine<'_> {
        JobEngine::new(&self.store, &self.config).with_actor(actor)
    }

    // --- Registration ---

    pub async fn register_source(&self, input: &SourceInput, actor: &str) -> ApiResult<Registration> {
        Ok(Registrar::new(&self.store, self.capabilities.parser.as_ref(), &self.config)
            .with_actor(actor)
            .register(input)
            .await?)
    }

    /// Register many sources. Individual failures are reported per item.
    pub async fn register_batch(&self, inputs: &[SourceInput], actor: &str) -> BatchReport {
        Registrar::new(&self.store, self.capabilities.parser.as_ref(), &self.config)
            .with_actor(actor)
            .register_batch(inputs)
            .await
    }

    pub fn link_duplicate(&self, source_id: &str, canonical_id: &str, actor: &str) -> ApiResult<Source> {
        Ok(dedup::link_duplicate(
            &self.store,
            &SourceId::from_string(source_id),
            &SourceId::from_string(canonical_id),
            actor,
        )?)
    }

    pub fn promote_primary(&self, group_id: &str, source_id: &str, actor: &str) -> ApiResult<Vec<WitnessMember>> {
        Ok(dedup::promote_primary(
            &self.store,
            &GroupId::from_string(group_id),
            &SourceId::from_string(source_id),
            actor,
        )?)
    }

    // --- Ingestion jobs ---

    pub fn enqueue_job(&self, source_id: &str, idempotency_key: Option<&str>, actor: &str) -> ApiResult<IngestionJob> {
        Ok(self
            .engine(actor)
            .enqueue(&SourceId::from_string(source_id), idempotency_key)?)
    }

    pub fn claim_job(&self, actor: &str) -> ApiResult<Option<IngestionJob>> {
        Ok(self.engine(actor).claim_next()?)
    }

    /// Complete a job returned by [`CurationApi::claim_job`]. A claim that was swept
    /// as stale reports `conflict`.
    pub fn complete_job(&self, claim: &IngestionJob, details: serde_json::Value, actor: &str) -> ApiResult<IngestionJob> {
        Ok(self.engine(actor).complete(claim, details)?)
    }

    pub fn fail_job(
        &self,
        claim: &IngestionJob,
        error_code: &str,
        error_context: serde_json::Value,
        actor: &str,
    ) -> ApiResult<IngestionJob> {
        if error_code.trim().is_empty() {
            return Err(CurationError::validation("error_code", "must not be empty").into());
        }
        Ok(self
            .engine(actor)
            .fail(claim, &JobFailure::new(error_code, error_context))?)
    }

    /// Requeue one dead-letter job, or all of them when `job_id` is `None`.
    pub fn requeue_dead_letter(&self, job_id: Option<&str>, reason: &str, actor: &str) -> ApiResult<Vec<IngestionJob>> {
        let target = match job_id {
            Some(id) => RequeueTarget::One(JobId::from_string(id)),
            None => RequeueTarget::All,
        };
        Ok(self.engine(actor).requeue_dead_letter(&target, reason)?)
    }

    pub fn job(&self, job_id: &str) -> ApiResult<IngestionJob> {
        Ok(self.engine(&self.config.operator_id).get(&JobId::from_string(job_id))?)
    }

    pub fn jobs_with_status(&self, status: JobStatus) -> ApiResult<Vec<IngestionJob>> {
        Ok(self
            .store
            .read(|c| jobs::jobs_with_status(c, status))
            .map_err(CurationError::from)?)
    }

    /// Run one worker cycle in-process.
    pub async fn run_cycle(&self) -> ApiResult<CycleReport> {
        Ok(self.worker().run_cycle().await?)
    }

    // --- Extraction & reprocess ---

    /// Extract passage evidence from a registered source outside the job queue.
    pub async fn extract_passages(&self, source_id: &str) -> ApiResult<ExtractionSummary> {
        let source = self
            .store
            .read(|c| sources::get_source(c, &SourceId::from_string(source_id)))
            .map_err(CurationError::from)?;
        let text = self
            .capabilities
            .load_text(&source)
            .await
            .map_err(|e| processing_report(&e))?;
        let settings = tuning::active_settings(&self.store, &self.config, &self.config.operator_id)?;
        Extraction::new(
            &self.store,
            self.capabilities.translator.as_ref(),
            source,
            text,
            &settings,
            &self.config.operator_id,
        )
        .drain()
        .await
        .map_err(|e| processing_report(&e))
    }

    pub fn requeue_passage(
        &self,
        passage_id: &str,
        trigger_mode: ReprocessTriggerMode,
        reason_code: &str,
        notes: Option<&str>,
        actor: &str,
    ) -> ApiResult<RequeueOutcome> {
        Ok(reprocess::requeue(
            &self.store,
            &PassageId::from_string(passage_id),
            trigger_mode,
            reason_code,
            notes,
            actor,
        )?)
    }

    pub async fn run_reprocess_next(&self, actor: &str) -> ApiResult<Option<ReprocessRun>> {
        let settings = tuning::active_settings(&self.store, &self.config, actor)?;
        Ok(reprocess::run_next(&self.store, self.capabilities.translator.as_ref(), &settings, actor).await?)
    }

    /// Return reprocess jobs whose claim outlived the configured job timeout.
    pub fn sweep_stale_reprocess(&self, actor: &str) -> ApiResult<Vec<ReprocessJob>> {
        let timeout = std::time::Duration::from_secs(self.config.job_timeout_secs);
        Ok(reprocess::sweep_stale(&self.store, timeout, actor)?)
    }

    pub fn list_reprocess(&self, filter: &ReprocessFilter) -> ApiResult<Vec<ReprocessJob>> {
        Ok(reprocess::list(&self.store, filter)?)
    }

    pub fn quality_summary(&self, passage_id: &str) -> ApiResult<QualitySummary> {
        Ok(reprocess::quality_summary(&self.store, &PassageId::from_string(passage_id))?)
    }

    // --- Tuning profiles ---

    pub fn list_profiles(&self) -> ApiResult<Vec<TuningProfile>> {
        Ok(tuning::list_profiles(&self.store)?)
    }

    /// The default profile, seeded on first use.
    pub fn default_profile(&self, actor: &str) -> ApiResult<TuningProfile> {
        Ok(tuning::ensure_default_profile(&self.store, &self.config, actor)?)
    }

    pub fn create_profile(&self, draft: &ProfileDraft, make_default: bool, actor: &str) -> ApiResult<TuningProfile> {
        Ok(tuning::create_profile(&self.store, draft, make_default, actor)?)
    }

    pub fn update_profile(&self, profile_id: &str, draft: &ProfileDraft, actor: &str) -> ApiResult<TuningProfile> {
        Ok(tuning::update_profile(&self.store, profile_id, draft, actor)?)
    }

    pub fn set_default_profile(&self, profile_id: &str, actor: &str) -> ApiResult<TuningProfile> {
        Ok(tuning::set_default_profile(&self.store, profile_id, actor)?)
    }

    /// The settings the next extraction or reprocess pass will run under.
    pub fn active_settings(&self) -> ApiResult<QualitySettings> {
        Ok(tuning::active_settings(&self.store, &self.config, &self.config.operator_id)?)
    }

    // --- Proposals ---

    pub async fn propose_for_passage(
        &self,
        passage_id: &str,
        include_filtered: bool,
        actor: &str,
    ) -> ApiResult<ProposalOutcome> {
        Ok(ProposalGenerator::new(&self.store, self.capabilities.proposer.as_ref(), &self.config)
            .with_filtered(include_filtered)
            .with_actor(actor)
            .propose_for_passage(&PassageId::from_string(passage_id))
            .await?)
    }

    pub fn propose_links(&self, pairs: &[(String, String)], actor: &str) -> ApiResult<Vec<LinkDisposition>> {
        let pairs: Vec<(PassageId, PassageId)> = pairs
            .iter()
            .map(|(a, b)| (PassageId::from_string(a), PassageId::from_string(b)))
            .collect();
        Ok(ProposalGenerator::new(&self.store, self.capabilities.proposer.as_ref(), &self.config)
            .with_actor(actor)
            .propose_links(&pairs)?)
    }

    pub fn pending_terms(&self) -> ApiResult<Vec<PendingTerm>> {
        Ok(self
            .store
            .read(proposals::pending_terms)
            .map_err(CurationError::from)?)
    }

    // --- Witness consolidation ---

    pub fn consolidate(&self, group_id: &str, actor: &str) -> ApiResult<ConsolidationReport> {
        Ok(witness::consolidate(
            &self.store,
            &GroupId::from_string(group_id),
            self.config.consolidation_similarity,
            actor,
        )?)
    }

    pub fn consolidated_passages(&self, group_id: &str) -> ApiResult<Vec<ConsolidatedPassage>> {
        let group_id = GroupId::from_string(group_id);
        Ok(self
            .store
            .read(|c| {
                sources::get_group(c, &group_id)?;
                witness_store::consolidated_for_group(c, &group_id)
            })
            .map_err(CurationError::from)?)
    }

    // --- Review ---

    pub fn decide(
        &self,
        object_type: ReviewableType,
        object_id: &str,
        decision: ReviewDecisionKind,
        reviewer_id: &str,
        notes: Option<&str>,
    ) -> ApiResult<ReviewDecision> {
        Ok(review::decide(&self.store, object_type, object_id, decision, reviewer_id, notes)?)
    }

    pub fn bulk_decide(
        &self,
        object_type: ReviewableType,
        object_ids: &[String],
        decision: ReviewDecisionKind,
        reviewer_id: &str,
        notes: Option<&str>,
    ) -> ApiResult<BulkReport> {
        Ok(review::bulk_decide(&self.store, object_type, object_ids, decision, reviewer_id, notes)?)
    }

    pub fn resubmit(&self, object_type: ReviewableType, object_id: &str, actor: &str, notes: Option<&str>) -> ApiResult<()> {
        Ok(review::resubmit(&self.store, object_type, object_id, actor, notes)?)
    }

    pub fn publish(&self, object_type: ReviewableType, object_id: &str, actor: &str) -> ApiResult<PublishOutcome> {
        Ok(review::publish(&self.store, object_type, object_id, actor)?)
    }

    pub fn review_queue(&self, object_type: ReviewableType, page: usize, page_size: usize) -> ApiResult<ReviewQueue> {
        Ok(review::review_queue(&self.store, object_type, page, page_size)?)
    }

    // --- Audit & lookup ---

    pub fn audit_trail(&self, object_id: &str) -> ApiResult<Vec<AuditEvent>> {
        Ok(self.store.audit_trail(object_id).map_err(CurationError::from)?)
    }

    /// Fetch any record by its prefixed id.
    pub fn lookup(&self, id: &str) -> ApiResult<serde_json::Value> {
        let object_type = infer_object_type(id)
            .ok_or_else(|| CurationError::validation("id", format!("unrecognized id prefix: {}", id)))?;
        let value = self.store.read(|c| -> Result<serde_json::Value, CurationError> {
            let value = match object_type {
                "passage" | "tag" | "link" | "flag" => {
                    let kind: ReviewableType = object_type
                        .parse()
                        .map_err(|e: String| CurationError::validation("id", e))?;
                    Reviewable::load(c, kind, id)?.to_json()?
                }
                "source" => to_json(&sources::get_source(c, &SourceId::from_string(id))?)?,
                "text" => to_json(&sources::get_text(c, &TextId::from_string(id))?)?,
                "job" => to_json(&jobs::get_job(c, &JobId::from_string(id))?)?,
                "reprocess_job" => to_json(&jobs::get_reprocess_job(c, &ReprocessJobId::from_string(id))?)?,
                "trace" => to_json(&proposals::get_trace(c, &TraceId::from_string(id))?)?,
                "tuning_profile" => to_json(&tuning_store::get_profile(c, &ProfileId::from_string(id))?)?,
                "witness_group" => {
                    let group_id = GroupId::from_string(id);
                    serde_json::json!({
                        "group": to_json(&sources::get_group(c, &group_id)?)?,
                        "members": to_json(&sources::group_members(c, &group_id)?)?,
                        "consolidated": to_json(&witness_store::consolidated_for_group(c, &group_id)?)?,
                    })
                }
                other => {
                    return Err(CurationError::validation(
                        "id",
                        format!("{} records are not addressable by id", other),
                    ))
                }
            };
            Ok(value)
        })?;
        Ok(value)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, CurationError> {
    serde_json::to_value(value).map_err(|e| CurationError::from(crate::store::StorageError::from(e)))
}
