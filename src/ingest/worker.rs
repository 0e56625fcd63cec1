//! Worker loop
//!
//! One cycle runs at most one reprocess job and then at most one ingestion job,
//! both under a snapshot of the default tuning profile taken when the cycle starts.
//! An ingestion job reads the source bytes, parses them, extracts passages,
//! proposes for each kept passage and consolidates the source's witness group.
//! Any failure along the way is normalized into a [`JobFailure`] on the job.

use super::cancel::CancellationToken;
use super::engine::JobEngine;
use crate::capability::{BuiltinParser, Parser, ProposalClient, SourceReader, Translator};
use crate::config::PipelineConfig;
use crate::error::{CurationError, CurationResult, JobFailure, ProcessingError};
use crate::model::*;
use crate::proposal::{HeuristicProposer, ProposalGenerator, ProposalOutcome};
use crate::quality::extraction::ExtractionSummary;
use crate::quality::{Extraction, HeuristicTranslator, QualitySettings};
use crate::reprocess::{self, ReprocessRun};
use crate::store::{sources, SqliteStore, StorageError};
use crate::tuning;
use crate::witness::{self, ConsolidationReport};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// The external capabilities a worker calls out to.
#[derive(Clone)]
pub struct Capabilities {
    pub parser: Arc<dyn Parser>,
    pub translator: Arc<dyn Translator>,
    pub proposer: Arc<dyn ProposalClient>,
    pub reader: Arc<dyn SourceReader>,
}

impl Capabilities {
    /// Built-in parser with the heuristic translator and proposer.
    pub fn heuristic(reader: Arc<dyn SourceReader>) -> Self {
        Self {
            parser: Arc::new(BuiltinParser::new()),
            translator: Arc::new(HeuristicTranslator::new()),
            proposer: Arc::new(HeuristicProposer::new()),
            reader,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = translator;
        self
    }

    pub fn with_proposer(mut self, proposer: Arc<dyn ProposalClient>) -> Self {
        self.proposer = proposer;
        self
    }

    /// Read a source's bytes and parse them into text.
    pub async fn load_text(&self, source: &Source) -> Result<String, ProcessingError> {
        let bytes = self
            .reader
            .read(&source.locator)
            .await
            .map_err(|e| ProcessingError::Capability {
                capability: "source_reader".to_string(),
                message: format!("{}: {}", source.locator, e),
            })?;
        self.parser
            .parse(&bytes, &source.format_hint)
            .await
            .map_err(|e| ProcessingError::Parse {
                parser: self.parser.name().to_string(),
                kind: e.kind(),
                message: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobSummary {
    pub extraction: ExtractionSummary,
    pub proposed: usize,
    pub proposal_skipped: usize,
    pub consolidation: Option<ConsolidationReport>,
}

/// How a claimed ingestion job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRun {
    Completed { job: IngestionJob, summary: JobSummary },
    Failed { job: IngestionJob, failure: JobFailure },
    /// The claim was swept while the job ran; the outcome was discarded.
    ClaimLost { job: IngestionJob },
}

impl JobRun {
    pub fn job(&self) -> &IngestionJob {
        match self {
            Self::Completed { job, .. } | Self::Failed { job, .. } | Self::ClaimLost { job } => job,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub reprocess: Option<ReprocessRun>,
    pub ingestion: Option<JobRun>,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.reprocess.is_none() && self.ingestion.is_none()
    }
}

pub struct Worker {
    store: Arc<SqliteStore>,
    capabilities: Capabilities,
    config: PipelineConfig,
}

impl Worker {
    pub fn new(store: Arc<SqliteStore>, capabilities: Capabilities, config: PipelineConfig) -> Self {
        Self {
            store,
            capabilities,
            config,
        }
    }

    pub fn engine(&self) -> JobEngine<'_> {
        JobEngine::new(&self.store, &self.config)
    }

    /// Run cycles until cancelled, sleeping for the poll interval whenever a
    /// cycle finds nothing to do.
    pub async fn run(&self, cancel: &CancellationToken) -> CurationResult<()> {
        let poll = Duration::from_secs(self.config.worker_poll_secs);
        let timeout = Duration::from_secs(self.config.job_timeout_secs);
        info!(poll_secs = self.config.worker_poll_secs, "worker started");

        while !cancel.is_cancelled() {
            if let Err(err) = self.engine().sweep_stale(timeout) {
                error!(error = %err, "stale job sweep failed");
            }
            if let Err(err) = reprocess::sweep_stale(&self.store, timeout, &self.config.operator_id) {
                error!(error = %err, "stale reprocess sweep failed");
            }
            let idle = match self.run_cycle().await {
                Ok(report) => report.is_idle(),
                Err(err) => {
                    error!(error = %err, "worker cycle failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }

        info!("worker stopped");
        Ok(())
    }

    /// Run cycles until one finds no work. Returns the number of busy cycles.
    pub async fn run_until_idle(&self) -> CurationResult<usize> {
        let mut cycles = 0;
        while !self.run_cycle().await?.is_idle() {
            cycles += 1;
        }
        Ok(cycles)
    }

    /// One reprocess job, then one ingestion job.
    pub async fn run_cycle(&self) -> CurationResult<CycleReport> {
        let settings = tuning::active_settings(&self.store, &self.config, &self.config.operator_id)?;
        let reprocess = reprocess::run_next(
            &self.store,
            self.capabilities.translator.as_ref(),
            &settings,
            &self.config.operator_id,
        )
        .await?;

        let engine = self.engine();
        let ingestion = match engine.claim_next()? {
            Some(job) => Some(self.process_job(&engine, job, &settings).await?),
            None => None,
        };
        Ok(CycleReport { reprocess, ingestion })
    }

    /// Execute a claimed job under the configured timeout and record the outcome.
    pub async fn process_job(
        &self,
        engine: &JobEngine<'_>,
        job: IngestionJob,
        settings: &QualitySettings,
    ) -> CurationResult<JobRun> {
        let timeout_secs = self.config.job_timeout_secs;
        let run = self.execute(&job, settings);
        let result = match tokio::time::timeout(Duration::from_secs(timeout_secs), run).await {
            Ok(result) => result,
            Err(_) => Err(ProcessingError::Timeout(timeout_secs)),
        };

        let recorded = match result {
            Ok(summary) => {
                let details = serde_json::to_value(&summary).map_err(crate::store::StorageError::from)?;
                engine
                    .complete(&job, details)
                    .map(|done| JobRun::Completed { job: done, summary })
            }
            Err(err) => {
                warn!(job_id = %job.job_id, error = %err, "ingestion attempt failed");
                let failure = JobFailure::from(&err);
                engine
                    .fail(&job, &failure)
                    .map(|failed| JobRun::Failed { job: failed, failure })
            }
        };

        match recorded {
            Err(CurationError::Storage(StorageError::Conflict(reason))) => {
                warn!(job_id = %job.job_id, reason = %reason, "claim lost before the attempt was recorded");
                Ok(JobRun::ClaimLost { job: engine.get(&job.job_id)? })
            }
            other => other,
        }
    }

    async fn execute(&self, job: &IngestionJob, settings: &QualitySettings) -> Result<JobSummary, ProcessingError> {
        let source = self
            .store
            .read(|conn| sources::get_source(conn, &job.source_id))
            .map_err(CurationError::from)?;

        let text = self.capabilities.load_text(&source).await?;
        debug!(job_id = %job.job_id, chars = text.len(), parser = self.capabilities.parser.name(), "parsed source");

        let generator = ProposalGenerator::new(&self.store, self.capabilities.proposer.as_ref(), &self.config);
        let mut summary = JobSummary::default();
        let group_id = source.witness_group_id.clone();

        let mut extraction = Extraction::new(
            &self.store,
            self.capabilities.translator.as_ref(),
            source,
            text,
            settings,
            &self.config.operator_id,
        );
        while let Some(item) = extraction.next().await {
            let extracted = item?;
            if !self.config.proposals_enabled || extracted.passage.relevance_state == RelevanceState::Filtered {
                continue;
            }
            match generator.propose_for_passage(&extracted.passage.passage_id).await {
                Ok(ProposalOutcome::Proposed(_)) => summary.proposed += 1,
                Ok(ProposalOutcome::Skipped { .. }) => summary.proposal_skipped += 1,
                Err(CurationError::TransientProcessing { code, message }) => {
                    return Err(ProcessingError::Capability {
                        capability: self.capabilities.proposer.model_name().to_string(),
                        message: format!("{}: {}", code, message),
                    })
                }
                Err(err) => return Err(err.into()),
            }
        }
        summary.extraction = extraction.summary().clone();

        if let Some(group_id) = group_id {
            summary.consolidation = Some(witness::consolidate(
                &self.store,
                &group_id,
                self.config.consolidation_similarity,
                &self.config.operator_id,
            )?);
        }

        info!(
            job_id = %job.job_id,
            persisted = summary.extraction.persisted,
            existing = summary.extraction.existing,
            skipped = summary.extraction.skipped,
            proposed = summary.proposed,
            quality_version = %settings.quality_version,
            "ingestion job executed"
        );
        Ok(summary)
    }
}
