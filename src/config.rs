//! Pipeline configuration loaded from YAML

use crate::error::{CurationError, CurationResult};
use crate::quality::{DEFAULT_MAX_PASSAGES_PER_SOURCE, DEFAULT_MIN_PASSAGE_LENGTH};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Actor recorded on audit events written by the pipeline itself
    pub operator_id: String,
    pub max_job_attempts: u32,
    /// Running jobs older than this are swept back to the retry path
    pub job_timeout_secs: u64,
    pub worker_poll_secs: u64,
    /// Passage cap for profiles that do not set their own
    pub max_passages_per_source: usize,
    /// Seeds the default tuning profile when none exists yet
    pub min_passage_length: usize,
    pub fingerprint_max_chars: usize,
    pub consolidation_similarity: f64,
    pub proposals_enabled: bool,
    pub model_name: String,
    pub prompt_version: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            operator_id: "system".to_string(),
            max_job_attempts: 3,
            job_timeout_secs: 300,
            worker_poll_secs: 2,
            max_passages_per_source: DEFAULT_MAX_PASSAGES_PER_SOURCE,
            min_passage_length: DEFAULT_MIN_PASSAGE_LENGTH,
            fingerprint_max_chars: 120_000,
            consolidation_similarity: 0.92,
            proposals_enabled: true,
            model_name: "heuristic".to_string(),
            prompt_version: "v1".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml(yaml: &str) -> CurationResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| CurationError::validation("config", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> CurationResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            CurationError::validation("config", format!("{}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> CurationResult<()> {
        if self.operator_id.trim().is_empty() {
            return Err(CurationError::validation("operator_id", "must not be empty"));
        }
        if self.max_job_attempts < 1 {
            return Err(CurationError::validation("max_job_attempts", "must be at least 1"));
        }
        if self.max_passages_per_source < 1 {
            return Err(CurationError::validation("max_passages_per_source", "must be at least 1"));
        }
        if !(1..=5000).contains(&self.min_passage_length) {
            return Err(CurationError::validation("min_passage_length", "must be in 1..=5000"));
        }
        if self.worker_poll_secs < 1 {
            return Err(CurationError::validation("worker_poll_secs", "must be at least 1"));
        }
        if !(self.consolidation_similarity > 0.0 && self.consolidation_similarity <= 1.0) {
            return Err(CurationError::validation(
                "consolidation_similarity",
                "must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_job_attempts, 3);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config = PipelineConfig::from_yaml("operator_id: curator\nmax_job_attempts: 5\n").unwrap();
        assert_eq!(config.operator_id, "curator");
        assert_eq!(config.max_job_attempts, 5);
        assert_eq!(config.min_passage_length, 180);
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = PipelineConfig::from_yaml("max_job_attempts: 0\n").unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn segmentation_limits_rejected() {
        assert!(PipelineConfig::from_yaml("min_passage_length: 0\n").is_err());
        assert!(PipelineConfig::from_yaml("min_passage_length: 5001\n").is_err());
        assert!(PipelineConfig::from_yaml("max_passages_per_source: 0\n").is_err());
    }

    #[test]
    fn similarity_out_of_range_rejected() {
        assert!(PipelineConfig::from_yaml("consolidation_similarity: 1.5\n").is_err());
        assert!(PipelineConfig::from_yaml("consolidation_similarity: 0.0\n").is_err());
    }
}
