//! Error taxonomy shared by every pipeline component
//!
//! `CurationError` is what operations return to callers. At the API boundary it is
//! flattened into an [`ErrorReport`] so no raw internal error crosses it.

use crate::store::StorageError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CurationError {
    /// Missing or invalid field; the record was not persisted.
    #[error("validation failed on {field}: {message}")]
    Validation { field: String, message: String },

    /// Unresolved reference to another record.
    #[error("{object_type} not found: {id}")]
    Referential { object_type: String, id: String },

    /// Term outside the controlled vocabulary.
    #[error("term {dimension}/{term} is not in the controlled vocabulary")]
    Vocabulary { dimension: String, term: String },

    /// Missing evidence or rationale.
    #[error("traceability: {0}")]
    Traceability(String),

    /// Parser, capability or timeout failure eligible for retry.
    #[error("transient processing failure ({code}): {message}")]
    TransientProcessing { code: String, message: String },

    /// Operation refused before any state was changed.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type CurationResult<T> = Result<T, CurationError>;

impl CurationError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(object_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::Referential {
            object_type: object_type.into(),
            id: id.into(),
        }
    }

    pub fn policy(message: impl Into<String>) -> Self {
        Self::PolicyViolation(message.into())
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Referential { .. } => "referential_error",
            Self::Vocabulary { .. } => "vocabulary_error",
            Self::Traceability(_) => "traceability_error",
            Self::TransientProcessing { .. } => "transient_processing_error",
            Self::PolicyViolation(_) => "policy_violation",
            Self::Storage(StorageError::NotFound { .. }) => "referential_error",
            Self::Storage(StorageError::ForeignKey(_)) => "referential_error",
            Self::Storage(StorageError::Conflict(_)) => "conflict",
            Self::Storage(_) => "storage_error",
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from(self)
    }
}

/// Structured `(error_code, details)` pair returned at the API boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error_code: String,
    pub details: serde_json::Value,
}

impl From<&CurationError> for ErrorReport {
    fn from(err: &CurationError) -> Self {
        let details = match err {
            CurationError::Validation { field, message } => {
                serde_json::json!({ "field": field, "message": message })
            }
            CurationError::Referential { object_type, id } => {
                serde_json::json!({ "object_type": object_type, "id": id })
            }
            CurationError::Vocabulary { dimension, term } => {
                serde_json::json!({ "dimension": dimension, "term": term })
            }
            CurationError::TransientProcessing { code, message } => {
                serde_json::json!({ "code": code, "message": message })
            }
            other => serde_json::json!({ "message": other.to_string() }),
        };
        Self {
            error_code: err.code().to_string(),
            details,
        }
    }
}

impl From<CurationError> for ErrorReport {
    fn from(err: CurationError) -> Self {
        Self::from(&err)
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error_code, self.details)
    }
}

/// Failure raised while processing a job, before it is written to storage.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("parser {parser} failed: {message}")]
    Parse {
        parser: String,
        kind: &'static str,
        message: String,
    },

    #[error("job exceeded timeout of {0}s")]
    Timeout(u64),

    #[error("malformed content: {0}")]
    Malformed(String),

    #[error("capability {capability} failed: {message}")]
    Capability { capability: String, message: String },

    #[error(transparent)]
    Curation(#[from] CurationError),
}

/// Normalized `(error_code, error_context)` pair stored on a failed job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub error_code: String,
    pub error_context: serde_json::Value,
    pub parser_name: Option<String>,
}

impl JobFailure {
    pub fn new(error_code: impl Into<String>, error_context: serde_json::Value) -> Self {
        Self {
            error_code: error_code.into(),
            error_context,
            parser_name: None,
        }
    }
}

impl From<&ProcessingError> for JobFailure {
    fn from(err: &ProcessingError) -> Self {
        match err {
            ProcessingError::Parse {
                parser,
                kind,
                message,
            } => Self {
                error_code: format!("parse_{}", kind),
                error_context: serde_json::json!({ "message": message }),
                parser_name: Some(parser.clone()),
            },
            ProcessingError::Timeout(secs) => Self::new(
                "timeout",
                serde_json::json!({ "timeout_secs": secs }),
            ),
            ProcessingError::Malformed(message) => Self::new(
                "malformed_content",
                serde_json::json!({ "message": message }),
            ),
            ProcessingError::Capability {
                capability,
                message,
            } => Self::new(
                "capability_failure",
                serde_json::json!({ "capability": capability, "message": message }),
            ),
            ProcessingError::Curation(inner) => Self::new(
                inner.code(),
                serde_json::json!({ "message": inner.to_string() }),
            ),
        }
    }
}
