//! Storage errors and the open/close contract

use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{object_type} not found: {id}")]
    NotFound { object_type: String, id: String },

    /// A foreign key did not resolve.
    #[error("Unresolved reference: {0}")]
    ForeignKey(String),

    /// Unique, check or trigger constraint refused the write.
    #[error("Constraint violated: {0}")]
    Conflict(String),

    /// A proposal object was written without evidence.
    #[error("Missing evidence for {0}")]
    MissingEvidence(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn not_found(object_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            object_type: object_type.into(),
            id: id.into(),
        }
    }

    /// Sort constraint failures into `ForeignKey` / `Conflict`; pass everything else through.
    pub fn classify(err: rusqlite::Error) -> Self {
        use rusqlite::ffi;
        if let rusqlite::Error::SqliteFailure(code, message) = &err {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                let message = message.clone().unwrap_or_else(|| code.to_string());
                if code.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
                    return Self::ForeignKey(message);
                }
                return Self::Conflict(message);
            }
        }
        Self::Database(err)
    }

    /// True for unique/check/trigger refusals.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Trait for stores that can be opened from a path
pub trait OpenStore: Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}
