//! Lantern: curation pipeline for multilingual ritual texts
//!
//! Sources are registered and fingerprinted, ingested by durable jobs into passage
//! evidence, scored for translation quality and relevance, annotated with
//! evidence-linked proposals, consolidated across witnesses, and gated behind human
//! review before publication. Every state change lands in an append-only audit
//! ledger.
//!
//! # Core Concepts
//!
//! - **Witness**: an alternate copy of the same underlying work, grouped with its siblings
//! - **Passage evidence**: an extracted span with a resolvable locator into its source
//! - **Proposal**: a tag, commonality link or flag that must cite at least one passage
//! - **Dead letter**: a job that exhausted its attempts and waits for an operator
//!
//! # Example
//!
//! ```
//! use lantern::{OpenStore, SqliteStore};
//!
//! let store = SqliteStore::open_in_memory().unwrap();
//! assert!(store.audit_trail("psg_0000000000000000").unwrap().is_empty());
//! ```

pub mod api;
pub mod capability;
pub mod config;
pub mod dedup;
pub mod error;
pub mod ingest;
pub mod model;
pub mod proposal;
pub mod quality;
pub mod reprocess;
pub mod review;
pub mod store;
pub mod tuning;
pub mod witness;

pub use api::{ApiResult, CurationApi};
pub use config::PipelineConfig;
pub use error::{CurationError, CurationResult, ErrorReport, JobFailure, ProcessingError};
pub use ingest::{CancellationToken, Capabilities, JobEngine, Worker};
pub use store::{OpenStore, SqliteStore, StorageError, StorageResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
