//! Evidence Store
//!
//! `SqliteStore` owns all persisted pipeline state. The submodules hold the row-level
//! operations; each takes a `&Connection` so callers can compose several of them
//! inside one [`SqliteStore::transaction`].

pub mod jobs;
pub mod passages;
pub mod proposals;
pub mod review;
pub mod sources;
mod sqlite;
mod traits;
pub mod tuning;
pub mod witness;

pub use jobs::ReprocessFilter;
pub use sqlite::{audit_trail, count_audit_events, insert_audit, sql_timestamp, SqliteStore};
pub use traits::{OpenStore, StorageError, StorageResult};
