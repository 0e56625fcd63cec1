//! Ingestion Job Engine
//!
//! [`JobEngine`] owns the job state machine; [`Worker`] drives claimed jobs
//! through parse, extraction, proposals and consolidation.

pub mod cancel;
mod engine;
mod worker;

pub use cancel::CancellationToken;
pub use engine::{JobEngine, RequeueTarget};
pub use worker::{Capabilities, CycleReport, JobRun, JobSummary, Worker};
