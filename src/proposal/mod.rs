//! Proposal Generator and Commonality Scorer
//!
//! Tags, links and flags are proposed by a pluggable capability, never trusted
//! directly: the raw payload is schema-checked ([`payload`]), applied item by item
//! ([`sink`]) and links are re-scored locally ([`commonality`]).

pub mod commonality;
mod generator;
mod heuristic;
pub mod payload;
pub mod sink;

pub use commonality::{approval_blocker, CommonalityScore, TagProfile, MIN_LINK_SCORE};
pub use generator::{
    build_prompt, build_repair_prompt, LinkDisposition, ProposalGenerator, ProposalOutcome, ProposalReport, BUNDLE,
};
pub use heuristic::HeuristicProposer;
pub use payload::{parse_bundle, PayloadError, ProposalBundle};
pub use sink::{LinkNomination, ProposalSink, Rejection, RejectionReason, SinkResult};
