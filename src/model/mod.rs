//! Domain model: identifiers, lifecycle states, records and the controlled vocabulary

mod ids;
mod records;
mod state;
pub mod vocabulary;

pub use ids::*;
pub use records::*;
pub use state::*;
