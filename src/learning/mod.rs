//! Tool documentation improvements
//!
//! Proposals from the improvement proposer are validated, applied to the
//! tool documentation, checkpointed and kept or rolled back depending on
//! how the next generation scores. Every step is recorded in an
//! append-only history.

pub mod bootstrap;
pub mod improvement;
pub mod promotion;
pub mod store;

pub use bootstrap::{DocumentationStore, FileDocStore};
pub use improvement::{DocField, Improvement, ImprovementState, Proposal, ProposedChange};
pub use promotion::ImprovementManager;
pub use store::{GenerationLog, ImprovementHistory};
