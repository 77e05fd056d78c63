//! Evolution loop orchestration
//!
//! Drives generations of trials for a workflow, decides when to stop, and
//! feeds detected patterns to the improvement manager.

pub mod catalog;
pub mod phase;
pub mod runner;

pub use catalog::{Catalog, Selection, Workflow};
pub use phase::{GenerationPhase, Termination, TerminationPolicy};
pub use runner::{Collaborators, EvolutionSummary, Orchestrator};
