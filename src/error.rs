//! Error types for the evolution loop
//!
//! Collaborator plumbing returns `anyhow::Result`; the conditions the loop
//! reacts to are named here so callers can match on them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvolutionError {
    /// Reset or trial infrastructure could not be reached
    #[error("external application unavailable: {0}")]
    ExternalUnavailable(String),

    /// The proposer returned a payload that failed parsing or validation
    #[error("malformed improvement proposal: {0}")]
    ProposerMalformed(String),

    /// An applied improvement has not been validated yet
    #[error("improvement {0} is still awaiting validation")]
    ImprovementPending(String),

    /// The proposed change was already accepted or rejected earlier
    #[error("improvement for {tool}/{field} was already {state}")]
    DuplicateImprovement {
        tool: String,
        field: String,
        state: String,
    },

    /// A telemetry session is already open in this context
    #[error("telemetry session {0} is already active")]
    SessionAlreadyActive(String),

    #[error("invalid generation transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),
}
