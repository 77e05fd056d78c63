//! External collaborators
//!
//! The evolution loop never talks to the design application, the version
//! control system or the LLM directly. It goes through the traits below;
//! [`command`], [`git`] and [`llm`] are the concrete implementations used
//! by the CLI, and tests plug in fakes.

pub mod command;
pub mod failover;
pub mod git;
pub mod llm;

use anyhow::Result;
use std::collections::BTreeMap;

use crate::error::EvolutionError;
use crate::metrics::comparison;
use crate::metrics::execution::SessionContext;
use crate::types::{Comparison, Metrics};

pub use command::CommandBridge;
pub use failover::{FailoverReset, TargetReset};
pub use git::GitVersionControl;
pub use llm::OpenRouterProposer;

/// Everything an agent needs to perform one trial
#[derive(Debug, Clone, PartialEq)]
pub struct TrialSpec {
    pub agent_id: String,
    pub generation: u32,
    pub workflow: String,
    pub prompt: String,
    /// Telemetry session opened for this trial
    pub session_id: String,
}

/// Reference metrics with the tolerance numeric fields are compared at
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub metrics: Metrics,
    pub tolerance: f64,
}

/// Runs a workflow against the external application
#[async_trait::async_trait]
pub trait TrialAgent: Send + Sync {
    /// Perform the trial, recording every tool call into `session`
    async fn run_trial(&self, trial: &TrialSpec, session: &mut SessionContext) -> Result<()>;
}

/// Reads the result of a trial back from the external application
#[async_trait::async_trait]
pub trait MetricsSource: Send + Sync {
    async fn extract_metrics(&self) -> Result<Metrics>;

    async fn compare_to_reference(&self, reference: &Reference) -> Result<Comparison> {
        let actual = self.extract_metrics().await?;
        Ok(comparison::compare(&reference.metrics, &actual, reference.tolerance))
    }
}

/// Returns the external application to a clean state between trials
#[async_trait::async_trait]
pub trait StateReset: Send + Sync {
    async fn reset_external_state(&self) -> Result<(), EvolutionError>;
}

/// Checkpoints documentation changes
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait VersionControl: Send + Sync {
    /// Record a checkpoint and return its identifier
    async fn commit(&self, message: &str, metadata: &BTreeMap<String, String>) -> Result<String>;

    /// Undo a checkpoint by recording its inverse
    async fn revert(&self, commit_id: &str) -> Result<()>;
}

/// Turns a pattern report into a raw improvement proposal
#[async_trait::async_trait]
pub trait ImprovementProposer: Send + Sync {
    async fn propose(&self, report: &str) -> Result<String>;
}
