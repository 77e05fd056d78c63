//! Creative Evolve - evolutionary improvement of design-agent tool docs
//!
//! Runs a design workflow repeatedly with a group of agents, finds the
//! patterns behind poor results, and improves the tool documentation one
//! validated change at a time:
//! - Sequential trials with state reset, watchdog and failure isolation
//! - Statistics and pattern detection over each generation's runs
//! - Proposal parsing, apply, checkpoint and rollback of doc changes
//! - Shell, git and OpenRouter bridges to the outside world
//!
//! # Example
//!
//! ```ignore
//! use creative_evolve::config::Config;
//! use creative_evolve::orchestrator::Catalog;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let catalog = Catalog::load(&config.catalog.resolved_path()?)?;
//!     let workflow = catalog.get("event-poster").expect("workflow");
//!     let mut orchestrator = creative_evolve::cli::build_orchestrator(&config, None).await?;
//!     let summary = orchestrator.evolve(workflow).await?;
//!     println!("{:?}", summary.termination);
//!     Ok(())
//! }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod security;
pub mod metrics;
pub mod learning;
pub mod bridge;
pub mod orchestrator;
pub mod cli;

pub use config::Config;
pub use error::EvolutionError;
pub use learning::{ImprovementManager, ImprovementState};
pub use metrics::PatternDetector;
pub use orchestrator::{Orchestrator, Termination};
pub use types::{GenerationResult, Pattern, Run};

/// Truncate to at most `max_len` characters, ending in "..." when cut.
/// Never splits a UTF-8 character.
pub fn truncate_safe(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return s.chars().take(max_len).collect();
    }
    let kept: String = s.chars().take(max_len - 3).collect();
    format!("{}...", kept)
}
