//! Trial metrics and analysis
//!
//! - Telemetry sessions and per-tool timing aggregates
//! - Comparison of extracted metrics against a reference
//! - Descriptive statistics over scores and patterns
//! - Pattern detection across the runs of a generation
//! - Reports for the improvement proposer and the CLI

pub mod analysis;
pub mod comparison;
pub mod execution;
pub mod report;
pub mod statistics;

pub use analysis::{DetectorConfig, PatternDetector};
pub use execution::{Session, SessionContext, SessionSummary, ToolMetrics};
pub use report::{stats_report, PatternReport};
