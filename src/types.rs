//! Shared types used across modules
//!
//! Runs, deviations, patterns and generation results flow between the
//! orchestrator, the pattern detector and the improvement manager, so they
//! live here to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metric values extracted from the external application, keyed by field name
pub type Metrics = BTreeMap<String, serde_json::Value>;

/// A single tool invocation captured during a trial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Tool that was invoked
    pub tool: String,
    /// Arguments passed to the tool
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    /// Wall-clock duration of the call
    #[serde(default)]
    pub duration_ms: u64,
    /// Result payload returned by the tool
    #[serde(default)]
    pub result: serde_json::Value,
}

impl ToolCallRecord {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args: serde_json::Map::new(),
            duration_ms: 0,
            result: serde_json::Value::Null,
        }
    }

    pub fn with_arg(mut self, name: &str, value: serde_json::Value) -> Self {
        self.args.insert(name.to_string(), value);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// One field that differed from the reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deviation {
    /// Attribute name (e.g. "width", "fill.red")
    pub field: String,
    pub expected: serde_json::Value,
    pub actual: serde_json::Value,
    /// Signed deviation (actual - expected) for numeric fields, 0 otherwise
    pub deviation: f64,
}

/// Outcome of comparing extracted metrics against a reference
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Match score in 0..=100
    pub score: f64,
    /// Whether every field matched
    pub matched: bool,
    pub deviations: Vec<Deviation>,
}

/// The captured record of one trial. Never mutated after capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub agent_id: String,
    pub generation: u32,
    /// Tool invocations in the order they happened
    pub tool_calls: Vec<ToolCallRecord>,
    pub deviations: Vec<Deviation>,
    /// Per-run score in 0..=100; failed runs score 0
    pub score: f64,
    pub success: bool,
    pub error: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl Run {
    /// Build a successful run from captured telemetry and a comparison
    pub fn captured(
        agent_id: &str,
        generation: u32,
        tool_calls: Vec<ToolCallRecord>,
        comparison: Comparison,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            generation,
            tool_calls,
            deviations: comparison.deviations,
            score: comparison.score,
            success: true,
            error: None,
            captured_at: Utc::now(),
        }
    }

    /// Synthesize a failed run: no tool calls, error attached
    pub fn failed(agent_id: &str, generation: u32, error: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            generation,
            tool_calls: Vec::new(),
            deviations: Vec::new(),
            score: 0.0,
            success: false,
            error: Some(error.into()),
            captured_at: Utc::now(),
        }
    }

    /// Telemetry was captured but the result could not be scored
    pub fn unscored(
        agent_id: &str,
        generation: u32,
        tool_calls: Vec<ToolCallRecord>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tool_calls,
            ..Self::failed(agent_id, generation, error)
        }
    }

    /// Tool names in invocation order
    pub fn tool_sequence(&self) -> Vec<&str> {
        self.tool_calls.iter().map(|c| c.tool.as_str()).collect()
    }
}

/// Qualitative weight applied to a pattern's significance
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Significance multiplier; strictly ordered high > medium > low
    pub fn weight(self) -> f64 {
        match self {
            Severity::High => 1.0,
            Severity::Medium => 0.7,
            Severity::Low => 0.4,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    ToolSequence,
    ParameterChoice,
    VisualDeviation,
}

impl std::fmt::Display for PatternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatternKind::ToolSequence => write!(f, "tool-sequence"),
            PatternKind::ParameterChoice => write!(f, "parameter-choice"),
            PatternKind::VisualDeviation => write!(f, "visual-deviation"),
        }
    }
}

/// Merge key for patterns: kind plus its qualifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatternKey {
    ToolSequence { first: String, second: String },
    ParameterChoice { tool: String },
    VisualDeviation { attribute: String },
}

impl PatternKey {
    pub fn kind(&self) -> PatternKind {
        match self {
            PatternKey::ToolSequence { .. } => PatternKind::ToolSequence,
            PatternKey::ParameterChoice { .. } => PatternKind::ParameterChoice,
            PatternKey::VisualDeviation { .. } => PatternKind::VisualDeviation,
        }
    }
}

/// Direction of a recurring deviation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Over,
    Under,
    Wrong,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Over => write!(f, "over"),
            Direction::Under => write!(f, "under"),
            Direction::Wrong => write!(f, "wrong"),
        }
    }
}

/// Aggregate of all deviations observed for one attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviationPattern {
    pub attribute: String,
    pub direction: Direction,
    pub average_magnitude: f64,
    /// Repeatability of the magnitudes, in [0, 1]
    pub consistency: f64,
    pub occurrences: usize,
}

/// A recurring behavior or deviation detected within one generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub key: PatternKey,
    pub description: String,
    /// Number of runs supporting the pattern; never above the run count
    pub frequency: usize,
    /// In [0, 1]
    pub confidence: f64,
    pub severity: Severity,
    /// Tools the pattern concerns, in order of first appearance
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deviation: Option<DeviationPattern>,
}

impl Pattern {
    pub fn kind(&self) -> PatternKind {
        self.key.kind()
    }
}

/// What happened on the improvement side of a generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImprovementOutcome {
    /// No proposal was requested (loop terminating, or nothing to fix)
    None,
    /// A proposal was applied and awaits validation by the next generation
    Applied { improvement_id: String },
    /// The proposer returned an unusable payload
    Malformed { reason: String },
    /// A well-formed proposal was refused (duplicate, apply failure)
    Refused { reason: String },
}

/// One generation's runs, score and analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub generation: u32,
    pub workflow: String,
    pub runs: Vec<Run>,
    /// Mean of per-run scores
    pub score: f64,
    pub patterns: Vec<Pattern>,
    pub improvement: ImprovementOutcome,
    pub completed_at: DateTime<Utc>,
}

impl GenerationResult {
    pub fn failed_runs(&self) -> usize {
        self.runs.iter().filter(|r| !r.success).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_weight_ordering() {
        assert!(Severity::High.weight() > Severity::Medium.weight());
        assert!(Severity::Medium.weight() > Severity::Low.weight());
        assert!(Severity::High > Severity::Low);
    }

    #[test]
    fn test_failed_run_has_no_calls() {
        let run = Run::failed("agent-1", 2, "bridge unreachable");
        assert!(!run.success);
        assert!(run.tool_calls.is_empty());
        assert_eq!(run.score, 0.0);
        assert_eq!(run.error.as_deref(), Some("bridge unreachable"));
    }

    #[test]
    fn test_pattern_key_kind() {
        let key = PatternKey::ParameterChoice { tool: "create_rectangle".to_string() };
        assert_eq!(key.kind(), PatternKind::ParameterChoice);
        assert_eq!(key.kind().to_string(), "parameter-choice");
    }
}
