//! Improvements and proposal parsing
//!
//! The proposer's reply is untrusted text. It is parsed into a closed set
//! of change kinds and validated before anything touches the documentation.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::error::EvolutionError;

/// Longest documentation text a proposal may carry
pub const MAX_PROPOSED_LEN: usize = 4000;

/// A documentation field of a tool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum DocField {
    Description,
    Parameter(String),
    Example,
    Warning,
}

impl DocField {
    /// Section key used by the documentation store
    pub fn section_key(&self) -> String {
        match self {
            DocField::Description => "description".to_string(),
            DocField::Parameter(name) => format!("parameter:{}", name),
            DocField::Example => "example".to_string(),
            DocField::Warning => "warning".to_string(),
        }
    }

    pub fn from_section_key(key: &str) -> Option<Self> {
        match key {
            "description" => Some(DocField::Description),
            "example" => Some(DocField::Example),
            "warning" => Some(DocField::Warning),
            other => other
                .strip_prefix("parameter:")
                .filter(|name| !name.is_empty())
                .map(|name| DocField::Parameter(name.to_string())),
        }
    }
}

impl std::fmt::Display for DocField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.section_key())
    }
}

/// Lifecycle of an improvement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImprovementState {
    Proposed,
    Applied,
    Accepted,
    Rejected,
}

impl ImprovementState {
    /// Accepted and rejected entries never change again
    pub fn is_final(self) -> bool {
        matches!(self, ImprovementState::Accepted | ImprovementState::Rejected)
    }
}

impl std::fmt::Display for ImprovementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImprovementState::Proposed => write!(f, "proposed"),
            ImprovementState::Applied => write!(f, "applied"),
            ImprovementState::Accepted => write!(f, "accepted"),
            ImprovementState::Rejected => write!(f, "rejected"),
        }
    }
}

/// The change kinds a proposer may ask for, keyed by the payload's `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProposedChange {
    Description { tool: String, proposed: String },
    Parameter { tool: String, parameter: String, proposed: String },
    Example { tool: String, proposed: String },
    Warning { tool: String, proposed: String },
}

impl ProposedChange {
    pub fn tool(&self) -> &str {
        match self {
            ProposedChange::Description { tool, .. }
            | ProposedChange::Parameter { tool, .. }
            | ProposedChange::Example { tool, .. }
            | ProposedChange::Warning { tool, .. } => tool,
        }
    }

    pub fn field(&self) -> DocField {
        match self {
            ProposedChange::Description { .. } => DocField::Description,
            ProposedChange::Parameter { parameter, .. } => DocField::Parameter(parameter.clone()),
            ProposedChange::Example { .. } => DocField::Example,
            ProposedChange::Warning { .. } => DocField::Warning,
        }
    }

    pub fn proposed(&self) -> &str {
        match self {
            ProposedChange::Description { proposed, .. }
            | ProposedChange::Parameter { proposed, .. }
            | ProposedChange::Example { proposed, .. }
            | ProposedChange::Warning { proposed, .. } => proposed,
        }
    }
}

/// A validated proposal, ready to apply
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub change: ProposedChange,
    pub rationale: String,
    pub expected_impact: String,
}

impl Proposal {
    /// Parse and validate a raw proposer reply.
    ///
    /// Accepts a bare JSON object or one wrapped in a fenced code block.
    /// `known_tools` restricts the target tool when non-empty.
    pub fn parse(raw: &str, known_tools: &[String]) -> Result<Self, EvolutionError> {
        let json = extract_json_object(raw)
            .ok_or_else(|| EvolutionError::ProposerMalformed("no JSON object in reply".to_string()))?;

        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| EvolutionError::ProposerMalformed(format!("invalid JSON: {}", e)))?;

        let change: ProposedChange = serde_json::from_value(value.clone())
            .map_err(|e| EvolutionError::ProposerMalformed(format!("unknown change shape: {}", e)))?;

        let text_field = |name: &str| {
            value
                .get(name)
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        };

        let proposal = Proposal {
            change,
            rationale: text_field("rationale"),
            expected_impact: text_field("expected_impact"),
        };
        proposal.validate(known_tools)?;
        Ok(proposal)
    }

    fn validate(&self, known_tools: &[String]) -> Result<(), EvolutionError> {
        let malformed = |msg: String| Err(EvolutionError::ProposerMalformed(msg));
        let tool = self.change.tool();

        if !is_valid_tool_name(tool) {
            return malformed(format!("invalid tool name '{}'", crate::truncate_safe(tool, 60)));
        }
        if !known_tools.is_empty() && !known_tools.iter().any(|t| t == tool) {
            return malformed(format!("unknown tool '{}'", tool));
        }
        if let ProposedChange::Parameter { parameter, .. } = &self.change {
            if parameter.trim().is_empty() || parameter.contains('\n') {
                return malformed("parameter name is empty or multi-line".to_string());
            }
        }

        let proposed = self.change.proposed();
        if proposed.trim().is_empty() {
            return malformed("proposed text is empty".to_string());
        }
        if proposed.chars().count() > MAX_PROPOSED_LEN {
            return malformed(format!("proposed text exceeds {} characters", MAX_PROPOSED_LEN));
        }
        if proposed.lines().any(|line| line.starts_with("### ") || line.starts_with("## ")) {
            return malformed("proposed text may not contain section headings".to_string());
        }
        if self.rationale.is_empty() {
            return malformed("rationale is missing".to_string());
        }
        Ok(())
    }
}

/// Tool names double as file names in the documentation store
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A JSON object inside a Markdown code fence
static FENCED_JSON: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok());

fn extract_json_object(raw: &str) -> Option<&str> {
    if let Some(captures) = FENCED_JSON.as_ref().and_then(|fenced| fenced.captures(raw)) {
        return captures.get(1).map(|m| m.as_str());
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

/// One entry of the improvement history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub id: String,
    pub tool: String,
    pub field: DocField,
    pub prior_value: String,
    pub proposed_value: String,
    pub rationale: String,
    pub expected_impact: String,
    pub generation_proposed: u32,
    pub state: ImprovementState,
    /// Aggregate score of the generation the change was proposed in
    pub baseline_score: Option<f64>,
    /// Aggregate score of the generation that validated the change
    pub validation_score: Option<f64>,
    pub apply_commit: Option<String>,
    pub rollback_commit: Option<String>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Improvement {
    pub fn from_proposal(proposal: &Proposal, prior_value: String, generation: u32) -> Self {
        let now = Utc::now();
        Self {
            id: format!("IMP-{}-{}", now.format("%Y%m%d"), &uuid::Uuid::new_v4().simple().to_string()[..8]),
            tool: proposal.change.tool().to_string(),
            field: proposal.change.field(),
            prior_value,
            proposed_value: proposal.change.proposed().to_string(),
            rationale: proposal.rationale.clone(),
            expected_impact: proposal.expected_impact.clone(),
            generation_proposed: generation,
            state: ImprovementState::Proposed,
            baseline_score: None,
            validation_score: None,
            apply_commit: None,
            rollback_commit: None,
            note: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this entry targets the same change as `proposal`
    pub fn same_change(&self, proposal: &Proposal) -> bool {
        self.tool == proposal.change.tool()
            && self.field == proposal.change.field()
            && self.proposed_value.trim() == proposal.change.proposed().trim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fenced_parameter_proposal() {
        let raw = r#"Here is my suggestion:
```json
{"type": "parameter", "tool": "create_rectangle", "parameter": "width",
 "proposed": "Width in points, not pixels.", "rationale": "width overshoots in 3/3 runs",
 "expected_impact": "+15 score"}
```"#;
        let proposal = Proposal::parse(raw, &[]).unwrap();
        assert_eq!(proposal.change.tool(), "create_rectangle");
        assert_eq!(proposal.change.field(), DocField::Parameter("width".to_string()));
        assert_eq!(proposal.expected_impact, "+15 score");
    }

    #[test]
    fn test_extract_prefers_fenced_object() {
        assert!(FENCED_JSON.is_some());
        let raw = "Consider {braces} in prose.\n```json\n{\"a\": 1}\n```\nThanks {}";
        assert_eq!(extract_json_object(raw), Some("{\"a\": 1}"));
        assert_eq!(extract_json_object("reply: {\"a\": 2} done"), Some("{\"a\": 2}"));
        assert_eq!(extract_json_object("nothing here"), None);
    }

    #[test]
    fn test_parse_rejects_unknown_type() {
        let raw = r#"{"type": "rewrite_everything", "tool": "x", "proposed": "y", "rationale": "z"}"#;
        assert!(matches!(Proposal::parse(raw, &[]), Err(EvolutionError::ProposerMalformed(_))));
    }

    #[test]
    fn test_parse_rejects_missing_fields_and_garbage() {
        assert!(Proposal::parse("no json here", &[]).is_err());
        assert!(Proposal::parse(r#"{"type": "description", "tool": "apply_fill"}"#, &[]).is_err());
        let no_rationale = r#"{"type": "description", "tool": "apply_fill", "proposed": "Fills the selection."}"#;
        assert!(Proposal::parse(no_rationale, &[]).is_err());
    }

    #[test]
    fn test_parse_rejects_unsafe_tool_names() {
        let raw = r#"{"type": "warning", "tool": "../../etc/passwd", "proposed": "x", "rationale": "y"}"#;
        assert!(Proposal::parse(raw, &[]).is_err());
    }

    #[test]
    fn test_parse_checks_known_tools() {
        let raw = r#"{"type": "example", "tool": "apply_fill", "proposed": "apply_fill(color='#f00')", "rationale": "r"}"#;
        let known = vec!["create_rectangle".to_string()];
        assert!(Proposal::parse(raw, &known).is_err());
        let known = vec!["apply_fill".to_string()];
        assert!(Proposal::parse(raw, &known).is_ok());
    }

    #[test]
    fn test_section_key_round_trip() {
        for field in [
            DocField::Description,
            DocField::Parameter("fill".to_string()),
            DocField::Example,
            DocField::Warning,
        ] {
            assert_eq!(DocField::from_section_key(&field.section_key()), Some(field));
        }
        assert_eq!(DocField::from_section_key("parameter:"), None);
    }

    #[test]
    fn test_final_states() {
        assert!(ImprovementState::Accepted.is_final());
        assert!(ImprovementState::Rejected.is_final());
        assert!(!ImprovementState::Applied.is_final());
    }
}
