//! LLM improvement proposer
//!
//! Sends the pattern report to an OpenAI-compatible chat completion
//! endpoint (OpenRouter by default) and returns the raw reply. Parsing and
//! validation happen in [`crate::learning::improvement`].

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::ImprovementProposer;
use crate::config::ProposerConfig;

pub const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

const SYSTEM_PROMPT: &str = r#"You improve the documentation of tools used by an AI design agent.
You receive a report of recurring problems observed while agents ran a workflow.
Propose exactly ONE documentation change that would most likely fix the most significant problem.

Reply with a single JSON object and nothing else:
{
  "type": "description" | "parameter" | "example" | "warning",
  "tool": "<tool name>",
  "parameter": "<parameter name, only when type is parameter>",
  "proposed": "<the complete new text for that field>",
  "rationale": "<which pattern this addresses and why>",
  "expected_impact": "<expected effect on the score>"
}"#;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

pub struct OpenRouterProposer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenRouterProposer {
    pub fn new(config: &ProposerConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    /// Build with the API key from the environment, keyring or key file
    pub fn from_keyring(config: &ProposerConfig) -> Result<Self> {
        let api_key = crate::security::get_api_key()?;
        Self::new(config, api_key)
    }
}

#[async_trait::async_trait]
impl ImprovementProposer for OpenRouterProposer {
    async fn propose(&self, report: &str) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: SYSTEM_PROMPT },
                ChatMessage { role: "user", content: report },
            ],
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "creative-evolve")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, crate::truncate_safe(&body, 500));
        }

        let body = response.text().await.context("Failed to read response body")?;
        let content = extract_content(&body)?;
        debug!(model = %self.model, chars = content.len(), "Proposal received");
        Ok(content)
    }
}

/// Pull the assistant text out of a chat completion response
fn extract_content(body: &str) -> Result<String> {
    let raw: serde_json::Value = serde_json::from_str(body).map_err(|e| {
        anyhow::anyhow!("Failed to parse JSON response: {} (body: {})", e, crate::truncate_safe(body, 500))
    })?;

    let content = raw
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"));

    match content {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(serde_json::Value::Array(parts)) => Ok(parts
            .iter()
            .filter(|part| part.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("")),
        _ => bail!("LLM response has no message content"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_string_content() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "{\"type\": \"warning\"}"}}]}"#;
        assert_eq!(extract_content(body).unwrap(), r#"{"type": "warning"}"#);
    }

    #[test]
    fn test_extract_content_parts() {
        let body = r#"{"choices": [{"message": {"content": [
            {"type": "text", "text": "part one "},
            {"type": "image_url", "image_url": {"url": "x"}},
            {"type": "text", "text": "part two"}
        ]}}]}"#;
        assert_eq!(extract_content(body).unwrap(), "part one part two");
    }

    #[test]
    fn test_extract_rejects_empty_response() {
        assert!(extract_content(r#"{"choices": []}"#).is_err());
        assert!(extract_content("<html>").is_err());
    }
}
