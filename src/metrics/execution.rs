//! Execution telemetry
//!
//! Records the tool invocations of one trial. The session lives in an
//! explicit [`SessionContext`] value owned by the orchestrator and lent to
//! the trial agent; only one session may be open in a context at a time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::EvolutionError;
use crate::types::ToolCallRecord;

/// A closed telemetry session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub generation: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub calls: Vec<ToolCallRecord>,
}

/// Holder for the one active telemetry session
#[derive(Debug, Default)]
pub struct SessionContext {
    active: Option<Session>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for a trial. Fails if one is already open.
    pub fn start_session(&mut self, agent_id: &str, generation: u32) -> Result<String, EvolutionError> {
        if let Some(ref open) = self.active {
            return Err(EvolutionError::SessionAlreadyActive(open.id.clone()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.active = Some(Session {
            id: id.clone(),
            agent_id: agent_id.to_string(),
            generation,
            started_at: Utc::now(),
            ended_at: None,
            calls: Vec::new(),
        });
        debug!(session = %id, agent = agent_id, generation, "Telemetry session started");
        Ok(id)
    }

    /// Record a tool call into the open session. Returns false when no
    /// session is open and the call was dropped.
    pub fn record(&mut self, call: ToolCallRecord) -> bool {
        match self.active.as_mut() {
            Some(session) => {
                session.calls.push(call);
                true
            }
            None => false,
        }
    }

    /// Close the open session, if any
    pub fn end_session(&mut self) -> Option<Session> {
        let mut session = self.active.take()?;
        session.ended_at = Some(Utc::now());
        debug!(session = %session.id, calls = session.calls.len(), "Telemetry session ended");
        Some(session)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

/// Aggregated timings for one tool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolMetrics {
    pub calls: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl ToolMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            (self.calls - self.failed) as f64 / self.calls as f64
        }
    }

    fn observe(&mut self, call: &ToolCallRecord) {
        self.calls += 1;
        if call_failed(call) {
            self.failed += 1;
        }

        if self.calls == 1 {
            self.avg_duration_ms = call.duration_ms as f64;
            self.min_duration_ms = call.duration_ms;
            self.max_duration_ms = call.duration_ms;
        } else {
            let n = self.calls as f64;
            self.avg_duration_ms = self.avg_duration_ms * (n - 1.0) / n + call.duration_ms as f64 / n;
            self.min_duration_ms = self.min_duration_ms.min(call.duration_ms);
            self.max_duration_ms = self.max_duration_ms.max(call.duration_ms);
        }
    }
}

/// Summary of a session's (or several sessions') tool calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub total_duration_ms: u64,
    pub average_execution_time_ms: f64,
    pub tools: BTreeMap<String, ToolMetrics>,
}

impl SessionSummary {
    /// Most called tools first
    pub fn most_used(&self, limit: usize) -> Vec<(&str, &ToolMetrics)> {
        let mut tools: Vec<_> = self.tools.iter().map(|(k, v)| (k.as_str(), v)).collect();
        tools.sort_by(|a, b| b.1.calls.cmp(&a.1.calls).then(a.0.cmp(b.0)));
        tools.into_iter().take(limit).collect()
    }
}

pub fn summarize(session: &Session) -> SessionSummary {
    summarize_calls(session.calls.iter())
}

pub fn summarize_calls<'a>(calls: impl IntoIterator<Item = &'a ToolCallRecord>) -> SessionSummary {
    let mut summary = SessionSummary::default();
    for call in calls {
        summary.total_calls += 1;
        summary.total_duration_ms += call.duration_ms;
        if call_failed(call) {
            summary.failed_calls += 1;
        }
        summary.tools.entry(call.tool.clone()).or_default().observe(call);
    }

    if summary.total_calls > 0 {
        summary.average_execution_time_ms = summary.total_duration_ms as f64 / summary.total_calls as f64;
    }
    summary
}

/// A call failed when its result carries an error or `success: false`
pub fn call_failed(call: &ToolCallRecord) -> bool {
    match &call.result {
        serde_json::Value::Object(map) => {
            map.get("error").map_or(false, |e| !e.is_null())
                || map.get("success") == Some(&serde_json::Value::Bool(false))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_active_session() {
        let mut ctx = SessionContext::new();
        let id = ctx.start_session("agent-0", 1).unwrap();
        assert!(ctx.is_active());

        let err = ctx.start_session("agent-1", 1).unwrap_err();
        assert!(matches!(err, EvolutionError::SessionAlreadyActive(ref open) if *open == id));

        let session = ctx.end_session().unwrap();
        assert_eq!(session.id, id);
        assert!(session.ended_at.is_some());
        assert!(!ctx.is_active());
        assert!(ctx.start_session("agent-1", 1).is_ok());
    }

    #[test]
    fn test_record_without_session_is_dropped() {
        let mut ctx = SessionContext::new();
        assert!(!ctx.record(ToolCallRecord::new("create_rectangle")));
        assert!(ctx.end_session().is_none());
    }

    #[test]
    fn test_summarize() {
        let mut ctx = SessionContext::new();
        ctx.start_session("agent-0", 1).unwrap();
        ctx.record(ToolCallRecord::new("create_rectangle").with_duration(100));
        ctx.record(ToolCallRecord::new("create_rectangle").with_duration(300));
        let mut failed = ToolCallRecord::new("apply_fill").with_duration(200);
        failed.result = json!({"success": false, "error": "no selection"});
        ctx.record(failed);
        let session = ctx.end_session().unwrap();

        let summary = summarize(&session);
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.failed_calls, 1);
        assert_eq!(summary.average_execution_time_ms, 200.0);

        let rect = &summary.tools["create_rectangle"];
        assert_eq!(rect.calls, 2);
        assert_eq!(rect.avg_duration_ms, 200.0);
        assert_eq!(rect.min_duration_ms, 100);
        assert_eq!(rect.max_duration_ms, 300);
        assert_eq!(summary.tools["apply_fill"].success_rate(), 0.0);
        assert_eq!(summary.most_used(1)[0].0, "create_rectangle");
    }
}
