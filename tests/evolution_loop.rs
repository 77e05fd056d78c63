//! End-to-end tests for the evolution loop with in-process collaborators

use anyhow::Result;
use serde_json::json;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use creative_evolve::bridge::{
    ImprovementProposer, MetricsSource, Reference, StateReset, TrialAgent, TrialSpec, VersionControl,
};
use creative_evolve::config::EvolutionConfig;
use creative_evolve::error::EvolutionError;
use creative_evolve::learning::{
    DocField, DocumentationStore, FileDocStore, GenerationLog, ImprovementHistory, ImprovementManager,
    ImprovementState,
};
use creative_evolve::metrics::execution::SessionContext;
use creative_evolve::orchestrator::{Collaborators, Orchestrator, Termination, Workflow};
use creative_evolve::types::{Comparison, Deviation, ImprovementOutcome, Metrics, ToolCallRecord};
use creative_evolve::PatternDetector;

/// Draws a rectangle and fills it; agents listed in `crash` fail, agents
/// listed in `hang` never finish. With `cancel_in` set, the first trial of
/// that generation requests cancellation.
#[derive(Default)]
struct ScriptedAgent {
    crash: Vec<String>,
    hang: Vec<String>,
    trials: Arc<Mutex<Vec<String>>>,
    cancel_in: Option<(u32, watch::Sender<bool>)>,
}

#[async_trait::async_trait]
impl TrialAgent for ScriptedAgent {
    async fn run_trial(&self, trial: &TrialSpec, session: &mut SessionContext) -> Result<()> {
        self.trials.lock().unwrap().push(trial.agent_id.clone());
        if self.hang.contains(&trial.agent_id) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        session.record(
            ToolCallRecord::new("create_rectangle")
                .with_arg("width", json!(240))
                .with_duration(40),
        );
        session.record(ToolCallRecord::new("apply_fill").with_arg("color", json!("#ff0000")));
        if self.crash.contains(&trial.agent_id) {
            anyhow::bail!("design application crashed");
        }
        if let Some((generation, ref cancel)) = self.cancel_in {
            if generation == trial.generation {
                cancel.send(true)?;
            }
        }
        Ok(())
    }
}

/// Finishes every trial without using a single tool
struct SilentAgent;

#[async_trait::async_trait]
impl TrialAgent for SilentAgent {
    async fn run_trial(&self, _trial: &TrialSpec, _session: &mut SessionContext) -> Result<()> {
        Ok(())
    }
}

/// Hands out scripted per-trial scores, with a width overshoot on every run
struct ScriptedMetrics {
    scores: Mutex<VecDeque<f64>>,
}

impl ScriptedMetrics {
    fn new(scores: &[f64]) -> Self {
        Self {
            scores: Mutex::new(scores.iter().copied().collect()),
        }
    }
}

#[async_trait::async_trait]
impl MetricsSource for ScriptedMetrics {
    async fn extract_metrics(&self) -> Result<Metrics> {
        Ok(Metrics::new())
    }

    async fn compare_to_reference(&self, _reference: &Reference) -> Result<Comparison> {
        let score = self
            .scores
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no more scripted scores"))?;
        Ok(Comparison {
            score,
            matched: false,
            deviations: vec![Deviation {
                field: "width".to_string(),
                expected: json!(200),
                actual: json!(240),
                deviation: 40.0,
            }],
        })
    }
}

/// Counts resets; the calls listed in `fail_on` (1-based) fail
#[derive(Default)]
struct CountingReset {
    fail_on: Vec<usize>,
    calls: Arc<Mutex<usize>>,
}

#[async_trait::async_trait]
impl StateReset for CountingReset {
    async fn reset_external_state(&self) -> Result<(), EvolutionError> {
        let mut calls = self.calls.lock().unwrap();
        *calls += 1;
        if self.fail_on.contains(&*calls) {
            return Err(EvolutionError::ExternalUnavailable("bridge not responding".to_string()));
        }
        Ok(())
    }
}

/// Replies from a script; with `cancel` set, requests cancellation while
/// the reply is being produced
struct ScriptedProposer {
    replies: Mutex<VecDeque<String>>,
    cancel: Option<watch::Sender<bool>>,
}

impl ScriptedProposer {
    fn new(replies: &[&str]) -> Self {
        Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            cancel: None,
        }
    }

    fn cancelling(replies: &[&str], cancel: watch::Sender<bool>) -> Self {
        Self {
            cancel: Some(cancel),
            ..Self::new(replies)
        }
    }
}

#[async_trait::async_trait]
impl ImprovementProposer for ScriptedProposer {
    async fn propose(&self, report: &str) -> Result<String> {
        assert!(report.contains("Generation"));
        if let Some(ref cancel) = self.cancel {
            cancel.send(true)?;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("proposer exhausted"))
    }
}

#[derive(Default, Clone)]
struct RecordingVcs {
    commits: Arc<Mutex<Vec<String>>>,
    reverts: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl VersionControl for RecordingVcs {
    async fn commit(&self, message: &str, _metadata: &BTreeMap<String, String>) -> Result<String> {
        let mut commits = self.commits.lock().unwrap();
        commits.push(message.to_string());
        Ok(format!("commit-{}", commits.len()))
    }

    async fn revert(&self, commit_id: &str) -> Result<()> {
        self.reverts.lock().unwrap().push(commit_id.to_string());
        Ok(())
    }
}

fn width_proposal(text: &str) -> String {
    format!(
        r#"```json
{{"type": "parameter", "tool": "create_rectangle", "parameter": "width",
  "proposed": "{}", "rationale": "width overshoots the reference in every run",
  "expected_impact": "higher score"}}
```"#,
        text
    )
}

fn workflow() -> Workflow {
    Workflow {
        name: "event-poster".to_string(),
        category: "layout".to_string(),
        prompt: "Create an A4 event poster".to_string(),
        reference: Metrics::new(),
        tolerance: 1.0,
    }
}

fn evolution_config(agent_count: usize, max_generations: u32) -> EvolutionConfig {
    EvolutionConfig {
        agent_count,
        target_score: 85.0,
        max_generations,
        improvement_threshold: 5.0,
        plateau_generations: 2,
        noise_threshold: 2.0,
        trial_timeout_secs: 5,
        report_patterns: 10,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    docs_dir: std::path::PathBuf,
    vcs: RecordingVcs,
    orchestrator: Orchestrator,
}

fn harness(
    config: EvolutionConfig,
    agent: impl TrialAgent + 'static,
    scores: &[f64],
    reset: CountingReset,
    proposer: Option<ScriptedProposer>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let docs_dir = dir.path().join("docs");
    let docs = FileDocStore::with_dir(docs_dir.clone()).unwrap();
    docs.write("create_rectangle", &DocField::Parameter("width".to_string()), "Width in pixels.")
        .unwrap();

    let vcs = RecordingVcs::default();
    let manager = ImprovementManager::new(
        ImprovementHistory::in_memory(),
        Box::new(docs),
        Box::new(vcs.clone()),
        config.noise_threshold,
    );
    let collaborators = Collaborators {
        agent: Box::new(agent),
        metrics: Box::new(ScriptedMetrics::new(scores)),
        reset: Box::new(reset),
        proposer: proposer.map(|p| Box::new(p) as Box<dyn ImprovementProposer>),
    };
    let orchestrator = Orchestrator::new(config, collaborators, PatternDetector::default(), manager)
        .with_log(GenerationLog::new(dir.path().join("generations.jsonl")));

    Harness {
        _dir: dir,
        docs_dir,
        vcs,
        orchestrator,
    }
}

fn width_doc(docs_dir: &std::path::Path) -> String {
    FileDocStore::with_dir(docs_dir.to_path_buf())
        .unwrap()
        .read("create_rectangle", &DocField::Parameter("width".to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_reset_between_trials_only() -> Result<()> {
    let calls = Arc::new(Mutex::new(0));
    let reset = CountingReset {
        fail_on: vec![],
        calls: calls.clone(),
    };
    let mut h = harness(evolution_config(3, 1), ScriptedAgent::default(), &[50.0; 3], reset, None);

    let result = h.orchestrator.run_generation(&workflow(), 1).await?;

    assert_eq!(result.runs.len(), 3);
    assert_eq!(*calls.lock().unwrap(), 2);
    assert_eq!(result.score, 50.0);
    assert!(result.runs.iter().all(|r| r.success && r.tool_calls.len() == 2));
    Ok(())
}

#[tokio::test]
async fn test_failed_reset_isolates_one_run() -> Result<()> {
    let trials = Arc::new(Mutex::new(Vec::new()));
    let agent = ScriptedAgent {
        trials: trials.clone(),
        ..ScriptedAgent::default()
    };
    let reset = CountingReset {
        fail_on: vec![1],
        calls: Arc::new(Mutex::new(0)),
    };
    let mut h = harness(evolution_config(3, 1), agent, &[60.0, 90.0], reset, None);

    let result = h.orchestrator.run_generation(&workflow(), 1).await?;

    assert_eq!(result.runs.len(), 3);
    assert!(result.runs[0].success);
    assert!(!result.runs[1].success);
    assert!(result.runs[1].tool_calls.is_empty());
    assert!(result.runs[1].error.as_deref().unwrap().contains("state reset failed"));
    assert!(result.runs[2].success);
    assert_eq!(*trials.lock().unwrap(), vec!["agent-0", "agent-2"]);
    assert_eq!(result.score, 50.0);
    Ok(())
}

#[tokio::test]
async fn test_crash_and_timeout_are_failed_runs() -> Result<()> {
    let agent = ScriptedAgent {
        crash: vec!["agent-1".to_string()],
        hang: vec!["agent-2".to_string()],
        ..ScriptedAgent::default()
    };
    let mut config = evolution_config(3, 1);
    config.trial_timeout_secs = 1;
    let mut h = harness(config, agent, &[80.0], CountingReset::default(), None);

    let result = h.orchestrator.run_generation(&workflow(), 1).await?;

    assert!(result.runs[0].success);
    let crashed = &result.runs[1];
    assert!(!crashed.success && crashed.tool_calls.is_empty());
    assert!(crashed.error.as_deref().unwrap().contains("crashed"));
    let hung = &result.runs[2];
    assert!(!hung.success && hung.tool_calls.is_empty());
    assert!(hung.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(result.failed_runs(), 2);
    assert!((result.score - 80.0 / 3.0).abs() < 1e-9);
    Ok(())
}

#[tokio::test]
async fn test_improvement_accepted_and_loop_continues() -> Result<()> {
    let proposer = ScriptedProposer::new(&[
        &width_proposal("Width in points, measured on the artboard."),
        &width_proposal("Width in points. Never exceeds the artboard width."),
    ]);
    let scores = [45.0, 45.0, 45.0, 67.0, 67.0, 67.0, 90.0, 90.0, 90.0];
    let mut h = harness(
        evolution_config(3, 10),
        ScriptedAgent::default(),
        &scores,
        CountingReset::default(),
        Some(proposer),
    );

    let summary = h.orchestrator.evolve(&workflow()).await?;

    assert_eq!(summary.generations.len(), 3);
    assert_eq!(summary.termination, Termination::TargetReached);
    assert_eq!(summary.final_score(), Some(90.0));
    assert!(matches!(summary.generations[0].improvement, ImprovementOutcome::Applied { .. }));
    assert!(matches!(summary.generations[1].improvement, ImprovementOutcome::Applied { .. }));
    assert_eq!(summary.generations[2].improvement, ImprovementOutcome::None);

    let history = h.orchestrator.manager().history();
    assert_eq!(history.len(), 2);
    assert!(history.entries().iter().all(|e| e.state == ImprovementState::Accepted));
    assert_eq!(history.entries()[0].baseline_score, Some(45.0));
    assert_eq!(history.entries()[0].validation_score, Some(67.0));

    let commits = h.vcs.commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 2);
    assert!(commits.iter().all(|m| m.starts_with("Apply improvement")));
    assert_eq!(
        width_doc(&h.docs_dir),
        "Width in points. Never exceeds the artboard width."
    );
    Ok(())
}

#[tokio::test]
async fn test_regression_rolls_back_once() -> Result<()> {
    let proposer = ScriptedProposer::new(&[&width_proposal("Width in inches.")]);
    let scores = [60.0, 60.0, 60.0, 40.0, 40.0, 40.0];
    let mut h = harness(
        evolution_config(3, 2),
        ScriptedAgent::default(),
        &scores,
        CountingReset::default(),
        Some(proposer),
    );

    let summary = h.orchestrator.evolve(&workflow()).await?;

    assert_eq!(summary.termination, Termination::MaxGenerations);
    let history = h.orchestrator.manager().history();
    assert_eq!(history.len(), 1);
    let rejected = &history.entries()[0];
    assert_eq!(rejected.state, ImprovementState::Rejected);
    assert_eq!(rejected.rollback_commit.as_deref(), Some("commit-2"));

    let commits = h.vcs.commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 2);
    assert_eq!(commits.iter().filter(|m| m.starts_with("Roll back")).count(), 1);
    assert!(h.vcs.reverts.lock().unwrap().is_empty());
    assert_eq!(width_doc(&h.docs_dir), "Width in pixels.");
    Ok(())
}

#[tokio::test]
async fn test_malformed_proposal_does_not_stop_the_loop() -> Result<()> {
    let proposer = ScriptedProposer::new(&["I would suggest improving the docs.", "{\"type\": \"rewrite\"}"]);
    let scores = [30.0, 30.0, 40.0, 40.0];
    let mut h = harness(
        evolution_config(2, 2),
        ScriptedAgent::default(),
        &scores,
        CountingReset::default(),
        Some(proposer),
    );

    let summary = h.orchestrator.evolve(&workflow()).await?;

    assert_eq!(summary.generations.len(), 2);
    assert!(matches!(summary.generations[0].improvement, ImprovementOutcome::Malformed { .. }));
    assert!(h.orchestrator.manager().history().is_empty());
    assert!(h.vcs.commits.lock().unwrap().is_empty());
    assert_eq!(width_doc(&h.docs_dir), "Width in pixels.");
    Ok(())
}

#[tokio::test]
async fn test_plateau_stops_the_loop() -> Result<()> {
    let scores = [50.0, 52.0, 53.0];
    let mut h = harness(
        evolution_config(1, 10),
        ScriptedAgent::default(),
        &scores,
        CountingReset::default(),
        None,
    );

    let summary = h.orchestrator.evolve(&workflow()).await?;

    assert_eq!(summary.termination, Termination::Plateau);
    assert_eq!(summary.generations.len(), 3);
    assert!(matches!(summary.generations[0].improvement, ImprovementOutcome::Refused { .. }));
    Ok(())
}

#[tokio::test]
async fn test_cancellation_before_start() -> Result<()> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    let h = harness(
        evolution_config(3, 10),
        ScriptedAgent::default(),
        &[],
        CountingReset::default(),
        None,
    );
    let mut orchestrator = h.orchestrator.with_cancellation(rx);
    tx.send(true)?;

    let summary = orchestrator.evolve(&workflow()).await?;

    assert_eq!(summary.termination, Termination::Cancelled);
    assert!(summary.generations.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_generations_are_logged() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = GenerationLog::new(dir.path().join("log.jsonl"));
    let h = harness(
        evolution_config(1, 2),
        ScriptedAgent::default(),
        &[10.0, 20.0],
        CountingReset::default(),
        None,
    );
    let mut orchestrator = h.orchestrator.with_log(log.clone());

    orchestrator.evolve(&workflow()).await?;

    let logged = log.load()?;
    assert_eq!(logged.len(), 2);
    assert_eq!(logged[1].score, 20.0);
    assert!(!logged[0].patterns.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_trial_without_telemetry_is_failed_run() -> Result<()> {
    let mut h = harness(evolution_config(2, 1), SilentAgent, &[], CountingReset::default(), None);

    let result = h.orchestrator.run_generation(&workflow(), 1).await?;

    assert_eq!(result.runs.len(), 2);
    for run in &result.runs {
        assert!(!run.success);
        assert!(run.tool_calls.is_empty());
        assert_eq!(run.error.as_deref(), Some("no telemetry captured"));
        assert_eq!(run.score, 0.0);
    }
    assert_eq!(result.score, 0.0);
    Ok(())
}

#[tokio::test]
async fn test_unscorable_trial_keeps_its_calls() -> Result<()> {
    let mut h = harness(
        evolution_config(1, 1),
        ScriptedAgent::default(),
        &[],
        CountingReset::default(),
        None,
    );

    let result = h.orchestrator.run_generation(&workflow(), 1).await?;

    let run = &result.runs[0];
    assert!(!run.success);
    assert_eq!(run.score, 0.0);
    assert_eq!(run.tool_sequence(), vec!["create_rectangle", "apply_fill"]);
    assert!(run.error.as_deref().unwrap().starts_with("metric extraction failed"));
    Ok(())
}

#[tokio::test]
async fn test_rejection_keeps_the_restored_baseline() -> Result<()> {
    let proposer = ScriptedProposer::new(&[
        &width_proposal("Width in inches."),
        &width_proposal("Width in furlongs."),
    ]);
    let scores = [60.0, 60.0, 60.0, 40.0, 40.0, 40.0, 45.0, 45.0, 45.0];
    let mut h = harness(
        evolution_config(3, 3),
        ScriptedAgent::default(),
        &scores,
        CountingReset::default(),
        Some(proposer),
    );

    let summary = h.orchestrator.evolve(&workflow()).await?;

    assert_eq!(summary.termination, Termination::MaxGenerations);
    let entries = h.orchestrator.manager().history().entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].state, ImprovementState::Rejected);
    assert_eq!(entries[0].baseline_score, Some(60.0));
    assert_eq!(entries[1].baseline_score, Some(60.0));
    assert_eq!(entries[1].validation_score, Some(45.0));
    assert_eq!(entries[1].state, ImprovementState::Rejected);
    assert_eq!(width_doc(&h.docs_dir), "Width in pixels.");
    assert_eq!(h.vcs.commits.lock().unwrap().len(), 4);
    Ok(())
}

#[tokio::test]
async fn test_cancel_while_proposing_applies_nothing() -> Result<()> {
    let (tx, rx) = watch::channel(false);
    let proposer = ScriptedProposer::cancelling(&[&width_proposal("Width in points.")], tx);
    let h = harness(
        evolution_config(2, 10),
        ScriptedAgent::default(),
        &[40.0, 40.0],
        CountingReset::default(),
        Some(proposer),
    );
    let mut orchestrator = h.orchestrator.with_cancellation(rx);

    let summary = orchestrator.evolve(&workflow()).await?;

    assert_eq!(summary.termination, Termination::Cancelled);
    assert_eq!(summary.generations.len(), 1);
    assert!(matches!(summary.generations[0].improvement, ImprovementOutcome::Refused { .. }));
    assert!(orchestrator.manager().pending().is_none());
    assert!(orchestrator.manager().history().is_empty());
    assert!(h.vcs.commits.lock().unwrap().is_empty());
    assert_eq!(width_doc(&h.docs_dir), "Width in pixels.");
    Ok(())
}

#[tokio::test]
async fn test_cancel_mid_generation_rolls_back_unvalidated_change() -> Result<()> {
    let (tx, rx) = watch::channel(false);
    let agent = ScriptedAgent {
        cancel_in: Some((2, tx)),
        ..ScriptedAgent::default()
    };
    let proposer = ScriptedProposer::new(&[&width_proposal("Width in points.")]);
    let h = harness(
        evolution_config(3, 10),
        agent,
        &[60.0, 60.0, 60.0, 90.0],
        CountingReset::default(),
        Some(proposer),
    );
    let mut orchestrator = h.orchestrator.with_cancellation(rx);

    let summary = orchestrator.evolve(&workflow()).await?;

    assert_eq!(summary.termination, Termination::Cancelled);
    assert_eq!(summary.generations.len(), 2);
    assert_eq!(summary.generations[1].runs.len(), 1);

    let history = orchestrator.manager().history();
    assert_eq!(history.len(), 1);
    let entry = &history.entries()[0];
    assert_eq!(entry.state, ImprovementState::Rejected);
    assert_eq!(entry.validation_score, None);
    assert!(orchestrator.manager().pending().is_none());

    let commits = h.vcs.commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 2);
    assert!(commits[1].starts_with("Roll back"));
    assert_eq!(width_doc(&h.docs_dir), "Width in pixels.");
    Ok(())
}
