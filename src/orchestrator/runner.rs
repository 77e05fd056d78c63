//! Generation runner
//!
//! Runs one workflow through repeated generations. Each generation runs
//! its trials one after another with a state reset in between, scores and
//! analyses the runs, validates the improvement applied by the previous
//! generation and, unless the loop is about to stop, asks for and applies
//! a new one.

use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::catalog::Workflow;
use super::phase::{GenerationPhase, Termination, TerminationPolicy};
use crate::bridge::{ImprovementProposer, MetricsSource, StateReset, TrialAgent, TrialSpec};
use crate::config::EvolutionConfig;
use crate::learning::improvement::{Improvement, ImprovementState, Proposal};
use crate::learning::promotion::ImprovementManager;
use crate::learning::store::GenerationLog;
use crate::metrics::analysis::PatternDetector;
use crate::metrics::execution::SessionContext;
use crate::metrics::report::PatternReport;
use crate::metrics::statistics;
use crate::types::{GenerationResult, ImprovementOutcome, Run};

/// The external collaborators a runner drives
pub struct Collaborators {
    pub agent: Box<dyn TrialAgent>,
    pub metrics: Box<dyn MetricsSource>,
    pub reset: Box<dyn StateReset>,
    /// Without a proposer generations are analysed but never improved
    pub proposer: Option<Box<dyn ImprovementProposer>>,
}

/// Outcome of a full evolution loop
#[derive(Debug, Clone)]
pub struct EvolutionSummary {
    pub workflow: String,
    pub generations: Vec<GenerationResult>,
    pub termination: Termination,
}

impl EvolutionSummary {
    pub fn final_score(&self) -> Option<f64> {
        self.generations.last().map(|g| g.score)
    }
}

pub struct Orchestrator {
    config: EvolutionConfig,
    collaborators: Collaborators,
    detector: PatternDetector,
    manager: ImprovementManager,
    session: SessionContext,
    log: Option<GenerationLog>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Orchestrator {
    pub fn new(
        config: EvolutionConfig,
        collaborators: Collaborators,
        detector: PatternDetector,
        manager: ImprovementManager,
    ) -> Self {
        Self {
            config,
            collaborators,
            detector,
            manager,
            session: SessionContext::new(),
            log: None,
            cancel: None,
        }
    }

    /// Append every closed generation to `log`
    pub fn with_log(mut self, log: GenerationLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Stop at the next check once `true` is sent on the channel
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn manager(&self) -> &ImprovementManager {
        &self.manager
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, |rx| *rx.borrow())
    }

    /// Run generations until a termination condition holds
    pub async fn evolve(&mut self, workflow: &Workflow) -> Result<EvolutionSummary> {
        let mut policy = TerminationPolicy::new(&self.config);
        let mut generations = Vec::new();
        let mut generation = 0;

        info!(workflow = %workflow.name, agents = self.config.agent_count, "Starting evolution");
        self.abandon_pending("left pending by an earlier run").await;

        let termination = loop {
            if self.cancelled() {
                break Termination::Cancelled;
            }
            generation += 1;

            let mut phase = GenerationPhase::Idle;
            let mut result = self.execute_generation(workflow, generation, &mut phase).await?;

            let verdict = if result.runs.len() < self.config.agent_count.max(1) {
                info!(generation, runs = result.runs.len(), "Generation cut short, not validating");
                Some(Termination::Cancelled)
            } else {
                let validated = match self.manager.validate(result.score).await {
                    Ok(Some(improvement)) => {
                        info!(
                            id = %improvement.id,
                            state = %improvement.state,
                            "Validated previous improvement"
                        );
                        Some(improvement)
                    }
                    Ok(None) => None,
                    Err(e) => {
                        error!("Validation of pending improvement failed: {:#}", e);
                        None
                    }
                };

                let verdict = policy.observe(generation, result.score).or_else(|| {
                    self.cancelled().then_some(Termination::Cancelled)
                });
                if verdict.is_none() {
                    let baseline = proposal_baseline(validated.as_ref(), result.score);
                    result.improvement = self.propose_improvement(&result, baseline).await;
                }
                verdict
            };

            phase.advance(GenerationPhase::Closed)?;
            self.record(&result);
            info!(
                generation,
                score = result.score,
                patterns = result.patterns.len(),
                "Generation closed"
            );
            generations.push(result);

            if let Some(reason) = verdict {
                break reason;
            }
        };

        if termination == Termination::Cancelled {
            self.abandon_pending("cancelled before validation").await;
        }

        info!(workflow = %workflow.name, %termination, generations = generations.len(), "Evolution finished");
        Ok(EvolutionSummary {
            workflow: workflow.name.clone(),
            generations,
            termination,
        })
    }

    /// Run and analyse a single generation without proposing an improvement
    pub async fn run_generation(&mut self, workflow: &Workflow, generation: u32) -> Result<GenerationResult> {
        let mut phase = GenerationPhase::Idle;
        let result = self.execute_generation(workflow, generation, &mut phase).await?;
        phase.advance(GenerationPhase::Closed)?;
        self.record(&result);
        Ok(result)
    }

    /// Idle through Analyzed
    async fn execute_generation(
        &mut self,
        workflow: &Workflow,
        generation: u32,
        phase: &mut GenerationPhase,
    ) -> Result<GenerationResult> {
        phase.advance(GenerationPhase::Preparing)?;
        if self.session.is_active() {
            warn!("Discarding telemetry session left open by a previous trial");
            self.session.end_session();
        }

        phase.advance(GenerationPhase::Executing)?;
        let runs = self.execute_trials(workflow, generation).await;

        phase.advance(GenerationPhase::Collecting)?;
        let scores: Vec<f64> = runs.iter().map(|r| r.score).collect();
        let score = statistics::mean(&scores);

        let patterns = self.detector.detect(&runs);
        phase.advance(GenerationPhase::Analyzed)?;
        debug!(generation, score, patterns = patterns.len(), "Generation analysed");

        Ok(GenerationResult {
            generation,
            workflow: workflow.name.clone(),
            runs,
            score,
            patterns,
            improvement: ImprovementOutcome::None,
            completed_at: chrono::Utc::now(),
        })
    }

    async fn execute_trials(&mut self, workflow: &Workflow, generation: u32) -> Vec<Run> {
        let count = self.config.agent_count.max(1);
        let mut runs = Vec::with_capacity(count);

        for index in 0..count {
            let agent_id = format!("agent-{}", index);
            if index > 0 {
                if self.cancelled() {
                    info!(generation, completed = runs.len(), "Cancelled between trials");
                    break;
                }
                if let Err(e) = self.collaborators.reset.reset_external_state().await {
                    warn!(agent = %agent_id, "State reset failed: {}", e);
                    runs.push(Run::failed(&agent_id, generation, format!("state reset failed: {}", e)));
                    continue;
                }
            }
            runs.push(self.run_trial(workflow, generation, &agent_id).await);
        }
        runs
    }

    async fn run_trial(&mut self, workflow: &Workflow, generation: u32, agent_id: &str) -> Run {
        let session_id = match self.session.start_session(agent_id, generation) {
            Ok(id) => id,
            Err(e) => return Run::failed(agent_id, generation, e.to_string()),
        };
        let trial = TrialSpec {
            agent_id: agent_id.to_string(),
            generation,
            workflow: workflow.name.clone(),
            prompt: workflow.prompt.clone(),
            session_id,
        };

        let limit = Duration::from_secs(self.config.trial_timeout_secs);
        let outcome = tokio::time::timeout(
            limit,
            self.collaborators.agent.run_trial(&trial, &mut self.session),
        )
        .await;
        let session = self.session.end_session();

        match outcome {
            Err(_) => {
                warn!(agent = agent_id, "Trial timed out after {}s", limit.as_secs());
                return Run::failed(agent_id, generation, format!("trial timed out after {}s", limit.as_secs()));
            }
            Ok(Err(e)) => {
                warn!(agent = agent_id, "Trial crashed: {:#}", e);
                return Run::failed(agent_id, generation, format!("trial crashed: {:#}", e));
            }
            Ok(Ok(())) => {}
        }

        let calls = match session {
            Some(session) if !session.calls.is_empty() => session.calls,
            _ => return Run::failed(agent_id, generation, "no telemetry captured"),
        };

        match self.collaborators.metrics.compare_to_reference(&workflow.reference()).await {
            Ok(comparison) => {
                debug!(agent = agent_id, score = comparison.score, calls = calls.len(), "Trial scored");
                Run::captured(agent_id, generation, calls, comparison)
            }
            Err(e) => {
                warn!(agent = agent_id, "Metric extraction failed: {:#}", e);
                Run::unscored(agent_id, generation, calls, format!("metric extraction failed: {:#}", e))
            }
        }
    }

    async fn propose_improvement(&mut self, result: &GenerationResult, baseline: f64) -> ImprovementOutcome {
        if result.patterns.is_empty() {
            debug!(generation = result.generation, "No patterns, skipping proposal");
            return ImprovementOutcome::None;
        }

        let Some(ref proposer) = self.collaborators.proposer else {
            return ImprovementOutcome::Refused {
                reason: "no improvement proposer configured".to_string(),
            };
        };

        let report = PatternReport::build(result, self.config.report_patterns);
        let raw = match proposer.propose(&report.text).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Proposer unavailable: {:#}", e);
                return ImprovementOutcome::Refused {
                    reason: format!("proposer unavailable: {:#}", e),
                };
            }
        };

        if self.cancelled() {
            info!(generation = result.generation, "Cancelled while proposing, not applying");
            return ImprovementOutcome::Refused {
                reason: "cancelled before apply".to_string(),
            };
        }

        let mut known_tools = self.manager.docs().tools().unwrap_or_default();
        for run in &result.runs {
            for call in &run.tool_calls {
                if !known_tools.contains(&call.tool) {
                    known_tools.push(call.tool.clone());
                }
            }
        }
        let proposal = match Proposal::parse(&raw, &known_tools) {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!("Discarding proposal: {}", e);
                return ImprovementOutcome::Malformed { reason: e.to_string() };
            }
        };

        match self.manager.apply(&proposal, result.generation, baseline).await {
            Ok(improvement) => ImprovementOutcome::Applied {
                improvement_id: improvement.id,
            },
            Err(e) => {
                warn!("Improvement refused: {:#}", e);
                ImprovementOutcome::Refused {
                    reason: format!("{:#}", e),
                }
            }
        }
    }

    async fn abandon_pending(&mut self, reason: &str) {
        match self.manager.abandon(reason).await {
            Ok(Some(improvement)) => info!(id = %improvement.id, "Rolled back unvalidated improvement"),
            Ok(None) => {}
            Err(e) => error!("Failed to roll back unvalidated improvement: {:#}", e),
        }
    }

    fn record(&self, result: &GenerationResult) {
        if let Some(ref log) = self.log {
            if let Err(e) = log.append(result) {
                warn!("Failed to append to generation log: {:#}", e);
            }
        }
    }
}

/// Score a new proposal is judged against. A generation that just rejected
/// an improvement was measured under the reverted text, so the rejected
/// improvement's own baseline still describes the restored docs.
fn proposal_baseline(validated: Option<&Improvement>, score: f64) -> f64 {
    match validated {
        Some(improvement) if improvement.state == ImprovementState::Rejected => {
            improvement.baseline_score.unwrap_or(score)
        }
        _ => score,
    }
}
