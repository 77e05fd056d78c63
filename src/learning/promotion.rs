//! Improvement manager - applies documentation changes and validates them
//!
//! At most one improvement is awaiting validation at any time. It is
//! validated against the next generation's aggregate score: kept when the
//! score holds within the noise threshold, rolled back otherwise.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::bootstrap::DocumentationStore;
use super::improvement::{Improvement, ImprovementState, Proposal};
use super::store::ImprovementHistory;
use crate::bridge::VersionControl;
use crate::error::EvolutionError;

/// Default allowed score drop before an improvement is rolled back
pub const DEFAULT_NOISE_THRESHOLD: f64 = 2.0;

pub struct ImprovementManager {
    history: ImprovementHistory,
    docs: Box<dyn DocumentationStore>,
    vcs: Box<dyn VersionControl>,
    noise_threshold: f64,
}

impl ImprovementManager {
    pub fn new(
        history: ImprovementHistory,
        docs: Box<dyn DocumentationStore>,
        vcs: Box<dyn VersionControl>,
        noise_threshold: f64,
    ) -> Self {
        Self {
            history,
            docs,
            vcs,
            noise_threshold: noise_threshold.max(0.0),
        }
    }

    pub fn history(&self) -> &ImprovementHistory {
        &self.history
    }

    pub fn docs(&self) -> &dyn DocumentationStore {
        self.docs.as_ref()
    }

    /// The improvement awaiting validation, if any
    pub fn pending(&self) -> Option<&Improvement> {
        self.history.pending()
    }

    /// Apply a validated proposal: write the field, checkpoint, record it.
    ///
    /// `baseline_score` is the aggregate score of the generation that
    /// produced the proposal.
    pub async fn apply(&mut self, proposal: &Proposal, generation: u32, baseline_score: f64) -> Result<Improvement> {
        if let Some(pending) = self.history.pending() {
            return Err(EvolutionError::ImprovementPending(pending.id.clone()).into());
        }
        if let Some(previous) = self.history.find_finalized(proposal) {
            return Err(EvolutionError::DuplicateImprovement {
                tool: previous.tool.clone(),
                field: previous.field.to_string(),
                state: previous.state.to_string(),
            }
            .into());
        }

        let tool = proposal.change.tool();
        let field = proposal.change.field();
        let prior = self
            .docs
            .read(tool, &field)
            .with_context(|| format!("Failed to read {}/{}", tool, field))?;
        if prior.trim() == proposal.change.proposed().trim() {
            anyhow::bail!("{}/{} already has the proposed text", tool, field);
        }

        let improvement = Improvement::from_proposal(proposal, prior.clone(), generation);
        let id = improvement.id.clone();
        self.history.append(improvement)?;

        if let Err(e) = self.docs.write(tool, &field, proposal.change.proposed()) {
            self.finalize_failed(&id, format!("documentation write failed: {:#}", e))?;
            return Err(e.context(format!("Failed to apply improvement {}", id)));
        }

        let metadata = self.checkpoint_metadata(&id, ImprovementState::Applied)?;
        let message = format!("Apply improvement {}: {}/{}\n\n{}", id, tool, field, proposal.rationale);
        let commit = match self.vcs.commit(&message, &metadata).await {
            Ok(commit) => commit,
            Err(e) => {
                if let Err(restore) = self.docs.write(tool, &field, &prior) {
                    warn!("Failed to restore {}/{} after checkpoint error: {:#}", tool, field, restore);
                }
                self.finalize_failed(&id, format!("checkpoint failed: {:#}", e))?;
                return Err(e.context(format!("Failed to checkpoint improvement {}", id)));
            }
        };

        let applied = self
            .history
            .update(&id, |imp| {
                imp.state = ImprovementState::Applied;
                imp.baseline_score = Some(baseline_score);
                imp.apply_commit = Some(commit.clone());
            })?
            .clone();

        info!(
            "Applied improvement {} to {}/{} (baseline {:.1}, commit {})",
            id, applied.tool, applied.field, baseline_score, commit
        );
        Ok(applied)
    }

    /// Validate the pending improvement against a new aggregate score.
    ///
    /// Returns the finalized improvement, or `None` when nothing was pending.
    pub async fn validate(&mut self, score: f64) -> Result<Option<Improvement>> {
        let Some(pending) = self.history.pending().cloned() else {
            return Ok(None);
        };
        if pending.state != ImprovementState::Applied {
            self.finalize_failed(&pending.id, "never applied".to_string())?;
            return Ok(self.history.get(&pending.id).cloned());
        }

        let baseline = pending.baseline_score.unwrap_or(0.0);
        if score >= baseline - self.noise_threshold {
            let accepted = self
                .history
                .update(&pending.id, |imp| {
                    imp.state = ImprovementState::Accepted;
                    imp.validation_score = Some(score);
                })?
                .clone();
            info!(
                "Accepted improvement {} (score {:.1} vs baseline {:.1})",
                pending.id, score, baseline
            );
            return Ok(Some(accepted));
        }

        warn!(
            "Rolling back improvement {} (score {:.1} < baseline {:.1} - {:.1})",
            pending.id, score, baseline, self.noise_threshold
        );
        let (rollback_commit, note) = self.roll_back(&pending).await;

        let rejected = self
            .history
            .update(&pending.id, |imp| {
                imp.state = ImprovementState::Rejected;
                imp.validation_score = Some(score);
                imp.rollback_commit = rollback_commit;
                imp.note = note;
            })?
            .clone();
        Ok(Some(rejected))
    }

    /// Roll back the pending improvement without judging it. Used when the
    /// generation that would validate it never completes.
    pub async fn abandon(&mut self, reason: &str) -> Result<Option<Improvement>> {
        let Some(pending) = self.history.pending().cloned() else {
            return Ok(None);
        };
        if pending.state != ImprovementState::Applied {
            self.finalize_failed(&pending.id, reason.to_string())?;
            return Ok(self.history.get(&pending.id).cloned());
        }

        warn!("Abandoning improvement {}: {}", pending.id, reason);
        let (rollback_commit, rollback_note) = self.roll_back(&pending).await;
        let note = match rollback_note {
            Some(extra) => format!("{}; {}", reason, extra),
            None => reason.to_string(),
        };

        let abandoned = self
            .history
            .update(&pending.id, |imp| {
                imp.state = ImprovementState::Rejected;
                imp.rollback_commit = rollback_commit;
                imp.note = Some(note);
            })?
            .clone();
        Ok(Some(abandoned))
    }

    /// Restore the prior text and checkpoint the restore. Falls back to
    /// reverting the apply checkpoint when the restore cannot be written.
    async fn roll_back(&self, pending: &Improvement) -> (Option<String>, Option<String>) {
        match self.docs.write(&pending.tool, &pending.field, &pending.prior_value) {
            Ok(()) => {
                let message = format!("Roll back improvement {}: {}/{}", pending.id, pending.tool, pending.field);
                let metadata = match self.checkpoint_metadata(&pending.id, ImprovementState::Rejected) {
                    Ok(metadata) => metadata,
                    Err(e) => return (None, Some(format!("rollback metadata failed: {:#}", e))),
                };
                match self.vcs.commit(&message, &metadata).await {
                    Ok(commit) => (Some(commit), None),
                    Err(e) => {
                        warn!("Rollback checkpoint for {} failed: {:#}", pending.id, e);
                        (None, Some(format!("rollback checkpoint failed: {:#}", e)))
                    }
                }
            }
            Err(write_err) => {
                warn!("Restore of {}/{} failed, reverting checkpoint: {:#}", pending.tool, pending.field, write_err);
                let Some(ref apply_commit) = pending.apply_commit else {
                    return (None, Some(format!("restore failed and no checkpoint to revert: {:#}", write_err)));
                };
                match self.vcs.revert(apply_commit).await {
                    Ok(()) => (None, Some(format!("restored by reverting {}", apply_commit))),
                    Err(e) => (None, Some(format!("restore and revert both failed: {:#}", e))),
                }
            }
        }
    }

    fn finalize_failed(&mut self, id: &str, reason: String) -> Result<()> {
        debug!("Improvement {} rejected: {}", id, reason);
        self.history.update(id, |imp| {
            imp.state = ImprovementState::Rejected;
            imp.note = Some(reason);
        })?;
        Ok(())
    }

    fn checkpoint_metadata(&self, id: &str, state: ImprovementState) -> Result<BTreeMap<String, String>> {
        let improvement = self
            .history
            .get(id)
            .with_context(|| format!("Unknown improvement {}", id))?;

        let mut metadata = BTreeMap::new();
        metadata.insert("Improvement-Id".to_string(), improvement.id.clone());
        metadata.insert("Tool".to_string(), improvement.tool.clone());
        metadata.insert("Field".to_string(), improvement.field.to_string());
        metadata.insert("Generation".to_string(), improvement.generation_proposed.to_string());
        metadata.insert("State".to_string(), state.to_string());
        Ok(metadata)
    }
}
