//! Improvement history and generation log
//!
//! Both are append-only. The improvement history is a JSON array rewritten
//! on each change; finalized entries are never modified. The generation log
//! is JSON Lines, one [`GenerationResult`] per line.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::improvement::{Improvement, ImprovementState, Proposal};
use crate::types::GenerationResult;

/// Persistent, append-only record of every improvement ever proposed
#[derive(Debug, Default)]
pub struct ImprovementHistory {
    path: Option<PathBuf>,
    entries: Vec<Improvement>,
}

impl ImprovementHistory {
    /// History that lives only in memory
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) the history file at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read improvement history {}", path.display()))?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&content).context("Failed to parse improvement history")?
            }
        } else {
            Vec::new()
        };

        debug!("Loaded {} improvements from {}", entries.len(), path.display());
        Ok(Self { path: Some(path), entries })
    }

    pub fn entries(&self) -> &[Improvement] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Improvement> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// The one improvement still awaiting validation, if any
    pub fn pending(&self) -> Option<&Improvement> {
        self.entries.iter().find(|e| !e.state.is_final())
    }

    pub fn by_state(&self, state: ImprovementState) -> Vec<&Improvement> {
        self.entries.iter().filter(|e| e.state == state).collect()
    }

    /// A finalized entry with the same target and text as `proposal`
    pub fn find_finalized(&self, proposal: &Proposal) -> Option<&Improvement> {
        self.entries
            .iter()
            .find(|e| e.state.is_final() && e.same_change(proposal))
    }

    /// Append a new entry
    pub fn append(&mut self, improvement: Improvement) -> Result<()> {
        if self.entries.iter().any(|e| e.id == improvement.id) {
            bail!("Improvement {} already recorded", improvement.id);
        }
        info!(
            "Recorded improvement {} for {}/{}",
            improvement.id, improvement.tool, improvement.field
        );
        self.entries.push(improvement);
        self.persist()
    }

    /// Update a non-final entry. Finalized entries are immutable.
    pub fn update<F>(&mut self, id: &str, apply: F) -> Result<&Improvement>
    where
        F: FnOnce(&mut Improvement),
    {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .with_context(|| format!("Unknown improvement {}", id))?;

        if self.entries[index].state.is_final() {
            bail!("Improvement {} is {} and can no longer change", id, self.entries[index].state);
        }

        apply(&mut self.entries[index]);
        self.entries[index].updated_at = Utc::now();
        self.persist()?;
        Ok(&self.entries[index])
    }

    fn persist(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create history directory")?;
        }
        let content = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write improvement history {}", path.display()))?;
        Ok(())
    }
}

/// Append-only log of closed generations
#[derive(Debug, Clone)]
pub struct GenerationLog {
    path: PathBuf,
}

impl GenerationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, result: &GenerationResult) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create log directory")?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open generation log {}", self.path.display()))?;
        writeln!(file, "{}", serde_json::to_string(result)?)?;
        Ok(())
    }

    /// Every readable generation, oldest first. Corrupt lines are skipped.
    pub fn load(&self) -> Result<Vec<GenerationResult>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read generation log {}", self.path.display()))?;

        let mut results = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(result) => results.push(result),
                Err(e) => warn!("Skipping generation log line {}: {}", line_no + 1, e),
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::improvement::ProposedChange;
    use crate::types::ImprovementOutcome;
    use tempfile::TempDir;

    fn proposal(text: &str) -> Proposal {
        Proposal {
            change: ProposedChange::Warning {
                tool: "apply_fill".to_string(),
                proposed: text.to_string(),
            },
            rationale: "fills are wrong in most runs".to_string(),
            expected_impact: String::new(),
        }
    }

    #[test]
    fn test_history_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("improvements.json");

        let mut history = ImprovementHistory::open(&path).unwrap();
        let entry = Improvement::from_proposal(&proposal("Select a shape first."), String::new(), 1);
        let id = entry.id.clone();
        history.append(entry).unwrap();
        history.update(&id, |e| e.state = ImprovementState::Applied).unwrap();

        let reloaded = ImprovementHistory::open(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.pending().unwrap().state, ImprovementState::Applied);
    }

    #[test]
    fn test_finalized_entries_are_immutable() {
        let mut history = ImprovementHistory::in_memory();
        let entry = Improvement::from_proposal(&proposal("Select a shape first."), String::new(), 1);
        let id = entry.id.clone();
        history.append(entry).unwrap();
        history.update(&id, |e| e.state = ImprovementState::Rejected).unwrap();

        assert!(history.update(&id, |e| e.state = ImprovementState::Accepted).is_err());
        assert_eq!(history.get(&id).unwrap().state, ImprovementState::Rejected);
        assert!(history.pending().is_none());
        assert_eq!(history.by_state(ImprovementState::Rejected).len(), 1);
        assert!(history.by_state(ImprovementState::Accepted).is_empty());
        assert!(history.find_finalized(&proposal("Select a shape first.")).is_some());
        assert!(history.find_finalized(&proposal("Something else.")).is_none());
    }

    #[test]
    fn test_generation_log_round_trip_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let log = GenerationLog::new(dir.path().join("generations.jsonl"));
        assert!(log.load().unwrap().is_empty());

        let result = GenerationResult {
            generation: 1,
            workflow: "poster".to_string(),
            runs: vec![],
            score: 45.0,
            patterns: vec![],
            improvement: ImprovementOutcome::None,
            completed_at: Utc::now(),
        };
        log.append(&result).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();
        log.append(&GenerationResult { generation: 2, ..result }).unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].generation, 2);
    }
}
