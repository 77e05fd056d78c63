//! Generation lifecycle and loop termination

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EvolutionConfig;
use crate::error::EvolutionError;

/// Phase of a single generation. Phases only move forward, one step at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationPhase {
    Idle,
    Preparing,
    Executing,
    Collecting,
    Analyzed,
    Closed,
}

impl GenerationPhase {
    pub fn next(self) -> Option<Self> {
        match self {
            GenerationPhase::Idle => Some(GenerationPhase::Preparing),
            GenerationPhase::Preparing => Some(GenerationPhase::Executing),
            GenerationPhase::Executing => Some(GenerationPhase::Collecting),
            GenerationPhase::Collecting => Some(GenerationPhase::Analyzed),
            GenerationPhase::Analyzed => Some(GenerationPhase::Closed),
            GenerationPhase::Closed => None,
        }
    }

    pub fn advance(&mut self, to: GenerationPhase) -> Result<(), EvolutionError> {
        if self.next() != Some(to) {
            return Err(EvolutionError::InvalidTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        debug!(from = %self, to = %to, "Generation phase");
        *self = to;
        Ok(())
    }
}

impl std::fmt::Display for GenerationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationPhase::Idle => write!(f, "idle"),
            GenerationPhase::Preparing => write!(f, "preparing"),
            GenerationPhase::Executing => write!(f, "executing"),
            GenerationPhase::Collecting => write!(f, "collecting"),
            GenerationPhase::Analyzed => write!(f, "analyzed"),
            GenerationPhase::Closed => write!(f, "closed"),
        }
    }
}

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    TargetReached,
    MaxGenerations,
    Plateau,
    Cancelled,
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::TargetReached => write!(f, "target score reached"),
            Termination::MaxGenerations => write!(f, "generation limit reached"),
            Termination::Plateau => write!(f, "score plateaued"),
            Termination::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Tracks aggregate scores across generations and decides when to stop
#[derive(Debug, Clone)]
pub struct TerminationPolicy {
    target_score: f64,
    max_generations: u32,
    improvement_threshold: f64,
    plateau_generations: u32,
    previous: Option<f64>,
    stalled: u32,
}

impl TerminationPolicy {
    pub fn new(config: &EvolutionConfig) -> Self {
        Self {
            target_score: config.target_score,
            max_generations: config.max_generations.max(1),
            improvement_threshold: config.improvement_threshold,
            plateau_generations: config.plateau_generations.max(1),
            previous: None,
            stalled: 0,
        }
    }

    /// Record a closed generation's score. Returns the reason to stop, if any.
    pub fn observe(&mut self, generation: u32, score: f64) -> Option<Termination> {
        if let Some(previous) = self.previous {
            if score - previous < self.improvement_threshold {
                self.stalled += 1;
            } else {
                self.stalled = 0;
            }
        }
        self.previous = Some(score);

        if score >= self.target_score {
            Some(Termination::TargetReached)
        } else if generation >= self.max_generations {
            Some(Termination::MaxGenerations)
        } else if self.stalled >= self.plateau_generations {
            Some(Termination::Plateau)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_generations: u32) -> TerminationPolicy {
        TerminationPolicy::new(&EvolutionConfig {
            target_score: 85.0,
            max_generations,
            improvement_threshold: 5.0,
            plateau_generations: 2,
            ..EvolutionConfig::default()
        })
    }

    #[test]
    fn test_phases_advance_in_order() {
        let mut phase = GenerationPhase::Idle;
        for next in [
            GenerationPhase::Preparing,
            GenerationPhase::Executing,
            GenerationPhase::Collecting,
            GenerationPhase::Analyzed,
            GenerationPhase::Closed,
        ] {
            phase.advance(next).unwrap();
        }
        assert_eq!(phase, GenerationPhase::Closed);
        assert!(phase.advance(GenerationPhase::Idle).is_err());
    }

    #[test]
    fn test_phase_cannot_skip() {
        let mut phase = GenerationPhase::Preparing;
        let err = phase.advance(GenerationPhase::Analyzed).unwrap_err();
        assert!(matches!(err, EvolutionError::InvalidTransition { .. }));
        assert_eq!(phase, GenerationPhase::Preparing);
    }

    #[test]
    fn test_target_reached() {
        let mut policy = policy(10);
        assert_eq!(policy.observe(1, 45.0), None);
        assert_eq!(policy.observe(2, 90.0), Some(Termination::TargetReached));
    }

    #[test]
    fn test_max_generations() {
        let mut policy = policy(2);
        assert_eq!(policy.observe(1, 10.0), None);
        assert_eq!(policy.observe(2, 30.0), Some(Termination::MaxGenerations));
    }

    #[test]
    fn test_plateau_needs_consecutive_stalls() {
        let mut policy = policy(10);
        assert_eq!(policy.observe(1, 45.0), None);
        assert_eq!(policy.observe(2, 47.0), None);
        assert_eq!(policy.observe(3, 60.0), None);
        assert_eq!(policy.observe(4, 61.0), None);
        assert_eq!(policy.observe(5, 62.0), Some(Termination::Plateau));
    }

    #[test]
    fn test_improvement_resets_plateau() {
        let mut policy = policy(10);
        policy.observe(1, 45.0);
        assert_eq!(policy.observe(2, 67.0), None);
        assert_eq!(policy.observe(3, 68.0), None);
    }
}
