//! Reset failover - retries a state reset across alternate targets
//!
//! A reset that fails on one target is retried on the next one in the
//! chain, up to a bounded number of attempts. When every attempt fails the
//! application is reported unavailable.

use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

use super::StateReset;
use crate::error::EvolutionError;

/// Resets a single, named target
#[async_trait::async_trait]
pub trait TargetReset: Send + Sync {
    async fn reset_target(&self, target: &str) -> Result<()>;
}

pub struct FailoverReset {
    inner: Box<dyn TargetReset>,
    targets: Vec<String>,
    max_attempts: u32,
    backoff: Duration,
}

impl FailoverReset {
    pub fn new(inner: Box<dyn TargetReset>, targets: Vec<String>) -> Self {
        Self {
            inner,
            targets,
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

#[async_trait::async_trait]
impl StateReset for FailoverReset {
    async fn reset_external_state(&self) -> Result<(), EvolutionError> {
        if self.targets.is_empty() {
            return Err(EvolutionError::ExternalUnavailable("no reset targets configured".to_string()));
        }

        let mut last_error = String::new();
        for attempt in 0..self.max_attempts {
            let target = &self.targets[attempt as usize % self.targets.len()];
            match self.inner.reset_target(target).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!("Reset succeeded on {} (attempt {})", target, attempt + 1);
                    }
                    return Ok(());
                }
                Err(e) => {
                    warn!("Reset of {} failed (attempt {}/{}): {:#}", target, attempt + 1, self.max_attempts, e);
                    last_error = format!("{}: {:#}", target, e);
                    if attempt + 1 < self.max_attempts && !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
            }
        }

        Err(EvolutionError::ExternalUnavailable(format!(
            "reset failed after {} attempts, last error {}",
            self.max_attempts, last_error
        )))
    }
}
