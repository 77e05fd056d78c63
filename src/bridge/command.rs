//! Command bridge - drives the design application through shell commands
//!
//! Trials, metric extraction and resets are configured command templates.
//! A trial command receives its prompt in `EVOLVE_PROMPT` and must write the
//! tool calls it made to the file named by `EVOLVE_TELEMETRY_FILE`, either
//! as a JSON array or as one JSON object per line.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{MetricsSource, TargetReset, TrialAgent, TrialSpec};
use crate::config::BridgeConfig;
use crate::metrics::execution::SessionContext;
use crate::types::{Metrics, ToolCallRecord};

/// Captured output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct CommandBridge {
    config: BridgeConfig,
    telemetry_dir: PathBuf,
}

impl CommandBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            telemetry_dir: std::env::temp_dir(),
        }
    }

    pub fn with_telemetry_dir(mut self, dir: PathBuf) -> Self {
        self.telemetry_dir = dir;
        self
    }

    fn primary_target(&self) -> &str {
        self.config.targets.first().map(String::as_str).unwrap_or("")
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    async fn run(
        &self,
        command: &str,
        env: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        run_shell(command, self.config.working_dir.as_deref(), env, timeout).await
    }
}

/// Removes a trial's telemetry file when dropped, including when the
/// trial is abandoned by the watchdog
struct TelemetryFile(PathBuf);

impl Drop for TelemetryFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.0.display(), e);
            }
        }
    }
}

#[async_trait::async_trait]
impl TrialAgent for CommandBridge {
    async fn run_trial(&self, trial: &TrialSpec, session: &mut SessionContext) -> Result<()> {
        let telemetry_file = TelemetryFile(
            self.telemetry_dir
                .join(format!("evolve-telemetry-{}.json", trial.session_id)),
        );
        let generation = trial.generation.to_string();
        let command = render(
            &self.config.trial_command,
            &[
                ("target", self.primary_target()),
                ("agent", trial.agent_id.as_str()),
                ("generation", generation.as_str()),
                ("session", trial.session_id.as_str()),
                ("workflow", trial.workflow.as_str()),
            ],
        );

        let env = [
            ("EVOLVE_PROMPT", trial.prompt.clone()),
            ("EVOLVE_TELEMETRY_FILE", telemetry_file.0.display().to_string()),
            ("EVOLVE_SESSION", trial.session_id.clone()),
        ];
        // Trials are bounded by the orchestrator's watchdog
        let output = self.run(&command, &env, None).await;

        let calls = read_telemetry(&telemetry_file.0).await;
        drop(telemetry_file);
        let output = output?;

        match calls {
            Ok(calls) => {
                debug!(session = %trial.session_id, calls = calls.len(), "Trial telemetry read");
                for call in calls {
                    session.record(call);
                }
            }
            Err(e) => warn!("Unreadable telemetry for session {}: {:#}", trial.session_id, e),
        }

        if !output.success() {
            bail!(
                "trial command exited with {:?}: {}",
                output.exit_code,
                crate::truncate_safe(output.stderr.trim(), 500)
            );
        }
        info!(agent = %trial.agent_id, duration_ms = output.duration_ms, "Trial command finished");
        Ok(())
    }
}

#[async_trait::async_trait]
impl MetricsSource for CommandBridge {
    async fn extract_metrics(&self) -> Result<Metrics> {
        let command = render(&self.config.metrics_command, &[("target", self.primary_target())]);
        let output = self.run(&command, &[], Some(self.command_timeout())).await?;
        if !output.success() {
            bail!(
                "metrics command exited with {:?}: {}",
                output.exit_code,
                crate::truncate_safe(output.stderr.trim(), 500)
            );
        }
        serde_json::from_str(output.stdout.trim()).with_context(|| {
            format!(
                "metrics command did not print a JSON object: {}",
                crate::truncate_safe(output.stdout.trim(), 200)
            )
        })
    }
}

#[async_trait::async_trait]
impl TargetReset for CommandBridge {
    async fn reset_target(&self, target: &str) -> Result<()> {
        let command = render(&self.config.reset_command, &[("target", target)]);
        let output = self.run(&command, &[], Some(self.command_timeout())).await?;
        if !output.success() {
            bail!(
                "reset command exited with {:?}: {}",
                output.exit_code,
                crate::truncate_safe(output.stderr.trim(), 500)
            );
        }
        debug!(reset_target = target, "External state reset");
        Ok(())
    }
}

/// Substitute `{name}` placeholders
pub fn render(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

/// Parse telemetry written by a trial. A missing file yields no calls.
pub async fn read_telemetry(path: &Path) -> Result<Vec<ToolCallRecord>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };
    parse_telemetry(&content)
}

pub fn parse_telemetry(content: &str) -> Result<Vec<ToolCallRecord>> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).context("Invalid telemetry array");
    }
    trimmed
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid telemetry line {}", i + 1))
        })
        .collect()
}

/// Run `command` through `sh -c`, capturing output
pub async fn run_shell(
    command: &str,
    working_dir: Option<&Path>,
    env: &[(&str, String)],
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    let start = Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let child = cmd.spawn().with_context(|| format!("Failed to spawn '{}'", command))?;
    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("'{}' timed out after {}s", command, limit.as_secs()))?,
        None => child.wait_with_output().await,
    }
    .context("Failed to get command output")?;

    let duration_ms = start.elapsed().as_millis() as u64;
    debug!(command = %command, exit_code = ?output.status.code(), duration_ms, "Command executed");

    Ok(CommandOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms,
    })
}
