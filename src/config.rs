//! Configuration management
//!
//! Loop parameters, collaborator commands, documentation and catalog
//! locations, and the proposer model.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use crate::metrics::analysis::DetectorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Generation loop parameters
    #[serde(default)]
    pub evolution: EvolutionConfig,
    /// Pattern detection thresholds
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Commands that drive the external application
    #[serde(default)]
    pub bridge: BridgeConfig,
    /// Tool documentation location
    #[serde(default)]
    pub docs: DocsConfig,
    /// Improvement proposer settings
    #[serde(default)]
    pub proposer: ProposerConfig,
    /// Workflow catalog location
    #[serde(default)]
    pub catalog: CatalogConfig,
    /// Improvement history and generation log location
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Trials per generation
    #[serde(default = "default_agent_count")]
    pub agent_count: usize,
    /// Stop once a generation scores at least this
    #[serde(default = "default_target_score")]
    pub target_score: f64,
    #[serde(default = "default_max_generations")]
    pub max_generations: u32,
    /// Score gain below which a generation counts as stalled
    #[serde(default = "default_improvement_threshold")]
    pub improvement_threshold: f64,
    /// Stalled generations in a row that end the loop
    #[serde(default = "default_plateau_generations")]
    pub plateau_generations: u32,
    /// Score drop tolerated before an improvement is rolled back
    #[serde(default = "default_noise_threshold")]
    pub noise_threshold: f64,
    /// Watchdog for a single trial
    #[serde(default = "default_trial_timeout")]
    pub trial_timeout_secs: u64,
    /// Patterns included in the proposer report
    #[serde(default = "default_report_patterns")]
    pub report_patterns: usize,
}

fn default_agent_count() -> usize {
    3
}

fn default_target_score() -> f64 {
    85.0
}

fn default_max_generations() -> u32 {
    10
}

fn default_improvement_threshold() -> f64 {
    5.0
}

fn default_plateau_generations() -> u32 {
    2
}

fn default_noise_threshold() -> f64 {
    crate::learning::promotion::DEFAULT_NOISE_THRESHOLD
}

fn default_trial_timeout() -> u64 {
    600
}

fn default_report_patterns() -> usize {
    10
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            agent_count: default_agent_count(),
            target_score: default_target_score(),
            max_generations: default_max_generations(),
            improvement_threshold: default_improvement_threshold(),
            plateau_generations: default_plateau_generations(),
            noise_threshold: default_noise_threshold(),
            trial_timeout_secs: default_trial_timeout(),
            report_patterns: default_report_patterns(),
        }
    }
}

/// Shell command templates. Placeholders: `{target}`, `{agent}`,
/// `{generation}`, `{session}`, `{workflow}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Runs one trial; must write telemetry to `$EVOLVE_TELEMETRY_FILE`
    #[serde(default = "default_trial_command")]
    pub trial_command: String,
    /// Prints the current document's metrics as a JSON object
    #[serde(default = "default_metrics_command")]
    pub metrics_command: String,
    /// Returns `{target}` to a clean state
    #[serde(default = "default_reset_command")]
    pub reset_command: String,
    /// Reset targets, tried in order
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,
    #[serde(default = "default_max_reset_attempts")]
    pub max_reset_attempts: u32,
    #[serde(default = "default_reset_backoff_ms")]
    pub reset_backoff_ms: u64,
    /// Timeout for metrics and reset commands
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_trial_command() -> String {
    "design-agent run --workflow {workflow} --session {session}".to_string()
}

fn default_metrics_command() -> String {
    "design-bridge metrics --target {target}".to_string()
}

fn default_reset_command() -> String {
    "design-bridge reset --target {target}".to_string()
}

fn default_targets() -> Vec<String> {
    vec!["localhost:8765".to_string()]
}

fn default_max_reset_attempts() -> u32 {
    3
}

fn default_reset_backoff_ms() -> u64 {
    500
}

fn default_command_timeout() -> u64 {
    30
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            trial_command: default_trial_command(),
            metrics_command: default_metrics_command(),
            reset_command: default_reset_command(),
            targets: default_targets(),
            max_reset_attempts: default_max_reset_attempts(),
            reset_backoff_ms: default_reset_backoff_ms(),
            command_timeout_secs: default_command_timeout(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocsConfig {
    /// Tool documentation directory; defaults to `<data dir>/tool-docs`
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Git repository holding the docs; defaults to the docs directory
    #[serde(default)]
    pub repo_dir: Option<PathBuf>,
}

impl DocsConfig {
    pub fn resolved_dir(&self) -> Result<PathBuf> {
        match self.dir {
            Some(ref dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("tool-docs")),
        }
    }

    pub fn resolved_repo_dir(&self) -> Result<PathBuf> {
        match self.repo_dir {
            Some(ref dir) => Ok(dir.clone()),
            None => self.resolved_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposerConfig {
    #[serde(default = "default_proposer_model")]
    pub model: String,
    #[serde(default = "default_proposer_base_url")]
    pub base_url: String,
    #[serde(default = "default_proposer_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_proposer_timeout")]
    pub timeout_secs: u64,
}

fn default_proposer_model() -> String {
    "anthropic/claude-3.5-sonnet".to_string()
}

fn default_proposer_base_url() -> String {
    crate::bridge::llm::OPENROUTER_BASE_URL.to_string()
}

fn default_proposer_max_tokens() -> u32 {
    1024
}

fn default_proposer_timeout() -> u64 {
    120
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            model: default_proposer_model(),
            base_url: default_proposer_base_url(),
            max_tokens: default_proposer_max_tokens(),
            timeout_secs: default_proposer_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Workflow catalog; defaults to `<config dir>/workflows.yaml`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl CatalogConfig {
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match self.path {
            Some(ref path) => Ok(path.clone()),
            None => Ok(project_dirs()?.config_dir().join("workflows.yaml")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the improvement history and the generation log;
    /// defaults to the data directory
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn resolved_dir(&self) -> Result<PathBuf> {
        match self.dir {
            Some(ref dir) => Ok(dir.clone()),
            None => data_dir(),
        }
    }

    pub fn history_path(&self) -> Result<PathBuf> {
        Ok(self.resolved_dir()?.join("improvements.json"))
    }

    pub fn generation_log_path(&self) -> Result<PathBuf> {
        Ok(self.resolved_dir()?.join("generations.jsonl"))
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "creative-evolve", "creative-evolve")
        .context("Failed to get project directories")
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}

/// Show current configuration
pub fn show_config() -> Result<()> {
    let config = Config::load()?;
    let evolution = &config.evolution;

    println!("Configuration: {}", config_path()?.display());
    println!();
    println!("Evolution:");
    println!("  agent count:           {}", evolution.agent_count);
    println!("  target score:          {}", evolution.target_score);
    println!("  max generations:       {}", evolution.max_generations);
    println!("  improvement threshold: {}", evolution.improvement_threshold);
    println!("  plateau generations:   {}", evolution.plateau_generations);
    println!("  noise threshold:       {}", evolution.noise_threshold);
    println!("  trial timeout:         {}s", evolution.trial_timeout_secs);
    println!();
    println!("Bridge:");
    println!("  trial:   {}", config.bridge.trial_command);
    println!("  metrics: {}", config.bridge.metrics_command);
    println!("  reset:   {}", config.bridge.reset_command);
    println!("  targets: {}", config.bridge.targets.join(", "));
    println!();
    println!("Docs:     {}", config.docs.resolved_dir()?.display());
    println!("Catalog:  {}", config.catalog.resolved_path()?.display());
    println!("Storage:  {}", config.storage.resolved_dir()?.display());
    println!("Proposer: {} ({} max tokens)", config.proposer.model, config.proposer.max_tokens);
    println!(
        "API key:  {}",
        if crate::security::has_api_key() { "configured" } else { "not configured" }
    );

    Ok(())
}

/// Set API key
pub fn set_api_key(key: &str) -> Result<()> {
    crate::security::set_api_key(key)?;
    println!("API key stored securely.");
    Ok(())
}

/// Reset configuration to defaults
pub fn reset_config() -> Result<()> {
    let config = Config::default();
    config.save()?;
    println!("Configuration reset to defaults.");
    Ok(())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}
