//! CLI interface for creative-evolve

use anyhow::{bail, Result};
use clap::{ArgGroup, Parser, Subcommand};
use std::time::Duration;
use tracing::info;

use crate::bridge::{CommandBridge, FailoverReset, GitVersionControl, ImprovementProposer, OpenRouterProposer};
use crate::config::{self, Config};
use crate::learning::{FileDocStore, GenerationLog, ImprovementHistory, ImprovementManager, ImprovementState};
use crate::metrics::{stats_report, PatternDetector, PatternReport};
use crate::orchestrator::{Catalog, Collaborators, Orchestrator, Selection};

#[derive(Parser)]
#[command(name = "creative-evolve")]
#[command(about = "Evolve design-agent tool documentation from repeated workflow trials", long_about = None)]
#[command(version)]
struct Cli {
    /// Use this config file instead of the default location
    #[arg(long, global = true, env = "CREATIVE_EVOLVE_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one analysed generation of the selected workflows
    #[command(group(ArgGroup::new("selection").required(true).args(["all", "category", "workflow", "stats"])))]
    Run {
        /// Every workflow in the catalog
        #[arg(long)]
        all: bool,
        /// Workflows in a category
        #[arg(long)]
        category: Option<String>,
        /// A single workflow
        #[arg(long)]
        workflow: Option<String>,
        /// Print statistics over the generation log instead of running
        #[arg(long)]
        stats: bool,
    },
    /// Evolve a workflow until the target score, a plateau or the generation limit
    Evolve {
        #[arg(long)]
        workflow: String,
        /// Override the configured generation limit
        #[arg(long)]
        max_generations: Option<u32>,
        /// Override the configured number of trials per generation
        #[arg(long)]
        agents: Option<usize>,
    },
    /// Show the improvement history
    History {
        /// Only entries in this state (proposed, applied, accepted, rejected)
        #[arg(long)]
        state: Option<String>,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Configure creative-evolve
    Config {
        /// Set OpenRouter API key
        #[arg(long)]
        set_api_key: Option<String>,
        /// Show current configuration
        #[arg(long)]
        show: bool,
        /// Reset configuration to defaults
        #[arg(long)]
        reset: bool,
    },
}

/// Wire the configured collaborators into an orchestrator
pub async fn build_orchestrator(config: &Config, proposer: Option<Box<dyn ImprovementProposer>>) -> Result<Orchestrator> {
    let docs = FileDocStore::with_dir(config.docs.resolved_dir()?)?;
    let vcs = GitVersionControl::open(config.docs.resolved_repo_dir()?).await?;
    let history = ImprovementHistory::open(config.storage.history_path()?)?;
    let manager = ImprovementManager::new(
        history,
        Box::new(docs),
        Box::new(vcs),
        config.evolution.noise_threshold,
    );

    let bridge = CommandBridge::new(config.bridge.clone());
    let reset = FailoverReset::new(Box::new(bridge.clone()), config.bridge.targets.clone())
        .with_max_attempts(config.bridge.max_reset_attempts)
        .with_backoff(Duration::from_millis(config.bridge.reset_backoff_ms));

    let collaborators = Collaborators {
        agent: Box::new(bridge.clone()),
        metrics: Box::new(bridge),
        reset: Box::new(reset),
        proposer,
    };

    Ok(Orchestrator::new(
        config.evolution.clone(),
        collaborators,
        PatternDetector::new(config.detector.clone()),
        manager,
    )
    .with_log(GenerationLog::new(config.storage.generation_log_path()?)))
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn load_catalog(config: &Config) -> Result<Catalog> {
    let path = config.catalog.resolved_path()?;
    if !path.exists() {
        bail!(
            "No workflow catalog at {}. Create one or set [catalog] path in {}",
            path.display(),
            config::config_path()?.display()
        );
    }
    Catalog::load(&path)
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { all, category, workflow, stats } => {
            let config = load_config(cli.config.as_deref())?;
            if stats {
                let results = GenerationLog::new(config.storage.generation_log_path()?).load()?;
                print!("{}", stats_report(&results));
                return Ok(());
            }

            let selection = match (all, category, workflow) {
                (true, _, _) => Selection::All,
                (_, Some(category), _) => Selection::Category(category),
                (_, _, Some(workflow)) => Selection::Workflow(workflow),
                _ => bail!("Select workflows with --all, --category or --workflow"),
            };
            let catalog = load_catalog(&config)?;
            let workflows = catalog.select(&selection)?;
            let previous = GenerationLog::new(config.storage.generation_log_path()?).load()?;

            let mut orchestrator = build_orchestrator(&config, None).await?;
            let mut failed = 0;
            let mut total = 0;
            for workflow in workflows {
                let generation = previous.iter().filter(|g| g.workflow == workflow.name).count() as u32 + 1;
                let result = orchestrator.run_generation(workflow, generation).await?;
                let report = PatternReport::build(&result, config.evolution.report_patterns);
                println!("{}", report.text);
                failed += result.failed_runs();
                total += result.runs.len();
            }

            if failed > 0 {
                bail!("{} of {} trials failed", failed, total);
            }
        }
        Commands::Evolve { workflow, max_generations, agents } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(max) = max_generations {
                config.evolution.max_generations = max;
            }
            if let Some(agents) = agents {
                config.evolution.agent_count = agents;
            }

            let catalog = load_catalog(&config)?;
            let selected = catalog.select(&Selection::Workflow(workflow))?;
            let proposer = OpenRouterProposer::from_keyring(&config.proposer)?;

            let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, stopping after the current trial");
                    let _ = cancel_tx.send(true);
                }
            });

            let mut orchestrator = build_orchestrator(&config, Some(Box::new(proposer)))
                .await?
                .with_cancellation(cancel_rx);
            let summary = orchestrator.evolve(selected[0]).await?;

            println!("Workflow:    {}", summary.workflow);
            println!("Generations: {}", summary.generations.len());
            for result in &summary.generations {
                println!("  {:>3}  score {:>5.1}  {:?}", result.generation, result.score, result.improvement);
            }
            if let Some(score) = summary.final_score() {
                println!("Final score: {:.1}", score);
            }
            println!("Stopped:     {}", summary.termination);
        }
        Commands::History { state, limit } => {
            let config = load_config(cli.config.as_deref())?;
            let history = ImprovementHistory::open(config.storage.history_path()?)?;
            let selected: Vec<_> = match state.as_deref() {
                None => history.entries().iter().collect(),
                Some("proposed") => history.by_state(ImprovementState::Proposed),
                Some("applied") => history.by_state(ImprovementState::Applied),
                Some("accepted") => history.by_state(ImprovementState::Accepted),
                Some("rejected") => history.by_state(ImprovementState::Rejected),
                Some(other) => bail!("Unknown state '{}'", other),
            };

            let entries: Vec<_> = selected.into_iter().rev().take(limit).collect();
            if entries.is_empty() {
                println!("No improvements recorded.");
            }
            for entry in entries {
                println!(
                    "{}  gen {:>3}  {:<8}  {}/{}",
                    entry.id, entry.generation_proposed, entry.state, entry.tool, entry.field
                );
                let scores = match (entry.baseline_score, entry.validation_score) {
                    (Some(base), Some(validated)) => format!("{:.1} -> {:.1}", base, validated),
                    (Some(base), None) => format!("{:.1} -> pending", base),
                    _ => "-".to_string(),
                };
                println!("    score: {}", scores);
                println!("    why:   {}", crate::truncate_safe(&entry.rationale, 100));
                if let Some(ref note) = entry.note {
                    println!("    note:  {}", note);
                }
            }
        }
        Commands::Config { set_api_key, show, reset } => {
            if let Some(key) = set_api_key {
                config::set_api_key(&key)?;
            } else if reset {
                config::reset_config()?;
            } else if show {
                config::show_config()?;
            } else {
                println!("{}", config::default_config_toml());
            }
        }
    }

    Ok(())
}
