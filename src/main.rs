//! Gapwise - project assessment and decision workflow engine.
//!
//! Finds what a project is missing, proposes ways to close each gap, and
//! carries the approved ones through isolated implementation and review.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gapwise::approach::ApproachGenerator;
use gapwise::core::Config;
use gapwise::decision::{
    render_request, ApprovalChannel, ConsoleApproval, DecisionFacilitator, ScriptedAnswer,
    ScriptedApproval,
};
use gapwise::knowledge::{KnowledgeFilter, KnowledgePreserver};
use gapwise::safety::SafetyEnvironmentManager;
use gapwise::workflow::{ScaffoldImplementer, WorkflowOrchestrator};
use gapwise::{AssetDiscoveryEngine, Gap, GapAnalyzer, ObjectiveSet};

/// Project assessment and decision workflow engine
#[derive(Parser)]
#[command(name = "gapwise")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to .gapwise.toml, then the user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inventory the assets under a directory
    Discover {
        /// Directory to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List the gaps between a directory and a set of objectives
    Analyze {
        /// Directory to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Objectives file (TOML or YAML)
        #[arg(short, long)]
        objectives: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show the decision request each gap would produce
    Propose {
        /// Directory to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Objectives file (TOML or YAML)
        #[arg(short, long)]
        objectives: PathBuf,

        /// Only this gap
        #[arg(short, long)]
        gap: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run gaps through decision, implementation, and review
    Run {
        /// Directory to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Objectives file (TOML or YAML)
        #[arg(short, long)]
        objectives: PathBuf,

        /// Only this gap
        #[arg(short, long)]
        gap: Option<String>,

        /// Approve the recommended approach without prompting
        #[arg(long, conflicts_with = "select")]
        auto_approve: bool,

        /// Approve this approach id without prompting
        #[arg(long)]
        select: Option<String>,

        /// Seconds to wait for each approval
        #[arg(long)]
        timeout: Option<u64>,

        /// Gaps to run at once
        #[arg(short = 'j', long)]
        parallel: Option<usize>,
    },

    /// Show the knowledge log
    Log {
        /// Only entries for this gap
        #[arg(short, long)]
        gap: Option<String>,

        /// Only entries whose final quality report passed (or failed)
        #[arg(long)]
        passed: Option<bool>,

        /// Output format (text, json, markdown)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List archived versions for a gap
    Archives {
        /// Gap id
        gap: String,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,

        /// Write the default configuration to .gapwise.toml
        #[arg(long)]
        init: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("warn") };

    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Discover { path, format } => {
            cmd_discover(config_path, &path, &format)?;
        }
        Commands::Analyze { path, objectives, format } => {
            cmd_analyze(config_path, &path, &objectives, &format)?;
        }
        Commands::Propose { path, objectives, gap, format } => {
            cmd_propose(config_path, &path, &objectives, gap.as_deref(), &format)?;
        }
        Commands::Run { path, objectives, gap, auto_approve, select, timeout, parallel } => {
            let options = RunOptions { gap, auto_approve, select, timeout, parallel };
            cmd_run(config_path, &path, &objectives, options)?;
        }
        Commands::Log { gap, passed, format } => {
            cmd_log(config_path, gap, passed, &format)?;
        }
        Commands::Archives { gap } => {
            cmd_archives(config_path, &gap)?;
        }
        Commands::Config { path, init } => {
            cmd_config(config_path, path, init)?;
        }
        Commands::Completions { shell } => {
            cmd_completions(shell);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_file(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

fn load_gaps(config: &Config, path: &Path, objectives: &Path) -> Result<Vec<Gap>> {
    let objectives = ObjectiveSet::load(objectives)
        .with_context(|| format!("failed to load objectives from {}", objectives.display()))?;
    let engine = AssetDiscoveryEngine::new(config.discovery.clone());
    let inventory = engine.discover(path)?;
    for warning in &inventory.warnings {
        eprintln!("warning: {}: {}", warning.path.display(), warning.message);
    }
    Ok(GapAnalyzer::new().analyze(&inventory.assets, &objectives.objectives)?)
}

fn open_knowledge(config: &Config) -> Result<KnowledgePreserver> {
    let path = config
        .knowledge_log_path()
        .context("no knowledge log location; set knowledge.log_path in the config")?;
    Ok(KnowledgePreserver::open(path))
}

/// Inventory a directory.
fn cmd_discover(config_path: Option<&Path>, path: &Path, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let inventory = AssetDiscoveryEngine::new(config.discovery).discover(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&inventory)?);
        }
        _ => {
            for asset in &inventory.assets {
                let tags: Vec<&str> = asset.capabilities.iter().map(String::as_str).collect();
                println!("{} [{}]", asset.id, tags.join(", "));
            }
            println!("\nTotal: {} assets", inventory.assets.len());
            if inventory.is_partial() {
                println!("Skipped {} unreadable path(s)", inventory.warnings.len());
            }
        }
    }

    Ok(())
}

/// List gaps.
fn cmd_analyze(config_path: Option<&Path>, path: &Path, objectives: &Path, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let gaps = load_gaps(&config, path, objectives)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&gaps)?);
        }
        _ => {
            if gaps.is_empty() {
                println!("No gaps: every objective is covered");
                return Ok(());
            }
            for gap in &gaps {
                println!(
                    "{} severity {:.2} coverage {:.0}% effort {} missing: {}",
                    gap.id(),
                    gap.severity,
                    gap.coverage * 100.0,
                    gap.effort,
                    gap.missing.join(", ")
                );
            }
            println!("\nTotal: {} gaps", gaps.len());
        }
    }

    Ok(())
}

/// Show decision requests without waiting for answers.
fn cmd_propose(
    config_path: Option<&Path>,
    path: &Path,
    objectives: &Path,
    only: Option<&str>,
    format: &str,
) -> Result<()> {
    let config = load_config(config_path)?;
    let gaps = load_gaps(&config, path, objectives)?;
    let generator = ApproachGenerator::new(config.approaches.clone());
    let facilitator = DecisionFacilitator::new(config.decision.clone());

    let mut requests = Vec::new();
    for gap in gaps.iter().filter(|g| only.map_or(true, |id| g.id() == id)) {
        let approaches = generator.generate(gap)?;
        let pending = facilitator.propose(gap, &approaches)?;
        requests.push(pending.request().clone());
    }

    if let Some(id) = only {
        if requests.is_empty() {
            anyhow::bail!("No gap named '{id}'");
        }
    }

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&requests)?),
        _ => {
            for request in &requests {
                println!("{}", render_request(request));
            }
        }
    }

    Ok(())
}

struct RunOptions {
    gap: Option<String>,
    auto_approve: bool,
    select: Option<String>,
    timeout: Option<u64>,
    parallel: Option<usize>,
}

/// Drive gaps through the full pipeline.
fn cmd_run(config_path: Option<&Path>, path: &Path, objectives: &Path, options: RunOptions) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(secs) = options.timeout {
        config.decision.approval_timeout_secs = secs;
    }
    if let Some(parallel) = options.parallel {
        config.workflow.max_parallel_gaps = parallel.max(1);
    }

    let objectives = ObjectiveSet::load(objectives)
        .with_context(|| format!("failed to load objectives from {}", objectives.display()))?;

    let channel: Arc<dyn ApprovalChannel> = match (options.auto_approve, options.select) {
        (true, _) => Arc::new(ScriptedApproval::new(ScriptedAnswer::Recommended).with_approver("cli")),
        (false, Some(id)) => Arc::new(ScriptedApproval::new(ScriptedAnswer::Select(id)).with_approver("cli")),
        (false, None) => {
            // Prompts share the terminal; ask one gap at a time.
            config.workflow.max_parallel_gaps = 1;
            Arc::new(ConsoleApproval::new())
        }
    };

    let knowledge = open_knowledge(&config)?;
    let orchestrator = Arc::new(
        WorkflowOrchestrator::new(config, channel, Arc::new(ScaffoldImplementer::new()))
            .with_knowledge(knowledge),
    );

    let rt = tokio::runtime::Runtime::new()?;
    let results = rt.block_on(async {
        let assessment = orchestrator.assess(path, &objectives.objectives)?;
        let gaps: Vec<Gap> = match options.gap.as_deref() {
            Some(id) => {
                let gaps: Vec<Gap> = assessment.gaps.into_iter().filter(|g| g.id() == id).collect();
                if gaps.is_empty() {
                    anyhow::bail!("No open gap named '{id}'");
                }
                gaps
            }
            None => assessment.gaps,
        };
        if gaps.is_empty() {
            println!("No gaps: every objective is covered");
        }
        Ok::<_, anyhow::Error>(orchestrator.run_all(assessment.inventory, gaps).await)
    })?;
    // The console prompt thread may still be blocked on stdin.
    rt.shutdown_timeout(Duration::from_millis(100));

    let mut failed = 0usize;
    for result in &results {
        match result {
            Ok(outcome) => {
                let archive = outcome
                    .artifact
                    .archive
                    .as_ref()
                    .map(|a| format!(" -> {}", a.path.display()))
                    .unwrap_or_default();
                let note = if outcome.reused { " (already resolved)" } else { "" };
                println!("✓ {} #{}{archive}{note}", outcome.gap_id, outcome.artifact.sequence);
            }
            Err(failure) => {
                failed += 1;
                println!("✗ {}", failure);
                for (i, report) in failure.error.quality_history().iter().enumerate() {
                    println!("    attempt {}: overall {:.2}", i + 1, report.overall);
                    for remediation in report.remediations.iter().take(3) {
                        for action in &remediation.actions {
                            println!("      - {action}");
                        }
                    }
                }
            }
        }
    }

    let backlog = orchestrator.backlog();
    if !backlog.is_empty() {
        let ids: Vec<&str> = backlog.iter().map(|b| b.gap.id()).collect();
        println!("\nBacklog: {}", ids.join(", "));
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} gap(s) did not complete", results.len());
    }
    Ok(())
}

/// Show the knowledge log.
fn cmd_log(config_path: Option<&Path>, gap: Option<String>, passed: Option<bool>, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let knowledge = open_knowledge(&config)?;

    let mut filter = KnowledgeFilter::new();
    if let Some(gap) = gap {
        filter = filter.gap(gap);
    }
    if let Some(passed) = passed {
        filter = filter.passed(passed);
    }
    let artifacts = knowledge.query(&filter)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&artifacts)?),
        "markdown" | "md" => print!("{}", gapwise::knowledge::render_markdown(&artifacts)),
        _ => {
            for artifact in &artifacts {
                let decision = artifact.decision.as_ref().map_or("-", |d| d.id());
                println!(
                    "#{} {} {} {} decision {}",
                    artifact.sequence,
                    artifact.recorded_at.format("%Y-%m-%d %H:%M"),
                    artifact.gap_id,
                    artifact.outcome.label(),
                    decision
                );
            }
            println!("\nTotal: {} entries", artifacts.len());
        }
    }

    Ok(())
}

/// List archived versions.
fn cmd_archives(config_path: Option<&Path>, gap: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let safety = SafetyEnvironmentManager::new(config.safety);
    let archives = safety.archives(gap)?;

    if archives.is_empty() {
        println!("No archives for '{gap}'");
        return Ok(());
    }
    for archive in &archives {
        println!(
            "v{} {} {} ({} files) {}",
            archive.version,
            archive.archived_at.format("%Y-%m-%d %H:%M"),
            archive.approach_id,
            archive.files.len(),
            archive.path.display()
        );
    }
    Ok(())
}

/// Show configuration.
fn cmd_config(config_path: Option<&Path>, show_path: bool, init: bool) -> Result<()> {
    if show_path {
        if let Some(path) = Config::config_dir() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    if init {
        let target = PathBuf::from(".gapwise.toml");
        if target.exists() {
            anyhow::bail!("{} already exists", target.display());
        }
        Config::default().save(&target)?;
        println!("Wrote {}", target.display());
        return Ok(());
    }

    let config = load_config(config_path)?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{toml}");

    Ok(())
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "gapwise", &mut io::stdout());
}
