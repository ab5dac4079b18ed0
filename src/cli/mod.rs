//! Command-line interface for taintbomb.
//!
//! Provides commands for running the obfuscation pipeline (or a pipeline
//! file), previewing its stages, inspecting past runs and editing settings.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{self, Feature, ResolvedConfig, SettingsStore, YamlSettingsStore};
use crate::core::workspace::WORKSPACE_READY_PROGRESS;
use crate::core::{
    prepare_output, verify_scripts, CancelToken, ObfuscationPlan, PipelineRunner,
    ProcessExecutor, RunJournal, StagePlan,
};
use crate::domain::{RunOutcome, RunState};
use crate::sinks::{
    FanoutLogSink, FileLogSink, LogSink, ProgressReporter, TracingLogSink, TracingProgress,
};

/// taintbomb - Java source obfuscation pipeline runner
#[derive(Parser, Debug)]
#[command(name = "taintbomb")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Obfuscate a source tree
    Run {
        /// Directory containing the Java sources
        source_dir: PathBuf,

        /// Directory receiving the obfuscated sources
        #[arg(short, long)]
        output: PathBuf,

        /// Run a pipeline file instead of the built-in stages
        #[arg(short, long)]
        pipeline: Option<PathBuf>,
    },

    /// Show the stages a run would execute
    Plan {
        /// Directory containing the Java sources
        source_dir: PathBuf,

        /// Directory receiving the obfuscated sources
        #[arg(short, long)]
        output: PathBuf,

        /// Show a pipeline file instead of the built-in stages
        #[arg(short, long)]
        pipeline: Option<PathBuf>,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration
    Config,

    /// View or change obfuscation settings
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SettingsCommands {
    /// Print every feature flag and whether an API key is set
    Show,

    /// Turn a feature on
    Enable {
        #[arg(value_enum)]
        feature: FeatureArg,
    },

    /// Turn a feature off
    Disable {
        #[arg(value_enum)]
        feature: FeatureArg,
    },

    /// Store the analysis API key (empty string clears it)
    ApiKey { key: String },
}

/// Feature names accepted on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FeatureArg {
    RemoveComments,
    StringEncryption,
    IdentifierObfuscation,
    OperatorObfuscation,
    MethodSplitting,
    InsertDummyCode,
}

impl From<FeatureArg> for Feature {
    fn from(f: FeatureArg) -> Self {
        match f {
            FeatureArg::RemoveComments => Feature::RemoveComments,
            FeatureArg::StringEncryption => Feature::StringEncryption,
            FeatureArg::IdentifierObfuscation => Feature::IdentifierObfuscation,
            FeatureArg::OperatorObfuscation => Feature::OperatorObfuscation,
            FeatureArg::MethodSplitting => Feature::MethodSplitting,
            FeatureArg::InsertDummyCode => Feature::InsertDummyCode,
        }
    }
}

impl Cli {
    /// Execute the CLI command, returning the process exit status
    pub async fn execute(self) -> Result<i32> {
        match self.command {
            Commands::Run {
                source_dir,
                output,
                pipeline,
            } => run_pipeline(&source_dir, &output, pipeline.as_deref()).await,
            Commands::Plan {
                source_dir,
                output,
                pipeline,
            } => show_plan(&source_dir, &output, pipeline.as_deref()).map(|_| 0),
            Commands::Status { run_id } => show_status(&run_id).await.map(|_| 0),
            Commands::Runs { limit } => list_runs(limit).await.map(|_| 0),
            Commands::Config => show_config().map(|_| 0),
            Commands::Settings { command } => settings(command).map(|_| 0),
        }
    }
}

/// Build the plan for a run: the pipeline file if given, else the built-in stages
fn load_plan(
    config: &ResolvedConfig,
    source_dir: &Path,
    output: &Path,
    pipeline: Option<&Path>,
) -> Result<StagePlan> {
    let plan = match pipeline {
        Some(path) => StagePlan::from_file(path)?,
        None => ObfuscationPlan::from_config(config).build(source_dir, output)?,
    };
    plan.validate()?;
    Ok(plan)
}

/// Run the pipeline over a source tree
async fn run_pipeline(source_dir: &Path, output: &Path, pipeline: Option<&Path>) -> Result<i32> {
    let config = config::load_config()?;
    let plan = load_plan(&config, source_dir, output, pipeline)?;

    let progress: Arc<dyn ProgressReporter> = Arc::new(TracingProgress);

    let verified = verify_scripts(&config.scripts_dir).await?;
    let copied = prepare_output(source_dir, output).await?;
    info!(verified, copied = copied.len(), "Workspace ready");
    progress.report(WORKSPACE_READY_PROGRESS);

    let run_id = Uuid::new_v4();
    let runs_dir = config.runs_dir();

    let mut log = FanoutLogSink::new().with(Arc::new(TracingLogSink));
    let log_path = runs_dir.join(run_id.to_string()).join("output.log");
    let log_file = match FileLogSink::open(&log_path).await {
        Ok(file) => Some(Arc::new(file)),
        Err(e) => {
            warn!(error = %e, "Run output will not be written to disk");
            None
        }
    };
    if let Some(ref file) = log_file {
        log = log.with(file.clone());
    }
    let log: Arc<dyn LogSink> = Arc::new(log);

    let executor = ProcessExecutor::new()
        .with_drain_policy(config.drain)
        .with_terminate_grace(config.terminate_grace);
    let runner = PipelineRunner::new(executor, log, progress).with_journal_dir(&runs_dir);

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            trigger.cancel();
        }
    });

    let run = runner.run_with_id(run_id, &plan, &cancel).await;
    interrupt.abort();
    if let Some(file) = log_file {
        file.flush().await;
    }

    match run.outcome() {
        Some(RunOutcome::Success) => {
            eprintln!("\n[Run {} completed successfully]", run.id);
            eprintln!("Output: {}", output.display());
        }
        Some(outcome @ RunOutcome::Failed { .. }) => {
            eprintln!("\n[Run {} {}]", run.id, outcome);
        }
        Some(RunOutcome::Cancelled) => {
            eprintln!("\n[Run {} cancelled]", run.id);
        }
        None => {
            eprintln!("\n[Run {} in state: {:?}]", run.id, run.state);
        }
    }

    Ok(run
        .outcome()
        .map(RunOutcome::process_exit_code)
        .unwrap_or(1))
}

/// Print the resolved stages without running them
fn show_plan(source_dir: &Path, output: &Path, pipeline: Option<&Path>) -> Result<()> {
    let config = config::load_config()?;
    let plan = load_plan(&config, source_dir, output, pipeline)?;
    let secret = config.settings.api_key.as_str();

    println!("Pipeline: {}", plan.name);
    if !plan.description.is_empty() {
        println!("{}", plan.description);
    }
    println!();

    for (i, stage) in plan.stages.iter().enumerate() {
        let mut flags = Vec::new();
        if !stage.enabled {
            flags.push("disabled".to_string());
        }
        if stage.is_advisory() {
            flags.push("advisory".to_string());
        }
        if let Some(seconds) = stage.timeout_seconds {
            flags.push(format!("timeout {}s", seconds));
        }

        println!(
            "{:>2}. {:<22} {:>5.0}%  {}",
            i + 1,
            stage.name,
            plan.progress.fraction_for(i) * 100.0,
            flags.join(", ")
        );
        println!("    {}", masked_invocation(&stage.invocation, secret));
    }

    Ok(())
}

/// Join an invocation for display, hiding the API key and long arguments
fn masked_invocation(invocation: &[String], secret: &str) -> String {
    invocation
        .iter()
        .map(|arg| {
            if !secret.is_empty() && arg == secret {
                "****".to_string()
            } else if arg.contains('\n') {
                format!("<{} lines>", arg.lines().count())
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Show the status of a run
async fn show_status(run_id_str: &str) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let config = config::load_config()?;
    let runs_dir = config.runs_dir();
    if !runs_dir.join(run_id.to_string()).is_dir() {
        anyhow::bail!("Run {} not found", run_id);
    }

    let journal = RunJournal::open(&runs_dir, run_id).await?;
    let run = journal
        .load_run()
        .await?
        .with_context(|| format!("Run {} has no events", run_id))?;

    println!("Run ID: {}", run.id);
    println!("Pipeline: {}", run.pipeline_name);
    println!("State: {}", state_label(&run.state));
    println!("Progress: {:.0}%", run.progress * 100.0);
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }
    println!("\nStage statuses:");
    for stage in &run.stages {
        let code = stage
            .exit_code
            .map(|c| format!(" (exit {})", c))
            .unwrap_or_default();
        println!("  {}: {:?}{}", stage.name, stage.status, code);
    }
    println!("\nLog: {}", journal.output_log_path().display());

    Ok(())
}

fn state_label(state: &RunState) -> String {
    match state {
        RunState::Pending => "pending".to_string(),
        RunState::Running { stage_index } => format!("running (stage {})", stage_index + 1),
        RunState::Finished { outcome } => outcome.to_string(),
    }
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let config = config::load_config()?;
    let runs = RunJournal::recent_runs(&config.runs_dir(), limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<14} {:<26} {:<20}", "RUN ID", "PIPELINE", "STARTED", "STATE");
    println!("{}", "-".repeat(98));

    for run in runs {
        let state = match &run.state {
            RunState::Pending | RunState::Running { .. } => "running".to_string(),
            RunState::Finished { outcome } => match outcome {
                RunOutcome::Success => "completed".to_string(),
                RunOutcome::Failed { stage, .. } => format!("failed ({})", stage),
                RunOutcome::Cancelled => "cancelled".to_string(),
            },
        };
        println!(
            "{:<38} {:<14} {:<26} {:<20}",
            run.id,
            run.pipeline_name,
            run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            state
        );
    }

    Ok(())
}

/// Show the resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::load_config()?;

    println!("TaintBomb Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:    {}", cfg.home.display());
    println!("  Runs:    {}", cfg.runs_dir().display());
    println!("  Scripts: {}", cfg.scripts_dir.display());
    println!();
    println!("Interpreter: {}", cfg.interpreter);
    println!();
    println!("Process:");
    println!("  Drain grace:          {}ms", cfg.drain.grace.as_millis());
    println!("  Drain interrupt wait: {}ms", cfg.drain.interrupt_wait.as_millis());
    println!("  Terminate grace:      {}ms", cfg.terminate_grace.as_millis());
    println!();
    print_settings(&cfg.settings.features, !cfg.settings.api_key.is_empty());

    Ok(())
}

fn print_settings(features: &config::FeatureSettings, has_api_key: bool) {
    println!("Features:");
    for feature in Feature::ALL {
        let state = if features.get(feature) { "on" } else { "off" };
        println!("  {:<24} {}", feature.key(), state);
    }
    println!();
    println!("API key: {}", if has_api_key { "set" } else { "(not set)" });
}

/// View or change persisted settings
fn settings(command: SettingsCommands) -> Result<()> {
    let cfg = config::load_config()?;
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let mut store = YamlSettingsStore::open(&cfg.settings_path(&cwd))?;

    match command {
        SettingsCommands::Show => {
            let current = store.settings();
            println!("Settings file: {}", store.path().display());
            println!();
            print_settings(&current.features, !current.api_key.is_empty());
            return Ok(());
        }
        SettingsCommands::Enable { feature } => store.set_flag(feature.into(), true),
        SettingsCommands::Disable { feature } => store.set_flag(feature.into(), false),
        SettingsCommands::ApiKey { key } => store.set_api_key(key),
    }

    store.save()?;
    eprintln!("Saved {}", store.path().display());
    Ok(())
}
