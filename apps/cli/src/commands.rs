//! CLI command definitions, routing, and tracing setup.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use appraisal_core::pipeline::{Pipeline, PipelineProgress};
use appraisal_core::{StageSpec, collaborators_from_config};
use appraisal_shared::{
    AppConfig, CaseInput, CaseRecord, PipelineSettings, StageEntry, StageStatus, init_config,
    load_config, validate_api_key, validate_config,
};
use appraisal_storage::Storage;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Appraisal — assemble appraisal report records from case files.
#[derive(Parser)]
#[command(
    name = "appraisal",
    version,
    about = "Run the appraisal report pipeline for a subject property.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run every stage for one case and emit the record.
    Run {
        /// Case file (JSON).
        #[arg(short, long)]
        input: PathBuf,

        /// Where to write the record JSON (defaults to stdout).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Run broad search as a verification pass even when the
        /// structured source is authoritative.
        #[arg(long)]
        verify: bool,

        /// Promotion threshold for the structured source (0..=1).
        #[arg(long)]
        threshold: Option<f64>,

        /// Bypass the collaborator response cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Print the fixed stage plan.
    Stages,

    /// Collaborator response cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Cache subcommands.
#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Show cached response counts per task.
    Stats,
    /// Delete cached responses.
    Clear {
        /// Only clear this task.
        #[arg(long)]
        task: Option<String>,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so the record
/// can be piped from stdout.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "appraisal=info",
        1 => "appraisal=debug",
        _ => "appraisal=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            input,
            out,
            verify,
            threshold,
            no_cache,
        } => cmd_run(&input, out.as_deref(), verify, threshold, no_cache).await,
        Command::Stages => cmd_stages(),
        Command::Cache { action } => match action {
            CacheAction::Stats => cmd_cache_stats().await,
            CacheAction::Clear { task } => cmd_cache_clear(task.as_deref()).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    input_path: &Path,
    out: Option<&Path>,
    verify: bool,
    threshold: Option<f64>,
    no_cache: bool,
) -> Result<()> {
    let mut config = load_config()?;
    if verify {
        config.pipeline.verify_authoritative = true;
    }
    if let Some(t) = threshold {
        config.pipeline.promotion_threshold = t;
    }
    validate_config(&config)?;
    validate_api_key(&config)?;

    let raw = std::fs::read_to_string(input_path)
        .wrap_err_with(|| format!("cannot read case file '{}'", input_path.display()))?;
    let input: CaseInput = serde_json::from_str(&raw)
        .wrap_err_with(|| format!("invalid case file '{}'", input_path.display()))?;

    let cache = if config.cache.enabled && !no_cache {
        open_cache(&config).await
    } else {
        None
    };
    let collaborators = collaborators_from_config(&config, cache)?;
    let pipeline = Pipeline::standard(&collaborators, PipelineSettings::from(&config))?;

    info!(
        address = %input.address,
        threshold = config.pipeline.promotion_threshold,
        verify = config.pipeline.verify_authoritative,
        "running appraisal pipeline"
    );

    let progress = CliProgress::new(pipeline.plan().len());
    let outcome = pipeline.run_with_progress(&input, &progress).await;
    collaborators.close().await;
    let record = outcome?;

    let json = serde_json::to_string_pretty(&record)?;
    match out {
        Some(path) => {
            std::fs::write(path, json)
                .wrap_err_with(|| format!("cannot write record to '{}'", path.display()))?;
            eprintln!("  Record written to {}", path.display());
        }
        None => println!("{json}"),
    }

    eprint!("{}", render_report(&record, config.pipeline.review_threshold));
    Ok(())
}

/// Open the response cache, continuing without it on failure.
async fn open_cache(config: &AppConfig) -> Option<Arc<Storage>> {
    let path = match config.cache.resolved_path() {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "cache disabled: no cache path");
            return None;
        }
    };
    match Storage::open(&path).await {
        Ok(storage) => Some(Arc::new(storage)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cache disabled: cannot open database");
            None
        }
    }
}

/// Status table, headline numbers and review flags.
fn render_report(record: &CaseRecord, review_threshold: f64) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "  {:<22} {:<10} {:>8}  {}", "Stage", "Status", "Time", "Note");
    for (name, entry) in ordered_entries(record) {
        let time = entry
            .elapsed_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".into());
        let note = entry.message.as_deref().unwrap_or("");
        let _ = writeln!(
            out,
            "  {:<22} {:<10} {:>8}  {}",
            name,
            entry.status.as_str(),
            time,
            note
        );
    }
    let _ = writeln!(out);

    if let Some(reconciled) = &record.reconciled {
        let _ = writeln!(
            out,
            "  Final value:        ${:.0} (confidence {:.2})",
            reconciled.value, reconciled.confidence
        );
    } else {
        let _ = writeln!(out, "  Final value:        none");
    }
    let _ = writeln!(
        out,
        "  Overall confidence: {:.2}",
        record.bookkeeping.overall_confidence
    );

    let flags = review_flags(record, review_threshold);
    if !flags.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  Needs review:");
        for flag in flags {
            let _ = writeln!(out, "    - {flag}");
        }
    }
    let _ = writeln!(out);
    out
}

/// Status entries in plan order; entries for unknown stages sort last.
fn ordered_entries(record: &CaseRecord) -> Vec<(&str, &StageEntry)> {
    let plan = appraisal_core::stages::names::ALL;
    let mut entries: Vec<(&str, &StageEntry)> = record
        .bookkeeping
        .status
        .iter()
        .map(|(name, entry)| (name.as_str(), entry))
        .collect();
    entries.sort_by_key(|(name, _)| plan.iter().position(|p| p == name).unwrap_or(plan.len()));
    entries
}

/// ERROR stages and sections below the review threshold.
fn review_flags(record: &CaseRecord, threshold: f64) -> Vec<String> {
    let mut flags: Vec<String> = ordered_entries(record)
        .into_iter()
        .filter(|(_, e)| e.status == StageStatus::Error)
        .map(|(name, e)| format!("{name} failed: {}", e.message.as_deref().unwrap_or("unknown error")))
        .collect();
    flags.extend(
        record
            .low_confidence_sections(threshold)
            .into_iter()
            .map(|(section, c)| format!("{section} has low confidence ({c:.2})")),
    );
    flags
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Self {
        let spinner = ProgressBar::new(total as u64);
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl PipelineProgress for CliProgress {
    fn run_started(&self, record: &CaseRecord, _total: usize) {
        self.spinner
            .set_message(format!("Appraising {}", record.identity.address));
    }

    fn stage_started(&self, _index: usize, _total: usize, stage: &str) {
        self.spinner.set_message(stage.to_string());
    }

    fn stage_finished(&self, stage: &str, entry: &StageEntry) {
        self.spinner.inc(1);
        if entry.status != StageStatus::Success {
            self.spinner
                .println(format!("  {:<10} {stage}", entry.status.as_str()));
        }
    }

    fn run_finished(&self, _record: &CaseRecord) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// stages / cache / config
// ---------------------------------------------------------------------------

fn cmd_stages() -> Result<()> {
    let config = load_config()?;
    let collaborators = collaborators_from_config(&config, None)?;
    let pipeline = Pipeline::standard(&collaborators, PipelineSettings::from(&config))?;

    for (i, spec) in pipeline.plan().into_iter().enumerate() {
        println!("{:>2}. {}", i + 1, spec.name);
        print_sections("requires", spec, true);
        print_sections("reads", spec, false);
        let writes: Vec<String> = spec.writes.iter().map(|s| s.to_string()).collect();
        println!("      writes:   {}", writes.join(", "));
    }
    Ok(())
}

fn print_sections(label: &str, spec: &StageSpec, required: bool) {
    let sections: Vec<String> = spec
        .dependencies
        .iter()
        .filter(|d| d.is_required() == required)
        .map(|d| d.section().to_string())
        .collect();
    if !sections.is_empty() {
        println!("      {label:<9} {}", sections.join(", "));
    }
}

async fn cmd_cache_stats() -> Result<()> {
    let config = load_config()?;
    let path = config.cache.resolved_path()?;
    if !path.exists() {
        println!("No cache at {}", path.display());
        return Ok(());
    }
    let storage = Storage::open_readonly(&path).await?;
    let stats = storage.cache_stats().await?;
    if stats.is_empty() {
        println!("Cache is empty ({})", path.display());
    }
    for (task, count) in stats {
        println!("  {task:<22} {count}");
    }
    Ok(())
}

async fn cmd_cache_clear(task: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let path = config.cache.resolved_path()?;
    if !path.exists() {
        return Err(eyre!("no cache at '{}'", path.display()));
    }
    let storage = Storage::open(&path).await?;
    let removed = storage.invalidate(task).await?;
    println!("Removed {removed} cached response(s)");
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
