//! CLI binary for running SubTract over a diffusion MRI dataset.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use subtract_catalog::{DatasetSummary, SubjectCatalog};
use subtract_dispatch::LocalDispatcher;
use subtract_pipeline::{
    builtin_registry, save_report, EventEmitter, FanOut, PipelineEvent, PipelineRunner, RunReport,
    StepEnv,
};
use subtract_types::{SubtractConfig, WorkItem};

#[derive(Parser)]
#[command(name = "subtract", version, about = "Diffusion MRI tractography pipeline for BIDS datasets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a dataset
    Run {
        /// Root of the raw dataset
        bids_dir: PathBuf,

        /// Output directory (default: <parent>/derivatives/subtract)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Participant label to process, with or without `sub-` (repeatable)
        #[arg(short = 'p', long = "participant-label")]
        participant_label: Vec<String>,

        /// Session to process, with or without `ses-` (repeatable)
        #[arg(short = 's', long = "session")]
        session: Vec<String>,

        /// Comma-separated steps to run instead of the default sequence
        #[arg(long, value_delimiter = ',')]
        steps: Option<Vec<String>>,

        /// Threads handed to each external tool
        #[arg(short = 't', long)]
        threads: Option<usize>,

        /// Items processed at once with --parallel
        #[arg(short = 'j', long)]
        jobs: Option<usize>,

        /// Re-run steps even when their outputs exist
        #[arg(long)]
        force: bool,

        /// Process items in parallel
        #[arg(long)]
        parallel: bool,

        /// Show what would run without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Check that the raw data for each unit is complete
    Validate {
        /// Root of the raw dataset
        bids_dir: PathBuf,

        #[arg(short = 'p', long = "participant-label")]
        participant_label: Vec<String>,

        #[arg(short = 's', long = "session")]
        session: Vec<String>,
    },

    /// Show the dataset summary and per-step completion
    Status {
        /// Root of the raw dataset
        bids_dir: PathBuf,

        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Write a YAML configuration for a dataset
    InitConfig {
        /// Root of the raw dataset
        bids_dir: PathBuf,

        /// Output file
        #[arg(short, long, default_value = "subtract_config.yaml")]
        output: PathBuf,
    },

    /// Run from a YAML configuration file
    RunConfig {
        /// Path to the configuration file
        config: PathBuf,

        /// Process items in parallel
        #[arg(long)]
        parallel: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Run {
            bids_dir,
            output_dir,
            participant_label,
            session,
            steps,
            threads,
            jobs,
            force,
            parallel,
            dry_run,
        } => {
            let mut config = dataset_config(&bids_dir, output_dir.as_deref(), &participant_label, &session)?;
            if let Some(steps) = steps {
                config.steps_to_run = steps.into_iter().map(|s| s.trim().to_string()).collect();
            }
            if let Some(threads) = threads {
                config.processing.n_threads = threads;
            }
            config.processing.n_jobs = jobs.or(config.processing.n_jobs);
            config.processing.force_overwrite |= force;
            config.processing.parallel |= parallel;
            cmd_run(config, dry_run).await?;
        }
        Commands::Validate {
            bids_dir,
            participant_label,
            session,
        } => {
            let config = dataset_config(&bids_dir, None, &participant_label, &session)?;
            cmd_validate(&config)?;
        }
        Commands::Status { bids_dir, output_dir } => {
            let config = dataset_config(&bids_dir, output_dir.as_deref(), &[], &[])?;
            cmd_status(&config)?;
        }
        Commands::InitConfig { bids_dir, output } => {
            let config = dataset_config(&bids_dir, None, &[], &[])?;
            config.save_to_file(&output)?;
            println!("Configuration written to {}", output.display());
        }
        Commands::RunConfig { config, parallel } => {
            let mut config = SubtractConfig::from_file(&config)?;
            config.processing.parallel |= parallel;
            cmd_run(config, false).await?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Configuration from flags
// ---------------------------------------------------------------------------

fn strip_label<'a>(label: &'a str, prefix: &str) -> &'a str {
    label.strip_prefix(prefix).unwrap_or(label)
}

/// Anchored alternation of the escaped labels, or `None` for every subject.
fn participant_filter(labels: &[String]) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    let alternatives: Vec<String> = labels
        .iter()
        .map(|l| regex::escape(strip_label(l.trim(), "sub-")))
        .collect();
    Some(format!("^({})$", alternatives.join("|")))
}

fn dataset_config(
    bids_dir: &Path,
    output_dir: Option<&Path>,
    participant_labels: &[String],
    sessions: &[String],
) -> anyhow::Result<SubtractConfig> {
    let root = std::fs::canonicalize(bids_dir)
        .map_err(|e| anyhow::anyhow!("Dataset directory {}: {e}", bids_dir.display()))?;
    let mut config = SubtractConfig::from_bids_dataset(&root);
    if let Some(out) = output_dir {
        config.paths.analysis_dir = out.to_path_buf();
        config.paths.result_dir = out.join("results");
    }
    config.subject_filter = participant_filter(participant_labels);
    if !sessions.is_empty() {
        config.layout.sessions = Some(
            sessions
                .iter()
                .map(|s| strip_label(s.trim(), "ses-").to_string())
                .collect(),
        );
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_run(config: SubtractConfig, dry_run: bool) -> anyhow::Result<()> {
    config.validate()?;
    let catalog = Arc::new(SubjectCatalog::new(&config)?);
    let items = catalog.work_items();
    if items.is_empty() {
        anyhow::bail!("No subjects found in {}", config.paths.data_dir.display());
    }

    let fan_out = FanOut::from_config(&config.processing);
    println!("Dataset: {}", config.paths.data_dir.display());
    println!("Output: {}", config.paths.analysis_dir.display());
    println!("Items: {}", items.len());
    println!("Steps: {}", config.steps_to_run.join(", "));
    if let FanOut::Parallel { limit } = fan_out {
        println!("Parallel: up to {limit} items at once");
    }

    if !dry_run {
        config.prepare_output_dirs()?;
    }

    let config = Arc::new(config);
    let dispatcher = Arc::new(LocalDispatcher::from_config(&config.dispatch));
    let env = Arc::new(StepEnv::new(config.clone(), dispatcher, catalog));
    let registry = Arc::new(builtin_registry(env));
    let runner = PipelineRunner::new(registry, config.steps_to_run.clone());

    for step in runner.unregistered_steps() {
        println!("Warning: step '{step}' is not available and will be ignored");
    }

    if dry_run {
        print_plan(&runner, &items);
        return Ok(());
    }

    let events = EventEmitter::default();
    let progress = tokio::spawn(print_progress(events.subscribe(), items.len()));
    let runner = runner.with_events(events);

    let started_at = chrono::Utc::now();
    let results = runner.run_batch(&items, fan_out).await;
    drop(runner);
    let _ = progress.await;

    let report = RunReport::new(started_at, config.steps_to_run.clone(), fan_out.is_parallel(), results);
    println!("\nPipeline completed");
    print!("{}", report.summary);
    let path = save_report(&report, &config.paths.result_dir).await?;
    println!("Report: {}", path.display());

    if !report.summary.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_plan(runner: &PipelineRunner, items: &[WorkItem]) {
    println!("\n(dry run -- nothing will be executed)");
    for item in items {
        println!("\n{item}");
        for name in runner.steps() {
            let action = match runner.step(name) {
                None => "not registered",
                Some(step) if step.should_skip(item) => "outputs exist, skip",
                Some(_) => "run",
            };
            println!("  {name:<18} {action}");
        }
    }
}

/// One line per finished item until the batch completes.
async fn print_progress(mut events: tokio::sync::broadcast::Receiver<PipelineEvent>, total: usize) {
    let mut done = 0;
    loop {
        match events.recv().await {
            Ok(PipelineEvent::StepFailed {
                item, step, error, ..
            }) => println!("  {item}: {step} failed: {error}"),
            Ok(PipelineEvent::ItemCompleted { item, success, .. }) => {
                done += 1;
                let status = if success { "ok" } else { "FAILED" };
                println!("[{done}/{total}] {item} {status}");
            }
            Ok(PipelineEvent::BatchCompleted { .. }) => break,
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "Progress display fell behind");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn cmd_validate(config: &SubtractConfig) -> anyhow::Result<()> {
    let catalog = SubjectCatalog::new(config)?;
    let items = catalog.work_items();
    if items.is_empty() {
        anyhow::bail!("No subjects found in {}", config.paths.data_dir.display());
    }

    let mut invalid = 0;
    println!("{:<24} {:<6} {:<10} {:>6} {:>8}", "unit", "valid", "dual PE", "errors", "warnings");
    for item in &items {
        let report = catalog.validate_item(item);
        if !report.valid {
            invalid += 1;
        }
        println!(
            "{:<24} {:<6} {:<10} {:>6} {:>8}",
            item.key(),
            if report.valid { "yes" } else { "NO" },
            if report.has_dual_phase_encoding() { "yes" } else { "no" },
            report.errors.len(),
            report.warnings.len()
        );
        for error in &report.errors {
            println!("    [ERROR] {error}");
        }
        for warning in &report.warnings {
            println!("    [WARN] {warning}");
        }
    }

    println!("\n{} of {} units valid", items.len() - invalid, items.len());
    if invalid > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Dataset summary whose per-step completion matches the runner's skip
/// check: a registered step counts as done only when all its expected
/// outputs exist.
fn status_summary(config: &SubtractConfig) -> anyhow::Result<DatasetSummary> {
    let catalog = Arc::new(SubjectCatalog::new(config)?);
    let mut config = config.clone();
    config.processing.force_overwrite = false;
    let dispatcher = Arc::new(LocalDispatcher::from_config(&config.dispatch));
    let env = Arc::new(StepEnv::new(Arc::new(config), dispatcher, catalog.clone()));
    let registry = builtin_registry(env.clone());

    let subjects = catalog.discover_subjects();
    Ok(catalog.subjects_summary_with(&subjects, &env.config.steps_to_run, |item, step| {
        registry.outputs_complete(step, item)
    }))
}

fn cmd_status(config: &SubtractConfig) -> anyhow::Result<()> {
    let summary = status_summary(config)?;

    println!("Dataset: {} ({:?} layout)", config.paths.data_dir.display(), summary.layout);
    println!("Subjects: {}", summary.total_subjects);
    println!("Subjects with sessions: {}", summary.subjects_with_sessions);
    println!("Valid units: {}", summary.valid_units);
    println!("Units with dual phase encoding: {}", summary.units_with_dual_encoding);

    println!("\nCompleted units per step:");
    for step in &config.steps_to_run {
        let count = summary.processing_status.get(step).copied().unwrap_or(0);
        println!("  {step:<18} {count}");
    }

    if !summary.validation_errors.is_empty() {
        println!("\nErrors:");
        for error in &summary.validation_errors {
            println!("  {error}");
        }
    }
    if !summary.validation_warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &summary.validation_warnings {
            println!("  {warning}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_labels_become_anchored_filter() {
        let labels = vec!["sub-001".to_string(), "002".to_string()];
        assert_eq!(participant_filter(&labels).as_deref(), Some("^(001|002)$"));
        assert_eq!(participant_filter(&[]), None);
    }

    #[test]
    fn participant_labels_are_escaped() {
        let filter = participant_filter(&["a.b".to_string()]).unwrap();
        let re = regex::Regex::new(&filter).unwrap();
        assert!(re.is_match("a.b"));
        assert!(!re.is_match("axb"), "dot must be literal");
    }

    #[test]
    fn flags_shape_the_configuration() {
        let tmp = tempfile::TempDir::new().unwrap();
        let raw = tmp.path().join("raw");
        std::fs::create_dir_all(&raw).unwrap();
        let out = tmp.path().join("out");

        let config = dataset_config(
            &raw,
            Some(&out),
            &["sub-01".to_string()],
            &["ses-pre".to_string(), "post".to_string()],
        )
        .unwrap();
        assert_eq!(config.paths.analysis_dir, out);
        assert_eq!(config.paths.result_dir, out.join("results"));
        assert_eq!(config.subject_filter.as_deref(), Some("^(01)$"));
        assert_eq!(
            config.layout.sessions,
            Some(vec!["pre".to_string(), "post".to_string()])
        );
    }

    #[test]
    fn missing_dataset_is_an_error() {
        assert!(dataset_config(Path::new("/definitely/not/here"), None, &[], &[]).is_err());
    }

    #[test]
    fn status_counts_only_steps_whose_outputs_exist() {
        let tmp = tempfile::TempDir::new().unwrap();
        let raw = tmp.path().join("raw");
        let dwi = raw.join("sub-01/dwi");
        std::fs::create_dir_all(&dwi).unwrap();
        std::fs::write(raw.join("dataset_description.json"), b"{}").unwrap();
        std::fs::write(dwi.join("sub-01_dir-AP_dwi.nii.gz"), b"").unwrap();

        let config = dataset_config(&raw, None, &[], &[]).unwrap();
        let item = WorkItem::new("01");
        let out = item.output_dir(&config.paths.analysis_dir);
        std::fs::create_dir_all(out.join("dwi/Eddy")).unwrap();
        std::fs::write(out.join("processing_log.txt"), b"").unwrap();

        let summary = status_summary(&config).unwrap();
        assert_eq!(summary.processing_status["eddy"], 0, "empty Eddy dir is not done");
        assert_eq!(summary.processing_status["copy_data"], 1);
    }
}
