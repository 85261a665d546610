//! benchlens-insights - CLI tool to generate benchmarked insights
//!
//! Compares dashboard period metrics against each entity's stored baseline
//! and the platform aggregate, asks the configured text collaborator for
//! insights, validates them and writes one insight record per entity.
//!
//! Run `benchlens-sync` first so baselines and aggregates exist; without them
//! records are still produced, flagged as having no historical data.

use anyhow::{Context, Result};
use benchlens_core::insights::create_insight_client;
use benchlens_core::pipeline::{self, GenerationBatch, GenerationJob};
use benchlens_core::{AggregateCache, Config, Database, InsightPipeline};
use clap::{ArgGroup, Parser};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "benchlens-insights")]
#[command(about = "Generate benchmarked insights from dashboard metrics")]
#[command(version)]
#[command(group(ArgGroup::new("source").required(true).args(["file", "all"])))]
struct Args {
    /// Dashboard raw file to process (repeatable)
    #[arg(short, long)]
    file: Vec<PathBuf>,

    /// Process every dashboard file in the dashboard directory
    #[arg(long)]
    all: bool,

    /// Only process this entity type (with --all)
    #[arg(short, long, requires = "all")]
    entity: Option<String>,

    /// Directory holding dashboard raw files (default from config)
    #[arg(long)]
    dashboard_dir: Option<PathBuf>,

    /// Directory insight records are written to (default from config)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Entities processed concurrently (default from config)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Print records as JSON to stdout instead of writing files
    #[arg(long)]
    stdout: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let mut config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        benchlens_core::logging::init(&config.logging).context("failed to initialize logging")?;

    if let Some(workers) = args.workers {
        anyhow::ensure!(workers > 0, "--workers must be at least 1");
        config.generation.workers = workers;
    }

    let llm = config
        .llm
        .as_ref()
        .context("no [llm] section in configuration; insight generation needs a text collaborator")?;
    let client = create_insight_client(llm).context("failed to create insight client")?;

    let jobs = collect_jobs(&args, &config)?;
    if jobs.is_empty() {
        println!("No dashboard files found.");
        return Ok(());
    }

    let db_path = Config::database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory: {}", parent.display()))?;
    }
    let db = Arc::new(Database::open(&db_path).context("failed to open database")?);
    db.migrate().context("failed to run database migrations")?;

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| config.generation.output_dir());

    tracing::info!(
        jobs = jobs.len(),
        workers = config.generation.workers,
        output_dir = %output_dir.display(),
        "benchlens-insights starting"
    );
    eprintln!("Generating insights for {} entit(ies)...", jobs.len());

    let cache = Arc::new(AggregateCache::new(Arc::clone(&db)));
    let pipeline = InsightPipeline::new(db, cache, Arc::from(client), config);

    let pb = ProgressBar::new(jobs.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );
    let tick = || pb.inc(1);

    let target = (!args.stdout).then_some(output_dir.as_path());
    let batch = pipeline.generate_batch(&jobs, target, Some(&tick));
    pb.finish_and_clear();

    if args.stdout {
        let records: Vec<_> = batch.successes.iter().map(|s| &s.outcome.record).collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("failed to render records")?
        );
    }

    print_batch(&batch);

    tracing::info!(
        succeeded = batch.succeeded(),
        failed = batch.failed(),
        "benchlens-insights complete"
    );

    if batch.failed() > 0 {
        anyhow::bail!("{} of {} entit(ies) failed", batch.failed(), jobs.len());
    }
    Ok(())
}

fn collect_jobs(args: &Args, config: &Config) -> Result<Vec<GenerationJob>> {
    if !args.all {
        return Ok(args.file.iter().cloned().map(GenerationJob::File).collect());
    }

    if let Some(entity_type) = &args.entity {
        config
            .entity_type(entity_type)
            .with_context(|| format!("cannot generate insights for {entity_type}"))?;
    }

    let dir = args
        .dashboard_dir
        .clone()
        .unwrap_or_else(|| config.generation.dashboard_dir());
    let files = pipeline::discover_dashboard_files(&dir, args.entity.as_deref())
        .with_context(|| format!("failed to list dashboard files in {}", dir.display()))?;

    Ok(files.into_iter().map(GenerationJob::File).collect())
}

fn print_batch(batch: &GenerationBatch) {
    eprintln!("Generation complete:");
    for success in &batch.successes {
        let record = &success.outcome.record;
        let location = success
            .output_path
            .as_ref()
            .map(|p| format!(" -> {}", p.display()))
            .unwrap_or_default();
        eprintln!(
            "  {} {}: {} insights ({} high, {} rejected){}{}",
            record.entity_type,
            record.entity_id,
            record.insights_count,
            record.high_priority_count,
            record.rejected_count,
            if record.has_historical_data { "" } else { " [no history]" },
            location
        );
    }
    for failure in &batch.failures {
        eprintln!("  {failure}");
    }
    eprintln!(
        "  Succeeded: {}, Failed: {}",
        batch.succeeded(),
        batch.failed()
    );
}
