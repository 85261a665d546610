//! benchlens-sync - CLI tool to sync entity baselines and platform aggregates
//!
//! Reads source-of-truth query result files, organizes them per entity,
//! computes the platform aggregate snapshot for each entity type and replaces
//! the stored set in the analytics database.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Database: $XDG_DATA_HOME/benchlens/analytics.db (~/.local/share/benchlens/analytics.db)
//! - Logs: $XDG_STATE_HOME/benchlens/benchlens.log (~/.local/state/benchlens/benchlens.log)
//! - Config: $XDG_CONFIG_HOME/benchlens/config.toml (~/.config/benchlens/config.toml)

mod process_lock;

use anyhow::{Context, Result};
use benchlens_core::organizer;
use benchlens_core::sync::SyncBatchResult;
use benchlens_core::{Config, Database, QueryResults, SyncCoordinator};
use clap::{ArgAction, Parser};
use process_lock::acquire_sync_guard;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "benchlens-sync")]
#[command(about = "Sync entity baselines and platform aggregates")]
#[command(version)]
struct Args {
    /// Query result files, one entity type per file
    #[arg(required_unless_present = "health")]
    inputs: Vec<PathBuf>,

    /// Show store health and recent sync runs instead of syncing
    #[arg(long)]
    health: bool,

    /// Number of sync log entries shown with --health
    #[arg(long, default_value = "10")]
    history: usize,

    /// Dry run - organize inputs but don't write
    #[arg(long)]
    dry_run: bool,

    /// Verbose output (-v per-type organize details)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        benchlens_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("benchlens-sync starting");

    let db_path = Config::database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory: {}", parent.display()))?;
    }

    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;

    println!("Database: {}", db_path.display());

    if args.health {
        return print_health(&db, args.history);
    }

    let inputs = args
        .inputs
        .iter()
        .map(|path| {
            QueryResults::load(path)
                .with_context(|| format!("failed to read query results: {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    if args.dry_run {
        return run_dry(&config, &inputs);
    }

    // Enforce process-level exclusivity per entity type for this database
    let entity_types: Vec<String> = inputs.iter().map(|i| i.entity_type.clone()).collect();
    let _sync_guard =
        acquire_sync_guard(&db_path, &entity_types).context("failed to acquire process lock")?;

    let coordinator = SyncCoordinator::new(Arc::new(db), config);
    let batch = coordinator.sync_all(&inputs);

    print_batch(&batch, args.verbose);

    tracing::info!(
        succeeded = batch.succeeded(),
        failed = batch.failed(),
        "benchlens-sync complete"
    );

    if batch.failed() > 0 {
        anyhow::bail!(
            "{} of {} entity type(s) failed to sync",
            batch.failed(),
            inputs.len()
        );
    }
    Ok(())
}

fn run_dry(config: &Config, inputs: &[QueryResults]) -> Result<()> {
    for input in inputs {
        let type_config = config
            .entity_type(&input.entity_type)
            .with_context(|| format!("cannot sync {}", input.entity_type))?;
        let organized = organizer::organize(&input.entity_type, type_config, &input.queries);
        let summary = organized.summary(&type_config.overview_query);

        println!(
            "  - {}: {} entities, summary {}, {} anomalies, {} discarded rows",
            input.entity_type,
            organized.entities.len(),
            if summary.is_available() { "present" } else { "absent" },
            organized.report.anomalies,
            organized.report.discarded_rows
        );
    }

    println!("\nDry run - no sync performed");
    tracing::info!("Dry run complete");
    Ok(())
}

fn print_batch(batch: &SyncBatchResult, verbose: u8) {
    println!("Sync complete:");
    for result in &batch.results {
        println!(
            "  {}: {} entities ({} contributing) in {:.2}s",
            result.entity_type,
            result.entities,
            result.contributing,
            result.duration.as_secs_f64()
        );
        if verbose > 0 {
            println!(
                "    summary row: {}",
                if result.summary_available { "present" } else { "absent" }
            );
            println!(
                "    anomalies: {}, discarded rows: {}",
                result.report.anomalies, result.report.discarded_rows
            );
        }
    }

    for (entity_type, error) in &batch.failures {
        println!("  {}: FAILED ({}) {}", entity_type, error.kind().as_str(), error);
    }

    println!(
        "  Succeeded: {}, Failed: {}",
        batch.succeeded(),
        batch.failed()
    );
}

fn print_health(db: &Database, history: usize) -> Result<()> {
    let health = db.get_health().context("failed to read store health")?;

    println!("Store health:");
    println!("  Database size: {} bytes", health.database_bytes);
    println!("  Entities:");
    if health.entity_counts.is_empty() {
        println!("    (none)");
    }
    for (entity_type, count) in &health.entity_counts {
        println!("    {entity_type}: {count}");
    }
    println!("  Aggregates: {}", health.aggregate_types.join(", "));
    match &health.last_sync {
        Some(entry) => println!(
            "  Last sync: {} {} ({})",
            entry.synced_at.to_rfc3339(),
            entry.entity_type,
            entry.status.as_str()
        ),
        None => println!("  Last sync: never"),
    }

    let log = db.get_sync_log(history).context("failed to read sync log")?;
    if !log.is_empty() {
        println!("\nRecent sync runs:");
        for entry in log {
            println!(
                "  {}  {:<10} {:>7} entities  {:>6.2}s  {}{}",
                entry.synced_at.format("%Y-%m-%d %H:%M:%S"),
                entry.entity_type,
                entry.entities_count,
                entry.duration_seconds,
                entry.status.as_str(),
                entry
                    .error_message
                    .map(|m| format!(": {m}"))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}
