// ABOUTME: CLI entry point for statedb-reflector
// ABOUTME: Reflects one SQLite table into an in-memory table until interrupted

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use statedb_reflector::health::MultiReporter;
use statedb_reflector::reflector::job_name;
use statedb_reflector::source::{SqliteRow, SqliteSourceConfig, SqliteTableSource};
use statedb_reflector::{
    register_reflector, HealthReporter, JobGroup, ReflectorConfig, StatusBoard, Table,
    TracingHealth,
};

#[derive(Parser)]
#[command(name = "statedb-reflector")]
#[command(about = "Mirror a SQLite table into an in-memory table", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the SQLite database (must use WAL journal mode)
    #[arg(long, env = "REFLECTOR_DB")]
    db: PathBuf,
    /// Table to reflect
    #[arg(long, env = "REFLECTOR_TABLE")]
    table: String,
    /// Column identifying a row
    #[arg(long, default_value = "rowid")]
    key_column: String,
    /// How often the WAL file is polled for growth
    #[arg(long, default_value_t = 500)]
    poll_interval_ms: u64,
    /// Maximum distinct keys per commit
    #[arg(long, default_value_t = statedb_reflector::reflector::DEFAULT_MAX_BATCH_KEYS)]
    max_batch_keys: usize,
    /// Maximum time an event waits before its window is committed
    #[arg(long, default_value_t = 50)]
    max_wait_ms: u64,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, env = "REFLECTOR_LOG", default_value = "info")]
    log_level: String,
    /// How often the reflected row count is logged (0 disables)
    #[arg(long, default_value_t = 30)]
    report_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let mut source_config = SqliteSourceConfig::new(&cli.db, &cli.table);
    source_config.key_column = cli.key_column.clone();
    source_config.poll_interval = Duration::from_millis(cli.poll_interval_ms.max(1));
    let source = SqliteTableSource::open(source_config)
        .with_context(|| format!("Failed to open table '{}' in {}", cli.table, cli.db.display()))?;

    let board = Arc::new(StatusBoard::new());
    let reporters: Vec<Arc<dyn HealthReporter>> = vec![board.clone(), Arc::new(TracingHealth)];
    let mut jobs = JobGroup::with_reporter(Arc::new(MultiReporter::new(reporters)));

    let table: Arc<Table<SqliteRow>> = Arc::new(Table::new(cli.table.clone()));
    let config = ReflectorConfig::new()
        .with_source(source.into_change_source())
        .with_max_batch_keys(cli.max_batch_keys)
        .with_max_wait_time(Duration::from_millis(cli.max_wait_ms));
    register_reflector(&mut jobs, Arc::clone(&table), config)?;

    tokio::select! {
        _ = table.wait_initialized() => {
            tracing::info!(table = %cli.table, rows = table.len(), "initial sync complete");
        }
        finished = jobs.join_next() => {
            return finish(finished.map(|job| job.result));
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted before initial sync; shutting down");
            return shutdown(&mut jobs).await;
        }
    }

    let report_every = Duration::from_secs(cli.report_interval_secs);
    let mut report = tokio::time::interval(report_every.max(Duration::from_secs(1)));
    report.tick().await;

    loop {
        tokio::select! {
            _ = report.tick(), if !report_every.is_zero() => {
                let snapshot = table.read();
                let last_commit = board
                    .get(&job_name(&cli.table))
                    .map(|status| status.message)
                    .unwrap_or_default();
                tracing::info!(
                    table = %cli.table,
                    rows = snapshot.len(),
                    revision = snapshot.revision(),
                    last_commit = %last_commit,
                    "reflected table status"
                );
            }
            finished = jobs.join_next() => {
                return finish(finished.map(|job| job.result));
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted; shutting down");
                return shutdown(&mut jobs).await;
            }
        }
    }
}

fn finish(result: Option<anyhow::Result<()>>) -> anyhow::Result<()> {
    match result {
        Some(Ok(())) | None => {
            tracing::info!("Reflector finished");
            Ok(())
        }
        Some(Err(err)) => Err(err.context("Reflector failed")),
    }
}

async fn shutdown(jobs: &mut JobGroup) -> anyhow::Result<()> {
    let mut failed = 0;
    for job in jobs.shutdown().await {
        if let Err(err) = job.result {
            tracing::error!(job = %job.name, "{:#}", err);
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{} job(s) failed during shutdown", failed);
    }
    Ok(())
}
