//! statdb-ingest - migrate, fetch and import statistical datasets

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use statdb_common::logging::{init_logging, LogConfig, LogLevel};
use statdb_ingest::datasets::DatasetDescriptor;
use statdb_ingest::db::{migrate, sqlite_manager, SqlitePoolManager};
use statdb_ingest::fetch::{FetchError, FetchOutcome, Fetcher};
use statdb_ingest::{ImportOrchestrator, Manifest, Settings};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "statdb-ingest")]
#[command(author, version, about = "Statistical dataset ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Settings file (defaults to ./statdb.toml)
    #[arg(long, global = true, env = "STATDB_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending schema migrations
    Migrate,

    /// Download dataset CSVs
    Fetch(Selection),

    /// Import dataset CSVs into the database
    Import(Selection),
}

#[derive(Args, Debug)]
struct Selection {
    /// Dataset id from the manifest
    #[arg(long, conflicts_with = "all", required_unless_present = "all")]
    dataset: Option<String>,

    /// Every dataset in the manifest
    #[arg(long)]
    all: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { LogLevel::Debug } else { LogLevel::Info };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("statdb-ingest")
        .build();
    let log_config = match log_config.merge_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid logging configuration: {err}");
            return ExitCode::FAILURE;
        },
    };
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Failed to initialize logging: {err}");
            return ExitCode::FAILURE;
        },
    };

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "Command failed");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;
    let manager = Arc::new(sqlite_manager(&settings));

    let result = match cli.command {
        Command::Migrate => run_migrate(&manager).await,
        Command::Fetch(selection) => run_fetch(&settings, &selection).await,
        Command::Import(selection) => run_import(&settings, &manager, &selection).await,
    };

    manager.close().await;
    result
}

async fn run_migrate(manager: &SqlitePoolManager) -> Result<ExitCode> {
    let report = migrate(manager).await.context("Migration failed")?;
    info!(applied = ?report.applied, already_applied = report.already_applied.len(), "Migrations complete");
    println!(
        "Applied {} migration(s), {} already applied",
        report.applied.len(),
        report.already_applied.len()
    );
    Ok(ExitCode::SUCCESS)
}

fn select<'m>(manifest: &'m Manifest, selection: &Selection) -> Result<Vec<&'m DatasetDescriptor>> {
    match &selection.dataset {
        Some(id) => Ok(vec![manifest.get(id)?]),
        None => Ok(manifest.datasets.iter().collect()),
    }
}

async fn run_fetch(settings: &Settings, selection: &Selection) -> Result<ExitCode> {
    let manifest = Manifest::load(&settings.manifest_path).await?;
    let fetcher = Fetcher::new(settings)?;

    let mut failed = 0usize;
    for descriptor in select(&manifest, selection)? {
        match fetcher.fetch(descriptor).await {
            Ok(FetchOutcome::Downloaded { path, size, .. }) => {
                println!("{}: downloaded {} bytes to {}", descriptor.id, size, path.display());
            },
            Ok(FetchOutcome::NotModified { .. }) => println!("{}: not modified", descriptor.id),
            Err(FetchError::NoUrl(id)) if selection.all => {
                warn!(dataset = %id, "No download URL, skipping");
            },
            Err(err) => {
                error!(dataset = %descriptor.id, error = %err, "Fetch failed");
                failed += 1;
            },
        }
    }

    Ok(if failed == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn run_import(
    settings: &Settings,
    manager: &Arc<SqlitePoolManager>,
    selection: &Selection,
) -> Result<ExitCode> {
    let manifest = Manifest::load(&settings.manifest_path).await?;
    let orchestrator = ImportOrchestrator::new(Arc::clone(manager), &settings.data_dir);

    if let Some(id) = &selection.dataset {
        let descriptor = manifest.get(id)?;
        return match orchestrator.import(descriptor).await {
            Ok(outcome) => {
                println!("{}: imported {} rows (run {})", outcome.dataset_id, outcome.imported, outcome.run_id);
                Ok(ExitCode::SUCCESS)
            },
            Err(err) if err.is_skip() => {
                println!("{id}: skipped ({err})");
                Ok(ExitCode::SUCCESS)
            },
            Err(err) => Err(err.into()),
        };
    }

    let summary = orchestrator.import_all(&manifest).await;
    for outcome in &summary.succeeded {
        println!("{}: imported {} rows", outcome.dataset_id, outcome.imported);
    }
    for id in &summary.skipped {
        println!("{id}: skipped (CSV missing)");
    }
    for failure in &summary.failed {
        println!("{}: FAILED {}", failure.dataset_id, failure.error);
    }

    Ok(if summary.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
