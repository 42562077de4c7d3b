//! Import orchestration
//!
//! One import runs on one leased connection:
//!
//! 1. **start**: check the CSV exists, lease a connection, verify migrations
//! 2. **run_create**: stamp the data version and record a `started` run
//! 3. **load**: decode the CSV into the raw TEMP table
//! 4. **normalize**: trim headers and apply aliases
//! 5. **stage**: compile the transform plan and fill the staging table
//! 6. **validate**: refuse to publish an empty staging table
//! 7. **publish**: merge, reconcile and finalize the run atomically
//!
//! Any failure after step 2 marks the run `failed` before the error is
//! returned.

pub mod csv_load;
pub mod publish;
pub mod runs;

pub use csv_load::{load_csv_temp_table, normalize_headers, LoadedCsv};
pub use publish::{publish, PublishReport};
pub use runs::{ImportRun, RunStatus, MAX_ERROR_MESSAGE_CHARS};

use crate::datasets::manifest::validate_descriptor;
use crate::datasets::{DatasetDescriptor, Manifest};
use crate::db::{ensure_current, MigrationError, PoolError, SqlitePoolManager, MIGRATOR};
use crate::transform::{
    bind_params, compile_plan, quote_ident, temp_table, StagingContext, TransformError, YearLookup,
    RAW_TABLE, STAGING_TABLE, YEAR_MAP_TABLE,
};
use crate::transform::unpivot_categories::{YEAR_MAP_LABEL, YEAR_MAP_YEAR};
use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Import failures
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Transform(#[from] TransformError),

    /// Schema not current or drifted
    #[error(transparent)]
    MigrationsPending(#[from] MigrationError),

    #[error("CSV for dataset '{dataset}' not found at {path}")]
    CsvMissing { dataset: String, path: String },

    #[error("Could not decode CSV with any declared encoding: {0}")]
    Decode(String),

    #[error("Invalid CSV: {0}")]
    Csv(String),

    #[error("Dataset '{dataset}' staged zero rows; published data left untouched")]
    EmptyStaging { dataset: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run {run_id} is no longer 'started' and cannot become '{target}'")]
    RunState { run_id: String, target: &'static str },
}

impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err.to_string())
    }
}

impl ImportError {
    /// Missing input files skip a dataset instead of failing the batch
    pub fn is_skip(&self) -> bool {
        matches!(self, ImportError::CsvMissing { .. })
    }
}

/// Orchestrator steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStep {
    Start,
    RunCreate,
    Load,
    Normalize,
    Stage,
    Validate,
    Publish,
}

impl ImportStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStep::Start => "start",
            ImportStep::RunCreate => "run_create",
            ImportStep::Load => "load",
            ImportStep::Normalize => "normalize",
            ImportStep::Stage => "stage",
            ImportStep::Validate => "validate",
            ImportStep::Publish => "publish",
        }
    }
}

/// Wall-clock duration of every completed step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepTimings {
    steps: Vec<(ImportStep, Duration)>,
}

impl StepTimings {
    fn record(&mut self, step: ImportStep, started: Instant) {
        self.steps.push((step, started.elapsed()));
    }

    pub fn get(&self, step: ImportStep) -> Option<Duration> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, d)| *d)
    }

    pub fn steps(&self) -> &[(ImportStep, Duration)] {
        &self.steps
    }

    pub fn total(&self) -> Duration {
        self.steps.iter().map(|(_, d)| *d).sum()
    }
}

impl fmt::Display for StepTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (step, duration)) in self.steps.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}ms", step.as_str(), duration.as_millis())?;
        }
        Ok(())
    }
}

/// Staged rows of one `(indicator, category)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeCount {
    pub indicator: String,
    pub category: String,
    pub rows: u64,
}

/// A published import
#[derive(Debug, Clone)]
pub struct ImportOutcome {
    pub run_id: String,
    pub dataset_id: String,
    pub data_version: String,
    pub imported: u64,
    pub per_scope: Vec<ScopeCount>,
    pub published: PublishReport,
    pub timings: StepTimings,
}

/// A dataset that failed during [`ImportOrchestrator::import_all`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedImport {
    pub dataset_id: String,
    pub error: String,
}

/// Result of importing every manifest dataset
#[derive(Debug, Default)]
pub struct ImportSummary {
    pub succeeded: Vec<ImportOutcome>,
    pub failed: Vec<FailedImport>,
    pub skipped: Vec<String>,
}

impl ImportSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drives dataset imports over a shared pool
pub struct ImportOrchestrator {
    manager: Arc<SqlitePoolManager>,
    data_dir: PathBuf,
}

impl ImportOrchestrator {
    pub fn new(manager: Arc<SqlitePoolManager>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            manager,
            data_dir: data_dir.into(),
        }
    }

    pub fn csv_path(&self, descriptor: &DatasetDescriptor) -> PathBuf {
        self.data_dir.join(&descriptor.filename)
    }

    /// Import one dataset end to end
    pub async fn import(&self, descriptor: &DatasetDescriptor) -> Result<ImportOutcome, ImportError> {
        let span = info_span!("import", dataset = %descriptor.id, run_id = tracing::field::Empty);
        self.import_inner(descriptor).instrument(span).await
    }

    async fn import_inner(&self, descriptor: &DatasetDescriptor) -> Result<ImportOutcome, ImportError> {
        let requested = Instant::now();
        validate_descriptor(descriptor).map_err(|err| ImportError::Config(err.to_string()))?;

        let path = self.csv_path(descriptor);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path.display(), "CSV missing, skipping import");
            return Err(csv_missing(descriptor, &path));
        }

        let descriptor = Arc::new(descriptor.clone());
        self.manager
            .with_connection(move |conn| {
                let descriptor = Arc::clone(&descriptor);
                let path = path.clone();
                Box::pin(async move { run_import(conn, &descriptor, &path, requested).await })
            })
            .await
    }

    /// Import every dataset sequentially; missing CSVs are skipped
    pub async fn import_all(&self, manifest: &Manifest) -> ImportSummary {
        let mut summary = ImportSummary::default();

        for descriptor in &manifest.datasets {
            match self.import(descriptor).await {
                Ok(outcome) => summary.succeeded.push(outcome),
                Err(err) if err.is_skip() => summary.skipped.push(descriptor.id.clone()),
                Err(err) => summary.failed.push(FailedImport {
                    dataset_id: descriptor.id.clone(),
                    error: err.to_string(),
                }),
            }
        }

        info!(
            succeeded = summary.succeeded.len(),
            failed = summary.failed.len(),
            skipped = summary.skipped.len(),
            "Import batch finished"
        );
        summary
    }
}

fn csv_missing(descriptor: &DatasetDescriptor, path: &Path) -> ImportError {
    ImportError::CsvMissing {
        dataset: descriptor.id.clone(),
        path: path.display().to_string(),
    }
}

/// Everything after the lease; runs again in full if the pool is recreated
async fn run_import(
    conn: &mut SqliteConnection,
    descriptor: &DatasetDescriptor,
    path: &Path,
    requested: Instant,
) -> Result<ImportOutcome, ImportError> {
    let mut timings = StepTimings::default();

    ensure_current(conn, &MIGRATOR).await?;
    timings.record(ImportStep::Start, requested);

    let started = Instant::now();
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(csv_missing(descriptor, path));
        },
        Err(err) => return Err(err.into()),
    };
    let data_version = runs::data_version(&metadata);
    let run_id = Uuid::new_v4().to_string();
    runs::create_run(conn, &run_id, &descriptor.id, &data_version).await?;
    Span::current().record("run_id", run_id.as_str());
    timings.record(ImportStep::RunCreate, started);
    info!(%data_version, "Import run started");

    let result = execute_run(conn, descriptor, path, &run_id, &data_version, &mut timings).await;
    drop_temp_tables(conn).await;

    match result {
        Ok((per_scope, published)) => {
            let imported: u64 = per_scope.iter().map(|s| s.rows).sum();
            info!(
                imported,
                upserted = published.upserted,
                deleted_stale = published.deleted_stale,
                timings = %timings,
                "Import published"
            );
            Ok(ImportOutcome {
                run_id,
                dataset_id: descriptor.id.clone(),
                data_version,
                imported,
                per_scope,
                published,
                timings,
            })
        },
        Err(err) => {
            if let Err(mark_err) = runs::mark_failed(conn, &run_id, &err.to_string()).await {
                warn!(error = %mark_err, "Could not record run failure");
            }
            error!(error = %err, timings = %timings, "Import failed");
            Err(err)
        },
    }
}

async fn execute_run(
    conn: &mut SqliteConnection,
    descriptor: &DatasetDescriptor,
    path: &Path,
    run_id: &str,
    data_version: &str,
    timings: &mut StepTimings,
) -> Result<(Vec<ScopeCount>, PublishReport), ImportError> {
    let started = Instant::now();
    let loaded = load_csv_temp_table(conn, path, &descriptor.csv).await?;
    timings.record(ImportStep::Load, started);

    let started = Instant::now();
    let observed = normalize_headers(conn, &loaded.columns, &descriptor.aliases).await?;
    timings.record(ImportStep::Normalize, started);

    let started = Instant::now();
    let loaded_at = Utc::now().to_rfc3339();
    let context = StagingContext {
        dataset_id: &descriptor.id,
        run_id,
        loaded_at: &loaded_at,
        data_version,
    };
    let plan = compile_plan(descriptor, &observed, &context)?;
    publish::create_staging_table(conn).await?;
    if let Some(lookup) = &plan.year_lookup {
        fill_year_map(conn, lookup).await?;
    }
    for statement in &plan.statements {
        bind_params(&statement.sql, &statement.params)
            .execute(&mut *conn)
            .await?;
    }
    let per_scope = count_staged(conn, &plan.scope).await?;
    timings.record(ImportStep::Stage, started);

    let started = Instant::now();
    let imported: u64 = per_scope.iter().map(|s| s.rows).sum();
    for scope in per_scope.iter().filter(|s| s.rows == 0) {
        warn!(indicator = %scope.indicator, category = %scope.category, "No rows staged for scope");
    }
    if imported == 0 {
        return Err(ImportError::EmptyStaging {
            dataset: descriptor.id.clone(),
        });
    }
    timings.record(ImportStep::Validate, started);

    let started = Instant::now();
    let report = publish(conn, run_id, &descriptor.area_type, &plan.scope, imported).await?;
    timings.record(ImportStep::Publish, started);

    Ok((per_scope, report))
}

/// Parse every distinct label eagerly, then materialize the lookup table
async fn fill_year_map(conn: &mut SqliteConnection, lookup: &YearLookup) -> Result<(), ImportError> {
    let labels: Vec<String> = bind_params(&lookup.labels_sql, &lookup.labels_params)
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(|row| row.try_get::<String, _>(0))
        .collect::<Result<_, _>>()?;
    let parsed = lookup.parser.parse_all(labels)?;
    debug!(column = %lookup.column, labels = parsed.len(), "Year labels parsed");

    let table = temp_table(YEAR_MAP_TABLE);
    let label = quote_ident(YEAR_MAP_LABEL);
    let year = quote_ident(YEAR_MAP_YEAR);
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TEMP TABLE {} ({label} TEXT PRIMARY KEY, {year} INTEGER NOT NULL)",
        quote_ident(YEAR_MAP_TABLE)
    ))
    .execute(&mut *conn)
    .await?;

    let insert = format!("INSERT INTO {table} ({label}, {year}) VALUES (?1, ?2)");
    for (raw, parsed_year) in &parsed {
        sqlx::query(&insert)
            .bind(raw)
            .bind(parsed_year)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Staged rows per declared scope pair, zero for pairs that staged nothing
async fn count_staged(
    conn: &mut SqliteConnection,
    scope: &[(String, String)],
) -> Result<Vec<ScopeCount>, ImportError> {
    let counts: Vec<(String, String, i64)> = sqlx::query_as(&format!(
        "SELECT indicator, category, COUNT(*) FROM {} GROUP BY indicator, category",
        temp_table(STAGING_TABLE)
    ))
    .fetch_all(&mut *conn)
    .await?;

    Ok(scope
        .iter()
        .map(|(indicator, category)| {
            let rows = counts
                .iter()
                .find(|(i, c, _)| i == indicator && c == category)
                .map(|(_, _, n)| u64::try_from(*n).unwrap_or_default())
                .unwrap_or_default();
            ScopeCount {
                indicator: indicator.clone(),
                category: category.clone(),
                rows,
            }
        })
        .collect())
}

async fn drop_temp_tables(conn: &mut SqliteConnection) {
    for table in [RAW_TABLE, STAGING_TABLE, YEAR_MAP_TABLE] {
        let sql = format!("DROP TABLE IF EXISTS {}", temp_table(table));
        if let Err(err) = sqlx::query(&sql).execute(&mut *conn).await {
            debug!(error = %err, table, "Could not drop temp table");
        }
    }
}
