//! End-to-end import tests
//!
//! Each test gets its own SQLite file and data directory, migrates the
//! schema through the pool manager, writes CSV fixtures and runs the
//! orchestrator against them.

use statdb_ingest::datasets::{DatasetDescriptor, Manifest};
use statdb_ingest::db::{migrate, DbError, SqlitePoolManager};
use statdb_ingest::import::runs::{get_run, recent_runs};
use statdb_ingest::import::{ImportRun, RunStatus};
use statdb_ingest::transform::TransformError;
use statdb_ingest::{ImportError, ImportOrchestrator, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

// ============================================================================
// Test Helper Functions
// ============================================================================

const POPULATION: &str = r#"
    id = "population"
    filename = "population.csv"
    area_type = "district"
    area_column = "Stadtteil"

    [format]
    kind = "unpivot_years"
    indicator_column = "Merkmal"

    [[format.rows]]
    filter_value = "Einwohner insgesamt"
    indicator = "population"
    unit = "persons"
    category = "total"
"#;

const HOUSEHOLDS: &str = r#"
    id = "households"
    filename = "households.csv"
    area_type = "district"
    area_column = "Stadtteil"

    [format]
    kind = "unpivot_categories"
    year_column = "Jahr"
    indicator = "households"
    unit = "count"

    [[format.columns]]
    category = "single"
    value_column = "Single"

    [[format.columns]]
    category = "couples"
    value_column = "Paare"

    [[format.columns]]
    category = "families"
    value_column = "Familien"

    [[format.columns]]
    category = "total"
    value_expression = '"Single" + "Paare" + "Familien"'
"#;

struct TestEnv {
    _dir: TempDir,
    data_dir: PathBuf,
    manager: Arc<SqlitePoolManager>,
    orchestrator: ImportOrchestrator,
}

type Fact = (String, String, String, i64, f64, String);

impl TestEnv {
    async fn new() -> Self {
        let env = Self::unmigrated().await;
        migrate(&env.manager).await.expect("Failed to migrate test database");
        env
    }

    async fn unmigrated() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let data_dir = dir.path().join("raw");
        std::fs::create_dir_all(&data_dir).expect("Failed to create data dir");

        let settings = Settings {
            database_path: dir.path().join("statdb.sqlite"),
            data_dir: data_dir.clone(),
            pool_size: 2,
            bootstrap_attempts: 1,
            ..Settings::default()
        };
        let manager = Arc::new(statdb_ingest::db::sqlite_manager(&settings));
        let orchestrator = ImportOrchestrator::new(Arc::clone(&manager), &data_dir);

        Self {
            _dir: dir,
            data_dir,
            manager,
            orchestrator,
        }
    }

    fn write_csv(&self, filename: &str, contents: impl AsRef<[u8]>) {
        std::fs::write(self.data_dir.join(filename), contents).expect("Failed to write CSV fixture");
    }

    async fn execute(&self, sql: &'static str) {
        self.manager
            .with_connection(move |conn| {
                Box::pin(async move {
                    sqlx::Executor::execute(&mut *conn, sql).await?;
                    Ok::<_, DbError>(())
                })
            })
            .await
            .expect("Failed to execute SQL");
    }

    /// `(indicator, area_name, category, year, value, import_run_id)` ordered by key
    async fn facts(&self, source_dataset: &str) -> Vec<Fact> {
        let source_dataset = source_dataset.to_string();
        self.manager
            .with_connection(move |conn| {
                let source_dataset = source_dataset.clone();
                Box::pin(async move {
                    let rows = sqlx::query_as(
                        "SELECT indicator, area_name, category, year, value, import_run_id \
                         FROM statistics WHERE source_dataset = ?1 \
                         ORDER BY indicator, area_name, category, year",
                    )
                    .bind(source_dataset)
                    .fetch_all(&mut *conn)
                    .await?;
                    Ok::<_, DbError>(rows)
                })
            })
            .await
            .expect("Failed to query facts")
    }

    async fn run(&self, run_id: &str) -> ImportRun {
        let run_id = run_id.to_string();
        self.manager
            .with_connection(move |conn| {
                let run_id = run_id.clone();
                Box::pin(async move { get_run(conn, &run_id).await })
            })
            .await
            .expect("Failed to query run")
            .expect("Run not recorded")
    }

    async fn latest_run(&self, dataset_id: &str) -> ImportRun {
        let dataset_id = dataset_id.to_string();
        self.manager
            .with_connection(move |conn| {
                let dataset_id = dataset_id.clone();
                Box::pin(async move { recent_runs(conn, &dataset_id, 1).await })
            })
            .await
            .expect("Failed to query runs")
            .into_iter()
            .next()
            .expect("No run recorded")
    }
}

fn descriptor(toml_source: &str) -> DatasetDescriptor {
    toml::from_str(toml_source).expect("Invalid descriptor fixture")
}

fn fact(indicator: &str, area: &str, category: &str, year: i64, value: f64, run_id: &str) -> Fact {
    (
        indicator.to_string(),
        area.to_string(),
        category.to_string(),
        year,
        value,
        run_id.to_string(),
    )
}

// ============================================================================
// Year columns
// ============================================================================

#[tokio::test]
async fn test_year_columns_import_is_repeatable() {
    let env = TestEnv::new().await;
    let population = descriptor(POPULATION);
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022;2023\nEinwohner insgesamt;Altstadt;1213;1220\n",
    );

    let first = env.orchestrator.import(&population).await.unwrap();
    let second = env.orchestrator.import(&population).await.unwrap();

    assert_eq!(first.imported, 2);
    assert_eq!(second.imported, 2);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(
        env.facts("population").await,
        vec![
            fact("population", "Altstadt", "total", 2022, 1213.0, &second.run_id),
            fact("population", "Altstadt", "total", 2023, 1220.0, &second.run_id),
        ]
    );

    for outcome in [&first, &second] {
        let run = env.run(&outcome.run_id).await;
        assert_eq!(run.status, RunStatus::Published.as_str());
        assert_eq!(run.row_count, Some(2));
        assert_eq!(run.data_version, outcome.data_version);
        assert!(run.published_at.is_some());
        assert!(run.error_message.is_none());
    }
}

#[tokio::test]
async fn test_outcome_reports_every_step() {
    let env = TestEnv::new().await;
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022\nEinwohner insgesamt;Altstadt;1213\n",
    );

    let outcome = env.orchestrator.import(&descriptor(POPULATION)).await.unwrap();

    let steps: Vec<&str> = outcome.timings.steps().iter().map(|(step, _)| step.as_str()).collect();
    assert_eq!(
        steps,
        vec!["start", "run_create", "load", "normalize", "stage", "validate", "publish"]
    );
    assert_eq!(outcome.per_scope.len(), 1);
    assert_eq!(outcome.per_scope[0].rows, 1);
    let metadata = std::fs::metadata(env.data_dir.join("population.csv")).unwrap();
    assert!(outcome.data_version.starts_with(&format!("{}-", metadata.len())));
}

#[tokio::test]
async fn test_repeated_year_column_keeps_last_value() {
    let env = TestEnv::new().await;
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022;2022\nEinwohner insgesamt;Altstadt;100;200\n",
    );

    let outcome = env.orchestrator.import(&descriptor(POPULATION)).await.unwrap();

    assert_eq!(outcome.imported, 1);
    let facts = env.facts("population").await;
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].4, 200.0);
}

#[tokio::test]
async fn test_placeholder_cells_are_skipped() {
    let env = TestEnv::new().await;
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2021;2022;2023\n\
         Einwohner insgesamt;Altstadt;-;;1220\n\
         Einwohner insgesamt;Neustadt;x;950;960\n\
         Haushalte;Altstadt;600;610;620\n",
    );

    let outcome = env.orchestrator.import(&descriptor(POPULATION)).await.unwrap();

    assert_eq!(outcome.imported, 3);
    let years: Vec<(String, i64)> = env
        .facts("population")
        .await
        .into_iter()
        .map(|f| (f.1, f.3))
        .collect();
    assert_eq!(
        years,
        vec![
            ("Altstadt".to_string(), 2023),
            ("Neustadt".to_string(), 2022),
            ("Neustadt".to_string(), 2023),
        ]
    );
}

#[tokio::test]
async fn test_decimal_comma_latin1_and_aliases() {
    let env = TestEnv::new().await;
    let mut population = descriptor(POPULATION);
    population.csv.decimal_separator = ',';
    population.csv.fallback_encodings = vec![statdb_ingest::datasets::Encoding::Latin1];
    population
        .aliases
        .insert("Bezirk".to_string(), "Stadtteil".to_string());

    // latin-1 bytes: "Süd" is not valid UTF-8
    let mut csv = b"Merkmal; Bezirk ;2022\nEinwohner insgesamt;S".to_vec();
    csv.push(0xFC);
    csv.extend_from_slice(b"d;\"1.234,5\"\n");
    env.write_csv("population.csv", csv);

    env.orchestrator.import(&population).await.unwrap();

    let facts = env.facts("population").await;
    assert_eq!(facts.len(), 1);
    assert_eq!(facts[0].1, "Süd");
    assert_eq!(facts[0].4, 1234.5);
}

// ============================================================================
// Category columns
// ============================================================================

#[tokio::test]
async fn test_category_columns_with_computed_total() {
    let env = TestEnv::new().await;
    env.write_csv(
        "households.csv",
        "Jahr;Stadtteil;Single;Paare;Familien\n\
         2022;Altstadt;10;20;30\n\
         2023;Altstadt;11;21;31\n",
    );

    let outcome = env.orchestrator.import(&descriptor(HOUSEHOLDS)).await.unwrap();

    assert_eq!(outcome.imported, 8);
    let facts = env.facts("households").await;
    let mut categories: Vec<&str> = facts.iter().map(|f| f.2.as_str()).collect();
    categories.dedup();
    assert_eq!(categories, vec!["couples", "families", "single", "total"]);
    assert!(facts.iter().all(|f| f.5 == outcome.run_id));
    assert!(facts.contains(&fact("households", "Altstadt", "total", 2022, 60.0, &outcome.run_id)));
    assert!(facts.contains(&fact("households", "Altstadt", "total", 2023, 63.0, &outcome.run_id)));
}

#[tokio::test]
async fn test_computed_total_uses_decimal_comma_values() {
    let env = TestEnv::new().await;
    let mut households = descriptor(HOUSEHOLDS);
    households.csv.decimal_separator = ',';
    env.write_csv(
        "households.csv",
        "Jahr;Stadtteil;Single;Paare;Familien\n\
         2022;Altstadt;1,5;2,5;1.000,25\n\
         2023;Altstadt;1,5;-;3\n",
    );

    let outcome = env.orchestrator.import(&households).await.unwrap();

    let facts = env.facts("households").await;
    assert!(facts.contains(&fact("households", "Altstadt", "total", 2022, 1004.25, &outcome.run_id)));
    // a placeholder operand leaves the total unknown instead of counting as zero
    assert!(!facts.iter().any(|f| f.2 == "total" && f.3 == 2023));
    assert!(facts.contains(&fact("households", "Altstadt", "single", 2023, 1.5, &outcome.run_id)));
    assert_eq!(outcome.imported, 6);
}

#[tokio::test]
async fn test_category_filter_and_keep_last_dedupe() {
    let env = TestEnv::new().await;
    let source = HOUSEHOLDS.replace(
        "unit = \"count\"",
        "unit = \"count\"\n    dedupe_by_area_year_keep_last = true\n    filter = { column = \"Art\", values = [\"Privat\"] }",
    );
    env.write_csv(
        "households.csv",
        "Jahr;Art;Stadtteil;Single;Paare;Familien\n\
         2022;Privat;Altstadt;1;1;1\n\
         2022;Privat;Altstadt;10;20;30\n\
         Summe;Gewerbe;Altstadt;99;99;99\n",
    );

    let outcome = env.orchestrator.import(&descriptor(&source)).await.unwrap();

    // the filtered-out "Summe" label is never parsed
    assert_eq!(outcome.imported, 4);
    let facts = env.facts("households").await;
    assert!(facts.contains(&fact("households", "Altstadt", "single", 2022, 10.0, &outcome.run_id)));
    assert!(facts.contains(&fact("households", "Altstadt", "total", 2022, 60.0, &outcome.run_id)));
}

#[tokio::test]
async fn test_bad_year_label_fails_run() {
    let env = TestEnv::new().await;
    env.write_csv(
        "households.csv",
        "Jahr;Stadtteil;Single;Paare;Familien\nzweitausend;Altstadt;10;20;30\n",
    );

    let err = env.orchestrator.import(&descriptor(HOUSEHOLDS)).await.unwrap_err();

    match err {
        ImportError::Transform(TransformError::InvalidYearLabel { label, .. }) => {
            assert_eq!(label, "zweitausend");
        },
        other => panic!("expected invalid year label, got {other}"),
    }
    let run = env.latest_run("households").await;
    assert_eq!(run.status, RunStatus::Failed.as_str());
    assert!(run.error_message.unwrap().contains("zweitausend"));
    assert!(env.facts("households").await.is_empty());
}

#[tokio::test]
async fn test_year_out_of_range_fails_run() {
    let env = TestEnv::new().await;
    env.write_csv(
        "households.csv",
        "Jahr;Stadtteil;Single;Paare;Familien\n1850;Altstadt;10;20;30\n",
    );

    let err = env.orchestrator.import(&descriptor(HOUSEHOLDS)).await.unwrap_err();

    assert!(matches!(
        err,
        ImportError::Transform(TransformError::YearOutOfRange { year: 1850, .. })
    ));
}

#[tokio::test]
async fn test_missing_value_source_names_candidates() {
    let env = TestEnv::new().await;
    env.write_csv("households.csv", "Jahr;Stadtteil;Single;Paare\n2022;Altstadt;10;20\n");

    let err = env.orchestrator.import(&descriptor(HOUSEHOLDS)).await.unwrap_err();

    match err {
        ImportError::Transform(TransformError::NoValueSource { category, tried, .. }) => {
            assert_eq!(category, "families");
            assert_eq!(tried, "Familien");
        },
        other => panic!("expected missing value source, got {other}"),
    }
}

// ============================================================================
// Publish semantics
// ============================================================================

#[tokio::test]
async fn test_vanished_rows_are_deleted_within_scope() {
    let env = TestEnv::new().await;
    let population = descriptor(POPULATION);
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022;2023\n\
         Einwohner insgesamt;Altstadt;1213;1220\n\
         Einwohner insgesamt;Neustadt;900;910\n",
    );
    env.orchestrator.import(&population).await.unwrap();
    env.execute(
        "INSERT INTO statistics VALUES \
         ('population', 'city', 'Gesamt', 2022, 5000, 'persons', 'total', 'city_totals', 'r0', 't', 'v'), \
         ('households', 'district', 'Altstadt', 2022, 7, 'count', 'single', 'households', 'r0', 't', 'v')",
    )
    .await;

    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2023\nEinwohner insgesamt;Altstadt;1221\n",
    );
    let outcome = env.orchestrator.import(&population).await.unwrap();

    assert_eq!(outcome.imported, 1);
    assert_eq!(outcome.published.deleted_stale, 3);
    assert_eq!(
        env.facts("population").await,
        vec![fact("population", "Altstadt", "total", 2023, 1221.0, &outcome.run_id)]
    );
    // other area types and other indicators are out of scope
    assert_eq!(env.facts("city_totals").await.len(), 1);
    assert_eq!(env.facts("households").await.len(), 1);
}

#[tokio::test]
async fn test_indicators_sharing_a_category_reconcile_separately() {
    let env = TestEnv::new().await;
    let source = format!(
        "{POPULATION}\n    [[format.rows]]\n    filter_value = \"Haushalte\"\n    \
         indicator = \"households\"\n    unit = \"count\"\n    category = \"total\"\n"
    );
    let dataset = descriptor(&source);
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022\nEinwohner insgesamt;Altstadt;100\nHaushalte;Altstadt;50\n",
    );
    env.orchestrator.import(&dataset).await.unwrap();

    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022\nEinwohner insgesamt;Altstadt;101\nHaushalte;Altstadt;-\n",
    );
    let outcome = env.orchestrator.import(&dataset).await.unwrap();

    assert_eq!(outcome.imported, 1);
    assert_eq!(outcome.published.deleted_stale, 1);
    assert_eq!(
        env.facts("population").await,
        vec![fact("population", "Altstadt", "total", 2022, 101.0, &outcome.run_id)]
    );
}

#[tokio::test]
async fn test_zero_staged_rows_keep_published_data() {
    let env = TestEnv::new().await;
    let population = descriptor(POPULATION);
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022;2023\nEinwohner insgesamt;Altstadt;1213;1220\n",
    );
    let published = env.orchestrator.import(&population).await.unwrap();

    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022;2023\nEinwohner männlich;Altstadt;600;610\n",
    );
    let err = env.orchestrator.import(&population).await.unwrap_err();

    assert!(matches!(err, ImportError::EmptyStaging { .. }), "unexpected error: {err}");
    assert_eq!(
        env.facts("population").await,
        vec![
            fact("population", "Altstadt", "total", 2022, 1213.0, &published.run_id),
            fact("population", "Altstadt", "total", 2023, 1220.0, &published.run_id),
        ]
    );
    let run = env.latest_run("population").await;
    assert_ne!(run.run_id, published.run_id);
    assert_eq!(run.status, RunStatus::Failed.as_str());
    assert!(run.failed_at.is_some());
    assert!(run.error_message.unwrap().contains("zero rows"));
}

#[tokio::test]
async fn test_failed_publish_rolls_back_everything() {
    let env = TestEnv::new().await;
    let population = descriptor(POPULATION);
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022;2023\nEinwohner insgesamt;Altstadt;1213;1220\n",
    );
    let published = env.orchestrator.import(&population).await.unwrap();

    // upsert of 2023 succeeds, then the stale delete of 2022 aborts
    env.execute(
        "CREATE TRIGGER block_deletes BEFORE DELETE ON statistics \
         BEGIN SELECT RAISE(ABORT, 'deletes are blocked'); END;",
    )
    .await;
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2023\nEinwohner insgesamt;Altstadt;9999\n",
    );
    let err = env.orchestrator.import(&population).await.unwrap_err();

    assert!(matches!(err, ImportError::Database(_)), "unexpected error: {err}");
    assert_eq!(
        env.facts("population").await,
        vec![
            fact("population", "Altstadt", "total", 2022, 1213.0, &published.run_id),
            fact("population", "Altstadt", "total", 2023, 1220.0, &published.run_id),
        ]
    );
    let run = env.latest_run("population").await;
    assert_eq!(run.status, RunStatus::Failed.as_str());
    assert!(run.row_count.is_none());
    assert!(run.error_message.unwrap().contains("deletes are blocked"));
}

// ============================================================================
// Preconditions and batches
// ============================================================================

#[tokio::test]
async fn test_missing_csv_is_a_skip() {
    let env = TestEnv::new().await;

    let err = env.orchestrator.import(&descriptor(POPULATION)).await.unwrap_err();

    assert!(err.is_skip());
    assert!(matches!(err, ImportError::CsvMissing { .. }));
}

#[tokio::test]
async fn test_unmigrated_database_is_refused() {
    let env = TestEnv::unmigrated().await;
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022\nEinwohner insgesamt;Altstadt;1213\n",
    );

    let err = env.orchestrator.import(&descriptor(POPULATION)).await.unwrap_err();

    assert!(matches!(err, ImportError::MigrationsPending(_)), "unexpected error: {err}");
    assert!(err.to_string().contains("statdb-ingest migrate"));
}

#[tokio::test]
async fn test_import_all_collects_outcomes() {
    let env = TestEnv::new().await;
    let manifest = Manifest::parse(&format!(
        "[[dataset]]\n{}\n[[dataset]]\n{}",
        POPULATION.replace("[format]", "[dataset.format]").replace("[[format.", "[[dataset.format."),
        HOUSEHOLDS.replace("[format]", "[dataset.format]").replace("[[format.", "[[dataset.format."),
    ))
    .unwrap();
    env.write_csv(
        "population.csv",
        "Merkmal;Stadtteil;2022\nEinwohner insgesamt;Altstadt;1213\n",
    );

    let summary = env.orchestrator.import_all(&manifest).await;

    assert!(summary.is_success());
    assert_eq!(summary.succeeded.len(), 1);
    assert_eq!(summary.succeeded[0].dataset_id, "population");
    assert_eq!(summary.skipped, vec!["households".to_string()]);
}

#[tokio::test]
async fn test_import_all_reports_failures() {
    let env = TestEnv::new().await;
    let manifest = Manifest::parse(&format!(
        "[[dataset]]\n{}",
        HOUSEHOLDS.replace("[format]", "[dataset.format]").replace("[[format.", "[[dataset.format."),
    ))
    .unwrap();
    env.write_csv(
        "households.csv",
        "Jahr;Stadtteil;Single;Paare;Familien\n1850;Altstadt;10;20;30\n",
    );

    let summary = env.orchestrator.import_all(&manifest).await;

    assert!(!summary.is_success());
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].dataset_id, "households");
    assert!(summary.failed[0].error.contains("1850"));
    env.manager.close().await;
}
