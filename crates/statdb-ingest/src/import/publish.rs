//! Atomic publish
//!
//! Staged rows are merged into `statistics`, rows of the dataset's scope
//! that vanished from the source are deleted, and the run is marked
//! published, all in one transaction. Any failure rolls the whole block
//! back, leaving previously published facts exactly as they were.

use super::runs::mark_published;
use super::ImportError;
use crate::transform::{quote_ident, temp_table, FACT_COLUMNS, STAGING_TABLE, UPSERT_ON_KEY};
use sqlx::{Connection, SqliteConnection};
use tracing::{debug, warn};

/// What a successful publish changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub upserted: u64,
    pub deleted_stale: u64,
}

/// Create (or recreate) the empty staging table on `conn`
pub async fn create_staging_table(conn: &mut SqliteConnection) -> Result<(), ImportError> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {}", temp_table(STAGING_TABLE)))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TEMP TABLE {} (\
         indicator TEXT NOT NULL, area_type TEXT NOT NULL, area_name TEXT NOT NULL, \
         year INTEGER NOT NULL, value REAL NOT NULL, unit TEXT NOT NULL, category TEXT NOT NULL, \
         source_dataset TEXT NOT NULL, import_run_id TEXT NOT NULL, loaded_at TEXT NOT NULL, \
         data_version TEXT NOT NULL, \
         PRIMARY KEY (indicator, area_type, area_name, year, category))",
        quote_ident(STAGING_TABLE)
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Merge staging into `statistics`, reconcile stale rows and finalize the run
///
/// `scope` lists the `(indicator, category)` pairs the dataset declares.
pub async fn publish(
    conn: &mut SqliteConnection,
    run_id: &str,
    area_type: &str,
    scope: &[(String, String)],
    row_count: u64,
) -> Result<PublishReport, ImportError> {
    let mut tx = conn.begin().await?;

    match publish_in(&mut tx, run_id, area_type, scope, row_count).await {
        Ok(report) => {
            tx.commit().await?;
            Ok(report)
        },
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback after failed publish also failed");
            }
            Err(err)
        },
    }
}

async fn publish_in(
    conn: &mut SqliteConnection,
    run_id: &str,
    area_type: &str,
    scope: &[(String, String)],
    row_count: u64,
) -> Result<PublishReport, ImportError> {
    let staging = temp_table(STAGING_TABLE);

    let upserted = sqlx::query(&format!(
        "INSERT INTO statistics ({FACT_COLUMNS}) SELECT {FACT_COLUMNS} FROM {staging} WHERE true {UPSERT_ON_KEY}"
    ))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let mut deleted_stale = 0;
    for (indicator, category) in scope {
        let deleted = delete_stale(conn, &staging, indicator, area_type, category).await?;
        if deleted > 0 {
            debug!(%indicator, %category, deleted, "Removed stale rows");
        }
        deleted_stale += deleted;
    }

    mark_published(conn, run_id, row_count).await?;

    Ok(PublishReport {
        upserted,
        deleted_stale,
    })
}

/// Delete published rows of one scope with no staged counterpart
///
/// The counterpart must carry the same indicator; two indicators sharing a
/// category are reconciled independently.
async fn delete_stale(
    conn: &mut SqliteConnection,
    staging: &str,
    indicator: &str,
    area_type: &str,
    category: &str,
) -> Result<u64, ImportError> {
    let result = sqlx::query(&format!(
        "DELETE FROM statistics \
         WHERE indicator = ?1 AND area_type = ?2 AND category = ?3 \
         AND NOT EXISTS (\
             SELECT 1 FROM {staging} AS s \
             WHERE s.indicator = statistics.indicator \
             AND s.area_type = statistics.area_type \
             AND s.area_name = statistics.area_name \
             AND s.year = statistics.year \
             AND s.category = statistics.category)"
    ))
    .bind(indicator)
    .bind(area_type)
    .bind(category)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
