//! Import run ledger (`etl_runs`)
//!
//! One row per import attempt. A run starts as `started` and moves exactly
//! once to `published` or `failed`; every transition is guarded on the
//! current status so a run can never be finalized twice.

use super::ImportError;
use chrono::Utc;
use serde::Serialize;
use sqlx::SqliteConnection;
use std::fs::Metadata;
use std::time::UNIX_EPOCH;

/// Longest error message stored on a failed run, in characters
pub const MAX_ERROR_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Started,
    Published,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Published => "published",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of `etl_runs`
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ImportRun {
    pub run_id: String,
    pub dataset_id: String,
    pub data_version: String,
    pub status: String,
    pub row_count: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: String,
    pub published_at: Option<String>,
    pub failed_at: Option<String>,
}

/// Lineage stamp from file size and modification time: `{size}-{mtime_ms}`
pub fn data_version(metadata: &Metadata) -> String {
    let modified_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{}-{}", metadata.len(), modified_ms)
}

/// Cut `message` to [`MAX_ERROR_MESSAGE_CHARS`] on a char boundary
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}

pub async fn create_run(
    conn: &mut SqliteConnection,
    run_id: &str,
    dataset_id: &str,
    data_version: &str,
) -> Result<(), ImportError> {
    sqlx::query(
        "INSERT INTO etl_runs (run_id, dataset_id, data_version, status, started_at) \
         VALUES (?1, ?2, ?3, 'started', ?4)",
    )
    .bind(run_id)
    .bind(dataset_id)
    .bind(data_version)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Finalize a run as published; runs inside the publish transaction
pub async fn mark_published(
    conn: &mut SqliteConnection,
    run_id: &str,
    row_count: u64,
) -> Result<(), ImportError> {
    let row_count = i64::try_from(row_count).unwrap_or(i64::MAX);
    let result = sqlx::query(
        "UPDATE etl_runs SET status = 'published', row_count = ?1, published_at = ?2 \
         WHERE run_id = ?3 AND status = 'started'",
    )
    .bind(row_count)
    .bind(Utc::now().to_rfc3339())
    .bind(run_id)
    .execute(&mut *conn)
    .await?;

    ensure_transitioned(run_id, RunStatus::Published, result.rows_affected())
}

/// Finalize a run as failed with a truncated message
pub async fn mark_failed(
    conn: &mut SqliteConnection,
    run_id: &str,
    message: &str,
) -> Result<(), ImportError> {
    let result = sqlx::query(
        "UPDATE etl_runs SET status = 'failed', error_message = ?1, failed_at = ?2 \
         WHERE run_id = ?3 AND status = 'started'",
    )
    .bind(truncate_message(message))
    .bind(Utc::now().to_rfc3339())
    .bind(run_id)
    .execute(&mut *conn)
    .await?;

    ensure_transitioned(run_id, RunStatus::Failed, result.rows_affected())
}

fn ensure_transitioned(run_id: &str, target: RunStatus, rows_affected: u64) -> Result<(), ImportError> {
    if rows_affected == 1 {
        Ok(())
    } else {
        Err(ImportError::RunState {
            run_id: run_id.to_string(),
            target: target.as_str(),
        })
    }
}

pub async fn get_run(conn: &mut SqliteConnection, run_id: &str) -> Result<Option<ImportRun>, ImportError> {
    let run = sqlx::query_as::<_, ImportRun>("SELECT * FROM etl_runs WHERE run_id = ?1")
        .bind(run_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(run)
}

/// Most recent runs of a dataset, newest first
pub async fn recent_runs(
    conn: &mut SqliteConnection,
    dataset_id: &str,
    limit: i64,
) -> Result<Vec<ImportRun>, ImportError> {
    let runs = sqlx::query_as::<_, ImportRun>(
        "SELECT * FROM etl_runs WHERE dataset_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
    )
    .bind(dataset_id)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    Ok(runs)
}
