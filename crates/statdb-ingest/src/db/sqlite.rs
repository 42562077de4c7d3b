//! SQLite backend for the connection pool
//!
//! The database instance is a set of validated connect options plus one
//! primary connection. The primary connection creates the file, switches the
//! journal to WAL and stays open for as long as the pool generation lives.

use crate::config::Settings;
use crate::db::pool::{ConnectionManager, Connector, PoolConfig, PoolConnection};
use crate::db::DbError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Pool manager over SQLite connections
pub type SqlitePoolManager = ConnectionManager<SqliteConnector>;

/// Opens SQLite databases at a fixed path
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    path: PathBuf,
    busy_timeout: Duration,
}

/// An opened SQLite database
pub struct SqliteDatabase {
    options: SqliteConnectOptions,
    primary: SqliteConnection,
}

impl SqliteConnector {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout)
            .foreign_keys(true)
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    type Database = SqliteDatabase;
    type Connection = SqliteConnection;

    async fn open(&self) -> Result<SqliteDatabase, DbError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = self.options();
        let primary = options.connect().await?;
        debug!(path = %self.path.display(), "SQLite database opened");

        Ok(SqliteDatabase { options, primary })
    }

    async fn connect(&self, database: &SqliteDatabase) -> Result<SqliteConnection, DbError> {
        Ok(database.options.connect().await?)
    }

    async fn close(&self, database: SqliteDatabase) {
        if let Err(err) = database.primary.close().await {
            warn!(error = %err, path = %self.path.display(), "Failed to close SQLite database");
        }
    }
}

#[async_trait]
impl PoolConnection for SqliteConnection {
    async fn ping(&mut self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&mut *self).await?;
        Ok(())
    }

    async fn shutdown(self) {
        if let Err(err) = Connection::close(self).await {
            debug!(error = %err, "Failed to close pooled SQLite connection");
        }
    }
}

/// Build the production pool manager from settings
pub fn sqlite_manager(settings: &Settings) -> SqlitePoolManager {
    let connector = SqliteConnector::new(
        &settings.database_path,
        Duration::from_millis(settings.busy_timeout_ms),
    );
    let config = PoolConfig {
        size: settings.pool_size,
        acquire_timeout: Duration::from_millis(settings.acquire_timeout_ms),
        bootstrap: settings.bootstrap_policy(),
    };
    ConnectionManager::new(connector, config)
}
