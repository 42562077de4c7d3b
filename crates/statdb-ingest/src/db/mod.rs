//! Embedded database access
//!
//! - **bootstrap**: opening a database plus its pool connections, with backoff
//! - **pool**: the leasing [`ConnectionManager`] with ping-and-recreate recovery
//! - **sqlite**: the SQLite backend used in production
//! - **migrations**: the checksummed schema migration ledger on top of sqlx's migrator

pub mod bootstrap;
pub mod migrations;
pub mod pool;
pub mod sqlite;

pub use bootstrap::bootstrap_pool;
pub use migrations::{
    apply_migrations, ensure_current, MigrationError, MigrationReport, LEDGER_TABLE, MIGRATOR,
};
pub use pool::{ConnectionManager, Connector, PoolConfig, PoolConnection, PoolError, PoolStatus};
pub use sqlite::{sqlite_manager, SqliteConnector, SqliteDatabase, SqlitePoolManager};

use thiserror::Error;

/// Database operation errors with contextual information
#[derive(Error, Debug)]
pub enum DbError {
    /// SQL query or connection error
    #[error("Database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Creating the database directory failed
    #[error("Database file error: {0}")]
    Io(#[from] std::io::Error),

    /// Leasing a connection failed
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Schema migration failed or drifted
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Database configuration is invalid
    #[error("Database configuration error: {0}")]
    Config(String),
}

impl DbError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Apply all pending migrations over a leased connection
pub async fn migrate(manager: &SqlitePoolManager) -> DbResult<MigrationReport> {
    manager
        .with_connection(|conn| {
            Box::pin(async move { Ok(apply_migrations(conn, &MIGRATOR).await?) })
        })
        .await
}
