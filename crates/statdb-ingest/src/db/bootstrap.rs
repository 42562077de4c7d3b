//! Database bootstrap
//!
//! Opens a database instance and the pool's connections in one attempt, and
//! retries the whole attempt with exponential backoff. Used when the pool is
//! first initialized and again whenever it is recreated after a dead
//! connection.

use crate::db::pool::{Connector, PoolConnection};
use crate::db::DbError;
use statdb_common::retry::BackoffPolicy;
use tracing::{debug, info};

/// Open the database and `size` connections, retrying per `policy`
///
/// On failure every connection opened during the attempt is shut down and
/// the instance closed before the next attempt; the last error is returned
/// once the budget is spent.
pub async fn bootstrap_pool<C: Connector>(
    connector: &C,
    size: usize,
    policy: &BackoffPolicy,
) -> Result<(C::Database, Vec<C::Connection>), DbError> {
    if size == 0 {
        return Err(DbError::config("Pool size must be greater than 0"));
    }

    let opened = policy
        .run("open database", |_| true, |attempt| async move {
            debug!(attempt, size, "Opening database");
            open_once(connector, size).await
        })
        .await?;

    info!(connections = opened.1.len(), "Database opened");
    Ok(opened)
}

async fn open_once<C: Connector>(
    connector: &C,
    size: usize,
) -> Result<(C::Database, Vec<C::Connection>), DbError> {
    let database = connector.open().await?;
    let mut connections = Vec::with_capacity(size);

    for _ in 0..size {
        match connector.connect(&database).await {
            Ok(conn) => connections.push(conn),
            Err(err) => {
                for conn in connections {
                    conn.shutdown().await;
                }
                connector.close(database).await;
                return Err(err);
            },
        }
    }

    Ok((database, connections))
}
