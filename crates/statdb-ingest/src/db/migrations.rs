//! Schema migration ledger
//!
//! Migrations are `.sql` files under `crates/statdb-ingest/migrations/`,
//! embedded at compile time by `sqlx::migrate!`. sqlx records every applied
//! version with a checksum of its SQL in `_sqlx_migrations` and applies each
//! one in its own transaction. Recorded checksums are compared with the
//! embedded files before anything runs; a mismatch means a migration was
//! edited after it was applied and blocks all further work.

use sqlx::migrate::{AppliedMigration, Migrate, MigrateError, Migration, Migrator};
use sqlx::SqliteConnection;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Migrations shipped with this binary
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Ledger table maintained by sqlx
pub const LEDGER_TABLE: &str = "_sqlx_migrations";

/// Migration ledger failures
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration {version} ({description}) changed after it was applied: recorded checksum {recorded}, current checksum {current}. Restore the original file or repair the database manually.")]
    Drift {
        version: i64,
        description: String,
        recorded: String,
        current: String,
    },

    #[error("Database records migration {version}, which this binary does not know. Upgrade statdb before touching this database.")]
    UnknownVersion { version: i64 },

    #[error("Database schema is not current: migration {version} ({description}) has not been applied. Run `statdb-ingest migrate` first.")]
    Pending { version: i64, description: String },

    #[error("Migration {version} was left partially applied. Repair the database manually.")]
    Dirty { version: i64 },

    #[error("Migration {version} ({description}) failed: {source}")]
    Failed {
        version: i64,
        description: String,
        #[source]
        source: MigrateError,
    },

    #[error("Migration ledger access failed: {0}")]
    Ledger(#[from] MigrateError),

    #[error("Migration ledger query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Outcome of [`apply_migrations`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub applied: Vec<i64>,
    pub already_applied: Vec<i64>,
}

/// Apply every pending migration in version order
///
/// Idempotent: once everything is applied this only re-verifies checksums.
pub async fn apply_migrations(
    conn: &mut SqliteConnection,
    migrator: &Migrator,
) -> Result<MigrationReport, MigrationError> {
    conn.ensure_migrations_table().await?;
    if let Some(version) = conn.dirty_version().await? {
        return Err(MigrationError::Dirty { version });
    }

    let applied = checksums_by_version(conn.list_applied_migrations().await?);
    verify_applied(&applied, migrator)?;

    let mut report = MigrationReport::default();
    for migration in up_migrations(migrator) {
        if applied.contains_key(&migration.version) {
            report.already_applied.push(migration.version);
            continue;
        }

        let elapsed = conn
            .apply(migration)
            .await
            .map_err(|source| MigrationError::Failed {
                version: migration.version,
                description: migration.description.to_string(),
                source,
            })?;
        info!(
            version = migration.version,
            description = %migration.description,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "Applied migration"
        );
        report.applied.push(migration.version);
    }

    debug!(
        applied = report.applied.len(),
        already_applied = report.already_applied.len(),
        "Migrations up to date"
    );
    Ok(report)
}

/// Fail unless every migration is applied with an unchanged checksum
///
/// Read-only: a database that was never migrated has no ledger table and
/// reports the first migration as pending.
pub async fn ensure_current(
    conn: &mut SqliteConnection,
    migrator: &Migrator,
) -> Result<(), MigrationError> {
    let ledger_exists: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(LEDGER_TABLE)
            .fetch_one(&mut *conn)
            .await?;

    let applied = if ledger_exists > 0 {
        if let Some(version) = conn.dirty_version().await? {
            return Err(MigrationError::Dirty { version });
        }
        checksums_by_version(conn.list_applied_migrations().await?)
    } else {
        BTreeMap::new()
    };
    verify_applied(&applied, migrator)?;

    match up_migrations(migrator).find(|m| !applied.contains_key(&m.version)) {
        Some(pending) => Err(MigrationError::Pending {
            version: pending.version,
            description: pending.description.to_string(),
        }),
        None => Ok(()),
    }
}

fn up_migrations(migrator: &Migrator) -> impl Iterator<Item = &Migration> {
    migrator
        .iter()
        .filter(|migration| !migration.migration_type.is_down_migration())
}

fn checksums_by_version(applied: Vec<AppliedMigration>) -> BTreeMap<i64, Vec<u8>> {
    applied
        .into_iter()
        .map(|migration| (migration.version, migration.checksum.into_owned()))
        .collect()
}

fn verify_applied(
    applied: &BTreeMap<i64, Vec<u8>>,
    migrator: &Migrator,
) -> Result<(), MigrationError> {
    for (version, recorded) in applied {
        let Some(migration) = up_migrations(migrator).find(|m| m.version == *version) else {
            return Err(MigrationError::UnknownVersion { version: *version });
        };

        if recorded.as_slice() != &*migration.checksum {
            return Err(MigrationError::Drift {
                version: *version,
                description: migration.description.to_string(),
                recorded: hex::encode(recorded),
                current: hex::encode(&*migration.checksum),
            });
        }
    }
    Ok(())
}
