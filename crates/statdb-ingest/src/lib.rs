//! statdb ingestion library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Imports third-party CSV statistics into a long-form `statistics` fact
//! table kept in an embedded SQLite database.
//!
//! # Overview
//!
//! - **config**: [`Settings`] layered from defaults, `statdb.toml` and `STATDB_*`
//! - **db**: pooled connections with ping-and-recreate recovery, and the
//!   checksummed migration ledger
//! - **datasets**: dataset descriptors and the TOML manifest
//! - **transform**: the year-column and category-column unpivot engines
//! - **import**: the orchestrator, run ledger and atomic publish
//! - **fetch**: conditional-GET downloads of source CSVs
//!
//! # Example
//!
//! ```no_run
//! use statdb_ingest::datasets::Manifest;
//! use statdb_ingest::db::{migrate, sqlite_manager};
//! use statdb_ingest::import::ImportOrchestrator;
//! use statdb_ingest::Settings;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let settings = Settings::load(None)?;
//! let manager = Arc::new(sqlite_manager(&settings));
//! migrate(&manager).await?;
//!
//! let manifest = Manifest::load(&settings.manifest_path).await?;
//! let orchestrator = ImportOrchestrator::new(Arc::clone(&manager), &settings.data_dir);
//! let outcome = orchestrator.import(manifest.get("population")?).await?;
//! println!("imported {} rows", outcome.imported);
//!
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod datasets;
pub mod db;
pub mod fetch;
pub mod import;
pub mod transform;

pub use config::{ConfigError, Settings};
pub use datasets::{DatasetDescriptor, Manifest};
pub use import::{ImportError, ImportOrchestrator, ImportOutcome, ImportSummary};
