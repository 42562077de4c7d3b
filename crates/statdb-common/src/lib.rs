//! statdb Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the statdb workspace members.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Retry**: [`retry::BackoffPolicy`], the single exponential backoff used by
//!   database bootstrap and HTTP downloads
//! - **Checksums**: SHA-256 helpers for downloaded files
//!
//! # Example
//!
//! ```no_run
//! use statdb_common::retry::BackoffPolicy;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), std::io::Error> {
//! let policy = BackoffPolicy::new(3, Duration::from_millis(100), Duration::from_secs(2));
//! let bytes = policy
//!     .run("read manifest", |_| true, |_attempt| tokio::fs::read("datasets.toml"))
//!     .await?;
//! # drop(bytes);
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod retry;

// Re-export commonly used types
pub use error::{CommonError, Result};
