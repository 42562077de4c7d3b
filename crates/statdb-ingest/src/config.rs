//! Configuration management
//!
//! [`Settings`] is built once by the binary and handed to the pool manager,
//! the orchestrator and the fetcher. Sources, lowest precedence first:
//! built-in defaults, an optional `statdb.toml`, then `STATDB_*` environment
//! variables (a `.env` file is loaded first when present).

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use statdb_common::retry::BackoffPolicy;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Defaults
// ============================================================================

/// Default database file.
pub const DEFAULT_DATABASE_PATH: &str = "data/statdb.sqlite";

/// Default directory holding downloaded CSV files.
pub const DEFAULT_DATA_DIR: &str = "data/raw";

/// Default dataset manifest.
pub const DEFAULT_MANIFEST_PATH: &str = "datasets.toml";

/// Default settings file consulted by [`Settings::load`].
pub const DEFAULT_SETTINGS_FILE: &str = "statdb.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "STATDB_";

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default time a caller waits for a free connection.
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 2_000;

/// Default SQLite busy timeout.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default attempts when opening the database.
pub const DEFAULT_BOOTSTRAP_ATTEMPTS: u32 = 5;

/// Default first backoff delay when opening the database.
pub const DEFAULT_BOOTSTRAP_BASE_DELAY_MS: u64 = 200;

/// Default backoff ceiling when opening the database.
pub const DEFAULT_BOOTSTRAP_MAX_DELAY_MS: u64 = 5_000;

/// Default attempts per download.
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 3;

/// Default first backoff delay between downloads.
pub const DEFAULT_FETCH_BASE_DELAY_MS: u64 = 500;

/// Default backoff ceiling between downloads.
pub const DEFAULT_FETCH_MAX_DELAY_MS: u64 = 10_000;

/// Default HTTP request timeout.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;

/// Configuration loading or validation failure
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid setting '{key}': {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            message: message.into(),
        }
    }
}

/// Runtime settings for every statdb command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub data_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    pub bootstrap_attempts: u32,
    pub bootstrap_base_delay_ms: u64,
    pub bootstrap_max_delay_ms: u64,
    pub fetch_attempts: u32,
    pub fetch_base_delay_ms: u64,
    pub fetch_max_delay_ms: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            manifest_path: PathBuf::from(DEFAULT_MANIFEST_PATH),
            pool_size: DEFAULT_POOL_SIZE,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            bootstrap_attempts: DEFAULT_BOOTSTRAP_ATTEMPTS,
            bootstrap_base_delay_ms: DEFAULT_BOOTSTRAP_BASE_DELAY_MS,
            bootstrap_max_delay_ms: DEFAULT_BOOTSTRAP_MAX_DELAY_MS,
            fetch_attempts: DEFAULT_FETCH_ATTEMPTS,
            fetch_base_delay_ms: DEFAULT_FETCH_BASE_DELAY_MS,
            fetch_max_delay_ms: DEFAULT_FETCH_MAX_DELAY_MS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    /// Load from `.env`, `statdb.toml` (or `settings_file`) and `STATDB_*`
    pub fn load(settings_file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let file = settings_file.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
        let settings: Settings = Self::figment(file).extract().map_err(Box::new)?;
        settings.validate()?;

        tracing::debug!(?settings, "Settings loaded");
        Ok(settings)
    }

    /// The layered provider stack, exposed for diagnostics and tests
    pub fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::invalid("pool_size", "must be greater than 0"));
        }

        if self.acquire_timeout_ms == 0 {
            return Err(ConfigError::invalid("acquire_timeout_ms", "must be greater than 0"));
        }

        if self.bootstrap_attempts == 0 {
            return Err(ConfigError::invalid("bootstrap_attempts", "must be greater than 0"));
        }

        if self.bootstrap_base_delay_ms > self.bootstrap_max_delay_ms {
            return Err(ConfigError::invalid(
                "bootstrap_base_delay_ms",
                format!(
                    "{} cannot be greater than bootstrap_max_delay_ms ({})",
                    self.bootstrap_base_delay_ms, self.bootstrap_max_delay_ms
                ),
            ));
        }

        if self.fetch_attempts == 0 {
            return Err(ConfigError::invalid("fetch_attempts", "must be greater than 0"));
        }

        if self.fetch_base_delay_ms > self.fetch_max_delay_ms {
            return Err(ConfigError::invalid(
                "fetch_base_delay_ms",
                format!(
                    "{} cannot be greater than fetch_max_delay_ms ({})",
                    self.fetch_base_delay_ms, self.fetch_max_delay_ms
                ),
            ));
        }

        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::invalid("fetch_timeout_secs", "must be greater than 0"));
        }

        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("database_path", "cannot be empty"));
        }

        Ok(())
    }

    pub fn bootstrap_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.bootstrap_attempts,
            Duration::from_millis(self.bootstrap_base_delay_ms),
            Duration::from_millis(self.bootstrap_max_delay_ms),
        )
    }

    pub fn fetch_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.fetch_attempts,
            Duration::from_millis(self.fetch_base_delay_ms),
            Duration::from_millis(self.fetch_max_delay_ms),
        )
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Where the CSV file for `filename` lives
    pub fn csv_path(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }
}
