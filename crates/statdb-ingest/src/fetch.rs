//! CSV downloader
//!
//! Downloads a dataset's CSV into the data directory with a conditional GET.
//! Validators from the previous download are kept in a `<file>.meta.json`
//! sidecar; a `304 Not Modified` leaves the file alone. Network errors,
//! `5xx` and `429` are retried with backoff, other statuses fail at once.
//! Both the CSV and its sidecar are written to a temporary file in the
//! target directory and renamed into place.

use crate::config::Settings;
use crate::datasets::DatasetDescriptor;
use chrono::Utc;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use statdb_common::checksum::{sha256_hex, verify_file_sha256};
use statdb_common::retry::BackoffPolicy;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Download failures
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Dataset '{0}' has no download URL")]
    NoUrl(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("GET {url} returned {status}")]
    Status { url: String, status: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid metadata sidecar: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("File task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl FetchError {
    /// Network trouble, server errors and rate limiting are worth a retry
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http(err) => !err.is_builder(),
            FetchError::Status { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            },
            _ => false,
        }
    }
}

/// Validators and provenance of the last successful download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMetadata {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    pub fetched_at: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded { path: PathBuf, size: u64, sha256: String },
    NotModified { path: PathBuf },
}

enum Response {
    NotModified,
    Body {
        bytes: Vec<u8>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

/// Downloads dataset files into one directory
pub struct Fetcher {
    client: Client,
    policy: BackoffPolicy,
    data_dir: PathBuf,
}

impl Fetcher {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(settings.fetch_timeout())
            .user_agent(concat!("statdb-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(client, settings.fetch_policy(), &settings.data_dir))
    }

    pub fn with_client(client: Client, policy: BackoffPolicy, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            policy,
            data_dir: data_dir.into(),
        }
    }

    pub fn target_path(&self, descriptor: &DatasetDescriptor) -> PathBuf {
        self.data_dir.join(&descriptor.filename)
    }

    /// Download one dataset unless the server reports it unchanged
    pub async fn fetch(&self, descriptor: &DatasetDescriptor) -> Result<FetchOutcome, FetchError> {
        let url = descriptor
            .url
            .as_deref()
            .ok_or_else(|| FetchError::NoUrl(descriptor.id.clone()))?;
        let target = self.target_path(descriptor);
        let sidecar = metadata_path(&target);
        let previous = tokio::task::spawn_blocking({
            let (target, sidecar, url) = (target.clone(), sidecar.clone(), url.to_string());
            move || read_metadata(&target, &sidecar, &url)
        })
        .await??;

        let what = format!("download {}", descriptor.id);
        let response = self
            .policy
            .run(&what, FetchError::is_retryable, |attempt| {
                debug!(attempt, %url, "Requesting dataset");
                self.request(url, previous.as_ref())
            })
            .await?;

        match response {
            Response::NotModified => {
                info!(dataset = %descriptor.id, "Dataset not modified");
                Ok(FetchOutcome::NotModified { path: target })
            },
            Response::Body {
                bytes,
                etag,
                last_modified,
            } => {
                let sha256 = sha256_hex(&bytes);
                let size = bytes.len() as u64;
                let metadata = FetchMetadata {
                    url: url.to_string(),
                    etag,
                    last_modified,
                    fetched_at: Utc::now().to_rfc3339(),
                    sha256: sha256.clone(),
                    size,
                };
                let sidecar_contents = serde_json::to_vec_pretty(&metadata)?;

                // body first: a sidecar never describes a file that is not on disk
                tokio::task::spawn_blocking({
                    let (target, sidecar) = (target.clone(), sidecar.clone());
                    move || {
                        write_atomic(&target, &bytes)?;
                        write_atomic(&sidecar, &sidecar_contents)
                    }
                })
                .await??;

                info!(dataset = %descriptor.id, size, %sha256, "Dataset downloaded");
                Ok(FetchOutcome::Downloaded {
                    path: target,
                    size,
                    sha256,
                })
            },
        }
    }

    async fn request(&self, url: &str, previous: Option<&FetchMetadata>) -> Result<Response, FetchError> {
        let mut request = self.client.get(url);
        if let Some(previous) = previous {
            if let Some(etag) = &previous.etag {
                request = request.header(IF_NONE_MATCH, etag);
            }
            if let Some(last_modified) = &previous.last_modified {
                request = request.header(IF_MODIFIED_SINCE, last_modified);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Response::NotModified);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);
        let bytes = response.bytes().await?.to_vec();

        Ok(Response::Body {
            bytes,
            etag,
            last_modified,
        })
    }
}

/// `<file>.meta.json` next to the downloaded file
pub fn metadata_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".meta.json");
    target.with_file_name(name)
}

/// Previous validators, only when the file on disk is still the one they describe
fn read_metadata(target: &Path, sidecar: &Path, url: &str) -> Result<Option<FetchMetadata>, FetchError> {
    if !target.exists() || !sidecar.exists() {
        return Ok(None);
    }
    let metadata: FetchMetadata = serde_json::from_slice(&std::fs::read(sidecar)?)?;
    if metadata.url != url {
        return Ok(None);
    }
    if let Err(err) = verify_file_sha256(target, &metadata.sha256) {
        debug!(error = %err, "Local file changed since its download, ignoring validators");
        return Ok(None);
    }
    Ok(Some(metadata))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), FetchError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| FetchError::Io(err.error))?;
    Ok(())
}
