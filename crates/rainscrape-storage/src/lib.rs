//! HTTP fetch with bounded retries, atomic writes, the raw artifact archive and the CSV dataset.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod dataset;

pub use dataset::{
    decode_dataset, encode_dataset, DatasetStore, LoadedDataset, SavedDataset, StoreError,
    DATASET_HEADERS,
};

/// Writes `bytes` to a hidden temp file beside `path`, syncs it and renames it into place.
///
/// On failure the temp file is removed and whatever was at `path` before is left untouched.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    result
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw response bodies, one directory per run timestamp.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(label)
            .join(format!("{content_hash}.html"))
    }

    pub async fn store_html(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        body: &str,
    ) -> anyhow::Result<StoredArtifact> {
        let bytes = body.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(fetched_at, label, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes)
                .await
                .with_context(|| format!("writing artifact {}", absolute_path.display()))?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Every non-success status counts as a transport failure.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_success() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() || err.is_decode()
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Fixed-delay retry policy shared by every outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error or attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < max_attempts =>
                {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %err,
                        "{label} failed, retrying in {:?}",
                        self.delay
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_invalid_certs: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => classify_status(*status),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if config.accept_invalid_certs {
            warn!("TLS certificate validation is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn get_text(
        &self,
        url: &str,
        policy: &RetryPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "GET", url);
        policy
            .run("GET", || self.send_once(self.client.get(url)))
            .instrument(span)
            .await
    }

    pub async fn post_form_text(
        &self,
        url: &str,
        form: &[(&str, &str)],
        policy: &RetryPolicy,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "POST", url);
        policy
            .run("POST", || self.send_once(self.client.post(url).form(form)))
            .instrument(span)
            .await
    }

    async fn send_once(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status,
                url: final_url,
            });
        }

        let body = resp.text().await?;
        debug!(%status, bytes = body.len(), "response received");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}
