//! Working-directory artifact storage, ingestion markers and HTTP fetch for PSR.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use psr_core::IngestionMarker;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "psr-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub replaced: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// File name for a downloaded artifact: the URL's last path segment, sanitized.
    pub fn artifact_file_name(url: &str, fallback: &str) -> String {
        let without_query = url.split(['?', '#']).next().unwrap_or_default();
        let last = without_query.rsplit('/').next().unwrap_or_default();
        let decoded = last.replace("%20", " ");
        let cleaned = sanitize_file_name(&decoded);
        if cleaned.is_empty() {
            let fallback = sanitize_file_name(fallback);
            if fallback.is_empty() {
                "artifact.bin".to_string()
            } else {
                fallback
            }
        } else {
            cleaned
        }
    }

    /// Write bytes under `file_name`, replacing any previous file via temp-file rename.
    pub async fn store_named(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let absolute_path = self.root.join(file_name);
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating artifact directory {}", self.root.display()))?;

        let replaced = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;

        write_atomically(&absolute_path, bytes).await?;

        Ok(StoredArtifact {
            file_name: file_name.to_string(),
            absolute_path,
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
            replaced,
        })
    }
}

fn sanitize_file_name(input: &str) -> String {
    input
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches(|c| c == '-' || c == '.')
        .to_string()
}

/// Replace `path` with `bytes` through a sibling temp file and a rename.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Plain-text integer marker of the last ingested recency for one source.
#[derive(Debug, Clone)]
pub struct MarkerFile {
    path: PathBuf,
}

impl MarkerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_source(data_dir: &Path, source_id: &str) -> Self {
        Self::new(data_dir.join("markers").join(format!("{source_id}.txt")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn read(&self) -> anyhow::Result<Option<IngestionMarker>> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading marker {}", self.path.display()))
            }
        };
        let last_recency = text
            .trim()
            .parse::<i64>()
            .with_context(|| format!("parsing marker {} ({:?})", self.path.display(), text.trim()))?;
        Ok(Some(IngestionMarker { last_recency }))
    }

    /// Persist `value` unless it would move the marker backwards. Returns whether it was written.
    pub async fn advance(&self, value: i64) -> anyhow::Result<bool> {
        if let Some(current) = self.read().await? {
            if value < current.last_recency {
                warn!(
                    marker = %self.path.display(),
                    current = current.last_recency,
                    requested = value,
                    "refusing to move ingestion marker backwards"
                );
                return Ok(false);
            }
        }
        write_atomically(&self.path, value.to_string().as_bytes()).await?;
        info!(marker = %self.path.display(), value, "ingestion marker advanced");
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {timeout_secs}s fetching {url}")]
    Timeout { url: String, timeout_secs: u64 },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    fn from_reqwest(url: &str, timeout: Duration, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                timeout_secs: timeout.as_secs(),
            }
        } else {
            FetchError::Request {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// Single-attempt GET client. Every request carries a finite timeout; retries are left to the operator.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
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

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes_with_timeout(url, self.timeout).await
    }

    pub async fn fetch_bytes_with_timeout(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url, timeout_secs = timeout.as_secs());
        async move {
            let resp = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| FetchError::from_reqwest(url, timeout, e))?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|e| FetchError::from_reqwest(url, timeout, e))?
                .to_vec();
            info!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        String::from_utf8(resp.body).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        serde_json::from_slice(&resp.body).map_err(|e| FetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}
