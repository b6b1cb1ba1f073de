//! HTTP Download Manager
//!
//! One transfer at a time per manager. Completion is a single `await`;
//! progress is published separately on a watch channel so callers can observe
//! it without owning the transfer. Cancelling keeps the partial file and hands
//! back a resume token when the server accepts byte ranges.

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use super::verify::{self, VerifyError};

const PARTIAL_SUFFIX: &str = ".partial";

/// Download error types
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("A download is already in progress")]
    Busy,
    #[error("Invalid download URL: {0}")]
    InvalidUrl(String),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Transfer interrupted: {message}")]
    Interrupted {
        message: String,
        resume: Option<ResumeToken>,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Checksum failed: {0}")]
    Checksum(#[from] VerifyError),
    #[error("Download cancelled")]
    Cancelled,
}

/// Everything needed to continue a cancelled or interrupted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub url: String,
    pub partial_path: PathBuf,
    pub bytes_received: u64,
    /// ETag or Last-Modified of the original response, sent as If-Range.
    pub validator: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ResumeToken {
    fn destination(&self) -> PathBuf {
        let name = self.partial_path.to_string_lossy();
        PathBuf::from(name.strip_suffix(PARTIAL_SUFFIX).unwrap_or(&name).to_string())
    }
}

#[derive(Debug, Clone)]
struct TransferState {
    url: String,
    partial_path: PathBuf,
    bytes_received: u64,
    resumable: bool,
    validator: Option<String>,
}

impl TransferState {
    fn token(&self) -> Option<ResumeToken> {
        self.resumable.then(|| ResumeToken {
            url: self.url.clone(),
            partial_path: self.partial_path.clone(),
            bytes_received: self.bytes_received,
            validator: self.validator.clone(),
            created_at: Utc::now(),
        })
    }
}

/// Clears the in-flight flag however the transfer ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Download manager for update artifacts
pub struct DownloadManager {
    client: reqwest::Client,
    download_dir: PathBuf,
    in_flight: AtomicBool,
    transfer: Mutex<Option<TransferState>>,
    cancel: watch::Sender<bool>,
    progress: watch::Sender<f64>,
}

impl DownloadManager {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("bundleup/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self::with_client(client, download_dir)
    }

    pub fn with_client(client: reqwest::Client, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            download_dir: download_dir.into(),
            in_flight: AtomicBool::new(false),
            transfer: Mutex::new(None),
            cancel: watch::channel(false).0,
            progress: watch::channel(0.0).0,
        }
    }

    /// Progress of the current transfer as a fraction in [0, 1]; never decreases
    /// within one transfer.
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.subscribe()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fetch `url` into the download directory, verifying `expected_checksum`
    /// (sha256 hex) when given.
    pub async fn begin(&self, url: &str, expected_checksum: Option<&str>) -> Result<PathBuf, DownloadError> {
        let _guard = self.acquire()?;
        let destination = self.download_dir.join(file_name_for_url(url)?);
        let partial_path = partial_path_for(&destination);

        fs::create_dir_all(&self.download_dir).await?;
        // Any stale partial from an earlier attempt is not ours to continue.
        if fs::try_exists(&partial_path).await? {
            fs::remove_file(&partial_path).await?;
        }

        self.run(url, &partial_path, &destination, 0, None, expected_checksum).await
    }

    /// Continue a transfer from a token handed out by `cancel` or an
    /// interrupted `begin`.
    pub async fn resume(&self, token: ResumeToken, expected_checksum: Option<&str>) -> Result<PathBuf, DownloadError> {
        let _guard = self.acquire()?;
        let destination = token.destination();
        let offset = match fs::metadata(&token.partial_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        tracing::info!(url = %token.url, offset, "resuming download");
        self.run(
            &token.url,
            &token.partial_path,
            &destination,
            offset,
            token.validator.as_deref(),
            expected_checksum,
        )
        .await
    }

    /// Ask the in-flight transfer to stop. Returns a resume token when the
    /// server supports byte ranges.
    pub fn cancel(&self) -> Option<ResumeToken> {
        if !self.is_in_flight() {
            return None;
        }
        self.cancel.send_replace(true);
        let transfer = self.transfer.lock().ok()?;
        transfer.as_ref().and_then(TransferState::token)
    }

    fn acquire(&self) -> Result<InFlight<'_>, DownloadError> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DownloadError::Busy)?;
        self.cancel.send_replace(false);
        self.progress.send_replace(0.0);
        Ok(InFlight(&self.in_flight))
    }

    fn record(&self, state: Option<TransferState>) {
        if let Ok(mut transfer) = self.transfer.lock() {
            *transfer = state;
        }
    }

    fn update_bytes(&self, bytes: u64) {
        if let Ok(mut transfer) = self.transfer.lock() {
            if let Some(state) = transfer.as_mut() {
                state.bytes_received = bytes;
            }
        }
    }

    fn report(&self, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        self.progress.send_if_modified(|current| {
            if fraction > *current {
                *current = fraction;
                true
            } else {
                false
            }
        });
    }

    async fn run(
        &self,
        url: &str,
        partial_path: &Path,
        destination: &Path,
        offset: u64,
        validator: Option<&str>,
        expected_checksum: Option<&str>,
    ) -> Result<PathBuf, DownloadError> {
        let result = self
            .transfer(url, partial_path, destination, offset, validator, expected_checksum)
            .await;
        self.record(None);
        match &result {
            Ok(path) => tracing::info!(path = %path.display(), "download complete"),
            Err(DownloadError::Cancelled) => tracing::info!(%url, "download cancelled"),
            Err(e) => tracing::warn!(%url, error = %e, "download failed"),
        }
        result
    }

    async fn transfer(
        &self,
        url: &str,
        partial_path: &Path,
        destination: &Path,
        offset: u64,
        validator: Option<&str>,
        expected_checksum: Option<&str>,
    ) -> Result<PathBuf, DownloadError> {
        let mut cancel_rx = self.cancel.subscribe();
        if *cancel_rx.borrow_and_update() {
            return Err(DownloadError::Cancelled);
        }

        // Build request with range header if resuming
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
            if let Some(validator) = validator {
                request = request.header(IF_RANGE, validator);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::InvalidResponse(format!("HTTP {}", status)));
        }

        // A full response to a ranged request means the server restarted us.
        let start_byte = if offset > 0 && status == StatusCode::PARTIAL_CONTENT {
            offset
        } else {
            0
        };
        if offset > 0 && start_byte == 0 {
            tracing::info!(%url, "server ignored range request, restarting from zero");
        }

        let headers = response.headers();
        let total_size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(|len| len + start_byte)
            .unwrap_or(0);
        let resumable = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(start_byte > 0);
        let validator = headers
            .get(ETAG)
            .or_else(|| headers.get(LAST_MODIFIED))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut file = if start_byte > 0 {
            OpenOptions::new().append(true).open(partial_path).await?
        } else {
            fs::File::create(partial_path).await?
        };

        self.record(Some(TransferState {
            url: url.to_string(),
            partial_path: partial_path.to_path_buf(),
            bytes_received: start_byte,
            resumable,
            validator,
        }));

        let mut downloaded = start_byte;
        if total_size > 0 {
            self.report(downloaded as f64 / total_size as f64);
        }

        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                changed = cancel_rx.changed() => {
                    if changed.is_ok() && *cancel_rx.borrow() {
                        file.flush().await?;
                        return Err(DownloadError::Cancelled);
                    }
                }
                chunk = stream.next() => {
                    let Some(chunk) = chunk else { break };
                    let chunk = match chunk {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            file.flush().await?;
                            let resume = self.transfer.lock().ok().and_then(|t| t.as_ref().and_then(TransferState::token));
                            return Err(DownloadError::Interrupted { message: e.to_string(), resume });
                        }
                    };
                    file.write_all(&chunk).await?;
                    downloaded += chunk.len() as u64;
                    self.update_bytes(downloaded);
                    if total_size > 0 {
                        self.report(downloaded as f64 / total_size as f64);
                    }
                }
            }
        }

        file.flush().await?;
        drop(file);

        if total_size > 0 && downloaded != total_size {
            let resume = self.transfer.lock().ok().and_then(|t| t.as_ref().and_then(TransferState::token));
            return Err(DownloadError::Interrupted {
                message: format!("received {} of {} bytes", downloaded, total_size),
                resume,
            });
        }

        if let Some(expected) = expected_checksum {
            let partial = partial_path.to_path_buf();
            let expected = expected.to_string();
            let verdict = tokio::task::spawn_blocking(move || verify::verify_checksum(&partial, &expected))
                .await
                .map_err(|e| DownloadError::InvalidResponse(format!("checksum task failed: {}", e)))?;
            if let Err(e) = verdict {
                let _ = fs::remove_file(partial_path).await;
                return Err(e.into());
            }
        }

        // Rename to final destination
        fs::rename(partial_path, destination).await?;
        self.report(1.0);
        Ok(destination.to_path_buf())
    }
}

fn partial_path_for(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Last path segment of the URL, used as the artifact's file name.
pub fn file_name_for_url(url: &str) -> Result<String, DownloadError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
    let name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back().map(str::to_string))
        .filter(|name| !name.is_empty() && name != "." && name != "..")
        .unwrap_or_else(|| "download".to_string());
    Ok(name)
}
