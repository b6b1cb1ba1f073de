//! bundleup Self-Update System
//!
//! A verified, rollback-safe updater for application bundles.
//!
//! Components:
//! - `feed` - Remote feed document and version check
//! - `download` - HTTP download with resume
//! - `verify` - Checksum and signature verification
//! - `authenticity` - Publisher identity gate
//! - `coordinator` - In-host install and handoff
//! - `helper` - Out-of-process stage/swap/relaunch state machine

pub mod artifact;
pub mod authenticity;
pub mod coordinator;
pub mod discovery;
pub mod download;
pub mod feed;
pub mod handoff;
pub mod helper;
pub mod process;
pub mod state;
pub mod swap;
pub mod verify;
pub mod version;
pub mod workspace;

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::watch;

pub use artifact::ArtifactKind;
pub use coordinator::{InstallCoordinator, InstallError, InstallReceipt};
pub use download::{DownloadError, DownloadManager, ResumeToken};
pub use feed::{FeedClient, FeedError, UpdateManifestEntry};
pub use helper::{Helper, HelperSettings};
pub use state::{HelperError, HelperOutcome, HelperState};

use crate::engine::config::{ConfigError, UpdaterConfig};
use crate::engine::delta::{self, PatchError};
use crate::engine::fsutil;
use crate::engine::platform::{self, Platform};
use authenticity::AuthError;
use verify::{SignatureVerifier, VerifyError};

/// Broad class of a failure, which decides how a caller should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Engine misconfigured; fix setup, do not retry.
    Configuration,
    /// Network or feed problem; caller may retry or resume.
    Transport,
    /// Integrity or publisher check failed; never bypassed.
    Verification,
    /// Mount, extract or other filesystem step failed.
    Filesystem,
    /// Replacing the bundle failed.
    Swap,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Helper(#[from] HelperError),
    #[error(transparent)]
    Patch(#[from] PatchError),
}

impl UpdateError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            UpdateError::Config(_) => ErrorCategory::Configuration,
            UpdateError::Feed(_) => ErrorCategory::Transport,
            UpdateError::Download(e) => match e {
                DownloadError::Checksum(_) => ErrorCategory::Verification,
                DownloadError::Io(_) => ErrorCategory::Filesystem,
                _ => ErrorCategory::Transport,
            },
            UpdateError::Verify(VerifyError::Io(_)) => ErrorCategory::Filesystem,
            UpdateError::Verify(_) | UpdateError::Auth(_) => ErrorCategory::Verification,
            UpdateError::Install(e) => match e {
                InstallError::Verification(_) | InstallError::PackageRejected => ErrorCategory::Verification,
                InstallError::HelperNotFound => ErrorCategory::Configuration,
                _ => ErrorCategory::Filesystem,
            },
            UpdateError::Helper(e) => match e {
                HelperError::Verification(_) | HelperError::PackageRejected => ErrorCategory::Verification,
                HelperError::Swap(_) => ErrorCategory::Swap,
                _ => ErrorCategory::Filesystem,
            },
            UpdateError::Patch(e) => match e {
                PatchError::BaseMismatch { .. } | PatchError::TargetMismatch { .. } => ErrorCategory::Verification,
                _ => ErrorCategory::Filesystem,
            },
        }
    }

    /// A resume token carried by an interrupted download, if any.
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        match self {
            UpdateError::Download(DownloadError::Interrupted { resume, .. }) => resume.as_ref(),
            _ => None,
        }
    }
}

/// An artifact ready to hand to [`Updater::install`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUpdate {
    pub version: String,
    pub artifact: PathBuf,
    /// `Some(Bundle)` when the artifact was rebuilt from a delta patch.
    pub kind: Option<ArtifactKind>,
}

/// Everything an update needs, built from one validated config and passed
/// around explicitly.
pub struct Updater {
    config: UpdaterConfig,
    feed: FeedClient,
    downloads: DownloadManager,
    signatures: SignatureVerifier,
    coordinator: InstallCoordinator,
}

impl Updater {
    pub fn new(config: UpdaterConfig) -> Result<Self, UpdateError> {
        let coordinator = InstallCoordinator::system(config.clone());
        Self::with_parts(config, FeedClient::new(), coordinator)
    }

    /// Build with a specific feed client and coordinator.
    pub fn with_parts(
        config: UpdaterConfig,
        feed: FeedClient,
        coordinator: InstallCoordinator,
    ) -> Result<Self, UpdateError> {
        config.validate()?;
        let signatures = SignatureVerifier::from_config(config.ed_public_key.as_deref()).map_err(|e| {
            ConfigError::Invalid {
                field: "ed_public_key",
                reason: e.to_string(),
            }
        })?;
        let download_dir = config
            .download_dir
            .clone()
            .unwrap_or_else(|| Platform::current().download_dir());
        Ok(Self {
            downloads: DownloadManager::new(download_dir),
            config,
            feed,
            signatures,
            coordinator,
        })
    }

    pub fn config(&self) -> &UpdaterConfig {
        &self.config
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub fn progress(&self) -> watch::Receiver<f64> {
        self.downloads.progress()
    }

    /// Running version: configured, else read from the bundle's Info.plist.
    pub fn local_version(&self) -> Result<String, UpdateError> {
        self.config
            .current_version
            .clone()
            .or_else(|| platform::read_info_value(&self.config.bundle_path, "CFBundleShortVersionString"))
            .or_else(|| platform::read_info_value(&self.config.bundle_path, "CFBundleVersion"))
            .ok_or(UpdateError::Config(ConfigError::Missing("current_version")))
    }

    pub async fn check(&self) -> Result<Option<UpdateManifestEntry>, UpdateError> {
        let local = self.local_version()?;
        Ok(self.feed.check(&self.config.feed_url, &local).await?)
    }

    /// Download the full artifact for `entry`, verifying checksum and feed
    /// signature. A file that fails either is deleted.
    pub async fn download(&self, entry: &UpdateManifestEntry) -> Result<PathBuf, UpdateError> {
        let path = self
            .downloads
            .begin(entry.download_url.as_str(), entry.checksum.as_deref())
            .await?;
        self.verify_signature(path, entry.ed_signature.clone()).await
    }

    /// Continue an interrupted or cancelled download of `entry`.
    pub async fn resume(&self, token: ResumeToken, entry: &UpdateManifestEntry) -> Result<PathBuf, UpdateError> {
        let path = self.downloads.resume(token, entry.checksum.as_deref()).await?;
        self.verify_signature(path, entry.ed_signature.clone()).await
    }

    pub fn cancel(&self) -> Option<ResumeToken> {
        self.downloads.cancel()
    }

    async fn verify_signature(&self, path: PathBuf, signature: Option<String>) -> Result<PathBuf, UpdateError> {
        if !self.signatures.is_enabled() {
            if signature.is_some() {
                tracing::warn!("feed carries a signature but no public key is configured; skipping");
            }
            return Ok(path);
        }
        let key = self.config.ed_public_key.clone();
        let checked = path.clone();
        let result = tokio::task::spawn_blocking(move || {
            SignatureVerifier::from_config(key.as_deref())?.verify_file(&checked, signature.as_deref())
        })
        .await
        .map_err(|e| VerifyError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

        if let Err(e) = result {
            tracing::error!(path = %path.display(), error = %e, "feed signature rejected, discarding download");
            if let Err(rm) = tokio::fs::remove_file(&path).await {
                tracing::warn!(path = %path.display(), error = %rm, "could not remove rejected download");
            }
            return Err(e.into());
        }
        tracing::info!(path = %path.display(), "feed signature verified");
        Ok(path)
    }

    /// Fetch the patch published for the running version and rebuild the new
    /// bundle from it. `Ok(None)` when the feed has no matching patch.
    pub async fn download_delta(&self, entry: &UpdateManifestEntry) -> Result<Option<PathBuf>, UpdateError> {
        let local = self.local_version()?;
        let Some(delta) = entry.delta_for(&local) else {
            return Ok(None);
        };
        tracing::info!(from = %delta.from_version, to = %entry.version, "downloading delta patch");
        let patch = self.downloads.begin(&delta.url, delta.sha256.as_deref()).await?;

        let base = self.config.bundle_path.clone();
        let work_root = patch
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir)
            .join("rebuilt");
        let patch_path = patch.clone();
        let result = tokio::task::spawn_blocking(move || {
            discard_rebuilds(&work_root);
            let applied = delta::apply(&patch, &base, &work_root);
            if applied.is_err() {
                // Only succeeds when the failed apply left nothing behind.
                let _ = std::fs::remove_dir(&work_root);
            }
            applied
        })
        .await;

        if let Err(e) = tokio::fs::remove_file(&patch_path).await {
            tracing::warn!(path = %patch_path.display(), error = %e, "could not remove delta patch");
        }
        let rebuilt = result.map_err(|e| PatchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))??;
        Ok(Some(rebuilt))
    }

    /// Delta when one applies cleanly, else the full artifact.
    pub async fn prepare(&self, entry: &UpdateManifestEntry) -> Result<PreparedUpdate, UpdateError> {
        match self.download_delta(entry).await {
            Ok(Some(bundle)) => {
                return Ok(PreparedUpdate {
                    version: entry.version.clone(),
                    artifact: bundle,
                    kind: Some(ArtifactKind::Bundle),
                })
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "delta update failed, falling back to full download"),
        }
        Ok(PreparedUpdate {
            version: entry.version.clone(),
            artifact: self.download(entry).await?,
            kind: None,
        })
    }

    /// Verify and hand off to the helper. On success the host is terminated.
    pub fn install(&self, artifact: &Path, kind: Option<ArtifactKind>) -> Result<InstallReceipt, UpdateError> {
        Ok(self.coordinator.install(artifact, kind)?)
    }

    /// Check, fetch and install in one go. `Ok(None)` when already current.
    pub async fn update(&self) -> Result<Option<InstallReceipt>, UpdateError> {
        let Some(entry) = self.check().await? else {
            return Ok(None);
        };
        let prepared = self.prepare(&entry).await?;
        self.install(&prepared.artifact, prepared.kind).map(Some)
    }
}


/// Bundles rebuilt by earlier runs are only needed until the helper moves
/// them out; clear whatever is left before rebuilding again.
fn discard_rebuilds(work_root: &Path) {
    let Ok(entries) = std::fs::read_dir(work_root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Err(e) = fsutil::remove_path(&path) {
            tracing::warn!(path = %path.display(), error = %e, "could not remove stale rebuild");
        }
    }
}
