//! bundleup Configuration Module
//! Handles loading and validating bundleup.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "bundleup.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Updater is not configured: missing {0}")]
    Missing(&'static str),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How package-kind artifacts are treated before handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PackagePolicy {
    /// Skip the pre-install identity check; the platform installer enforces its own.
    #[default]
    Delegate,
    /// Refuse package artifacts outright.
    Reject,
}

/// External signature-inspection tool and the token its output carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityToolConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub token_prefix: String,
}

impl Default for IdentityToolConfig {
    fn default() -> Self {
        Self {
            program: "codesign".to_string(),
            args: vec!["-dvv".to_string()],
            token_prefix: "TeamIdentifier=".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    #[serde(default)]
    pub feed_url: String,
    /// The running host bundle.
    pub bundle_path: PathBuf,
    #[serde(default)]
    pub bundle_id: Option<String>,
    #[serde(default)]
    pub current_version: Option<String>,
    #[serde(default)]
    pub helper_path: Option<PathBuf>,
    #[serde(default = "default_bundle_suffix")]
    pub bundle_suffix: String,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub parent_poll_interval_ms: u64,
    #[serde(default = "default_parent_timeout_secs")]
    pub parent_timeout_secs: u64,
    #[serde(default = "default_grace_ms")]
    pub termination_grace_ms: u64,
    #[serde(default)]
    pub package_policy: PackagePolicy,
    /// Base64 Ed25519 public key used to check feed signatures.
    #[serde(default)]
    pub ed_public_key: Option<String>,
    #[serde(default)]
    pub identity_tool: IdentityToolConfig,
}

fn default_bundle_suffix() -> String {
    ".app".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_parent_timeout_secs() -> u64 {
    30
}

fn default_grace_ms() -> u64 {
    500
}

impl UpdaterConfig {
    pub fn new(feed_url: impl Into<String>, bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            feed_url: feed_url.into(),
            bundle_path: bundle_path.into(),
            bundle_id: None,
            current_version: None,
            helper_path: None,
            bundle_suffix: default_bundle_suffix(),
            download_dir: None,
            parent_poll_interval_ms: default_poll_interval_ms(),
            parent_timeout_secs: default_parent_timeout_secs(),
            termination_grace_ms: default_grace_ms(),
            package_policy: PackagePolicy::default(),
            ed_public_key: None,
            identity_tool: IdentityToolConfig::default(),
        }
    }

    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        Self::load_file(&config_dir.join(CONFIG_FILE_NAME))
    }

    pub fn load_file(config_path: &Path) -> Result<Self, ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path.to_path_buf()));
        }
        let content = std::fs::read_to_string(config_path)?;
        let config: UpdaterConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Checks the fields every operation depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.feed_url.trim().is_empty() {
            return Err(ConfigError::Missing("feed_url"));
        }
        if self.bundle_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("bundle_path"));
        }
        if !self.bundle_suffix.starts_with('.') || self.bundle_suffix.len() < 2 {
            return Err(ConfigError::Invalid {
                field: "bundle_suffix",
                reason: format!("expected an extension like .app, got {:?}", self.bundle_suffix),
            });
        }
        if self.parent_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "parent_poll_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn parent_poll_interval(&self) -> Duration {
        Duration::from_millis(self.parent_poll_interval_ms)
    }

    pub fn parent_timeout(&self) -> Duration {
        Duration::from_secs(self.parent_timeout_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}
