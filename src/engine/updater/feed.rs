//! Feed Client
//!
//! Fetches the remote feed document and decides whether it describes a newer
//! version than the one running.

use reqwest::header::ACCEPT;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::version;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Invalid feed URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Feed request failed with HTTP {0}")]
    Status(u16),
    #[error("Malformed feed: {0}")]
    Malformed(String),
}

/// Wire format of the feed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedDocument {
    pub version: String,
    #[serde(default)]
    pub release_notes: String,
    pub downloads: FeedDownloads,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedDownloads {
    pub full: FullDownload,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deltas: Vec<DeltaDownload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullDownload {
    pub url: String,
    #[serde(default, alias = "checksum", skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ed_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A patch that upgrades one specific older version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeltaDownload {
    pub from_version: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// A newer release the running bundle can move to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateManifestEntry {
    pub version: String,
    pub release_notes: String,
    pub download_url: Url,
    pub checksum: Option<String>,
    pub ed_signature: Option<String>,
    pub deltas: Vec<DeltaDownload>,
}

impl UpdateManifestEntry {
    /// The patch published for `local_version`, if any.
    pub fn delta_for(&self, local_version: &str) -> Option<&DeltaDownload> {
        self.deltas
            .iter()
            .find(|d| version::compare(&d.from_version, local_version).is_eq())
    }
}

impl FeedDocument {
    pub fn parse(body: &str) -> Result<Self, FeedError> {
        serde_json::from_str(body).map_err(|e| FeedError::Malformed(e.to_string()))
    }

    /// Resolve against the running version; `None` unless the feed is newer.
    pub fn evaluate(self, local_version: &str) -> Result<Option<UpdateManifestEntry>, FeedError> {
        if self.version.trim().is_empty() {
            return Err(FeedError::Malformed("empty version".to_string()));
        }
        if !version::is_newer(&self.version, local_version) {
            tracing::info!(remote = %self.version, local = %local_version, "no newer version in feed");
            return Ok(None);
        }

        let download_url = Url::parse(&self.downloads.full.url)
            .map_err(|e| FeedError::Malformed(format!("downloads.full.url: {}", e)))?;

        tracing::info!(remote = %self.version, local = %local_version, "update available");
        Ok(Some(UpdateManifestEntry {
            version: self.version,
            release_notes: self.release_notes,
            download_url,
            checksum: self.downloads.full.sha256,
            ed_signature: self.downloads.full.ed_signature,
            deltas: self.downloads.deltas,
        }))
    }
}

pub struct FeedClient {
    http_client: reqwest::Client,
}

impl FeedClient {
    pub fn new() -> Self {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("bundleup/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { http_client }
    }

    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }

    /// Fetch the feed and compare it with `local_version`. No retries.
    pub async fn check(
        &self,
        feed_url: &str,
        local_version: &str,
    ) -> Result<Option<UpdateManifestEntry>, FeedError> {
        let url = Url::parse(feed_url).map_err(|e| FeedError::InvalidUrl {
            url: feed_url.to_string(),
            reason: e.to_string(),
        })?;

        tracing::debug!(%url, "checking feed");
        let response = self
            .http_client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FeedError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        FeedDocument::parse(&body)?.evaluate(local_version)
    }
}

impl Default for FeedClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(version: &str) -> String {
        format!(
            r#"{{
                "version": "{}",
                "release_notes": "Bug fixes",
                "downloads": {{
                    "full": {{ "url": "https://example.com/Demo.zip", "sha256": "abc" }},
                    "deltas": [ {{ "from_version": "1.5", "url": "https://example.com/1.5.delta" }} ]
                }}
            }}"#,
            version
        )
    }

    #[test]
    fn test_newer_feed_yields_entry() {
        let entry = FeedDocument::parse(&feed("2.0.0")).unwrap().evaluate("1.5.0").unwrap().unwrap();
        assert_eq!(entry.version, "2.0.0");
        assert_eq!(entry.checksum.as_deref(), Some("abc"));
        assert_eq!(entry.download_url.as_str(), "https://example.com/Demo.zip");
    }

    #[test]
    fn test_older_or_equal_feed_yields_none() {
        assert!(FeedDocument::parse(&feed("1.0.0")).unwrap().evaluate("1.5.0").unwrap().is_none());
        assert!(FeedDocument::parse(&feed("1.5.0")).unwrap().evaluate("1.5").unwrap().is_none());
    }

    #[test]
    fn test_delta_lookup_uses_numeric_compare() {
        let entry = FeedDocument::parse(&feed("2.0.0")).unwrap().evaluate("1.5.0").unwrap().unwrap();
        assert!(entry.delta_for("1.5.0").is_some());
        assert!(entry.delta_for("1.4").is_none());
    }

    #[test]
    fn test_malformed_feed() {
        assert!(matches!(FeedDocument::parse("{\"version\": 3}"), Err(FeedError::Malformed(_))));
        let bad_url = feed("2.0").replace("https://example.com/Demo.zip", "not a url");
        assert!(matches!(
            FeedDocument::parse(&bad_url).unwrap().evaluate("1.0"),
            Err(FeedError::Malformed(_))
        ));
    }
}
