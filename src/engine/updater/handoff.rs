//! Handoff Descriptor
//!
//! The filesystem message the host leaves for the helper: what to install,
//! where, and which process to wait for. Written atomically, read once,
//! deleted by the reader.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::artifact::ArtifactKind;

/// File name of the descriptor in every well-known location.
pub const DESCRIPTOR_FILE_NAME: &str = "bundleup-handoff.json";
/// Subdirectory of a shared temp dir the coordinator writes into.
pub const SHARED_SUBDIR: &str = "bundleup";

/// Explicit descriptor path handed to the helper.
pub const ENV_DESCRIPTOR: &str = "BUNDLEUP_HANDOFF";
pub const ENV_DEST: &str = "BUNDLEUP_DEST";
pub const ENV_PID: &str = "BUNDLEUP_PID";
pub const ENV_ARTIFACT: &str = "BUNDLEUP_ARTIFACT";
pub const ENV_MODE: &str = "BUNDLEUP_MODE";
pub const ENV_HOST_BUNDLE_ID: &str = "BUNDLEUP_HOST_BUNDLE_ID";

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize descriptor: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("No complete handoff descriptor found")]
    NotFound,
    #[error("No location to write the handoff descriptor")]
    NoLocation,
}

impl HandoffError {
    fn io(path: &Path, source: io::Error) -> Self {
        HandoffError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandoffDescriptor {
    pub artifact: PathBuf,
    pub dest: PathBuf,
    pub pid: u32,
    pub mode: ArtifactKind,
    #[serde(default)]
    pub host_bundle_id: String,
}

impl HandoffDescriptor {
    /// Write via a sibling temp file and rename so readers never see a torn file.
    pub fn write_atomic(&self, path: &Path) -> Result<(), HandoffError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| HandoffError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension(format!("{}.tmp", std::process::id()));
        fs::write(&temp_path, content).map_err(|e| HandoffError::io(&temp_path, e))?;
        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(HandoffError::io(path, e));
        }
        tracing::debug!(path = %path.display(), "handoff descriptor written");
        Ok(())
    }

    /// Flat `-flag value` arguments carrying the same fields, used as the
    /// last-resort discovery source.
    pub fn to_flags(&self) -> Vec<String> {
        vec![
            "-dest".to_string(),
            self.dest.display().to_string(),
            "-pid".to_string(),
            self.pid.to_string(),
            "-artifact".to_string(),
            self.artifact.display().to_string(),
            "-mode".to_string(),
            self.mode.to_string(),
        ]
    }
}

/// Whatever a single discovery source could recover. Every field is optional
/// so a half-written source is detected rather than rejected by the parser.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PartialDescriptor {
    #[serde(default)]
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub dest: Option<PathBuf>,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub host_bundle_id: Option<String>,
}

impl PartialDescriptor {
    /// Complete only with a destination, a positive pid and an artifact. A
    /// missing or unknown mode is inferred from the artifact's extension.
    pub fn complete(self, bundle_suffix: &str) -> Option<HandoffDescriptor> {
        let dest = self.dest.filter(|p| !p.as_os_str().is_empty())?;
        let artifact = self.artifact.filter(|p| !p.as_os_str().is_empty())?;
        let pid = self.pid.filter(|p| *p > 0).and_then(|p| u32::try_from(p).ok())?;

        let mode = self
            .mode
            .and_then(|m| m.parse::<ArtifactKind>().ok())
            .or_else(|| ArtifactKind::classify(&artifact, bundle_suffix))
            .unwrap_or(if artifact.is_dir() {
                ArtifactKind::Bundle
            } else {
                ArtifactKind::Image
            });

        Some(HandoffDescriptor {
            artifact,
            dest,
            pid,
            mode,
            host_bundle_id: self.host_bundle_id.unwrap_or_default(),
        })
    }
}

/// Read the descriptor at `path` and delete it. `Ok(None)` when nothing is
/// there. The file is removed even if it does not parse so a corrupt leftover
/// cannot shadow later handoffs.
pub fn read_and_consume(path: &Path) -> Result<Option<PartialDescriptor>, HandoffError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(HandoffError::io(path, e)),
    };

    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "could not delete consumed descriptor");
    }

    match serde_json::from_str::<PartialDescriptor>(&content) {
        Ok(partial) => {
            tracing::info!(path = %path.display(), "handoff descriptor consumed");
            Ok(Some(partial))
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "discarding unreadable descriptor");
            Ok(None)
        }
    }
}

/// Descriptor path inside a host's private storage directory.
pub fn private_descriptor_path(storage_dir: &Path) -> PathBuf {
    storage_dir.join(DESCRIPTOR_FILE_NAME)
}

/// Descriptor path inside a shared temp directory.
pub fn shared_descriptor_path(temp_dir: &Path) -> PathBuf {
    temp_dir.join(SHARED_SUBDIR).join(DESCRIPTOR_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> HandoffDescriptor {
        HandoffDescriptor {
            artifact: PathBuf::from("/tmp/Demo-2.0.dmg"),
            dest: PathBuf::from("/Applications/Demo.app"),
            pid: 4242,
            mode: ArtifactKind::Image,
            host_bundle_id: "com.example.demo".to_string(),
        }
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["hostBundleId"], "com.example.demo");
        assert_eq!(json["mode"], "image");
        assert_eq!(json["pid"], 4242);
    }

    #[test]
    fn test_read_consumes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DESCRIPTOR_FILE_NAME);
        sample().write_atomic(&path).unwrap();

        let read = read_and_consume(&path).unwrap().unwrap();
        assert_eq!(read.complete(".app"), Some(sample()));
        assert!(!path.exists());
        assert!(read_and_consume(&path).unwrap().is_none());
    }

    #[test]
    fn test_incomplete_descriptors() {
        let base = PartialDescriptor {
            artifact: Some(PathBuf::from("/tmp/a.zip")),
            dest: Some(PathBuf::from("/Applications/Demo.app")),
            pid: Some(10),
            ..Default::default()
        };
        assert_eq!(base.clone().complete(".app").unwrap().mode, ArtifactKind::Archive);

        assert!(PartialDescriptor { pid: Some(0), ..base.clone() }.complete(".app").is_none());
        assert!(PartialDescriptor { pid: Some(-3), ..base.clone() }.complete(".app").is_none());
        assert!(PartialDescriptor { dest: None, ..base.clone() }.complete(".app").is_none());
        assert!(PartialDescriptor { artifact: None, ..base }.complete(".app").is_none());
    }

    #[test]
    fn test_corrupt_file_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DESCRIPTOR_FILE_NAME);
        fs::write(&path, "{not json").unwrap();
        assert!(read_and_consume(&path).unwrap().is_none());
        assert!(!path.exists());
    }
}
