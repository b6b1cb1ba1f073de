use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use super::{PatchError, FORMAT_VERSION};

/// `manifest.json` at the root of a patch archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchManifest {
    pub version: u32,
    #[serde(default)]
    pub deletions: Vec<String>,
    /// Digest of the base file index the patch was built against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_digest: Option<String>,
    /// Digest of the file index `apply` must reproduce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_digest: Option<String>,
}

impl PatchManifest {
    pub fn new(deletions: Vec<String>) -> Self {
        Self {
            version: FORMAT_VERSION,
            deletions,
            base_digest: None,
            target_digest: None,
        }
    }

    pub fn from_json(content: &str) -> Result<Self, PatchError> {
        let manifest: PatchManifest = serde_json::from_str(content)?;
        if manifest.version == 0 || manifest.version > FORMAT_VERSION {
            return Err(PatchError::UnsupportedVersion(manifest.version));
        }
        for path in &manifest.deletions {
            safe_relative_path(path)?;
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String, PatchError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Resolve a manifest or payload path to a relative path that cannot escape
/// the bundle root.
pub fn safe_relative_path(path: &str) -> Result<PathBuf, PatchError> {
    let unsafe_path = || PatchError::UnsafePath(path.to_string());
    if path.is_empty() {
        return Err(unsafe_path());
    }
    let mut out = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(unsafe_path()),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(unsafe_path());
    }
    Ok(out)
}
