//! Content index of a bundle: relative path -> sha256.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::PatchError;
use crate::engine::fsutil;
use crate::engine::updater::verify;

/// Prefix for the "hash" of a symlink, which is its target rather than content.
const LINK_PREFIX: &str = "link:";

/// Every file and symlink under a bundle root keyed by its `/`-separated
/// relative path. Directories are implied by their contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleFileIndex {
    entries: BTreeMap<String, String>,
}

impl BundleFileIndex {
    pub fn compute(root: &Path) -> Result<Self, PatchError> {
        if !root.is_dir() {
            return Err(PatchError::NotADirectory(root.to_path_buf()));
        }
        let mut entries = BTreeMap::new();
        walk(root, root, &mut entries)?;
        Ok(Self { entries })
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, h)| (p.as_str(), h.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// sha256 over the sorted `(path, hash)` pairs; identifies a tree.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, hash) in &self.entries {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(hash.as_bytes());
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }
}

fn walk(root: &Path, dir: &Path, entries: &mut BTreeMap<String, String>) -> Result<(), PatchError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if fsutil::is_transient_metadata(&name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, entries)?;
            continue;
        }

        let hash = if file_type.is_symlink() {
            format!("{}{}", LINK_PREFIX, fs::read_link(&path)?.display())
        } else {
            verify::sha256_file(&path).map_err(|e| match e {
                verify::VerifyError::Io(io) => PatchError::Io(io),
                other => PatchError::Io(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
            })?
        };
        entries.insert(relative_key(root, &path), hash);
    }
    Ok(())
}

/// `/`-joined path of `path` below `root`.
pub fn relative_key(root: &Path, path: &Path) -> String {
    let rel: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_index_skips_metadata() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Contents/MacOS")).unwrap();
        fs::write(dir.path().join("Contents/MacOS/Demo"), "bin").unwrap();
        fs::write(dir.path().join(".DS_Store"), "junk").unwrap();
        fs::write(dir.path().join("Contents/._Info.plist"), "junk").unwrap();

        let index = BundleFileIndex::compute(dir.path()).unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.contains("Contents/MacOS/Demo"));
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        fs::write(a.path().join("f"), "one").unwrap();
        fs::write(b.path().join("f"), "one").unwrap();

        let ia = BundleFileIndex::compute(a.path()).unwrap();
        assert_eq!(ia.digest(), BundleFileIndex::compute(b.path()).unwrap().digest());

        fs::write(b.path().join("f"), "two").unwrap();
        assert_ne!(ia.digest(), BundleFileIndex::compute(b.path()).unwrap().digest());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_indexed_by_target() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("real"), "x").unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("alias")).unwrap();

        let index = BundleFileIndex::compute(dir.path()).unwrap();
        assert_eq!(index.get("alias"), Some("link:real"));
    }

    #[test]
    fn test_not_a_directory() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            BundleFileIndex::compute(&dir.path().join("missing")),
            Err(PatchError::NotADirectory(_))
        ));
    }
}
