use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::index::{relative_key, BundleFileIndex};
use super::manifest::{safe_relative_path, PatchManifest};
use super::{PatchError, MANIFEST_FILE, PAYLOAD_DIR};
use crate::engine::fsutil;

/// Rebuild the target bundle from `patch` and `base`. The result is a fresh
/// copy under `work_root` carrying the base bundle's file name; `base` itself
/// is never modified.
pub fn apply(patch: &Path, base: &Path, work_root: &Path) -> Result<PathBuf, PatchError> {
    if !base.is_dir() {
        return Err(PatchError::NotADirectory(base.to_path_buf()));
    }
    fs::create_dir_all(work_root)?;

    let extracted = tempfile::Builder::new().prefix(".bundleup-patch-").tempdir_in(work_root)?;
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(patch)?));
    archive.set_preserve_permissions(true);
    archive.unpack(extracted.path())?;

    let patch_root = locate_patch_root(extracted.path())?;
    let manifest = PatchManifest::from_json(&fs::read_to_string(patch_root.join(MANIFEST_FILE))?)?;

    if let Some(expected) = &manifest.base_digest {
        let actual = BundleFileIndex::compute(base)?.digest();
        if &actual != expected {
            return Err(PatchError::BaseMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }

    let bundle_name = base.file_name().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("bundle"));
    let work_dir = work_root.join(uuid::Uuid::new_v4().to_string());
    let work = work_dir.join(bundle_name);

    let result = rebuild(&manifest, &patch_root.join(PAYLOAD_DIR), base, &work);
    match result {
        Ok(()) => {
            tracing::info!(patch = %patch.display(), bundle = %work.display(), "patch applied");
            Ok(work)
        }
        Err(e) => {
            if let Err(cleanup) = fsutil::remove_path(&work_dir) {
                tracing::warn!(dir = %work_dir.display(), error = %cleanup, "failed to remove patch work dir");
            }
            Err(e)
        }
    }
}

fn rebuild(manifest: &PatchManifest, payload_root: &Path, base: &Path, work: &Path) -> Result<(), PatchError> {
    fsutil::copy_tree(base, work)?;

    for rel in &manifest.deletions {
        let path = work.join(safe_relative_path(rel)?);
        if fsutil::path_exists(&path) {
            fsutil::remove_path(&path)?;
            prune_empty_parents(&path, work);
        }
    }

    if payload_root.is_dir() {
        overlay(payload_root, payload_root, work, manifest)?;
    }

    if let Some(expected) = &manifest.target_digest {
        let actual = BundleFileIndex::compute(work)?.digest();
        if &actual != expected {
            return Err(PatchError::TargetMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}

/// Copy every file and symlink under `dir` onto `work`, replacing whatever is
/// in the way.
fn overlay(payload_root: &Path, dir: &Path, work: &Path, manifest: &PatchManifest) -> Result<(), PatchError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let src = entry.path();
        if entry.file_type()?.is_dir() {
            overlay(payload_root, &src, work, manifest)?;
            continue;
        }

        let key = relative_key(payload_root, &src);
        if manifest.deletions.iter().any(|d| d == &key) {
            return Err(PatchError::Conflict(key));
        }
        let dest = work.join(safe_relative_path(&key)?);
        clear_path_for(&dest, work)?;
        fsutil::copy_tree(&src, &dest)?;
    }
    Ok(())
}

/// Make room for a file at `dest`: drop anything already there and any
/// non-directory ancestor standing where a directory is needed.
fn clear_path_for(dest: &Path, work: &Path) -> Result<(), PatchError> {
    let mut ancestors: Vec<&Path> = dest
        .ancestors()
        .skip(1)
        .take_while(|a| *a != work && a.starts_with(work))
        .collect();
    ancestors.reverse();
    for ancestor in ancestors {
        if fsutil::path_exists(ancestor) && !ancestor.is_dir() {
            fsutil::remove_path(ancestor)?;
        }
    }
    fsutil::remove_path(dest)?;
    Ok(())
}

fn prune_empty_parents(path: &Path, work: &Path) {
    for dir in path.ancestors().skip(1) {
        if dir == work || !dir.starts_with(work) {
            break;
        }
        // remove_dir only succeeds on empty directories
        if fs::remove_dir(dir).is_err() {
            break;
        }
    }
}

/// The manifest sits at the archive root or one directory down.
fn locate_patch_root(extracted: &Path) -> Result<PathBuf, PatchError> {
    if extracted.join(MANIFEST_FILE).is_file() {
        return Ok(extracted.to_path_buf());
    }
    for entry in fs::read_dir(extracted)? {
        let entry = entry?;
        if fsutil::is_transient_metadata(&entry.file_name().to_string_lossy()) {
            continue;
        }
        let candidate = entry.path();
        if candidate.is_dir() && candidate.join(MANIFEST_FILE).is_file() {
            return Ok(candidate);
        }
    }
    Err(PatchError::ManifestMissing)
}
