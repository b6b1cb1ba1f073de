use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use super::index::BundleFileIndex;
use super::manifest::PatchManifest;
use super::{PatchError, MANIFEST_FILE, PAYLOAD_DIR};
use crate::engine::fsutil;

/// What `build` wrote.
#[derive(Debug, Clone)]
pub struct PatchSummary {
    pub patch_path: PathBuf,
    pub manifest: PatchManifest,
    /// Relative paths shipped in `Payload/`.
    pub payload: Vec<String>,
    pub payload_bytes: u64,
}

/// Diff `base` against `target` and write the patch archive to `out`.
pub fn build(base: &Path, target: &Path, out: &Path) -> Result<PatchSummary, PatchError> {
    let base_index = BundleFileIndex::compute(base)?;
    let target_index = BundleFileIndex::compute(target)?;

    let deletions: Vec<String> = base_index
        .iter()
        .filter(|(path, _)| !target_index.contains(path))
        .map(|(path, _)| path.to_string())
        .collect();
    let payload: Vec<String> = target_index
        .iter()
        .filter(|(path, hash)| base_index.get(path) != Some(*hash))
        .map(|(path, _)| path.to_string())
        .collect();

    let mut manifest = PatchManifest::new(deletions);
    manifest.base_digest = Some(base_index.digest());
    manifest.target_digest = Some(target_index.digest());

    let scratch = tempfile::Builder::new().prefix("bundleup-delta-").tempdir()?;
    let payload_root = scratch.path().join(PAYLOAD_DIR);
    fs::create_dir_all(&payload_root)?;
    let mut payload_bytes = 0u64;
    for rel in &payload {
        payload_bytes += fsutil::copy_tree(&target.join(rel), &payload_root.join(rel))?;
    }
    fs::write(scratch.path().join(MANIFEST_FILE), manifest.to_json()?)?;

    if let Some(parent) = out.parent() {
        fs::create_dir_all(parent)?;
    }
    let encoder = GzEncoder::new(File::create(out)?, Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive.follow_symlinks(false);
    archive.append_path_with_name(scratch.path().join(MANIFEST_FILE), MANIFEST_FILE)?;
    archive.append_dir_all(PAYLOAD_DIR, &payload_root)?;
    archive.into_inner()?.finish()?;

    tracing::info!(
        base = %base.display(),
        target = %target.display(),
        patch = %out.display(),
        deletions = manifest.deletions.len(),
        payload = payload.len(),
        payload_bytes,
        "patch built"
    );
    Ok(PatchSummary {
        patch_path: out.to_path_buf(),
        manifest,
        payload,
        payload_bytes,
    })
}
