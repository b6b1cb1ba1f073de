//! Delta Codec
//!
//! File-granularity patches between two bundles. A patch is a gzipped tar
//! holding `manifest.json` and a `Payload/` tree of every added or changed
//! file; anything the target dropped is listed in the manifest's deletions.
//!
//! Round trip: `apply(build(base, target), base)` has the same file index as
//! `target`.

pub mod builder;
pub mod index;
pub mod manifest;
pub mod patcher;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use builder::{build, PatchSummary};
pub use index::BundleFileIndex;
pub use manifest::PatchManifest;
pub use patcher::apply;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const PAYLOAD_DIR: &str = "Payload";
/// Newest manifest format this build reads and writes.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("Patch contains no {MANIFEST_FILE}")]
    ManifestMissing,
    #[error("Unsupported patch format version {0}")]
    UnsupportedVersion(u32),
    #[error("Unsafe path in patch: {0}")]
    UnsafePath(String),
    #[error("Path listed as both deleted and patched: {0}")]
    Conflict(String),
    #[error("Base bundle does not match the patch (expected {expected}, found {actual})")]
    BaseMismatch { expected: String, actual: String },
    #[error("Patched bundle does not match the target (expected {expected}, found {actual})")]
    TargetMismatch { expected: String, actual: String },
}
