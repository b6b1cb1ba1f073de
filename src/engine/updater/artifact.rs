//! Update artifacts: classification, disk-image mounting, archive extraction
//! and locating the single bundle inside.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use thiserror::Error;

use crate::engine::fsutil;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Cannot determine artifact kind of {0}")]
    UnknownKind(PathBuf),
    #[error("No {suffix} bundle found in {dir}")]
    NoBundleFound { dir: PathBuf, suffix: String },
    #[error("Found {count} {suffix} bundles in {dir}, expected exactly one")]
    MultipleBundles { dir: PathBuf, suffix: String, count: usize },
    #[error("Failed to mount {image}: {reason}")]
    MountFailed { image: PathBuf, reason: String },
    #[error("Failed to unmount {0}")]
    UnmountFailed(PathBuf),
    #[error("Failed to extract {archive}: {reason}")]
    ExtractFailed { archive: PathBuf, reason: String },
    #[error("Disk images are not supported on this platform")]
    Unsupported,
}

/// The four shapes an update can arrive in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Image,
    Archive,
    Package,
    Bundle,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Image => "image",
            ArtifactKind::Archive => "archive",
            ArtifactKind::Package => "package",
            ArtifactKind::Bundle => "bundle",
        }
    }

    /// Classify by file extension.
    pub fn classify(path: &Path, bundle_suffix: &str) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        let name = name.trim_end_matches('/');
        if name.ends_with(".dmg") {
            Some(ArtifactKind::Image)
        } else if ArchiveFormat::detect(Path::new(name)).is_some() {
            Some(ArtifactKind::Archive)
        } else if name.ends_with(".pkg") || name.ends_with(".mpkg") {
            Some(ArtifactKind::Package)
        } else if name.ends_with(&bundle_suffix.to_lowercase()) {
            Some(ArtifactKind::Bundle)
        } else {
            None
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "image" | "dmg" => Ok(ArtifactKind::Image),
            "archive" | "zip" => Ok(ArtifactKind::Archive),
            "package" | "pkg" => Ok(ArtifactKind::Package),
            "bundle" | "app" => Ok(ArtifactKind::Bundle),
            other => Err(format!("unknown artifact kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    Tar,
}

impl ArchiveFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

/// Extract an archive into `dest` keeping permissions.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<(), ArtifactError> {
    let format = ArchiveFormat::detect(archive).ok_or_else(|| ArtifactError::UnknownKind(archive.to_path_buf()))?;
    let failed = |reason: String| ArtifactError::ExtractFailed {
        archive: archive.to_path_buf(),
        reason,
    };

    fs::create_dir_all(dest)?;
    let file = File::open(archive)?;
    match format {
        ArchiveFormat::Zip => {
            let mut zip = zip::ZipArchive::new(file).map_err(|e| failed(e.to_string()))?;
            zip.extract(dest).map_err(|e| failed(e.to_string()))?;
        }
        ArchiveFormat::TarGz => {
            let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
            tar.set_preserve_permissions(true);
            tar.unpack(dest).map_err(|e| failed(e.to_string()))?;
        }
        ArchiveFormat::Tar => {
            let mut tar = tar::Archive::new(file);
            tar.set_preserve_permissions(true);
            tar.unpack(dest).map_err(|e| failed(e.to_string()))?;
        }
    }
    tracing::debug!(archive = %archive.display(), dest = %dest.display(), "archive extracted");
    Ok(())
}

/// Find the one bundle directly inside `dir`. Zero or several is an error.
pub fn locate_bundle(dir: &Path, bundle_suffix: &str) -> Result<PathBuf, ArtifactError> {
    let suffix = bundle_suffix.to_lowercase();
    let mut matches: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            !fsutil::is_transient_metadata(&name) && name.to_lowercase().ends_with(&suffix)
        })
        .map(|entry| entry.path())
        .collect();
    matches.sort();

    match matches.len() {
        0 => Err(ArtifactError::NoBundleFound {
            dir: dir.to_path_buf(),
            suffix: bundle_suffix.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        count => Err(ArtifactError::MultipleBundles {
            dir: dir.to_path_buf(),
            suffix: bundle_suffix.to_string(),
            count,
        }),
    }
}

/// Attaches and detaches disk images.
pub trait ImageMounter: Send + Sync {
    fn attach(&self, image: &Path, mount_point: &Path) -> Result<(), ArtifactError>;
    fn detach(&self, mount_point: &Path) -> Result<(), ArtifactError>;
}

/// `hdiutil`, read-only and hidden from Finder.
pub struct Hdiutil;

impl ImageMounter for Hdiutil {
    fn attach(&self, image: &Path, mount_point: &Path) -> Result<(), ArtifactError> {
        if !cfg!(target_os = "macos") {
            return Err(ArtifactError::Unsupported);
        }
        let output = Command::new("hdiutil")
            .args(["attach", "-readonly", "-nobrowse", "-noautoopen", "-noverify", "-mountpoint"])
            .arg(mount_point)
            .arg(image)
            .output()?;
        if !output.status.success() {
            return Err(ArtifactError::MountFailed {
                image: image.to_path_buf(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        tracing::info!(image = %image.display(), mount_point = %mount_point.display(), "disk image attached");
        Ok(())
    }

    fn detach(&self, mount_point: &Path) -> Result<(), ArtifactError> {
        let status = Command::new("hdiutil")
            .args(["detach", "-force"])
            .arg(mount_point)
            .status()?;
        if !status.success() {
            return Err(ArtifactError::UnmountFailed(mount_point.to_path_buf()));
        }
        tracing::debug!(mount_point = %mount_point.display(), "disk image detached");
        Ok(())
    }
}
