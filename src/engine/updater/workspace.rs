//! Process-private scratch space: temp directories and attached images.
//!
//! Everything registered here is released by [`Workspace::teardown`], which
//! also runs on drop so every exit path cleans up. Images are detached before
//! their directories are removed. Failures are logged, never returned.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::artifact::ImageMounter;
use crate::engine::fsutil;

pub struct Workspace {
    mounter: Arc<dyn ImageMounter>,
    temp_dirs: Vec<PathBuf>,
    mounts: Vec<PathBuf>,
}

impl Workspace {
    pub fn new(mounter: Arc<dyn ImageMounter>) -> Self {
        Self {
            mounter,
            temp_dirs: Vec::new(),
            mounts: Vec::new(),
        }
    }

    /// New private directory inside `parent`, or the system temp dir when
    /// `parent` is `None` or not writable.
    pub fn create_dir(&mut self, parent: Option<&Path>, prefix: &str) -> io::Result<PathBuf> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix(prefix);
            b
        };
        let dir = match parent.map(|p| builder.tempdir_in(p)) {
            Some(Ok(dir)) => dir,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "falling back to system temp dir");
                builder.tempdir()?
            }
            None => builder.tempdir()?,
        };
        let path = dir.keep();
        self.temp_dirs.push(path.clone());
        Ok(path)
    }

    /// Attach `image` at a fresh mount point and remember to detach it.
    pub fn mount(&mut self, image: &Path) -> Result<PathBuf, super::artifact::ArtifactError> {
        let mount_point = self.create_dir(None, "bundleup-mnt-")?;
        self.mounter.attach(image, &mount_point)?;
        self.mounts.push(mount_point.clone());
        Ok(mount_point)
    }

    /// Detach a single image early. Failures are logged.
    pub fn unmount(&mut self, mount_point: &Path) {
        if let Some(pos) = self.mounts.iter().position(|m| m == mount_point) {
            let mount = self.mounts.remove(pos);
            if let Err(e) = self.mounter.detach(&mount) {
                tracing::warn!(mount_point = %mount.display(), error = %e, "failed to detach image");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.temp_dirs.is_empty() && self.mounts.is_empty()
    }

    pub fn teardown(&mut self) {
        for mount in std::mem::take(&mut self.mounts) {
            if let Err(e) = self.mounter.detach(&mount) {
                tracing::warn!(mount_point = %mount.display(), error = %e, "failed to detach image");
            }
        }
        for dir in std::mem::take(&mut self.temp_dirs).into_iter().rev() {
            if let Err(e) = fsutil::remove_path(&dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to remove temp dir");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.teardown();
    }
}
