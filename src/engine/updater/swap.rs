//! Atomic Swap
//!
//! Replaces the destination bundle with a staged one through a backup
//! sibling. A failed direct swap is retried once through a privileged
//! channel; if that fails too the backup is put back.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::fsutil;

pub const BACKUP_SUFFIX: &str = ".bak";

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("Failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Staged bundle missing: {0}")]
    StagedMissing(PathBuf),
    #[error("Privileged swap failed: {0}")]
    Privileged(String),
    #[error("Swap failed (direct: {direct}; privileged: {privileged}); previous bundle restored: {restored}")]
    Unrecoverable {
        direct: String,
        privileged: String,
        restored: bool,
    },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> SwapError + 'a {
    move |source| SwapError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// The three paths a swap touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPlan {
    pub staged: PathBuf,
    pub dest: PathBuf,
    pub backup: PathBuf,
}

impl SwapPlan {
    pub fn new(staged: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        let dest = dest.into();
        Self {
            staged: staged.into(),
            backup: backup_path(&dest),
            dest,
        }
    }
}

/// `<dest>.bak`
pub fn backup_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Runs the rename sequence: drop a stale backup, move the destination to the
/// backup, move the staged bundle into place, drop the backup.
pub trait SwapExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn execute(&self, plan: &SwapPlan) -> Result<(), SwapError>;
}

/// Plain renames as the current user.
pub struct DirectExecutor;

impl SwapExecutor for DirectExecutor {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn execute(&self, plan: &SwapPlan) -> Result<(), SwapError> {
        fsutil::remove_path(&plan.backup).map_err(io_err("remove stale backup", &plan.backup))?;
        if fsutil::path_exists(&plan.dest) {
            std::fs::rename(&plan.dest, &plan.backup).map_err(io_err("move aside", &plan.dest))?;
        }
        std::fs::rename(&plan.staged, &plan.dest).map_err(io_err("move into place", &plan.dest))?;
        if let Err(e) = fsutil::remove_path(&plan.backup) {
            tracing::warn!(backup = %plan.backup.display(), error = %e, "could not remove backup after swap");
        }
        Ok(())
    }
}

/// The same sequence as a shell script run with elevated rights. May prompt.
pub struct PrivilegedExecutor;

impl PrivilegedExecutor {
    pub fn script(plan: &SwapPlan) -> String {
        let staged = shell_quote(&plan.staged);
        let dest = shell_quote(&plan.dest);
        let backup = shell_quote(&plan.backup);
        format!(
            "rm -rf {backup} && {{ [ ! -e {dest} ] || mv {dest} {backup}; }} && mv {staged} {dest} && rm -rf {backup}"
        )
    }
}

impl SwapExecutor for PrivilegedExecutor {
    fn name(&self) -> &'static str {
        "privileged"
    }

    fn execute(&self, plan: &SwapPlan) -> Result<(), SwapError> {
        if !cfg!(unix) {
            return Err(SwapError::Privileged("no privileged channel on this platform".to_string()));
        }
        let status = runas::Command::new("/bin/sh")
            .arg("-c")
            .arg(Self::script(plan))
            .gui(true)
            .status()
            .map_err(|e| SwapError::Privileged(e.to_string()))?;
        if !status.success() {
            return Err(SwapError::Privileged(format!("exited with {:?}", status.code())));
        }
        Ok(())
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

/// What a completed swap did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapReport {
    pub executor: &'static str,
}

pub struct AtomicSwap {
    direct: Box<dyn SwapExecutor>,
    privileged: Box<dyn SwapExecutor>,
}

impl AtomicSwap {
    pub fn new(direct: Box<dyn SwapExecutor>, privileged: Box<dyn SwapExecutor>) -> Self {
        Self { direct, privileged }
    }

    pub fn system() -> Self {
        Self::new(Box::new(DirectExecutor), Box::new(PrivilegedExecutor))
    }

    /// Swap `plan.staged` into `plan.dest`. The destination is never left
    /// absent while a backup that could restore it exists.
    pub fn swap(&self, plan: &SwapPlan) -> Result<SwapReport, SwapError> {
        resolve_interrupted(plan)?;
        if !fsutil::path_exists(&plan.staged) {
            return Err(SwapError::StagedMissing(plan.staged.clone()));
        }

        let direct_err = match self.direct.execute(plan) {
            Ok(()) => return Ok(self.finish(self.direct.name(), plan)),
            Err(e) => e,
        };
        tracing::warn!(error = %direct_err, "direct swap failed, retrying with privileges");

        // A half-done direct attempt has moved the original aside; put it
        // back so the retry's stale-backup removal cannot destroy it.
        restore_backup(plan);
        if !fsutil::path_exists(&plan.staged) {
            return Err(SwapError::Unrecoverable {
                direct: direct_err.to_string(),
                privileged: "staged bundle lost".to_string(),
                restored: fsutil::path_exists(&plan.dest),
            });
        }

        match self.privileged.execute(plan) {
            Ok(()) => Ok(self.finish(self.privileged.name(), plan)),
            Err(privileged_err) => {
                let restored = restore_backup(plan);
                tracing::error!(direct = %direct_err, privileged = %privileged_err, restored, "swap failed");
                Err(SwapError::Unrecoverable {
                    direct: direct_err.to_string(),
                    privileged: privileged_err.to_string(),
                    restored,
                })
            }
        }
    }

    fn finish(&self, executor: &'static str, plan: &SwapPlan) -> SwapReport {
        tracing::info!(executor, dest = %plan.dest.display(), "bundle swapped into place");
        SwapReport { executor }
    }
}

/// Deal with a backup left by an earlier interrupted swap: restore it when the
/// destination is gone, discard it when the destination is present.
pub fn resolve_interrupted(plan: &SwapPlan) -> Result<(), SwapError> {
    if !fsutil::path_exists(&plan.backup) {
        return Ok(());
    }
    if fsutil::path_exists(&plan.dest) {
        tracing::warn!(backup = %plan.backup.display(), "discarding stale backup");
        fsutil::remove_path(&plan.backup).map_err(io_err("remove stale backup", &plan.backup))
    } else {
        tracing::warn!(backup = %plan.backup.display(), "restoring backup from interrupted swap");
        std::fs::rename(&plan.backup, &plan.dest).map_err(io_err("restore backup", &plan.backup))
    }
}

/// Move the backup back when the destination is missing. Returns whether the
/// destination exists afterwards.
fn restore_backup(plan: &SwapPlan) -> bool {
    if fsutil::path_exists(&plan.dest) {
        return true;
    }
    if !fsutil::path_exists(&plan.backup) {
        return false;
    }
    match std::fs::rename(&plan.backup, &plan.dest) {
        Ok(()) => {
            tracing::info!(dest = %plan.dest.display(), "previous bundle restored from backup");
            true
        }
        Err(e) => {
            tracing::error!(backup = %plan.backup.display(), error = %e, "could not restore backup");
            false
        }
    }
}
