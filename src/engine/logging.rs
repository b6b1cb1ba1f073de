//! Log setup shared by both binaries.
//!
//! Lines are appended to a fixed file so a relaunched instance can read what
//! the helper did. The file is diagnostic only.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use super::platform::Platform;

pub const LOG_FILE_NAME: &str = "bundleup.log";

/// Default log file location for the current platform.
pub fn default_log_path() -> Option<PathBuf> {
    Platform::current().log_dir().map(|dir| dir.join(LOG_FILE_NAME))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Falls back to stderr when the file cannot
/// be opened. Returns the file actually used.
pub fn init(log_path: Option<&Path>) -> Option<PathBuf> {
    let opened = log_path.and_then(|path| {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok()?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).ok()?;
        Some((path.to_path_buf(), file))
    });

    match opened {
        Some((path, file)) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file))
                .try_init();
            Some(path)
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}
