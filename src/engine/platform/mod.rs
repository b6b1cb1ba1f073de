//! Platform Detection and Support Module
//!
//! Well-known directories, process liveness, detached launches and bundle
//! metadata for macOS, Linux and Windows.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

/// Supported platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
    Unknown,
}

impl Platform {
    /// Detect current platform
    pub fn current() -> Self {
        #[cfg(target_os = "macos")]
        return Platform::MacOS;

        #[cfg(target_os = "linux")]
        return Platform::Linux;

        #[cfg(target_os = "windows")]
        return Platform::Windows;

        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        return Platform::Unknown;
    }

    pub fn is_macos(&self) -> bool {
        matches!(self, Platform::MacOS)
    }

    /// Private per-app storage for a bundle identifier.
    ///
    /// macOS: ~/Library/Application Support/<id>
    /// Linux: ~/.local/share/<id>
    /// Windows: %APPDATA%\<id>
    pub fn app_storage_dir(&self, bundle_id: &str) -> Option<PathBuf> {
        match self {
            Platform::Unknown => None,
            _ => dirs::data_dir().map(|d| d.join(bundle_id)),
        }
    }

    /// Get platform-specific log directory
    pub fn log_dir(&self) -> Option<PathBuf> {
        match self {
            Platform::MacOS => dirs::home_dir().map(|d| d.join("Library/Logs/bundleup")),
            Platform::Linux => dirs::data_dir().map(|d| d.join("bundleup/logs")),
            Platform::Windows => dirs::data_local_dir().map(|d| d.join("bundleup/logs")),
            Platform::Unknown => None,
        }
    }

    /// Per-user cache directory for downloaded artifacts.
    pub fn download_dir(&self) -> PathBuf {
        dirs::cache_dir()
            .map(|d| d.join("bundleup").join("downloads"))
            .unwrap_or_else(|| std::env::temp_dir().join("bundleup-downloads"))
    }
}

/// Shared temporary locations the helper searches for a handoff descriptor,
/// most specific first.
pub fn shared_temp_dirs() -> Vec<PathBuf> {
    let mut dirs = vec![std::env::temp_dir()];
    #[cfg(unix)]
    {
        let tmp = PathBuf::from("/tmp");
        if !dirs.contains(&tmp) {
            dirs.push(tmp);
        }
    }
    dirs
}

/// Check whether a process id is still running.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    #[cfg(windows)]
    {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        false
    }
}

/// Spawn a process that keeps running after its parent exits.
pub fn spawn_detached(command: &mut Command) -> io::Result<Child> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command.spawn()
}

/// Build the command that opens a bundle as a new, independent instance.
pub fn open_bundle_command(bundle: &Path) -> Command {
    if Platform::current().is_macos() {
        let mut command = Command::new("open");
        command.arg("-n").arg(bundle);
        return command;
    }
    Command::new(bundle_executable(bundle))
}

/// Locate the executable inside a bundle directory. Plain files are their own
/// executable.
pub fn bundle_executable(bundle: &Path) -> PathBuf {
    if !bundle.is_dir() {
        return bundle.to_path_buf();
    }
    let stem = bundle
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let declared = read_info_value(bundle, "CFBundleExecutable");
    let candidates = [
        declared.map(|name| bundle.join("Contents/MacOS").join(name)),
        Some(bundle.join("Contents/MacOS").join(&stem)),
        Some(bundle.join("AppRun")),
        Some(bundle.join(&stem)),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|p| p.is_file())
        .unwrap_or_else(|| bundle.join(stem))
}

/// Read a string value from a bundle's XML `Contents/Info.plist`.
/// Binary plists are skipped with a debug log.
pub fn read_info_value(bundle: &Path, key: &str) -> Option<String> {
    let path = bundle.join("Contents/Info.plist");
    let bytes = fs::read(&path).ok()?;
    if bytes.starts_with(b"bplist") {
        tracing::debug!(path = %path.display(), key, "binary Info.plist not supported, skipping");
        return None;
    }
    let content = match String::from_utf8(bytes) {
        Ok(content) if content.contains("<plist") => content,
        _ => {
            tracing::debug!(path = %path.display(), key, "Info.plist is not an XML plist, skipping");
            return None;
        }
    };
    plist_string_value(&content, key)
}

fn plist_string_value(content: &str, key: &str) -> Option<String> {
    let marker = format!("<key>{}</key>", key);
    let rest = &content[content.find(&marker)? + marker.len()..];
    let rest = rest.trim_start();
    let value = rest.strip_prefix("<string>")?;
    let end = value.find("</string>")?;
    let value = value[..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
