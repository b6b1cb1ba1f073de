//! Process Control
//!
//! Parent-exit polling, relaunching the installed bundle and terminating the
//! host once the helper is confirmed running.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use crate::engine::platform;

/// How the wait for the parent ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited { waited: Duration },
    TimedOut { waited: Duration },
}

/// Poll `is_alive(pid)` every `interval` until it reports false or `timeout`
/// elapses. A timeout is logged and treated as permission to carry on.
pub fn wait_for_exit_with<F>(pid: u32, interval: Duration, timeout: Duration, mut is_alive: F) -> WaitOutcome
where
    F: FnMut(u32) -> bool,
{
    let start = Instant::now();
    loop {
        if !is_alive(pid) {
            let waited = start.elapsed();
            tracing::info!(pid, waited_ms = waited.as_millis() as u64, "parent process exited");
            return WaitOutcome::Exited { waited };
        }
        if start.elapsed() >= timeout {
            let waited = start.elapsed();
            tracing::warn!(pid, timeout_secs = timeout.as_secs_f64(), "parent still running after timeout, proceeding anyway");
            return WaitOutcome::TimedOut { waited };
        }
        std::thread::sleep(interval);
    }
}

/// [`wait_for_exit_with`] against the real process table.
pub fn wait_for_parent_exit(pid: u32, interval: Duration, timeout: Duration) -> WaitOutcome {
    wait_for_exit_with(pid, interval, timeout, platform::is_process_alive)
}

/// Starts programs that must outlive the caller.
pub trait Launcher: Send + Sync {
    /// Start `program` detached. Returns the child pid.
    fn launch_helper(&self, program: &Path, args: &[String], env: &[(String, String)]) -> io::Result<u32>;

    /// Open `bundle` as a new independent instance.
    fn relaunch(&self, bundle: &Path) -> io::Result<()>;
}

/// Spawns real processes in their own process group.
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn launch_helper(&self, program: &Path, args: &[String], env: &[(String, String)]) -> io::Result<u32> {
        let mut command = Command::new(program);
        command.args(args);
        for (key, value) in env {
            command.env(key, value);
        }
        let child = platform::spawn_detached(&mut command)?;
        tracing::info!(program = %program.display(), pid = child.id(), "helper launched");
        Ok(child.id())
    }

    fn relaunch(&self, bundle: &Path) -> io::Result<()> {
        let mut command = platform::open_bundle_command(bundle);
        let mut child = platform::spawn_detached(&mut command)?;
        tracing::info!(bundle = %bundle.display(), pid = child.id(), "bundle relaunched");
        // `open` returns immediately; reap it so it does not linger as a zombie.
        if platform::Platform::current().is_macos() {
            let status = child.wait()?;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("open exited with {:?}", status.code()),
                ));
            }
        }
        Ok(())
    }
}

/// Ends the host once the helper has taken over.
pub trait HostTerminator: Send + Sync {
    fn terminate(&self, grace: Duration);
}

/// Sleeps through the grace period and exits the current process.
pub struct ExitTerminator;

impl HostTerminator for ExitTerminator {
    fn terminate(&self, grace: Duration) {
        tracing::info!(grace_ms = grace.as_millis() as u64, "terminating host for update");
        std::thread::sleep(grace);
        std::process::exit(0);
    }
}

/// Where the helper binary lives: explicit path, next to the current
/// executable, inside the host bundle, then `PATH`.
pub fn locate_helper(explicit: Option<&Path>, host_bundle: &Path) -> Option<PathBuf> {
    const NAME: &str = if cfg!(windows) { "bundleup-helper.exe" } else { "bundleup-helper" };

    if let Some(path) = explicit {
        return path.is_file().then(|| path.to_path_buf());
    }

    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(NAME)));
    let candidates = [
        beside_exe,
        Some(host_bundle.join("Contents/MacOS").join(NAME)),
        Some(host_bundle.join("Contents/Helpers").join(NAME)),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|p| p.is_file())
        .or_else(|| which::which(NAME).ok())
}
