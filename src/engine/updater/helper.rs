//! Helper Process
//!
//! Runs outside the host: discovers the handoff, waits for the host to exit,
//! stages the new bundle, verifies and swaps it into place, then relaunches.
//! Scratch space is released on every path before the outcome is returned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::artifact::{self, ArtifactKind, Hdiutil, ImageMounter};
use super::authenticity::{AuthError, AuthenticityVerifier};
use super::discovery::{self, DiscoveryContext};
use super::handoff::HandoffDescriptor;
use super::process::{self, Launcher, SystemLauncher};
use super::state::{HelperError, HelperOutcome, HelperState, StateTracker};
use super::swap::{AtomicSwap, SwapPlan};
use super::workspace::Workspace;
use crate::engine::config::{IdentityToolConfig, PackagePolicy, UpdaterConfig};
use crate::engine::fsutil;

pub const ENV_BUNDLE_SUFFIX: &str = "BUNDLEUP_BUNDLE_SUFFIX";
pub const ENV_POLL_INTERVAL_MS: &str = "BUNDLEUP_POLL_INTERVAL_MS";
pub const ENV_PARENT_TIMEOUT_SECS: &str = "BUNDLEUP_PARENT_TIMEOUT_SECS";
pub const ENV_PACKAGE_POLICY: &str = "BUNDLEUP_PACKAGE_POLICY";
/// JSON-encoded [`IdentityToolConfig`].
pub const ENV_IDENTITY_TOOL: &str = "BUNDLEUP_IDENTITY_TOOL";

/// Tunables the host passes down through the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct HelperSettings {
    pub bundle_suffix: String,
    pub poll_interval: Duration,
    pub parent_timeout: Duration,
    pub package_policy: PackagePolicy,
    pub identity_tool: IdentityToolConfig,
}

impl Default for HelperSettings {
    fn default() -> Self {
        Self {
            bundle_suffix: ".app".to_string(),
            poll_interval: Duration::from_millis(100),
            parent_timeout: Duration::from_secs(30),
            package_policy: PackagePolicy::Delegate,
            identity_tool: IdentityToolConfig::default(),
        }
    }
}

impl From<&UpdaterConfig> for HelperSettings {
    fn from(config: &UpdaterConfig) -> Self {
        Self {
            bundle_suffix: config.bundle_suffix.clone(),
            poll_interval: config.parent_poll_interval(),
            parent_timeout: config.parent_timeout(),
            package_policy: config.package_policy,
            identity_tool: config.identity_tool.clone(),
        }
    }
}

impl HelperSettings {
    /// Read overrides from the environment; anything absent or unparsable
    /// keeps its default.
    pub fn from_env(env: &HashMap<String, String>) -> Self {
        let mut settings = Self::default();
        if let Some(suffix) = env.get(ENV_BUNDLE_SUFFIX).filter(|s| s.starts_with('.')) {
            settings.bundle_suffix = suffix.clone();
        }
        if let Some(ms) = env.get(ENV_POLL_INTERVAL_MS).and_then(|v| v.parse().ok()).filter(|ms| *ms > 0) {
            settings.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env.get(ENV_PARENT_TIMEOUT_SECS).and_then(|v| v.parse().ok()) {
            settings.parent_timeout = Duration::from_secs(secs);
        }
        if let Some(policy) = env.get(ENV_PACKAGE_POLICY) {
            settings.package_policy = match policy.as_str() {
                "reject" => PackagePolicy::Reject,
                _ => PackagePolicy::Delegate,
            };
        }
        if let Some(raw) = env.get(ENV_IDENTITY_TOOL) {
            match serde_json::from_str::<IdentityToolConfig>(raw) {
                Ok(tool) if !tool.program.is_empty() => settings.identity_tool = tool,
                Ok(_) => tracing::warn!("identity tool override has no program, keeping default"),
                Err(e) => tracing::warn!(error = %e, "ignoring malformed identity tool override"),
            }
        }
        settings
    }

    pub fn to_env(&self) -> Vec<(String, String)> {
        let tool = serde_json::to_string(&self.identity_tool).unwrap_or_default();
        let policy = match self.package_policy {
            PackagePolicy::Delegate => "delegate",
            PackagePolicy::Reject => "reject",
        };
        vec![
            (ENV_BUNDLE_SUFFIX.to_string(), self.bundle_suffix.clone()),
            (ENV_POLL_INTERVAL_MS.to_string(), self.poll_interval.as_millis().to_string()),
            (ENV_PARENT_TIMEOUT_SECS.to_string(), self.parent_timeout.as_secs().to_string()),
            (ENV_PACKAGE_POLICY.to_string(), policy.to_string()),
            (ENV_IDENTITY_TOOL.to_string(), tool),
        ]
    }
}

/// What Stage produced.
enum Staged {
    Bundle(PathBuf),
    Package(PathBuf),
}

type LivenessProbe = Box<dyn Fn(u32) -> bool + Send + Sync>;

pub struct Helper {
    settings: HelperSettings,
    verifier: AuthenticityVerifier,
    mounter: Arc<dyn ImageMounter>,
    swap: AtomicSwap,
    launcher: Box<dyn Launcher>,
    is_alive: LivenessProbe,
}

impl Helper {
    pub fn new(
        settings: HelperSettings,
        verifier: AuthenticityVerifier,
        mounter: Arc<dyn ImageMounter>,
        swap: AtomicSwap,
        launcher: Box<dyn Launcher>,
    ) -> Self {
        Self {
            settings,
            verifier,
            mounter,
            swap,
            launcher,
            is_alive: Box::new(crate::engine::platform::is_process_alive),
        }
    }

    /// The helper wired to the real system tools.
    pub fn system(settings: HelperSettings) -> Self {
        let verifier = AuthenticityVerifier::from_config(&settings.identity_tool);
        Self::new(
            settings,
            verifier,
            Arc::new(Hdiutil),
            AtomicSwap::system(),
            Box::new(SystemLauncher),
        )
    }

    /// Replace the process-table liveness check.
    pub fn with_liveness_probe(mut self, probe: impl Fn(u32) -> bool + Send + Sync + 'static) -> Self {
        self.is_alive = Box::new(probe);
        self
    }

    pub fn settings(&self) -> &HelperSettings {
        &self.settings
    }

    pub fn run(&self, ctx: &DiscoveryContext) -> HelperOutcome {
        let mut tracker = StateTracker::new();
        let mut workspace = Workspace::new(self.mounter.clone());
        let result = self.drive(ctx, &mut tracker, &mut workspace);
        workspace.teardown();
        tracker.finish(result.err())
    }

    fn drive(
        &self,
        ctx: &DiscoveryContext,
        tracker: &mut StateTracker,
        workspace: &mut Workspace,
    ) -> Result<(), HelperError> {
        let (descriptor, _) = discovery::discover(ctx)?;

        tracker.advance();
        process::wait_for_exit_with(
            descriptor.pid,
            self.settings.poll_interval,
            self.settings.parent_timeout,
            |pid| (self.is_alive)(pid),
        );

        tracker.advance();
        let staged = self.stage(&descriptor, workspace)?;

        match staged {
            Staged::Bundle(staged) => {
                tracker.advance();
                self.verify_candidate(&descriptor.dest, &staged)?;
                self.swap.swap(&SwapPlan::new(&staged, &descriptor.dest))?;

                tracker.advance();
                self.launcher.relaunch(&descriptor.dest).map_err(HelperError::Relaunch)?;
            }
            Staged::Package(package) => {
                // The platform installer owns verification and placement.
                tracker.skip_to(HelperState::Relaunch);
                tracing::info!(package = %package.display(), "handing package to the system installer");
                self.launcher.relaunch(&package).map_err(HelperError::Relaunch)?;
            }
        }

        tracker.advance();
        Ok(())
    }

    fn stage(&self, descriptor: &HandoffDescriptor, workspace: &mut Workspace) -> Result<Staged, HelperError> {
        let suffix = &self.settings.bundle_suffix;
        let dest_parent = descriptor.dest.parent();
        let bundle_name = descriptor
            .dest
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("Update{}", suffix)));

        let staged = match descriptor.mode {
            ArtifactKind::Image => {
                let mount = workspace.mount(&descriptor.artifact)?;
                let found = artifact::locate_bundle(&mount, suffix)?;
                let staging = workspace
                    .create_dir(dest_parent, ".bundleup-stage-")
                    .map_err(artifact::ArtifactError::from)?;
                let target = staging.join(&bundle_name);
                let bytes = fsutil::copy_tree(&found, &target).map_err(artifact::ArtifactError::from)?;
                tracing::info!(from = %found.display(), to = %target.display(), bytes, "bundle staged from image");
                workspace.unmount(&mount);
                target
            }
            ArtifactKind::Archive => {
                let staging = workspace
                    .create_dir(dest_parent, ".bundleup-stage-")
                    .map_err(artifact::ArtifactError::from)?;
                artifact::extract_archive(&descriptor.artifact, &staging)?;
                let found = artifact::locate_bundle(&staging, suffix)?;
                tracing::info!(bundle = %found.display(), "bundle staged from archive");
                found
            }
            ArtifactKind::Bundle => {
                if !descriptor.artifact.is_dir() {
                    return Err(artifact::ArtifactError::NoBundleFound {
                        dir: descriptor.artifact.clone(),
                        suffix: suffix.clone(),
                    }
                    .into());
                }
                descriptor.artifact.clone()
            }
            ArtifactKind::Package => {
                if self.settings.package_policy == PackagePolicy::Reject {
                    return Err(HelperError::PackageRejected);
                }
                if !descriptor.artifact.exists() {
                    return Err(artifact::ArtifactError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("package not found: {}", descriptor.artifact.display()),
                    ))
                    .into());
                }
                return Ok(Staged::Package(descriptor.artifact.clone()));
            }
        };
        Ok(Staged::Bundle(staged))
    }

    /// Same-publisher gate against whatever currently holds the destination,
    /// or the backup an interrupted swap left behind.
    fn verify_candidate(&self, dest: &Path, staged: &Path) -> Result<(), HelperError> {
        let backup = super::swap::backup_path(dest);
        let reference = if fsutil::path_exists(dest) {
            dest.to_path_buf()
        } else if fsutil::path_exists(&backup) {
            backup
        } else {
            tracing::error!(dest = %dest.display(), "nothing installed to compare identities against");
            return Err(AuthError::IdentityMismatch {
                expected: String::new(),
                found: None,
            }
            .into());
        };
        self.verifier.verify_same_publisher(&reference, staged)?;
        Ok(())
    }
}
