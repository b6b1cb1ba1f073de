//! Install Coordinator
//!
//! Runs inside the host. Verifies the artifact's publisher, leaves a handoff
//! descriptor for the helper, launches it and, only once it is running,
//! terminates the host so the helper can replace the bundle.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::artifact::{self, ArtifactError, ArtifactKind, Hdiutil, ImageMounter};
use super::authenticity::{AuthError, AuthenticityVerifier};
use super::handoff::{self, HandoffDescriptor, HandoffError, ENV_DESCRIPTOR};
use super::helper::HelperSettings;
use super::process::{self, ExitTerminator, HostTerminator, Launcher, SystemLauncher};
use super::workspace::Workspace;
use crate::engine::config::{PackagePolicy, UpdaterConfig};
use crate::engine::platform::{self, Platform};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Artifact not found: {0}")]
    ArtifactMissing(PathBuf),
    #[error("Cannot determine artifact kind of {0}")]
    UnknownKind(PathBuf),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("Authenticity check failed: {0}")]
    Verification(#[from] AuthError),
    #[error("Package artifacts are refused by policy")]
    PackageRejected,
    #[error(transparent)]
    Handoff(#[from] HandoffError),
    #[error("Update helper not found")]
    HelperNotFound,
    #[error("Failed to launch update helper {path}: {source}")]
    HelperLaunch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What the coordinator set in motion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReceipt {
    pub kind: ArtifactKind,
    pub descriptor_path: PathBuf,
    pub helper_path: PathBuf,
    pub helper_pid: u32,
    /// Publisher identity checked before handoff; `None` for delegated packages.
    pub identity: Option<String>,
}

pub struct InstallCoordinator {
    config: UpdaterConfig,
    verifier: AuthenticityVerifier,
    mounter: Arc<dyn ImageMounter>,
    launcher: Box<dyn Launcher>,
    terminator: Box<dyn HostTerminator>,
    descriptor_path: Option<PathBuf>,
}

impl InstallCoordinator {
    pub fn new(
        config: UpdaterConfig,
        verifier: AuthenticityVerifier,
        mounter: Arc<dyn ImageMounter>,
        launcher: Box<dyn Launcher>,
        terminator: Box<dyn HostTerminator>,
    ) -> Self {
        Self {
            config,
            verifier,
            mounter,
            launcher,
            terminator,
            descriptor_path: None,
        }
    }

    pub fn system(config: UpdaterConfig) -> Self {
        let verifier = AuthenticityVerifier::from_config(&config.identity_tool);
        Self::new(
            config,
            verifier,
            Arc::new(Hdiutil),
            Box::new(SystemLauncher),
            Box::new(ExitTerminator),
        )
    }

    /// Write the descriptor here instead of the well-known location.
    pub fn with_descriptor_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.descriptor_path = Some(path.into());
        self
    }

    pub fn verifier(&self) -> &AuthenticityVerifier {
        &self.verifier
    }

    /// Host identifier from config or the bundle's Info.plist.
    pub fn host_bundle_id(&self) -> Option<String> {
        self.config
            .bundle_id
            .clone()
            .or_else(|| platform::read_info_value(&self.config.bundle_path, "CFBundleIdentifier"))
    }

    /// Private storage when the host identifier is known, else shared temp.
    pub fn descriptor_location(&self) -> Result<PathBuf, HandoffError> {
        if let Some(path) = &self.descriptor_path {
            return Ok(path.clone());
        }
        if let Some(storage) = self
            .host_bundle_id()
            .and_then(|id| Platform::current().app_storage_dir(&id))
        {
            return Ok(handoff::private_descriptor_path(&storage));
        }
        platform::shared_temp_dirs()
            .first()
            .map(|dir| handoff::shared_descriptor_path(dir))
            .ok_or(HandoffError::NoLocation)
    }

    pub fn install(&self, artifact: &Path, kind: Option<ArtifactKind>) -> Result<InstallReceipt, InstallError> {
        if !artifact.exists() {
            return Err(InstallError::ArtifactMissing(artifact.to_path_buf()));
        }
        let kind = kind
            .or_else(|| ArtifactKind::classify(artifact, &self.config.bundle_suffix))
            .ok_or_else(|| InstallError::UnknownKind(artifact.to_path_buf()))?;
        tracing::info!(artifact = %artifact.display(), %kind, "installing update");

        let identity = self.preflight(artifact, kind)?;

        let helper_path = process::locate_helper(self.config.helper_path.as_deref(), &self.config.bundle_path)
            .ok_or(InstallError::HelperNotFound)?;

        let descriptor = HandoffDescriptor {
            artifact: artifact.to_path_buf(),
            dest: self.config.bundle_path.clone(),
            pid: std::process::id(),
            mode: kind,
            host_bundle_id: self.host_bundle_id().unwrap_or_default(),
        };
        let descriptor_path = self.descriptor_location()?;
        descriptor.write_atomic(&descriptor_path)?;

        let mut env = vec![(ENV_DESCRIPTOR.to_string(), descriptor_path.display().to_string())];
        env.extend(HelperSettings::from(&self.config).to_env());

        let helper_pid = match self.launcher.launch_helper(&helper_path, &descriptor.to_flags(), &env) {
            Ok(pid) => pid,
            Err(source) => {
                tracing::error!(helper = %helper_path.display(), error = %source, "helper launch failed, host keeps running");
                if let Err(e) = std::fs::remove_file(&descriptor_path) {
                    tracing::warn!(path = %descriptor_path.display(), error = %e, "could not remove unused descriptor");
                }
                return Err(InstallError::HelperLaunch {
                    path: helper_path,
                    source,
                });
            }
        };

        let receipt = InstallReceipt {
            kind,
            descriptor_path,
            helper_path,
            helper_pid,
            identity,
        };
        self.terminator.terminate(self.config.termination_grace());
        Ok(receipt)
    }

    /// Identity check ahead of handoff. Returns the verified identity.
    fn preflight(&self, artifact: &Path, kind: ArtifactKind) -> Result<Option<String>, InstallError> {
        let current = &self.config.bundle_path;
        let suffix = &self.config.bundle_suffix;
        match kind {
            ArtifactKind::Package => match self.config.package_policy {
                PackagePolicy::Delegate => {
                    tracing::info!("package verification delegated to the platform installer");
                    Ok(None)
                }
                PackagePolicy::Reject => Err(InstallError::PackageRejected),
            },
            ArtifactKind::Bundle => Ok(Some(self.verifier.verify_same_publisher(current, artifact)?)),
            ArtifactKind::Image => {
                let mut workspace = Workspace::new(self.mounter.clone());
                let mount = workspace.mount(artifact)?;
                let bundle = artifact::locate_bundle(&mount, suffix)?;
                let identity = self.verifier.verify_same_publisher(current, &bundle)?;
                workspace.teardown();
                Ok(Some(identity))
            }
            ArtifactKind::Archive => {
                let mut workspace = Workspace::new(self.mounter.clone());
                let dir = workspace.create_dir(None, "bundleup-verify-").map_err(ArtifactError::from)?;
                artifact::extract_archive(artifact, &dir)?;
                let bundle = artifact::locate_bundle(&dir, suffix)?;
                let identity = self.verifier.verify_same_publisher(current, &bundle)?;
                workspace.teardown();
                Ok(Some(identity))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::artifact::testing::DirectoryMounter;
    use crate::engine::updater::authenticity::testing::verifier;
    use crate::engine::updater::process::testing::{RecordingLauncher, RecordingTerminator};
    use std::fs;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Shared<T>(Arc<T>);

    impl Launcher for Shared<RecordingLauncher> {
        fn launch_helper(&self, p: &Path, a: &[String], e: &[(String, String)]) -> io::Result<u32> {
            self.0.launch_helper(p, a, e)
        }
        fn relaunch(&self, bundle: &Path) -> io::Result<()> {
            self.0.relaunch(bundle)
        }
    }

    impl HostTerminator for Shared<RecordingTerminator> {
        fn terminate(&self, grace: Duration) {
            self.0.terminate(grace)
        }
    }

    struct Setup {
        dir: TempDir,
        config: UpdaterConfig,
        launcher: Arc<RecordingLauncher>,
        terminator: Arc<RecordingTerminator>,
    }

    fn setup() -> Setup {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("Demo.app");
        fs::create_dir_all(bundle.join("Contents")).unwrap();
        let helper = dir.path().join("bundleup-helper");
        fs::write(&helper, "").unwrap();

        let mut config = UpdaterConfig::new("https://example.com/feed.json", &bundle);
        config.helper_path = Some(helper);
        config.bundle_id = Some("com.example.demo".to_string());
        Setup {
            dir,
            config,
            launcher: Arc::new(RecordingLauncher::default()),
            terminator: Arc::new(RecordingTerminator::default()),
        }
    }

    fn coordinator(s: &Setup, verifier: AuthenticityVerifier) -> InstallCoordinator {
        InstallCoordinator::new(
            s.config.clone(),
            verifier,
            Arc::new(DirectoryMounter::default()),
            Box::new(Shared(s.launcher.clone())),
            Box::new(Shared(s.terminator.clone())),
        )
        .with_descriptor_path(s.dir.path().join("handoff/descriptor.json"))
    }

    #[test]
    fn test_bundle_install_hands_off_then_terminates() {
        let s = setup();
        let candidate = s.dir.path().join("download/Demo.app");
        fs::create_dir_all(&candidate).unwrap();

        let c = coordinator(&s, verifier(&[(&s.config.bundle_path, "TEAMA"), (&candidate, "TEAMA")]));
        let receipt = c.install(&candidate, None).unwrap();

        assert_eq!(receipt.kind, ArtifactKind::Bundle);
        assert_eq!(receipt.identity.as_deref(), Some("TEAMA"));

        let written: HandoffDescriptor =
            serde_json::from_str(&fs::read_to_string(&receipt.descriptor_path).unwrap()).unwrap();
        assert_eq!(written.dest, s.config.bundle_path);
        assert_eq!(written.pid, std::process::id());
        assert_eq!(written.host_bundle_id, "com.example.demo");

        let launches = s.launcher.helpers.lock().unwrap();
        assert_eq!(launches.len(), 1);
        let (_, args, env) = &launches[0];
        assert!(args.contains(&"-dest".to_string()));
        assert!(env.iter().any(|(k, v)| k == ENV_DESCRIPTOR && Path::new(v) == receipt.descriptor_path));
        assert_eq!(*s.terminator.calls.lock().unwrap(), vec![Duration::from_millis(500)]);
    }

    #[test]
    fn test_mismatch_writes_nothing() {
        let s = setup();
        let candidate = s.dir.path().join("download/Demo.app");
        fs::create_dir_all(&candidate).unwrap();

        let c = coordinator(&s, verifier(&[(&s.config.bundle_path, "TEAMA"), (&candidate, "TEAMB")]));
        assert!(matches!(c.install(&candidate, None), Err(InstallError::Verification(_))));
        assert!(!s.dir.path().join("handoff/descriptor.json").exists());
        assert!(s.launcher.helpers.lock().unwrap().is_empty());
        assert!(s.terminator.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_helper_launch_failure_keeps_host_alive() {
        let mut s = setup();
        s.launcher = Arc::new(RecordingLauncher {
            fail_helper: true,
            ..Default::default()
        });
        let candidate = s.dir.path().join("download/Demo.app");
        fs::create_dir_all(&candidate).unwrap();

        let c = coordinator(&s, verifier(&[(&s.config.bundle_path, "TEAMA"), (&candidate, "TEAMA")]));
        assert!(matches!(c.install(&candidate, None), Err(InstallError::HelperLaunch { .. })));
        assert!(s.terminator.calls.lock().unwrap().is_empty());
        assert!(!s.dir.path().join("handoff/descriptor.json").exists());
    }

    #[test]
    fn test_missing_helper_is_fatal() {
        let mut s = setup();
        s.config.helper_path = Some(s.dir.path().join("not-there"));
        let candidate = s.dir.path().join("download/Demo.app");
        fs::create_dir_all(&candidate).unwrap();

        let c = coordinator(&s, verifier(&[(&s.config.bundle_path, "TEAMA"), (&candidate, "TEAMA")]));
        assert!(matches!(c.install(&candidate, None), Err(InstallError::HelperNotFound)));
        assert!(s.terminator.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_image_preflight_cleans_up() {
        let s = setup();
        let image = s.dir.path().join("Demo.dmg");
        fs::create_dir_all(image.join("Demo.app")).unwrap();

        // Mount points are generated; answer for any path.
        struct AnyTeamA;
        impl crate::engine::updater::authenticity::SignatureInspector for AnyTeamA {
            fn inspect(&self, _bundle: &Path) -> Result<String, AuthError> {
                Ok("TeamIdentifier=TEAMA\n".to_string())
            }
        }
        let mounter = Arc::new(DirectoryMounter::default());
        let c = InstallCoordinator::new(
            s.config.clone(),
            AuthenticityVerifier::new(Box::new(AnyTeamA), "TeamIdentifier="),
            mounter.clone(),
            Box::new(Shared(s.launcher.clone())),
            Box::new(Shared(s.terminator.clone())),
        )
        .with_descriptor_path(s.dir.path().join("handoff/descriptor.json"));

        let receipt = c.install(&image, None).unwrap();
        assert_eq!(receipt.kind, ArtifactKind::Image);
        let attached = mounter.attached.lock().unwrap().clone();
        assert_eq!(*mounter.detached.lock().unwrap(), attached);
        assert!(attached.iter().all(|m| !m.exists()));
    }

    #[test]
    fn test_archive_with_two_bundles_is_fatal() {
        let s = setup();
        let archive = s.dir.path().join("Demo.zip");
        {
            let mut zip = zip::ZipWriter::new(fs::File::create(&archive).unwrap());
            let options = zip::write::SimpleFileOptions::default();
            zip.add_directory("A.app/", options).unwrap();
            zip.add_directory("B.app/", options).unwrap();
            zip.finish().unwrap();
        }
        let c = coordinator(&s, verifier(&[]));
        assert!(matches!(
            c.install(&archive, None),
            Err(InstallError::Artifact(ArtifactError::MultipleBundles { .. }))
        ));
    }

    #[test]
    fn test_package_policy() {
        let mut s = setup();
        let package = s.dir.path().join("Demo.pkg");
        fs::write(&package, "xar").unwrap();

        let receipt = coordinator(&s, verifier(&[])).install(&package, None).unwrap();
        assert_eq!(receipt.kind, ArtifactKind::Package);
        assert!(receipt.identity.is_none());

        s.config.package_policy = PackagePolicy::Reject;
        assert!(matches!(
            coordinator(&s, verifier(&[])).install(&package, None),
            Err(InstallError::PackageRejected)
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let s = setup();
        let odd = s.dir.path().join("Demo.bin");
        fs::write(&odd, "").unwrap();
        assert!(matches!(
            coordinator(&s, verifier(&[])).install(&odd, None),
            Err(InstallError::UnknownKind(_))
        ));
    }
}
