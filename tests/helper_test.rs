//! End-to-end install flows: the coordinator writes a handoff and "launches"
//! the helper, the helper picks the handoff up and swaps the bundle.
#![cfg(unix)]

use bundleup_lib::engine::config::{IdentityToolConfig, PackagePolicy, UpdaterConfig};
use bundleup_lib::engine::fsutil;
use bundleup_lib::engine::updater::artifact::{ArtifactError, ArtifactKind, ImageMounter};
use bundleup_lib::engine::updater::authenticity::AuthenticityVerifier;
use bundleup_lib::engine::updater::discovery::DiscoveryContext;
use bundleup_lib::engine::updater::handoff::{HandoffDescriptor, ENV_DESCRIPTOR};
use bundleup_lib::engine::updater::process::{HostTerminator, Launcher};
use bundleup_lib::engine::updater::swap::{AtomicSwap, DirectExecutor, SwapError, SwapExecutor, SwapPlan};
use bundleup_lib::engine::updater::{
    Helper, HelperError, HelperSettings, HelperState, InstallCoordinator, InstallError,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

const TEAM: &str = "ABCDE12345";

/// Reads the identity from a marker file inside the bundle through the real
/// command inspector.
fn identity_tool() -> IdentityToolConfig {
    IdentityToolConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), "cat \"$0/Contents/team\" 2>/dev/null || true".to_string()],
        token_prefix: "TeamIdentifier=".to_string(),
    }
}

/// Same marker file, reported under a different label.
fn relabeling_tool() -> IdentityToolConfig {
    IdentityToolConfig {
        program: "sh".to_string(),
        args: vec![
            "-c".to_string(),
            "sed 's/^TeamIdentifier=/Publisher: /' \"$0/Contents/team\" 2>/dev/null || true".to_string(),
        ],
        token_prefix: "Publisher:".to_string(),
    }
}

fn make_bundle(path: &Path, version: &str, team: Option<&str>) {
    fs::create_dir_all(path.join("Contents/MacOS")).unwrap();
    fs::write(
        path.join("Contents/Info.plist"),
        format!(
            "<plist><dict>\
             <key>CFBundleIdentifier</key><string>com.example.demo</string>\
             <key>CFBundleShortVersionString</key><string>{}</string>\
             </dict></plist>",
            version
        ),
    )
    .unwrap();
    fs::write(path.join("Contents/MacOS/Demo"), format!("binary {}", version)).unwrap();
    if let Some(team) = team {
        fs::write(path.join("Contents/team"), format!("TeamIdentifier={}\n", team)).unwrap();
    }
}

fn binary_of(bundle: &Path) -> String {
    fs::read_to_string(bundle.join("Contents/MacOS/Demo")).unwrap()
}

fn pack_tar_gz(bundle: &Path, out: &Path) {
    let encoder = GzEncoder::new(File::create(out).unwrap(), Compression::default());
    let mut archive = tar::Builder::new(encoder);
    archive
        .append_dir_all(bundle.file_name().unwrap(), bundle)
        .unwrap();
    archive.into_inner().unwrap().finish().unwrap();
}

#[derive(Clone, Default)]
struct Recorder {
    fail_helper: bool,
    helpers: Arc<Mutex<Vec<(PathBuf, Vec<String>, Vec<(String, String)>)>>>,
    relaunched: Arc<Mutex<Vec<PathBuf>>>,
    terminated: Arc<Mutex<Vec<Duration>>>,
}

impl Launcher for Recorder {
    fn launch_helper(&self, program: &Path, args: &[String], env: &[(String, String)]) -> io::Result<u32> {
        if self.fail_helper {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "not executable"));
        }
        self.helpers
            .lock()
            .unwrap()
            .push((program.to_path_buf(), args.to_vec(), env.to_vec()));
        Ok(4242)
    }

    fn relaunch(&self, bundle: &Path) -> io::Result<()> {
        self.relaunched.lock().unwrap().push(bundle.to_path_buf());
        Ok(())
    }
}

impl HostTerminator for Recorder {
    fn terminate(&self, grace: Duration) {
        self.terminated.lock().unwrap().push(grace);
    }
}

/// Treats a directory as a disk image; attaching copies its contents.
#[derive(Clone, Default)]
struct FolderImages {
    attached: Arc<Mutex<Vec<PathBuf>>>,
    detached: Arc<Mutex<Vec<PathBuf>>>,
}

impl ImageMounter for FolderImages {
    fn attach(&self, image: &Path, mount_point: &Path) -> Result<(), ArtifactError> {
        fsutil::copy_tree(image, mount_point)?;
        self.attached.lock().unwrap().push(mount_point.to_path_buf());
        Ok(())
    }

    fn detach(&self, mount_point: &Path) -> Result<(), ArtifactError> {
        self.detached.lock().unwrap().push(mount_point.to_path_buf());
        Ok(())
    }
}

/// Moves the destination aside and then gives up.
struct BreaksHalfway;

impl SwapExecutor for BreaksHalfway {
    fn name(&self) -> &'static str {
        "breaks-halfway"
    }

    fn execute(&self, plan: &SwapPlan) -> Result<(), SwapError> {
        fs::rename(&plan.dest, &plan.backup).unwrap();
        Err(SwapError::Privileged("disk went away".to_string()))
    }
}

struct Refuses;

impl SwapExecutor for Refuses {
    fn name(&self) -> &'static str {
        "refuses"
    }

    fn execute(&self, _plan: &SwapPlan) -> Result<(), SwapError> {
        Err(SwapError::Privileged("user cancelled".to_string()))
    }
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

struct Fixture {
    _root: TempDir,
    root: PathBuf,
    dest: PathBuf,
    descriptor: PathBuf,
    recorder: Recorder,
    images: FolderImages,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().to_path_buf();
        let dest = path.join("Applications/Demo.app");
        make_bundle(&dest, "1.0.0", Some(TEAM));
        Self {
            root: path.clone(),
            _root: root,
            dest,
            descriptor: path.join("handoff/bundleup-handoff.json"),
            recorder: Recorder::default(),
            images: FolderImages::default(),
        }
    }

    fn config(&self) -> UpdaterConfig {
        let helper = self.root.join("bin/bundleup-helper");
        fs::create_dir_all(helper.parent().unwrap()).unwrap();
        fs::write(&helper, "#!/bin/sh\n").unwrap();

        let mut config = UpdaterConfig::new("https://updates.example.com/feed.json", &self.dest);
        config.helper_path = Some(helper);
        config.identity_tool = identity_tool();
        config.termination_grace_ms = 0;
        config
    }

    fn coordinator(&self, config: UpdaterConfig) -> InstallCoordinator {
        let verifier = AuthenticityVerifier::from_config(&config.identity_tool);
        InstallCoordinator::new(
            config,
            verifier,
            Arc::new(self.images.clone()),
            Box::new(self.recorder.clone()),
            Box::new(self.recorder.clone()),
        )
        .with_descriptor_path(&self.descriptor)
    }

    /// Built the way the helper binary builds itself: the verifier comes from
    /// the settings it was handed.
    fn helper(&self, settings: HelperSettings, swap: AtomicSwap) -> Helper {
        let verifier = AuthenticityVerifier::from_config(&settings.identity_tool);
        Helper::new(
            settings,
            verifier,
            Arc::new(self.images.clone()),
            swap,
            Box::new(self.recorder.clone()),
        )
        .with_liveness_probe(|_| false)
    }

    /// What the launched helper would see: the env and flags the coordinator
    /// passed, and nothing from the real machine.
    fn launched_context(&self) -> (HashMap<String, String>, DiscoveryContext) {
        let helpers = self.recorder.helpers.lock().unwrap();
        let (program, args, env) = helpers.last().expect("helper launched").clone();
        let env: HashMap<String, String> = env.into_iter().collect();
        let ctx = DiscoveryContext {
            env: env.clone(),
            args,
            helper_exe: program,
            shared_dirs: Vec::new(),
            storage_root: None,
            bundle_suffix: ".app".to_string(),
        };
        (env, ctx)
    }

    fn leftover_staging(&self) -> Vec<PathBuf> {
        fs::read_dir(self.dest.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with(".bundleup-stage-"))
            .collect()
    }
}

#[test]
fn test_archive_install_round_trip() {
    let fx = Fixture::new();
    let release = fx.root.join("release/Demo.app");
    make_bundle(&release, "2.0.0", Some(TEAM));
    let artifact = fx.root.join("Demo-2.0.tar.gz");
    pack_tar_gz(&release, &artifact);

    let receipt = fx.coordinator(fx.config()).install(&artifact, None).unwrap();
    assert_eq!(receipt.kind, ArtifactKind::Archive);
    assert_eq!(receipt.identity.as_deref(), Some(TEAM));
    assert_eq!(receipt.helper_pid, 4242);
    assert_eq!(receipt.descriptor_path, fx.descriptor);
    assert!(fx.descriptor.exists());
    assert_eq!(fx.recorder.terminated.lock().unwrap().len(), 1);

    let (env, ctx) = fx.launched_context();
    assert_eq!(env.get(ENV_DESCRIPTOR).map(PathBuf::from), Some(fx.descriptor.clone()));

    let outcome = fx
        .helper(HelperSettings::from_env(&env), AtomicSwap::new(Box::new(DirectExecutor), Box::new(Refuses)))
        .run(&ctx);

    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.final_state(), HelperState::Terminate);
    assert_eq!(binary_of(&fx.dest), "binary 2.0.0");
    assert!(!fx.root.join("Applications/Demo.app.bak").exists());
    assert!(!fx.descriptor.exists());
    assert_eq!(*fx.recorder.relaunched.lock().unwrap(), vec![fx.dest.clone()]);
    assert!(fx.leftover_staging().is_empty());
}

#[test]
fn test_custom_identity_tool_reaches_helper() {
    let fx = Fixture::new();
    let candidate = fx.root.join("incoming/Demo.app");
    make_bundle(&candidate, "2.0.0", Some(TEAM));

    let mut config = fx.config();
    config.identity_tool = relabeling_tool();
    let receipt = fx.coordinator(config).install(&candidate, None).unwrap();
    assert_eq!(receipt.identity.as_deref(), Some(TEAM));

    let (env, ctx) = fx.launched_context();
    let settings = HelperSettings::from_env(&env);
    assert_eq!(settings.identity_tool, relabeling_tool());

    let outcome = fx
        .helper(settings, AtomicSwap::new(Box::new(DirectExecutor), Box::new(Refuses)))
        .run(&ctx);
    assert_eq!(outcome.exit_code(), 0, "{:?}", outcome.error);
    assert!(outcome.reached(HelperState::Relaunch));
    assert_eq!(binary_of(&fx.dest), "binary 2.0.0");
}

#[test]
fn test_image_install_detaches_every_mount() {
    let fx = Fixture::new();
    let image = fx.root.join("Demo-2.0.dmg");
    make_bundle(&image.join("Demo.app"), "2.0.0", Some(TEAM));

    let receipt = fx.coordinator(fx.config()).install(&image, None).unwrap();
    assert_eq!(receipt.kind, ArtifactKind::Image);

    let (env, ctx) = fx.launched_context();
    let outcome = fx
        .helper(HelperSettings::from_env(&env), AtomicSwap::new(Box::new(DirectExecutor), Box::new(Refuses)))
        .run(&ctx);

    assert_eq!(outcome.exit_code(), 0, "{:?}", outcome.error);
    assert_eq!(binary_of(&fx.dest), "binary 2.0.0");
    let attached = fx.images.attached.lock().unwrap().clone();
    let mut detached = fx.images.detached.lock().unwrap().clone();
    assert_eq!(attached.len(), 2);
    detached.sort();
    let mut attached = attached;
    attached.sort();
    assert_eq!(attached, detached);
    assert!(attached.iter().all(|m| !m.exists()));
}

#[test]
fn test_foreign_publisher_is_never_swapped_in() {
    let fx = Fixture::new();
    let candidate = fx.root.join("incoming/Demo.app");
    make_bundle(&candidate, "2.0.0", Some("ZZZZZ99999"));

    let err = fx.coordinator(fx.config()).install(&candidate, None).unwrap_err();
    assert!(matches!(err, InstallError::Verification(_)));
    assert!(!fx.descriptor.exists());
    assert!(fx.recorder.helpers.lock().unwrap().is_empty());
    assert!(fx.recorder.terminated.lock().unwrap().is_empty());

    // A handoff that skipped the host's check is caught by the helper.
    HandoffDescriptor {
        artifact: candidate.clone(),
        dest: fx.dest.clone(),
        pid: 999_999,
        mode: ArtifactKind::Bundle,
        host_bundle_id: String::new(),
    }
    .write_atomic(&fx.descriptor)
    .unwrap();
    let ctx = DiscoveryContext {
        env: HashMap::from([(ENV_DESCRIPTOR.to_string(), fx.descriptor.display().to_string())]),
        args: Vec::new(),
        helper_exe: fx.root.join("bin/bundleup-helper"),
        shared_dirs: Vec::new(),
        storage_root: None,
        bundle_suffix: ".app".to_string(),
    };
    let settings = HelperSettings {
        identity_tool: identity_tool(),
        ..HelperSettings::default()
    };
    let outcome = fx
        .helper(settings, AtomicSwap::new(Box::new(DirectExecutor), Box::new(Refuses)))
        .run(&ctx);

    assert_eq!(outcome.exit_code(), 4);
    assert!(matches!(outcome.error, Some(HelperError::Verification(_))));
    assert_eq!(outcome.final_state(), HelperState::Abort);
    assert!(!outcome.reached(HelperState::Relaunch));
    assert_eq!(binary_of(&fx.dest), "binary 1.0.0");
    assert_eq!(binary_of(&candidate), "binary 2.0.0");
    assert!(fx.recorder.relaunched.lock().unwrap().is_empty());
}

#[test]
fn test_failed_swap_keeps_previous_bundle() {
    let fx = Fixture::new();
    let candidate = fx.root.join("incoming/Demo.app");
    make_bundle(&candidate, "2.0.0", Some(TEAM));

    fx.coordinator(fx.config()).install(&candidate, Some(ArtifactKind::Bundle)).unwrap();
    let (env, ctx) = fx.launched_context();
    let outcome = fx
        .helper(HelperSettings::from_env(&env), AtomicSwap::new(Box::new(BreaksHalfway), Box::new(Refuses)))
        .run(&ctx);

    assert_eq!(outcome.exit_code(), 5);
    match outcome.error {
        Some(HelperError::Swap(SwapError::Unrecoverable { restored, .. })) => assert!(restored),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(binary_of(&fx.dest), "binary 1.0.0");
    assert!(!fx.root.join("Applications/Demo.app.bak").exists());
    assert!(fx.recorder.relaunched.lock().unwrap().is_empty());
}

#[test]
fn test_helper_launch_failure_keeps_host_running() {
    let mut fx = Fixture::new();
    fx.recorder.fail_helper = true;
    let candidate = fx.root.join("incoming/Demo.app");
    make_bundle(&candidate, "2.0.0", Some(TEAM));

    let err = fx.coordinator(fx.config()).install(&candidate, None).unwrap_err();
    assert!(matches!(err, InstallError::HelperLaunch { .. }));
    assert!(!fx.descriptor.exists());
    assert!(fx.recorder.terminated.lock().unwrap().is_empty());
}

#[test]
fn test_rejected_package_never_hands_off() {
    let fx = Fixture::new();
    let package = fx.root.join("Demo-2.0.pkg");
    fs::write(&package, "xar!").unwrap();

    let mut config = fx.config();
    config.package_policy = PackagePolicy::Reject;
    let err = fx.coordinator(config).install(&package, None).unwrap_err();
    assert!(matches!(err, InstallError::PackageRejected));

    let receipt = fx.coordinator(fx.config()).install(&package, None).unwrap();
    assert_eq!(receipt.kind, ArtifactKind::Package);
    assert_eq!(receipt.identity, None);

    let (env, ctx) = fx.launched_context();
    let outcome = fx
        .helper(HelperSettings::from_env(&env), AtomicSwap::new(Box::new(DirectExecutor), Box::new(Refuses)))
        .run(&ctx);
    assert_eq!(outcome.exit_code(), 0, "{:?}", outcome.error);
    assert!(!outcome.reached(HelperState::Swap));
    assert_eq!(*fx.recorder.relaunched.lock().unwrap(), vec![package]);
    assert_eq!(binary_of(&fx.dest), "binary 1.0.0");
}

#[test]
fn test_parent_timeout_is_logged_and_install_proceeds() {
    let fx = Fixture::new();
    let candidate = fx.root.join("incoming/Demo.app");
    make_bundle(&candidate, "2.0.0", Some(TEAM));
    fx.coordinator(fx.config()).install(&candidate, None).unwrap();
    let (env, ctx) = fx.launched_context();

    let mut settings = HelperSettings::from_env(&env);
    settings.poll_interval = Duration::from_millis(10);
    settings.parent_timeout = Duration::from_millis(100);
    let helper = Helper::new(
        settings,
        AuthenticityVerifier::from_config(&identity_tool()),
        Arc::new(fx.images.clone()),
        AtomicSwap::new(Box::new(DirectExecutor), Box::new(Refuses)),
        Box::new(fx.recorder.clone()),
    )
    .with_liveness_probe(|_| true);

    let logs = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(logs.clone())
        .with_ansi(false)
        .finish();
    let outcome = tracing::subscriber::with_default(subscriber, || helper.run(&ctx));

    assert_eq!(outcome.exit_code(), 0, "{:?}", outcome.error);
    assert_eq!(binary_of(&fx.dest), "binary 2.0.0");
    let text = logs.text();
    assert!(text.contains("WARN"), "{}", text);
    assert!(text.contains("parent still running after timeout"), "{}", text);
}
