//! Descriptor discovery for the helper.
//!
//! Each source is a plain function over a [`DiscoveryContext`]; [`discover`]
//! tries them in priority order and the first complete descriptor wins.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use super::handoff::{
    self, HandoffDescriptor, HandoffError, PartialDescriptor, DESCRIPTOR_FILE_NAME, ENV_ARTIFACT,
    ENV_DEST, ENV_DESCRIPTOR, ENV_HOST_BUNDLE_ID, ENV_MODE, ENV_PID,
};
use crate::engine::platform;

/// Everything discovery is allowed to look at.
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    pub env: HashMap<String, String>,
    /// Arguments after the program name.
    pub args: Vec<String>,
    pub helper_exe: PathBuf,
    pub shared_dirs: Vec<PathBuf>,
    /// Root under which per-app private storage lives (`<root>/<bundle id>`).
    pub storage_root: Option<PathBuf>,
    pub bundle_suffix: String,
}

impl DiscoveryContext {
    /// Context for the running process.
    pub fn from_process(bundle_suffix: &str) -> Self {
        Self {
            env: std::env::vars().collect(),
            args: std::env::args().skip(1).collect(),
            helper_exe: std::env::current_exe().unwrap_or_default(),
            shared_dirs: platform::shared_temp_dirs(),
            storage_root: dirs::data_dir(),
            bundle_suffix: bundle_suffix.to_string(),
        }
    }

    fn env_value(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    ExplicitPath,
    PrivateStorage,
    SharedTemp,
    Environment,
    Flags,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiscoverySource::ExplicitPath => "explicit-path",
            DiscoverySource::PrivateStorage => "private-storage",
            DiscoverySource::SharedTemp => "shared-temp",
            DiscoverySource::Environment => "environment",
            DiscoverySource::Flags => "flags",
        };
        f.write_str(name)
    }
}

type SourceFn = fn(&DiscoveryContext) -> Option<PartialDescriptor>;

/// Sources in priority order.
pub const SOURCES: [(DiscoverySource, SourceFn); 5] = [
    (DiscoverySource::ExplicitPath, from_explicit_path),
    (DiscoverySource::PrivateStorage, from_private_storage),
    (DiscoverySource::SharedTemp, from_shared_temp),
    (DiscoverySource::Environment, from_environment),
    (DiscoverySource::Flags, from_flags),
];

/// First complete descriptor across all sources.
pub fn discover(ctx: &DiscoveryContext) -> Result<(HandoffDescriptor, DiscoverySource), HandoffError> {
    for (source, find) in SOURCES {
        let Some(partial) = find(ctx) else {
            continue;
        };
        match partial.complete(&ctx.bundle_suffix) {
            Some(descriptor) => {
                tracing::info!(%source, dest = %descriptor.dest.display(), pid = descriptor.pid, mode = %descriptor.mode, "handoff descriptor discovered");
                return Ok((descriptor, source));
            }
            None => tracing::warn!(%source, "incomplete handoff descriptor, trying next source"),
        }
    }
    Err(HandoffError::NotFound)
}

fn consume(path: &Path) -> Option<PartialDescriptor> {
    match handoff::read_and_consume(path) {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(error = %e, "could not read handoff descriptor");
            None
        }
    }
}

pub fn from_explicit_path(ctx: &DiscoveryContext) -> Option<PartialDescriptor> {
    ctx.env_value(ENV_DESCRIPTOR).and_then(|p| consume(Path::new(p)))
}

pub fn from_private_storage(ctx: &DiscoveryContext) -> Option<PartialDescriptor> {
    let host = host_bundle(&ctx.helper_exe, &ctx.bundle_suffix)?;
    let bundle_id = platform::read_info_value(&host, "CFBundleIdentifier")?;
    let storage = ctx.storage_root.as_ref()?.join(&bundle_id);
    tracing::debug!(host = %host.display(), %bundle_id, "checking host private storage");
    consume(&handoff::private_descriptor_path(&storage))
}

pub fn from_shared_temp(ctx: &DiscoveryContext) -> Option<PartialDescriptor> {
    ctx.shared_dirs.iter().find_map(|dir| {
        consume(&handoff::shared_descriptor_path(dir)).or_else(|| consume(&dir.join(DESCRIPTOR_FILE_NAME)))
    })
}

pub fn from_environment(ctx: &DiscoveryContext) -> Option<PartialDescriptor> {
    let partial = PartialDescriptor {
        artifact: ctx.env_value(ENV_ARTIFACT).map(PathBuf::from),
        dest: ctx.env_value(ENV_DEST).map(PathBuf::from),
        pid: ctx.env_value(ENV_PID).and_then(|p| p.parse().ok()),
        mode: ctx.env_value(ENV_MODE).map(str::to_string),
        host_bundle_id: ctx.env_value(ENV_HOST_BUNDLE_ID).map(str::to_string),
    };
    (partial != PartialDescriptor::default()).then_some(partial)
}

pub fn from_flags(ctx: &DiscoveryContext) -> Option<PartialDescriptor> {
    let mut partial = PartialDescriptor::default();
    let mut args = ctx.args.iter();
    while let Some(flag) = args.next() {
        let name = flag.trim_start_matches('-');
        if name.len() == flag.len() {
            continue;
        }
        let Some(value) = args.next() else {
            break;
        };
        match name {
            "dest" => partial.dest = Some(PathBuf::from(value)),
            "pid" => partial.pid = value.parse().ok(),
            "artifact" | "dmg" => partial.artifact = Some(PathBuf::from(value)),
            "mode" => partial.mode = Some(value.clone()),
            _ => tracing::debug!(flag = %flag, "ignoring unknown flag"),
        }
    }
    (partial != PartialDescriptor::default()).then_some(partial)
}

/// The first bundle enclosing `helper_exe` that is not the helper's own
/// bundle. A bundle is the helper's own when its declared executable is the
/// helper binary.
pub fn host_bundle(helper_exe: &Path, bundle_suffix: &str) -> Option<PathBuf> {
    let suffix = bundle_suffix.to_lowercase();
    let exe_name = helper_exe.file_name()?.to_string_lossy().to_string();

    helper_exe
        .ancestors()
        .skip(1)
        .filter(|dir| {
            dir.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().ends_with(&suffix))
                .unwrap_or(false)
        })
        .find(|dir| {
            let own_exe = dir.join("Contents/MacOS").join(&exe_name) == helper_exe
                && platform::read_info_value(dir, "CFBundleExecutable").as_deref() == Some(exe_name.as_str());
            !own_exe
        })
        .map(Path::to_path_buf)
}
