//! bundleup Helper
//!
//! The out-of-process half of an install. The host leaves a handoff
//! descriptor, starts this binary and exits; the helper then replaces the
//! host bundle and relaunches it.
//!
//! ## Responsibilities
//! 1. Find the handoff descriptor (env path, host storage, temp dirs, env fields, flags)
//! 2. Wait (bounded) for the host process to exit
//! 3. Stage, verify and swap the new bundle, restoring the old one on failure
//! 4. Relaunch and exit with a code describing the result
//!
//! ## Design Principles
//! - Never depends on the host still running
//! - No shared state with the host beyond the descriptor file
//! - Cleans up its own scratch space on every path

use std::collections::HashMap;
use std::process::ExitCode;

use bundleup_lib::engine::logging;
use bundleup_lib::engine::updater::discovery::DiscoveryContext;
use bundleup_lib::engine::updater::{Helper, HelperSettings};

fn main() -> ExitCode {
    let log_path = logging::init(logging::default_log_path().as_deref());

    let env: HashMap<String, String> = std::env::vars().collect();
    let settings = HelperSettings::from_env(&env);
    let ctx = DiscoveryContext::from_process(&settings.bundle_suffix);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        log = ?log_path,
        "update helper started"
    );

    let outcome = Helper::system(settings).run(&ctx);
    let code = outcome.exit_code();
    match &outcome.error {
        None => tracing::info!(states = ?outcome.visited, "update helper finished"),
        Some(e) => {
            tracing::error!(error = %e, exit_code = code, states = ?outcome.visited, "update helper failed");
            eprintln!("Error: {}", e);
        }
    }
    ExitCode::from(code)
}
