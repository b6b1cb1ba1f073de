// bundleup engine - core module structure
pub mod config;
pub mod cli;
pub mod logging;
pub mod fsutil;
pub mod platform;
pub mod updater;
pub mod delta;

pub use config::UpdaterConfig;
pub use updater::{UpdateError, Updater};
