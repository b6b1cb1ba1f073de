//! bundleup - self-update engine for application bundles
//!
//! The host process checks a feed, downloads the new bundle and hands the
//! destructive replacement to `bundleup-helper`, which swaps the bundle in
//! place once the host has exited.

pub mod engine;

pub use engine::updater::Updater;
pub use engine::config::UpdaterConfig;
