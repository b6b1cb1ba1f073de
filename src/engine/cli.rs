//! bundleup CLI Module
//! Command-line interface for operating the updater by hand

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::config::CONFIG_FILE_NAME;
use super::updater::ArtifactKind;

#[derive(Parser, Debug)]
#[command(name = "bundleup")]
#[command(author = "bundleup Team")]
#[command(version)]
#[command(about = "Verified, rollback-safe updates for application bundles", long_about = None)]
pub struct Cli {
    /// Config file (defaults to ./bundleup.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Log file (defaults to the platform log directory)
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check the feed for a newer version
    Check,

    /// Download the newest artifact and verify it
    Download {
        /// Prefer a delta patch when the feed offers one for this version
        #[arg(long)]
        delta: bool,
    },

    /// Verify an artifact and hand it to the helper (terminates on success)
    Install {
        /// Artifact to install (disk image, archive, package or bundle)
        artifact: PathBuf,

        /// Artifact kind; inferred from the extension when omitted
        #[arg(short, long)]
        kind: Option<ArtifactKind>,
    },

    /// Check, download and install in one step
    Update,

    /// Print the publisher identity a bundle is signed with
    Identity {
        /// Bundle to inspect
        bundle: PathBuf,
    },

    /// Check that a candidate bundle has the expected publisher identity
    VerifyTeam {
        /// Candidate bundle
        candidate: PathBuf,

        /// Expected identity (defaults to the configured bundle's identity)
        #[arg(short, long)]
        identity: Option<String>,
    },

    /// Delta patch tools
    Delta {
        #[command(subcommand)]
        action: DeltaAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum DeltaAction {
    /// Build a patch that turns BASE into TARGET
    Build {
        base: PathBuf,
        target: PathBuf,

        /// Patch archive to write
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Rebuild a bundle from BASE and a patch
    Apply {
        patch: PathBuf,
        base: PathBuf,

        /// Directory to rebuild into
        #[arg(short, long)]
        work_dir: Option<PathBuf>,
    },
}

impl clap::ValueEnum for ArtifactKind {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            ArtifactKind::Image,
            ArtifactKind::Archive,
            ArtifactKind::Package,
            ArtifactKind::Bundle,
        ]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

impl Cli {
    pub fn get_config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(CONFIG_FILE_NAME)
        })
    }

    pub fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }
}
