//! bundleup CLI - Main entry point for CLI binary
//!
//! Operator front end for the updater: check the feed, fetch and verify
//! artifacts, inspect publisher identities and build or apply delta patches.

use anyhow::{Context, Result};
use bundleup_lib::engine::{
    cli::formatter::{format_size, CliFormatter},
    cli::{Cli, Commands, DeltaAction},
    config::{IdentityToolConfig, UpdaterConfig},
    delta, logging,
    updater::{authenticity::AuthenticityVerifier, UpdateManifestEntry, Updater},
};
use clap::Parser;
use serde_json::json;
use std::path::Path;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let log_path = cli.log_file.clone().or_else(logging::default_log_path);
    logging::init(log_path.as_deref());

    if let Err(e) = run_cli(cli).await {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let json_output = cli.json();
    let config_path = cli.get_config_path();

    match cli.command {
        Commands::Check => {
            let updater = Updater::new(load_config(&config_path)?)?;
            let local = updater.local_version()?;
            let entry = updater.check().await?;
            print_check(&local, entry.as_ref(), json_output);
        }
        Commands::Download { delta } => {
            let updater = Updater::new(load_config(&config_path)?)?;
            cmd_download(&updater, delta, json_output).await?;
        }
        Commands::Install { artifact, kind } => {
            let updater = Updater::new(load_config(&config_path)?)?;
            if !json_output {
                CliFormatter::info(&format!("Verifying {} and handing off to the helper", artifact.display()));
            }
            let receipt = updater.install(&artifact, kind)?;
            // Only reached when the terminator does not exit the process.
            if json_output {
                println!(
                    "{}",
                    json!({
                        "kind": receipt.kind,
                        "descriptor": receipt.descriptor_path,
                        "helper": receipt.helper_path,
                        "helper_pid": receipt.helper_pid,
                        "identity": receipt.identity,
                    })
                );
            } else {
                CliFormatter::success(&format!("Helper started (pid {})", receipt.helper_pid));
            }
        }
        Commands::Update => {
            let updater = Updater::new(load_config(&config_path)?)?;
            match updater.update().await? {
                Some(receipt) => CliFormatter::success(&format!("Helper started (pid {})", receipt.helper_pid)),
                None if json_output => println!("{}", json!({ "update_available": false })),
                None => CliFormatter::success("Already up to date"),
            }
        }
        Commands::Identity { bundle } => {
            let verifier = AuthenticityVerifier::from_config(&identity_tool(&config_path));
            let identity = verifier.signing_identity(&bundle)?;
            if json_output {
                println!("{}", json!({ "bundle": bundle, "identity": identity }));
            } else {
                CliFormatter::kv("Identity", &identity);
            }
        }
        Commands::VerifyTeam { candidate, identity } => {
            let verifier = AuthenticityVerifier::from_config(&identity_tool(&config_path));
            let expected = match identity {
                Some(identity) => identity,
                None => {
                    let config = load_config(&config_path)?;
                    verifier
                        .signing_identity(&config.bundle_path)
                        .with_context(|| format!("reading identity of {}", config.bundle_path.display()))?
                }
            };
            verifier.verify_team_match(&expected, &candidate)?;
            if json_output {
                println!("{}", json!({ "candidate": candidate, "identity": expected, "verified": true }));
            } else {
                CliFormatter::success(&format!("{} is signed by {}", candidate.display(), expected));
            }
        }
        Commands::Delta { action } => cmd_delta(action, json_output)?,
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<UpdaterConfig> {
    UpdaterConfig::load_file(path).with_context(|| format!("loading {}", path.display()))
}

/// Identity tool from the config when one is readable, else the default.
fn identity_tool(path: &Path) -> IdentityToolConfig {
    UpdaterConfig::load_file(path)
        .map(|c| c.identity_tool)
        .unwrap_or_default()
}

fn print_check(local: &str, entry: Option<&UpdateManifestEntry>, json_output: bool) {
    if json_output {
        let body = match entry {
            Some(e) => json!({
                "update_available": true,
                "current": local,
                "version": e.version,
                "release_notes": e.release_notes,
                "url": e.download_url.as_str(),
                "checksum": e.checksum,
                "delta_available": e.delta_for(local).is_some(),
            }),
            None => json!({ "update_available": false, "current": local }),
        };
        println!("{}", body);
        return;
    }

    CliFormatter::header("Update Check");
    CliFormatter::kv("Current", local);
    match entry {
        Some(e) => {
            CliFormatter::kv("Available", &e.version);
            CliFormatter::kv("Download", e.download_url.as_str());
            if e.delta_for(local).is_some() {
                CliFormatter::item("A delta patch is available for this version");
            }
            if !e.release_notes.is_empty() {
                CliFormatter::header("Release Notes");
                for line in e.release_notes.lines() {
                    CliFormatter::item(line);
                }
            }
        }
        None => CliFormatter::success("Already up to date"),
    }
}

async fn cmd_download(updater: &Updater, prefer_delta: bool, json_output: bool) -> Result<()> {
    let Some(entry) = updater.check().await? else {
        if json_output {
            println!("{}", json!({ "update_available": false }));
        } else {
            CliFormatter::success("Already up to date");
        }
        return Ok(());
    };

    let mut progress = updater.progress();
    let reporter = (!json_output).then(|| {
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let fraction = *progress.borrow_and_update();
                CliFormatter::progress(fraction, "downloading");
            }
        })
    });

    let (artifact, kind) = if prefer_delta {
        let prepared = updater.prepare(&entry).await?;
        (prepared.artifact, prepared.kind)
    } else {
        (updater.download(&entry).await?, None)
    };
    if let Some(reporter) = reporter {
        reporter.abort();
    }

    let size = std::fs::metadata(&artifact).map(|m| m.len()).unwrap_or(0);
    if json_output {
        println!(
            "{}",
            json!({ "version": entry.version, "artifact": artifact, "kind": kind, "bytes": size })
        );
    } else {
        CliFormatter::success(&format!("Downloaded {} ({})", entry.version, format_size(size)));
        CliFormatter::kv("Artifact", &artifact.display().to_string());
    }
    Ok(())
}

fn cmd_delta(action: DeltaAction, json_output: bool) -> Result<()> {
    match action {
        DeltaAction::Build { base, target, output } => {
            let summary = delta::build(&base, &target, &output)?;
            if json_output {
                println!(
                    "{}",
                    json!({
                        "patch": summary.patch_path,
                        "deletions": summary.manifest.deletions,
                        "payload": summary.payload,
                        "payload_bytes": summary.payload_bytes,
                    })
                );
            } else {
                CliFormatter::success(&format!("Patch written to {}", summary.patch_path.display()));
                CliFormatter::kv("Changed or added", &summary.payload.len().to_string());
                CliFormatter::kv("Deleted", &summary.manifest.deletions.len().to_string());
                CliFormatter::kv("Payload", &format_size(summary.payload_bytes));
            }
        }
        DeltaAction::Apply { patch, base, work_dir } => {
            let work_dir = work_dir.unwrap_or_else(std::env::temp_dir);
            let rebuilt = delta::apply(&patch, &base, &work_dir)?;
            if json_output {
                println!("{}", json!({ "bundle": rebuilt }));
            } else {
                CliFormatter::success(&format!("Rebuilt bundle at {}", rebuilt.display()));
            }
        }
    }
    Ok(())
}
