//! ---
//! shem_section: "01-core-functionality"
//! shem_subsection: "binary"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Binary entrypoint for the SHEM orchestrator."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser};
use shem_common::{logging, ShemHome, Version, ORCHESTRATOR};
use shem_config::ConfigStore;
use shem_core::selfupdate::{newest_candidate, run_verification_child};
use shem_core::Orchestrator;
use shem_sandbox::PodmanSandbox;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    name = "shem-orchestrator",
    disable_version_flag = true,
    about = "Supervises sandboxed SHEM modules and mediates their communication",
    long_about = None
)]
struct Cli {
    #[arg(long = "verification-run", help = "Used during self-update.")]
    verification_run: bool,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version and exit."
    )]
    version: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The compiled-in version must be a valid dotted triple; everything in
    // the self-update protocol keys off it.
    let own_version: Version = match env!("CARGO_PKG_VERSION").parse() {
        Ok(version) => version,
        Err(err) => {
            eprintln!(
                "<3>[orchestrator] version {:?} is invalid ({err}), please check build parameters",
                env!("CARGO_PKG_VERSION")
            );
            std::process::exit(1);
        }
    };

    if cli.version {
        println!("shem-orchestrator version {own_version}");
        return;
    }

    logging::init();

    let home = match ShemHome::resolve() {
        Ok(home) => home,
        Err(err) => {
            error!(error = %err, "failed to resolve SHEM home directory");
            std::process::exit(1);
        }
    };
    if let Err(err) = home.ensure_layout() {
        error!(error = %err, "startup failed");
        std::process::exit(1);
    }

    if !cli.verification_run {
        match phase0(&home, own_version).await {
            Ok(Some(code)) => {
                // A verification child ran; its exit code is ours, success
                // and failure alike. The host supervisor restarts via the
                // symlink.
                std::process::exit(code);
            }
            Ok(None) => {}
            Err(err) => {
                error!(error = %err, "self-update startup check failed");
                std::process::exit(1);
            }
        }
    }

    let sandbox = Arc::new(PodmanSandbox::new());
    let orchestrator = Orchestrator::new(home, sandbox, own_version, cli.verification_run);

    if let Err(err) = orchestrator.run().await {
        error!(error = %err, "orchestrator failed");
        std::process::exit(1);
    }
}

/// Phase 0 of the self-update protocol: when a newer non-blacklisted
/// candidate binary is present, blacklist it (so a crash midway cannot loop)
/// and execute it with `--verification-run`, propagating its exit code.
async fn phase0(home: &ShemHome, own_version: Version) -> Result<Option<i32>> {
    let store = ConfigStore::new(home.clone());
    let config = store.module(ORCHESTRATOR)?;

    let blacklist = match config.blacklist() {
        Ok(blacklist) => blacklist,
        Err(err) => {
            error!(error = %err, "failed to read orchestrator blacklist");
            return Ok(None);
        }
    };

    let Some(candidate) = newest_candidate(&home.bin_dir(), own_version, &blacklist)? else {
        return Ok(None);
    };

    info!(version = %candidate, "found newer orchestrator binary");

    if let Err(err) = config.blacklist_add(candidate) {
        error!(version = %candidate, error = %err, "failed to add version to blacklist");
        return Ok(None);
    }

    info!(version = %candidate, "added version to blacklist, executing verification run");
    let binary = home.orchestrator_binary(candidate);
    let code = run_verification_child(&binary).await?;
    if code == 0 {
        info!("verification run executed successfully, exiting current process");
    } else {
        error!(code, "verification run exited with error");
    }
    Ok(Some(code))
}
