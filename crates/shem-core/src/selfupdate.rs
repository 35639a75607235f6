//! ---
//! shem_section: "05-update-security"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Two-phase self-update: candidate discovery, verification exec, symlink promotion."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use shem_common::home::ORCHESTRATOR_BINARY_PREFIX;
use shem_common::{ShemHome, Version};
use tracing::{debug, info};

/// Find the newest non-blacklisted orchestrator binary in `bin/` strictly
/// newer than `own_version`. Files that do not parse as
/// `shem-orchestrator-<version>` are ignored.
pub fn newest_candidate(
    bin_dir: &Path,
    own_version: Version,
    blacklist: &BTreeSet<Version>,
) -> Result<Option<Version>> {
    let entries = std::fs::read_dir(bin_dir)
        .with_context(|| format!("failed to read bin directory {}", bin_dir.display()))?;

    let mut newest: Option<Version> = None;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }

        let name = entry.file_name();
        let Some(version) = name
            .to_str()
            .and_then(|name| name.strip_prefix(ORCHESTRATOR_BINARY_PREFIX))
        else {
            continue;
        };
        let Ok(version) = version.parse::<Version>() else {
            continue;
        };

        if blacklist.contains(&version) {
            debug!(version = %version, "skipping blacklisted candidate");
            continue;
        }
        if version <= own_version {
            continue;
        }

        if newest.map_or(true, |newest| version > newest) {
            newest = Some(version);
        }
    }

    Ok(newest)
}

/// Execute a candidate binary with `--verification-run`, inheriting the
/// standard streams, and return its exit code. The caller propagates the
/// code as its own.
pub async fn run_verification_child(binary: &Path) -> Result<i32> {
    info!(binary = %binary.display(), "executing verification run");

    let status = tokio::process::Command::new(binary)
        .arg("--verification-run")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .with_context(|| format!("failed to start verification run {}", binary.display()))?;

    Ok(status.code().unwrap_or(1))
}

/// Atomically repoint the stable `shem-orchestrator` symlink at the binary
/// for `version`: create a temporary symlink, then rename over the old one.
pub fn promote_symlink(home: &ShemHome, version: Version) -> Result<()> {
    let target = home.orchestrator_binary(version);
    let link = home.orchestrator_symlink();
    let temp = link.with_extension("tmp");

    info!(target = %target.display(), "updating orchestrator symlink");

    // A stale temp link from a crashed promotion would fail the symlink call.
    let _ = std::fs::remove_file(&temp);

    std::os::unix::fs::symlink(&target, &temp)
        .with_context(|| format!("failed to create temporary symlink {}", temp.display()))?;

    if let Err(err) = std::fs::rename(&temp, &link) {
        let _ = std::fs::remove_file(&temp);
        return Err(err)
            .with_context(|| format!("failed to replace symlink {}", link.display()));
    }

    Ok(())
}
