//! ---
//! shem_section: "01-core-functionality"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Resolution and layout of the SHEM home directory."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};

use crate::version::Version;

/// Environment variable overriding the SHEM home directory.
pub const HOME_ENV: &str = "SHEM_HOME";

/// Name of the stable symlink the host supervisor invokes.
pub const ORCHESTRATOR_SYMLINK: &str = "shem-orchestrator";

/// Prefix of versioned orchestrator binaries under `bin/`.
pub const ORCHESTRATOR_BINARY_PREFIX: &str = "shem-orchestrator-";

/// The on-disk root that holds orchestrator binaries and module configuration.
///
/// ```text
/// $SHEM_HOME/
///   bin/        versioned binaries and the stable symlink
///   modules/    one directory per module, files as keys
/// ```
#[derive(Debug, Clone)]
pub struct ShemHome {
    root: PathBuf,
}

impl ShemHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the home directory from `$SHEM_HOME`, falling back to
    /// `$HOME/shem`.
    pub fn resolve() -> Result<Self> {
        if let Ok(path) = std::env::var(HOME_ENV) {
            if !path.trim().is_empty() {
                return Ok(Self::new(path));
            }
        }
        let home = std::env::var("HOME")
            .map_err(|_| anyhow!("failed to determine user home directory"))?;
        Ok(Self::new(Path::new(&home).join("shem")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub fn modules_dir(&self) -> PathBuf {
        self.root.join("modules")
    }

    pub fn module_dir(&self, name: &str) -> PathBuf {
        self.modules_dir().join(name)
    }

    /// Path of the stable symlink the host supervisor starts.
    pub fn orchestrator_symlink(&self) -> PathBuf {
        self.bin_dir().join(ORCHESTRATOR_SYMLINK)
    }

    /// Path of the versioned orchestrator binary for `version`.
    pub fn orchestrator_binary(&self, version: Version) -> PathBuf {
        self.bin_dir()
            .join(format!("{ORCHESTRATOR_BINARY_PREFIX}{version}"))
    }

    /// Verify that the required directories exist. Their absence is a fatal
    /// startup condition.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [self.bin_dir(), self.modules_dir()] {
            if !dir.is_dir() {
                return Err(anyhow!(
                    "required directory does not exist: {}",
                    dir.display()
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_derive_from_root() {
        let home = ShemHome::new("/var/lib/shem");
        assert_eq!(home.bin_dir(), Path::new("/var/lib/shem/bin"));
        assert_eq!(home.module_dir("meter"), Path::new("/var/lib/shem/modules/meter"));
        assert_eq!(
            home.orchestrator_binary(Version::new(0, 0, 5)),
            Path::new("/var/lib/shem/bin/shem-orchestrator-0.0.5")
        );
    }

    #[test]
    fn ensure_layout_requires_both_directories() {
        let dir = tempfile::tempdir().unwrap();
        let home = ShemHome::new(dir.path());
        assert!(home.ensure_layout().is_err());

        std::fs::create_dir(home.bin_dir()).unwrap();
        assert!(home.ensure_layout().is_err());

        std::fs::create_dir(home.modules_dir()).unwrap();
        home.ensure_layout().unwrap();
    }
}
