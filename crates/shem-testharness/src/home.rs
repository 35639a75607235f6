//! ---
//! shem_section: "06-test-harness"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Throwaway SHEM home trees for tests."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use std::fs;
use std::path::PathBuf;

use shem_common::ShemHome;
use shem_config::ConfigStore;
use tempfile::TempDir;

/// A temporary `$SHEM_HOME` with `bin/` and `modules/` created, removed on
/// drop.
pub struct TempHome {
    _dir: TempDir,
    home: ShemHome,
}

impl TempHome {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp home");
        let home = ShemHome::new(dir.path());
        fs::create_dir_all(home.bin_dir()).expect("create bin dir");
        fs::create_dir_all(home.modules_dir()).expect("create modules dir");
        Self { _dir: dir, home }
    }

    pub fn home(&self) -> ShemHome {
        self.home.clone()
    }

    pub fn store(&self) -> ConfigStore {
        ConfigStore::new(self.home())
    }

    /// Start building a module configuration directory.
    pub fn add_module(&self, name: &str) -> ModuleBuilder {
        let dir = self.home.module_dir(name);
        fs::create_dir_all(&dir).expect("create module dir");
        ModuleBuilder { dir }
    }
}

impl Default for TempHome {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes key files into one module's directory.
pub struct ModuleBuilder {
    dir: PathBuf,
}

impl ModuleBuilder {
    pub fn file(self, key: &str, content: &str) -> Self {
        fs::write(self.dir.join(key), content).expect("write module key file");
        self
    }

    pub fn image(self, image: &str) -> Self {
        self.file("image", image)
    }

    pub fn current_version(self, version: &str) -> Self {
        self.file("current_version", version)
    }

    pub fn public_key(self, key_b64: &str) -> Self {
        self.file("public_key", key_b64)
    }

    pub fn inputs(self, patterns: &str) -> Self {
        self.file("inputs", patterns)
    }

    /// Touch a sentinel file such as `disabled` or `restart`.
    pub fn flag(self, name: &str) -> Self {
        self.file(name, "")
    }

    /// Create a mounted subdirectory such as `module-config` or `storage`.
    pub fn subdir(self, name: &str) -> Self {
        fs::create_dir_all(self.dir.join(name)).expect("create module subdir");
        self
    }

    pub fn path(&self) -> &std::path::Path {
        &self.dir
    }
}
