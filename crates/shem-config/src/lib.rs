//! ---
//! shem_section: "03-configuration"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Typed access to per-module directory-file configuration."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
//! The on-disk configuration model: one directory per module under
//! `$SHEM_HOME/modules/`, one file per key. Reads trim surrounding
//! whitespace; writes replace the whole file.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use shem_common::{ShemHome, Version};

/// Entry point for configuration access, bound to a home directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    home: ShemHome,
}

impl ConfigStore {
    pub fn new(home: ShemHome) -> Self {
        Self { home }
    }

    pub fn home(&self) -> &ShemHome {
        &self.home
    }

    /// All configured module names, sorted. A directory counts as a module
    /// when it contains a readable `image` file.
    pub fn list_modules(&self) -> Result<Vec<String>> {
        let modules_dir = self.home.modules_dir();
        let entries = fs::read_dir(&modules_dir)
            .with_context(|| format!("failed to read modules directory {}", modules_dir.display()))?;

        let mut modules = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if entry.path().join("image").is_file() {
                modules.push(name);
            }
        }

        modules.sort();
        Ok(modules)
    }

    /// Accessor for a single module's configuration. Errors when the module
    /// directory does not exist.
    pub fn module(&self, name: &str) -> Result<ModuleConfig> {
        let dir = self.home.module_dir(name);
        if !dir.is_dir() {
            return Err(anyhow!("module {name} does not exist"));
        }
        Ok(ModuleConfig {
            name: name.to_owned(),
            dir,
        })
    }
}

/// Typed reads and writes of one module's key files.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    name: String,
    dir: PathBuf,
}

impl ModuleConfig {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Read a key as a trimmed string. A missing file is an error.
    pub fn get(&self, key: &str) -> Result<String> {
        self.get_opt(key)?
            .ok_or_else(|| anyhow!("missing {key} file for module {}", self.name))
    }

    /// Read a key as a trimmed string, `None` when the file is absent.
    pub fn get_opt(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.key_path(key)) {
            Ok(content) => Ok(Some(content.trim().to_owned())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| {
                format!("failed to read {key} file for module {}", self.name)
            }),
        }
    }

    /// Read a key as a trimmed string, with a default for an absent file.
    pub fn get_or(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.get_opt(key)?.unwrap_or_else(|| default.to_owned()))
    }

    /// Read a key as a float. An absent file or empty value yields the
    /// default.
    pub fn get_f64_or(&self, key: &str, default: f64) -> Result<f64> {
        match self.get_opt(key)? {
            None => Ok(default),
            Some(value) if value.is_empty() => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| anyhow!("invalid float value for {key}: {value}")),
        }
    }

    /// Read a key as an integer. An absent file or empty value yields the
    /// default.
    pub fn get_i64_or(&self, key: &str, default: i64) -> Result<i64> {
        match self.get_opt(key)? {
            None => Ok(default),
            Some(value) if value.is_empty() => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| anyhow!("invalid integer value for {key}: {value}")),
        }
    }

    /// Read a key as a boolean. An absent file or empty value yields the
    /// default.
    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get_opt(key)? {
            None => Ok(default),
            Some(value) if value.is_empty() => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| anyhow!("invalid boolean value for {key}: {value}")),
        }
    }

    /// Write a key, replacing the whole file.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        fs::write(self.key_path(key), value).with_context(|| {
            format!("failed to write {key} file for module {}", self.name)
        })
    }

    /// Whether the `disabled` sentinel file is present.
    pub fn is_disabled(&self) -> bool {
        self.key_path("disabled").exists()
    }

    /// Consume the one-shot `restart` sentinel. Returns whether it was
    /// present.
    pub fn take_restart(&self) -> Result<bool> {
        match fs::remove_file(self.key_path("restart")) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| {
                format!("failed to remove restart file for module {}", self.name)
            }),
        }
    }

    fn blacklist_path(&self) -> PathBuf {
        self.key_path("blacklist")
    }

    /// The set of blacklisted versions. An absent file is the empty set; a
    /// malformed line is read as `0.0.0`.
    pub fn blacklist(&self) -> Result<BTreeSet<Version>> {
        let content = match fs::read_to_string(self.blacklist_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to read blacklist file for module {}", self.name)
                })
            }
        };
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Version::lenient)
            .collect())
    }

    pub fn blacklist_contains(&self, version: Version) -> Result<bool> {
        Ok(self.blacklist()?.contains(&version))
    }

    /// Add a version to the blacklist. Idempotent.
    pub fn blacklist_add(&self, version: Version) -> Result<()> {
        let mut blacklist = self.blacklist()?;
        blacklist.insert(version);
        self.write_blacklist(&blacklist)
    }

    /// Remove a version from the blacklist. Errors when the version is not
    /// present.
    pub fn blacklist_remove(&self, version: Version) -> Result<()> {
        let mut blacklist = self.blacklist()?;
        if !blacklist.remove(&version) {
            return Err(anyhow!(
                "version {version} not found in blacklist for module {}",
                self.name
            ));
        }
        self.write_blacklist(&blacklist)
    }

    /// Whole-file replacement write: ascending order, one version per line,
    /// trailing newline iff non-empty.
    fn write_blacklist(&self, blacklist: &BTreeSet<Version>) -> Result<()> {
        let mut content = String::new();
        for version in blacklist {
            content.push_str(&version.to_string());
            content.push('\n');
        }
        fs::write(self.blacklist_path(), content).with_context(|| {
            format!("failed to write blacklist file for module {}", self.name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        fs::create_dir_all(dir.path().join("modules")).unwrap();
        let store = ConfigStore::new(ShemHome::new(dir.path()));
        (dir, store)
    }

    fn add_module(store: &ConfigStore, name: &str) -> ModuleConfig {
        let dir = store.home().module_dir(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("image"), "quay.io/shem/test\n").unwrap();
        store.module(name).unwrap()
    }

    #[test]
    fn get_trims_whitespace() {
        let (_dir, store) = store();
        let config = add_module(&store, "meter");
        config.set("current_version", "  1.2.3\n").unwrap();
        assert_eq!(config.get("current_version").unwrap(), "1.2.3");
    }

    #[test]
    fn get_missing_key_errors_without_default() {
        let (_dir, store) = store();
        let config = add_module(&store, "meter");
        assert!(config.get("nope").is_err());
        assert_eq!(config.get_or("nope", "fallback").unwrap(), "fallback");
        assert_eq!(config.get_opt("nope").unwrap(), None);
    }

    #[test]
    fn typed_getters_parse_and_default() {
        let (_dir, store) = store();
        let config = add_module(&store, "orchestrator");
        assert_eq!(
            config.get_f64_or("UpdateCheckIntervalHours", 22.15).unwrap(),
            22.15
        );
        config.set("UpdateCheckIntervalHours", "4.5").unwrap();
        assert_eq!(
            config.get_f64_or("UpdateCheckIntervalHours", 22.15).unwrap(),
            4.5
        );
        config.set("retries", "7").unwrap();
        assert_eq!(config.get_i64_or("retries", 0).unwrap(), 7);
        config.set("flag", "true").unwrap();
        assert!(config.get_bool_or("flag", false).unwrap());
        config.set("flag", "certainly").unwrap();
        assert!(config.get_bool_or("flag", false).is_err());
    }

    #[test]
    fn empty_value_yields_typed_default() {
        let (_dir, store) = store();
        let config = add_module(&store, "meter");
        config.set("UpdateDelayMaxHours", "\n").unwrap();
        assert_eq!(config.get_f64_or("UpdateDelayMaxHours", 96.0).unwrap(), 96.0);
    }

    #[test]
    fn list_modules_requires_image_file() {
        let (_dir, store) = store();
        add_module(&store, "meter");
        add_module(&store, "battery");
        fs::create_dir_all(store.home().module_dir("incomplete")).unwrap();

        assert_eq!(store.list_modules().unwrap(), vec!["battery", "meter"]);
    }

    #[test]
    fn module_accessor_requires_directory() {
        let (_dir, store) = store();
        assert!(store.module("ghost").is_err());
    }

    #[test]
    fn restart_sentinel_is_consumed() {
        let (_dir, store) = store();
        let config = add_module(&store, "meter");
        assert!(!config.take_restart().unwrap());
        fs::write(config.dir().join("restart"), "").unwrap();
        assert!(config.take_restart().unwrap());
        assert!(!config.dir().join("restart").exists());
    }

    #[test]
    fn blacklist_set_algebra() {
        let (_dir, store) = store();
        let config = add_module(&store, "meter");
        let v = |s: &str| s.parse::<Version>().unwrap();

        assert!(config.blacklist().unwrap().is_empty());

        config.blacklist_add(v("1.2.10")).unwrap();
        config.blacklist_add(v("1.2.2")).unwrap();
        config.blacklist_add(v("1.2.2")).unwrap();
        config.blacklist_remove(v("1.2.10")).unwrap();

        let content = fs::read_to_string(config.dir().join("blacklist")).unwrap();
        assert_eq!(content, "1.2.2\n");
        assert!(config.blacklist_contains(v("1.2.2")).unwrap());
        assert!(!config.blacklist_contains(v("1.2.10")).unwrap());
    }

    #[test]
    fn blacklist_written_in_ascending_version_order() {
        let (_dir, store) = store();
        let config = add_module(&store, "meter");
        let v = |s: &str| s.parse::<Version>().unwrap();

        for version in ["1.2.10", "0.9.1", "1.2.2"] {
            config.blacklist_add(v(version)).unwrap();
        }

        let content = fs::read_to_string(config.dir().join("blacklist")).unwrap();
        assert_eq!(content, "0.9.1\n1.2.2\n1.2.10\n");
    }

    #[test]
    fn blacklist_remove_missing_version_errors() {
        let (_dir, store) = store();
        let config = add_module(&store, "meter");
        assert!(config
            .blacklist_remove("9.9.9".parse().unwrap())
            .is_err());
    }

    #[test]
    fn empty_blacklist_writes_empty_file() {
        let (_dir, store) = store();
        let config = add_module(&store, "meter");
        let v: Version = "0.5.0".parse().unwrap();
        config.blacklist_add(v).unwrap();
        config.blacklist_remove(v).unwrap();
        let content = fs::read_to_string(config.dir().join("blacklist")).unwrap();
        assert_eq!(content, "");
    }
}
