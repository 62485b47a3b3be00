//! Plugin catalog: which executable backs which plugin name.
//!
//! ```toml
//! [[plugins]]
//! name = "memdb"
//! command = "/usr/local/libexec/dbplugin/memdb-database-plugin"
//! args = []
//! sha256 = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//!
//! [plugins.env]
//! RUST_LOG = "debug"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::errors::{Error, Result};

/// A single registered plugin binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct PluginEntry {
    #[validate(length(min = 1, message = "Plugin name cannot be empty"))]
    pub name: String,

    pub command: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Expected SHA-256 of the binary, lowercase or uppercase hex
    #[serde(default)]
    #[validate(custom(function = "validate_sha256"))]
    pub sha256: Option<String>,
}

impl PluginEntry {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

fn validate_sha256(value: &str) -> std::result::Result<(), ValidationError> {
    if value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("sha256");
        err.message = Some("sha256 must be 64 hex characters".into());
        Err(err)
    }
}

/// The set of plugins a host may launch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginCatalog {
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

impl PluginCatalog {
    pub fn new(plugins: Vec<PluginEntry>) -> Result<Self> {
        let catalog = Self { plugins };
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let catalog: Self = toml::from_str(raw)
            .map_err(|e| Error::config(format!("Invalid plugin catalog: {}", e)))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read plugin catalog {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn get(&self, name: &str) -> Option<&PluginEntry> {
        self.plugins.iter().find(|entry| entry.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|entry| entry.name.as_str())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.plugins {
            entry.validate()?;
            if entry.command.as_os_str().is_empty() {
                return Err(Error::config(format!(
                    "Plugin '{}' has an empty command",
                    entry.name
                )));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(Error::config(format!("Duplicate plugin name '{}'", entry.name)));
            }
        }
        Ok(())
    }
}
