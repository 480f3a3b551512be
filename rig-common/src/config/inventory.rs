//! TOML host inventory.
//!
//! ```toml
//! [options]
//! trace_limit = 20
//! connect_timeout = "10s"
//!
//! [hosts.web1]
//! platform = "el-9-x86_64"
//! ip = "10.0.0.5"
//!
//! [hosts.win1]
//! platform = "windows-2019-64"
//! is_cygwin = false
//! password = "secret"
//! ```
//!
//! Hosts keep the order they are written in.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use super::{ConfigError, GlobalOptions, HostConfig};

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub options: GlobalOptions,
    hosts: Vec<(String, HostConfig)>,
}

#[derive(Deserialize)]
struct RawInventory {
    #[serde(default)]
    options: GlobalOptions,
    #[serde(default)]
    hosts: toml::Table,
}

impl Inventory {
    pub fn new(options: GlobalOptions) -> Self {
        Self {
            options,
            hosts: Vec::new(),
        }
    }

    /// `~/.config/rig/hosts.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .map(|dir| dir.join("rig").join("hosts.toml"))
            .ok_or(ConfigError::NoHomeDir)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let inventory = Self::parse(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        debug!(path = %path.display(), hosts = inventory.hosts.len(), "loaded inventory");
        Ok(inventory)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let raw: RawInventory = toml::from_str(content).map_err(|e| e.to_string())?;
        let mut hosts = Vec::with_capacity(raw.hosts.len());
        for (name, value) in raw.hosts {
            let config = HostConfig::deserialize(value)
                .map_err(|e| format!("host '{name}': {e}"))?;
            hosts.push((name, config));
        }
        Ok(Self {
            options: raw.options,
            hosts,
        })
    }

    pub fn add_host(&mut self, name: impl Into<String>, config: HostConfig) {
        let name = name.into();
        match self.hosts.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = config,
            None => self.hosts.push((name, config)),
        }
    }

    pub fn hosts(&self) -> impl Iterator<Item = (&str, &HostConfig)> {
        self.hosts.iter().map(|(name, config)| (name.as_str(), config))
    }

    pub fn host(&self, name: &str) -> Option<&HostConfig> {
        self.hosts
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, config)| config)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Named hosts in inventory order; every host when `names` is empty.
    pub fn select(&self, names: &[String]) -> Result<Vec<(String, HostConfig)>, ConfigError> {
        if names.is_empty() {
            return Ok(self.hosts.clone());
        }
        if let Some(missing) = names.iter().find(|n| self.host(n).is_none()) {
            return Err(ConfigError::UnknownHost(missing.clone()));
        }
        Ok(self
            .hosts
            .iter()
            .filter(|(name, _)| names.contains(name))
            .cloned()
            .collect())
    }
}
