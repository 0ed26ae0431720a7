// ABOUTME: Process configuration for dockpool
// Loads broker, Docker and timeout settings from layered TOML files plus environment overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::broker::{BrokerConfig, TimeoutSettings};

/// Environment variable overriding `broker.max_connections`
pub const ENV_MAX_CONNECTIONS: &str = "DOCKPOOL_MAX_CONNECTIONS";

/// Environment variable overriding `timeouts.override_file`
pub const ENV_TIMEOUT_FILE: &str = "DOCKPOOL_TIMEOUT_FILE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Connection broker tunables
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Docker daemon connection
    #[serde(default)]
    pub docker: DockerConfig,

    /// Per-operation timeout policy
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Docker host connection string, tried before `DOCKER_HOST`
    /// Examples:
    /// - unix:///var/run/docker.sock
    /// - tcp://localhost:2376
    /// - npipe:////./pipe/docker_engine
    pub host: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_docker_timeout")]
    pub timeout: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            timeout: default_docker_timeout(),
        }
    }
}

fn default_docker_timeout() -> u64 {
    60
}

impl AppConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_paths(&Self::get_config_paths())?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load and merge the given files; earlier paths take precedence
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Table::new();

        // Lowest precedence first so higher layers overwrite
        for path in paths.iter().rev() {
            if !path.exists() {
                continue;
            }
            let layer = Self::read_layer(path)?;
            debug!(path = %path.display(), "Merging config file");
            merge_tables(&mut merged, layer);
        }

        toml::Value::Table(merged)
            .try_into()
            .context("Failed to build configuration from merged files")
    }

    fn read_layer(path: &Path) -> Result<toml::Table> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        content
            .parse::<toml::Table>()
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Apply `DOCKPOOL_*` overrides read through `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_MAX_CONNECTIONS) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.broker.max_connections = n,
                _ => warn!(value = %raw, "Ignoring invalid {ENV_MAX_CONNECTIONS}"),
            }
        }

        if let Some(path) = lookup(ENV_TIMEOUT_FILE).filter(|p| !p.trim().is_empty()) {
            self.timeouts.override_file = Some(PathBuf::from(path));
        }
    }

    /// Save configuration to the user config file
    pub fn save(&self) -> Result<PathBuf> {
        let config_dir = Self::get_user_config_dir()?;
        fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        Ok(config_path)
    }

    /// Get configuration file paths in order of precedence
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        // 1. Local project config
        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join(".dockpool").join("config.toml"));
        }

        // 2. User config (~/.dockpool/config.toml)
        if let Ok(config_dir) = Self::get_user_config_dir() {
            paths.push(config_dir.join("config.toml"));
        }

        // 3. System config
        paths.push(PathBuf::from("/etc/dockpool/config.toml"));

        paths
    }

    /// Get user configuration directory
    fn get_user_config_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home_dir.join(".dockpool"))
    }
}

/// Recursively overlay `layer` onto `base`; nested tables merge key by key
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
