//! CLI configuration loading and merging.
//!
//! Configuration precedence:
//! 1. CLI arguments (handled by clap)
//! 2. Local config file (./.nuclearrc)
//! 3. Global config file (~/.nuclear/config.toml)
//! 4. Defaults

use anyhow::{Context, Result};
use nuclear_training::DevicePreference;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default)]
    pub log_level: Option<String>,

    /// Directory the `trained_<model>` folders are created in
    #[serde(default)]
    pub checkpoint_root: Option<PathBuf>,

    /// Directory holding pretrained weights and tokenizers
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    /// Device preference (auto, cpu)
    #[serde(default)]
    pub device: Option<DevicePreference>,
}

impl CliConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse configuration file: {}", path.display()))
    }

    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".nuclear")
            .join("config.toml")
    }

    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".nuclearrc")
    }

    /// Loads the global config, then the local one on top of it.
    ///
    /// Missing files are skipped; a file that exists but does not parse is an
    /// error.
    pub fn discover_and_load() -> Result<Self> {
        let mut config = Self::default();
        for path in [Self::default_global_path(), Self::default_local_path()] {
            if path.is_file() {
                config.merge(&Self::load_from_file(&path)?);
            }
        }
        Ok(config)
    }

    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &Self) {
        if let Some(ref log_level) = other.log_level {
            self.log_level = Some(log_level.clone());
        }
        if let Some(ref root) = other.checkpoint_root {
            self.checkpoint_root = Some(root.clone());
        }
        if let Some(ref dir) = other.models_dir {
            self.models_dir = Some(dir.clone());
        }
        if other.device.is_some() {
            self.device = other.device;
        }
    }
}
