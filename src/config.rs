//! Configuration management for the registry engine
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (registry.toml)
//! - Environment variables (REGISTRY__*)
//!
//! ## Example config file (registry.toml):
//! ```toml
//! [consistency]
//! iteration_factor = 2
//! force_mode = false
//!
//! [lock]
//! jitter_min_ms = 20
//! jitter_max_ms = 70
//!
//! [sandbox]
//! enabled = true
//!
//! [sync]
//! min_interval_secs = 15
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::consistency::ConsistencyEngine;
use crate::lock::Jitter;
use crate::sandbox::SandboxMode;

/// Main configuration for registries built by this process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consistency engine settings
    #[serde(default)]
    pub consistency: ConsistencyConfig,

    /// Lock coordinator settings
    #[serde(default)]
    pub lock: LockConfig,

    /// Sandbox settings
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Synchronizer settings
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Consistency engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// Pass budget multiplier: handlers * entries * factor
    #[serde(default = "default_iteration_factor")]
    pub iteration_factor: usize,

    /// Initial force mode of new registries
    #[serde(default)]
    pub force_mode: bool,
}

/// Lock retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,

    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Shadow sandbox when true, mock sandbox otherwise
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Synchronizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Minimum time between two syncs; triggers in between are coalesced
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
}

// Default value functions
fn default_iteration_factor() -> usize {
    2
}

fn default_jitter_min_ms() -> u64 {
    20
}

fn default_jitter_max_ms() -> u64 {
    70
}

fn default_true() -> bool {
    true
}

fn default_min_interval_secs() -> u64 {
    15
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            iteration_factor: default_iteration_factor(),
            force_mode: false,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval_secs(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        // Load from default locations
        let config_locations = ["registry.toml", ".registry.toml", "config/registry.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "registry") {
            let xdg_config = config_dir.config_dir().join("registry.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        // Load from specified path
        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (REGISTRY__*)
        builder = builder.add_source(
            Environment::with_prefix("REGISTRY")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn engine(&self) -> ConsistencyEngine {
        ConsistencyEngine::new(self.consistency.iteration_factor)
    }

    /// Lock retry jitter; a reversed range is swapped
    pub fn jitter(&self) -> Jitter {
        Jitter::from_millis(self.lock.jitter_min_ms, self.lock.jitter_max_ms)
    }

    pub fn sandbox_mode(&self) -> SandboxMode {
        if self.sandbox.enabled {
            SandboxMode::Shadow
        } else {
            SandboxMode::Mock
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.min_interval_secs)
    }
}
