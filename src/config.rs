// Configuration - Load settings from config.toml
//
// Provides sensible defaults if the config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub sync: SyncConfig,
    pub debug: DebugConfig,
}

/// Device selection and identity settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
    /// Enable Vulkan validation layers (debug builds only)
    pub validation_layers: bool,
    /// Prefer a discrete GPU over an integrated one
    pub prefer_discrete: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "Renderer Backend".to_string(),
            validation_layers: true,
            prefer_discrete: true,
        }
    }
}

/// Frame pacing settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How many frames' worth of GPU work may be outstanding. Larger values
    /// increase CPU/GPU overlap at the cost of more outstanding memory.
    pub frames_in_flight: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.sync.frames_in_flight, 2);
        assert!(config.device.validation_layers);
        assert!(config.device.prefer_discrete);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            frames_in_flight = 3

            [device]
            app_name = "test app"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.frames_in_flight, 3);
        assert_eq!(config.device.app_name, "test app");
        assert!(config.device.validation_layers);
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sync.frames_in_flight, 2);
        assert!(!config.debug.log_to_file);
    }
}
