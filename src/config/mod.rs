//! Configuration for the thingflow runtime
//!
//! A [`RuntimeConfig`] bundles the settings of every subsystem. It is read
//! from TOML (`.toml`) or JSON (`.json`); every section and field is
//! optional and falls back to its default.
//!
//! # Default Location
//!
//! `<config dir>/thingflow/thingflow.toml`, where the config dir is the
//! platform's (for example `~/.config` on Linux).
//!
//! # Example
//!
//! ```toml
//! [scheduler]
//! worker_thread_prefix = "sensors"
//!
//! [ticks]
//! tick_ms = 20
//!
//! [logging]
//! filter = "warn,thingflow=info"
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory name under the platform config dir
pub const APP_DIR: &str = "thingflow";

/// Default config filename
pub const CONFIG_FILE: &str = "thingflow.toml";

/// Get the default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_DIR).join(CONFIG_FILE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(Format::Toml),
            Some("json") => Ok(Format::Json),
            _ => Err(FlowError::Config(format!(
                "Unsupported config file extension: {}",
                path.display()
            ))),
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub ticks: TickSettings,

    #[serde(default)]
    pub logging: LogSettings,
}

impl RuntimeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| FlowError::Config(format!("Failed to parse config: {}", e)))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| FlowError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load a config file, choosing the format by extension
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = Format::of(path)?;
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        match format {
            Format::Toml => Self::from_toml_str(&content),
            Format::Json => Self::from_json_str(&content),
        }
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Load from [`default_config_path`] if that file exists
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Save to `path`, creating parent directories as needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match Format::of(path)? {
            Format::Toml => toml::to_string_pretty(self)
                .map_err(|e| FlowError::Config(format!("Failed to serialize config: {}", e)))?,
            Format::Json => serde_json::to_string_pretty(self)
                .map_err(|e| FlowError::Config(format!("Failed to serialize config: {}", e)))?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
            .map_err(|e| FlowError::Config(format!("Failed to write {}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = RuntimeConfig::from_toml_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [ticks]
            tick_ms = 20

            [logging]
            filter = "warn"
            "#,
        )
        .unwrap();
        assert_eq!(config.ticks.tick_ms, 20);
        assert_eq!(config.ticks.clock_wrap, DEFAULT_CLOCK_WRAP);
        assert_eq!(config.logging.filter, "warn");
        assert_eq!(config.scheduler, SchedulerSettings::default());
    }

    #[test]
    fn test_save_and_load_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("thingflow.toml");
        let mut config = RuntimeConfig::default();
        config.scheduler.worker_thread_prefix = "sensors".to_string();
        config.logging.directory = Some(dir.path().join("logs"));
        config.save(&path).unwrap();
        assert_eq!(RuntimeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_save_and_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thingflow.json");
        let mut config = RuntimeConfig::default();
        config.scheduler.join_workers_on_exit = false;
        config.save(&path).unwrap();
        assert_eq!(RuntimeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_bad_extension() {
        let err = RuntimeConfig::load("thingflow.yaml").unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load_or_default(dir.path().join("missing.toml"));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn test_invalid_toml() {
        let err = RuntimeConfig::from_toml_str("[ticks]\ntick_ms = \"fast\"").unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
    }
}
