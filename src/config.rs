//! Configuration for serterm.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.serterm/config.toml`
//! - Defaults for every retention budget, hysteresis band and timing constant
//!
//! # Configuration File
//!
//! ```toml
//! [store]
//! retention_bytes = 100000
//! max_packet_size = 1024
//! max_packet_duration_ms = 2000
//! hysteresis = 1000
//! notify_every = 4
//!
//! [screen]
//! width = 80
//! height = 24
//! retention_chars = 100000
//! hysteresis = 1000
//! drop_unrecognized_ctrl_chars = true
//! sound = true
//!
//! [hex]
//! retention_chars = 100000
//!
//! [ui]
//! publish_interval_ms = 40
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not determine config path")]
    NoHome,
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Packet history settings
    pub store: StoreConfig,
    /// Text screen settings
    pub screen: ScreenConfig,
    /// Hex view settings
    pub hex: HexConfig,
    /// Snapshot publishing settings
    pub ui: UiConfig,
}

/// Packet store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Bytes of history to retain
    pub retention_bytes: usize,
    /// Largest packet the store builds
    pub max_packet_size: usize,
    /// A packet older than this is closed and a new one started
    pub max_packet_duration_ms: u64,
    /// Dead band above the retention budget before trimming starts
    pub hysteresis: usize,
    /// Consecutive appends between two subscriber notifications
    pub notify_every: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention_bytes: 100_000,
            max_packet_size: 1024,
            max_packet_duration_ms: 2000,
            hysteresis: 1000,
            notify_every: 4,
        }
    }
}

impl StoreConfig {
    pub fn max_packet_duration(&self) -> Duration {
        Duration::from_millis(self.max_packet_duration_ms)
    }
}

/// Text screen configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub width: u16,
    pub height: u16,
    /// Characters of scrollback to retain
    pub retention_chars: usize,
    pub hysteresis: usize,
    /// Drop control characters the interpreter does not handle instead of
    /// showing a placeholder glyph
    pub drop_unrecognized_ctrl_chars: bool,
    /// Honor BEL
    pub sound: bool,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
            retention_chars: 100_000,
            hysteresis: 1000,
            drop_unrecognized_ctrl_chars: true,
            sound: true,
        }
    }
}

/// Hex view configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HexConfig {
    pub retention_chars: usize,
    pub hysteresis: usize,
}

impl Default for HexConfig {
    fn default() -> Self {
        Self {
            retention_chars: 100_000,
            hysteresis: 1000,
        }
    }
}

/// Snapshot publishing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    /// Minimum spacing between two published snapshots
    pub publish_interval_ms: u64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 40,
        }
    }
}

impl UiConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
}

impl Config {
    /// Load configuration from the default location, falling back to
    /// defaults when the file is missing or unusable
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_path().ok_or(ConfigError::NoHome)?;
        self.save_to(&path)
    }

    /// Save configuration to `path`, creating its directory
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        tracing::info!("Saved configuration to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.max_packet_size == 0 {
            return Err(ConfigError::Invalid("store.max_packet_size must be > 0".into()));
        }
        if self.store.notify_every == 0 {
            return Err(ConfigError::Invalid("store.notify_every must be > 0".into()));
        }
        if self.screen.width == 0 || self.screen.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "screen size {}x{} is empty",
                self.screen.width, self.screen.height
            )));
        }
        Ok(())
    }

    /// Get config file path
    pub fn config_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".serterm").join("config.toml"))
    }
}

// Get home directory
pub(crate) fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
