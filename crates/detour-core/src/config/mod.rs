//! Configuration management for detour
//!
//! Strongly-typed configuration with TOML support. Every section is optional;
//! missing keys take their defaults.

use crate::error::{Error, Result};
use crate::whitelist::Whitelist;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest accepted per-path read buffer
pub const MIN_BUFFER_SIZE: usize = 512;
/// Largest accepted per-path read buffer
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Dial timing and buffering
    pub dial: DialConfig,

    /// Interference detection
    pub detector: DetectorConfig,

    /// Whitelist persistence
    pub whitelist: WhitelistConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.dial.timeout_to_connect_secs == 0 {
            return Err(Error::config_value(
                "dial.timeout_to_connect_secs",
                "Must be greater than 0",
            ));
        }

        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.dial.buffer_size) {
            return Err(Error::config_value(
                "dial.buffer_size",
                format!("Must be between {MIN_BUFFER_SIZE} and {MAX_BUFFER_SIZE}"),
            ));
        }

        let country = &self.detector.country;
        if !country.is_empty()
            && (country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()))
        {
            return Err(Error::config_value(
                "detector.country",
                "Must be empty or a two-letter country code",
            ));
        }

        Ok(())
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Dial timing and buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    /// Overall bound on establishing a connection (seconds)
    pub timeout_to_connect_secs: u64,
    /// Head start given to the direct path before dialing detour (milliseconds)
    pub delay_before_detour_ms: u64,
    /// Per-path read buffer size in bytes
    pub buffer_size: usize,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            timeout_to_connect_secs: 30,
            delay_before_detour_ms: 0,
            buffer_size: 8192,
        }
    }
}

/// Runtime dial settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialSettings {
    /// Overall bound on establishing a connection
    pub timeout_to_connect: Duration,
    /// Head start given to the direct path
    pub delay_before_detour: Duration,
    /// Per-path read buffer size in bytes
    pub buffer_size: usize,
}

impl Default for DialSettings {
    fn default() -> Self {
        DialConfig::default().into()
    }
}

impl From<DialConfig> for DialSettings {
    fn from(config: DialConfig) -> Self {
        Self::from(&config)
    }
}

impl From<&DialConfig> for DialSettings {
    fn from(config: &DialConfig) -> Self {
        Self {
            timeout_to_connect: Duration::from_secs(config.timeout_to_connect_secs),
            delay_before_detour: Duration::from_millis(config.delay_before_detour_ms),
            buffer_size: config.buffer_size,
        }
    }
}

/// Interference detection configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// ISO 3166-1 alpha-2 country code (empty = generic rules)
    pub country: String,
}

/// Whitelist configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistConfig {
    /// Persistence file (None = in-memory only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Additional permanent entries
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<String>,
}

impl WhitelistConfig {
    /// Build the whitelist: load the file if it exists, then add inline entries.
    ///
    /// A missing file is not an error; it is created on the first save.
    pub fn build(&self) -> Result<Whitelist> {
        let whitelist = Whitelist::new();
        if let Some(file) = &self.file {
            if Path::new(file).exists() {
                whitelist.load_file(file)?;
            } else {
                whitelist.set_file(file);
            }
        }
        whitelist.import(&self.entries);
        Ok(whitelist)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log file path (None = stderr only)
    pub file: Option<String>,
    /// Enable JSON format logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json_format: false,
        }
    }
}
