//! Configuration types and loading for the bus core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{BusSpeed, DEFAULT_SELECTOR_PREFIX};

/// Default configuration file location
pub const DEFAULT_CONFIG_FILE: &str = "/etc/devi2c/devi2c.conf";

/// Default directory scanned for `i2c-N` character devices
pub const DEFAULT_DEV_DIR: &str = "/dev";

/// Default clock-stretch timeout in milliseconds
pub const DEFAULT_CLOCK_STRETCH_TIMEOUT_MS: u64 = 25;

/// Default number of retries used by the caller-side retry helper
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in milliseconds
pub const DEFAULT_RETRY_DELAY_MS: u64 = 10;

/// Configuration for the bus core
///
/// Field names with underscores map to dash-separated keys in YAML
/// (e.g., `dev_dir` <-> `dev-dir`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Directory containing the `i2c-N` bus devices
    #[serde(default = "default_dev_dir")]
    pub dev_dir: PathBuf,

    /// Prefix of the selector strings handed to the managed side
    #[serde(default = "default_selector_prefix")]
    pub selector_prefix: String,

    /// Controller-wide clock-stretch timeout in milliseconds
    ///
    /// Devices may override this in their connection settings
    #[serde(default = "default_clock_stretch_timeout_ms")]
    pub clock_stretch_timeout_ms: u64,

    /// Bus speed used when the host does not specify one
    #[serde(default)]
    pub default_bus_speed: BusSpeed,

    /// Retry attempts for `transmit_with_retry` callers that use the defaults
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

// Default value functions for serde
fn default_dev_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DEV_DIR)
}

fn default_selector_prefix() -> String {
    DEFAULT_SELECTOR_PREFIX.to_string()
}

fn default_clock_stretch_timeout_ms() -> u64 {
    DEFAULT_CLOCK_STRETCH_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev_dir: default_dev_dir(),
            selector_prefix: default_selector_prefix(),
            clock_stretch_timeout_ms: DEFAULT_CLOCK_STRETCH_TIMEOUT_MS,
            default_bus_speed: BusSpeed::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.into(), e))?;

        serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::YamlParse(path.into(), e.to_string()))
    }

    /// Load configuration from a file if it exists, otherwise return defaults
    pub fn from_file_or_default(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clock_stretch_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "clock-stretch-timeout-ms must be positive".to_string(),
            ));
        }
        if self.clock_stretch_timeout_ms > 10_000 {
            return Err(ConfigError::InvalidValue(format!(
                "clock-stretch-timeout-ms {} is too long (expected <= 10000)",
                self.clock_stretch_timeout_ms
            )));
        }

        if self.selector_prefix.is_empty() || !self.selector_prefix.is_ascii() {
            return Err(ConfigError::InvalidValue(
                "selector-prefix must be a non-empty ASCII string".to_string(),
            ));
        }

        if self.max_retries > 10 {
            return Err(ConfigError::InvalidValue(format!(
                "max-retries {} is unusually high (expected 0-10)",
                self.max_retries
            )));
        }

        if self.retry_delay_ms > 1000 {
            return Err(ConfigError::InvalidValue(
                "retry-delay-ms must be <= 1000".to_string(),
            ));
        }

        Ok(())
    }

    /// Merge another Config into this one, overriding fields that differ from the defaults
    ///
    /// Used to layer an override file on top of a base file.
    pub fn merge(&mut self, other: Config) {
        if other.dev_dir != default_dev_dir() {
            self.dev_dir = other.dev_dir;
        }
        if other.selector_prefix != DEFAULT_SELECTOR_PREFIX {
            self.selector_prefix = other.selector_prefix;
        }
        if other.clock_stretch_timeout_ms != DEFAULT_CLOCK_STRETCH_TIMEOUT_MS {
            self.clock_stretch_timeout_ms = other.clock_stretch_timeout_ms;
        }
        if other.default_bus_speed != BusSpeed::default() {
            self.default_bus_speed = other.default_bus_speed;
        }
        if other.max_retries != DEFAULT_MAX_RETRIES {
            self.max_retries = other.max_retries;
        }
        if other.retry_delay_ms != DEFAULT_RETRY_DELAY_MS {
            self.retry_delay_ms = other.retry_delay_ms;
        }
    }

    pub fn clock_stretch_timeout(&self) -> Duration {
        Duration::from_millis(self.clock_stretch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse YAML config file {0}: {1}")]
    YamlParse(PathBuf, String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}
