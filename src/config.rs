//! Runtime Configuration
//!
//! Handles parsing and management of `resio.toml` configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// File name searched for by [`RuntimeConfig::find_and_load`].
pub const CONFIG_FILE_NAME: &str = "resio.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching resio.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeConfig {
    /// Event loop settings
    #[serde(default)]
    pub event_loop: EventLoopConfig,

    /// Socket settings
    #[serde(default)]
    pub net: NetConfig,

    /// Byte stream settings
    #[serde(default)]
    pub io: IoConfig,

    /// Subprocess settings
    #[serde(default)]
    pub process: ProcessConfig,

    /// Filesystem watch settings
    #[serde(default)]
    pub watch: WatchConfig,
}

impl RuntimeConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                // Reached root without finding config
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.event_loop.max_events == 0 {
            return Err(ConfigError::Invalid("event_loop.max_events must be > 0".into()));
        }
        if self.net.listen_backlog <= 0 {
            return Err(ConfigError::Invalid("net.listen_backlog must be > 0".into()));
        }
        if self.process.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("process.poll_interval_ms must be > 0".into()));
        }
        if self.watch.queue_capacity == 0 {
            return Err(ConfigError::Invalid("watch.queue_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// Event loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventLoopConfig {
    /// Maximum readiness events drained per poll
    #[serde(default = "default_max_events")]
    pub max_events: usize,
}

fn default_max_events() -> usize {
    1024
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
        }
    }
}

/// Socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetConfig {
    /// Backlog passed to listen(2)
    #[serde(default = "default_listen_backlog")]
    pub listen_backlog: i32,

    /// Set SO_REUSEADDR on listeners
    #[serde(default = "default_true")]
    pub reuse_address: bool,
}

fn default_listen_backlog() -> i32 {
    128
}

fn default_true() -> bool {
    true
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen_backlog: default_listen_backlog(),
            reuse_address: true,
        }
    }
}

/// Byte stream settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IoConfig {
    /// Retries before a write that keeps reporting zero bytes fails with WriteZero
    #[serde(default = "default_write_zero_retries")]
    pub write_zero_retries: u32,
}

fn default_write_zero_retries() -> u32 {
    3
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            write_zero_retries: default_write_zero_retries(),
        }
    }
}

/// Subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// Interval between exit status checks while awaiting a child
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    10
}

impl ProcessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Filesystem watch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchConfig {
    /// Events buffered per watch before new ones are dropped
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    4096
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}
