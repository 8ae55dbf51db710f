//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;
use crate::protocol::DeviceAddress;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub write: WriteConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Link addressing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_source_system")]
    pub source_system: u8,

    #[serde(default = "default_source_component")]
    pub source_component: u8,

    #[serde(default = "default_target_system")]
    pub target_system: u8,

    #[serde(default = "default_target_component")]
    pub target_component: u8,

    /// Echoes buffered per waiting operation before it lags
    #[serde(default = "default_echo_buffer")]
    pub echo_buffer: usize,
}

/// Bulk fetch configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,

    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,

    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,

    #[serde(default = "default_prefix_listen_ms")]
    pub prefix_listen_ms: u64,
}

/// Single write configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WriteConfig {
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Relative tolerance for float comparisons
    #[serde(default = "default_value_epsilon")]
    pub value_epsilon: f32,
}

/// Metadata catalog configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MetadataConfig {
    /// Path to an ArduPilot `.pdef.json` file
    #[serde(default)]
    pub catalog_path: Option<String>,

    /// Upper bound on one catalog load (milliseconds)
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write a daily rolling log file here
    #[serde(default)]
    pub dir: Option<String>,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_source_system() -> u8 { 255 }
fn default_source_component() -> u8 { 190 }
fn default_target_system() -> u8 { 1 }
fn default_target_component() -> u8 { 1 }
fn default_echo_buffer() -> usize { 1024 }

fn default_stall_timeout_ms() -> u64 { 5000 }
fn default_overall_timeout_ms() -> u64 { 90000 }
fn default_max_recovery_attempts() -> u32 { 3 }
fn default_prefix_listen_ms() -> u64 { 3000 }

fn default_attempt_timeout_ms() -> u64 { 2000 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_backoff_ms() -> u64 { 250 }
fn default_read_timeout_ms() -> u64 { 1500 }
fn default_value_epsilon() -> f32 { 1e-5 }

fn default_load_timeout_ms() -> u64 { 10000 }

fn default_log_level() -> String { "info".to_string() }
fn default_file_prefix() -> String { "param-sync.log".to_string() }

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            source_system: default_source_system(),
            source_component: default_source_component(),
            target_system: default_target_system(),
            target_component: default_target_component(),
            echo_buffer: default_echo_buffer(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            stall_timeout_ms: default_stall_timeout_ms(),
            overall_timeout_ms: default_overall_timeout_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
            prefix_listen_ms: default_prefix_listen_ms(),
        }
    }
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: default_attempt_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            value_epsilon: default_value_epsilon(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            file_prefix: default_file_prefix(),
        }
    }
}

impl LinkConfig {
    /// This ground station's address
    pub fn source(&self) -> DeviceAddress {
        DeviceAddress::new(self.source_system, self.source_component)
    }

    /// The flight controller's address
    pub fn target(&self) -> DeviceAddress {
        DeviceAddress::new(self.target_system, self.target_component)
    }
}

impl FetchConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.overall_timeout_ms)
    }

    pub fn prefix_listen(&self) -> Duration {
        Duration::from_millis(self.prefix_listen_ms)
    }
}

impl WriteConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            catalog_path: None,
            load_timeout_ms: default_load_timeout_ms(),
        }
    }
}

impl MetadataConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use param_sync::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Link
        if self.link.target_system == 0 {
            return Err(invalid("target_system must be between 1 and 255"));
        }

        if self.link.echo_buffer == 0 || self.link.echo_buffer > 65536 {
            return Err(invalid("echo_buffer must be between 1 and 65536"));
        }

        // Fetch timing
        if self.fetch.stall_timeout_ms < 100 || self.fetch.stall_timeout_ms > 60000 {
            return Err(invalid("stall_timeout_ms must be between 100 and 60000"));
        }

        if self.fetch.overall_timeout_ms < self.fetch.stall_timeout_ms
            || self.fetch.overall_timeout_ms > 600000
        {
            return Err(invalid(
                "overall_timeout_ms must be between stall_timeout_ms and 600000",
            ));
        }

        if self.fetch.max_recovery_attempts > 10 {
            return Err(invalid("max_recovery_attempts must be between 0 and 10"));
        }

        if self.fetch.prefix_listen_ms == 0 || self.fetch.prefix_listen_ms > 60000 {
            return Err(invalid("prefix_listen_ms must be between 1 and 60000"));
        }

        // Write timing
        if self.write.attempt_timeout_ms < 50 || self.write.attempt_timeout_ms > 60000 {
            return Err(invalid("attempt_timeout_ms must be between 50 and 60000"));
        }

        if self.write.max_retries == 0 || self.write.max_retries > 10 {
            return Err(invalid("max_retries must be between 1 and 10"));
        }

        if self.write.retry_backoff_ms > 10000 {
            return Err(invalid("retry_backoff_ms must be at most 10000"));
        }

        if self.write.read_timeout_ms < 50 || self.write.read_timeout_ms > 60000 {
            return Err(invalid("read_timeout_ms must be between 50 and 60000"));
        }

        if !(self.write.value_epsilon > 0.0 && self.write.value_epsilon < 0.1) {
            return Err(invalid("value_epsilon must be greater than 0.0 and below 0.1"));
        }

        // Metadata
        if let Some(path) = &self.metadata.catalog_path {
            if path.is_empty() {
                return Err(invalid("metadata catalog_path cannot be empty when set"));
            }
        }

        if self.metadata.load_timeout_ms < 100 || self.metadata.load_timeout_ms > 120000 {
            return Err(invalid("load_timeout_ms must be between 100 and 120000"));
        }

        // Logging
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(invalid(
                "log level must be one of: trace, debug, info, warn, error",
            ));
        }

        if self.logging.dir.is_some() && self.logging.file_prefix.is_empty() {
            return Err(invalid("file_prefix cannot be empty when logging to a directory"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> crate::error::ParamSyncError {
    crate::error::ParamSyncError::Config(toml::de::Error::custom(message))
}
