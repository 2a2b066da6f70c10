// src/config.rs - Control server configuration
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main configuration struct for the socket server, firmware link, file roots and interception.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub firmware: FirmwareConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub interception: InterceptionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local socket accepting IPC clients.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SocketConfig {
    #[serde(default = "default_socket_path")]
    pub path: PathBuf,
    #[serde(default = "default_backlog_warning")]
    pub backlog_warning: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            path: default_socket_path(),
            backlog_warning: default_backlog_warning(),
        }
    }
}

/// Firmware link settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirmwareConfig {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_resets")]
    pub max_resets: u32,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            max_resets: default_max_resets(),
        }
    }
}

impl FirmwareConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Roots for virtual path resolution.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesConfig {
    #[serde(default = "default_base_directory")]
    pub base_directory: PathBuf,
    #[serde(default = "default_gcodes_directory")]
    pub gcodes_directory: String,
    #[serde(default = "default_macros_directory")]
    pub macros_directory: String,
    #[serde(default = "default_system_directory")]
    pub system_directory: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
            gcodes_directory: default_gcodes_directory(),
            macros_directory: default_macros_directory(),
            system_directory: default_system_directory(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InterceptionConfig {
    #[serde(default = "default_interception_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for InterceptionConfig {
    fn default() -> Self {
        Self { timeout_ms: default_interception_timeout_ms() }
    }
}

impl InterceptionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl LoggingConfig {
    pub fn max_level(&self) -> Result<tracing::Level, ConfigError> {
        self.level.parse().map_err(|_| ConfigError::Invalid {
            field: "logging.level",
            reason: format!("unknown level '{}'", self.level),
        })
    }
}

impl Config {
    /// Rejects combinations the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.firmware.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "firmware.poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.firmware.max_resets == 0 {
            return Err(ConfigError::Invalid {
                field: "firmware.max_resets",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.logging.max_level()?;
        Ok(())
    }
}

fn default_socket_path() -> PathBuf { PathBuf::from("/run/krusty/control.sock") }
fn default_backlog_warning() -> usize { 32 }
fn default_device() -> String { "/dev/ttyAMA0".to_string() }
fn default_baud() -> u32 { 921_600 }
fn default_poll_interval_ms() -> u64 { 25 }
fn default_max_retries() -> u32 { 3 }
fn default_max_resets() -> u32 { 5 }
fn default_base_directory() -> PathBuf { PathBuf::from("/opt/krusty/sd") }
fn default_gcodes_directory() -> String { "gcodes".to_string() }
fn default_macros_directory() -> String { "macros".to_string() }
fn default_system_directory() -> String { "sys".to_string() }
fn default_interception_timeout_ms() -> u64 { 5000 }
fn default_log_level() -> String { "info".to_string() }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path, e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
