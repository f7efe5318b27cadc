use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::DEFAULT_MAX_MESSAGE_BYTES;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for each send and each receive. 0 disables it.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_rate_hz")]
    pub rate_hz: f64,
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Snapshot endpoint, used in `http` mode.
    pub url: Option<String>,
    #[serde(default = "default_quality")]
    pub quality: u32,
    /// Directory of pre-encoded frames, used in `directory` mode.
    pub directory: Option<PathBuf>,
    #[serde(default = "default_loop_frames")]
    pub loop_frames: bool,
    /// Local video device, used in `device` mode.
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Stop the session after this many seconds. 0 runs until interrupted.
    #[serde(default)]
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            rate_hz: default_rate_hz(),
            mode: default_mode(),
            url: None,
            quality: default_quality(),
            directory: None,
            loop_frames: default_loop_frames(),
            device: default_device(),
            max_consecutive_failures: default_max_consecutive_failures(),
            duration_secs: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_ms > 0).then(|| Duration::from_millis(self.io_timeout_ms))
    }
}

impl CaptureConfig {
    pub fn duration(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.capture.rate_hz.is_finite() && self.capture.rate_hz > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "capture.rate_hz must be a positive number, got {}",
                self.capture.rate_hz
            )));
        }
        if self.server.max_message_bytes == 0 {
            return Err(ConfigError::Invalid(
                "server.max_message_bytes must be non-zero".into(),
            ));
        }
        match self.capture.mode.as_str() {
            "http" if self.capture.url.is_none() => Err(ConfigError::Invalid(
                "capture.url is required in http mode".into(),
            )),
            "directory" if self.capture.directory.is_none() => Err(ConfigError::Invalid(
                "capture.directory is required in directory mode".into(),
            )),
            "device" if self.capture.device.is_empty() => Err(ConfigError::Invalid(
                "capture.device must not be empty in device mode".into(),
            )),
            "http" | "directory" | "device" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "unknown capture mode '{other}', expected 'http', 'directory' or 'device'"
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_io_timeout_ms() -> u64 {
    5_000
}
fn default_max_message_bytes() -> u64 {
    DEFAULT_MAX_MESSAGE_BYTES
}
fn default_rate_hz() -> f64 {
    10.0
}
fn default_mode() -> String {
    "http".into()
}
fn default_quality() -> u32 {
    80
}
fn default_loop_frames() -> bool {
    true
}
fn default_device() -> String {
    "/dev/video0".into()
}
fn default_max_consecutive_failures() -> u32 {
    50
}
fn default_log_level() -> String {
    "info".into()
}
