//! Configuration management for sikreg
//!
//! Config files are stored in platform-appropriate locations:
//! - Linux: ~/.config/sikreg/
//! - macOS: ~/Library/Application Support/sikreg/
//! - Windows: %APPDATA%\sikreg\

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::polling::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoDirFound,
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Backend endpoint (client side)
    #[serde(default)]
    pub backend: BackendConfig,

    /// Registration login retries
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Re-login after a dropped stream
    #[serde(default)]
    pub relogin: ReloginConfig,

    /// Test-result polling
    #[serde(default)]
    pub test_result: TestResultConfig,

    /// Credential storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Stub backend (for sikreg-backend)
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL, `/auth.php` and `/check.php` are appended
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_http_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_http_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Login attempts while in GetRtmpUrl (at least 1)
    #[serde(default = "default_login_attempts")]
    pub login_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub login_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloginConfig {
    /// Unset retries until success or cancellation
    pub max_attempts: Option<u32>,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResultConfig {
    /// Total checks, the first included
    #[serde(default = "default_check_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_check_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Credential directory. Defaults to the platform data dir.
    pub dir: Option<PathBuf>,
}

/// Stub backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Stream URLs are `{stream_base_url}/{uuid}`
    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,

    #[serde(default = "default_election")]
    pub election: String,

    /// keyenc handed to clients (base64). Generated at startup if unset.
    pub keyenc: Option<String>,

    /// `/check.php` answers OK from this check onwards, per UDI
    #[serde(default = "default_checks_until_ok")]
    pub checks_until_ok: u32,

    /// When non-empty, other UDIs are refused with "Invalid UDI"
    #[serde(default)]
    pub known_udis: Vec<String>,
}

// Default value functions
fn default_base_url() -> String {
    format!("http://127.0.0.1:{}", crate::DEFAULT_BACKEND_PORT)
}
fn default_http_timeout() -> u64 {
    20
}
fn default_login_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    5000
}
fn default_check_attempts() -> u32 {
    6
}
fn default_check_interval_ms() -> u64 {
    3000
}
fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    crate::DEFAULT_BACKEND_PORT
}
fn default_stream_base_url() -> String {
    "rtmp://127.0.0.1/live".to_string()
}
fn default_election() -> String {
    "Rehearsal".to_string()
}
fn default_checks_until_ok() -> u32 {
    2
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_http_timeout(),
            request_timeout_secs: default_http_timeout(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            login_attempts: default_login_attempts(),
            login_retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for ReloginConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for TestResultConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_check_attempts(),
            interval_ms: default_check_interval_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
            stream_base_url: default_stream_base_url(),
            election: default_election(),
            keyenc: None,
            checks_until_ok: default_checks_until_ok(),
            known_udis: Vec::new(),
        }
    }
}

impl RegistrationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(
            self.login_attempts.max(1),
            Duration::from_millis(self.login_retry_delay_ms),
        )
    }
}

impl ReloginConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.map(|n| n.max(1)),
            interval: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

impl TestResultConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(self.max_attempts.max(1), Duration::from_millis(self.interval_ms))
    }
}

impl Config {
    /// Get config directory path
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|p| p.join("sikreg"))
            .ok_or(ConfigError::NoDirFound)
    }

    /// Get config file path
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load config from specific path
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Credential directory, configured or platform default
    pub fn storage_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage.dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|p| p.join("sikreg"))
                .ok_or(ConfigError::NoDirFound),
        }
    }
}
