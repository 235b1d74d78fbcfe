//! Configuration management for tealscope
//!
//! Handles loading and validation of `tealscope.toml` configuration files.
//!
//! Resolution order for the file itself:
//! 1. an explicit path (the CLI's `--config`)
//! 2. the `TEALSCOPE_CONFIG` environment variable
//! 3. `<platform config dir>/tealscope/tealscope.toml`, when present
//! 4. built-in defaults
//!
//! `TEALSCOPE_DATA_DIR` overrides `general.data_dir` after loading.

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "TEALSCOPE_CONFIG";

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "TEALSCOPE_DATA_DIR";

/// Upper bound on the number of configured retry delays
pub const MAX_RETRY_DELAYS: usize = 8;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Collector (local HTTP log sink) settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Storage settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Log reordering settings
    #[serde(default)]
    pub reorder: ReorderConfig,

    /// Tab snapshot settings
    #[serde(default)]
    pub snapshots: SnapshotsConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file (appended to)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Data directory path; `None` uses the platform data dir
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
            data_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Collector configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectorConfig {
    /// Collector endpoint receiving JSON POSTs
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Delays between attempts, in milliseconds
    #[serde(default = "default_retry_delays")]
    pub retry_delays_ms: Vec<u64>,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Also forward console log entries to the collector
    #[serde(default)]
    pub forward_console_logs: bool,

    /// Also forward bridge status updates to the collector
    #[serde(default)]
    pub forward_bridge_status: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            retry_delays_ms: default_retry_delays(),
            request_timeout_ms: default_request_timeout(),
            forward_console_logs: false,
            forward_bridge_status: false,
        }
    }
}

impl CollectorConfig {
    /// Retry policy built from `retry_delays_ms`
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(
            self.retry_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_endpoint() -> String {
    "http://localhost:3005/".to_string()
}

fn default_retry_delays() -> Vec<u64> {
    vec![250, 500, 1000]
}

fn default_request_timeout() -> u64 {
    10_000
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Database file path; `None` means `<data_dir>/tealscope.db`
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Eviction starts once usage exceeds this many bytes
    #[serde(default = "default_quota_threshold")]
    pub quota_threshold_bytes: u64,

    /// Eviction stops once usage is at or below this many bytes
    #[serde(default = "default_quota_target")]
    pub quota_target_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            quota_threshold_bytes: default_quota_threshold(),
            quota_target_bytes: default_quota_target(),
        }
    }
}

fn default_quota_threshold() -> u64 {
    7 * 1024 * 1024
}

fn default_quota_target() -> u64 {
    6 * 1024 * 1024
}

/// Reorder buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReorderConfig {
    /// How long a sequence gap may persist before it is skipped
    #[serde(default = "default_gap_timeout")]
    pub gap_timeout_ms: u64,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        Self {
            gap_timeout_ms: default_gap_timeout(),
        }
    }
}

impl ReorderConfig {
    #[must_use]
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }
}

fn default_gap_timeout() -> u64 {
    5_000
}

/// Tab snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotsConfig {
    /// Timeout for a single request to the page context
    #[serde(default = "default_snapshot_timeout")]
    pub request_timeout_ms: u64,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_snapshot_timeout(),
        }
    }
}

impl SnapshotsConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_snapshot_timeout() -> u64 {
    500
}

impl Config {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Load configuration following the documented resolution order
    ///
    /// `env_config` and `env_data_dir` are the values of `TEALSCOPE_CONFIG`
    /// and `TEALSCOPE_DATA_DIR`; the CLI passes them in via clap.
    pub fn resolve(
        explicit: Option<&Path>,
        env_config: Option<&Path>,
        env_data_dir: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = explicit.or(env_config) {
            Self::load_from(path)?
        } else {
            match default_config_path() {
                Some(path) if path.exists() => Self::load_from(&path)?,
                _ => Self::default(),
            }
        };

        if let Some(dir) = env_data_dir {
            config.general.data_dir = Some(dir.to_path_buf());
        }

        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.quota_target_bytes >= self.store.quota_threshold_bytes {
            return Err(ConfigError::ValidationError(format!(
                "store.quota_target_bytes ({}) must be below store.quota_threshold_bytes ({})",
                self.store.quota_target_bytes, self.store.quota_threshold_bytes
            )));
        }
        if self.reorder.gap_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reorder.gap_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.collector.retry_delays_ms.len() > MAX_RETRY_DELAYS {
            return Err(ConfigError::ValidationError(format!(
                "collector.retry_delays_ms has {} entries; at most {MAX_RETRY_DELAYS} allowed",
                self.collector.retry_delays_ms.len()
            )));
        }
        match url::Url::parse(&self.collector.endpoint) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "collector.endpoint `{}` is not an http(s) URL",
                    self.collector.endpoint
                )));
            }
        }
        self.general
            .log_level
            .parse::<crate::logging::LogLevel>()
            .map_err(ConfigError::ValidationError)?;
        Ok(())
    }

    /// Effective data directory
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.general.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("tealscope")
        })
    }

    /// Effective SQLite database path
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.store
            .db_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("tealscope.db"))
    }
}

/// `<platform config dir>/tealscope/tealscope.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tealscope").join("tealscope.toml"))
}
