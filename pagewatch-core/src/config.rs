//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/pagewatch/config.toml`. Every field
//! has a documented default, applied field-by-field per sub-configuration, so a
//! partial file only overrides what it names.
//!
//! Callbacks (error filter, error consumer, performance-data consumer) are not
//! part of this type; they are registered on
//! [`MonitorBuilder`](crate::monitor::MonitorBuilder).
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/pagewatch/` (~/.config/pagewatch/)
//! - State/Logs: `$XDG_STATE_HOME/pagewatch/` (~/.local/state/pagewatch/)

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Verbose logging of pipeline activity
    #[serde(default)]
    pub debug: bool,

    /// Install global fault hooks on start
    #[serde(default = "default_true")]
    pub auto_capture: bool,

    /// Capacity of the capture queue and of the pending delivery list
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Remote collector configuration
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Blank-viewport classifier configuration
    #[serde(default)]
    pub blank_screen: BlankScreenConfig,

    /// Frame sampler configuration
    #[serde(default)]
    pub frame_sampler: FrameSamplerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            auto_capture: true,
            max_queue_size: default_max_queue_size(),
            delivery: DeliveryConfig::default(),
            blank_screen: BlankScreenConfig::default(),
            frame_sampler: FrameSamplerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_queue_size() -> usize {
    100
}

/// Remote collector configuration
///
/// Delivery is only active when an endpoint is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Collector endpoint URL (e.g., `https://collector.example.com/api/errors`)
    pub endpoint: Option<String>,

    /// Bearer token sent with every batch
    pub api_key: Option<String>,

    /// Per-attempt request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum delivery attempts per batch (including the first)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff between attempts
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Quiet period after the last arrival before a batch is flushed
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

impl DeliveryConfig {
    /// Check if delivery is configured
    pub fn is_ready(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Backoff before the next attempt after `attempt` (1-based) has failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = &self.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(Error::Config(format!(
                    "delivery.endpoint must be an http(s) URL, got {:?}",
                    endpoint
                )));
            }
        }
        if self.max_retries == 0 {
            return Err(Error::Config(
                "delivery.max_retries must be at least 1".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config(
                "delivery.timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Blank-viewport classifier configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlankScreenConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Settle delay after document readiness before the first check
    #[serde(default = "default_blank_delay_ms")]
    pub delay_ms: u64,

    /// Number of random points sampled per check
    #[serde(default = "default_sample_count")]
    pub sample_count: u32,

    /// Blank-point ratio at or above which the viewport is blank
    #[serde(default = "default_blank_threshold")]
    pub threshold: f64,

    /// Repeat the scheduled check at this interval
    #[serde(default)]
    pub recheck_interval_ms: Option<u64>,
}

impl Default for BlankScreenConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: default_blank_delay_ms(),
            sample_count: default_sample_count(),
            threshold: default_blank_threshold(),
            recheck_interval_ms: None,
        }
    }
}

fn default_blank_delay_ms() -> u64 {
    3_000
}

fn default_sample_count() -> u32 {
    10
}

fn default_blank_threshold() -> f64 {
    0.8
}

/// Frame sampler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSamplerConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Period of the fps timer and performance-data callback
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    /// Frames longer than this are long
    #[serde(default = "default_long_frame_threshold")]
    pub long_frame_threshold: f64,

    /// Frames longer than this are severe
    #[serde(default = "default_severe_frame_threshold")]
    pub severe_frame_threshold: f64,

    /// Track scroll gestures as sub-sessions
    #[serde(default = "default_true")]
    pub monitor_scroll: bool,

    /// Feed snapshots and scroll sessions into the delivery queue
    #[serde(default)]
    pub auto_report: bool,

    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

impl Default for FrameSamplerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            update_interval_ms: default_update_interval_ms(),
            long_frame_threshold: default_long_frame_threshold(),
            severe_frame_threshold: default_severe_frame_threshold(),
            monitor_scroll: true,
            auto_report: false,
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

fn default_update_interval_ms() -> u64 {
    1_000
}

fn default_long_frame_threshold() -> f64 {
    50.0
}

fn default_severe_frame_threshold() -> f64 {
    100.0
}

fn default_report_interval_ms() -> u64 {
    30_000
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Partial update applied to a running monitor.
///
/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub debug: Option<bool>,
    pub auto_capture: Option<bool>,
    pub max_queue_size: Option<usize>,
    pub delivery: DeliveryPatch,
    pub blank_screen: BlankScreenPatch,
    pub frame_sampler: FrameSamplerPatch,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryPatch {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub flush_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct BlankScreenPatch {
    pub enabled: Option<bool>,
    pub delay_ms: Option<u64>,
    pub sample_count: Option<u32>,
    pub threshold: Option<f64>,
    pub recheck_interval_ms: Option<Option<u64>>,
}

#[derive(Debug, Clone, Default)]
pub struct FrameSamplerPatch {
    pub enabled: Option<bool>,
    pub update_interval_ms: Option<u64>,
    pub long_frame_threshold: Option<f64>,
    pub severe_frame_threshold: Option<f64>,
    pub monitor_scroll: Option<bool>,
    pub auto_report: Option<bool>,
    pub report_interval_ms: Option<u64>,
}

macro_rules! patch_fields {
    ($target:expr, $patch:expr, { $($field:ident),* $(,)? }) => {
        $(
            if let Some(value) = $patch.$field {
                $target.$field = value;
            }
        )*
    };
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate all sub-configurations
    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(Error::Config(
                "max_queue_size must be at least 1".to_string(),
            ));
        }
        self.delivery.validate()?;

        let blank = &self.blank_screen;
        if blank.sample_count == 0 {
            return Err(Error::Config(
                "blank_screen.sample_count must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&blank.threshold) {
            return Err(Error::Config(
                "blank_screen.threshold must be between 0 and 1".to_string(),
            ));
        }

        let sampler = &self.frame_sampler;
        if sampler.update_interval_ms == 0 || sampler.report_interval_ms == 0 {
            return Err(Error::Config(
                "frame_sampler intervals must be greater than 0".to_string(),
            ));
        }
        if sampler.severe_frame_threshold < sampler.long_frame_threshold {
            return Err(Error::Config(
                "frame_sampler.severe_frame_threshold must not be below long_frame_threshold"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Apply a partial update, leaving unspecified fields untouched.
    pub fn apply(&mut self, patch: ConfigPatch) {
        patch_fields!(self, patch, { debug, auto_capture, max_queue_size });

        let delivery = patch.delivery;
        if let Some(endpoint) = delivery.endpoint {
            self.delivery.endpoint = Some(endpoint);
        }
        if let Some(api_key) = delivery.api_key {
            self.delivery.api_key = Some(api_key);
        }
        patch_fields!(self.delivery, delivery, {
            timeout_ms,
            max_retries,
            retry_base_delay_ms,
            flush_interval_ms,
        });

        patch_fields!(self.blank_screen, patch.blank_screen, {
            enabled,
            delay_ms,
            sample_count,
            threshold,
            recheck_interval_ms,
        });

        patch_fields!(self.frame_sampler, patch.frame_sampler, {
            enabled,
            update_interval_ms,
            long_frame_threshold,
            severe_frame_threshold,
            monitor_scroll,
            auto_report,
            report_interval_ms,
        });
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/pagewatch/config.toml` (~/.config/pagewatch/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("pagewatch").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/pagewatch/` (~/.local/state/pagewatch/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("pagewatch")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("pagewatch.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.auto_capture);
        assert!(!config.debug);
        assert_eq!(config.max_queue_size, 100);
        assert!(!config.delivery.is_ready());
        assert_eq!(config.delivery.max_retries, 3);
        assert_eq!(config.blank_screen.sample_count, 10);
        assert_eq!(config.blank_screen.threshold, 0.8);
        assert_eq!(config.frame_sampler.long_frame_threshold, 50.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
max_queue_size = 20

[delivery]
endpoint = "https://collector.example.com/api/errors"
api_key = "pw_live_test"
max_retries = 5

[frame_sampler]
enabled = true
severe_frame_threshold = 120.0

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert_eq!(config.max_queue_size, 20);
        assert!(config.auto_capture);
        assert!(config.delivery.is_ready());
        assert_eq!(config.delivery.max_retries, 5);
        assert_eq!(config.delivery.timeout_ms, 10_000);
        assert!(config.frame_sampler.enabled);
        assert_eq!(config.frame_sampler.severe_frame_threshold, 120.0);
        assert_eq!(config.frame_sampler.long_frame_threshold, 50.0);
        assert!(!config.blank_screen.enabled);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "debug = true\n[blank_screen]\nenabled = true\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.debug);
        assert!(config.blank_screen.enabled);
        assert_eq!(config.blank_screen.delay_ms, 3_000);
    }

    #[test]
    fn test_load_from_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[blank_screen]\nthreshold = 1.5\n").unwrap();

        assert!(matches!(Config::load_from(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_delivery_validation() {
        let mut delivery = DeliveryConfig {
            endpoint: Some("ftp://nope".to_string()),
            ..Default::default()
        };
        assert!(delivery.validate().is_err());

        delivery.endpoint = Some("https://collector.example.com".to_string());
        assert!(delivery.validate().is_ok());

        delivery.max_retries = 0;
        assert!(delivery.validate().is_err());
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let delivery = DeliveryConfig {
            retry_base_delay_ms: 100,
            ..Default::default()
        };
        assert_eq!(delivery.backoff(1), Duration::from_millis(100));
        assert_eq!(delivery.backoff(2), Duration::from_millis(200));
        assert_eq!(delivery.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_apply_patch_keeps_unspecified_fields() {
        let mut config = Config::default();
        config.apply(ConfigPatch {
            max_queue_size: Some(5),
            delivery: DeliveryPatch {
                endpoint: Some("https://collector.example.com".to_string()),
                ..Default::default()
            },
            frame_sampler: FrameSamplerPatch {
                enabled: Some(true),
                ..Default::default()
            },
            ..Default::default()
        });

        assert_eq!(config.max_queue_size, 5);
        assert!(config.delivery.is_ready());
        assert_eq!(config.delivery.max_retries, 3);
        assert!(config.frame_sampler.enabled);
        assert_eq!(config.frame_sampler.update_interval_ms, 1_000);
        assert!(config.auto_capture);
    }
}
