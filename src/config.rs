//! Configuration management for the detection serving engine.
//!
//! Configuration is loaded in layers (later sources override earlier):
//! 1. Default config file (config/default.toml)
//! 2. Environment-specific config (config/{RUN_MODE}.toml)
//! 3. Environment variables (prefixed with GRIDWATCH_, `__` separator)
//!
//! The tuning parameters the system is sensitive to — per-camera queue
//! capacity and overflow policy, batch size, collection window, worker count,
//! channel id range — are configuration inputs with documented defaults, not
//! hard-coded constants.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    /// Capture session configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Batch collector / worker pool configuration
    #[serde(default)]
    pub batch: BatchConfig,

    /// Stats aggregator configuration
    #[serde(default)]
    pub stats: StatsConfig,

    /// Control/streaming HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Per-camera capture configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Lowest valid channel id
    #[serde(default = "default_channel_min")]
    pub channel_min: u16,

    /// Highest valid channel id; also bounds concurrent decode threads
    #[serde(default = "default_channel_max")]
    pub channel_max: u16,

    /// Per-camera frame queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bounded timeout for one blocking source read, in milliseconds.
    /// A stop request is observed within one such interval.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,

    /// Maximum attempts to open a stream before the session enters error
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Consecutive read failures tolerated before reconnecting
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Base delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Synthetic source frame width
    #[serde(default = "default_source_width")]
    pub source_width: u32,

    /// Synthetic source frame height
    #[serde(default = "default_source_height")]
    pub source_height: u32,

    /// Synthetic source frame rate
    #[serde(default = "default_source_fps")]
    pub source_fps: f64,
}

/// Batch collector and inference worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Maximum frames per inference batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Collection window in milliseconds; also the collector cadence
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Worker pool size, sized to inference-accelerator parallelism
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum in-flight batches awaiting dispatch before new batches are
    /// skipped for a cycle
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
}

/// Stats aggregator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Publish cadence in milliseconds
    #[serde(default = "default_stats_interval_ms")]
    pub interval_ms: u64,

    /// Broadcast channel capacity for push subscribers
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// Enable the Prometheus metrics exporter
    #[serde(default)]
    pub enable_metrics: bool,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable permissive CORS (for dashboards served from another origin)
    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_channel_min() -> u16 {
    1
}
fn default_channel_max() -> u16 {
    30
}
fn default_queue_capacity() -> usize {
    8
}
fn default_io_timeout_ms() -> u64 {
    500
}
fn default_connect_attempts() -> u32 {
    5
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_reconnect_base_delay_ms() -> u64 {
    250
}
fn default_reconnect_max_delay_ms() -> u64 {
    5000
}
fn default_source_width() -> u32 {
    640
}
fn default_source_height() -> u32 {
    480
}
fn default_source_fps() -> f64 {
    25.0
}
fn default_max_batch_size() -> usize {
    32
}
fn default_window_ms() -> u64 {
    100
}
fn default_workers() -> usize {
    4
}
fn default_max_inflight() -> usize {
    8
}
fn default_stats_interval_ms() -> u64 {
    1000
}
fn default_broadcast_capacity() -> usize {
    16
}
fn default_metrics_port() -> u16 {
    9198
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_cors_enabled() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            channel_min: default_channel_min(),
            channel_max: default_channel_max(),
            queue_capacity: default_queue_capacity(),
            io_timeout_ms: default_io_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            max_consecutive_failures: default_max_consecutive_failures(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            source_width: default_source_width(),
            source_height: default_source_height(),
            source_fps: default_source_fps(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            window_ms: default_window_ms(),
            workers: default_workers(),
            max_inflight: default_max_inflight(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_stats_interval_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            enable_metrics: false,
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: default_cors_enabled(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(
                Environment::with_prefix("GRIDWATCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate cross-field constraints the serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.capture.channel_min == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.channel_min".to_string(),
                message: "channel ids start at 1".to_string(),
            });
        }
        if self.capture.channel_min > self.capture.channel_max {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.channel_min/channel_max".to_string(),
                message: "channel_min must not exceed channel_max".to_string(),
            });
        }
        if self.capture.queue_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.queue_capacity".to_string(),
                message: "queue capacity must be at least 1".to_string(),
            });
        }
        if self.capture.io_timeout_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.io_timeout_ms".to_string(),
                message: "read timeout must be nonzero".to_string(),
            });
        }
        if self.capture.source_fps <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.source_fps".to_string(),
                message: "FPS must be greater than 0".to_string(),
            });
        }
        if self.batch.max_batch_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "batch.max_batch_size".to_string(),
                message: "batch size must be at least 1".to_string(),
            });
        }
        if self.batch.window_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "batch.window_ms".to_string(),
                message: "collection window must be nonzero".to_string(),
            });
        }
        if self.batch.workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "batch.workers".to_string(),
                message: "worker pool needs at least one thread".to_string(),
            });
        }
        if self.stats.interval_ms == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "stats.interval_ms".to_string(),
                message: "publish cadence must be nonzero".to_string(),
            });
        }
        Ok(())
    }
}

impl CaptureConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// Whether a channel id falls inside the configured valid range.
    pub fn channel_in_range(&self, channel: u16) -> bool {
        (self.channel_min..=self.channel_max).contains(&channel)
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl StatsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.channel_min, 1);
        assert_eq!(config.capture.channel_max, 30);
        assert_eq!(config.batch.max_batch_size, 32);
        assert_eq!(config.batch.window_ms, 100);
    }

    #[test]
    fn test_channel_range_check() {
        let config = EngineConfig::default();
        assert!(config.capture.channel_in_range(1));
        assert!(config.capture.channel_in_range(30));
        assert!(!config.capture.channel_in_range(0));
        assert!(!config.capture.channel_in_range(99));
    }

    #[test]
    fn test_zero_channel_min_rejected() {
        let mut config = EngineConfig::default();
        config.capture.channel_min = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_inverted_channel_range_rejected() {
        let mut config = EngineConfig::default();
        config.capture.channel_min = 10;
        config.capture.channel_max = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = EngineConfig::default();
        config.batch.max_batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = EngineConfig::default();
        config.batch.workers = 0;
        assert!(config.validate().is_err());
    }
}
