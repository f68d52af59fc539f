//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchyard_core::{DeliveryDefaults, RegistryMode, RetryPolicy, RouterConfig, StreamOptions};

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchyardConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub streams: StreamConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl SwitchyardConfig {
    /// The router options described by this configuration.
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            registry_mode: self.registry.mode,
            streams: self.streams.to_options(),
            delivery: self.delivery.to_defaults(),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature.
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// File rotation schedule for file output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Include thread ids in log lines.
    #[serde(default)]
    pub thread_ids: bool,

    /// Include file and line of the call site.
    #[serde(default)]
    pub file_location: bool,

    /// Log file, used when `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Rotated files to keep. Zero keeps all of them.
    #[serde(default = "default_max_files")]
    pub max_files: u32,

    /// Per-target overrides, e.g. `switchyard_core = "debug"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            rotation: LogRotation::default(),
            max_files: default_max_files(),
            filters: HashMap::new(),
        }
    }
}

fn default_max_files() -> u32 {
    5
}

// =============================================================================
// Registry & Streams
// =============================================================================

/// Registry configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// `overwrite` (last registration wins) or `strict`.
    #[serde(default)]
    pub mode: RegistryMode,
}

/// Defaults for streams opened by the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Buffered values at which producers are suspended.
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,

    /// Priority of streams whose `stream-start` carries no `priority` header.
    #[serde(default)]
    pub default_priority: u8,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            high_water_mark: default_high_water_mark(),
            default_priority: 0,
        }
    }
}

impl StreamConfig {
    pub fn to_options(&self) -> StreamOptions {
        StreamOptions::default()
            .with_high_water_mark(self.high_water_mark)
            .with_priority(self.default_priority)
    }
}

fn default_high_water_mark() -> usize {
    switchyard_core::stream::DEFAULT_HIGH_WATER_MARK
}

// =============================================================================
// Delivery
// =============================================================================

/// Retry configuration for at-least-once delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for any retry delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Converts to the core retry policy.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Event delivery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Default retry policy for at-least-once handlers without their own.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Default at-most-once deduplication window in milliseconds.
    #[serde(default = "default_deduplication_window_ms")]
    pub deduplication_window_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            deduplication_window_ms: default_deduplication_window_ms(),
        }
    }
}

impl DeliveryConfig {
    pub fn to_defaults(&self) -> DeliveryDefaults {
        DeliveryDefaults {
            retry_policy: self.retry.to_policy(),
            deduplication_window: Duration::from_millis(self.deduplication_window_ms),
        }
    }
}

fn default_deduplication_window_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_core_defaults() {
        let config = SwitchyardConfig::default();
        let router = config.router_config();

        assert_eq!(router.registry_mode, RegistryMode::Overwrite);
        assert_eq!(router.streams, StreamOptions::default());
        assert_eq!(router.delivery, DeliveryDefaults::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SwitchyardConfig = serde_json::from_str(
            r#"{ "registry": { "mode": "strict" }, "delivery": { "retry": { "max_attempts": 7 } } }"#,
        )
        .unwrap();

        assert_eq!(config.registry.mode, RegistryMode::Strict);
        assert_eq!(config.delivery.retry.max_attempts, 7);
        assert_eq!(config.delivery.retry.initial_delay_ms, 1000);
        assert_eq!(config.streams.high_water_mark, 16);
        assert_eq!(config.logging.level, LogLevel::Info);
    }
}
