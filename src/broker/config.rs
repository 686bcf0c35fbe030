//! Broker configuration for development and production environments
//!
//! Pre-configured settings optimized for different deployment scenarios,
//! with validation and builder support.

use crate::broker::domain_types::{
    ChannelCapacity, CooldownSecs, MaxRetries, MonitorIntervalMs, PollIntervalMs,
    RetryBackoffFactor, RetryDelayMs, ShutdownTimeoutMs, StaleProcessingSecs,
};
use crate::domain_types::MaxConcurrent;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field failed cross-validation
    #[error("Invalid configuration: {field} - {reason}")]
    ValidationError {
        /// Offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// File read/write failure
    #[error("I/O error: {source}")]
    IoError {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// JSON (de)serialization failure
    #[error("Serialization error: {source}")]
    SerializationError {
        /// Underlying serde error
        #[from]
        source: serde_json::Error,
    },
}

/// Retry classification and scheduling policy
///
/// An error is retriable when its message contains any of the configured
/// substrings (case-insensitive). The delay for attempt `n` (1-based) is
/// `min(initial_delay * n * backoff_factor, max_delay)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry ceiling per handoff
    pub max_retries: MaxRetries,
    /// Base delay before the first retry
    pub initial_delay_ms: RetryDelayMs,
    /// Delay ceiling
    pub max_delay_ms: RetryDelayMs,
    /// Linear-backoff multiplier
    pub backoff_factor: RetryBackoffFactor,
    /// Lowercase substrings that mark a handler error as retriable
    pub retriable_error_substrings: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MaxRetries::default(),
            initial_delay_ms: RetryDelayMs::default(),
            max_delay_ms: RetryDelayMs::try_new(60_000).expect("60s is a valid delay"),
            backoff_factor: RetryBackoffFactor::default(),
            retriable_error_substrings: [
                "connection reset",
                "connection refused",
                "timeout",
                "timed out",
                "temporarily unavailable",
                "broken pipe",
                "unreachable",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// Whether an error message matches the retriable substring set
    #[must_use]
    pub fn is_retriable(&self, error_msg: &str) -> bool {
        let lowered = error_msg.to_ascii_lowercase();
        self.retriable_error_substrings
            .iter()
            .any(|s| lowered.contains(s.as_str()))
    }

    /// Delay before retry attempt `retry_count` (1-based)
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
        let scaled = (self.initial_delay_ms.as_u64() as f64
            * f64::from(retry_count)
            * self.backoff_factor.as_f64()) as u64;
        Duration::from_millis(scaled.min(self.max_delay_ms.as_u64()))
    }
}

/// Complete broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Retry classification and scheduling
    pub retry: RetryPolicy,

    /// Empty-queue sleep between dequeue attempts
    pub poll_interval_ms: PollIntervalMs,
    /// Concurrency for agents registered without an explicit limit
    pub default_max_concurrent: MaxConcurrent,

    /// Monitor collection interval
    pub monitor_interval_ms: MonitorIntervalMs,
    /// Alert subscriber channel capacity
    pub alert_channel_capacity: ChannelCapacity,
    /// Default alert cooldown
    pub alert_cooldown_secs: CooldownSecs,

    /// Bound on graceful-shutdown drain
    pub shutdown_timeout_ms: ShutdownTimeoutMs,
    /// Reconciler threshold for abandoned `processing` handoffs
    pub stale_processing_secs: StaleProcessingSecs,

    /// Store health probe interval
    pub health_probe_interval_ms: MonitorIntervalMs,
}

impl BrokerConfig {
    /// Development settings: fast feedback, frequent probes
    ///
    /// # Panics
    ///
    /// Panics if any hardcoded value is out of range for its domain type
    #[must_use]
    pub fn development() -> Self {
        Self {
            retry: RetryPolicy {
                max_retries: MaxRetries::try_new(2).unwrap(),
                initial_delay_ms: RetryDelayMs::try_new(500).unwrap(),
                max_delay_ms: RetryDelayMs::try_new(10_000).unwrap(),
                backoff_factor: RetryBackoffFactor::try_new(1.5).unwrap(),
                ..RetryPolicy::default()
            },
            poll_interval_ms: PollIntervalMs::default(),
            default_max_concurrent: MaxConcurrent::try_new(2).unwrap(),
            monitor_interval_ms: MonitorIntervalMs::try_new(10_000).unwrap(),
            alert_channel_capacity: ChannelCapacity::default(),
            alert_cooldown_secs: CooldownSecs::try_new(60).unwrap(),
            shutdown_timeout_ms: ShutdownTimeoutMs::try_new(10_000).unwrap(),
            stale_processing_secs: StaleProcessingSecs::try_new(120).unwrap(),
            health_probe_interval_ms: MonitorIntervalMs::try_new(10_000).unwrap(),
        }
    }

    /// Production settings: reliability over feedback speed
    ///
    /// # Panics
    ///
    /// Panics if any hardcoded value is out of range for its domain type
    #[must_use]
    pub fn production() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval_ms: PollIntervalMs::default(),
            default_max_concurrent: MaxConcurrent::default(),
            monitor_interval_ms: MonitorIntervalMs::default(),
            alert_channel_capacity: ChannelCapacity::try_new(256).unwrap(),
            alert_cooldown_secs: CooldownSecs::default(),
            shutdown_timeout_ms: ShutdownTimeoutMs::default(),
            stale_processing_secs: StaleProcessingSecs::default(),
            health_probe_interval_ms: MonitorIntervalMs::default(),
        }
    }

    /// Test settings: minimal delays, tight thresholds
    ///
    /// # Panics
    ///
    /// Panics if any hardcoded value is out of range for its domain type
    #[must_use]
    pub fn testing() -> Self {
        Self {
            retry: RetryPolicy {
                max_retries: MaxRetries::try_new(2).unwrap(),
                initial_delay_ms: RetryDelayMs::try_new(10).unwrap(),
                max_delay_ms: RetryDelayMs::try_new(100).unwrap(),
                backoff_factor: RetryBackoffFactor::try_new(1.0).unwrap(),
                ..RetryPolicy::default()
            },
            poll_interval_ms: PollIntervalMs::try_new(10).unwrap(),
            default_max_concurrent: MaxConcurrent::try_new(1).unwrap(),
            monitor_interval_ms: MonitorIntervalMs::try_new(1000).unwrap(),
            alert_channel_capacity: ChannelCapacity::try_new(8).unwrap(),
            alert_cooldown_secs: CooldownSecs::try_new(1).unwrap(),
            shutdown_timeout_ms: ShutdownTimeoutMs::try_new(2000).unwrap(),
            stale_processing_secs: StaleProcessingSecs::try_new(60).unwrap(),
            health_probe_interval_ms: MonitorIntervalMs::try_new(1000).unwrap(),
        }
    }

    /// Creates a configuration builder
    #[must_use]
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::new()
    }

    /// Validates cross-field consistency
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any values are inconsistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationError {
                field: "retry.initial_delay_ms".to_string(),
                reason: "Must not exceed max_delay_ms".to_string(),
            });
        }

        if self.retry.retriable_error_substrings.is_empty() {
            return Err(ConfigError::ValidationError {
                field: "retry.retriable_error_substrings".to_string(),
                reason: "Must name at least one retriable error class".to_string(),
            });
        }

        let cpu_bound = num_cpus::get() * 4;
        if self.default_max_concurrent.as_usize() > cpu_bound {
            return Err(ConfigError::ValidationError {
                field: "default_max_concurrent".to_string(),
                reason: format!("Should not exceed 4x CPU cores ({cpu_bound})"),
            });
        }

        if self.shutdown_timeout_ms.as_duration() < self.poll_interval_ms.as_duration() {
            return Err(ConfigError::ValidationError {
                field: "shutdown_timeout_ms".to_string(),
                reason: "Must be at least one poll interval".to_string(),
            });
        }

        Ok(())
    }

    /// Saves configuration to a JSON file
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Loads and validates configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns an error if the read, parse, or validation fails
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::development()
    }
}

/// Builder for custom broker configurations
pub struct BrokerConfigBuilder {
    config: BrokerConfig,
}

impl BrokerConfigBuilder {
    /// Creates a builder starting from development defaults
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: BrokerConfig::development(),
        }
    }

    /// Sets the retry policy
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Sets the empty-queue poll interval
    #[must_use]
    pub fn poll_interval_ms(mut self, interval: PollIntervalMs) -> Self {
        self.config.poll_interval_ms = interval;
        self
    }

    /// Sets the default per-agent concurrency
    #[must_use]
    pub fn default_max_concurrent(mut self, limit: MaxConcurrent) -> Self {
        self.config.default_max_concurrent = limit;
        self
    }

    /// Sets the monitor collection interval
    #[must_use]
    pub fn monitor_interval_ms(mut self, interval: MonitorIntervalMs) -> Self {
        self.config.monitor_interval_ms = interval;
        self
    }

    /// Sets the alert cooldown
    #[must_use]
    pub fn alert_cooldown_secs(mut self, cooldown: CooldownSecs) -> Self {
        self.config.alert_cooldown_secs = cooldown;
        self
    }

    /// Sets the graceful-shutdown bound
    #[must_use]
    pub fn shutdown_timeout_ms(mut self, timeout: ShutdownTimeoutMs) -> Self {
        self.config.shutdown_timeout_ms = timeout;
        self
    }

    /// Sets the stale-processing reconciler threshold
    #[must_use]
    pub fn stale_processing_secs(mut self, threshold: StaleProcessingSecs) -> Self {
        self.config.stale_processing_secs = threshold;
        self
    }

    /// Builds and validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if validation fails
    pub fn build(self) -> Result<BrokerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for BrokerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
