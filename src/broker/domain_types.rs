//! Domain types for the broker module
//!
//! Strongly-typed configuration values to prevent primitive obsession in
//! the publish/consume, retry, and monitoring paths.

use nutype::nutype;
use std::time::Duration;

/// Maximum retry attempts for a failed handoff
#[nutype(
    validate(less_or_equal = 10),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 3
)]
pub struct MaxRetries(u32);

impl MaxRetries {
    /// Gets the value as u32
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Retry delay in milliseconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 300_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct RetryDelayMs(u64);

impl RetryDelayMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }

    /// Gets the value as u64
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Multiplier applied to the linear retry delay
#[nutype(
    validate(greater_or_equal = 1.0, less_or_equal = 10.0, finite),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        PartialOrd,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2.0
)]
pub struct RetryBackoffFactor(f64);

impl RetryBackoffFactor {
    /// Gets the value as f64
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        self.into_inner()
    }
}

/// Sleep between dequeue attempts on an empty queue, in milliseconds
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 10_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 100
)]
pub struct PollIntervalMs(u64);

impl PollIntervalMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Monitor collection interval in milliseconds
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct MonitorIntervalMs(u64);

impl MonitorIntervalMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Capacity of alert subscriber channels
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 64
)]
pub struct ChannelCapacity(usize);

impl ChannelCapacity {
    /// Gets the value as usize for use with tokio channels
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Alert cooldown in seconds
#[nutype(
    validate(less_or_equal = 86_400),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 300
)]
pub struct CooldownSecs(u64);

impl CooldownSecs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// Bound on the graceful-shutdown drain, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30_000
)]
pub struct ShutdownTimeoutMs(u64);

impl ShutdownTimeoutMs {
    /// Converts to Duration
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Age past which a `processing` handoff is considered abandoned, in seconds
#[nutype(
    validate(greater_or_equal = 60, less_or_equal = 86_400),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 600
)]
pub struct StaleProcessingSecs(u64);

impl StaleProcessingSecs {
    /// Gets the value in seconds
    #[must_use]
    pub fn as_secs(&self) -> i64 {
        i64::try_from(self.into_inner()).unwrap_or(i64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_use_spec_defaults_when_constructed_default() {
        assert_eq!(MaxRetries::default().as_u32(), 3);
        assert_eq!(RetryDelayMs::default().as_u64(), 1000);
        assert!((RetryBackoffFactor::default().as_f64() - 2.0).abs() < f64::EPSILON);
        assert_eq!(
            PollIntervalMs::default().as_duration(),
            Duration::from_millis(100)
        );
        assert_eq!(
            MonitorIntervalMs::default().as_duration(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_should_reject_values_when_out_of_range() {
        assert!(MaxRetries::try_new(11).is_err());
        assert!(RetryDelayMs::try_new(0).is_err());
        assert!(RetryBackoffFactor::try_new(0.5).is_err());
        assert!(PollIntervalMs::try_new(5).is_err());
    }
}
