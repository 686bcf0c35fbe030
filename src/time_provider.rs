//! Time abstraction for testable time-dependent operations
//!
//! Retry backoff, empty-queue polling, TTL arithmetic, and the publish
//! timestamp window all depend on "now". Injecting a `TimeProvider` lets
//! tests skip real delays and shift the clock without conditional
//! compilation.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep as tokio_sleep;

/// Trait for providing time-related functionality
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Sleep for the specified duration
    async fn sleep(&self, duration: Duration);

    /// Current wall-clock time in UTC
    #[must_use]
    fn now_utc(&self) -> DateTime<Utc>;

    /// Current instant for measuring elapsed time
    #[must_use]
    fn instant(&self) -> Instant;

    /// Current unix time in whole seconds
    #[must_use]
    fn unix_seconds(&self) -> i64 {
        self.now_utc().timestamp()
    }

    /// Current unix time in nanoseconds
    ///
    /// Used as the FIFO tiebreaker fraction in priority scores.
    #[must_use]
    fn unix_nanos(&self) -> i64 {
        self.now_utc().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

/// Real time provider for production use
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

impl RealTimeProvider {
    /// Creates a new real time provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for RealTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Mock time provider for tests
///
/// Skips sleeps (capping them at 1 ms so tasks still yield) and can shift
/// the reported wall clock by a signed millisecond offset, which is how the
/// timestamp-window and retry-due tests move time without waiting.
#[derive(Debug, Default)]
pub struct MockTimeProvider {
    skip_delays: bool,
    offset_ms: AtomicI64,
}

impl MockTimeProvider {
    /// Creates a mock provider that skips delays
    #[must_use]
    pub fn new() -> Self {
        Self {
            skip_delays: true,
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Creates a mock provider that sleeps for real (integration pacing)
    #[must_use]
    pub fn with_real_delays() -> Self {
        Self {
            skip_delays: false,
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Shifts the reported clock forward (or backward when negative)
    pub fn advance_ms(&self, delta_ms: i64) {
        self.offset_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl TimeProvider for MockTimeProvider {
    async fn sleep(&self, duration: Duration) {
        if !self.skip_delays {
            tokio_sleep(duration).await;
        } else if duration > Duration::from_millis(1) {
            tokio_sleep(Duration::from_millis(1)).await;
        }
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// Type alias for shared time provider
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Create a production time provider
#[must_use]
pub fn production_time_provider() -> SharedTimeProvider {
    Arc::new(RealTimeProvider::new())
}

/// Create a test time provider that skips delays
#[must_use]
pub fn test_time_provider() -> SharedTimeProvider {
    Arc::new(MockTimeProvider::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_should_skip_delays_when_provider_is_mock() {
        let provider = MockTimeProvider::new();
        let start = Instant::now();

        provider.sleep(Duration::from_secs(10)).await;

        assert!(
            start.elapsed() < Duration::from_millis(100),
            "mock sleep took too long"
        );
    }

    #[tokio::test]
    async fn test_should_shift_reported_clock_when_mock_is_advanced() {
        let provider = MockTimeProvider::new();
        let before = provider.now_utc();

        provider.advance_ms(3_600_000);

        let after = provider.now_utc();
        assert!(after - before >= ChronoDuration::minutes(59));
    }

    #[tokio::test]
    async fn test_should_actually_sleep_when_provider_is_real() {
        let provider = RealTimeProvider::new();
        let start = Instant::now();

        provider.sleep(Duration::from_millis(50)).await;

        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
