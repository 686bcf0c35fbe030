//! Durable store contract for the handoff broker
//!
//! The broker needs exactly four primitives from its store: key/value with
//! TTL, score-ordered queues, counters, and capped lists. This module
//! defines that contract plus the error taxonomy that drives the retry
//! policy; `sqlite` provides the embedded implementation.
//!
//! The contract is deliberately narrow so the backend can be swapped: any
//! store offering atomic key/value with TTL and score-ordered dequeue
//! satisfies it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// Store error taxonomy
///
/// The transport/query split is load-bearing: transport-class failures are
/// retried inside the store, query-class failures short-circuit.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-class failure (connection refused/reset, timeout, pool
    /// exhaustion, lock contention). Retriable.
    #[error("transport error during {operation}: {message}")]
    Transport {
        /// Store operation that failed
        operation: &'static str,
        /// Underlying driver message
        message: String,
    },

    /// Query-class failure (syntax, constraint, precondition). Not
    /// retriable.
    #[error("query error during {operation}: {message}")]
    Query {
        /// Store operation that failed
        operation: &'static str,
        /// Underlying driver message
        message: String,
    },

    /// Transport retries exhausted
    #[error("retries exhausted after {attempts} attempts during {operation}: {message}")]
    RetriesExhausted {
        /// Store operation that failed
        operation: &'static str,
        /// Attempts made including the first
        attempts: u32,
        /// Last underlying driver message
        message: String,
    },
}

impl StoreError {
    /// True when the error was transport-class (including exhaustion of
    /// transport retries)
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::RetriesExhausted { .. }
        )
    }
}

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// A queue member together with its score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    /// Member identifier
    pub member: String,
    /// Ordering score
    pub score: f64,
}

/// One operation inside an atomic batch
///
/// Callers compose a batch and the store executes it in a single
/// transaction; on any failure the whole batch is rolled back, so a queue
/// entry is never observable without its backing record.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Upsert a key with an optional TTL
    Set {
        /// Entry key
        key: String,
        /// Serialized value
        value: String,
        /// Time to live, `None` for no expiry
        ttl: Option<Duration>,
    },
    /// Increment a counter key, creating it at 1 with the given TTL
    Incr {
        /// Counter key
        key: String,
        /// TTL applied on first creation
        ttl: Option<Duration>,
    },
    /// Add a member to a scored queue (upserts the score)
    ZAdd {
        /// Queue name
        queue: String,
        /// Member identifier
        member: String,
        /// Ordering score
        score: f64,
    },
    /// Remove a member from a scored queue
    ZRem {
        /// Queue name
        queue: String,
        /// Member identifier
        member: String,
    },
    /// Delete keys (chunked internally at 100 per statement)
    Del {
        /// Keys to delete
        keys: Vec<String>,
    },
    /// Append to a list, trimming it to the newest `cap` entries
    RPushCapped {
        /// List name
        list: String,
        /// Serialized value
        value: String,
        /// Maximum retained entries
        cap: usize,
    },
}

/// Store health as reported by the background probe
#[derive(Debug, Clone)]
pub struct StoreHealth {
    /// False after three consecutive probe failures
    pub healthy: bool,
    /// Probe failures since the last success
    pub consecutive_failures: u32,
    /// Message of the most recent failure, if any
    pub last_error: Option<String>,
    /// Timestamp of the most recent successful probe
    pub last_successful_ping: Option<DateTime<Utc>>,
}

/// Point-in-time store call metrics
#[derive(Debug, Clone, Default)]
pub struct StoreMetricsSnapshot {
    /// Total store calls
    pub total_requests: u64,
    /// Calls that returned an error
    pub failed_requests: u64,
    /// EMA-smoothed latency in microseconds (alpha 0.1)
    pub avg_latency_us: f64,
    /// Worst observed latency in microseconds
    pub max_latency_us: u64,
    /// Batches executed
    pub batch_count: u64,
    /// Individual operations executed inside batches
    pub batch_op_count: u64,
}

/// Durable store contract (C1)
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads a key, treating expired entries as absent
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Upserts a key with an optional TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Atomically increments a counter, creating it at 1 with the TTL
    ///
    /// Returns the post-increment value. An expired counter restarts at 1.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> StoreResult<i64>;

    /// Deletes keys, returning how many existed
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// Adds a member to a scored queue (upserts the score)
    async fn zadd(&self, queue: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Removes a member from a queue, returning whether it was present
    async fn zrem(&self, queue: &str, member: &str) -> StoreResult<bool>;

    /// Pops the lowest-scored member whose score is at most `max_score`
    ///
    /// Passing the current unix time in seconds implements due-time
    /// dequeue: live priority scores (1..5) always qualify while
    /// future-dated retry scores stay parked until due.
    async fn zpop_min(&self, queue: &str, max_score: f64) -> StoreResult<Option<ScoredMember>>;

    /// Counts members in a queue
    async fn zcard(&self, queue: &str) -> StoreResult<u64>;

    /// Counts members with score at least `min_score`
    async fn zcount_at_least(&self, queue: &str, min_score: f64) -> StoreResult<u64>;

    /// Removes members with score below `max_score`, returning the count
    async fn zrem_below(&self, queue: &str, max_score: f64) -> StoreResult<u64>;

    /// Appends to a list and trims it to the newest `cap` entries
    async fn rpush_capped(&self, list: &str, value: &str, cap: usize) -> StoreResult<()>;

    /// Reads a whole list in insertion order
    async fn lrange_all(&self, list: &str) -> StoreResult<Vec<String>>;

    /// Lists live keys with the given prefix
    ///
    /// Pages internally with a cursor of 100; keys created or deleted
    /// concurrently may be missed. Callers must tolerate that.
    async fn scan(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Lists distinct queue names with the given prefix
    async fn list_queues(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Executes a batch atomically in one transaction
    async fn batch(&self, ops: Vec<BatchOp>) -> StoreResult<()>;

    /// Deletes expired key/value entries, returning the count
    async fn purge_expired(&self) -> StoreResult<u64>;

    /// Current health as seen by the background probe
    fn health(&self) -> StoreHealth;

    /// Current call metrics
    fn metrics(&self) -> StoreMetricsSnapshot;
}
