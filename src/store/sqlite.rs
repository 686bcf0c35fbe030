//! Embedded SQLite implementation of the store contract
//!
//! Sorted-set dequeue maps to `DELETE ... RETURNING` ordered by score, TTL
//! to an `expires_at_ms` column read lazily and swept periodically, and the
//! pipeline to a single transaction. Transport-class driver errors are
//! retried with bounded exponential backoff; query-class errors
//! short-circuit.

use crate::database::DatabaseConnection;
use crate::store::{
    BatchOp, ScoredMember, Store, StoreError, StoreHealth, StoreMetricsSnapshot, StoreResult,
};
use crate::time_provider::SharedTimeProvider;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, Transaction};
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Chunk size for bulk deletes and scan pages
const CHUNK_SIZE: usize = 100;

/// Consecutive probe failures before the store reports unhealthy
const UNHEALTHY_THRESHOLD: u32 = 3;

/// EMA smoothing factor for average latency
const LATENCY_ALPHA: f64 = 0.1;

/// Transport retry settings
#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Retry ceiling for transport-class errors
    pub max_retries: u32,
    /// First backoff delay
    pub min_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_backoff: Duration::from_millis(8),
            max_backoff: Duration::from_millis(512),
        }
    }
}

#[derive(Debug)]
struct HealthState {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    last_error: Mutex<Option<String>>,
    last_successful_ping: Mutex<Option<DateTime<Utc>>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_error: Mutex::new(None),
            last_successful_ping: Mutex::new(None),
        }
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    avg_latency_us: Mutex<f64>,
    max_latency_us: AtomicU64,
    batch_count: AtomicU64,
    batch_op_count: AtomicU64,
}

impl MetricsState {
    fn record(&self, elapsed_us: u64, ok: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.max_latency_us.fetch_max(elapsed_us, Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let sample = elapsed_us as f64;
        let mut avg = self.avg_latency_us.lock().expect("latency lock poisoned");
        *avg = if *avg == 0.0 {
            sample
        } else {
            LATENCY_ALPHA * sample + (1.0 - LATENCY_ALPHA) * *avg
        };
    }
}

/// SQLite-backed store
pub struct SqliteStore {
    conn: DatabaseConnection,
    time: SharedTimeProvider,
    retry: RetrySettings,
    health: Arc<HealthState>,
    metrics: Arc<MetricsState>,
}

impl SqliteStore {
    /// Creates a store over an initialized database connection
    #[must_use]
    pub fn new(conn: DatabaseConnection, time: SharedTimeProvider) -> Self {
        Self {
            conn,
            time,
            retry: RetrySettings::default(),
            health: Arc::new(HealthState::default()),
            metrics: Arc::new(MetricsState::default()),
        }
    }

    /// Overrides the transport retry settings
    #[must_use]
    pub fn with_retry_settings(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Spawns the background health probe
    ///
    /// The probe issues a round-trip query at `interval`; three consecutive
    /// failures flip the store to unhealthy, any success resets the counter
    /// and records the ping time. Abort the returned handle on shutdown.
    pub fn spawn_health_probe(&self, interval: Duration) -> JoinHandle<()> {
        let conn = self.conn.clone();
        let health = Arc::clone(&self.health);
        let time = Arc::clone(&self.time);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match conn.ping().await {
                    Ok(()) => {
                        health.consecutive_failures.store(0, Ordering::SeqCst);
                        health.healthy.store(true, Ordering::SeqCst);
                        *health
                            .last_successful_ping
                            .lock()
                            .expect("health lock poisoned") = Some(time.now_utc());
                    }
                    Err(e) => {
                        let failures =
                            health.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                        *health.last_error.lock().expect("health lock poisoned") =
                            Some(e.to_string());
                        if failures >= UNHEALTHY_THRESHOLD {
                            health.healthy.store(false, Ordering::SeqCst);
                            warn!(failures, error = %e, "store health probe failing");
                        }
                    }
                }
            }
        })
    }

    fn now_ms(&self) -> i64 {
        self.time.now_utc().timestamp_millis()
    }

    /// True for transport-class driver errors worth retrying
    fn is_transport_error(e: &sqlx::Error) -> bool {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => {
                let msg = db.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy")
            }
            _ => false,
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let started = self.time.instant();
        let mut attempt: u32 = 0;
        let result = loop {
            match f().await {
                Ok(v) => break Ok(v),
                Err(e) if Self::is_transport_error(&e) => {
                    if attempt >= self.retry.max_retries {
                        break Err(StoreError::RetriesExhausted {
                            operation,
                            attempts: attempt + 1,
                            message: e.to_string(),
                        });
                    }
                    let backoff = self
                        .retry
                        .min_backoff
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(self.retry.max_backoff);
                    debug!(operation, attempt, ?backoff, error = %e, "retrying store call");
                    self.time.sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    break Err(StoreError::Query {
                        operation,
                        message: e.to_string(),
                    });
                }
            }
        };
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.metrics.record(elapsed_us, result.is_ok());
        result
    }

    /// Escapes LIKE wildcards so a prefix matches literally
    fn escape_like(prefix: &str) -> String {
        let mut out = String::with_capacity(prefix.len() + 1);
        for c in prefix.chars() {
            if c == '%' || c == '_' || c == '\\' {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('%');
        out
    }

    async fn apply_op(
        tx: &mut Transaction<'_, Sqlite>,
        op: &BatchOp,
        now_ms: i64,
    ) -> Result<u64, sqlx::Error> {
        match op {
            BatchOp::Set { key, value, ttl } => {
                let expires = ttl.map(|t| now_ms + i64::try_from(t.as_millis()).unwrap_or(i64::MAX));
                sqlx::query(
                    "INSERT INTO kv_entries (key, value, expires_at_ms) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                     expires_at_ms = excluded.expires_at_ms",
                )
                .bind(key)
                .bind(value)
                .bind(expires)
                .execute(&mut **tx)
                .await?;
                Ok(1)
            }
            BatchOp::Incr { key, ttl } => {
                let expires = ttl.map(|t| now_ms + i64::try_from(t.as_millis()).unwrap_or(i64::MAX));
                sqlx::query(INCR_SQL)
                    .bind(key)
                    .bind(expires)
                    .bind(now_ms)
                    .fetch_one(&mut **tx)
                    .await?;
                Ok(1)
            }
            BatchOp::ZAdd {
                queue,
                member,
                score,
            } => {
                sqlx::query(
                    "INSERT INTO queue_entries (queue, member, score) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(queue, member) DO UPDATE SET score = excluded.score",
                )
                .bind(queue)
                .bind(member)
                .bind(score)
                .execute(&mut **tx)
                .await?;
                Ok(1)
            }
            BatchOp::ZRem { queue, member } => {
                sqlx::query("DELETE FROM queue_entries WHERE queue = ?1 AND member = ?2")
                    .bind(queue)
                    .bind(member)
                    .execute(&mut **tx)
                    .await?;
                Ok(1)
            }
            BatchOp::Del { keys } => {
                let mut count = 0u64;
                for chunk in keys.chunks(CHUNK_SIZE) {
                    let placeholders = (1..=chunk.len())
                        .map(|i| format!("?{i}"))
                        .collect::<Vec<_>>()
                        .join(", ");
                    let sql = format!("DELETE FROM kv_entries WHERE key IN ({placeholders})");
                    let mut query = sqlx::query(&sql);
                    for key in chunk {
                        query = query.bind(key);
                    }
                    query.execute(&mut **tx).await?;
                    count += 1;
                }
                Ok(count)
            }
            BatchOp::RPushCapped { list, value, cap } => {
                sqlx::query("INSERT INTO list_entries (list, value) VALUES (?1, ?2)")
                    .bind(list)
                    .bind(value)
                    .execute(&mut **tx)
                    .await?;
                let cap = i64::try_from(*cap).unwrap_or(i64::MAX);
                sqlx::query(
                    "DELETE FROM list_entries WHERE list = ?1 AND id NOT IN \
                     (SELECT id FROM list_entries WHERE list = ?1 ORDER BY id DESC LIMIT ?2)",
                )
                .bind(list)
                .bind(cap)
                .execute(&mut **tx)
                .await?;
                Ok(2)
            }
        }
    }

    async fn run_batch(&self, ops: &[BatchOp]) -> Result<u64, sqlx::Error> {
        let now_ms = self.now_ms();
        let mut tx = self.conn.pool().begin().await?;
        let mut op_count = 0u64;
        for op in ops {
            op_count += Self::apply_op(&mut tx, op, now_ms).await?;
        }
        tx.commit().await?;
        Ok(op_count)
    }

    async fn run_scan(&self, prefix: &str) -> Result<Vec<String>, sqlx::Error> {
        let pattern = Self::escape_like(prefix);
        let now_ms = self.now_ms();
        let mut keys = Vec::new();
        let mut cursor = String::new();
        loop {
            let limit = i64::try_from(CHUNK_SIZE).expect("chunk size fits i64");
            let rows = sqlx::query(
                "SELECT key FROM kv_entries \
                 WHERE key LIKE ?1 ESCAPE '\\' AND key > ?2 \
                 AND (expires_at_ms IS NULL OR expires_at_ms > ?3) \
                 ORDER BY key LIMIT ?4",
            )
            .bind(&pattern)
            .bind(&cursor)
            .bind(now_ms)
            .bind(limit)
            .fetch_all(self.conn.pool())
            .await?;
            let page: Vec<String> = rows.iter().map(|r| r.get::<String, _>(0)).collect();
            let page_len = page.len();
            if let Some(last) = page.last() {
                cursor.clone_from(last);
            }
            keys.extend(page);
            if page_len < CHUNK_SIZE {
                break;
            }
        }
        Ok(keys)
    }
}

const INCR_SQL: &str = "INSERT INTO kv_entries (key, value, expires_at_ms) VALUES (?1, '1', ?2) \
     ON CONFLICT(key) DO UPDATE SET \
     value = CASE \
         WHEN kv_entries.expires_at_ms IS NOT NULL AND kv_entries.expires_at_ms <= ?3 THEN '1' \
         ELSE CAST(CAST(kv_entries.value AS INTEGER) + 1 AS TEXT) \
     END, \
     expires_at_ms = CASE \
         WHEN kv_entries.expires_at_ms IS NOT NULL AND kv_entries.expires_at_ms <= ?3 \
             THEN excluded.expires_at_ms \
         ELSE kv_entries.expires_at_ms \
     END \
     RETURNING CAST(value AS INTEGER)";

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let pool = self.conn.pool();
        let now_ms = self.now_ms();
        self.with_retry("get", || async move {
            let row = sqlx::query(
                "SELECT value FROM kv_entries WHERE key = ?1 \
                 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
            )
            .bind(key)
            .bind(now_ms)
            .fetch_optional(pool)
            .await?;
            Ok(row.map(|r| r.get::<String, _>(0)))
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let pool = self.conn.pool();
        let expires =
            ttl.map(|t| self.now_ms() + i64::try_from(t.as_millis()).unwrap_or(i64::MAX));
        self.with_retry("set", || async move {
            sqlx::query(
                "INSERT INTO kv_entries (key, value, expires_at_ms) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, \
                 expires_at_ms = excluded.expires_at_ms",
            )
            .bind(key)
            .bind(value)
            .bind(expires)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> StoreResult<i64> {
        let pool = self.conn.pool();
        let now_ms = self.now_ms();
        let expires = ttl.map(|t| now_ms + i64::try_from(t.as_millis()).unwrap_or(i64::MAX));
        self.with_retry("incr", || async move {
            let row = sqlx::query(INCR_SQL)
                .bind(key)
                .bind(expires)
                .bind(now_ms)
                .fetch_one(pool)
                .await?;
            Ok(row.get::<i64, _>(0))
        })
        .await
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let pool = self.conn.pool();
        self.with_retry("del", || async move {
            let mut deleted = 0u64;
            for chunk in keys.chunks(CHUNK_SIZE) {
                let placeholders = (1..=chunk.len())
                    .map(|i| format!("?{i}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!("DELETE FROM kv_entries WHERE key IN ({placeholders})");
                let mut query = sqlx::query(&sql);
                for key in chunk {
                    query = query.bind(key);
                }
                deleted += query.execute(pool).await?.rows_affected();
            }
            Ok(deleted)
        })
        .await
    }

    async fn zadd(&self, queue: &str, member: &str, score: f64) -> StoreResult<()> {
        let pool = self.conn.pool();
        self.with_retry("zadd", || async move {
            sqlx::query(
                "INSERT INTO queue_entries (queue, member, score) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(queue, member) DO UPDATE SET score = excluded.score",
            )
            .bind(queue)
            .bind(member)
            .bind(score)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn zrem(&self, queue: &str, member: &str) -> StoreResult<bool> {
        let pool = self.conn.pool();
        self.with_retry("zrem", || async move {
            let result = sqlx::query("DELETE FROM queue_entries WHERE queue = ?1 AND member = ?2")
                .bind(queue)
                .bind(member)
                .execute(pool)
                .await?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn zpop_min(&self, queue: &str, max_score: f64) -> StoreResult<Option<ScoredMember>> {
        let pool = self.conn.pool();
        self.with_retry("zpop_min", || async move {
            let row = sqlx::query(
                "DELETE FROM queue_entries WHERE rowid = ( \
                     SELECT rowid FROM queue_entries \
                     WHERE queue = ?1 AND score <= ?2 \
                     ORDER BY score ASC, rowid ASC LIMIT 1 \
                 ) RETURNING member, score",
            )
            .bind(queue)
            .bind(max_score)
            .fetch_optional(pool)
            .await?;
            Ok(row.map(|r| ScoredMember {
                member: r.get::<String, _>(0),
                score: r.get::<f64, _>(1),
            }))
        })
        .await
    }

    async fn zcard(&self, queue: &str) -> StoreResult<u64> {
        let pool = self.conn.pool();
        self.with_retry("zcard", || async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries WHERE queue = ?1")
                    .bind(queue)
                    .fetch_one(pool)
                    .await?;
            Ok(count.unsigned_abs())
        })
        .await
    }

    async fn zcount_at_least(&self, queue: &str, min_score: f64) -> StoreResult<u64> {
        let pool = self.conn.pool();
        self.with_retry("zcount_at_least", || async move {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM queue_entries WHERE queue = ?1 AND score >= ?2",
            )
            .bind(queue)
            .bind(min_score)
            .fetch_one(pool)
            .await?;
            Ok(count.unsigned_abs())
        })
        .await
    }

    async fn zrem_below(&self, queue: &str, max_score: f64) -> StoreResult<u64> {
        let pool = self.conn.pool();
        self.with_retry("zrem_below", || async move {
            let result =
                sqlx::query("DELETE FROM queue_entries WHERE queue = ?1 AND score < ?2")
                    .bind(queue)
                    .bind(max_score)
                    .execute(pool)
                    .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn rpush_capped(&self, list: &str, value: &str, cap: usize) -> StoreResult<()> {
        let op = BatchOp::RPushCapped {
            list: list.to_string(),
            value: value.to_string(),
            cap,
        };
        self.with_retry("rpush_capped", || {
            let op = op.clone();
            async move { self.run_batch(std::slice::from_ref(&op)).await.map(|_| ()) }
        })
        .await
    }

    async fn lrange_all(&self, list: &str) -> StoreResult<Vec<String>> {
        let pool = self.conn.pool();
        self.with_retry("lrange_all", || async move {
            let rows =
                sqlx::query("SELECT value FROM list_entries WHERE list = ?1 ORDER BY id ASC")
                    .bind(list)
                    .fetch_all(pool)
                    .await?;
            Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
        })
        .await
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.with_retry("scan", || self.run_scan(prefix)).await
    }

    async fn list_queues(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let pool = self.conn.pool();
        let pattern = Self::escape_like(prefix);
        self.with_retry("list_queues", || {
            let pattern = pattern.clone();
            async move {
                let rows = sqlx::query(
                    "SELECT DISTINCT queue FROM queue_entries \
                     WHERE queue LIKE ?1 ESCAPE '\\' ORDER BY queue",
                )
                .bind(&pattern)
                .fetch_all(pool)
                .await?;
                Ok(rows.iter().map(|r| r.get::<String, _>(0)).collect())
            }
        })
        .await
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> StoreResult<()> {
        let op_count = self.with_retry("batch", || self.run_batch(&ops)).await?;
        self.metrics.batch_count.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .batch_op_count
            .fetch_add(op_count, Ordering::Relaxed);
        Ok(())
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let pool = self.conn.pool();
        let now_ms = self.now_ms();
        self.with_retry("purge_expired", || async move {
            let result = sqlx::query(
                "DELETE FROM kv_entries \
                 WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            )
            .bind(now_ms)
            .execute(pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    fn health(&self) -> StoreHealth {
        StoreHealth {
            healthy: self.health.healthy.load(Ordering::SeqCst),
            consecutive_failures: self.health.consecutive_failures.load(Ordering::SeqCst),
            last_error: self
                .health
                .last_error
                .lock()
                .expect("health lock poisoned")
                .clone(),
            last_successful_ping: *self
                .health
                .last_successful_ping
                .lock()
                .expect("health lock poisoned"),
        }
    }

    fn metrics(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            total_requests: self.metrics.total_requests.load(Ordering::Relaxed),
            failed_requests: self.metrics.failed_requests.load(Ordering::Relaxed),
            avg_latency_us: *self
                .metrics
                .avg_latency_us
                .lock()
                .expect("latency lock poisoned"),
            max_latency_us: self.metrics.max_latency_us.load(Ordering::Relaxed),
            batch_count: self.metrics.batch_count.load(Ordering::Relaxed),
            batch_op_count: self.metrics.batch_op_count.load(Ordering::Relaxed),
        }
    }
}
