//! Aggregate metrics collection and rule-driven alerting
//!
//! A periodic loop sums queue depths, reads the broker counters and
//! processing-time samples, scores overall system health, snapshots the
//! result (in memory and in the store, 1 h TTL), and evaluates alert
//! rules. Firing alerts fan out to type-filtered bounded subscriber
//! channels; a full channel drops the alert with a warning.

use crate::broker::config::BrokerConfig;
use crate::broker::domain_types::{ChannelCapacity, CooldownSecs};
use crate::handoff::{
    ACTIVE_AGENTS_KEY, ACTIVE_AGENT_PROBATION, METRICS_COMPLETED_KEY, METRICS_FAILED_KEY,
    METRICS_SNAPSHOT_KEY, METRICS_TOTAL_KEY, PROCESSING_TIMES_KEY, QUEUE_KEY_PREFIX, SNAPSHOT_TTL,
};
use crate::store::{Store, StoreError};
use crate::time_provider::SharedTimeProvider;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Monitor failures
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Store failure during collection
    #[error("store failure during {operation}: {source}")]
    Store {
        /// Collection step that failed
        operation: &'static str,
        /// Underlying store error
        #[source]
        source: StoreError,
    },

    /// Snapshot serialization failure
    #[error("snapshot serialization failed: {source}")]
    Serialization {
        /// Underlying serde error
        #[from]
        source: serde_json::Error,
    },
}

/// What an alert rule watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Total queued handoffs across all project queues
    QueueDepth,
    /// Mean processing time in milliseconds
    ProcessingTime,
    /// Failed handoffs as a percentage of total
    FailureRate,
    /// Count of recently active agents
    AgentHealth,
    /// Composite system health score
    SystemHealth,
}

/// Comparison an alert rule applies to its observed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertOperator {
    /// Fire when the value exceeds the threshold
    GreaterThan,
    /// Fire when the value drops below the threshold
    LessThan,
}

/// Alert severity, derived from how far past threshold the value is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Threshold crossed
    Warning,
    /// Well past threshold
    Error,
    /// Far past threshold
    Critical,
}

/// A threshold rule evaluated after each collection pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Rule name for logs and alert payloads
    pub name: String,
    /// Metric the rule watches
    pub alert_type: AlertType,
    /// Comparison operator
    pub operator: AlertOperator,
    /// Threshold value
    pub threshold: f64,
    /// Whether the rule is evaluated
    pub enabled: bool,
    /// Minimum spacing between firings
    pub cooldown: CooldownSecs,
    /// When the rule last fired
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired: Option<DateTime<Utc>>,
}

impl AlertRule {
    /// Creates an enabled rule with the given threshold
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        alert_type: AlertType,
        operator: AlertOperator,
        threshold: f64,
        cooldown: CooldownSecs,
    ) -> Self {
        Self {
            name: name.into(),
            alert_type,
            operator,
            threshold,
            enabled: true,
            cooldown,
            last_fired: None,
        }
    }
}

/// A fired alert delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Name of the rule that fired
    pub rule: String,
    /// Metric the rule watches
    pub alert_type: AlertType,
    /// Observed value
    pub value: f64,
    /// When the alert fired
    pub timestamp: DateTime<Utc>,
    /// Human-readable description
    pub message: String,
    /// Derived severity
    pub severity: AlertSeverity,
}

/// Point-in-time aggregate metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Total queued handoffs across project queues
    pub queue_depth: u64,
    /// Handoffs published
    pub total_handoffs: u64,
    /// Handoffs completed
    pub completed_handoffs: u64,
    /// Handoffs failed terminally
    pub failed_handoffs: u64,
    /// Agents heard from within the probation window
    pub active_agents: u64,
    /// Mean of the retained processing-time samples, in milliseconds
    pub avg_processing_time_ms: f64,
    /// Composite health score, 0-100 (higher is better)
    pub health_score: f64,
    /// When the snapshot was collected
    pub collected_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    /// Failed handoffs as a percentage of total (0 when nothing published)
    #[must_use]
    pub fn failure_rate_percent(&self) -> f64 {
        if self.total_handoffs == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.failed_handoffs as f64 / self.total_handoffs as f64 * 100.0
            }
        }
    }
}

/// Composite health score per the scoring rules
///
/// Start at 100; subtract 0.5 per queued item above 50, twice the failure
/// rate percentage above 5, 0.01 per millisecond of mean processing time
/// above 5000, and 50 when no agent is active; clamp at 0.
#[must_use]
pub fn health_score(
    queue_depth: u64,
    total: u64,
    failure_rate_percent: f64,
    avg_processing_ms: f64,
    active_agents: u64,
) -> f64 {
    let mut score = 100.0;
    if queue_depth > 50 {
        #[allow(clippy::cast_precision_loss)]
        {
            score -= (queue_depth - 50) as f64 * 0.5;
        }
    }
    if total > 0 {
        score -= 2.0 * (failure_rate_percent - 5.0).max(0.0);
    }
    score -= 0.01 * (avg_processing_ms - 5000.0).max(0.0);
    if active_agents == 0 {
        score -= 50.0;
    }
    score.max(0.0)
}

/// Severity bands per alert type
#[must_use]
pub fn severity_for(alert_type: AlertType, value: f64, threshold: f64) -> AlertSeverity {
    match alert_type {
        AlertType::QueueDepth => {
            if value >= threshold * 3.0 {
                AlertSeverity::Critical
            } else if value >= threshold * 2.0 {
                AlertSeverity::Error
            } else {
                AlertSeverity::Warning
            }
        }
        AlertType::FailureRate => {
            if value >= 50.0 {
                AlertSeverity::Critical
            } else if value >= 25.0 {
                AlertSeverity::Error
            } else {
                AlertSeverity::Warning
            }
        }
        AlertType::SystemHealth => {
            if value <= 25.0 {
                AlertSeverity::Critical
            } else if value <= 50.0 {
                AlertSeverity::Error
            } else {
                AlertSeverity::Warning
            }
        }
        AlertType::ProcessingTime | AlertType::AgentHealth => {
            if threshold > 0.0 && value / threshold >= 3.0 {
                AlertSeverity::Critical
            } else if threshold > 0.0 && value / threshold >= 2.0 {
                AlertSeverity::Error
            } else {
                AlertSeverity::Warning
            }
        }
    }
}

type Subscriber = (Option<AlertType>, mpsc::Sender<Alert>);

/// Periodic metrics collector and alert evaluator
pub struct Monitor {
    store: Arc<dyn Store>,
    time: SharedTimeProvider,
    config: BrokerConfig,
    rules: RwLock<Vec<AlertRule>>,
    subscribers: DashMap<u64, Subscriber>,
    next_subscriber_id: AtomicU64,
    snapshot: RwLock<Option<MetricsSnapshot>>,
}

impl Monitor {
    /// Creates a monitor over the given store
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: BrokerConfig, time: SharedTimeProvider) -> Self {
        Self {
            store,
            time,
            config,
            rules: RwLock::new(Vec::new()),
            subscribers: DashMap::new(),
            next_subscriber_id: AtomicU64::new(0),
            snapshot: RwLock::new(None),
        }
    }

    /// Adds an alert rule
    pub fn add_rule(&self, rule: AlertRule) {
        self.rules.write().expect("rules lock poisoned").push(rule);
    }

    /// Subscribes to fired alerts
    ///
    /// `filter` limits delivery to one alert type; `None` receives all.
    /// The channel is bounded; alerts are dropped when it is full.
    pub fn subscribe(&self, filter: Option<AlertType>) -> mpsc::Receiver<Alert> {
        let capacity: ChannelCapacity = self.config.alert_channel_capacity;
        let (tx, rx) = mpsc::channel(capacity.as_usize());
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, (filter, tx));
        rx
    }

    /// Most recent snapshot, if a collection pass has run
    #[must_use]
    pub fn snapshot(&self) -> Option<MetricsSnapshot> {
        self.snapshot
            .read()
            .expect("snapshot lock poisoned")
            .clone()
    }

    async fn read_counter(&self, key: &'static str) -> Result<u64, MonitorError> {
        let raw = self
            .store
            .get(key)
            .await
            .map_err(|e| MonitorError::Store {
                operation: "counters",
                source: e,
            })?;
        Ok(raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0))
    }

    /// Runs one collection pass and returns the snapshot
    ///
    /// # Errors
    ///
    /// Returns a store error when any collection step fails
    pub async fn collect_once(&self) -> Result<MetricsSnapshot, MonitorError> {
        let queues =
            self.store
                .list_queues(QUEUE_KEY_PREFIX)
                .await
                .map_err(|e| MonitorError::Store {
                    operation: "queue_depth",
                    source: e,
                })?;
        let mut queue_depth = 0u64;
        for queue in &queues {
            queue_depth += self
                .store
                .zcard(queue)
                .await
                .map_err(|e| MonitorError::Store {
                    operation: "queue_depth",
                    source: e,
                })?;
        }

        let total_handoffs = self.read_counter(METRICS_TOTAL_KEY).await?;
        let completed_handoffs = self.read_counter(METRICS_COMPLETED_KEY).await?;
        let failed_handoffs = self.read_counter(METRICS_FAILED_KEY).await?;

        let now = self.time.now_utc();
        let probation_floor = now - chrono::Duration::from_std(ACTIVE_AGENT_PROBATION)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        #[allow(clippy::cast_precision_loss)]
        let floor_score = probation_floor.timestamp() as f64;
        self.store
            .zrem_below(ACTIVE_AGENTS_KEY, floor_score)
            .await
            .map_err(|e| MonitorError::Store {
                operation: "active_agents",
                source: e,
            })?;
        let active_agents = self
            .store
            .zcount_at_least(ACTIVE_AGENTS_KEY, floor_score)
            .await
            .map_err(|e| MonitorError::Store {
                operation: "active_agents",
                source: e,
            })?;

        let samples = self
            .store
            .lrange_all(PROCESSING_TIMES_KEY)
            .await
            .map_err(|e| MonitorError::Store {
                operation: "processing_times",
                source: e,
            })?;
        let parsed: Vec<f64> = samples.iter().filter_map(|s| s.parse::<f64>().ok()).collect();
        #[allow(clippy::cast_precision_loss)]
        let avg_processing_time_ms = if parsed.is_empty() {
            0.0
        } else {
            parsed.iter().sum::<f64>() / parsed.len() as f64
        };

        let mut snapshot = MetricsSnapshot {
            queue_depth,
            total_handoffs,
            completed_handoffs,
            failed_handoffs,
            active_agents,
            avg_processing_time_ms,
            health_score: 0.0,
            collected_at: now,
        };
        snapshot.health_score = health_score(
            queue_depth,
            total_handoffs,
            snapshot.failure_rate_percent(),
            avg_processing_time_ms,
            active_agents,
        );

        let serialized = serde_json::to_string(&snapshot)?;
        self.store
            .set(METRICS_SNAPSHOT_KEY, &serialized, Some(SNAPSHOT_TTL))
            .await
            .map_err(|e| MonitorError::Store {
                operation: "snapshot",
                source: e,
            })?;

        *self.snapshot.write().expect("snapshot lock poisoned") = Some(snapshot.clone());
        debug!(
            queue_depth,
            total_handoffs,
            active_agents,
            health = snapshot.health_score,
            "metrics collected"
        );
        Ok(snapshot)
    }

    /// Evaluates alert rules against a snapshot, firing past-cooldown
    /// matches
    pub fn evaluate_alerts(&self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let now = self.time.now_utc();
        let mut fired = Vec::new();

        let mut rules = self.rules.write().expect("rules lock poisoned");
        for rule in rules.iter_mut() {
            if !rule.enabled {
                continue;
            }
            if let Some(last) = rule.last_fired {
                let cooldown = chrono::Duration::from_std(rule.cooldown.as_duration())
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
                if now - last < cooldown {
                    continue;
                }
            }

            #[allow(clippy::cast_precision_loss)]
            let value = match rule.alert_type {
                AlertType::QueueDepth => snapshot.queue_depth as f64,
                AlertType::ProcessingTime => snapshot.avg_processing_time_ms,
                AlertType::FailureRate => snapshot.failure_rate_percent(),
                AlertType::AgentHealth => snapshot.active_agents as f64,
                AlertType::SystemHealth => snapshot.health_score,
            };

            let crossed = match rule.operator {
                AlertOperator::GreaterThan => value > rule.threshold,
                AlertOperator::LessThan => value < rule.threshold,
            };
            if !crossed {
                continue;
            }

            rule.last_fired = Some(now);
            let severity = severity_for(rule.alert_type, value, rule.threshold);
            let alert = Alert {
                rule: rule.name.clone(),
                alert_type: rule.alert_type,
                value,
                timestamp: now,
                message: format!(
                    "{}: observed {value:.2} against threshold {:.2}",
                    rule.name, rule.threshold
                ),
                severity,
            };
            info!(rule = %alert.rule, value, severity = ?severity, "alert fired");
            fired.push(alert);
        }
        drop(rules);

        for alert in &fired {
            self.fan_out(alert);
        }
        fired
    }

    fn fan_out(&self, alert: &Alert) {
        for entry in &self.subscribers {
            let (filter, tx) = entry.value();
            if filter.is_some_and(|t| t != alert.alert_type) {
                continue;
            }
            if let Err(e) = tx.try_send(alert.clone()) {
                warn!(rule = %alert.rule, error = %e, "alert subscriber channel full, dropping");
            }
        }
    }

    /// Spawns the collection loop
    ///
    /// Each tick collects, evaluates alerts, and sweeps expired store
    /// entries. Send `true` on the returned channel to stop.
    pub fn spawn(self: &Arc<Self>) -> (watch::Sender<bool>, JoinHandle<()>) {
        let monitor = Arc::clone(self);
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let interval = monitor.config.monitor_interval_ms.as_duration();
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                match monitor.collect_once().await {
                    Ok(snapshot) => {
                        monitor.evaluate_alerts(&snapshot);
                    }
                    Err(e) => warn!(error = %e, "metrics collection failed"),
                }
                if let Err(e) = monitor.store.purge_expired().await {
                    warn!(error = %e, "expired-entry sweep failed");
                }
                tokio::select! {
                    () = monitor.time.sleep(interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            info!("monitor stopped");
        });
        (stop_tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_score_full_health_when_system_is_idle_with_agents() {
        assert!((health_score(0, 0, 0.0, 0.0, 1) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_should_deduct_half_point_per_item_when_queue_exceeds_fifty() {
        assert!((health_score(60, 0, 0.0, 0.0, 1) - 95.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_should_deduct_for_failure_rate_when_above_five_percent() {
        // 15% failure rate: 2 * (15 - 5) = 20 points.
        assert!((health_score(0, 100, 15.0, 0.0, 1) - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_should_deduct_fifty_when_no_agents_are_active() {
        assert!((health_score(0, 0, 0.0, 0.0, 0) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_should_clamp_score_at_zero_when_everything_is_wrong() {
        let score = health_score(1000, 100, 100.0, 100_000.0, 0);
        assert!((score - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_should_band_queue_depth_severity_when_multiples_of_threshold() {
        assert_eq!(
            severity_for(AlertType::QueueDepth, 51.0, 50.0),
            AlertSeverity::Warning
        );
        assert_eq!(
            severity_for(AlertType::QueueDepth, 100.0, 50.0),
            AlertSeverity::Error
        );
        assert_eq!(
            severity_for(AlertType::QueueDepth, 150.0, 50.0),
            AlertSeverity::Critical
        );
    }

    #[test]
    fn test_should_band_failure_rate_severity_when_crossing_fixed_cutoffs() {
        assert_eq!(
            severity_for(AlertType::FailureRate, 12.0, 10.0),
            AlertSeverity::Warning
        );
        assert_eq!(
            severity_for(AlertType::FailureRate, 30.0, 10.0),
            AlertSeverity::Error
        );
        assert_eq!(
            severity_for(AlertType::FailureRate, 60.0, 10.0),
            AlertSeverity::Critical
        );
    }

    #[test]
    fn test_should_band_system_health_severity_when_score_drops() {
        assert_eq!(
            severity_for(AlertType::SystemHealth, 70.0, 75.0),
            AlertSeverity::Warning
        );
        assert_eq!(
            severity_for(AlertType::SystemHealth, 40.0, 75.0),
            AlertSeverity::Error
        );
        assert_eq!(
            severity_for(AlertType::SystemHealth, 20.0, 75.0),
            AlertSeverity::Critical
        );
    }
}
