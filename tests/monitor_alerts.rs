//! Monitor collection and alert-firing scenarios

use handoff::broker::domain_types::CooldownSecs;
use handoff::broker::monitor::{
    AlertOperator, AlertRule, AlertSeverity, AlertType, Monitor,
};
use handoff::broker::BrokerConfig;
use handoff::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use handoff::handoff::{
    ACTIVE_AGENTS_KEY, METRICS_FAILED_KEY, METRICS_SNAPSHOT_KEY, METRICS_TOTAL_KEY,
    PROCESSING_TIMES_KEY, queue_key,
};
use handoff::store::{SqliteStore, Store};
use handoff::time_provider::{MockTimeProvider, TimeProvider};
use std::sync::Arc;
use tempfile::TempDir;

async fn scratch_monitor() -> (TempDir, Arc<MockTimeProvider>, Arc<dyn Store>, Monitor) {
    let dir = TempDir::new().expect("temp dir");
    let path = DatabasePath::new(dir.path().join("monitor.db")).expect("db path");
    let conn = DatabaseConnection::initialize(DatabaseConfig::for_testing(path))
        .await
        .expect("db init");
    let time = Arc::new(MockTimeProvider::new());
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(conn, time.clone()));
    let monitor = Monitor::new(Arc::clone(&store), BrokerConfig::testing(), time.clone());
    (dir, time, store, monitor)
}

#[allow(clippy::cast_precision_loss)]
async fn enqueue_items(store: &Arc<dyn Store>, queue: &str, count: usize) {
    for i in 0..count {
        store
            .zadd(queue, &format!("member-{i}"), 3.0 + i as f64 / 1e6)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_should_fire_single_warning_when_queue_depth_crosses_threshold() {
    // S6: 51 pending items against a >50 rule fires once per cooldown
    // window with severity warning.
    let (_dir, _time, store, monitor) = scratch_monitor().await;
    enqueue_items(&store, &queue_key("demo", "golang-expert"), 51).await;
    monitor.add_rule(AlertRule::new(
        "queue-backlog",
        AlertType::QueueDepth,
        AlertOperator::GreaterThan,
        50.0,
        CooldownSecs::try_new(300).unwrap(),
    ));
    let mut alerts = monitor.subscribe(Some(AlertType::QueueDepth));

    let snapshot = monitor.collect_once().await.unwrap();
    assert_eq!(snapshot.queue_depth, 51);

    let fired = monitor.evaluate_alerts(&snapshot);
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].severity, AlertSeverity::Warning);

    let delivered = alerts.try_recv().unwrap();
    assert_eq!(delivered.rule, "queue-backlog");

    // Within cooldown: silent.
    assert!(monitor.evaluate_alerts(&snapshot).is_empty());
    assert!(alerts.try_recv().is_err());
}

#[tokio::test]
async fn test_should_fire_again_when_cooldown_has_elapsed() {
    let (_dir, time, store, monitor) = scratch_monitor().await;
    enqueue_items(&store, &queue_key("demo", "golang-expert"), 51).await;
    monitor.add_rule(AlertRule::new(
        "queue-backlog",
        AlertType::QueueDepth,
        AlertOperator::GreaterThan,
        50.0,
        CooldownSecs::try_new(60).unwrap(),
    ));

    let snapshot = monitor.collect_once().await.unwrap();
    assert_eq!(monitor.evaluate_alerts(&snapshot).len(), 1);
    assert!(monitor.evaluate_alerts(&snapshot).is_empty());

    time.advance_ms(61_000);
    assert_eq!(monitor.evaluate_alerts(&snapshot).len(), 1);
}

#[tokio::test]
async fn test_should_skip_rule_when_disabled() {
    let (_dir, _time, store, monitor) = scratch_monitor().await;
    enqueue_items(&store, &queue_key("demo", "golang-expert"), 51).await;
    let mut rule = AlertRule::new(
        "queue-backlog",
        AlertType::QueueDepth,
        AlertOperator::GreaterThan,
        50.0,
        CooldownSecs::try_new(60).unwrap(),
    );
    rule.enabled = false;
    monitor.add_rule(rule);

    let snapshot = monitor.collect_once().await.unwrap();
    assert!(monitor.evaluate_alerts(&snapshot).is_empty());
}

#[tokio::test]
async fn test_should_aggregate_counters_and_times_when_collecting() {
    let (_dir, time, store, monitor) = scratch_monitor().await;

    for _ in 0..10 {
        store.incr(METRICS_TOTAL_KEY, None).await.unwrap();
    }
    store.incr(METRICS_FAILED_KEY, None).await.unwrap();
    for sample in ["100", "200", "300"] {
        store
            .rpush_capped(PROCESSING_TIMES_KEY, sample, 100)
            .await
            .unwrap();
    }
    #[allow(clippy::cast_precision_loss)]
    let now_score = time.unix_seconds() as f64;
    store
        .zadd(ACTIVE_AGENTS_KEY, "golang-expert", now_score)
        .await
        .unwrap();

    let snapshot = monitor.collect_once().await.unwrap();

    assert_eq!(snapshot.total_handoffs, 10);
    assert_eq!(snapshot.failed_handoffs, 1);
    assert_eq!(snapshot.active_agents, 1);
    assert!((snapshot.avg_processing_time_ms - 200.0).abs() < f64::EPSILON);
    assert!((snapshot.failure_rate_percent() - 10.0).abs() < f64::EPSILON);
    // 10% failure rate: 100 - 2 * (10 - 5) = 90.
    assert!((snapshot.health_score - 90.0).abs() < f64::EPSILON);

    // Snapshot persisted for the admin surface.
    assert!(store.get(METRICS_SNAPSHOT_KEY).await.unwrap().is_some());
    assert!(monitor.snapshot().is_some());
}

#[tokio::test]
async fn test_should_prune_agent_membership_when_probation_elapses() {
    let (_dir, time, store, monitor) = scratch_monitor().await;
    #[allow(clippy::cast_precision_loss)]
    let now_score = time.unix_seconds() as f64;
    store
        .zadd(ACTIVE_AGENTS_KEY, "golang-expert", now_score)
        .await
        .unwrap();

    let snapshot = monitor.collect_once().await.unwrap();
    assert_eq!(snapshot.active_agents, 1);

    // Past the 5-minute probation the agent no longer counts (and the
    // health score drops by the no-active-agents penalty).
    time.advance_ms(6 * 60 * 1000);
    let snapshot = monitor.collect_once().await.unwrap();
    assert_eq!(snapshot.active_agents, 0);
    assert!((snapshot.health_score - 50.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_should_deliver_to_all_subscriber_when_filter_is_none() {
    let (_dir, _time, store, monitor) = scratch_monitor().await;
    enqueue_items(&store, &queue_key("demo", "golang-expert"), 51).await;
    monitor.add_rule(AlertRule::new(
        "queue-backlog",
        AlertType::QueueDepth,
        AlertOperator::GreaterThan,
        50.0,
        CooldownSecs::try_new(60).unwrap(),
    ));
    let mut all = monitor.subscribe(None);
    let mut other = monitor.subscribe(Some(AlertType::FailureRate));

    let snapshot = monitor.collect_once().await.unwrap();
    monitor.evaluate_alerts(&snapshot);

    assert!(all.try_recv().is_ok());
    assert!(other.try_recv().is_err());
}
