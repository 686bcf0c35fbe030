//! Handoff broker server
//!
//! Boots the store, seeds the default agent registry and routing rules,
//! reconciles handoffs abandoned by a previous run, starts per-agent
//! consumers and the monitor, and serves the admin HTTP surface.

use anyhow::Result;
use clap::Parser;
use handoff::broker::monitor::{AlertOperator, AlertRule, AlertType};
use handoff::broker::routing::{RoutingRule, has_go_files, is_implementation_handoff};
use handoff::rest_api::{ApiState, create_app};
use handoff::{
    AgentCapability, AgentName, AgentRegistry, BrokerConfig, ContentRouter, DatabaseConfig,
    DatabaseConnection, DatabasePath, Dispatcher, HandoffBroker, Monitor, ProjectName,
    SqliteStore, Store, production_time_provider,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "handoffd", about = "Priority-ordered handoff broker for multi-agent systems")]
struct Args {
    /// Project this broker instance serves
    #[arg(long, default_value = "default")]
    project: String,

    /// SQLite database path
    #[arg(long, default_value = "./data/handoff.db")]
    database: String,

    /// Listen address for the admin HTTP surface
    #[arg(long, default_value = "127.0.0.1:8085")]
    listen: SocketAddr,

    /// Use production configuration instead of development
    #[arg(long)]
    production: bool,

    /// Disable the metrics/alerts monitor loop
    #[arg(long)]
    no_monitor: bool,
}

/// Agents every deployment knows about
const DEFAULT_AGENTS: &[&str] = &[
    "api-expert",
    "golang-expert",
    "typescript-expert",
    "test-expert",
    "devops-expert",
    "handoff-orchestrator",
    "project-analyzer",
];

fn seed_registry(registry: &AgentRegistry) -> Result<()> {
    for agent in DEFAULT_AGENTS {
        let name = AgentName::try_new((*agent).to_string())
            .map_err(|e| anyhow::anyhow!("invalid default agent name {agent}: {e}"))?;
        registry.register(AgentCapability::new(name));
    }
    Ok(())
}

fn seed_router(router: &ContentRouter) {
    router.load_rules(
        "api-expert",
        vec![RoutingRule {
            name: "implementation-to-go".to_string(),
            target_agent: "golang-expert".to_string(),
            priority: 10,
            conditions: vec![is_implementation_handoff(), has_go_files()],
            transforms: vec![],
        }],
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("handoff=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = if args.production {
        BrokerConfig::production()
    } else {
        BrokerConfig::development()
    };
    config.validate()?;

    info!(project = %args.project, database = %args.database, "starting handoff broker");

    let time = production_time_provider();
    let db_path = DatabasePath::new(&args.database)?;
    let connection = DatabaseConnection::initialize(DatabaseConfig::new(db_path)).await?;
    let store = SqliteStore::new(connection, Arc::clone(&time));
    let _health_probe = store.spawn_health_probe(config.health_probe_interval_ms.as_duration());
    let store: Arc<dyn Store> = Arc::new(store);

    let registry = Arc::new(AgentRegistry::new());
    seed_registry(&registry)?;
    let router = Arc::new(ContentRouter::new(Some("project-analyzer".to_string())));
    seed_router(&router);

    let project = ProjectName::try_new(args.project.clone())
        .map_err(|e| anyhow::anyhow!("invalid project name: {e}"))?;
    let broker = Arc::new(HandoffBroker::new(
        project,
        Arc::clone(&store),
        Arc::clone(&registry),
        router,
        config.clone(),
        Arc::clone(&time),
    ));

    let recovered = broker.reconcile().await?;
    if recovered > 0 {
        info!(recovered, "recovered handoffs from previous run");
    }

    let dispatcher = Arc::new(Dispatcher::with_default_strategies());
    for capability in registry.list() {
        broker.start_consumer(capability.name.as_str(), dispatcher.clone());
    }

    let mut monitor_stop = None;
    let monitor = if args.no_monitor {
        None
    } else {
        let monitor = Arc::new(Monitor::new(
            Arc::clone(&store),
            config.clone(),
            Arc::clone(&time),
        ));
        monitor.add_rule(AlertRule::new(
            "queue-backlog",
            AlertType::QueueDepth,
            AlertOperator::GreaterThan,
            50.0,
            config.alert_cooldown_secs,
        ));
        monitor.add_rule(AlertRule::new(
            "degraded-health",
            AlertType::SystemHealth,
            AlertOperator::LessThan,
            75.0,
            config.alert_cooldown_secs,
        ));
        let (stop, _handle) = monitor.spawn();
        monitor_stop = Some(stop);
        Some(monitor)
    };

    let app = create_app(ApiState::new(Arc::clone(&broker), monitor));
    let listener = TcpListener::bind(args.listen).await?;
    info!(listen = %args.listen, "admin surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    if let Some(stop) = monitor_stop {
        let _ = stop.send(true);
    }
    broker.shutdown().await;
    info!("handoff broker stopped");
    Ok(())
}
