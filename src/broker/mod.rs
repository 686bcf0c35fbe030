//! Priority-ordered handoff brokering between agents
//!
//! This module is the coordination spine: producers publish handoffs, the
//! broker validates, routes, persists, and enqueues them, per-agent
//! consumers execute the work through pluggable strategies with bounded
//! parallelism, and the monitor watches the whole flow.
//!
//! # Components
//!
//! - [`validation`] — sanitization and total validation of handoffs
//! - [`routing`] — rule-driven target selection for deferred handoffs
//! - [`broker`] — publish/consume API, retry scheduling, dead-lettering
//! - [`registry`] — in-memory agent capability registry
//! - [`strategies`] — pluggable execution strategies with priority
//!   selection
//! - [`dispatcher`] — strategy-selecting handler with follow-up lifting
//! - [`monitor`] — aggregate metrics, health scoring, threshold alerts
//! - [`config`] — environment presets, retry policy, builder
//!
//! # Flow
//!
//! ```text
//! producer -> validate -> route? -> enqueue -> persist
//!                                      |
//!            consumer loop <- dequeue -+
//!                 |
//!            strategy execute -> status update -> follow-up publish
//!                                      |
//!                              monitor observes
//! ```

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod domain_types;
pub mod monitor;
pub mod registry;
pub mod routing;
pub mod strategies;
pub mod traits;
pub mod validation;

pub use broker::HandoffBroker;
pub use config::{BrokerConfig, BrokerConfigBuilder, ConfigError, RetryPolicy};
pub use dispatcher::Dispatcher;
pub use monitor::{Alert, AlertRule, AlertSeverity, AlertType, MetricsSnapshot, Monitor};
pub use registry::{AgentCapability, AgentRegistry};
pub use routing::{Condition, ContentRouter, RoutingError, RoutingRule, Transform};
pub use strategies::{
    BuiltInStrategy, ScriptFallbackStrategy, StrategyRegistry, ToolDetectionStrategy, ToolSet,
};
pub use traits::{
    BrokerError, DispatchError, ExecutionRequest, ExecutionResponse, ExecutionStrategy,
    HandlerError, HandlerOutcome, HandoffHandler, NextHandoff,
};
pub use validation::{ValidationError, Validator, sanitize};
