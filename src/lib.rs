//! # Handoff - priority-ordered handoff brokering for multi-agent systems
//!
//! Handoff is a project-scoped broker that carries structured task
//! payloads between named autonomous agents. Producers publish handoffs
//! describing work; the broker persists, validates, routes, and dispatches
//! them; per-agent consumers execute the work with bounded concurrency,
//! emit follow-up handoffs, and report outcomes.
//!
//! ## Architecture
//!
//! The crate follows a functional-core / imperative-shell split: payload
//! modeling, validation, routing, and scoring are pure; the store, the
//! consumer loops, and the strategies own the I/O.
//!
//! - [`handoff`] — canonical payload model, checksums, wire-observable
//!   keys and the priority score encoding
//! - [`store`] — durable key/value + scored-queue contract and its
//!   embedded SQLite implementation
//! - [`broker`] — publish/consume, validation, routing, strategies,
//!   dispatch, and monitoring
//! - [`rest_api`] — thin admin HTTP boundary
//!
//! ## Delivery contract
//!
//! Delivery is at-least-once: a consumer acknowledges by updating status,
//! and a startup reconciliation sweep recovers handoffs abandoned in
//! `processing`. Handlers must therefore be idempotent keyed on the
//! handoff id.

pub mod broker;
pub mod database;
pub mod domain_types;
pub mod error;
pub mod handoff;
pub mod rest_api;
pub mod store;
pub mod time_provider;

pub use crate::broker::{
    AgentCapability, AgentRegistry, BrokerConfig, ContentRouter, Dispatcher, HandoffBroker,
    Monitor, StrategyRegistry,
};
pub use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
pub use crate::domain_types::{AgentName, HandoffId, MaxConcurrent, ProjectName};
pub use crate::error::{HandoffError, Result};
pub use crate::handoff::{Handoff, HandoffStatus, Priority};
pub use crate::store::{SqliteStore, Store};
pub use crate::time_provider::{SharedTimeProvider, TimeProvider, production_time_provider};
