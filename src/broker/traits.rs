//! Trait definitions and error types for broker components
//!
//! These interfaces decouple the broker from agent business logic (opaque
//! handlers) and from workload runners (pluggable execution strategies).

use crate::broker::routing::RoutingError;
use crate::broker::validation::ValidationError;
use crate::domain_types::HandoffId;
use crate::handoff::{Handoff, HandoffStatus, Priority};
use crate::store::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the broker's publish/consume paths
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Payload failed validation; no state was changed
    #[error("validation failed: {source}")]
    Validation {
        /// First failing rule
        #[from]
        source: ValidationError,
    },

    /// Router could not pick a target; no state was changed
    #[error("routing failed: {source}")]
    Routing {
        /// Underlying routing failure
        #[from]
        source: RoutingError,
    },

    /// Store failure after the store's own retries were exhausted
    #[error("store failure during {operation} for handoff {handoff_id:?}: {source}")]
    Store {
        /// Broker operation in flight
        operation: &'static str,
        /// Handoff involved, when known
        handoff_id: Option<HandoffId>,
        /// Underlying store error
        #[source]
        source: StoreError,
    },

    /// Envelope could not be serialized or parsed
    #[error("serialization failure during {operation}: {source}")]
    Serialization {
        /// Broker operation in flight
        operation: &'static str,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Envelope failed its integrity check and was dead-lettered
    #[error("corrupt envelope for handoff {handoff_id}: {reason}")]
    Corruption {
        /// Handoff involved
        handoff_id: HandoffId,
        /// What the integrity check found
        reason: String,
    },

    /// Requested status change violates the lifecycle DAG
    #[error("invalid status transition {from:?} -> {to:?} for handoff {handoff_id}")]
    InvalidTransition {
        /// Handoff involved
        handoff_id: HandoffId,
        /// Current status
        from: HandoffStatus,
        /// Requested status
        to: HandoffStatus,
    },

    /// Target agent has no registered capability
    #[error("agent not registered: {agent}")]
    AgentNotRegistered {
        /// Offending agent name
        agent: String,
    },

    /// Handoff record is gone (expired or never existed)
    #[error("handoff not found: {handoff_id}")]
    NotFound {
        /// Requested handoff
        handoff_id: HandoffId,
    },
}

/// Error returned by an agent handler
///
/// Carries only a message; the broker classifies it against the retry
/// policy's substring set.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

/// What a successful handler run produced
#[derive(Debug, Clone, Default)]
pub struct HandlerOutcome {
    /// Runner output (trimmed for storage)
    pub output: String,
    /// Artifact paths produced or touched
    pub artifacts: Vec<String>,
    /// Follow-up work to publish
    pub next_handoffs: Vec<NextHandoff>,
    /// Runner-specific key/value annotations
    pub metadata: HashMap<String, String>,
}

/// A follow-up handoff emitted by a handler
///
/// The dispatcher lifts each into a full `Handoff` with the current agent
/// as `from_agent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHandoff {
    /// Target agent
    pub to_agent: String,
    /// Work summary
    pub summary: String,
    /// Task context for the new handoff
    pub context: String,
    /// Queue priority
    pub priority: Priority,
}

/// Opaque agent business logic invoked per dequeued handoff
///
/// Handlers must be idempotent keyed on `handoff_id`: delivery is
/// at-least-once and the reconciler may re-dispatch after a crash.
#[async_trait]
pub trait HandoffHandler: Send + Sync {
    /// Executes the work described by the handoff
    async fn handle(&self, handoff: &Handoff) -> Result<HandlerOutcome, HandlerError>;
}

/// Errors surfaced by strategy selection and execution
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No registered strategy accepted the request
    #[error("no execution strategy can handle agent {agent}")]
    StrategyNotFound {
        /// Target agent
        agent: String,
    },

    /// The selected strategy ran but reported failure
    #[error("strategy {strategy} failed: {message}")]
    ExecutionFailed {
        /// Strategy name
        strategy: &'static str,
        /// Failure detail
        message: String,
    },

    /// The script fallback could not locate a run script
    #[error("no run script found for agent {agent}")]
    ScriptNotFound {
        /// Target agent
        agent: String,
    },

    /// Process spawn or I/O failure
    #[error("process error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Request payload could not be serialized
    #[error("payload serialization failed: {source}")]
    Serialization {
        /// Underlying serde error
        #[from]
        source: serde_json::Error,
    },
}

/// Strategy-facing execution request
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Target agent
    pub agent_name: String,
    /// Project the handoff is scoped to
    pub project_name: String,
    /// Resolved project working directory
    pub project_path: PathBuf,
    /// Canonical JSON of the handoff payload
    pub payload_json: String,
    /// Handoff identifier
    pub handoff_id: HandoffId,
    /// Producing agent
    pub from_agent: String,
    /// Environment injected into child processes
    pub environment: HashMap<String, String>,
    /// Task context from the handoff metadata
    pub task_context: String,
    /// Work summary
    pub summary: String,
    /// Work requirements
    pub requirements: Vec<String>,
}

/// Strategy-facing execution response
#[derive(Debug, Clone, Default)]
pub struct ExecutionResponse {
    /// Whether the run succeeded
    pub success: bool,
    /// Captured output
    pub output: String,
    /// Failure detail when `success` is false
    pub error: Option<String>,
    /// Wall-clock run time
    pub duration: Duration,
    /// Artifact paths reported by the runner
    pub artifacts: Vec<String>,
    /// Follow-up handoffs requested by the runner
    pub next_handoffs: Vec<NextHandoff>,
    /// Runner-specific key/value annotations
    pub metadata: HashMap<String, String>,
}

/// A pluggable way to execute a handoff for an agent
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// Stable strategy name for logs and response metadata
    fn name(&self) -> &'static str;

    /// Selection priority; highest capable strategy wins
    fn priority(&self) -> i32;

    /// Whether this strategy can run the request with the observed tools
    fn can_handle(&self, request: &ExecutionRequest, tools: &super::strategies::ToolSet) -> bool;

    /// Runs the request
    async fn execute(&self, request: &ExecutionRequest)
    -> Result<ExecutionResponse, DispatchError>;
}
