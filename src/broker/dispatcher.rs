//! Per-agent dispatch of dequeued handoffs
//!
//! The dispatcher is the broker's default handler: it builds a
//! strategy-facing request from the handoff (resolving the project
//! directory and injecting the contract environment variables), selects an
//! execution strategy, runs it, and surfaces artifacts and follow-up
//! handoffs back to the broker.

use crate::broker::strategies::{StrategyRegistry, ToolSet};
use crate::broker::traits::{
    ExecutionRequest, HandlerError, HandlerOutcome, HandoffHandler,
};
use crate::handoff::Handoff;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Project name injected into every strategy invocation
pub const AGENT_PROJECT_NAME_ENV: &str = "AGENT_PROJECT_NAME";

/// Handoff id mirrored for child processes
pub const HANDOFF_ID_ENV: &str = "HANDOFF_ID";

/// Producing agent mirrored for child processes
pub const FROM_AGENT_ENV: &str = "FROM_AGENT";

/// Highest-precedence project-path hint
pub const PROJECT_ROOT_ENV: &str = "PROJECT_ROOT";

/// Development-tree project-path hint
pub const AGENT_DEV_PATH_ENV: &str = "AGENT_DEV_PATH";

/// Resolves the working directory for a project
///
/// Precedence: `PROJECT_ROOT` → `AGENT_DEV_PATH/project` → `../project` →
/// `/tmp/projects/project` → `./project` → current directory. The first
/// candidate that exists as a directory wins.
#[must_use]
pub fn resolve_project_path(project: &str, env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(root) = env(PROJECT_ROOT_ENV) {
        candidates.push(PathBuf::from(root));
    }
    if let Some(dev_path) = env(AGENT_DEV_PATH_ENV) {
        candidates.push(PathBuf::from(dev_path).join(project));
    }
    candidates.push(PathBuf::from("..").join(project));
    candidates.push(PathBuf::from("/tmp/projects").join(project));
    candidates.push(PathBuf::from(".").join(project));

    for candidate in candidates {
        if candidate.is_dir() {
            return candidate;
        }
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// Strategy-selecting handoff handler
pub struct Dispatcher {
    strategies: StrategyRegistry,
}

impl Dispatcher {
    /// Creates a dispatcher over the given strategy registry
    #[must_use]
    pub fn new(strategies: StrategyRegistry) -> Self {
        Self { strategies }
    }

    /// Creates a dispatcher with the three reference strategies
    #[must_use]
    pub fn with_default_strategies() -> Self {
        Self::new(StrategyRegistry::with_defaults())
    }

    /// Builds the strategy-facing request for a handoff
    ///
    /// # Errors
    ///
    /// Returns `HandlerError` if the payload cannot be serialized
    pub fn build_request(handoff: &Handoff) -> Result<ExecutionRequest, HandlerError> {
        let metadata = &handoff.metadata;
        let handoff_id = metadata
            .handoff_id
            .ok_or_else(|| HandlerError("handoff has no id".to_string()))?;

        let payload_json = crate::handoff::canonical_json(handoff)
            .map_err(|e| HandlerError(format!("payload serialization failed: {e}")))?;

        let project_path =
            resolve_project_path(&metadata.project_name, &|key| std::env::var(key).ok());

        let mut environment = HashMap::new();
        environment.insert(
            AGENT_PROJECT_NAME_ENV.to_string(),
            metadata.project_name.clone(),
        );
        environment.insert(HANDOFF_ID_ENV.to_string(), handoff_id.to_string());
        environment.insert(FROM_AGENT_ENV.to_string(), metadata.from_agent.clone());

        Ok(ExecutionRequest {
            agent_name: metadata.to_agent.clone(),
            project_name: metadata.project_name.clone(),
            project_path,
            payload_json,
            handoff_id,
            from_agent: metadata.from_agent.clone(),
            environment,
            task_context: metadata.task_context.clone(),
            summary: handoff.content.summary.clone(),
            requirements: handoff.content.requirements.clone(),
        })
    }
}

#[async_trait]
impl HandoffHandler for Dispatcher {
    async fn handle(&self, handoff: &Handoff) -> Result<HandlerOutcome, HandlerError> {
        let request = Self::build_request(handoff)?;
        let tools = ToolSet::detect(&request.project_path);

        let Some(strategy) = self.strategies.select(&request, &tools) else {
            warn!(agent = %request.agent_name, "no execution strategy can handle agent");
            return Err(HandlerError(format!(
                "no execution strategy can handle agent {}",
                request.agent_name
            )));
        };

        debug!(
            agent = %request.agent_name,
            strategy = strategy.name(),
            handoff_id = %request.handoff_id,
            "dispatching handoff"
        );

        let response = strategy
            .execute(&request)
            .await
            .map_err(|e| HandlerError(e.to_string()))?;

        if !response.success {
            return Err(HandlerError(
                response
                    .error
                    .unwrap_or_else(|| "strategy reported failure without detail".to_string()),
            ));
        }

        let mut metadata = response.metadata;
        metadata
            .entry("strategy".to_string())
            .or_insert_with(|| strategy.name().to_string());
        metadata.insert(
            "duration_ms".to_string(),
            response.duration.as_millis().to_string(),
        );

        Ok(HandlerOutcome {
            output: response.output,
            artifacts: response.artifacts,
            next_handoffs: response.next_handoffs,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::HandoffId;
    use crate::handoff::{
        ArtifactSet, HandoffContent, HandoffMetadata, HandoffStatus, Priority, ValidationSection,
    };
    use chrono::Utc;
    use serde_json::Map;

    fn sample_handoff(to_agent: &str) -> Handoff {
        Handoff {
            metadata: HandoffMetadata {
                project_name: "demo".to_string(),
                from_agent: "api-expert".to_string(),
                to_agent: to_agent.to_string(),
                timestamp: Utc::now(),
                task_context: "implement login".to_string(),
                priority: Priority::Normal,
                handoff_id: Some(HandoffId::generate()),
            },
            content: HandoffContent {
                summary: "Implement login endpoint per OpenAPI".to_string(),
                requirements: vec!["JWT auth".to_string()],
                artifacts: ArtifactSet::default(),
                technical_details: Map::new(),
                next_steps: vec![],
            },
            validation: ValidationSection::default(),
            status: HandoffStatus::Processing,
            created_at: None,
            updated_at: None,
            retry_count: 0,
            error_msg: None,
        }
    }

    #[test]
    fn test_should_prefer_project_root_when_env_points_to_directory() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().to_path_buf();
        let env = move |key: &str| {
            (key == PROJECT_ROOT_ENV).then(|| root.to_string_lossy().into_owned())
        };

        assert_eq!(resolve_project_path("demo", &env), temp.path());
    }

    #[test]
    fn test_should_fall_through_to_dev_path_when_project_root_missing() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir(temp.path().join("demo")).unwrap();
        let dev = temp.path().to_path_buf();
        let env = move |key: &str| {
            (key == AGENT_DEV_PATH_ENV).then(|| dev.to_string_lossy().into_owned())
        };

        assert_eq!(resolve_project_path("demo", &env), temp.path().join("demo"));
    }

    #[test]
    fn test_should_fall_back_to_cwd_when_no_candidate_exists() {
        let resolved = resolve_project_path("no-such-project-anywhere", &|_| None);
        assert_eq!(resolved, std::env::current_dir().unwrap());
    }

    #[test]
    fn test_should_inject_contract_env_when_building_request() {
        let handoff = sample_handoff("golang-expert");
        let request = Dispatcher::build_request(&handoff).unwrap();

        assert_eq!(
            request.environment.get(AGENT_PROJECT_NAME_ENV).map(String::as_str),
            Some("demo")
        );
        assert_eq!(
            request.environment.get(FROM_AGENT_ENV).map(String::as_str),
            Some("api-expert")
        );
        assert!(request.environment.contains_key(HANDOFF_ID_ENV));
        assert_eq!(request.agent_name, "golang-expert");
    }

    #[tokio::test]
    async fn test_should_run_built_in_agent_when_dispatching_in_process() {
        let dispatcher = Dispatcher::with_default_strategies();
        let handoff = sample_handoff("project-analyzer");

        let outcome = dispatcher.handle(&handoff).await.unwrap();

        assert!(outcome.output.contains("demo"));
        assert_eq!(
            outcome.metadata.get("strategy").map(String::as_str),
            Some("built-in")
        );
    }

    #[tokio::test]
    async fn test_should_fail_with_handler_error_when_no_strategy_matches() {
        let dispatcher = Dispatcher::with_default_strategies();
        let handoff = sample_handoff("mystery-agent");

        let err = dispatcher.handle(&handoff).await.unwrap_err();
        assert!(err.0.contains("no execution strategy"));
    }
}
