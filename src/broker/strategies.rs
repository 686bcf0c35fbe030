//! Pluggable execution strategies
//!
//! The dispatcher does not run workloads itself; it picks the
//! highest-priority registered strategy whose `can_handle` accepts the
//! request. Three reference strategies ship here: tool detection (100),
//! built-in in-process agents (80), and a conventional run-script fallback
//! (50). Callers may register more.

use crate::broker::traits::{
    DispatchError, ExecutionRequest, ExecutionResponse, ExecutionStrategy, NextHandoff,
};
use crate::handoff::Priority;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Environment override for the script fallback location
pub const RUN_AGENT_SCRIPT_ENV: &str = "RUN_AGENT_SCRIPT_PATH";

/// Conventional run-script file name
const RUN_SCRIPT_NAME: &str = "run-agent.sh";

/// Project flavor inferred from marker files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    /// `go.mod` present
    Go,
    /// `package.json` present
    TypeScript,
    /// `Cargo.toml` present
    Rust,
}

/// Observed tools: binaries on PATH plus the project flavor
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    binaries: HashMap<String, PathBuf>,
    project_kind: Option<ProjectKind>,
}

impl ToolSet {
    /// Detects tools for a project directory
    ///
    /// Scans PATH for the binaries the integrations care about and infers
    /// the project kind from marker files.
    #[must_use]
    pub fn detect(project_path: &Path) -> Self {
        let mut binaries = HashMap::new();
        for name in ["go", "gofmt", "node", "npx", "docker", "kubectl"] {
            if let Some(path) = find_in_path(name) {
                binaries.insert(name.to_string(), path);
            }
        }

        let project_kind = if project_path.join("go.mod").is_file() {
            Some(ProjectKind::Go)
        } else if project_path.join("package.json").is_file() {
            Some(ProjectKind::TypeScript)
        } else if project_path.join("Cargo.toml").is_file() {
            Some(ProjectKind::Rust)
        } else {
            None
        };

        Self {
            binaries,
            project_kind,
        }
    }

    /// An empty tool set (nothing detected)
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Adds a binary by hand (used by tests and custom integrations)
    #[must_use]
    pub fn with_binary(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.binaries.insert(name.into(), path.into());
        self
    }

    /// Whether the named binary was found
    #[must_use]
    pub fn has_binary(&self, name: &str) -> bool {
        self.binaries.contains_key(name)
    }

    /// Path of the named binary, when found
    #[must_use]
    pub fn binary(&self, name: &str) -> Option<&PathBuf> {
        self.binaries.get(name)
    }

    /// Inferred project kind
    #[must_use]
    pub fn project_kind(&self) -> Option<ProjectKind> {
        self.project_kind
    }
}

/// Searches PATH for an executable file
fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Runner stdout shape; anything unparsable is treated as plain output
#[derive(Debug, Deserialize)]
struct RunnerOutput {
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    next_handoffs: Vec<RunnerNextHandoff>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RunnerNextHandoff {
    to_agent: String,
    summary: String,
    #[serde(default)]
    context: String,
    #[serde(default)]
    priority: Priority,
}

/// Runs an external runner with `(agent_name, payload_json)` and converts
/// its output into an execution response
async fn run_external(
    program: &Path,
    extra_args: &[String],
    request: &ExecutionRequest,
) -> Result<ExecutionResponse, DispatchError> {
    let started = Instant::now();

    let mut command = tokio::process::Command::new(program);
    command
        .args(extra_args)
        .arg(&request.agent_name)
        .arg(&request.payload_json)
        .envs(&request.environment)
        .kill_on_drop(true);
    if request.project_path.is_dir() {
        command.current_dir(&request.project_path);
    }

    let output = command.output().await?;
    let duration = started.elapsed();
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if !output.status.success() {
        return Ok(ExecutionResponse {
            success: false,
            output: stdout,
            error: Some(if stderr.is_empty() {
                format!("runner exited with {}", output.status)
            } else {
                stderr
            }),
            duration,
            ..ExecutionResponse::default()
        });
    }

    Ok(parse_runner_output(&stdout, duration))
}

/// Parses structured runner stdout, falling back to plain text
fn parse_runner_output(stdout: &str, duration: std::time::Duration) -> ExecutionResponse {
    match serde_json::from_str::<RunnerOutput>(stdout) {
        Ok(parsed) => ExecutionResponse {
            success: true,
            output: parsed.output.unwrap_or_default(),
            error: None,
            duration,
            artifacts: parsed.artifacts,
            next_handoffs: parsed
                .next_handoffs
                .into_iter()
                .map(|n| NextHandoff {
                    to_agent: n.to_agent,
                    summary: n.summary,
                    context: n.context,
                    priority: n.priority,
                })
                .collect(),
            metadata: parsed.metadata,
        },
        Err(_) => ExecutionResponse {
            success: true,
            output: stdout.trim().to_string(),
            duration,
            ..ExecutionResponse::default()
        },
    }
}

/// A tool integration: which binary runs an agent and with what arguments
#[derive(Debug, Clone)]
pub struct ToolIntegration {
    /// Binary the integration needs on PATH
    pub binary: String,
    /// Arguments placed before `(agent_name, payload_json)`
    pub args: Vec<String>,
}

/// Tool-detection strategy (priority 100)
///
/// Selects when a known tool integration matches the target agent and the
/// integration's binary is present in the observed tool set.
pub struct ToolDetectionStrategy {
    integrations: HashMap<String, ToolIntegration>,
}

impl ToolDetectionStrategy {
    /// Creates the strategy with the default per-agent integrations
    #[must_use]
    pub fn new() -> Self {
        let mut integrations = HashMap::new();
        integrations.insert(
            "golang-expert".to_string(),
            ToolIntegration {
                binary: "go".to_string(),
                args: vec!["run".to_string(), "./cmd/agent-runner".to_string()],
            },
        );
        integrations.insert(
            "typescript-expert".to_string(),
            ToolIntegration {
                binary: "npx".to_string(),
                args: vec!["agent-runner".to_string()],
            },
        );
        integrations.insert(
            "devops-expert".to_string(),
            ToolIntegration {
                binary: "docker".to_string(),
                args: vec![
                    "run".to_string(),
                    "--rm".to_string(),
                    "agent-runner".to_string(),
                ],
            },
        );
        Self { integrations }
    }

    /// Adds or replaces an integration
    #[must_use]
    pub fn with_integration(
        mut self,
        agent: impl Into<String>,
        integration: ToolIntegration,
    ) -> Self {
        self.integrations.insert(agent.into(), integration);
        self
    }
}

impl Default for ToolDetectionStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStrategy for ToolDetectionStrategy {
    fn name(&self) -> &'static str {
        "tool-detection"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn can_handle(&self, request: &ExecutionRequest, tools: &ToolSet) -> bool {
        self.integrations
            .get(&request.agent_name)
            .is_some_and(|integration| tools.has_binary(&integration.binary))
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, DispatchError> {
        let integration = self.integrations.get(&request.agent_name).ok_or_else(|| {
            DispatchError::StrategyNotFound {
                agent: request.agent_name.clone(),
            }
        })?;
        let program = find_in_path(&integration.binary).ok_or_else(|| {
            DispatchError::ExecutionFailed {
                strategy: "tool-detection",
                message: format!("binary {} disappeared from PATH", integration.binary),
            }
        })?;
        debug!(agent = %request.agent_name, binary = %integration.binary, "running tool integration");
        run_external(&program, &integration.args, request).await
    }
}

/// Agents handled in-process by the built-in strategy
const BUILT_IN_AGENTS: &[&str] = &["handoff-orchestrator", "project-analyzer"];

/// Built-in strategy (priority 80)
///
/// Owns a fixed set of agents handled in-process without external tools.
#[derive(Debug, Default)]
pub struct BuiltInStrategy;

impl BuiltInStrategy {
    /// Creates the built-in strategy
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionStrategy for BuiltInStrategy {
    fn name(&self) -> &'static str {
        "built-in"
    }

    fn priority(&self) -> i32 {
        80
    }

    fn can_handle(&self, request: &ExecutionRequest, _tools: &ToolSet) -> bool {
        BUILT_IN_AGENTS.contains(&request.agent_name.as_str())
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, DispatchError> {
        let started = Instant::now();
        let mut metadata = HashMap::new();
        metadata.insert("strategy".to_string(), self.name().to_string());

        let output = match request.agent_name.as_str() {
            "project-analyzer" => {
                metadata.insert(
                    "requirement_count".to_string(),
                    request.requirements.len().to_string(),
                );
                format!(
                    "analyzed {} for project {}: {} requirement(s)",
                    request.task_context,
                    request.project_name,
                    request.requirements.len()
                )
            }
            "handoff-orchestrator" => {
                format!(
                    "orchestrated handoff {} from {}: {}",
                    request.handoff_id, request.from_agent, request.summary
                )
            }
            other => {
                return Err(DispatchError::StrategyNotFound {
                    agent: other.to_string(),
                });
            }
        };

        Ok(ExecutionResponse {
            success: true,
            output,
            error: None,
            duration: started.elapsed(),
            metadata,
            ..ExecutionResponse::default()
        })
    }
}

/// Script fallback strategy (priority 50)
///
/// Locates a conventional `run-agent.sh` via environment variable, project
/// directory, executable-adjacent paths, and common search paths, then
/// invokes it with `(agent_name, payload_json)`.
#[derive(Debug, Default)]
pub struct ScriptFallbackStrategy;

impl ScriptFallbackStrategy {
    /// Creates the script fallback strategy
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Resolves the run script for a request, in documented order
    #[must_use]
    pub fn locate_script(request: &ExecutionRequest) -> Option<PathBuf> {
        if let Some(path) = request
            .environment
            .get(RUN_AGENT_SCRIPT_ENV)
            .map(PathBuf::from)
            .or_else(|| std::env::var_os(RUN_AGENT_SCRIPT_ENV).map(PathBuf::from))
        {
            if path.is_file() {
                return Some(path);
            }
            warn!(path = %path.display(), "configured run script does not exist");
        }

        let project_candidates = [
            request.project_path.join(RUN_SCRIPT_NAME),
            request.project_path.join("scripts").join(RUN_SCRIPT_NAME),
        ];
        for candidate in project_candidates {
            if candidate.is_file() {
                return Some(candidate);
            }
        }

        if let Ok(exe) = std::env::current_exe() {
            if let Some(adjacent) = exe.parent().map(|dir| dir.join(RUN_SCRIPT_NAME)) {
                if adjacent.is_file() {
                    return Some(adjacent);
                }
            }
        }

        ["/usr/local/bin", "/opt/handoff/bin"]
            .iter()
            .map(|dir| Path::new(dir).join(RUN_SCRIPT_NAME))
            .find(|candidate| candidate.is_file())
    }
}

#[async_trait]
impl ExecutionStrategy for ScriptFallbackStrategy {
    fn name(&self) -> &'static str {
        "script-fallback"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn can_handle(&self, request: &ExecutionRequest, _tools: &ToolSet) -> bool {
        Self::locate_script(request).is_some()
    }

    async fn execute(
        &self,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResponse, DispatchError> {
        let script =
            Self::locate_script(request).ok_or_else(|| DispatchError::ScriptNotFound {
                agent: request.agent_name.clone(),
            })?;
        info!(agent = %request.agent_name, script = %script.display(), "running fallback script");
        run_external(&script, &[], request).await
    }
}

/// Ordered set of pluggable execution strategies
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn ExecutionStrategy>>,
}

impl StrategyRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Creates a registry with the three reference strategies
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ToolDetectionStrategy::new()));
        registry.register(Arc::new(BuiltInStrategy::new()));
        registry.register(Arc::new(ScriptFallbackStrategy::new()));
        registry
    }

    /// Registers a strategy, keeping the set ordered by descending priority
    pub fn register(&mut self, strategy: Arc<dyn ExecutionStrategy>) {
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
    }

    /// Selects the highest-priority strategy that can handle the request
    #[must_use]
    pub fn select(
        &self,
        request: &ExecutionRequest,
        tools: &ToolSet,
    ) -> Option<Arc<dyn ExecutionStrategy>> {
        self.strategies
            .iter()
            .find(|s| s.can_handle(request, tools))
            .cloned()
    }

    /// Number of registered strategies
    #[must_use]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// Whether no strategies are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::HandoffId;

    fn request(agent: &str) -> ExecutionRequest {
        ExecutionRequest {
            agent_name: agent.to_string(),
            project_name: "demo".to_string(),
            project_path: PathBuf::from("/nonexistent/project"),
            payload_json: "{}".to_string(),
            handoff_id: HandoffId::generate(),
            from_agent: "api-expert".to_string(),
            environment: HashMap::new(),
            task_context: "ctx".to_string(),
            summary: "Implement login".to_string(),
            requirements: vec!["req".to_string()],
        }
    }

    #[test]
    fn test_should_select_tool_detection_when_integration_binary_present() {
        let registry = StrategyRegistry::with_defaults();
        let tools = ToolSet::empty().with_binary("go", "/usr/bin/go");

        let selected = registry.select(&request("golang-expert"), &tools).unwrap();
        assert_eq!(selected.name(), "tool-detection");
    }

    #[test]
    fn test_should_select_built_in_when_agent_is_in_fixed_set() {
        let registry = StrategyRegistry::with_defaults();

        let selected = registry
            .select(&request("handoff-orchestrator"), &ToolSet::empty())
            .unwrap();
        assert_eq!(selected.name(), "built-in");
    }

    #[test]
    fn test_should_select_nothing_when_no_strategy_matches() {
        let registry = StrategyRegistry::with_defaults();

        // Unknown agent, no tools, no script anywhere near /nonexistent.
        assert!(
            registry
                .select(&request("mystery-agent"), &ToolSet::empty())
                .is_none()
        );
    }

    #[test]
    fn test_should_prefer_higher_priority_when_multiple_strategies_match() {
        let registry = StrategyRegistry::with_defaults();
        let tools = ToolSet::empty().with_binary("go", "/usr/bin/go");

        // golang-expert matches tool detection (100); were a script also
        // present it would stay second at priority 50.
        let selected = registry.select(&request("golang-expert"), &tools).unwrap();
        assert_eq!(selected.priority(), 100);
    }

    #[tokio::test]
    async fn test_should_execute_in_process_when_agent_is_built_in() {
        let strategy = BuiltInStrategy::new();

        let response = strategy.execute(&request("project-analyzer")).await.unwrap();

        assert!(response.success);
        assert!(response.output.contains("demo"));
        assert_eq!(
            response.metadata.get("requirement_count").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_should_parse_structured_stdout_when_runner_emits_json() {
        let stdout = r#"{
            "output": "done",
            "artifacts": ["api/login.go"],
            "next_handoffs": [
                {"to_agent": "test-expert", "summary": "Write tests for login", "priority": "high"}
            ]
        }"#;

        let response = parse_runner_output(stdout, std::time::Duration::from_millis(5));

        assert!(response.success);
        assert_eq!(response.artifacts, vec!["api/login.go"]);
        assert_eq!(response.next_handoffs.len(), 1);
        assert_eq!(response.next_handoffs[0].priority, Priority::High);
    }

    #[test]
    fn test_should_fall_back_to_plain_output_when_stdout_is_not_json() {
        let response = parse_runner_output("all good\n", std::time::Duration::from_millis(5));

        assert!(response.success);
        assert_eq!(response.output, "all good");
        assert!(response.next_handoffs.is_empty());
    }
}
