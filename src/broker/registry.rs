//! In-memory agent capability registry
//!
//! Holds what each agent can do and how its consumer behaves (queue name,
//! parallelism). Registration is idempotent: a later registration replaces
//! an earlier one; consumers started before a re-registration keep the
//! capability they started with.

use crate::domain_types::{AgentName, MaxConcurrent};
use crate::handoff::queue_key;
use dashmap::DashMap;

/// Declared capabilities of a single agent
#[derive(Debug, Clone)]
pub struct AgentCapability {
    /// Agent name
    pub name: AgentName,
    /// Human-readable description
    pub description: String,
    /// Keywords that route work toward this agent
    pub triggers: Vec<String>,
    /// Artifact types the agent consumes
    pub input_types: Vec<String>,
    /// Artifact types the agent produces
    pub output_types: Vec<String>,
    /// Queue override; `None` uses the canonical project-scoped form
    pub queue_name: Option<String>,
    /// Parallel workers for this agent's consumer
    pub max_concurrent: MaxConcurrent,
}

impl AgentCapability {
    /// Creates a capability with defaults (canonical queue, 5 workers)
    #[must_use]
    pub fn new(name: AgentName) -> Self {
        Self {
            name,
            description: String::new(),
            triggers: Vec::new(),
            input_types: Vec::new(),
            output_types: Vec::new(),
            queue_name: None,
            max_concurrent: MaxConcurrent::default(),
        }
    }

    /// Sets the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the trigger keywords
    #[must_use]
    pub fn with_triggers(mut self, triggers: Vec<String>) -> Self {
        self.triggers = triggers;
        self
    }

    /// Sets the consumed artifact types
    #[must_use]
    pub fn with_input_types(mut self, input_types: Vec<String>) -> Self {
        self.input_types = input_types;
        self
    }

    /// Sets the produced artifact types
    #[must_use]
    pub fn with_output_types(mut self, output_types: Vec<String>) -> Self {
        self.output_types = output_types;
        self
    }

    /// Overrides the queue name
    #[must_use]
    pub fn with_queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Sets the consumer parallelism
    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: MaxConcurrent) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Queue this agent consumes from within `project`
    #[must_use]
    pub fn queue_name_for(&self, project: &str) -> String {
        self.queue_name
            .clone()
            .unwrap_or_else(|| queue_key(project, self.name.as_str()))
    }
}

/// Agent capability registry with O(1) lookup
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: DashMap<String, AgentCapability>,
}

impl AgentRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Registers a capability, replacing any earlier registration
    pub fn register(&self, capability: AgentCapability) {
        self.agents
            .insert(capability.name.as_str().to_string(), capability);
    }

    /// Looks up a capability by agent name
    #[must_use]
    pub fn get(&self, agent: &str) -> Option<AgentCapability> {
        self.agents.get(agent).map(|entry| entry.value().clone())
    }

    /// Whether the agent has a registered capability
    #[must_use]
    pub fn is_registered(&self, agent: &str) -> bool {
        self.agents.contains_key(agent)
    }

    /// Whether any agent is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Number of registered agents
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Snapshot of all registered capabilities
    #[must_use]
    pub fn list(&self) -> Vec<AgentCapability> {
        self.agents
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> AgentName {
        AgentName::try_new(s.to_string()).expect("valid agent name")
    }

    #[test]
    fn test_should_default_to_canonical_queue_when_no_override_given() {
        let capability = AgentCapability::new(name("golang-expert"));

        assert_eq!(
            capability.queue_name_for("demo"),
            "handoff:project:demo:queue:golang-expert"
        );
        assert_eq!(capability.max_concurrent.as_usize(), 5);
    }

    #[test]
    fn test_should_use_override_when_queue_name_is_set() {
        let capability =
            AgentCapability::new(name("golang-expert")).with_queue_name("custom:queue");

        assert_eq!(capability.queue_name_for("demo"), "custom:queue");
    }

    #[test]
    fn test_should_replace_capability_when_registering_same_agent_twice() {
        let registry = AgentRegistry::new();
        registry.register(AgentCapability::new(name("golang-expert")));
        registry.register(
            AgentCapability::new(name("golang-expert"))
                .with_max_concurrent(MaxConcurrent::try_new(9).unwrap()),
        );

        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry.get("golang-expert").unwrap().max_concurrent.as_usize(),
            9
        );
    }

    #[test]
    fn test_should_report_empty_when_no_agents_registered() {
        let registry = AgentRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.is_registered("golang-expert"));
    }
}
