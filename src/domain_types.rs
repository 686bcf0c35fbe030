//! Shared domain types for the handoff broker
//!
//! Strongly-typed values used across the store, broker, and admin surface
//! to prevent primitive obsession and keep validation at construction time.

use nutype::nutype;
use uuid::Uuid;

/// Returns true when `s` is a valid agent name: non-empty, lowercase
/// alphanumerics and hyphens only.
fn is_agent_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Name of an agent participating in handoffs
///
/// Agent names are wire-observable (they appear in queue keys), so the
/// charset is restricted to `[a-z0-9-]`.
#[nutype(
    validate(predicate = is_agent_name),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        TryFrom,
        Into
    )
)]
pub struct AgentName(String);

impl AgentName {
    /// Borrows the inner string
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Name of the project a handoff is scoped to
///
/// Project names appear in queue keys alongside agent names and share the
/// same charset restriction.
#[nutype(
    validate(predicate = is_agent_name),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        AsRef,
        TryFrom,
        Into
    )
)]
pub struct ProjectName(String);

impl ProjectName {
    /// Borrows the inner string
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Unique identifier for a handoff
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct HandoffId(Uuid);

impl HandoffId {
    /// Creates a new random handoff ID
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Maximum handoffs an agent's consumer processes in parallel
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct MaxConcurrent(usize);

impl MaxConcurrent {
    /// Gets the value as usize for use with semaphores
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Connection pool size for the store
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 25
)]
pub struct ConnectionPoolSize(u32);

impl ConnectionPoolSize {
    /// Gets the value as u32 for the sqlx pool builder
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_accept_agent_name_when_lowercase_alphanumeric_hyphen() {
        assert!(AgentName::try_new("golang-expert".to_string()).is_ok());
        assert!(AgentName::try_new("agent2".to_string()).is_ok());
    }

    #[test]
    fn test_should_reject_agent_name_when_charset_is_invalid() {
        assert!(AgentName::try_new(String::new()).is_err());
        assert!(AgentName::try_new("Golang".to_string()).is_err());
        assert!(AgentName::try_new("api_expert".to_string()).is_err());
        assert!(AgentName::try_new("api expert".to_string()).is_err());
    }

    #[test]
    fn test_should_default_max_concurrent_to_five_when_unspecified() {
        assert_eq!(MaxConcurrent::default().as_usize(), 5);
    }

    #[test]
    fn test_should_generate_distinct_handoff_ids_when_called_twice() {
        assert_ne!(HandoffId::generate(), HandoffId::generate());
    }
}
