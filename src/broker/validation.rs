//! Handoff sanitization and validation
//!
//! Sanitization is idempotent and runs first; validation is total and
//! returns the first failing rule as a typed error. Agent-specific rules
//! are dispatched on the target agent and skipped for unknown agents.

use crate::broker::registry::AgentRegistry;
use crate::handoff::{Handoff, SUPPORTED_SCHEMA_VERSIONS, is_checksum_shaped};
use crate::time_provider::SharedTimeProvider;
use chrono::Duration as ChronoDuration;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Minimum summary length after trimming
const SUMMARY_MIN_CHARS: usize = 10;

/// Maximum summary length after trimming
const SUMMARY_MAX_CHARS: usize = 1000;

/// Maximum requirement entries
const REQUIREMENTS_MAX: usize = 50;

/// Maximum next-step entries
const NEXT_STEPS_MAX: usize = 20;

/// A validation failure naming the first failing rule
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A metadata, content, or validation-section field failed its rule
    #[error("invalid {field}: {reason}")]
    Field {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// An agent-specific technical-detail rule failed
    #[error("invalid technical_details.{field} for {agent}: {reason}")]
    AgentRule {
        /// Target agent whose rules were applied
        agent: String,
        /// Offending technical-details key
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Result type for validation
pub type ValidationResult = Result<(), ValidationError>;

/// True when `s` matches the agent-name charset `[a-z0-9-]+`
fn is_agent_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// True when `s` matches the artifact-path charset `[A-Za-z0-9/_.-]+`
fn is_artifact_path(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-'))
}

/// Collapses repeated slashes and strips the trailing one
fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut last_was_slash = false;
    for c in path.trim().chars() {
        if c == '/' {
            if !last_was_slash {
                out.push(c);
            }
            last_was_slash = true;
        } else {
            out.push(c);
            last_was_slash = false;
        }
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

fn sanitize_paths(paths: &mut Vec<String>) {
    *paths = paths
        .iter()
        .map(|p| normalize_path(p))
        .filter(|p| !p.is_empty() && p != "/")
        .collect();
}

/// Sanitizes a handoff in place
///
/// Trims string scalars in metadata and content, drops empty entries from
/// `requirements` and `next_steps`, and normalizes artifact paths. The
/// free-form `technical_details` mapping is left untouched. Applying the
/// sanitizer twice is a no-op.
pub fn sanitize(handoff: &mut Handoff) {
    let metadata = &mut handoff.metadata;
    metadata.project_name = metadata.project_name.trim().to_string();
    metadata.from_agent = metadata.from_agent.trim().to_string();
    metadata.to_agent = metadata.to_agent.trim().to_string();
    metadata.task_context = metadata.task_context.trim().to_string();

    let content = &mut handoff.content;
    content.summary = content.summary.trim().to_string();
    content.requirements = content
        .requirements
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    content.next_steps = content
        .next_steps
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    sanitize_paths(&mut content.artifacts.created);
    sanitize_paths(&mut content.artifacts.modified);
    sanitize_paths(&mut content.artifacts.reviewed);
}

/// Handoff validator
///
/// Holds the agent registry (for registration checks when populated) and a
/// time provider (for the publish timestamp window).
pub struct Validator {
    registry: Arc<AgentRegistry>,
    time: SharedTimeProvider,
}

impl Validator {
    /// Creates a validator over the given registry and clock
    #[must_use]
    pub fn new(registry: Arc<AgentRegistry>, time: SharedTimeProvider) -> Self {
        Self { registry, time }
    }

    /// Validates a sanitized handoff, returning the first failing rule
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` naming the first rule that failed
    pub fn validate(&self, handoff: &Handoff) -> ValidationResult {
        self.validate_metadata(handoff)?;
        Self::validate_content(handoff)?;
        Self::validate_validation_section(handoff)?;
        Self::validate_artifacts(handoff)?;
        Self::validate_agent_rules(handoff)?;
        Ok(())
    }

    fn validate_metadata(&self, handoff: &Handoff) -> ValidationResult {
        let metadata = &handoff.metadata;

        if !is_agent_name(&metadata.from_agent) {
            return Err(ValidationError::Field {
                field: "from_agent",
                reason: "must be non-empty lowercase alphanumerics and hyphens".to_string(),
            });
        }
        if !is_agent_name(&metadata.to_agent) {
            return Err(ValidationError::Field {
                field: "to_agent",
                reason: "must be non-empty lowercase alphanumerics and hyphens".to_string(),
            });
        }
        if metadata.from_agent == metadata.to_agent {
            return Err(ValidationError::Field {
                field: "to_agent",
                reason: "must differ from from_agent".to_string(),
            });
        }
        if metadata.task_context.is_empty() {
            return Err(ValidationError::Field {
                field: "task_context",
                reason: "must be non-empty".to_string(),
            });
        }

        let now = self.time.now_utc();
        if metadata.timestamp < now - ChronoDuration::hours(24) {
            return Err(ValidationError::Field {
                field: "timestamp",
                reason: "older than 24 hours".to_string(),
            });
        }
        if metadata.timestamp > now + ChronoDuration::hours(1) {
            return Err(ValidationError::Field {
                field: "timestamp",
                reason: "more than 1 hour in the future".to_string(),
            });
        }

        if !self.registry.is_empty() {
            if !self.registry.is_registered(&metadata.from_agent) {
                return Err(ValidationError::Field {
                    field: "from_agent",
                    reason: format!("agent {} is not registered", metadata.from_agent),
                });
            }
            if !self.registry.is_registered(&metadata.to_agent) {
                return Err(ValidationError::Field {
                    field: "to_agent",
                    reason: format!("agent {} is not registered", metadata.to_agent),
                });
            }
        }

        Ok(())
    }

    fn validate_content(handoff: &Handoff) -> ValidationResult {
        let content = &handoff.content;

        let summary_chars = content.summary.chars().count();
        if !(SUMMARY_MIN_CHARS..=SUMMARY_MAX_CHARS).contains(&summary_chars) {
            return Err(ValidationError::Field {
                field: "summary",
                reason: format!(
                    "length {summary_chars} outside [{SUMMARY_MIN_CHARS}, {SUMMARY_MAX_CHARS}]"
                ),
            });
        }

        if content.requirements.is_empty() || content.requirements.len() > REQUIREMENTS_MAX {
            return Err(ValidationError::Field {
                field: "requirements",
                reason: format!(
                    "count {} outside [1, {REQUIREMENTS_MAX}]",
                    content.requirements.len()
                ),
            });
        }
        if content.requirements.iter().any(|r| r.trim().is_empty()) {
            return Err(ValidationError::Field {
                field: "requirements",
                reason: "entries must be non-empty".to_string(),
            });
        }

        if content.next_steps.len() > NEXT_STEPS_MAX {
            return Err(ValidationError::Field {
                field: "next_steps",
                reason: format!("count {} exceeds {NEXT_STEPS_MAX}", content.next_steps.len()),
            });
        }
        if content.next_steps.iter().any(|s| s.trim().is_empty()) {
            return Err(ValidationError::Field {
                field: "next_steps",
                reason: "entries must be non-empty".to_string(),
            });
        }

        Ok(())
    }

    fn validate_validation_section(handoff: &Handoff) -> ValidationResult {
        let section = &handoff.validation;

        if !SUPPORTED_SCHEMA_VERSIONS.contains(&section.schema_version.as_str()) {
            return Err(ValidationError::Field {
                field: "schema_version",
                reason: format!("unsupported version {}", section.schema_version),
            });
        }
        if !is_checksum_shaped(&section.checksum) {
            return Err(ValidationError::Field {
                field: "checksum",
                reason: "must be 64 lowercase hex characters".to_string(),
            });
        }

        Ok(())
    }

    fn validate_artifacts(handoff: &Handoff) -> ValidationResult {
        let artifacts = &handoff.content.artifacts;

        for path in artifacts.all_paths() {
            if !is_artifact_path(path) {
                return Err(ValidationError::Field {
                    field: "artifacts",
                    reason: format!("path {path:?} contains invalid characters"),
                });
            }
        }

        let mut seen = std::collections::HashSet::new();
        for path in artifacts.all_paths() {
            if !seen.insert(path.as_str()) {
                return Err(ValidationError::Field {
                    field: "artifacts",
                    reason: format!("path {path:?} appears in more than one bucket"),
                });
            }
        }

        Ok(())
    }

    fn validate_agent_rules(handoff: &Handoff) -> ValidationResult {
        let agent = handoff.metadata.to_agent.as_str();
        let details = &handoff.content.technical_details;

        match agent {
            "golang-expert" => {
                for field in ["handlers", "services", "models", "repositories"] {
                    require_string_array(agent, details, field)?;
                }
                require_percentage(agent, details, "test_coverage")
            }
            "typescript-expert" => {
                for field in ["components", "hooks"] {
                    require_array(agent, details, field)?;
                }
                Ok(())
            }
            "api-expert" => {
                for field in ["endpoints", "schemas"] {
                    require_array(agent, details, field)?;
                }
                Ok(())
            }
            "test-expert" => {
                require_array(agent, details, "test_suites")?;
                require_percentage(agent, details, "coverage_achieved")
            }
            "devops-expert" => {
                for field in ["deployments", "configurations"] {
                    require_array(agent, details, field)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn require_array(
    agent: &str,
    details: &Map<String, Value>,
    field: &'static str,
) -> ValidationResult {
    match details.get(field) {
        None | Some(Value::Array(_)) => Ok(()),
        Some(_) => Err(ValidationError::AgentRule {
            agent: agent.to_string(),
            field,
            reason: "must be an array".to_string(),
        }),
    }
}

fn require_string_array(
    agent: &str,
    details: &Map<String, Value>,
    field: &'static str,
) -> ValidationResult {
    match details.get(field) {
        None => Ok(()),
        Some(Value::Array(items)) if items.iter().all(Value::is_string) => Ok(()),
        Some(_) => Err(ValidationError::AgentRule {
            agent: agent.to_string(),
            field,
            reason: "must be an array of strings".to_string(),
        }),
    }
}

fn require_percentage(
    agent: &str,
    details: &Map<String, Value>,
    field: &'static str,
) -> ValidationResult {
    match details.get(field) {
        None => Ok(()),
        Some(Value::Number(n)) => {
            let value = n.as_f64().unwrap_or(f64::NAN);
            if (0.0..=100.0).contains(&value) {
                Ok(())
            } else {
                Err(ValidationError::AgentRule {
                    agent: agent.to_string(),
                    field,
                    reason: format!("{value} outside [0, 100]"),
                })
            }
        }
        Some(_) => Err(ValidationError::AgentRule {
            agent: agent.to_string(),
            field,
            reason: "must be a number".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::HandoffId;
    use crate::time_provider::TimeProvider;
    use crate::handoff::{
        ArtifactSet, HandoffContent, HandoffMetadata, HandoffStatus, Priority, ValidationSection,
    };
    use crate::time_provider::MockTimeProvider;
    use chrono::Utc;

    fn valid_handoff() -> Handoff {
        let metadata = HandoffMetadata {
            project_name: "demo".to_string(),
            from_agent: "api-expert".to_string(),
            to_agent: "golang-expert".to_string(),
            timestamp: Utc::now(),
            task_context: "implement login".to_string(),
            priority: Priority::Normal,
            handoff_id: Some(HandoffId::generate()),
        };
        let content = HandoffContent {
            summary: "Implement login endpoint per OpenAPI".to_string(),
            requirements: vec!["JWT auth".to_string()],
            artifacts: ArtifactSet::default(),
            technical_details: Map::new(),
            next_steps: vec![],
        };
        let checksum = crate::handoff::compute_checksum(&metadata, &content).unwrap();
        Handoff {
            metadata,
            content,
            validation: ValidationSection {
                schema_version: "1.1".to_string(),
                checksum,
            },
            status: HandoffStatus::Pending,
            created_at: None,
            updated_at: None,
            retry_count: 0,
            error_msg: None,
        }
    }

    fn validator() -> Validator {
        Validator::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(MockTimeProvider::new()),
        )
    }

    #[test]
    fn test_should_accept_handoff_when_all_rules_pass() {
        assert_eq!(validator().validate(&valid_handoff()), Ok(()));
    }

    #[test]
    fn test_should_reject_handoff_when_from_and_to_agent_are_equal() {
        let mut handoff = valid_handoff();
        handoff.metadata.to_agent = handoff.metadata.from_agent.clone();

        let err = validator().validate(&handoff).unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "to_agent", .. }));
    }

    #[test]
    fn test_should_enforce_summary_boundaries_when_validating_length() {
        let validator = validator();

        for (len, ok) in [(9, false), (10, true), (1000, true), (1001, false)] {
            let mut handoff = valid_handoff();
            handoff.content.summary = "x".repeat(len);
            handoff.refresh_checksum().unwrap();
            assert_eq!(
                validator.validate(&handoff).is_ok(),
                ok,
                "summary length {len}"
            );
        }
    }

    #[test]
    fn test_should_enforce_timestamp_window_when_validating_metadata() {
        let time = Arc::new(MockTimeProvider::new());
        let validator = Validator::new(Arc::new(AgentRegistry::new()), time.clone());

        let mut handoff = valid_handoff();
        handoff.metadata.timestamp = time.now_utc() + ChronoDuration::minutes(59);
        assert!(validator.validate(&handoff).is_ok());

        handoff.metadata.timestamp = time.now_utc() + ChronoDuration::minutes(61);
        let err = validator.validate(&handoff).unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "timestamp", .. }));

        handoff.metadata.timestamp = time.now_utc() - ChronoDuration::hours(25);
        let err = validator.validate(&handoff).unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "timestamp", .. }));
    }

    #[test]
    fn test_should_reject_handoff_when_requirements_are_absent() {
        let mut handoff = valid_handoff();
        handoff.content.requirements.clear();

        let err = validator().validate(&handoff).unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "requirements", .. }));
    }

    #[test]
    fn test_should_reject_handoff_when_schema_version_is_unknown() {
        let mut handoff = valid_handoff();
        handoff.validation.schema_version = "9.9".to_string();

        let err = validator().validate(&handoff).unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "schema_version", .. }));
    }

    #[test]
    fn test_should_reject_artifact_when_path_repeats_across_buckets() {
        let mut handoff = valid_handoff();
        handoff.content.artifacts.created = vec!["src/login.go".to_string()];
        handoff.content.artifacts.modified = vec!["src/login.go".to_string()];
        handoff.refresh_checksum().unwrap();

        let err = validator().validate(&handoff).unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "artifacts", .. }));
    }

    #[test]
    fn test_should_reject_artifact_when_path_charset_is_invalid() {
        let mut handoff = valid_handoff();
        handoff.content.artifacts.created = vec!["src/log in.go".to_string()];
        handoff.refresh_checksum().unwrap();

        let err = validator().validate(&handoff).unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "artifacts", .. }));
    }

    #[test]
    fn test_should_apply_agent_rules_when_target_is_golang_expert() {
        let mut handoff = valid_handoff();
        handoff
            .content
            .technical_details
            .insert("handlers".to_string(), serde_json::json!("not-an-array"));
        handoff.refresh_checksum().unwrap();

        let err = validator().validate(&handoff).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::AgentRule { field: "handlers", .. }
        ));

        let mut handoff = valid_handoff();
        handoff
            .content
            .technical_details
            .insert("test_coverage".to_string(), serde_json::json!(101));
        handoff.refresh_checksum().unwrap();
        assert!(validator().validate(&handoff).is_err());
    }

    #[test]
    fn test_should_skip_agent_rules_when_target_agent_is_unknown() {
        let mut handoff = valid_handoff();
        handoff.metadata.to_agent = "mystery-agent".to_string();
        handoff
            .content
            .technical_details
            .insert("handlers".to_string(), serde_json::json!(42));
        handoff.refresh_checksum().unwrap();

        assert!(validator().validate(&handoff).is_ok());
    }

    #[test]
    fn test_should_require_registration_when_registry_is_populated() {
        let registry = Arc::new(AgentRegistry::new());
        registry.register(crate::broker::registry::AgentCapability::new(
            crate::domain_types::AgentName::try_new("api-expert".to_string()).unwrap(),
        ));
        let validator = Validator::new(registry, Arc::new(MockTimeProvider::new()));

        // golang-expert is not registered.
        let err = validator.validate(&valid_handoff()).unwrap_err();
        assert!(matches!(err, ValidationError::Field { field: "to_agent", .. }));
    }

    #[test]
    fn test_should_be_idempotent_when_sanitizing_twice() {
        let mut handoff = valid_handoff();
        handoff.metadata.task_context = "  padded  ".to_string();
        handoff.content.requirements = vec!["  JWT auth ".to_string(), "  ".to_string()];
        handoff.content.artifacts.created =
            vec!["src//api///login.go/".to_string(), " ".to_string()];

        sanitize(&mut handoff);
        let once = handoff.clone();
        sanitize(&mut handoff);

        assert_eq!(handoff, once);
        assert_eq!(handoff.metadata.task_context, "padded");
        assert_eq!(handoff.content.requirements, vec!["JWT auth"]);
        assert_eq!(handoff.content.artifacts.created, vec!["src/api/login.go"]);
    }

    #[test]
    fn test_should_normalize_paths_when_slashes_repeat() {
        assert_eq!(normalize_path("a//b/"), "a/b");
        assert_eq!(normalize_path("/a"), "/a");
        assert_eq!(normalize_path("  "), "");
    }
}
