//! Rule-driven content routing
//!
//! When a producer leaves `to_agent` empty, the router classifies the
//! handoff content and picks a target: rules are looked up by originating
//! agent, evaluated in descending priority, and the first full match wins.
//! Misses fall back to a configured agent. Resolution never fails once a
//! fallback is configured, and malformed rules are skipped at load.

use crate::handoff::Handoff;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

/// Routing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    /// No rule matched and no fallback agent is configured
    #[error("no routing rule matched for handoff from {from_agent} and no fallback is configured")]
    NoTarget {
        /// Originating agent
        from_agent: String,
    },
}

/// Comparison operator for a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Exact equality
    Equals,
    /// Substring containment
    Contains,
    /// Wildcard match; `*` matches any run of characters
    Matches,
    /// Numeric greater-than
    GreaterThan,
    /// Numeric less-than
    LessThan,
}

/// Content field a condition selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentField {
    /// The handoff summary
    Summary,
    /// The task context from metadata
    TaskContext,
    /// Any single requirement entry
    Requirements,
    /// Any single next-step entry
    NextSteps,
}

/// Artifact bucket a condition scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactBucket {
    /// Created paths only
    Created,
    /// Modified paths only
    Modified,
    /// Reviewed paths only
    Reviewed,
    /// All three buckets
    Any,
}

/// How a complex condition combines its children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// All children must hold
    All,
    /// At least one child must hold
    Any,
}

/// A single routing condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// Text comparison against a content field
    Content {
        /// Field to inspect
        field: ContentField,
        /// Comparison operator
        operator: Operator,
        /// Comparison value
        value: String,
        /// Whether the comparison is case-sensitive
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Scan of artifact paths
    ArtifactPresent {
        /// Bucket to scan
        bucket: ArtifactBucket,
        /// Comparison operator
        operator: Operator,
        /// Comparison value (path, substring, or wildcard pattern)
        value: String,
        /// Whether the comparison is case-sensitive
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Comparison against a technical-details entry
    TechnicalDetail {
        /// Key into `technical_details`
        key: String,
        /// Comparison operator
        operator: Operator,
        /// Comparison value
        value: Value,
        /// Whether string comparisons are case-sensitive
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Combination of nested conditions
    Complex {
        /// Combination mode
        mode: MatchMode,
        /// Child conditions
        conditions: Vec<Condition>,
    },
}

/// A transform applied to the routed copy of a handoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// Merge a key/value pair into `technical_details`
    SetTechnicalDetail {
        /// Key to set
        key: String,
        /// Value to store
        value: Value,
    },
}

/// A routing rule owned by an originating agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Rule name for logs
    pub name: String,
    /// Agent the handoff is routed to when the rule fires
    pub target_agent: String,
    /// Evaluation priority; higher evaluates first
    pub priority: i32,
    /// Conditions; the rule fires iff all hold
    pub conditions: Vec<Condition>,
    /// Transforms applied to the routed copy
    #[serde(default)]
    pub transforms: Vec<Transform>,
}

/// Wildcard match where `*` matches any run of characters
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

fn text_matches(operator: Operator, value: &str, candidate: &str, case_sensitive: bool) -> bool {
    let (value, candidate) = if case_sensitive {
        (value.to_string(), candidate.to_string())
    } else {
        (value.to_lowercase(), candidate.to_lowercase())
    };
    match operator {
        Operator::Equals => candidate == value,
        Operator::Contains => candidate.contains(&value),
        Operator::Matches => wildcard_match(&value, &candidate),
        // Numeric operators never hold on text.
        Operator::GreaterThan | Operator::LessThan => false,
    }
}

impl Condition {
    /// Whether the condition holds for the handoff
    #[must_use]
    pub fn holds(&self, handoff: &Handoff) -> bool {
        match self {
            Self::Content {
                field,
                operator,
                value,
                case_sensitive,
            } => {
                let candidates: Vec<&str> = match field {
                    ContentField::Summary => vec![handoff.content.summary.as_str()],
                    ContentField::TaskContext => vec![handoff.metadata.task_context.as_str()],
                    ContentField::Requirements => handoff
                        .content
                        .requirements
                        .iter()
                        .map(String::as_str)
                        .collect(),
                    ContentField::NextSteps => handoff
                        .content
                        .next_steps
                        .iter()
                        .map(String::as_str)
                        .collect(),
                };
                candidates
                    .iter()
                    .any(|c| text_matches(*operator, value, c, *case_sensitive))
            }
            Self::ArtifactPresent {
                bucket,
                operator,
                value,
                case_sensitive,
            } => {
                let artifacts = &handoff.content.artifacts;
                let paths: Vec<&String> = match bucket {
                    ArtifactBucket::Created => artifacts.created.iter().collect(),
                    ArtifactBucket::Modified => artifacts.modified.iter().collect(),
                    ArtifactBucket::Reviewed => artifacts.reviewed.iter().collect(),
                    ArtifactBucket::Any => artifacts.all_paths().collect(),
                };
                paths
                    .iter()
                    .any(|p| text_matches(*operator, value, p, *case_sensitive))
            }
            Self::TechnicalDetail {
                key,
                operator,
                value,
                case_sensitive,
            } => {
                let Some(actual) = handoff.content.technical_details.get(key) else {
                    return false;
                };
                match (operator, actual, value) {
                    (Operator::GreaterThan, Value::Number(a), Value::Number(v)) => {
                        a.as_f64().zip(v.as_f64()).is_some_and(|(a, v)| a > v)
                    }
                    (Operator::LessThan, Value::Number(a), Value::Number(v)) => {
                        a.as_f64().zip(v.as_f64()).is_some_and(|(a, v)| a < v)
                    }
                    (op, Value::String(a), Value::String(v)) => {
                        text_matches(*op, v, a, *case_sensitive)
                    }
                    (Operator::Equals, a, v) => a == v,
                    _ => false,
                }
            }
            Self::Complex { mode, conditions } => match mode {
                MatchMode::All => conditions.iter().all(|c| c.holds(handoff)),
                MatchMode::Any => conditions.iter().any(|c| c.holds(handoff)),
            },
        }
    }
}

/// Rule-driven content router
pub struct ContentRouter {
    rules: RwLock<HashMap<String, Vec<RoutingRule>>>,
    fallback_agent: Option<String>,
}

impl ContentRouter {
    /// Creates a router with an optional fallback agent
    #[must_use]
    pub fn new(fallback_agent: Option<String>) -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
            fallback_agent,
        }
    }

    /// Loads the rule list for an originating agent
    ///
    /// Malformed rules (empty name or target, no conditions) are skipped
    /// with a warning. Rules are kept sorted by descending priority.
    pub fn load_rules(&self, from_agent: impl Into<String>, rules: Vec<RoutingRule>) {
        let from_agent = from_agent.into();
        let mut kept: Vec<RoutingRule> = rules
            .into_iter()
            .filter(|rule| {
                let well_formed = !rule.name.is_empty()
                    && !rule.target_agent.is_empty()
                    && !rule.conditions.is_empty();
                if !well_formed {
                    warn!(
                        from_agent = %from_agent,
                        rule = %rule.name,
                        "skipping malformed routing rule"
                    );
                }
                well_formed
            })
            .collect();
        kept.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.rules
            .write()
            .expect("router lock poisoned")
            .insert(from_agent, kept);
    }

    /// Resolves a target agent, returning a routed copy of the handoff
    ///
    /// The input handoff is never mutated. On a rule match the copy has
    /// `to_agent` rewritten and the rule's transforms applied; on a miss
    /// the fallback agent is used.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::NoTarget` when nothing matched and no
    /// fallback is configured
    pub fn resolve(&self, handoff: &Handoff) -> Result<Handoff, RoutingError> {
        let rules = self.rules.read().expect("router lock poisoned");
        if let Some(agent_rules) = rules.get(&handoff.metadata.from_agent) {
            for rule in agent_rules {
                if rule.conditions.iter().all(|c| c.holds(handoff)) {
                    debug!(
                        rule = %rule.name,
                        target = %rule.target_agent,
                        "routing rule matched"
                    );
                    let mut routed = handoff.clone();
                    routed.metadata.to_agent = rule.target_agent.clone();
                    for transform in &rule.transforms {
                        let Transform::SetTechnicalDetail { key, value } = transform;
                        routed
                            .content
                            .technical_details
                            .insert(key.clone(), value.clone());
                    }
                    return Ok(routed);
                }
            }
            warn!(
                from_agent = %handoff.metadata.from_agent,
                "no routing rule matched, using fallback"
            );
        }
        match &self.fallback_agent {
            Some(fallback) => {
                let mut routed = handoff.clone();
                routed.metadata.to_agent = fallback.clone();
                Ok(routed)
            }
            None => Err(RoutingError::NoTarget {
                from_agent: handoff.metadata.from_agent.clone(),
            }),
        }
    }
}

/// Artifact scan: any `.go` file present
#[must_use]
pub fn has_go_files() -> Condition {
    Condition::ArtifactPresent {
        bucket: ArtifactBucket::Any,
        operator: Operator::Matches,
        value: "*.go".to_string(),
        case_sensitive: false,
    }
}

/// Artifact scan: any TypeScript file present
#[must_use]
pub fn has_typescript_files() -> Condition {
    Condition::Complex {
        mode: MatchMode::Any,
        conditions: ["*.ts", "*.tsx"]
            .iter()
            .map(|pattern| Condition::ArtifactPresent {
                bucket: ArtifactBucket::Any,
                operator: Operator::Matches,
                value: (*pattern).to_string(),
                case_sensitive: false,
            })
            .collect(),
    }
}

/// Artifact scan: any test file present
#[must_use]
pub fn has_test_files() -> Condition {
    Condition::Complex {
        mode: MatchMode::Any,
        conditions: ["*_test.go", "*.test.ts", "*.spec.ts", "tests/*"]
            .iter()
            .map(|pattern| Condition::ArtifactPresent {
                bucket: ArtifactBucket::Any,
                operator: Operator::Matches,
                value: (*pattern).to_string(),
                case_sensitive: false,
            })
            .collect(),
    }
}

/// Artifact scan: an API specification present
#[must_use]
pub fn has_api_spec() -> Condition {
    Condition::Complex {
        mode: MatchMode::Any,
        conditions: ["*openapi*", "*swagger*"]
            .iter()
            .map(|pattern| Condition::ArtifactPresent {
                bucket: ArtifactBucket::Any,
                operator: Operator::Matches,
                value: (*pattern).to_string(),
                case_sensitive: false,
            })
            .collect(),
    }
}

/// Summary keyword scan: implementation work
#[must_use]
pub fn is_implementation_handoff() -> Condition {
    Condition::Content {
        field: ContentField::Summary,
        operator: Operator::Contains,
        value: "implement".to_string(),
        case_sensitive: false,
    }
}

/// Summary keyword scan: testing work
#[must_use]
pub fn is_testing_handoff() -> Condition {
    Condition::Content {
        field: ContentField::Summary,
        operator: Operator::Contains,
        value: "test".to_string(),
        case_sensitive: false,
    }
}

/// Summary keyword scan: deployment work
#[must_use]
pub fn is_deployment_handoff() -> Condition {
    Condition::Content {
        field: ContentField::Summary,
        operator: Operator::Contains,
        value: "deploy".to_string(),
        case_sensitive: false,
    }
}
