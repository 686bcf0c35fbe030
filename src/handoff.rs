//! Canonical handoff payload model
//!
//! The handoff is the unit of work flowing between agents: metadata,
//! content, a validation section with an integrity checksum, and lifecycle
//! fields. This module also owns the wire-observable pieces of the
//! contract: store key construction, TTL constants, the priority score
//! encoding, and the canonical serialization used for checksumming.

use crate::domain_types::HandoffId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// TTL for handoff records and metric counters
pub const HANDOFF_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL for the monitor's metrics snapshot
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(60 * 60);

/// Probation window for active-agent membership
pub const ACTIVE_AGENT_PROBATION: Duration = Duration::from_secs(5 * 60);

/// Cap on retained processing-time samples
pub const PROCESSING_TIMES_CAP: usize = 100;

/// Key of the processing-time sample list
pub const PROCESSING_TIMES_KEY: &str = "handoff:processing_times";

/// Key of the active-agent set
pub const ACTIVE_AGENTS_KEY: &str = "handoff:active_agents";

/// Key of the total-published counter
pub const METRICS_TOTAL_KEY: &str = "handoff:metrics:total";

/// Key of the completed counter
pub const METRICS_COMPLETED_KEY: &str = "handoff:metrics:completed";

/// Key of the failed counter
pub const METRICS_FAILED_KEY: &str = "handoff:metrics:failed";

/// Key of the metrics snapshot
pub const METRICS_SNAPSHOT_KEY: &str = "handoff:metrics:snapshot";

/// Prefix shared by all handoff record keys
pub const HANDOFF_KEY_PREFIX: &str = "handoff:";

/// Prefix shared by all queue keys
pub const QUEUE_KEY_PREFIX: &str = "handoff:project:";

/// Canonical queue key for a project/agent pair
#[must_use]
pub fn queue_key(project: &str, agent: &str) -> String {
    format!("handoff:project:{project}:queue:{agent}")
}

/// Store key of a handoff record
#[must_use]
pub fn handoff_key(id: HandoffId) -> String {
    format!("handoff:{id}")
}

/// Store key of a dead-lettered handoff
#[must_use]
pub fn dead_letter_key(id: HandoffId) -> String {
    format!("handoff:dead:{id}")
}

/// Handoff priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work
    Low,
    /// Default priority
    #[default]
    Normal,
    /// Expedited work
    High,
    /// Preempts everything else in the queue
    Critical,
}

impl Priority {
    /// Integer base of the queue score; lower dequeues first
    #[must_use]
    pub fn base_score(self) -> f64 {
        match self {
            Self::Critical => 1.0,
            Self::High => 2.0,
            Self::Normal => 3.0,
            Self::Low => 4.0,
        }
    }

    /// Parses the lowercase wire name, `None` for unknown values
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Modulus keeping the score tail below 1.0; one period is ~31.7 years
const SCORE_TAIL_MODULUS: i64 = 1_000_000_000_000_000_000;

/// Queue score for a handoff published now
///
/// `base + (now_nanos mod 1e18) / 1e18`: the integer part ranks priority
/// bands, the sub-1.0 tail preserves FIFO within a band for ~30 years
/// between wraps. Consumers must not rely on exact score equality; the
/// store breaks score ties by insertion order.
#[must_use]
pub fn priority_score(priority: Priority, now_nanos: i64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let tail = now_nanos.rem_euclid(SCORE_TAIL_MODULUS) as f64 / 1e18;
    priority.base_score() + tail
}

/// Handoff lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    /// Queued, awaiting dispatch
    #[default]
    Pending,
    /// Claimed by a consumer worker
    Processing,
    /// Handler succeeded
    Completed,
    /// Handler failed terminally
    Failed,
    /// Scheduled for a retry attempt
    Retrying,
    /// Removed by admin action before dispatch
    Cancelled,
}

impl HandoffStatus {
    /// True for states with no outgoing transitions
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the lifecycle DAG permits `self -> next`
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Processing | Self::Cancelled),
            Self::Processing => {
                matches!(next, Self::Completed | Self::Failed | Self::Retrying)
            }
            // A retrying handoff is either re-dispatched directly or returned
            // to pending by the reconciler.
            Self::Retrying => matches!(next, Self::Pending | Self::Processing),
            Self::Completed | Self::Failed | Self::Cancelled => false,
        }
    }
}

/// Artifact paths grouped by the action taken on them
///
/// A path may appear in at most one bucket; the validator enforces this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    /// Paths created by the producing agent
    #[serde(default)]
    pub created: Vec<String>,
    /// Paths modified by the producing agent
    #[serde(default)]
    pub modified: Vec<String>,
    /// Paths reviewed without modification
    #[serde(default)]
    pub reviewed: Vec<String>,
}

impl ArtifactSet {
    /// Iterates all paths across the three buckets
    pub fn all_paths(&self) -> impl Iterator<Item = &String> {
        self.created
            .iter()
            .chain(self.modified.iter())
            .chain(self.reviewed.iter())
    }
}

/// Handoff routing and identification metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffMetadata {
    /// Project the handoff is scoped to
    pub project_name: String,
    /// Producing agent
    pub from_agent: String,
    /// Target agent; may be empty when the producer defers to the router
    #[serde(default)]
    pub to_agent: String,
    /// Producer wall-clock timestamp, UTC
    pub timestamp: DateTime<Utc>,
    /// Short description of why the handoff exists
    pub task_context: String,
    /// Queue priority
    #[serde(default)]
    pub priority: Priority,
    /// Opaque 128-bit identifier; filled by the broker when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff_id: Option<HandoffId>,
}

/// Handoff work description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffContent {
    /// Human-readable summary of the work
    pub summary: String,
    /// Concrete requirements for the target agent
    pub requirements: Vec<String>,
    /// Artifact paths the producer touched
    #[serde(default)]
    pub artifacts: ArtifactSet,
    /// Free-form agent-specific extension payload
    #[serde(default)]
    pub technical_details: Map<String, Value>,
    /// Suggested follow-up steps
    #[serde(default)]
    pub next_steps: Vec<String>,
}

/// Schema version and integrity checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSection {
    /// Payload schema version
    pub schema_version: String,
    /// 64-hex-char SHA-256 over the canonical metadata + content
    pub checksum: String,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            checksum: String::new(),
        }
    }
}

/// Schema version written by this broker
pub const CURRENT_SCHEMA_VERSION: &str = "1.1";

/// Schema versions this broker accepts
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &["1.0", "1.1"];

/// A single structured work item flowing between agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    /// Routing and identification metadata
    pub metadata: HandoffMetadata,
    /// Work description
    pub content: HandoffContent,
    /// Schema version and checksum
    #[serde(default)]
    pub validation: ValidationSection,
    /// Lifecycle status
    #[serde(default)]
    pub status: HandoffStatus,
    /// When the broker accepted the handoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last status transition time; monotonic per handoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Retry attempts so far
    #[serde(default)]
    pub retry_count: u32,
    /// Failure message of the most recent attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl Handoff {
    /// Recomputes and stores the integrity checksum
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized
    pub fn refresh_checksum(&mut self) -> Result<(), serde_json::Error> {
        self.validation.checksum = compute_checksum(&self.metadata, &self.content)?;
        Ok(())
    }

    /// Verifies the stored checksum against the current payload
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized
    pub fn verify_checksum(&self) -> Result<bool, serde_json::Error> {
        Ok(self.validation.checksum == compute_checksum(&self.metadata, &self.content)?)
    }
}

/// The wrapping message persisted under `handoff:{id}` and referenced from
/// queues by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    /// Handoff identifier
    pub handoff_id: HandoffId,
    /// Queue the handoff was enqueued on
    pub queue: String,
    /// Enqueue time
    pub timestamp: DateTime<Utc>,
    /// Priority at enqueue time
    pub priority: Priority,
    /// The handoff itself
    pub payload: Handoff,
}

/// Canonical serialization: lexicographically sorted object keys, compact
/// separators
///
/// Round-tripping through `serde_json::Value` sorts keys (its object map is
/// ordered); `to_string` emits no insignificant whitespace. Serialize →
/// deserialize → serialize is byte-stable under this form.
///
/// # Errors
///
/// Returns an error if `value` cannot be represented as JSON
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let tree = serde_json::to_value(value)?;
    serde_json::to_string(&tree)
}

/// SHA-256 (lower hex) over the canonical metadata + content
///
/// # Errors
///
/// Returns an error if either section cannot be serialized
pub fn compute_checksum(
    metadata: &HandoffMetadata,
    content: &HandoffContent,
) -> Result<String, serde_json::Error> {
    let combined = serde_json::json!({
        "metadata": metadata,
        "content": content,
    });
    let canonical = canonical_json(&combined)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{digest:x}"))
}

/// True when `s` has the shape of a SHA-256 checksum (64 lower-hex chars)
#[must_use]
pub fn is_checksum_shaped(s: &str) -> bool {
    s.len() == 64
        && s.chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_handoff() -> Handoff {
        Handoff {
            metadata: HandoffMetadata {
                project_name: "demo".to_string(),
                from_agent: "api-expert".to_string(),
                to_agent: "golang-expert".to_string(),
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
            status: HandoffStatus::Pending,
            created_at: None,
            updated_at: None,
            retry_count: 0,
            error_msg: None,
        }
    }

    #[test]
    fn test_should_order_priorities_when_comparing_base_scores() {
        assert!(Priority::Critical.base_score() < Priority::High.base_score());
        assert!(Priority::High.base_score() < Priority::Normal.base_score());
        assert!(Priority::Normal.base_score() < Priority::Low.base_score());
    }

    #[test]
    fn test_should_keep_score_within_band_when_publish_times_are_adjacent() {
        let a = priority_score(Priority::Normal, 1_700_000_000_000_000_000);
        let b = priority_score(Priority::Normal, 1_700_000_001_000_000_000);
        assert!(a <= b, "score must be monotone in publish time");
        assert!((3.0..4.0).contains(&a), "normal band, got {a}");
        // Any critical item beats any normal item regardless of age.
        let critical = priority_score(Priority::Critical, 1_999_999_999_999_999_999);
        assert!(critical < a);
        assert!((1.0..2.0).contains(&critical));
    }

    #[test]
    fn test_should_follow_lifecycle_dag_when_checking_transitions() {
        use HandoffStatus::{Cancelled, Completed, Failed, Pending, Processing, Retrying};
        assert!(Pending.can_transition_to(Processing));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Processing));
        assert!(Failed.is_terminal());
    }

    #[test]
    fn test_should_verify_checksum_when_payload_is_unchanged() {
        let mut handoff = sample_handoff();
        handoff.refresh_checksum().unwrap();

        assert!(handoff.verify_checksum().unwrap());
        assert!(is_checksum_shaped(&handoff.validation.checksum));
    }

    #[test]
    fn test_should_fail_checksum_when_payload_mutated_after_publish() {
        let mut handoff = sample_handoff();
        handoff.refresh_checksum().unwrap();

        handoff.content.summary = "tampered summary text".to_string();

        assert!(!handoff.verify_checksum().unwrap());
    }

    #[test]
    fn test_should_produce_byte_stable_output_when_reserializing_canonical_form() {
        let mut handoff = sample_handoff();
        handoff.refresh_checksum().unwrap();

        let first = canonical_json(&handoff).unwrap();
        let reparsed: Handoff = serde_json::from_str(&first).unwrap();
        let second = canonical_json(&reparsed).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_should_sort_object_keys_when_serializing_canonically() {
        let value = serde_json::json!({"zebra": 1, "alpha": 2});
        assert_eq!(canonical_json(&value).unwrap(), "{\"alpha\":2,\"zebra\":1}");
    }

    #[test]
    fn test_should_reject_checksum_shape_when_not_lower_hex_64() {
        assert!(!is_checksum_shaped("abc"));
        assert!(!is_checksum_shaped(&"A".repeat(64)));
        assert!(is_checksum_shaped(&"a1".repeat(32)));
    }

    #[test]
    fn test_should_default_priority_to_normal_when_field_is_absent() {
        let json = r#"{
            "project_name": "demo",
            "from_agent": "a",
            "timestamp": "2026-01-01T00:00:00Z",
            "task_context": "ctx"
        }"#;
        let metadata: HandoffMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(metadata.priority, Priority::Normal);
        assert!(metadata.to_agent.is_empty());
    }

    #[test]
    fn test_should_build_wire_observable_keys_when_formatting() {
        let id = HandoffId::generate();
        assert_eq!(
            queue_key("demo", "golang-expert"),
            "handoff:project:demo:queue:golang-expert"
        );
        assert!(handoff_key(id).starts_with("handoff:"));
        assert!(dead_letter_key(id).starts_with("handoff:dead:"));
    }
}
