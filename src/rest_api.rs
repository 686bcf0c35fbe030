//! Thin admin HTTP surface over the broker
//!
//! CRUD over the same store the broker uses, kept deliberately thin:
//! handlers parse at the boundary and delegate to broker APIs. Every
//! response carries a request id; error bodies echo it alongside a short
//! message and the underlying cause (never internal traces).

use crate::broker::monitor::Monitor;
use crate::broker::traits::BrokerError;
use crate::broker::HandoffBroker;
use crate::domain_types::HandoffId;
use crate::handoff::{Handoff, HandoffContent, HandoffMetadata, HandoffStatus, Priority};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::{Extension, Router};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

/// Header carrying the request id
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Default page size for listings
const DEFAULT_PAGE_SIZE: u32 = 20;

/// Maximum page size for listings
const MAX_PAGE_SIZE: u32 = 100;

/// Request id propagated through handlers and echoed in responses
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Simple token bucket guarding the publish endpoint
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_second: f64) -> Self {
        Self {
            capacity: per_second,
            tokens: per_second,
            refill_per_sec: per_second,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Shared state for the admin router
#[derive(Clone)]
pub struct ApiState {
    broker: Arc<HandoffBroker>,
    monitor: Option<Arc<Monitor>>,
    publish_limiter: Arc<Mutex<TokenBucket>>,
}

impl ApiState {
    /// Creates state over a broker and optional monitor
    #[must_use]
    pub fn new(broker: Arc<HandoffBroker>, monitor: Option<Arc<Monitor>>) -> Self {
        Self {
            broker,
            monitor,
            publish_limiter: Arc::new(Mutex::new(TokenBucket::new(100.0))),
        }
    }
}

/// Error body shape: request id, short message, optional cause
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Echoed request id
    pub request_id: String,
    /// Short message
    pub error: String,
    /// Underlying cause message, when helpful
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

struct ApiError {
    status: StatusCode,
    error: &'static str,
    details: Option<String>,
    request_id: String,
}

impl ApiError {
    fn from_broker(err: &BrokerError, request_id: &RequestId) -> Self {
        let (status, error) = match err {
            BrokerError::Validation { .. } => (StatusCode::BAD_REQUEST, "validation failed"),
            BrokerError::Routing { .. } => (StatusCode::BAD_REQUEST, "routing failed"),
            BrokerError::InvalidTransition { .. } => {
                (StatusCode::BAD_REQUEST, "invalid status transition")
            }
            BrokerError::NotFound { .. } => (StatusCode::NOT_FOUND, "handoff not found"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };
        Self {
            status,
            error,
            details: Some(err.to_string()),
            request_id: request_id.0.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                request_id: self.request_id,
                error: self.error.to_string(),
                details: self.details,
            }),
        )
            .into_response()
    }
}

/// Producer-visible publish request; the broker fills the rest
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    /// Project override; defaults to the broker's project
    #[serde(default)]
    pub project_name: Option<String>,
    /// Producing agent
    pub from_agent: String,
    /// Target agent; empty defers to the router
    #[serde(default)]
    pub to_agent: String,
    /// Why the handoff exists
    pub task_context: String,
    /// Queue priority
    #[serde(default)]
    pub priority: Priority,
    /// Work summary
    pub summary: String,
    /// Work requirements
    pub requirements: Vec<String>,
    /// Artifact buckets
    #[serde(default)]
    pub artifacts: crate::handoff::ArtifactSet,
    /// Agent-specific extension payload
    #[serde(default)]
    pub technical_details: serde_json::Map<String, serde_json::Value>,
    /// Suggested follow-up steps
    #[serde(default)]
    pub next_steps: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PublishResponse {
    handoff_id: String,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    page_size: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    items: Vec<serde_json::Value>,
    page: u32,
    page_size: u32,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct StatusUpdateRequest {
    status: HandoffStatus,
}

#[derive(Debug, Serialize)]
struct QueueInfo {
    name: String,
    depth: u64,
}

#[derive(Debug, Serialize)]
struct DepthResponse {
    depth: u64,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Builds the admin router
pub fn create_app(state: ApiState) -> Router {
    Router::new()
        .route("/handoffs", get(list_handoffs).post(publish_handoff))
        .route("/handoffs/{id}", get(get_handoff))
        .route("/handoffs/{id}/status", axum::routing::put(update_status))
        .route("/queues", get(list_queues))
        .route("/queues/{name}/depth", get(queue_depth))
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Assigns or propagates the request id and echoes it on the response
async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn publish_handoff(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
    Json(body): Json<PublishRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let allowed = state
        .publish_limiter
        .lock()
        .expect("limiter lock poisoned")
        .try_acquire();
    if !allowed {
        return Err(ApiError {
            status: StatusCode::TOO_MANY_REQUESTS,
            error: "rate limit exceeded",
            details: None,
            request_id: request_id.0,
        });
    }

    let handoff = Handoff {
        metadata: HandoffMetadata {
            project_name: body
                .project_name
                .unwrap_or_else(|| state.broker.project().as_str().to_string()),
            from_agent: body.from_agent,
            to_agent: body.to_agent,
            timestamp: chrono::Utc::now(),
            task_context: body.task_context,
            priority: body.priority,
            handoff_id: None,
        },
        content: HandoffContent {
            summary: body.summary,
            requirements: body.requirements,
            artifacts: body.artifacts,
            technical_details: body.technical_details,
            next_steps: body.next_steps,
        },
        validation: crate::handoff::ValidationSection::default(),
        status: HandoffStatus::Pending,
        created_at: None,
        updated_at: None,
        retry_count: 0,
        error_msg: None,
    };

    let id = state
        .broker
        .publish(handoff)
        .await
        .map_err(|e| ApiError::from_broker(&e, &request_id))?;
    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            handoff_id: id.to_string(),
        }),
    ))
}

fn parse_handoff_id(raw: &str, request_id: &RequestId) -> Result<HandoffId, ApiError> {
    raw.parse::<Uuid>()
        .map(HandoffId::new)
        .map_err(|_| ApiError {
            status: StatusCode::BAD_REQUEST,
            error: "invalid handoff id",
            details: Some("handoff id must be a UUID".to_string()),
            request_id: request_id.0.clone(),
        })
}

async fn get_handoff(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_handoff_id(&id, &request_id)?;
    let message = state
        .broker
        .get(id)
        .await
        .map_err(|e| ApiError::from_broker(&e, &request_id))?;
    Ok(Json(message))
}

async fn list_handoffs(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let ids = state
        .broker
        .list_ids()
        .await
        .map_err(|e| ApiError::from_broker(&e, &request_id))?;

    let fetched = futures::future::join_all(ids.into_iter().map(|id| {
        let broker = Arc::clone(&state.broker);
        async move { broker.get(id).await.ok() }
    }))
    .await;
    let mut items: Vec<_> = fetched
        .into_iter()
        .flatten()
        .filter(|message| {
            query
                .project
                .as_ref()
                .is_none_or(|p| p == &message.payload.metadata.project_name)
        })
        .collect();
    items.sort_by_key(|m| m.timestamp);

    let total = items.len();
    let start = ((page - 1) * page_size) as usize;
    let page_items: Vec<serde_json::Value> = items
        .into_iter()
        .skip(start)
        .take(page_size as usize)
        .filter_map(|m| serde_json::to_value(m).ok())
        .collect();

    Ok(Json(ListResponse {
        items: page_items,
        page,
        page_size,
        total,
    }))
}

async fn update_status(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_handoff_id(&id, &request_id)?;
    state
        .broker
        .force_status(id, body.status)
        .await
        .map_err(|e| ApiError::from_broker(&e, &request_id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_queues(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let prefix = query.project.as_ref().map_or_else(
        || crate::handoff::QUEUE_KEY_PREFIX.to_string(),
        |project| format!("handoff:project:{project}:"),
    );
    let names = state
        .broker
        .store()
        .list_queues(&prefix)
        .await
        .map_err(|e| {
            ApiError::from_broker(
                &BrokerError::Store {
                    operation: "list_queues",
                    handoff_id: None,
                    source: e,
                },
                &request_id,
            )
        })?;

    let mut queues = Vec::new();
    for name in names {
        let depth = state.broker.store().zcard(&name).await.unwrap_or(0);
        queues.push(QueueInfo { name, depth });
    }
    Ok(Json(queues))
}

async fn queue_depth(
    State(state): State<ApiState>,
    Extension(request_id): Extension<RequestId>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let depth = state.broker.store().zcard(&name).await.map_err(|e| {
        ApiError::from_broker(
            &BrokerError::Store {
                operation: "queue_depth",
                handoff_id: None,
                source: e,
            },
            &request_id,
        )
    })?;
    Ok(Json(DepthResponse { depth }))
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let snapshot = state.monitor.as_ref().and_then(|m| m.snapshot());
    Json(serde_json::json!({
        "status": "healthy",
        "metrics": snapshot,
    }))
}

async fn ready(State(state): State<ApiState>) -> Response {
    let health = state.broker.store().health();
    if health.healthy {
        Json(HealthResponse { status: "ready" }).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not ready",
                "last_error": health.last_error,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_allow_requests_when_bucket_has_tokens() {
        let mut bucket = TokenBucket::new(2.0);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[test]
    fn test_should_serialize_error_body_when_details_present() {
        let body = ErrorResponse {
            request_id: "req-1".to_string(),
            error: "validation failed".to_string(),
            details: Some("invalid to_agent".to_string()),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("req-1"));
        assert!(json.contains("invalid to_agent"));
    }
}
