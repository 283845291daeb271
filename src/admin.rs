/// Admin HTTP surface for a worker: queue stats, dead-letter listing and
/// replay, scaling and warm-up status
///
/// The external API layer proxies these routes; nothing here mutates queue
/// state except DLQ replay and explicit message deletion.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::error::QueueError;
use crate::message::QueueMessage;
use crate::queue::{QueueManager, QueueStats};
use crate::scaler::{AutoScaler, WorkerPoolSnapshot};
use crate::warmer::ResourceWarmer;

#[derive(Clone)]
pub struct AdminState {
    pub queue: Arc<QueueManager>,
    pub scaler: Option<Arc<AutoScaler>>,
    pub warmer: Option<Arc<ResourceWarmer>>,
}

impl AdminState {
    pub fn new(queue: Arc<QueueManager>) -> Self {
        Self {
            queue,
            scaler: None,
            warmer: None,
        }
    }

    pub fn with_scaler(mut self, scaler: Arc<AutoScaler>) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn with_warmer(mut self, warmer: Arc<ResourceWarmer>) -> Self {
        self.warmer = Some(warmer);
        self
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/dlq", get(list_dlq))
        .route("/queue/dlq/:message_id/replay", post(replay_dlq_message))
        .route("/queue/messages/:message_id", delete(delete_message))
        .route("/scaling", get(scaling_state))
        .route("/cache/status", get(cache_status))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

#[derive(Debug, Deserialize)]
pub struct ReplayRequest {
    pub subject: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResponse {
    pub message_id: String,
    pub subject: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub is_warmed: bool,
}

/// Health check endpoint (liveness)
async fn health_check(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.queue.service_name(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness: broker connected and, when a warmer is configured, warmed up
async fn readiness_check(
    State(state): State<Arc<AdminState>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let stats = state.queue.get_queue_stats().await;
    let warmed = state
        .warmer
        .as_ref()
        .map(|w| w.check_cache_status())
        .unwrap_or(true);

    if stats.connected && warmed {
        Ok(Json(serde_json::json!({
            "status": "ready",
            "service": stats.service,
            "nats": "connected"
        })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

async fn queue_stats(State(state): State<Arc<AdminState>>) -> Json<QueueStats> {
    Json(state.queue.get_queue_stats().await)
}

async fn list_dlq(State(state): State<Arc<AdminState>>) -> Json<Vec<QueueMessage>> {
    Json(state.queue.list_dlq_messages().await)
}

async fn replay_dlq_message(
    State(state): State<Arc<AdminState>>,
    Path(message_id): Path<String>,
    Json(request): Json<ReplayRequest>,
) -> Result<Json<ReplayResponse>, AppError> {
    if request.subject.trim().is_empty() {
        return Err(AppError::ValidationError("subject must not be empty".to_string()));
    }

    let message_id = state
        .queue
        .republish_dlq_message(&message_id, &request.subject)
        .await?;

    Ok(Json(ReplayResponse {
        message_id,
        subject: request.subject,
        status: "republished".to_string(),
    }))
}

async fn delete_message(
    State(state): State<Arc<AdminState>>,
    Path(message_id): Path<String>,
) -> Result<Json<QueueMessage>, AppError> {
    Ok(Json(state.queue.delete_message(&message_id).await?))
}

async fn scaling_state(
    State(state): State<Arc<AdminState>>,
) -> Result<Json<WorkerPoolSnapshot>, StatusCode> {
    match &state.scaler {
        Some(scaler) => Ok(Json(scaler.state().await.snapshot())),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn cache_status(State(state): State<Arc<AdminState>>) -> Json<CacheStatus> {
    let is_warmed = state
        .warmer
        .as_ref()
        .map(|w| w.check_cache_status())
        .unwrap_or(true);
    Json(CacheStatus { is_warmed })
}

// Error handling

#[derive(Debug)]
enum AppError {
    ValidationError(String),
    NotFound(String),
    InternalError(String),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::DlqNotFound(_) | QueueError::MessageNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            other => AppError::InternalError(other.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(serde_json::json!({
            "error": message
        }))).into_response()
    }
}
