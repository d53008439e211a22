//! HTTP trigger surface (/api/threads/*)

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

use crate::chain::ChainCoordinator;
use crate::queue::{ProcessorSignal, QueueStore};
use crate::worker::QueueProcessor;
use crate::{
    CallerContext, ChainError, ChainItem, Credentials, MediaType, QueueEntry, QueueStatus,
};

pub struct AppState {
    pub coordinator: ChainCoordinator,
    pub processor: Arc<QueueProcessor>,
    pub queue_store: Arc<dyn QueueStore>,
    pub signal: ProcessorSignal,
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/threads/chain", post(post_chain))
        .route("/api/threads/queue", post(trigger_queue))
        .route("/api/threads/queue/cleanup", post(cleanup_queue))
        .route("/api/threads/queue/{parent_media_id}", get(chain_queue))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum CallerMode {
    Interactive,
    Automated,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContextRequest {
    mode: CallerMode,
    #[serde(flatten)]
    credentials: Credentials,
}

impl From<ContextRequest> for CallerContext {
    fn from(req: ContextRequest) -> Self {
        match req.mode {
            CallerMode::Interactive => CallerContext::Interactive(req.credentials),
            CallerMode::Automated => CallerContext::Automated(req.credentials),
        }
    }
}

#[derive(Deserialize)]
struct PostChainRequest {
    items: Vec<ChainItem>,
    context: ContextRequest,
}

#[derive(Debug, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct PostChainResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_thread_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    thread_ids: Vec<String>,
    queued: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// POST /api/threads/chain - Publish a thread chain
async fn post_chain(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PostChainRequest>, JsonRejection>,
) -> (StatusCode, Json<PostChainResponse>) {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            warn!(error = %rejection.body_text(), "Malformed chain request");
            return (
                StatusCode::BAD_REQUEST,
                Json(PostChainResponse {
                    success: false,
                    error: Some(rejection.body_text()),
                    ..PostChainResponse::default()
                }),
            );
        }
    };
    let context = CallerContext::from(payload.context);

    match state.coordinator.post_chain(payload.items, context).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(PostChainResponse {
                success: true,
                parent_thread_id: Some(outcome.parent_thread_id),
                thread_ids: outcome.thread_ids,
                queued: outcome.queued,
                error: None,
            }),
        ),
        Err(err) => {
            let status = match &err {
                e if e.is_validation() => StatusCode::BAD_REQUEST,
                ChainError::RootPublish(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!(error = %err, "Post chain error");
            } else {
                warn!(error = %err, "Post chain rejected");
            }
            // The root may already be live; tell the caller which post it is.
            let parent_thread_id = match &err {
                ChainError::Enqueue {
                    parent_thread_id, ..
                } => Some(parent_thread_id.clone()),
                _ => None,
            };
            (
                status,
                Json(PostChainResponse {
                    success: false,
                    parent_thread_id,
                    error: Some(err.to_string()),
                    ..PostChainResponse::default()
                }),
            )
        }
    }
}

#[derive(Serialize)]
struct TriggerResponse {
    triggered: bool,
}

/// POST /api/threads/queue - Wake the queue processor
async fn trigger_queue(State(state): State<Arc<AppState>>) -> (StatusCode, Json<TriggerResponse>) {
    state.signal.raise();
    (StatusCode::ACCEPTED, Json(TriggerResponse { triggered: true }))
}

#[derive(Serialize)]
struct CleanupResponse {
    deleted: u64,
}

/// POST /api/threads/queue/cleanup - Delete old completed entries
async fn cleanup_queue(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CleanupResponse>, StatusCode> {
    let deleted = state.processor.cleanup_queue().await.map_err(|e| {
        error!(error = %e, "Queue cleanup error");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(CleanupResponse { deleted }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueEntryView {
    queue_id: String,
    thread_sequence: i32,
    media_type: MediaType,
    reply_to_id: String,
    status: QueueStatus,
    retry_count: i32,
    max_retries: i32,
    error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<QueueEntry> for QueueEntryView {
    fn from(entry: QueueEntry) -> Self {
        QueueEntryView {
            queue_id: entry.queue_id.to_string(),
            thread_sequence: entry.thread_sequence,
            media_type: entry.media_type,
            reply_to_id: entry.reply_to_id,
            status: entry.status,
            retry_count: entry.retry_count,
            max_retries: entry.max_retries,
            error: entry.error,
            created_at: entry.created_at,
            processed_at: entry.processed_at,
        }
    }
}

/// GET /api/threads/queue/:parent_media_id - Queue state of one chain
async fn chain_queue(
    State(state): State<Arc<AppState>>,
    Path(parent_media_id): Path<String>,
) -> Result<Json<Vec<QueueEntryView>>, StatusCode> {
    let entries = state
        .queue_store
        .entries_for_chain(&parent_media_id)
        .await
        .map_err(|e| {
            error!(error = %e, "List chain queue error");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    if entries.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }

    Ok(Json(entries.into_iter().map(QueueEntryView::from).collect()))
}
