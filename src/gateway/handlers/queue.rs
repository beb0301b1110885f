use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::info;

use super::super::AppState;
use crate::comm::ConversationKey;

/// `GET /api/queue`: every live conversation queue plus global stats.
pub(crate) async fn api_queue_list(State(state): State<AppState>) -> impl IntoResponse {
    let queue = state.coordinator.queue();
    let conversations: Vec<_> = queue
        .conversations()
        .into_iter()
        .map(|(key, status)| {
            serde_json::json!({
                "conversation_key": key,
                "pending": status.pending,
                "processing": status.processing,
            })
        })
        .collect();

    Json(serde_json::json!({
        "conversations": conversations,
        "stats": queue.stats(),
    }))
}

/// `GET /api/queue/:key`
pub(crate) async fn api_queue_get(State(state): State<AppState>, Path(key): Path<String>) -> impl IntoResponse {
    let key = ConversationKey::from(key);
    let status = state.coordinator.queue().status(&key);
    Json(serde_json::json!({
        "conversation_key": key,
        "pending": status.pending,
        "processing": status.processing,
        "awaiting_approval": state.coordinator.approvals().is_pending(&key),
    }))
}

/// `POST /api/queue/:key/abort`: cancel a pending approval and the
/// running turn.  404 when nothing was running.
pub(crate) async fn api_queue_abort(State(state): State<AppState>, Path(key): Path<String>) -> impl IntoResponse {
    let key = ConversationKey::from(key);
    let approval_cancelled = state.coordinator.approvals().cancel(&key);
    let aborted = state.coordinator.queue().abort(&key);

    if !aborted {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "no run in progress",
                "conversation_key": key,
            })),
        )
            .into_response();
    }

    info!(key = %key, "run aborted via gateway");
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "aborted": true,
            "approval_cancelled": approval_cancelled,
            "conversation_key": key,
        })),
    )
        .into_response()
}
