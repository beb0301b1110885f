use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use super::super::AppState;

/// `GET /api/jobs`
pub(crate) async fn api_jobs_list(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = state.coordinator.scheduler().list().await;
    Json(serde_json::json!({ "jobs": jobs }))
}

/// `DELETE /api/jobs/:id`
pub(crate) async fn api_jobs_cancel(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    if state.coordinator.scheduler().cancel(&id).await {
        (StatusCode::OK, Json(serde_json::json!({ "cancelled": true, "id": id })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "job not found", "id": id })),
        )
    }
}
