use axum::{extract::State, response::IntoResponse, Json};

use super::super::AppState;

/// `GET /api/status`
pub(crate) async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let platforms = coordinator.transports().platforms().await;
    let jobs = coordinator.scheduler().list().await.len();

    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "agent_id": coordinator.agent_id(),
        "uptime_secs": state.started.elapsed().as_secs(),
        "platforms": platforms,
        "queue": coordinator.queue().stats(),
        "pending_approvals": coordinator.approvals().pending_count(),
        "jobs": jobs,
    }))
}
