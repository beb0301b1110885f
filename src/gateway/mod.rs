//! HTTP + WebSocket operational surface.
//!
//! Starts with `clawd start` unless `gateway.enabled` is false.  Serves:
//! - `GET    /api/status`          : agent, uptime, queue stats, platforms
//! - `GET    /api/queue`           : every live conversation queue
//! - `GET    /api/queue/:key`      : one conversation's queue
//! - `POST   /api/queue/:key/abort`: abort the running turn
//! - `GET    /api/jobs`            : scheduled jobs
//! - `DELETE /api/jobs/:id`        : cancel a job
//! - `GET    /ws`                  : coordinator events as JSON
//!
//! When `CLAWD_API_TOKEN` is set every route requires it as a bearer
//! token (or `?token=`).

mod auth;
mod handlers;
mod ws;

use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::config::GatewayConfig;
use crate::coordinator::RunCoordinator;

/// Environment variable holding the API bearer token.
pub const API_TOKEN_ENV: &str = "CLAWD_API_TOKEN";

/// Handle returned by [`start_gateway`].
pub struct Gateway {
    /// Server task handle.
    pub handle: JoinHandle<()>,
    /// The address the server is actually listening on.
    pub addr: SocketAddr,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) coordinator: RunCoordinator,
    pub(crate) api_token: Option<String>,
    pub(crate) started: Instant,
}

/// Read the API token from the environment; empty counts as unset.
pub fn api_token_from_env() -> Option<String> {
    std::env::var(API_TOKEN_ENV).ok().filter(|s| !s.is_empty())
}

fn router(state: AppState) -> Router {
    let api_router = Router::new()
        .route("/status", get(handlers::status::api_status))
        .route("/queue", get(handlers::queue::api_queue_list))
        .route("/queue/:key", get(handlers::queue::api_queue_get))
        .route("/queue/:key/abort", post(handlers::queue::api_queue_abort))
        .route("/jobs", get(handlers::jobs::api_jobs_list))
        .route("/jobs/:id", axum::routing::delete(handlers::jobs::api_jobs_cancel))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    let ws_router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    Router::new()
        .nest("/api", api_router)
        .merge(ws_router)
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Start the gateway on `addr`.
pub async fn start_gateway(
    addr: SocketAddr,
    coordinator: RunCoordinator,
    api_token: Option<String>,
) -> std::io::Result<Gateway> {
    if api_token.is_some() {
        info!("API authentication enabled ({API_TOKEN_ENV} set)");
    } else {
        warn!("API authentication disabled ({API_TOKEN_ENV} not set)");
    }

    let state = AppState {
        coordinator,
        api_token,
        started: Instant::now(),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("gateway server error: {e}");
        }
    });

    info!(%bound_addr, "gateway started");

    Ok(Gateway {
        handle,
        addr: bound_addr,
    })
}

/// Start the gateway as configured.  Returns `None` when disabled or when
/// the address can't be bound; the daemon keeps running either way.
pub async fn spawn_gateway_if_enabled(cfg: &GatewayConfig, coordinator: RunCoordinator) -> Option<Gateway> {
    if !cfg.enabled {
        info!("gateway disabled in config");
        return None;
    }

    let addr = match cfg.socket_addr() {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "invalid gateway address");
            return None;
        }
    };

    match start_gateway(addr, coordinator, api_token_from_env()).await {
        Ok(gw) => Some(gw),
        Err(e) => {
            warn!(%addr, error = %e, "failed to start gateway");
            None
        }
    }
}
