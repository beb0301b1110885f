use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::AppState;

/// `GET /ws`: upgrade to WebSocket.
pub(crate) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Per-connection logic: forward every coordinator event as one JSON text
/// frame.  Client messages other than close are ignored.
async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let mut events_rx = state.coordinator.events().subscribe();

    let hello = serde_json::json!({
        "type": "hello",
        "agent_id": state.coordinator.agent_id(),
    });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let json = match event {
                    Ok(ev) => match serde_json::to_string(&ev) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(error = %e, "ws: failed to serialize event");
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "ws client lagging");
                        serde_json::json!({ "type": "lagged", "skipped": skipped }).to_string()
                    }
                    Err(RecvError::Closed) => break,
                };
                if socket.send(Message::Text(json)).await.is_err() {
                    break; // client disconnected
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("ws recv error: {e}");
                        break;
                    }
                    _ => {} // ping/pong/text/binary: ignore
                }
            }
        }
    }
}
