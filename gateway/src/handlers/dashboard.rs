//! Dashboard relay WebSocket handler.
//!
//! `GET /realtime/dashboard?session_id=…` attaches an observer to a
//! session's event feed. Strictly best-effort: no persistence, no replay
//! after a restart, and a saturated observer just misses events.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tracing::{debug, info};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DashboardParams {
    pub session_id: String,
}

/// `GET /realtime/dashboard` — WebSocket upgrade for session observers.
pub async fn dashboard_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<DashboardParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| serve_dashboard(socket, state, params.session_id))
}

async fn serve_dashboard(mut socket: WebSocket, state: Arc<AppState>, session_id: String) {
    info!(session_id = %session_id, "dashboard observer attached");
    let mut events = state.dashboard.attach(&session_id);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(envelope) = event else { break };
                if socket.send(Message::Text(envelope.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Observers only listen; pings keep the socket alive.
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(session_id = %session_id, error = %e, "dashboard socket error");
                        break;
                    }
                }
            }
        }
    }

    info!(session_id = %session_id, "dashboard observer detached");
}
