//! Browser voice WebSocket handler.
//!
//! `GET /realtime` upgrades to the browser dialect and hands the socket to a
//! session conductor. Browser sessions are always pinned to 16 kHz and run
//! the classic STT → orchestrator → TTS pipeline.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::session::conductor::SessionConductor;
use crate::state::AppState;
use crate::transport::{MAX_MESSAGE_BYTES, split_browser};

/// Browser sessions always run at 16 kHz regardless of pipeline mode.
const BROWSER_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Deserialize)]
pub struct RealtimeParams {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// `GET /realtime` — WebSocket upgrade for browser voice conversations.
pub async fn realtime_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<RealtimeParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| serve_browser(socket, state, params.session_id))
}

async fn serve_browser(socket: WebSocket, state: Arc<AppState>, session_id: Option<String>) {
    let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(session_id = %session_id, "browser conversation connected");

    let cancel = state.register_session(&session_id);
    let (source, sink) = split_browser(socket, BROWSER_SAMPLE_RATE);

    let result = SessionConductor::run(
        state.conductor_deps(),
        Box::new(source),
        Box::new(sink),
        session_id.clone(),
        None,
        cancel,
    )
    .await;

    if let Err(e) = result {
        warn!(session_id = %session_id, error = %e, "browser session ended with error");
    }
    state.unregister_session(&session_id);
}
