//! Telephony media-streaming WebSocket handler.
//!
//! `GET /call/stream` receives the provider's media socket for a call that
//! call control answered or placed. The pipeline shape follows the
//! configured streaming mode: the transcription/media variants run the
//! classic 16 kHz pipeline, realtime voice runs the 24 kHz bypass.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::StreamingMode;
use crate::session::conductor::SessionConductor;
use crate::session::record::TransportKind;
use crate::state::AppState;
use crate::transport::{MAX_MESSAGE_BYTES, split_telephony};

#[derive(Debug, Deserialize)]
pub struct MediaStreamParams {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Caller id forwarded by call control, when known.
    #[serde(default)]
    pub participant: Option<String>,
}

/// `GET /call/stream` — WebSocket upgrade for the provider's media stream.
pub async fn media_stream_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<MediaStreamParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| serve_media(socket, state, params))
}

async fn serve_media(socket: WebSocket, state: Arc<AppState>, params: MediaStreamParams) {
    let session_id = params
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(session_id = %session_id, "telephony media stream connected");

    let kind = match state.config.streaming_mode {
        StreamingMode::RealtimeVoice => TransportKind::TelephonyRealtime,
        _ => TransportKind::TelephonyMedia,
    };
    let cancel = state.register_session(&session_id);
    let (source, sink) = split_telephony(socket, state.config.sample_rate(), kind);

    let result = SessionConductor::run(
        state.conductor_deps(),
        Box::new(source),
        Box::new(sink),
        session_id.clone(),
        params.participant,
        cancel,
    )
    .await;

    if let Err(e) = result {
        warn!(session_id = %session_id, error = %e, "telephony session ended with error");
    }
    state.unregister_session(&session_id);
}
