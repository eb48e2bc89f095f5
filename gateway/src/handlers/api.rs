//! REST endpoints: health, readiness, agent listing, call control.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::errors::{BridgeError, ErrorKind};
use crate::session::store::SessionStore;
use crate::state::AppState;
use crate::telephony::{CallEventEnvelope, INCOMING_CALL_EVENT};

/// REST-facing error: maps the gateway taxonomy onto status codes without
/// leaking internals.
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Protocol => StatusCode::BAD_REQUEST,
            ErrorKind::Config => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Upstream | ErrorKind::Timeout => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "error": self.0.kind.to_string(),
            "message": self.0.message,
        }));
        (status, body).into_response()
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.active_sessions(),
    })
}

#[derive(Serialize)]
pub struct ReadinessCheck {
    pub component: &'static str,
    pub status: &'static str,
    pub check_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: Vec<ReadinessCheck>,
}

/// `GET /readiness`
pub async fn readiness(State(state): State<Arc<AppState>>) -> Json<ReadinessResponse> {
    let mut checks = Vec::new();

    let started = Instant::now();
    let store_check = state.store.ping().await;
    checks.push(ReadinessCheck {
        component: "session_store",
        status: if store_check.is_ok() {
            "healthy"
        } else {
            "unhealthy"
        },
        check_time_ms: started.elapsed().as_millis() as u64,
        details: store_check.err().map(|e| e.to_string()),
    });

    for (component, healthy) in [
        ("stt_pool", state.stt_pool.is_healthy()),
        ("tts_pool", state.tts_pool.is_healthy()),
        ("llm_pool", state.llm_pool.is_healthy()),
    ] {
        checks.push(ReadinessCheck {
            component,
            status: if healthy { "healthy" } else { "unhealthy" },
            check_time_ms: 0,
            details: None,
        });
    }

    let status = if checks.iter().all(|c| c.status == "healthy") {
        "healthy"
    } else {
        "unhealthy"
    };
    Json(ReadinessResponse { status, checks })
}

#[derive(Serialize)]
pub struct AgentSummary {
    pub key: String,
    pub display_name: String,
}

#[derive(Serialize)]
pub struct AgentsResponse {
    pub status: &'static str,
    pub agents: Vec<AgentSummary>,
}

/// `GET /agents`
pub async fn agents(State(state): State<Arc<AppState>>) -> Json<AgentsResponse> {
    let agents = state
        .orchestrator
        .registry()
        .specs()
        .map(|spec| AgentSummary {
            key: spec.key.clone(),
            display_name: spec.display_name.clone(),
        })
        .collect();
    Json(AgentsResponse {
        status: "ok",
        agents,
    })
}

/// `POST /call/incoming` — provider webhook. The provider posts a batch of
/// events; we answer the first incoming-call event with a media streaming
/// directive pointing at `/call/stream`.
pub async fn call_incoming(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let envelopes: Vec<CallEventEnvelope> = if body.is_array() {
        serde_json::from_value(body)
            .map_err(|e| BridgeError::protocol(format!("malformed event batch: {e}")))?
    } else {
        vec![
            serde_json::from_value(body)
                .map_err(|e| BridgeError::protocol(format!("malformed event: {e}")))?,
        ]
    };

    for envelope in &envelopes {
        if envelope.event_type.contains(INCOMING_CALL_EVENT) {
            let directive = state.call_control.answer(envelope).await?;
            info!(session_id = %directive.session_id, "incoming call routed to media stream");
            return Ok(Json(directive).into_response());
        }
        // Lifecycle events (connected, disconnected) are informational.
        info!(event = %envelope.event_type, "call event received");
    }

    Ok(Json(json!({ "status": "ignored" })).into_response())
}

#[derive(Deserialize)]
pub struct OutboundCallRequest {
    pub target: String,
    #[serde(default)]
    pub session_hint: Option<String>,
}

#[derive(Serialize)]
pub struct OutboundCallResponse {
    pub session_id: String,
}

/// `POST /call/outbound`
pub async fn call_outbound(
    State(state): State<Arc<AppState>>,
    Json(request): Json<OutboundCallRequest>,
) -> Result<Json<OutboundCallResponse>, ApiError> {
    let session_id = state
        .call_control
        .place_outbound_call(&request.target, request.session_hint.as_deref())
        .await?;
    Ok(Json(OutboundCallResponse { session_id }))
}

#[derive(Deserialize)]
pub struct HangupRequest {
    pub session_id: String,
}

/// `POST /call/hangup`
pub async fn call_hangup(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HangupRequest>,
) -> StatusCode {
    if state.hangup_session(&request.session_id) {
        StatusCode::NO_CONTENT
    } else {
        warn!(session_id = %request.session_id, "hangup for unknown session");
        StatusCode::NOT_FOUND
    }
}
