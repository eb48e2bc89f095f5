//! Route assembly.
//!
//! Two routers merged in `main`: the REST API (health, readiness, agents,
//! call control) and the WebSocket endpoints (browser voice, telephony
//! media, dashboard relay).

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// REST endpoints.
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::api::health))
        .route("/readiness", get(handlers::api::readiness))
        .route("/agents", get(handlers::api::agents))
        .route("/call/incoming", post(handlers::api::call_incoming))
        .route("/call/outbound", post(handlers::api::call_outbound))
        .route("/call/hangup", post(handlers::api::call_hangup))
        .layer(TraceLayer::new_for_http())
}

/// WebSocket endpoints.
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/realtime", get(handlers::realtime::realtime_handler))
        .route("/call/stream", get(handlers::media::media_stream_handler))
        .route(
            "/realtime/dashboard",
            get(handlers::dashboard::dashboard_handler),
        )
        .layer(TraceLayer::new_for_http())
}
