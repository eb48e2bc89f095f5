//! HTTP and WebSocket request handlers
//!
//! - `api` - health, readiness, agent listing and call-control endpoints
//! - `realtime` - browser voice WebSocket (`/realtime`)
//! - `media` - telephony media-streaming WebSocket (`/call/stream`)
//! - `dashboard` - best-effort observer relay (`/realtime/dashboard`)

pub mod api;
pub mod dashboard;
pub mod media;
pub mod realtime;

pub use media::media_stream_handler;
pub use realtime::realtime_handler;
