//! Telephony provider integration
//!
//! The provider's call-control API is an external collaborator: we consume
//! its webhook events and issue answer/place/hangup RPCs. The media stream
//! itself arrives over the `/call/stream` WebSocket handled by the
//! transports.

mod call_control;

pub use call_control::{
    AnswerDirective, CallControl, CallControlConfig, CallEventEnvelope, INCOMING_CALL_EVENT,
};
