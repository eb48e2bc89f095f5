//! Call transports
//!
//! Two wire dialects, one internal interface. The browser speaks JSON control
//! and audio messages over `/realtime`; the telephony provider speaks its
//! kind/audioData envelope over `/call/stream`. Both normalize into
//! [`TransportEvent`]s for the conductor and accept [`TransportPush`]es from
//! the writer task; pushes a dialect cannot express are silently skipped.

pub mod browser;
pub mod telephony;

pub use browser::{BrowserSink, BrowserSource, split_browser};
pub use telephony::{TelephonySink, TelephonySource, split_telephony};

use async_trait::async_trait;

use crate::audio::AudioFrame;
use crate::errors::BridgeError;
use crate::session::record::{SessionState, TransportKind};

/// Maximum size of a single inbound message.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Inactivity window after which the connection closes with code 1000.
pub const IDLE_TIMEOUT_SECS: u64 = 30;

/// Outbound frames buffered toward the socket; the high-water mark that
/// pauses synthesis when the caller reads slowly.
pub const OUTBOUND_HIGH_WATER: usize = 64;

/// Close code for a clean shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for a protocol violation.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Inbound message, normalized across dialects.
#[derive(Debug)]
pub enum TransportEvent {
    Audio(AudioFrame),
    /// Typed text treated as a finalized utterance (browser only).
    Text(String),
    /// Explicit barge-in request (browser only).
    Interrupt,
    /// Clear conversational state (browser only).
    Reset,
    /// Caller asked to end the call (or the provider sent StopAudio).
    Hangup,
    /// The socket closed.
    Closed,
}

/// Outbound message, normalized across dialects.
#[derive(Debug, Clone)]
pub enum TransportPush {
    Audio(AudioFrame),
    Transcript {
        role: &'static str,
        text: String,
        is_final: bool,
    },
    State(SessionState),
    Agent(String),
    Error {
        code: String,
        message: String,
    },
    /// Tell the far side to flush any buffered playback (barge-in).
    StopAudio,
}

/// Inbound half of a caller connection, owned by the conductor's reader.
#[async_trait]
pub trait TransportSource: Send {
    /// Next inbound event. Malformed traffic surfaces as a `Protocol` error;
    /// a vanished peer surfaces as `Transport`.
    async fn receive(&mut self) -> Result<TransportEvent, BridgeError>;

    fn kind(&self) -> TransportKind;
}

/// Outbound half of a caller connection, owned by the writer task.
#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, push: TransportPush) -> Result<(), BridgeError>;

    async fn close(&mut self, code: u16);
}
