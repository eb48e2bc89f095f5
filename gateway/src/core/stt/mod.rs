//! Streaming speech recognition
//!
//! A [`SpeechRecognizer`] is one exclusive, long-lived streaming handle leased
//! from the STT pool. Audio goes in through a cloneable frame sink; partial
//! and final transcripts come back out as an explicit event stream.

mod client;

pub use client::{StreamingSttClient, SttClientConfig};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::ClientError;
use crate::audio::AudioFrame;

/// One transcription event from the recognizer.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    /// Unstable hypothesis produced while the utterance is still in flight.
    Partial {
        text: String,
        /// Provider's confidence that this hypothesis will survive, in [0, 1].
        stability: f32,
        offset_ms: u64,
    },
    /// The single, settled transcript for a finished utterance.
    Final {
        text: String,
        offset_ms: u64,
        duration_ms: u64,
    },
}

impl TranscriptEvent {
    pub fn text(&self) -> &str {
        match self {
            TranscriptEvent::Partial { text, .. } | TranscriptEvent::Final { text, .. } => text,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, TranscriptEvent::Final { .. })
    }
}

/// Event surfaced by a recognizer handle: either a transcript or an upstream
/// failure the session has to react to.
#[derive(Debug)]
pub enum RecognizerEvent {
    Transcript(TranscriptEvent),
    Error(ClientError),
}

/// Exclusive streaming recognizer handle.
///
/// The frame sink is a bounded channel so a stalled upstream exerts
/// backpressure on the transport reader instead of buffering unboundedly;
/// the reader decides whether to wait or drop (voice quality over
/// completeness).
#[async_trait]
pub trait SpeechRecognizer: Send {
    /// Cloneable sender the transport reader pushes decoded frames into.
    fn frame_sink(&self) -> mpsc::Sender<AudioFrame>;

    /// Next transcript or error. `None` once the handle has shut down.
    async fn next_event(&mut self) -> Option<RecognizerEvent>;

    /// Drain pending events and clear utterance state so the handle can be
    /// returned to the pool for another session.
    async fn reset(&mut self) -> Result<(), ClientError>;

    /// Tear the underlying connection down.
    async fn close(&mut self);

    fn provider_info(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_event_accessors() {
        let partial = TranscriptEvent::Partial {
            text: "what's the".into(),
            stability: 0.4,
            offset_ms: 120,
        };
        assert_eq!(partial.text(), "what's the");
        assert!(!partial.is_final());

        let fin = TranscriptEvent::Final {
            text: "what's the weather".into(),
            offset_ms: 120,
            duration_ms: 900,
        };
        assert!(fin.is_final());
    }

    #[test]
    fn test_transcript_event_wire_shape() {
        let fin = TranscriptEvent::Final {
            text: "hello".into(),
            offset_ms: 0,
            duration_ms: 420,
        };
        let json = serde_json::to_string(&fin).unwrap();
        assert!(json.contains(r#""type":"final""#));
        assert!(json.contains(r#""duration_ms":420"#));
    }
}
