//! Telephony media-streaming dialect.
//!
//! The provider's envelope: JSON messages with a `kind` discriminator.
//! Inbound carries `AudioData` chunks (base64 PCM16 with an ISO-8601
//! timestamp and a silence marker) and `StopAudio`; outbound mirrors
//! `AudioData` and uses `StopAudio` to flush the far-end playback buffer on
//! barge-in. Transcript, state and agent pushes have no wire representation
//! here and are skipped.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{MAX_MESSAGE_BYTES, TransportEvent, TransportPush, TransportSink, TransportSource};
use crate::audio;
use crate::errors::BridgeError;
use crate::session::record::TransportKind;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum MediaEnvelope {
    AudioData {
        #[serde(rename = "audioData")]
        audio_data: AudioPayload,
    },
    StopAudio,
}

#[derive(Debug, Serialize, Deserialize)]
struct AudioPayload {
    data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    silent: Option<bool>,
}

/// Split one upgraded media socket into its reader and writer halves.
/// `kind` distinguishes the 16 kHz transcription pipeline from the 24 kHz
/// realtime variant.
pub fn split_telephony(
    socket: WebSocket,
    sample_rate: u32,
    kind: TransportKind,
) -> (TelephonySource, TelephonySink) {
    let (sink, stream) = socket.split();
    (
        TelephonySource {
            stream,
            sample_rate,
            clock_us: 0,
            kind,
        },
        TelephonySink { sink },
    )
}

/// Inbound half of a telephony media connection.
pub struct TelephonySource {
    stream: SplitStream<WebSocket>,
    sample_rate: u32,
    clock_us: u64,
    kind: TransportKind,
}

impl TelephonySource {
    fn parse_text(&mut self, text: &str) -> Result<Option<TransportEvent>, BridgeError> {
        if text.len() > MAX_MESSAGE_BYTES {
            return Err(BridgeError::protocol(format!(
                "message of {} bytes exceeds the {} byte cap",
                text.len(),
                MAX_MESSAGE_BYTES
            )));
        }

        let envelope: MediaEnvelope = serde_json::from_str(text)
            .map_err(|e| BridgeError::protocol(format!("malformed media envelope: {e}")))?;

        match envelope {
            MediaEnvelope::AudioData { audio_data } => {
                // Silent keep-alive chunks carry no speech; skip the decode.
                if audio_data.silent.unwrap_or(false) {
                    return Ok(None);
                }
                let frame = audio::decode_frame(
                    &audio_data.data,
                    self.sample_rate,
                    self.sample_rate,
                    self.clock_us,
                )
                .map_err(|e| BridgeError::protocol(e.to_string()))?;
                self.clock_us += frame.duration_us();
                Ok(Some(TransportEvent::Audio(frame)))
            }
            MediaEnvelope::StopAudio => Ok(Some(TransportEvent::Hangup)),
        }
    }
}

#[async_trait]
impl TransportSource for TelephonySource {
    async fn receive(&mut self) -> Result<TransportEvent, BridgeError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    return Err(BridgeError::transport(format!("websocket error: {e}")));
                }
                None => return Ok(TransportEvent::Closed),
            };

            match message {
                Message::Text(text) => {
                    if let Some(event) = self.parse_text(text.as_str())? {
                        return Ok(event);
                    }
                }
                Message::Close(_) => return Ok(TransportEvent::Closed),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Binary(_) => {
                    return Err(BridgeError::protocol(
                        "unexpected binary frame on media transport",
                    ));
                }
            }
        }
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

/// Outbound half of a telephony media connection.
pub struct TelephonySink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl TransportSink for TelephonySink {
    async fn send(&mut self, push: TransportPush) -> Result<(), BridgeError> {
        let envelope = match &push {
            TransportPush::Audio(frame) => MediaEnvelope::AudioData {
                audio_data: AudioPayload {
                    data: audio::encode_frame(frame),
                    timestamp: None,
                    silent: None,
                },
            },
            TransportPush::StopAudio => MediaEnvelope::StopAudio,
            // No wire representation in the media dialect.
            TransportPush::Transcript { .. }
            | TransportPush::State(_)
            | TransportPush::Agent(_)
            | TransportPush::Error { .. } => return Ok(()),
        };

        let json = serde_json::to_string(&envelope)
            .map_err(|e| BridgeError::internal(format!("serialize envelope: {e}")))?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| BridgeError::transport(format!("websocket send failed: {e}")))
    }

    async fn close(&mut self, code: u16) {
        debug!(code, "closing telephony transport");
        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            warn!("telephony close failed: {e}");
        }
    }
}
