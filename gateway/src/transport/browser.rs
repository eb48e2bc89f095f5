//! Browser WebSocket dialect.
//!
//! JSON-framed control and audio messages. Inbound audio is base64 PCM16 at
//! the session rate in 20 ms frames; outbound mirrors the same shape plus
//! transcript, state, agent and error broadcasts. The socket is split so the
//! reader and writer tasks own their halves independently.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{MAX_MESSAGE_BYTES, TransportEvent, TransportPush, TransportSink, TransportSource};
use crate::audio;
use crate::errors::BridgeError;
use crate::session::record::{SessionState, TransportKind};

fn default_sample_rate() -> u32 {
    16_000
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BrowserInbound {
    Audio {
        data: String,
        #[serde(default = "default_sample_rate")]
        sr: u32,
    },
    Text {
        text: String,
    },
    Interrupt,
    Reset,
    Hangup,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BrowserOutbound<'a> {
    Audio {
        data: String,
    },
    Transcript {
        role: &'a str,
        text: &'a str,
        #[serde(rename = "final")]
        is_final: bool,
    },
    State {
        state: SessionState,
    },
    Agent {
        key: &'a str,
    },
    Error {
        code: &'a str,
        message: &'a str,
    },
}

/// Split one upgraded browser socket into its reader and writer halves.
pub fn split_browser(socket: WebSocket, sample_rate: u32) -> (BrowserSource, BrowserSink) {
    let (sink, stream) = socket.split();
    (
        BrowserSource {
            stream,
            sample_rate,
            clock_us: 0,
        },
        BrowserSink { sink },
    )
}

/// Inbound half of a browser connection.
pub struct BrowserSource {
    stream: SplitStream<WebSocket>,
    sample_rate: u32,
    /// Running position of inbound audio, in microseconds.
    clock_us: u64,
}

impl BrowserSource {
    fn parse_text(&mut self, text: &str) -> Result<TransportEvent, BridgeError> {
        if text.len() > MAX_MESSAGE_BYTES {
            return Err(BridgeError::protocol(format!(
                "message of {} bytes exceeds the {} byte cap",
                text.len(),
                MAX_MESSAGE_BYTES
            )));
        }

        let inbound: BrowserInbound = serde_json::from_str(text)
            .map_err(|e| BridgeError::protocol(format!("malformed browser message: {e}")))?;

        match inbound {
            BrowserInbound::Audio { data, sr } => {
                let frame = audio::decode_frame(&data, sr, self.sample_rate, self.clock_us)
                    .map_err(|e| BridgeError::protocol(e.to_string()))?;
                self.clock_us += frame.duration_us();
                Ok(TransportEvent::Audio(frame))
            }
            BrowserInbound::Text { text } => Ok(TransportEvent::Text(text)),
            BrowserInbound::Interrupt => Ok(TransportEvent::Interrupt),
            BrowserInbound::Reset => Ok(TransportEvent::Reset),
            BrowserInbound::Hangup => Ok(TransportEvent::Hangup),
        }
    }
}

#[async_trait]
impl TransportSource for BrowserSource {
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
                Message::Text(text) => return self.parse_text(text.as_str()),
                Message::Close(_) => return Ok(TransportEvent::Closed),
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Binary(_) => {
                    // The browser dialect is JSON-only.
                    return Err(BridgeError::protocol(
                        "unexpected binary frame on browser transport",
                    ));
                }
            }
        }
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Browser
    }
}

/// Outbound half of a browser connection.
pub struct BrowserSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl TransportSink for BrowserSink {
    async fn send(&mut self, push: TransportPush) -> Result<(), BridgeError> {
        let json = match &push {
            TransportPush::Audio(frame) => serde_json::to_string(&BrowserOutbound::Audio {
                data: audio::encode_frame(frame),
            }),
            TransportPush::Transcript {
                role,
                text,
                is_final,
            } => serde_json::to_string(&BrowserOutbound::Transcript {
                role,
                text,
                is_final: *is_final,
            }),
            TransportPush::State(state) => {
                serde_json::to_string(&BrowserOutbound::State { state: *state })
            }
            TransportPush::Agent(key) => serde_json::to_string(&BrowserOutbound::Agent { key }),
            TransportPush::Error { code, message } => {
                serde_json::to_string(&BrowserOutbound::Error { code, message })
            }
            // The browser flushes its own playback when frames stop.
            TransportPush::StopAudio => return Ok(()),
        };

        let json = json.map_err(|e| BridgeError::internal(format!("serialize push: {e}")))?;
        self.sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| BridgeError::transport(format!("websocket send failed: {e}")))
    }

    async fn close(&mut self, code: u16) {
        debug!(code, "closing browser transport");
        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        if let Err(e) = self.sink.send(Message::Close(Some(frame))).await {
            warn!("browser close failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn test_inbound_audio_parses() {
        let data = base64::engine::general_purpose::STANDARD.encode([0u8; 640]);
        let json = format!(r#"{{"type":"audio","data":"{data}","sr":16000}}"#);
        let inbound: BrowserInbound = serde_json::from_str(&json).unwrap();
        assert!(matches!(inbound, BrowserInbound::Audio { sr: 16_000, .. }));
    }

    #[test]
    fn test_inbound_audio_defaults_to_16k() {
        let json = r#"{"type":"audio","data":"AAAA"}"#;
        let inbound: BrowserInbound = serde_json::from_str(json).unwrap();
        match inbound {
            BrowserInbound::Audio { sr, .. } => assert_eq!(sr, 16_000),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_inbound_control_messages() {
        assert!(matches!(
            serde_json::from_str::<BrowserInbound>(r#"{"type":"interrupt"}"#).unwrap(),
            BrowserInbound::Interrupt
        ));
        assert!(matches!(
            serde_json::from_str::<BrowserInbound>(r#"{"type":"hangup"}"#).unwrap(),
            BrowserInbound::Hangup
        ));
        assert!(matches!(
            serde_json::from_str::<BrowserInbound>(r#"{"type":"text","text":"hi"}"#).unwrap(),
            BrowserInbound::Text { .. }
        ));
    }

    #[test]
    fn test_outbound_state_shape() {
        let json = serde_json::to_string(&BrowserOutbound::State {
            state: SessionState::Thinking,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"state","state":"Thinking"}"#);
    }

    #[test]
    fn test_outbound_transcript_uses_final_key() {
        let json = serde_json::to_string(&BrowserOutbound::Transcript {
            role: "user",
            text: "what's the weather",
            is_final: true,
        })
        .unwrap();
        assert!(json.contains(r#""final":true"#));
        assert!(json.contains(r#""role":"user""#));
    }
}
