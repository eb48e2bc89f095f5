//! WebSocket streaming synthesizer client.
//!
//! One connection per handle, one logical stream per turn. The synthesis
//! task relays `speak` messages upstream and re-chunks whatever PCM sizes
//! the provider returns into uniform 20 ms frames.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::{SYNTHESIS_FRAME_DEPTH, SYNTHESIS_TEXT_DEPTH, SynthesisStream, Synthesizer};
use crate::audio::FrameChunker;
use crate::core::ClientError;
use tokio_util::sync::CancellationToken;

/// How long the synthesis task waits for the provider's `done` after the
/// text side closes before giving up on the tail.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TtsClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub sample_rate: u32,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Start { voice: &'a str, sample_rate: u32 },
    Speak { text: &'a str },
    Flush,
    Cancel,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Audio { data: String },
    Done,
    Error { message: String },
}

/// Streaming synthesizer over one gateway WebSocket connection.
pub struct StreamingTtsClient {
    config: TtsClientConfig,
}

impl StreamingTtsClient {
    pub fn new(config: TtsClientConfig) -> Result<Self, ClientError> {
        if config.api_key.is_empty() {
            return Err(ClientError::ConfigurationError(
                "TTS API key is required".into(),
            ));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl Synthesizer for StreamingTtsClient {
    async fn open_stream(
        &mut self,
        voice: &str,
        cancel: CancellationToken,
    ) -> Result<SynthesisStream, ClientError> {
        let mut request = self
            .config
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| ClientError::ConfigurationError(format!("invalid TTS endpoint: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.config.api_key)
                .parse()
                .map_err(|_| ClientError::ConfigurationError("malformed API key".into()))?,
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("TTS connect failed: {e}")))?;
        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let start = Outbound::Start {
            voice,
            sample_rate: self.config.sample_rate,
        };
        let start_json = serde_json::to_string(&start)
            .map_err(|e| ClientError::ProviderError(format!("serialize start: {e}")))?;
        ws_sink
            .send(Message::Text(start_json.into()))
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("TTS start failed: {e}")))?;

        info!(voice = %voice, "opened synthesis stream");

        let (text_tx, mut text_rx) = mpsc::channel::<String>(SYNTHESIS_TEXT_DEPTH);
        let (frames_tx, frames_rx) = mpsc::channel(SYNTHESIS_FRAME_DEPTH);

        let sample_rate = self.config.sample_rate;
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut chunker = FrameChunker::new(sample_rate);
            let mut text_open = true;
            let mut drain_deadline: Option<tokio::time::Instant> = None;

            loop {
                let deadline = drain_deadline;
                tokio::select! {
                    // Cancellation wins over everything else in the race.
                    biased;

                    _ = task_cancel.cancelled() => {
                        let msg = Outbound::Cancel;
                        if let Ok(json) = serde_json::to_string(&msg) {
                            let _ = ws_sink.send(Message::Text(json.into())).await;
                        }
                        debug!("synthesis stream cancelled");
                        break;
                    }

                    chunk = text_rx.recv(), if text_open => {
                        match chunk {
                            Some(text) => {
                                let msg = Outbound::Speak { text: &text };
                                let json = match serde_json::to_string(&msg) {
                                    Ok(json) => json,
                                    Err(e) => {
                                        warn!("serialize speak: {e}");
                                        continue;
                                    }
                                };
                                if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                                    error!("TTS send failed: {e}");
                                    break;
                                }
                            }
                            None => {
                                // Text side closed; flush and wait for `done`.
                                text_open = false;
                                drain_deadline = Some(tokio::time::Instant::now() + DRAIN_TIMEOUT);
                                let msg = Outbound::Flush;
                                if let Ok(json) = serde_json::to_string(&msg) {
                                    let _ = ws_sink.send(Message::Text(json.into())).await;
                                }
                            }
                        }
                    }

                    _ = async move {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending().await,
                        }
                    } => {
                        warn!("TTS drain timed out waiting for done");
                        break;
                    }

                    message = ws_stream.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<Inbound>(text.as_str()) {
                                    Ok(Inbound::Audio { data }) => {
                                        use base64::Engine;
                                        let pcm = match base64::engine::general_purpose::STANDARD
                                            .decode(&data)
                                        {
                                            Ok(pcm) => pcm,
                                            Err(e) => {
                                                warn!("bad TTS audio payload: {e}");
                                                continue;
                                            }
                                        };
                                        let mut closed = false;
                                        for frame in chunker.push(&pcm) {
                                            // A full channel here is backpressure from a
                                            // slow caller; block until it drains or the
                                            // turn is cancelled.
                                            tokio::select! {
                                                res = frames_tx.send(frame) => {
                                                    if res.is_err() { closed = true; break; }
                                                }
                                                _ = task_cancel.cancelled() => { closed = true; break; }
                                            }
                                        }
                                        if closed {
                                            break;
                                        }
                                    }
                                    Ok(Inbound::Done) => {
                                        if let Some(tail) = chunker.flush() {
                                            let _ = frames_tx.send(tail).await;
                                        }
                                        debug!("synthesis stream drained");
                                        break;
                                    }
                                    Ok(Inbound::Error { message }) => {
                                        error!("TTS provider error: {message}");
                                        break;
                                    }
                                    Err(e) => warn!("unparseable TTS message: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("TTS socket closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("TTS socket error: {e}");
                                break;
                            }
                        }
                    }
                }
            }

            let _ = timeout(Duration::from_secs(1), ws_sink.send(Message::Close(None))).await;
        });

        Ok(SynthesisStream::new(text_tx, frames_rx, cancel))
    }

    fn provider_info(&self) -> &'static str {
        "speech-gateway streaming TTS"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_empty_api_key() {
        let result = StreamingTtsClient::new(TtsClientConfig {
            endpoint: "wss://tts.example.com/v1/stream".into(),
            api_key: String::new(),
            sample_rate: 16_000,
        });
        assert!(matches!(result, Err(ClientError::ConfigurationError(_))));
    }

    #[test]
    fn test_outbound_wire_shapes() {
        let speak = serde_json::to_string(&Outbound::Speak { text: "hi" }).unwrap();
        assert_eq!(speak, r#"{"type":"speak","text":"hi"}"#);

        let start = serde_json::to_string(&Outbound::Start {
            voice: "aria",
            sample_rate: 16_000,
        })
        .unwrap();
        assert!(start.contains(r#""type":"start""#));
        assert!(start.contains(r#""voice":"aria""#));
    }

    #[test]
    fn test_inbound_audio_parses() {
        let msg: Inbound = serde_json::from_str(r#"{"type":"audio","data":"AAAA"}"#).unwrap();
        assert!(matches!(msg, Inbound::Audio { .. }));

        let done: Inbound = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert!(matches!(done, Inbound::Done));
    }
}
