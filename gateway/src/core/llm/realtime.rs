//! Realtime voice client.
//!
//! Audio-to-audio session over the realtime WebSocket API: caller PCM is
//! appended to the input buffer, the model's reply comes back as audio deltas
//! plus user/assistant transcripts. Sessions created through this client run
//! at 24 kHz and bypass the orchestrator and turn router entirely.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{RealtimeVoice, RealtimeVoiceSession};
use crate::audio::{AudioFrame, FrameChunker};
use crate::core::ClientError;
use crate::core::stt::TranscriptEvent;

/// Realtime sessions always run at the provider's native 24 kHz.
pub const REALTIME_SAMPLE_RATE: u32 = 24_000;

const AUDIO_CHANNEL_DEPTH: usize = 64;
const TRANSCRIPT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct RealtimeVoiceConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ServerEvent {
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },
    #[serde(rename = "response.audio_transcript.delta")]
    AssistantTranscriptDelta { delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    UserTranscript { transcript: String },
    #[serde(rename = "error")]
    Error { error: serde_json::Value },
    #[serde(other)]
    Other,
}

/// Realtime voice handle over one provider WebSocket connection per session.
pub struct RealtimeVoiceGateway {
    config: RealtimeVoiceConfig,
}

impl RealtimeVoiceGateway {
    pub fn new(config: RealtimeVoiceConfig) -> Result<Self, ClientError> {
        if config.api_key.is_empty() {
            return Err(ClientError::ConfigurationError(
                "realtime API key is required".into(),
            ));
        }
        Ok(Self { config })
    }
}

#[async_trait]
impl RealtimeVoice for RealtimeVoiceGateway {
    async fn start(
        &mut self,
        instructions: &str,
        voice: &str,
        cancel: CancellationToken,
    ) -> Result<RealtimeVoiceSession, ClientError> {
        let url = format!("{}?model={}", self.config.endpoint, self.config.model);
        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::ConfigurationError(format!("invalid realtime endpoint: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.config.api_key)
                .parse()
                .map_err(|_| ClientError::ConfigurationError("malformed API key".into()))?,
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("realtime connect failed: {e}")))?;
        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let session_update = json!({
            "type": "session.update",
            "session": {
                "instructions": instructions,
                "voice": voice,
                "input_audio_format": "pcm16",
                "output_audio_format": "pcm16",
                "input_audio_transcription": { "model": "whisper-1" },
                "turn_detection": { "type": "server_vad", "interrupt_response": true },
            }
        });
        ws_sink
            .send(Message::Text(session_update.to_string().into()))
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("realtime setup failed: {e}")))?;

        info!(model = %self.config.model, "realtime voice session started");

        let (audio_in_tx, mut audio_in_rx) = mpsc::channel::<AudioFrame>(AUDIO_CHANNEL_DEPTH);
        let (audio_out_tx, audio_out_rx) = mpsc::channel(AUDIO_CHANNEL_DEPTH);
        let (transcript_tx, transcript_rx) = mpsc::channel(TRANSCRIPT_CHANNEL_DEPTH);

        tokio::spawn(async move {
            let mut chunker = FrameChunker::new(REALTIME_SAMPLE_RATE);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }

                    frame = audio_in_rx.recv() => {
                        let Some(frame) = frame else {
                            let _ = ws_sink.send(Message::Close(None)).await;
                            break;
                        };
                        let append = json!({
                            "type": "input_audio_buffer.append",
                            "audio": BASE64.encode(&frame.pcm),
                        });
                        if let Err(e) = ws_sink.send(Message::Text(append.to_string().into())).await {
                            error!("realtime audio send failed: {e}");
                            break;
                        }
                    }

                    message = ws_stream.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerEvent>(text.as_str()) {
                                    Ok(ServerEvent::AudioDelta { delta }) => {
                                        let Ok(pcm) = BASE64.decode(&delta) else {
                                            warn!("bad realtime audio delta");
                                            continue;
                                        };
                                        for frame in chunker.push(&pcm) {
                                            if audio_out_tx.send(frame).await.is_err() {
                                                return;
                                            }
                                        }
                                    }
                                    Ok(ServerEvent::AssistantTranscriptDelta { delta }) => {
                                        let event = TranscriptEvent::Partial {
                                            text: delta,
                                            stability: 1.0,
                                            offset_ms: 0,
                                        };
                                        let _ = transcript_tx.try_send(event);
                                    }
                                    Ok(ServerEvent::UserTranscript { transcript }) => {
                                        let event = TranscriptEvent::Final {
                                            text: transcript,
                                            offset_ms: 0,
                                            duration_ms: 0,
                                        };
                                        let _ = transcript_tx.try_send(event);
                                    }
                                    Ok(ServerEvent::Error { error }) => {
                                        error!("realtime provider error: {error}");
                                        break;
                                    }
                                    Ok(ServerEvent::Other) => {}
                                    Err(e) => debug!("unparseable realtime event: {e}"),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("realtime socket closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("realtime socket error: {e}");
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(RealtimeVoiceSession {
            audio_tx: audio_in_tx,
            audio_rx: audio_out_rx,
            transcript_rx,
        })
    }

    fn provider_info(&self) -> &'static str {
        "realtime voice API"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_empty_api_key() {
        let result = RealtimeVoiceGateway::new(RealtimeVoiceConfig {
            endpoint: "wss://llm.example.com/v1/realtime".into(),
            api_key: String::new(),
            model: "gpt-realtime".into(),
        });
        assert!(matches!(result, Err(ClientError::ConfigurationError(_))));
    }

    #[test]
    fn test_server_event_parses_audio_delta() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"response.audio.delta","delta":"AAAA"}"#).unwrap();
        assert!(matches!(event, ServerEvent::AudioDelta { .. }));
    }

    #[test]
    fn test_server_event_tolerates_unknown_types() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"session.created","session":{}}"#).unwrap();
        assert!(matches!(event, ServerEvent::Other));
    }

    #[test]
    fn test_user_transcript_becomes_final() {
        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"conversation.item.input_audio_transcription.completed","transcript":"hi"}"#,
        )
        .unwrap();
        assert!(matches!(event, ServerEvent::UserTranscript { .. }));
    }
}
