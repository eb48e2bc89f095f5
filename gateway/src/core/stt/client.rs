//! WebSocket streaming recognizer client.
//!
//! Speaks the speech gateway's streaming protocol: a JSON `start` message
//! pins the sample rate and language, raw binary PCM follows, and the server
//! answers with JSON `partial`/`final` transcript events until a `reset` or
//! the connection closes.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use super::{RecognizerEvent, SpeechRecognizer, TranscriptEvent};
use crate::audio::AudioFrame;
use crate::core::ClientError;

/// Audio frames buffered toward the socket before the sink blocks.
const FRAME_CHANNEL_DEPTH: usize = 32;

/// Transcripts buffered toward the session before the socket task blocks.
const EVENT_CHANNEL_DEPTH: usize = 256;

/// Per-message idle timeout; catches dead upstream connections.
const WS_MESSAGE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SttClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub language: String,
    pub sample_rate: u32,
}

#[derive(Serialize)]
struct StartMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    language: &'a str,
    sample_rate: u32,
    encoding: &'static str,
}

#[derive(Serialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Partial {
        text: String,
        #[serde(default)]
        stability: f32,
        #[serde(default)]
        offset_ms: u64,
    },
    Final {
        text: String,
        #[serde(default)]
        offset_ms: u64,
        #[serde(default)]
        duration_ms: u64,
    },
    Error {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
}

enum Command {
    Reset,
    Shutdown,
}

/// Streaming recognizer over one gateway WebSocket connection.
pub struct StreamingSttClient {
    frame_tx: mpsc::Sender<AudioFrame>,
    event_rx: mpsc::Receiver<RecognizerEvent>,
    command_tx: mpsc::Sender<Command>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl StreamingSttClient {
    /// Dial the speech gateway and run the socket loop until shutdown.
    pub async fn connect(config: SttClientConfig) -> Result<Self, ClientError> {
        if config.api_key.is_empty() {
            return Err(ClientError::ConfigurationError(
                "STT API key is required".into(),
            ));
        }

        let mut request = config
            .endpoint
            .clone()
            .into_client_request()
            .map_err(|e| ClientError::ConfigurationError(format!("invalid STT endpoint: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", config.api_key)
                .parse()
                .map_err(|_| ClientError::ConfigurationError("malformed API key".into()))?,
        );

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("STT connect failed: {e}")))?;
        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        let start = StartMessage {
            kind: "start",
            language: &config.language,
            sample_rate: config.sample_rate,
            encoding: "pcm_s16le",
        };
        let start_json = serde_json::to_string(&start)
            .map_err(|e| ClientError::ProviderError(format!("serialize start: {e}")))?;
        ws_sink
            .send(Message::Text(start_json.into()))
            .await
            .map_err(|e| ClientError::ConnectionFailed(format!("STT start failed: {e}")))?;

        info!(endpoint = %config.endpoint, "connected to streaming STT");

        let (frame_tx, mut frame_rx) = mpsc::channel::<AudioFrame>(FRAME_CHANNEL_DEPTH);
        let (event_tx, event_rx) = mpsc::channel::<RecognizerEvent>(EVENT_CHANNEL_DEPTH);
        let (command_tx, mut command_rx) = mpsc::channel::<Command>(4);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(frame) = frame_rx.recv() => {
                        let payload: Bytes = frame.pcm;
                        if let Err(e) = ws_sink.send(Message::Binary(payload)).await {
                            let err = ClientError::NetworkError(format!("STT send failed: {e}"));
                            error!("{err}");
                            let _ = event_tx.try_send(RecognizerEvent::Error(err));
                            break;
                        }
                    }

                    Some(command) = command_rx.recv() => {
                        let kind = match command {
                            Command::Reset => "reset",
                            Command::Shutdown => "stop",
                        };
                        let msg = ControlMessage { kind };
                        if let Ok(json) = serde_json::to_string(&msg) {
                            let _ = ws_sink.send(Message::Text(json.into())).await;
                        }
                        if matches!(command, Command::Shutdown) {
                            let _ = ws_sink.send(Message::Close(None)).await;
                            break;
                        }
                    }

                    message = timeout(WS_MESSAGE_TIMEOUT, ws_stream.next()) => {
                        match message {
                            Ok(Some(Ok(msg))) => {
                                if !handle_server_message(msg, &event_tx).await {
                                    break;
                                }
                            }
                            Ok(Some(Err(e))) => {
                                let err = ClientError::NetworkError(format!("STT socket error: {e}"));
                                error!("{err}");
                                let _ = event_tx.try_send(RecognizerEvent::Error(err));
                                break;
                            }
                            Ok(None) => {
                                info!("STT stream ended");
                                break;
                            }
                            Err(_) => {
                                let err = ClientError::NetworkError(
                                    "STT idle timeout, no message for 60 seconds".into(),
                                );
                                error!("{err}");
                                let _ = event_tx.try_send(RecognizerEvent::Error(err));
                                break;
                            }
                        }
                    }

                    _ = &mut shutdown_rx => {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            debug!("STT socket task finished");
        });

        Ok(Self {
            frame_tx,
            event_rx,
            command_tx,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

/// Handle one server frame. Returns false when the connection should close.
async fn handle_server_message(
    msg: Message,
    event_tx: &mpsc::Sender<RecognizerEvent>,
) -> bool {
    match msg {
        Message::Text(text) => {
            match serde_json::from_str::<ServerMessage>(text.as_str()) {
                Ok(ServerMessage::Partial {
                    text,
                    stability,
                    offset_ms,
                }) => {
                    let event = TranscriptEvent::Partial {
                        text,
                        stability: stability.clamp(0.0, 1.0),
                        offset_ms,
                    };
                    if event_tx
                        .try_send(RecognizerEvent::Transcript(event))
                        .is_err()
                    {
                        warn!("dropping partial transcript, event channel full");
                    }
                }
                Ok(ServerMessage::Final {
                    text,
                    offset_ms,
                    duration_ms,
                }) => {
                    let event = TranscriptEvent::Final {
                        text,
                        offset_ms,
                        duration_ms,
                    };
                    // Finals must not be dropped; block until there is room.
                    if event_tx.send(RecognizerEvent::Transcript(event)).await.is_err() {
                        return false;
                    }
                }
                Ok(ServerMessage::Error { message, code }) => {
                    let err = match code.as_deref() {
                        Some("unauthorized") => ClientError::AuthenticationFailed(message),
                        _ => ClientError::ProviderError(message),
                    };
                    error!("STT provider error: {err}");
                    let _ = event_tx.try_send(RecognizerEvent::Error(err));
                    return false;
                }
                Err(e) => {
                    warn!("unparseable STT message: {e}");
                }
            }
            true
        }
        Message::Close(frame) => {
            info!("STT WebSocket closed: {frame:?}");
            false
        }
        Message::Ping(_) | Message::Pong(_) => true,
        _ => {
            debug!("ignoring unexpected STT message type");
            true
        }
    }
}

#[async_trait]
impl SpeechRecognizer for StreamingSttClient {
    fn frame_sink(&self) -> mpsc::Sender<AudioFrame> {
        self.frame_tx.clone()
    }

    async fn next_event(&mut self) -> Option<RecognizerEvent> {
        self.event_rx.recv().await
    }

    async fn reset(&mut self) -> Result<(), ClientError> {
        while self.event_rx.try_recv().is_ok() {}
        self.command_tx
            .send(Command::Reset)
            .await
            .map_err(|_| ClientError::ConnectionFailed("STT socket task gone".into()))
    }

    async fn close(&mut self) {
        let _ = self.command_tx.try_send(Command::Shutdown);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = timeout(Duration::from_secs(5), task).await;
        }
    }

    fn provider_info(&self) -> &'static str {
        "speech-gateway streaming STT"
    }
}

impl Drop for StreamingSttClient {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_partial_message_becomes_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let msg = Message::Text(
            r#"{"type":"partial","text":"what's the","stability":0.4,"offset_ms":120}"#.into(),
        );

        assert!(handle_server_message(msg, &tx).await);

        match rx.try_recv().unwrap() {
            RecognizerEvent::Transcript(TranscriptEvent::Partial {
                text, stability, ..
            }) => {
                assert_eq!(text, "what's the");
                assert!((stability - 0.4).abs() < f32::EPSILON);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_final_message_becomes_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let msg = Message::Text(
            r#"{"type":"final","text":"what's the weather","offset_ms":120,"duration_ms":900}"#
                .into(),
        );

        assert!(handle_server_message(msg, &tx).await);

        match rx.try_recv().unwrap() {
            RecognizerEvent::Transcript(TranscriptEvent::Final { text, duration_ms, .. }) => {
                assert_eq!(text, "what's the weather");
                assert_eq!(duration_ms, 900);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_message_closes_connection() {
        let (tx, mut rx) = mpsc::channel(8);
        let msg = Message::Text(
            r#"{"type":"error","message":"bad key","code":"unauthorized"}"#.into(),
        );

        assert!(!handle_server_message(msg, &tx).await);

        match rx.try_recv().unwrap() {
            RecognizerEvent::Error(ClientError::AuthenticationFailed(m)) => {
                assert_eq!(m, "bad key");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stability_is_clamped() {
        let (tx, mut rx) = mpsc::channel(8);
        let msg = Message::Text(
            r#"{"type":"partial","text":"x","stability":1.7,"offset_ms":0}"#.into(),
        );

        handle_server_message(msg, &tx).await;

        match rx.try_recv().unwrap() {
            RecognizerEvent::Transcript(TranscriptEvent::Partial { stability, .. }) => {
                assert_eq!(stability, 1.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_api_key() {
        let config = SttClientConfig {
            endpoint: "wss://stt.example.com/v1/stream".into(),
            api_key: String::new(),
            language: "en-US".into(),
            sample_rate: 16_000,
        };
        let result = StreamingSttClient::connect(config).await;
        assert!(matches!(
            result,
            Err(ClientError::ConfigurationError(_))
        ));
    }
}
