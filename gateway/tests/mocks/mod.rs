//! In-process mock providers and transports for the pipeline test suites.
//!
//! Each mock implements the same trait the production client does, driven
//! through channels the test holds, so whole sessions run without a network.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use voicebridge_gateway::audio::AudioFrame;
use voicebridge_gateway::core::ClientError;
use voicebridge_gateway::core::llm::{
    ChatClient, ChatEvent, ChatRequest, FinishReason, RealtimeVoice, RealtimeVoiceSession,
};
use voicebridge_gateway::core::pool::ClientPool;
use voicebridge_gateway::core::stt::{RecognizerEvent, SpeechRecognizer};
use voicebridge_gateway::core::tts::{SynthesisStream, Synthesizer};
use voicebridge_gateway::errors::BridgeError;
use voicebridge_gateway::session::record::TransportKind;
use voicebridge_gateway::transport::{
    TransportEvent, TransportPush, TransportSink, TransportSource,
};

/// One 20 ms frame of silence at 16 kHz.
pub fn silence_frame(timestamp_us: u64) -> AudioFrame {
    AudioFrame::new(Bytes::from(vec![0u8; 640]), 16_000, timestamp_us)
}

/// Build a single-handle pool that serves the given mock, then refuses.
pub fn pool_of<T: ?Sized + Send + 'static>(name: &'static str, handle: Box<T>) -> ClientPool<T> {
    let slot = Arc::new(Mutex::new(Some(handle)));
    ClientPool::new(
        name,
        4,
        Box::new(move || {
            let slot = slot.clone();
            Box::pin(async move {
                slot.lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| ClientError::ConnectionFailed("mock pool exhausted".into()))
            })
        }),
    )
}

// =============================================================================
// Speech recognition
// =============================================================================

/// Recognizer driven entirely by the test through an event channel. Inbound
/// frames are counted and discarded.
pub struct MockRecognizer {
    frame_tx: mpsc::Sender<AudioFrame>,
    events: mpsc::Receiver<RecognizerEvent>,
    pub frames_seen: Arc<AtomicUsize>,
    pub reset_calls: Arc<AtomicUsize>,
}

impl MockRecognizer {
    /// Returns the recognizer and the sender the test feeds events through.
    pub fn new() -> (Self, mpsc::Sender<RecognizerEvent>) {
        let (event_tx, events) = mpsc::channel(64);
        let (frame_tx, mut frame_rx) = mpsc::channel::<AudioFrame>(64);
        let frames_seen = Arc::new(AtomicUsize::new(0));

        let counter = frames_seen.clone();
        tokio::spawn(async move {
            while frame_rx.recv().await.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        (
            Self {
                frame_tx,
                events,
                frames_seen,
                reset_calls: Arc::new(AtomicUsize::new(0)),
            },
            event_tx,
        )
    }
}

#[async_trait]
impl SpeechRecognizer for MockRecognizer {
    fn frame_sink(&self) -> mpsc::Sender<AudioFrame> {
        self.frame_tx.clone()
    }

    async fn next_event(&mut self) -> Option<RecognizerEvent> {
        self.events.recv().await
    }

    async fn reset(&mut self) -> Result<(), ClientError> {
        self.reset_calls.fetch_add(1, Ordering::SeqCst);
        while self.events.try_recv().is_ok() {}
        Ok(())
    }

    async fn close(&mut self) {}

    fn provider_info(&self) -> &'static str {
        "mock recognizer"
    }
}

// =============================================================================
// Synthesis
// =============================================================================

/// Synthesizer that renders every text chunk as two 20 ms frames of
/// silence, honoring cancellation immediately.
pub struct MockSynthesizer {
    pub frames_per_chunk: usize,
    pub opened_streams: Arc<AtomicUsize>,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self {
            frames_per_chunk: 2,
            opened_streams: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn open_stream(
        &mut self,
        _voice: &str,
        cancel: CancellationToken,
    ) -> Result<SynthesisStream, ClientError> {
        self.opened_streams.fetch_add(1, Ordering::SeqCst);

        let (text_tx, mut text_rx) = mpsc::channel::<String>(16);
        let (frames_tx, frames_rx) = mpsc::channel(64);
        let frames_per_chunk = self.frames_per_chunk;

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut clock = 0u64;
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => break,
                    chunk = text_rx.recv() => chunk,
                };
                let Some(_chunk) = chunk else { break };
                for _ in 0..frames_per_chunk {
                    let frame = silence_frame(clock);
                    clock += 20_000;
                    tokio::select! {
                        biased;
                        _ = task_cancel.cancelled() => return,
                        result = frames_tx.send(frame) => {
                            if result.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(SynthesisStream::new(text_tx, frames_rx, cancel))
    }

    fn provider_info(&self) -> &'static str {
        "mock synthesizer"
    }
}

// =============================================================================
// Chat completions
// =============================================================================

/// One scripted completion: either a fixed event list, or a channel the
/// test feeds live (for barge-in timing).
pub enum ChatScript {
    Static(Vec<ChatEvent>),
    Feed(mpsc::Receiver<ChatEvent>),
}

/// Chat client replaying scripts in order. Classifier calls (the fixed
/// agent-selection prompt) are answered from `classifier_answer` without
/// consuming a script.
pub struct MockChatClient {
    pub classifier_answer: String,
    scripts: Mutex<VecDeque<ChatScript>>,
    pub calls: Arc<AtomicUsize>,
}

impl MockChatClient {
    pub fn new(classifier_answer: &str, scripts: Vec<ChatScript>) -> Self {
        Self {
            classifier_answer: classifier_answer.to_string(),
            scripts: Mutex::new(scripts.into_iter().collect()),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn is_classifier(request: &ChatRequest) -> bool {
        request.tools.is_empty()
            && request.messages.len() == 1
            && request.messages[0]
                .content
                .as_deref()
                .is_some_and(|c| c.starts_with("Pick the single best agent"))
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn chat(
        &self,
        request: ChatRequest,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ChatEvent>, ClientError> {
        if Self::is_classifier(&request) {
            let (tx, rx) = mpsc::channel(4);
            let answer = self.classifier_answer.clone();
            tokio::spawn(async move {
                let _ = tx.send(ChatEvent::Token(answer)).await;
                let _ = tx.send(ChatEvent::Finished(FinishReason::Stop)).await;
            });
            return Ok(rx);
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(ChatScript::Feed(rx)) => Ok(rx),
            Some(ChatScript::Static(events)) => {
                let (tx, rx) = mpsc::channel(64);
                tokio::spawn(async move {
                    for event in events {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                });
                Ok(rx)
            }
            None => {
                let (tx, rx) = mpsc::channel(4);
                tokio::spawn(async move {
                    let _ = tx.send(ChatEvent::Finished(FinishReason::Stop)).await;
                });
                Ok(rx)
            }
        }
    }

    fn provider_info(&self) -> &'static str {
        "mock chat"
    }
}

// =============================================================================
// Realtime voice
// =============================================================================

/// Realtime voice mock that echoes every inbound frame back out.
pub struct MockRealtimeVoice;

#[async_trait]
impl RealtimeVoice for MockRealtimeVoice {
    async fn start(
        &mut self,
        _instructions: &str,
        _voice: &str,
        cancel: CancellationToken,
    ) -> Result<RealtimeVoiceSession, ClientError> {
        let (audio_in_tx, mut audio_in_rx) = mpsc::channel::<AudioFrame>(64);
        let (audio_out_tx, audio_out_rx) = mpsc::channel(64);
        let (_transcript_tx, transcript_rx) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = audio_in_rx.recv() => frame,
                };
                let Some(frame) = frame else { break };
                if audio_out_tx.send(frame).await.is_err() {
                    break;
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
        "mock realtime"
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Inbound half driven by the test.
pub struct MockSource {
    rx: mpsc::Receiver<TransportEvent>,
    kind: TransportKind,
}

/// Outbound half recording every push.
pub struct MockSink {
    tx: mpsc::UnboundedSender<TransportPush>,
    pub closed: Arc<AtomicBool>,
}

/// Build a mock transport: feed events in, observe pushes out.
pub fn mock_transport(
    kind: TransportKind,
) -> (
    MockSource,
    MockSink,
    mpsc::Sender<TransportEvent>,
    mpsc::UnboundedReceiver<TransportPush>,
) {
    let (event_tx, event_rx) = mpsc::channel(256);
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    (
        MockSource {
            rx: event_rx,
            kind,
        },
        MockSink {
            tx: push_tx,
            closed: Arc::new(AtomicBool::new(false)),
        },
        event_tx,
        push_rx,
    )
}

#[async_trait]
impl TransportSource for MockSource {
    async fn receive(&mut self) -> Result<TransportEvent, BridgeError> {
        match self.rx.recv().await {
            Some(event) => Ok(event),
            None => Ok(TransportEvent::Closed),
        }
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

#[async_trait]
impl TransportSink for MockSink {
    async fn send(&mut self, push: TransportPush) -> Result<(), BridgeError> {
        self.tx
            .send(push)
            .map_err(|_| BridgeError::transport("mock sink closed"))
    }

    async fn close(&mut self, _code: u16) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
