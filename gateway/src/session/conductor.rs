//! Session conductor.
//!
//! Owns one call's task topology: a reader pulling from the transport, an
//! STT consumer driving the state machine and barge-in, the turn router, and
//! a writer draining outbound frames. All four communicate over bounded
//! channels owned here; none hold back-references. On session end the
//! channels close in a fixed order (inbound, then STT, then outbound) so
//! everything drains cleanly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::record::{SessionRecord, SessionState, TerminalReason, TransportKind, TurnRecord};
use super::router::{HISTORY_CAP, RouterWork, TurnQueue, TurnRouter};
use super::store::{SessionStore, StoreError, StoreEvent};
use crate::core::llm::RealtimeVoice;
use crate::core::pool::{ClientPool, Lease};
use crate::core::stt::{RecognizerEvent, SpeechRecognizer, TranscriptEvent};
use crate::core::tts::Synthesizer;
use crate::dashboard::DashboardHub;
use crate::errors::{BridgeError, BridgeResult, ErrorKind};
use crate::orchestrator::Orchestrator;
use crate::transport::{
    CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR, IDLE_TIMEOUT_SECS, OUTBOUND_HIGH_WATER, TransportEvent,
    TransportPush, TransportSink, TransportSource,
};

/// Inactivity window on the transport before the connection closes.
const IDLE_TIMEOUT: Duration = Duration::from_secs(IDLE_TIMEOUT_SECS);

/// How long an STT push may block before the frame is dropped instead.
const STT_PUSH_BUDGET: Duration = Duration::from_millis(500);

/// Grace period for per-session tasks to drain at teardown.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Wait budget for a pool lease during session setup.
const POOL_ACQUIRE_BUDGET: Duration = Duration::from_secs(5);

/// Per-session tunables, resolved from config at startup.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub sample_rate: u32,
    pub turn_timeout: Duration,
    pub silence_timeout: Duration,
    pub barge_in_stability: f32,
    pub barge_in_min_audio_ms: u64,
    pub max_upstream_strikes: u32,
    pub greeting_phrase: String,
    pub fallback_phrase: String,
    pub goodbye_phrase: String,
    pub stopwords: Vec<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            turn_timeout: Duration::from_secs(30),
            silence_timeout: Duration::from_secs(15),
            barge_in_stability: 0.3,
            barge_in_min_audio_ms: 120,
            max_upstream_strikes: 3,
            greeting_phrase: "Hi! You're connected. How can I help you today?".into(),
            fallback_phrase: "I'm sorry, I didn't catch that. Could you say it again?".into(),
            goodbye_phrase: "Thanks for calling. Goodbye!".into(),
            stopwords: vec!["goodbye".into(), "bye bye".into(), "hang up".into()],
        }
    }
}

/// Process-wide collaborators handed to every conductor.
#[derive(Clone)]
pub struct ConductorDeps {
    pub store: Arc<dyn SessionStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub stt_pool: ClientPool<dyn SpeechRecognizer>,
    pub tts_pool: ClientPool<dyn Synthesizer>,
    pub realtime_pool: ClientPool<dyn RealtimeVoice>,
    pub dashboard: Arc<DashboardHub>,
    pub settings: SessionSettings,
    pub worker_id: String,
}

/// Handle kept in the live-session registry, enough to hang up remotely.
#[derive(Clone)]
pub struct SessionHandle {
    pub cancel: CancellationToken,
}

/// State shared by the per-session tasks.
pub struct SessionShared {
    pub session_id: String,
    pub owner_id: String,
    pub settings: SessionSettings,
    pub session_cancel: CancellationToken,
    store: Arc<dyn SessionStore>,
    dashboard: Arc<DashboardHub>,
    state: Mutex<SessionState>,
    cancel_epoch: AtomicU64,
    turn_cancel: Mutex<Option<CancellationToken>>,
    strikes: AtomicU32,
    pub dropped_frames: AtomicU64,
    /// Total inbound audio pushed to STT, in microseconds of playback.
    pub audio_clock_us: AtomicU64,
    outbound: Mutex<Option<mpsc::Sender<TransportPush>>>,
}

impl SessionShared {
    #[allow(clippy::too_many_arguments)]
    fn new(
        record: &SessionRecord,
        settings: SessionSettings,
        store: Arc<dyn SessionStore>,
        dashboard: Arc<DashboardHub>,
        session_cancel: CancellationToken,
        outbound: mpsc::Sender<TransportPush>,
    ) -> Self {
        Self {
            session_id: record.session_id.clone(),
            owner_id: record.owner_id.clone(),
            settings,
            session_cancel,
            store,
            dashboard,
            state: Mutex::new(record.state),
            cancel_epoch: AtomicU64::new(record.cancel_epoch),
            turn_cancel: Mutex::new(None),
            strikes: AtomicU32::new(0),
            dropped_frames: AtomicU64::new(0),
            audio_clock_us: AtomicU64::new(0),
            outbound: Mutex::new(Some(outbound)),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn cancel_epoch(&self) -> u64 {
        self.cancel_epoch.load(Ordering::Acquire)
    }

    /// Transition the session, persisting through the store and broadcasting
    /// the new state to the caller and any dashboard observers.
    pub async fn set_state(&self, to: SessionState) -> BridgeResult<()> {
        self.store
            .mutate(&self.session_id, &self.owner_id, &move |record| {
                record.transition(to)
            })
            .await
            .map_err(store_error)?;
        *self.state.lock() = to;

        self.push(TransportPush::State(to)).await;
        self.dashboard
            .broadcast(&self.session_id, "state", json!({ "state": to }));
        debug!(session_id = %self.session_id, state = %to, "state transition");
        Ok(())
    }

    pub async fn load_record(&self) -> BridgeResult<SessionRecord> {
        self.store
            .load(&self.session_id)
            .await
            .map_err(store_error)
    }

    pub async fn append_turn(&self, turn: TurnRecord, cap: usize) -> BridgeResult<()> {
        self.store
            .mutate(&self.session_id, &self.owner_id, &move |record| {
                record.push_turn(turn.clone(), cap)
            })
            .await
            .map_err(store_error)?;
        Ok(())
    }

    pub fn set_turn_cancel(&self, token: CancellationToken) {
        *self.turn_cancel.lock() = Some(token);
    }

    pub fn clear_turn_cancel(&self) {
        *self.turn_cancel.lock() = None;
    }

    pub fn cancel_turn(&self) {
        if let Some(token) = self.turn_cancel.lock().as_ref() {
            token.cancel();
        }
    }

    /// Barge-in: bump the cancel epoch, cancel the in-flight turn, return to
    /// Listening. No-op outside Thinking/Speaking. The trigger never
    /// finalizes the user turn; that waits for the final transcript.
    pub async fn barge_in(&self) -> bool {
        if !matches!(
            self.state(),
            SessionState::Thinking | SessionState::Speaking
        ) {
            return false;
        }

        let epoch = match self.store.bump_cancel_epoch(&self.session_id).await {
            Ok(epoch) => epoch,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "epoch bump failed, using local");
                self.cancel_epoch.fetch_add(1, Ordering::AcqRel) + 1
            }
        };
        self.cancel_epoch.fetch_max(epoch, Ordering::AcqRel);
        self.cancel_turn();

        info!(session_id = %self.session_id, epoch, "barge-in");
        self.dashboard
            .broadcast(&self.session_id, "barge_in", json!({ "epoch": epoch }));

        if let Err(e) = self.set_state(SessionState::Listening).await {
            warn!(session_id = %self.session_id, error = %e, "barge-in transition failed");
        }
        true
    }

    /// A cancel-epoch bump observed from another worker.
    pub async fn observe_remote_epoch(&self, epoch: u64) {
        let seen = self.cancel_epoch.fetch_max(epoch, Ordering::AcqRel);
        if epoch <= seen {
            return;
        }
        debug!(session_id = %self.session_id, epoch, "remote barge-in");
        self.cancel_turn();
        if matches!(
            self.state(),
            SessionState::Thinking | SessionState::Speaking
        ) {
            if let Err(e) = self.set_state(SessionState::Listening).await {
                warn!(session_id = %self.session_id, error = %e, "remote barge-in transition failed");
            }
        }
    }

    pub fn add_strike(&self) -> u32 {
        self.strikes.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn clear_strikes(&self) {
        self.strikes.store(0, Ordering::Release);
    }

    /// Queue one outbound push. Returns false once the writer is gone.
    pub async fn push(&self, push: TransportPush) -> bool {
        let sender = self.outbound.lock().clone();
        match sender {
            Some(tx) => tx.send(push).await.is_ok(),
            None => false,
        }
    }

    /// Drop the outbound sender so the writer drains and closes the socket.
    fn close_outbound(&self) {
        self.outbound.lock().take();
    }

    pub fn dashboard_event(&self, event: &str, payload: serde_json::Value) {
        self.dashboard.broadcast(&self.session_id, event, payload);
    }
}

fn store_error(e: StoreError) -> BridgeError {
    BridgeError::new(e.kind(), e.to_string())
}

/// Does the utterance ask to end the call?
pub fn is_stopword(text: &str, stopwords: &[String]) -> bool {
    let lowered = text.to_lowercase();
    stopwords
        .iter()
        .any(|word| !word.is_empty() && lowered.contains(&word.to_lowercase()))
}

/// Per-call lifecycle driver.
pub struct SessionConductor;

impl SessionConductor {
    /// Serve one call to completion. Returns once the session has ended and
    /// every per-session task has been reaped.
    pub async fn run(
        deps: ConductorDeps,
        mut source: Box<dyn TransportSource>,
        sink: Box<dyn TransportSink>,
        session_id: String,
        participant: Option<String>,
        session_cancel: CancellationToken,
    ) -> BridgeResult<()> {
        let kind = source.kind();
        let (record, resumed) =
            create_or_resume(&*deps.store, &session_id, kind, participant, &deps.worker_id)
                .await?;

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_HIGH_WATER);
        let close_code = Arc::new(AtomicU16::new(CLOSE_NORMAL));
        let writer_task = spawn_writer(sink, outbound_rx, close_code.clone());

        let shared = Arc::new(SessionShared::new(
            &record,
            deps.settings.clone(),
            deps.store.clone(),
            deps.dashboard.clone(),
            session_cancel.clone(),
            outbound_tx,
        ));

        // Announce the starting state before any audio flows.
        shared.push(TransportPush::State(record.state)).await;

        let result = if kind == TransportKind::TelephonyRealtime {
            Self::run_realtime(&deps, &mut source, &shared).await
        } else {
            Self::run_pipeline(&deps, &mut source, &shared, resumed, &record).await
        };

        // Teardown, fixed order: inbound stopped (loop exited), then STT and
        // router (session cancel), then outbound drains.
        session_cancel.cancel();

        if let Err(e) = &result {
            if e.kind == ErrorKind::Protocol {
                close_code.store(CLOSE_PROTOCOL_ERROR, Ordering::Release);
            }
        }

        if let Err(e) = deps
            .store
            .mutate(&session_id, &deps.worker_id, &|record| {
                if record.state != SessionState::Ended {
                    record.transition(SessionState::Ended)
                } else {
                    Ok(())
                }
            })
            .await
        {
            warn!(session_id = %session_id, error = %e, "final record commit failed");
        }

        shared.close_outbound();
        if timeout(DRAIN_GRACE, writer_task).await.is_err() {
            warn!(session_id = %session_id, "writer did not drain in time");
        }
        deps.dashboard.detach_all(&session_id);

        info!(
            session_id = %session_id,
            dropped_frames = shared.dropped_frames.load(Ordering::Relaxed),
            "session ended"
        );
        result
    }

    /// The classic pipeline: STT producer, turn router, transport reader.
    async fn run_pipeline(
        deps: &ConductorDeps,
        source: &mut Box<dyn TransportSource>,
        shared: &Arc<SessionShared>,
        resumed: bool,
        record: &SessionRecord,
    ) -> BridgeResult<()> {
        let stt = deps
            .stt_pool
            .acquire_timeout(POOL_ACQUIRE_BUDGET)
            .await
            .map_err(|e| BridgeError::new(e.kind(), format!("STT lease: {e}")))?;
        let frame_sink = stt.frame_sink();

        let tts = deps
            .tts_pool
            .acquire_timeout(POOL_ACQUIRE_BUDGET)
            .await
            .map_err(|e| BridgeError::new(e.kind(), format!("TTS lease: {e}")))?;

        let queue = Arc::new(TurnQueue::new());

        // Synthetic greeting, or a resume announcement when the caller
        // reconnects to a session that was already greeted.
        if resumed && record.greeting_sent {
            let text = match &record.active_agent {
                Some(agent) => format!("{agent} is ready to continue assisting you."),
                None => "Session resumed with your previous assistant.".to_string(),
            };
            queue.push(RouterWork::Greeting(text));
        } else {
            queue.push(RouterWork::Greeting(shared.settings.greeting_phrase.clone()));
            if let Err(e) = deps
                .store
                .mutate(&shared.session_id, &shared.owner_id, &|record| {
                    record.greeting_sent = true;
                    Ok(())
                })
                .await
            {
                warn!(session_id = %shared.session_id, error = %e, "greeting flag persist failed");
            }
        }

        let router = TurnRouter::new(
            shared.clone(),
            deps.orchestrator.clone(),
            queue.clone(),
            tts,
        );
        let router_task = tokio::spawn(router.run());
        let stt_task = spawn_stt_consumer(stt, shared.clone(), queue.clone());

        let mut store_events = deps.store.subscribe(&shared.session_id).await;
        let result =
            Self::read_loop(source, shared, &queue, &frame_sink, &mut store_events).await;

        // Inbound is closed (read loop exited); drain the rest.
        queue.close();
        shared.cancel_turn();
        shared.session_cancel.cancel();
        if timeout(DRAIN_GRACE, router_task).await.is_err() {
            warn!(session_id = %shared.session_id, "router did not drain in time");
        }
        if timeout(DRAIN_GRACE, stt_task).await.is_err() {
            warn!(session_id = %shared.session_id, "STT consumer did not drain in time");
        }

        result
    }

    /// Transport reader: decodes frames into STT, dispatches control
    /// messages, enforces the inactivity window.
    async fn read_loop(
        source: &mut Box<dyn TransportSource>,
        shared: &Arc<SessionShared>,
        queue: &Arc<TurnQueue>,
        frame_sink: &mpsc::Sender<crate::audio::AudioFrame>,
        store_events: &mut mpsc::Receiver<StoreEvent>,
    ) -> BridgeResult<()> {
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                biased;

                _ = shared.session_cancel.cancelled() => return Ok(()),

                Some(event) = store_events.recv() => {
                    if let StoreEvent::CancelEpochBumped { epoch } = event {
                        shared.observe_remote_epoch(epoch).await;
                    }
                }

                _ = tokio::time::sleep_until(last_activity + IDLE_TIMEOUT) => {
                    info!(session_id = %shared.session_id, "transport idle, closing");
                    return Ok(());
                }

                received = source.receive() => {
                    last_activity = Instant::now();
                    let event = match received {
                        Ok(event) => event,
                        Err(e) if e.kind == ErrorKind::Protocol => {
                            warn!(session_id = %shared.session_id, error = %e, "protocol violation");
                            shared.push(TransportPush::Error {
                                code: "protocol".into(),
                                message: e.message.clone(),
                            }).await;
                            return Err(e);
                        }
                        Err(e) => {
                            debug!(session_id = %shared.session_id, error = %e, "transport gone");
                            return Ok(());
                        }
                    };

                    match event {
                        TransportEvent::Audio(frame) => {
                            // The STT stream opens when the greeting finishes.
                            if shared.state() == SessionState::Greeting {
                                continue;
                            }
                            shared
                                .audio_clock_us
                                .fetch_add(frame.duration_us(), Ordering::AcqRel);
                            match timeout(STT_PUSH_BUDGET, frame_sink.send(frame)).await {
                                Ok(Ok(())) => {}
                                Ok(Err(_)) => {
                                    // Recognizer gone; the consumer task will
                                    // wind the session down.
                                    debug!(session_id = %shared.session_id, "frame sink closed");
                                }
                                Err(_) => {
                                    let dropped = shared
                                        .dropped_frames
                                        .fetch_add(1, Ordering::AcqRel) + 1;
                                    if dropped % 50 == 1 {
                                        warn!(
                                            session_id = %shared.session_id,
                                            dropped, "STT backpressure, dropping audio"
                                        );
                                    }
                                }
                            }
                        }
                        TransportEvent::Text(text) => {
                            handle_final_text(shared, queue, text).await;
                        }
                        TransportEvent::Interrupt => {
                            shared.barge_in().await;
                        }
                        TransportEvent::Reset => {
                            info!(session_id = %shared.session_id, "conversation reset");
                            let _ = shared
                                .store
                                .mutate(&shared.session_id, &shared.owner_id, &|record| {
                                    record.history.clear();
                                    record.context.clear();
                                    record.active_agent = None;
                                    record.turn_index = 0;
                                    Ok(())
                                })
                                .await;
                        }
                        TransportEvent::Hangup | TransportEvent::Closed => {
                            info!(session_id = %shared.session_id, "caller hung up");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// The realtime-voice pipeline: audio in, audio out, no orchestrator.
    async fn run_realtime(
        deps: &ConductorDeps,
        source: &mut Box<dyn TransportSource>,
        shared: &Arc<SessionShared>,
    ) -> BridgeResult<()> {
        let mut lease = deps
            .realtime_pool
            .acquire_timeout(POOL_ACQUIRE_BUDGET)
            .await
            .map_err(|e| BridgeError::new(e.kind(), format!("realtime lease: {e}")))?;

        let agent = deps.orchestrator.registry().default_agent();
        let started = lease
            .start(
                &agent.system_prompt,
                &agent.voice_profile,
                shared.session_cancel.child_token(),
            )
            .await;
        let mut session = match started {
            Ok(session) => session,
            Err(e) => {
                lease.discard();
                return Err(BridgeError::new(e.kind(), format!("realtime start: {e}")));
            }
        };

        shared.set_state(SessionState::Listening).await?;

        // Agent audio back to the caller.
        let audio_forwarder = {
            let shared = shared.clone();
            let mut audio_rx = session.audio_rx;
            tokio::spawn(async move {
                while let Some(frame) = audio_rx.recv().await {
                    if !shared.push(TransportPush::Audio(frame)).await {
                        break;
                    }
                }
            })
        };

        // Transcripts to the caller and the dashboard.
        let transcript_forwarder = {
            let shared = shared.clone();
            let mut transcript_rx = session.transcript_rx;
            tokio::spawn(async move {
                while let Some(event) = transcript_rx.recv().await {
                    let (role, is_final) = match &event {
                        TranscriptEvent::Partial { .. } => ("assistant", false),
                        TranscriptEvent::Final { .. } => ("user", true),
                    };
                    let text = event.text().to_string();
                    shared.dashboard_event("transcript", json!({ "role": role, "text": text }));
                    if !shared
                        .push(TransportPush::Transcript {
                            role,
                            text,
                            is_final,
                        })
                        .await
                    {
                        break;
                    }
                }
            })
        };

        let mut last_activity = Instant::now();
        let result = loop {
            tokio::select! {
                biased;

                _ = shared.session_cancel.cancelled() => break Ok(()),

                _ = tokio::time::sleep_until(last_activity + IDLE_TIMEOUT) => {
                    info!(session_id = %shared.session_id, "transport idle, closing");
                    break Ok(());
                }

                received = source.receive() => {
                    last_activity = Instant::now();
                    match received {
                        Ok(TransportEvent::Audio(frame)) => {
                            if session.audio_tx.send(frame).await.is_err() {
                                break Err(BridgeError::upstream("realtime session ended"));
                            }
                        }
                        Ok(TransportEvent::Hangup) | Ok(TransportEvent::Closed) => break Ok(()),
                        Ok(_) => {}
                        Err(e) if e.kind == ErrorKind::Protocol => break Err(e),
                        Err(_) => break Ok(()),
                    }
                }
            }
        };

        shared.session_cancel.cancel();
        audio_forwarder.abort();
        transcript_forwarder.abort();
        result
    }
}

/// Create the session record, or adopt an existing live one (reconnect).
async fn create_or_resume(
    store: &dyn SessionStore,
    session_id: &str,
    kind: TransportKind,
    participant: Option<String>,
    worker_id: &str,
) -> BridgeResult<(SessionRecord, bool)> {
    let fresh = SessionRecord::new(session_id, kind, participant.clone(), worker_id);

    match store.create(fresh.clone()).await {
        Ok(()) => Ok((fresh, false)),
        Err(StoreError::AlreadyExists) => {
            let old = store.load(session_id).await.map_err(store_error)?;
            if old.state == SessionState::Ended {
                let _ = store.remove(session_id).await;
                store.create(fresh.clone()).await.map_err(store_error)?;
                return Ok((fresh, false));
            }

            // Adopt the live record: carry the conversation, take ownership.
            let mut adopted = fresh;
            adopted.created_at = old.created_at;
            adopted.active_agent = old.active_agent;
            adopted.history = old.history;
            adopted.context = old.context;
            adopted.turn_index = old.turn_index;
            adopted.cancel_epoch = old.cancel_epoch;
            adopted.greeting_sent = old.greeting_sent;

            let _ = store.remove(session_id).await;
            store.create(adopted.clone()).await.map_err(store_error)?;
            info!(session_id, "resumed existing session");
            Ok((adopted, true))
        }
        Err(e) => Err(store_error(e)),
    }
}

/// Writer task: the only place that touches the transport sink.
fn spawn_writer(
    mut sink: Box<dyn TransportSink>,
    mut outbound_rx: mpsc::Receiver<TransportPush>,
    close_code: Arc<AtomicU16>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(push) = outbound_rx.recv().await {
            if let Err(e) = sink.send(push).await {
                debug!(error = %e, "writer send failed");
                break;
            }
        }
        sink.close(close_code.load(Ordering::Acquire)).await;
    })
}

/// STT consumer task: turns recognizer events into state machine moves,
/// barge-in triggers and router work.
fn spawn_stt_consumer(
    mut stt: Lease<dyn SpeechRecognizer>,
    shared: Arc<SessionShared>,
    queue: Arc<TurnQueue>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_partial = Instant::now();
        let mut broken = false;

        loop {
            tokio::select! {
                biased;

                _ = shared.session_cancel.cancelled() => break,

                _ = tokio::time::sleep_until(last_partial + shared.settings.silence_timeout) => {
                    if shared.state() == SessionState::Listening {
                        info!(session_id = %shared.session_id, "silence timeout, saying goodbye");
                        queue.push(RouterWork::Farewell(shared.settings.goodbye_phrase.clone()));
                    }
                    last_partial = Instant::now();
                }

                event = stt.next_event() => {
                    let Some(event) = event else {
                        debug!(session_id = %shared.session_id, "recognizer stream ended");
                        broken = true;
                        break;
                    };

                    match event {
                        RecognizerEvent::Transcript(TranscriptEvent::Partial {
                            text,
                            stability,
                            offset_ms,
                        }) => {
                            last_partial = Instant::now();
                            shared
                                .push(TransportPush::Transcript {
                                    role: "user",
                                    text: text.clone(),
                                    is_final: false,
                                })
                                .await;
                            shared.dashboard_event(
                                "transcript",
                                json!({ "role": "user", "text": text, "final": false }),
                            );

                            // Barge-in gate: stable enough, sustained long
                            // enough, while we are producing output.
                            if stability >= shared.settings.barge_in_stability
                                && matches!(
                                    shared.state(),
                                    SessionState::Thinking | SessionState::Speaking
                                )
                            {
                                let clock_ms =
                                    shared.audio_clock_us.load(Ordering::Acquire) / 1000;
                                let sustained_ms = clock_ms.saturating_sub(offset_ms);
                                if sustained_ms >= shared.settings.barge_in_min_audio_ms {
                                    shared.barge_in().await;
                                }
                            }
                        }
                        RecognizerEvent::Transcript(TranscriptEvent::Final { text, .. }) => {
                            last_partial = Instant::now();
                            handle_final_text(&shared, &queue, text).await;
                        }
                        RecognizerEvent::Error(e) => {
                            warn!(session_id = %shared.session_id, error = %e, "recognizer error");
                            broken = true;
                            let strikes = shared.add_strike();
                            if strikes >= shared.settings.max_upstream_strikes {
                                queue.push(RouterWork::Farewell(
                                    shared.settings.goodbye_phrase.clone(),
                                ));
                            }
                        }
                    }
                }
            }
        }

        // Drained: reset the handle for reuse, or discard a broken one.
        if broken {
            stt.discard();
        } else if let Err(e) = stt.reset().await {
            debug!(session_id = %shared.session_id, error = %e, "recognizer reset failed");
            stt.discard();
        }
    })
}

/// A finalized user utterance: broadcast it, honor stopwords, enqueue the
/// turn, and record anything the finite queue displaced.
async fn handle_final_text(shared: &Arc<SessionShared>, queue: &Arc<TurnQueue>, text: String) {
    let text = text.trim().to_string();
    if text.is_empty() {
        return;
    }

    shared
        .push(TransportPush::Transcript {
            role: "user",
            text: text.clone(),
            is_final: true,
        })
        .await;
    shared.dashboard_event(
        "transcript",
        json!({ "role": "user", "text": text, "final": true }),
    );

    if is_stopword(&text, &shared.settings.stopwords) {
        info!(session_id = %shared.session_id, "stopword heard, saying goodbye");
        queue.push(RouterWork::Farewell(shared.settings.goodbye_phrase.clone()));
        return;
    }

    if let Some(RouterWork::UserTurn(dropped)) = queue.push(RouterWork::UserTurn(text)) {
        warn!(session_id = %shared.session_id, "turn queue overflow, dropping oldest");
        let record = shared.load_record().await;
        let turn_index = record.map(|r| r.turn_index).unwrap_or(0);
        let mut turn = TurnRecord::open(turn_index, dropped, shared.cancel_epoch());
        turn.note = Some("dropped: turn queue overflow".into());
        turn.finalize(TerminalReason::Error);
        if let Err(e) = shared.append_turn(turn, HISTORY_CAP).await {
            warn!(session_id = %shared.session_id, error = %e, "dropped-turn record failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::MemoryStore;

    #[test]
    fn test_is_stopword() {
        let stopwords = vec!["goodbye".to_string(), "bye bye".to_string()];
        assert!(is_stopword("Goodbye then", &stopwords));
        assert!(is_stopword("ok BYE BYE", &stopwords));
        assert!(!is_stopword("buy a policy", &stopwords));
    }

    #[test]
    fn test_settings_defaults_match_contract() {
        let settings = SessionSettings::default();
        assert_eq!(settings.turn_timeout, Duration::from_secs(30));
        assert_eq!(settings.silence_timeout, Duration::from_secs(15));
        assert!((settings.barge_in_stability - 0.3).abs() < f32::EPSILON);
        assert_eq!(settings.barge_in_min_audio_ms, 120);
        assert_eq!(settings.max_upstream_strikes, 3);
    }

    #[tokio::test]
    async fn test_create_or_resume_fresh() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let (record, resumed) =
            create_or_resume(&store, "s1", TransportKind::Browser, None, "w1")
                .await
                .unwrap();
        assert!(!resumed);
        assert_eq!(record.state, SessionState::Greeting);
    }

    #[tokio::test]
    async fn test_create_or_resume_adopts_live_session() {
        let store = MemoryStore::new(Duration::from_secs(60));
        let (_, _) = create_or_resume(&store, "s1", TransportKind::Browser, None, "w1")
            .await
            .unwrap();

        // First worker greeted and engaged an agent.
        store
            .mutate("s1", "w1", &|record| {
                record.greeting_sent = true;
                record.active_agent = Some("claims".into());
                record.transition(SessionState::Listening)
            })
            .await
            .unwrap();

        let (record, resumed) =
            create_or_resume(&store, "s1", TransportKind::Browser, None, "w2")
                .await
                .unwrap();
        assert!(resumed);
        assert!(record.greeting_sent);
        assert_eq!(record.owner_id, "w2");
        assert_eq!(record.active_agent.as_deref(), Some("claims"));
        // A resumed session re-enters Greeting for the resume announcement.
        assert_eq!(record.state, SessionState::Greeting);
    }

    #[tokio::test]
    async fn test_create_or_resume_replaces_ended_session() {
        let store = MemoryStore::new(Duration::from_secs(60));
        create_or_resume(&store, "s1", TransportKind::Browser, None, "w1")
            .await
            .unwrap();
        store
            .mutate("s1", "w1", &|record| record.transition(SessionState::Ended))
            .await
            .unwrap();

        let (record, resumed) =
            create_or_resume(&store, "s1", TransportKind::Browser, None, "w1")
                .await
                .unwrap();
        assert!(!resumed);
        assert!(record.history.is_empty());
    }
}
