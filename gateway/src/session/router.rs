//! Turn router.
//!
//! Serves one turn at a time from a finite queue of finalized transcripts.
//! Each turn opens a single synthesis stream, forwards orchestrator text
//! chunks into it as they arrive, and is torn down promptly when the
//! conductor cancels the turn context (barge-in) or the wall clock expires.
//! Response audio for turn K is fully emitted or explicitly aborted before
//! turn K+1 begins producing audio.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::conductor::SessionShared;
use super::record::{SessionRecord, SessionState, TerminalReason, TurnRecord};
use crate::core::pool::Lease;
use crate::core::tts::{SynthesisStream, Synthesizer};
use crate::errors::{BridgeError, BridgeResult, ErrorKind};
use crate::orchestrator::{Orchestrator, OrchestratorEvent, record_tool_event};
use crate::transport::TransportPush;

/// Queued finalized transcripts per session; overflow drops the oldest.
pub const QUEUE_DEPTH: usize = 4;

/// Turns kept in the stored history before the oldest are truncated.
pub const HISTORY_CAP: usize = 64;

/// Work items the router serves in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterWork {
    /// Synthetic greeting spoken before the first user turn.
    Greeting(String),
    /// One finalized user utterance.
    UserTurn(String),
    /// Goodbye phrase; the session ends after it is spoken.
    Farewell(String),
}

/// Finite work queue with drop-oldest overflow.
pub struct TurnQueue {
    items: Mutex<VecDeque<RouterWork>>,
    notify: Notify,
    closed: AtomicBool,
}

impl TurnQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue work, returning the displaced oldest item on overflow.
    pub fn push(&self, work: RouterWork) -> Option<RouterWork> {
        let displaced = {
            let mut items = self.items.lock();
            let displaced = if items.len() >= QUEUE_DEPTH {
                items.pop_front()
            } else {
                None
            };
            items.push_back(work);
            displaced
        };
        self.notify.notify_one();
        displaced
    }

    /// Wait for the next item. `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<RouterWork> {
        loop {
            if let Some(work) = self.items.lock().pop_front() {
                return Some(work);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl Default for TurnQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// How one turn ended inside the pump.
enum TurnOutcome {
    Completed,
    BargedIn,
}

/// Per-session router task. Owns the session's synthesizer lease.
pub struct TurnRouter {
    shared: Arc<SessionShared>,
    orchestrator: Arc<Orchestrator>,
    queue: Arc<TurnQueue>,
    tts: Lease<dyn Synthesizer>,
}

impl TurnRouter {
    pub fn new(
        shared: Arc<SessionShared>,
        orchestrator: Arc<Orchestrator>,
        queue: Arc<TurnQueue>,
        tts: Lease<dyn Synthesizer>,
    ) -> Self {
        Self {
            shared,
            orchestrator,
            queue,
            tts,
        }
    }

    pub async fn run(mut self) {
        while let Some(work) = self.queue.pop().await {
            if self.shared.session_cancel.is_cancelled() {
                break;
            }
            match work {
                RouterWork::Greeting(text) => self.serve_greeting(&text).await,
                RouterWork::UserTurn(text) => self.serve_turn(text).await,
                RouterWork::Farewell(text) => {
                    self.speak_plain(&text).await;
                    self.shared.session_cancel.cancel();
                    break;
                }
            }
        }
        debug!(session_id = %self.shared.session_id, "router finished");
    }

    async fn serve_greeting(&mut self, text: &str) {
        self.shared
            .push(TransportPush::Transcript {
                role: "assistant",
                text: text.to_string(),
                is_final: true,
            })
            .await;
        self.speak_plain(text).await;
        if let Err(e) = self.shared.set_state(SessionState::Listening).await {
            error!(session_id = %self.shared.session_id, error = %e, "post-greeting transition failed");
            self.shared.session_cancel.cancel();
        }
    }

    /// Speak one fixed phrase outside any turn (greeting, fallback, goodbye).
    async fn speak_plain(&mut self, text: &str) {
        let cancel = self.shared.session_cancel.child_token();
        let voice = self.voice_profile().await;

        let mut stream = match self.tts.open_stream(&voice, cancel.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session_id = %self.shared.session_id, error = %e, "phrase synthesis failed");
                self.tts.discard();
                return;
            }
        };
        if stream.push_text(text).await.is_err() {
            return;
        }
        let frames = stream.take_frames();
        stream.finish();

        if let Some(mut frames) = frames {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    frame = frames.recv() => frame,
                };
                let Some(frame) = frame else { break };
                if !self.shared.push(TransportPush::Audio(frame)).await {
                    break;
                }
            }
        }
    }

    /// Serve one user turn end to end.
    async fn serve_turn(&mut self, user_text: String) {
        let session = match self.shared.load_record().await {
            Ok(session) => session,
            Err(e) => {
                error!(session_id = %self.shared.session_id, error = %e, "record load failed");
                self.shared.session_cancel.cancel();
                return;
            }
        };

        let epoch = self.shared.cancel_epoch();
        let cancel = self.shared.session_cancel.child_token();
        self.shared.set_turn_cancel(cancel.clone());

        let mut turn = TurnRecord::open(session.turn_index, user_text.clone(), epoch);

        if let Err(e) = self.shared.set_state(SessionState::Thinking).await {
            error!(session_id = %self.shared.session_id, error = %e, "turn open transition failed");
            self.shared.session_cancel.cancel();
            return;
        }

        let turn_budget = self.shared.settings.turn_timeout;
        let outcome = timeout(
            turn_budget,
            self.pump_turn(&session, &user_text, cancel.clone(), &mut turn),
        )
        .await;

        match outcome {
            Ok(Ok(TurnOutcome::Completed)) => {
                turn.finalize(TerminalReason::Completed);
                self.shared.clear_strikes();
                if let Err(e) = self.shared.set_state(SessionState::Listening).await {
                    error!(session_id = %self.shared.session_id, error = %e, "turn close transition failed");
                    self.shared.session_cancel.cancel();
                }
            }
            Ok(Ok(TurnOutcome::BargedIn)) => {
                info!(
                    session_id = %self.shared.session_id,
                    turn = turn.turn_index,
                    "turn barged in"
                );
                turn.finalize(TerminalReason::BargedIn);
                self.shared.push(TransportPush::StopAudio).await;
            }
            Ok(Err(e)) if e.kind == ErrorKind::Cancelled => {
                turn.finalize(TerminalReason::BargedIn);
                self.shared.push(TransportPush::StopAudio).await;
            }
            Ok(Err(e)) if e.is_turn_recoverable() => {
                warn!(session_id = %self.shared.session_id, error = %e, "turn aborted");
                turn.finalize(TerminalReason::Error);
                self.recover_or_end().await;
            }
            Ok(Err(e)) => {
                error!(session_id = %self.shared.session_id, error = %e, "turn failed fatally");
                turn.finalize(TerminalReason::Error);
                self.append_turn(turn).await;
                self.shared.clear_turn_cancel();
                self.shared.session_cancel.cancel();
                return;
            }
            Err(_) => {
                warn!(
                    session_id = %self.shared.session_id,
                    "turn exceeded the {:?} wall clock", turn_budget
                );
                cancel.cancel();
                turn.finalize(TerminalReason::Timeout);
                self.recover_or_end().await;
            }
        }

        self.append_turn(turn).await;
        self.shared.clear_turn_cancel();
    }

    /// Stream orchestrator events into synthesis until done or cancelled.
    async fn pump_turn(
        &mut self,
        session: &SessionRecord,
        user_text: &str,
        cancel: tokio_util::sync::CancellationToken,
        turn: &mut TurnRecord,
    ) -> BridgeResult<TurnOutcome> {
        let mut events = self.orchestrator.clone().run_turn(
            session.clone(),
            user_text.to_string(),
            cancel.clone(),
        );

        let mut stream: Option<SynthesisStream> = None;
        let mut forwarder: Option<JoinHandle<()>> = None;
        let voice = self.voice_profile().await;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = events.recv() => event,
            };

            let Some(event) = event else {
                // Channel closed: a barge-in if our token fired, an upstream
                // fault otherwise.
                if let Some(stream) = stream.take() {
                    stream.cancel();
                }
                if let Some(forwarder) = forwarder.take() {
                    forwarder.abort();
                }
                if cancel.is_cancelled() {
                    return Ok(TurnOutcome::BargedIn);
                }
                return Err(BridgeError::upstream("turn stream ended without completion"));
            };

            record_tool_event(&mut turn.tool_calls, &event);

            match event {
                OrchestratorEvent::TextChunk(chunk) => {
                    if stream.is_none() {
                        self.shared.set_state(SessionState::Speaking).await?;
                        let opened = match self.tts.open_stream(&voice, cancel.child_token()).await
                        {
                            Ok(opened) => opened,
                            Err(e) => {
                                self.tts.discard();
                                return Err(BridgeError::upstream(format!(
                                    "synthesis open failed: {e}"
                                )));
                            }
                        };
                        stream = Some(opened);
                        let frames = stream
                            .as_mut()
                            .and_then(SynthesisStream::take_frames)
                            .ok_or_else(|| BridgeError::internal("synthesis frames missing"))?;
                        forwarder = Some(self.spawn_forwarder(frames, cancel.clone()));
                    }

                    if let Some(stream) = &stream {
                        stream
                            .push_text(&chunk)
                            .await
                            .map_err(|e| BridgeError::upstream(format!("synthesis push: {e}")))?;
                    }
                    self.shared
                        .push(TransportPush::Transcript {
                            role: "assistant",
                            text: chunk.clone(),
                            is_final: false,
                        })
                        .await;
                    turn.response_chunks.push(chunk);
                }
                OrchestratorEvent::ToolInvoked { name, .. } => {
                    debug!(session_id = %self.shared.session_id, tool = %name, "tool invoked");
                }
                OrchestratorEvent::ToolResult { name, ok } => {
                    debug!(session_id = %self.shared.session_id, tool = %name, ok, "tool finished");
                }
                OrchestratorEvent::Handoff(key) => {
                    self.shared.push(TransportPush::Agent(key)).await;
                }
                OrchestratorEvent::Done(final_text) => {
                    if let Some(mut stream) = stream.take() {
                        stream.finish();
                        // The stream struct cancels on drop; the forwarder
                        // must drain the tail first.
                        if let Some(forwarder) = forwarder.take() {
                            let _ = forwarder.await;
                        }
                        drop(stream);
                    }
                    self.shared
                        .push(TransportPush::Transcript {
                            role: "assistant",
                            text: final_text,
                            is_final: true,
                        })
                        .await;
                    return Ok(TurnOutcome::Completed);
                }
            }
        }
    }

    fn spawn_forwarder(
        &self,
        mut frames: tokio::sync::mpsc::Receiver<crate::audio::AudioFrame>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    frame = frames.recv() => frame,
                };
                let Some(frame) = frame else { break };
                if !shared.push(TransportPush::Audio(frame)).await {
                    break;
                }
            }
        })
    }

    /// After an upstream fault or timeout: fallback phrase, back to
    /// Listening, and after three consecutive failures end the call.
    async fn recover_or_end(&mut self) {
        let strikes = self.shared.add_strike();
        if strikes >= self.shared.settings.max_upstream_strikes {
            warn!(
                session_id = %self.shared.session_id,
                strikes, "consecutive upstream failures, ending call"
            );
            let goodbye = self.shared.settings.goodbye_phrase.clone();
            self.speak_plain(&goodbye).await;
            self.shared.session_cancel.cancel();
            return;
        }

        let fallback = self.shared.settings.fallback_phrase.clone();
        self.speak_plain(&fallback).await;
        if let Err(e) = self.shared.set_state(SessionState::Listening).await {
            error!(session_id = %self.shared.session_id, error = %e, "recovery transition failed");
            self.shared.session_cancel.cancel();
        }
    }

    async fn append_turn(&self, turn: TurnRecord) {
        if let Err(e) = self.shared.append_turn(turn, HISTORY_CAP).await {
            warn!(session_id = %self.shared.session_id, error = %e, "history append failed");
        }
    }

    /// Voice of the agent currently owning the session.
    async fn voice_profile(&self) -> String {
        let registry = self.orchestrator.registry();
        let active = self
            .shared
            .load_record()
            .await
            .ok()
            .and_then(|record| record.active_agent)
            .and_then(|key| registry.get(&key).map(|spec| spec.voice_profile.clone()));
        active.unwrap_or_else(|| registry.default_agent().voice_profile.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_preserves_order() {
        let queue = TurnQueue::new();
        queue.push(RouterWork::UserTurn("one".into()));
        queue.push(RouterWork::UserTurn("two".into()));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_queue_pop_returns_in_order() {
        let queue = TurnQueue::new();
        queue.push(RouterWork::UserTurn("one".into()));
        queue.push(RouterWork::UserTurn("two".into()));

        assert_eq!(queue.pop().await, Some(RouterWork::UserTurn("one".into())));
        assert_eq!(queue.pop().await, Some(RouterWork::UserTurn("two".into())));
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let queue = TurnQueue::new();
        for i in 0..QUEUE_DEPTH {
            assert!(queue.push(RouterWork::UserTurn(format!("turn {i}"))).is_none());
        }

        let displaced = queue.push(RouterWork::UserTurn("overflow".into()));
        assert_eq!(displaced, Some(RouterWork::UserTurn("turn 0".into())));
        assert_eq!(queue.len(), QUEUE_DEPTH);
    }

    #[tokio::test]
    async fn test_closed_queue_drains_then_ends() {
        let queue = TurnQueue::new();
        queue.push(RouterWork::UserTurn("last".into()));
        queue.close();

        assert_eq!(queue.pop().await, Some(RouterWork::UserTurn("last".into())));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(TurnQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.push(RouterWork::Greeting("hello".into()));

        assert_eq!(
            waiter.await.unwrap(),
            Some(RouterWork::Greeting("hello".into()))
        );
    }
}
