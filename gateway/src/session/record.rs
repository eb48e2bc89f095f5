//! Session and turn records.
//!
//! The [`SessionRecord`] is the authoritative per-call entity held in the
//! session store. History is append-only, the state field only moves along
//! the allowed transition table, and `turn_index` always equals the number of
//! finalized turns.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{BridgeError, BridgeResult};

/// Which ingress carried this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Browser,
    TelephonyMedia,
    TelephonyRealtime,
}

/// Lifecycle state of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Greeting,
    Listening,
    Thinking,
    Speaking,
    Ended,
}

impl SessionState {
    /// Allowed transitions. Anything else is an invariant violation.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        // Any live state may end when the transport drops.
        if to == Ended {
            return self != Ended;
        }
        matches!(
            (self, to),
            (Greeting, Listening)
                | (Listening, Thinking)
                | (Listening, Listening)
                | (Thinking, Speaking)
                | (Thinking, Listening)
                | (Speaking, Listening)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Greeting => "Greeting",
            SessionState::Listening => "Listening",
            SessionState::Thinking => "Thinking",
            SessionState::Speaking => "Speaking",
            SessionState::Ended => "Ended",
        };
        write!(f, "{name}")
    }
}

/// Why a turn stopped being the in-flight turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    Completed,
    BargedIn,
    Error,
    Timeout,
}

/// One tool invocation inside a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub ok: bool,
}

/// One user utterance and the agent's response to it.
///
/// Mutated exclusively by the serving router task until `terminal_reason` is
/// set, then frozen and appended to history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_index: u64,
    pub user_text: String,
    pub response_chunks: Vec<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub terminal_reason: Option<TerminalReason>,
    /// The session's cancel epoch when this turn opened; a bump since then
    /// means the turn is stale.
    pub epoch: u64,
    /// Diagnostic note, e.g. that this turn displaced an older queued one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TurnRecord {
    pub fn open(turn_index: u64, user_text: impl Into<String>, epoch: u64) -> Self {
        Self {
            turn_index,
            user_text: user_text.into(),
            response_chunks: Vec::new(),
            tool_calls: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            terminal_reason: None,
            epoch,
            note: None,
        }
    }

    pub fn finalize(&mut self, reason: TerminalReason) {
        self.terminal_reason = Some(reason);
        self.ended_at = Some(Utc::now());
    }

    pub fn is_final(&self) -> bool {
        self.terminal_reason.is_some()
    }

    /// Full response text, as the concatenation of streamed chunks.
    pub fn response_text(&self) -> String {
        self.response_chunks.concat()
    }
}

/// The authoritative per-call entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub transport_kind: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_agent: Option<String>,
    pub turn_index: u64,
    pub history: Vec<TurnRecord>,
    /// Agent-namespaced scratch keys (verified-caller flags, collected slots).
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
    /// Bumped on every barge-in; invalidates in-flight turns remotely.
    pub cancel_epoch: u64,
    /// Worker that owns mutation of this record's live fields.
    pub owner_id: String,
    /// Monotonic version token for optimistic writes.
    pub version: u64,
    #[serde(default)]
    pub greeting_sent: bool,
}

impl SessionRecord {
    pub fn new(
        session_id: impl Into<String>,
        transport_kind: TransportKind,
        participant: Option<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            transport_kind,
            participant,
            created_at: now,
            last_activity_at: now,
            state: SessionState::Greeting,
            active_agent: None,
            turn_index: 0,
            history: Vec::new(),
            context: BTreeMap::new(),
            cancel_epoch: 0,
            owner_id: owner_id.into(),
            version: 0,
            greeting_sent: false,
        }
    }

    /// Move to `to`, rejecting transitions outside the table.
    pub fn transition(&mut self, to: SessionState) -> BridgeResult<()> {
        if !self.state.can_transition(to) {
            return Err(BridgeError::internal(format!(
                "disallowed state transition {} -> {} for session {}",
                self.state, to, self.session_id
            )));
        }
        self.state = to;
        self.last_activity_at = Utc::now();
        Ok(())
    }

    /// Append a frozen turn, truncating history to the configured window.
    pub fn push_turn(&mut self, turn: TurnRecord, window: usize) -> BridgeResult<()> {
        if !turn.is_final() {
            return Err(BridgeError::internal(format!(
                "attempted to append non-final turn {} to session {}",
                turn.turn_index, self.session_id
            )));
        }
        self.turn_index += 1;
        self.history.push(turn);
        if self.history.len() > window {
            let excess = self.history.len() - window;
            self.history.drain(..excess);
        }
        self.last_activity_at = Utc::now();
        Ok(())
    }
}
