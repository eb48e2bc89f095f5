//! Language model clients
//!
//! Two shapes behind one pool: a streaming chat-completion client used by the
//! orchestrator (tokens and assembled tool calls over a channel), and a
//! realtime voice client that turns caller audio directly into agent audio,
//! bypassing the orchestrator entirely.

mod chat;
mod realtime;

pub use chat::{ChatClientConfig, StreamingChatClient};
pub use realtime::{RealtimeVoiceConfig, RealtimeVoiceGateway};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ClientError;
use crate::audio::AudioFrame;
use crate::core::stt::TranscriptEvent;

/// Chat message roles, serialized the way the completion API expects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a chat transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallPayload>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    /// Assistant message carrying a tool call, fed back into the transcript
    /// so the follow-up completion sees what it asked for.
    pub fn assistant_tool_call(call: ToolCallPayload) -> Self {
        Self {
            role: Role::Assistant,
            content: None,
            tool_call_id: None,
            tool_calls: vec![call],
        }
    }

    /// Tool response message for a completed call.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_call_id: Some(call_id.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// A fully assembled tool call as it appears in the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    pub name: String,
    /// Raw JSON argument string as the model produced it.
    pub arguments: String,
}

/// Tool made available to the model for one completion.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One streaming completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            temperature: 0.5,
            max_tokens: 4096,
        }
    }
}

/// Why a completion stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
}

/// Events emitted by a streaming completion. Tool call argument deltas are
/// assembled inside the client; `ToolCallRequested` only fires once the
/// arguments parse as complete JSON.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Token(String),
    ToolCallRequested {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    Finished(FinishReason),
    Error(ClientError),
}

/// Streaming chat-completion handle.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ChatEvent>, ClientError>;

    fn provider_info(&self) -> &'static str;
}

/// A live realtime-voice session: caller audio in, agent audio and
/// transcripts out. Dropping the struct ends the session.
pub struct RealtimeVoiceSession {
    pub audio_tx: mpsc::Sender<AudioFrame>,
    pub audio_rx: mpsc::Receiver<AudioFrame>,
    pub transcript_rx: mpsc::Receiver<TranscriptEvent>,
}

/// End-to-end realtime voice handle (audio-to-audio, no orchestrator).
#[async_trait]
pub trait RealtimeVoice: Send {
    async fn start(
        &mut self,
        instructions: &str,
        voice: &str,
        cancel: CancellationToken,
    ) -> Result<RealtimeVoiceSession, ClientError>;

    fn provider_info(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::user("hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.content.as_deref(), Some("hello"));
        assert!(msg.tool_calls.is_empty());

        let tool = ChatMessage::tool_result("call_1", r#"{"ok":true}"#);
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_message_serialization_omits_empty_fields() {
        let json = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }

    #[test]
    fn test_assistant_tool_call_shape() {
        let msg = ChatMessage::assistant_tool_call(ToolCallPayload {
            id: "call_9".into(),
            name: "lookup_policy".into(),
            arguments: r#"{"policy_number":"A123"}"#.into(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""tool_calls""#));
        assert!(!json.contains(r#""content""#));
    }
}
