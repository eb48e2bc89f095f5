//! Streaming chat-completion client.
//!
//! Speaks the OpenAI-compatible SSE wire: one POST per completion, `data:`
//! lines carrying content and tool-call deltas. Tool call arguments arrive as
//! a stream of JSON fragments; they are assembled here and surfaced as a
//! single `ToolCallRequested` only once the arguments parse.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{ChatClient, ChatEvent, ChatRequest, FinishReason};
use crate::core::ClientError;

/// Events buffered toward the orchestrator.
const EVENT_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: FunctionDelta,
}

#[derive(Deserialize, Default)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates tool-call argument deltas until they form complete JSON.
#[derive(Default)]
struct ToolCallAssembler {
    calls: BTreeMap<usize, PendingCall>,
}

#[derive(Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAssembler {
    fn absorb(&mut self, delta: ToolCallDelta) {
        let pending = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id {
            pending.id = id;
        }
        if let Some(name) = delta.function.name {
            pending.name = name;
        }
        if let Some(args) = delta.function.arguments {
            pending.arguments.push_str(&args);
        }
    }

    fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drain assembled calls in index order; malformed argument payloads
    /// become errors so the orchestrator can treat them as a model fault.
    fn drain(&mut self) -> Vec<Result<ChatEvent, String>> {
        std::mem::take(&mut self.calls)
            .into_values()
            .map(|call| {
                let arguments = if call.arguments.is_empty() {
                    Ok(json!({}))
                } else {
                    serde_json::from_str(&call.arguments)
                };
                match arguments {
                    Ok(arguments) => Ok(ChatEvent::ToolCallRequested {
                        call_id: call.id,
                        name: call.name,
                        arguments,
                    }),
                    Err(e) => Err(format!(
                        "tool call '{}' produced malformed arguments: {e}",
                        call.name
                    )),
                }
            })
            .collect()
    }
}

fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "tool_calls" => FinishReason::ToolCalls,
        "length" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Streaming chat client over the completion API.
pub struct StreamingChatClient {
    http: reqwest::Client,
    config: ChatClientConfig,
}

impl StreamingChatClient {
    pub fn new(config: ChatClientConfig) -> Result<Self, ClientError> {
        if config.api_key.is_empty() {
            return Err(ClientError::ConfigurationError(
                "LLM API key is required".into(),
            ));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClientError::ConfigurationError(format!("http client: {e}")))?;
        Ok(Self { http, config })
    }

    fn request_body(&self, request: &ChatRequest) -> serde_json::Value {
        let tools: Vec<_> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.config.model,
            "messages": request.messages,
            "stream": true,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }
        body
    }
}

#[async_trait]
impl ChatClient for StreamingChatClient {
    async fn chat(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ChatEvent>, ClientError> {
        let url = format!("{}/chat/completions", self.config.endpoint);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(&request))
            .send()
            .await
            .map_err(|e| ClientError::NetworkError(format!("completion request: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::ProviderError(format!(
                "completion returned {status}: {body}"
            )));
        }

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let mut byte_stream = response.bytes_stream();

        tokio::spawn(async move {
            let mut assembler = ToolCallAssembler::default();
            let mut line_buffer = String::new();
            let mut finish = None;

            'stream: loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("completion stream cancelled");
                        return;
                    }
                    chunk = byte_stream.next() => chunk,
                };

                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = event_tx
                            .send(ChatEvent::Error(ClientError::NetworkError(format!(
                                "completion stream: {e}"
                            ))))
                            .await;
                        return;
                    }
                    None => break,
                };

                line_buffer.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = line_buffer.find('\n') {
                    let line = line_buffer[..pos].trim().to_string();
                    line_buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    if data == "[DONE]" {
                        break 'stream;
                    }

                    let chunk: StreamChunk = match serde_json::from_str(data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            warn!("unparseable completion chunk: {e}");
                            continue;
                        }
                    };

                    for choice in chunk.choices {
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty()
                                && event_tx.send(ChatEvent::Token(content)).await.is_err()
                            {
                                return;
                            }
                        }
                        for delta in choice.delta.tool_calls {
                            assembler.absorb(delta);
                        }
                        if let Some(reason) = choice.finish_reason {
                            finish = Some(parse_finish_reason(&reason));
                        }
                    }
                }
            }

            if !assembler.is_empty() {
                for assembled in assembler.drain() {
                    let event = match assembled {
                        Ok(event) => event,
                        Err(message) => {
                            error!("{message}");
                            ChatEvent::Error(ClientError::ProviderError(message))
                        }
                    };
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
            }

            let _ = event_tx
                .send(ChatEvent::Finished(finish.unwrap_or(FinishReason::Stop)))
                .await;
        });

        Ok(event_rx)
    }

    fn provider_info(&self) -> &'static str {
        "streaming chat completions"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(index: usize, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(String::from),
            function: FunctionDelta {
                name: name.map(String::from),
                arguments: args.map(String::from),
            },
        }
    }

    #[test]
    fn test_assembler_joins_argument_fragments() {
        let mut assembler = ToolCallAssembler::default();
        assembler.absorb(delta(0, Some("call_1"), Some("lookup_policy"), None));
        assembler.absorb(delta(0, None, None, Some(r#"{"policy_"#)));
        assembler.absorb(delta(0, None, None, Some(r#"number":"A123"}"#)));

        let mut drained = assembler.drain();
        assert_eq!(drained.len(), 1);
        match drained.pop().unwrap().unwrap() {
            ChatEvent::ToolCallRequested {
                call_id,
                name,
                arguments,
            } => {
                assert_eq!(call_id, "call_1");
                assert_eq!(name, "lookup_policy");
                assert_eq!(arguments["policy_number"], "A123");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_assembler_flags_malformed_arguments() {
        let mut assembler = ToolCallAssembler::default();
        assembler.absorb(delta(0, Some("call_1"), Some("broken"), Some("{not json")));

        let drained = assembler.drain();
        assert!(drained[0].is_err());
    }

    #[test]
    fn test_assembler_empty_arguments_become_empty_object() {
        let mut assembler = ToolCallAssembler::default();
        assembler.absorb(delta(0, Some("call_1"), Some("ping"), None));

        let mut drained = assembler.drain();
        match drained.pop().unwrap().unwrap() {
            ChatEvent::ToolCallRequested { arguments, .. } => {
                assert_eq!(arguments, json!({}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_finish_reason() {
        assert_eq!(parse_finish_reason("stop"), FinishReason::Stop);
        assert_eq!(parse_finish_reason("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(parse_finish_reason("length"), FinishReason::Length);
    }

    #[test]
    fn test_stream_chunk_parses_token_delta() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
    }

    #[test]
    fn test_new_rejects_empty_api_key() {
        let result = StreamingChatClient::new(ChatClientConfig {
            endpoint: "https://llm.example.com/v1".into(),
            api_key: String::new(),
            model: "gpt-4o-mini".into(),
        });
        assert!(matches!(result, Err(ClientError::ConfigurationError(_))));
    }
}
