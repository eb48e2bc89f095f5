//! Agent orchestrator
//!
//! Drives one conversational turn: picks the specialist, composes the
//! prompt from the session history, streams the completion, executes tool
//! calls (with the reserved `handoff_to` intercepted as an agent transfer),
//! and emits the whole thing as an ordered event stream. A turn that ends
//! without a `Done` event either lost its upstream or was cancelled; the
//! router tells the two apart by its own cancellation token.

pub mod registry;
pub mod tools;

pub use registry::{AgentRegistry, AgentSpec, default_agents};
pub use tools::{HANDOFF_TOOL, ToolContext, ToolDescriptor, ToolSet, builtin_tools};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::ClientError;
use crate::core::llm::{
    ChatClient, ChatEvent, ChatMessage, ChatRequest, ToolCallPayload, ToolSchema,
};
use crate::core::pool::{ClientPool, Lease};
use crate::session::record::{SessionRecord, ToolCallRecord};
use crate::session::store::SessionStore;

/// Tool-execution iterations allowed per turn.
pub const MAX_TOOL_ITERATIONS: usize = 5;

/// Agent transfers allowed per turn.
pub const MAX_HANDOFFS: usize = 1;

/// Orchestrator events buffered toward the router.
const EVENT_CHANNEL_DEPTH: usize = 64;

/// Streamed output of one turn.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    TextChunk(String),
    ToolInvoked { name: String, args: Value },
    ToolResult { name: String, ok: bool },
    Handoff(String),
    Done(String),
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub history_window: usize,
    pub tool_timeout: Duration,
    pub fallback_phrase: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            history_window: 8,
            tool_timeout: Duration::from_secs(10),
            fallback_phrase: "I'm sorry, I didn't catch that. Could you say it again?".into(),
        }
    }
}

/// Selects specialists and runs turns. One instance per process, shared by
/// every session.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    llm_pool: ClientPool<dyn ChatClient>,
    tools: Arc<ToolSet>,
    store: Arc<dyn SessionStore>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        llm_pool: ClientPool<dyn ChatClient>,
        tools: Arc<ToolSet>,
        store: Arc<dyn SessionStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            llm_pool,
            tools,
            store,
            settings,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run one turn. Events stream out of the returned channel; the channel
    /// closing without a `Done` means the turn failed or was cancelled.
    pub fn run_turn(
        self: Arc<Self>,
        session: SessionRecord,
        user_text: String,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<OrchestratorEvent> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let this = self;

        tokio::spawn(async move {
            if let Err(e) = this.drive(session, user_text, cancel, &events_tx).await {
                match e {
                    ClientError::Cancelled => debug!("turn cancelled"),
                    other => error!(error = %other, "turn failed"),
                }
            }
        });

        events_rx
    }

    async fn drive(
        &self,
        session: SessionRecord,
        user_text: String,
        cancel: CancellationToken,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<(), ClientError> {
        let mut lease = self
            .llm_pool
            .acquire_timeout(Duration::from_secs(5))
            .await?;

        let result = self
            .drive_with(&mut lease, session, user_text, cancel, events)
            .await;

        if let Err(e) = &result {
            if matches!(
                e,
                ClientError::NetworkError(_) | ClientError::ConnectionFailed(_)
            ) {
                lease.discard();
            }
        }
        result
    }

    async fn drive_with(
        &self,
        lease: &mut Lease<dyn ChatClient>,
        session: SessionRecord,
        user_text: String,
        cancel: CancellationToken,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<(), ClientError> {
        let mut agent = self
            .select_agent(&**lease, &session, &user_text, &cancel)
            .await;
        info!(session_id = %session.session_id, agent = %agent.key, "serving turn");

        let tool_ctx = ToolContext {
            session_id: session.session_id.clone(),
            context: session.context.clone(),
        };

        let mut accumulated = String::new();
        let mut handoffs = 0;
        let mut tool_iterations = 0;

        'agent: loop {
            let mut messages = self.compose(agent, &session, &user_text);
            let schemas = self.agent_tool_schemas(agent);

            loop {
                if cancel.is_cancelled() {
                    return Err(ClientError::Cancelled);
                }

                let mut request = ChatRequest::new(messages.clone());
                request.tools = schemas.clone();
                let mut stream = lease.chat(request, cancel.clone()).await?;

                let mut pending_call: Option<(String, String, Value)> = None;
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                        event = stream.recv() => event,
                    };
                    let Some(event) = event else {
                        // Stream closed without Finished: upstream gave up.
                        if pending_call.is_none() {
                            return Err(ClientError::ProviderError(
                                "completion stream ended unexpectedly".into(),
                            ));
                        }
                        break;
                    };

                    match event {
                        ChatEvent::Token(token) => {
                            accumulated.push_str(&token);
                            if events
                                .send(OrchestratorEvent::TextChunk(token))
                                .await
                                .is_err()
                            {
                                return Err(ClientError::Cancelled);
                            }
                        }
                        ChatEvent::ToolCallRequested {
                            call_id,
                            name,
                            arguments,
                        } => {
                            pending_call = Some((call_id, name, arguments));
                        }
                        ChatEvent::Finished(_) => break,
                        ChatEvent::Error(e) => return Err(e),
                    }
                }

                let Some((call_id, name, args)) = pending_call.take() else {
                    break 'agent;
                };

                // Handoff is routing, not execution.
                if name == HANDOFF_TOOL {
                    match self
                        .resolve_handoff(agent, &args, handoffs, &session, events)
                        .await?
                    {
                        Some(next_agent) => {
                            handoffs += 1;
                            agent = next_agent;
                            continue 'agent;
                        }
                        None => {
                            messages.push(ChatMessage::assistant_tool_call(ToolCallPayload {
                                id: call_id.clone(),
                                name,
                                arguments: args.to_string(),
                            }));
                            messages.push(ChatMessage::tool_result(
                                call_id,
                                r#"{"error":"handoff refused"}"#,
                            ));
                            continue;
                        }
                    }
                }

                tool_iterations += 1;
                if tool_iterations > MAX_TOOL_ITERATIONS {
                    warn!(
                        session_id = %session.session_id,
                        "tool iteration cap reached, finishing turn"
                    );
                    break 'agent;
                }

                let outcome = self
                    .invoke_tool(agent, &name, &args, tool_ctx.clone(), events)
                    .await?;

                messages.push(ChatMessage::assistant_tool_call(ToolCallPayload {
                    id: call_id.clone(),
                    name: name.clone(),
                    arguments: args.to_string(),
                }));
                messages.push(ChatMessage::tool_result(call_id, outcome));
            }
        }

        let final_text = if accumulated.trim().is_empty() {
            self.settings.fallback_phrase.clone()
        } else {
            accumulated
        };
        let _ = events.send(OrchestratorEvent::Done(final_text)).await;
        Ok(())
    }

    /// Reuse the active agent when it can hold the turn, otherwise classify.
    async fn select_agent(
        &self,
        chat: &dyn ChatClient,
        session: &SessionRecord,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> &AgentSpec {
        if let Some(active) = session
            .active_agent
            .as_deref()
            .and_then(|key| self.registry.get(key))
        {
            if active.can_handle(user_text, &session.context) {
                return active;
            }
        }

        match self.classify_intent(chat, user_text, cancel).await {
            Some(key) => self.registry.get(&key).unwrap_or_else(|| {
                debug!(key = %key, "classifier returned unknown agent, using default");
                self.registry.default_agent()
            }),
            None => self.registry.default_agent(),
        }
    }

    /// One small completion with a fixed prompt listing the roster.
    async fn classify_intent(
        &self,
        chat: &dyn ChatClient,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let roster: Vec<String> = self
            .registry
            .specs()
            .map(|spec| format!("- {}: {}", spec.key, spec.display_name))
            .collect();
        let prompt = format!(
            "Pick the single best agent for the caller's request. Answer with the agent key \
             only.\nAgents:\n{}\nRequest: {}",
            roster.join("\n"),
            user_text
        );

        let mut request = ChatRequest::new(vec![ChatMessage::system(prompt)]);
        request.max_tokens = 16;
        request.temperature = 0.0;

        let mut stream = chat.chat(request, cancel.clone()).await.ok()?;
        let mut answer = String::new();
        while let Some(event) = stream.recv().await {
            match event {
                ChatEvent::Token(token) => answer.push_str(&token),
                ChatEvent::Finished(_) => break,
                ChatEvent::Error(e) => {
                    warn!(error = %e, "intent classifier failed");
                    return None;
                }
                _ => {}
            }
        }

        let answer = answer.trim().to_lowercase();
        self.registry
            .keys()
            .find(|key| answer == *key || answer.contains(*key))
            .map(String::from)
    }

    /// System prompt, truncated history window, then the new user message.
    fn compose(
        &self,
        agent: &AgentSpec,
        session: &SessionRecord,
        user_text: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(&agent.system_prompt)];

        let window = self.settings.history_window;
        let skip = session.history.len().saturating_sub(window);
        for turn in session.history.iter().skip(skip) {
            messages.push(ChatMessage::user(&turn.user_text));
            let response = turn.response_text();
            if !response.is_empty() {
                messages.push(ChatMessage::assistant(response));
            }
        }

        messages.push(ChatMessage::user(user_text));
        messages
    }

    fn agent_tool_schemas(&self, agent: &AgentSpec) -> Vec<ToolSchema> {
        agent
            .tools
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(ToolDescriptor::schema)
            .collect()
    }

    /// Validate and apply a handoff request. Returns the target agent, or
    /// `None` when the request is refused (unknown target, not an allowed
    /// escalation, or the per-turn handoff budget is spent).
    async fn resolve_handoff(
        &self,
        agent: &AgentSpec,
        args: &Value,
        handoffs: usize,
        session: &SessionRecord,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<Option<&AgentSpec>, ClientError> {
        let Some(target) = args.get("to").and_then(Value::as_str) else {
            warn!("handoff request without target");
            return Ok(None);
        };

        if handoffs >= MAX_HANDOFFS {
            warn!(target, "handoff budget spent for this turn");
            return Ok(None);
        }
        if !agent.can_escalate_to.iter().any(|key| key == target) {
            warn!(from = %agent.key, target, "handoff target not in escalation list");
            return Ok(None);
        }
        let Some(next_agent) = self.registry.get(target) else {
            warn!(target, "handoff to unregistered agent");
            return Ok(None);
        };

        let target_owned = target.to_string();
        self.store
            .mutate(&session.session_id, &session.owner_id, &move |record| {
                record.active_agent = Some(target_owned.clone());
                record
                    .context
                    .insert(format!("{target_owned}.engaged"), Value::Bool(true));
                Ok(())
            })
            .await
            .map_err(|e| ClientError::ProviderError(format!("handoff persist failed: {e}")))?;

        info!(from = %agent.key, to = target, "agent handoff");
        let _ = events
            .send(OrchestratorEvent::Handoff(target.to_string()))
            .await;
        Ok(Some(next_agent))
    }

    /// Execute one tool under the wall clock, emitting the invoke/result
    /// bracket around it. A tool missing from the agent's list is a model
    /// error fed back as a failed result.
    async fn invoke_tool(
        &self,
        agent: &AgentSpec,
        name: &str,
        args: &Value,
        ctx: ToolContext,
        events: &mpsc::Sender<OrchestratorEvent>,
    ) -> Result<String, ClientError> {
        let _ = events
            .send(OrchestratorEvent::ToolInvoked {
                name: name.to_string(),
                args: args.clone(),
            })
            .await;

        let allowed = agent.tools.iter().any(|t| t == name);
        let outcome = if !allowed {
            warn!(agent = %agent.key, tool = name, "model requested tool outside its list");
            Err(format!("tool '{name}' is not available"))
        } else {
            let Some(tool) = self.tools.get(name) else {
                return Err(ClientError::ConfigurationError(format!(
                    "agent tool '{name}' missing from tool set"
                )));
            };
            match timeout(self.settings.tool_timeout, tool.execute(args.clone(), ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(tool = name, "tool execution hit the wall clock");
                    Err(format!(
                        "tool '{name}' timed out after {:?}",
                        self.settings.tool_timeout
                    ))
                }
            }
        };

        let (ok, payload) = match outcome {
            Ok(result) => (true, result),
            Err(message) => (false, serde_json::json!({ "error": message }).to_string()),
        };

        let _ = events
            .send(OrchestratorEvent::ToolResult {
                name: name.to_string(),
                ok,
            })
            .await;

        Ok(payload)
    }
}

/// Project an orchestrator event into the turn record's tool log.
pub fn record_tool_event(record: &mut Vec<ToolCallRecord>, event: &OrchestratorEvent) {
    if let OrchestratorEvent::ToolResult { name, ok } = event {
        record.push(ToolCallRecord {
            name: name.clone(),
            ok: *ok,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::record::{TerminalReason, TransportKind, TurnRecord};

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings::default()
    }

    fn orchestrator_for_compose() -> Orchestrator {
        let tools = Arc::new(builtin_tools());
        let registry = Arc::new(
            AgentRegistry::from_specs(default_agents(), "greeter", &tools).unwrap(),
        );
        let store = Arc::new(crate::session::store::MemoryStore::new(
            Duration::from_secs(60),
        ));
        let pool: ClientPool<dyn ChatClient> = ClientPool::new(
            "llm",
            1,
            Box::new(|| {
                Box::pin(async { Err(ClientError::ConfigurationError("unused".into())) })
            }),
        );
        Orchestrator::new(registry, pool, tools, store, settings())
    }

    #[test]
    fn test_compose_includes_window_and_user_message() {
        let orch = orchestrator_for_compose();
        let agent = orch.registry.default_agent().clone();

        let mut session = SessionRecord::new("s1", TransportKind::Browser, None, "w1");
        for i in 0..12 {
            let mut turn = TurnRecord::open(i, format!("question {i}"), 0);
            turn.response_chunks.push(format!("answer {i}"));
            turn.finalize(TerminalReason::Completed);
            session.push_turn(turn, 64).unwrap();
        }

        let messages = orch.compose(&agent, &session, "new question");

        // System + 8 windowed turns (user+assistant each) + the new message.
        assert_eq!(messages.len(), 1 + 8 * 2 + 1);
        assert_eq!(messages[1].content.as_deref(), Some("question 4"));
        assert_eq!(
            messages.last().unwrap().content.as_deref(),
            Some("new question")
        );
    }

    #[test]
    fn test_agent_tool_schemas_filters_to_agent_list() {
        let orch = orchestrator_for_compose();
        let claims = orch.registry.get("claims").unwrap();

        let schemas = orch.agent_tool_schemas(claims);
        let names: Vec<_> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["lookup_policy"]);
    }

    #[test]
    fn test_record_tool_event_captures_results_only() {
        let mut log = Vec::new();
        record_tool_event(
            &mut log,
            &OrchestratorEvent::ToolInvoked {
                name: "lookup_policy".into(),
                args: serde_json::json!({}),
            },
        );
        assert!(log.is_empty());

        record_tool_event(
            &mut log,
            &OrchestratorEvent::ToolResult {
                name: "lookup_policy".into(),
                ok: true,
            },
        );
        assert_eq!(log.len(), 1);
        assert!(log[0].ok);
    }
}
