//! Application state.
//!
//! The process-wide singletons: the three client pools, the session store,
//! the agent registry and orchestrator, the call-control facade, and the
//! registry of live sessions served by this worker.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::core::llm::{
    ChatClient, ChatClientConfig, RealtimeVoice, RealtimeVoiceConfig, RealtimeVoiceGateway,
    StreamingChatClient,
};
use crate::core::pool::ClientPool;
use crate::core::stt::{SpeechRecognizer, SttClientConfig, StreamingSttClient};
use crate::core::tts::{StreamingTtsClient, Synthesizer, TtsClientConfig};
use crate::dashboard::DashboardHub;
use crate::errors::{BridgeError, BridgeResult, ErrorKind};
use crate::orchestrator::{AgentRegistry, Orchestrator, builtin_tools};
use crate::session::conductor::{ConductorDeps, SessionHandle};
use crate::session::redis::RedisStore;
use crate::session::store::{MemoryStore, SessionStore};
use crate::telephony::{CallControl, CallControlConfig};

pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<dyn SessionStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub stt_pool: ClientPool<dyn SpeechRecognizer>,
    pub tts_pool: ClientPool<dyn Synthesizer>,
    pub llm_pool: ClientPool<dyn ChatClient>,
    pub realtime_pool: ClientPool<dyn RealtimeVoice>,
    pub dashboard: Arc<DashboardHub>,
    pub call_control: Arc<CallControl>,
    /// Sessions currently served by this worker, by session id.
    pub live_sessions: DashMap<String, SessionHandle>,
    pub worker_id: String,
}

impl AppState {
    /// Build the process singletons. A dedicated error kind distinguishes a
    /// cache that cannot be reached (startup exit code 3) from plain
    /// misconfiguration (exit code 1).
    pub async fn new(config: ServerConfig) -> BridgeResult<Arc<Self>> {
        let worker_id = format!("worker-{}", Uuid::new_v4());

        let store: Arc<dyn SessionStore> = match &config.redis_url {
            Some(url) => {
                let store = RedisStore::connect(url, config.session_ttl())
                    .await
                    .map_err(|e| BridgeError::new(ErrorKind::Upstream, e.to_string()))?;
                info!("session store: redis");
                Arc::new(store)
            }
            None => {
                info!("session store: in-process memory");
                Arc::new(MemoryStore::new(config.session_ttl()))
            }
        };

        let tools = Arc::new(builtin_tools());
        let registry = Arc::new(AgentRegistry::from_specs(
            config.agents.clone(),
            &config.default_agent,
            &tools,
        )?);

        let stt_pool = stt_pool_from_config(&config);
        let tts_pool = tts_pool_from_config(&config);
        let llm_pool = llm_pool_from_config(&config);
        let realtime_pool = realtime_pool_from_config(&config);

        let orchestrator = Arc::new(Orchestrator::new(
            registry,
            llm_pool.clone(),
            tools,
            store.clone(),
            config.orchestrator_settings(),
        ));

        let call_control = Arc::new(CallControl::new(CallControlConfig {
            base_url: config.telephony.base_url.clone(),
            api_key: config.telephony.api_key.clone(),
            source_number: config.telephony.source_number.clone(),
            callback_url: config.telephony.callback_url.clone(),
            media_stream_url: config.telephony.media_stream_url.clone(),
        })?);

        Ok(Arc::new(Self {
            config,
            store,
            orchestrator,
            stt_pool,
            tts_pool,
            llm_pool,
            realtime_pool,
            dashboard: Arc::new(DashboardHub::new()),
            call_control,
            live_sessions: DashMap::new(),
            worker_id,
        }))
    }

    /// Everything one session conductor needs.
    pub fn conductor_deps(&self) -> ConductorDeps {
        ConductorDeps {
            store: self.store.clone(),
            orchestrator: self.orchestrator.clone(),
            stt_pool: self.stt_pool.clone(),
            tts_pool: self.tts_pool.clone(),
            realtime_pool: self.realtime_pool.clone(),
            dashboard: self.dashboard.clone(),
            settings: self.config.session_settings(),
            worker_id: self.worker_id.clone(),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.live_sessions.len()
    }

    /// Register a live session; returns its cancellation handle.
    pub fn register_session(&self, session_id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.live_sessions.insert(
            session_id.to_string(),
            SessionHandle {
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn unregister_session(&self, session_id: &str) {
        self.live_sessions.remove(session_id);
    }

    /// Cancel a live session by id (hang-up endpoint). Returns whether the
    /// session was known to this worker.
    pub fn hangup_session(&self, session_id: &str) -> bool {
        match self.live_sessions.get(session_id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Shut down: stop accepting, give sessions a grace window to end
    /// naturally, then force cancellation.
    pub async fn shutdown(&self, grace: Duration) {
        info!(
            active = self.active_sessions(),
            "shutting down, waiting for sessions to end"
        );
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_sessions() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for entry in self.live_sessions.iter() {
            entry.value().cancel.cancel();
        }
    }
}

fn stt_pool_from_config(config: &ServerConfig) -> ClientPool<dyn SpeechRecognizer> {
    let client_config = SttClientConfig {
        endpoint: config.stt.endpoint.clone(),
        api_key: config.stt.api_key.clone(),
        language: "en-US".into(),
        sample_rate: config.sample_rate(),
    };
    ClientPool::new(
        "stt",
        config.pool_sizes.stt,
        Box::new(move || {
            let client_config = client_config.clone();
            Box::pin(async move {
                let client = StreamingSttClient::connect(client_config).await?;
                Ok(Box::new(client) as Box<dyn SpeechRecognizer>)
            })
        }),
    )
}

fn tts_pool_from_config(config: &ServerConfig) -> ClientPool<dyn Synthesizer> {
    let client_config = TtsClientConfig {
        endpoint: config.tts.endpoint.clone(),
        api_key: config.tts.api_key.clone(),
        sample_rate: config.sample_rate(),
    };
    ClientPool::new(
        "tts",
        config.pool_sizes.tts,
        Box::new(move || {
            let client_config = client_config.clone();
            Box::pin(async move {
                let client = StreamingTtsClient::new(client_config)?;
                Ok(Box::new(client) as Box<dyn Synthesizer>)
            })
        }),
    )
}

fn llm_pool_from_config(config: &ServerConfig) -> ClientPool<dyn ChatClient> {
    let client_config = ChatClientConfig {
        endpoint: config.llm.endpoint.clone(),
        api_key: config.llm.api_key.clone(),
        model: config.llm.model.clone(),
    };
    ClientPool::new(
        "llm",
        config.pool_sizes.llm,
        Box::new(move || {
            let client_config = client_config.clone();
            Box::pin(async move {
                let client = StreamingChatClient::new(client_config)?;
                Ok(Box::new(client) as Box<dyn ChatClient>)
            })
        }),
    )
}

fn realtime_pool_from_config(config: &ServerConfig) -> ClientPool<dyn RealtimeVoice> {
    let client_config = RealtimeVoiceConfig {
        endpoint: config.llm.realtime_endpoint.clone(),
        api_key: config.llm.api_key.clone(),
        model: config.llm.realtime_model.clone(),
    };
    ClientPool::new(
        "realtime",
        config.pool_sizes.llm,
        Box::new(move || {
            let client_config = client_config.clone();
            Box::pin(async move {
                let client = RealtimeVoiceGateway::new(client_config)?;
                Ok(Box::new(client) as Box<dyn RealtimeVoice>)
            })
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.stt.api_key = "k".into();
        config.tts.api_key = "k".into();
        config.llm.api_key = "k".into();
        config
    }

    #[tokio::test]
    async fn test_app_state_builds_without_redis() {
        let state = AppState::new(configured()).await.unwrap();
        assert_eq!(state.active_sessions(), 0);
        assert!(state.worker_id.starts_with("worker-"));
    }

    #[tokio::test]
    async fn test_session_registry_lifecycle() {
        let state = AppState::new(configured()).await.unwrap();

        let cancel = state.register_session("s1");
        assert_eq!(state.active_sessions(), 1);

        assert!(state.hangup_session("s1"));
        assert!(cancel.is_cancelled());
        assert!(!state.hangup_session("unknown"));

        state.unregister_session("s1");
        assert_eq!(state.active_sessions(), 0);
    }
}
