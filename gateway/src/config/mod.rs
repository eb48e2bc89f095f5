//! Server configuration.
//!
//! Layered the usual way: a YAML file supplies the base (every field
//! optional), environment variables override it, and hard defaults fill the
//! rest. Credential presence is checked separately at startup so the daemon
//! can exit with the dedicated code before touching the network.

pub mod yaml;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{BridgeError, BridgeResult};
use crate::orchestrator::{AgentSpec, OrchestratorSettings, default_agents};
use crate::session::conductor::SessionSettings;
use yaml::YamlConfig;

/// Which pipeline shape a session gets. Fixed at session creation; a
/// mid-call switch request is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    Media,
    Transcription,
    RealtimeVoice,
}

impl std::str::FromStr for StreamingMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "media" => Ok(StreamingMode::Media),
            "transcription" => Ok(StreamingMode::Transcription),
            "realtime_voice" | "realtime-voice" => Ok(StreamingMode::RealtimeVoice),
            other => Err(BridgeError::config(format!(
                "unknown streaming_mode '{other}'; expected media, transcription or realtime_voice"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSizes {
    pub stt: usize,
    pub tts: usize,
    pub llm: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            stt: 256,
            tts: 256,
            llm: 256,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderEndpoint {
    pub endpoint: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct LlmEndpoints {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub realtime_endpoint: String,
    pub realtime_model: String,
}

#[derive(Debug, Clone, Default)]
pub struct TelephonySettings {
    pub base_url: String,
    pub api_key: String,
    pub source_number: Option<String>,
    pub callback_url: String,
    pub media_stream_url: String,
}

#[derive(Debug, Clone)]
pub struct Phrases {
    pub greeting: String,
    pub fallback: String,
    pub goodbye: String,
    pub stopwords: Vec<String>,
}

impl Default for Phrases {
    fn default() -> Self {
        let defaults = SessionSettings::default();
        Self {
            greeting: defaults.greeting_phrase,
            fallback: defaults.fallback_phrase,
            goodbye: defaults.goodbye_phrase,
            stopwords: defaults.stopwords,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_allowed_origins: Option<String>,

    pub streaming_mode: StreamingMode,
    pub pool_sizes: PoolSizes,
    pub turn_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    pub history_window_turns: usize,
    pub barge_in_stability_threshold: f32,
    pub barge_in_min_audio_ms: u64,
    pub session_ttl_seconds: u64,

    pub redis_url: Option<String>,
    pub stt: ProviderEndpoint,
    pub tts: ProviderEndpoint,
    pub llm: LlmEndpoints,
    pub telephony: TelephonySettings,
    pub phrases: Phrases,

    pub agents: Vec<AgentSpec>,
    pub default_agent: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            cors_allowed_origins: None,
            streaming_mode: StreamingMode::Transcription,
            pool_sizes: PoolSizes::default(),
            turn_timeout_ms: 30_000,
            tool_timeout_ms: 10_000,
            history_window_turns: 8,
            barge_in_stability_threshold: 0.3,
            barge_in_min_audio_ms: 120,
            session_ttl_seconds: 86_400,
            redis_url: None,
            stt: ProviderEndpoint::default(),
            tts: ProviderEndpoint::default(),
            llm: LlmEndpoints::default(),
            telephony: TelephonySettings::default(),
            phrases: Phrases::default(),
            agents: default_agents(),
            default_agent: "greeter".into(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> BridgeResult<Option<T>> {
    match env_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| BridgeError::config(format!("invalid value for {name}: '{raw}'"))),
        None => Ok(None),
    }
}

impl ServerConfig {
    /// Configuration from environment variables alone.
    pub fn from_env() -> BridgeResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration from a YAML file, then environment overrides.
    pub fn from_file(path: &Path) -> BridgeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let yaml: YamlConfig = serde_yaml::from_str(&raw).map_err(|e| {
            BridgeError::config(format!("invalid config file {}: {e}", path.display()))
        })?;

        let mut config = Self::default();
        config.apply_yaml(yaml)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_yaml(&mut self, yaml: YamlConfig) -> BridgeResult<()> {
        if let Some(server) = yaml.server {
            if let Some(host) = server.host {
                self.host = host;
            }
            if let Some(port) = server.port {
                self.port = port;
            }
            if server.cors_allowed_origins.is_some() {
                self.cors_allowed_origins = server.cors_allowed_origins;
            }
        }

        if let Some(pipeline) = yaml.pipeline {
            if let Some(mode) = pipeline.streaming_mode {
                self.streaming_mode = mode.parse()?;
            }
            if let Some(v) = pipeline.turn_timeout_ms {
                self.turn_timeout_ms = v;
            }
            if let Some(v) = pipeline.tool_timeout_ms {
                self.tool_timeout_ms = v;
            }
            if let Some(v) = pipeline.history_window_turns {
                self.history_window_turns = v;
            }
            if let Some(v) = pipeline.barge_in_stability_threshold {
                self.barge_in_stability_threshold = v;
            }
            if let Some(v) = pipeline.barge_in_min_audio_ms {
                self.barge_in_min_audio_ms = v;
            }
        }

        if let Some(pools) = yaml.pools {
            if let Some(v) = pools.stt {
                self.pool_sizes.stt = v;
            }
            if let Some(v) = pools.tts {
                self.pool_sizes.tts = v;
            }
            if let Some(v) = pools.llm {
                self.pool_sizes.llm = v;
            }
        }

        if let Some(cache) = yaml.cache {
            if cache.redis_url.is_some() {
                self.redis_url = cache.redis_url;
            }
            if let Some(v) = cache.session_ttl_seconds {
                self.session_ttl_seconds = v;
            }
        }

        if let Some(providers) = yaml.providers {
            if let Some(v) = providers.stt_endpoint {
                self.stt.endpoint = v;
            }
            if let Some(v) = providers.stt_api_key {
                self.stt.api_key = v;
            }
            if let Some(v) = providers.tts_endpoint {
                self.tts.endpoint = v;
            }
            if let Some(v) = providers.tts_api_key {
                self.tts.api_key = v;
            }
            if let Some(v) = providers.llm_endpoint {
                self.llm.endpoint = v;
            }
            if let Some(v) = providers.llm_api_key {
                self.llm.api_key = v;
            }
            if let Some(v) = providers.llm_model {
                self.llm.model = v;
            }
            if let Some(v) = providers.llm_realtime_endpoint {
                self.llm.realtime_endpoint = v;
            }
            if let Some(v) = providers.llm_realtime_model {
                self.llm.realtime_model = v;
            }
        }

        if let Some(telephony) = yaml.telephony {
            if let Some(v) = telephony.base_url {
                self.telephony.base_url = v;
            }
            if let Some(v) = telephony.api_key {
                self.telephony.api_key = v;
            }
            if telephony.source_number.is_some() {
                self.telephony.source_number = telephony.source_number;
            }
            if let Some(v) = telephony.callback_url {
                self.telephony.callback_url = v;
            }
            if let Some(v) = telephony.media_stream_url {
                self.telephony.media_stream_url = v;
            }
        }

        if let Some(phrases) = yaml.phrases {
            if let Some(v) = phrases.greeting {
                self.phrases.greeting = v;
            }
            if let Some(v) = phrases.fallback {
                self.phrases.fallback = v;
            }
            if let Some(v) = phrases.goodbye {
                self.phrases.goodbye = v;
            }
            if let Some(v) = phrases.stopwords {
                self.phrases.stopwords = v;
            }
        }

        if let Some(agents) = yaml.agents {
            self.agents = agents;
        }
        if let Some(default_agent) = yaml.default_agent {
            self.default_agent = default_agent;
        }

        Ok(())
    }

    fn apply_env(&mut self) -> BridgeResult<()> {
        if let Some(v) = env_var("VOICEBRIDGE_HOST") {
            self.host = v;
        }
        if let Some(v) = env_parse::<u16>("VOICEBRIDGE_PORT")? {
            self.port = v;
        }
        if let Some(v) = env_var("CORS_ALLOWED_ORIGINS") {
            self.cors_allowed_origins = Some(v);
        }
        if let Some(v) = env_var("STREAMING_MODE") {
            self.streaming_mode = v.parse()?;
        }
        if let Some(v) = env_parse::<usize>("POOL_SIZE_STT")? {
            self.pool_sizes.stt = v;
        }
        if let Some(v) = env_parse::<usize>("POOL_SIZE_TTS")? {
            self.pool_sizes.tts = v;
        }
        if let Some(v) = env_parse::<usize>("POOL_SIZE_LLM")? {
            self.pool_sizes.llm = v;
        }
        if let Some(v) = env_parse::<u64>("TURN_TIMEOUT_MS")? {
            self.turn_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("TOOL_TIMEOUT_MS")? {
            self.tool_timeout_ms = v;
        }
        if let Some(v) = env_parse::<usize>("HISTORY_WINDOW_TURNS")? {
            self.history_window_turns = v;
        }
        if let Some(v) = env_parse::<f32>("BARGE_IN_STABILITY_THRESHOLD")? {
            self.barge_in_stability_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("BARGE_IN_MIN_AUDIO_MS")? {
            self.barge_in_min_audio_ms = v;
        }
        if let Some(v) = env_parse::<u64>("SESSION_TTL_SECONDS")? {
            self.session_ttl_seconds = v;
        }
        if let Some(v) = env_var("REDIS_URL") {
            self.redis_url = Some(v);
        }
        if let Some(v) = env_var("STT_ENDPOINT") {
            self.stt.endpoint = v;
        }
        if let Some(v) = env_var("STT_API_KEY") {
            self.stt.api_key = v;
        }
        if let Some(v) = env_var("TTS_ENDPOINT") {
            self.tts.endpoint = v;
        }
        if let Some(v) = env_var("TTS_API_KEY") {
            self.tts.api_key = v;
        }
        if let Some(v) = env_var("LLM_ENDPOINT") {
            self.llm.endpoint = v;
        }
        if let Some(v) = env_var("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = env_var("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = env_var("LLM_REALTIME_ENDPOINT") {
            self.llm.realtime_endpoint = v;
        }
        if let Some(v) = env_var("LLM_REALTIME_MODEL") {
            self.llm.realtime_model = v;
        }
        if let Some(v) = env_var("TELEPHONY_BASE_URL") {
            self.telephony.base_url = v;
        }
        if let Some(v) = env_var("TELEPHONY_API_KEY") {
            self.telephony.api_key = v;
        }
        if let Some(v) = env_var("TELEPHONY_SOURCE_NUMBER") {
            self.telephony.source_number = Some(v);
        }
        if let Some(v) = env_var("TELEPHONY_CALLBACK_URL") {
            self.telephony.callback_url = v;
        }
        if let Some(v) = env_var("TELEPHONY_MEDIA_STREAM_URL") {
            self.telephony.media_stream_url = v;
        }
        if let Some(v) = env_var("GREETING_PHRASE") {
            self.phrases.greeting = v;
        }
        if let Some(v) = env_var("FALLBACK_PHRASE") {
            self.phrases.fallback = v;
        }
        if let Some(v) = env_var("GOODBYE_PHRASE") {
            self.phrases.goodbye = v;
        }
        Ok(())
    }

    fn validate(&self) -> BridgeResult<()> {
        if !(0.0..=1.0).contains(&self.barge_in_stability_threshold) {
            return Err(BridgeError::config(
                "barge_in_stability_threshold must be within [0, 1]",
            ));
        }
        if self.history_window_turns == 0 {
            return Err(BridgeError::config("history_window_turns must be positive"));
        }
        if self.pool_sizes.stt == 0 || self.pool_sizes.tts == 0 || self.pool_sizes.llm == 0 {
            return Err(BridgeError::config("pool sizes must be positive"));
        }
        if self.agents.is_empty() {
            return Err(BridgeError::config("at least one agent must be registered"));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Sample rate the session is pinned to, by pipeline shape.
    pub fn sample_rate(&self) -> u32 {
        match self.streaming_mode {
            StreamingMode::RealtimeVoice => 24_000,
            _ => 16_000,
        }
    }

    /// Upstream credentials that must be present at startup. Which ones are
    /// required depends on the pipeline shape.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        match self.streaming_mode {
            StreamingMode::RealtimeVoice => {
                if self.llm.api_key.is_empty() {
                    missing.push("LLM_API_KEY");
                }
                if self.llm.realtime_endpoint.is_empty() {
                    missing.push("LLM_REALTIME_ENDPOINT");
                }
            }
            _ => {
                if self.stt.api_key.is_empty() {
                    missing.push("STT_API_KEY");
                }
                if self.tts.api_key.is_empty() {
                    missing.push("TTS_API_KEY");
                }
                if self.llm.api_key.is_empty() {
                    missing.push("LLM_API_KEY");
                }
            }
        }
        missing
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            sample_rate: self.sample_rate(),
            turn_timeout: Duration::from_millis(self.turn_timeout_ms),
            silence_timeout: SessionSettings::default().silence_timeout,
            barge_in_stability: self.barge_in_stability_threshold,
            barge_in_min_audio_ms: self.barge_in_min_audio_ms,
            max_upstream_strikes: SessionSettings::default().max_upstream_strikes,
            greeting_phrase: self.phrases.greeting.clone(),
            fallback_phrase: self.phrases.fallback.clone(),
            goodbye_phrase: self.phrases.goodbye.clone(),
            stopwords: self.phrases.stopwords.clone(),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            history_window: self.history_window_turns,
            tool_timeout: Duration::from_millis(self.tool_timeout_ms),
            fallback_phrase: self.phrases.fallback.clone(),
        }
    }
}

/// Emit a one-line warning for options that look suspicious but are legal.
pub fn warn_on_unusual(config: &ServerConfig) {
    if config.turn_timeout_ms < 5_000 {
        warn!(
            turn_timeout_ms = config.turn_timeout_ms,
            "turn timeout is unusually small"
        );
    }
    if config.redis_url.is_none() {
        warn!("no redis_url configured; sessions live in process memory only");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = ServerConfig::default();
        assert_eq!(config.turn_timeout_ms, 30_000);
        assert_eq!(config.tool_timeout_ms, 10_000);
        assert_eq!(config.history_window_turns, 8);
        assert_eq!(config.pool_sizes.stt, 256);
        assert_eq!(config.session_ttl_seconds, 86_400);
        assert!((config.barge_in_stability_threshold - 0.3).abs() < f32::EPSILON);
        assert_eq!(config.barge_in_min_audio_ms, 120);
    }

    #[test]
    fn test_streaming_mode_parses() {
        assert_eq!(
            "media".parse::<StreamingMode>().unwrap(),
            StreamingMode::Media
        );
        assert_eq!(
            "realtime_voice".parse::<StreamingMode>().unwrap(),
            StreamingMode::RealtimeVoice
        );
        assert!("broadcast".parse::<StreamingMode>().is_err());
    }

    #[test]
    fn test_sample_rate_follows_mode() {
        let mut config = ServerConfig::default();
        assert_eq!(config.sample_rate(), 16_000);
        config.streaming_mode = StreamingMode::RealtimeVoice;
        assert_eq!(config.sample_rate(), 24_000);
    }

    #[test]
    fn test_missing_credentials_by_mode() {
        let mut config = ServerConfig::default();
        assert_eq!(
            config.missing_credentials(),
            vec!["STT_API_KEY", "TTS_API_KEY", "LLM_API_KEY"]
        );

        config.stt.api_key = "k".into();
        config.tts.api_key = "k".into();
        config.llm.api_key = "k".into();
        assert!(config.missing_credentials().is_empty());

        config.streaming_mode = StreamingMode::RealtimeVoice;
        assert_eq!(config.missing_credentials(), vec!["LLM_REALTIME_ENDPOINT"]);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = ServerConfig::default();
        config.barge_in_stability_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_layering() {
        let yaml: YamlConfig = serde_yaml::from_str(
            r#"
server:
  port: 9001
pipeline:
  turn_timeout_ms: 12000
cache:
  redis_url: "redis://cache:6379"
"#,
        )
        .unwrap();

        let mut config = ServerConfig::default();
        config.apply_yaml(yaml).unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.turn_timeout_ms, 12_000);
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        // Untouched fields keep their defaults.
        assert_eq!(config.host, "0.0.0.0");
    }
}
