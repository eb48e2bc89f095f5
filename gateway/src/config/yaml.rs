//! YAML configuration structures.
//!
//! Every field is optional so a file can be partial; environment variables
//! override anything set here.
//!
//! # Example
//! ```yaml
//! server:
//!   host: "0.0.0.0"
//!   port: 8080
//!
//! pipeline:
//!   streaming_mode: transcription
//!   turn_timeout_ms: 30000
//!   tool_timeout_ms: 10000
//!   history_window_turns: 8
//!   barge_in_stability_threshold: 0.3
//!   barge_in_min_audio_ms: 120
//!
//! pools:
//!   stt: 256
//!   tts: 256
//!   llm: 256
//!
//! cache:
//!   redis_url: "redis://cache.internal:6379"
//!   session_ttl_seconds: 86400
//!
//! providers:
//!   stt_endpoint: "wss://stt.example.com/v1/stream"
//!   stt_api_key: "…"
//!   tts_endpoint: "wss://tts.example.com/v1/stream"
//!   tts_api_key: "…"
//!   llm_endpoint: "https://llm.example.com/v1"
//!   llm_api_key: "…"
//!   llm_model: "gpt-4o-mini"
//!   llm_realtime_endpoint: "wss://llm.example.com/v1/realtime"
//!   llm_realtime_model: "gpt-realtime"
//!
//! telephony:
//!   base_url: "https://telephony.example.com/v1"
//!   api_key: "…"
//!   source_number: "+15550000000"
//!   callback_url: "https://gw.example.com/call/incoming"
//!   media_stream_url: "wss://gw.example.com/call/stream"
//!
//! phrases:
//!   greeting: "Hi! You're connected."
//!   fallback: "Sorry, could you say that again?"
//!   goodbye: "Thanks for calling. Goodbye!"
//!   stopwords: ["goodbye", "bye bye"]
//!
//! agents:
//!   - key: greeter
//!     display_name: "Ava"
//!     system_prompt: "You are Ava…"
//!     tools: [handoff_to]
//!     can_escalate_to: [claims]
//!     voice_profile: aria
//! ```

use serde::Deserialize;

use crate::orchestrator::AgentSpec;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub pipeline: Option<PipelineYaml>,
    pub pools: Option<PoolsYaml>,
    pub cache: Option<CacheYaml>,
    pub providers: Option<ProvidersYaml>,
    pub telephony: Option<TelephonyYaml>,
    pub phrases: Option<PhrasesYaml>,
    pub agents: Option<Vec<AgentSpec>>,
    pub default_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub cors_allowed_origins: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineYaml {
    pub streaming_mode: Option<String>,
    pub turn_timeout_ms: Option<u64>,
    pub tool_timeout_ms: Option<u64>,
    pub history_window_turns: Option<usize>,
    pub barge_in_stability_threshold: Option<f32>,
    pub barge_in_min_audio_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PoolsYaml {
    pub stt: Option<usize>,
    pub tts: Option<usize>,
    pub llm: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CacheYaml {
    pub redis_url: Option<String>,
    pub session_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersYaml {
    pub stt_endpoint: Option<String>,
    pub stt_api_key: Option<String>,
    pub tts_endpoint: Option<String>,
    pub tts_api_key: Option<String>,
    pub llm_endpoint: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: Option<String>,
    pub llm_realtime_endpoint: Option<String>,
    pub llm_realtime_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TelephonyYaml {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub source_number: Option<String>,
    pub callback_url: Option<String>,
    pub media_stream_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PhrasesYaml {
    pub greeting: Option<String>,
    pub fallback: Option<String>,
    pub goodbye: Option<String>,
    pub stopwords: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_parses() {
        let yaml = r#"
server:
  port: 9000
pipeline:
  streaming_mode: realtime_voice
"#;
        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.unwrap().port, Some(9000));
        assert_eq!(
            config.pipeline.unwrap().streaming_mode.as_deref(),
            Some("realtime_voice")
        );
        assert!(config.agents.is_none());
    }

    #[test]
    fn test_agents_section_parses() {
        let yaml = r#"
agents:
  - key: triage
    display_name: "Triage"
    system_prompt: "You triage calls."
    tools: [handoff_to]
    handles: [help]
"#;
        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();
        let agents = config.agents.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].key, "triage");
        assert_eq!(agents[0].voice_profile, "aria");
    }
}
