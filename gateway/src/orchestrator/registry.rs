//! Agent registry.
//!
//! Specialists are declarative config, not code: each [`AgentSpec`] bundles a
//! prompt, a tool list, escalation targets and a voice. The registry is built
//! once at startup, validated against the tool set, and immutable afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::tools::{HANDOFF_TOOL, ToolSet};
use crate::errors::{BridgeError, BridgeResult};

/// One registered specialist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub key: String,
    pub display_name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub can_escalate_to: Vec<String>,
    #[serde(default = "default_voice")]
    pub voice_profile: String,
    /// Intent keywords that let this agent claim a turn without a
    /// classifier round trip.
    #[serde(default)]
    pub handles: Vec<String>,
}

fn default_voice() -> String {
    "aria".to_string()
}

impl AgentSpec {
    /// Whether this agent should keep the turn. An agent that has engaged
    /// (marked in session context) holds on; otherwise keyword hints decide.
    pub fn can_handle(&self, user_text: &str, context: &BTreeMap<String, Value>) -> bool {
        let engaged_key = format!("{}.engaged", self.key);
        if context
            .get(&engaged_key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            return true;
        }
        let lowered = user_text.to_lowercase();
        self.handles
            .iter()
            .any(|hint| lowered.contains(&hint.to_lowercase()))
    }
}

/// Immutable map of agent key to spec, populated from config at startup.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentSpec>,
    default_key: String,
}

impl AgentRegistry {
    /// Build and validate the registry. Every referenced tool and
    /// escalation target must exist, and the default (greeter) agent must be
    /// registered.
    pub fn from_specs(
        specs: Vec<AgentSpec>,
        default_key: &str,
        tools: &ToolSet,
    ) -> BridgeResult<Self> {
        let mut agents = BTreeMap::new();
        for spec in specs {
            for tool in &spec.tools {
                if !tools.contains(tool) {
                    return Err(BridgeError::config(format!(
                        "agent '{}' references unknown tool '{}'",
                        spec.key, tool
                    )));
                }
            }
            if agents.insert(spec.key.clone(), spec).is_some() {
                return Err(BridgeError::config("duplicate agent key in config"));
            }
        }

        for spec in agents.values() {
            for target in &spec.can_escalate_to {
                if !agents.contains_key(target) {
                    return Err(BridgeError::config(format!(
                        "agent '{}' escalates to unknown agent '{}'",
                        spec.key, target
                    )));
                }
            }
        }

        if !agents.contains_key(default_key) {
            return Err(BridgeError::config(format!(
                "default agent '{default_key}' is not registered"
            )));
        }

        Ok(Self {
            agents,
            default_key: default_key.to_string(),
        })
    }

    pub fn get(&self, key: &str) -> Option<&AgentSpec> {
        self.agents.get(key)
    }

    /// The greeter: initial owner of every session and the classifier's
    /// fallback.
    pub fn default_agent(&self) -> &AgentSpec {
        &self.agents[&self.default_key]
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn specs(&self) -> impl Iterator<Item = &AgentSpec> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// The stock roster used when the config declares no agents: a greeter and
/// the claims specialist it can hand off to.
pub fn default_agents() -> Vec<AgentSpec> {
    vec![
        AgentSpec {
            key: "greeter".into(),
            display_name: "Ava".into(),
            system_prompt: "You are Ava, a friendly voice assistant. Greet the caller, find out \
                            what they need, and hand off to a specialist when one fits. Keep \
                            answers to one or two short spoken sentences."
                .into(),
            tools: vec![HANDOFF_TOOL.into(), "get_current_time".into()],
            can_escalate_to: vec!["claims".into()],
            voice_profile: "aria".into(),
            handles: vec![],
        },
        AgentSpec {
            key: "claims".into(),
            display_name: "Claims Desk".into(),
            system_prompt: "You are the claims specialist. Verify the caller's policy with the \
                            lookup tool before discussing details. Keep answers short and spoken."
                .into(),
            tools: vec!["lookup_policy".into()],
            can_escalate_to: vec![],
            voice_profile: "aria".into(),
            handles: vec!["claim".into(), "policy".into()],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tools::builtin_tools;

    #[test]
    fn test_default_roster_validates() {
        let registry =
            AgentRegistry::from_specs(default_agents(), "greeter", &builtin_tools()).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.default_agent().key, "greeter");
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let mut specs = default_agents();
        specs[0].tools.push("summon_dragon".into());
        let err =
            AgentRegistry::from_specs(specs, "greeter", &builtin_tools()).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Config);
    }

    #[test]
    fn test_unknown_escalation_target_rejected() {
        let mut specs = default_agents();
        specs[0].can_escalate_to.push("billing".into());
        assert!(AgentRegistry::from_specs(specs, "greeter", &builtin_tools()).is_err());
    }

    #[test]
    fn test_missing_default_agent_rejected() {
        let specs = default_agents();
        assert!(AgentRegistry::from_specs(specs, "concierge", &builtin_tools()).is_err());
    }

    #[test]
    fn test_can_handle_keyword_hint() {
        let specs = default_agents();
        let claims = &specs[1];
        assert!(claims.can_handle("I need to file a CLAIM", &BTreeMap::new()));
        assert!(!claims.can_handle("what's the weather", &BTreeMap::new()));
    }

    #[test]
    fn test_can_handle_engaged_context() {
        let specs = default_agents();
        let claims = &specs[1];
        let mut ctx = BTreeMap::new();
        ctx.insert("claims.engaged".into(), serde_json::json!(true));
        assert!(claims.can_handle("anything at all", &ctx));
    }
}
