//! Tool registry.
//!
//! A tool is a plain record: name, JSON schema, async execute. Lookup is a
//! map, execution returns a result variant, and the reserved `handoff_to`
//! tool is intercepted by the orchestrator instead of executed here.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Value, json};

use crate::core::llm::ToolSchema;

/// Reserved tool name that transfers the turn to another agent.
pub const HANDOFF_TOOL: &str = "handoff_to";

/// Outcome of one tool execution.
pub type ToolOutcome = Result<String, String>;

type Handler = Arc<dyn Fn(Value, ToolContext) -> BoxFuture<'static, ToolOutcome> + Send + Sync>;

/// Read-only session context handed to a tool.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub session_id: String,
    pub context: BTreeMap<String, Value>,
}

/// One registered tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub idempotent: bool,
    handler: Handler,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        idempotent: bool,
        handler: Handler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            idempotent,
            handler,
        }
    }

    pub async fn execute(&self, args: Value, ctx: ToolContext) -> ToolOutcome {
        (self.handler)(args, ctx).await
    }

    /// Schema advertised to the model.
    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}

/// Immutable map of every tool the process knows about.
#[derive(Debug, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, ToolDescriptor>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolDescriptor) {
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }
}

/// The built-in tool store: the reserved handoff plus the demo lookups the
/// stock agent roster references.
pub fn builtin_tools() -> ToolSet {
    let mut set = ToolSet::new();

    set.register(ToolDescriptor::new(
        HANDOFF_TOOL,
        "Transfer the conversation to another specialist agent.",
        json!({
            "type": "object",
            "properties": {
                "to": { "type": "string", "description": "Registry key of the target agent" }
            },
            "required": ["to"]
        }),
        true,
        // The orchestrator intercepts this call before execution.
        Arc::new(|_, _| Box::pin(async { Err("handoff_to must be routed, not executed".into()) })),
    ));

    set.register(ToolDescriptor::new(
        "get_current_time",
        "Current UTC date and time.",
        json!({ "type": "object", "properties": {} }),
        true,
        Arc::new(|_, _| {
            Box::pin(async {
                Ok(json!({ "utc": Utc::now().to_rfc3339() }).to_string())
            })
        }),
    ));

    set.register(ToolDescriptor::new(
        "lookup_policy",
        "Look up an insurance policy by its policy number.",
        json!({
            "type": "object",
            "properties": {
                "policy_number": { "type": "string" }
            },
            "required": ["policy_number"]
        }),
        true,
        Arc::new(|args, _| {
            Box::pin(async move {
                let number = args
                    .get("policy_number")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "missing policy_number".to_string())?;
                Ok(lookup_policy(number).to_string())
            })
        }),
    ));

    set
}

// Canned policy directory for the demo claims agent.
fn lookup_policy(number: &str) -> Value {
    match number.to_ascii_uppercase().as_str() {
        "A123" => json!({ "ok": true, "holder": "J. Doe", "status": "active" }),
        "B456" => json!({ "ok": true, "holder": "R. Roe", "status": "lapsed" }),
        _ => json!({ "ok": false, "error": "policy not found" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_policy_known_number() {
        let set = builtin_tools();
        let tool = set.get("lookup_policy").unwrap();

        let result = tool
            .execute(json!({ "policy_number": "A123" }), ToolContext::default())
            .await
            .unwrap();

        assert!(result.contains("J. Doe"));
    }

    #[tokio::test]
    async fn test_lookup_policy_unknown_number() {
        let set = builtin_tools();
        let tool = set.get("lookup_policy").unwrap();

        let result = tool
            .execute(json!({ "policy_number": "Z999" }), ToolContext::default())
            .await
            .unwrap();

        assert!(result.contains("not found"));
    }

    #[tokio::test]
    async fn test_lookup_policy_missing_argument() {
        let set = builtin_tools();
        let tool = set.get("lookup_policy").unwrap();

        let result = tool.execute(json!({}), ToolContext::default()).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_builtins_include_reserved_handoff() {
        let set = builtin_tools();
        assert!(set.contains(HANDOFF_TOOL));
        assert!(set.contains("get_current_time"));
    }

    #[test]
    fn test_schema_projection() {
        let set = builtin_tools();
        let schema = set.get(HANDOFF_TOOL).unwrap().schema();
        assert_eq!(schema.name, HANDOFF_TOOL);
        assert_eq!(schema.parameters["required"][0], "to");
    }
}
