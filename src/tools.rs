//! Tool registry (spec §4.6, §9 "async tool execution").
//!
//! Models tool invocation as a request/response message exchanged with a
//! registry, awaited by the orchestrator before it asks the inference
//! adapter to send the paired result frames back. Argument parse failures
//! are returned as a JSON error output rather than propagated (spec §7:
//! "the call continues").
//!
//! Grounded on the teacher's callback-registration pattern
//! (`Arc<dyn Fn(...) + Send + Sync>` passed into `Whisper`/`PacketHandler`)
//! generalized to an async trait object per tool, per design note §9.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    async fn invoke(&self, arguments: Value) -> Value;
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Parses `arguments_json`, and on success awaits the named tool;
    /// otherwise returns a JSON error result instead of propagating a
    /// parse error up to the orchestrator (spec §7).
    pub async fn invoke(&self, name: &str, arguments_json: &str) -> Value {
        let arguments: Value = match serde_json::from_str(arguments_json) {
            Ok(v) => v,
            Err(err) => {
                return serde_json::json!({ "error": format!("invalid tool arguments: {err}") });
            }
        };

        match self.tools.get(name) {
            Some(tool) => tool.invoke(arguments).await,
            None => serde_json::json!({ "error": format!("unknown tool: {name}") }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// `save_parameters` is a no-op tool: the spec's Open Question notes that
/// the original relies on argument-save side effects happening in the
/// dispatch path rather than the tool body itself. We preserve that: the
/// registry logs the raw arguments here (the "side effect"), and the tool
/// itself always acknowledges success without persisting anything further.
pub struct SaveParametersTool;

#[async_trait]
impl Tool for SaveParametersTool {
    fn name(&self) -> &str {
        "save_parameters"
    }

    async fn invoke(&self, arguments: Value) -> Value {
        warn!(%arguments, "save_parameters invoked; arguments logged, no persistence performed");
        serde_json::json!({ "status": "ok" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        async fn invoke(&self, arguments: Value) -> Value {
            arguments
        }
    }

    #[tokio::test]
    async fn invokes_registered_tool_with_parsed_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let result = registry.invoke("echo", r#"{"x":1}"#).await;
        assert_eq!(result, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn malformed_arguments_return_error_payload_not_a_panic() {
        let registry = ToolRegistry::new();
        let result = registry.invoke("echo", "{not json").await;
        assert!(result.get("error").is_some());
    }

    #[tokio::test]
    async fn unknown_tool_returns_error_payload() {
        let registry = ToolRegistry::new();
        let result = registry.invoke("nonexistent", "{}").await;
        assert!(result.get("error").is_some());
    }

    #[tokio::test]
    async fn save_parameters_always_acknowledges() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SaveParametersTool));
        let result = registry.invoke("save_parameters", r#"{"k":"v"}"#).await;
        assert_eq!(result, serde_json::json!({"status": "ok"}));
    }
}
