//! Tool registry for agent-style conversations
//!
//! Tools are plain async functions the model can ask for by name. Every
//! invocation resolves to text: failures and unknown tool names become error
//! strings that are fed back to the model instead of aborting the turn.
//!
//! # Built-in Tools
//!
//! - `filesystem` - `list_files` and `read_files`

pub mod filesystem;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub use filesystem::{FilesystemConfig, ListFiles, ReadFiles};

/// Errors that can occur while invoking a tool
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown function '{0}'")]
    UnknownTool(String),

    #[error("Invalid arguments for '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("'{name}' failed: {reason}")]
    Execution { name: String, reason: String },
}

/// Definition of a tool that the model can call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique name of the tool (e.g., "read_files")
    pub name: String,

    /// Human-readable description for the model to understand when to use this tool
    pub description: String,

    /// JSON Schema defining the expected parameters
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// OpenAI-style function signature, the shape chat templates expect
    pub fn function_spec(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// A normalized tool call extracted from model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of one invocation, always expressible as text for the model
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub output: String,
    pub success: bool,
    pub duration_ms: u64,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn call(&self, arguments: Map<String, Value>) -> Result<String, ToolError>;
}

/// Name-keyed set of callable tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        let name = tool.definition().name;
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Run a tool, converting every failure into an error string
    pub async fn invoke(&self, call: &ToolCall) -> ToolOutcome {
        let started = Instant::now();
        let result = match self.get(&call.name) {
            Some(tool) => tool.call(call.arguments.clone()).await,
            None => Err(ToolError::UnknownTool(call.name.clone())),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => ToolOutcome {
                output,
                success: true,
                duration_ms,
            },
            Err(e) => {
                tracing::warn!(tool = %call.name, "Tool call failed: {}", e);
                ToolOutcome {
                    output: format!("Error: {}", e),
                    success: false,
                    duration_ms,
                }
            }
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Pull a required string argument out of a call's keyword arguments
pub fn required_str<'a>(
    tool: &str,
    arguments: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str, ToolError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments {
            name: tool.to_string(),
            reason: format!("'{}' is required", key),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("echo", "Echo the text argument")
        }

        async fn call(&self, arguments: Map<String, Value>) -> Result<String, ToolError> {
            Ok(required_str("echo", &arguments, "text")?.to_string())
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("broken", "Always fails")
        }

        async fn call(&self, _arguments: Map<String, Value>) -> Result<String, ToolError> {
            Err(ToolError::Execution {
                name: "broken".into(),
                reason: "disk on fire".into(),
            })
        }
    }

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall::new(name, arguments.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_tool_definition() {
        let tool = ToolDefinition::new("my_tool", "Does something");
        assert_eq!(tool.name, "my_tool");
        assert_eq!(tool.function_spec()["function"]["name"], "my_tool");
        assert_eq!(tool.function_spec()["type"], "function");
    }

    #[test]
    fn test_registry() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);
        registry.register(Broken);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["broken", "echo"]);
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);

        let outcome = registry.invoke(&call("echo", json!({"text": "hi"}))).await;
        assert!(outcome.success);
        assert_eq!(outcome.output, "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool_becomes_error_string() {
        let registry = ToolRegistry::new();

        let outcome = registry.invoke(&call("get_weather", json!({}))).await;
        assert!(!outcome.success);
        assert_eq!(outcome.output, "Error: Unknown function 'get_weather'");
    }

    #[tokio::test]
    async fn test_failures_become_error_strings() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);
        registry.register(Broken);

        let failed = registry.invoke(&call("broken", json!({}))).await;
        assert!(!failed.success);
        assert_eq!(failed.output, "Error: 'broken' failed: disk on fire");

        let invalid = registry.invoke(&call("echo", json!({"wrong": 1}))).await;
        assert!(!invalid.success);
        assert!(invalid.output.contains("'text' is required"));
    }
}
