//! Base types for the tool framework.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

/// Declarative description of a tool: name, description, JSON Schema
/// parameters.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Result returned by a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub output: String,
    pub error: String,
    pub success: bool,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: String::new(),
            success: true,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            error: error.into(),
            success: false,
        }
    }
}

/// A capability the agent loop can invoke.
///
/// `Ok(ToolResult { success: false, .. })` is a tool-level failure the loop
/// feeds back to the LLM; `Err` is an executor crash.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, arguments: &Value, workspace: &Path) -> Result<ToolResult, String>;
}

/// Fetch a required string argument.
pub fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, String> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required argument '{key}'"))
}

/// Fetch an optional string argument with a default.
pub fn optional_str<'a>(arguments: &'a Value, key: &str, default: &'a str) -> &'a str {
    arguments.get(key).and_then(Value::as_str).unwrap_or(default)
}
