//! Registry of callable tools: built-ins plus dynamically merged MCP tools.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::mcp::McpWorkbench;

use super::fs::{
    edit_file_definition, read_file_definition, write_file_definition, EditFileTool, ReadFileTool,
    WriteFileTool,
};
use super::search::{
    glob_files_definition, list_directory_definition, search_files_definition, GlobFilesTool,
    ListDirectoryTool, SearchFilesTool,
};
use super::shell::{bash_definition, BashTool};
use super::traits::{ToolDefinition, ToolExecutor, ToolResult};

/// Container for tool definitions and their executors.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, (ToolDefinition, Arc<dyn ToolExecutor>)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Overwrites any previous tool with the same name.
    pub fn register(&mut self, definition: ToolDefinition, executor: Arc<dyn ToolExecutor>) {
        self.tools.insert(definition.name.clone(), (definition, executor));
    }

    /// All tool definitions in OpenAI function-calling format.
    pub fn get_openai_tools(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|(definition, _)| {
                json!({
                    "type": "function",
                    "function": {
                        "name": definition.name,
                        "description": definition.description,
                        "parameters": definition.parameters,
                    }
                })
            })
            .collect()
    }

    /// Execute a tool by name. An unknown name yields a failed result rather
    /// than an error.
    pub async fn execute(
        &self,
        name: &str,
        arguments: &Value,
        workspace: &Path,
    ) -> Result<ToolResult, String> {
        let Some((_, executor)) = self.tools.get(name) else {
            return Ok(ToolResult::failure(format!("unknown tool: {name}")));
        };
        executor.execute(arguments, workspace).await
    }

    /// Merge MCP-discovered tools under the `mcp__{server}__{tool}` namespace.
    pub fn merge_mcp_tools(&mut self, workbench: &Arc<McpWorkbench>) {
        for tool in workbench.get_tools_for_llm() {
            let Some(function) = tool.get("function").and_then(Value::as_object) else {
                continue;
            };
            let Some(name) = function.get("name").and_then(Value::as_str) else {
                continue;
            };
            let parts: Vec<&str> = name.splitn(3, "__").collect();
            if parts.len() != 3 || parts[0] != "mcp" {
                continue;
            }
            let definition = ToolDefinition::new(
                name,
                function
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
                function.get("parameters").cloned().unwrap_or_else(|| json!({})),
            );
            let executor = McpToolProxy {
                workbench: workbench.clone(),
                server_id: parts[1].to_string(),
                tool_name: parts[2].to_string(),
            };
            self.register(definition, Arc::new(executor));
        }
    }

    /// Sorted list of registered tool names.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Executor proxy delegating to an MCP workbench.
struct McpToolProxy {
    workbench: Arc<McpWorkbench>,
    server_id: String,
    tool_name: String,
}

#[async_trait]
impl ToolExecutor for McpToolProxy {
    async fn execute(&self, arguments: &Value, _workspace: &Path) -> Result<ToolResult, String> {
        let result = self
            .workbench
            .call_tool(&self.server_id, &self.tool_name, arguments)
            .await;
        Ok(ToolResult {
            output: result.output,
            error: result.error,
            success: result.success,
        })
    }
}

/// Registry with all built-in tools registered.
pub fn build_default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(read_file_definition(), Arc::new(ReadFileTool));
    registry.register(write_file_definition(), Arc::new(WriteFileTool));
    registry.register(edit_file_definition(), Arc::new(EditFileTool));
    registry.register(bash_definition(), Arc::new(BashTool));
    registry.register(search_files_definition(), Arc::new(SearchFilesTool));
    registry.register(glob_files_definition(), Arc::new(GlobFilesTool));
    registry.register(list_directory_definition(), Arc::new(ListDirectoryTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_tool_fails_without_error() {
        let registry = build_default_registry();
        let result = registry
            .execute("nonexistent", &json!({}), Path::new("/tmp"))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error, "unknown tool: nonexistent");
    }

    #[test]
    fn default_registry_has_builtins() {
        let registry = build_default_registry();
        assert_eq!(
            registry.tool_names(),
            vec![
                "bash",
                "edit_file",
                "glob_files",
                "list_directory",
                "read_file",
                "search_files",
                "write_file"
            ]
        );
    }

    #[test]
    fn openai_tools_are_function_entries() {
        let registry = build_default_registry();
        let tools = registry.get_openai_tools();
        assert_eq!(tools.len(), 7);
        for tool in tools {
            assert_eq!(tool["type"], "function");
            assert!(tool["function"]["name"].is_string());
            assert_eq!(tool["function"]["parameters"]["type"], "object");
        }
    }

    #[test]
    fn register_overwrites_same_name() {
        let mut registry = ToolRegistry::new();
        registry.register(read_file_definition(), Arc::new(ReadFileTool));
        registry.register(read_file_definition(), Arc::new(ReadFileTool));
        assert_eq!(registry.len(), 1);
    }
}
