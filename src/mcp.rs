//! MCP workbench: manages connections to MCP servers and tool discovery.
//!
//! Servers declared on a run are spawned as child processes speaking JSON-RPC
//! 2.0 over stdin/stdout (`initialize` → `tools/list` → `tools/call`).
//! Discovered tools are exposed to the LLM under the
//! `mcp__{server_id}__{tool_name}` namespace.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::models::null_default;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── Definitions ─────────────────────────────────────────────────────────────

fn default_enabled() -> bool {
    true
}

/// Definition of an MCP server that can be connected to during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerDef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// "stdio" or "sse".
    pub transport: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, deserialize_with = "null_default")]
    pub args: Vec<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default, deserialize_with = "null_default")]
    pub env: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_default")]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A tool discovered from an MCP server.
#[derive(Debug, Clone)]
pub struct McpTool {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Result of calling a tool on an MCP server.
#[derive(Debug, Clone, Default)]
pub struct McpToolCallResult {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl McpToolCallResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
        }
    }
}

// ─── JSON-RPC plumbing ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

struct McpProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl McpProcess {
    async fn request(&mut self, method: &str, params: Value) -> Result<Value, String> {
        self.next_id += 1;
        let id = self.next_id;
        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});

        self.write_line(&request).await?;

        let read = async {
            let mut line = String::new();
            loop {
                line.clear();
                let n = self
                    .stdout
                    .read_line(&mut line)
                    .await
                    .map_err(|e| format!("MCP read failed: {e}"))?;
                if n == 0 {
                    return Err("MCP server closed its stdout".to_string());
                }
                let Ok(response) = serde_json::from_str::<JsonRpcResponse>(line.trim()) else {
                    continue;
                };
                // Skip notifications and responses to other requests.
                if response.id.as_ref().and_then(Value::as_u64) != Some(id) {
                    continue;
                }
                if let Some(error) = response.error {
                    return Err(format!("MCP error {}: {}", error.code, error.message));
                }
                return Ok(response.result.unwrap_or(Value::Null));
            }
        };

        tokio::time::timeout(REQUEST_TIMEOUT, read)
            .await
            .map_err(|_| format!("MCP request '{method}' timed out"))?
    }

    async fn notify(&mut self, method: &str) -> Result<(), String> {
        let notification = json!({"jsonrpc": "2.0", "method": method});
        self.write_line(&notification).await
    }

    async fn write_line(&mut self, value: &Value) -> Result<(), String> {
        let mut line = value.to_string();
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| format!("MCP write failed: {e}"))
    }
}

// ─── Connection ──────────────────────────────────────────────────────────────

struct McpServerConnection {
    def: McpServerDef,
    process: McpProcess,
    tools: Vec<McpTool>,
}

impl McpServerConnection {
    async fn connect(def: McpServerDef) -> Result<Self, String> {
        if def.transport != "stdio" {
            return Err(format!("unsupported transport: {}", def.transport));
        }
        if def.command.is_empty() {
            return Err("stdio server has no command".to_string());
        }

        let mut child = Command::new(&def.command)
            .args(&def.args)
            .envs(&def.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn MCP server: {e}"))?;

        let stdin = child.stdin.take().ok_or("MCP server has no stdin")?;
        let stdout = child.stdout.take().ok_or("MCP server has no stdout")?;

        let mut process = McpProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 0,
        };

        process
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "codeforge-worker", "version": env!("CARGO_PKG_VERSION")}
                }),
            )
            .await?;
        process.notify("notifications/initialized").await?;

        tracing::info!(server_id = %def.id, "connected to MCP server");
        Ok(Self {
            def,
            process,
            tools: Vec::new(),
        })
    }

    async fn list_tools(&mut self) -> Result<&[McpTool], String> {
        let result = self.process.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        self.tools = tools
            .iter()
            .filter_map(|tool| {
                Some(McpTool {
                    server_id: self.def.id.clone(),
                    name: tool.get("name")?.as_str()?.to_string(),
                    description: tool
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    input_schema: tool.get("inputSchema").cloned().unwrap_or_else(|| json!({})),
                })
            })
            .collect();
        Ok(&self.tools)
    }

    async fn call_tool(&mut self, tool_name: &str, arguments: &Value) -> McpToolCallResult {
        let result = self
            .process
            .request("tools/call", json!({"name": tool_name, "arguments": arguments}))
            .await;

        match result {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let output = result
                    .get("content")
                    .and_then(Value::as_array)
                    .map(|blocks| {
                        blocks
                            .iter()
                            .filter_map(|block| block.get("text").and_then(Value::as_str))
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                McpToolCallResult {
                    success: !is_error,
                    output,
                    error: String::new(),
                }
            }
            Err(error) => {
                tracing::warn!(server_id = %self.def.id, tool = tool_name, error = %error, "MCP tool call failed");
                McpToolCallResult::failure(error)
            }
        }
    }

    async fn disconnect(&mut self) {
        let _ = self.process.child.kill().await;
        self.tools.clear();
        tracing::info!(server_id = %self.def.id, "disconnected from MCP server");
    }
}

// ─── Workbench ───────────────────────────────────────────────────────────────

/// Container for multiple MCP server connections scoped to a single run.
#[derive(Default)]
pub struct McpWorkbench {
    connections: Mutex<HashMap<String, McpServerConnection>>,
    tools: std::sync::Mutex<Vec<McpTool>>,
}

impl McpWorkbench {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to all enabled servers. Failures are logged and skipped so one
    /// bad server does not break the run.
    pub async fn connect_servers(&self, defs: &[McpServerDef]) {
        let mut connections = self.connections.lock().await;
        for def in defs {
            if !def.enabled {
                tracing::info!(server_id = %def.id, "skipping disabled MCP server");
                continue;
            }
            match McpServerConnection::connect(def.clone()).await {
                Ok(connection) => {
                    connections.insert(def.id.clone(), connection);
                }
                Err(error) => {
                    tracing::warn!(server_id = %def.id, error = %error, "failed to connect to MCP server");
                }
            }
        }
    }

    /// Discover tools from all connected servers.
    pub async fn discover_tools(&self) -> Vec<McpTool> {
        let mut all = Vec::new();
        let mut connections = self.connections.lock().await;
        for connection in connections.values_mut() {
            match connection.list_tools().await {
                Ok(tools) => all.extend(tools.iter().cloned()),
                Err(error) => {
                    tracing::warn!(server_id = %connection.def.id, error = %error, "MCP tool discovery failed");
                }
            }
        }
        if let Ok(mut tools) = self.tools.lock() {
            *tools = all.clone();
        }
        all
    }

    /// Call a tool on a specific server.
    pub async fn call_tool(&self, server_id: &str, tool_name: &str, arguments: &Value) -> McpToolCallResult {
        let mut connections = self.connections.lock().await;
        let Some(connection) = connections.get_mut(server_id) else {
            return McpToolCallResult::failure(format!("server not connected: {server_id}"));
        };
        connection.call_tool(tool_name, arguments).await
    }

    /// Disconnect from all servers.
    pub async fn disconnect_all(&self) {
        let mut connections = self.connections.lock().await;
        for connection in connections.values_mut() {
            connection.disconnect().await;
        }
        connections.clear();
        if let Ok(mut tools) = self.tools.lock() {
            tools.clear();
        }
    }

    /// Discovered tools as OpenAI-compatible function definitions, namespaced
    /// per server.
    pub fn get_tools_for_llm(&self) -> Vec<Value> {
        let Ok(tools) = self.tools.lock() else {
            return Vec::new();
        };
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": format!("mcp__{}__{}", tool.server_id, tool.name),
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect()
    }
}
