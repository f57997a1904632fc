//! Built-in tool: execute a bash command with a timeout.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::traits::{required_str, ToolDefinition, ToolExecutor, ToolResult};

const MAX_OUTPUT: usize = 50_000;
const HALF_OUTPUT: usize = MAX_OUTPUT / 2;
const DEFAULT_TIMEOUT_SECONDS: u64 = 120;

pub fn bash_definition() -> ToolDefinition {
    ToolDefinition::new(
        "bash",
        "Execute a bash command and return stdout and stderr.",
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to execute."
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 120)."
                }
            },
            "required": ["command"]
        }),
    )
}

/// Truncate output exceeding [`MAX_OUTPUT`], keeping head and tail.
fn truncate(text: &str) -> String {
    if text.len() <= MAX_OUTPUT {
        return text.to_string();
    }
    let mut head_end = HALF_OUTPUT;
    while head_end > 0 && !text.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = text.len() - HALF_OUTPUT;
    while tail_start < text.len() && !text.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!("{}\n\n... truncated ...\n\n{}", &text[..head_end], &text[tail_start..])
}

pub struct BashTool;

#[async_trait]
impl ToolExecutor for BashTool {
    async fn execute(&self, arguments: &Value, workspace: &Path) -> Result<ToolResult, String> {
        let command = required_str(arguments, "command")?;
        let timeout = arguments
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);

        let child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(error) => return Ok(ToolResult::failure(error.to_string())),
        };

        // kill_on_drop reaps the child when the timeout drops the future.
        let output = match tokio::time::timeout(Duration::from_secs(timeout), child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => return Ok(ToolResult::failure(error.to_string())),
            Err(_) => {
                return Ok(ToolResult::failure(format!("command timed out after {timeout}s")));
            }
        };

        let stdout = truncate(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate(&String::from_utf8_lossy(&output.stderr));

        let success = output.status.success();
        let merged = if stderr.is_empty() {
            stdout
        } else if stdout.is_empty() {
            stderr
        } else {
            format!("{stdout}\n--- stderr ---\n{stderr}")
        };

        Ok(ToolResult {
            output: merged,
            error: if success {
                String::new()
            } else {
                format!("exit code {}", output.status.code().unwrap_or(-1))
            },
            success,
        })
    }
}
