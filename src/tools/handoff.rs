//! Built-in tool: handoff_to — lets an agent hand the task to another agent
//! by publishing a handoff request for the control plane to route.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::bus::Bus;
use crate::consumer::subjects::SUBJECT_HANDOFF_REQUEST;

use super::traits::{ToolDefinition, ToolExecutor, ToolResult};

pub fn handoff_definition() -> ToolDefinition {
    ToolDefinition::new(
        "handoff_to",
        "Hand off the current task to a specialist agent with context and artifacts.",
        json!({
            "type": "object",
            "properties": {
                "target_agent_id": {
                    "type": "string",
                    "description": "ID of the target agent to hand off to."
                },
                "target_mode": {
                    "type": "string",
                    "description": "Mode ID for the target agent (e.g., 'coder', 'reviewer')."
                },
                "context": {
                    "type": "string",
                    "description": "Context message for the target agent explaining what to do."
                },
                "artifacts": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "List of artifact paths or IDs to pass to the target."
                }
            },
            "required": ["target_agent_id", "context"]
        }),
    )
}

pub struct HandoffTool {
    bus: Arc<dyn Bus>,
    run_id: String,
}

impl HandoffTool {
    pub fn new(bus: Arc<dyn Bus>, run_id: impl Into<String>) -> Self {
        Self {
            bus,
            run_id: run_id.into(),
        }
    }
}

#[async_trait]
impl ToolExecutor for HandoffTool {
    async fn execute(&self, arguments: &Value, _workspace: &Path) -> Result<ToolResult, String> {
        let target = arguments
            .get("target_agent_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let context = arguments.get("context").and_then(Value::as_str).unwrap_or_default();
        let target_mode = arguments
            .get("target_mode")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let artifacts: Vec<String> = arguments
            .get("artifacts")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        if target.is_empty() || context.is_empty() {
            return Ok(ToolResult::ok("Error: target_agent_id and context are required"));
        }

        let payload = json!({
            "source_run_id": self.run_id,
            "target_agent_id": target,
            "target_mode_id": target_mode,
            "context": context,
            "artifacts": artifacts,
        });
        self.bus
            .publish(SUBJECT_HANDOFF_REQUEST, serde_json::to_vec(&payload).unwrap_or_default())
            .await
            .map_err(|e| e.to_string())?;

        tracing::info!(run_id = %self.run_id, target = target, mode = target_mode, "handoff initiated");
        Ok(ToolResult::ok(format!("Handoff to {target} initiated successfully.")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    #[tokio::test]
    async fn publishes_handoff_request() {
        let bus = Arc::new(MemoryBus::new());
        let tool = HandoffTool::new(bus.clone(), "run-1");
        let result = tool
            .execute(
                &json!({"target_agent_id": "reviewer", "context": "check the diff"}),
                Path::new("/tmp"),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.output.contains("reviewer"));

        let published = bus.published(SUBJECT_HANDOFF_REQUEST);
        assert_eq!(published.len(), 1);
        let payload: Value = published[0].json().unwrap();
        assert_eq!(payload["source_run_id"], "run-1");
        assert_eq!(payload["target_agent_id"], "reviewer");
    }

    #[tokio::test]
    async fn missing_target_reports_error_text() {
        let bus = Arc::new(MemoryBus::new());
        let tool = HandoffTool::new(bus.clone(), "run-1");
        let result = tool
            .execute(&json!({"context": "no target"}), Path::new("/tmp"))
            .await
            .unwrap();
        assert!(result.output.starts_with("Error:"));
        assert!(bus.published(SUBJECT_HANDOFF_REQUEST).is_empty());
    }
}
