//! Handoff request handler: repackage and forward to the execution pipeline.

use crate::bus::Delivery;
use crate::models::{HandoffExecuteMessage, HandoffRequest};

use super::subjects::SUBJECT_HANDOFF_EXECUTE;
use super::Consumer;

impl Consumer {
    pub(crate) async fn handle_handoff_request(&self, delivery: Delivery) -> Result<(), String> {
        let request: HandoffRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            target_agent = %request.target_agent_id,
            source_run = %request.source_run_id,
            target_mode = %request.target_mode_id,
            "received handoff request"
        );

        let mut context = format!("[Handoff from run {}]\n\n{}", request.source_run_id, request.context);
        if !request.artifacts.is_empty() {
            context.push_str(&format!("\n\nArtifacts: {}", request.artifacts.join(", ")));
        }

        let execute = HandoffExecuteMessage {
            kind: "handoff".to_string(),
            source_run_id: request.source_run_id.clone(),
            target_agent_id: request.target_agent_id.clone(),
            target_mode_id: request.target_mode_id.clone(),
            context,
            artifacts: request.artifacts.clone(),
        };
        self.publish_json(SUBJECT_HANDOFF_EXECUTE, &execute).await?;

        tracing::info!(target_agent = %request.target_agent_id, "handoff dispatched to execution");
        Ok(())
    }
}
