//! Conversation run handler: the full agent loop with tool calling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentLoopExecutor, LoopConfig, DEFAULT_MAX_ITERATIONS};
use crate::bus::Delivery;
use crate::history::{ConversationHistoryManager, HistoryConfig};
use crate::llm::resolve_scenario;
use crate::mcp::McpWorkbench;
use crate::models::{ConversationRunCompleteMessage, ConversationRunStartMessage};
use crate::protocol::RunClient;
use crate::tools::{build_default_registry, handoff_definition, HandoffTool};

use super::retrieval::INTERNAL_ERROR;
use super::subjects::{SUBJECT_CONVERSATION_RUN_CANCEL, SUBJECT_CONVERSATION_RUN_COMPLETE};
use super::Consumer;

impl Consumer {
    pub(crate) async fn handle_conversation_run(&self, delivery: Delivery) -> Result<(), String> {
        let run_msg: ConversationRunStartMessage =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            run_id = %run_msg.run_id,
            conversation_id = %run_msg.conversation_id,
            "received conversation run start"
        );

        let runtime = Arc::new(RunClient::new(
            self.bus.clone(),
            &run_msg.run_id,
            &run_msg.run_id,
            &run_msg.project_id,
            run_msg.termination.clone(),
        ));
        runtime
            .start_cancel_listener(&[SUBJECT_CONVERSATION_RUN_CANCEL])
            .await;
        runtime.start_heartbeat(Duration::from_secs(30)).await;

        let mut registry = build_default_registry();

        // MCP tools are merged per run and torn down with it.
        let workbench = if run_msg.mcp_servers.is_empty() {
            None
        } else {
            let workbench = Arc::new(McpWorkbench::new());
            workbench.connect_servers(&run_msg.mcp_servers).await;
            workbench.discover_tools().await;
            registry.merge_mcp_tools(&workbench);
            tracing::info!(
                run_id = %run_msg.run_id,
                count = workbench.get_tools_for_llm().len(),
                "mcp tools merged"
            );
            Some(workbench)
        };

        registry.register(
            handoff_definition(),
            Arc::new(HandoffTool::new(self.bus.clone(), &run_msg.run_id)),
        );

        let mut system_prompt = run_msg.system_prompt.clone();
        if !run_msg.microagent_prompts.is_empty() {
            system_prompt.push_str(&format!(
                "\n\n--- Microagent Instructions ---\n{}",
                run_msg.microagent_prompts.join("\n\n")
            ));
            tracing::info!(
                run_id = %run_msg.run_id,
                count = run_msg.microagent_prompts.len(),
                "microagent prompts injected"
            );
        }

        let history = ConversationHistoryManager::new(HistoryConfig::default());
        let mut messages = history.build_messages(&system_prompt, &run_msg.messages, &run_msg.context);

        let mut tags = Vec::new();
        if !run_msg.mode.llm_scenario.is_empty() {
            let scenario = resolve_scenario(&run_msg.mode.llm_scenario);
            if !scenario.tag.is_empty() {
                tracing::info!(
                    run_id = %run_msg.run_id,
                    scenario = %run_msg.mode.llm_scenario,
                    tag = %scenario.tag,
                    "scenario resolved"
                );
                tags.push(scenario.tag);
            }
        }

        let executor = AgentLoopExecutor::new(
            self.llm.clone(),
            Arc::new(registry),
            runtime.clone(),
            PathBuf::from(&run_msg.workspace_path),
        );
        let config = LoopConfig {
            max_iterations: if run_msg.termination.max_steps == 0 {
                DEFAULT_MAX_ITERATIONS
            } else {
                run_msg.termination.max_steps as usize
            },
            max_cost: run_msg.termination.max_cost,
            model: run_msg.model.clone(),
            temperature: 0.2,
            tags,
        };

        let result = executor.run(&mut messages, &config).await;

        let complete = ConversationRunCompleteMessage {
            run_id: run_msg.run_id.clone(),
            conversation_id: run_msg.conversation_id.clone(),
            assistant_content: result.final_content,
            tool_messages: result.tool_messages,
            status: if result.error.is_empty() {
                "completed".to_string()
            } else {
                "failed".to_string()
            },
            error: result.error.clone(),
            cost_usd: result.total_cost,
            tokens_in: result.total_tokens_in,
            tokens_out: result.total_tokens_out,
            step_count: result.step_count,
            model: result.model,
        };
        let publish_result = self.publish_json(SUBJECT_CONVERSATION_RUN_COMPLETE, &complete).await;

        if let Some(workbench) = workbench {
            workbench.disconnect_all().await;
        }
        publish_result?;

        tracing::info!(
            run_id = %run_msg.run_id,
            steps = complete.step_count,
            cost = complete.cost_usd,
            error = %complete.error,
            "conversation run complete"
        );
        Ok(())
    }

    /// Fail-safe completion so the control plane sees the run fail even when
    /// the handler crashed.
    pub(crate) async fn publish_conversation_error(&self, delivery: &Delivery) {
        let Ok(run_msg) = serde_json::from_slice::<ConversationRunStartMessage>(&delivery.payload)
        else {
            tracing::error!("failed to publish conversation error result: unparseable request");
            return;
        };
        let complete = ConversationRunCompleteMessage {
            run_id: run_msg.run_id,
            conversation_id: run_msg.conversation_id,
            assistant_content: String::new(),
            tool_messages: Vec::new(),
            status: "failed".to_string(),
            error: INTERNAL_ERROR.to_string(),
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
            step_count: 0,
            model: String::new(),
        };
        if let Err(error) = self.publish_json(SUBJECT_CONVERSATION_RUN_COMPLETE, &complete).await {
            tracing::error!(error = %error, "failed to publish conversation error result");
        }
    }
}
