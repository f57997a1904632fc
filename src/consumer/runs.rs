//! Run start handler: `runs.start` — permission-gated execution through the
//! run protocol.

use std::sync::Arc;

use crate::bus::Delivery;
use crate::llm::LlmProvider;
use crate::models::RunStartMessage;
use crate::pricing::resolve_cost;
use crate::protocol::RunClient;

use super::Consumer;

impl Consumer {
    pub(crate) async fn handle_run_start(&self, delivery: Delivery) -> Result<(), String> {
        let run_msg: RunStartMessage =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            run_id = %run_msg.run_id,
            task_id = %run_msg.task_id,
            "received run start"
        );

        let runtime = Arc::new(RunClient::new(
            self.bus.clone(),
            &run_msg.run_id,
            &run_msg.task_id,
            &run_msg.project_id,
            run_msg.termination.clone(),
        ));
        runtime.start_cancel_listener(&[]).await;

        // Enrich the prompt with pre-packed context entries.
        let mut prompt = run_msg.prompt.clone();
        if !run_msg.context.is_empty() {
            let mut section = String::from("\n\n--- Relevant Context ---\n");
            for entry in &run_msg.context {
                section.push_str(&format!("\n### {}: {}\n{}\n", entry.kind, entry.path, entry.content));
            }
            prompt.push_str(&section);
            tracing::info!(run_id = %run_msg.run_id, entries = run_msg.context.len(), "context injected");
        }
        if !run_msg.microagent_prompts.is_empty() {
            prompt.push_str(&format!(
                "\n\n--- Microagent Instructions ---\n{}",
                run_msg.microagent_prompts.join("\n\n")
            ));
            tracing::info!(
                run_id = %run_msg.run_id,
                count = run_msg.microagent_prompts.len(),
                "microagent prompts injected"
            );
        }

        let title: String = run_msg.prompt.chars().take(80).collect();
        runtime.send_output(&format!("Starting task: {title}"), "stdout").await;

        let decision = runtime.request_tool_call("LLM", "completion", "").await;
        if !decision.is_allowed() {
            tracing::warn!(run_id = %run_msg.run_id, reason = %decision.reason, "LLM call denied by policy");
            runtime
                .complete_run("failed", "", &format!("LLM call denied: {}", decision.reason))
                .await;
            return Ok(());
        }

        let system = format!("You are working on task: {title}");
        match self.llm.completion(&prompt, &system, "", 0.2).await {
            Ok(response) => {
                let cost = resolve_cost(
                    response.cost_usd,
                    &response.model,
                    response.tokens_in,
                    response.tokens_out,
                );
                let snippet: String = response.content.chars().take(200).collect();
                runtime
                    .report_tool_result(
                        &decision.call_id,
                        "LLM",
                        true,
                        &snippet,
                        "",
                        cost,
                        response.tokens_in,
                        response.tokens_out,
                        &response.model,
                    )
                    .await;

                if runtime.is_cancelled() {
                    runtime.complete_run("cancelled", "", "cancelled by user").await;
                } else {
                    runtime.complete_run("completed", &response.content, "").await;
                }
            }
            Err(error) => {
                tracing::error!(run_id = %run_msg.run_id, error = %error, "run failed");
                runtime.complete_run("failed", "", &error.to_string()).await;
            }
        }

        tracing::info!(run_id = %run_msg.run_id, mode_id = %run_msg.mode.id, "run processing complete");
        Ok(())
    }
}
