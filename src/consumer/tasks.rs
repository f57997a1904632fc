//! Task message handler: `tasks.agent.*` — prompt execution with streaming
//! output and a published result.

use crate::bus::Delivery;
use crate::llm::LlmProvider;
use crate::models::{TaskMessage, TaskResult, TaskStatus};

use super::subjects::SUBJECT_RESULT;
use super::Consumer;

impl Consumer {
    pub(crate) async fn handle_task(&self, delivery: Delivery) -> Result<(), String> {
        let request_id = delivery.request_id();
        let task: TaskMessage = serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;

        let backend = delivery.subject.rsplit('.').next().unwrap_or("unknown").to_string();
        tracing::info!(
            request_id = %request_id,
            task_id = %task.id,
            backend = %backend,
            title = %task.title,
            "received task"
        );

        self.publish_output(&task.id, &format!("Starting task: {}", task.title), "stdout", &request_id)
            .await;

        let result = match self
            .llm
            .completion(
                &task.prompt,
                &format!("You are working on task: {}", task.title),
                "",
                0.2,
            )
            .await
        {
            Ok(response) => TaskResult {
                task_id: task.id.clone(),
                status: TaskStatus::Completed,
                output: response.content,
                files: Vec::new(),
                error: String::new(),
                tokens_in: response.tokens_in,
                tokens_out: response.tokens_out,
                cost_usd: response.cost_usd,
            },
            Err(error) => {
                tracing::error!(task_id = %task.id, error = %error, "task failed");
                TaskResult {
                    task_id: task.id.clone(),
                    status: TaskStatus::Failed,
                    output: String::new(),
                    files: Vec::new(),
                    error: error.to_string(),
                    tokens_in: 0,
                    tokens_out: 0,
                    cost_usd: 0.0,
                }
            }
        };

        self.publish_json(SUBJECT_RESULT, &result).await?;
        tracing::info!(task_id = %task.id, status = ?result.status, backend = %backend, "task completed");
        Ok(())
    }
}
