//! Memory store and recall handlers.

use crate::bus::Delivery;
use crate::models::{MemoryRecallRequest, MemoryRecallResult, MemoryStoreRequest};

use super::subjects::SUBJECT_MEMORY_RECALL_RESULT;
use super::Consumer;

impl Consumer {
    pub(crate) async fn handle_memory_store(&self, delivery: Delivery) -> Result<(), String> {
        let request: MemoryStoreRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            project_id = %request.project_id,
            kind = request.kind.as_str(),
            "received memory store request"
        );

        self.memory_store.store(&request).await?;
        tracing::info!(project_id = %request.project_id, "memory stored successfully");
        Ok(())
    }

    pub(crate) async fn handle_memory_recall(&self, delivery: Delivery) -> Result<(), String> {
        let request: MemoryRecallRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            project_id = %request.project_id,
            top_k = request.top_k,
            "received memory recall request"
        );

        let hits = self.memory_store.recall(&request).await?;
        let result = MemoryRecallResult {
            project_id: request.project_id.clone(),
            query: request.query.clone(),
            results: hits,
        };
        self.publish_json(SUBJECT_MEMORY_RECALL_RESULT, &result).await?;

        tracing::info!(
            project_id = %request.project_id,
            result_count = result.results.len(),
            "memory recall completed"
        );
        Ok(())
    }
}
