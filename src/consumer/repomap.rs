//! Repo map handler.

use std::path::PathBuf;

use crate::bus::Delivery;
use crate::models::RepoMapRequest;

use super::subjects::SUBJECT_REPOMAP_RESULT;
use super::Consumer;

impl Consumer {
    pub(crate) async fn handle_repomap(&self, delivery: Delivery) -> Result<(), String> {
        let request: RepoMapRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            project_id = %request.project_id,
            workspace = %request.workspace_path,
            "received repomap request"
        );

        let generator = self.repomap.clone();
        let workspace = PathBuf::from(&request.workspace_path);
        let token_budget = request.token_budget;
        let active_files = request.active_files.clone();
        let mut result =
            tokio::task::spawn_blocking(move || generator.generate(&workspace, token_budget, &active_files))
                .await
                .map_err(|e| format!("repomap task panicked: {e}"))?;
        result.project_id = request.project_id.clone();

        self.publish_json(SUBJECT_REPOMAP_RESULT, &result).await?;

        tracing::info!(
            project_id = %request.project_id,
            files = result.file_count,
            symbols = result.symbol_count,
            tokens = result.token_count,
            "repomap generated"
        );
        Ok(())
    }
}
