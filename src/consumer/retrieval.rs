//! Retrieval handlers: index builds, hybrid searches, and sub-agent
//! searches, with fail-safe error replies for the search subjects.

use std::path::Path;

use crate::bus::Delivery;
use crate::models::{
    RetrievalIndexRequest, RetrievalIndexResult, RetrievalSearchRequest, RetrievalSearchResult,
    SubAgentSearchRequest, SubAgentSearchResult,
};

use super::subjects::{
    SUBJECT_RETRIEVAL_INDEX_RESULT, SUBJECT_RETRIEVAL_SEARCH_RESULT, SUBJECT_SUBAGENT_SEARCH_RESULT,
};
use super::Consumer;

pub(crate) const INTERNAL_ERROR: &str = "internal worker error";

impl Consumer {
    pub(crate) async fn handle_retrieval_index(&self, delivery: Delivery) -> Result<(), String> {
        let request: RetrievalIndexRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            project_id = %request.project_id,
            workspace = %request.workspace_path,
            "received retrieval index request"
        );

        let status = self
            .retriever
            .build_index(
                &request.project_id,
                Path::new(&request.workspace_path),
                &request.embedding_model,
                &request.file_extensions,
            )
            .await;

        let result = RetrievalIndexResult {
            project_id: status.project_id,
            status: status.status,
            file_count: status.file_count,
            chunk_count: status.chunk_count,
            embedding_model: status.embedding_model,
            error: status.error,
            incremental: status.incremental,
            files_changed: status.files_changed,
            files_unchanged: status.files_unchanged,
        };
        self.publish_json(SUBJECT_RETRIEVAL_INDEX_RESULT, &result).await?;

        tracing::info!(
            project_id = %request.project_id,
            status = %result.status,
            files = result.file_count,
            chunks = result.chunk_count,
            "retrieval index built"
        );
        Ok(())
    }

    pub(crate) async fn handle_retrieval_search(&self, delivery: Delivery) -> Result<(), String> {
        let request: RetrievalSearchRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            project_id = %request.project_id,
            request_id = %request.request_id,
            "received retrieval search request"
        );

        let mut hits = self
            .retriever
            .search(&request.project_id, &request.query, request.clamped_top_k())
            .await?;
        for hit in &mut hits {
            hit.project_id = request.project_id.clone();
        }

        let result = RetrievalSearchResult {
            project_id: request.project_id.clone(),
            query: request.query.clone(),
            request_id: request.request_id.clone(),
            results: hits,
            error: String::new(),
        };
        self.publish_json(SUBJECT_RETRIEVAL_SEARCH_RESULT, &result).await?;

        tracing::info!(
            project_id = %request.project_id,
            request_id = %request.request_id,
            hits = result.results.len(),
            "retrieval search completed"
        );
        Ok(())
    }

    pub(crate) async fn handle_subagent_search(&self, delivery: Delivery) -> Result<(), String> {
        let request: SubAgentSearchRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            project_id = %request.project_id,
            request_id = %request.request_id,
            "received subagent search request"
        );

        let outcome = self
            .subagent
            .search(
                &request.project_id,
                &request.query,
                request.clamped_top_k(),
                request.clamped_max_queries(),
                &request.model,
                request.rerank,
                &request.expansion_prompt,
            )
            .await;

        let result = SubAgentSearchResult {
            project_id: request.project_id.clone(),
            query: request.query.clone(),
            request_id: request.request_id.clone(),
            results: outcome.results,
            expanded_queries: outcome.expanded_queries,
            total_candidates: outcome.total_candidates,
            error: String::new(),
            model: outcome.model,
            tokens_in: outcome.tokens_in,
            tokens_out: outcome.tokens_out,
            cost_usd: outcome.cost_usd,
        };
        self.publish_json(SUBJECT_SUBAGENT_SEARCH_RESULT, &result).await?;

        tracing::info!(
            project_id = %request.project_id,
            hits = result.results.len(),
            queries = result.expanded_queries.len(),
            candidates = result.total_candidates,
            "subagent search completed"
        );
        Ok(())
    }

    /// Fail-safe reply so the waiter on the search result subject gets an
    /// immediate answer.
    pub(crate) async fn publish_retrieval_search_error(&self, delivery: &Delivery) {
        let Ok(request) = serde_json::from_slice::<RetrievalSearchRequest>(&delivery.payload) else {
            tracing::error!("failed to publish error result: unparseable request");
            return;
        };
        let result = RetrievalSearchResult {
            project_id: request.project_id,
            query: request.query,
            request_id: request.request_id,
            results: Vec::new(),
            error: INTERNAL_ERROR.to_string(),
        };
        if let Err(error) = self.publish_json(SUBJECT_RETRIEVAL_SEARCH_RESULT, &result).await {
            tracing::error!(error = %error, "failed to publish error result");
        }
    }

    pub(crate) async fn publish_subagent_search_error(&self, delivery: &Delivery) {
        let Ok(request) = serde_json::from_slice::<SubAgentSearchRequest>(&delivery.payload) else {
            tracing::error!("failed to publish error result: unparseable request");
            return;
        };
        let result = SubAgentSearchResult {
            project_id: request.project_id,
            query: request.query,
            request_id: request.request_id,
            results: Vec::new(),
            expanded_queries: Vec::new(),
            total_candidates: 0,
            error: INTERNAL_ERROR.to_string(),
            model: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
        };
        if let Err(error) = self.publish_json(SUBJECT_SUBAGENT_SEARCH_RESULT, &result).await {
            tracing::error!(error = %error, "failed to publish error result");
        }
    }
}
