//! Graph build and search handlers.

use std::path::PathBuf;

use crate::bus::Delivery;
use crate::context::graph::DEFAULT_HOP_DECAY;
use crate::models::{GraphBuildRequest, GraphSearchRequest, GraphSearchResult};

use super::retrieval::INTERNAL_ERROR;
use super::subjects::{SUBJECT_GRAPH_BUILD_RESULT, SUBJECT_GRAPH_SEARCH_RESULT};
use super::Consumer;

impl Consumer {
    pub(crate) async fn handle_graph_build(&self, delivery: Delivery) -> Result<(), String> {
        let request: GraphBuildRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            project_id = %request.project_id,
            workspace = %request.workspace_path,
            "received graph build request"
        );

        let builder = self.graph_builder.clone();
        let db = self.db.clone();
        let project_id = request.project_id.clone();
        let workspace = PathBuf::from(&request.workspace_path);
        let result = tokio::task::spawn_blocking(move || builder.build_graph(&project_id, &workspace, &db))
            .await
            .map_err(|e| format!("graph build task panicked: {e}"))?;

        self.publish_json(SUBJECT_GRAPH_BUILD_RESULT, &result).await?;

        tracing::info!(
            project_id = %request.project_id,
            status = %result.status,
            nodes = result.node_count,
            edges = result.edge_count,
            "graph build completed"
        );
        Ok(())
    }

    pub(crate) async fn handle_graph_search(&self, delivery: Delivery) -> Result<(), String> {
        let request: GraphSearchRequest =
            serde_json::from_slice(&delivery.payload).map_err(|e| e.to_string())?;
        tracing::info!(
            project_id = %request.project_id,
            request_id = %request.request_id,
            seeds = ?request.seed_symbols,
            "received graph search request"
        );

        let searcher = self.graph_searcher.clone();
        let db = self.db.clone();
        let project_id = request.project_id.clone();
        let seeds = request.seed_symbols.clone();
        let (max_hops, top_k) = (request.max_hops, request.top_k);
        let mut hits = tokio::task::spawn_blocking(move || {
            searcher.search(&project_id, &seeds, max_hops, top_k, DEFAULT_HOP_DECAY, &db)
        })
        .await
        .map_err(|e| format!("graph search task panicked: {e}"))?;
        for hit in &mut hits {
            hit.project_id = request.project_id.clone();
        }

        let result = GraphSearchResult {
            project_id: request.project_id.clone(),
            request_id: request.request_id.clone(),
            results: hits,
            error: String::new(),
        };
        self.publish_json(SUBJECT_GRAPH_SEARCH_RESULT, &result).await?;

        tracing::info!(
            project_id = %request.project_id,
            hits = result.results.len(),
            "graph search completed"
        );
        Ok(())
    }

    pub(crate) async fn publish_graph_search_error(&self, delivery: &Delivery) {
        let Ok(request) = serde_json::from_slice::<GraphSearchRequest>(&delivery.payload) else {
            tracing::error!("failed to publish graph search error result: unparseable request");
            return;
        };
        let result = GraphSearchResult {
            project_id: request.project_id,
            request_id: request.request_id,
            results: Vec::new(),
            error: INTERNAL_ERROR.to_string(),
        };
        if let Err(error) = self.publish_json(SUBJECT_GRAPH_SEARCH_RESULT, &result).await {
            tracing::error!(error = %error, "failed to publish graph search error result");
        }
    }
}
