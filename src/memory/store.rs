//! Persistence and retrieval of agent memories.
//!
//! Embedding computation goes through the LLM gateway; retrieval ranks the
//! newest candidates with the [`CompositeScorer`]. Embeddings are stored as
//! little-endian f32 bytes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::db::Database;
use crate::llm::LlmProvider;
use crate::models::{MemoryRecallHit, MemoryRecallRequest, MemoryStoreRequest};

use super::scorer::CompositeScorer;

const CANDIDATE_LIMIT: usize = 500;
const EMBEDDING_MODEL: &str = "text-embedding-3-small";
const NIL_TENANT: &str = "00000000-0000-0000-0000-000000000000";

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Manages persistent agent memories with embedding-based recall.
pub struct MemoryStore {
    db: Database,
    llm: Arc<dyn LlmProvider>,
    scorer: CompositeScorer,
}

impl MemoryStore {
    pub fn new(db: Database, llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            db,
            llm,
            scorer: CompositeScorer::default(),
        }
    }

    /// Store a new memory. Embedding failures are tolerated — the record is
    /// kept without a vector and simply never surfaces in semantic recall.
    pub async fn store(&self, request: &MemoryStoreRequest) -> Result<String, String> {
        let embedding = match self
            .llm
            .embed(&[request.content.clone()], EMBEDDING_MODEL)
            .await
        {
            Ok(vectors) => vectors.into_iter().next(),
            Err(error) => {
                tracing::warn!(error = %error, "embedding computation failed for memory");
                None
            }
        };
        let embedding_bytes = embedding.as_deref().map(embedding_to_bytes);

        let memory_id = Uuid::new_v4().to_string();
        let metadata =
            serde_json::to_string(&request.metadata).unwrap_or_else(|_| "{}".to_string());

        let conn = self.db.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO agent_memories
                 (id, tenant_id, project_id, agent_id, run_id, content, kind, importance, embedding, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                memory_id,
                NIL_TENANT,
                request.project_id,
                request.agent_id,
                request.run_id,
                request.content,
                request.kind.as_str(),
                request.importance,
                embedding_bytes,
                metadata,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| e.to_string())?;

        tracing::info!(memory_id = %memory_id, kind = request.kind.as_str(), "memory stored");
        Ok(memory_id)
    }

    /// Recall the top-k memories for a query by composite score.
    pub async fn recall(&self, request: &MemoryRecallRequest) -> Result<Vec<MemoryRecallHit>, String> {
        let query_embedding = self
            .llm
            .embed(&[request.query.clone()], EMBEDDING_MODEL)
            .await
            .map_err(|e| e.to_string())?
            .into_iter()
            .next()
            .ok_or("could not compute query embedding")?;

        let candidates = self.load_candidates(request)?;

        let mut scored: Vec<MemoryRecallHit> = candidates
            .into_iter()
            .filter_map(|row| {
                let embedding = row.embedding?;
                let score = self.scorer.score(
                    &query_embedding,
                    &embedding,
                    row.created_at,
                    row.importance,
                );
                Some(MemoryRecallHit {
                    id: row.id,
                    content: row.content,
                    kind: row.kind,
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(request.top_k);
        Ok(scored)
    }

    fn load_candidates(&self, request: &MemoryRecallRequest) -> Result<Vec<CandidateRow>, String> {
        let conn = self.db.lock().map_err(|e| e.to_string())?;

        let kind_filter = request.kind.map(|k| k.as_str().to_string());
        let sql = match &kind_filter {
            Some(_) => {
                "SELECT id, content, kind, importance, embedding, created_at
                 FROM agent_memories WHERE project_id = ?1 AND kind = ?2
                 ORDER BY created_at DESC LIMIT ?3"
            }
            None => {
                "SELECT id, content, kind, importance, embedding, created_at
                 FROM agent_memories WHERE project_id = ?1
                 ORDER BY created_at DESC LIMIT ?2"
            }
        };

        let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
        let map_row = |row: &rusqlite::Row<'_>| {
            let created_raw: String = row.get(5)?;
            Ok(CandidateRow {
                id: row.get(0)?,
                content: row.get(1)?,
                kind: row.get(2)?,
                importance: row.get(3)?,
                embedding: row
                    .get::<_, Option<Vec<u8>>>(4)?
                    .map(|bytes| embedding_from_bytes(&bytes)),
                created_at: DateTime::parse_from_rfc3339(&created_raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        };

        let rows: Vec<CandidateRow> = match &kind_filter {
            Some(kind) => stmt
                .query_map(params![request.project_id, kind, CANDIDATE_LIMIT as i64], map_row)
                .map_err(|e| e.to_string())?
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?,
            None => stmt
                .query_map(params![request.project_id, CANDIDATE_LIMIT as i64], map_row)
                .map_err(|e| e.to_string())?
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?,
        };
        Ok(rows)
    }
}

struct CandidateRow {
    id: String,
    content: String,
    kind: String,
    importance: f64,
    embedding: Option<Vec<f32>>,
    created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::llm::{
        ChatCompletionResponse, ChatRequest, CompletionResponse, LlmError,
    };
    use crate::models::MemoryKind;

    struct MockEmbedder;

    #[async_trait]
    impl LlmProvider for MockEmbedder {
        async fn chat_completion(&self, _r: &ChatRequest) -> Result<ChatCompletionResponse, LlmError> {
            Err(LlmError::Http("not used".into()))
        }

        async fn chat_completion_stream(
            &self,
            _r: &ChatRequest,
        ) -> Result<ChatCompletionResponse, LlmError> {
            Err(LlmError::Http("not used".into()))
        }

        async fn completion(
            &self,
            _p: &str,
            _s: &str,
            _m: &str,
            _t: f32,
        ) -> Result<CompletionResponse, LlmError> {
            Err(LlmError::Http("not used".into()))
        }

        async fn embed(&self, texts: &[String], _m: &str) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut vector = vec![0.0f32; 32];
                    for (i, c) in text.chars().enumerate() {
                        vector[(i + c as usize) % 32] += 1.0;
                    }
                    vector
                })
                .collect())
        }
    }

    fn store() -> MemoryStore {
        MemoryStore::new(Database::in_memory().unwrap(), Arc::new(MockEmbedder))
    }

    fn store_request(content: &str, kind: MemoryKind, importance: f64) -> MemoryStoreRequest {
        MemoryStoreRequest {
            project_id: "p1".to_string(),
            agent_id: "a1".to_string(),
            run_id: "r1".to_string(),
            content: content.to_string(),
            kind,
            importance,
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn store_and_recall_round_trip() {
        let store = store();
        let id = store
            .store(&store_request(
                "switched the parser to streaming mode",
                MemoryKind::Decision,
                0.9,
            ))
            .await
            .unwrap();
        assert!(!id.is_empty());

        let hits = store
            .recall(&MemoryRecallRequest {
                project_id: "p1".to_string(),
                query: "parser streaming mode".to_string(),
                top_k: 5,
                kind: None,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, "decision");
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn recall_filters_by_kind() {
        let store = store();
        store
            .store(&store_request("an observation", MemoryKind::Observation, 0.5))
            .await
            .unwrap();
        store
            .store(&store_request("an error happened", MemoryKind::Error, 0.5))
            .await
            .unwrap();

        let hits = store
            .recall(&MemoryRecallRequest {
                project_id: "p1".to_string(),
                query: "anything".to_string(),
                top_k: 10,
                kind: Some(MemoryKind::Error),
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, "error");
    }

    #[tokio::test]
    async fn recall_respects_top_k() {
        let store = store();
        for i in 0..5 {
            store
                .store(&store_request(
                    &format!("note number {i}"),
                    MemoryKind::Observation,
                    0.5,
                ))
                .await
                .unwrap();
        }
        let hits = store
            .recall(&MemoryRecallRequest {
                project_id: "p1".to_string(),
                query: "note".to_string(),
                top_k: 2,
                kind: None,
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn other_projects_are_invisible() {
        let store = store();
        store
            .store(&store_request("private detail", MemoryKind::Insight, 0.5))
            .await
            .unwrap();

        let hits = store
            .recall(&MemoryRecallRequest {
                project_id: "other".to_string(),
                query: "private detail".to_string(),
                top_k: 5,
                kind: None,
            })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn embedding_bytes_round_trip() {
        let original = vec![0.25f32, -1.5, 3.75];
        let bytes = embedding_to_bytes(&original);
        assert_eq!(bytes.len(), 12);
        assert_eq!(embedding_from_bytes(&bytes), original);
    }
}
