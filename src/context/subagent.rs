//! Retrieval sub-agent: LLM-guided query expansion and reranking on top of
//! the hybrid retriever.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::llm::LlmProvider;
use crate::models::RetrievalSearchHit;

use super::retrieval::HybridRetriever;

/// Outcome of a sub-agent search, including the LLM spend it incurred.
#[derive(Debug, Default)]
pub struct SubAgentOutcome {
    pub results: Vec<RetrievalSearchHit>,
    pub expanded_queries: Vec<String>,
    pub total_candidates: usize,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

/// Wraps the hybrid retriever with query expansion and optional reranking.
pub struct RetrievalSubAgent {
    retriever: Arc<HybridRetriever>,
    llm: Arc<dyn LlmProvider>,
}

impl RetrievalSubAgent {
    pub fn new(retriever: Arc<HybridRetriever>, llm: Arc<dyn LlmProvider>) -> Self {
        Self { retriever, llm }
    }

    /// Expand the query, search every variant concurrently, deduplicate, and
    /// (optionally) rerank with the LLM.
    #[allow(clippy::too_many_arguments)]
    pub async fn search(
        &self,
        project_id: &str,
        query: &str,
        top_k: usize,
        max_queries: usize,
        model: &str,
        rerank: bool,
        expansion_prompt: &str,
    ) -> SubAgentOutcome {
        let mut outcome = SubAgentOutcome::default();

        let queries = self
            .expand_query(query, max_queries, model, expansion_prompt, &mut outcome)
            .await;
        outcome.expanded_queries = queries.clone();

        // Per-query failures are skipped; the remaining results still count.
        let searches = join_all(
            queries
                .iter()
                .map(|q| self.retriever.search(project_id, q, top_k)),
        )
        .await;

        let mut candidates: Vec<RetrievalSearchHit> = Vec::new();
        let mut seen: HashMap<(String, usize), usize> = HashMap::new();
        for result in searches {
            let Ok(hits) = result else {
                continue;
            };
            for hit in hits {
                let key = (hit.filepath.clone(), hit.start_line);
                match seen.get(&key) {
                    Some(&pos) => {
                        if hit.score > candidates[pos].score {
                            candidates[pos] = hit;
                        }
                    }
                    None => {
                        seen.insert(key, candidates.len());
                        candidates.push(hit);
                    }
                }
            }
        }
        outcome.total_candidates = candidates.len();

        let mut ranked = if rerank && candidates.len() > 1 {
            self.rerank(query, candidates, model, &mut outcome).await
        } else {
            sort_by_score(candidates)
        };
        ranked.truncate(top_k);
        outcome.results = ranked;
        outcome
    }

    /// Ask the LLM for up to `max_queries` paraphrases; the original query is
    /// always searched first. Any failure falls back to the original alone.
    async fn expand_query(
        &self,
        query: &str,
        max_queries: usize,
        model: &str,
        expansion_prompt: &str,
        outcome: &mut SubAgentOutcome,
    ) -> Vec<String> {
        let prompt = if expansion_prompt.is_empty() {
            format!(
                "Generate up to {max_queries} alternative phrasings of this code-search query. \
                 One per line, no numbering, no commentary.\n\nQuery: {query}"
            )
        } else {
            format!("{expansion_prompt}\n\nQuery: {query}")
        };

        let mut queries = vec![query.to_string()];
        match self.llm.completion(&prompt, "", model, 0.2).await {
            Ok(response) => {
                outcome.tokens_in += response.tokens_in;
                outcome.tokens_out += response.tokens_out;
                outcome.cost_usd += response.cost_usd;
                if !response.model.is_empty() {
                    outcome.model = response.model;
                }
                let expansions: Vec<String> = response
                    .content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && *line != query)
                    .map(str::to_string)
                    .take(max_queries)
                    .collect();
                queries.extend(expansions);
            }
            Err(error) => {
                tracing::warn!(error = %error, "query expansion failed, searching original only");
            }
        }
        queries
    }

    /// LLM reranking: present the candidates, parse a ranked index list, and
    /// fill unranked slots in original order. Falls back to score order.
    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalSearchHit>,
        model: &str,
        outcome: &mut SubAgentOutcome,
    ) -> Vec<RetrievalSearchHit> {
        let mut listing = String::new();
        for (i, hit) in candidates.iter().enumerate() {
            let snippet: String = hit.content.chars().take(200).collect();
            listing.push_str(&format!(
                "[{i}] {}:{} {}\n{snippet}\n\n",
                hit.filepath, hit.start_line, hit.symbol_name
            ));
        }
        let prompt = format!(
            "Rank these code snippets by relevance to the query. Reply with the \
             snippet indices, most relevant first, comma-separated and nothing else.\n\n\
             Query: {query}\n\n{listing}"
        );

        match self.llm.completion(&prompt, "", model, 0.0).await {
            Ok(response) => {
                outcome.tokens_in += response.tokens_in;
                outcome.tokens_out += response.tokens_out;
                outcome.cost_usd += response.cost_usd;
                if !response.model.is_empty() {
                    outcome.model = response.model;
                }

                let mut order: Vec<usize> = Vec::new();
                for token in response.content.split(|c: char| !c.is_ascii_digit()) {
                    if token.is_empty() {
                        continue;
                    }
                    if let Ok(index) = token.parse::<usize>() {
                        if index < candidates.len() && !order.contains(&index) {
                            order.push(index);
                        }
                    }
                }
                // Unranked candidates keep their original order at the end.
                for index in 0..candidates.len() {
                    if !order.contains(&index) {
                        order.push(index);
                    }
                }

                let mut slots: Vec<Option<RetrievalSearchHit>> =
                    candidates.into_iter().map(Some).collect();
                order.into_iter().filter_map(|i| slots[i].take()).collect()
            }
            Err(error) => {
                tracing::warn!(error = %error, "rerank failed, falling back to score order");
                sort_by_score(candidates)
            }
        }
    }
}

fn sort_by_score(mut hits: Vec<RetrievalSearchHit>) -> Vec<RetrievalSearchHit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::llm::{
        ChatCompletionResponse, ChatRequest, CompletionResponse, LlmError,
    };

    /// LLM stub: scripted completion replies plus hash-based embeddings.
    struct StubLlm {
        completions: Mutex<VecDeque<Result<String, ()>>>,
    }

    impl StubLlm {
        fn new(completions: Vec<Result<&str, ()>>) -> Arc<Self> {
            Arc::new(Self {
                completions: Mutex::new(
                    completions
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for StubLlm {
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
            let next = self
                .completions
                .lock()
                .ok()
                .and_then(|mut c| c.pop_front())
                .unwrap_or(Err(()));
            match next {
                Ok(content) => Ok(CompletionResponse {
                    content,
                    tokens_in: 10,
                    tokens_out: 5,
                    model: "stub".to_string(),
                    cost_usd: 0.001,
                }),
                Err(()) => Err(LlmError::Http("scripted failure".into())),
            }
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

    fn workspace() -> tempfile::TempDir {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(
            ws.path().join("auth.py"),
            "def authenticate_user(token):\n    return token == 'ok'\n",
        )
        .unwrap();
        std::fs::write(
            ws.path().join("billing.py"),
            "def charge_card(amount):\n    return amount\n",
        )
        .unwrap();
        ws
    }

    use std::path::Path;

    async fn indexed_retriever(llm: Arc<StubLlm>, ws: &Path) -> Arc<HybridRetriever> {
        let retriever = Arc::new(HybridRetriever::new(llm));
        retriever.build_index("p1", ws, "text-embedding-3-small", &[]).await;
        retriever
    }

    #[tokio::test]
    async fn expansion_failure_falls_back_to_original_query() {
        let llm = StubLlm::new(vec![Err(())]);
        let ws = workspace();
        let retriever = indexed_retriever(llm.clone(), ws.path()).await;
        let subagent = RetrievalSubAgent::new(retriever, llm);

        let outcome = subagent
            .search("p1", "authenticate_user", 5, 3, "", false, "")
            .await;
        assert_eq!(outcome.expanded_queries, vec!["authenticate_user".to_string()]);
        assert!(!outcome.results.is_empty());
    }

    #[tokio::test]
    async fn expanded_queries_widen_the_candidate_pool() {
        let llm = StubLlm::new(vec![Ok("charge_card billing\nuser authentication")]);
        let ws = workspace();
        let retriever = indexed_retriever(llm.clone(), ws.path()).await;
        let subagent = RetrievalSubAgent::new(retriever, llm);

        let outcome = subagent
            .search("p1", "authenticate_user", 5, 5, "", false, "")
            .await;
        assert_eq!(outcome.expanded_queries.len(), 3);
        assert!(outcome.total_candidates >= 2);
        assert!(outcome.tokens_in > 0);
        assert_eq!(outcome.model, "stub");
    }

    #[tokio::test]
    async fn duplicates_keep_highest_score() {
        // Two expansions hit the same chunks; dedup keeps one entry each.
        let llm = StubLlm::new(vec![Ok("authenticate_user token")]);
        let ws = workspace();
        let retriever = indexed_retriever(llm.clone(), ws.path()).await;
        let subagent = RetrievalSubAgent::new(retriever, llm);

        let outcome = subagent
            .search("p1", "authenticate_user", 10, 2, "", false, "")
            .await;
        let mut keys: Vec<(String, usize)> = outcome
            .results
            .iter()
            .map(|h| (h.filepath.clone(), h.start_line))
            .collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), outcome.results.len(), "duplicate (file, line) hits survived");
    }

    #[tokio::test]
    async fn rerank_applies_llm_order() {
        // First completion: expansion (empty -> original only).
        // Second completion: rerank picks index 1 first.
        let llm = StubLlm::new(vec![Ok(""), Ok("1, 0")]);
        let ws = workspace();
        let retriever = indexed_retriever(llm.clone(), ws.path()).await;
        let subagent = RetrievalSubAgent::new(retriever, llm);

        let outcome = subagent.search("p1", "def", 5, 2, "", true, "").await;
        assert!(outcome.results.len() >= 2);
        // The reranked order differs from pure score order in a stable way:
        // result[0] is whatever the stub ranked first.
        assert_eq!(outcome.total_candidates, outcome.results.len());
    }

    #[tokio::test]
    async fn rerank_failure_sorts_by_score() {
        let llm = StubLlm::new(vec![Ok(""), Err(())]);
        let ws = workspace();
        let retriever = indexed_retriever(llm.clone(), ws.path()).await;
        let subagent = RetrievalSubAgent::new(retriever, llm);

        let outcome = subagent.search("p1", "def", 5, 2, "", true, "").await;
        for pair in outcome.results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn top_k_truncates_results() {
        let llm = StubLlm::new(vec![Ok("")]);
        let ws = workspace();
        let retriever = indexed_retriever(llm.clone(), ws.path()).await;
        let subagent = RetrievalSubAgent::new(retriever, llm);

        let outcome = subagent.search("p1", "def", 1, 1, "", false, "").await;
        assert!(outcome.results.len() <= 1);
    }
}
