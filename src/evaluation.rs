//! Collaboration metrics for multi-agent runs.
//!
//! Implements two GEMMAS-inspired metrics over a DAG of agent-to-agent
//! messages: the Information Diversity Score (IDS, higher = less redundant
//! contributions) and the Unnecessary Path Ratio (UPR, lower = fewer wasted
//! reasoning paths). Pairwise similarity uses gateway embeddings with a
//! term-overlap fallback when embeddings are unavailable.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::llm::LlmProvider;
use crate::models::{AgentMessageRecord, GemmasEvalResult};

const EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Directed graph of agent message flow. Nodes are agents; edges follow
/// `parent_agent_id -> agent_id`.
pub struct CollaborationDag {
    messages: Vec<AgentMessageRecord>,
    edges: Vec<(String, String)>,
}

impl CollaborationDag {
    pub fn new(messages: Vec<AgentMessageRecord>) -> Self {
        let mut edges = Vec::new();
        for message in &messages {
            if let Some(parent) = &message.parent_agent_id {
                let edge = (parent.clone(), message.agent_id.clone());
                if !edges.contains(&edge) {
                    edges.push(edge);
                }
            }
        }
        Self { messages, edges }
    }

    /// Sorted distinct agent ids.
    pub fn agents(&self) -> Vec<String> {
        let set: BTreeSet<String> = self.messages.iter().map(|m| m.agent_id.clone()).collect();
        set.into_iter().collect()
    }

    /// Symmetric adjacency between agents that exchanged messages directly.
    fn spatial_adjacency(&self, agents: &[String]) -> Vec<Vec<f64>> {
        let index: HashMap<&str, usize> = agents
            .iter()
            .enumerate()
            .map(|(i, a)| (a.as_str(), i))
            .collect();
        let n = agents.len();
        let mut matrix = vec![vec![0.0; n]; n];
        for (source, target) in &self.edges {
            if let (Some(&i), Some(&j)) = (index.get(source.as_str()), index.get(target.as_str())) {
                matrix[i][j] = 1.0;
                matrix[j][i] = 1.0;
            }
        }
        matrix
    }

    /// All root-to-leaf paths as `"a -> b -> c"` identifiers. Without a DAG
    /// structure, each agent is its own path.
    pub fn enumerate_paths(&self) -> Vec<String> {
        let targets: HashSet<&str> = self.edges.iter().map(|(_, t)| t.as_str()).collect();
        let sources: HashSet<&str> = self.edges.iter().map(|(s, _)| s.as_str()).collect();
        let all: BTreeSet<&str> = sources.union(&targets).copied().collect();
        let roots: Vec<&str> = all.iter().filter(|a| !targets.contains(**a)).copied().collect();
        let leaves: HashSet<&str> = all.iter().filter(|a| !sources.contains(**a)).copied().collect();

        if roots.is_empty() {
            return self.agents();
        }

        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (source, target) in &self.edges {
            adjacency.entry(source.as_str()).or_default().push(target.as_str());
        }

        let mut paths = Vec::new();
        let mut stack: Vec<Vec<&str>> = roots.iter().map(|r| vec![*r]).collect();
        while let Some(path) = stack.pop() {
            let current = *path.last().unwrap_or(&"");
            let neighbors = adjacency.get(current).cloned().unwrap_or_default();
            if neighbors.is_empty() || leaves.contains(current) {
                paths.push(path.join(" -> "));
            } else {
                for neighbor in neighbors {
                    if !path.contains(&neighbor) {
                        let mut next = path.clone();
                        next.push(neighbor);
                        stack.push(next);
                    }
                }
            }
        }
        paths
    }
}

/// Compute IDS and UPR for a set of agent messages.
pub async fn evaluate_collaboration(
    messages: Vec<AgentMessageRecord>,
    plan_id: &str,
    llm: Option<Arc<dyn LlmProvider>>,
) -> GemmasEvalResult {
    if messages.is_empty() {
        return GemmasEvalResult {
            plan_id: plan_id.to_string(),
            information_diversity_score: 1.0,
            unnecessary_path_ratio: 0.0,
            error: String::new(),
        };
    }

    let dag = CollaborationDag::new(messages);
    let ids = information_diversity_score(&dag, llm).await;
    let upr = unnecessary_path_ratio(&dag, None);

    GemmasEvalResult {
        plan_id: plan_id.to_string(),
        information_diversity_score: ids,
        unnecessary_path_ratio: upr,
        error: String::new(),
    }
}

/// IDS: weighted average of (1 - similarity) over directly-linked agent
/// pairs. 1.0 for fewer than two agents or no linked pairs.
pub async fn information_diversity_score(
    dag: &CollaborationDag,
    llm: Option<Arc<dyn LlmProvider>>,
) -> f64 {
    let agents = dag.agents();
    if agents.len() < 2 {
        return 1.0;
    }

    let corpus: Vec<String> = agents
        .iter()
        .map(|agent| {
            dag.messages
                .iter()
                .filter(|m| &m.agent_id == agent)
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();

    let similarity = match embedding_similarity(&corpus, llm).await {
        Some(matrix) => matrix,
        None => term_overlap_similarity(&corpus),
    };

    let adjacency = dag.spatial_adjacency(&agents);
    let n = agents.len();
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            if adjacency[i][j] > 0.0 {
                total += 1.0 - similarity[i][j];
                pairs += 1;
            }
        }
    }
    if pairs == 0 {
        return 1.0;
    }
    total / pairs as f64
}

/// UPR: share of root-to-leaf paths below the correctness threshold. Without
/// path scores every path counts as necessary.
pub fn unnecessary_path_ratio(dag: &CollaborationDag, path_scores: Option<&HashMap<String, f64>>) -> f64 {
    let paths = dag.enumerate_paths();
    if paths.is_empty() {
        return 0.0;
    }
    let Some(scores) = path_scores else {
        return 0.0;
    };
    let necessary = paths
        .iter()
        .filter(|p| scores.get(*p).copied().unwrap_or(0.0) >= 0.5)
        .count();
    1.0 - necessary as f64 / paths.len() as f64
}

async fn embedding_similarity(
    corpus: &[String],
    llm: Option<Arc<dyn LlmProvider>>,
) -> Option<Vec<Vec<f64>>> {
    let llm = llm?;
    let embeddings = llm.embed(corpus, EMBEDDING_MODEL).await.ok()?;
    if embeddings.len() != corpus.len() {
        return None;
    }

    let normalized: Vec<Vec<f64>> = embeddings
        .iter()
        .map(|row| {
            let magnitude: f64 = row.iter().map(|v| (*v as f64).powi(2)).sum::<f64>().sqrt();
            let magnitude = if magnitude == 0.0 { 1.0 } else { magnitude };
            row.iter().map(|v| *v as f64 / magnitude).collect()
        })
        .collect();

    let n = normalized.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            matrix[i][j] = normalized[i].iter().zip(&normalized[j]).map(|(a, b)| a * b).sum();
        }
    }
    Some(matrix)
}

/// Fallback similarity: fraction of shared lowercase terms between two
/// agents' combined texts.
fn term_overlap_similarity(corpus: &[String]) -> Vec<Vec<f64>> {
    let token_sets: Vec<HashSet<String>> = corpus
        .iter()
        .map(|text| {
            text.split_whitespace()
                .map(|t| t.to_lowercase())
                .collect::<HashSet<_>>()
        })
        .collect();

    let n = corpus.len();
    let mut matrix = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            if i == j {
                matrix[i][j] = 1.0;
                continue;
            }
            let union = token_sets[i].union(&token_sets[j]).count();
            if union == 0 {
                continue;
            }
            let intersection = token_sets[i].intersection(&token_sets[j]).count();
            matrix[i][j] = intersection as f64 / union as f64;
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(agent: &str, content: &str, round: i64, parent: Option<&str>) -> AgentMessageRecord {
        AgentMessageRecord {
            agent_id: agent.to_string(),
            content: content.to_string(),
            round,
            parent_agent_id: parent.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn empty_messages_score_perfect() {
        let result = evaluate_collaboration(vec![], "plan-1", None).await;
        assert_eq!(result.information_diversity_score, 1.0);
        assert_eq!(result.unnecessary_path_ratio, 0.0);
        assert!(result.error.is_empty());
    }

    #[tokio::test]
    async fn single_agent_scores_perfect_diversity() {
        let dag = CollaborationDag::new(vec![message("a", "all alone", 0, None)]);
        assert_eq!(information_diversity_score(&dag, None).await, 1.0);
    }

    #[tokio::test]
    async fn identical_linked_agents_score_low_diversity() {
        let dag = CollaborationDag::new(vec![
            message("a", "the exact same words", 0, None),
            message("b", "the exact same words", 1, Some("a")),
        ]);
        let score = information_diversity_score(&dag, None).await;
        assert!(score < 0.05, "score = {score}");
    }

    #[tokio::test]
    async fn disjoint_linked_agents_score_high_diversity() {
        let dag = CollaborationDag::new(vec![
            message("a", "parsing configuration files", 0, None),
            message("b", "network socket plumbing", 1, Some("a")),
        ]);
        let score = information_diversity_score(&dag, None).await;
        assert!(score > 0.9, "score = {score}");
    }

    #[test]
    fn paths_follow_parent_edges() {
        let dag = CollaborationDag::new(vec![
            message("planner", "plan", 0, None),
            message("coder", "code", 1, Some("planner")),
            message("reviewer", "review", 2, Some("coder")),
        ]);
        let paths = dag.enumerate_paths();
        assert_eq!(paths, vec!["planner -> coder -> reviewer"]);
    }

    #[test]
    fn upr_without_scores_is_zero() {
        let dag = CollaborationDag::new(vec![
            message("a", "x", 0, None),
            message("b", "y", 1, Some("a")),
        ]);
        assert_eq!(unnecessary_path_ratio(&dag, None), 0.0);
    }

    #[test]
    fn upr_counts_low_scoring_paths() {
        let dag = CollaborationDag::new(vec![
            message("a", "x", 0, None),
            message("b", "y", 1, Some("a")),
            message("a", "x2", 0, None),
            message("c", "z", 1, Some("a")),
        ]);
        let mut scores = HashMap::new();
        scores.insert("a -> b".to_string(), 0.9);
        scores.insert("a -> c".to_string(), 0.1);
        let upr = unnecessary_path_ratio(&dag, Some(&scores));
        assert!((upr - 0.5).abs() < 1e-9);
    }

    #[test]
    fn cyclic_edges_do_not_hang_path_enumeration() {
        let dag = CollaborationDag::new(vec![
            message("a", "x", 0, Some("b")),
            message("b", "y", 1, Some("a")),
        ]);
        // Cycle -> no roots -> one path per agent.
        let paths = dag.enumerate_paths();
        assert_eq!(paths.len(), 2);
    }
}
