//! Repository map generation.
//!
//! Extracts definition and reference tags from source files, builds a
//! cross-file dependency graph, ranks files with weighted PageRank, and
//! renders a compact text map fitting a token budget.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use tree_sitter::Node;

use crate::models::RepoMapResult;

use super::treesitter::{
    children_of, collect_files, def_node_types, extract_def_name, node_text, parse_source,
    BODY_NODE_TYPES,
};

const CHARS_PER_TOKEN: usize = 4;
const PAGERANK_DAMPING: f64 = 0.85;
const PAGERANK_ITERATIONS: usize = 100;
const PAGERANK_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Def,
    Ref,
}

/// A single symbol occurrence extracted from source code.
#[derive(Debug, Clone)]
struct SymbolTag {
    rel_path: String,
    line: usize,
    name: String,
    kind: TagKind,
}

/// Generates a ranked, token-budgeted map of repository symbols.
#[derive(Debug, Default)]
pub struct RepoMapGenerator;

impl RepoMapGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generate a repo map for the workspace. `active_files` get a strong
    /// edge-weight boost so the map centres on what the agent is touching.
    pub fn generate(
        &self,
        workspace: &Path,
        token_budget: usize,
        active_files: &[String],
    ) -> RepoMapResult {
        let files = collect_files(workspace);
        if files.is_empty() {
            return empty_result(0);
        }

        let mut all_tags: Vec<SymbolTag> = Vec::new();
        let mut languages: HashSet<&'static str> = HashSet::new();

        for file in &files {
            let Ok(source) = std::fs::read(&file.abs_path) else {
                tracing::warn!(path = %file.abs_path.display(), "cannot read file");
                continue;
            };
            let Some(tree) = parse_source(file.language, &source) else {
                tracing::warn!(path = %file.rel_path, language = file.language, "parse failed");
                continue;
            };
            languages.insert(file.language);

            let def_types = def_node_types(file.language);
            let mut def_names: HashSet<String> = HashSet::new();
            let mut tags: Vec<SymbolTag> = Vec::new();
            walk_definitions(
                tree.root_node(),
                &source,
                &file.rel_path,
                def_types,
                &mut tags,
                &mut def_names,
                0,
            );
            walk_references(tree.root_node(), &source, &file.rel_path, &def_names, &mut tags);
            all_tags.extend(tags);
        }

        let mut languages: Vec<String> = languages.into_iter().map(str::to_string).collect();
        languages.sort();

        if all_tags.is_empty() {
            let mut result = empty_result(files.len());
            result.languages = languages;
            return result;
        }

        let rank = rank_files(&all_tags, active_files);

        let mut def_tags: Vec<SymbolTag> = all_tags
            .into_iter()
            .filter(|t| t.kind == TagKind::Def)
            .collect();
        def_tags.sort_by(|a, b| {
            let rank_a = rank.get(&a.rel_path).copied().unwrap_or(0.0);
            let rank_b = rank.get(&b.rel_path).copied().unwrap_or(0.0);
            rank_b
                .partial_cmp(&rank_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.line.cmp(&b.line))
        });

        let map_text = format_map(&def_tags, token_budget);
        let token_count = map_text.len() / CHARS_PER_TOKEN;

        RepoMapResult {
            project_id: String::new(),
            map_text,
            token_count,
            file_count: files.len(),
            symbol_count: def_tags.len(),
            languages,
            error: String::new(),
        }
    }
}

fn empty_result(file_count: usize) -> RepoMapResult {
    RepoMapResult {
        project_id: String::new(),
        map_text: String::new(),
        token_count: 0,
        file_count,
        symbol_count: 0,
        languages: Vec::new(),
        error: String::new(),
    }
}

/// Extract definition tags from top-level nodes, export wrappers, and class
/// or impl bodies up to two levels deep.
fn walk_definitions(
    node: Node<'_>,
    source: &[u8],
    rel_path: &str,
    def_types: &[&str],
    tags: &mut Vec<SymbolTag>,
    def_names: &mut HashSet<String>,
    depth: usize,
) {
    if depth > 2 {
        return;
    }
    for child in children_of(node) {
        if def_types.contains(&child.kind()) {
            let name = extract_def_name(child, source);
            if !name.is_empty() {
                tags.push(SymbolTag {
                    rel_path: rel_path.to_string(),
                    line: child.start_position().row + 1,
                    name: name.clone(),
                    kind: TagKind::Def,
                });
                def_names.insert(name);
            }
        }
        if child.kind() == "export_statement" || BODY_NODE_TYPES.contains(&child.kind()) {
            walk_definitions(child, source, rel_path, def_types, tags, def_names, depth + 1);
        }
    }
}

/// Collect identifier references to names not defined in this file.
fn walk_references(
    node: Node<'_>,
    source: &[u8],
    rel_path: &str,
    def_names: &HashSet<String>,
    tags: &mut Vec<SymbolTag>,
) {
    if node.kind() == "identifier" && node.parent().is_some() {
        let name = node_text(node, source);
        if name.len() >= 2 && !def_names.contains(&name) {
            tags.push(SymbolTag {
                rel_path: rel_path.to_string(),
                line: node.start_position().row + 1,
                name,
                kind: TagKind::Ref,
            });
        }
    }
    for child in children_of(node) {
        walk_references(child, source, rel_path, def_names, tags);
    }
}

/// Build the weighted file-dependency graph and PageRank it.
fn rank_files(tags: &[SymbolTag], active_files: &[String]) -> HashMap<String, f64> {
    // Index definitions by name -> defining files.
    let mut defs_by_name: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut graph: DiGraph<String, f64> = DiGraph::new();
    let mut node_ids: HashMap<String, NodeIndex> = HashMap::new();

    fn node_of(
        graph: &mut DiGraph<String, f64>,
        node_ids: &mut HashMap<String, NodeIndex>,
        file: &str,
    ) -> NodeIndex {
        *node_ids
            .entry(file.to_string())
            .or_insert_with(|| graph.add_node(file.to_string()))
    }

    for tag in tags.iter().filter(|t| t.kind == TagKind::Def) {
        defs_by_name
            .entry(tag.name.as_str())
            .or_default()
            .insert(tag.rel_path.as_str());
        node_of(&mut graph, &mut node_ids, &tag.rel_path);
    }

    let active: HashSet<&str> = active_files.iter().map(String::as_str).collect();
    let mut weights: HashMap<(String, String), f64> = HashMap::new();

    for tag in tags.iter().filter(|t| t.kind == TagKind::Ref) {
        let Some(def_files) = defs_by_name.get(tag.name.as_str()) else {
            continue;
        };
        for def_file in def_files {
            if *def_file == tag.rel_path {
                continue;
            }
            let mut weight = 1.0;
            if tag.name.len() >= 8 {
                weight *= 10.0;
            }
            if tag.name.starts_with('_') {
                weight *= 0.1;
            }
            if active.contains(tag.rel_path.as_str()) || active.contains(def_file) {
                weight *= 50.0;
            }
            *weights
                .entry((tag.rel_path.clone(), def_file.to_string()))
                .or_insert(0.0) += weight;
        }
    }

    for ((source, target), weight) in weights {
        let source_idx = node_of(&mut graph, &mut node_ids, &source);
        let target_idx = node_of(&mut graph, &mut node_ids, &target);
        graph.add_edge(source_idx, target_idx, weight);
    }

    weighted_pagerank(&graph)
}

/// Weighted PageRank power iteration. Dangling nodes distribute their mass
/// uniformly.
fn weighted_pagerank(graph: &DiGraph<String, f64>) -> HashMap<String, f64> {
    let n = graph.node_count();
    if n == 0 {
        return HashMap::new();
    }
    let uniform = 1.0 / n as f64;
    let mut rank = vec![uniform; n];

    let out_weight: Vec<f64> = graph
        .node_indices()
        .map(|idx| {
            graph
                .edges_directed(idx, Direction::Outgoing)
                .map(|e| *e.weight())
                .sum()
        })
        .collect();

    for _ in 0..PAGERANK_ITERATIONS {
        let dangling: f64 = graph
            .node_indices()
            .filter(|idx| out_weight[idx.index()] == 0.0)
            .map(|idx| rank[idx.index()])
            .sum();

        let mut next = vec![0.0; n];
        for idx in graph.node_indices() {
            let incoming: f64 = graph
                .edges_directed(idx, Direction::Incoming)
                .map(|edge| {
                    let source = edge.source().index();
                    rank[source] * edge.weight() / out_weight[source]
                })
                .sum();
            next[idx.index()] = (1.0 - PAGERANK_DAMPING) * uniform
                + PAGERANK_DAMPING * (incoming + dangling * uniform);
        }

        let diff: f64 = rank
            .iter()
            .zip(next.iter())
            .map(|(a, b)| (a - b).abs())
            .sum();
        rank = next;
        if diff < PAGERANK_TOLERANCE * n as f64 {
            break;
        }
    }

    graph
        .node_indices()
        .map(|idx| (graph[idx].clone(), rank[idx.index()]))
        .collect()
}

/// Render the map text, binary-searching the largest file prefix that fits
/// the character budget.
fn format_map(ranked_tags: &[SymbolTag], token_budget: usize) -> String {
    if ranked_tags.is_empty() {
        return String::new();
    }
    let char_budget = token_budget * CHARS_PER_TOKEN;

    let mut files_order: Vec<&str> = Vec::new();
    let mut tags_by_file: HashMap<&str, Vec<&SymbolTag>> = HashMap::new();
    for tag in ranked_tags {
        if !tags_by_file.contains_key(tag.rel_path.as_str()) {
            files_order.push(tag.rel_path.as_str());
        }
        tags_by_file.entry(tag.rel_path.as_str()).or_default().push(tag);
    }

    let mut lo = 1;
    let mut hi = files_order.len();
    let mut best = render(&files_order[..1], &tags_by_file);

    while lo <= hi {
        let mid = (lo + hi) / 2;
        let rendered = render(&files_order[..mid], &tags_by_file);
        if rendered.len() <= char_budget {
            best = rendered;
            lo = mid + 1;
        } else {
            hi = mid - 1;
        }
    }
    best
}

fn render(files: &[&str], tags_by_file: &HashMap<&str, Vec<&SymbolTag>>) -> String {
    let mut lines: Vec<String> = Vec::new();
    for file in files {
        lines.push((*file).to_string());
        if let Some(tags) = tags_by_file.get(file) {
            lines.extend(tags.iter().map(|tag| format!("    {}", tag.name)));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two Python files where handlers.py references definitions in
    /// service.py, making service.py the higher-ranked file.
    fn workspace() -> tempfile::TempDir {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(
            ws.path().join("service.py"),
            "class UserService:\n    def get_user(self, user_id):\n        return None\n\ndef build_service():\n    return UserService()\n",
        )
        .unwrap();
        std::fs::write(
            ws.path().join("handlers.py"),
            "def handle(request):\n    service = build_service()\n    return UserService\n",
        )
        .unwrap();
        ws
    }

    #[test]
    fn generates_map_with_symbols() {
        let ws = workspace();
        let result = RepoMapGenerator::new().generate(ws.path(), 1024, &[]);

        assert_eq!(result.file_count, 2);
        assert!(result.symbol_count >= 3);
        assert_eq!(result.languages, vec!["python"]);
        assert!(result.map_text.contains("service.py"));
        assert!(result.map_text.contains("    UserService"));
        assert!(result.token_count <= 1024);
    }

    #[test]
    fn referenced_file_ranks_first() {
        let ws = workspace();
        let result = RepoMapGenerator::new().generate(ws.path(), 1024, &[]);
        let service_pos = result.map_text.find("service.py").unwrap();
        let handlers_pos = result.map_text.find("handlers.py").unwrap();
        assert!(
            service_pos < handlers_pos,
            "referenced file should rank above its referrer:\n{}",
            result.map_text
        );
    }

    #[test]
    fn tight_budget_truncates_to_top_files() {
        let ws = workspace();
        let result = RepoMapGenerator::new().generate(ws.path(), 10, &[]);
        // Budget of 40 chars fits one file block at most.
        assert!(result.map_text.len() <= 60);
        assert!(result.map_text.contains("service.py"));
    }

    #[test]
    fn empty_workspace_yields_empty_map() {
        let ws = tempfile::tempdir().unwrap();
        let result = RepoMapGenerator::new().generate(ws.path(), 1024, &[]);
        assert!(result.map_text.is_empty());
        assert_eq!(result.file_count, 0);
    }

    #[test]
    fn pagerank_masses_sum_to_one() {
        let ws = workspace();
        let files = collect_files(ws.path());
        assert_eq!(files.len(), 2);

        let mut graph: DiGraph<String, f64> = DiGraph::new();
        let a = graph.add_node("a".into());
        let b = graph.add_node("b".into());
        graph.add_edge(a, b, 3.0);
        let rank = weighted_pagerank(&graph);
        let total: f64 = rank.values().sum();
        assert!((total - 1.0).abs() < 1e-6, "total mass {total}");
        assert!(rank["b"] > rank["a"]);
    }
}
