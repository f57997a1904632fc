//! Code graph construction and BFS search.
//!
//! The builder parses workspace files into symbol nodes and import/call
//! edges, persisting them to the database and replacing any prior build for
//! the project. The searcher BFS-walks the stored graph from seed symbols,
//! scoring hits by hop decay.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use rusqlite::params;
use tree_sitter::Node;

use crate::db::{Database, DbError};
use crate::models::{GraphBuildResult, GraphSearchHit};

use super::treesitter::{
    children_of, collect_files, def_node_types, extract_def_name, extract_import_names,
    import_node_types, kind_for_node, parse_source, BODY_NODE_TYPES,
};

pub const DEFAULT_HOP_DECAY: f64 = 0.7;

#[derive(Debug, Clone)]
struct GraphNodeRecord {
    node_id: String,
    filepath: String,
    symbol_name: String,
    kind: String,
    start_line: usize,
    end_line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GraphEdgeRecord {
    source_id: String,
    target_id: String,
    kind: String,
}

#[derive(Default)]
struct BuildContext {
    project_id: String,
    nodes: Vec<GraphNodeRecord>,
    edges: Vec<GraphEdgeRecord>,
    /// symbol name -> (node id, defining file), for call-edge resolution.
    name_to_ids: HashMap<String, Vec<(String, String)>>,
    languages: HashSet<String>,
}

// ─── CodeGraphBuilder ────────────────────────────────────────────────────────

/// Builds a project's code graph and stores it in the database.
#[derive(Debug, Default)]
pub struct CodeGraphBuilder;

impl CodeGraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Parse the workspace, extract the graph, and persist it, replacing the
    /// project's previous build.
    pub fn build_graph(&self, project_id: &str, workspace: &Path, db: &Database) -> GraphBuildResult {
        tracing::info!(project_id = project_id, workspace = %workspace.display(), "building code graph");

        let mut ctx = BuildContext {
            project_id: project_id.to_string(),
            ..Default::default()
        };

        let files = collect_files(workspace);
        if files.is_empty() {
            return GraphBuildResult {
                project_id: project_id.to_string(),
                status: "ready".to_string(),
                node_count: 0,
                edge_count: 0,
                languages: Vec::new(),
                error: String::new(),
            };
        }

        for file in &files {
            let Ok(source) = std::fs::read(&file.abs_path) else {
                tracing::warn!(path = %file.abs_path.display(), "cannot read file");
                continue;
            };
            let Some(tree) = parse_source(file.language, &source) else {
                tracing::warn!(path = %file.rel_path, "parse failed");
                continue;
            };
            ctx.languages.insert(file.language.to_string());
            extract_from_file(&mut ctx, tree.root_node(), &source, &file.rel_path, file.language);
        }

        resolve_call_edges(&mut ctx);

        let node_count = ctx.nodes.len();
        let edge_count = ctx.edges.len();
        let mut languages: Vec<String> = ctx.languages.iter().cloned().collect();
        languages.sort();

        if let Err(error) = persist(&ctx, db) {
            tracing::error!(project_id = project_id, error = %error, "graph build failed");
            return GraphBuildResult {
                project_id: project_id.to_string(),
                status: "error".to_string(),
                node_count: 0,
                edge_count: 0,
                languages: Vec::new(),
                error: error.to_string(),
            };
        }

        tracing::info!(
            project_id = project_id,
            nodes = node_count,
            edges = edge_count,
            "code graph built"
        );
        GraphBuildResult {
            project_id: project_id.to_string(),
            status: "ready".to_string(),
            node_count,
            edge_count,
            languages,
            error: String::new(),
        }
    }
}

fn node_id(project_id: &str, filepath: &str, symbol: &str) -> String {
    format!("{project_id}:{filepath}:{symbol}")
}

fn extract_from_file(
    ctx: &mut BuildContext,
    root: Node<'_>,
    source: &[u8],
    rel_path: &str,
    language: &str,
) {
    let def_types = def_node_types(language);
    walk_definitions(ctx, root, source, rel_path, language, def_types, 0);

    // One synthetic module node per file anchors imports and call edges.
    let module_id = node_id(&ctx.project_id, rel_path, "__module__");
    ctx.nodes.push(GraphNodeRecord {
        node_id: module_id.clone(),
        filepath: rel_path.to_string(),
        symbol_name: "__module__".to_string(),
        kind: "module".to_string(),
        start_line: 1,
        end_line: 1,
    });

    let import_types = import_node_types(language);
    if import_types.is_empty() {
        return;
    }
    for child in children_of(root) {
        if !import_types.contains(&child.kind()) {
            continue;
        }
        for module_name in extract_import_names(child, source, language) {
            ctx.edges.push(GraphEdgeRecord {
                source_id: module_id.clone(),
                target_id: format!("{}:__import__:{module_name}", ctx.project_id),
                kind: "imports".to_string(),
            });
        }
    }
}

fn walk_definitions(
    ctx: &mut BuildContext,
    node: Node<'_>,
    source: &[u8],
    rel_path: &str,
    language: &str,
    def_types: &[&str],
    depth: usize,
) {
    if depth > 2 {
        return;
    }
    for child in children_of(node) {
        if def_types.contains(&child.kind()) {
            let name = extract_def_name(child, source);
            if !name.is_empty() {
                let id = node_id(&ctx.project_id, rel_path, &name);
                ctx.nodes.push(GraphNodeRecord {
                    node_id: id.clone(),
                    filepath: rel_path.to_string(),
                    symbol_name: name.clone(),
                    kind: kind_for_node(child.kind()).to_string(),
                    start_line: child.start_position().row + 1,
                    end_line: child.end_position().row + 1,
                });
                ctx.name_to_ids
                    .entry(name)
                    .or_default()
                    .push((id, rel_path.to_string()));
            }
        }
        if child.kind() == "export_statement" || BODY_NODE_TYPES.contains(&child.kind()) {
            walk_definitions(ctx, child, source, rel_path, language, def_types, depth + 1);
        }
    }
}

/// Name-matching call heuristic: every file's module node gains a `calls`
/// edge to each name defined elsewhere. Known imprecision — this
/// over-connects the graph; reference-site resolution would be tighter.
fn resolve_call_edges(ctx: &mut BuildContext) {
    let files: HashSet<&str> = ctx.nodes.iter().map(|n| n.filepath.as_str()).collect();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    let mut new_edges = Vec::new();
    for filepath in files {
        let module_id = node_id(&ctx.project_id, filepath, "__module__");
        for (callee_name, callee_ids) in &ctx.name_to_ids {
            if callee_name.len() < 2 {
                continue;
            }
            for (callee_id, callee_file) in callee_ids {
                if callee_file == filepath {
                    continue;
                }
                let key = (module_id.clone(), callee_id.clone());
                if seen.insert(key) {
                    new_edges.push(GraphEdgeRecord {
                        source_id: module_id.clone(),
                        target_id: callee_id.clone(),
                        kind: "calls".to_string(),
                    });
                }
            }
        }
    }
    ctx.edges.extend(new_edges);
}

/// Replace the project's stored graph in one transaction. Edges with missing
/// endpoints are dropped.
fn persist(ctx: &BuildContext, db: &Database) -> Result<(), DbError> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    tx.execute("DELETE FROM graph_edges WHERE project_id = ?1", params![ctx.project_id])?;
    tx.execute("DELETE FROM graph_nodes WHERE project_id = ?1", params![ctx.project_id])?;

    {
        let mut insert_node = tx.prepare(
            "INSERT INTO graph_nodes (id, project_id, filepath, symbol_name, kind, start_line, end_line)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO NOTHING",
        )?;
        for node in &ctx.nodes {
            insert_node.execute(params![
                node.node_id,
                ctx.project_id,
                node.filepath,
                node.symbol_name,
                node.kind,
                node.start_line as i64,
                node.end_line as i64,
            ])?;
        }
    }

    let node_ids: HashSet<&str> = ctx.nodes.iter().map(|n| n.node_id.as_str()).collect();
    let valid_edges: Vec<&GraphEdgeRecord> = ctx
        .edges
        .iter()
        .filter(|e| node_ids.contains(e.source_id.as_str()) && node_ids.contains(e.target_id.as_str()))
        .collect();

    {
        let mut insert_edge = tx.prepare(
            "INSERT INTO graph_edges (project_id, source_id, target_id, kind) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for edge in &valid_edges {
            insert_edge.execute(params![ctx.project_id, edge.source_id, edge.target_id, edge.kind])?;
        }
    }

    let mut languages: Vec<String> = ctx.languages.iter().cloned().collect();
    languages.sort();
    tx.execute(
        "INSERT INTO graph_metadata (project_id, status, node_count, edge_count, languages, built_at)
         VALUES (?1, 'ready', ?2, ?3, ?4, ?5)
         ON CONFLICT (project_id) DO UPDATE SET
             status = excluded.status,
             node_count = excluded.node_count,
             edge_count = excluded.edge_count,
             languages = excluded.languages,
             built_at = excluded.built_at",
        params![
            ctx.project_id,
            ctx.nodes.len() as i64,
            valid_edges.len() as i64,
            serde_json::to_string(&languages).unwrap_or_else(|_| "[]".to_string()),
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;

    tx.commit()?;
    Ok(())
}

// ─── GraphSearcher ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct NodeInfo {
    filepath: String,
    symbol_name: String,
    kind: String,
    start_line: usize,
    end_line: usize,
}

/// BFS-based graph search with hop-decay scoring.
#[derive(Debug, Default)]
pub struct GraphSearcher;

impl GraphSearcher {
    pub fn new() -> Self {
        Self
    }

    /// Find symbols related to the seeds within `max_hops`, scored by
    /// `hop_decay^distance` and sorted by (-score, distance, filepath).
    pub fn search(
        &self,
        project_id: &str,
        seed_symbols: &[String],
        max_hops: usize,
        top_k: usize,
        hop_decay: f64,
        db: &Database,
    ) -> Vec<GraphSearchHit> {
        match self.search_inner(project_id, seed_symbols, max_hops, top_k, hop_decay, db) {
            Ok(hits) => hits,
            Err(error) => {
                tracing::error!(project_id = project_id, error = %error, "graph search failed");
                Vec::new()
            }
        }
    }

    fn search_inner(
        &self,
        project_id: &str,
        seed_symbols: &[String],
        max_hops: usize,
        top_k: usize,
        hop_decay: f64,
        db: &Database,
    ) -> Result<Vec<GraphSearchHit>, DbError> {
        if seed_symbols.is_empty() {
            return Ok(Vec::new());
        }

        let conn = db.lock()?;

        // Seed nodes by symbol name.
        let placeholders = vec!["?"; seed_symbols.len()].join(",");
        let query = format!(
            "SELECT id, filepath, symbol_name, kind, start_line, end_line
             FROM graph_nodes WHERE project_id = ?1 AND symbol_name IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&query)?;
        let mut bindings: Vec<&dyn rusqlite::ToSql> = vec![&project_id];
        for symbol in seed_symbols {
            bindings.push(symbol);
        }
        let mut node_info: HashMap<String, NodeInfo> = HashMap::new();
        let mut seed_ids: HashSet<String> = HashSet::new();
        let rows = stmt.query_map(&bindings[..], |row| {
            Ok((
                row.get::<_, String>(0)?,
                NodeInfo {
                    filepath: row.get(1)?,
                    symbol_name: row.get(2)?,
                    kind: row.get(3)?,
                    start_line: row.get::<_, i64>(4)? as usize,
                    end_line: row.get::<_, i64>(5)? as usize,
                },
            ))
        })?;
        for row in rows {
            let (id, info) = row?;
            seed_ids.insert(id.clone());
            node_info.insert(id, info);
        }
        if seed_ids.is_empty() {
            tracing::info!(project_id = project_id, seeds = ?seed_symbols, "no seed nodes found");
            return Ok(Vec::new());
        }

        // BFS over bidirectional edges; first visit wins the distance.
        let mut distance: HashMap<String, usize> = HashMap::new();
        let mut edge_paths: HashMap<String, Vec<String>> = HashMap::new();
        let mut visited: HashSet<String> = seed_ids.clone();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        for id in &seed_ids {
            distance.insert(id.clone(), 0);
            edge_paths.insert(id.clone(), Vec::new());
            queue.push_back((id.clone(), 0));
        }

        let mut outgoing_stmt = conn.prepare(
            "SELECT target_id, kind FROM graph_edges WHERE source_id = ?1 AND project_id = ?2",
        )?;
        let mut incoming_stmt = conn.prepare(
            "SELECT source_id, kind FROM graph_edges WHERE target_id = ?1 AND project_id = ?2",
        )?;
        let mut node_stmt = conn.prepare(
            "SELECT filepath, symbol_name, kind, start_line, end_line FROM graph_nodes WHERE id = ?1",
        )?;

        while let Some((current_id, current_dist)) = queue.pop_front() {
            if current_dist >= max_hops {
                continue;
            }
            let current_name = node_info
                .get(&current_id)
                .map(|i| i.symbol_name.clone())
                .unwrap_or_else(|| current_id.clone());

            let mut neighbors: Vec<(String, String, bool)> = Vec::new();
            let outgoing = outgoing_stmt.query_map(params![current_id, project_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in outgoing {
                let (target, kind) = row?;
                neighbors.push((target, kind, true));
            }
            let incoming = incoming_stmt.query_map(params![current_id, project_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in incoming {
                let (source, kind) = row?;
                neighbors.push((source, kind, false));
            }

            for (neighbor_id, edge_kind, outward) in neighbors {
                if !visited.insert(neighbor_id.clone()) {
                    continue;
                }
                let new_dist = current_dist + 1;
                distance.insert(neighbor_id.clone(), new_dist);

                let neighbor_name = neighbor_id.rsplit(':').next().unwrap_or(&neighbor_id);
                let breadcrumb = if outward {
                    format!("{current_name}-{edge_kind}->{neighbor_name}")
                } else {
                    format!("{neighbor_name}-{edge_kind}->{current_name}")
                };
                let mut path = edge_paths.get(&current_id).cloned().unwrap_or_default();
                path.push(breadcrumb);
                edge_paths.insert(neighbor_id.clone(), path);

                if !node_info.contains_key(&neighbor_id) {
                    let mut rows = node_stmt.query_map(params![neighbor_id], |row| {
                        Ok(NodeInfo {
                            filepath: row.get(0)?,
                            symbol_name: row.get(1)?,
                            kind: row.get(2)?,
                            start_line: row.get::<_, i64>(3)? as usize,
                            end_line: row.get::<_, i64>(4)? as usize,
                        })
                    })?;
                    if let Some(info) = rows.next().transpose()? {
                        node_info.insert(neighbor_id.clone(), info);
                    }
                }

                queue.push_back((neighbor_id, new_dist));
            }
        }

        let mut hits: Vec<GraphSearchHit> = distance
            .iter()
            .filter(|(id, _)| !seed_ids.contains(*id))
            .filter_map(|(id, &dist)| {
                let info = node_info.get(id)?;
                Some(GraphSearchHit {
                    filepath: info.filepath.clone(),
                    symbol_name: info.symbol_name.clone(),
                    kind: info.kind.clone(),
                    start_line: info.start_line,
                    end_line: info.end_line,
                    distance: dist,
                    score: hop_decay.powi(dist as i32),
                    edge_path: edge_paths.get(id).cloned().unwrap_or_default(),
                    project_id: String::new(),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.distance.cmp(&b.distance))
                .then(a.filepath.cmp(&b.filepath))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> tempfile::TempDir {
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(
            ws.path().join("service.py"),
            "import helpers\n\nclass UserService:\n    def get_user(self, user_id):\n        return find_user(user_id)\n",
        )
        .unwrap();
        std::fs::write(
            ws.path().join("helpers.py"),
            "def find_user(user_id):\n    return None\n",
        )
        .unwrap();
        ws
    }

    use std::path::Path;

    fn build(ws: &Path) -> (Database, GraphBuildResult) {
        let db = Database::in_memory().unwrap();
        let result = CodeGraphBuilder::new().build_graph("p1", ws, &db);
        (db, result)
    }

    #[test]
    fn build_extracts_nodes_and_edges() {
        let ws = workspace();
        let (db, result) = build(ws.path());

        assert_eq!(result.status, "ready");
        assert_eq!(result.languages, vec!["python"]);
        // UserService, get_user, find_user + two module nodes.
        assert!(result.node_count >= 5, "node_count = {}", result.node_count);

        let conn = db.lock().unwrap();
        let node_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM graph_nodes WHERE project_id = 'p1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(node_count as usize, result.node_count);

        // Persisted edges all have both endpoints.
        let dangling: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM graph_edges e
                 WHERE NOT EXISTS (SELECT 1 FROM graph_nodes n WHERE n.id = e.source_id)
                    OR NOT EXISTS (SELECT 1 FROM graph_nodes n WHERE n.id = e.target_id)",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(dangling, 0);

        let metadata_status: String = conn
            .query_row(
                "SELECT status FROM graph_metadata WHERE project_id = 'p1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(metadata_status, "ready");
    }

    #[test]
    fn rebuild_replaces_previous_graph() {
        let ws = workspace();
        let (db, first) = build(ws.path());
        let second = CodeGraphBuilder::new().build_graph("p1", ws.path(), &db);
        assert_eq!(first.node_count, second.node_count);

        let conn = db.lock().unwrap();
        let node_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM graph_nodes WHERE project_id = 'p1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(node_count as usize, second.node_count, "no duplicate rows after rebuild");
    }

    #[test]
    fn search_finds_related_symbols_with_decay() {
        let ws = workspace();
        let (db, _) = build(ws.path());

        let hits = GraphSearcher::new().search(
            "p1",
            &["find_user".to_string()],
            2,
            10,
            DEFAULT_HOP_DECAY,
            &db,
        );
        assert!(!hits.is_empty());
        for hit in &hits {
            assert!(hit.distance >= 1 && hit.distance <= 2);
            let expected = DEFAULT_HOP_DECAY.powi(hit.distance as i32);
            assert!((hit.score - expected).abs() < 1e-12);
        }
        // Sorted by (-score, distance, filepath).
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        // The module that calls find_user sits one hop away.
        assert!(hits.iter().any(|h| h.distance == 1));
    }

    #[test]
    fn search_unknown_seed_is_empty() {
        let ws = workspace();
        let (db, _) = build(ws.path());
        let hits = GraphSearcher::new().search(
            "p1",
            &["no_such_symbol".to_string()],
            2,
            10,
            DEFAULT_HOP_DECAY,
            &db,
        );
        assert!(hits.is_empty());
    }

    #[test]
    fn search_respects_top_k() {
        let ws = workspace();
        let (db, _) = build(ws.path());
        let hits = GraphSearcher::new().search(
            "p1",
            &["find_user".to_string()],
            3,
            2,
            DEFAULT_HOP_DECAY,
            &db,
        );
        assert!(hits.len() <= 2);
    }

    #[test]
    fn empty_seeds_return_empty() {
        let db = Database::in_memory().unwrap();
        let hits = GraphSearcher::new().search("p1", &[], 2, 10, DEFAULT_HOP_DECAY, &db);
        assert!(hits.is_empty());
    }
}
