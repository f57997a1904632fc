//! Hybrid retrieval engine combining BM25 keyword search with semantic
//! embeddings.
//!
//! Source files are chunked at definition boundaries via tree-sitter. Each
//! project keeps an in-memory index of chunks, a BM25 index, an embedding
//! matrix, and per-file content hashes for incremental rebuilds. Search fuses
//! the BM25 and cosine rankings with Reciprocal Rank Fusion.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::llm::LlmProvider;
use crate::models::RetrievalSearchHit;

use super::treesitter::{
    children_of, collect_files, def_node_types, extract_def_name, parse_source, SourceFile,
};

const DEFAULT_MAX_CHUNK_LINES: usize = 100;
const RRF_K: f64 = 60.0;
const BM25_K1: f64 = 1.5;
const BM25_B: f64 = 0.75;

// ─── CodeChunk ───────────────────────────────────────────────────────────────

/// A contiguous block of source code extracted from a file. Lines are
/// 1-based and inclusive.
#[derive(Debug, Clone)]
pub struct CodeChunk {
    pub filepath: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub language: String,
    pub symbol_name: String,
}

// ─── CodeChunker ─────────────────────────────────────────────────────────────

/// Splits source files into chunks at definition boundaries.
pub struct CodeChunker {
    max_chunk_lines: usize,
}

impl CodeChunker {
    pub fn new() -> Self {
        Self {
            max_chunk_lines: DEFAULT_MAX_CHUNK_LINES,
        }
    }

    /// Walk the workspace and chunk all recognised source files.
    pub fn chunk_workspace(&self, workspace: &Path, extensions: &[String]) -> Vec<CodeChunk> {
        let filter = extension_filter(extensions);
        let mut chunks = Vec::new();
        for file in collect_files(workspace) {
            if let Some(filter) = &filter {
                let ext = Path::new(&file.rel_path)
                    .extension()
                    .and_then(|e| e.to_str())
                    .unwrap_or_default();
                if !filter.contains(ext) {
                    continue;
                }
            }
            chunks.extend(self.chunk_file(&file));
        }
        chunks
    }

    /// Parse a single file and split at top-level definition boundaries,
    /// emitting gap chunks for interstitial code. Files without definitions
    /// become one whole-file chunk.
    pub fn chunk_file(&self, file: &SourceFile) -> Vec<CodeChunk> {
        let Ok(source) = std::fs::read(&file.abs_path) else {
            tracing::warn!(path = %file.abs_path.display(), "cannot read file");
            return Vec::new();
        };
        let Some(tree) = parse_source(file.language, &source) else {
            tracing::warn!(path = %file.rel_path, "parse failed");
            return Vec::new();
        };

        let text = String::from_utf8_lossy(&source);
        let lines: Vec<&str> = text.split_inclusive('\n').collect();
        if lines.is_empty() {
            return Vec::new();
        }

        // Top-level definition spans (0-based start/end rows), including
        // export_statement wrappers.
        let def_types = def_node_types(file.language);
        let mut definitions: Vec<(usize, usize, String)> = Vec::new();
        for child in children_of(tree.root_node()) {
            if def_types.contains(&child.kind()) {
                let name = extract_def_name(child, &source);
                definitions.push((child.start_position().row, child.end_position().row, name));
            } else if child.kind() == "export_statement" {
                for grandchild in children_of(child) {
                    if def_types.contains(&grandchild.kind()) {
                        let name = extract_def_name(grandchild, &source);
                        definitions.push((
                            grandchild.start_position().row,
                            grandchild.end_position().row,
                            name,
                        ));
                    }
                }
            }
        }
        definitions.sort_by_key(|d| d.0);

        let mut chunks = Vec::new();
        let mut covered = 0usize;

        for (start, end, name) in &definitions {
            let (start, end) = (*start, *end);
            if start > covered {
                push_if_nonblank(&mut chunks, file, &lines, covered, start - 1, "");
            }

            let span = end - start + 1;
            if span > self.max_chunk_lines {
                // Split oversized definitions into equal sub-chunks.
                let mut offset = 0;
                let mut part = 1;
                while offset < span {
                    let sub_start = start + offset;
                    let sub_end = (sub_start + self.max_chunk_lines - 1).min(end);
                    let symbol = if name.is_empty() {
                        String::new()
                    } else {
                        format!("{name} (part {part})")
                    };
                    push_if_nonblank(&mut chunks, file, &lines, sub_start, sub_end, &symbol);
                    offset += self.max_chunk_lines;
                    part += 1;
                }
            } else {
                push_if_nonblank(&mut chunks, file, &lines, start, end, name);
            }
            covered = end + 1;
        }

        if covered < lines.len() {
            push_if_nonblank(&mut chunks, file, &lines, covered, lines.len() - 1, "");
        }

        // Fallback: no definitions at all -> one whole-file chunk.
        if definitions.is_empty() {
            chunks.clear();
            push_if_nonblank(&mut chunks, file, &lines, 0, lines.len() - 1, "");
        }

        chunks
    }
}

impl Default for CodeChunker {
    fn default() -> Self {
        Self::new()
    }
}

fn push_if_nonblank(
    chunks: &mut Vec<CodeChunk>,
    file: &SourceFile,
    lines: &[&str],
    start_0: usize,
    end_0: usize,
    symbol: &str,
) {
    let end_0 = end_0.min(lines.len().saturating_sub(1));
    if start_0 > end_0 {
        return;
    }
    let content: String = lines[start_0..=end_0].concat();
    if content.trim().is_empty() {
        return;
    }
    chunks.push(CodeChunk {
        filepath: file.rel_path.clone(),
        start_line: start_0 + 1,
        end_line: end_0 + 1,
        content,
        language: file.language.to_string(),
        symbol_name: symbol.to_string(),
    });
}

fn extension_filter(extensions: &[String]) -> Option<HashSet<String>> {
    if extensions.is_empty() {
        return None;
    }
    Some(
        extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_string())
            .collect(),
    )
}

// ─── BM25 ────────────────────────────────────────────────────────────────────

/// Lowercase alphanumeric/underscore tokenizer shared by index and queries.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Okapi BM25 index over a fixed corpus.
#[derive(Debug, Default)]
pub struct Bm25Index {
    term_frequencies: Vec<HashMap<String, usize>>,
    doc_lens: Vec<usize>,
    doc_frequencies: HashMap<String, usize>,
    avg_len: f64,
}

impl Bm25Index {
    pub fn build(corpus: &[&str]) -> Self {
        let mut term_frequencies = Vec::with_capacity(corpus.len());
        let mut doc_lens = Vec::with_capacity(corpus.len());
        let mut doc_frequencies: HashMap<String, usize> = HashMap::new();

        for doc in corpus {
            let tokens = tokenize(doc);
            doc_lens.push(tokens.len());
            let mut tf: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0) += 1;
            }
            for term in tf.keys() {
                *doc_frequencies.entry(term.clone()).or_insert(0) += 1;
            }
            term_frequencies.push(tf);
        }

        let avg_len = if doc_lens.is_empty() {
            0.0
        } else {
            doc_lens.iter().sum::<usize>() as f64 / doc_lens.len() as f64
        };

        Self {
            term_frequencies,
            doc_lens,
            doc_frequencies,
            avg_len,
        }
    }

    pub fn len(&self) -> usize {
        self.term_frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.term_frequencies.is_empty()
    }

    /// BM25 scores for every document.
    pub fn scores(&self, query: &str) -> Vec<f64> {
        let n = self.len();
        let mut scores = vec![0.0; n];
        if n == 0 || self.avg_len == 0.0 {
            return scores;
        }

        for term in tokenize(query) {
            let Some(&df) = self.doc_frequencies.get(&term) else {
                continue;
            };
            let idf = (1.0 + (n as f64 - df as f64 + 0.5) / (df as f64 + 0.5)).ln();
            for (i, tf_map) in self.term_frequencies.iter().enumerate() {
                let tf = *tf_map.get(&term).unwrap_or(&0) as f64;
                if tf == 0.0 {
                    continue;
                }
                let norm = 1.0 - BM25_B + BM25_B * self.doc_lens[i] as f64 / self.avg_len;
                scores[i] += idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm);
            }
        }
        scores
    }

    /// Document indices ranked by descending score, ties by index.
    pub fn ranking(&self, query: &str) -> Vec<usize> {
        rank_descending(&self.scores(query))
    }
}

/// Indices sorted by descending score; ties keep ascending index order.
fn rank_descending(scores: &[f64]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..scores.len()).collect();
    indices.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    indices
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

/// Reciprocal Rank Fusion of two rankings; returns (doc, score) sorted by
/// descending fused score.
fn rrf_fuse(bm25_ranking: &[usize], semantic_ranking: &[usize]) -> Vec<(usize, f64)> {
    let mut scores: HashMap<usize, f64> = HashMap::new();
    for (rank, &doc) in bm25_ranking.iter().enumerate() {
        *scores.entry(doc).or_insert(0.0) += 1.0 / (RRF_K + rank as f64 + 1.0);
    }
    for (rank, &doc) in semantic_ranking.iter().enumerate() {
        *scores.entry(doc).or_insert(0.0) += 1.0 / (RRF_K + rank as f64 + 1.0);
    }
    let mut fused: Vec<(usize, f64)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    fused
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

// ─── ProjectIndex ────────────────────────────────────────────────────────────

/// In-memory index for a single project. Chunks, BM25 postings, and
/// embedding rows are parallel arrays.
pub struct ProjectIndex {
    pub project_id: String,
    pub chunks: Vec<CodeChunk>,
    pub bm25: Bm25Index,
    pub embeddings: Vec<Vec<f32>>,
    pub file_hashes: HashMap<String, u64>,
    pub file_count: usize,
    pub embedding_model: String,
}

/// Status report for an index build.
#[derive(Debug, Clone, Default)]
pub struct IndexStatus {
    pub project_id: String,
    pub status: String,
    pub file_count: usize,
    pub chunk_count: usize,
    pub embedding_model: String,
    pub error: String,
    pub incremental: bool,
    pub files_changed: usize,
    pub files_unchanged: usize,
}

// ─── HybridRetriever ─────────────────────────────────────────────────────────

/// Per-project hybrid BM25 + embedding retrieval with incremental indexing.
pub struct HybridRetriever {
    indexes: RwLock<HashMap<String, Arc<ProjectIndex>>>,
    chunker: CodeChunker,
    llm: Arc<dyn LlmProvider>,
}

impl HybridRetriever {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            indexes: RwLock::new(HashMap::new()),
            chunker: CodeChunker::new(),
            llm,
        }
    }

    /// Chunk the workspace, build the BM25 index, and compute embeddings.
    ///
    /// A second build for the same project with an unchanged embedding model
    /// is incremental: unchanged files keep their chunks and embeddings, only
    /// changed or new files are re-chunked and re-embedded.
    pub async fn build_index(
        &self,
        project_id: &str,
        workspace: &Path,
        embedding_model: &str,
        extensions: &[String],
    ) -> IndexStatus {
        tracing::info!(project_id = project_id, workspace = %workspace.display(), "building retrieval index");

        let previous = {
            let indexes = self.indexes.read().await;
            indexes.get(project_id).cloned()
        };
        let previous = previous.filter(|p| p.embedding_model == embedding_model);

        match self
            .build_index_inner(project_id, workspace, embedding_model, extensions, previous)
            .await
        {
            Ok((index, status)) => {
                self.indexes
                    .write()
                    .await
                    .insert(project_id.to_string(), Arc::new(index));
                tracing::info!(
                    project_id = project_id,
                    files = status.file_count,
                    chunks = status.chunk_count,
                    incremental = status.incremental,
                    "index built"
                );
                status
            }
            Err(error) => {
                tracing::error!(project_id = project_id, error = %error, "index build failed");
                IndexStatus {
                    project_id: project_id.to_string(),
                    status: "error".to_string(),
                    error,
                    ..Default::default()
                }
            }
        }
    }

    async fn build_index_inner(
        &self,
        project_id: &str,
        workspace: &Path,
        embedding_model: &str,
        extensions: &[String],
        previous: Option<Arc<ProjectIndex>>,
    ) -> Result<(ProjectIndex, IndexStatus), String> {
        let filter = extension_filter(extensions);
        let files: Vec<SourceFile> = collect_files(workspace)
            .into_iter()
            .filter(|f| match &filter {
                Some(filter) => {
                    let ext = Path::new(&f.rel_path)
                        .extension()
                        .and_then(|e| e.to_str())
                        .unwrap_or_default();
                    filter.contains(ext)
                }
                None => true,
            })
            .collect();

        // Old chunk rows grouped by file, for reuse on incremental builds.
        let old_rows_by_file: HashMap<&str, Vec<usize>> = previous
            .as_deref()
            .map(|prev| {
                let mut map: HashMap<&str, Vec<usize>> = HashMap::new();
                for (i, chunk) in prev.chunks.iter().enumerate() {
                    map.entry(chunk.filepath.as_str()).or_default().push(i);
                }
                map
            })
            .unwrap_or_default();

        enum FileChunks {
            Reused(Vec<usize>),
            Fresh(Vec<CodeChunk>),
        }

        let mut per_file: Vec<FileChunks> = Vec::with_capacity(files.len());
        let mut file_hashes: HashMap<String, u64> = HashMap::new();
        let mut files_changed = 0usize;
        let mut files_unchanged = 0usize;
        let mut fresh_contents: Vec<String> = Vec::new();

        for file in &files {
            let hash = std::fs::read(&file.abs_path)
                .map(|bytes| content_hash(&bytes))
                .unwrap_or(0);
            file_hashes.insert(file.rel_path.clone(), hash);

            let reusable = previous
                .as_deref()
                .and_then(|prev| prev.file_hashes.get(&file.rel_path))
                .map(|old_hash| *old_hash == hash)
                .unwrap_or(false);

            if reusable {
                files_unchanged += 1;
                per_file.push(FileChunks::Reused(
                    old_rows_by_file
                        .get(file.rel_path.as_str())
                        .cloned()
                        .unwrap_or_default(),
                ));
            } else {
                files_changed += 1;
                let chunks = self.chunker.chunk_file(file);
                fresh_contents.extend(chunks.iter().map(|c| c.content.clone()));
                per_file.push(FileChunks::Fresh(chunks));
            }
        }

        let incremental = previous.is_some();
        if per_file.is_empty() {
            return Ok((
                ProjectIndex {
                    project_id: project_id.to_string(),
                    chunks: Vec::new(),
                    bm25: Bm25Index::default(),
                    embeddings: Vec::new(),
                    file_hashes,
                    file_count: 0,
                    embedding_model: embedding_model.to_string(),
                },
                IndexStatus {
                    project_id: project_id.to_string(),
                    status: "empty".to_string(),
                    embedding_model: embedding_model.to_string(),
                    incremental,
                    files_changed,
                    files_unchanged,
                    ..Default::default()
                },
            ));
        }

        let fresh_embeddings = if fresh_contents.is_empty() {
            Vec::new()
        } else {
            self.llm
                .embed(&fresh_contents, embedding_model)
                .await
                .map_err(|e| e.to_string())?
        };
        if fresh_embeddings.len() != fresh_contents.len() {
            return Err(format!(
                "embedding count mismatch: {} texts, {} vectors",
                fresh_contents.len(),
                fresh_embeddings.len()
            ));
        }

        let mut chunks: Vec<CodeChunk> = Vec::new();
        let mut embeddings: Vec<Vec<f32>> = Vec::new();
        let mut fresh_iter = fresh_embeddings.into_iter();
        for entry in per_file {
            match entry {
                FileChunks::Reused(rows) => {
                    if let Some(prev) = previous.as_deref() {
                        for row in rows {
                            chunks.push(prev.chunks[row].clone());
                            embeddings.push(prev.embeddings[row].clone());
                        }
                    }
                }
                FileChunks::Fresh(fresh) => {
                    for chunk in fresh {
                        chunks.push(chunk);
                        embeddings.push(fresh_iter.next().unwrap_or_default());
                    }
                }
            }
        }

        if chunks.is_empty() {
            return Ok((
                ProjectIndex {
                    project_id: project_id.to_string(),
                    chunks: Vec::new(),
                    bm25: Bm25Index::default(),
                    embeddings: Vec::new(),
                    file_hashes,
                    file_count: files.len(),
                    embedding_model: embedding_model.to_string(),
                },
                IndexStatus {
                    project_id: project_id.to_string(),
                    status: "empty".to_string(),
                    embedding_model: embedding_model.to_string(),
                    incremental,
                    files_changed,
                    files_unchanged,
                    ..Default::default()
                },
            ));
        }

        let corpus: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        let bm25 = Bm25Index::build(&corpus);
        let file_count = files.len();
        let chunk_count = chunks.len();

        Ok((
            ProjectIndex {
                project_id: project_id.to_string(),
                chunks,
                bm25,
                embeddings,
                file_hashes,
                file_count,
                embedding_model: embedding_model.to_string(),
            },
            IndexStatus {
                project_id: project_id.to_string(),
                status: "ready".to_string(),
                file_count,
                chunk_count,
                embedding_model: embedding_model.to_string(),
                error: String::new(),
                incremental,
                files_changed,
                files_unchanged,
            },
        ))
    }

    /// Hybrid search over a project's index. Returns an empty list for
    /// unknown projects.
    pub async fn search(
        &self,
        project_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalSearchHit>, String> {
        let index = {
            let indexes = self.indexes.read().await;
            indexes.get(project_id).cloned()
        };
        let Some(index) = index else {
            tracing::warn!(project_id = project_id, "no index for project");
            return Ok(Vec::new());
        };

        let n = index.chunks.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let effective_k = top_k.min(n);

        let bm25_ranking = index.bm25.ranking(query);

        let query_embedding = self
            .llm
            .embed(&[query.to_string()], &index.embedding_model)
            .await
            .map_err(|e| e.to_string())?;
        let query_vec = query_embedding.first().cloned().unwrap_or_default();
        let cosine_scores: Vec<f64> = index
            .embeddings
            .iter()
            .map(|row| cosine_similarity(&query_vec, row))
            .collect();
        let semantic_ranking = rank_descending(&cosine_scores);

        let bm25_pos: HashMap<usize, usize> =
            bm25_ranking.iter().enumerate().map(|(pos, &doc)| (doc, pos)).collect();
        let semantic_pos: HashMap<usize, usize> =
            semantic_ranking.iter().enumerate().map(|(pos, &doc)| (doc, pos)).collect();

        let fused = rrf_fuse(&bm25_ranking, &semantic_ranking);

        Ok(fused
            .into_iter()
            .take(effective_k)
            .map(|(doc, score)| {
                let chunk = &index.chunks[doc];
                RetrievalSearchHit {
                    filepath: chunk.filepath.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    content: chunk.content.clone(),
                    language: chunk.language.clone(),
                    symbol_name: chunk.symbol_name.clone(),
                    score,
                    bm25_rank: bm25_pos.get(&doc).map(|p| p + 1).unwrap_or(n),
                    semantic_rank: semantic_pos.get(&doc).map(|p| p + 1).unwrap_or(n),
                    project_id: index.project_id.clone(),
                }
            })
            .collect())
    }

    /// Status of a project's index.
    pub async fn get_index_status(&self, project_id: &str) -> IndexStatus {
        let indexes = self.indexes.read().await;
        match indexes.get(project_id) {
            Some(index) => IndexStatus {
                project_id: project_id.to_string(),
                status: "ready".to_string(),
                file_count: index.file_count,
                chunk_count: index.chunks.len(),
                embedding_model: index.embedding_model.clone(),
                ..Default::default()
            },
            None => IndexStatus {
                project_id: project_id.to_string(),
                status: "not_found".to_string(),
                ..Default::default()
            },
        }
    }

    /// Remove a project's index from memory.
    pub async fn drop_index(&self, project_id: &str) -> bool {
        self.indexes.write().await.remove(project_id).is_some()
    }
}
