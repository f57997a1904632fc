//! SQLite storage for the code graph and agent memories.
//!
//! A single [`rusqlite::Connection`] wrapped in an `Arc<Mutex<…>>` keeps the
//! handle `Send + Sync` while respecting SQLite's single-writer requirement.
//! The schema is applied on open so tests run against `:memory:` databases
//! without a migration step.

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database open failed: {0}")]
    Open(String),
    #[error("database error: {0}")]
    Query(String),
    #[error("database lock poisoned")]
    Lock,
}

impl From<rusqlite::Error> for DbError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Query(error.to_string())
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS graph_nodes (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL,
    filepath TEXT NOT NULL,
    symbol_name TEXT NOT NULL,
    kind TEXT NOT NULL,
    start_line INTEGER NOT NULL DEFAULT 0,
    end_line INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_project ON graph_nodes (project_id);
CREATE INDEX IF NOT EXISTS idx_graph_nodes_symbol ON graph_nodes (project_id, symbol_name);

CREATE TABLE IF NOT EXISTS graph_edges (
    project_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    kind TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_graph_edges_source ON graph_edges (project_id, source_id);
CREATE INDEX IF NOT EXISTS idx_graph_edges_target ON graph_edges (project_id, target_id);

CREATE TABLE IF NOT EXISTS graph_metadata (
    project_id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    node_count INTEGER NOT NULL DEFAULT 0,
    edge_count INTEGER NOT NULL DEFAULT 0,
    languages TEXT NOT NULL DEFAULT '[]',
    built_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_memories (
    id TEXT PRIMARY KEY NOT NULL,
    tenant_id TEXT NOT NULL DEFAULT '',
    project_id TEXT NOT NULL,
    agent_id TEXT NOT NULL DEFAULT '',
    run_id TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL,
    kind TEXT NOT NULL,
    importance REAL NOT NULL DEFAULT 0.5,
    embedding BLOB,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_agent_memories_project ON agent_memories (project_id, created_at);
"#;

/// Shared database handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open the database at `url` and apply the schema.
    ///
    /// Accepts plain file paths, `sqlite://` URLs, and `:memory:`.
    pub fn open(url: &str) -> Result<Self, DbError> {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);

        let conn = if path == ":memory:" {
            Connection::open_in_memory().map_err(|e| DbError::Open(e.to_string()))?
        } else {
            Connection::open(path).map_err(|e| DbError::Open(e.to_string()))?
        };

        if path != ":memory:" {
            // WAL for concurrent read performance; query_row because the
            // PRAGMA returns a result row.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
                .map_err(|e| DbError::Open(e.to_string()))?;
        }
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| DbError::Open(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self, DbError> {
        Self::open(":memory:")
    }

    /// Acquire the connection lock.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Lock)
    }
}
