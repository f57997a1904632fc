//! Wire types exchanged with the control plane.
//!
//! The control plane serializes nil maps and slices as `null`; every
//! collection field here tolerates that via [`null_default`].

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize `null` as the type's default (Go nil slices/maps).
pub fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ─── Tasks ───────────────────────────────────────────────────────────────────

/// Status of a task in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Message received when a task is assigned to this worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub prompt: String,
    #[serde(default, deserialize_with = "null_default")]
    pub config: HashMap<String, String>,
}

/// Result published after task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, deserialize_with = "null_default")]
    pub files: Vec<String>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

// ─── Run protocol ────────────────────────────────────────────────────────────

fn default_max_steps() -> u32 {
    50
}
fn default_timeout_seconds() -> u64 {
    600
}
fn default_max_cost() -> f64 {
    5.0
}

/// Termination bounds received from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminationConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_cost")]
    pub max_cost: f64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            timeout_seconds: default_timeout_seconds(),
            max_cost: default_max_cost(),
        }
    }
}

fn default_entry_kind() -> String {
    "file".to_string()
}
fn default_priority() -> i32 {
    50
}

/// A pre-packed body of auxiliary text delivered with a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    #[serde(default = "default_entry_kind")]
    pub kind: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tokens: usize,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

/// Agent mode metadata: tool allow/deny sets, prompt prefix, scenario tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub prompt_prefix: String,
    #[serde(default, deserialize_with = "null_default")]
    pub tools: Vec<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub denied_tools: Vec<String>,
    #[serde(default, deserialize_with = "null_default")]
    pub denied_actions: Vec<String>,
    #[serde(default)]
    pub required_artifact: String,
    #[serde(default)]
    pub llm_scenario: String,
}

/// Message received when a run is started.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartMessage {
    pub run_id: String,
    pub task_id: String,
    pub project_id: String,
    pub agent_id: String,
    pub prompt: String,
    #[serde(default)]
    pub policy_profile: String,
    #[serde(default)]
    pub exec_mode: String,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default, deserialize_with = "null_default")]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub termination: TerminationConfig,
    #[serde(default, deserialize_with = "null_default")]
    pub mcp_servers: Vec<crate::mcp::McpServerDef>,
    #[serde(default, deserialize_with = "null_default")]
    pub context: Vec<ContextEntry>,
    #[serde(default, deserialize_with = "null_default")]
    pub microagent_prompts: Vec<String>,
}

/// Policy engine response for a tool-call permission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallDecision {
    pub call_id: String,
    /// "allow", "deny", or "ask".
    pub decision: String,
    #[serde(default)]
    pub reason: String,
}

impl ToolCallDecision {
    pub fn is_allowed(&self) -> bool {
        self.decision == "allow"
    }

    pub fn deny(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            decision: "deny".to_string(),
            reason: reason.into(),
        }
    }
}

/// Completion message published when a run finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCompleteMessage {
    pub run_id: String,
    pub task_id: String,
    pub project_id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub step_count: u32,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub model: String,
}

// ─── Conversation history ────────────────────────────────────────────────────

/// A role-tagged conversation record in OpenAI message shape. Used both for
/// history replay and as the wire format of LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_default")]
    pub tool_calls: Vec<ToolCallPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

impl ConversationMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }

    fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant turn carrying tool calls.
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCallPayload>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Tool result answering a specific call id.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

// ─── Quality gate ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateRequest {
    pub run_id: String,
    pub project_id: String,
    pub workspace_path: String,
    #[serde(default)]
    pub run_tests: bool,
    #[serde(default)]
    pub run_lint: bool,
    #[serde(default)]
    pub test_command: String,
    #[serde(default)]
    pub lint_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub run_id: String,
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub lint_passed: Option<bool>,
    #[serde(default)]
    pub test_output: String,
    #[serde(default)]
    pub lint_output: String,
    #[serde(default)]
    pub error: String,
}

// ─── Repo map ────────────────────────────────────────────────────────────────

fn default_token_budget() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoMapRequest {
    pub project_id: String,
    pub workspace_path: String,
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default, deserialize_with = "null_default")]
    pub active_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoMapResult {
    pub project_id: String,
    pub map_text: String,
    pub token_count: usize,
    pub file_count: usize,
    pub symbol_count: usize,
    #[serde(default, deserialize_with = "null_default")]
    pub languages: Vec<String>,
    #[serde(default)]
    pub error: String,
}

// ─── Retrieval ───────────────────────────────────────────────────────────────

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_top_k() -> usize {
    20
}
fn default_weight() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalIndexRequest {
    pub project_id: String,
    pub workspace_path: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default, deserialize_with = "null_default")]
    pub file_extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalIndexResult {
    pub project_id: String,
    pub status: String,
    #[serde(default)]
    pub file_count: usize,
    #[serde(default)]
    pub chunk_count: usize,
    #[serde(default)]
    pub embedding_model: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub files_changed: usize,
    #[serde(default)]
    pub files_unchanged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSearchRequest {
    pub project_id: String,
    pub query: String,
    pub request_id: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_weight")]
    pub bm25_weight: f64,
    #[serde(default = "default_weight")]
    pub semantic_weight: f64,
    #[serde(default)]
    pub scope_id: String,
}

impl RetrievalSearchRequest {
    /// `top_k` clamped to the supported range.
    pub fn clamped_top_k(&self) -> usize {
        self.top_k.clamp(1, 500)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSearchHit {
    pub filepath: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub language: String,
    #[serde(default)]
    pub symbol_name: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub bm25_rank: usize,
    #[serde(default)]
    pub semantic_rank: usize,
    #[serde(default)]
    pub project_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSearchResult {
    pub project_id: String,
    pub query: String,
    pub request_id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub results: Vec<RetrievalSearchHit>,
    #[serde(default)]
    pub error: String,
}

fn default_max_queries() -> usize {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentSearchRequest {
    pub project_id: String,
    pub query: String,
    pub request_id: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_true")]
    pub rerank: bool,
    #[serde(default)]
    pub scope_id: String,
    #[serde(default)]
    pub expansion_prompt: String,
}

impl SubAgentSearchRequest {
    pub fn clamped_top_k(&self) -> usize {
        self.top_k.clamp(1, 500)
    }

    pub fn clamped_max_queries(&self) -> usize {
        self.max_queries.clamp(1, 20)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentSearchResult {
    pub project_id: String,
    pub query: String,
    pub request_id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub results: Vec<RetrievalSearchHit>,
    #[serde(default, deserialize_with = "null_default")]
    pub expanded_queries: Vec<String>,
    #[serde(default)]
    pub total_candidates: usize,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

// ─── Code graph ──────────────────────────────────────────────────────────────

fn default_max_hops() -> usize {
    2
}
fn default_graph_top_k() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphBuildRequest {
    pub project_id: String,
    pub workspace_path: String,
    #[serde(default)]
    pub scope_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphBuildResult {
    pub project_id: String,
    /// "ready" or "error".
    pub status: String,
    #[serde(default)]
    pub node_count: usize,
    #[serde(default)]
    pub edge_count: usize,
    #[serde(default, deserialize_with = "null_default")]
    pub languages: Vec<String>,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSearchRequest {
    pub project_id: String,
    pub request_id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub seed_symbols: Vec<String>,
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    #[serde(default = "default_graph_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub scope_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSearchHit {
    pub filepath: String,
    pub symbol_name: String,
    /// "function", "method", "class", or "module".
    pub kind: String,
    #[serde(default)]
    pub start_line: usize,
    #[serde(default)]
    pub end_line: usize,
    /// Hops from the nearest seed.
    pub distance: usize,
    pub score: f64,
    #[serde(default, deserialize_with = "null_default")]
    pub edge_path: Vec<String>,
    #[serde(default)]
    pub project_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSearchResult {
    pub project_id: String,
    pub request_id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub results: Vec<GraphSearchHit>,
    #[serde(default)]
    pub error: String,
}

// ─── Conversation runs ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRunStartMessage {
    pub run_id: String,
    pub conversation_id: String,
    pub project_id: String,
    #[serde(default)]
    pub workspace_path: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub model: String,
    #[serde(default, deserialize_with = "null_default")]
    pub messages: Vec<ConversationMessage>,
    #[serde(default, deserialize_with = "null_default")]
    pub context: Vec<ContextEntry>,
    #[serde(default)]
    pub termination: TerminationConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    #[serde(default, deserialize_with = "null_default")]
    pub mcp_servers: Vec<crate::mcp::McpServerDef>,
    #[serde(default, deserialize_with = "null_default")]
    pub microagent_prompts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRunCompleteMessage {
    pub run_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub assistant_content: String,
    #[serde(default, deserialize_with = "null_default")]
    pub tool_messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub step_count: u32,
    #[serde(default)]
    pub model: String,
}

// ─── Memory ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    Observation,
    Decision,
    Error,
    Insight,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Decision => "decision",
            Self::Error => "error",
            Self::Insight => "insight",
        }
    }
}

fn default_importance() -> f64 {
    0.5
}
fn default_memory_kind() -> MemoryKind {
    MemoryKind::Observation
}
fn default_recall_top_k() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryStoreRequest {
    pub project_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub run_id: String,
    pub content: String,
    #[serde(default = "default_memory_kind")]
    pub kind: MemoryKind,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default, deserialize_with = "null_default")]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecallRequest {
    pub project_id: String,
    pub query: String,
    #[serde(default = "default_recall_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub kind: Option<MemoryKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecallHit {
    pub id: String,
    pub content: String,
    pub kind: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecallResult {
    pub project_id: String,
    pub query: String,
    #[serde(default, deserialize_with = "null_default")]
    pub results: Vec<MemoryRecallHit>,
}

// ─── Handoff ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    #[serde(default)]
    pub source_run_id: String,
    #[serde(default)]
    pub target_agent_id: String,
    #[serde(default)]
    pub target_mode_id: String,
    #[serde(default)]
    pub context: String,
    #[serde(default, deserialize_with = "null_default")]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffExecuteMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub source_run_id: String,
    pub target_agent_id: String,
    pub target_mode_id: String,
    pub context: String,
    #[serde(default, deserialize_with = "null_default")]
    pub artifacts: Vec<String>,
}

// ─── Evaluation ──────────────────────────────────────────────────────────────

/// Single message in a multi-agent collaboration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessageRecord {
    pub agent_id: String,
    pub content: String,
    #[serde(default)]
    pub round: i64,
    #[serde(default)]
    pub parent_agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GemmasEvalRequest {
    pub plan_id: String,
    #[serde(default, deserialize_with = "null_default")]
    pub messages: Vec<AgentMessageRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GemmasEvalResult {
    pub plan_id: String,
    pub information_diversity_score: f64,
    pub unnecessary_path_ratio: f64,
    #[serde(default)]
    pub error: String,
}
