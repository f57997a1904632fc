//! LLM gateway access.
//!
//! [`LlmProvider`] is the seam the agent loop, retrieval sub-agent, memory
//! store, and evaluation metrics are written against; [`LiteLlmClient`] is
//! the production implementation talking to the OpenAI-compatible proxy.

mod client;
mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

pub use client::{LiteLlmClient, DEFAULT_MODEL};
pub use types::{ChatCompletionResponse, ChatRequest, CompletionResponse, ToolCallRef};

/// Re-export of the OpenAI-shaped message record used on the wire.
pub use crate::models::ConversationMessage as WireMessage;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(String),
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("stream error: {0}")]
    Stream(String),
}

/// Chat, completion, and embedding access to the LLM gateway.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatCompletionResponse, LlmError>;

    /// Streaming chat completion. Text deltas accumulate into `content`;
    /// tool-call deltas are assembled per index.
    async fn chat_completion_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<ChatCompletionResponse, LlmError>;

    /// Single-prompt completion with an optional system message.
    async fn completion(
        &self,
        prompt: &str,
        system: &str,
        model: &str,
        temperature: f32,
    ) -> Result<CompletionResponse, LlmError>;

    /// Batch-embed texts, returned in input order.
    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, LlmError>;
}

// ─── Scenario table ──────────────────────────────────────────────────────────

/// Gateway routing configuration resolved from an agent mode's scenario name.
#[derive(Debug, Clone, Default)]
pub struct ScenarioConfig {
    pub tag: String,
}

#[derive(Debug, Default, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    scenarios: HashMap<String, ScenarioEntry>,
}

#[derive(Debug, Deserialize)]
struct ScenarioEntry {
    #[serde(default)]
    tag: String,
}

/// Process-wide scenario table, loaded once at startup.
#[derive(Debug, Default)]
pub struct ScenarioTable {
    tags: HashMap<String, String>,
}

impl ScenarioTable {
    /// Load from a YAML file of the shape `scenarios: {name: {tag: ...}}`.
    /// A missing or unreadable file yields an empty table.
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        let parsed: ScenarioFile = serde_yaml::from_str(&raw).unwrap_or_default();
        Self {
            tags: parsed
                .scenarios
                .into_iter()
                .map(|(name, entry)| (name, entry.tag))
                .collect(),
        }
    }

    /// Resolve a scenario name. Unknown names map to a tag equal to the name
    /// itself so gateway routing degrades gracefully.
    pub fn resolve(&self, scenario: &str) -> ScenarioConfig {
        if scenario.is_empty() {
            return ScenarioConfig::default();
        }
        ScenarioConfig {
            tag: self
                .tags
                .get(scenario)
                .cloned()
                .unwrap_or_else(|| scenario.to_string()),
        }
    }
}

static SCENARIOS: OnceLock<ScenarioTable> = OnceLock::new();

/// Install the process-wide scenario table. First call wins.
pub fn init_scenarios(table: ScenarioTable) {
    let _ = SCENARIOS.set(table);
}

/// Resolve a scenario name against the process-wide table.
pub fn resolve_scenario(scenario: &str) -> ScenarioConfig {
    SCENARIOS.get_or_init(ScenarioTable::default).resolve(scenario)
}
