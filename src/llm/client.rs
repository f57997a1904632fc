//! HTTP client for the LiteLLM proxy (OpenAI-compatible API).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::ConversationMessage;

use super::types::{ChatCompletionResponse, ChatRequest, CompletionResponse, ToolCallRef};
use super::{LlmError, LlmProvider};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const COST_HEADER: &str = "x-litellm-response-cost";
pub const DEFAULT_MODEL: &str = "ollama/llama3.2";

/// Client for the gateway's `/v1/chat/completions` and `/v1/embeddings`
/// endpoints.
pub struct LiteLlmClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl LiteLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Http(format!("failed to create HTTP client: {e}")))?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        builder
    }
}

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatPayload<'a> {
    model: &'a str,
    messages: &'a [ConversationMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tags: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl<'a> ChatPayload<'a> {
    fn from_request(request: &'a ChatRequest, stream: bool) -> Self {
        Self {
            model: &request.model,
            messages: &request.messages,
            temperature: request.temperature,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(&request.tools)
            },
            tool_choice: request.tool_choice.as_deref(),
            tags: if request.tags.is_empty() {
                None
            } else {
                Some(&request.tags)
            },
            max_tokens: request.max_tokens,
            stream: stream.then_some(true),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatResponseBody {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatChoiceMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamBody {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsBody {
    #[serde(default)]
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

// ─── Parsing helpers ─────────────────────────────────────────────────────────

/// Parse the raw `tool_calls` array from a non-streamed response. Malformed
/// entries are skipped rather than failing the whole response.
fn parse_tool_calls(raw: Option<&Value>) -> Vec<ToolCallRef> {
    let Some(Value::Array(entries)) = raw else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let function = entry.get("function")?.as_object()?;
            Some(ToolCallRef {
                id: entry.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
                name: function.get("name")?.as_str()?.to_string(),
                arguments: function
                    .get("arguments")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect()
}

fn cost_from_headers(headers: &reqwest::header::HeaderMap) -> f64 {
    headers
        .get(COST_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}

/// Accumulates per-index tool-call deltas across streaming chunks.
#[derive(Default)]
struct ToolCallAssembler {
    partial: BTreeMap<usize, ToolCallRef>,
}

impl ToolCallAssembler {
    fn feed(&mut self, deltas: &[ToolCallDelta]) {
        for delta in deltas {
            let entry = self.partial.entry(delta.index).or_insert_with(|| ToolCallRef {
                id: String::new(),
                name: String::new(),
                arguments: String::new(),
            });
            if let Some(id) = &delta.id {
                entry.id = id.clone();
            }
            if let Some(function) = &delta.function {
                if let Some(name) = &function.name {
                    entry.name = name.clone();
                }
                if let Some(arguments) = &function.arguments {
                    entry.arguments.push_str(arguments);
                }
            }
        }
    }

    fn finish(self) -> Vec<ToolCallRef> {
        self.partial.into_values().collect()
    }
}

// ─── LlmProvider implementation ──────────────────────────────────────────────

#[async_trait]
impl LlmProvider for LiteLlmClient {
    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatCompletionResponse, LlmError> {
        let payload = ChatPayload::from_request(request, false);
        let response = self
            .post("/v1/chat/completions")
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| LlmError::Http(e.to_string()))?;

        let cost_usd = cost_from_headers(response.headers());
        let body: ChatResponseBody = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let usage = body.usage.unwrap_or_default();
        let model = body.model.unwrap_or_else(|| request.model.clone());

        let Some(choice) = body.choices.into_iter().next() else {
            return Ok(ChatCompletionResponse {
                model,
                cost_usd,
                finish_reason: "stop".to_string(),
                ..Default::default()
            });
        };

        let message = choice.message.unwrap_or_default();
        Ok(ChatCompletionResponse {
            content: message.content.unwrap_or_default(),
            tool_calls: parse_tool_calls(message.tool_calls.as_ref()),
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            model,
            cost_usd,
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
        })
    }

    async fn chat_completion_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<ChatCompletionResponse, LlmError> {
        let payload = ChatPayload::from_request(request, true);
        let response = self
            .post("/v1/chat/completions")
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| LlmError::Http(e.to_string()))?;

        let cost_usd = cost_from_headers(response.headers());
        let mut events = response.bytes_stream().eventsource();

        let mut content = String::new();
        let mut assembler = ToolCallAssembler::default();
        let mut finish_reason = String::new();
        let mut usage = Usage::default();
        let mut model = request.model.clone();

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(error) => return Err(LlmError::Stream(error.to_string())),
            };
            if event.data == "[DONE]" {
                break;
            }
            // Invalid JSON chunks are skipped, matching the gateway's
            // keep-alive noise.
            let Ok(chunk) = serde_json::from_str::<StreamBody>(&event.data) else {
                continue;
            };
            if let Some(chunk_usage) = chunk.usage {
                usage = chunk_usage;
            }
            if let Some(chunk_model) = chunk.model {
                model = chunk_model;
            }
            for choice in &chunk.choices {
                if let Some(text) = &choice.delta.content {
                    content.push_str(text);
                }
                if let Some(deltas) = &choice.delta.tool_calls {
                    assembler.feed(deltas);
                }
                if let Some(reason) = &choice.finish_reason {
                    finish_reason = reason.clone();
                }
            }
        }

        Ok(ChatCompletionResponse {
            content,
            tool_calls: assembler.finish(),
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            model,
            cost_usd,
            finish_reason: if finish_reason.is_empty() {
                "stop".to_string()
            } else {
                finish_reason
            },
        })
    }

    async fn completion(
        &self,
        prompt: &str,
        system: &str,
        model: &str,
        temperature: f32,
    ) -> Result<CompletionResponse, LlmError> {
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(ConversationMessage::system(system));
        }
        messages.push(ConversationMessage::user(prompt));

        let model = if model.is_empty() { DEFAULT_MODEL } else { model };
        let request = ChatRequest::new(model, messages).with_temperature(temperature);
        let response = self.chat_completion(&request).await?;

        Ok(CompletionResponse {
            content: response.content,
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
            model: response.model,
            cost_usd: response.cost_usd,
        })
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>, LlmError> {
        let response = self
            .post("/v1/embeddings")
            .json(&serde_json::json!({ "input": texts, "model": model }))
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| LlmError::Http(e.to_string()))?;

        let mut body: EmbeddingsBody = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        // The gateway may return items out of order; re-sort by index.
        body.data.sort_by_key(|item| item.index);
        Ok(body.data.into_iter().map(|item| item.embedding).collect())
    }
}
