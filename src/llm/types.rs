//! Request/response types for the LLM gateway client.

use serde_json::Value;

use crate::models::ConversationMessage;

/// A structured tool-call request emitted by the LLM: opaque id, function
/// name, and the raw JSON arguments string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Parsed response from a chat completion call (streamed or not).
#[derive(Debug, Clone, Default)]
pub struct ChatCompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRef>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model: String,
    pub cost_usd: f64,
    pub finish_reason: String,
}

/// Parsed response from a plain completion call.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model: String,
    pub cost_usd: f64,
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ConversationMessage>,
    pub tools: Vec<Value>,
    pub tool_choice: Option<String>,
    pub temperature: Option<f32>,
    pub tags: Vec<String>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ConversationMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            tool_choice: None,
            temperature: None,
            tags: Vec::new(),
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let request = ChatRequest::new("gpt-4o", vec![ConversationMessage::user("hi")])
            .with_temperature(0.2)
            .with_max_tokens(500)
            .with_tags(vec!["default".into()]);
        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.temperature, Some(0.2));
        assert_eq!(request.max_tokens, Some(500));
        assert_eq!(request.tags, vec!["default".to_string()]);
        assert!(request.tools.is_empty());
    }
}
