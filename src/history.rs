//! Conversation history assembly for agent loops.
//!
//! Builds the messages array for each LLM call within a token budget using a
//! head-and-tail strategy: the system prompt (with injected context entries)
//! always leads, the most recent messages are always kept, and older
//! messages fill whatever budget remains, oldest first.

use crate::models::{ContextEntry, ConversationMessage};

const CHARS_PER_TOKEN: usize = 4;

/// Maximum characters for a tool result before head-and-tail elision.
pub const DEFAULT_TOOL_OUTPUT_MAX_CHARS: usize = 10_000;

/// Fast token estimate using the 4-chars-per-token heuristic.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / CHARS_PER_TOKEN).max(1)
}

/// Truncate long tool results, keeping head and tail with an explicit note of
/// how many characters were omitted.
pub fn truncate_tool_result(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let omitted = text.len() - max_chars;
    let head = safe_prefix(text, half);
    let tail = safe_suffix(text, half);
    format!("{head}\n\n... ({omitted} characters omitted) ...\n\n{tail}")
}

fn safe_prefix(text: &str, len: usize) -> &str {
    let mut end = len.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn safe_suffix(text: &str, len: usize) -> &str {
    let mut start = text.len().saturating_sub(len);
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Configuration for history assembly.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub max_context_tokens: usize,
    pub tool_output_max_chars: usize,
    /// Number of recent messages always included.
    pub min_recent_messages: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 128_000,
            tool_output_max_chars: DEFAULT_TOOL_OUTPUT_MAX_CHARS,
            min_recent_messages: 20,
        }
    }
}

/// Builds the messages array handed to each LLM call.
pub struct ConversationHistoryManager {
    config: HistoryConfig,
}

impl ConversationHistoryManager {
    pub fn new(config: HistoryConfig) -> Self {
        Self { config }
    }

    /// Assemble system prompt + history into a budget-fitting message list.
    ///
    /// When the system prompt alone exceeds the budget, only the system
    /// prompt is returned.
    pub fn build_messages(
        &self,
        system_prompt: &str,
        history: &[ConversationMessage],
        context_entries: &[ContextEntry],
    ) -> Vec<ConversationMessage> {
        let system_content = self.build_system_content(system_prompt, context_entries);
        let system_tokens = estimate_tokens(&system_content);
        let system_msg = ConversationMessage::system(system_content);

        let Some(budget) = self.config.max_context_tokens.checked_sub(system_tokens) else {
            tracing::warn!("system prompt alone exceeds token budget");
            return vec![system_msg];
        };
        if budget == 0 {
            tracing::warn!("system prompt alone exceeds token budget");
            return vec![system_msg];
        }

        let all: Vec<ConversationMessage> = history.iter().map(|m| self.prepare(m)).collect();

        let min_recent = self.config.min_recent_messages.min(all.len());
        let (head, tail) = all.split_at(all.len() - min_recent);

        let tail_tokens: usize = tail.iter().map(message_tokens).sum();
        let mut remaining = budget.saturating_sub(tail_tokens);

        let mut included_head = Vec::new();
        for msg in head {
            let tokens = message_tokens(msg);
            if tokens > remaining {
                break;
            }
            included_head.push(msg.clone());
            remaining -= tokens;
        }

        let mut result = Vec::with_capacity(1 + included_head.len() + tail.len());
        result.push(system_msg);
        result.extend(included_head);
        result.extend(tail.iter().cloned());
        result
    }

    fn build_system_content(&self, base_prompt: &str, context_entries: &[ContextEntry]) -> String {
        if context_entries.is_empty() {
            return base_prompt.to_string();
        }
        let mut sections = String::from(base_prompt);
        for entry in context_entries {
            if entry.content.is_empty() {
                continue;
            }
            let label = if entry.kind.is_empty() {
                "Context".to_string()
            } else {
                capitalize(&entry.kind)
            };
            sections.push_str(&format!("\n\n## {label}\n{}", entry.content));
        }
        sections
    }

    fn prepare(&self, msg: &ConversationMessage) -> ConversationMessage {
        let mut prepared = msg.clone();
        if msg.role == "tool" {
            if let Some(content) = &msg.content {
                prepared.content = Some(truncate_tool_result(content, self.config.tool_output_max_chars));
            }
        }
        prepared
    }
}

impl Default for ConversationHistoryManager {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

fn message_tokens(msg: &ConversationMessage) -> usize {
    let mut total = 0;
    if let Some(content) = &msg.content {
        total += estimate_tokens(content);
    }
    for call in &msg.tool_calls {
        total += estimate_tokens(&call.function.name);
        total += estimate_tokens(&call.function.arguments);
    }
    total.max(1)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
