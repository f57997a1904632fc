//! Core agentic loop.
//!
//! ```text
//! budget check (cancelled? cost ceiling?)
//!       │
//!       ▼
//! request permission for the "LLM" pseudo-tool ──► denied? → exit with error
//!       │
//!       ▼
//! streaming LLM call ──► no tool calls? ──► final text, exit
//!       │
//!       ▼ tool calls present
//! for each call, in order:
//!   request permission (argument string as command)
//!     denied  → synthetic "Permission denied" tool message
//!     allowed → execute, report result (≤500-char snippet)
//!   cancellation mid-batch stops the remaining calls
//!       │
//!       ▼
//! iteration += 1; hard cap at max_iterations (warning on overflow)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use crate::llm::{ChatRequest, LlmProvider, ToolCallRef, DEFAULT_MODEL};
use crate::models::{ConversationMessage, ToolCallFunction, ToolCallPayload};
use crate::pricing::resolve_cost;
use crate::protocol::RunClient;
use crate::tools::ToolRegistry;

pub const DEFAULT_MAX_ITERATIONS: usize = 50;

/// Configuration for one loop execution.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: usize,
    /// Cost ceiling in USD; 0 = unlimited.
    pub max_cost: f64,
    pub model: String,
    pub temperature: f32,
    pub tags: Vec<String>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            max_cost: 0.0,
            model: String::new(),
            temperature: 0.2,
            tags: Vec::new(),
        }
    }
}

/// Accumulated outcome of a loop execution.
#[derive(Debug, Default)]
pub struct AgentLoopResult {
    pub final_content: String,
    pub tool_messages: Vec<ConversationMessage>,
    pub total_cost: f64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub step_count: u32,
    pub model: String,
    pub error: String,
}

#[derive(Default)]
struct LoopState {
    model: String,
    total_cost: f64,
    total_tokens_in: u64,
    total_tokens_out: u64,
    step_count: u32,
    final_content: String,
    tool_messages: Vec<ConversationMessage>,
}

enum Turn {
    /// Final text response received.
    Stop,
    /// Tool calls executed; keep looping.
    Continue,
    /// Terminal failure.
    Failed(String),
}

/// Executes the agentic tool-use loop for one run.
pub struct AgentLoopExecutor {
    llm: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    runtime: Arc<RunClient>,
    workspace: PathBuf,
}

impl AgentLoopExecutor {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        runtime: Arc<RunClient>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            llm,
            tools,
            runtime,
            workspace: workspace.into(),
        }
    }

    /// Run the loop until the LLM stops, a limit is hit, or the run is
    /// cancelled. `messages` must already include the system prompt and
    /// history; new assistant and tool messages are appended in place.
    pub async fn run(
        &self,
        messages: &mut Vec<ConversationMessage>,
        config: &LoopConfig,
    ) -> AgentLoopResult {
        let mut state = LoopState {
            model: config.model.clone(),
            ..Default::default()
        };
        let tools_array = self.tools.get_openai_tools();
        let mut hit_cap = true;

        for iteration in 0..config.max_iterations {
            if self.runtime.is_cancelled() {
                return finish(state, "cancelled");
            }

            match self.llm_turn(config, &tools_array, messages, &mut state, iteration).await {
                Turn::Stop => {
                    hit_cap = false;
                    break;
                }
                Turn::Failed(error) => {
                    return finish(state, &error);
                }
                Turn::Continue => {}
            }

            if config.max_cost > 0.0 && state.total_cost >= config.max_cost {
                tracing::info!(
                    cost = state.total_cost,
                    limit = config.max_cost,
                    "cost limit reached"
                );
                hit_cap = false;
                break;
            }
        }

        if hit_cap {
            tracing::warn!(max_iterations = config.max_iterations, "agent loop hit max iterations");
        }
        finish(state, "")
    }

    /// One LLM call plus its tool-call batch.
    async fn llm_turn(
        &self,
        config: &LoopConfig,
        tools_array: &[serde_json::Value],
        messages: &mut Vec<ConversationMessage>,
        state: &mut LoopState,
        iteration: usize,
    ) -> Turn {
        let decision = self.runtime.request_tool_call("LLM", "chat_completion", "").await;
        if !decision.is_allowed() {
            tracing::warn!(reason = %decision.reason, "LLM call denied by policy");
            return Turn::Failed(format!("LLM call denied: {}", decision.reason));
        }

        let model = if config.model.is_empty() {
            DEFAULT_MODEL.to_string()
        } else {
            config.model.clone()
        };
        let request = ChatRequest::new(model, messages.clone())
            .with_tools(tools_array.to_vec())
            .with_temperature(config.temperature)
            .with_tags(config.tags.clone());

        let response = match self.llm.chat_completion_stream(&request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(iteration = iteration, error = %error, "LLM call failed");
                let message = format!("LLM call failed: {error}");
                self.runtime
                    .report_tool_result(&decision.call_id, "LLM", false, "", &message, 0.0, 0, 0, "")
                    .await;
                return Turn::Failed(message);
            }
        };

        if !response.content.is_empty() {
            self.runtime.send_output(&response.content, "stdout").await;
        }

        let cost = resolve_cost(
            response.cost_usd,
            &response.model,
            response.tokens_in,
            response.tokens_out,
        );
        state.total_cost += cost;
        state.total_tokens_in += response.tokens_in;
        state.total_tokens_out += response.tokens_out;
        if !response.model.is_empty() {
            state.model = response.model.clone();
        }

        let snippet = if response.content.is_empty() {
            "(tool_calls)".to_string()
        } else {
            truncate_chars(&response.content, 200)
        };
        self.runtime
            .report_tool_result(
                &decision.call_id,
                "LLM",
                true,
                &snippet,
                "",
                cost,
                response.tokens_in,
                response.tokens_out,
                &response.model,
            )
            .await;

        if response.tool_calls.is_empty() {
            state.final_content = response.content;
            return Turn::Stop;
        }

        let assistant = build_assistant_message(&response.content, &response.tool_calls);
        state.tool_messages.push(assistant.clone());
        messages.push(assistant);

        for call in &response.tool_calls {
            state.step_count += 1;
            self.execute_tool_call(call, messages, state).await;
            if self.runtime.is_cancelled() {
                break;
            }
        }

        Turn::Continue
    }

    /// Execute a single tool call with policy check and error handling.
    async fn execute_tool_call(
        &self,
        call: &ToolCallRef,
        messages: &mut Vec<ConversationMessage>,
        state: &mut LoopState,
    ) {
        // Malformed JSON arguments degrade to an empty object.
        let arguments: serde_json::Value =
            serde_json::from_str(&call.arguments).unwrap_or_else(|_| serde_json::json!({}));

        let decision = self
            .runtime
            .request_tool_call(&call.name, &truncate_chars(&call.arguments, 200), "")
            .await;

        if !decision.is_allowed() {
            let text = format!("Permission denied: {}", decision.reason);
            append_tool_result(call, &text, messages, state);
            self.runtime
                .report_tool_result(&decision.call_id, &call.name, false, "", &text, 0.0, 0, 0, "")
                .await;
            return;
        }

        match self.tools.execute(&call.name, &arguments, &self.workspace).await {
            Err(error) => {
                tracing::error!(tool = %call.name, error = %error, "tool execution error");
                let text = format!("Error executing {}: {error}", call.name);
                append_tool_result(call, &text, messages, state);
                self.runtime
                    .report_tool_result(&decision.call_id, &call.name, false, "", &text, 0.0, 0, 0, "")
                    .await;
            }
            Ok(result) => {
                let text = if result.success {
                    result.output.clone()
                } else if !result.error.is_empty() {
                    format!("Error: {}", result.error)
                } else {
                    "Tool returned an error".to_string()
                };
                append_tool_result(call, &text, messages, state);
                self.runtime
                    .report_tool_result(
                        &decision.call_id,
                        &call.name,
                        result.success,
                        &truncate_chars(&result.output, 500),
                        &result.error,
                        0.0,
                        0,
                        0,
                        "",
                    )
                    .await;
            }
        }
    }
}

fn finish(state: LoopState, error: &str) -> AgentLoopResult {
    AgentLoopResult {
        final_content: state.final_content,
        tool_messages: state.tool_messages,
        total_cost: state.total_cost,
        total_tokens_in: state.total_tokens_in,
        total_tokens_out: state.total_tokens_out,
        step_count: state.step_count,
        model: state.model,
        error: error.to_string(),
    }
}

fn build_assistant_message(content: &str, tool_calls: &[ToolCallRef]) -> ConversationMessage {
    ConversationMessage::assistant_with_tool_calls(
        content,
        tool_calls
            .iter()
            .map(|call| ToolCallPayload {
                id: call.id.clone(),
                kind: "function".to_string(),
                function: ToolCallFunction {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            })
            .collect(),
    )
}

fn append_tool_result(
    call: &ToolCallRef,
    content: &str,
    messages: &mut Vec<ConversationMessage>,
    state: &mut LoopState,
) {
    let message = ConversationMessage::tool_result(&call.id, &call.name, content);
    state.tool_messages.push(message.clone());
    messages.push(message);
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::bus::{Bus, MemoryBus};
    use crate::llm::{ChatCompletionResponse, CompletionResponse, LlmError};
    use crate::models::TerminationConfig;
    use crate::protocol::{SUBJECT_TOOLCALL_REQUEST, SUBJECT_TOOLCALL_RESPONSE};
    use crate::tools::build_default_registry;

    struct ScriptedLlm {
        responses: Mutex<VecDeque<ChatCompletionResponse>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<ChatCompletionResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
            })
        }

        fn pop(&self) -> Result<ChatCompletionResponse, LlmError> {
            self.responses
                .lock()
                .ok()
                .and_then(|mut r| r.pop_front())
                .ok_or_else(|| LlmError::Http("no scripted response left".into()))
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn chat_completion(&self, _r: &ChatRequest) -> Result<ChatCompletionResponse, LlmError> {
            self.pop()
        }

        async fn chat_completion_stream(
            &self,
            _r: &ChatRequest,
        ) -> Result<ChatCompletionResponse, LlmError> {
            self.pop()
        }

        async fn completion(
            &self,
            _p: &str,
            _s: &str,
            _m: &str,
            _t: f32,
        ) -> Result<CompletionResponse, LlmError> {
            let response = self.pop()?;
            Ok(CompletionResponse {
                content: response.content,
                tokens_in: response.tokens_in,
                tokens_out: response.tokens_out,
                model: response.model,
                cost_usd: response.cost_usd,
            })
        }

        async fn embed(&self, texts: &[String], _m: &str) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
    }

    fn text_response(content: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            content: content.to_string(),
            finish_reason: "stop".to_string(),
            model: "mock".to_string(),
            tokens_in: 10,
            tokens_out: 5,
            ..Default::default()
        }
    }

    fn tool_response(id: &str, name: &str, arguments: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            tool_calls: vec![ToolCallRef {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }],
            finish_reason: "tool_calls".to_string(),
            model: "mock".to_string(),
            ..Default::default()
        }
    }

    /// Policy stub: allow everything except tools named in `deny`.
    /// Subscribes before returning so no request can slip past it.
    async fn spawn_policy(bus: Arc<MemoryBus>, deny: Vec<&'static str>) {
        let mut sub = bus.subscribe(SUBJECT_TOOLCALL_REQUEST).await.unwrap();
        tokio::spawn(async move {
            while let Some(delivery) = sub.next().await {
                let request: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
                let tool = request["tool"].as_str().unwrap_or_default();
                let decision = if deny.contains(&tool) { "deny" } else { "allow" };
                let response = json!({
                    "call_id": request["call_id"],
                    "decision": decision,
                    "reason": if decision == "deny" { "blocked by policy" } else { "" },
                });
                bus.publish(SUBJECT_TOOLCALL_RESPONSE, response.to_string().into_bytes())
                    .await
                    .unwrap();
            }
        });
    }

    fn executor(
        bus: Arc<MemoryBus>,
        llm: Arc<ScriptedLlm>,
        workspace: &std::path::Path,
    ) -> (AgentLoopExecutor, Arc<RunClient>) {
        let runtime = Arc::new(RunClient::new(
            bus,
            "run-1",
            "task-1",
            "proj-1",
            TerminationConfig::default(),
        ));
        let executor = AgentLoopExecutor::new(
            llm,
            Arc::new(build_default_registry()),
            runtime.clone(),
            workspace,
        );
        (executor, runtime)
    }

    #[tokio::test]
    async fn single_turn_no_tool_calls() {
        let bus = Arc::new(MemoryBus::new());
        spawn_policy(bus.clone(), vec![]).await;
        let ws = tempfile::tempdir().unwrap();
        let (executor, _) = executor(bus, ScriptedLlm::new(vec![text_response("Hello!")]), ws.path());

        let mut messages = vec![ConversationMessage::user("Hi")];
        let result = executor.run(&mut messages, &LoopConfig::default()).await;

        assert_eq!(result.final_content, "Hello!");
        assert_eq!(result.step_count, 0);
        assert!(result.error.is_empty());
        assert!(result.tool_messages.is_empty());
    }

    #[tokio::test]
    async fn tool_call_executes_and_continues() {
        let bus = Arc::new(MemoryBus::new());
        spawn_policy(bus.clone(), vec![]).await;
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("README.md"), "readme body\n").unwrap();

        let llm = ScriptedLlm::new(vec![
            tool_response("call_1", "read_file", r#"{"file_path": "README.md"}"#),
            text_response("Done."),
        ]);
        let (executor, _) = executor(bus, llm, ws.path());

        let mut messages = vec![ConversationMessage::user("Read README.md")];
        let result = executor.run(&mut messages, &LoopConfig::default()).await;

        assert_eq!(result.final_content, "Done.");
        assert_eq!(result.step_count, 1);
        // Assistant message with the call + one tool result.
        assert_eq!(result.tool_messages.len(), 2);
        let tool_msg = &result.tool_messages[1];
        assert_eq!(tool_msg.role, "tool");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
        assert!(tool_msg.content.as_deref().unwrap().contains("readme body"));
    }

    #[tokio::test]
    async fn permission_denied_becomes_tool_message() {
        let bus = Arc::new(MemoryBus::new());
        spawn_policy(bus.clone(), vec!["bash"]).await;
        let ws = tempfile::tempdir().unwrap();

        let llm = ScriptedLlm::new(vec![
            tool_response("call_1", "bash", r#"{"command": "rm -rf /"}"#),
            text_response("I'll find another way."),
        ]);
        let (executor, _) = executor(bus, llm, ws.path());

        let mut messages = vec![ConversationMessage::user("go")];
        let result = executor.run(&mut messages, &LoopConfig::default()).await;

        assert_eq!(result.final_content, "I'll find another way.");
        let tool_msg = &result.tool_messages[1];
        assert!(tool_msg
            .content
            .as_deref()
            .unwrap()
            .starts_with("Permission denied:"));
    }

    #[tokio::test]
    async fn llm_denied_terminates_with_error() {
        let bus = Arc::new(MemoryBus::new());
        spawn_policy(bus.clone(), vec!["LLM"]).await;
        let ws = tempfile::tempdir().unwrap();
        let (executor, _) = executor(bus, ScriptedLlm::new(vec![]), ws.path());

        let mut messages = vec![ConversationMessage::user("hi")];
        let result = executor.run(&mut messages, &LoopConfig::default()).await;
        assert!(result.error.starts_with("LLM call denied:"));
    }

    #[tokio::test]
    async fn llm_failure_terminates_with_error() {
        let bus = Arc::new(MemoryBus::new());
        spawn_policy(bus.clone(), vec![]).await;
        let ws = tempfile::tempdir().unwrap();
        // Empty script: the first stream call errors.
        let (executor, _) = executor(bus, ScriptedLlm::new(vec![]), ws.path());

        let mut messages = vec![ConversationMessage::user("hi")];
        let result = executor.run(&mut messages, &LoopConfig::default()).await;
        assert!(result.error.starts_with("LLM call failed:"));
    }

    #[tokio::test]
    async fn max_iterations_cap() {
        let bus = Arc::new(MemoryBus::new());
        spawn_policy(bus.clone(), vec![]).await;
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("a.txt"), "x\n").unwrap();

        let responses: Vec<ChatCompletionResponse> = (0..5)
            .map(|i| tool_response(&format!("call_{i}"), "read_file", r#"{"file_path": "a.txt"}"#))
            .collect();
        let (executor, _) = executor(bus, ScriptedLlm::new(responses), ws.path());

        let config = LoopConfig {
            max_iterations: 3,
            ..Default::default()
        };
        let mut messages = vec![ConversationMessage::user("loop")];
        let result = executor.run(&mut messages, &config).await;

        assert_eq!(result.step_count, 3);
        assert!(result.error.is_empty());
    }

    #[tokio::test]
    async fn cost_ceiling_stops_loop() {
        let bus = Arc::new(MemoryBus::new());
        spawn_policy(bus.clone(), vec![]).await;
        let ws = tempfile::tempdir().unwrap();
        std::fs::write(ws.path().join("a.txt"), "x\n").unwrap();

        let mut expensive = tool_response("call_0", "read_file", r#"{"file_path": "a.txt"}"#);
        expensive.cost_usd = 2.0;
        let (executor, _) = executor(
            bus,
            ScriptedLlm::new(vec![expensive, text_response("never reached")]),
            ws.path(),
        );

        let config = LoopConfig {
            max_cost: 1.0,
            ..Default::default()
        };
        let mut messages = vec![ConversationMessage::user("go")];
        let result = executor.run(&mut messages, &config).await;

        assert_eq!(result.step_count, 1);
        assert!(result.final_content.is_empty());
        assert!(result.error.is_empty());
    }

    #[tokio::test]
    async fn cancellation_before_first_turn() {
        let bus = Arc::new(MemoryBus::new());
        spawn_policy(bus.clone(), vec![]).await;
        let ws = tempfile::tempdir().unwrap();
        let (executor, runtime) = executor(bus, ScriptedLlm::new(vec![text_response("x")]), ws.path());
        runtime.cancel_flag().store(true, std::sync::atomic::Ordering::SeqCst);

        let mut messages = vec![ConversationMessage::user("hi")];
        let result = executor.run(&mut messages, &LoopConfig::default()).await;
        assert_eq!(result.error, "cancelled");
        assert_eq!(result.step_count, 0);
    }

    #[tokio::test]
    async fn malformed_arguments_degrade_to_empty() {
        let bus = Arc::new(MemoryBus::new());
        spawn_policy(bus.clone(), vec![]).await;
        let ws = tempfile::tempdir().unwrap();

        let llm = ScriptedLlm::new(vec![
            tool_response("call_1", "list_directory", "{not json"),
            text_response("ok"),
        ]);
        let (executor, _) = executor(bus, llm, ws.path());

        let mut messages = vec![ConversationMessage::user("ls")];
        let result = executor.run(&mut messages, &LoopConfig::default()).await;
        // list_directory with empty args lists the workspace root.
        assert_eq!(result.final_content, "ok");
        assert_eq!(result.step_count, 1);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo wörld".repeat(50);
        let out = truncate_chars(&text, 200);
        assert!(out.len() <= 200);
    }
}
