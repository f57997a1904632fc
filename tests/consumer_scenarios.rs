//! End-to-end consumer scenarios over the in-process bus.
//!
//! A scripted LLM provider and a policy-engine stub stand in for the gateway
//! and control plane; everything else is the real dispatch path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use codeforge_worker::bus::{Bus, BusSubscription, MemoryBus};
use codeforge_worker::config::WorkerSettings;
use codeforge_worker::consumer::subjects::*;
use codeforge_worker::consumer::Consumer;
use codeforge_worker::db::Database;
use codeforge_worker::llm::{
    ChatCompletionResponse, ChatRequest, CompletionResponse, LlmError, LlmProvider, ToolCallRef,
};
use codeforge_worker::models::{
    ConversationRunCompleteMessage, RetrievalIndexResult, RetrievalSearchResult,
};

const TOOLCALL_REQUEST: &str = "runs.toolcall.request";
const TOOLCALL_RESPONSE: &str = "runs.toolcall.response";
const TOOLCALL_RESULT: &str = "runs.toolcall.result";

// ─── Scripted LLM ────────────────────────────────────────────────────────────

struct ScriptedLlm {
    responses: Mutex<VecDeque<ChatCompletionResponse>>,
    fail_embeddings: AtomicBool,
}

impl ScriptedLlm {
    fn new(responses: Vec<ChatCompletionResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            fail_embeddings: AtomicBool::new(false),
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

    async fn chat_completion_stream(&self, _r: &ChatRequest) -> Result<ChatCompletionResponse, LlmError> {
        self.pop()
    }

    async fn completion(&self, _p: &str, _s: &str, _m: &str, _t: f32) -> Result<CompletionResponse, LlmError> {
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
        if self.fail_embeddings.load(Ordering::SeqCst) {
            return Err(LlmError::Http("embeddings endpoint unavailable".into()));
        }
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; 32];
                for (i, c) in text.chars().enumerate() {
                    vector[(i + c as usize) % 32] += 1.0;
                }
                vector
            })
            .collect())
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

fn tool_calls_response(calls: Vec<(&str, &str, &str)>) -> ChatCompletionResponse {
    ChatCompletionResponse {
        tool_calls: calls
            .into_iter()
            .map(|(id, name, arguments)| ToolCallRef {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            })
            .collect(),
        finish_reason: "tool_calls".to_string(),
        model: "mock".to_string(),
        ..Default::default()
    }
}

// ─── Policy engine stub ──────────────────────────────────────────────────────

/// Answers every permission request. `deny_nth_of` denies the n-th request
/// (1-based) for a given tool name and allows everything else. Subscribes
/// before returning so no request can slip past it.
async fn spawn_policy(bus: Arc<MemoryBus>, deny_nth_of: Option<(&'static str, usize)>) {
    let mut sub = bus.subscribe(TOOLCALL_REQUEST).await.unwrap();
    tokio::spawn(async move {
        let mut seen = 0usize;
        while let Some(delivery) = sub.next().await {
            let request: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
            let tool = request["tool"].as_str().unwrap_or_default();

            let mut decision = "allow";
            let mut reason = "";
            if let Some((name, nth)) = deny_nth_of {
                if tool == name {
                    seen += 1;
                    if seen == nth {
                        decision = "deny";
                        reason = "blocked by policy";
                    }
                }
            }

            let response = json!({
                "call_id": request["call_id"],
                "decision": decision,
                "reason": reason,
            });
            bus.publish(TOOLCALL_RESPONSE, response.to_string().into_bytes())
                .await
                .unwrap();
        }
    });
}

// ─── Harness ─────────────────────────────────────────────────────────────────

struct Harness {
    bus: Arc<MemoryBus>,
    consumer: Arc<Consumer>,
}

async fn harness(llm: Arc<ScriptedLlm>) -> Harness {
    let bus = Arc::new(MemoryBus::new());
    let consumer = Consumer::new(
        bus.clone(),
        llm,
        Database::in_memory().unwrap(),
        WorkerSettings::from_env(),
    );
    consumer.start().await.unwrap();
    Harness { bus, consumer }
}

async fn await_message<T: serde::de::DeserializeOwned>(sub: &mut Box<dyn BusSubscription>) -> T {
    let delivery = tokio::time::timeout(Duration::from_secs(5), sub.next())
        .await
        .expect("timed out waiting for message")
        .expect("subscription closed");
    serde_json::from_slice(&delivery.payload).expect("unparseable message")
}

fn conversation_start(run_id: &str, prompt: &str, max_steps: u32, workspace: &str) -> Vec<u8> {
    json!({
        "run_id": run_id,
        "conversation_id": format!("conv-{run_id}"),
        "project_id": "p1",
        "workspace_path": workspace,
        "system_prompt": "You are a coding agent.",
        "model": "mock",
        "messages": [{"role": "user", "content": prompt}],
        "termination": {"max_steps": max_steps, "timeout_seconds": 600, "max_cost": 0.0},
    })
    .to_string()
    .into_bytes()
}

fn toolcall_requests_for(bus: &MemoryBus, tool: &str) -> usize {
    bus.published(TOOLCALL_REQUEST)
        .iter()
        .filter(|m| {
            m.json::<serde_json::Value>()
                .map(|v| v["tool"] == tool)
                .unwrap_or(false)
        })
        .count()
}

fn toolcall_results_for(bus: &MemoryBus, tool: &str) -> usize {
    bus.published(TOOLCALL_RESULT)
        .iter()
        .filter(|m| {
            m.json::<serde_json::Value>()
                .map(|v| v["tool"] == tool)
                .unwrap_or(false)
        })
        .count()
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

/// Scenario 1: single turn, no tools.
#[tokio::test]
async fn single_turn_no_tools() {
    let llm = ScriptedLlm::new(vec![text_response("Hello!")]);
    let h = harness(llm).await;
    spawn_policy(h.bus.clone(), None).await;

    let mut complete_sub = h.bus.subscribe(SUBJECT_CONVERSATION_RUN_COMPLETE).await.unwrap();
    let ws = tempfile::tempdir().unwrap();
    h.bus
        .publish(
            SUBJECT_CONVERSATION_RUN_START,
            conversation_start("r1", "Hi", 50, &ws.path().display().to_string()),
        )
        .await
        .unwrap();

    let complete: ConversationRunCompleteMessage = await_message(&mut complete_sub).await;
    assert_eq!(complete.status, "completed");
    assert_eq!(complete.assistant_content, "Hello!");
    assert_eq!(complete.step_count, 0);

    // No tool-call requests beyond the LLM gate itself.
    assert_eq!(toolcall_requests_for(&h.bus, "read_file"), 0);
    assert_eq!(toolcall_requests_for(&h.bus, "bash"), 0);
    h.consumer.stop().await;
}

/// Scenario 2: one allowed tool call, then a final text turn.
#[tokio::test]
async fn single_tool_call_allowed() {
    let llm = ScriptedLlm::new(vec![
        tool_calls_response(vec![("call_1", "read_file", r#"{"file_path": "README.md"}"#)]),
        text_response("Done."),
    ]);
    let h = harness(llm).await;
    spawn_policy(h.bus.clone(), None).await;

    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("README.md"), "hello readme\n").unwrap();

    let mut complete_sub = h.bus.subscribe(SUBJECT_CONVERSATION_RUN_COMPLETE).await.unwrap();
    h.bus
        .publish(
            SUBJECT_CONVERSATION_RUN_START,
            conversation_start("r2", "Read README.md", 50, &ws.path().display().to_string()),
        )
        .await
        .unwrap();

    let complete: ConversationRunCompleteMessage = await_message(&mut complete_sub).await;
    assert_eq!(complete.status, "completed");
    assert_eq!(complete.assistant_content, "Done.");
    assert_eq!(complete.step_count, 1);

    // Exactly one permission round-trip and one result for the tool.
    assert_eq!(toolcall_requests_for(&h.bus, "read_file"), 1);
    assert_eq!(toolcall_results_for(&h.bus, "read_file"), 1);

    // The tool message answers the assistant's call id.
    let tool_messages: Vec<_> = complete
        .tool_messages
        .iter()
        .filter(|m| m.role == "tool")
        .collect();
    assert_eq!(tool_messages.len(), 1);
    assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("call_1"));
    assert!(tool_messages[0].content.as_deref().unwrap().contains("hello readme"));
    h.consumer.stop().await;
}

/// Scenario 3: two tool calls in one batch; the first is denied, the second
/// executes, and the loop continues to a final text turn.
#[tokio::test]
async fn permission_denied_mid_batch() {
    let llm = ScriptedLlm::new(vec![
        tool_calls_response(vec![
            ("call_1", "bash", r#"{"command": "echo first"}"#),
            ("call_2", "bash", r#"{"command": "echo second"}"#),
        ]),
        text_response("Finished anyway."),
    ]);
    let h = harness(llm).await;
    spawn_policy(h.bus.clone(), Some(("bash", 1))).await;

    let ws = tempfile::tempdir().unwrap();
    let mut complete_sub = h.bus.subscribe(SUBJECT_CONVERSATION_RUN_COMPLETE).await.unwrap();
    h.bus
        .publish(
            SUBJECT_CONVERSATION_RUN_START,
            conversation_start("r3", "echo twice", 50, &ws.path().display().to_string()),
        )
        .await
        .unwrap();

    let complete: ConversationRunCompleteMessage = await_message(&mut complete_sub).await;
    assert_eq!(complete.status, "completed");
    assert_eq!(complete.assistant_content, "Finished anyway.");

    let tool_messages: Vec<_> = complete
        .tool_messages
        .iter()
        .filter(|m| m.role == "tool")
        .collect();
    assert_eq!(tool_messages.len(), 2, "both calls leave a tool message");
    assert!(tool_messages[0]
        .content
        .as_deref()
        .unwrap()
        .starts_with("Permission denied:"));
    assert!(tool_messages[1].content.as_deref().unwrap().contains("second"));
    h.consumer.stop().await;
}

/// Scenario 4: the LLM keeps asking for tools; the iteration cap wins.
#[tokio::test]
async fn max_iterations_reached() {
    let responses: Vec<ChatCompletionResponse> = (0..10)
        .map(|i| {
            let id = format!("call_{i}");
            tool_calls_response(vec![(id.as_str(), "list_directory", "{}")])
        })
        .collect();
    let llm = ScriptedLlm::new(responses);
    let h = harness(llm).await;
    spawn_policy(h.bus.clone(), None).await;

    let ws = tempfile::tempdir().unwrap();
    let mut complete_sub = h.bus.subscribe(SUBJECT_CONVERSATION_RUN_COMPLETE).await.unwrap();
    h.bus
        .publish(
            SUBJECT_CONVERSATION_RUN_START,
            conversation_start("r4", "loop forever", 3, &ws.path().display().to_string()),
        )
        .await
        .unwrap();

    let complete: ConversationRunCompleteMessage = await_message(&mut complete_sub).await;
    assert_eq!(complete.step_count, 3, "exactly max_steps tool calls execute");
    assert_eq!(toolcall_results_for(&h.bus, "list_directory"), 3);
    assert_eq!(complete.status, "completed");
    h.consumer.stop().await;
}

/// Scenario 5: retrieval index build then search, correlated by request_id.
#[tokio::test]
async fn retrieval_round_trip_with_request_id() {
    let llm = ScriptedLlm::new(vec![]);
    let h = harness(llm).await;

    let ws = tempfile::tempdir().unwrap();
    std::fs::write(
        ws.path().join("auth.py"),
        "def authenticate_user(token):\n    return token == 'ok'\n",
    )
    .unwrap();
    std::fs::write(
        ws.path().join("billing.py"),
        "def charge_card(amount):\n    return amount\n",
    )
    .unwrap();

    let mut index_sub = h.bus.subscribe(SUBJECT_RETRIEVAL_INDEX_RESULT).await.unwrap();
    h.bus
        .publish(
            SUBJECT_RETRIEVAL_INDEX_REQUEST,
            json!({
                "project_id": "p1",
                "workspace_path": ws.path().display().to_string(),
            })
            .to_string()
            .into_bytes(),
        )
        .await
        .unwrap();
    let index_result: RetrievalIndexResult = await_message(&mut index_sub).await;
    assert_eq!(index_result.status, "ready");
    assert_eq!(index_result.file_count, 2);

    let mut search_sub = h.bus.subscribe(SUBJECT_RETRIEVAL_SEARCH_RESULT).await.unwrap();
    h.bus
        .publish(
            SUBJECT_RETRIEVAL_SEARCH_REQUEST,
            json!({
                "project_id": "p1",
                "query": "authenticate_user token",
                "request_id": "R",
            })
            .to_string()
            .into_bytes(),
        )
        .await
        .unwrap();

    let search_result: RetrievalSearchResult = await_message(&mut search_sub).await;
    assert_eq!(search_result.request_id, "R");
    assert!(search_result.error.is_empty());
    assert!(!search_result.results.is_empty());
    for hit in &search_result.results {
        assert!(hit.start_line >= 1 && hit.end_line >= hit.start_line);
        assert!(hit.score > 0.0);
    }
    h.consumer.stop().await;
}

/// Scenario 6: a failing search handler still answers the waiter with an
/// error-populated result, and the original message is naked.
#[tokio::test]
async fn retrieval_failure_publishes_error_reply() {
    let llm = ScriptedLlm::new(vec![]);
    let h = harness(llm.clone()).await;

    let ws = tempfile::tempdir().unwrap();
    std::fs::write(ws.path().join("a.py"), "def f():\n    return 1\n").unwrap();

    let mut index_sub = h.bus.subscribe(SUBJECT_RETRIEVAL_INDEX_RESULT).await.unwrap();
    h.bus
        .publish(
            SUBJECT_RETRIEVAL_INDEX_REQUEST,
            json!({
                "project_id": "p1",
                "workspace_path": ws.path().display().to_string(),
            })
            .to_string()
            .into_bytes(),
        )
        .await
        .unwrap();
    let _: RetrievalIndexResult = await_message(&mut index_sub).await;

    // Break the embeddings endpoint for the search path.
    llm.fail_embeddings.store(true, Ordering::SeqCst);

    let mut search_sub = h.bus.subscribe(SUBJECT_RETRIEVAL_SEARCH_RESULT).await.unwrap();
    h.bus
        .publish(
            SUBJECT_RETRIEVAL_SEARCH_REQUEST,
            json!({
                "project_id": "p1",
                "query": "anything",
                "request_id": "R-err",
            })
            .to_string()
            .into_bytes(),
        )
        .await
        .unwrap();

    let result: RetrievalSearchResult = await_message(&mut search_sub).await;
    assert_eq!(result.request_id, "R-err");
    assert_eq!(result.error, "internal worker error");
    assert!(result.results.is_empty());

    // The original request was naked for redelivery.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let original = h.bus.published(SUBJECT_RETRIEVAL_SEARCH_REQUEST);
    assert_eq!(original.len(), 1);
    assert!(original[0].ack_state.is_naked());
    h.consumer.stop().await;
}

/// Correlation: streaming task output carries the caller's X-Request-ID.
#[tokio::test]
async fn task_output_propagates_request_id() {
    let llm = ScriptedLlm::new(vec![text_response("task answer")]);
    let h = harness(llm).await;

    let mut output_sub = h.bus.subscribe(SUBJECT_OUTPUT).await.unwrap();
    let mut result_sub = h.bus.subscribe(SUBJECT_RESULT).await.unwrap();

    let mut headers = codeforge_worker::bus::Headers::new();
    headers.insert("X-Request-ID".to_string(), "corr-42".to_string());
    h.bus
        .publish_with_headers(
            "tasks.agent.native",
            &headers,
            json!({
                "id": "t1",
                "project_id": "p1",
                "title": "demo",
                "prompt": "say hi",
            })
            .to_string()
            .into_bytes(),
        )
        .await
        .unwrap();

    let output = tokio::time::timeout(Duration::from_secs(5), output_sub.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(output.request_id(), "corr-42");

    let result: serde_json::Value = await_message(&mut result_sub).await;
    assert_eq!(result["task_id"], "t1");
    assert_eq!(result["status"], "completed");
    assert_eq!(result["output"], "task answer");
    h.consumer.stop().await;
}

/// Cancellation: a runs.cancel naming the run prevents further tool
/// executions and completes with status=failed carrying the cancel error.
#[tokio::test]
async fn cancellation_stops_the_loop() {
    // The LLM would keep looping forever if not cancelled.
    let responses: Vec<ChatCompletionResponse> = (0..50)
        .map(|i| {
            let id = format!("c{i}");
            tool_calls_response(vec![(id.as_str(), "list_directory", "{}")])
        })
        .collect();
    let llm = ScriptedLlm::new(responses);
    let h = harness(llm).await;

    // Policy stub that cancels the run after the first tool execution.
    let bus = h.bus.clone();
    let mut sub = bus.subscribe(TOOLCALL_REQUEST).await.unwrap();
    tokio::spawn(async move {
        let mut allowed = 0;
        while let Some(delivery) = sub.next().await {
            let request: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
            bus.publish(
                TOOLCALL_RESPONSE,
                json!({"call_id": request["call_id"], "decision": "allow", "reason": ""})
                    .to_string()
                    .into_bytes(),
            )
            .await
            .unwrap();
            if request["tool"] == "list_directory" {
                allowed += 1;
                if allowed == 1 {
                    bus.publish("runs.cancel", json!({"run_id": "r-cancel"}).to_string().into_bytes())
                        .await
                        .unwrap();
                }
            }
        }
    });

    let ws = tempfile::tempdir().unwrap();
    let mut complete_sub = h.bus.subscribe(SUBJECT_CONVERSATION_RUN_COMPLETE).await.unwrap();
    h.bus
        .publish(
            SUBJECT_CONVERSATION_RUN_START,
            conversation_start("r-cancel", "run until cancelled", 50, &ws.path().display().to_string()),
        )
        .await
        .unwrap();

    let complete: ConversationRunCompleteMessage = await_message(&mut complete_sub).await;
    assert_eq!(complete.status, "failed");
    // Depending on where the flag lands, the loop reports either its own
    // cancellation or the denied follow-up permission request.
    assert!(complete.error.contains("cancelled"), "error = {}", complete.error);
    assert!(
        complete.step_count < 50,
        "cancellation should stop well before the cap, got {}",
        complete.step_count
    );
    h.consumer.stop().await;
}
