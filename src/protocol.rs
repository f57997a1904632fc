//! Run protocol client.
//!
//! Mediates one run's conversation with the control plane: tool-call
//! permission requests, result reporting, streaming output, heartbeat, and
//! cancellation. Each tool call is individually approved by the policy
//! engine before the worker executes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::bus::{Bus, BusSubscription};
use crate::models::{RunCompleteMessage, TerminationConfig, ToolCallDecision};

pub const SUBJECT_TOOLCALL_REQUEST: &str = "runs.toolcall.request";
pub const SUBJECT_TOOLCALL_RESPONSE: &str = "runs.toolcall.response";
pub const SUBJECT_TOOLCALL_RESULT: &str = "runs.toolcall.result";
pub const SUBJECT_RUN_COMPLETE: &str = "runs.complete";
pub const SUBJECT_RUN_OUTPUT: &str = "runs.output";
pub const SUBJECT_RUN_CANCEL: &str = "runs.cancel";
pub const SUBJECT_RUN_HEARTBEAT: &str = "runs.heartbeat";

pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct RunCounters {
    step_count: u32,
    total_cost: f64,
    tokens_in: u64,
    tokens_out: u64,
    model: String,
}

/// Per-run protocol mediator.
pub struct RunClient {
    bus: Arc<dyn Bus>,
    pub run_id: String,
    pub task_id: String,
    pub project_id: String,
    pub termination: TerminationConfig,
    counters: Mutex<RunCounters>,
    cancelled: Arc<AtomicBool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    cancel_listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl RunClient {
    pub fn new(
        bus: Arc<dyn Bus>,
        run_id: impl Into<String>,
        task_id: impl Into<String>,
        project_id: impl Into<String>,
        termination: TerminationConfig,
    ) -> Self {
        Self {
            bus,
            run_id: run_id.into(),
            task_id: task_id.into(),
            project_id: project_id.into(),
            termination,
            counters: Mutex::new(RunCounters::default()),
            cancelled: Arc::new(AtomicBool::new(false)),
            heartbeat: Mutex::new(None),
            cancel_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Shared cancellation flag (exposed for tests and wiring).
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn step_count(&self) -> u32 {
        self.counters.lock().map(|c| c.step_count).unwrap_or(0)
    }

    pub fn total_cost(&self) -> f64 {
        self.counters.lock().map(|c| c.total_cost).unwrap_or(0.0)
    }

    /// Subscribe to cancellation subjects; a payload naming this run sets the
    /// cancelled flag.
    pub async fn start_cancel_listener(&self, extra_subjects: &[&str]) {
        let mut subjects = vec![SUBJECT_RUN_CANCEL.to_string()];
        subjects.extend(extra_subjects.iter().map(|s| s.to_string()));

        for subject in subjects {
            let Ok(mut subscription) = self.bus.subscribe(&subject).await else {
                tracing::warn!(run_id = %self.run_id, subject = %subject, "cancel subscription failed");
                continue;
            };
            let run_id = self.run_id.clone();
            let flag = self.cancelled.clone();
            let handle = tokio::spawn(async move {
                while !flag.load(Ordering::SeqCst) {
                    let Some(delivery) = subscription.next().await else {
                        break;
                    };
                    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&delivery.payload)
                    else {
                        continue;
                    };
                    if payload.get("run_id").and_then(|v| v.as_str()) == Some(run_id.as_str()) {
                        flag.store(true, Ordering::SeqCst);
                        tracing::info!(run_id = %run_id, "run cancelled by control plane");
                    }
                }
            });
            if let Ok(mut listeners) = self.cancel_listeners.lock() {
                listeners.push(handle);
            }
        }
    }

    /// Start the periodic heartbeat publisher.
    pub async fn start_heartbeat(&self, interval: Duration) {
        let bus = self.bus.clone();
        let run_id = self.run_id.clone();
        let flag = self.cancelled.clone();
        let handle = tokio::spawn(async move {
            while !flag.load(Ordering::SeqCst) {
                let payload = json!({
                    "run_id": run_id,
                    "timestamp": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
                });
                if bus
                    .publish(SUBJECT_RUN_HEARTBEAT, payload.to_string().into_bytes())
                    .await
                    .is_err()
                {
                    tracing::warn!(run_id = %run_id, "heartbeat publish failed");
                }
                tokio::time::sleep(interval).await;
            }
        });
        if let Ok(mut heartbeat) = self.heartbeat.lock() {
            if let Some(old) = heartbeat.replace(handle) {
                old.abort();
            }
        }
    }

    fn stop_heartbeat(&self) {
        if let Ok(mut heartbeat) = self.heartbeat.lock() {
            if let Some(handle) = heartbeat.take() {
                handle.abort();
            }
        }
    }

    /// Request permission to execute a tool call. Waits for the policy
    /// engine's response, treating a timeout as denial. Returns an immediate
    /// denial without publishing when the run is already cancelled.
    pub async fn request_tool_call(&self, tool: &str, command: &str, path: &str) -> ToolCallDecision {
        if self.is_cancelled() {
            return ToolCallDecision::deny("", "run cancelled");
        }

        let call_id = Uuid::new_v4().to_string();

        // Subscribe before publishing so the response cannot slip past us.
        let mut subscription = match self.bus.subscribe(SUBJECT_TOOLCALL_RESPONSE).await {
            Ok(subscription) => subscription,
            Err(error) => {
                tracing::warn!(run_id = %self.run_id, error = %error, "response subscription failed");
                return ToolCallDecision::deny(call_id, "response subscription failed");
            }
        };

        let request = json!({
            "run_id": self.run_id,
            "call_id": call_id,
            "tool": tool,
            "command": command,
            "path": path,
        });
        tracing::debug!(run_id = %self.run_id, tool = tool, call_id = %call_id, "requesting tool call");
        if let Err(error) = self
            .bus
            .publish(SUBJECT_TOOLCALL_REQUEST, request.to_string().into_bytes())
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %error, "tool call request publish failed");
            return ToolCallDecision::deny(call_id, "request publish failed");
        }

        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(run_id = %self.run_id, call_id = %call_id, "tool call response timed out");
                return ToolCallDecision::deny(call_id, "response timeout");
            }

            let next = tokio::time::timeout(remaining, subscription.next()).await;
            let delivery = match next {
                Ok(Some(delivery)) => delivery,
                Ok(None) => return ToolCallDecision::deny(call_id, "response timeout"),
                Err(_) => {
                    tracing::warn!(run_id = %self.run_id, call_id = %call_id, "tool call response timed out");
                    return ToolCallDecision::deny(call_id, "response timeout");
                }
            };

            let Ok(payload) = serde_json::from_slice::<serde_json::Value>(&delivery.payload) else {
                continue;
            };
            if payload.get("call_id").and_then(|v| v.as_str()) != Some(call_id.as_str()) {
                continue;
            }
            subscription.unsubscribe().await;
            return ToolCallDecision {
                call_id,
                decision: payload
                    .get("decision")
                    .and_then(|v| v.as_str())
                    .unwrap_or("deny")
                    .to_string(),
                reason: payload
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            };
        }
    }

    /// Report the outcome of an executed tool call and fold it into the run's
    /// accumulators.
    #[allow(clippy::too_many_arguments)]
    pub async fn report_tool_result(
        &self,
        call_id: &str,
        tool: &str,
        success: bool,
        output: &str,
        error: &str,
        cost_usd: f64,
        tokens_in: u64,
        tokens_out: u64,
        model: &str,
    ) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.step_count += 1;
            counters.total_cost += cost_usd;
            counters.tokens_in += tokens_in;
            counters.tokens_out += tokens_out;
            if !model.is_empty() {
                counters.model = model.to_string();
            }
        }

        let result = json!({
            "run_id": self.run_id,
            "call_id": call_id,
            "tool": tool,
            "success": success,
            "output": output,
            "error": error,
            "cost_usd": cost_usd,
            "tokens_in": tokens_in,
            "tokens_out": tokens_out,
            "model": model,
        });
        if let Err(error) = self
            .bus
            .publish(SUBJECT_TOOLCALL_RESULT, result.to_string().into_bytes())
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %error, "tool result publish failed");
        }
    }

    /// Publish a streaming output line.
    pub async fn send_output(&self, line: &str, stream: &str) {
        let payload = json!({
            "run_id": self.run_id,
            "task_id": self.task_id,
            "line": line,
            "stream": stream,
        });
        if let Err(error) = self
            .bus
            .publish(SUBJECT_RUN_OUTPUT, payload.to_string().into_bytes())
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %error, "output publish failed");
        }
    }

    /// Publish the run's single completion message with accumulated counters.
    /// The heartbeat stops first so completion is the last message emitted.
    pub async fn complete_run(&self, status: &str, output: &str, error: &str) {
        self.stop_heartbeat();

        let message = {
            let counters = self.counters.lock();
            let (step_count, total_cost, tokens_in, tokens_out, model) = match &counters {
                Ok(c) => (c.step_count, c.total_cost, c.tokens_in, c.tokens_out, c.model.clone()),
                Err(_) => (0, 0.0, 0, 0, String::new()),
            };
            RunCompleteMessage {
                run_id: self.run_id.clone(),
                task_id: self.task_id.clone(),
                project_id: self.project_id.clone(),
                status: status.to_string(),
                output: output.to_string(),
                error: error.to_string(),
                cost_usd: total_cost,
                step_count,
                tokens_in,
                tokens_out,
                model,
            }
        };

        if let Err(error) = self
            .bus
            .publish(
                SUBJECT_RUN_COMPLETE,
                serde_json::to_vec(&message).unwrap_or_default(),
            )
            .await
        {
            tracing::warn!(run_id = %self.run_id, error = %error, "completion publish failed");
        }
        tracing::info!(
            run_id = %self.run_id,
            status = status,
            steps = message.step_count,
            cost = message.cost_usd,
            "run completed"
        );
    }
}

impl Drop for RunClient {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if let Ok(mut listeners) = self.cancel_listeners.lock() {
            for handle in listeners.drain(..) {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;

    fn client(bus: Arc<MemoryBus>) -> RunClient {
        RunClient::new(bus, "run-1", "task-1", "proj-1", TerminationConfig::default())
    }

    /// Policy engine stub answering every request with `decision`. Subscribes
    /// before returning so no request can slip past it.
    async fn spawn_policy_stub(bus: Arc<MemoryBus>, decision: &'static str) {
        let mut sub = bus.subscribe(SUBJECT_TOOLCALL_REQUEST).await.unwrap();
        tokio::spawn(async move {
            while let Some(delivery) = sub.next().await {
                let request: serde_json::Value = serde_json::from_slice(&delivery.payload).unwrap();
                let response = json!({
                    "call_id": request["call_id"],
                    "decision": decision,
                    "reason": "",
                });
                bus.publish(SUBJECT_TOOLCALL_RESPONSE, response.to_string().into_bytes())
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn request_allowed_by_policy() {
        let bus = Arc::new(MemoryBus::new());
        spawn_policy_stub(bus.clone(), "allow").await;
        let client = client(bus.clone());

        let decision = client.request_tool_call("read_file", "{}", "").await;
        assert!(decision.is_allowed());
        assert!(!decision.call_id.is_empty());
        assert_eq!(bus.published(SUBJECT_TOOLCALL_REQUEST).len(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_denies_without_publishing() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(bus.clone());
        client.cancel_flag().store(true, Ordering::SeqCst);

        let decision = client.request_tool_call("bash", "ls", "").await;
        assert_eq!(decision.decision, "deny");
        assert_eq!(decision.reason, "run cancelled");
        assert!(bus.published(SUBJECT_TOOLCALL_REQUEST).is_empty());
    }

    #[tokio::test]
    async fn report_updates_accumulators() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(bus.clone());

        client
            .report_tool_result("c1", "bash", true, "ok", "", 0.01, 100, 20, "gpt-4o")
            .await;
        client
            .report_tool_result("c2", "bash", true, "ok", "", 0.02, 50, 10, "")
            .await;

        assert_eq!(client.step_count(), 2);
        assert!((client.total_cost() - 0.03).abs() < 1e-9);
        assert_eq!(bus.published(SUBJECT_TOOLCALL_RESULT).len(), 2);
    }

    #[tokio::test]
    async fn complete_run_carries_counters() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(bus.clone());
        client
            .report_tool_result("c1", "LLM", true, "hello", "", 0.5, 10, 5, "gpt-4o")
            .await;
        client.complete_run("completed", "done", "").await;

        let published = bus.published(SUBJECT_RUN_COMPLETE);
        assert_eq!(published.len(), 1);
        let message: RunCompleteMessage = published[0].json().unwrap();
        assert_eq!(message.status, "completed");
        assert_eq!(message.step_count, 1);
        assert_eq!(message.model, "gpt-4o");
        assert!((message.cost_usd - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cancel_listener_matches_run_id() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(bus.clone());
        client.start_cancel_listener(&[]).await;

        // A different run's cancellation is ignored.
        bus.publish(SUBJECT_RUN_CANCEL, json!({"run_id": "other"}).to_string().into_bytes())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!client.is_cancelled());

        bus.publish(SUBJECT_RUN_CANCEL, json!({"run_id": "run-1"}).to_string().into_bytes())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_cancelled());
    }

    #[tokio::test]
    async fn heartbeat_publishes_until_stopped() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(bus.clone());
        client.start_heartbeat(Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(35)).await;
        client.complete_run("completed", "", "").await;
        let beats = bus.published(SUBJECT_RUN_HEARTBEAT).len();
        assert!(beats >= 2, "expected several heartbeats, got {beats}");

        // No further beats after completion.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(bus.published(SUBJECT_RUN_HEARTBEAT).len(), beats);
    }

    #[tokio::test]
    async fn extra_cancel_subjects_are_honoured() {
        let bus = Arc::new(MemoryBus::new());
        let client = client(bus.clone());
        client.start_cancel_listener(&["conversation.run.cancel"]).await;

        bus.publish(
            "conversation.run.cancel",
            json!({"run_id": "run-1"}).to_string().into_bytes(),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.is_cancelled());
    }
}
