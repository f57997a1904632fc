//! Bus consumer: subscribes to the worker's subjects and dispatches each
//! message to its handler.
//!
//! The `Consumer` holds the shared dependencies (bus, LLM client, retrieval
//! and graph subsystems, database) and a table of subject → handler routes.
//! Each subscription runs an independent pump loop. On handler failure the
//! pump applies the retry policy: fail-safe routes publish an
//! error-populated reply first so remote waiters never block, then the
//! message is naked until the retry bound moves it to `<subject>.dlq`.

pub mod subjects;

mod conversation;
mod evaluation;
mod graph;
mod handoff;
mod memory;
mod qualitygate;
mod repomap;
mod retrieval;
mod runs;
mod tasks;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::bus::{Bus, BusError, BusSubscription, Delivery, Headers, HEADER_REQUEST_ID};
use crate::config::WorkerSettings;
use crate::context::graph::{CodeGraphBuilder, GraphSearcher};
use crate::context::repomap::RepoMapGenerator;
use crate::context::retrieval::HybridRetriever;
use crate::context::subagent::RetrievalSubAgent;
use crate::db::Database;
use crate::llm::LlmProvider;
use crate::memory::MemoryStore;
use crate::qualitygate::QualityGateExecutor;

use subjects::*;

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

type HandlerResult = Result<(), String>;
type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;
type HandlerFn = fn(Arc<Consumer>, Delivery) -> HandlerFuture;

/// Fail-safe reply published before nak'ing a failed request/reply handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorReply {
    None,
    RetrievalSearch,
    SubagentSearch,
    GraphSearch,
    ConversationComplete,
}

struct Route {
    subject: &'static str,
    handler: HandlerFn,
    error_reply: ErrorReply,
    /// Ack instead of nak on failure (handlers where redelivery cannot help).
    ack_on_error: bool,
}

/// Consumes messages from the bus and dispatches them to handlers.
pub struct Consumer {
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) llm: Arc<dyn LlmProvider>,
    pub(crate) retriever: Arc<HybridRetriever>,
    pub(crate) subagent: RetrievalSubAgent,
    pub(crate) repomap: Arc<RepoMapGenerator>,
    pub(crate) graph_builder: Arc<CodeGraphBuilder>,
    pub(crate) graph_searcher: Arc<GraphSearcher>,
    pub(crate) gate_executor: QualityGateExecutor,
    pub(crate) memory_store: MemoryStore,
    pub(crate) db: Database,
    pub(crate) settings: WorkerSettings,
    running: AtomicBool,
}

impl Consumer {
    pub fn new(
        bus: Arc<dyn Bus>,
        llm: Arc<dyn LlmProvider>,
        db: Database,
        settings: WorkerSettings,
    ) -> Arc<Self> {
        let retriever = Arc::new(HybridRetriever::new(llm.clone()));
        let subagent = RetrievalSubAgent::new(retriever.clone(), llm.clone());
        let memory_store = MemoryStore::new(db.clone(), llm.clone());
        Arc::new(Self {
            bus,
            llm,
            retriever,
            subagent,
            repomap: Arc::new(RepoMapGenerator::new()),
            graph_builder: Arc::new(CodeGraphBuilder::new()),
            graph_searcher: Arc::new(GraphSearcher::new()),
            gate_executor: QualityGateExecutor::new(),
            memory_store,
            db,
            settings,
            running: AtomicBool::new(false),
        })
    }

    /// Subject table: one durable subscription per entry.
    fn routes() -> Vec<Route> {
        fn route(subject: &'static str, handler: HandlerFn) -> Route {
            Route {
                subject,
                handler,
                error_reply: ErrorReply::None,
                ack_on_error: false,
            }
        }

        fn fail_safe(subject: &'static str, handler: HandlerFn, reply: ErrorReply) -> Route {
            Route {
                subject,
                handler,
                error_reply: reply,
                ack_on_error: false,
            }
        }

        fn ack_on_error(subject: &'static str, handler: HandlerFn) -> Route {
            Route {
                subject,
                handler,
                error_reply: ErrorReply::None,
                ack_on_error: true,
            }
        }

        vec![
            route(SUBJECT_AGENT, |c, d| Box::pin(async move { c.handle_task(d).await })),
            route(SUBJECT_RUN_START, |c, d| {
                Box::pin(async move { c.handle_run_start(d).await })
            }),
            route(SUBJECT_QG_REQUEST, |c, d| {
                Box::pin(async move { c.handle_quality_gate(d).await })
            }),
            route(SUBJECT_REPOMAP_REQUEST, |c, d| {
                Box::pin(async move { c.handle_repomap(d).await })
            }),
            route(SUBJECT_RETRIEVAL_INDEX_REQUEST, |c, d| {
                Box::pin(async move { c.handle_retrieval_index(d).await })
            }),
            fail_safe(
                SUBJECT_RETRIEVAL_SEARCH_REQUEST,
                |c, d| Box::pin(async move { c.handle_retrieval_search(d).await }),
                ErrorReply::RetrievalSearch,
            ),
            fail_safe(
                SUBJECT_SUBAGENT_SEARCH_REQUEST,
                |c, d| Box::pin(async move { c.handle_subagent_search(d).await }),
                ErrorReply::SubagentSearch,
            ),
            route(SUBJECT_GRAPH_BUILD_REQUEST, |c, d| {
                Box::pin(async move { c.handle_graph_build(d).await })
            }),
            fail_safe(
                SUBJECT_GRAPH_SEARCH_REQUEST,
                |c, d| Box::pin(async move { c.handle_graph_search(d).await }),
                ErrorReply::GraphSearch,
            ),
            Route {
                subject: SUBJECT_CONVERSATION_RUN_START,
                handler: |c, d| Box::pin(async move { c.handle_conversation_run(d).await }),
                error_reply: ErrorReply::ConversationComplete,
                ack_on_error: true,
            },
            route(SUBJECT_EVAL_GEMMAS_REQUEST, |c, d| {
                Box::pin(async move { c.handle_gemmas_eval(d).await })
            }),
            ack_on_error(SUBJECT_MEMORY_STORE, |c, d| {
                Box::pin(async move { c.handle_memory_store(d).await })
            }),
            ack_on_error(SUBJECT_MEMORY_RECALL, |c, d| {
                Box::pin(async move { c.handle_memory_recall(d).await })
            }),
            ack_on_error(SUBJECT_HANDOFF_REQUEST, |c, d| {
                Box::pin(async move { c.handle_handoff_request(d).await })
            }),
        ]
    }

    /// Ensure the stream, create all subscriptions, and spawn one pump loop
    /// per subject. Returns once every subscription is live.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<JoinHandle<()>>, BusError> {
        self.bus.ensure_stream().await?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            service = %self.settings.log_service,
            env = %self.settings.app_env,
            "consumer starting"
        );

        let mut handles = Vec::new();
        for route in Self::routes() {
            let subscription = self.bus.durable_subscribe(route.subject).await?;
            tracing::info!(subject = route.subject, "subscribed");
            handles.push(tokio::spawn(Self::pump(self.clone(), subscription, route)));
        }
        Ok(handles)
    }

    /// Start and block until every pump loop exits.
    pub async fn run(self: &Arc<Self>) -> Result<(), BusError> {
        let handles = self.start().await?;
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Flip the running flag and drain the bus with a bounded deadline.
    pub async fn stop(&self) {
        tracing::info!("stopping consumer");
        self.running.store(false, Ordering::SeqCst);
        if let Err(error) = self.bus.drain(DRAIN_DEADLINE).await {
            tracing::warn!(error = %error, "bus drain failed");
        }
        tracing::info!("consumer stopped");
    }

    /// Generic message pump shared by all subscriptions.
    async fn pump(consumer: Arc<Consumer>, mut subscription: Box<dyn BusSubscription>, route: Route) {
        while consumer.running.load(Ordering::SeqCst) {
            let Some(delivery) = subscription.next().await else {
                break;
            };
            match (route.handler)(consumer.clone(), delivery.clone()).await {
                Ok(()) => delivery.ack().await,
                Err(error) => {
                    tracing::error!(subject = route.subject, error = %error, "handler failed");
                    consumer.publish_error_reply(route.error_reply, &delivery).await;
                    if route.ack_on_error {
                        delivery.ack().await;
                    } else if delivery.retry_count() >= MAX_RETRIES {
                        tracing::warn!(
                            subject = route.subject,
                            retry = delivery.retry_count(),
                            "max retries reached, moving to DLQ"
                        );
                        consumer.move_to_dlq(&delivery).await;
                    } else {
                        delivery.nak().await;
                    }
                }
            }
        }
    }

    /// Republish a poisoned message to `<subject>.dlq` with its headers
    /// preserved, then ack the original.
    async fn move_to_dlq(&self, delivery: &Delivery) {
        let dlq_subject = format!("{}.dlq", delivery.subject);
        match self
            .bus
            .publish_with_headers(&dlq_subject, &delivery.headers, delivery.payload.clone())
            .await
        {
            Ok(()) => tracing::warn!(dlq_subject = %dlq_subject, "message moved to DLQ"),
            Err(error) => {
                tracing::error!(dlq_subject = %dlq_subject, error = %error, "failed to publish to DLQ")
            }
        }
        delivery.ack().await;
    }

    /// Publish a streaming output line for a task, propagating the caller's
    /// correlation id.
    pub(crate) async fn publish_output(&self, task_id: &str, line: &str, stream: &str, request_id: &str) {
        let payload = serde_json::json!({
            "task_id": task_id,
            "line": line,
            "stream": stream,
        });
        let mut headers = Headers::new();
        if !request_id.is_empty() {
            headers.insert(HEADER_REQUEST_ID.to_string(), request_id.to_string());
        }
        if let Err(error) = self
            .bus
            .publish_with_headers(SUBJECT_OUTPUT, &headers, payload.to_string().into_bytes())
            .await
        {
            tracing::warn!(error = %error, "output publish failed");
        }
    }

    pub(crate) async fn publish_json<T: serde::Serialize>(&self, subject: &str, message: &T) -> Result<(), String> {
        let payload = serde_json::to_vec(message).map_err(|e| e.to_string())?;
        self.bus.publish(subject, payload).await.map_err(|e| e.to_string())
    }

    /// Fail-safe replies so bounded-wait RPC callers get an answer even when
    /// the handler crashed.
    async fn publish_error_reply(&self, reply: ErrorReply, delivery: &Delivery) {
        match reply {
            ErrorReply::None => {}
            ErrorReply::RetrievalSearch => self.publish_retrieval_search_error(delivery).await,
            ErrorReply::SubagentSearch => self.publish_subagent_search_error(delivery).await,
            ErrorReply::GraphSearch => self.publish_graph_search_error(delivery).await,
            ErrorReply::ConversationComplete => self.publish_conversation_error(delivery).await,
        }
    }
}
