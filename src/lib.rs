pub mod agent;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod context;
pub mod db;
pub mod evaluation;
pub mod health;
pub mod history;
pub mod llm;
pub mod logging;
pub mod mcp;
pub mod memory;
pub mod models;
pub mod pricing;
pub mod protocol;
pub mod qualitygate;
pub mod tools;

/// Convenience re-exports for the most commonly used traits and types across
/// the worker codebase.
pub mod prelude {
    // Message bus
    pub use crate::bus::{Bus, BusError, Delivery, Headers, MemoryBus, NatsBus};

    // LLM gateway
    pub use crate::llm::{ChatRequest, LiteLlmClient, LlmProvider, WireMessage};

    // Agent loop
    pub use crate::agent::{AgentLoopExecutor, LoopConfig};

    // Run protocol
    pub use crate::protocol::RunClient;

    // Tool system
    pub use crate::tools::{ToolDefinition, ToolExecutor, ToolRegistry, ToolResult};

    // Context assembly
    pub use crate::context::graph::{CodeGraphBuilder, GraphSearcher};
    pub use crate::context::repomap::RepoMapGenerator;
    pub use crate::context::retrieval::HybridRetriever;
    pub use crate::context::subagent::RetrievalSubAgent;

    // Configuration
    pub use crate::config::WorkerSettings;
}
