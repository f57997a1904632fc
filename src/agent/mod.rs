//! The agent loop: LLM calls tools, tools execute, results feed back.

mod loop_;

pub use loop_::{AgentLoopExecutor, AgentLoopResult, LoopConfig, DEFAULT_MAX_ITERATIONS};
