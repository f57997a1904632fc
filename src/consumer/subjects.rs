//! Stream and subject constants for the worker's bus traffic.

pub const STREAM_NAME: &str = "CODEFORGE";

/// Subject wildcards declared on the worker stream.
pub const STREAM_SUBJECTS: &[&str] = &[
    "tasks.>",
    "agents.>",
    "runs.>",
    "context.>",
    "repomap.>",
    "retrieval.>",
    "graph.>",
    "conversation.>",
    "benchmark.>",
    "evaluation.>",
    "memory.>",
    "handoff.>",
];

// Task subjects
pub const SUBJECT_AGENT: &str = "tasks.agent.*";
pub const SUBJECT_RESULT: &str = "tasks.result";
pub const SUBJECT_OUTPUT: &str = "tasks.output";

// Run subjects
pub const SUBJECT_RUN_START: &str = "runs.start";

// Quality gate
pub const SUBJECT_QG_REQUEST: &str = "runs.qualitygate.request";
pub const SUBJECT_QG_RESULT: &str = "runs.qualitygate.result";

// Repomap
pub const SUBJECT_REPOMAP_REQUEST: &str = "repomap.generate.request";
pub const SUBJECT_REPOMAP_RESULT: &str = "repomap.generate.result";

// Retrieval
pub const SUBJECT_RETRIEVAL_INDEX_REQUEST: &str = "retrieval.index.request";
pub const SUBJECT_RETRIEVAL_INDEX_RESULT: &str = "retrieval.index.result";
pub const SUBJECT_RETRIEVAL_SEARCH_REQUEST: &str = "retrieval.search.request";
pub const SUBJECT_RETRIEVAL_SEARCH_RESULT: &str = "retrieval.search.result";
pub const SUBJECT_SUBAGENT_SEARCH_REQUEST: &str = "retrieval.subagent.request";
pub const SUBJECT_SUBAGENT_SEARCH_RESULT: &str = "retrieval.subagent.result";

// Graph
pub const SUBJECT_GRAPH_BUILD_REQUEST: &str = "graph.build.request";
pub const SUBJECT_GRAPH_BUILD_RESULT: &str = "graph.build.result";
pub const SUBJECT_GRAPH_SEARCH_REQUEST: &str = "graph.search.request";
pub const SUBJECT_GRAPH_SEARCH_RESULT: &str = "graph.search.result";

// Conversation
pub const SUBJECT_CONVERSATION_RUN_START: &str = "conversation.run.start";
pub const SUBJECT_CONVERSATION_RUN_COMPLETE: &str = "conversation.run.complete";
pub const SUBJECT_CONVERSATION_RUN_CANCEL: &str = "conversation.run.cancel";

// Evaluation
pub const SUBJECT_EVAL_GEMMAS_REQUEST: &str = "evaluation.gemmas.request";
pub const SUBJECT_EVAL_GEMMAS_RESULT: &str = "evaluation.gemmas.result";

// Memory
pub const SUBJECT_MEMORY_STORE: &str = "memory.store";
pub const SUBJECT_MEMORY_RECALL: &str = "memory.recall";
pub const SUBJECT_MEMORY_RECALL_RESULT: &str = "memory.recall.result";

// Handoff
pub const SUBJECT_HANDOFF_REQUEST: &str = "handoff.request";
pub const SUBJECT_HANDOFF_EXECUTE: &str = "handoff.execute";

/// Redeliveries tolerated before a message moves to the dead-letter subject.
pub const MAX_RETRIES: u32 = 3;
