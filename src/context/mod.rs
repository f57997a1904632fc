//! Context assembly: repo map, hybrid retrieval, retrieval sub-agent, and
//! code graph. Each subsystem produces a pre-packed payload suitable for
//! injection into a run's system prompt.

pub mod graph;
pub mod repomap;
pub mod retrieval;
pub mod subagent;
pub mod treesitter;
