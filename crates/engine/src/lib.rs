//! Graph-grounded question answering.
//!
//! Answers questions about fire alarm systems by combining completion
//! calls with iterative retrieval from a product knowledge graph.

pub mod analyzer;
pub mod cancel;
pub mod config;
pub mod extract;
pub mod graph;
pub mod judge;
pub mod linker;
pub mod orchestrator;
pub mod retriever;
pub mod scoring;
pub mod session;
pub mod synthesis;
pub mod types;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::EngineConfig;
pub use graph::{GraphSchema, GraphStore, SqliteGraph};
pub use judge::{HeuristicJudge, Judge, LlmJudge, Verdict, Winner};
pub use orchestrator::Orchestrator;
pub use types::{BoqItem, EvidenceItem, QueryAnswer, QueryMetadata, SelectionMethod};
