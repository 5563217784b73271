//! Command handlers for the KGQA CLI.
//!
//! This module organizes all CLI commands into separate submodules.

pub mod ask;
pub mod cache;
pub mod graph;
pub mod prompts;

// Re-export command types for convenience
pub use ask::AskCommand;
pub use cache::CacheCommand;
pub use graph::GraphCommand;
pub use prompts::PromptsCommand;
