//! Error types for the KGQA engine.
//!
//! This module defines a unified error enum that covers all error categories
//! in the workspace: configuration, I/O, completion service, graph store,
//! prompts, the response cache and timeouts.

use thiserror::Error;

/// Unified error type for the KGQA workspace.
///
/// All fallible functions return `Result<T, AppError>`.
/// Component failures inside a query run are logged and degraded by the
/// engine; only setup errors reach the caller.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O and filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Completion service errors
    #[error("LLM error: {0}")]
    Llm(String),

    /// Graph store errors
    #[error("Graph error: {0}")]
    Graph(String),

    /// Prompt system errors
    #[error("Prompt error: {0}")]
    Prompt(String),

    /// Response cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An external call exceeded its deadline
    #[error("Timed out after {0}s: {1}")]
    Timeout(u64, String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
