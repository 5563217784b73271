//! LLM integration crate for KGQA.
//!
//! This crate provides a provider-agnostic abstraction for the external
//! text-completion service, plus a content-addressed response cache that
//! wraps any provider transparently.
//!
//! # Providers
//! - **Ollama**: Local LLM runtime (default)
//! - **OpenAI**: Any OpenAI-compatible chat completions endpoint
//! - **Scripted**: Deterministic canned responses for tests
//!
//! # Example
//! ```no_run
//! use kgqa_llm::{LlmClient, LlmRequest, providers::OllamaClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OllamaClient::new();
//! let request = LlmRequest::new("Hello, world!", "llama3.2");
//! let response = client.complete(&request).await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cached;
pub mod client;
pub mod factory;
pub mod providers;
pub mod types;

// Re-export main types
pub use cache::{cache_key, CacheConfig, CacheEntry, CacheStats, ResponseCache};
pub use cached::CachedClient;
pub use client::{ChatMessage, LlmClient, LlmRequest, LlmResponse, LlmUsage, Role};
pub use factory::{client_from_config, create_client};
pub use providers::{OllamaClient, OpenAiClient, ScriptedClient};
pub use types::ProviderType;
