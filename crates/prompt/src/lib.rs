//! Prompt system for KGQA.
//!
//! This crate provides structured prompt management with:
//! - YAML-based prompt definitions (system + user templates)
//! - Handlebars template rendering
//! - A built-in library with per-workspace overrides

pub mod builder;
pub mod library;
pub mod loader;
pub mod types;

// Re-export main types
pub use builder::build_prompt;
pub use library::{PromptLibrary, PromptSource};
pub use loader::{list_prompts, load_prompt};
pub use types::{
    BuiltPrompt, BuiltPromptMetadata, PromptBehavior, PromptDefinition, PromptInputSpec,
    PromptOutputSpec,
};
