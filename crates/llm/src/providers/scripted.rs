//! Deterministic in-process provider.
//!
//! Returns canned responses chosen by substring rules over the request
//! transcript. Used by tests across the workspace and for offline runs.

use crate::client::{LlmClient, LlmRequest, LlmResponse, LlmUsage};
use kgqa_core::{AppError, AppResult};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A client that answers from a fixed rule list.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    rules: Vec<(String, String)>,
    fallback: String,
    failing: bool,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client whose every call fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Answer `response` whenever the transcript contains `needle`.
    /// Rules are checked in insertion order.
    pub fn with_rule(mut self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push((needle.into(), response.into()));
        self
    }

    /// Response used when no rule matches.
    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = response.into();
        self
    }

    /// Number of completions requested so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedClient {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &LlmRequest) -> AppResult<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.failing {
            return Err(AppError::Llm("scripted failure".to_string()));
        }

        let transcript = request.transcript();
        let content = self
            .rules
            .iter()
            .find(|(needle, _)| transcript.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.fallback.clone());

        Ok(LlmResponse {
            usage: LlmUsage::new(
                transcript.split_whitespace().count() as u32,
                content.split_whitespace().count() as u32,
            ),
            content,
            model: request.model.clone(),
            done: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_matching_rule_wins() {
        let client = ScriptedClient::new()
            .with_rule("panel", "panel answer")
            .with_rule("detector", "detector answer")
            .with_fallback("nothing");

        let response = client
            .complete(&LlmRequest::new("which detector for this panel", "m"))
            .await
            .unwrap();
        assert_eq!(response.content, "panel answer");

        let response = client
            .complete(&LlmRequest::new("hello", "m"))
            .await
            .unwrap();
        assert_eq!(response.content, "nothing");
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_failing_client_counts_calls() {
        let client = ScriptedClient::failing();
        assert!(client.complete(&LlmRequest::new("x", "m")).await.is_err());
        assert_eq!(client.calls(), 1);
    }
}
