//! Transparent caching wrapper around any `LlmClient`.

use crate::cache::{cache_key, ResponseCache};
use crate::client::{LlmClient, LlmRequest, LlmResponse, LlmUsage};
use kgqa_core::AppResult;
use std::sync::Arc;

/// An `LlmClient` that consults a `ResponseCache` before delegating.
pub struct CachedClient {
    inner: Arc<dyn LlmClient>,
    cache: Arc<ResponseCache>,
}

impl CachedClient {
    pub fn new(inner: Arc<dyn LlmClient>, cache: Arc<ResponseCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }
}

#[async_trait::async_trait]
impl LlmClient for CachedClient {
    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    async fn complete(&self, request: &LlmRequest) -> AppResult<LlmResponse> {
        let key = cache_key(request);

        if let Some(entry) = self.cache.get(&key) {
            return Ok(LlmResponse {
                content: entry.response,
                model: entry.model,
                usage: LlmUsage::new(0, entry.token_count),
                done: true,
            });
        }

        let response = self.inner.complete(request).await?;

        // A failed write only costs a future miss.
        if let Err(e) = self.cache.put(&key, &response) {
            tracing::warn!("Failed to cache completion: {}", e);
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::providers::ScriptedClient;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_second_identical_call_is_served_from_cache() {
        let temp = TempDir::new().unwrap();
        let scripted = Arc::new(ScriptedClient::new().with_fallback("fresh answer"));
        let cache = Arc::new(ResponseCache::open(CacheConfig::new(temp.path())).unwrap());
        let client = CachedClient::new(scripted.clone(), cache.clone());

        let request = LlmRequest::new("What base does a 4098-9714 need?", "llama3.2")
            .with_temperature(0.1)
            .with_max_tokens(500);

        let first = client.complete(&request).await.unwrap();
        let second = client.complete(&request).await.unwrap();

        assert_eq!(first.content, "fresh answer");
        assert_eq!(second.content, first.content);
        assert_eq!(scripted.calls(), 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_different_params_miss() {
        let temp = TempDir::new().unwrap();
        let scripted = Arc::new(ScriptedClient::new().with_fallback("x"));
        let cache = Arc::new(ResponseCache::open(CacheConfig::new(temp.path())).unwrap());
        let client = CachedClient::new(scripted.clone(), cache);

        let request = LlmRequest::new("same prompt", "llama3.2").with_temperature(0.1);
        client.complete(&request).await.unwrap();
        client
            .complete(&request.clone().with_temperature(0.05))
            .await
            .unwrap();

        assert_eq!(scripted.calls(), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let temp = TempDir::new().unwrap();
        let cache = Arc::new(ResponseCache::open(CacheConfig::new(temp.path())).unwrap());
        let client = CachedClient::new(Arc::new(ScriptedClient::failing()), cache.clone());

        assert!(client.complete(&LlmRequest::new("q", "m")).await.is_err());
        assert_eq!(cache.stats().entries, 0);
    }
}
