//! Content-addressed response cache.
//!
//! One JSON file per entry, named by the SHA-256 of the request's
//! messages, model and sampling parameters. Entries expire after a TTL
//! (checked lazily on read and eagerly by periodic sweeps) and the
//! directory is kept under a byte budget by evicting the oldest-modified
//! files first. All I/O is local and synchronous; an unreadable entry is
//! deleted and reported as a miss.

use crate::client::{ChatMessage, LlmRequest, LlmResponse};
use chrono::{DateTime, Utc};
use kgqa_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub ttl: Duration,
    pub max_bytes: u64,
    pub sweep_interval: Duration,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl: Duration::from_secs(24 * 3600),
            max_bytes: 100 * 1024 * 1024,
            sweep_interval: Duration::from_secs(600),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Build from the workspace settings.
    pub fn from_settings(dir: PathBuf, settings: &kgqa_core::config::CacheSettings) -> Self {
        Self {
            dir,
            ttl: Duration::from_secs(settings.ttl_hours * 3600),
            max_bytes: settings.max_size_mb * 1024 * 1024,
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
        }
    }
}

/// A stored completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub response: String,
    pub model: String,
    pub token_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Snapshot of cache activity and footprint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub saves: u64,
    pub evictions: u64,
    pub expired: u64,
    pub hit_rate: f64,
    pub entries: usize,
    pub total_bytes: u64,
}

/// Fields that determine a completion; serialized to form the key.
#[derive(Serialize)]
struct KeyMaterial<'a> {
    messages: &'a [ChatMessage],
    model: &'a str,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
}

/// Derive the cache key for a request.
pub fn cache_key(request: &LlmRequest) -> String {
    let material = KeyMaterial {
        messages: &request.messages,
        model: &request.model,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        top_p: request.top_p,
    };
    // Serializing plain structs and strings cannot fail.
    let canonical = serde_json::to_vec(&material).unwrap_or_default();
    format!("{:x}", Sha256::digest(&canonical))
}

/// File-backed response cache.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    saves: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    last_sweep: AtomicU64,
}

impl ResponseCache {
    /// Open (creating if needed) the cache directory and sweep expired
    /// entries.
    pub fn open(config: CacheConfig) -> AppResult<Self> {
        std::fs::create_dir_all(&config.dir).map_err(|e| {
            AppError::Cache(format!(
                "Failed to create cache directory {:?}: {}",
                config.dir, e
            ))
        })?;

        let cache = Self {
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            saves: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            last_sweep: AtomicU64::new(0),
        };

        let removed = cache.sweep();
        tracing::debug!(
            "Opened response cache at {:?} ({} stale entries removed)",
            cache.config.dir,
            removed
        );
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.config.dir.join(format!("{}.json", key))
    }

    /// Look up an entry. Expired and corrupted entries are removed and
    /// reported as misses.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.maybe_sweep();

        let path = self.entry_path(key);
        if !path.exists() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match read_entry(&path) {
            Some(entry) if !self.is_expired(&entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache hit for {}", key.get(..12).unwrap_or(key));
                Some(entry)
            }
            Some(_) => {
                self.expired.fetch_add(1, Ordering::Relaxed);
                remove_quietly(&path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                tracing::warn!("Discarding corrupted cache entry {:?}", path);
                remove_quietly(&path);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a response under `key`, then enforce the byte budget.
    pub fn put(&self, key: &str, response: &LlmResponse) -> AppResult<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            response: response.content.clone(),
            model: response.model.clone(),
            token_count: response.usage.completion_tokens,
            created_at: Utc::now(),
        };
        self.put_entry(&entry)?;
        self.saves.fetch_add(1, Ordering::Relaxed);
        self.enforce_budget();
        Ok(())
    }

    pub(crate) fn put_entry(&self, entry: &CacheEntry) -> AppResult<()> {
        let path = self.entry_path(&entry.key);
        let contents = serde_json::to_vec_pretty(entry)?;
        std::fs::write(&path, contents)
            .map_err(|e| AppError::Cache(format!("Failed to write cache entry {:?}: {}", path, e)))
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        Utc::now()
            .signed_duration_since(entry.created_at)
            .to_std()
            .map(|age| age > self.config.ttl)
            .unwrap_or(false)
    }

    fn maybe_sweep(&self) {
        let now = unix_now();
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= self.config.sweep_interval.as_secs() {
            self.sweep();
        }
    }

    /// Remove every expired or unreadable entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        self.last_sweep.store(unix_now(), Ordering::Relaxed);

        let mut removed = 0;
        for file in self.entry_files() {
            let stale = match read_entry(&file.path) {
                Some(entry) => self.is_expired(&entry),
                None => true,
            };
            if stale {
                remove_quietly(&file.path);
                self.expired.fetch_add(1, Ordering::Relaxed);
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!("Cache sweep removed {} entries", removed);
        }
        removed
    }

    fn enforce_budget(&self) {
        let mut files = self.entry_files();
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        if total <= self.config.max_bytes {
            return;
        }

        files.sort_by_key(|f| f.modified);
        for file in files {
            if total <= self.config.max_bytes {
                break;
            }
            remove_quietly(&file.path);
            total = total.saturating_sub(file.size);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!("Cache evicted down to {} bytes", total);
    }

    /// Delete every entry. Returns the number removed.
    pub fn clear(&self) -> AppResult<usize> {
        let files = self.entry_files();
        for file in &files {
            std::fs::remove_file(&file.path).map_err(|e| {
                AppError::Cache(format!("Failed to remove {:?}: {}", file.path, e))
            })?;
        }
        tracing::info!("Cleared {} cache entries", files.len());
        Ok(files.len())
    }

    pub fn stats(&self) -> CacheStats {
        let files = self.entry_files();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            hits,
            misses,
            saves: self.saves.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            entries: files.len(),
            total_bytes: files.iter().map(|f| f.size).sum(),
        }
    }

    fn entry_files(&self) -> Vec<EntryFile> {
        let Ok(dir) = std::fs::read_dir(&self.config.dir) else {
            return Vec::new();
        };

        dir.filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| {
                let meta = e.metadata().ok()?;
                Some(EntryFile {
                    path: e.path(),
                    size: meta.len(),
                    modified: meta.modified().unwrap_or(UNIX_EPOCH),
                })
            })
            .collect()
    }
}

struct EntryFile {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

fn read_entry(path: &Path) -> Option<CacheEntry> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        tracing::debug!("Failed to remove cache file {:?}: {}", path, e);
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LlmUsage;
    use tempfile::TempDir;

    fn response(content: &str) -> LlmResponse {
        LlmResponse {
            content: content.to_string(),
            model: "llama3.2".to_string(),
            usage: LlmUsage::new(10, 5),
            done: true,
        }
    }

    #[test]
    fn test_key_depends_on_sampling_params() {
        let base = LlmRequest::new("prompt", "llama3.2").with_temperature(0.1);
        let same = LlmRequest::new("prompt", "llama3.2").with_temperature(0.1);
        let hotter = LlmRequest::new("prompt", "llama3.2").with_temperature(0.7);
        let capped = base.clone().with_max_tokens(500);

        assert_eq!(cache_key(&base), cache_key(&same));
        assert_ne!(cache_key(&base), cache_key(&hotter));
        assert_ne!(cache_key(&base), cache_key(&capped));
        assert_eq!(cache_key(&base).len(), 64);
    }

    #[test]
    fn test_put_then_get() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::open(CacheConfig::new(temp.path())).unwrap();

        assert!(cache.get("abc").is_none());
        cache.put("abc", &response("cached text")).unwrap();

        let entry = cache.get("abc").unwrap();
        assert_eq!(entry.response, "cached text");
        assert_eq!(entry.token_count, 5);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.saves, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_expired_entry_is_miss_and_removed() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::open(
            CacheConfig::new(temp.path()).with_ttl(Duration::from_secs(3600)),
        )
        .unwrap();

        cache
            .put_entry(&CacheEntry {
                key: "old".to_string(),
                response: "stale".to_string(),
                model: "llama3.2".to_string(),
                token_count: 1,
                created_at: Utc::now() - chrono::Duration::hours(2),
            })
            .unwrap();

        assert!(cache.get("old").is_none());
        assert!(!temp.path().join("old.json").exists());
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn test_corrupted_entry_is_deleted() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::open(CacheConfig::new(temp.path())).unwrap();

        std::fs::write(temp.path().join("bad.json"), b"{ not json").unwrap();
        assert!(cache.get("bad").is_none());
        assert!(!temp.path().join("bad.json").exists());
    }

    #[test]
    fn test_sweep_at_open_removes_expired() {
        let temp = TempDir::new().unwrap();
        {
            let cache = ResponseCache::open(CacheConfig::new(temp.path())).unwrap();
            cache
                .put_entry(&CacheEntry {
                    key: "ancient".to_string(),
                    response: "x".to_string(),
                    model: "m".to_string(),
                    token_count: 0,
                    created_at: Utc::now() - chrono::Duration::days(3),
                })
                .unwrap();
            cache.put("fresh", &response("y")).unwrap();
        }

        let reopened = ResponseCache::open(CacheConfig::new(temp.path())).unwrap();
        assert!(!temp.path().join("ancient.json").exists());
        assert_eq!(reopened.stats().entries, 1);
    }

    #[test]
    fn test_budget_evicts_oldest_first() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::open(CacheConfig::new(temp.path())).unwrap();

        cache.put("first", &response(&"a".repeat(400))).unwrap();
        let one_entry = cache.stats().total_bytes;

        let old = SystemTime::now() - Duration::from_secs(600);
        std::fs::File::options()
            .write(true)
            .open(temp.path().join("first.json"))
            .unwrap()
            .set_modified(old)
            .unwrap();

        let tight = ResponseCache::open(
            CacheConfig::new(temp.path()).with_max_bytes(one_entry + one_entry / 2),
        )
        .unwrap();
        tight.put("second", &response(&"b".repeat(400))).unwrap();

        assert!(!temp.path().join("first.json").exists());
        assert!(temp.path().join("second.json").exists());
        assert_eq!(tight.stats().evictions, 1);
    }

    #[test]
    fn test_clear() {
        let temp = TempDir::new().unwrap();
        let cache = ResponseCache::open(CacheConfig::new(temp.path())).unwrap();
        cache.put("a", &response("1")).unwrap();
        cache.put("b", &response("2")).unwrap();

        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.stats().entries, 0);
    }
}
