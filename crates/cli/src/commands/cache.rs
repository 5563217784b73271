//! Cache command handler.
//!
//! Inspects and maintains the on-disk response cache.

use clap::{Args, Subcommand};
use kgqa_core::{config::AppConfig, AppResult};
use kgqa_llm::{CacheConfig, ResponseCache};

/// Response cache maintenance
#[derive(Args, Debug)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show entry count and size
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every cached response
    Clear,
    /// Remove expired and unreadable entries
    Sweep,
}

impl CacheCommand {
    pub fn execute(&self, config: &AppConfig) -> AppResult<()> {
        tracing::info!("Executing cache command");

        let cache = ResponseCache::open(CacheConfig::from_settings(
            config.cache_dir(),
            &config.cache,
        ))?;

        match &self.action {
            CacheAction::Stats { json } => {
                let stats = cache.stats();
                if *json {
                    let output = serde_json::json!({
                        "dir": cache.config().dir,
                        "enabled": config.cache.enabled,
                        "entries": stats.entries,
                        "totalBytes": stats.total_bytes,
                        "maxBytes": cache.config().max_bytes,
                        "ttlSecs": cache.config().ttl.as_secs(),
                        "expiredOnOpen": stats.expired,
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                } else {
                    println!("Cache directory: {}", cache.config().dir.display());
                    println!("Enabled:         {}", config.cache.enabled);
                    println!("Entries:         {}", stats.entries);
                    println!(
                        "Size:            {} / {} bytes",
                        stats.total_bytes,
                        cache.config().max_bytes
                    );
                    println!("TTL:             {}s", cache.config().ttl.as_secs());
                }
            }
            CacheAction::Clear => {
                let removed = cache.clear()?;
                println!("Removed {} cached response(s)", removed);
            }
            CacheAction::Sweep => {
                // Opening the cache already swept once; report both passes
                cache.sweep();
                println!("Removed {} stale cached response(s)", cache.stats().expired);
            }
        }

        Ok(())
    }
}
