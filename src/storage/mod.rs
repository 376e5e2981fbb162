pub mod memory;
pub mod redis_store;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::cli::config::StoreSettings;

// Re-export common types
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Errors raised by a store backend
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Outcome of one sliding-window admission attempt
#[derive(Debug, Clone, PartialEq)]
pub struct WindowAdmission {
    /// Whether the member was inserted
    pub allowed: bool,
    /// Members in the window before this attempt
    pub count: u64,
    /// Lowest score left in the window after this attempt
    pub oldest: Option<f64>,
}

/// Contract the rate limiter and the response cache need from a shared store.
///
/// Every method is a single logical operation; `sliding_window_admit` in
/// particular must prune, count and conditionally insert atomically.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Check the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;

    /// Drop members of the sorted set `key` scored below `now - window`,
    /// count what remains and, when the count is below `max`, add `member`
    /// at score `now` and refresh the key's expiry to `window`.
    async fn sliding_window_admit(
        &self,
        key: &str,
        now: f64,
        window: Duration,
        max: u64,
        member: &str,
    ) -> Result<WindowAdmission, StoreError>;

    /// Prune scores below `min_score` and return the remaining ones, ascending
    async fn window_scores(&self, key: &str, min_score: f64) -> Result<Vec<f64>, StoreError>;

    /// Value and remaining TTL (seconds, `-1` for no expiry), read together
    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, i64)>, StoreError>;

    /// Store a string value that expires after `ttl`
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete keys, returning how many existed
    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Remaining TTL in seconds; `None` when the key is missing, `-1` for no expiry
    async fn ttl(&self, key: &str) -> Result<Option<i64>, StoreError>;

    /// All live keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Increment one counter of the hash at `key`
    async fn incr_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError>;

    /// All counters of the hash at `key`
    async fn get_fields(&self, key: &str) -> Result<HashMap<String, i64>, StoreError>;
}

/// Factory for creating a KvStore implementation
pub struct Store;

impl Store {
    /// Create a new store based on the settings
    pub async fn create(settings: &StoreSettings) -> Result<Arc<dyn KvStore>> {
        match settings.store_type.as_str() {
            "redis" => {
                let store = RedisStore::new(settings).await?;
                Ok(Arc::new(store))
            }
            "memory" => {
                info!("Using in-memory store; limits and cache are local to this process");
                Ok(Arc::new(MemoryStore::new()))
            }
            _ => {
                anyhow::bail!("Unsupported store type: {}", settings.store_type);
            }
        }
    }
}
