use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cli::config::CacheSettings;
use crate::storage::{KvStore, StoreError};

/// Which scrape a cached result belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Basic,
    Full,
}

impl CacheMode {
    pub fn from_full(full: bool) -> Self {
        if full {
            CacheMode::Full
        } else {
            CacheMode::Basic
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Basic => "basic",
            CacheMode::Full => "full",
        }
    }
}

impl fmt::Display for CacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hit/miss counters persisted next to the cached entries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: i64,
    pub misses: i64,
    pub writes: i64,
    pub total_requests: i64,
    pub hit_rate_percent: f64,
}

/// TTL cache of finished scrape results
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
    key_prefix: String,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KvStore>, settings: &CacheSettings) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(settings.ttl_secs.max(1)),
            key_prefix: settings.key_prefix.clone(),
        }
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// `<prefix>:cache:<mode>:<sha256(url)>`; bounded length for any URL
    fn key(&self, url: &str, mode: CacheMode) -> String {
        let digest = Sha256::digest(url.as_bytes());
        format!("{}:cache:{}:{:x}", self.key_prefix, mode, digest)
    }

    fn stats_key(&self) -> String {
        format!("{}:stats", self.key_prefix)
    }

    async fn bump(&self, counter: &str) {
        // Counters are for observability only
        if let Err(e) = self.store.incr_field(&self.stats_key(), counter, 1).await {
            warn!("Failed to update cache counter {}: {}", counter, e);
        }
    }

    /// Look up a cached result.
    ///
    /// A hit comes back annotated with a `cache` object holding the creation
    /// timestamp and the TTL left, both read in the same store operation.
    pub async fn get(&self, url: &str, mode: CacheMode) -> Result<Option<Value>, StoreError> {
        let key = self.key(url, mode);

        let Some((blob, ttl)) = self.store.get_with_ttl(&key).await? else {
            self.bump("misses").await;
            debug!("Cache MISS for {} ({})", url, mode);
            return Ok(None);
        };

        let mut result = match serde_json::from_str::<Value>(&blob) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) | Err(_) => {
                error!("Discarding undecodable cache entry for {} ({})", url, mode);
                self.store.delete(&[key]).await?;
                self.bump("misses").await;
                return Ok(None);
            }
        };

        if let Value::Object(fields) = &mut result {
            let cached_at = fields.get("timestamp").cloned().unwrap_or(Value::Null);
            fields.insert(
                "cache".to_string(),
                json!({
                    "hit": true,
                    "cached_at": cached_at,
                    "ttl_seconds": ttl,
                }),
            );
        }

        self.bump("hits").await;
        info!("Cache HIT for {} ({}, ttl {}s)", url, mode, ttl);

        Ok(Some(result))
    }

    /// Store a result, stamping a `timestamp` when it has none.
    ///
    /// `ttl` overrides the configured lifetime. Last write wins.
    pub async fn set(
        &self,
        url: &str,
        mode: CacheMode,
        mut value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let key = self.key(url, mode);
        let ttl = ttl.unwrap_or(self.ttl);

        if let Value::Object(fields) = &mut value {
            fields
                .entry("timestamp")
                .or_insert_with(|| Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)));
        }

        let blob = serde_json::to_string(&value)
            .map_err(|e| StoreError::Backend(format!("failed to serialize cache entry: {}", e)))?;
        self.store.set_with_ttl(&key, &blob, ttl).await?;
        self.bump("writes").await;

        info!("Cached result for {} ({}, ttl {}s)", url, mode, ttl.as_secs());

        Ok(())
    }

    pub async fn delete(&self, url: &str, mode: CacheMode) -> Result<bool, StoreError> {
        let deleted = self.store.delete(&[self.key(url, mode)]).await?;
        if deleted > 0 {
            info!("Cache entry removed for {} ({})", url, mode);
        }
        Ok(deleted > 0)
    }

    pub async fn exists(&self, url: &str, mode: CacheMode) -> Result<bool, StoreError> {
        self.store.exists(&self.key(url, mode)).await
    }

    /// Seconds left before the entry expires, `None` when absent
    pub async fn ttl(&self, url: &str, mode: CacheMode) -> Result<Option<i64>, StoreError> {
        self.store.ttl(&self.key(url, mode)).await
    }

    /// Remove every cached entry; counters are kept
    pub async fn clear(&self) -> Result<u64, StoreError> {
        let keys = self
            .store
            .keys_with_prefix(&format!("{}:cache:", self.key_prefix))
            .await?;

        let deleted = self.store.delete(&keys).await?;
        if deleted > 0 {
            warn!("Cache cleared: {} entries removed", deleted);
        }

        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<CacheStats, StoreError> {
        let counters = self.store.get_fields(&self.stats_key()).await?;
        let counter = |name: &str| counters.get(name).copied().unwrap_or(0);

        let hits = counter("hits");
        let misses = counter("misses");
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };

        Ok(CacheStats {
            hits,
            misses,
            writes: counter("writes"),
            total_requests: total,
            hit_rate_percent: hit_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn cache_with_ttl(ttl_secs: u64) -> (ResponseCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(
            store.clone(),
            &CacheSettings {
                ttl_secs,
                key_prefix: "test".to_string(),
            },
        );
        (cache, store)
    }

    #[test]
    fn test_keys_are_bounded_and_mode_scoped() {
        let (cache, _) = cache_with_ttl(60);
        let long_url = format!("https://example.com/{}", "a".repeat(5000));

        let basic = cache.key(&long_url, CacheMode::Basic);
        let full = cache.key(&long_url, CacheMode::Full);

        assert!(basic.starts_with("test:cache:basic:"));
        assert!(full.starts_with("test:cache:full:"));
        assert_eq!(basic.len(), "test:cache:basic:".len() + 64);
        assert_ne!(basic, full);
    }

    #[tokio::test]
    async fn test_modes_are_independent() {
        let (cache, _) = cache_with_ttl(60);
        let url = "https://example.com";

        cache
            .set(url, CacheMode::Basic, json!({"v": 1}), None)
            .await
            .unwrap();
        cache
            .set(url, CacheMode::Full, json!({"v": 2}), None)
            .await
            .unwrap();

        let basic = cache.get(url, CacheMode::Basic).await.unwrap().unwrap();
        let full = cache.get(url, CacheMode::Full).await.unwrap().unwrap();
        assert_eq!(basic["v"], 1);
        assert_eq!(full["v"], 2);

        assert_eq!(basic["cache"]["hit"], true);
        assert_eq!(basic["cache"]["ttl_seconds"], 60);
        assert_eq!(basic["cache"]["cached_at"], basic["timestamp"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let (cache, _) = cache_with_ttl(3600);
        let url = "https://example.com/expiring";

        cache
            .set(url, CacheMode::Basic, json!({"v": 1}), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(cache.exists(url, CacheMode::Basic).await.unwrap());
        assert_eq!(cache.ttl(url, CacheMode::Basic).await.unwrap(), Some(5));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.get(url, CacheMode::Basic).await.unwrap().is_none());
        assert_eq!(cache.ttl(url, CacheMode::Basic).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_existing_timestamp_is_kept() {
        let (cache, _) = cache_with_ttl(60);
        let url = "https://example.com";

        cache
            .set(url, CacheMode::Basic, json!({"timestamp": "2024-01-01T00:00:00Z"}), None)
            .await
            .unwrap();

        let hit = cache.get(url, CacheMode::Basic).await.unwrap().unwrap();
        assert_eq!(hit["timestamp"], "2024-01-01T00:00:00Z");
        assert_eq!(hit["cache"]["cached_at"], "2024-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_dropped() {
        let (cache, store) = cache_with_ttl(60);
        let url = "https://example.com/corrupt";
        let key = cache.key(url, CacheMode::Full);

        store
            .set_with_ttl(&key, "{not json", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(cache.get(url, CacheMode::Full).await.unwrap().is_none());
        assert!(!cache.exists(url, CacheMode::Full).await.unwrap());
        assert_eq!(cache.stats().await.unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let (cache, _) = cache_with_ttl(60);

        cache
            .set("https://a.example", CacheMode::Basic, json!({}), None)
            .await
            .unwrap();
        cache
            .set("https://b.example", CacheMode::Full, json!({}), None)
            .await
            .unwrap();

        cache.get("https://a.example", CacheMode::Basic).await.unwrap();
        cache.get("https://a.example", CacheMode::Full).await.unwrap();
        cache.get("https://c.example", CacheMode::Basic).await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.hit_rate_percent, 33.33);

        assert_eq!(cache.clear().await.unwrap(), 2);
        assert_eq!(cache.clear().await.unwrap(), 0);
        assert!(cache.delete("https://a.example", CacheMode::Basic).await.is_ok());

        // Counters survive a clear
        assert_eq!(cache.stats().await.unwrap().writes, 2);
    }
}
