use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client, Script};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::{KvStore, StoreError, WindowAdmission};
use crate::cli::config::StoreSettings;

/// Prune, count and conditionally insert in one server-side step so that
/// concurrent callers can never push a window past `max`.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = ARGV[1]
local lower_bound = ARGV[2]
local ttl = tonumber(ARGV[3])
local max = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', lower_bound)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < max then
    redis.call('ZADD', key, now, member)
    redis.call('EXPIRE', key, ttl)
    allowed = 1
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = ''
if #oldest > 0 then
    oldest_score = oldest[2]
end

return {allowed, count, oldest_score}
"#;

/// Scores travel as strings with microsecond digits; Lua number formatting
/// would round them to 14 significant digits
fn score(value: f64) -> String {
    format!("{:.6}", value)
}

/// Exclusive range bound: only entries scored strictly below `min` are pruned
fn exclusive_bound(min: f64) -> String {
    format!("({}", score(min))
}

/// Redis-backed store
pub struct RedisStore {
    /// Multiplexed connection; cloned per call so no lock spans a round-trip
    conn: MultiplexedConnection,

    /// Sliding-window admission script
    window_script: Script,
}

impl RedisStore {
    /// Connect to Redis
    pub async fn new(settings: &StoreSettings) -> Result<Self> {
        let client = Client::open(settings.redis_url.clone())
            .context(format!("Failed to connect to Redis at {}", settings.redis_url))?;

        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("Failed to get Redis connection")?;

        let store = Self {
            conn,
            window_script: Script::new(SLIDING_WINDOW_SCRIPT),
        };

        store
            .ping()
            .await
            .context(format!("Redis at {} did not answer PING", settings.redis_url))?;

        info!("Connected to Redis at {}", settings.redis_url);

        Ok(store)
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        now: f64,
        window: Duration,
        max: u64,
        member: &str,
    ) -> Result<WindowAdmission, StoreError> {
        let mut conn = self.conn();
        let window_secs = window.as_secs().max(1);

        let (allowed, count, oldest): (i64, i64, String) = self
            .window_script
            .key(key)
            .arg(score(now))
            .arg(exclusive_bound(now - window_secs as f64))
            .arg(window_secs)
            .arg(max)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        let oldest = if oldest.is_empty() {
            None
        } else {
            Some(oldest.parse::<f64>().map_err(|e| {
                StoreError::Backend(format!("invalid score '{}' in {}: {}", oldest, key, e))
            })?)
        };

        debug!("Window {} holds {} entries (allowed: {})", key, count, allowed == 1);

        Ok(WindowAdmission {
            allowed: allowed == 1,
            count: count.max(0) as u64,
            oldest,
        })
    }

    async fn window_scores(&self, key: &str, min_score: f64) -> Result<Vec<f64>, StoreError> {
        let mut conn = self.conn();

        let (_, entries): (i64, Vec<(String, f64)>) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(exclusive_bound(min_score))
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        Ok(entries.into_iter().map(|(_, score)| score).collect())
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, i64)>, StoreError> {
        let mut conn = self.conn();

        let (value, ttl): (Option<String>, i64) = redis::pipe()
            .atomic()
            .cmd("GET")
            .arg(key)
            .cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        Ok(value.map(|value| (value, ttl)))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn();

        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn();
        let deleted: u64 = redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;

        Ok(deleted)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn();
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;

        // -2: no such key
        Ok(if ttl == -2 { None } else { Some(ttl) })
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        let pattern = format!("{}*", prefix);

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn incr_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(by)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get_fields(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        let mut conn = self.conn();
        let fields: HashMap<String, i64> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scores_keep_microseconds() {
        assert_eq!(score(1_700_000_010.000049), "1700000010.000049");
        assert_eq!(exclusive_bound(1_700_000_000.5), "(1700000000.500000");
    }

    async fn live_store() -> RedisStore {
        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisStore::new(&StoreSettings {
            store_type: "redis".to_string(),
            redis_url,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    #[ignore = "needs a running Redis server"]
    async fn test_sliding_window_script() {
        let store = live_store().await;
        let key = format!("pagegate-test:rate_limit:{}", uuid::Uuid::new_v4());
        let window = Duration::from_secs(10);
        let start = 1_700_000_000.0;

        let first = store
            .sliding_window_admit(&key, start + 0.000040, window, 1, "a")
            .await
            .unwrap();
        assert!(first.allowed);
        assert_eq!(first.count, 0);

        let denied = store
            .sliding_window_admit(&key, start + 5.0, window, 1, "b")
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 1);
        let oldest = denied.oldest.unwrap();
        assert!((oldest - (start + 0.000040)).abs() < 1e-6);

        // 9 microseconds past the first entry's expiry
        let later = store
            .sliding_window_admit(&key, start + 10.000049, window, 1, "c")
            .await
            .unwrap();
        assert!(later.allowed);
        assert_eq!(later.count, 0);

        let scores = store.window_scores(&key, start).await.unwrap();
        assert_eq!(scores.len(), 1);
        assert!(store.ttl(&key).await.unwrap().unwrap() > 0);

        assert_eq!(store.delete(&[key]).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore = "needs a running Redis server"]
    async fn test_get_with_ttl_and_counters() {
        let store = live_store().await;
        let prefix = format!("pagegate-test:{}", uuid::Uuid::new_v4());
        let key = format!("{}:cache:basic:abc", prefix);

        assert!(store.get_with_ttl(&key).await.unwrap().is_none());
        store
            .set_with_ttl(&key, "{\"ok\":true}", Duration::from_secs(30))
            .await
            .unwrap();

        let (value, ttl) = store.get_with_ttl(&key).await.unwrap().unwrap();
        assert_eq!(value, "{\"ok\":true}");
        assert!(ttl > 0 && ttl <= 30);
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.keys_with_prefix(&format!("{}:cache:", prefix)).await.unwrap(), vec![key.clone()]);

        let stats = format!("{}:stats", prefix);
        store.incr_field(&stats, "hits", 1).await.unwrap();
        assert_eq!(store.incr_field(&stats, "hits", 2).await.unwrap(), 3);
        assert_eq!(store.get_fields(&stats).await.unwrap()["hits"], 3);

        assert_eq!(store.delete(&[key, stats]).await.unwrap(), 2);
    }
}
