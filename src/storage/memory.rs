use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{KvStore, StoreError, WindowAdmission};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    /// (score, member), kept sorted by score
    ZSet(Vec<(f64, String)>),
    Hash(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    fn ttl_secs(&self, now: Instant) -> i64 {
        match self.expires_at {
            Some(at) => {
                let remaining = at.saturating_duration_since(now);
                // Round to the nearest second the way Redis reports TTL
                ((remaining.as_millis() + 500) / 1000) as i64
            }
            None => -1,
        }
    }
}

/// Process-local store with lazy TTL expiry.
///
/// Every operation runs under one mutex that is never held across an await,
/// so each call is atomic with respect to the others. Expiry follows
/// `tokio::time`, which lets tests drive it with a paused clock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Backend(format!("WRONGTYPE operation against key {}", key))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        f(&mut entries, now)
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.with_entries(|_, _| Ok(()))
    }

    async fn sliding_window_admit(
        &self,
        key: &str,
        now: f64,
        window: Duration,
        max: u64,
        member: &str,
    ) -> Result<WindowAdmission, StoreError> {
        let window_secs = window.as_secs().max(1);
        let window_start = now - window_secs as f64;

        self.with_entries(|entries, clock| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::ZSet(Vec::new()),
                expires_at: None,
            });

            let Value::ZSet(members) = &mut entry.value else {
                return Err(wrong_type(key));
            };

            members.retain(|(score, _)| *score >= window_start);
            let count = members.len() as u64;

            let allowed = count < max;
            if allowed {
                let position = members.partition_point(|(score, _)| *score <= now);
                members.insert(position, (now, member.to_string()));
                entry.expires_at = Some(clock + Duration::from_secs(window_secs));
            }

            let oldest = members.first().map(|(score, _)| *score);
            if members.is_empty() {
                entries.remove(key);
            }

            Ok(WindowAdmission {
                allowed,
                count,
                oldest,
            })
        })
    }

    async fn window_scores(&self, key: &str, min_score: f64) -> Result<Vec<f64>, StoreError> {
        self.with_entries(|entries, _| {
            let Some(entry) = entries.get_mut(key) else {
                return Ok(Vec::new());
            };
            let Value::ZSet(members) = &mut entry.value else {
                return Err(wrong_type(key));
            };

            members.retain(|(score, _)| *score >= min_score);
            Ok(members.iter().map(|(score, _)| *score).collect())
        })
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<(String, i64)>, StoreError> {
        self.with_entries(|entries, now| match entries.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Str(value) => Ok(Some((value.clone(), entry.ttl_secs(now)))),
                _ => Err(wrong_type(key)),
            },
        })
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.with_entries(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Str(value.to_string()),
                    expires_at: Some(now + ttl.max(Duration::from_secs(1))),
                },
            );
            Ok(())
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        self.with_entries(|entries, _| {
            Ok(keys.iter().filter(|key| entries.remove(*key).is_some()).count() as u64)
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.with_entries(|entries, _| Ok(entries.contains_key(key)))
    }

    async fn ttl(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.with_entries(|entries, now| Ok(entries.get(key).map(|entry| entry.ttl_secs(now))))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.with_entries(|entries, _| {
            Ok(entries
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect())
        })
    }

    async fn incr_field(&self, key: &str, field: &str, by: i64) -> Result<i64, StoreError> {
        self.with_entries(|entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            let Value::Hash(fields) = &mut entry.value else {
                return Err(wrong_type(key));
            };

            let counter = fields.entry(field.to_string()).or_insert(0);
            *counter += by;
            Ok(*counter)
        })
    }

    async fn get_fields(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        self.with_entries(|entries, _| match entries.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_values_expire_with_ttl() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(store.get_with_ttl("k").await.unwrap(), Some(("v".to_string(), 10)));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(store.ttl("k").await.unwrap(), Some(6));
        assert!(store.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get_with_ttl("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sliding_window_prunes_and_caps() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(10);

        for (i, now) in [100.0, 101.0].iter().enumerate() {
            let admission = store
                .sliding_window_admit("w", *now, window, 2, &format!("m{}", i))
                .await
                .unwrap();
            assert!(admission.allowed);
            assert_eq!(admission.count, i as u64);
            assert_eq!(admission.oldest, Some(100.0));
        }

        let denied = store.sliding_window_admit("w", 105.0, window, 2, "m2").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 2);

        // 100.0 falls out of the window at 110.5
        let admitted = store.sliding_window_admit("w", 110.5, window, 2, "m3").await.unwrap();
        assert!(admitted.allowed);
        assert_eq!(admitted.count, 1);
        assert_eq!(admitted.oldest, Some(101.0));

        assert_eq!(store.window_scores("w", 105.0).await.unwrap(), vec![110.5]);
    }

    #[tokio::test]
    async fn test_hash_counters_and_prefix_scan() {
        let store = MemoryStore::new();
        store.incr_field("stats", "hits", 1).await.unwrap();
        store.incr_field("stats", "hits", 2).await.unwrap();
        store.incr_field("stats", "misses", 1).await.unwrap();

        let fields = store.get_fields("stats").await.unwrap();
        assert_eq!(fields.get("hits"), Some(&3));
        assert_eq!(fields.get("misses"), Some(&1));

        let ttl = Duration::from_secs(60);
        store.set_with_ttl("p:cache:a", "1", ttl).await.unwrap();
        store.set_with_ttl("p:cache:b", "2", ttl).await.unwrap();
        store.set_with_ttl("q:cache:c", "3", ttl).await.unwrap();

        let mut keys = store.keys_with_prefix("p:cache:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["p:cache:a".to_string(), "p:cache:b".to_string()]);

        assert_eq!(store.delete(&keys).await.unwrap(), 2);
        assert!(store.incr_field("q:cache:c", "x", 1).await.is_err());
    }
}
