use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::cli::config::RateLimitSettings;
use crate::storage::{KvStore, StoreError};

/// Result of one admission check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateDecision {
    pub domain: String,
    pub allowed: bool,
    /// Requests already admitted in the window when the check ran
    pub requests_in_window: u64,
    pub max_requests: u64,
    pub window_seconds: u64,
    pub remaining: u64,
    /// Seconds until a slot frees up; only set on denial
    pub retry_after: Option<u64>,
}

/// Read-only view of a domain's window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStats {
    pub domain: String,
    pub request_count: u64,
    pub max_requests: u64,
    pub window_seconds: u64,
    pub allowed: bool,
    pub remaining: u64,
    pub oldest_request: Option<f64>,
    pub newest_request: Option<f64>,
}

/// Per-domain sliding-window rate limiter
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    max_requests: u64,
    window: Duration,
}

/// Rate-limited resource for a URL: its host, plus the port when explicit.
///
/// Strings that do not parse as URLs are used as-is so that every input maps
/// to some window.
pub fn domain_of(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}

/// Wall-clock seconds with microsecond precision
fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, settings: &RateLimitSettings) -> Self {
        Self {
            store,
            max_requests: settings.max_requests.max(1),
            window: Duration::from_secs(settings.window_secs.max(1)),
        }
    }

    pub fn window_seconds(&self) -> u64 {
        self.window.as_secs()
    }

    fn key(domain: &str) -> String {
        format!("rate_limit:{}", domain)
    }

    /// Check and, when allowed, record a request to `url`'s domain
    pub async fn check(&self, url: &str) -> Result<RateDecision, StoreError> {
        self.check_at(url, now_secs()).await
    }

    /// Same as [`check`](Self::check) with an explicit clock reading
    pub async fn check_at(&self, url: &str, now: f64) -> Result<RateDecision, StoreError> {
        let domain = domain_of(url);
        let key = Self::key(&domain);
        let member = format!("{:.6}-{}", now, Uuid::new_v4());

        let admission = self
            .store
            .sliding_window_admit(&key, now, self.window, self.max_requests, &member)
            .await?;

        let window_seconds = self.window_seconds();
        let decision = if admission.allowed {
            debug!(
                "Rate limit OK for {}: {}/{} requests",
                domain,
                admission.count + 1,
                self.max_requests
            );

            RateDecision {
                domain,
                allowed: true,
                requests_in_window: admission.count,
                max_requests: self.max_requests,
                window_seconds,
                remaining: self.max_requests.saturating_sub(admission.count + 1),
                retry_after: None,
            }
        } else {
            // The oldest entry leaves the window at oldest + window
            let retry_after = admission
                .oldest
                .map(|oldest| (oldest + window_seconds as f64 - now).ceil() as i64)
                .unwrap_or(window_seconds as i64)
                .clamp(1, window_seconds as i64) as u64;

            warn!(
                "Rate limit exceeded for {}: {}/{} requests in {}s, retry in {}s",
                domain, admission.count, self.max_requests, window_seconds, retry_after
            );

            RateDecision {
                domain,
                allowed: false,
                requests_in_window: admission.count,
                max_requests: self.max_requests,
                window_seconds,
                remaining: 0,
                retry_after: Some(retry_after),
            }
        };

        Ok(decision)
    }

    /// Current window for `url`'s domain, after pruning expired entries
    pub async fn stats(&self, url: &str) -> Result<RateLimitStats, StoreError> {
        self.stats_at(url, now_secs()).await
    }

    async fn stats_at(&self, url: &str, now: f64) -> Result<RateLimitStats, StoreError> {
        let domain = domain_of(url);
        let window_start = now - self.window.as_secs() as f64;

        let scores = self.store.window_scores(&Self::key(&domain), window_start).await?;
        let request_count = scores.len() as u64;

        Ok(RateLimitStats {
            domain,
            request_count,
            max_requests: self.max_requests,
            window_seconds: self.window_seconds(),
            allowed: request_count < self.max_requests,
            remaining: self.max_requests.saturating_sub(request_count),
            oldest_request: scores.first().copied(),
            newest_request: scores.last().copied(),
        })
    }

    /// Forget every recorded request for `url`'s domain
    pub async fn reset(&self, url: &str) -> Result<bool, StoreError> {
        let domain = domain_of(url);
        let deleted = self.store.delete(&[Self::key(&domain)]).await?;

        if deleted > 0 {
            info!("Rate limit reset for {}", domain);
        }

        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn limiter(max_requests: u64, window_secs: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryStore::new()),
            &RateLimitSettings {
                max_requests,
                window_secs,
            },
        )
    }

    #[test]
    fn test_domain_extraction() {
        assert_eq!(domain_of("https://example.com/a/b?c=d"), "example.com");
        assert_eq!(domain_of("http://example.com:8080/"), "example.com:8080");
        assert_eq!(domain_of("https://example.com:443/"), "example.com");
        assert_eq!(domain_of("not a url"), "not a url");
    }

    #[tokio::test]
    async fn test_window_admits_up_to_max() {
        let limiter = limiter(3, 10);
        let url = "https://example.com/page";

        let mut remaining = Vec::new();
        for i in 0..3 {
            let decision = limiter.check_at(url, 100.0 + i as f64).await.unwrap();
            assert!(decision.allowed);
            remaining.push(decision.remaining);
        }
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.check_at(url, 103.0).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.requests_in_window, 3);
        // Oldest entry (100.0) leaves the window at 110.0
        assert_eq!(denied.retry_after, Some(7));

        // Denials are not recorded, so the window still holds three entries
        let stats = limiter.stats_at(url, 103.5).await.unwrap();
        assert_eq!(stats.request_count, 3);
        assert_eq!(stats.oldest_request, Some(100.0));
        assert_eq!(stats.newest_request, Some(102.0));
    }

    #[tokio::test]
    async fn test_window_slides() {
        let limiter = limiter(3, 10);
        let url = "https://example.com/";

        for now in [100.0, 101.0, 102.0] {
            assert!(limiter.check_at(url, now).await.unwrap().allowed);
        }
        assert!(!limiter.check_at(url, 109.0).await.unwrap().allowed);

        let decision = limiter.check_at(url, 110.5).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.requests_in_window, 2);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_domains_are_independent() {
        let limiter = limiter(1, 60);

        assert!(limiter.check_at("https://a.example/", 10.0).await.unwrap().allowed);
        assert!(!limiter.check_at("https://a.example/other", 11.0).await.unwrap().allowed);

        let other = limiter.check_at("https://b.example/", 11.0).await.unwrap();
        assert!(other.allowed);
        assert_eq!(other.domain, "b.example");
    }

    #[tokio::test]
    async fn test_retry_after_is_clamped() {
        let limiter = limiter(1, 10);
        let url = "https://example.com/";

        assert!(limiter.check_at(url, 100.0).await.unwrap().allowed);
        // 0.2s before the slot frees still asks for a whole second
        let denied = limiter.check_at(url, 109.8).await.unwrap();
        assert_eq!(denied.retry_after, Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_exceed_max() {
        let limiter = Arc::new(limiter(5, 60));

        let checks = (0..20).map(|i| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check(&format!("https://example.com/{}", i)).await })
        });
        let decisions: Vec<RateDecision> = futures::future::join_all(checks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 5);
        assert!(decisions
            .iter()
            .filter(|d| !d.allowed)
            .all(|d| d.requests_in_window == 5 && d.retry_after.is_some()));

        let stats = limiter.stats("https://example.com/").await.unwrap();
        assert_eq!(stats.request_count, 5);
    }

    #[tokio::test]
    async fn test_reset_clears_domain() {
        let limiter = limiter(1, 60);
        let url = "https://example.com/";

        assert!(limiter.check(url).await.unwrap().allowed);
        assert!(!limiter.check(url).await.unwrap().allowed);

        assert!(limiter.reset(url).await.unwrap());
        assert!(!limiter.reset(url).await.unwrap());
        assert!(limiter.check(url).await.unwrap().allowed);
    }
}
