//! Admission control in front of the expensive scrape path: a per-domain
//! sliding-window rate limiter and a TTL response cache, both backed by a
//! shared [`KvStore`](crate::storage::KvStore).

pub mod cache;
pub mod rate_limit;

// Re-export common types
pub use self::cache::{CacheMode, ResponseCache};
pub use self::rate_limit::{domain_of, RateDecision, RateLimiter};
