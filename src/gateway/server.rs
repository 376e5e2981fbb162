use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use url::Url;

use super::client::DispatcherClient;
use super::error::GatewayError;
use super::fetch::PageFetcher;
use super::parser;
use crate::admission::{domain_of, CacheMode, RateLimiter, ResponseCache};
use crate::cli::config::{AppConfig, StoreSettings};
use crate::storage::{KvStore, Store};

/// Components shared by every request handler
pub struct AppState {
    limiter: Option<Arc<RateLimiter>>,
    cache: Option<Arc<ResponseCache>>,
    fetcher: PageFetcher,
    client: DispatcherClient,
    max_links: usize,
}

type SharedState = Arc<AppState>;

impl AppState {
    /// Wire the gateway components; without a store both the rate limiter
    /// and the cache stay off
    pub fn new(config: &AppConfig, store: Option<Arc<dyn KvStore>>) -> Result<Self> {
        let gateway = &config.gateway;

        let limiter = match &store {
            Some(store) if gateway.enable_rate_limit => {
                info!(
                    "Rate limiter enabled: {} requests per {}s per domain",
                    config.rate_limit.max_requests, config.rate_limit.window_secs
                );
                Some(Arc::new(RateLimiter::new(store.clone(), &config.rate_limit)))
            }
            _ => None,
        };

        let cache = match &store {
            Some(store) if gateway.enable_cache => {
                info!("Response cache enabled: ttl {}s", config.cache.ttl_secs);
                Some(Arc::new(ResponseCache::new(store.clone(), &config.cache)))
            }
            _ => None,
        };

        Ok(Self {
            limiter,
            cache,
            fetcher: PageFetcher::new(gateway)?,
            client: DispatcherClient::new(gateway),
            max_links: config.executors.max_links,
        })
    }
}

/// Open the shared store, or `None` when it cannot be reached
pub async fn connect_store(settings: &StoreSettings) -> Option<Arc<dyn KvStore>> {
    let store = match Store::create(settings).await {
        Ok(store) => store,
        Err(e) => {
            warn!("Store unavailable, running without rate limiting and cache: {:#}", e);
            return None;
        }
    };

    match store.ping().await {
        Ok(()) => Some(store),
        Err(e) => {
            warn!("Store did not answer, running without rate limiting and cache: {}", e);
            None
        }
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scrape", get(scrape))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(cache_clear))
        .route("/cache/entry", get(cache_entry).delete(cache_invalidate))
        .route("/rate-limit/stats", get(rate_limit_stats))
        .route("/rate-limit/reset", post(rate_limit_reset))
        .with_state(state)
}

/// Serve the gateway on `listener` until `shutdown` resolves
pub async fn serve<F>(state: SharedState, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local = listener.local_addr().context("Failed to read listener address")?;
    info!("Gateway listening on http://{}", local);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Gateway server failed")?;

    info!("Gateway stopped");
    Ok(())
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn enabled(on: bool) -> &'static str {
    if on {
        "enabled"
    } else {
        "disabled"
    }
}

#[derive(Debug, Deserialize)]
struct ScrapeQuery {
    url: Option<String>,
    full: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UrlQuery {
    url: Option<String>,
}

/// `true`, `1` and `yes` in any case turn a flag on
fn flag(value: Option<&str>) -> bool {
    value.map_or(false, |v| {
        matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
    })
}

/// The trimmed input plus its parsed form; only absolute http(s) URLs pass
fn validate_url(raw: Option<&str>) -> Result<(String, Url), GatewayError> {
    let raw = raw
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| GatewayError::BadRequest("URL parameter is required".to_string()))?;

    let parsed = Url::parse(raw).map_err(|e| GatewayError::BadRequest(format!("Invalid URL '{}': {}", raw, e)))?;

    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(GatewayError::BadRequest(format!(
            "Invalid URL '{}': expected an absolute http or https URL",
            raw
        )));
    }

    Ok((raw.to_string(), parsed))
}

async fn health(State(state): State<SharedState>) -> Json<Value> {
    let mut body = json!({
        "status": "healthy",
        "timestamp": timestamp(),
        "services": {
            "rate_limiter": enabled(state.limiter.is_some()),
            "cache": enabled(state.cache.is_some()),
        },
    });

    if let Some(cache) = &state.cache {
        match cache.stats().await {
            Ok(stats) => body["cache_stats"] = json!(stats),
            Err(e) => warn!("Failed to read cache stats: {}", e),
        }
    }

    Json(body)
}

async fn scrape(
    State(state): State<SharedState>,
    Query(query): Query<ScrapeQuery>,
) -> Result<Response, GatewayError> {
    let (url, parsed) = validate_url(query.url.as_deref())?;
    let full = flag(query.full.as_deref());
    let mode = CacheMode::from_full(full);

    info!("Scrape request for {} (full={})", url, full);

    let mut headers = HeaderMap::new();

    if let Some(limiter) = &state.limiter {
        match limiter.check(&url).await {
            Ok(decision) if !decision.allowed => return Err(GatewayError::rate_limited(&decision)),
            Ok(decision) => {
                headers.insert("x-ratelimit-limit", HeaderValue::from(decision.max_requests));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
            }
            // Fail open
            Err(e) => warn!("Rate limiter unavailable, admitting {}: {}", url, e),
        }
    }

    if let Some(cache) = &state.cache {
        match cache.get(&url, mode).await {
            Ok(Some(hit)) => {
                headers.insert("x-cache", HeaderValue::from_static("HIT"));
                if let Some(ttl) = hit["cache"]["ttl_seconds"].as_i64() {
                    headers.insert("x-cache-ttl", HeaderValue::from(ttl));
                }
                return Ok((headers, Json(hit)).into_response());
            }
            Ok(None) => {}
            Err(e) => warn!("Cache lookup failed for {}: {}", url, e),
        }
    }

    let page = state.fetcher.fetch(&url).await.map_err(|e| {
        error!("{}", e);
        e
    })?;

    let scraping_data = parser::parse(&page.html, &parsed, state.max_links);

    let mut body = Map::new();
    body.insert("url".to_string(), Value::from(url.as_str()));
    body.insert("timestamp".to_string(), Value::from(timestamp()));
    body.insert("status".to_string(), Value::from("success"));
    body.insert(
        "scraping_data".to_string(),
        serde_json::to_value(&scraping_data).map_err(|e| GatewayError::Internal(e.to_string()))?,
    );

    if full {
        match state.client.process_all(&url, &page.html, &page.headers).await {
            Ok(processing) => {
                body.insert("processing_data".to_string(), processing);
            }
            Err(e) => {
                let message = match e {
                    GatewayError::Processing(message) => message,
                    other => other.to_string(),
                };
                warn!("Returning basic result for {}: {}", url, message);
                body.insert("processing_error".to_string(), Value::from(message));
            }
        }
    }

    let body = Value::Object(body);

    if let Some(cache) = &state.cache {
        if let Err(e) = cache.set(&url, mode, body.clone(), None).await {
            error!("Failed to cache result for {}: {}", url, e);
        }
    }

    headers.insert("x-cache", HeaderValue::from_static("MISS"));
    Ok((headers, Json(body)).into_response())
}

async fn cache_stats(State(state): State<SharedState>) -> Result<Json<Value>, GatewayError> {
    let cache = state.cache.as_ref().ok_or(GatewayError::Disabled("Cache"))?;
    let stats = cache.stats().await?;

    Ok(Json(json!({
        "cache_stats": stats,
        "timestamp": timestamp(),
    })))
}

async fn cache_clear(State(state): State<SharedState>) -> Result<Json<Value>, GatewayError> {
    let cache = state.cache.as_ref().ok_or(GatewayError::Disabled("Cache"))?;
    let deleted = cache.clear().await?;

    Ok(Json(json!({
        "message": "Cache cleared successfully",
        "entries_deleted": deleted,
        "timestamp": timestamp(),
    })))
}

/// Whether one URL is cached in the given mode, and for how long
async fn cache_entry(
    State(state): State<SharedState>,
    Query(query): Query<ScrapeQuery>,
) -> Result<Json<Value>, GatewayError> {
    let cache = state.cache.as_ref().ok_or(GatewayError::Disabled("Cache"))?;
    let (url, _) = validate_url(query.url.as_deref())?;
    let mode = CacheMode::from_full(flag(query.full.as_deref()));

    let cached = cache.exists(&url, mode).await?;
    let ttl = if cached { cache.ttl(&url, mode).await? } else { None };

    Ok(Json(json!({
        "url": url,
        "mode": mode,
        "cached": cached,
        "ttl_seconds": ttl,
        "default_ttl_seconds": cache.ttl_seconds(),
        "timestamp": timestamp(),
    })))
}

async fn cache_invalidate(
    State(state): State<SharedState>,
    Query(query): Query<ScrapeQuery>,
) -> Result<Json<Value>, GatewayError> {
    let cache = state.cache.as_ref().ok_or(GatewayError::Disabled("Cache"))?;
    let (url, _) = validate_url(query.url.as_deref())?;
    let mode = CacheMode::from_full(flag(query.full.as_deref()));

    let deleted = cache.delete(&url, mode).await?;

    Ok(Json(json!({
        "url": url,
        "mode": mode,
        "deleted": deleted,
        "timestamp": timestamp(),
    })))
}

async fn rate_limit_stats(
    State(state): State<SharedState>,
    Query(query): Query<UrlQuery>,
) -> Result<Json<Value>, GatewayError> {
    let limiter = state.limiter.as_ref().ok_or(GatewayError::Disabled("Rate limiter"))?;
    let (url, _) = validate_url(query.url.as_deref())?;
    let stats = limiter.stats(&url).await?;

    Ok(Json(json!({
        "rate_limit": stats,
        "timestamp": timestamp(),
    })))
}

async fn rate_limit_reset(
    State(state): State<SharedState>,
    Query(query): Query<UrlQuery>,
) -> Result<Json<Value>, GatewayError> {
    let limiter = state.limiter.as_ref().ok_or(GatewayError::Disabled("Rate limiter"))?;
    let (url, _) = validate_url(query.url.as_deref())?;
    let reset = limiter.reset(&url).await?;

    Ok(Json(json!({
        "domain": domain_of(&url),
        "reset": reset,
        "timestamp": timestamp(),
    })))
}
