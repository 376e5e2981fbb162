use anyhow::{Context, Result};
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use super::error::GatewayError;
use crate::cli::config::GatewaySettings;

/// A downloaded target page
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub html: String,
    /// Response headers with lowercase names
    pub headers: BTreeMap<String, String>,
}

/// HTTP client used to download target pages
pub struct PageFetcher {
    client: Client,
    timeout: Duration,
}

impl PageFetcher {
    pub fn new(settings: &GatewaySettings) -> Result<Self> {
        let timeout = settings.fetch_timeout();
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, timeout })
    }

    /// Download `url`; the whole exchange is bounded by the fetch timeout.
    ///
    /// Error statuses still count as a page as long as they carry a body.
    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, GatewayError> {
        debug!("Fetching {} (timeout {:?})", url, self.timeout);

        let failed = |status_code: Option<u16>, message: String| GatewayError::Fetch {
            url: url.to_string(),
            status_code,
            message,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed(None, e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();

        let html = response
            .text()
            .await
            .map_err(|e| failed(Some(status), e.to_string()))?;

        if html.trim().is_empty() {
            return Err(failed(Some(status), "empty response body".to_string()));
        }

        debug!("Fetched {} ({} bytes, status {})", url, html.len(), status);

        Ok(FetchedPage { status, html, headers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> PageFetcher {
        PageFetcher::new(&GatewaySettings::default()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_returns_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Powered-By", "Express")
                    .set_body_string("<html><title>Hi</title></html>"),
            )
            .mount(&server)
            .await;

        let page = fetcher().fetch(&format!("{}/page", server.uri())).await.unwrap();
        assert_eq!(page.status, 200);
        assert!(page.html.contains("<title>Hi</title>"));
        assert_eq!(page.headers.get("x-powered-by").map(String::as_str), Some("Express"));
    }

    #[tokio::test]
    async fn test_empty_body_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let err = fetcher().fetch(&server.uri()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Fetch { status_code: Some(204), .. }));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_fetch_error() {
        let err = fetcher().fetch("http://127.0.0.1:9/").await.unwrap_err();
        assert!(matches!(err, GatewayError::Fetch { status_code: None, .. }));
    }
}
