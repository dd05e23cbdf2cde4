//! Local SearxNG client used by the web-search fallback chain.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::http_client::http_client;

const DEFAULT_SEARXNG_URL: &str = "http://localhost:8080";

/// Searches time out after five seconds so a wedged local instance cannot
/// stall the fallback chain.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Search failures, surfaced so the caller can fall through to the next
/// provider in the chain.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The instance could not be reached or timed out.
    #[error("SearxNG request failed: {0}")]
    Connection(String),

    /// The instance answered with an error status.
    #[error("SearxNG returned status {0}")]
    Status(u16),

    /// The response body was not the expected JSON shape.
    #[error("SearxNG returned a malformed response: {0}")]
    Malformed(String),
}

/// A single search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResult {
    /// Result URL.
    pub url: String,
    /// Result title.
    pub title: String,
    /// Snippet of the page content, when provided.
    pub snippet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearxngResponse {
    #[serde(default)]
    results: Vec<SearxngItem>,
}

#[derive(Debug, Deserialize)]
struct SearxngItem {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: Option<String>,
}

/// Client for a local SearxNG instance.
pub struct SearxngClient {
    client: reqwest::Client,
    base_url: String,
}

impl SearxngClient {
    /// Client for an explicit base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into(),
        }
    }

    /// Client for the instance named by `SEARXNG_URL`, defaulting to the
    /// standard local port.
    pub fn from_env() -> Self {
        let base_url = std::env::var("SEARXNG_URL").unwrap_or_else(|_| DEFAULT_SEARXNG_URL.to_string());
        Self::new(base_url)
    }

    /// Run a general-category JSON search.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchResult>, SearchError> {
        let url = format!(
            "{}/search?q={}&format=json&categories=general",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(query)
        );

        let response = self
            .client
            .get(&url)
            .timeout(SEARCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| SearchError::Connection(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Status(status.as_u16()));
        }

        let parsed: SearxngResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Malformed(e.to_string()))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|item| SearchResult {
                url: item.url,
                title: item.title,
                snippet: item.content.filter(|content| !content.is_empty()),
            })
            .collect())
    }
}
