use std::time::{Duration, Instant};

use reqwest::Client;
use thiserror::Error;
use tracing::debug;

const USER_AGENT: &str = "facility-enricher/0.1 (+directory data refresh)";
const TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("request failed for {url}: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },
}

/// A fetched, rendered page. Rendering is an external capability behind
/// this boundary; the pipeline only sees final HTML.
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub html: String,
    pub latency_ms: u64,
}

/// One long-lived client for the whole run; every extractor goes through it.
pub struct PageFetcher {
    client: Client,
}

impl PageFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client })
    }

    pub async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let start = Instant::now();
        debug!("fetching {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Request { url: url.to_string(), source: e })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: url.to_string(), status: status.as_u16() });
        }

        let final_url = response.url().to_string();
        let html = response
            .text()
            .await
            .map_err(|e| FetchError::Request { url: url.to_string(), source: e })?;

        let page = FetchedPage {
            url: final_url,
            status: status.as_u16(),
            html,
            latency_ms: start.elapsed().as_millis() as u64,
        };
        debug!("fetched {} (status {}, {} ms)", page.url, page.status, page.latency_ms);
        Ok(page)
    }

    /// Cheap existence check used by the locator's path probing. Any
    /// transport error or non-success status is simply "no".
    pub async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
