//! Page fetcher: bounded-timeout GET and HTML parsing.

use std::time::Duration;

use reqwest::Url;
use scraper::Html;
use thiserror::Error;

/// Remote-side failures. All of them are transient from the caller's view.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },
    #[error("malformed document at {url}: {reason}")]
    Malformed { url: String, reason: String },
}

/// A fetched and parsed page.
pub struct Page {
    /// Final URL after redirects; relative links resolve against it.
    pub url: Url,
    pub html: Html,
}

/// HTTP client shared by all scrapers. Cloning is cheap.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }

    /// GET `url` and parse the body as HTML. No retries happen here.
    pub async fn fetch(&self, url: &Url) -> Result<Page, FetchError> {
        let network = |source: reqwest::Error| FetchError::Network {
            url: url.to_string(),
            source,
        };

        tracing::debug!(url = %url, "fetching page");
        let response = self.client.get(url.clone()).send().await.map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let final_url = response.url().clone();
        // Decoded by the charset the server declares, UTF-8 otherwise.
        let text = response.text().await.map_err(network)?;
        if text.trim().is_empty() {
            return Err(FetchError::Malformed {
                url: url.to_string(),
                reason: "empty body".to_string(),
            });
        }

        tracing::info!(url = %final_url, bytes = text.len(), "loaded page");
        Ok(Page {
            url: final_url,
            html: Html::parse_document(&text),
        })
    }
}
