//! HTTP retrieval of one listing at a time.
//!
//! [`FetchClient`] issues a single bounded-time GET per call, caps the body
//! size and turns the response into items or a [`FetchError`]. Rate-limit
//! headers are reported back even when the request fails. Retrying is left
//! to the scheduler, which only sees the [`ItemSource`] trait.

use futures::future::BoxFuture;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use super::normalize::{parse_listing, MediaPrefs};
use crate::clock::Clock;
use crate::config::FetchConfig;
use crate::storage::Item;
use crate::sync::RateLimitHint;
use crate::util::validate_source_key;

const MAX_LISTING_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Pseudo-source name of the global listing.
pub const GLOBAL_SOURCE: &str = "popular";

/// Errors that can occur while fetching one listing.
///
/// Retry policy lives in the scheduler; the client reports each failure
/// once and never retries on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Request plus body read exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Non-2xx status other than 429
    #[error("HTTP error: status {0}")]
    HttpError(u16),
    /// Server answered 429 Too Many Requests
    #[error("Rate limited by server")]
    RateLimited,
    /// Body was not a listing. Absorbed by [`FetchClient`], which reports
    /// zero items instead.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    /// Connection, DNS or TLS failure
    #[error("Request failed: {0}")]
    Network(String),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Source key is not a valid listing name
    #[error("Invalid source: {0}")]
    InvalidSource(String),
}

impl FetchError {
    /// Transient failures worth retrying within the same job.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout | FetchError::Network(_) => true,
            FetchError::HttpError(status) => (500..600).contains(status),
            _ => false,
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

/// Outcome of one fetch: the items (or error) plus whatever rate-limit
/// headers the server sent, which apply even to failed responses.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub hint: Option<RateLimitHint>,
    pub result: Result<Vec<Item>, FetchError>,
}

impl FetchReport {
    pub fn ok(items: Vec<Item>) -> Self {
        Self {
            hint: None,
            result: Ok(items),
        }
    }

    pub fn err(error: FetchError) -> Self {
        Self {
            hint: None,
            result: Err(error),
        }
    }
}

/// Anything that can produce the listing of a source.
///
/// `None` requests the global listing. The scheduler only talks to this
/// trait, so tests substitute scripted sources for the HTTP client.
pub trait ItemSource: Send + Sync {
    fn fetch<'a>(&'a self, source: Option<&'a str>) -> BoxFuture<'a, FetchReport>;
}

/// HTTP client for `/r/<source>.json` listings.
pub struct FetchClient {
    client: reqwest::Client,
    base_url: Url,
    config: FetchConfig,
    clock: Arc<dyn Clock>,
}

impl FetchClient {
    /// Build a client for `config.base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL does not parse or the HTTP client
    /// cannot be constructed.
    pub fn new(config: FetchConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)?;
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url,
            config,
            clock,
        })
    }

    /// `{base}/r/{target}.json?limit={n}&raw_json=1`
    pub fn listing_url(&self, target: &str) -> Result<Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| FetchError::InvalidSource(self.base_url.to_string()))?
            .pop_if_empty()
            .push("r")
            .push(&format!("{target}.json"));
        url.query_pairs_mut()
            .append_pair("limit", &self.config.item_limit.to_string())
            .append_pair("raw_json", "1");
        Ok(url)
    }

    /// Fetch one listing, bounded by the configured timeout.
    pub async fn fetch_listing(&self, source: Option<&str>) -> FetchReport {
        let target = match source {
            Some(key) => match validate_source_key(key) {
                Ok(key) => key,
                Err(e) => return FetchReport::err(FetchError::InvalidSource(e.to_string())),
            },
            None => GLOBAL_SOURCE,
        };

        let mut hint = None;
        let result =
            match tokio::time::timeout(self.config.timeout(), self.fetch_one(target, &mut hint))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            };

        match &result {
            Ok(items) => tracing::debug!(source = target, items = items.len(), "Fetched listing"),
            Err(e) => tracing::debug!(source = target, error = %e, "Listing fetch failed"),
        }
        FetchReport { hint, result }
    }

    async fn fetch_one(
        &self,
        target: &str,
        hint: &mut Option<RateLimitHint>,
    ) -> Result<Vec<Item>, FetchError> {
        let url = self.listing_url(target)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FetchError::from_reqwest)?;

        *hint = parse_rate_limit_headers(response.headers(), self.clock.now_ms());

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            tracing::warn!(source = target, "Rate limited by server");
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(FetchError::HttpError(status.as_u16()));
        }

        let bytes = read_limited_bytes(response, MAX_LISTING_SIZE).await?;
        let prefs = MediaPrefs {
            min_width: self.config.media_min_width,
            max_width: self.config.media_max_width,
        };

        match parse_listing(&bytes, target, prefs)
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))
        {
            Ok(parsed) => {
                if parsed.skipped > 0 {
                    tracing::warn!(
                        source = target,
                        skipped = parsed.skipped,
                        "Entries without an id or timestamp skipped"
                    );
                }
                Ok(parsed.items)
            }
            Err(e) => {
                tracing::warn!(source = target, error = %e, "Discarding malformed listing");
                Ok(Vec::new())
            }
        }
    }
}

impl ItemSource for FetchClient {
    fn fetch<'a>(&'a self, source: Option<&'a str>) -> BoxFuture<'a, FetchReport> {
        Box::pin(self.fetch_listing(source))
    }
}

/// Read `x-ratelimit-remaining` / `x-ratelimit-reset`.
///
/// Remaining arrives as a float string and is floored; reset is seconds
/// until the window rolls over and becomes an absolute epoch-ms value.
pub fn parse_rate_limit_headers(headers: &HeaderMap, now_ms: i64) -> Option<RateLimitHint> {
    let number = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| v.is_finite() && *v >= 0.0)
    };

    let hint = RateLimitHint {
        remaining: number("x-ratelimit-remaining").map(|v| v.floor().min(u32::MAX as f64) as u32),
        reset_at: number("x-ratelimit-reset")
            .map(|secs| now_ms.saturating_add((secs * 1000.0) as i64)),
    };
    (!hint.is_empty()).then_some(hint)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::from_reqwest)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
