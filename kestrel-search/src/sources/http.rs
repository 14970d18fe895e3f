//! Shared HTTP plumbing for the source adapters
//!
//! Status mapping used by every adapter:
//! - 404 → [`SourceError::NotFound`]
//! - 429 / 503 → [`SourceError::RateLimited`] (honours `Retry-After` seconds)
//! - other non-success, transport and timeout failures → [`SourceError::Unavailable`]

use super::rate_governor::{RateGovernor, DEFAULT_BACKOFF};
use super::{PartialRecord, SourceError};
use kestrel_common::config::SourceSettings;
use kestrel_common::SourceId;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, IntoUrl, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// User-Agent sent with every source request
pub const USER_AGENT: &str = concat!("Kestrel/", env!("CARGO_PKG_VERSION"), " (taxonomy search)");

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Resolved settings for one adapter instance
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    /// Delay before retry `n` is `retry_delay * n`
    pub retry_delay: Duration,
    pub requests_per_second: u32,
}

impl AdapterSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            requests_per_second: 5,
        }
    }

    /// Overlay TOML overrides and a resolved API key on adapter defaults
    pub fn resolve(
        default_base_url: &str,
        default_requests_per_second: u32,
        overrides: &SourceSettings,
        api_key: Option<String>,
    ) -> Self {
        let mut settings = Self::new(
            overrides
                .base_url
                .as_deref()
                .unwrap_or(default_base_url),
        );
        settings.api_key = api_key;
        settings.requests_per_second = overrides
            .requests_per_second
            .unwrap_or(default_requests_per_second);
        if let Some(secs) = overrides.timeout_secs {
            settings.timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = overrides.max_retries {
            settings.max_retries = retries;
        }
        settings
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Worst-case duration of a lookup issuing `requests` sequential requests
    ///
    /// Every attempt may spend the full request timeout on each request, retry
    /// `n` sleeps `retry_delay * n` first, and the governor may hold the first
    /// request for one default backoff.
    pub fn lookup_budget(&self, requests: u32) -> Duration {
        let attempts = self.max_retries + 1;
        let delays = self.max_retries * (self.max_retries + 1) / 2;
        self.timeout * requests.max(1) * attempts + self.retry_delay * delays + DEFAULT_BACKOFF
    }
}

/// HTTP client, governor and settings bundled for one adapter
#[derive(Debug)]
pub struct HttpSource {
    source: SourceId,
    client: Client,
    governor: RateGovernor,
    settings: AdapterSettings,
}

impl HttpSource {
    pub fn new(source: SourceId, settings: AdapterSettings) -> Result<Self, SourceError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(Duration::from_secs(5))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SourceError::Unavailable(format!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            source,
            client,
            governor: RateGovernor::per_second(settings.requests_per_second),
            settings,
        })
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    pub fn api_key(&self) -> Option<&str> {
        self.settings.api_key.as_deref()
    }

    pub fn governor(&self) -> &RateGovernor {
        &self.governor
    }

    /// Absolute URL for an API path
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url, path.trim_start_matches('/'))
    }

    /// Absolute URL with each segment percent-encoded
    pub fn segment_url(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.settings.base_url).map_err(|e| {
            SourceError::Unavailable(format!("{} base URL invalid: {}", self.source, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                SourceError::Unavailable(format!("{} base URL cannot take a path", self.source))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.client.get(url)
    }

    /// Send a request through the governor and map the status
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, SourceError> {
        self.governor.acquire().await;

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Unavailable(format!("{} request timed out", self.source))
            } else {
                SourceError::Unavailable(format!("{} request failed: {}", self.source, e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        match status {
            StatusCode::NOT_FOUND => Err(SourceError::NotFound),
            StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                let retry_after = retry_after(&response);
                self.governor.back_off(retry_after.unwrap_or(DEFAULT_BACKOFF));
                warn!(
                    source = %self.source,
                    status = status.as_u16(),
                    retry_after_secs = retry_after.map(|d| d.as_secs()),
                    "Source rate limited, backing off"
                );
                Err(SourceError::RateLimited { retry_after })
            }
            _ => Err(SourceError::Unavailable(format!(
                "{} returned status {}",
                self.source, status
            ))),
        }
    }

    /// Send and decode a JSON body
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, SourceError> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{} response parse failed: {}", self.source, e)))
    }

    /// Send and return the body as text
    pub async fn get_text(&self, request: RequestBuilder) -> Result<String, SourceError> {
        let response = self.send(request).await?;
        response
            .text()
            .await
            .map_err(|e| SourceError::Unavailable(format!("{} body read failed: {}", self.source, e)))
    }

    /// Run `attempt`, retrying `Unavailable` up to `max_retries` times
    ///
    /// `NotFound` and `RateLimited` are returned immediately.
    pub async fn with_retries<F, Fut>(&self, key: &str, mut attempt: F) -> Result<PartialRecord, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PartialRecord, SourceError>>,
    {
        let mut tries = 0;
        loop {
            match attempt().await {
                Err(SourceError::Unavailable(reason)) if tries < self.settings.max_retries => {
                    tries += 1;
                    debug!(
                        source = %self.source,
                        key,
                        attempt = tries,
                        reason = %reason,
                        "Retrying source lookup"
                    );
                    tokio::time::sleep(self.settings.retry_delay * tries).await;
                }
                other => return other,
            }
        }
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
