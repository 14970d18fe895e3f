//! Search backends for the escalation stage
//!
//! [`HttpSearchBackend`] fetches the results page directly.
//! [`WebDriverSearchBackend`] drives a real browser through a W3C WebDriver
//! endpoint (chromedriver, geckodriver): one session per page, opened,
//! navigated, read and deleted. A session whose fetch is dropped mid-flight
//! (caller timeout, cancellation) is still deleted by [`SessionGuard`].

use super::{EscalationError, SearchBackend};
use crate::sources::http::USER_AGENT;
use async_trait::async_trait;
use kestrel_common::config::{BrowserBackend, EscalationConfig};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Results page used when no search URL is configured
pub const DEFAULT_SEARCH_URL: &str = "https://html.duckduckgo.com/html/";

/// Results URL for `query`, appended as the `q` parameter
pub fn results_url(search_url: &Url, query: &str) -> Url {
    let mut url = search_url.clone();
    url.query_pairs_mut().append_pair("q", query);
    url
}

fn parse_search_url(config: &EscalationConfig) -> Result<Url, EscalationError> {
    let raw = config.search_url.as_deref().unwrap_or(DEFAULT_SEARCH_URL);
    Url::parse(raw).map_err(|e| EscalationError::Backend(format!("invalid search URL {}: {}", raw, e)))
}

fn build_client(timeout: Duration) -> Result<Client, EscalationError> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| EscalationError::Backend(format!("HTTP client build failed: {}", e)))
}

/// Backend selected by the configuration
pub fn build_backend(config: &EscalationConfig) -> Result<Arc<dyn SearchBackend>, EscalationError> {
    let search_url = parse_search_url(config)?;
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let backend: Arc<dyn SearchBackend> = match config.backend {
        BrowserBackend::Http => Arc::new(HttpSearchBackend::new(search_url, timeout)?),
        browser => Arc::new(WebDriverSearchBackend::new(
            &config.webdriver_url,
            browser,
            search_url,
            timeout,
        )?),
    };
    Ok(backend)
}

// ============================================================================
// Plain HTTP
// ============================================================================

pub struct HttpSearchBackend {
    client: Client,
    search_url: Url,
}

impl HttpSearchBackend {
    pub fn new(search_url: Url, timeout: Duration) -> Result<Self, EscalationError> {
        Ok(Self {
            client: build_client(timeout)?,
            search_url,
        })
    }

    async fn fetch(&self, url: Url) -> Result<String, EscalationError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| EscalationError::Backend(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EscalationError::Backend(format!(
                "{} returned status {}",
                url, status
            )));
        }
        response
            .text()
            .await
            .map_err(|e| EscalationError::Backend(format!("body read failed: {}", e)))
    }
}

#[async_trait]
impl SearchBackend for HttpSearchBackend {
    fn name(&self) -> &str {
        "http"
    }

    fn search_url(&self) -> &Url {
        &self.search_url
    }

    async fn fetch_results(&self, query: &str) -> Result<String, EscalationError> {
        self.fetch(results_url(&self.search_url, query)).await
    }

    async fn fetch_page(&self, url: &str) -> Result<String, EscalationError> {
        let url = Url::parse(url)
            .map_err(|e| EscalationError::Backend(format!("invalid page URL {}: {}", url, e)))?;
        self.fetch(url).await
    }
}

// ============================================================================
// WebDriver
// ============================================================================

/// Every WebDriver response wraps its payload in `value`
#[derive(Debug, Deserialize)]
struct WireResponse<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct NewSession {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Deletes its WebDriver session exactly once
///
/// The happy path awaits [`SessionGuard::close`]. If the owning future is
/// dropped first, `Drop` hands the DELETE to the runtime instead.
struct SessionGuard {
    client: Client,
    url: String,
    session: String,
    closed: bool,
}

impl SessionGuard {
    fn new(client: &Client, endpoint: &str, session: String) -> Self {
        Self {
            client: client.clone(),
            url: format!("{}/session/{}", endpoint, session),
            session,
            closed: false,
        }
    }

    async fn close(mut self) {
        delete_session(&self.client, &self.url, &self.session).await;
        self.closed = true;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(session = %self.session, "No runtime to close abandoned WebDriver session");
            return;
        };
        debug!(session = %self.session, "Closing abandoned WebDriver session");
        let client = self.client.clone();
        let url = std::mem::take(&mut self.url);
        let session = std::mem::take(&mut self.session);
        handle.spawn(async move { delete_session(&client, &url, &session).await });
    }
}

async fn delete_session(client: &Client, url: &str, session: &str) {
    let result = client
        .delete(url)
        .send()
        .await
        .and_then(|r| r.error_for_status());
    if let Err(e) = result {
        warn!(session, error = %e, "Failed to close WebDriver session");
    }
}

pub struct WebDriverSearchBackend {
    client: Client,
    endpoint: String,
    browser: BrowserBackend,
    search_url: Url,
}

impl WebDriverSearchBackend {
    pub fn new(
        endpoint: &str,
        browser: BrowserBackend,
        search_url: Url,
        timeout: Duration,
    ) -> Result<Self, EscalationError> {
        if browser == BrowserBackend::Http {
            return Err(EscalationError::Backend(
                "WebDriver backend needs a browser (chrome or firefox)".to_string(),
            ));
        }
        Ok(Self {
            client: build_client(timeout)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            browser,
            search_url,
        })
    }

    fn capabilities(&self) -> serde_json::Value {
        match self.browser {
            BrowserBackend::Firefox => json!({
                "capabilities": { "alwaysMatch": {
                    "browserName": "firefox",
                    "moz:firefoxOptions": { "args": ["-headless"] }
                }}
            }),
            _ => json!({
                "capabilities": { "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": { "args": ["--headless=new", "--disable-gpu"] }
                }}
            }),
        }
    }

    fn wire_error(step: &str, e: impl std::fmt::Display) -> EscalationError {
        EscalationError::Backend(format!("webdriver {} failed: {}", step, e))
    }

    async fn new_session(&self) -> Result<String, EscalationError> {
        let response = self
            .client
            .post(format!("{}/session", self.endpoint))
            .json(&self.capabilities())
            .send()
            .await
            .map_err(|e| Self::wire_error("new session", e))?
            .error_for_status()
            .map_err(|e| Self::wire_error("new session", e))?;
        let session: WireResponse<NewSession> = response
            .json()
            .await
            .map_err(|e| Self::wire_error("new session", e))?;
        Ok(session.value.session_id)
    }

    async fn navigate_and_read(&self, session: &str, url: &str) -> Result<String, EscalationError> {
        self.client
            .post(format!("{}/session/{}/url", self.endpoint, session))
            .json(&json!({ "url": url }))
            .send()
            .await
            .map_err(|e| Self::wire_error("navigate", e))?
            .error_for_status()
            .map_err(|e| Self::wire_error("navigate", e))?;

        let source: WireResponse<String> = self
            .client
            .get(format!("{}/session/{}/source", self.endpoint, session))
            .send()
            .await
            .map_err(|e| Self::wire_error("page source", e))?
            .error_for_status()
            .map_err(|e| Self::wire_error("page source", e))?
            .json()
            .await
            .map_err(|e| Self::wire_error("page source", e))?;
        Ok(source.value)
    }

    /// Load `url` in a fresh browser session and return the rendered source
    async fn page_source(&self, url: &str) -> Result<String, EscalationError> {
        let session = self.new_session().await?;
        debug!(session = %session, browser = %self.browser, url, "WebDriver session opened");
        let guard = SessionGuard::new(&self.client, &self.endpoint, session);
        let result = self.navigate_and_read(&guard.session, url).await;
        guard.close().await;
        result
    }
}

#[async_trait]
impl SearchBackend for WebDriverSearchBackend {
    fn name(&self) -> &str {
        match self.browser {
            BrowserBackend::Firefox => "firefox",
            _ => "chrome",
        }
    }

    fn search_url(&self) -> &Url {
        &self.search_url
    }

    async fn fetch_results(&self, query: &str) -> Result<String, EscalationError> {
        self.page_source(results_url(&self.search_url, query).as_str())
            .await
    }

    async fn fetch_page(&self, url: &str) -> Result<String, EscalationError> {
        self.page_source(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_results_url_encodes_query() {
        let base = Url::parse(DEFAULT_SEARCH_URL).unwrap();
        assert_eq!(
            results_url(&base, "kit fox taxonomy").as_str(),
            "https://html.duckduckgo.com/html/?q=kit+fox+taxonomy"
        );
    }

    #[tokio::test]
    async fn test_http_backend_fetches_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/html/"))
            .and(query_param("q", "kit fox taxonomy"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<a href=\"x\">x</a>"))
            .expect(1)
            .mount(&server)
            .await;

        let search_url = Url::parse(&format!("{}/html/", server.uri())).unwrap();
        let backend = HttpSearchBackend::new(search_url, Duration::from_secs(5)).unwrap();
        let html = backend.fetch_results("kit fox taxonomy").await.unwrap();
        assert!(html.contains("href"));
    }

    #[tokio::test]
    async fn test_http_backend_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let search_url = Url::parse(&format!("{}/html/", server.uri())).unwrap();
        let backend = HttpSearchBackend::new(search_url, Duration::from_secs(5)).unwrap();
        let result = backend.fetch_results("kit fox").await;
        assert!(matches!(result, Err(EscalationError::Backend(_))));
    }

    #[tokio::test]
    async fn test_webdriver_session_flow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .and(body_partial_json(json!({
                "capabilities": { "alwaysMatch": { "browserName": "firefox" } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "abc123", "capabilities": {} }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/abc123/url"))
            .and(body_partial_json(json!({ "url": "https://en.wikipedia.org/wiki/Kit_fox" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/abc123/source"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "value": "<html>kit fox</html>" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/abc123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": null })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = WebDriverSearchBackend::new(
            &server.uri(),
            BrowserBackend::Firefox,
            Url::parse(DEFAULT_SEARCH_URL).unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();

        let html = backend
            .fetch_page("https://en.wikipedia.org/wiki/Kit_fox")
            .await
            .unwrap();
        assert_eq!(html, "<html>kit fox</html>");
    }

    #[tokio::test]
    async fn test_webdriver_session_closed_after_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "s1" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/url"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let backend = WebDriverSearchBackend::new(
            &server.uri(),
            BrowserBackend::Chrome,
            Url::parse(DEFAULT_SEARCH_URL).unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();

        assert!(backend.fetch_results("kit fox").await.is_err());
    }

    #[tokio::test]
    async fn test_webdriver_session_closed_when_fetch_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": { "sessionId": "slow" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/slow/url"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "value": null }))
                    .set_delay(Duration::from_millis(1500)),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/slow"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let backend = Arc::new(
            WebDriverSearchBackend::new(
                &server.uri(),
                BrowserBackend::Firefox,
                Url::parse(DEFAULT_SEARCH_URL).unwrap(),
                Duration::from_secs(5),
            )
            .unwrap(),
        );
        let stage = crate::escalation::EscalationStage::new(backend)
            .with_timeout(Duration::from_secs(1));

        let result = stage.resolve_term("kit fox").await;
        assert!(matches!(result, Err(EscalationError::Backend(_))));

        // The DELETE runs on a spawned task
        tokio::time::sleep(Duration::from_millis(300)).await;
        let deletes = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method.as_str() == "DELETE")
            .count();
        assert_eq!(deletes, 1);
    }

    #[test]
    fn test_build_backend_rejects_bad_search_url() {
        let config = EscalationConfig {
            search_url: Some("not a url".to_string()),
            ..EscalationConfig::default()
        };
        assert!(build_backend(&config).is_err());
    }
}
