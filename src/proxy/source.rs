//! Upstream sources of candidate proxies

use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;

use super::endpoint::ProxyEndpoint;
use crate::config::RetryConfig;
use crate::retry::with_retry;
use crate::Result;

/// Provides the current list of candidate endpoints
#[async_trait]
pub trait ProxyListSource: Send + Sync {
    /// Fetch the full candidate list
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}

/// Parse a newline-separated proxy list
///
/// Blank lines and `#` comments are skipped, unparsable lines are logged and
/// skipped, duplicates are dropped keeping the first occurrence.
pub fn parse_proxy_list(text: &str) -> Vec<ProxyEndpoint> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.parse::<ProxyEndpoint>() {
            Ok(endpoint) => {
                if seen.insert(endpoint.clone()) {
                    endpoints.push(endpoint);
                }
            }
            Err(e) => tracing::warn!(line = lineno + 1, error = %e, "Skipping unparsable proxy entry"),
        }
    }

    endpoints
}

/// Fixed list, for tests and embedders that manage proxies themselves
pub struct StaticProxyListSource {
    endpoints: Vec<ProxyEndpoint>,
}

impl StaticProxyListSource {
    /// Source that always returns `endpoints`
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl ProxyListSource for StaticProxyListSource {
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>> {
        Ok(self.endpoints.clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// List downloaded over HTTP, one endpoint per line
pub struct HttpProxyListSource {
    client: reqwest::Client,
    url: String,
    retry: RetryConfig,
}

impl HttpProxyListSource {
    /// Source reading `url`
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 2.0,
                jitter: true,
            },
        })
    }

    /// Override the retry policy for the list download
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn fetch_once(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl ProxyListSource for HttpProxyListSource {
    async fn fetch(&self) -> Result<Vec<ProxyEndpoint>> {
        let body = with_retry(&self.retry, || self.fetch_once()).await?;
        let endpoints = parse_proxy_list(&body);
        tracing::debug!(url = %self.url, count = endpoints.len(), "Fetched proxy list");
        Ok(endpoints)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyScheme;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parse_skips_comments_blanks_and_garbage() {
        let text = "\
# upstream list
10.0.0.1:8080

socks5://10.0.0.2:1080
not a proxy
10.0.0.1:8080
  http://user:pw@10.0.0.3:3128  
";
        let list = parse_proxy_list(text);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0], ProxyEndpoint::new(ProxyScheme::Http, "10.0.0.1", 8080));
        assert_eq!(list[1].scheme(), ProxyScheme::Socks5);
        assert_eq!(list[2].url(), "http://user:pw@10.0.0.3:3128");
    }

    #[tokio::test]
    async fn static_source_returns_its_list() {
        let e = ProxyEndpoint::new(ProxyScheme::Http, "h", 1);
        let source = StaticProxyListSource::new(vec![e.clone()]);
        assert_eq!(source.fetch().await.unwrap(), vec![e]);
    }

    #[tokio::test]
    async fn http_source_parses_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxies.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("1.1.1.1:80\n2.2.2.2:3128\n"))
            .mount(&server)
            .await;

        let source = HttpProxyListSource::new(format!("{}/proxies.txt", server.uri())).unwrap();
        let list = source.fetch().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].port(), 3128);
    }

    #[tokio::test]
    async fn http_source_reports_status_errors_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpProxyListSource::new(format!("{}/missing", server.uri())).unwrap();
        assert!(source.fetch().await.is_err());
    }
}
