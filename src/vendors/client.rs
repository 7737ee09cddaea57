//! Generic Vendor HTTP Client
//!
//! Drives any `VendorAdapter` with pagination, per-attempt rate limiting,
//! exponential backoff with jitter, per-call timeouts, and metric emission
//! around every request. Timeouts and transport failures are retryable;
//! non-retryable statuses surface immediately with a masked, truncated body.

use crate::domain::bar::BarRow;
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::Nanos;
use crate::metrics::PipelineMetrics;
use crate::ratelimit::RateLimiter;
use crate::vendors::{
    mask_secrets, BarFetcher, FetchError, RetryPolicy, VendorAdapter, BODY_SNIPPET_LEN,
};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct MarketDataClient {
    http: reqwest::Client,
    adapter: Arc<dyn VendorAdapter>,
    provider: String,
    feed: String,
    limiter: Option<Arc<RateLimiter>>,
    metrics: Arc<PipelineMetrics>,
    retry: RetryPolicy,
    request_timeout: Duration,
    base_url_override: Option<String>,
}

impl MarketDataClient {
    pub fn new(
        adapter: Arc<dyn VendorAdapter>,
        provider: &str,
        feed: &str,
        limiter: Option<Arc<RateLimiter>>,
        metrics: Arc<PipelineMetrics>,
        request_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent("marketpipe/0.3")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            adapter,
            provider: provider.to_string(),
            feed: feed.to_string(),
            limiter,
            metrics,
            retry: RetryPolicy::default(),
            request_timeout,
            base_url_override: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Point the client at a different host (test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url_override = Some(base_url.into());
        self
    }

    fn base_url(&self) -> &str {
        self.base_url_override
            .as_deref()
            .unwrap_or_else(|| self.adapter.base_url())
    }

    /// Lazy page sequence over `[start_ns, end_ns)`. Finite, not
    /// restartable.
    pub fn paginate(&self, symbol: Symbol, start_ns: Nanos, end_ns: Nanos) -> Paginator<'_> {
        Paginator {
            client: self,
            symbol,
            start_ns,
            end_ns,
            cursor: None,
            done: false,
        }
    }

    /// One page request with the full retry discipline. Returns the rows and
    /// the continuation cursor.
    async fn fetch_page(
        &self,
        symbol: &Symbol,
        start_ns: Nanos,
        end_ns: Nanos,
        cursor: Option<&str>,
    ) -> Result<(Vec<BarRow>, Option<String>), FetchError> {
        let vendor = self.adapter.name();
        let url = format!("{}{}", self.base_url(), self.adapter.endpoint_path(symbol));
        let secrets = self.adapter.secret_values();
        let secret_refs: Vec<&str> = secrets.iter().map(String::as_str).collect();

        let mut last_err: Option<FetchError> = None;

        // The attempt counter is per request; each page starts fresh.
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let backoff = self.retry.backoff_for(attempt - 1) + self.random_jitter();
                debug!(
                    vendor,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying vendor request"
                );
                tokio::time::sleep(backoff).await;
            }

            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }

            let mut headers = HeaderMap::new();
            let mut params =
                self.adapter
                    .build_request_params(symbol, start_ns, end_ns, cursor);
            self.adapter.auth_apply(&mut headers, &mut params);

            self.metrics
                .record_request(vendor, &self.provider, &self.feed);
            let started = Instant::now();

            let request = self.http.get(&url).headers(headers).query(&params);
            let response = match tokio::time::timeout(self.request_timeout, request.send()).await {
                Err(_) => {
                    self.metrics
                        .record_error(vendor, &self.provider, &self.feed, "timeout");
                    warn!(vendor, attempt, "vendor request timed out");
                    last_err = Some(FetchError::Timeout {
                        seconds: self.request_timeout.as_secs(),
                    });
                    continue;
                }
                Ok(Err(e)) => {
                    self.metrics
                        .record_error(vendor, &self.provider, &self.feed, "exception");
                    warn!(vendor, attempt, error = %e, "vendor request failed");
                    last_err = Some(FetchError::Network(mask_secrets(
                        &e.to_string(),
                        &secret_refs,
                    )));
                    continue;
                }
                Ok(Ok(resp)) => resp,
            };

            self.metrics.record_duration(
                vendor,
                &self.provider,
                &self.feed,
                started.elapsed().as_secs_f64(),
            );

            let status = response.status().as_u16();
            let text = match response.text().await {
                Ok(t) => t,
                Err(e) => {
                    self.metrics
                        .record_error(vendor, &self.provider, &self.feed, "exception");
                    last_err = Some(FetchError::Network(mask_secrets(
                        &e.to_string(),
                        &secret_refs,
                    )));
                    continue;
                }
            };

            if (200..300).contains(&status) {
                let json: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(v) => v,
                    Err(e) => {
                        // Undecodable body: retry eligibility is consulted
                        // with an empty payload.
                        self.metrics
                            .record_error(vendor, &self.provider, &self.feed, "exception");
                        let parse = FetchError::Parse {
                            detail: e.to_string(),
                            snippet: snippet(&mask_secrets(&text, &secret_refs)),
                        };
                        if self.adapter.should_retry(status, &serde_json::json!({})) {
                            last_err = Some(parse);
                            continue;
                        }
                        return Err(parse);
                    }
                };
                let rows = self
                    .adapter
                    .parse_response(&json, symbol)
                    .map_err(|detail| FetchError::Parse {
                        detail,
                        snippet: snippet(&mask_secrets(&text, &secret_refs)),
                    })?;
                let next = self.adapter.next_cursor(&json);
                return Ok((rows, next));
            }

            self.metrics
                .record_error(vendor, &self.provider, &self.feed, &status.to_string());
            let body_json: serde_json::Value =
                serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);
            if self.adapter.should_retry(status, &body_json) {
                warn!(vendor, status, attempt, "retryable vendor status");
                last_err = Some(FetchError::Status {
                    status,
                    body: snippet(&mask_secrets(&text, &secret_refs)),
                });
                continue;
            }
            return Err(FetchError::Status {
                status,
                body: snippet(&mask_secrets(&text, &secret_refs)),
            });
        }

        // Retries exhausted; a parse failure keeps its own shape so callers
        // see the offending body prefix.
        Err(match last_err {
            Some(parse @ FetchError::Parse { .. }) => parse,
            Some(other) => FetchError::RetryLimit {
                attempts: self.retry.max_retries + 1,
                last: other.to_string(),
            },
            None => FetchError::RetryLimit {
                attempts: self.retry.max_retries + 1,
                last: "no attempt recorded".to_string(),
            },
        })
    }

    fn random_jitter(&self) -> Duration {
        let cap = self.retry.jitter.as_millis() as u64;
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
    }
}

#[async_trait]
impl BarFetcher for MarketDataClient {
    fn vendor(&self) -> &str {
        self.adapter.name()
    }

    async fn fetch_batch(
        &self,
        symbol: &Symbol,
        start_ns: Nanos,
        end_ns: Nanos,
    ) -> Result<Vec<BarRow>, FetchError> {
        let mut pages = self.paginate(symbol.clone(), start_ns, end_ns);
        let mut rows = Vec::new();
        while let Some(page) = pages.next_page().await? {
            rows.extend(page);
        }
        debug!(
            vendor = self.adapter.name(),
            symbol = symbol.as_str(),
            rows = rows.len(),
            "fetch_batch complete"
        );
        Ok(rows)
    }
}

/// Pull-based page sequence. Each `next_page` call issues (at most) one
/// vendor request chain; `None` marks exhaustion.
pub struct Paginator<'a> {
    client: &'a MarketDataClient,
    symbol: Symbol,
    start_ns: Nanos,
    end_ns: Nanos,
    cursor: Option<String>,
    done: bool,
}

impl Paginator<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<BarRow>>, FetchError> {
        if self.done {
            return Ok(None);
        }
        let (rows, next) = self
            .client
            .fetch_page(
                &self.symbol,
                self.start_ns,
                self.end_ns,
                self.cursor.as_deref(),
            )
            .await?;
        match next {
            Some(cursor) => self.cursor = Some(cursor),
            None => self.done = true,
        }
        Ok(Some(rows))
    }
}

fn snippet(text: &str) -> String {
    if text.len() <= BODY_SNIPPET_LEN {
        text.to_string()
    } else {
        let mut end = BODY_SNIPPET_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendors::AlpacaAdapter;
    use crate::vendors::Credentials;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn page_json(n_bars: usize, next: Option<&str>) -> String {
        let bars: Vec<String> = (0..n_bars)
            .map(|i| {
                format!(
                    r#"{{"t":"2024-03-15T13:{:02}:00Z","o":10.0,"h":11.0,"l":9.5,"c":10.5,"v":100,"n":7,"vw":10.4}}"#,
                    30 + i
                )
            })
            .collect();
        match next {
            Some(token) => format!(
                r#"{{"bars":[{}],"next_page_token":"{}"}}"#,
                bars.join(","),
                token
            ),
            None => format!(r#"{{"bars":[{}],"next_page_token":null}}"#, bars.join(",")),
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(metrics: &Arc<PipelineMetrics>, base: &str) -> MarketDataClient {
        let adapter = Arc::new(AlpacaAdapter::new(Credentials::None, "iex", 1000));
        MarketDataClient::new(
            adapter,
            "alpaca",
            "iex",
            None,
            metrics.clone(),
            Duration::from_secs(5),
        )
        .with_retry_policy(RetryPolicy {
            max_retries: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            jitter: Duration::ZERO,
        })
        .with_base_url(base)
    }

    #[tokio::test]
    async fn test_paginates_across_pages() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits_handler = hits.clone();
        let router = Router::new().route(
            "/v2/stocks/AAPL/bars",
            get(move |query: axum::extract::RawQuery| {
                let hits = hits_handler.clone();
                async move {
                    let q = query.0.unwrap_or_default();
                    hits.fetch_add(1, Ordering::SeqCst);
                    if q.contains("page_token=p2") {
                        page_json(2, None)
                    } else {
                        page_json(3, Some("p2"))
                    }
                }
            }),
        );
        let base = serve(router).await;
        let metrics = PipelineMetrics::new();
        let c = client(&metrics, &base);

        let rows = c
            .fetch_batch(&Symbol::new("AAPL").unwrap(), 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.requests_count("alpaca", "alpaca", "iex"), 2);
    }

    #[tokio::test]
    async fn test_retries_429_then_succeeds() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits_handler = hits.clone();
        let router = Router::new().route(
            "/v2/stocks/AAPL/bars",
            get(move || {
                let hits = hits_handler.clone();
                async move {
                    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                        (StatusCode::TOO_MANY_REQUESTS, "slow down".to_string())
                    } else {
                        (StatusCode::OK, page_json(1, None))
                    }
                }
            }),
        );
        let base = serve(router).await;
        let metrics = PipelineMetrics::new();
        let c = client(&metrics, &base);

        let rows = c
            .fetch_batch(&Symbol::new("AAPL").unwrap(), 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(metrics.requests_count("alpaca", "alpaca", "iex"), 2);
        assert_eq!(metrics.errors_count("alpaca", "alpaca", "iex", "429"), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_status_fails_immediately() {
        let router = Router::new().route(
            "/v2/stocks/AAPL/bars",
            get(|| async { (StatusCode::FORBIDDEN, "key revoked") }),
        );
        let base = serve(router).await;
        let metrics = PipelineMetrics::new();
        let c = client(&metrics, &base);

        let err = c
            .fetch_batch(&Symbol::new("AAPL").unwrap(), 0, i64::MAX)
            .await
            .unwrap_err();
        match err {
            FetchError::Status { status, body } => {
                assert_eq!(status, 403);
                assert!(body.contains("key revoked"));
            }
            other => panic!("expected Status error, got {:?}", other),
        }
        assert_eq!(metrics.requests_count("alpaca", "alpaca", "iex"), 1);
        assert_eq!(metrics.errors_count("alpaca", "alpaca", "iex", "403"), 1);
    }

    #[tokio::test]
    async fn test_retry_limit_on_persistent_5xx() {
        let router = Router::new().route(
            "/v2/stocks/AAPL/bars",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "oops") }),
        );
        let base = serve(router).await;
        let metrics = PipelineMetrics::new();
        let c = client(&metrics, &base);

        let err = c
            .fetch_batch(&Symbol::new("AAPL").unwrap(), 0, i64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RetryLimit { attempts: 3, .. }));
        assert_eq!(metrics.requests_count("alpaca", "alpaca", "iex"), 3);
        assert_eq!(metrics.errors_count("alpaca", "alpaca", "iex", "500"), 3);
    }

    #[tokio::test]
    async fn test_undecodable_2xx_body_is_parse_error() {
        let router = Router::new().route(
            "/v2/stocks/AAPL/bars",
            get(|| async { "<html>not json</html>" }),
        );
        let base = serve(router).await;
        let metrics = PipelineMetrics::new();
        let c = client(&metrics, &base);

        let err = c
            .fetch_batch(&Symbol::new("AAPL").unwrap(), 0, i64::MAX)
            .await
            .unwrap_err();
        match err {
            FetchError::Parse { snippet, .. } => assert!(snippet.contains("<html>")),
            other => panic!("expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_snippet_truncates() {
        let long = "x".repeat(1_000);
        let s = snippet(&long);
        assert!(s.len() <= BODY_SNIPPET_LEN + 3);
        assert!(s.ends_with("..."));
        assert_eq!(snippet("short"), "short");
    }
}
