//! Vendor Abstraction
//!
//! One `VendorAdapter` per market-data vendor supplies the request shape,
//! auth placement, response parsing, pagination cursor and retry eligibility;
//! the generic `MarketDataClient` owns everything else (HTTP, retry, backoff,
//! rate limiting, metrics). The `BarFetcher` trait is the seam the
//! coordinator depends on, implemented by the HTTP client and by the
//! deterministic fake vendor.

pub mod alpaca;
pub mod client;
pub mod fake;
pub mod iex;

use crate::config::ConfigError;
use crate::domain::bar::BarRow;
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::Nanos;
use crate::metrics::PipelineMetrics;
use crate::ratelimit::RateLimiter;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use alpaca::AlpacaAdapter;
pub use client::{MarketDataClient, Paginator};
pub use fake::FakeMarketData;
pub use iex::IexAdapter;

/// Truncation bound for response bodies embedded in error messages.
pub const BODY_SNIPPET_LEN: usize = 256;

/// Capability set a concrete vendor must supply.
pub trait VendorAdapter: Send + Sync {
    /// Vendor identifier used in metric labels and the canonical `source`.
    fn name(&self) -> &'static str;

    fn base_url(&self) -> &str;

    /// URL path appended to the base URL for a bar request.
    fn endpoint_path(&self, symbol: &Symbol) -> String;

    /// Query parameters for one page request.
    fn build_request_params(
        &self,
        symbol: &Symbol,
        start_ns: Nanos,
        end_ns: Nanos,
        cursor: Option<&str>,
    ) -> Vec<(String, String)>;

    /// Inject credentials into headers or query string, per vendor
    /// convention.
    fn auth_apply(&self, headers: &mut HeaderMap, params: &mut Vec<(String, String)>);

    /// Map one page of vendor JSON to canonical rows.
    fn parse_response(
        &self,
        raw: &serde_json::Value,
        symbol: &Symbol,
    ) -> Result<Vec<BarRow>, String>;

    /// Continuation token, absent on the last page.
    fn next_cursor(&self, raw: &serde_json::Value) -> Option<String>;

    /// Retry eligibility. The default covers vendor rate limiting and server
    /// errors.
    fn should_retry(&self, status: u16, _body: &serde_json::Value) -> bool {
        status == 429 || (500..600).contains(&status)
    }

    /// Credential material to mask out of surfaced error strings.
    fn secret_values(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Vendor credentials, delivered out-of-band via process environment.
#[derive(Debug, Clone)]
pub enum Credentials {
    KeySecret { key: String, secret: String },
    Token { token: String },
    None,
}

impl Credentials {
    /// Resolve credentials for `provider` from the environment.
    pub fn from_env(provider: &str) -> Result<Self, AuthError> {
        match provider {
            "alpaca" => {
                let key = std::env::var("ALPACA_KEY")
                    .map_err(|_| AuthError::Missing { provider: "alpaca", var: "ALPACA_KEY" })?;
                let secret = std::env::var("ALPACA_SECRET")
                    .map_err(|_| AuthError::Missing { provider: "alpaca", var: "ALPACA_SECRET" })?;
                Ok(Self::KeySecret { key, secret })
            }
            "iex" => {
                let token = std::env::var("IEX_TOKEN")
                    .map_err(|_| AuthError::Missing { provider: "iex", var: "IEX_TOKEN" })?;
                Ok(Self::Token { token })
            }
            _ => Ok(Self::None),
        }
    }

    /// Secret material that must never reach a surfaced error string.
    pub fn secret_values(&self) -> Vec<&str> {
        match self {
            Self::KeySecret { key, secret } => vec![key.as_str(), secret.as_str()],
            Self::Token { token } => vec![token.as_str()],
            Self::None => Vec::new(),
        }
    }
}

/// Replace any occurrence of `secrets` in `text` with a fixed mask.
pub fn mask_secrets(text: &str, secrets: &[&str]) -> String {
    let mut masked = text.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            masked = masked.replace(secret, "***");
        }
    }
    masked
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    Missing { provider: &'static str, var: &'static str },
    Rejected { provider: String },
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { provider, var } => {
                write!(f, "missing {} credentials: set {}", provider, var)
            }
            Self::Rejected { provider } => write!(f, "{} rejected the credentials", provider),
        }
    }
}

impl std::error::Error for AuthError {}

/// Retry and backoff policy applied per HTTP request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// `min(cap, base * 2^attempt)` before jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_backoff)
    }
}

/// Vendor fetch failures surfaced to the coordinator.
#[derive(Debug)]
pub enum FetchError {
    /// Per-attempt timeout elapsed.
    Timeout { seconds: u64 },
    /// Non-retryable HTTP status; carries the (masked, truncated) body.
    Status { status: u16, body: String },
    /// Retries exhausted on retryable failures.
    RetryLimit { attempts: u32, last: String },
    /// 2xx body that cannot be mapped to canonical rows.
    Parse { detail: String, snippet: String },
    /// Transport-level failure.
    Network(String),
    Auth(AuthError),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { seconds } => write!(f, "request timed out after {}s", seconds),
            Self::Status { status, body } => write!(f, "HTTP {}: {}", status, body),
            Self::RetryLimit { attempts, last } => {
                write!(f, "retry limit reached after {} attempts: {}", attempts, last)
            }
            Self::Parse { detail, snippet } => {
                write!(f, "cannot parse response: {} (body: {:?})", detail, snippet)
            }
            Self::Network(e) => write!(f, "network error: {}", e),
            Self::Auth(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FetchError {}

/// The seam the coordinator fetches through.
#[async_trait]
pub trait BarFetcher: Send + Sync {
    /// Vendor label for metrics and the job report.
    fn vendor(&self) -> &str;

    /// All canonical 1m rows for `[start_ns, end_ns)`, across pagination.
    async fn fetch_batch(
        &self,
        symbol: &Symbol,
        start_ns: Nanos,
        end_ns: Nanos,
    ) -> Result<Vec<BarRow>, FetchError>;
}

impl std::fmt::Debug for dyn BarFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BarFetcher({})", self.vendor())
    }
}

/// Resolve the provider name from configuration into a fetcher.
pub fn build_fetcher(
    provider: &str,
    feed: &str,
    batch_size: u32,
    request_timeout: Duration,
    credentials: Credentials,
    limiter: Option<Arc<RateLimiter>>,
    metrics: Arc<PipelineMetrics>,
) -> Result<Arc<dyn BarFetcher>, ConfigError> {
    match provider {
        "alpaca" => {
            let adapter = Arc::new(AlpacaAdapter::new(credentials, feed, batch_size));
            Ok(Arc::new(MarketDataClient::new(
                adapter,
                provider,
                feed,
                limiter,
                metrics,
                request_timeout,
            )))
        }
        "iex" => {
            let adapter = Arc::new(IexAdapter::new(credentials));
            Ok(Arc::new(MarketDataClient::new(
                adapter,
                provider,
                feed,
                limiter,
                metrics,
                request_timeout,
            )))
        }
        "fake" => Ok(Arc::new(FakeMarketData::new())),
        other => Err(ConfigError::UnknownProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff_for(0), Duration::from_millis(250));
        assert_eq!(p.backoff_for(1), Duration::from_millis(500));
        assert_eq!(p.backoff_for(2), Duration::from_secs(1));
        assert_eq!(p.backoff_for(20), Duration::from_secs(30));
    }

    #[test]
    fn test_mask_secrets() {
        let masked = mask_secrets(
            "HTTP 401: bad key SK12345 for account",
            &["SK12345", ""],
        );
        assert_eq!(masked, "HTTP 401: bad key *** for account");
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let err = build_fetcher(
            "bloomberg",
            "sip",
            1000,
            Duration::from_secs(30),
            Credentials::None,
            None,
            PipelineMetrics::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(_)));
    }

    #[test]
    fn test_credentials_from_env_missing() {
        std::env::remove_var("ALPACA_KEY");
        std::env::remove_var("ALPACA_SECRET");
        let err = Credentials::from_env("alpaca").unwrap_err();
        assert!(matches!(err, AuthError::Missing { provider: "alpaca", .. }));
    }
}
