//! Alpaca Market Data Adapter
//!
//! Bars endpoint `/v2/stocks/{symbol}/bars` with header auth and
//! `next_page_token` cursor pagination.

use crate::domain::bar::{BarRow, BAR_SCHEMA_VERSION};
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::Nanos;
use crate::vendors::{Credentials, VendorAdapter};
use chrono::DateTime;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;

const ALPACA_DATA_BASE: &str = "https://data.alpaca.markets";

pub struct AlpacaAdapter {
    credentials: Credentials,
    feed: String,
    page_limit: u32,
}

impl AlpacaAdapter {
    pub fn new(credentials: Credentials, feed: &str, page_limit: u32) -> Self {
        Self {
            credentials,
            feed: feed.to_string(),
            page_limit,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlpacaPage {
    #[serde(default)]
    bars: Option<Vec<AlpacaBar>>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    t: String,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: i64,
    #[serde(default)]
    n: Option<i32>,
    #[serde(default)]
    vw: Option<f64>,
}

fn rfc3339_to_nanos(t: &str) -> Result<Nanos, String> {
    DateTime::parse_from_rfc3339(t)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| format!("bad bar timestamp {:?}: {}", t, e))?
        .timestamp_nanos_opt()
        .ok_or_else(|| format!("bar timestamp out of range: {:?}", t))
}

fn nanos_to_rfc3339(ns: Nanos) -> String {
    DateTime::from_timestamp_nanos(ns).to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

impl VendorAdapter for AlpacaAdapter {
    fn name(&self) -> &'static str {
        "alpaca"
    }

    fn base_url(&self) -> &str {
        ALPACA_DATA_BASE
    }

    fn endpoint_path(&self, symbol: &Symbol) -> String {
        format!("/v2/stocks/{}/bars", symbol)
    }

    fn build_request_params(
        &self,
        _symbol: &Symbol,
        start_ns: Nanos,
        end_ns: Nanos,
        cursor: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut params = vec![
            ("timeframe".to_string(), "1Min".to_string()),
            ("start".to_string(), nanos_to_rfc3339(start_ns)),
            // Alpaca's end bound is inclusive; step inside the half-open
            // window.
            ("end".to_string(), nanos_to_rfc3339(end_ns - 1)),
            ("limit".to_string(), self.page_limit.to_string()),
            ("feed".to_string(), self.feed.clone()),
            ("adjustment".to_string(), "raw".to_string()),
        ];
        if let Some(token) = cursor {
            params.push(("page_token".to_string(), token.to_string()));
        }
        params
    }

    fn auth_apply(&self, headers: &mut HeaderMap, _params: &mut Vec<(String, String)>) {
        match &self.credentials {
            Credentials::KeySecret { key, secret } => {
                if let Ok(v) = HeaderValue::from_str(key) {
                    headers.insert("APCA-API-KEY-ID", v);
                }
                if let Ok(v) = HeaderValue::from_str(secret) {
                    headers.insert("APCA-API-SECRET-KEY", v);
                }
            }
            Credentials::Token { token } => {
                if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                    headers.insert(reqwest::header::AUTHORIZATION, v);
                }
            }
            Credentials::None => {}
        }
    }

    fn parse_response(
        &self,
        raw: &serde_json::Value,
        symbol: &Symbol,
    ) -> Result<Vec<BarRow>, String> {
        let page: AlpacaPage =
            serde_json::from_value(raw.clone()).map_err(|e| format!("unexpected page shape: {}", e))?;
        let bars = page.bars.unwrap_or_default();
        let mut rows = Vec::with_capacity(bars.len());
        for bar in bars {
            rows.push(BarRow {
                symbol: symbol.to_string(),
                ts_ns: rfc3339_to_nanos(&bar.t)?,
                open: bar.o,
                high: bar.h,
                low: bar.l,
                close: bar.c,
                volume: bar.v,
                trade_count: bar.n,
                vwap: bar.vw,
                schema_version: BAR_SCHEMA_VERSION,
                source: "alpaca".to_string(),
                frame: "1m".to_string(),
            });
        }
        Ok(rows)
    }

    fn next_cursor(&self, raw: &serde_json::Value) -> Option<String> {
        raw.get("next_page_token")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    fn secret_values(&self) -> Vec<String> {
        self.credentials
            .secret_values()
            .into_iter()
            .map(|s| s.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> AlpacaAdapter {
        AlpacaAdapter::new(
            Credentials::KeySecret {
                key: "key123".to_string(),
                secret: "sec456".to_string(),
            },
            "iex",
            1000,
        )
    }

    fn sym() -> Symbol {
        Symbol::new("AAPL").unwrap()
    }

    #[test]
    fn test_endpoint_and_params() {
        let a = adapter();
        assert_eq!(a.endpoint_path(&sym()), "/v2/stocks/AAPL/bars");
        let params = a.build_request_params(&sym(), 1_710_500_000_000_000_000, 1_710_586_400_000_000_000, Some("tok"));
        assert!(params.contains(&("timeframe".to_string(), "1Min".to_string())));
        assert!(params.contains(&("page_token".to_string(), "tok".to_string())));
        assert!(params.contains(&("feed".to_string(), "iex".to_string())));
    }

    #[test]
    fn test_auth_goes_into_headers() {
        let a = adapter();
        let mut headers = HeaderMap::new();
        let mut params = Vec::new();
        a.auth_apply(&mut headers, &mut params);
        assert_eq!(headers.get("APCA-API-KEY-ID").unwrap(), "key123");
        assert_eq!(headers.get("APCA-API-SECRET-KEY").unwrap(), "sec456");
        assert!(params.is_empty());
    }

    #[test]
    fn test_parse_page() {
        let a = adapter();
        let raw = json!({
            "bars": [
                {"t": "2024-03-15T13:30:00Z", "o": 10.0, "h": 11.0, "l": 9.5, "c": 10.5, "v": 1200, "n": 45, "vw": 10.41},
                {"t": "2024-03-15T13:31:00Z", "o": 10.5, "h": 10.8, "l": 10.2, "c": 10.6, "v": 900}
            ],
            "next_page_token": "abc"
        });
        let rows = a.parse_response(&raw, &sym()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].symbol, "AAPL");
        assert_eq!(rows[0].trade_count, Some(45));
        assert_eq!(rows[1].trade_count, None);
        // 2024-03-15T13:30:00Z
        assert_eq!(rows[0].ts_ns % 60_000_000_000, 0);
        assert_eq!(a.next_cursor(&raw).as_deref(), Some("abc"));
    }

    #[test]
    fn test_empty_page_and_null_cursor() {
        let a = adapter();
        let raw = json!({"bars": null, "next_page_token": null});
        assert!(a.parse_response(&raw, &sym()).unwrap().is_empty());
        assert_eq!(a.next_cursor(&raw), None);
    }

    #[test]
    fn test_bad_timestamp_is_parse_failure() {
        let a = adapter();
        let raw = json!({"bars": [{"t": "yesterday", "o": 1.0, "h": 1.0, "l": 1.0, "c": 1.0, "v": 1}]});
        assert!(a.parse_response(&raw, &sym()).is_err());
    }

    #[test]
    fn test_default_retry_classification() {
        let a = adapter();
        let empty = json!({});
        assert!(a.should_retry(429, &empty));
        assert!(a.should_retry(503, &empty));
        assert!(!a.should_retry(403, &empty));
        assert!(!a.should_retry(200, &empty));
    }
}
