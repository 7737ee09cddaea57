//! IEX Cloud Adapter
//!
//! Intraday prices endpoint with token auth in the query string. IEX serves
//! one trading day per request and does not paginate, so `next_cursor` is
//! always absent.

use crate::domain::bar::{BarRow, BAR_SCHEMA_VERSION};
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::{Nanos, Timestamp};
use crate::vendors::{Credentials, VendorAdapter};
use chrono::{NaiveDate, NaiveTime};
use reqwest::header::HeaderMap;
use serde::Deserialize;

const IEX_CLOUD_BASE: &str = "https://cloud.iexapis.com/stable";

pub struct IexAdapter {
    credentials: Credentials,
}

impl IexAdapter {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[derive(Debug, Deserialize)]
struct IexMinute {
    date: String,
    minute: String,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    close: Option<f64>,
    #[serde(default)]
    volume: Option<i64>,
    #[serde(default, rename = "numberOfTrades")]
    number_of_trades: Option<i32>,
}

fn minute_to_nanos(date: &str, minute: &str) -> Result<Nanos, String> {
    let d = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| format!("bad date {:?}: {}", date, e))?;
    let t = NaiveTime::parse_from_str(minute, "%H:%M")
        .map_err(|e| format!("bad minute {:?}: {}", minute, e))?;
    Ok(Timestamp::from_naive(d.and_time(t)).as_nanos())
}

impl VendorAdapter for IexAdapter {
    fn name(&self) -> &'static str {
        "iex"
    }

    fn base_url(&self) -> &str {
        IEX_CLOUD_BASE
    }

    fn endpoint_path(&self, symbol: &Symbol) -> String {
        format!("/stock/{}/intraday-prices", symbol)
    }

    fn build_request_params(
        &self,
        _symbol: &Symbol,
        start_ns: Nanos,
        _end_ns: Nanos,
        _cursor: Option<&str>,
    ) -> Vec<(String, String)> {
        let day = Timestamp::from_nanos(start_ns).trading_date();
        vec![
            ("exactDate".to_string(), day.format("%Y%m%d").to_string()),
            ("chartIEXOnly".to_string(), "true".to_string()),
        ]
    }

    fn auth_apply(&self, _headers: &mut HeaderMap, params: &mut Vec<(String, String)>) {
        if let Credentials::Token { token } = &self.credentials {
            params.push(("token".to_string(), token.clone()));
        }
    }

    fn parse_response(
        &self,
        raw: &serde_json::Value,
        symbol: &Symbol,
    ) -> Result<Vec<BarRow>, String> {
        let minutes: Vec<IexMinute> = serde_json::from_value(raw.clone())
            .map_err(|e| format!("unexpected intraday shape: {}", e))?;
        let mut rows = Vec::with_capacity(minutes.len());
        for m in minutes {
            // Minutes with no trades come back with null OHLC; skip them.
            let (open, high, low, close) = match (m.open, m.high, m.low, m.close) {
                (Some(o), Some(h), Some(l), Some(c)) => (o, h, l, c),
                _ => continue,
            };
            rows.push(BarRow {
                symbol: symbol.to_string(),
                ts_ns: minute_to_nanos(&m.date, &m.minute)?,
                open,
                high,
                low,
                close,
                volume: m.volume.unwrap_or(0),
                trade_count: m.number_of_trades,
                vwap: None,
                schema_version: BAR_SCHEMA_VERSION,
                source: "iex".to_string(),
                frame: "1m".to_string(),
            });
        }
        Ok(rows)
    }

    fn next_cursor(&self, _raw: &serde_json::Value) -> Option<String> {
        None
    }

    fn secret_values(&self) -> Vec<String> {
        self.credentials
            .secret_values()
            .into_iter()
            .map(|s| s.to_string())
            .collect()
    }
}
