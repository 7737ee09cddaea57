//! Deterministic Fake Vendor
//!
//! In-process `BarFetcher` used by the seed-scenario tests and offline smoke
//! runs. Produces the same bars for the same (symbol, day) on every call, no
//! HTTP involved. Weekends yield empty responses, like a real equities
//! vendor.

use crate::domain::bar::{BarRow, BAR_SCHEMA_VERSION};
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::{Nanos, Timestamp, NANOS_PER_MINUTE};
use crate::vendors::{BarFetcher, FetchError};
use async_trait::async_trait;
use chrono::{Datelike, Weekday};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Regular session open, minutes after midnight UTC (13:30).
const SESSION_OPEN_MINUTE: i64 = 13 * 60 + 30;

#[derive(Debug)]
pub struct FakeMarketData {
    bars_per_day: usize,
    fail_symbols: HashSet<String>,
    /// Zero-based indexes at which to emit a bar violating the OHLC
    /// invariant.
    invalid_indexes: HashSet<usize>,
    /// Index after which to repeat the previous row verbatim.
    duplicate_index: Option<usize>,
    /// Index after which to repeat the previous timestamp with different
    /// values.
    conflict_index: Option<usize>,
    calls: Mutex<Vec<String>>,
}

impl FakeMarketData {
    pub fn new() -> Self {
        Self {
            bars_per_day: 390,
            fail_symbols: HashSet::new(),
            invalid_indexes: HashSet::new(),
            duplicate_index: None,
            conflict_index: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_bars_per_day(mut self, n: usize) -> Self {
        self.bars_per_day = n;
        self
    }

    /// Make every fetch for `symbol` fail with retry exhaustion.
    pub fn with_failing_symbol(mut self, symbol: &str) -> Self {
        self.fail_symbols.insert(symbol.to_string());
        self
    }

    pub fn with_invalid_bar_at(mut self, index: usize) -> Self {
        self.invalid_indexes.insert(index);
        self
    }

    pub fn with_duplicate_at(mut self, index: usize) -> Self {
        self.duplicate_index = Some(index);
        self
    }

    pub fn with_conflict_at(mut self, index: usize) -> Self {
        self.conflict_index = Some(index);
        self
    }

    /// Symbols fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn base_price(symbol: &Symbol) -> f64 {
        let sum: u32 = symbol.as_str().bytes().map(u32::from).sum();
        10.0 + (sum % 90) as f64
    }

    fn bar(&self, symbol: &Symbol, ts_ns: Nanos, index: usize) -> BarRow {
        let p = Self::base_price(symbol) + index as f64 * 0.01;
        let invalid = self.invalid_indexes.contains(&index);
        BarRow {
            symbol: symbol.to_string(),
            ts_ns,
            open: p,
            // An inverted high/low pair trips the construction invariant.
            high: if invalid { p - 1.0 } else { p + 0.05 },
            low: if invalid { p + 1.0 } else { p - 0.05 },
            close: p + 0.01,
            volume: 1_000 + index as i64,
            trade_count: Some(25),
            vwap: Some(p + 0.005),
            schema_version: BAR_SCHEMA_VERSION,
            source: "fake".to_string(),
            frame: "1m".to_string(),
        }
    }
}

impl Default for FakeMarketData {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BarFetcher for FakeMarketData {
    fn vendor(&self) -> &str {
        "fake"
    }

    async fn fetch_batch(
        &self,
        symbol: &Symbol,
        start_ns: Nanos,
        end_ns: Nanos,
    ) -> Result<Vec<BarRow>, FetchError> {
        self.calls.lock().push(symbol.to_string());

        if self.fail_symbols.contains(symbol.as_str()) {
            return Err(FetchError::RetryLimit {
                attempts: 4,
                last: "HTTP 503: simulated outage".to_string(),
            });
        }

        let day = Timestamp::from_nanos(start_ns).trading_date();
        if matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            return Ok(Vec::new());
        }

        let session_open =
            Timestamp::start_of_day(day).as_nanos() + SESSION_OPEN_MINUTE * NANOS_PER_MINUTE;
        let mut rows = Vec::with_capacity(self.bars_per_day);
        for i in 0..self.bars_per_day {
            let ts = session_open + i as i64 * NANOS_PER_MINUTE;
            if ts < start_ns || ts >= end_ns {
                continue;
            }
            rows.push(self.bar(symbol, ts, i));
            if self.duplicate_index == Some(i) {
                if let Some(last) = rows.last().cloned() {
                    rows.push(last);
                }
            }
            if self.conflict_index == Some(i) {
                let mut conflict = self.bar(symbol, ts, i);
                conflict.close += 0.5;
                conflict.high += 0.5;
                rows.push(conflict);
            }
        }
        Ok(rows)
    }
}
