//! OHLCV Bar Entity and Canonical Storage Row
//!
//! `OhlcvBar` is the validated domain entity; `BarRow` is the flat canonical
//! row produced by vendor adapters and written to Parquet. Construction of an
//! `OhlcvBar` is the single enforcement point for the OHLC invariant.

use crate::domain::price::{Price, Volume};
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::{Nanos, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Canonical row schema version emitted by every adapter.
pub const BAR_SCHEMA_VERSION: u32 = 1;

/// Bar time-bucket length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frame {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    D1,
}

impl Frame {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::D1 => "1d",
        }
    }

    pub fn duration_nanos(&self) -> Nanos {
        match self {
            Self::M1 => 60 * 1_000_000_000,
            Self::M5 => 5 * 60 * 1_000_000_000,
            Self::M15 => 15 * 60 * 1_000_000_000,
            Self::H1 => 3_600 * 1_000_000_000,
            Self::D1 => 86_400 * 1_000_000_000,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "1h" => Some(Self::H1),
            "1d" => Some(Self::D1),
            _ => None,
        }
    }

    /// The roll-up targets derived from the 1-minute dataset, in write order.
    pub fn aggregation_targets() -> [Frame; 4] {
        [Self::M5, Self::M15, Self::H1, Self::D1]
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat canonical bar row: vendor adapters emit it, the columnar writer
/// persists it. Prices are doubles to match the Parquet schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRow {
    pub symbol: String,
    pub ts_ns: Nanos,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vwap: Option<f64>,
    pub schema_version: u32,
    pub source: String,
    pub frame: String,
}

impl BarRow {
    /// Rows are identical for dedup purposes when every value field matches.
    pub fn same_values(&self, other: &BarRow) -> bool {
        self.symbol == other.symbol
            && self.ts_ns == other.ts_ns
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
            && self.trade_count == other.trade_count
            && self.vwap == other.vwap
    }
}

/// Validated minute bar with entity identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    id: Uuid,
    symbol: Symbol,
    timestamp: Timestamp,
    open: Price,
    high: Price,
    low: Price,
    close: Price,
    volume: Volume,
    trade_count: Option<u32>,
    vwap: Option<Price>,
}

impl OhlcvBar {
    /// Construct a bar, enforcing the OHLC invariant:
    /// `high >= max(open, close, low)`, `low <= min(open, close, high)`,
    /// all prices strictly positive.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        timestamp: Timestamp,
        open: Price,
        high: Price,
        low: Price,
        close: Price,
        volume: Volume,
        trade_count: Option<u32>,
        vwap: Option<Price>,
    ) -> Result<Self, BarInvariantError> {
        for (name, p) in [("open", open), ("high", high), ("low", low), ("close", close)] {
            if !p.is_positive() {
                return Err(BarInvariantError::NonPositivePrice {
                    field: name,
                    value: p,
                });
            }
        }
        let body_max = open.max(close).max(low);
        if high < body_max {
            return Err(BarInvariantError::HighBelowRange { high, max: body_max });
        }
        let body_min = open.min(close).min(high);
        if low > body_min {
            return Err(BarInvariantError::LowAboveRange { low, min: body_min });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            symbol,
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            trade_count,
            vwap,
        })
    }

    /// Validate and lift a canonical row into the domain.
    pub fn from_row(row: &BarRow) -> Result<Self, BarInvariantError> {
        let symbol = Symbol::new(&row.symbol)
            .map_err(|e| BarInvariantError::BadSymbol(e.to_string()))?;
        if row.volume < 0 {
            return Err(BarInvariantError::NegativeVolume(row.volume));
        }
        let price = |v: f64| Price::from_f64(v).map_err(|e| BarInvariantError::BadPrice(e.to_string()));
        Self::new(
            symbol,
            Timestamp::from_nanos(row.ts_ns),
            price(row.open)?,
            price(row.high)?,
            price(row.low)?,
            price(row.close)?,
            Volume::new(row.volume as u64),
            row.trade_count.map(|c| c.max(0) as u32),
            row.vwap.map(price).transpose()?,
        )
    }

    pub fn to_row(&self, source: &str, frame: Frame) -> BarRow {
        BarRow {
            symbol: self.symbol.to_string(),
            ts_ns: self.timestamp.as_nanos(),
            open: self.open.to_f64(),
            high: self.high.to_f64(),
            low: self.low.to_f64(),
            close: self.close.to_f64(),
            volume: self.volume.value() as i64,
            trade_count: self.trade_count.map(|c| c as i32),
            vwap: self.vwap.map(|p| p.to_f64()),
            schema_version: BAR_SCHEMA_VERSION,
            source: source.to_string(),
            frame: frame.as_str().to_string(),
        }
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    #[inline]
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn open(&self) -> Price {
        self.open
    }

    pub fn high(&self) -> Price {
        self.high
    }

    pub fn low(&self) -> Price {
        self.low
    }

    pub fn close(&self) -> Price {
        self.close
    }

    pub fn volume(&self) -> Volume {
        self.volume
    }

    pub fn trade_count(&self) -> Option<u32> {
        self.trade_count
    }

    pub fn vwap(&self) -> Option<Price> {
        self.vwap
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BarInvariantError {
    NonPositivePrice { field: &'static str, value: Price },
    HighBelowRange { high: Price, max: Price },
    LowAboveRange { low: Price, min: Price },
    NegativeVolume(i64),
    BadSymbol(String),
    BadPrice(String),
}

impl fmt::Display for BarInvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositivePrice { field, value } => {
                write!(f, "{} must be positive: {}", field, value)
            }
            Self::HighBelowRange { high, max } => {
                write!(f, "high {} below max(open, close, low) {}", high, max)
            }
            Self::LowAboveRange { low, min } => {
                write!(f, "low {} above min(open, close, high) {}", low, min)
            }
            Self::NegativeVolume(v) => write!(f, "volume must be non-negative: {}", v),
            Self::BadSymbol(e) => write!(f, "invalid symbol: {}", e),
            Self::BadPrice(e) => write!(f, "invalid price: {}", e),
        }
    }
}

impl std::error::Error for BarInvariantError {}
