//! UTC Timestamps and Half-Open Time Ranges
//!
//! Nanoseconds-since-epoch (`i64`) is the interchange currency across the
//! pipeline; `Timestamp` is the typed wrapper used at domain boundaries.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanoseconds since the Unix epoch.
pub type Nanos = i64;

pub const NANOS_PER_SEC: i64 = 1_000_000_000;
pub const NANOS_PER_MINUTE: i64 = 60 * NANOS_PER_SEC;
pub const NANOS_PER_DAY: i64 = 86_400 * NANOS_PER_SEC;

/// UTC instant with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn new(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Coerce a naive (zone-less) datetime to UTC.
    pub fn from_naive(naive: NaiveDateTime) -> Self {
        Self(Utc.from_utc_datetime(&naive))
    }

    pub fn from_nanos(ns: Nanos) -> Self {
        Self(DateTime::from_timestamp_nanos(ns))
    }

    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Midnight UTC at the start of `date`.
    pub fn start_of_day(date: NaiveDate) -> Self {
        Self(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap()))
    }

    #[inline]
    pub fn as_nanos(&self) -> Nanos {
        // In range for any date this pipeline handles (1677..2262).
        self.0.timestamp_nanos_opt().unwrap_or(0)
    }

    #[inline]
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn to_iso8601(&self) -> String {
        self.0.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
    }

    /// The UTC calendar date, used as the partition key.
    #[inline]
    pub fn trading_date(&self) -> NaiveDate {
        self.0.date_naive()
    }

    pub fn add_nanos(&self, ns: Nanos) -> Self {
        Self::from_nanos(self.as_nanos() + ns)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Result<Self, TimeRangeError> {
        if start >= end {
            return Err(TimeRangeError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// The full UTC day `[00:00, next 00:00)` containing `date`.
    pub fn single_day(date: NaiveDate) -> Self {
        let start = Timestamp::start_of_day(date);
        Self {
            start,
            end: start.add_nanos(NANOS_PER_DAY),
        }
    }

    #[inline]
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration_seconds(&self) -> i64 {
        (self.end.as_nanos() - self.start.as_nanos()) / NANOS_PER_SEC
    }

    /// UTC calendar dates touched by the range, in order.
    ///
    /// The end bound is exclusive, so a range ending exactly at midnight does
    /// not include that day.
    pub fn trading_days(&self) -> Vec<NaiveDate> {
        let first = self.start.trading_date();
        let last = Timestamp::from_nanos(self.end.as_nanos() - 1).trading_date();
        let mut days = Vec::new();
        let mut d = first;
        while d <= last {
            days.push(d);
            d = d.succ_opt().expect("date overflow");
        }
        days
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRangeError {
    Inverted { start: Timestamp, end: Timestamp },
}

impl fmt::Display for TimeRangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inverted { start, end } => {
                write!(f, "time range start {} is not before end {}", start, end)
            }
        }
    }
}

impl std::error::Error for TimeRangeError {}
