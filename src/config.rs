//! Ingestion Configuration
//!
//! The schema-versioned record handed over by the CLI/config layer. Only
//! version "1" is supported; numeric parameters are range-checked by
//! `validate()` before a job is planned.

use crate::domain::symbol::Symbol;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

pub const SUPPORTED_CONFIG_VERSION: &str = "1";

pub const MIN_BATCH_SIZE: u32 = 1;
pub const MAX_BATCH_SIZE: u32 = 10_000;
pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 32;

/// Parquet compression codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionCodec {
    Snappy,
    Zstd,
    Lz4,
    Gzip,
}

impl CompressionCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snappy => "snappy",
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
            Self::Gzip => "gzip",
        }
    }
}

impl Default for CompressionCodec {
    fn default() -> Self {
        Self::Snappy
    }
}

impl fmt::Display for CompressionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_config_version() -> String {
    SUPPORTED_CONFIG_VERSION.to_string()
}

fn default_batch_size() -> u32 {
    1_000
}

fn default_workers() -> usize {
    3
}

fn default_feed_type() -> String {
    "iex".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_invalid_row_fraction() -> f64 {
    0.5
}

/// Everything the coordinator needs to run one ingestion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_config_version")]
    pub config_version: String,
    pub provider: String,
    pub symbols: Vec<Symbol>,
    pub start: NaiveDate,
    /// Inclusive end date.
    pub end: NaiveDate,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    pub output_path: PathBuf,
    #[serde(default)]
    pub compression: CompressionCodec,
    #[serde(default = "default_feed_type")]
    pub feed_type: String,
    #[serde(default)]
    pub reports_path: Option<PathBuf>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Units fail when more than this fraction of their rows violate the
    /// bar construction invariant.
    #[serde(default = "default_max_invalid_row_fraction")]
    pub max_invalid_row_fraction: f64,
}

impl IngestionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.config_version != SUPPORTED_CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(self.config_version.clone()));
        }
        if self.symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }
        if self.start > self.end {
            return Err(ConfigError::InvalidDateRange {
                start: self.start,
                end: self.end,
            });
        }
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConfigError::OutOfRange {
                field: "batch_size",
                value: self.batch_size as i64,
                min: MIN_BATCH_SIZE as i64,
                max: MAX_BATCH_SIZE as i64,
            });
        }
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&self.workers) {
            return Err(ConfigError::OutOfRange {
                field: "workers",
                value: self.workers as i64,
                min: MIN_WORKERS as i64,
                max: MAX_WORKERS as i64,
            });
        }
        if !(0.0..=1.0).contains(&self.max_invalid_row_fraction) {
            return Err(ConfigError::OutOfRange {
                field: "max_invalid_row_fraction",
                value: (self.max_invalid_row_fraction * 100.0) as i64,
                min: 0,
                max: 100,
            });
        }
        Ok(())
    }

    /// Report directory: explicit `reports_path`, or `<output>/reports`.
    pub fn reports_root(&self) -> PathBuf {
        self.reports_path
            .clone()
            .unwrap_or_else(|| self.output_path.join("reports"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    UnsupportedVersion(String),
    NoSymbols,
    InvalidDateRange { start: NaiveDate, end: NaiveDate },
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    UnknownProvider(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported config_version {:?} (supported: {})", v, SUPPORTED_CONFIG_VERSION)
            }
            Self::NoSymbols => write!(f, "config must list at least one symbol"),
            Self::InvalidDateRange { start, end } => {
                write!(f, "start date {} is after end date {}", start, end)
            }
            Self::OutOfRange { field, value, min, max } => {
                write!(f, "{} = {} outside [{}, {}]", field, value, min, max)
            }
            Self::UnknownProvider(p) => write!(f, "unknown provider {:?}", p),
        }
    }
}

impl std::error::Error for ConfigError {}
