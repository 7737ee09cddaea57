//! Partitioned Columnar Dataset
//!
//! Hive-style layout: `frame=<F>/symbol=<S>/date=<YYYY-MM-DD>/<job_id>.parquet`.

pub mod reader;
pub mod writer;

use crate::domain::bar::Frame;
use crate::domain::job::JobId;
use crate::domain::symbol::Symbol;
use chrono::NaiveDate;
use std::fmt;
use std::path::{Path, PathBuf};

pub use reader::read_partition;
pub use writer::ParquetWriter;

/// Logical address of one file in the dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub frame: Frame,
    pub symbol: Symbol,
    pub trading_date: NaiveDate,
    pub job_id: JobId,
}

impl Partition {
    pub fn new(frame: Frame, symbol: Symbol, trading_date: NaiveDate, job_id: JobId) -> Self {
        Self {
            frame,
            symbol,
            trading_date,
            job_id,
        }
    }

    /// Directory holding this partition's file.
    pub fn dir(&self, root: &Path) -> PathBuf {
        root.join(format!("frame={}", self.frame))
            .join(format!("symbol={}", self.symbol))
            .join(format!("date={}", self.trading_date.format("%Y-%m-%d")))
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        self.dir(root).join(format!("{}.parquet", self.job_id))
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame={}/symbol={}/date={}/{}.parquet",
            self.frame,
            self.symbol,
            self.trading_date.format("%Y-%m-%d"),
            self.job_id
        )
    }
}

/// Storage failures. A failed write never leaves a partial file at the
/// target path.
#[derive(Debug)]
pub enum StorageError {
    EmptyRowSet,
    WrongSymbol { expected: String, got: String },
    MixedTradingDay { expected: NaiveDate, got_ts_ns: i64 },
    AlreadyExists(PathBuf),
    LockTimeout(PathBuf),
    Io(std::io::Error),
    Arrow(arrow::error::ArrowError),
    Parquet(parquet::errors::ParquetError),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRowSet => write!(f, "refusing to write an empty row set"),
            Self::WrongSymbol { expected, got } => {
                write!(f, "row symbol {} does not match partition symbol {}", got, expected)
            }
            Self::MixedTradingDay { expected, got_ts_ns } => {
                write!(
                    f,
                    "row at {}ns falls outside partition trading day {}",
                    got_ts_ns, expected
                )
            }
            Self::AlreadyExists(p) => {
                write!(f, "partition file already exists (overwrite=false): {}", p.display())
            }
            Self::LockTimeout(p) => write!(f, "timed out acquiring file lock: {}", p.display()),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Arrow(e) => write!(f, "arrow error: {}", e),
            Self::Parquet(e) => write!(f, "parquet error: {}", e),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<arrow::error::ArrowError> for StorageError {
    fn from(e: arrow::error::ArrowError) -> Self {
        Self::Arrow(e)
    }
}

impl From<parquet::errors::ParquetError> for StorageError {
    fn from(e: parquet::errors::ParquetError) -> Self {
        Self::Parquet(e)
    }
}
