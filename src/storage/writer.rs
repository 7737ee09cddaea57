//! Parquet Partition Writer
//!
//! Writes validated bar rows to one partition file. Encoding happens on a
//! blocking thread into an in-memory buffer before the file lock is taken;
//! the on-disk commit is temp-file + atomic rename, so a failed write leaves
//! nothing at the target path. Concurrent writers to the same path serialise
//! on a sidecar `<path>.lock` file.

use crate::config::CompressionCodec;
use crate::domain::bar::{BarRow, Frame};
use crate::domain::job::JobId;
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::Timestamp;
use crate::storage::{Partition, StorageError};
use arrow::array::{ArrayRef, Float64Array, Int32Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_ROW_GROUP_SIZE: usize = 10_000;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Fixed writer identity: reruns must be byte-identical for identical input.
const CREATED_BY: &str = "marketpipe";

#[derive(Debug, Clone)]
pub struct ParquetWriter {
    root: PathBuf,
    codec: CompressionCodec,
    row_group_size: usize,
    lock_timeout: Duration,
}

impl ParquetWriter {
    pub fn new(root: impl Into<PathBuf>, codec: CompressionCodec) -> Self {
        Self {
            root: root.into(),
            codec,
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
            lock_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_row_group_size(mut self, rows: usize) -> Self {
        self.row_group_size = rows;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `rows` to the partition file for (frame, symbol, day, job).
    ///
    /// Rows are sorted by `ts_ns` before encoding. With `overwrite=false` an
    /// existing file fails the write and is left untouched; with
    /// `overwrite=true` it is replaced atomically.
    pub async fn write(
        &self,
        mut rows: Vec<BarRow>,
        frame: Frame,
        symbol: &Symbol,
        trading_day: NaiveDate,
        job_id: &JobId,
        overwrite: bool,
    ) -> Result<PathBuf, StorageError> {
        if rows.is_empty() {
            return Err(StorageError::EmptyRowSet);
        }
        for row in &rows {
            if row.symbol != symbol.as_str() {
                return Err(StorageError::WrongSymbol {
                    expected: symbol.to_string(),
                    got: row.symbol.clone(),
                });
            }
            let date = Timestamp::from_nanos(row.ts_ns).trading_date();
            if date != trading_day {
                return Err(StorageError::MixedTradingDay {
                    expected: trading_day,
                    got_ts_ns: row.ts_ns,
                });
            }
        }
        rows.sort_by_key(|r| r.ts_ns);

        // Encode off the async runtime; compression is the one CPU-heavy
        // stage of the pipeline. The file lock is not held yet.
        let codec = self.codec;
        let row_group_size = self.row_group_size;
        let bytes = tokio::task::spawn_blocking(move || encode_rows(&rows, codec, row_group_size))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

        let partition = Partition::new(frame, symbol.clone(), trading_day, job_id.clone());
        let target = partition.path(&self.root);
        let dir = partition.dir(&self.root);
        fs::create_dir_all(&dir)?;

        let _lock = FileLock::acquire(&target, self.lock_timeout).await?;

        if !overwrite && target.exists() {
            return Err(StorageError::AlreadyExists(target));
        }

        let tmp = dir.join(format!(
            ".{}.tmp-{}",
            target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Uuid::new_v4().simple()
        ));
        let commit = (|| -> Result<(), StorageError> {
            fs::write(&tmp, &bytes)?;
            fs::rename(&tmp, &target)?;
            Ok(())
        })();
        if commit.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        commit?;

        debug!(path = %target.display(), bytes = bytes.len(), "partition written");
        Ok(target)
    }
}

fn compression_for(codec: CompressionCodec) -> Compression {
    match codec {
        CompressionCodec::Snappy => Compression::SNAPPY,
        CompressionCodec::Zstd => Compression::ZSTD(ZstdLevel::default()),
        CompressionCodec::Lz4 => Compression::LZ4,
        CompressionCodec::Gzip => Compression::GZIP(GzipLevel::default()),
    }
}

/// Arrow schema of the on-disk dataset.
pub fn bar_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("symbol", DataType::Utf8, false),
        Field::new("ts_ns", DataType::Int64, false),
        Field::new("open", DataType::Float64, false),
        Field::new("high", DataType::Float64, false),
        Field::new("low", DataType::Float64, false),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Int64, false),
        Field::new("trade_count", DataType::Int32, true),
        Field::new("vwap", DataType::Float64, true),
    ]))
}

fn encode_rows(
    rows: &[BarRow],
    codec: CompressionCodec,
    row_group_size: usize,
) -> Result<Vec<u8>, StorageError> {
    let schema = bar_schema();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.symbol.as_str()).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.ts_ns).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.open).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.high).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.low).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.close).collect::<Vec<_>>(),
        )),
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.volume).collect::<Vec<_>>(),
        )),
        Arc::new(Int32Array::from(
            rows.iter().map(|r| r.trade_count).collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            rows.iter().map(|r| r.vwap).collect::<Vec<_>>(),
        )),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let props = WriterProperties::builder()
        .set_compression(compression_for(codec))
        .set_max_row_group_size(row_group_size)
        .set_created_by(CREATED_BY.to_string())
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}

/// Sidecar lock file with create-new semantics; removed on drop.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    async fn acquire(target: &Path, timeout: Duration) -> Result<Self, StorageError> {
        let mut lock_path = target.as_os_str().to_owned();
        lock_path.push(".lock");
        let lock_path = PathBuf::from(lock_path);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
                Ok(_) => {
                    return Ok(Self { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if tokio::time::Instant::now() >= deadline {
                        warn!(lock = %lock_path.display(), "file lock contention timeout");
                        return Err(StorageError::LockTimeout(lock_path));
                    }
                    tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
                }
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "failed to remove lock file");
        }
    }
}
