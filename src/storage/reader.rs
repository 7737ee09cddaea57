//! Partition Read-Back
//!
//! Loads a partition file back into canonical rows for the validation and
//! aggregation stages. Column access is by name so schema evolution that
//! appends columns stays compatible.

use crate::domain::bar::{BarRow, Frame, BAR_SCHEMA_VERSION};
use crate::storage::StorageError;
use arrow::array::{Array, Float64Array, Int32Array, Int64Array, StringArray};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::fs::File;
use std::path::Path;

/// Read every row of one partition file, in file order.
pub fn read_partition(path: &Path, frame: Frame) -> Result<Vec<BarRow>, StorageError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;

        let symbols = column::<StringArray>(&batch, "symbol")?;
        let ts = column::<Int64Array>(&batch, "ts_ns")?;
        let open = column::<Float64Array>(&batch, "open")?;
        let high = column::<Float64Array>(&batch, "high")?;
        let low = column::<Float64Array>(&batch, "low")?;
        let close = column::<Float64Array>(&batch, "close")?;
        let volume = column::<Int64Array>(&batch, "volume")?;
        let trade_count = column::<Int32Array>(&batch, "trade_count")?;
        let vwap = column::<Float64Array>(&batch, "vwap")?;

        for i in 0..batch.num_rows() {
            rows.push(BarRow {
                symbol: symbols.value(i).to_string(),
                ts_ns: ts.value(i),
                open: open.value(i),
                high: high.value(i),
                low: low.value(i),
                close: close.value(i),
                volume: volume.value(i),
                trade_count: trade_count.is_valid(i).then(|| trade_count.value(i)),
                vwap: vwap.is_valid(i).then(|| vwap.value(i)),
                schema_version: BAR_SCHEMA_VERSION,
                source: "dataset".to_string(),
                frame: frame.as_str().to_string(),
            });
        }
    }
    Ok(rows)
}

fn column<'a, T: 'static>(
    batch: &'a arrow::record_batch::RecordBatch,
    name: &str,
) -> Result<&'a T, StorageError> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| {
            StorageError::Arrow(arrow::error::ArrowError::SchemaError(format!(
                "missing or mistyped column {:?}",
                name
            )))
        })
}
