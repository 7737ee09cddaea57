//! Timeframe Aggregation Engine
//!
//! Derives 5m/15m/1h/1d bars from a completed job's 1-minute partitions.
//! Buckets are aligned to UTC; a bucket with at least one constituent bar is
//! emitted (partial buckets included), empty buckets are omitted. Reruns are
//! byte-identical: input order is normalised by sort and the writer settings
//! are fixed.

use crate::bus::{DomainEventBus, EventHandler};
use crate::domain::bar::{BarRow, Frame, BAR_SCHEMA_VERSION};
use crate::domain::events::{DomainEvent, EventMeta};
use crate::domain::job::JobId;
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::Timestamp;
use crate::storage::{read_partition, ParquetWriter, Partition, StorageError};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Roll one sorted 1-minute sequence up into `frame` buckets.
///
/// Returns the aggregated rows in bucket order; the caller partitions them by
/// trading date for writing.
pub fn aggregate_frame(rows: &[BarRow], frame: Frame) -> Vec<BarRow> {
    let width = frame.duration_nanos();
    let mut buckets: BTreeMap<i64, Vec<&BarRow>> = BTreeMap::new();
    for row in rows {
        let bucket_start = row.ts_ns - row.ts_ns.rem_euclid(width);
        buckets.entry(bucket_start).or_default().push(row);
    }

    buckets
        .into_iter()
        .map(|(bucket_start, members)| {
            // Members arrive sorted because the input is sorted.
            let first = members.first().expect("bucket is non-empty");
            let last = members.last().expect("bucket is non-empty");
            let trade_count: i32 = members.iter().filter_map(|r| r.trade_count).sum();
            let has_counts = members.iter().any(|r| r.trade_count.is_some());
            BarRow {
                symbol: first.symbol.clone(),
                ts_ns: bucket_start,
                open: first.open,
                close: last.close,
                high: members.iter().map(|r| r.high).fold(f64::MIN, f64::max),
                low: members.iter().map(|r| r.low).fold(f64::MAX, f64::min),
                volume: members.iter().map(|r| r.volume).sum(),
                trade_count: has_counts.then_some(trade_count),
                vwap: None,
                schema_version: BAR_SCHEMA_VERSION,
                source: first.source.clone(),
                frame: frame.as_str().to_string(),
            }
        })
        .collect()
}

/// Reads 1m partitions for a completed job and writes the roll-up frames.
pub struct AggregationEngine {
    dataset_root: PathBuf,
    writer: ParquetWriter,
    bus: Arc<DomainEventBus>,
}

impl AggregationEngine {
    pub fn new(writer: ParquetWriter, bus: Arc<DomainEventBus>) -> Self {
        Self {
            dataset_root: writer.root().to_path_buf(),
            writer,
            bus,
        }
    }

    /// Aggregate every symbol of a job into all target frames.
    pub async fn run(
        &self,
        job_id: &JobId,
        symbols: &[Symbol],
        trading_days: &[NaiveDate],
    ) -> Result<(), StorageError> {
        for symbol in symbols {
            let mut minute_rows = Vec::new();
            for &day in trading_days {
                let partition = Partition::new(Frame::M1, symbol.clone(), day, job_id.clone());
                let path = partition.path(&self.dataset_root);
                if !path.exists() {
                    continue;
                }
                minute_rows.extend(read_partition(&path, Frame::M1)?);
            }
            if minute_rows.is_empty() {
                debug!(job_id = %job_id, symbol = symbol.as_str(), "no 1m data to aggregate");
                continue;
            }
            minute_rows.sort_by_key(|r| r.ts_ns);

            for frame in Frame::aggregation_targets() {
                let aggregated = aggregate_frame(&minute_rows, frame);
                let total = aggregated.len();

                // One partition file per trading date the buckets land on.
                let mut by_date: BTreeMap<NaiveDate, Vec<BarRow>> = BTreeMap::new();
                for row in aggregated {
                    let date = Timestamp::from_nanos(row.ts_ns).trading_date();
                    by_date.entry(date).or_default().push(row);
                }
                for (date, rows) in by_date {
                    self.writer
                        .write(rows, frame, symbol, date, job_id, true)
                        .await?;
                }

                self.bus
                    .publish(&DomainEvent::AggregationCompleted {
                        meta: EventMeta::now(),
                        job_id: job_id.to_string(),
                        symbol: symbol.clone(),
                        frame: frame.as_str().to_string(),
                        bar_count: total,
                    })
                    .await;
            }
            info!(job_id = %job_id, symbol = symbol.as_str(), "aggregation complete");
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for AggregationEngine {
    fn name(&self) -> &str {
        "aggregation-engine"
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        if let DomainEvent::IngestionJobCompleted {
            job_id,
            symbol_bar_counts,
            trading_days,
            ..
        } = event
        {
            let symbols: Vec<Symbol> = symbol_bar_counts.keys().cloned().collect();
            self.run(&JobId::from_raw(job_id.clone()), &symbols, trading_days)
                .await?;
        }
        Ok(())
    }
}
