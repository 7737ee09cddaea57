//! Ingestion Job Coordinator
//!
//! Plans (symbol × trading-day) work units, skips units already covered by a
//! checkpoint, and drives the rest through a bounded worker pool sharing an
//! mpsc work queue. Per-unit failures are recorded and the job continues;
//! the job fails only when no unit succeeds. Cancellation is honoured at
//! every suspension point inside the unit pipeline.

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, JobHistoryRecord};
use crate::config::{ConfigError, IngestionConfig};
use crate::bus::DomainEventBus;
use crate::domain::aggregate::{AggregateError, SymbolBarsAggregate};
use crate::domain::bar::{BarInvariantError, BarRow, Frame, OhlcvBar};
use crate::domain::job::{IngestionJob, JobId, JobState, JobTransitionError};
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::{TimeRange, Timestamp, NANOS_PER_DAY};
use crate::metrics::PipelineMetrics;
use crate::storage::{ParquetWriter, StorageError};
use crate::vendors::{BarFetcher, FetchError};
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One (symbol, trading-day) unit of work.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub symbol: Symbol,
    pub trading_day: NaiveDate,
    pub range: TimeRange,
}

impl WorkUnit {
    fn new(symbol: Symbol, trading_day: NaiveDate) -> Self {
        Self {
            symbol,
            trading_day,
            range: TimeRange::single_day(trading_day),
        }
    }
}

/// Final job summary handed back to the caller.
#[derive(Debug, Clone)]
pub struct IngestionReport {
    pub job_id: JobId,
    pub state: JobState,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub rows_written: usize,
    pub errors: Vec<String>,
}

impl IngestionReport {
    /// 0 = all units succeeded, 1 = partial failure, 2 = nothing succeeded.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            JobState::Completed if self.failed_count == 0 => 0,
            JobState::Completed if self.success_count > 0 => 1,
            _ => 2,
        }
    }
}

#[derive(Debug)]
enum UnitOutcome {
    Success {
        unit: WorkUnit,
        rows: usize,
    },
    Failed {
        unit: WorkUnit,
        reason: String,
    },
    Cancelled,
}

/// Shared state handed to the worker tasks.
struct UnitContext {
    job_id: JobId,
    job: Arc<Mutex<IngestionJob>>,
    fetcher: Arc<dyn BarFetcher>,
    writer: ParquetWriter,
    checkpoints: Arc<CheckpointStore>,
    bus: Arc<DomainEventBus>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
    max_invalid_row_fraction: f64,
}

pub struct JobCoordinator {
    config: IngestionConfig,
    fetcher: Arc<dyn BarFetcher>,
    writer: ParquetWriter,
    checkpoints: Arc<CheckpointStore>,
    bus: Arc<DomainEventBus>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
}

impl JobCoordinator {
    pub fn new(
        config: IngestionConfig,
        fetcher: Arc<dyn BarFetcher>,
        writer: ParquetWriter,
        checkpoints: Arc<CheckpointStore>,
        bus: Arc<DomainEventBus>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            config,
            fetcher,
            writer,
            checkpoints,
            bus,
            metrics,
            cancel: CancellationToken::new(),
        }
    }

    /// Token callers can use to abort the run. Pending units never start;
    /// in-flight units stop at their next suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the job to a terminal state.
    pub async fn run(&self) -> Result<IngestionReport, CoordinatorError> {
        self.config.validate()?;

        let job_id = JobId::for_run(&self.config.provider, self.config.start, self.config.end);
        let range = TimeRange::new(
            Timestamp::start_of_day(self.config.start),
            Timestamp::start_of_day(self.config.end).add_nanos(NANOS_PER_DAY),
        )
        .map_err(|_| ConfigError::InvalidDateRange {
            start: self.config.start,
            end: self.config.end,
        })?;

        let mut job = IngestionJob::new(
            job_id.clone(),
            self.config.provider.clone(),
            self.config.feed_type.clone(),
            self.config.symbols.clone(),
            range,
        );

        // Work planning: weekend days are planned too; the vendor returns
        // empty responses and the unit succeeds with zero rows.
        let mut units = Vec::new();
        let mut skipped: Vec<WorkUnit> = Vec::new();
        for symbol in &self.config.symbols {
            for day in range.trading_days() {
                let unit = WorkUnit::new(symbol.clone(), day);
                match self.checkpoints.load(symbol, day)? {
                    Some(cp) if cp.covers(unit.range.end.as_nanos()) => {
                        debug!(symbol = symbol.as_str(), day = %day, "unit covered by checkpoint, skipping");
                        skipped.push(unit);
                    }
                    _ => units.push(unit),
                }
            }
        }

        let mut pending_per_symbol: HashMap<String, u64> = HashMap::new();
        for unit in &units {
            *pending_per_symbol.entry(unit.symbol.to_string()).or_insert(0) += 1;
        }
        for (symbol, pending) in &pending_per_symbol {
            self.metrics.set_backlog(symbol, *pending);
        }

        job.start()?;
        // Symbols whose every unit is already checkpointed still count as
        // processed, with zero new bars.
        for unit in &skipped {
            job.mark_symbol_processed(&unit.symbol, unit.trading_day, 0, None)?;
        }
        let startup_events = job.take_events();
        self.bus.publish_all(&startup_events).await;
        let job = Arc::new(Mutex::new(job));

        info!(
            job_id = %job_id,
            units = units.len(),
            skipped = skipped.len(),
            workers = self.config.workers,
            "ingestion job planned"
        );

        let ctx = Arc::new(UnitContext {
            job_id: job_id.clone(),
            job: job.clone(),
            fetcher: self.fetcher.clone(),
            writer: self.writer.clone(),
            checkpoints: self.checkpoints.clone(),
            bus: self.bus.clone(),
            metrics: self.metrics.clone(),
            cancel: self.cancel.clone(),
            max_invalid_row_fraction: self.config.max_invalid_row_fraction,
        });

        let outcomes = self.dispatch(ctx.clone(), units).await;

        let mut success_count = 0usize;
        let mut failed_count = 0usize;
        let mut rows_written = 0usize;
        let mut cancelled = false;
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                UnitOutcome::Success { rows, .. } => {
                    success_count += 1;
                    rows_written += rows;
                }
                UnitOutcome::Failed { unit, reason } => {
                    failed_count += 1;
                    errors.push(format!(
                        "Failed {} {}-{}: {}",
                        unit.symbol,
                        unit.range.start.to_iso8601(),
                        unit.range.end.to_iso8601(),
                        reason
                    ));
                }
                UnitOutcome::Cancelled => cancelled = true,
            }
        }

        drop(ctx);
        let state;
        let final_events = {
            let mut job = job.lock();
            state = if cancelled || self.cancel.is_cancelled() {
                job.cancel()?;
                JobState::Cancelled
            } else if success_count == 0 && failed_count > 0 {
                job.fail(format!("all {} units failed", failed_count))?;
                JobState::Failed
            } else {
                // A symbol whose every unit failed was never marked; record
                // it with zero bars so the terminal transition is legal.
                let unmarked: Vec<Symbol> = self
                    .config
                    .symbols
                    .iter()
                    .filter(|s| !job.was_processed(s))
                    .cloned()
                    .collect();
                for symbol in unmarked {
                    job.mark_symbol_processed(&symbol, self.config.start, 0, None)?;
                }
                job.complete(failed_count == 0)?;
                JobState::Completed
            };
            job.take_events()
        };
        // IngestionJobCompleted is the job's final event; validation and
        // aggregation hang off it.
        self.bus.publish_all(&final_events).await;

        self.checkpoints.record_job(&JobHistoryRecord {
            job_id: job_id.to_string(),
            provider: self.config.provider.clone(),
            feed: self.config.feed_type.clone(),
            state: state.as_str().to_string(),
            success_count,
            failed_count,
            rows_written,
        })?;

        let report = IngestionReport {
            job_id,
            state,
            success_count,
            failed_count,
            skipped_count: skipped.len(),
            rows_written,
            errors,
        };
        info!(
            job_id = %report.job_id,
            state = state.as_str(),
            success = report.success_count,
            failed = report.failed_count,
            rows = report.rows_written,
            "ingestion job finished"
        );
        Ok(report)
    }

    /// Bounded worker pool over an mpsc work queue.
    async fn dispatch(&self, ctx: Arc<UnitContext>, units: Vec<WorkUnit>) -> Vec<UnitOutcome> {
        let (tx, rx) = tokio::sync::mpsc::channel::<WorkUnit>(units.len().max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for unit in units {
            // Capacity equals the queue length; send cannot block.
            let _ = tx.send(unit).await;
        }
        drop(tx);

        let workers = self.config.workers;
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let ctx = ctx.clone();
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                let mut outcomes = Vec::new();
                loop {
                    let unit = { rx.lock().await.recv().await };
                    let Some(unit) = unit else { break };

                    let outcome = if ctx.cancel.is_cancelled() {
                        UnitOutcome::Cancelled
                    } else {
                        let symbol = unit.symbol.to_string();
                        let outcome = process_unit(&ctx, unit).await;
                        ctx.metrics.dec_backlog(&symbol);
                        outcome
                    };
                    outcomes.push(outcome);
                }
                debug!(worker_id, processed = outcomes.len(), "worker drained");
                outcomes
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(outcomes) => all.extend(outcomes),
                Err(e) => warn!(error = %e, "worker task panicked"),
            }
        }
        all
    }
}

/// Classify a construction failure for the data-quality counter.
fn issue_type(err: &BarInvariantError) -> &'static str {
    match err {
        BarInvariantError::HighBelowRange { .. } | BarInvariantError::LowAboveRange { .. } => {
            "ohlc_inconsistency"
        }
        BarInvariantError::NonPositivePrice { .. } | BarInvariantError::BadPrice(_) => {
            "non_positive_price"
        }
        BarInvariantError::NegativeVolume(_) => "negative_volume",
        BarInvariantError::BadSymbol(_) => "malformed_row",
    }
}

/// The eight-step unit pipeline: fetch, construct, aggregate, write,
/// checkpoint, publish.
async fn process_unit(ctx: &UnitContext, unit: WorkUnit) -> UnitOutcome {
    let symbol = unit.symbol.clone();
    let start_ns = unit.range.start.as_nanos();
    let end_ns = unit.range.end.as_nanos();

    // Fetch (rate limiting happens inside the fetcher, per attempt).
    let rows = tokio::select! {
        _ = ctx.cancel.cancelled() => return UnitOutcome::Cancelled,
        result = ctx.fetcher.fetch_batch(&symbol, start_ns, end_ns) => match result {
            Ok(rows) => rows,
            Err(e) => {
                return UnitOutcome::Failed {
                    unit,
                    reason: fetch_reason(&e),
                }
            }
        },
    };

    if rows.is_empty() {
        // Weekend, holiday, or genuinely quiet day: a valid zero-row
        // outcome. No file, no checkpoint.
        return finish_unit(ctx, unit, Vec::new(), None).await;
    }

    // Construct domain bars, dropping rows that violate the invariant and
    // deduplicating byte-identical repeats.
    let total_rows = rows.len();
    let mut aggregate = SymbolBarsAggregate::start_collection(symbol.clone(), unit.trading_day);
    let mut accepted: Vec<BarRow> = Vec::with_capacity(rows.len());
    let mut accepted_by_ts: HashMap<i64, usize> = HashMap::new();
    let mut invalid_rows = 0usize;

    for row in rows {
        let bar = match OhlcvBar::from_row(&row) {
            Ok(bar) => bar,
            Err(e) => {
                invalid_rows += 1;
                ctx.metrics
                    .record_data_quality(symbol.as_str(), issue_type(&e));
                debug!(symbol = symbol.as_str(), ts_ns = row.ts_ns, error = %e, "row dropped");
                continue;
            }
        };
        match aggregate.add_bar(bar) {
            Ok(()) => {
                accepted_by_ts.insert(row.ts_ns, accepted.len());
                accepted.push(row);
            }
            Err(AggregateError::DuplicateTimestamp(ts)) => {
                let identical = accepted_by_ts
                    .get(&ts)
                    .map(|&i| accepted[i].same_values(&row))
                    .unwrap_or(false);
                if identical {
                    ctx.metrics
                        .record_data_quality(symbol.as_str(), "duplicate_timestamp");
                    continue;
                }
                return UnitOutcome::Failed {
                    unit,
                    reason: format!("conflicting duplicate bar at {}ns", ts),
                };
            }
            Err(e) => {
                return UnitOutcome::Failed {
                    unit,
                    reason: e.to_string(),
                }
            }
        }
    }

    if invalid_rows > 0 {
        let fraction = invalid_rows as f64 / total_rows as f64;
        if fraction > ctx.max_invalid_row_fraction {
            return UnitOutcome::Failed {
                unit,
                reason: format!(
                    "{:.0}% of {} rows violated bar invariants",
                    fraction * 100.0,
                    total_rows
                ),
            };
        }
    }

    if let Err(e) = aggregate.complete_collection() {
        return UnitOutcome::Failed {
            unit,
            reason: e.to_string(),
        };
    }
    let aggregate_events = aggregate.take_events();

    if accepted.is_empty() {
        let outcome = finish_unit(ctx, unit, Vec::new(), None).await;
        ctx.bus.publish_all(&aggregate_events).await;
        return outcome;
    }

    // Persist, then checkpoint only after the write is confirmed.
    let write = ctx.writer.write(
        accepted.clone(),
        Frame::M1,
        &symbol,
        unit.trading_day,
        &ctx.job_id,
        false,
    );
    let path = tokio::select! {
        _ = ctx.cancel.cancelled() => return UnitOutcome::Cancelled,
        result = write => match result {
            Ok(path) => path,
            Err(e) => {
                return UnitOutcome::Failed {
                    unit,
                    reason: storage_reason(&e),
                }
            }
        },
    };

    let last_ts = accepted.iter().map(|r| r.ts_ns).max().unwrap_or(start_ns);
    if let Err(e) = ctx
        .checkpoints
        .save(&symbol, &Checkpoint::new(unit.trading_day, last_ts, None))
    {
        return UnitOutcome::Failed {
            unit,
            reason: e.to_string(),
        };
    }

    let outcome = finish_unit(
        ctx,
        unit,
        accepted,
        Some(path.to_string_lossy().into_owned()),
    )
    .await;
    ctx.bus.publish_all(&aggregate_events).await;
    outcome
}

/// Record the unit on the job and flush the batch event.
async fn finish_unit(
    ctx: &UnitContext,
    unit: WorkUnit,
    rows: Vec<BarRow>,
    partition_path: Option<String>,
) -> UnitOutcome {
    let events = {
        let mut job = ctx.job.lock();
        if let Err(e) =
            job.mark_symbol_processed(&unit.symbol, unit.trading_day, rows.len(), partition_path)
        {
            return UnitOutcome::Failed {
                unit,
                reason: e.to_string(),
            };
        }
        job.take_events()
    };
    ctx.bus.publish_all(&events).await;
    UnitOutcome::Success {
        rows: rows.len(),
        unit,
    }
}

fn fetch_reason(e: &FetchError) -> String {
    match e {
        FetchError::RetryLimit { attempts, last } => {
            format!("retry limit after {} attempts ({})", attempts, last)
        }
        other => other.to_string(),
    }
}

fn storage_reason(e: &StorageError) -> String {
    match e {
        StorageError::AlreadyExists(p) => {
            format!("partition exists and overwrite is disabled: {}", p.display())
        }
        other => other.to_string(),
    }
}

#[derive(Debug)]
pub enum CoordinatorError {
    Config(ConfigError),
    Job(JobTransitionError),
    Checkpoint(CheckpointError),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid configuration: {}", e),
            Self::Job(e) => write!(f, "job state error: {}", e),
            Self::Checkpoint(e) => write!(f, "checkpoint store error: {}", e),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<ConfigError> for CoordinatorError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<JobTransitionError> for CoordinatorError {
    fn from(e: JobTransitionError) -> Self {
        Self::Job(e)
    }
}

impl From<CheckpointError> for CoordinatorError {
    fn from(e: CheckpointError) -> Self {
        Self::Checkpoint(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionCodec;
    use crate::vendors::FakeMarketData;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config(root: &TempDir, symbols: &[&str]) -> IngestionConfig {
        IngestionConfig {
            config_version: "1".to_string(),
            provider: "fake".to_string(),
            symbols: symbols.iter().map(|s| Symbol::new(s).unwrap()).collect(),
            start: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            batch_size: 1_000,
            workers: 2,
            output_path: root.path().to_path_buf(),
            compression: CompressionCodec::Snappy,
            feed_type: "sim".to_string(),
            reports_path: None,
            request_timeout_secs: 30,
            max_invalid_row_fraction: 0.5,
        }
    }

    fn coordinator(
        cfg: IngestionConfig,
        fetcher: Arc<dyn BarFetcher>,
    ) -> (JobCoordinator, Arc<CheckpointStore>, Arc<PipelineMetrics>) {
        let checkpoints = Arc::new(CheckpointStore::in_memory().unwrap());
        let metrics = PipelineMetrics::new();
        let writer = ParquetWriter::new(cfg.output_path.clone(), cfg.compression);
        let bus = DomainEventBus::new();
        let coord = JobCoordinator::new(
            cfg,
            fetcher,
            writer,
            checkpoints.clone(),
            bus,
            metrics.clone(),
        );
        (coord, checkpoints, metrics)
    }

    fn partition_path(root: &TempDir, symbol: &str, job_id: &JobId) -> PathBuf {
        root.path()
            .join("frame=1m")
            .join(format!("symbol={}", symbol))
            .join("date=2024-03-15")
            .join(format!("{}.parquet", job_id))
    }

    #[tokio::test]
    async fn test_single_symbol_clean_day() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, &["AAPL"]);
        let (coord, checkpoints, _metrics) =
            coordinator(cfg, Arc::new(FakeMarketData::new()));

        let report = coord.run().await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failed_count, 0);
        assert_eq!(report.rows_written, 390);
        assert_eq!(report.exit_code(), 0);

        assert!(partition_path(&tmp, "AAPL", &report.job_id).exists());
        let cp = checkpoints
            .load(
                &Symbol::new("AAPL").unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            )
            .unwrap()
            .unwrap();
        assert!(cp.last_ts_ns > 0);
    }

    #[tokio::test]
    async fn test_invalid_row_dropped_unit_succeeds() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, &["AAPL"]);
        let fake = FakeMarketData::new().with_invalid_bar_at(3);
        let (coord, _checkpoints, metrics) = coordinator(cfg, Arc::new(fake));

        let report = coord.run().await.unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.rows_written, 389);
        assert_eq!(metrics.data_quality_count("AAPL", "ohlc_inconsistency"), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_continues_and_reports() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, &["AAPL", "MSFT"]);
        let fake = FakeMarketData::new().with_failing_symbol("MSFT");
        let (coord, checkpoints, _metrics) = coordinator(cfg, Arc::new(fake));

        let report = coord.run().await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.success_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("Failed MSFT "));

        assert!(partition_path(&tmp, "AAPL", &report.job_id).exists());
        assert!(!partition_path(&tmp, "MSFT", &report.job_id).exists());
        assert!(checkpoints
            .load(
                &Symbol::new("MSFT").unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
            )
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_total_failure_fails_job() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, &["AAPL"]);
        let fake = FakeMarketData::new().with_failing_symbol("AAPL");
        let (coord, _checkpoints, _metrics) = coordinator(cfg, Arc::new(fake));

        let report = coord.run().await.unwrap();
        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_weekend_day_succeeds_with_zero_rows() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp, &["AAPL"]);
        // 2024-03-16 is a Saturday.
        cfg.start = NaiveDate::from_ymd_opt(2024, 3, 16).unwrap();
        cfg.end = cfg.start;
        let (coord, checkpoints, _metrics) = coordinator(cfg, Arc::new(FakeMarketData::new()));

        let report = coord.run().await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.success_count, 1);
        assert_eq!(report.rows_written, 0);
        assert_eq!(report.exit_code(), 0);
        // No file, no checkpoint.
        assert!(checkpoints
            .load(
                &Symbol::new("AAPL").unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 16).unwrap()
            )
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_checkpointed_unit_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, &["AAPL"]);
        let fake = Arc::new(FakeMarketData::new());
        let checkpoints = Arc::new(CheckpointStore::in_memory().unwrap());
        let day = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let end = Timestamp::start_of_day(day).as_nanos() + NANOS_PER_DAY;
        checkpoints
            .save(
                &Symbol::new("AAPL").unwrap(),
                &Checkpoint::new(day, end - crate::domain::timestamp::NANOS_PER_MINUTE, None),
            )
            .unwrap();

        let metrics = PipelineMetrics::new();
        let writer = ParquetWriter::new(cfg.output_path.clone(), cfg.compression);
        let coord = JobCoordinator::new(
            cfg,
            fake.clone(),
            writer,
            checkpoints,
            DomainEventBus::new(),
            metrics,
        );

        let report = coord.run().await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.success_count, 0);
        assert_eq!(report.skipped_count, 1);
        assert_eq!(report.exit_code(), 0);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_conflicting_duplicate_fails_unit() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, &["AAPL"]);
        let fake = FakeMarketData::new().with_conflict_at(5);
        let (coord, _checkpoints, _metrics) = coordinator(cfg, Arc::new(fake));

        let report = coord.run().await.unwrap();
        assert_eq!(report.failed_count, 1);
        assert!(report.errors[0].contains("conflicting duplicate"));
    }

    #[tokio::test]
    async fn test_identical_duplicate_is_deduped() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, &["AAPL"]);
        let fake = FakeMarketData::new().with_duplicate_at(5);
        let (coord, _checkpoints, metrics) = coordinator(cfg, Arc::new(fake));

        let report = coord.run().await.unwrap();
        assert_eq!(report.success_count, 1);
        assert_eq!(report.rows_written, 390);
        assert_eq!(metrics.data_quality_count("AAPL", "duplicate_timestamp"), 1);
    }

    #[tokio::test]
    async fn test_mostly_invalid_unit_fails() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp, &["AAPL"]);
        cfg.max_invalid_row_fraction = 0.2;
        let mut fake = FakeMarketData::new().with_bars_per_day(4);
        for i in 0..3 {
            fake = fake.with_invalid_bar_at(i);
        }
        let (coord, _checkpoints, _metrics) = coordinator(cfg, Arc::new(fake));

        let report = coord.run().await.unwrap();
        assert_eq!(report.failed_count, 1);
        assert!(report.errors[0].contains("violated bar invariants"));
    }

    #[tokio::test]
    async fn test_cancellation_before_dispatch() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, &["AAPL", "MSFT"]);
        let fake = Arc::new(FakeMarketData::new());
        let (coord, _checkpoints, _metrics) = coordinator(cfg, fake.clone());

        coord.cancellation_token().cancel();
        let report = coord.run().await.unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(report.exit_code(), 2);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_backlog_gauge_drains() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(&tmp, &["AAPL"]);
        let (coord, _checkpoints, metrics) = coordinator(cfg, Arc::new(FakeMarketData::new()));

        coord.run().await.unwrap();
        assert_eq!(metrics.backlog("AAPL"), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = config(&tmp, &["AAPL"]);
        cfg.workers = 0;
        let (coord, _checkpoints, _metrics) = coordinator(cfg, Arc::new(FakeMarketData::new()));
        let err = coord.run().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));
    }
}
