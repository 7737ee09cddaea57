//! OHLCV Validation Engine
//!
//! Post-ingestion rule sweep over a completed job's 1-minute partitions.
//! Always produces a per-symbol CSV audit report, even for clean data, and
//! never aborts the pipeline.

use crate::bus::{DomainEventBus, EventHandler};
use crate::domain::bar::BarRow;
use crate::domain::events::{DomainEvent, EventMeta};
use crate::domain::job::JobId;
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::{Nanos, NANOS_PER_MINUTE};
use crate::metrics::PipelineMetrics;
use crate::storage::{read_partition, Partition, StorageError};
use crate::domain::bar::Frame;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum allowed open-to-previous-close move, as a fraction.
pub const EXTREME_MOVE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

/// One rule violation, anchored to the offending bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarIssue {
    pub ts_ns: Nanos,
    /// Zero-based index within the symbol's bar sequence.
    pub index: usize,
    pub reason: String,
    pub severity: Severity,
}

/// Outcome of validating one symbol's bars for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub symbol: Symbol,
    pub total_bars: usize,
    pub errors: Vec<BarIssue>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Apply the rule set, in order, to one symbol's bar sequence.
pub fn validate_rows(symbol: &Symbol, rows: &[BarRow]) -> ValidationResult {
    let mut errors = Vec::new();
    let mut prev_ts: Option<Nanos> = None;
    let mut prev_close: Option<f64> = None;

    for (i, row) in rows.iter().enumerate() {
        let mut issue = |reason: String| {
            errors.push(BarIssue {
                ts_ns: row.ts_ns,
                index: i,
                reason,
                severity: Severity::Error,
            });
        };

        // 1. OHLC consistency.
        let body_max = row.open.max(row.close).max(row.low);
        let body_min = row.open.min(row.close).min(row.high);
        if row.high < body_max {
            issue(format!(
                "ohlc inconsistency at index {}: high {} below max(open, close, low) {}",
                i, row.high, body_max
            ));
        }
        if row.low > body_min {
            issue(format!(
                "ohlc inconsistency at index {}: low {} above min(open, close, high) {}",
                i, row.low, body_min
            ));
        }

        // 2. Positive prices.
        for (name, value) in [
            ("open", row.open),
            ("high", row.high),
            ("low", row.low),
            ("close", row.close),
        ] {
            if value <= 0.0 {
                issue(format!("non-positive {} at index {}: {}", name, i, value));
            }
        }

        // 3. Non-negative volume.
        if row.volume < 0 {
            issue(format!("negative volume at index {}: {}", i, row.volume));
        }

        // 4. Strictly increasing timestamps.
        if let Some(prev) = prev_ts {
            if row.ts_ns <= prev {
                issue(format!(
                    "non-monotone timestamp at index {}: {}ns follows {}ns",
                    i, row.ts_ns, prev
                ));
            }
        }

        // 5. Minute alignment.
        if row.ts_ns % NANOS_PER_MINUTE != 0 {
            issue(format!(
                "timestamp not minute-aligned at index {}: {}ns",
                i, row.ts_ns
            ));
        }

        // 6. Extreme move vs previous close.
        if let Some(pc) = prev_close {
            if pc > 0.0 {
                let movement = (row.open - pc).abs() / pc;
                if movement > EXTREME_MOVE_THRESHOLD {
                    issue(format!(
                        "extreme price movement at index {}: {:.1}%",
                        i,
                        movement * 100.0
                    ));
                }
            }
        }

        prev_ts = Some(row.ts_ns);
        prev_close = Some(row.close);
    }

    ValidationResult {
        symbol: symbol.clone(),
        total_bars: rows.len(),
        errors,
    }
}

/// Loads a job's written bars, validates them, and persists audit reports.
pub struct ValidationEngine {
    dataset_root: PathBuf,
    reports_root: PathBuf,
    metrics: Arc<PipelineMetrics>,
    bus: Arc<DomainEventBus>,
}

impl ValidationEngine {
    pub fn new(
        dataset_root: impl Into<PathBuf>,
        reports_root: impl Into<PathBuf>,
        metrics: Arc<PipelineMetrics>,
        bus: Arc<DomainEventBus>,
    ) -> Self {
        Self {
            dataset_root: dataset_root.into(),
            reports_root: reports_root.into(),
            metrics,
            bus,
        }
    }

    /// Validate every symbol of a job and write one CSV report each.
    ///
    /// Usable for explicit re-runs against a stored job id as well as from
    /// the `IngestionJobCompleted` subscription.
    pub async fn run(
        &self,
        job_id: &JobId,
        provider: &str,
        feed: &str,
        symbols: &[Symbol],
        trading_days: &[NaiveDate],
    ) -> Result<Vec<ValidationResult>, ValidationRunError> {
        let mut results = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let rows = self.load_job_rows(job_id, symbol, trading_days)?;
            let result = validate_rows(symbol, &rows);

            self.metrics.record_validation(
                provider,
                feed,
                result.total_bars as u64,
                result.errors.len() as u64,
            );
            self.write_report(job_id, &result)?;

            if !result.is_valid() {
                warn!(
                    job_id = %job_id,
                    symbol = symbol.as_str(),
                    errors = result.errors.len(),
                    "validation found rule violations"
                );
                self.bus
                    .publish(&DomainEvent::ValidationFailed {
                        meta: EventMeta::now(),
                        job_id: job_id.to_string(),
                        symbol: symbol.clone(),
                        error_count: result.errors.len(),
                        first_error_ts_ns: result.errors.first().map(|e| e.ts_ns),
                    })
                    .await;
            } else {
                debug!(
                    job_id = %job_id,
                    symbol = symbol.as_str(),
                    bars = result.total_bars,
                    "validation clean"
                );
            }
            results.push(result);
        }
        info!(job_id = %job_id, symbols = symbols.len(), "validation reports written");
        Ok(results)
    }

    fn load_job_rows(
        &self,
        job_id: &JobId,
        symbol: &Symbol,
        trading_days: &[NaiveDate],
    ) -> Result<Vec<BarRow>, ValidationRunError> {
        let mut rows = Vec::new();
        for &day in trading_days {
            let partition = Partition::new(Frame::M1, symbol.clone(), day, job_id.clone());
            let path = partition.path(&self.dataset_root);
            if !path.exists() {
                // Empty vendor day or failed unit; nothing to validate.
                continue;
            }
            rows.extend(read_partition(&path, Frame::M1)?);
        }
        Ok(rows)
    }

    /// `<reports_root>/<job_id>/<job_id>_<symbol>.csv`, header row always.
    fn write_report(
        &self,
        job_id: &JobId,
        result: &ValidationResult,
    ) -> Result<PathBuf, ValidationRunError> {
        let dir = self.reports_root.join(job_id.to_string());
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}_{}.csv", job_id, result.symbol));

        let mut body = String::from("symbol,ts_ns,reason\n");
        for issue in &result.errors {
            body.push_str(&format!(
                "{},{},{}\n",
                result.symbol, issue.ts_ns, issue.reason
            ));
        }
        std::fs::write(&path, body)?;
        Ok(path)
    }
}

#[async_trait]
impl EventHandler for ValidationEngine {
    fn name(&self) -> &str {
        "validation-engine"
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        if let DomainEvent::IngestionJobCompleted {
            job_id,
            provider,
            feed,
            symbol_bar_counts,
            trading_days,
            ..
        } = event
        {
            let symbols: Vec<Symbol> = symbol_bar_counts.keys().cloned().collect();
            self.run(
                &JobId::from_raw(job_id.clone()),
                provider,
                feed,
                &symbols,
                trading_days,
            )
            .await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum ValidationRunError {
    Storage(StorageError),
    Io(std::io::Error),
}

impl fmt::Display for ValidationRunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "failed to load bars: {}", e),
            Self::Io(e) => write!(f, "failed to write report: {}", e),
        }
    }
}

impl std::error::Error for ValidationRunError {}

impl From<StorageError> for ValidationRunError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

impl From<std::io::Error> for ValidationRunError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::bar::BAR_SCHEMA_VERSION;
    use crate::domain::timestamp::Timestamp;

    fn sym() -> Symbol {
        Symbol::new("AAPL").unwrap()
    }

    fn row(minute: i64, open: f64, high: f64, low: f64, close: f64, volume: i64) -> BarRow {
        let base = Timestamp::start_of_day(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap());
        BarRow {
            symbol: "AAPL".to_string(),
            ts_ns: base.as_nanos() + minute * NANOS_PER_MINUTE,
            open,
            high,
            low,
            close,
            volume,
            trade_count: None,
            vwap: None,
            schema_version: BAR_SCHEMA_VERSION,
            source: "fake".to_string(),
            frame: "1m".to_string(),
        }
    }

    #[test]
    fn test_clean_rows_pass() {
        let rows = vec![
            row(0, 10.0, 10.5, 9.8, 10.2, 100),
            row(1, 10.2, 10.6, 10.0, 10.4, 90),
        ];
        let result = validate_rows(&sym(), &rows);
        assert!(result.is_valid());
        assert_eq!(result.total_bars, 2);
    }

    #[test]
    fn test_ohlc_inconsistency_detected() {
        let rows = vec![row(0, 10.0, 9.0, 10.5, 10.0, 100)];
        let result = validate_rows(&sym(), &rows);
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.reason.contains("ohlc inconsistency")));
        assert_eq!(result.errors[0].index, 0);
    }

    #[test]
    fn test_non_positive_price_detected() {
        let rows = vec![row(0, 0.0, 10.5, 0.0, 10.2, 100)];
        let result = validate_rows(&sym(), &rows);
        assert!(result.errors.iter().any(|e| e.reason.contains("non-positive open")));
    }

    #[test]
    fn test_non_monotone_timestamp_detected() {
        let rows = vec![
            row(2, 10.0, 10.5, 9.8, 10.2, 100),
            row(1, 10.2, 10.6, 10.0, 10.4, 90),
        ];
        let result = validate_rows(&sym(), &rows);
        assert!(result
            .errors
            .iter()
            .any(|e| e.reason.contains("non-monotone timestamp at index 1")));
    }

    #[test]
    fn test_minute_alignment_detected() {
        let mut misaligned = row(0, 10.0, 10.5, 9.8, 10.2, 100);
        misaligned.ts_ns += 30 * 1_000_000_000;
        let result = validate_rows(&sym(), &[misaligned]);
        assert!(result.errors.iter().any(|e| e.reason.contains("not minute-aligned")));
    }

    #[test]
    fn test_extreme_move_detected() {
        let rows = vec![
            row(0, 10.0, 10.5, 9.8, 10.0, 100),
            // Opens 60% above previous close.
            row(1, 16.0, 16.5, 15.8, 16.0, 90),
        ];
        let result = validate_rows(&sym(), &rows);
        let issue = result
            .errors
            .iter()
            .find(|e| e.reason.contains("extreme price movement"))
            .unwrap();
        assert!(issue.reason.contains("index 1"));
        assert!(issue.reason.contains("60.0%"));
    }

    #[test]
    fn test_move_at_threshold_allowed() {
        let rows = vec![
            row(0, 10.0, 10.5, 9.8, 10.0, 100),
            row(1, 15.0, 15.5, 14.8, 15.0, 90),
        ];
        let result = validate_rows(&sym(), &rows);
        assert!(result.is_valid());
    }

    #[tokio::test]
    async fn test_report_written_even_when_clean() {
        let tmp = tempfile::TempDir::new().unwrap();
        let metrics = PipelineMetrics::new();
        let bus = DomainEventBus::new();
        let engine = ValidationEngine::new(
            tmp.path().join("data"),
            tmp.path().join("reports"),
            metrics.clone(),
            bus,
        );
        let job = JobId::from_raw("job_x");
        let results = engine
            .run(
                &job,
                "fake",
                "sim",
                &[sym()],
                &[NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()],
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_valid());

        let report = tmp
            .path()
            .join("reports")
            .join("job_x")
            .join("job_x_AAPL.csv");
        let body = std::fs::read_to_string(report).unwrap();
        assert_eq!(body, "symbol,ts_ns,reason\n");
    }
}
