//! Ingestion Job State Machine
//!
//! `Pending -> InProgress -> (Completed | Failed | Cancelled)`. Transitions
//! out of a terminal state are rejected; `complete()` requires every symbol
//! to have been marked processed at least once (a vendor-empty day counts —
//! it is marked with a zero bar count).

use crate::domain::events::{DomainEvent, EventMeta};
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::TimeRange;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Human-readable job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// `<symbol>_<yyyy-mm-dd>` for single-symbol jobs.
    pub fn for_symbol_day(symbol: &Symbol, day: NaiveDate) -> Self {
        Self(format!("{}_{}", symbol, day.format("%Y-%m-%d")))
    }

    /// Config-derived id for multi-symbol jobs.
    pub fn for_run(provider: &str, start: NaiveDate, end: NaiveDate) -> Self {
        Self(format!(
            "{}_{}_{}",
            provider,
            start.format("%Y%m%d"),
            end.format("%Y%m%d")
        ))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct IngestionJob {
    job_id: JobId,
    provider: String,
    feed: String,
    symbols: Vec<Symbol>,
    time_range: TimeRange,
    state: JobState,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    /// Bars persisted per symbol across all (symbol, day) units.
    processed: BTreeMap<Symbol, usize>,
    pending_events: Vec<DomainEvent>,
}

impl IngestionJob {
    pub fn new(
        job_id: JobId,
        provider: String,
        feed: String,
        symbols: Vec<Symbol>,
        time_range: TimeRange,
    ) -> Self {
        Self {
            job_id,
            provider,
            feed,
            symbols,
            time_range,
            state: JobState::Pending,
            started_at: None,
            finished_at: None,
            failure_reason: None,
            processed: BTreeMap::new(),
            pending_events: Vec::new(),
        }
    }

    pub fn start(&mut self) -> Result<(), JobTransitionError> {
        self.check_transition(JobState::InProgress, &[JobState::Pending])?;
        self.state = JobState::InProgress;
        self.started_at = Some(Utc::now());
        self.pending_events.push(DomainEvent::IngestionJobStarted {
            meta: EventMeta::now(),
            job_id: self.job_id.to_string(),
            provider: self.provider.clone(),
            symbols: self.symbols.clone(),
        });
        Ok(())
    }

    /// Record a processed (symbol, day) unit and enqueue a batch event.
    pub fn mark_symbol_processed(
        &mut self,
        symbol: &Symbol,
        trading_day: NaiveDate,
        bar_count: usize,
        partition_path: Option<String>,
    ) -> Result<(), JobTransitionError> {
        self.check_transition(JobState::InProgress, &[JobState::InProgress])?;
        if !self.symbols.contains(symbol) {
            return Err(JobTransitionError::UnknownSymbol(symbol.clone()));
        }
        *self.processed.entry(symbol.clone()).or_insert(0) += bar_count;
        self.pending_events.push(DomainEvent::IngestionBatchProcessed {
            meta: EventMeta::now(),
            job_id: self.job_id.to_string(),
            symbol: symbol.clone(),
            trading_day,
            bar_count,
            partition_path,
        });
        Ok(())
    }

    /// Transition to `Completed`. Every symbol must have been marked
    /// processed; `success` reflects whether all units succeeded.
    pub fn complete(&mut self, success: bool) -> Result<(), JobTransitionError> {
        self.check_transition(JobState::Completed, &[JobState::InProgress])?;
        for symbol in &self.symbols {
            if !self.processed.contains_key(symbol) {
                return Err(JobTransitionError::SymbolNotProcessed(symbol.clone()));
            }
        }
        self.state = JobState::Completed;
        self.finished_at = Some(Utc::now());
        self.pending_events.push(DomainEvent::IngestionJobCompleted {
            meta: EventMeta::now(),
            job_id: self.job_id.to_string(),
            provider: self.provider.clone(),
            feed: self.feed.clone(),
            symbol_bar_counts: self.processed.clone(),
            success,
            trading_days: self.time_range.trading_days(),
        });
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), JobTransitionError> {
        self.check_transition(JobState::Failed, &[JobState::Pending, JobState::InProgress])?;
        self.state = JobState::Failed;
        self.finished_at = Some(Utc::now());
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), JobTransitionError> {
        self.check_transition(
            JobState::Cancelled,
            &[JobState::Pending, JobState::InProgress],
        )?;
        self.state = JobState::Cancelled;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn check_transition(
        &self,
        to: JobState,
        allowed_from: &[JobState],
    ) -> Result<(), JobTransitionError> {
        if allowed_from.contains(&self.state) {
            Ok(())
        } else {
            Err(JobTransitionError::InvalidTransition {
                from: self.state,
                to,
            })
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn bars_for(&self, symbol: &Symbol) -> usize {
        self.processed.get(symbol).copied().unwrap_or(0)
    }

    /// Whether any unit for `symbol` was recorded, including zero-bar units.
    pub fn was_processed(&self, symbol: &Symbol) -> bool {
        self.processed.contains_key(symbol)
    }

    pub fn total_bars(&self) -> usize {
        self.processed.values().sum()
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending_events)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobTransitionError {
    InvalidTransition { from: JobState, to: JobState },
    SymbolNotProcessed(Symbol),
    UnknownSymbol(Symbol),
}

impl fmt::Display for JobTransitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid job transition {} -> {}", from.as_str(), to.as_str())
            }
            Self::SymbolNotProcessed(s) => {
                write!(f, "cannot complete job: symbol {} was never processed", s)
            }
            Self::UnknownSymbol(s) => write!(f, "symbol {} is not part of this job", s),
        }
    }
}

impl std::error::Error for JobTransitionError {}
