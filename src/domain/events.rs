//! Domain Events
//!
//! Stage-completion events published on the in-process bus. Payloads are
//! value types only; events never carry aggregate references.

use crate::domain::symbol::Symbol;
use crate::domain::timestamp::Nanos;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Discriminant used for bus subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    IngestionJobStarted,
    IngestionBatchProcessed,
    BarCollectionCompleted,
    IngestionJobCompleted,
    ValidationFailed,
    AggregationCompleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn now() -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    IngestionJobStarted {
        meta: EventMeta,
        job_id: String,
        provider: String,
        symbols: Vec<Symbol>,
    },
    IngestionBatchProcessed {
        meta: EventMeta,
        job_id: String,
        symbol: Symbol,
        trading_day: chrono::NaiveDate,
        bar_count: usize,
        partition_path: Option<String>,
    },
    BarCollectionCompleted {
        meta: EventMeta,
        symbol: Symbol,
        trading_day: chrono::NaiveDate,
        bar_count: usize,
    },
    IngestionJobCompleted {
        meta: EventMeta,
        job_id: String,
        provider: String,
        feed: String,
        /// Bars persisted per symbol over the whole job.
        symbol_bar_counts: BTreeMap<Symbol, usize>,
        success: bool,
        trading_days: Vec<chrono::NaiveDate>,
    },
    ValidationFailed {
        meta: EventMeta,
        job_id: String,
        symbol: Symbol,
        error_count: usize,
        first_error_ts_ns: Option<Nanos>,
    },
    AggregationCompleted {
        meta: EventMeta,
        job_id: String,
        symbol: Symbol,
        frame: String,
        bar_count: usize,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::IngestionJobStarted { .. } => EventKind::IngestionJobStarted,
            Self::IngestionBatchProcessed { .. } => EventKind::IngestionBatchProcessed,
            Self::BarCollectionCompleted { .. } => EventKind::BarCollectionCompleted,
            Self::IngestionJobCompleted { .. } => EventKind::IngestionJobCompleted,
            Self::ValidationFailed { .. } => EventKind::ValidationFailed,
            Self::AggregationCompleted { .. } => EventKind::AggregationCompleted,
        }
    }

    pub fn meta(&self) -> &EventMeta {
        match self {
            Self::IngestionJobStarted { meta, .. }
            | Self::IngestionBatchProcessed { meta, .. }
            | Self::BarCollectionCompleted { meta, .. }
            | Self::IngestionJobCompleted { meta, .. }
            | Self::ValidationFailed { meta, .. }
            | Self::AggregationCompleted { meta, .. } => meta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let ev = DomainEvent::BarCollectionCompleted {
            meta: EventMeta::now(),
            symbol: Symbol::new("AAPL").unwrap(),
            trading_day: chrono::NaiveDate::from_ymd_opt(2024, 3, 15).unwrap(),
            bar_count: 390,
        };
        assert_eq!(ev.kind(), EventKind::BarCollectionCompleted);
        assert_ne!(ev.meta().event_id, Uuid::nil());
    }
}
