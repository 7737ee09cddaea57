//! Symbol-Day Bar Collection Aggregate
//!
//! Consistency boundary for one (symbol, trading-day): owns the bars keyed by
//! timestamp, a monotone version for optimistic concurrency, and the pending
//! domain events flushed by the coordinator after a successful persist.

use crate::domain::bar::OhlcvBar;
use crate::domain::events::{DomainEvent, EventMeta};
use crate::domain::symbol::Symbol;
use crate::domain::timestamp::Nanos;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug)]
pub struct SymbolBarsAggregate {
    symbol: Symbol,
    trading_day: NaiveDate,
    bars: BTreeMap<Nanos, OhlcvBar>,
    version: u64,
    collection_complete: bool,
    pending_events: Vec<DomainEvent>,
}

impl SymbolBarsAggregate {
    pub fn start_collection(symbol: Symbol, trading_day: NaiveDate) -> Self {
        Self {
            symbol,
            trading_day,
            bars: BTreeMap::new(),
            version: 1,
            collection_complete: false,
            pending_events: Vec::new(),
        }
    }

    /// Add a bar. Rejects bars for another symbol, another trading date, a
    /// timestamp already present, or after completion.
    pub fn add_bar(&mut self, bar: OhlcvBar) -> Result<(), AggregateError> {
        if self.collection_complete {
            return Err(AggregateError::CollectionComplete);
        }
        if bar.symbol() != &self.symbol {
            return Err(AggregateError::WrongSymbol {
                expected: self.symbol.clone(),
                got: bar.symbol().clone(),
            });
        }
        let date = bar.timestamp().trading_date();
        if date != self.trading_day {
            return Err(AggregateError::WrongTradingDay {
                expected: self.trading_day,
                got: date,
            });
        }
        let ts = bar.timestamp().as_nanos();
        if self.bars.contains_key(&ts) {
            return Err(AggregateError::DuplicateTimestamp(ts));
        }
        self.bars.insert(ts, bar);
        self.version += 1;
        Ok(())
    }

    /// Close the collection and enqueue `BarCollectionCompleted`.
    pub fn complete_collection(&mut self) -> Result<(), AggregateError> {
        if self.collection_complete {
            return Err(AggregateError::CollectionComplete);
        }
        self.collection_complete = true;
        self.version += 1;
        self.pending_events.push(DomainEvent::BarCollectionCompleted {
            meta: EventMeta::now(),
            symbol: self.symbol.clone(),
            trading_day: self.trading_day,
            bar_count: self.bars.len(),
        });
        Ok(())
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn trading_day(&self) -> NaiveDate {
        self.trading_day
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_complete(&self) -> bool {
        self.collection_complete
    }

    pub fn bar_count(&self) -> usize {
        self.bars.len()
    }

    pub fn contains(&self, ts_ns: Nanos) -> bool {
        self.bars.contains_key(&ts_ns)
    }

    /// Bars in timestamp order.
    pub fn bars(&self) -> impl Iterator<Item = &OhlcvBar> {
        self.bars.values()
    }

    /// Drain the pending event list for publication.
    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.pending_events)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateError {
    WrongSymbol { expected: Symbol, got: Symbol },
    WrongTradingDay { expected: NaiveDate, got: NaiveDate },
    DuplicateTimestamp(Nanos),
    CollectionComplete,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongSymbol { expected, got } => {
                write!(f, "bar symbol {} does not match aggregate {}", got, expected)
            }
            Self::WrongTradingDay { expected, got } => {
                write!(f, "bar trading day {} does not match aggregate {}", got, expected)
            }
            Self::DuplicateTimestamp(ts) => write!(f, "duplicate bar timestamp {}ns", ts),
            Self::CollectionComplete => write!(f, "collection already completed"),
        }
    }
}

impl std::error::Error for AggregateError {}
