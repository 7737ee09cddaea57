//! Domain Model
//!
//! Value objects, the bar entity, the symbol-day aggregate, the job state
//! machine, and the domain events that couple the pipeline stages.

pub mod aggregate;
pub mod bar;
pub mod events;
pub mod job;
pub mod price;
pub mod symbol;
pub mod timestamp;

pub use aggregate::{AggregateError, SymbolBarsAggregate};
pub use bar::{BarInvariantError, BarRow, Frame, OhlcvBar, BAR_SCHEMA_VERSION};
pub use events::{DomainEvent, EventKind, EventMeta};
pub use job::{IngestionJob, JobId, JobState, JobTransitionError};
pub use price::{Price, PriceError, Volume};
pub use symbol::{Symbol, SymbolError};
pub use timestamp::{Nanos, TimeRange, TimeRangeError, Timestamp, NANOS_PER_DAY, NANOS_PER_MINUTE, NANOS_PER_SEC};
