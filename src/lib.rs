//! MarketPipe
//!
//! Minute-bar ingestion pipeline: vendor HTTP clients with retry and
//! rate-limit discipline, a checkpointed job coordinator, OHLCV validation
//! with CSV audit reports, partitioned Parquet output with timeframe
//! roll-ups, an in-process domain-event bus, and Prometheus metrics.

pub mod aggregation;
pub mod bus;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod metrics;
pub mod ratelimit;
pub mod retention;
pub mod storage;
pub mod validation;
pub mod vendors;

pub use aggregation::AggregationEngine;
pub use bus::{DomainEventBus, EventHandler};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{CompressionCodec, IngestionConfig};
pub use coordinator::{IngestionReport, JobCoordinator};
pub use domain::{Frame, IngestionJob, JobId, JobState, OhlcvBar, Symbol, TimeRange, Timestamp};
pub use metrics::PipelineMetrics;
pub use ratelimit::RateLimiter;
pub use storage::ParquetWriter;
pub use validation::ValidationEngine;
pub use vendors::{BarFetcher, Credentials, FakeMarketData, MarketDataClient, VendorAdapter};
