//! Checkpoint and Job History Persistence
//!
//! SQLite-backed progress markers. A checkpoint records the last persisted
//! nanosecond timestamp (and optional vendor cursor) for one (symbol,
//! trading-day) unit; it is written only after the Parquet file write is
//! confirmed and is the sole source of truth for resume. Completed jobs are
//! summarised into `job_history` for the retention subsystem.

use crate::domain::symbol::Symbol;
use crate::domain::timestamp::Nanos;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA_VERSION: u32 = 1;

/// Durable progress marker for one (symbol, trading-day) unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub trading_day: NaiveDate,
    /// Nanosecond timestamp of the last bar persisted for the unit.
    pub last_ts_ns: Nanos,
    /// Vendor continuation token, when the vendor paginates by cursor.
    pub cursor: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(trading_day: NaiveDate, last_ts_ns: Nanos, cursor: Option<String>) -> Self {
        Self {
            trading_day,
            last_ts_ns,
            cursor,
            updated_at: Utc::now(),
        }
    }

    /// Whether this checkpoint covers a unit ending at `end_ns`: the final
    /// minute bar of the window (`end - 1m`) was already persisted.
    pub fn covers(&self, end_ns: Nanos) -> bool {
        self.last_ts_ns >= end_ns - crate::domain::timestamp::NANOS_PER_MINUTE
    }
}

/// Summary row persisted when a job reaches a terminal state.
#[derive(Debug, Clone)]
pub struct JobHistoryRecord {
    pub job_id: String,
    pub provider: String,
    pub feed: String,
    pub state: String,
    pub success_count: usize,
    pub failed_count: usize,
    pub rows_written: usize,
}

/// SQLite store for checkpoints and job history.
pub struct CheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn in_memory() -> Result<Self, CheckpointError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), CheckpointError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match current {
            None => {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS checkpoints (
                        symbol TEXT NOT NULL,
                        trading_day TEXT NOT NULL,
                        last_ts_ns INTEGER NOT NULL,
                        cursor TEXT,
                        updated_at INTEGER NOT NULL,
                        PRIMARY KEY (symbol, trading_day)
                    ) WITHOUT ROWID;

                    CREATE INDEX IF NOT EXISTS idx_checkpoints_updated
                        ON checkpoints(updated_at);

                    CREATE TABLE IF NOT EXISTS job_history (
                        job_id TEXT PRIMARY KEY,
                        provider TEXT NOT NULL,
                        feed TEXT NOT NULL,
                        state TEXT NOT NULL,
                        success_count INTEGER NOT NULL,
                        failed_count INTEGER NOT NULL,
                        rows_written INTEGER NOT NULL,
                        updated_at INTEGER NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_job_history_updated
                        ON job_history(updated_at);
                "#,
                )?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                info!("created checkpoint store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("checkpoint store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "checkpoint store schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }

        Ok(())
    }

    /// Upsert the checkpoint for (symbol, day). A single statement, so
    /// readers never observe a partial write.
    pub fn save(&self, symbol: &Symbol, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO checkpoints (symbol, trading_day, last_ts_ns, cursor, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(symbol, trading_day) DO UPDATE SET
                   last_ts_ns = excluded.last_ts_ns,
                   cursor = excluded.cursor,
                   updated_at = excluded.updated_at"#,
            params![
                symbol.as_str(),
                checkpoint.trading_day.format("%Y-%m-%d").to_string(),
                checkpoint.last_ts_ns,
                checkpoint.cursor,
                checkpoint.updated_at.timestamp(),
            ],
        )?;
        debug!(
            symbol = symbol.as_str(),
            day = %checkpoint.trading_day,
            last_ts_ns = checkpoint.last_ts_ns,
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn load(
        &self,
        symbol: &Symbol,
        trading_day: NaiveDate,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT last_ts_ns, cursor, updated_at FROM checkpoints
                 WHERE symbol = ? AND trading_day = ?",
                params![symbol.as_str(), trading_day.format("%Y-%m-%d").to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(last_ts_ns, cursor, updated_at)| Checkpoint {
            trading_day,
            last_ts_ns,
            cursor,
            updated_at: Utc.timestamp_opt(updated_at, 0).single().unwrap_or_else(Utc::now),
        }))
    }

    /// All checkpoints for a symbol, newest trading day first.
    pub fn load_all(&self, symbol: &Symbol) -> Result<Vec<Checkpoint>, CheckpointError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trading_day, last_ts_ns, cursor, updated_at FROM checkpoints
             WHERE symbol = ? ORDER BY trading_day DESC",
        )?;
        let rows = stmt
            .query_map([symbol.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(day, last_ts_ns, cursor, updated_at)| {
                let trading_day = NaiveDate::parse_from_str(&day, "%Y-%m-%d").ok()?;
                Some(Checkpoint {
                    trading_day,
                    last_ts_ns,
                    cursor,
                    updated_at: Utc.timestamp_opt(updated_at, 0).single()?,
                })
            })
            .collect())
    }

    pub fn record_job(&self, record: &JobHistoryRecord) -> Result<(), CheckpointError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO job_history
                   (job_id, provider, feed, state, success_count, failed_count, rows_written, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(job_id) DO UPDATE SET
                   state = excluded.state,
                   success_count = excluded.success_count,
                   failed_count = excluded.failed_count,
                   rows_written = excluded.rows_written,
                   updated_at = excluded.updated_at"#,
            params![
                record.job_id,
                record.provider,
                record.feed,
                record.state,
                record.success_count as i64,
                record.failed_count as i64,
                record.rows_written as i64,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Rows (checkpoints, jobs) whose `updated_at` predates `cutoff`.
    pub fn count_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<(usize, usize), CheckpointError> {
        let conn = self.conn.lock();
        let checkpoints: i64 = conn.query_row(
            "SELECT COUNT(*) FROM checkpoints WHERE updated_at < ?",
            [cutoff.timestamp()],
            |row| row.get(0),
        )?;
        let jobs: i64 = conn.query_row(
            "SELECT COUNT(*) FROM job_history WHERE updated_at < ?",
            [cutoff.timestamp()],
            |row| row.get(0),
        )?;
        Ok((checkpoints as usize, jobs as usize))
    }

    /// Delete rows older than `cutoff`. Returns (checkpoints, jobs) removed.
    pub fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<(usize, usize), CheckpointError> {
        let conn = self.conn.lock();
        let checkpoints = conn.execute(
            "DELETE FROM checkpoints WHERE updated_at < ?",
            [cutoff.timestamp()],
        )?;
        let jobs = conn.execute(
            "DELETE FROM job_history WHERE updated_at < ?",
            [cutoff.timestamp()],
        )?;
        if checkpoints + jobs > 0 {
            info!(checkpoints, jobs, "pruned stale persistence rows");
        }
        Ok((checkpoints, jobs))
    }
}

#[derive(Debug)]
pub enum CheckpointError {
    Sqlite(rusqlite::Error),
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<rusqlite::Error> for CheckpointError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}
