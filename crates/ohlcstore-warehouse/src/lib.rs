//! # ohlcstore warehouse
//!
//! DuckDB-backed persistence for the ohlcstore engine.
//!
//! ## Overview
//!
//! Bars are partitioned into fixed-width time chunks. Recent chunks live in
//! the row-oriented `bars` table; older chunks are rewritten into compressed
//! columnar segments (`bar_segments`) and read back transparently. Derived
//! rollup buckets, ingestion job audit records and data quality records
//! are stored alongside.
//!
//! All user-provided values reach SQL as bound parameters.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ohlcstore_warehouse::{BarRow, Warehouse, WarehouseConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let warehouse = Warehouse::open(WarehouseConfig::default())?;
//!
//!     let counts = warehouse.upsert_bars(&[BarRow {
//!         symbol: "AAPL".to_string(),
//!         timeframe: "1d".to_string(),
//!         ts_us: 1_704_153_600_000_000,
//!         open: 187.15,
//!         high: 188.44,
//!         low: 183.89,
//!         close: 185.64,
//!         volume: 82_488_700,
//!         trade_count: None,
//!         vwap: None,
//!         source: "yahoo".to_string(),
//!     }])?;
//!     println!("inserted {} bars", counts.inserted);
//!
//!     warehouse.close()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `bars` | Uncompressed bars, keyed by symbol, timeframe and time |
//! | `bar_chunks` | Chunk catalog with row counts and compression state |
//! | `bar_segments` | Compressed per-symbol, per-timeframe chunk segments |
//! | `aggregate_bars` | Rollup buckets derived from finer bars |
//! | `ingestion_jobs` | Ingestion audit trail |
//! | `quality_records` | Data quality scan results |
//!
//! ## Views
//!
//! | View | Description |
//! |------|-------------|
//! | `vw_ingestion_summary` | Job outcomes per symbol, timeframe and provider |
//! | `vw_latest_quality` | Most recent quality record per series |
//! | `vw_chunk_status` | Chunk catalog with segment counts |

pub mod aggregates;
pub mod audit;
pub mod bars;
pub mod duckdb;
pub mod migrations;
pub mod models;
pub mod segment;
pub mod views;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::Connection;
use thiserror::Error;

pub use self::duckdb::{AccessMode, DuckDbConnectionManager, PooledConnection};
pub use models::{
    AggregateRow, BarRow, ChunkInfo, CompressionReport, JobRow, QualityRow, RetentionReport,
    UpsertCounts,
};

/// Microseconds in one day.
pub const MICROS_PER_DAY: i64 = 86_400_000_000;

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error (file system operations).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Segment or issue payload (de)serialization failed.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A stored segment could not be decoded.
    #[error("corrupt segment: {0}")]
    CorruptSegment(String),

    /// The caller supplied a value the warehouse cannot store.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Configuration for the warehouse database.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Root directory for ohlcstore data.
    pub home: PathBuf,
    /// Path to the `DuckDB` database file, or `:memory:`.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept per access mode.
    pub max_pool_size: usize,
    /// Width of a storage chunk in microseconds.
    pub chunk_width_us: i64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        let home = resolve_home();
        let db_path = home.join("data").join("ohlcstore.duckdb");
        Self {
            home,
            db_path,
            max_pool_size: 4,
            chunk_width_us: 7 * MICROS_PER_DAY,
        }
    }
}

impl WarehouseConfig {
    /// A process-local database that disappears when the warehouse is dropped.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            db_path: PathBuf::from(":memory:"),
            ..Self::default()
        }
    }
}

/// The main warehouse interface for bar storage.
#[derive(Clone)]
pub struct Warehouse {
    config: WarehouseConfig,
    manager: DuckDbConnectionManager,
}

impl Warehouse {
    /// Open a warehouse with default configuration.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    /// Open a warehouse with the specified configuration.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated, or the
    /// chunk width is not positive.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if config.chunk_width_us <= 0 {
            return Err(WarehouseError::InvalidInput(String::from(
                "chunk width must be greater than zero",
            )));
        }

        if !self::duckdb::is_in_memory(config.db_path.as_path()) {
            if let Some(parent) = config.db_path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = DuckDbConnectionManager::open(config.db_path.clone(), config.max_pool_size)?;
        let warehouse = Self { config, manager };
        warehouse.initialize()?;
        tracing::info!(db_path = %warehouse.db_path().display(), "warehouse opened");
        Ok(warehouse)
    }

    /// Initialize database schema and views.
    ///
    /// # Errors
    /// Returns an error if a migration or view definition fails.
    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.manager.acquire(AccessMode::ReadWrite)?;
        migrations::apply_migrations(&connection)?;
        views::create_views(&connection)?;
        Ok(())
    }

    /// Flush the write-ahead log and release pooled connections.
    ///
    /// # Errors
    /// Returns an error if the checkpoint fails.
    pub fn close(&self) -> Result<(), WarehouseError> {
        if !self::duckdb::is_in_memory(self.db_path()) {
            let connection = self.manager.acquire(AccessMode::ReadWrite)?;
            connection.execute_batch("CHECKPOINT")?;
        }
        self.manager.drain();
        tracing::info!(db_path = %self.db_path().display(), "warehouse closed");
        Ok(())
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.manager.db_path()
    }

    /// Width of a storage chunk in microseconds.
    #[must_use]
    pub fn chunk_width_us(&self) -> i64 {
        self.config.chunk_width_us
    }

    /// Start of the chunk containing `ts_us`.
    #[must_use]
    pub fn chunk_start_for(&self, ts_us: i64) -> i64 {
        chunk_start(ts_us, self.config.chunk_width_us)
    }

    pub(crate) fn acquire(&self, mode: AccessMode) -> Result<PooledConnection, WarehouseError> {
        Ok(self.manager.acquire(mode)?)
    }
}

/// Floor `ts_us` to a multiple of `width_us`.
#[must_use]
pub fn chunk_start(ts_us: i64, width_us: i64) -> i64 {
    ts_us - ts_us.rem_euclid(width_us)
}

/// Finalize a transaction, committing on success or rolling back on failure.
pub(crate) fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = connection.execute_batch("ROLLBACK") {
                tracing::error!(error = %rollback_error, "transaction rollback failed");
            }
            Err(error)
        }
    }
}

/// Run `work` inside one transaction on `connection`.
pub(crate) fn in_transaction<T>(
    connection: &Connection,
    work: impl FnOnce(&Connection) -> Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    connection.execute_batch("BEGIN TRANSACTION")?;
    let result = work(connection);
    finalize_transaction(connection, result)
}

/// Convert a count to the `BIGINT` the schema stores.
pub(crate) fn count_to_i64(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

/// Convert a stored `BIGINT` count back to `usize`.
pub(crate) fn count_from_i64(count: i64) -> usize {
    usize::try_from(count).unwrap_or_default()
}

/// Resolve the ohlcstore home directory from environment or default.
fn resolve_home() -> PathBuf {
    if let Some(path) = env::var_os("OHLCSTORE_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".ohlcstore");
    }

    PathBuf::from(".ohlcstore")
}
