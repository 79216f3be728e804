//! Plain row types exchanged with the warehouse.
//!
//! Timestamps are epoch microseconds (UTC); symbols and timeframes are the
//! canonical strings produced by the core crate.

use serde::{Deserialize, Serialize};

/// One stored bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarRow {
    pub symbol: String,
    pub timeframe: String,
    pub ts_us: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub trade_count: Option<i64>,
    pub vwap: Option<f64>,
    pub source: String,
}

/// One derived bucket of a rollup.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub symbol: String,
    pub timeframe: String,
    pub source_timeframe: String,
    pub bucket_start_us: i64,
    pub bucket_end_us: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub trade_count: Option<i64>,
    pub vwap: Option<f64>,
    pub source_count: i64,
    pub closed: bool,
}

/// Audit row for one ingestion job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub job_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub provider: String,
    pub range_start_us: i64,
    pub range_end_us: i64,
    pub rows_inserted: i64,
    pub rows_updated: i64,
    pub rows_rejected: i64,
    pub retries: i64,
    pub status: String,
    pub error_detail: Option<String>,
    pub duration_ms: i64,
    pub started_at_us: i64,
}

/// Persisted quality scan result. `issues` is the JSON-encoded issue list.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityRow {
    pub symbol: String,
    pub timeframe: String,
    /// `YYYY-MM-DD`.
    pub check_date: String,
    pub range_start_us: i64,
    pub range_end_us: i64,
    pub total_bars: i64,
    pub missing_count: i64,
    pub duplicate_count: i64,
    pub outlier_count: i64,
    pub zero_volume_count: i64,
    pub score: f64,
    pub issues: String,
}

/// Outcome of a bar upsert transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

/// Outcome of a compression pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompressionReport {
    pub chunks_compressed: usize,
    pub segments_written: usize,
    pub rows_compressed: usize,
}

/// Outcome of a retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub chunks_dropped: usize,
    pub segments_deleted: usize,
    pub rows_deleted: usize,
}

/// Chunk catalog entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_start_us: i64,
    pub chunk_end_us: i64,
    pub row_count: i64,
    pub compressed: bool,
}
