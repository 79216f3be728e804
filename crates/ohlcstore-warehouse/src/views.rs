//! Reporting views over the audit, quality and chunk tables.

use ::duckdb::Connection;

/// Create database views for operational reporting.
///
/// Creates the following views:
/// - `vw_ingestion_summary`: job counts and row totals per symbol, timeframe and provider
/// - `vw_latest_quality`: most recent quality record per symbol and timeframe
/// - `vw_chunk_status`: chunk catalog with segment counts
///
/// # Errors
/// Returns an error if the view creation SQL fails to execute.
pub fn create_views(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r"
CREATE OR REPLACE VIEW vw_ingestion_summary AS
SELECT
    symbol,
    timeframe,
    provider,
    COUNT(*) AS job_count,
    COUNT(*) FILTER (WHERE status = 'success') AS success_count,
    COUNT(*) FILTER (WHERE status = 'partial') AS partial_count,
    COUNT(*) FILTER (WHERE status = 'failed') AS failed_count,
    SUM(rows_inserted) AS rows_inserted,
    SUM(rows_updated) AS rows_updated,
    SUM(rows_rejected) AS rows_rejected,
    AVG(duration_ms)::DOUBLE AS avg_duration_ms,
    MAX(started_at) AS last_started_at
FROM ingestion_jobs
GROUP BY symbol, timeframe, provider;

CREATE OR REPLACE VIEW vw_latest_quality AS
SELECT *
FROM quality_records
QUALIFY ROW_NUMBER() OVER (
    PARTITION BY symbol, timeframe
    ORDER BY check_date DESC, checked_at DESC
) = 1;

CREATE OR REPLACE VIEW vw_chunk_status AS
SELECT
    c.chunk_start,
    c.chunk_end,
    c.row_count,
    c.compressed,
    c.compressed_at,
    COUNT(s.symbol) AS segment_count
FROM bar_chunks c
LEFT JOIN bar_segments s ON s.chunk_start = c.chunk_start
GROUP BY c.chunk_start, c.chunk_end, c.row_count, c.compressed, c.compressed_at;
",
    )?;

    Ok(())
}
