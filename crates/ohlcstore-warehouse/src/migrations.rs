//! Versioned schema migrations.
//!
//! Each migration runs once; applied versions are tracked in
//! `schema_migrations`.

use ::duckdb::Connection;

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_bar_storage",
        sql: r"
CREATE TABLE IF NOT EXISTS bars (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    ts TIMESTAMP NOT NULL,
    chunk_start TIMESTAMP NOT NULL,
    open DOUBLE NOT NULL,
    high DOUBLE NOT NULL,
    low DOUBLE NOT NULL,
    close DOUBLE NOT NULL,
    volume BIGINT NOT NULL,
    trade_count BIGINT,
    vwap DOUBLE,
    source TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(symbol, timeframe, ts)
);

CREATE TABLE IF NOT EXISTS bar_chunks (
    chunk_start TIMESTAMP PRIMARY KEY,
    chunk_end TIMESTAMP NOT NULL,
    row_count BIGINT NOT NULL DEFAULT 0,
    compressed BOOLEAN NOT NULL DEFAULT FALSE,
    compressed_at TIMESTAMP
);

CREATE TABLE IF NOT EXISTS bar_segments (
    chunk_start TIMESTAMP NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    min_ts TIMESTAMP NOT NULL,
    max_ts TIMESTAMP NOT NULL,
    row_count BIGINT NOT NULL,
    payload BLOB NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(chunk_start, symbol, timeframe)
);
",
    },
    Migration {
        version: "0002_aggregates",
        sql: r"
CREATE TABLE IF NOT EXISTS aggregate_bars (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    bucket_start TIMESTAMP NOT NULL,
    bucket_end TIMESTAMP NOT NULL,
    source_timeframe TEXT NOT NULL,
    open DOUBLE NOT NULL,
    high DOUBLE NOT NULL,
    low DOUBLE NOT NULL,
    close DOUBLE NOT NULL,
    volume BIGINT NOT NULL,
    trade_count BIGINT,
    vwap DOUBLE,
    source_count BIGINT NOT NULL,
    closed BOOLEAN NOT NULL,
    refreshed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(symbol, timeframe, bucket_start)
);
",
    },
    Migration {
        version: "0003_audit",
        sql: r"
CREATE TABLE IF NOT EXISTS ingestion_jobs (
    job_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    provider TEXT NOT NULL,
    range_start TIMESTAMP NOT NULL,
    range_end TIMESTAMP NOT NULL,
    rows_inserted BIGINT NOT NULL,
    rows_updated BIGINT NOT NULL,
    rows_rejected BIGINT NOT NULL,
    retries BIGINT NOT NULL,
    status TEXT NOT NULL,
    error_detail TEXT,
    duration_ms BIGINT NOT NULL,
    started_at TIMESTAMP NOT NULL,
    recorded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS quality_records (
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    check_date DATE NOT NULL,
    range_start TIMESTAMP NOT NULL,
    range_end TIMESTAMP NOT NULL,
    total_bars BIGINT NOT NULL,
    missing_count BIGINT NOT NULL,
    duplicate_count BIGINT NOT NULL,
    outlier_count BIGINT NOT NULL,
    zero_volume_count BIGINT NOT NULL,
    score DOUBLE NOT NULL,
    issues TEXT NOT NULL,
    checked_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(symbol, timeframe, check_date)
);
",
    },
    Migration {
        version: "0004_indexes",
        sql: r"
CREATE INDEX IF NOT EXISTS idx_bars_symbol_ts ON bars(symbol, ts);
CREATE INDEX IF NOT EXISTS idx_bars_timeframe_ts ON bars(timeframe, ts);
CREATE INDEX IF NOT EXISTS idx_bars_chunk_start ON bars(chunk_start);
CREATE INDEX IF NOT EXISTS idx_aggregate_bars_symbol_ts ON aggregate_bars(symbol, bucket_start);
CREATE INDEX IF NOT EXISTS idx_ingestion_jobs_symbol_started ON ingestion_jobs(symbol, timeframe, started_at);
",
    },
];

/// Apply every migration that has not been recorded yet.
///
/// # Errors
/// Returns an error if any migration statement fails.
pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
",
    )?;

    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            [migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            tracing::debug!(version = migration.version, "applying schema migration");
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}

/// Versions recorded in `schema_migrations`, in application order.
///
/// # Errors
/// Returns an error if the table cannot be read.
pub fn applied_versions(connection: &Connection) -> Result<Vec<String>, ::duckdb::Error> {
    let mut statement =
        connection.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
    let versions = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(versions)
}
