//! Rollup bucket storage.

use std::collections::BTreeSet;

use ::duckdb::{Connection, ToSql};

use crate::models::AggregateRow;
use crate::{count_to_i64, in_transaction, AccessMode, Warehouse, WarehouseError};

const AGGREGATE_COLUMNS: &str = "symbol, timeframe, source_timeframe, epoch_us(bucket_start), \
     epoch_us(bucket_end), open, high, low, close, volume, trade_count, vwap, source_count, closed";

impl Warehouse {
    /// Replace the buckets of one rollup series inside `[start_us, end_us)`.
    ///
    /// Buckets in the window that are absent from `rows` are deleted; the
    /// rest are inserted or overwritten. One transaction.
    ///
    /// # Errors
    /// Returns an error if any statement fails; nothing is committed then.
    pub fn replace_aggregate_window(
        &self,
        symbol: &str,
        timeframe: &str,
        start_us: i64,
        end_us: i64,
        rows: &[AggregateRow],
    ) -> Result<usize, WarehouseError> {
        if let Some(stray) = rows.iter().find(|row| {
            row.symbol != symbol
                || row.timeframe != timeframe
                || row.bucket_start_us < start_us
                || row.bucket_start_us >= end_us
        }) {
            return Err(WarehouseError::InvalidInput(format!(
                "bucket {} of {}/{} lies outside the replaced window",
                stray.bucket_start_us, stray.symbol, stray.timeframe
            )));
        }

        let connection = self.acquire(AccessMode::ReadWrite)?;
        in_transaction(&connection, |connection| {
            let keep: BTreeSet<i64> = rows.iter().map(|row| row.bucket_start_us).collect();
            let existing = bucket_starts(connection, symbol, timeframe, start_us, end_us)?;

            let mut delete = connection.prepare(
                "DELETE FROM aggregate_bars \
                 WHERE symbol = ? AND timeframe = ? AND bucket_start = make_timestamp(?::BIGINT)",
            )?;
            for bucket in existing.iter().filter(|bucket| !keep.contains(bucket)) {
                let params: [&dyn ToSql; 3] = [&symbol, &timeframe, bucket];
                delete.execute(params.as_slice())?;
            }

            write_aggregates(connection, rows)?;
            Ok(rows.len())
        })
    }

    /// Buckets of one rollup series with `start_us <= bucket_start < end_us`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn query_aggregates(
        &self,
        symbol: &str,
        timeframe: &str,
        start_us: i64,
        end_us: i64,
        closed_only: bool,
    ) -> Result<Vec<AggregateRow>, WarehouseError> {
        let connection = self.acquire(AccessMode::ReadOnly)?;
        let sql = format!(
            "SELECT {AGGREGATE_COLUMNS} FROM aggregate_bars \
             WHERE symbol = ? AND timeframe = ? \
             AND bucket_start >= make_timestamp(?::BIGINT) AND bucket_start < make_timestamp(?::BIGINT) \
             AND (closed OR NOT ?) \
             ORDER BY bucket_start"
        );
        let params: [&dyn ToSql; 5] = [&symbol, &timeframe, &start_us, &end_us, &closed_only];
        let mut statement = connection.prepare(sql.as_str())?;
        let rows = statement
            .query_map(params.as_slice(), read_aggregate_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The `limit` most recent buckets of a rollup series, ascending.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn latest_aggregates(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
        closed_only: bool,
    ) -> Result<Vec<AggregateRow>, WarehouseError> {
        let connection = self.acquire(AccessMode::ReadOnly)?;
        let sql = format!(
            "SELECT {AGGREGATE_COLUMNS} FROM aggregate_bars \
             WHERE symbol = ? AND timeframe = ? AND (closed OR NOT ?) \
             ORDER BY bucket_start DESC LIMIT ?"
        );
        let limit = count_to_i64(limit);
        let params: [&dyn ToSql; 4] = [&symbol, &timeframe, &closed_only, &limit];
        let mut statement = connection.prepare(sql.as_str())?;
        let mut rows = statement
            .query_map(params.as_slice(), read_aggregate_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// `(bucket_start, bucket_end)` of every stored bucket not yet closed.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn open_aggregate_buckets(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Vec<(i64, i64)>, WarehouseError> {
        let connection = self.acquire(AccessMode::ReadOnly)?;
        let mut statement = connection.prepare(
            "SELECT epoch_us(bucket_start), epoch_us(bucket_end) FROM aggregate_bars \
             WHERE symbol = ? AND timeframe = ? AND NOT closed ORDER BY bucket_start",
        )?;
        let params: [&dyn ToSql; 2] = [&symbol, &timeframe];
        let buckets = statement
            .query_map(params.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(buckets)
    }
}

fn bucket_starts(
    connection: &Connection,
    symbol: &str,
    timeframe: &str,
    start_us: i64,
    end_us: i64,
) -> Result<Vec<i64>, WarehouseError> {
    let mut statement = connection.prepare(
        "SELECT epoch_us(bucket_start) FROM aggregate_bars \
         WHERE symbol = ? AND timeframe = ? \
         AND bucket_start >= make_timestamp(?::BIGINT) AND bucket_start < make_timestamp(?::BIGINT)",
    )?;
    let params: [&dyn ToSql; 4] = [&symbol, &timeframe, &start_us, &end_us];
    let starts = statement
        .query_map(params.as_slice(), |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(starts)
}

fn write_aggregates(connection: &Connection, rows: &[AggregateRow]) -> Result<(), WarehouseError> {
    let mut upsert = connection.prepare(
        "INSERT INTO aggregate_bars \
         (symbol, timeframe, bucket_start, bucket_end, source_timeframe, open, high, low, close, \
          volume, trade_count, vwap, source_count, closed, refreshed_at) \
         VALUES (?, ?, make_timestamp(?::BIGINT), make_timestamp(?::BIGINT), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, \
          CURRENT_TIMESTAMP) \
         ON CONFLICT (symbol, timeframe, bucket_start) DO UPDATE SET \
         bucket_end = excluded.bucket_end, source_timeframe = excluded.source_timeframe, \
         open = excluded.open, high = excluded.high, low = excluded.low, close = excluded.close, \
         volume = excluded.volume, trade_count = excluded.trade_count, vwap = excluded.vwap, \
         source_count = excluded.source_count, closed = excluded.closed, \
         refreshed_at = now()",
    )?;

    for row in rows {
        let params: [&dyn ToSql; 14] = [
            &row.symbol,
            &row.timeframe,
            &row.bucket_start_us,
            &row.bucket_end_us,
            &row.source_timeframe,
            &row.open,
            &row.high,
            &row.low,
            &row.close,
            &row.volume,
            &row.trade_count,
            &row.vwap,
            &row.source_count,
            &row.closed,
        ];
        upsert.execute(params.as_slice())?;
    }
    Ok(())
}

fn read_aggregate_row(row: &::duckdb::Row<'_>) -> Result<AggregateRow, ::duckdb::Error> {
    Ok(AggregateRow {
        symbol: row.get(0)?,
        timeframe: row.get(1)?,
        source_timeframe: row.get(2)?,
        bucket_start_us: row.get(3)?,
        bucket_end_us: row.get(4)?,
        open: row.get(5)?,
        high: row.get(6)?,
        low: row.get(7)?,
        close: row.get(8)?,
        volume: row.get(9)?,
        trade_count: row.get(10)?,
        vwap: row.get(11)?,
        source_count: row.get(12)?,
        closed: row.get(13)?,
    })
}
