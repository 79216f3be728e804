//! Bar rows, chunk catalog, compression and retention.

use std::collections::{BTreeMap, BTreeSet};

use ::duckdb::{Connection, ToSql};

use crate::models::{BarRow, ChunkInfo, CompressionReport, RetentionReport, UpsertCounts};
use crate::segment::SegmentPayload;
use crate::{
    chunk_start, count_from_i64, count_to_i64, in_transaction, AccessMode, Warehouse,
    WarehouseError,
};

const BAR_COLUMNS: &str =
    "symbol, timeframe, epoch_us(ts), open, high, low, close, volume, trade_count, vwap, source";

const UPSERT_BAR_SQL: &str = "INSERT INTO bars \
     (symbol, timeframe, ts, chunk_start, open, high, low, close, volume, trade_count, vwap, source, updated_at) \
     VALUES (?, ?, make_timestamp(?::BIGINT), make_timestamp(?::BIGINT), ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
     ON CONFLICT (symbol, timeframe, ts) DO UPDATE SET \
     open = excluded.open, high = excluded.high, low = excluded.low, close = excluded.close, \
     volume = excluded.volume, trade_count = excluded.trade_count, vwap = excluded.vwap, \
     source = excluded.source, updated_at = now()";

impl Warehouse {
    /// Insert or replace bars in a single transaction.
    ///
    /// Rows must already be validated. Bars landing in a compressed segment
    /// cause that segment to be expanded back into row storage first.
    ///
    /// # Errors
    /// Returns an error if any statement fails; nothing is committed then.
    pub fn upsert_bars(&self, rows: &[BarRow]) -> Result<UpsertCounts, WarehouseError> {
        if rows.is_empty() {
            return Ok(UpsertCounts::default());
        }

        let width = self.chunk_width_us();
        let connection = self.acquire(AccessMode::ReadWrite)?;
        in_transaction(&connection, |connection| {
            let mut segments = BTreeSet::new();
            let mut chunks = BTreeSet::new();
            for row in rows {
                let chunk = chunk_start(row.ts_us, width);
                chunks.insert(chunk);
                segments.insert((chunk, row.symbol.as_str(), row.timeframe.as_str()));
            }

            for chunk in &chunks {
                ensure_chunk(connection, *chunk, width)?;
            }
            for (chunk, symbol, timeframe) in &segments {
                decompress_segment(connection, *chunk, symbol, timeframe)?;
            }

            let mut exists = connection.prepare(
                "SELECT COUNT(*) FROM bars \
                 WHERE symbol = ? AND timeframe = ? AND ts = make_timestamp(?::BIGINT)",
            )?;
            let mut upsert = connection.prepare(UPSERT_BAR_SQL)?;
            let mut counts = UpsertCounts::default();

            for row in rows {
                let key: [&dyn ToSql; 3] = [&row.symbol, &row.timeframe, &row.ts_us];
                let existing: i64 = exists.query_row(key.as_slice(), |result| result.get(0))?;

                let chunk = chunk_start(row.ts_us, width);
                let params: [&dyn ToSql; 12] = [
                    &row.symbol,
                    &row.timeframe,
                    &row.ts_us,
                    &chunk,
                    &row.open,
                    &row.high,
                    &row.low,
                    &row.close,
                    &row.volume,
                    &row.trade_count,
                    &row.vwap,
                    &row.source,
                ];
                upsert.execute(params.as_slice())?;

                if existing > 0 {
                    counts.updated += 1;
                } else {
                    counts.inserted += 1;
                }
            }

            for chunk in &chunks {
                refresh_chunk_row_count(connection, *chunk)?;
            }

            Ok(counts)
        })
    }

    /// Bars of one series with `start_us <= ts < end_us`, ascending by time.
    ///
    /// Reads row storage and compressed segments from one snapshot.
    ///
    /// # Errors
    /// Returns an error if a query fails or a segment cannot be decoded.
    pub fn query_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        start_us: i64,
        end_us: i64,
    ) -> Result<Vec<BarRow>, WarehouseError> {
        if start_us >= end_us {
            return Ok(Vec::new());
        }

        let connection = self.acquire(AccessMode::ReadOnly)?;
        in_transaction(&connection, |connection| {
            let sql = format!(
                "SELECT {BAR_COLUMNS} FROM bars \
                 WHERE symbol = ? AND timeframe = ? \
                 AND ts >= make_timestamp(?::BIGINT) AND ts < make_timestamp(?::BIGINT) \
                 ORDER BY ts"
            );
            let params: [&dyn ToSql; 4] = [&symbol, &timeframe, &start_us, &end_us];
            let mut bars = collect_bar_rows(connection, sql.as_str(), params.as_slice())?;

            let mut statement = connection.prepare(
                "SELECT payload FROM bar_segments \
                 WHERE symbol = ? AND timeframe = ? \
                 AND max_ts >= make_timestamp(?::BIGINT) AND min_ts < make_timestamp(?::BIGINT)",
            )?;
            let mut cursor = statement.query(params.as_slice())?;
            while let Some(row) = cursor.next()? {
                let payload: Vec<u8> = row.get(0)?;
                let decoded = SegmentPayload::from_bytes(&payload)?.decode(symbol, timeframe)?;
                bars.extend(
                    decoded
                        .into_iter()
                        .filter(|bar| bar.ts_us >= start_us && bar.ts_us < end_us),
                );
            }

            bars.sort_by_key(|bar| bar.ts_us);
            Ok(bars)
        })
    }

    /// The `limit` most recent bars of one series, ascending by time.
    ///
    /// # Errors
    /// Returns an error if a query fails or a segment cannot be decoded.
    pub fn latest_bars(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> Result<Vec<BarRow>, WarehouseError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let connection = self.acquire(AccessMode::ReadOnly)?;
        in_transaction(&connection, |connection| {
            let sql = format!(
                "SELECT {BAR_COLUMNS} FROM bars \
                 WHERE symbol = ? AND timeframe = ? \
                 ORDER BY ts DESC LIMIT ?"
            );
            let limit_param = count_to_i64(limit);
            let params: [&dyn ToSql; 3] = [&symbol, &timeframe, &limit_param];
            let mut candidates = collect_bar_rows(connection, sql.as_str(), params.as_slice())?;

            let mut statement = connection.prepare(
                "SELECT epoch_us(max_ts), payload FROM bar_segments \
                 WHERE symbol = ? AND timeframe = ? ORDER BY max_ts DESC",
            )?;
            let key: [&dyn ToSql; 2] = [&symbol, &timeframe];
            let mut cursor = statement.query(key.as_slice())?;
            while let Some(row) = cursor.next()? {
                let max_ts_us: i64 = row.get(0)?;
                if candidates.len() >= limit {
                    candidates.sort_by(|left, right| right.ts_us.cmp(&left.ts_us));
                    if max_ts_us < candidates[limit - 1].ts_us {
                        break;
                    }
                }
                let payload: Vec<u8> = row.get(1)?;
                candidates.extend(SegmentPayload::from_bytes(&payload)?.decode(symbol, timeframe)?);
            }

            candidates.sort_by(|left, right| right.ts_us.cmp(&left.ts_us));
            candidates.truncate(limit);
            candidates.reverse();
            Ok(candidates)
        })
    }

    /// Time of the newest stored bar of a series.
    ///
    /// # Errors
    /// Returns an error if a query fails.
    pub fn latest_bar_time(
        &self,
        symbol: &str,
        timeframe: &str,
    ) -> Result<Option<i64>, WarehouseError> {
        let connection = self.acquire(AccessMode::ReadOnly)?;
        let params: [&dyn ToSql; 2] = [&symbol, &timeframe];
        let in_rows: Option<i64> = connection.query_row(
            "SELECT MAX(epoch_us(ts)) FROM bars WHERE symbol = ? AND timeframe = ?",
            params.as_slice(),
            |row| row.get(0),
        )?;
        let in_segments: Option<i64> = connection.query_row(
            "SELECT MAX(epoch_us(max_ts)) FROM bar_segments WHERE symbol = ? AND timeframe = ?",
            params.as_slice(),
            |row| row.get(0),
        )?;
        Ok(in_rows.max(in_segments))
    }

    /// Rewrite every uncompressed chunk ending at or before `threshold_us`
    /// into per-series segments. Each chunk is its own transaction.
    ///
    /// # Errors
    /// Returns an error if a chunk cannot be compressed; chunks finished
    /// before the failure stay compressed.
    pub fn compress_chunks_before(
        &self,
        threshold_us: i64,
    ) -> Result<CompressionReport, WarehouseError> {
        let connection = self.acquire(AccessMode::ReadWrite)?;
        let mut statement = connection.prepare(
            "SELECT epoch_us(chunk_start) FROM bar_chunks \
             WHERE chunk_end <= make_timestamp(?::BIGINT) AND NOT compressed \
             ORDER BY chunk_start",
        )?;
        let chunks = statement
            .query_map([threshold_us], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(statement);

        let mut report = CompressionReport::default();
        for chunk in chunks {
            let (segments, rows) =
                in_transaction(&connection, |connection| compress_chunk(connection, chunk))?;
            report.chunks_compressed += 1;
            report.segments_written += segments;
            report.rows_compressed += rows;
        }

        if report.chunks_compressed > 0 {
            tracing::info!(
                chunks = report.chunks_compressed,
                segments = report.segments_written,
                rows = report.rows_compressed,
                "compressed bar chunks"
            );
        }
        Ok(report)
    }

    /// Permanently delete every bar older than `threshold_us`.
    ///
    /// # Errors
    /// Returns an error if any statement fails; nothing is deleted then.
    pub fn delete_bars_before(&self, threshold_us: i64) -> Result<RetentionReport, WarehouseError> {
        let width = self.chunk_width_us();
        let connection = self.acquire(AccessMode::ReadWrite)?;
        let report = in_transaction(&connection, |connection| {
            let mut report = RetentionReport {
                rows_deleted: connection.execute(
                    "DELETE FROM bars WHERE ts < make_timestamp(?::BIGINT)",
                    [threshold_us],
                )?,
                ..RetentionReport::default()
            };

            let (expired_segments, expired_rows): (i64, Option<i64>) = connection.query_row(
                "SELECT COUNT(*), CAST(SUM(row_count) AS BIGINT) FROM bar_segments \
                 WHERE max_ts < make_timestamp(?::BIGINT)",
                [threshold_us],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            connection.execute(
                "DELETE FROM bar_segments WHERE max_ts < make_timestamp(?::BIGINT)",
                [threshold_us],
            )?;
            report.segments_deleted = count_from_i64(expired_segments);
            report.rows_deleted += count_from_i64(expired_rows.unwrap_or_default());

            report.rows_deleted += trim_straddling_segments(connection, threshold_us)?;

            let dropped: i64 = connection.query_row(
                "SELECT COUNT(*) FROM bar_chunks WHERE chunk_end <= make_timestamp(?::BIGINT)",
                [threshold_us],
                |row| row.get(0),
            )?;
            connection.execute(
                "DELETE FROM bar_chunks WHERE chunk_end <= make_timestamp(?::BIGINT)",
                [threshold_us],
            )?;
            report.chunks_dropped = count_from_i64(dropped);

            refresh_chunk_row_count(connection, chunk_start(threshold_us, width))?;
            Ok(report)
        })?;

        if report.rows_deleted > 0 || report.chunks_dropped > 0 {
            tracing::warn!(
                rows = report.rows_deleted,
                chunks = report.chunks_dropped,
                segments = report.segments_deleted,
                threshold_us,
                "retention deleted bars"
            );
        }
        Ok(report)
    }

    /// The chunk catalog, oldest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub fn list_chunks(&self) -> Result<Vec<ChunkInfo>, WarehouseError> {
        let connection = self.acquire(AccessMode::ReadOnly)?;
        let mut statement = connection.prepare(
            "SELECT epoch_us(chunk_start), epoch_us(chunk_end), row_count, compressed \
             FROM bar_chunks ORDER BY chunk_start",
        )?;
        let chunks = statement
            .query_map([], |row| {
                Ok(ChunkInfo {
                    chunk_start_us: row.get(0)?,
                    chunk_end_us: row.get(1)?,
                    row_count: row.get(2)?,
                    compressed: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }
}

fn read_bar_row(row: &::duckdb::Row<'_>) -> Result<BarRow, ::duckdb::Error> {
    Ok(BarRow {
        symbol: row.get(0)?,
        timeframe: row.get(1)?,
        ts_us: row.get(2)?,
        open: row.get(3)?,
        high: row.get(4)?,
        low: row.get(5)?,
        close: row.get(6)?,
        volume: row.get(7)?,
        trade_count: row.get(8)?,
        vwap: row.get(9)?,
        source: row.get(10)?,
    })
}

fn collect_bar_rows(
    connection: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<BarRow>, WarehouseError> {
    let mut statement = connection.prepare(sql)?;
    let rows = statement
        .query_map(params, read_bar_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn ensure_chunk(connection: &Connection, chunk: i64, width: i64) -> Result<(), WarehouseError> {
    let chunk_end = chunk.saturating_add(width);
    let params: [&dyn ToSql; 2] = [&chunk, &chunk_end];
    connection.execute(
        "INSERT INTO bar_chunks (chunk_start, chunk_end, row_count, compressed) \
         VALUES (make_timestamp(?::BIGINT), make_timestamp(?::BIGINT), 0, FALSE) \
         ON CONFLICT (chunk_start) DO NOTHING",
        params.as_slice(),
    )?;
    Ok(())
}

fn refresh_chunk_row_count(connection: &Connection, chunk: i64) -> Result<(), WarehouseError> {
    connection.execute(
        "UPDATE bar_chunks SET row_count = CAST(\
         (SELECT COUNT(*) FROM bars WHERE chunk_start = make_timestamp(?::BIGINT)) + \
         (SELECT COALESCE(SUM(row_count), 0) FROM bar_segments WHERE chunk_start = make_timestamp(?::BIGINT)) \
         AS BIGINT) \
         WHERE chunk_start = make_timestamp(?::BIGINT)",
        [chunk, chunk, chunk],
    )?;
    Ok(())
}

fn load_segment(
    connection: &Connection,
    chunk: i64,
    symbol: &str,
    timeframe: &str,
) -> Result<Option<SegmentPayload>, WarehouseError> {
    let mut statement = connection.prepare(
        "SELECT payload FROM bar_segments \
         WHERE chunk_start = make_timestamp(?::BIGINT) AND symbol = ? AND timeframe = ?",
    )?;
    let params: [&dyn ToSql; 3] = [&chunk, &symbol, &timeframe];
    let mut cursor = statement.query(params.as_slice())?;
    match cursor.next()? {
        Some(row) => {
            let payload: Vec<u8> = row.get(0)?;
            Ok(Some(SegmentPayload::from_bytes(&payload)?))
        }
        None => Ok(None),
    }
}

/// Move one compressed segment back into row storage.
fn decompress_segment(
    connection: &Connection,
    chunk: i64,
    symbol: &str,
    timeframe: &str,
) -> Result<usize, WarehouseError> {
    let Some(payload) = load_segment(connection, chunk, symbol, timeframe)? else {
        return Ok(0);
    };
    let rows = payload.decode(symbol, timeframe)?;

    let mut insert = connection.prepare(UPSERT_BAR_SQL)?;
    for row in &rows {
        let params: [&dyn ToSql; 12] = [
            &row.symbol,
            &row.timeframe,
            &row.ts_us,
            &chunk,
            &row.open,
            &row.high,
            &row.low,
            &row.close,
            &row.volume,
            &row.trade_count,
            &row.vwap,
            &row.source,
        ];
        insert.execute(params.as_slice())?;
    }

    let key: [&dyn ToSql; 3] = [&chunk, &symbol, &timeframe];
    connection.execute(
        "DELETE FROM bar_segments \
         WHERE chunk_start = make_timestamp(?::BIGINT) AND symbol = ? AND timeframe = ?",
        key.as_slice(),
    )?;
    connection.execute(
        "UPDATE bar_chunks SET compressed = FALSE, compressed_at = NULL \
         WHERE chunk_start = make_timestamp(?::BIGINT)",
        [chunk],
    )?;

    tracing::debug!(
        symbol,
        timeframe,
        chunk_start_us = chunk,
        rows = rows.len(),
        "decompressed segment for write"
    );
    Ok(rows.len())
}

/// Returns `(segments_written, rows_compressed)`.
fn compress_chunk(connection: &Connection, chunk: i64) -> Result<(usize, usize), WarehouseError> {
    let sql = format!(
        "SELECT {BAR_COLUMNS} FROM bars WHERE chunk_start = make_timestamp(?::BIGINT) \
         ORDER BY symbol, timeframe, ts"
    );
    let rows = collect_bar_rows(connection, sql.as_str(), [&chunk as &dyn ToSql].as_slice())?;
    let row_count = rows.len();

    let mut groups: BTreeMap<(String, String), Vec<BarRow>> = BTreeMap::new();
    for row in rows {
        groups
            .entry((row.symbol.clone(), row.timeframe.clone()))
            .or_default()
            .push(row);
    }

    let mut segments_written = 0;
    for ((symbol, timeframe), mut group) in groups {
        if let Some(existing) = load_segment(connection, chunk, &symbol, &timeframe)? {
            let fresh: BTreeSet<i64> = group.iter().map(|row| row.ts_us).collect();
            group.extend(
                existing
                    .decode(&symbol, &timeframe)?
                    .into_iter()
                    .filter(|row| !fresh.contains(&row.ts_us)),
            );
            let payload = SegmentPayload::encode(&group)?;
            write_segment_update(connection, chunk, &symbol, &timeframe, &payload)?;
        } else {
            let payload = SegmentPayload::encode(&group)?;
            let bytes = payload.to_bytes()?;
            let min_ts = payload.min_ts_us();
            let max_ts = payload.max_ts_us();
            let len = count_to_i64(payload.len());
            let params: [&dyn ToSql; 7] =
                [&chunk, &symbol, &timeframe, &min_ts, &max_ts, &len, &bytes];
            connection.execute(
                "INSERT INTO bar_segments \
                 (chunk_start, symbol, timeframe, min_ts, max_ts, row_count, payload) \
                 VALUES (make_timestamp(?::BIGINT), ?, ?, make_timestamp(?::BIGINT), \
                 make_timestamp(?::BIGINT), ?, ?)",
                params.as_slice(),
            )?;
        }
        segments_written += 1;
    }

    connection.execute(
        "DELETE FROM bars WHERE chunk_start = make_timestamp(?::BIGINT)",
        [chunk],
    )?;
    connection.execute(
        "UPDATE bar_chunks SET compressed = TRUE, compressed_at = CURRENT_TIMESTAMP \
         WHERE chunk_start = make_timestamp(?::BIGINT)",
        [chunk],
    )?;
    refresh_chunk_row_count(connection, chunk)?;

    Ok((segments_written, row_count))
}

fn write_segment_update(
    connection: &Connection,
    chunk: i64,
    symbol: &str,
    timeframe: &str,
    payload: &SegmentPayload,
) -> Result<(), WarehouseError> {
    let bytes = payload.to_bytes()?;
    let min_ts = payload.min_ts_us();
    let max_ts = payload.max_ts_us();
    let len = count_to_i64(payload.len());
    let params: [&dyn ToSql; 7] = [&bytes, &min_ts, &max_ts, &len, &chunk, &symbol, &timeframe];
    connection.execute(
        "UPDATE bar_segments SET payload = ?, min_ts = make_timestamp(?::BIGINT), \
         max_ts = make_timestamp(?::BIGINT), row_count = ? \
         WHERE chunk_start = make_timestamp(?::BIGINT) AND symbol = ? AND timeframe = ?",
        params.as_slice(),
    )?;
    Ok(())
}

/// Drop the expired part of segments that straddle `threshold_us`.
fn trim_straddling_segments(
    connection: &Connection,
    threshold_us: i64,
) -> Result<usize, WarehouseError> {
    let mut statement = connection.prepare(
        "SELECT epoch_us(chunk_start), symbol, timeframe, payload FROM bar_segments \
         WHERE min_ts < make_timestamp(?::BIGINT) AND max_ts >= make_timestamp(?::BIGINT)",
    )?;
    let straddling = statement
        .query_map([threshold_us, threshold_us], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(statement);

    let mut removed = 0;
    for (chunk, symbol, timeframe, bytes) in straddling {
        let rows = SegmentPayload::from_bytes(&bytes)?.decode(&symbol, &timeframe)?;
        let before = rows.len();
        let kept: Vec<BarRow> = rows
            .into_iter()
            .filter(|row| row.ts_us >= threshold_us)
            .collect();
        removed += before - kept.len();
        let payload = SegmentPayload::encode(&kept)?;
        write_segment_update(connection, chunk, &symbol, &timeframe, &payload)?;
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use crate::{BarRow, Warehouse, WarehouseConfig, MICROS_PER_DAY};

    fn warehouse() -> Warehouse {
        Warehouse::open(WarehouseConfig {
            chunk_width_us: 7 * MICROS_PER_DAY,
            ..WarehouseConfig::in_memory()
        })
        .expect("open warehouse")
    }

    fn daily(symbol: &str, day: i64, close: f64) -> BarRow {
        BarRow {
            symbol: symbol.to_string(),
            timeframe: String::from("1d"),
            ts_us: day * MICROS_PER_DAY,
            open: close - 1.0,
            high: close + 2.0,
            low: close - 2.0,
            close,
            volume: 1_000 + day,
            trade_count: Some(10),
            vwap: None,
            source: String::from("fixture"),
        }
    }

    #[test]
    fn upsert_counts_inserts_then_updates() {
        let warehouse = warehouse();
        let rows: Vec<BarRow> = (0..5).map(|day| daily("AAPL", day, 100.0)).collect();

        let first = warehouse.upsert_bars(&rows).expect("first upsert");
        assert_eq!((first.inserted, first.updated), (5, 0));

        let second = warehouse.upsert_bars(&rows).expect("second upsert");
        assert_eq!((second.inserted, second.updated), (0, 5));

        let stored = warehouse
            .query_bars("AAPL", "1d", 0, 10 * MICROS_PER_DAY)
            .expect("query");
        assert_eq!(stored, rows);
    }

    #[test]
    fn later_write_replaces_every_field() {
        let warehouse = warehouse();
        warehouse.upsert_bars(&[daily("AAPL", 1, 100.0)]).expect("seed");

        let mut replacement = daily("AAPL", 1, 120.0);
        replacement.trade_count = None;
        replacement.source = String::from("alpaca");
        warehouse
            .upsert_bars(&[replacement.clone()])
            .expect("replace");

        let stored = warehouse.latest_bars("AAPL", "1d", 1).expect("latest");
        assert_eq!(stored, vec![replacement]);
    }

    #[test]
    fn compression_keeps_query_results_identical() {
        let warehouse = warehouse();
        let rows: Vec<BarRow> = (0..20)
            .flat_map(|day| [daily("AAPL", day, 100.0 + day as f64), daily("MSFT", day, 300.0)])
            .collect();
        warehouse.upsert_bars(&rows).expect("seed");

        let before = warehouse
            .query_bars("AAPL", "1d", 3 * MICROS_PER_DAY, 18 * MICROS_PER_DAY)
            .expect("before");
        let latest_before = warehouse.latest_bars("AAPL", "1d", 9).expect("latest before");

        let report = warehouse
            .compress_chunks_before(14 * MICROS_PER_DAY)
            .expect("compress");
        assert_eq!(report.chunks_compressed, 2);
        assert_eq!(report.segments_written, 4);
        assert_eq!(report.rows_compressed, 28);

        let after = warehouse
            .query_bars("AAPL", "1d", 3 * MICROS_PER_DAY, 18 * MICROS_PER_DAY)
            .expect("after");
        assert_eq!(before, after);
        assert_eq!(
            warehouse.latest_bars("AAPL", "1d", 9).expect("latest after"),
            latest_before
        );
        assert_eq!(
            warehouse.latest_bar_time("MSFT", "1d").expect("latest time"),
            Some(19 * MICROS_PER_DAY)
        );

        let chunks = warehouse.list_chunks().expect("chunks");
        assert!(chunks[0].compressed && chunks[1].compressed && !chunks[2].compressed);
        assert_eq!(chunks[0].row_count, 14);
    }

    #[test]
    fn upsert_into_compressed_chunk_expands_segment() {
        let warehouse = warehouse();
        let rows: Vec<BarRow> = (0..7).map(|day| daily("AAPL", day, 50.0)).collect();
        warehouse.upsert_bars(&rows).expect("seed");
        warehouse
            .compress_chunks_before(7 * MICROS_PER_DAY)
            .expect("compress");

        let counts = warehouse
            .upsert_bars(&[daily("AAPL", 3, 75.0)])
            .expect("upsert into compressed");
        assert_eq!((counts.inserted, counts.updated), (0, 1));

        let stored = warehouse
            .query_bars("AAPL", "1d", 0, 7 * MICROS_PER_DAY)
            .expect("query");
        assert_eq!(stored.len(), 7);
        assert!((stored[3].close - 75.0).abs() < f64::EPSILON);
        assert!(!warehouse.list_chunks().expect("chunks")[0].compressed);
    }

    #[test]
    fn retention_removes_only_older_bars_from_rows_and_segments() {
        let warehouse = warehouse();
        let rows: Vec<BarRow> = (0..21).map(|day| daily("AAPL", day, 10.0)).collect();
        warehouse.upsert_bars(&rows).expect("seed");
        warehouse
            .compress_chunks_before(14 * MICROS_PER_DAY)
            .expect("compress");

        let report = warehouse
            .delete_bars_before(10 * MICROS_PER_DAY)
            .expect("retention");
        assert_eq!(report.rows_deleted, 10);
        assert_eq!(report.chunks_dropped, 1);
        assert_eq!(report.segments_deleted, 1);

        let remaining = warehouse
            .query_bars("AAPL", "1d", 0, 30 * MICROS_PER_DAY)
            .expect("query");
        assert_eq!(remaining.len(), 11);
        assert_eq!(remaining[0].ts_us, 10 * MICROS_PER_DAY);
    }

    #[test]
    fn empty_range_and_zero_limit_return_nothing() {
        let warehouse = warehouse();
        warehouse.upsert_bars(&[daily("AAPL", 1, 1.0)]).expect("seed");
        assert!(warehouse
            .query_bars("AAPL", "1d", MICROS_PER_DAY, MICROS_PER_DAY)
            .expect("query")
            .is_empty());
        assert!(warehouse.latest_bars("AAPL", "1d", 0).expect("latest").is_empty());
    }
}
