//! Bar Store: validated, atomic access to raw bars.
//!
//! Wraps the `DuckDB` [`Warehouse`] and runs every call on the blocking
//! pool. Invalid bars are rejected one by one; the remaining bars of a
//! batch commit in a single transaction or not at all.

use std::collections::HashMap;

use ohlcstore_warehouse::{
    BarRow, ChunkInfo, CompressionReport, RetentionReport, UpsertCounts, Warehouse,
};

use crate::error::StorageError;
use crate::{Bar, ProviderId, Symbol, Timeframe, UtcDateTime, ValidationError};

pub const DEFAULT_PRICE_SCALE: u32 = 6;

/// A bar that failed validation, with the reason.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedBar {
    pub bar: Bar,
    pub reason: ValidationError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub rejected: Vec<RejectedBar>,
    /// `[first bar start, last bar end)` over the bars actually written.
    pub written_span: Option<(UtcDateTime, UtcDateTime)>,
}

impl UpsertReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// When chunks are compressed and when bars are dropped, relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePolicy {
    pub compress_after: Option<time::Duration>,
    pub retention: Option<time::Duration>,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            compress_after: Some(time::Duration::days(30)),
            retention: Some(time::Duration::days(3_650)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub compression: CompressionReport,
    pub retention: RetentionReport,
}

#[derive(Clone)]
pub struct BarStore {
    warehouse: Warehouse,
    price_scale: u32,
}

impl BarStore {
    pub fn new(warehouse: Warehouse) -> Self {
        Self {
            warehouse,
            price_scale: DEFAULT_PRICE_SCALE,
        }
    }

    pub fn with_price_scale(mut self, price_scale: u32) -> Self {
        self.price_scale = price_scale;
        self
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn price_scale(&self) -> u32 {
        self.price_scale
    }

    /// Validate and write `bars`. Later bars win over earlier ones with
    /// the same key, both inside the batch and against stored data.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] when the transaction fails; nothing from
    /// the batch is visible then.
    pub async fn upsert(&self, bars: Vec<Bar>) -> Result<UpsertReport, StorageError> {
        let mut accepted: Vec<Bar> = Vec::with_capacity(bars.len());
        let mut positions: HashMap<(i64, Symbol, Timeframe), usize> = HashMap::new();
        let mut rejected = Vec::new();

        for mut bar in bars {
            bar.round_prices(self.price_scale);
            if let Err(reason) = bar.validate() {
                tracing::debug!(symbol = %bar.symbol, time = %bar.time, %reason, "bar rejected");
                rejected.push(RejectedBar { bar, reason });
                continue;
            }
            let key = (bar.time.unix_micros(), bar.symbol.clone(), bar.timeframe);
            match positions.get(&key) {
                Some(&index) => accepted[index] = bar,
                None => {
                    positions.insert(key, accepted.len());
                    accepted.push(bar);
                }
            }
        }

        if accepted.is_empty() {
            return Ok(UpsertReport {
                rejected,
                ..UpsertReport::default()
            });
        }

        let written_span = accepted.iter().fold(None, |span: Option<(UtcDateTime, UtcDateTime)>, bar| {
            let end = bar.end_time();
            Some(match span {
                Some((low, high)) => (low.min(bar.time), high.max(end)),
                None => (bar.time, end),
            })
        });
        let rows: Vec<BarRow> = accepted.iter().map(bar_to_row).collect();
        let counts: UpsertCounts = self
            .run_blocking(move |warehouse| warehouse.upsert_bars(&rows))
            .await?;

        Ok(UpsertReport {
            inserted: counts.inserted,
            updated: counts.updated,
            rejected,
            written_span,
        })
    }

    /// Bars with `start <= time < end`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails or a stored row is invalid.
    pub async fn query(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<Vec<Bar>, StorageError> {
        let symbol_key = symbol.as_str().to_owned();
        let (start_us, end_us) = (start.unix_micros(), end.unix_micros());
        let rows = self
            .run_blocking(move |warehouse| {
                warehouse.query_bars(&symbol_key, timeframe.as_str(), start_us, end_us)
            })
            .await?;
        rows_to_bars(rows)
    }

    /// The `limit` most recent bars, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails or a stored row is invalid.
    pub async fn latest(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, StorageError> {
        let symbol_key = symbol.as_str().to_owned();
        let rows = self
            .run_blocking(move |warehouse| {
                warehouse.latest_bars(&symbol_key, timeframe.as_str(), limit)
            })
            .await?;
        rows_to_bars(rows)
    }

    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails.
    pub async fn latest_bar_time(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Option<UtcDateTime>, StorageError> {
        let symbol_key = symbol.as_str().to_owned();
        let micros = self
            .run_blocking(move |warehouse| {
                warehouse.latest_bar_time(&symbol_key, timeframe.as_str())
            })
            .await?;
        micros
            .map(UtcDateTime::from_unix_micros)
            .transpose()
            .map_err(StorageError::from)
    }

    /// Irreversibly delete every bar older than `threshold`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the delete fails; nothing is removed then.
    pub async fn delete_older_than(
        &self,
        threshold: UtcDateTime,
    ) -> Result<RetentionReport, StorageError> {
        let threshold_us = threshold.unix_micros();
        self.run_blocking(move |warehouse| warehouse.delete_bars_before(threshold_us))
            .await
    }

    /// Compress every chunk that ends at or before `threshold`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if a chunk cannot be compressed.
    pub async fn compress_chunks_older_than(
        &self,
        threshold: UtcDateTime,
    ) -> Result<CompressionReport, StorageError> {
        let threshold_us = threshold.unix_micros();
        self.run_blocking(move |warehouse| warehouse.compress_chunks_before(threshold_us))
            .await
    }

    /// Compress, then apply retention, both relative to `now`.
    ///
    /// # Errors
    ///
    /// Returns the first [`StorageError`]; compression already committed
    /// stays committed.
    pub async fn run_maintenance(
        &self,
        now: UtcDateTime,
        policy: &LifecyclePolicy,
    ) -> Result<MaintenanceReport, StorageError> {
        let mut report = MaintenanceReport::default();
        if let Some(compress_after) = policy.compress_after {
            report.compression = self
                .compress_chunks_older_than(now.saturating_sub(compress_after))
                .await?;
        }
        if let Some(retention) = policy.retention {
            report.retention = self
                .delete_older_than(now.saturating_sub(retention))
                .await?;
        }
        tracing::info!(
            chunks_compressed = report.compression.chunks_compressed,
            rows_deleted = report.retention.rows_deleted,
            "storage maintenance finished"
        );
        Ok(report)
    }

    /// # Errors
    ///
    /// Returns [`StorageError`] if the catalog cannot be read.
    pub async fn chunks(&self) -> Result<Vec<ChunkInfo>, StorageError> {
        self.run_blocking(|warehouse| warehouse.list_chunks()).await
    }

    pub(crate) async fn run_blocking<T, F>(&self, operation: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Warehouse) -> Result<T, ohlcstore_warehouse::WarehouseError> + Send + 'static,
    {
        let warehouse = self.warehouse.clone();
        tokio::task::spawn_blocking(move || operation(&warehouse))
            .await
            .map_err(|error| StorageError::Task(error.to_string()))?
            .map_err(StorageError::from)
    }
}

pub(crate) fn bar_to_row(bar: &Bar) -> BarRow {
    BarRow {
        symbol: bar.symbol.as_str().to_owned(),
        timeframe: bar.timeframe.as_str().to_owned(),
        ts_us: bar.time.unix_micros(),
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        volume: bar.volume,
        trade_count: bar.trade_count,
        vwap: bar.vwap,
        source: bar.source.as_str().to_owned(),
    }
}

pub(crate) fn row_to_bar(row: BarRow) -> Result<Bar, ValidationError> {
    Ok(Bar {
        time: UtcDateTime::from_unix_micros(row.ts_us)?,
        symbol: Symbol::parse(&row.symbol)?,
        timeframe: row.timeframe.parse()?,
        open: row.open,
        high: row.high,
        low: row.low,
        close: row.close,
        volume: row.volume,
        trade_count: row.trade_count,
        vwap: row.vwap,
        source: row.source.parse::<ProviderId>()?,
    })
}

fn rows_to_bars(rows: Vec<BarRow>) -> Result<Vec<Bar>, StorageError> {
    rows.into_iter()
        .map(|row| row_to_bar(row).map_err(StorageError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use ohlcstore_warehouse::WarehouseConfig;

    use super::*;

    const DAY_US: i64 = 86_400_000_000;

    fn store() -> BarStore {
        BarStore::new(Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse"))
    }

    fn bar(day: i64, close: f64) -> Bar {
        Bar::new(
            UtcDateTime::from_unix_micros(19_700 * DAY_US + day * DAY_US).expect("time"),
            Symbol::parse("AAPL").expect("symbol"),
            Timeframe::OneDay,
            close,
            close + 1.0,
            close - 1.0,
            close,
            1_000,
            ProviderId::Fixture,
        )
        .expect("bar")
    }

    #[tokio::test]
    async fn batch_duplicates_keep_last_occurrence() {
        let store = store();
        let report = store
            .upsert(vec![bar(0, 10.0), bar(0, 12.0), bar(1, 11.0)])
            .await
            .expect("upsert");

        assert_eq!(report.inserted, 2);
        assert_eq!(report.updated, 0);

        let stored = store
            .latest(&Symbol::parse("AAPL").expect("symbol"), Timeframe::OneDay, 10)
            .await
            .expect("latest");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].close, 12.0);
    }

    #[tokio::test]
    async fn rejects_invalid_bars_individually() {
        let store = store();
        let mut broken = bar(1, 10.0);
        broken.high = 5.0;

        let report = store
            .upsert(vec![bar(0, 10.0), broken])
            .await
            .expect("upsert");

        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].reason, ValidationError::InvalidBarRange);
    }

    #[tokio::test]
    async fn prices_are_rounded_to_store_scale() {
        let store = store().with_price_scale(2);
        let mut precise = bar(0, 10.0);
        precise.close = 10.126;
        store.upsert(vec![precise]).await.expect("upsert");

        let stored = store
            .latest(&Symbol::parse("AAPL").expect("symbol"), Timeframe::OneDay, 1)
            .await
            .expect("latest");
        assert_eq!(stored[0].close, 10.13);
    }

    #[tokio::test]
    async fn maintenance_compresses_then_expires() {
        let store = store();
        store
            .upsert((0..30).map(|day| bar(day, 10.0)).collect())
            .await
            .expect("upsert");

        let now = UtcDateTime::from_unix_micros(19_700 * DAY_US + 40 * DAY_US).expect("now");
        let policy = LifecyclePolicy {
            compress_after: Some(time::Duration::days(10)),
            retention: Some(time::Duration::days(35)),
        };
        let report = store.run_maintenance(now, &policy).await.expect("maintenance");

        assert!(report.compression.chunks_compressed > 0);
        assert_eq!(report.retention.rows_deleted, 5);
        let remaining = store
            .latest(&Symbol::parse("AAPL").expect("symbol"), Timeframe::OneDay, 100)
            .await
            .expect("latest");
        assert_eq!(remaining.len(), 25);
    }
}
