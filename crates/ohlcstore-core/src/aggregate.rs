//! Aggregate Engine: incremental rollups of fine bars into coarser buckets.
//!
//! Ingestion marks the source range it wrote as dirty. A refresh claims the
//! dirty ranges, widens them to whole target buckets, recomputes those
//! buckets from a snapshot of the source bars and replaces them in one
//! transaction. A bucket is `closed` once its end is at or before the
//! source watermark: the later of the last committed ingestion window end
//! and the end of the newest stored source bar.

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ohlcstore_warehouse::AggregateRow;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::QueryCache;
use crate::error::StorageError;
use crate::store::BarStore;
use crate::{
    round_to_scale, AggregateBar, Bar, ProviderId, Symbol, Timeframe, UtcDateTime,
    ValidationError,
};

/// A maintained rollup from a finer to a coarser timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rollup {
    pub from: Timeframe,
    pub to: Timeframe,
}

impl Rollup {
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidRollup`] unless every `to` bucket is
    /// an exact union of `from` buckets.
    pub fn new(from: Timeframe, to: Timeframe) -> Result<Self, ValidationError> {
        if !to.is_multiple_of(from) {
            return Err(ValidationError::InvalidRollup {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(Self { from, to })
    }

    /// Minute bars into hourly and daily buckets.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self {
                from: Timeframe::OneMinute,
                to: Timeframe::OneHour,
            },
            Self {
                from: Timeframe::OneMinute,
                to: Timeframe::OneDay,
            },
        ]
    }

    fn widen(self, start_us: i64, end_us: i64) -> (i64, i64) {
        let start = self.to.bucket_start_us(start_us);
        let end = self
            .to
            .bucket_start_us(end_us.saturating_sub(1))
            .saturating_add(self.to.duration_us());
        (start, end)
    }
}

impl Display for Rollup {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.from, self.to)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub windows_refreshed: usize,
    pub buckets_written: usize,
    /// Windows left dirty for the next cycle.
    pub failed_windows: usize,
}

impl RefreshReport {
    fn absorb(&mut self, other: Self) {
        self.windows_refreshed += other.windows_refreshed;
        self.buckets_written += other.buckets_written;
        self.failed_windows += other.failed_windows;
    }
}

/// A window whose buckets could not be rebuilt; it stays dirty.
#[derive(Debug, Error)]
#[error("rollup {rollup} of {symbol} over [{start_us}, {end_us}) is stale: {source}")]
struct StaleAggregateError {
    symbol: Symbol,
    rollup: Rollup,
    start_us: i64,
    end_us: i64,
    #[source]
    source: StorageError,
}

/// Sorted, disjoint half-open ranges of epoch microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RangeSet {
    ranges: Vec<(i64, i64)>,
}

impl RangeSet {
    fn insert(&mut self, start: i64, end: i64) {
        if start >= end {
            return;
        }
        self.ranges.push((start, end));
        self.ranges.sort_unstable();

        let mut merged: Vec<(i64, i64)> = Vec::with_capacity(self.ranges.len());
        for (start, end) in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        self.ranges = merged;
    }

    /// Remove and return the parts overlapping `[start, end)`.
    fn take(&mut self, start: i64, end: i64) -> Vec<(i64, i64)> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.ranges.len());
        for (range_start, range_end) in self.ranges.drain(..) {
            let low = range_start.max(start);
            let high = range_end.min(end);
            if low >= high {
                kept.push((range_start, range_end));
                continue;
            }
            taken.push((low, high));
            if range_start < low {
                kept.push((range_start, low));
            }
            if high < range_end {
                kept.push((high, range_end));
            }
        }
        kept.sort_unstable();
        self.ranges = kept;
        taken
    }

    fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    fn ranges(&self) -> &[(i64, i64)] {
        &self.ranges
    }
}

type RollupKey = (Symbol, Rollup);

#[derive(Debug, Default)]
struct RefreshState {
    dirty: HashMap<RollupKey, RangeSet>,
    watermarks: HashMap<(Symbol, Timeframe), i64>,
    /// Keys whose watermark moved since their last refresh.
    pending: HashSet<RollupKey>,
}

/// Maintains the configured rollups.
#[derive(Clone)]
pub struct AggregateEngine {
    store: BarStore,
    rollups: Arc<[Rollup]>,
    state: Arc<Mutex<RefreshState>>,
    /// Serializes claim, rebuild and write per key.
    refresh_locks: Arc<Mutex<HashMap<RollupKey, Arc<tokio::sync::Mutex<()>>>>>,
    cache: Option<QueryCache>,
}

impl AggregateEngine {
    pub fn new(store: BarStore, rollups: Vec<Rollup>) -> Self {
        let mut unique: Vec<Rollup> = Vec::with_capacity(rollups.len());
        for rollup in rollups {
            if !unique.contains(&rollup) {
                unique.push(rollup);
            }
        }
        Self {
            store,
            rollups: unique.into(),
            state: Arc::new(Mutex::new(RefreshState::default())),
            refresh_locks: Arc::new(Mutex::new(HashMap::new())),
            cache: None,
        }
    }

    /// Invalidate `cache` for every rebuilt window.
    pub fn with_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn rollups(&self) -> &[Rollup] {
        &self.rollups
    }

    /// The rollup producing `target`, if it is maintained.
    pub fn rollup_for(&self, target: Timeframe) -> Option<Rollup> {
        self.rollups.iter().copied().find(|rollup| rollup.to == target)
    }

    /// Record that source bars in `[start, end)` changed.
    pub fn mark_dirty(
        &self,
        symbol: &Symbol,
        source: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
    ) {
        let (start_us, end_us) = (start.unix_micros(), end.unix_micros());
        if start_us >= end_us {
            return;
        }
        let mut state = self.lock_state();
        for rollup in self.rollups.iter().filter(|rollup| rollup.from == source) {
            state
                .dirty
                .entry((symbol.clone(), *rollup))
                .or_default()
                .insert(start_us, end_us);
        }
    }

    /// Source data of `symbol` is complete through `through`.
    pub fn advance_watermark(&self, symbol: &Symbol, source: Timeframe, through: UtcDateTime) {
        let through_us = through.unix_micros();
        let mut state = self.lock_state();
        let watermark = state
            .watermarks
            .entry((symbol.clone(), source))
            .or_insert(i64::MIN);
        if through_us <= *watermark {
            return;
        }
        *watermark = through_us;
        for rollup in self.rollups.iter().filter(|rollup| rollup.from == source) {
            state.pending.insert((symbol.clone(), *rollup));
        }
    }

    pub fn watermark(&self, symbol: &Symbol, source: Timeframe) -> Option<UtcDateTime> {
        self.lock_state()
            .watermarks
            .get(&(symbol.clone(), source))
            .and_then(|micros| UtcDateTime::from_unix_micros(*micros).ok())
    }

    /// Dirty source ranges still waiting for `rollup`.
    pub fn dirty_ranges(&self, symbol: &Symbol, rollup: Rollup) -> Vec<(UtcDateTime, UtcDateTime)> {
        self.lock_state()
            .dirty
            .get(&(symbol.clone(), rollup))
            .map(|ranges| {
                ranges
                    .ranges()
                    .iter()
                    .filter_map(|(start, end)| {
                        Some((
                            UtcDateTime::from_unix_micros(*start).ok()?,
                            UtcDateTime::from_unix_micros(*end).ok()?,
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_pending_work(&self) -> bool {
        let state = self.lock_state();
        !state.pending.is_empty() || state.dirty.values().any(|ranges| !ranges.is_empty())
    }

    /// Rebuild buckets of `rollup.to` that overlap `[start, end)` and either
    /// a dirty source range or a stored open bucket, for every tracked symbol.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `rollup` is not maintained or the range
    /// is empty. Storage failures leave the affected windows dirty and are
    /// counted in [`RefreshReport::failed_windows`].
    pub async fn refresh(
        &self,
        rollup: Rollup,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<RefreshReport, ValidationError> {
        self.check_request(rollup, start, end)?;
        let symbols: Vec<Symbol> = {
            let state = self.lock_state();
            let mut symbols: Vec<Symbol> = state
                .dirty
                .keys()
                .chain(state.pending.iter())
                .filter(|(_, key_rollup)| *key_rollup == rollup)
                .map(|(symbol, _)| symbol.clone())
                .chain(
                    state
                        .watermarks
                        .keys()
                        .filter(|(_, source)| *source == rollup.from)
                        .map(|(symbol, _)| symbol.clone()),
                )
                .collect();
            symbols.sort();
            symbols.dedup();
            symbols
        };

        let bounds = Some((start.unix_micros(), end.unix_micros()));
        let mut report = RefreshReport::default();
        for symbol in symbols {
            report.absorb(self.refresh_key(&symbol, rollup, bounds).await);
        }
        Ok(report)
    }

    /// Like [`AggregateEngine::refresh`] for a single symbol.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `rollup` is not maintained or the range
    /// is empty.
    pub async fn refresh_symbol(
        &self,
        symbol: &Symbol,
        rollup: Rollup,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<RefreshReport, ValidationError> {
        self.check_request(rollup, start, end)?;
        Ok(self
            .refresh_key(symbol, rollup, Some((start.unix_micros(), end.unix_micros())))
            .await)
    }

    /// Rebuild every dirty or open bucket fed by `source` bars of `symbol`.
    pub async fn refresh_series(&self, symbol: &Symbol, source: Timeframe) -> RefreshReport {
        let mut report = RefreshReport::default();
        for rollup in self.rollups.iter().filter(|rollup| rollup.from == source) {
            report.absorb(self.refresh_key(symbol, *rollup, None).await);
        }
        report
    }

    /// Rebuild everything dirty or pending, for every rollup.
    pub async fn refresh_dirty(&self) -> RefreshReport {
        let keys: Vec<RollupKey> = {
            let state = self.lock_state();
            let mut keys: Vec<RollupKey> = state
                .dirty
                .iter()
                .filter(|(_, ranges)| !ranges.is_empty())
                .map(|(key, _)| key.clone())
                .chain(state.pending.iter().cloned())
                .collect();
            keys.sort_by(|left, right| {
                (&left.0, left.1.from, left.1.to).cmp(&(&right.0, right.1.from, right.1.to))
            });
            keys.dedup();
            keys
        };

        let mut report = RefreshReport::default();
        for (symbol, rollup) in keys {
            report.absorb(self.refresh_key(&symbol, rollup, None).await);
        }
        if report.windows_refreshed > 0 || report.failed_windows > 0 {
            tracing::info!(
                windows = report.windows_refreshed,
                buckets = report.buckets_written,
                failed = report.failed_windows,
                "aggregate refresh cycle finished"
            );
        }
        report
    }

    /// Run [`AggregateEngine::refresh_dirty`] every `period` until `cancel`.
    pub fn spawn_refresh_task(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let period = period.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.refresh_dirty().await;
                    }
                }
            }
            tracing::debug!("aggregate refresh task stopped");
        })
    }

    /// Stored buckets of `timeframe` starting in `[start, end)`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails or a row is invalid.
    pub async fn query(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
        closed_only: bool,
    ) -> Result<Vec<AggregateBar>, StorageError> {
        let symbol_key = symbol.as_str().to_owned();
        let (start_us, end_us) = (start.unix_micros(), end.unix_micros());
        let rows = self
            .store
            .run_blocking(move |warehouse| {
                warehouse.query_aggregates(
                    &symbol_key,
                    timeframe.as_str(),
                    start_us,
                    end_us,
                    closed_only,
                )
            })
            .await?;
        rows_to_aggregates(rows)
    }

    /// The `limit` newest buckets of `timeframe`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails or a row is invalid.
    pub async fn latest(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
        closed_only: bool,
    ) -> Result<Vec<AggregateBar>, StorageError> {
        let symbol_key = symbol.as_str().to_owned();
        let rows = self
            .store
            .run_blocking(move |warehouse| {
                warehouse.latest_aggregates(&symbol_key, timeframe.as_str(), limit, closed_only)
            })
            .await?;
        rows_to_aggregates(rows)
    }

    fn check_request(
        &self,
        rollup: Rollup,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<(), ValidationError> {
        if !self.rollups.contains(&rollup) {
            return Err(ValidationError::InvalidRollup {
                from: rollup.from.to_string(),
                to: rollup.to.to_string(),
            });
        }
        if start >= end {
            return Err(ValidationError::EmptyRange);
        }
        Ok(())
    }

    async fn refresh_key(
        &self,
        symbol: &Symbol,
        rollup: Rollup,
        bounds: Option<(i64, i64)>,
    ) -> RefreshReport {
        let lock = self.refresh_lock(symbol, rollup);
        let _guard = lock.lock().await;

        let (low, high) = bounds.unwrap_or((i64::MIN, i64::MAX));
        let claimed = self.claim(symbol, rollup, bounds);

        let open_buckets = match self.open_buckets(symbol, rollup.to).await {
            Ok(buckets) => buckets,
            Err(source) => {
                for (start, end) in claimed {
                    self.restore(symbol, rollup, start, end);
                }
                let error = StaleAggregateError {
                    symbol: symbol.clone(),
                    rollup,
                    start_us: low,
                    end_us: high,
                    source,
                };
                tracing::warn!(%error, "cannot list open aggregate buckets");
                return RefreshReport {
                    failed_windows: 1,
                    ..RefreshReport::default()
                };
            }
        };

        let mut windows = RangeSet::default();
        for (start, end) in claimed {
            let (start, end) = rollup.widen(start, end);
            windows.insert(start, end);
        }
        for (start, end) in open_buckets {
            if start < high && end > low {
                windows.insert(start, end);
            }
        }
        if windows.is_empty() {
            return RefreshReport::default();
        }

        let watermark = self.watermark_us(symbol, rollup.from).await;
        let mut report = RefreshReport::default();
        for &(start, end) in windows.ranges() {
            match self.rebuild_window(symbol, rollup, start, end, watermark).await {
                Ok(written) => {
                    report.windows_refreshed += 1;
                    report.buckets_written += written;
                    if let Some(cache) = &self.cache {
                        cache.invalidate_range(symbol, rollup.to, start, end).await;
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "aggregate window left dirty");
                    self.restore(symbol, rollup, start, end);
                    report.failed_windows += 1;
                }
            }
        }
        tracing::debug!(
            symbol = %symbol,
            rollup = %rollup,
            windows = report.windows_refreshed,
            buckets = report.buckets_written,
            "rollup refreshed"
        );
        report
    }

    fn refresh_lock(&self, symbol: &Symbol, rollup: Rollup) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .expect("refresh lock table should not be poisoned")
            .entry((symbol.clone(), rollup))
            .or_default()
            .clone()
    }

    async fn rebuild_window(
        &self,
        symbol: &Symbol,
        rollup: Rollup,
        start_us: i64,
        end_us: i64,
        watermark_us: Option<i64>,
    ) -> Result<usize, StaleAggregateError> {
        let stale = |source: StorageError| StaleAggregateError {
            symbol: symbol.clone(),
            rollup,
            start_us,
            end_us,
            source,
        };

        let start = UtcDateTime::from_unix_micros(start_us).map_err(|error| stale(error.into()))?;
        let end = UtcDateTime::from_unix_micros(end_us).map_err(|error| stale(error.into()))?;
        let bars = self
            .store
            .query(symbol, rollup.from, start, end)
            .await
            .map_err(stale)?;
        let rows = roll_up(&bars, rollup, watermark_us, self.store.price_scale());

        let symbol_key = symbol.as_str().to_owned();
        self.store
            .run_blocking(move |warehouse| {
                warehouse.replace_aggregate_window(
                    &symbol_key,
                    rollup.to.as_str(),
                    start_us,
                    end_us,
                    &rows,
                )
            })
            .await
            .map_err(stale)
    }

    async fn open_buckets(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Vec<(i64, i64)>, StorageError> {
        let symbol_key = symbol.as_str().to_owned();
        self.store
            .run_blocking(move |warehouse| {
                warehouse.open_aggregate_buckets(&symbol_key, timeframe.as_str())
            })
            .await
    }

    async fn watermark_us(&self, symbol: &Symbol, source: Timeframe) -> Option<i64> {
        let recorded = self
            .lock_state()
            .watermarks
            .get(&(symbol.clone(), source))
            .copied();
        let stored = match self.store.latest_bar_time(symbol, source).await {
            Ok(latest) => latest.map(|time| {
                time.unix_micros()
                    .saturating_add(source.duration_us())
            }),
            Err(error) => {
                tracing::debug!(symbol = %symbol, %error, "latest source bar unavailable");
                None
            }
        };
        recorded.max(stored)
    }

    fn claim(&self, symbol: &Symbol, rollup: Rollup, bounds: Option<(i64, i64)>) -> Vec<(i64, i64)> {
        let key = (symbol.clone(), rollup);
        let mut state = self.lock_state();
        let (low, high) = match bounds {
            Some(bounds) => bounds,
            None => {
                state.pending.remove(&key);
                (i64::MIN, i64::MAX)
            }
        };
        let Some(ranges) = state.dirty.get_mut(&key) else {
            return Vec::new();
        };
        let taken = ranges.take(low, high);
        if ranges.is_empty() {
            state.dirty.remove(&key);
        }
        taken
    }

    fn restore(&self, symbol: &Symbol, rollup: Rollup, start: i64, end: i64) {
        self.lock_state()
            .dirty
            .entry((symbol.clone(), rollup))
            .or_default()
            .insert(start, end);
    }

    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state
            .lock()
            .expect("aggregate refresh state should not be poisoned")
    }
}

/// Bucket ascending `bars` into `rollup.to` intervals.
pub(crate) fn roll_up(
    bars: &[Bar],
    rollup: Rollup,
    watermark_us: Option<i64>,
    price_scale: u32,
) -> Vec<AggregateRow> {
    bars.chunk_by(|left, right| {
        rollup.to.bucket_start_us(left.time.unix_micros())
            == rollup.to.bucket_start_us(right.time.unix_micros())
    })
    .filter_map(|bucket| bucket_row(bucket, rollup, watermark_us, price_scale))
    .collect()
}

fn bucket_row(
    bucket: &[Bar],
    rollup: Rollup,
    watermark_us: Option<i64>,
    price_scale: u32,
) -> Option<AggregateRow> {
    let (first, rest) = bucket.split_first()?;
    let last = rest.last().unwrap_or(first);
    let bucket_start_us = rollup.to.bucket_start_us(first.time.unix_micros());
    let bucket_end_us = bucket_start_us.saturating_add(rollup.to.duration_us());

    let high = bucket.iter().map(|bar| bar.high).fold(first.high, f64::max);
    let low = bucket.iter().map(|bar| bar.low).fold(first.low, f64::min);
    let volume = bucket
        .iter()
        .fold(0_i64, |total, bar| total.saturating_add(bar.volume));
    let trade_count = bucket
        .iter()
        .filter_map(|bar| bar.trade_count)
        .reduce(i64::saturating_add);

    let (weighted, weight) = bucket.iter().fold((0.0_f64, 0.0_f64), |(sum, weight), bar| {
        let price = bar
            .vwap
            .unwrap_or((bar.high + bar.low + bar.close) / 3.0);
        let shares = bar.volume as f64;
        (sum + price * shares, weight + shares)
    });
    let vwap = (weight > 0.0).then(|| round_to_scale(weighted / weight, price_scale));

    Some(AggregateRow {
        symbol: first.symbol.as_str().to_owned(),
        timeframe: rollup.to.as_str().to_owned(),
        source_timeframe: rollup.from.as_str().to_owned(),
        bucket_start_us,
        bucket_end_us,
        open: first.open,
        high,
        low,
        close: last.close,
        volume,
        trade_count,
        vwap,
        source_count: i64::try_from(bucket.len()).unwrap_or(i64::MAX),
        closed: watermark_us.is_some_and(|watermark| bucket_end_us <= watermark),
    })
}

fn row_to_aggregate(row: AggregateRow) -> Result<AggregateBar, ValidationError> {
    Ok(AggregateBar {
        bar: Bar {
            time: UtcDateTime::from_unix_micros(row.bucket_start_us)?,
            symbol: Symbol::parse(&row.symbol)?,
            timeframe: row.timeframe.parse()?,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
            trade_count: row.trade_count,
            vwap: row.vwap,
            source: ProviderId::Rollup,
        },
        bucket_end: UtcDateTime::from_unix_micros(row.bucket_end_us)?,
        source_timeframe: row.source_timeframe.parse()?,
        source_count: usize::try_from(row.source_count).unwrap_or_default(),
        closed: row.closed,
    })
}

fn rows_to_aggregates(rows: Vec<AggregateRow>) -> Result<Vec<AggregateBar>, StorageError> {
    rows.into_iter()
        .map(|row| row_to_aggregate(row).map_err(StorageError::from))
        .collect()
}
