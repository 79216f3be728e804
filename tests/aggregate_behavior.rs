//! Behavior-driven tests for rollup maintenance
//!
//! These tests verify that coarser bars derived from minute data match a
//! recomputation from the source bars, follow late corrections and only
//! report buckets as closed once their source data is complete.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ohlcstore_core::adapters::{synthetic_series, FixtureAdapter};
use ohlcstore_core::provider::RawBar;
use ohlcstore_core::store::BarStore;
use ohlcstore_core::{
    round_to_scale, AggregateEngine, Bar, IngestionPipeline, ProviderId, Rollup, Symbol,
    Timeframe, UtcDateTime, ValidationError,
};
use ohlcstore_warehouse::{Warehouse, WarehouseConfig, MICROS_PER_DAY};
use tempfile::tempdir;
use time::macros::datetime;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

const SESSION_OPEN: OffsetDateTime = datetime!(2024-03-04 00:00 UTC);

fn open_store(dir: &Path) -> BarStore {
    BarStore::new(
        Warehouse::open(WarehouseConfig {
            home: dir.to_path_buf(),
            db_path: dir.join("rollups.duckdb"),
            max_pool_size: 4,
            chunk_width_us: 7 * MICROS_PER_DAY,
        })
        .expect("warehouse open"),
    )
}

fn at(hours: i64, minutes: i64) -> UtcDateTime {
    UtcDateTime::from_any_offset(
        SESSION_OPEN + time::Duration::hours(hours) + time::Duration::minutes(minutes),
    )
}

fn symbol() -> Symbol {
    Symbol::parse("AAPL").expect("symbol")
}

fn rollup(from: Timeframe, to: Timeframe) -> Rollup {
    Rollup::new(from, to).expect("rollup")
}

fn minute_feed(count: usize) -> Arc<FixtureAdapter> {
    Arc::new(FixtureAdapter::new(synthetic_series(
        SESSION_OPEN,
        Timeframe::OneMinute,
        count,
    )))
}

// =============================================================================
// Aggregates: Correctness
// =============================================================================

#[tokio::test]
async fn when_a_full_day_of_minutes_is_ingested_the_daily_bar_matches_a_recompute() {
    // Given: A pipeline that refreshes rollups after each job
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let daily = rollup(Timeframe::OneMinute, Timeframe::OneDay);
    let aggregates = AggregateEngine::new(store.clone(), vec![daily]);
    let pipeline = IngestionPipeline::new(store.clone())
        .with_provider(minute_feed(1_440))
        .with_aggregates(aggregates.clone(), true);

    // When: All 1440 minutes of the day are ingested
    let job = pipeline
        .ingest(symbol(), Timeframe::OneMinute, at(0, 0), at(24, 0), ProviderId::Fixture)
        .await
        .expect("ingest");
    assert_eq!(job.rows_inserted, 1_440);

    // Then: One closed daily bucket equals the manual recomputation
    let buckets = aggregates
        .query(&symbol(), Timeframe::OneDay, at(0, 0), at(24, 0), true)
        .await
        .expect("aggregates");
    assert_eq!(buckets.len(), 1);
    let bucket = &buckets[0];

    let minutes: Vec<Bar> = store
        .query(&symbol(), Timeframe::OneMinute, at(0, 0), at(24, 0))
        .await
        .expect("minutes");
    let high = minutes.iter().map(|bar| bar.high).fold(f64::MIN, f64::max);
    let low = minutes.iter().map(|bar| bar.low).fold(f64::MAX, f64::min);
    let volume: i64 = minutes.iter().map(|bar| bar.volume).sum();
    let weighted: f64 = minutes
        .iter()
        .map(|bar| (bar.high + bar.low + bar.close) / 3.0 * bar.volume as f64)
        .sum();
    let vwap = round_to_scale(weighted / volume as f64, store.price_scale());

    assert!(bucket.closed);
    assert_eq!(bucket.source_count, 1_440);
    assert_eq!(bucket.source_timeframe, Timeframe::OneMinute);
    assert_eq!(bucket.bucket_start(), at(0, 0));
    assert_eq!(bucket.bucket_end, at(24, 0));
    assert!((bucket.bar.open - minutes[0].open).abs() < 1e-9);
    assert!((bucket.bar.close - minutes[1_439].close).abs() < 1e-9);
    assert!((bucket.bar.high - high).abs() < 1e-9);
    assert!((bucket.bar.low - low).abs() < 1e-9);
    assert_eq!(bucket.bar.volume, volume);
    assert_eq!(bucket.bar.trade_count, Some(14_400));
    assert!(bucket
        .bar
        .vwap
        .is_some_and(|stored| (stored - vwap).abs() < 1e-6));
    assert_eq!(bucket.bar.source, ProviderId::Rollup);
}

#[tokio::test]
async fn when_a_late_correction_arrives_the_affected_bucket_is_rebuilt() {
    // Given: Two hours of minute bars rolled into hourly buckets
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let hourly = rollup(Timeframe::OneMinute, Timeframe::OneHour);
    let aggregates = AggregateEngine::new(store.clone(), vec![hourly]);
    let bars: Vec<Bar> = (0..120)
        .map(|minute| {
            Bar::new(
                at(0, minute),
                symbol(),
                Timeframe::OneMinute,
                50.0,
                51.0,
                49.0,
                50.5,
                100,
                ProviderId::Fixture,
            )
            .expect("bar")
        })
        .collect();
    store.upsert(bars).await.expect("upsert");
    aggregates.mark_dirty(&symbol(), Timeframe::OneMinute, at(0, 0), at(2, 0));
    aggregates.advance_watermark(&symbol(), Timeframe::OneMinute, at(2, 0));
    let first = aggregates.refresh_dirty().await;
    assert_eq!(first.buckets_written, 2);

    // When: One minute of the second hour is corrected upwards
    let correction = Bar::new(
        at(1, 30),
        symbol(),
        Timeframe::OneMinute,
        50.0,
        80.0,
        49.0,
        50.5,
        100,
        ProviderId::Fixture,
    )
    .expect("bar");
    store.upsert(vec![correction]).await.expect("correction");
    aggregates.mark_dirty(&symbol(), Timeframe::OneMinute, at(1, 30), at(1, 31));
    assert_eq!(aggregates.dirty_ranges(&symbol(), hourly).len(), 1);
    let report = aggregates
        .refresh_symbol(&symbol(), hourly, at(0, 0), at(2, 0))
        .await
        .expect("refresh");

    // Then: Only the second hour changed and nothing is left dirty
    assert_eq!(report.windows_refreshed, 1);
    assert!(aggregates.dirty_ranges(&symbol(), hourly).is_empty());
    let buckets = aggregates
        .query(&symbol(), Timeframe::OneHour, at(0, 0), at(2, 0), true)
        .await
        .expect("aggregates");
    assert_eq!(buckets.len(), 2);
    assert!((buckets[0].bar.high - 51.0).abs() < 1e-9);
    assert!((buckets[1].bar.high - 80.0).abs() < 1e-9);
}

#[tokio::test]
async fn when_source_data_is_incomplete_the_last_bucket_stays_open() {
    // Given: Ninety minutes of data
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let hourly = rollup(Timeframe::OneMinute, Timeframe::OneHour);
    let aggregates = AggregateEngine::new(store.clone(), vec![hourly]);
    let pipeline = IngestionPipeline::new(store)
        .with_provider(minute_feed(120))
        .with_aggregates(aggregates.clone(), true);
    pipeline
        .ingest(symbol(), Timeframe::OneMinute, at(0, 0), at(1, 30), ProviderId::Fixture)
        .await
        .expect("first ingest");

    // When: Readers ask for closed buckets only
    let closed = aggregates
        .query(&symbol(), Timeframe::OneHour, at(0, 0), at(2, 0), true)
        .await
        .expect("closed");
    let all = aggregates
        .query(&symbol(), Timeframe::OneHour, at(0, 0), at(2, 0), false)
        .await
        .expect("all");

    // Then: The partial second hour is visible only as an open bucket
    assert_eq!(closed.len(), 1);
    assert_eq!(all.len(), 2);
    assert!(!all[1].closed);
    assert_eq!(all[1].source_count, 30);

    // When: The rest of the hour arrives
    pipeline
        .ingest(symbol(), Timeframe::OneMinute, at(1, 30), at(2, 0), ProviderId::Fixture)
        .await
        .expect("second ingest");

    // Then: Both buckets are closed and complete
    let closed = aggregates
        .query(&symbol(), Timeframe::OneHour, at(0, 0), at(2, 0), true)
        .await
        .expect("closed");
    assert_eq!(closed.len(), 2);
    assert_eq!(closed[1].source_count, 60);
    assert!(!aggregates.has_pending_work());
}

#[tokio::test]
async fn when_a_trailing_bar_is_rejected_only_the_written_span_is_dirty() {
    // Given: Three minutes from the provider, the last with high < low
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let hourly = rollup(Timeframe::OneMinute, Timeframe::OneHour);
    let aggregates = AggregateEngine::new(store.clone(), vec![hourly]);
    let mut raw = synthetic_series(SESSION_OPEN, Timeframe::OneMinute, 3);
    raw[2] = RawBar {
        high: 1.0,
        low: 2.0,
        ..raw[2].clone()
    };
    let pipeline = IngestionPipeline::new(store)
        .with_provider(Arc::new(FixtureAdapter::new(raw)))
        .with_aggregates(aggregates.clone(), false);

    // When: The three minutes are ingested
    let job = pipeline
        .ingest(symbol(), Timeframe::OneMinute, at(0, 0), at(0, 3), ProviderId::Fixture)
        .await
        .expect("ingest");

    // Then: The dirty range ends where the last accepted bar ends
    assert_eq!(job.rows_inserted, 2);
    assert_eq!(job.rows_rejected, 1);
    assert_eq!(
        aggregates.dirty_ranges(&symbol(), hourly),
        vec![(at(0, 0), at(0, 2))]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn when_refreshes_overlap_a_stream_of_corrections_the_bucket_ends_current() {
    // Given: An hour of minute bars already rolled up
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let hourly = rollup(Timeframe::OneMinute, Timeframe::OneHour);
    let aggregates = AggregateEngine::new(store.clone(), vec![hourly]);
    let minute = |minute: i64, high: f64| {
        Bar::new(
            at(0, minute),
            symbol(),
            Timeframe::OneMinute,
            50.0,
            high,
            49.0,
            50.5,
            100,
            ProviderId::Fixture,
        )
        .expect("bar")
    };
    store
        .upsert((0..60).map(|index| minute(index, 51.0)).collect())
        .await
        .expect("upsert");
    aggregates.mark_dirty(&symbol(), Timeframe::OneMinute, at(0, 0), at(1, 0));
    aggregates.advance_watermark(&symbol(), Timeframe::OneMinute, at(1, 0));
    aggregates.refresh_dirty().await;

    // When: Corrections land while two refresh loops run side by side
    let done = CancellationToken::new();
    let refreshers: Vec<_> = (0..2)
        .map(|_| {
            let aggregates = aggregates.clone();
            let done = done.clone();
            tokio::spawn(async move {
                while !done.is_cancelled() {
                    aggregates.refresh_dirty().await;
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for step in 1..=20_i32 {
        store
            .upsert(vec![minute(30, 60.0 + f64::from(step))])
            .await
            .expect("correction");
        aggregates.mark_dirty(&symbol(), Timeframe::OneMinute, at(0, 30), at(0, 31));
        tokio::task::yield_now().await;
    }
    done.cancel();
    for refresher in refreshers {
        refresher.await.expect("refresh loop");
    }
    aggregates.refresh_dirty().await;

    // Then: The bucket carries the last correction and nothing is left dirty
    let buckets = aggregates
        .query(&symbol(), Timeframe::OneHour, at(0, 0), at(1, 0), false)
        .await
        .expect("aggregates");
    assert_eq!(buckets.len(), 1);
    assert!((buckets[0].bar.high - 80.0).abs() < 1e-9);
    assert!(aggregates.dirty_ranges(&symbol(), hourly).is_empty());
}

// =============================================================================
// Aggregates: Configuration and Background Refresh
// =============================================================================

#[test]
fn when_a_rollup_target_is_not_a_multiple_of_its_source_it_is_rejected() {
    assert!(matches!(
        Rollup::new(Timeframe::OneHour, Timeframe::OneMinute),
        Err(ValidationError::InvalidRollup { .. })
    ));
    assert!(Rollup::new(Timeframe::OneDay, Timeframe::OneWeek).is_ok());
    assert!(Rollup::new(Timeframe::FiveMinutes, Timeframe::FourHours).is_ok());
}

#[tokio::test]
async fn when_refresh_targets_an_unmaintained_rollup_it_is_rejected() {
    let temp = tempdir().expect("tempdir");
    let aggregates = AggregateEngine::new(open_store(temp.path()), Rollup::defaults());
    let result = aggregates
        .refresh(
            rollup(Timeframe::OneHour, Timeframe::OneDay),
            at(0, 0),
            at(24, 0),
        )
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn when_background_refresh_runs_dirty_ranges_are_rolled_up_without_a_reader() {
    // Given: A pipeline that only marks rollups dirty
    let temp = tempdir().expect("tempdir");
    let store = open_store(temp.path());
    let hourly = rollup(Timeframe::OneMinute, Timeframe::OneHour);
    let aggregates = AggregateEngine::new(store.clone(), vec![hourly]);
    let pipeline = IngestionPipeline::new(store)
        .with_provider(minute_feed(60))
        .with_aggregates(aggregates.clone(), false);
    pipeline
        .ingest(symbol(), Timeframe::OneMinute, at(0, 0), at(1, 0), ProviderId::Fixture)
        .await
        .expect("ingest");
    assert!(aggregates.has_pending_work());

    // When: The periodic task is started
    let cancel = CancellationToken::new();
    let task = aggregates.spawn_refresh_task(Duration::from_millis(20), cancel.clone());
    let mut buckets = Vec::new();
    for _ in 0..100 {
        buckets = aggregates
            .query(&symbol(), Timeframe::OneHour, at(0, 0), at(1, 0), true)
            .await
            .expect("aggregates");
        if !buckets.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cancel.cancel();
    task.await.expect("refresh task");

    // Then: The hour was rolled up in the background
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].source_count, 60);
}
