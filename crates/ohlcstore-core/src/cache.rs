//! In-memory cache for query results.
//!
//! Entries are keyed by `(symbol, timeframe, start, end)` and expire after a
//! TTL. Writers invalidate every entry whose window overlaps the written
//! range and bump a per-series generation; a reader that captured the
//! generation before querying can only populate the cache if no write
//! happened in between.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{Bar, Symbol, Timeframe};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub start_us: i64,
    pub end_us: i64,
}

impl CacheKey {
    pub fn new(symbol: Symbol, timeframe: Timeframe, start_us: i64, end_us: i64) -> Self {
        Self {
            symbol,
            timeframe,
            start_us,
            end_us,
        }
    }

    fn overlaps(&self, start_us: i64, end_us: i64) -> bool {
        self.start_us < end_us && start_us < self.end_us
    }
}

/// Snapshot of write counters observed before a query ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    series: u64,
    timeframe: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    bars: Vec<Bar>,
    expires_at: Instant,
}

#[derive(Debug)]
struct CacheInner {
    map: HashMap<CacheKey, CacheEntry>,
    series_generations: HashMap<(Symbol, Timeframe), u64>,
    timeframe_generations: HashMap<Timeframe, u64>,
    default_ttl: Duration,
    max_entries: usize,
}

impl CacheInner {
    fn generation(&self, symbol: &Symbol, timeframe: Timeframe) -> Generation {
        Generation {
            series: self
                .series_generations
                .get(&(symbol.clone(), timeframe))
                .copied()
                .unwrap_or(0),
            timeframe: self
                .timeframe_generations
                .get(&timeframe)
                .copied()
                .unwrap_or(0),
        }
    }

    fn bump_series(&mut self, symbol: &Symbol, timeframe: Timeframe) {
        let counter = self
            .series_generations
            .entry((symbol.clone(), timeframe))
            .or_insert(0);
        *counter = counter.wrapping_add(1);
    }

    fn make_room(&mut self) {
        if self.map.len() < self.max_entries {
            return;
        }
        let now = Instant::now();
        self.map.retain(|_, entry| entry.expires_at > now);
        while self.map.len() >= self.max_entries {
            let Some(oldest) = self
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.map.remove(&oldest);
        }
    }
}

/// Thread-safe TTL cache of query results.
#[derive(Debug, Clone)]
pub struct QueryCache {
    inner: Arc<tokio::sync::RwLock<CacheInner>>,
}

impl QueryCache {
    pub fn new(default_ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(CacheInner {
                map: HashMap::new(),
                series_generations: HashMap::new(),
                timeframe_generations: HashMap::new(),
                default_ttl,
                max_entries: max_entries.max(1),
            })),
        }
    }

    /// Five minute TTL, 10k entries.
    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(300), 10_000)
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, 1)
    }

    pub async fn is_disabled(&self) -> bool {
        self.inner.read().await.default_ttl == Duration::ZERO
    }

    /// Unexpired bars for `key`, if any.
    pub async fn get(&self, key: &CacheKey) -> Option<Vec<Bar>> {
        let store = self.inner.read().await;
        store
            .map
            .get(key)
            .filter(|entry| Instant::now() <= entry.expires_at)
            .map(|entry| entry.bars.clone())
    }

    /// Capture before querying, hand back to [`QueryCache::put`].
    pub async fn generation(&self, symbol: &Symbol, timeframe: Timeframe) -> Generation {
        self.inner.read().await.generation(symbol, timeframe)
    }

    /// Store `bars` unless a write to the series happened since `observed`.
    /// Returns whether the entry was stored.
    pub async fn put(&self, key: CacheKey, bars: Vec<Bar>, observed: Generation) -> bool {
        let mut store = self.inner.write().await;
        if store.default_ttl == Duration::ZERO {
            return false;
        }
        if store.generation(&key.symbol, key.timeframe) != observed {
            return false;
        }

        store.make_room();
        let expires_at = Instant::now() + store.default_ttl;
        store.map.insert(key, CacheEntry { bars, expires_at });
        true
    }

    /// Drop entries of one series overlapping `[start_us, end_us)`.
    pub async fn invalidate_range(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start_us: i64,
        end_us: i64,
    ) -> usize {
        let mut store = self.inner.write().await;
        store.bump_series(symbol, timeframe);
        let before = store.map.len();
        store.map.retain(|key, _| {
            !(key.symbol == *symbol
                && key.timeframe == timeframe
                && key.overlaps(start_us, end_us))
        });
        before - store.map.len()
    }

    /// Drop every entry of `timeframe`, across all symbols.
    pub async fn invalidate_timeframe(&self, timeframe: Timeframe) -> usize {
        let mut store = self.inner.write().await;
        let counter = store.timeframe_generations.entry(timeframe).or_insert(0);
        *counter = counter.wrapping_add(1);
        let before = store.map.len();
        store.map.retain(|key, _| key.timeframe != timeframe);
        before - store.map.len()
    }

    pub async fn clear_expired(&self) {
        let now = Instant::now();
        self.inner
            .write()
            .await
            .map
            .retain(|_, entry| entry.expires_at > now);
    }

    pub async fn clear(&self) {
        self.inner.write().await.map.clear();
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ProviderId, UtcDateTime};

    const DAY_US: i64 = 86_400_000_000;

    fn key(symbol: &str, start_day: i64, end_day: i64) -> CacheKey {
        CacheKey::new(
            Symbol::parse(symbol).expect("symbol"),
            Timeframe::OneDay,
            start_day * DAY_US,
            end_day * DAY_US,
        )
    }

    fn bars() -> Vec<Bar> {
        vec![Bar::new(
            UtcDateTime::from_unix_micros(DAY_US).expect("time"),
            Symbol::parse("AAPL").expect("symbol"),
            Timeframe::OneDay,
            10.0,
            11.0,
            9.0,
            10.5,
            100,
            ProviderId::Fixture,
        )
        .expect("bar")]
    }

    #[tokio::test]
    async fn stores_and_expires_entries() {
        let cache = QueryCache::new(Duration::from_millis(100), 16);
        let key = key("AAPL", 0, 10);
        let generation = cache.generation(&key.symbol, key.timeframe).await;

        assert!(cache.put(key.clone(), bars(), generation).await);
        assert_eq!(cache.get(&key).await, Some(bars()));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get(&key).await.is_none());
        cache.clear_expired().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn invalidation_drops_only_overlapping_windows() {
        let cache = QueryCache::with_default_ttl();
        for key in [key("AAPL", 0, 10), key("AAPL", 20, 30), key("MSFT", 0, 10)] {
            let generation = cache.generation(&key.symbol, key.timeframe).await;
            cache.put(key, bars(), generation).await;
        }

        let symbol = Symbol::parse("AAPL").expect("symbol");
        let removed = cache
            .invalidate_range(&symbol, Timeframe::OneDay, 5 * DAY_US, 6 * DAY_US)
            .await;

        assert_eq!(removed, 1);
        assert!(cache.get(&key("AAPL", 0, 10)).await.is_none());
        assert!(cache.get(&key("AAPL", 20, 30)).await.is_some());
        assert!(cache.get(&key("MSFT", 0, 10)).await.is_some());
    }

    #[tokio::test]
    async fn read_racing_a_write_cannot_repopulate() {
        let cache = QueryCache::with_default_ttl();
        let key = key("AAPL", 0, 10);
        let before_write = cache.generation(&key.symbol, key.timeframe).await;

        cache
            .invalidate_range(&key.symbol, key.timeframe, 0, DAY_US)
            .await;

        assert!(!cache.put(key.clone(), bars(), before_write).await);
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn timeframe_invalidation_applies_to_unseen_series() {
        let cache = QueryCache::with_default_ttl();
        let key = key("NVDA", 0, 10);
        let before_refresh = cache.generation(&key.symbol, key.timeframe).await;

        cache.invalidate_timeframe(Timeframe::OneDay).await;

        assert!(!cache.put(key, bars(), before_refresh).await);
    }

    #[tokio::test]
    async fn evicts_when_full_and_ignores_puts_when_disabled() {
        let cache = QueryCache::new(Duration::from_secs(60), 2);
        for day in 0..3 {
            let key = key("AAPL", day * 10, day * 10 + 5);
            let generation = cache.generation(&key.symbol, key.timeframe).await;
            cache.put(key, bars(), generation).await;
        }
        assert_eq!(cache.len().await, 2);

        let disabled = QueryCache::disabled();
        let key = key("AAPL", 0, 1);
        let generation = disabled.generation(&key.symbol, key.timeframe).await;
        assert!(disabled.is_disabled().await);
        assert!(!disabled.put(key, bars(), generation).await);
    }
}
