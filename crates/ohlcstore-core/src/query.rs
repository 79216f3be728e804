//! Query Service: cached reads that prefer maintained rollups.

use std::collections::BTreeMap;

use crate::aggregate::AggregateEngine;
use crate::cache::{CacheKey, QueryCache};
use crate::error::{CoreError, StorageError};
use crate::store::BarStore;
use crate::{Bar, Symbol, Timeframe, UtcDateTime, ValidationError};

/// Read side of the engine. Results are ascending and never gap-filled.
#[derive(Clone)]
pub struct QueryService {
    store: BarStore,
    aggregates: Option<AggregateEngine>,
    cache: Option<QueryCache>,
}

impl QueryService {
    pub fn new(store: BarStore) -> Self {
        Self {
            store,
            aggregates: None,
            cache: None,
        }
    }

    /// Serve closed rollup buckets for timeframes `aggregates` maintains.
    pub fn with_aggregates(mut self, aggregates: AggregateEngine) -> Self {
        self.aggregates = Some(aggregates);
        self
    }

    pub fn with_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Bars with `start <= time < end`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] for an empty range or a storage failure.
    pub async fn get_bars(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<Vec<Bar>, CoreError> {
        if start >= end {
            return Err(ValidationError::EmptyRange.into());
        }

        let Some(cache) = &self.cache else {
            return Ok(self.read_range(symbol, timeframe, start, end).await?);
        };

        let key = CacheKey::new(
            symbol.clone(),
            timeframe,
            start.unix_micros(),
            end.unix_micros(),
        );
        if let Some(bars) = cache.get(&key).await {
            tracing::trace!(symbol = %symbol, timeframe = %timeframe, "query cache hit");
            return Ok(bars);
        }

        let observed = cache.generation(symbol, timeframe).await;
        let bars = self.read_range(symbol, timeframe, start, end).await?;
        cache.put(key, bars.clone(), observed).await;
        Ok(bars)
    }

    /// [`QueryService::get_bars`] for each distinct symbol.
    ///
    /// # Errors
    ///
    /// Returns the first [`CoreError`].
    pub async fn get_multi(
        &self,
        symbols: &[Symbol],
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<BTreeMap<Symbol, Vec<Bar>>, CoreError> {
        let mut result = BTreeMap::new();
        for symbol in symbols {
            if result.contains_key(symbol) {
                continue;
            }
            let bars = self.get_bars(symbol, timeframe, start, end).await?;
            result.insert(symbol.clone(), bars);
        }
        Ok(result)
    }

    /// The `count` most recent bars.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] on a storage failure.
    pub async fn get_latest(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, CoreError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if let Some(aggregates) = self.rollup_source(timeframe) {
            let buckets = aggregates.latest(symbol, timeframe, count, true).await?;
            if !buckets.is_empty() {
                return Ok(buckets.into_iter().map(|bucket| bucket.bar).collect());
            }
        }
        Ok(self.store.latest(symbol, timeframe, count).await?)
    }

    fn rollup_source(&self, timeframe: Timeframe) -> Option<&AggregateEngine> {
        self.aggregates
            .as_ref()
            .filter(|aggregates| aggregates.rollup_for(timeframe).is_some())
    }

    async fn read_range(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<Vec<Bar>, StorageError> {
        if let Some(aggregates) = self.rollup_source(timeframe) {
            let buckets = aggregates
                .query(symbol, timeframe, start, end, true)
                .await?;
            if !buckets.is_empty() {
                return Ok(buckets.into_iter().map(|bucket| bucket.bar).collect());
            }
        }
        self.store.query(symbol, timeframe, start, end).await
    }
}
