//! Wiring of store, pipeline, monitor, rollups and queries from one config.

use std::sync::Arc;
use std::time::Duration;

use ohlcstore_warehouse::Warehouse;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::aggregate::AggregateEngine;
use crate::cache::QueryCache;
use crate::config::EngineConfig;
use crate::error::{CoreError, StorageError};
use crate::ingest::IngestionPipeline;
use crate::provider::ProviderAdapter;
use crate::quality::QualityMonitor;
use crate::query::QueryService;
use crate::reference::ReferenceData;
use crate::retry::RetryConfig;
use crate::store::{BarStore, MaintenanceReport};
use crate::throttling::ProviderPolicy;
use crate::{Timeframe, UtcDateTime};

/// An open ohlcstore database with every service attached.
pub struct Engine {
    config: EngineConfig,
    store: BarStore,
    cache: Option<QueryCache>,
    aggregates: AggregateEngine,
    pipeline: IngestionPipeline,
    quality: QualityMonitor,
    query: QueryService,
    refresh_cancel: CancellationToken,
    refresh_task: Option<JoinHandle<()>>,
    /// Stops the background refresh when the engine is dropped without `close`.
    _cancel_on_drop: DropGuard,
}

impl Engine {
    /// Open (and migrate) the database named by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if the config is invalid or the database
    /// cannot be opened.
    pub fn open(config: EngineConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let warehouse = Warehouse::open(config.storage.warehouse_config())?;
        let store = BarStore::new(warehouse).with_price_scale(config.storage.price_scale);

        let cache = config.cache.enabled.then(|| {
            QueryCache::new(
                Duration::from_secs(config.cache.ttl_secs),
                config.cache.max_entries,
            )
        });

        let mut aggregates = AggregateEngine::new(store.clone(), config.aggregates.rollups.clone());
        if let Some(cache) = &cache {
            aggregates = aggregates.with_cache(cache.clone());
        }

        let mut pipeline = IngestionPipeline::new(store.clone())
            .with_settings(config.ingestion.clone())
            .with_retry(RetryConfig::from(&config.retry))
            .with_aggregates(aggregates.clone(), config.aggregates.refresh_on_ingest);
        let mut query = QueryService::new(store.clone()).with_aggregates(aggregates.clone());
        if let Some(cache) = &cache {
            pipeline = pipeline.with_cache(cache.clone());
            query = query.with_cache(cache.clone());
        }
        let quality = QualityMonitor::new(store.clone(), config.quality.clone());

        let refresh_cancel = CancellationToken::new();
        let cancel_on_drop = refresh_cancel.clone().drop_guard();
        tracing::info!(
            db_path = %store.warehouse().db_path().display(),
            rollups = aggregates.rollups().len(),
            cache = cache.is_some(),
            "engine opened"
        );
        Ok(Self {
            config,
            store,
            cache,
            aggregates,
            pipeline,
            quality,
            query,
            refresh_cancel,
            refresh_task: None,
            _cancel_on_drop: cancel_on_drop,
        })
    }

    /// Register a provider with its default rate limit.
    pub fn with_provider(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.pipeline = self.pipeline.with_provider(adapter);
        self
    }

    pub fn with_provider_policy(
        mut self,
        adapter: Arc<dyn ProviderAdapter>,
        policy: &ProviderPolicy,
    ) -> Self {
        self.pipeline = self.pipeline.with_provider_policy(adapter, policy);
        self
    }

    pub fn with_reference(mut self, reference: Arc<dyn ReferenceData>) -> Self {
        self.pipeline = self.pipeline.with_reference(reference);
        self
    }

    /// Start the periodic rollup refresh if the config asks for one.
    /// Must be called inside a tokio runtime.
    pub fn start_background_refresh(&mut self) -> bool {
        if self.refresh_task.is_some() {
            return true;
        }
        let Some(period) = self.config.aggregates.refresh_interval() else {
            return false;
        };
        self.refresh_task = Some(
            self.aggregates
                .spawn_refresh_task(period, self.refresh_cancel.child_token()),
        );
        true
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &BarStore {
        &self.store
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub fn quality(&self) -> &QualityMonitor {
        &self.quality
    }

    pub fn aggregates(&self) -> &AggregateEngine {
        &self.aggregates
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn cache(&self) -> Option<&QueryCache> {
        self.cache.as_ref()
    }

    /// Compress and expire chunks per the storage policy, then drop every
    /// cached result.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if compression or retention fails.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, CoreError> {
        let policy = self.config.storage.lifecycle_policy();
        let report = self
            .store
            .run_maintenance(UtcDateTime::now(), &policy)
            .await?;
        if report.retention.rows_deleted > 0 {
            if let Some(cache) = &self.cache {
                for timeframe in Timeframe::ALL {
                    cache.invalidate_timeframe(timeframe).await;
                }
            }
        }
        Ok(report)
    }

    /// Stop background work, flush pending rollups and close the database.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if the final checkpoint fails.
    pub async fn close(mut self) -> Result<(), CoreError> {
        self.refresh_cancel.cancel();
        if let Some(task) = self.refresh_task.take() {
            if let Err(error) = task.await {
                tracing::warn!(%error, "aggregate refresh task ended abnormally");
            }
        }
        if self.aggregates.has_pending_work() {
            self.aggregates.refresh_dirty().await;
        }

        let warehouse = self.store.warehouse().clone();
        tokio::task::spawn_blocking(move || warehouse.close())
            .await
            .map_err(|error| StorageError::Task(error.to_string()))?
            .map_err(CoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use time::macros::datetime;

    use super::*;
    use crate::adapters::{synthetic_series, FixtureAdapter};
    use crate::reference::SymbolCatalog;
    use crate::{ProviderId, Symbol};

    fn in_memory_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.storage.db_path = Some(PathBuf::from(":memory:"));
        config
    }

    #[tokio::test]
    async fn minute_ingest_feeds_hourly_rollup_queries() {
        let adapter = Arc::new(FixtureAdapter::new(synthetic_series(
            datetime!(2024-03-04 14:00 UTC),
            Timeframe::OneMinute,
            120,
        )));
        let engine = Engine::open(in_memory_config())
            .expect("open")
            .with_provider(adapter);
        let symbol = Symbol::parse("AAPL").expect("symbol");
        let start = UtcDateTime::from_any_offset(datetime!(2024-03-04 14:00 UTC));
        let end = UtcDateTime::from_any_offset(datetime!(2024-03-04 16:00 UTC));

        let job = engine
            .pipeline()
            .ingest(symbol.clone(), Timeframe::OneMinute, start, end, ProviderId::Fixture)
            .await
            .expect("ingest");
        assert_eq!(job.rows_inserted, 120);

        let hourly = engine
            .query()
            .get_bars(&symbol, Timeframe::OneHour, start, end)
            .await
            .expect("hourly bars");
        assert_eq!(hourly.len(), 2);
        assert!(hourly.iter().all(|bar| bar.source == ProviderId::Rollup));

        engine.close().await.expect("close");
    }

    #[tokio::test]
    async fn dropping_a_wired_engine_stops_background_refresh() {
        let mut config = in_memory_config();
        config.aggregates.refresh_interval_secs = 3_600;
        let mut engine = Engine::open(config)
            .expect("open")
            .with_provider(Arc::new(FixtureAdapter::new(Vec::new())))
            .with_reference(Arc::new(SymbolCatalog::new(Vec::new())));
        assert!(engine.start_background_refresh());
        let cancel = engine.refresh_cancel.clone();

        drop(engine);

        assert!(cancel.is_cancelled());
    }

    #[test]
    fn open_rejects_invalid_config() {
        let mut config = in_memory_config();
        config.ingestion.worker_pool_size = 0;
        assert!(matches!(Engine::open(config), Err(CoreError::Config(_))));
    }
}
