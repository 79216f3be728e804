//! Ingestion Pipeline: provider fetch, normalization, upsert and audit.
//!
//! One job covers one `(symbol, timeframe, [start, end), provider)` window.
//! The provider call is the only network wait; it is gated by a per-provider
//! rate limiter and retried on transient errors. Writes to one series are
//! serialized by a keyed async mutex. Every job, failed or not, leaves an
//! [`IngestionJobRecord`] in the audit table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ohlcstore_warehouse::JobRow;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::AggregateEngine;
use crate::cache::QueryCache;
use crate::config::IngestionSettings;
use crate::error::{CoreError, StorageError};
use crate::provider::{FetchRequest, ProviderAdapter, ProviderError, RawBar};
use crate::reference::{AllowAllSymbols, ReferenceData};
use crate::retry::{retry_provider_call, RetryConfig};
use crate::store::{BarStore, UpsertReport};
use crate::throttling::{ProviderPolicy, ThrottlingQueue};
use crate::{
    bounded_error_detail, Bar, IngestionJobRecord, JobStatus, ProviderId, Symbol, Timeframe,
    UtcDateTime, ValidationError,
};

/// One ingestion job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub start: UtcDateTime,
    pub end: UtcDateTime,
    pub provider: ProviderId,
}

impl IngestRequest {
    pub fn new(
        symbol: Symbol,
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
        provider: ProviderId,
    ) -> Self {
        Self {
            symbol,
            timeframe,
            start,
            end,
            provider,
        }
    }
}

/// Outcome of a split backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// One record per attempted sub-range, in time order.
    pub jobs: Vec<IngestionJobRecord>,
    /// End of the last sub-range that finished without failing.
    pub completed_through: Option<UtcDateTime>,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl BackfillReport {
    pub fn rows_written(&self) -> usize {
        self.jobs.iter().map(IngestionJobRecord::rows_written).sum()
    }

    pub fn failed_jobs(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.status == JobStatus::Failed)
            .count()
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && !self.timed_out && self.failed_jobs() == 0
    }
}

struct ProviderSlot {
    adapter: Arc<dyn ProviderAdapter>,
    throttle: ThrottlingQueue,
}

type SeriesLocks = HashMap<(Symbol, Timeframe), Arc<tokio::sync::Mutex<()>>>;

/// What a job did before its audit record is written.
#[derive(Debug, Default)]
struct JobOutcome {
    inserted: usize,
    updated: usize,
    rejected: usize,
    retries: u32,
    error: Option<String>,
    rejection_note: Option<String>,
}

impl JobOutcome {
    fn failed(error: impl ToString, retries: u32) -> Self {
        Self {
            retries,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    fn status(&self) -> JobStatus {
        let written = self.inserted + self.updated;
        if self.error.is_some() || (self.rejected > 0 && written == 0) {
            JobStatus::Failed
        } else if self.rejected > 0 {
            JobStatus::Partial
        } else {
            JobStatus::Success
        }
    }

    fn detail(&self) -> Option<&str> {
        self.error.as_deref().or(self.rejection_note.as_deref())
    }
}

/// Runs ingestion jobs against registered providers.
#[derive(Clone)]
pub struct IngestionPipeline {
    store: BarStore,
    providers: Arc<HashMap<ProviderId, Arc<ProviderSlot>>>,
    reference: Arc<dyn ReferenceData>,
    retry: RetryConfig,
    aggregates: Option<AggregateEngine>,
    refresh_on_ingest: bool,
    cache: Option<QueryCache>,
    series_locks: Arc<Mutex<SeriesLocks>>,
    workers: Arc<Semaphore>,
    settings: IngestionSettings,
}

impl IngestionPipeline {
    pub fn new(store: BarStore) -> Self {
        let settings = IngestionSettings::default();
        Self {
            store,
            providers: Arc::new(HashMap::new()),
            reference: Arc::new(AllowAllSymbols),
            retry: RetryConfig::default(),
            aggregates: None,
            refresh_on_ingest: false,
            cache: None,
            series_locks: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
            settings,
        }
    }

    /// Register `adapter` with its provider's default rate limit.
    pub fn with_provider(self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        let policy = ProviderPolicy::default_for(adapter.id());
        self.with_provider_policy(adapter, &policy)
    }

    pub fn with_provider_policy(
        mut self,
        adapter: Arc<dyn ProviderAdapter>,
        policy: &ProviderPolicy,
    ) -> Self {
        let slot = ProviderSlot {
            throttle: ThrottlingQueue::from_policy(policy),
            adapter,
        };
        Arc::make_mut(&mut self.providers).insert(slot.adapter.id(), Arc::new(slot));
        self
    }

    pub fn with_reference(mut self, reference: Arc<dyn ReferenceData>) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Mark rollups dirty after each write; refresh them before returning
    /// when `refresh_on_ingest` is set.
    pub fn with_aggregates(mut self, aggregates: AggregateEngine, refresh_on_ingest: bool) -> Self {
        self.aggregates = Some(aggregates);
        self.refresh_on_ingest = refresh_on_ingest;
        self
    }

    pub fn with_cache(mut self, cache: QueryCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_settings(mut self, settings: IngestionSettings) -> Self {
        self.workers = Arc::new(Semaphore::new(settings.worker_pool_size.max(1)));
        self.settings = settings;
        self
    }

    pub fn providers(&self) -> Vec<ProviderId> {
        let mut providers: Vec<ProviderId> = self.providers.keys().copied().collect();
        providers.sort_by_key(|provider| provider.as_str());
        providers
    }

    pub fn store(&self) -> &BarStore {
        &self.store
    }

    /// Fetch `[start, end)` from `provider` and store it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] only when the audit record cannot be written.
    /// Provider, validation and storage failures are reported through the
    /// returned record's status and `error_detail`.
    pub async fn ingest(
        &self,
        symbol: Symbol,
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
        provider: ProviderId,
    ) -> Result<IngestionJobRecord, CoreError> {
        self.run(IngestRequest::new(symbol, timeframe, start, end, provider))
            .await
    }

    /// Run one job on the worker pool.
    ///
    /// # Errors
    ///
    /// Same as [`IngestionPipeline::ingest`].
    pub async fn run(&self, request: IngestRequest) -> Result<IngestionJobRecord, CoreError> {
        let _permit = self.workers.acquire().await.ok();
        let job_id = Uuid::new_v4().to_string();
        let started_at = UtcDateTime::now();
        let clock = Instant::now();

        let outcome = self.execute(&request).await;

        let record = IngestionJobRecord {
            job_id,
            status: outcome.status(),
            symbol: request.symbol.clone(),
            timeframe: request.timeframe,
            provider: request.provider,
            range_start: request.start,
            range_end: request.end,
            rows_inserted: outcome.inserted,
            rows_updated: outcome.updated,
            rows_rejected: outcome.rejected,
            retries: outcome.retries,
            error_detail: outcome.detail().map(bounded_error_detail),
            duration_ms: u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX),
            started_at,
        };
        self.persist(&record).await?;
        log_job(&record);

        if self.refresh_on_ingest && record.rows_written() > 0 {
            if let Some(aggregates) = &self.aggregates {
                aggregates
                    .refresh_series(&record.symbol, record.timeframe)
                    .await;
            }
        }
        Ok(record)
    }

    /// Run many jobs concurrently, bounded by the worker pool. Results are
    /// in request order; one failing job never stops the others.
    pub async fn ingest_batch(
        &self,
        requests: Vec<IngestRequest>,
    ) -> Vec<Result<IngestionJobRecord, CoreError>> {
        let count = requests.len();
        let mut tasks = JoinSet::new();
        for (index, request) in requests.into_iter().enumerate() {
            let pipeline = self.clone();
            tasks.spawn(async move { (index, pipeline.run(request).await) });
        }

        let mut results: Vec<Option<Result<IngestionJobRecord, CoreError>>> =
            (0..count).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(error) => tracing::error!(%error, "ingestion task aborted"),
            }
        }

        results
            .into_iter()
            .map(|result| {
                result.unwrap_or_else(|| {
                    Err(CoreError::Storage(StorageError::Task(String::from(
                        "ingestion task aborted before recording a job",
                    ))))
                })
            })
            .collect()
    }

    /// Ingest a long window as consecutive sub-ranges, each its own job.
    ///
    /// Stops before the next sub-range when `cancel` fires, when `deadline`
    /// has elapsed, or after a sub-range fails. Finished sub-ranges stay
    /// committed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] for an empty window or when an audit record
    /// cannot be written.
    pub async fn backfill(
        &self,
        request: IngestRequest,
        cancel: &CancellationToken,
        deadline: Option<Duration>,
    ) -> Result<BackfillReport, CoreError> {
        if request.start >= request.end {
            return Err(ValidationError::EmptyRange.into());
        }

        let step_us = self.backfill_step_us(&request);
        let started = Instant::now();
        let mut report = BackfillReport::default();
        let mut cursor = request.start;

        while cursor < request.end {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if deadline.is_some_and(|limit| started.elapsed() >= limit) {
                report.timed_out = true;
                break;
            }

            let next_us = cursor.unix_micros().saturating_add(step_us);
            let next = if next_us >= request.end.unix_micros() {
                request.end
            } else {
                UtcDateTime::from_unix_micros(next_us)?
            };
            let record = self
                .run(IngestRequest {
                    start: cursor,
                    end: next,
                    ..request.clone()
                })
                .await?;
            let failed = record.status == JobStatus::Failed;
            report.jobs.push(record);
            if failed {
                break;
            }
            report.completed_through = Some(next);
            cursor = next;
        }

        tracing::info!(
            symbol = %request.symbol,
            timeframe = %request.timeframe,
            provider = %request.provider,
            jobs = report.jobs.len(),
            rows_written = report.rows_written(),
            cancelled = report.cancelled,
            timed_out = report.timed_out,
            "backfill finished"
        );
        Ok(report)
    }

    /// A stored job by id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if the read fails or the row is invalid.
    pub async fn job(&self, job_id: &str) -> Result<Option<IngestionJobRecord>, CoreError> {
        let job_id = job_id.to_owned();
        let row = self
            .store
            .run_blocking(move |warehouse| warehouse.get_job(&job_id))
            .await?;
        Ok(row.map(row_to_job).transpose()?)
    }

    /// Newest jobs of a series first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] if the read fails or a row is invalid.
    pub async fn recent_jobs(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<IngestionJobRecord>, CoreError> {
        let symbol_key = symbol.as_str().to_owned();
        let rows = self
            .store
            .run_blocking(move |warehouse| {
                warehouse.recent_jobs(&symbol_key, timeframe.as_str(), limit)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(row_to_job)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn execute(&self, request: &IngestRequest) -> JobOutcome {
        let fetch = match FetchRequest::new(
            request.symbol.clone(),
            request.timeframe,
            request.start,
            request.end,
        ) {
            Ok(fetch) => fetch,
            Err(error) => return JobOutcome::failed(error, 0),
        };

        let Some(slot) = self.providers.get(&request.provider) else {
            return JobOutcome::failed(
                ProviderError::invalid_request(format!(
                    "provider '{}' is not registered",
                    request.provider
                )),
                0,
            );
        };

        if !self
            .reference
            .is_valid_symbol(&request.symbol, request.start.into_inner().date())
        {
            return JobOutcome::failed(ProviderError::invalid_symbol(&request.symbol), 0);
        }

        if !slot.adapter.capabilities().supports(request.timeframe) {
            return JobOutcome::failed(
                ProviderError::unsupported_timeframe(request.provider, request.timeframe),
                0,
            );
        }

        let attempted = retry_provider_call(&self.retry, |_attempt| {
            let fetch = fetch.clone();
            async move {
                slot.throttle.acquire().await;
                slot.adapter.fetch(fetch).await
            }
        })
        .await;
        let retries = attempted.retries;
        let raw = match attempted.result {
            Ok(raw) => raw,
            Err(error) => return JobOutcome::failed(error, retries),
        };

        let (bars, outside) = normalize(request, slot.adapter.id(), raw);
        if outside > 0 {
            tracing::debug!(
                symbol = %request.symbol,
                outside,
                "provider returned bars outside the requested window"
            );
        }

        let report = match self.write(request, bars).await {
            Ok(report) => report,
            Err(error) => return JobOutcome::failed(error, retries),
        };

        JobOutcome {
            inserted: report.inserted,
            updated: report.updated,
            rejected: report.rejected.len(),
            retries,
            error: None,
            rejection_note: report.rejected.first().map(|first| {
                format!(
                    "{} bars rejected, first at {}: {}",
                    report.rejected.len(),
                    first.bar.time,
                    first.reason
                )
            }),
        }
    }

    /// Upsert under the series lock, then invalidate and mark dirty.
    async fn write(
        &self,
        request: &IngestRequest,
        bars: Vec<Bar>,
    ) -> Result<UpsertReport, StorageError> {
        let lock = self.series_lock(&request.symbol, request.timeframe);
        let _guard = lock.lock().await;

        let report = self.store.upsert(bars).await?;

        if report.written() > 0 {
            if let Some(cache) = &self.cache {
                cache
                    .invalidate_range(
                        &request.symbol,
                        request.timeframe,
                        request.start.unix_micros(),
                        request.end.unix_micros(),
                    )
                    .await;
            }
            if let (Some(aggregates), Some((start, end))) = (&self.aggregates, report.written_span) {
                aggregates.mark_dirty(&request.symbol, request.timeframe, start, end);
            }
        }
        if let Some(aggregates) = &self.aggregates {
            let complete_through = request.end.min(UtcDateTime::now());
            aggregates.advance_watermark(&request.symbol, request.timeframe, complete_through);
        }
        Ok(report)
    }

    fn series_lock(&self, symbol: &Symbol, timeframe: Timeframe) -> Arc<tokio::sync::Mutex<()>> {
        self.series_locks
            .lock()
            .expect("series lock table should not be poisoned")
            .entry((symbol.clone(), timeframe))
            .or_default()
            .clone()
    }

    fn backfill_step_us(&self, request: &IngestRequest) -> i64 {
        let provider_cap = self
            .providers
            .get(&request.provider)
            .map_or(usize::MAX, |slot| slot.adapter.capabilities().max_bars_per_request);
        let bars = self
            .settings
            .backfill_bars_per_request
            .min(provider_cap)
            .max(1);
        request
            .timeframe
            .duration_us()
            .saturating_mul(i64::try_from(bars).unwrap_or(i64::MAX))
    }

    async fn persist(&self, record: &IngestionJobRecord) -> Result<(), CoreError> {
        let row = job_to_row(record);
        self.store
            .run_blocking(move |warehouse| warehouse.insert_job(&row))
            .await
            .map_err(|error| {
                tracing::error!(
                    job_id = %record.job_id,
                    symbol = %record.symbol,
                    %error,
                    "cannot persist ingestion job record"
                );
                CoreError::from(error)
            })
    }
}

/// Convert provider bars to store bars, dropping those outside the window.
fn normalize(request: &IngestRequest, source: ProviderId, raw: Vec<RawBar>) -> (Vec<Bar>, usize) {
    let mut outside = 0;
    let mut bars = Vec::with_capacity(raw.len());
    for raw in raw {
        let time = UtcDateTime::from_any_offset(raw.time);
        if time < request.start || time >= request.end {
            outside += 1;
            continue;
        }
        bars.push(Bar {
            time,
            symbol: request.symbol.clone(),
            timeframe: request.timeframe,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
            trade_count: raw.trade_count,
            vwap: raw.vwap,
            source,
        });
    }
    (bars, outside)
}

fn log_job(record: &IngestionJobRecord) {
    match record.status {
        JobStatus::Success => tracing::info!(
            job_id = %record.job_id,
            symbol = %record.symbol,
            timeframe = %record.timeframe,
            provider = %record.provider,
            inserted = record.rows_inserted,
            updated = record.rows_updated,
            retries = record.retries,
            duration_ms = record.duration_ms,
            "ingestion job succeeded"
        ),
        JobStatus::Partial => tracing::warn!(
            job_id = %record.job_id,
            symbol = %record.symbol,
            timeframe = %record.timeframe,
            provider = %record.provider,
            inserted = record.rows_inserted,
            updated = record.rows_updated,
            rejected = record.rows_rejected,
            retries = record.retries,
            "ingestion job partially succeeded"
        ),
        JobStatus::Failed => tracing::error!(
            job_id = %record.job_id,
            symbol = %record.symbol,
            timeframe = %record.timeframe,
            provider = %record.provider,
            rejected = record.rows_rejected,
            retries = record.retries,
            error = record.error_detail.as_deref().unwrap_or_default(),
            "ingestion job failed"
        ),
    }
}

fn to_i64(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn job_to_row(record: &IngestionJobRecord) -> JobRow {
    JobRow {
        job_id: record.job_id.clone(),
        symbol: record.symbol.as_str().to_owned(),
        timeframe: record.timeframe.as_str().to_owned(),
        provider: record.provider.as_str().to_owned(),
        range_start_us: record.range_start.unix_micros(),
        range_end_us: record.range_end.unix_micros(),
        rows_inserted: to_i64(record.rows_inserted),
        rows_updated: to_i64(record.rows_updated),
        rows_rejected: to_i64(record.rows_rejected),
        retries: i64::from(record.retries),
        status: record.status.as_str().to_owned(),
        error_detail: record.error_detail.clone(),
        duration_ms: i64::try_from(record.duration_ms).unwrap_or(i64::MAX),
        started_at_us: record.started_at.unix_micros(),
    }
}

fn row_to_job(row: JobRow) -> Result<IngestionJobRecord, ValidationError> {
    Ok(IngestionJobRecord {
        symbol: Symbol::parse(&row.symbol)?,
        timeframe: row.timeframe.parse()?,
        provider: row.provider.parse()?,
        range_start: UtcDateTime::from_unix_micros(row.range_start_us)?,
        range_end: UtcDateTime::from_unix_micros(row.range_end_us)?,
        rows_inserted: usize::try_from(row.rows_inserted).unwrap_or_default(),
        rows_updated: usize::try_from(row.rows_updated).unwrap_or_default(),
        rows_rejected: usize::try_from(row.rows_rejected).unwrap_or_default(),
        retries: u32::try_from(row.retries).unwrap_or(u32::MAX),
        status: JobStatus::parse(&row.status).unwrap_or(JobStatus::Failed),
        error_detail: row.error_detail,
        duration_ms: u64::try_from(row.duration_ms).unwrap_or_default(),
        started_at: UtcDateTime::from_unix_micros(row.started_at_us)?,
        job_id: row.job_id,
    })
}
