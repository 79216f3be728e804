//! # ohlcstore core
//!
//! Ingestion, quality monitoring, rollups and queries over a chunked OHLC
//! bar store.
//!
//! ## Overview
//!
//! - **Bar store** with idempotent upserts, compression and retention
//! - **Ingestion pipeline** with per-provider rate limits, retries and an
//!   audit record for every job
//! - **Quality monitor** that scores a stored range for gaps, duplicates
//!   and outliers
//! - **Aggregate engine** that keeps coarser timeframes up to date as finer
//!   bars arrive
//! - **Query service** with a generation-checked result cache
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Provider adapters (Yahoo, Alpaca, in-memory fixture) |
//! | [`aggregate`] | Rollup maintenance and aggregate reads |
//! | [`cache`] | Query result cache with range invalidation |
//! | [`config`] | TOML + environment configuration |
//! | [`domain`] | Bars, symbols, timeframes and audit records |
//! | [`engine`] | One handle wiring every service to one database |
//! | [`error`] | Core error types |
//! | [`http_client`] | HTTP client abstraction |
//! | [`ingest`] | Fetch, normalize, upsert and audit |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`provider`] | Provider trait, requests and error taxonomy |
//! | [`quality`] | Range scans and quality scoring |
//! | [`query`] | Range, multi-symbol and latest-N reads |
//! | [`reference`] | Symbol reference data |
//! | [`retry`] | Backoff and retry loop for provider calls |
//! | [`store`] | Async bar store over the warehouse |
//! | [`throttling`] | Per-provider rate limiting |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use ohlcstore_core::{Engine, EngineConfig, ProviderId, Symbol, Timeframe, UtcDateTime};
//! use ohlcstore_core::adapters::YahooAdapter;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Engine::open(EngineConfig::from_env()?)?
//!         .with_provider(Arc::new(YahooAdapter::default()));
//!
//!     let symbol = Symbol::parse("AAPL")?;
//!     let start = UtcDateTime::parse("2024-01-01T00:00:00Z")?;
//!     let end = UtcDateTime::parse("2024-02-01T00:00:00Z")?;
//!     let job = engine
//!         .pipeline()
//!         .ingest(symbol.clone(), Timeframe::OneDay, start, end, ProviderId::Yahoo)
//!         .await?;
//!     println!("{} rows written", job.rows_written());
//!
//!     let bars = engine.query().get_bars(&symbol, Timeframe::OneDay, start, end).await?;
//!     println!("{} bars", bars.len());
//!
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Provider Adapter│◀────│ Retry + Throttle │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Ingestion       │────▶│ Query Cache      │
//! │ Pipeline        │     │ (invalidate)     │
//! └────────┬────────┘     └──────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ Bar Store       │────▶│ Aggregate Engine │
//! │ (warehouse)     │     │ (dirty ranges)   │
//! └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Provider failures carry a transient/permanent classification that the
//! retry loop honours:
//!
//! ```rust
//! use ohlcstore_core::provider::ProviderError;
//!
//! fn should_retry(error: &ProviderError) -> bool {
//!     error.retryable()
//! }
//! ```

pub mod adapters;
pub mod aggregate;
pub mod cache;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod http_client;
pub mod ingest;
pub mod logging;
pub mod provider;
pub mod quality;
pub mod query;
pub mod reference;
pub mod retry;
pub mod store;
pub mod throttling;

// Domain models
pub use domain::{
    bounded_error_detail, round_to_scale, validate_currency_code, AggregateBar, AssetClass, Bar,
    IngestionJobRecord, JobStatus, OutlierMetric, QualityIssue, QualityRecord, Symbol,
    SymbolMeta, Timeframe, UtcDateTime,
};

// Error types
pub use error::{CoreError, StorageError, ValidationError};

// Provider identifiers and contract
pub use provider::{FetchRequest, ProviderAdapter, ProviderError, ProviderId, RawBar};

// Services
pub use aggregate::{AggregateEngine, RefreshReport, Rollup};
pub use cache::QueryCache;
pub use config::{ConfigError, EngineConfig};
pub use engine::Engine;
pub use ingest::{BackfillReport, IngestRequest, IngestionPipeline};
pub use quality::QualityMonitor;
pub use query::QueryService;
pub use store::{BarStore, LifecyclePolicy, UpsertReport};
