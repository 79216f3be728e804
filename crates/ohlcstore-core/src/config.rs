//! Engine configuration loaded from TOML.
//!
//! Every section is optional; missing keys fall back to defaults. Three
//! environment variables override the file: `OHLCSTORE_HOME`,
//! `OHLCSTORE_DB_PATH` and `OHLCSTORE_LOG`.
//!
//! ```toml
//! [storage]
//! db_path = "/var/lib/ohlcstore/bars.duckdb"
//! retention_days = 1825
//!
//! [ingestion]
//! worker_pool_size = 8
//!
//! [[aggregates.rollups]]
//! from = "1m"
//! to = "1h"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use ohlcstore_warehouse::{WarehouseConfig, MICROS_PER_DAY};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::Rollup;
use crate::logging::LogFormat;
use crate::retry::RetrySettings;
use crate::store::{LifecyclePolicy, DEFAULT_PRICE_SCALE};
use crate::ValidationError;

const MAX_PRICE_SCALE: u32 = 12;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot install log subscriber: {0}")]
    Logging(String),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub storage: StorageSettings,
    pub ingestion: IngestionSettings,
    pub retry: RetrySettings,
    pub quality: QualitySettings,
    pub aggregates: AggregateSettings,
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSettings {
    /// Data root; defaults to `$OHLCSTORE_HOME` or `~/.ohlcstore`.
    pub home: Option<PathBuf>,
    /// Database file, or `:memory:`. Defaults to `<home>/data/ohlcstore.duckdb`.
    pub db_path: Option<PathBuf>,
    pub chunk_days: u32,
    /// `None` keeps bars forever.
    pub retention_days: Option<u32>,
    /// `None` never compresses.
    pub compress_after_days: Option<u32>,
    pub price_scale: u32,
    pub max_pool_size: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            home: None,
            db_path: None,
            chunk_days: 7,
            retention_days: Some(3_650),
            compress_after_days: Some(30),
            price_scale: DEFAULT_PRICE_SCALE,
            max_pool_size: 4,
        }
    }
}

impl StorageSettings {
    pub fn warehouse_config(&self) -> WarehouseConfig {
        let defaults = WarehouseConfig::default();
        let home = self.home.clone().unwrap_or(defaults.home);
        let db_path = match &self.db_path {
            Some(path) => path.clone(),
            None => home.join("data").join("ohlcstore.duckdb"),
        };
        WarehouseConfig {
            home,
            db_path,
            max_pool_size: self.max_pool_size,
            chunk_width_us: i64::from(self.chunk_days) * MICROS_PER_DAY,
        }
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            compress_after: self
                .compress_after_days
                .map(|days| time::Duration::days(i64::from(days))),
            retention: self
                .retention_days
                .map(|days| time::Duration::days(i64::from(days))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestionSettings {
    /// Upper bound on concurrently running jobs.
    pub worker_pool_size: usize,
    /// Backfill sub-range size, in bars of the requested timeframe.
    pub backfill_bars_per_request: usize,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            backfill_bars_per_request: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QualitySettings {
    /// Gap threshold in multiples of the bar interval.
    pub gap_tolerance: f64,
    /// Outlier threshold in sample standard deviations.
    pub outlier_threshold: f64,
    pub outlier_window: usize,
    /// Largest close-to-close move, as a fraction, before a bar is flagged.
    pub max_price_change: f64,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            gap_tolerance: 1.0,
            outlier_threshold: 3.0,
            outlier_window: 20,
            max_price_change: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregateSettings {
    pub rollups: Vec<Rollup>,
    /// Refresh affected rollups before `ingest` returns.
    pub refresh_on_ingest: bool,
    /// Period of the background refresh task; 0 disables it.
    pub refresh_interval_secs: u64,
}

impl Default for AggregateSettings {
    fn default() -> Self {
        Self {
            rollups: Rollup::defaults(),
            refresh_on_ingest: true,
            refresh_interval_secs: 60,
        }
    }
}

impl AggregateSettings {
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 300,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// `EnvFilter` directive, e.g. `info,ohlcstore_core=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: LogFormat::Pretty,
        }
    }
}

impl EngineConfig {
    /// Read `path`, apply environment overrides, validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is unreadable, malformed or
    /// out of bounds.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an override makes the config invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate without touching the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the text is malformed or out of bounds.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides looked up through `lookup`. Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(home) = lookup("OHLCSTORE_HOME") {
            self.storage.home = Some(PathBuf::from(home));
        }
        if let Some(db_path) = lookup("OHLCSTORE_DB_PATH") {
            self.storage.db_path = Some(PathBuf::from(db_path));
        }
        if let Some(level) = lookup("OHLCSTORE_LOG") {
            self.logging.level = level;
        }
    }

    /// # Errors
    ///
    /// Returns the first out-of-bounds setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let storage = &self.storage;
        if storage.chunk_days == 0 {
            return Err(ConfigError::invalid("storage.chunk_days", "must be at least 1"));
        }
        if storage.retention_days == Some(0) {
            return Err(ConfigError::invalid(
                "storage.retention_days",
                "must be at least 1, omit it to keep bars forever",
            ));
        }
        if let (Some(retention), Some(compress)) =
            (storage.retention_days, storage.compress_after_days)
        {
            if compress > retention {
                return Err(ConfigError::invalid(
                    "storage.compress_after_days",
                    format!("{compress} exceeds retention of {retention} days"),
                ));
            }
        }
        if storage.price_scale > MAX_PRICE_SCALE {
            return Err(ConfigError::invalid(
                "storage.price_scale",
                format!("must be at most {MAX_PRICE_SCALE}"),
            ));
        }
        if storage.max_pool_size == 0 {
            return Err(ConfigError::invalid("storage.max_pool_size", "must be at least 1"));
        }

        if self.ingestion.worker_pool_size == 0 {
            return Err(ConfigError::invalid(
                "ingestion.worker_pool_size",
                "must be at least 1",
            ));
        }
        if self.ingestion.backfill_bars_per_request == 0 {
            return Err(ConfigError::invalid(
                "ingestion.backfill_bars_per_request",
                "must be at least 1",
            ));
        }

        let retry = &self.retry;
        if !retry.factor.is_finite() || retry.factor < 1.0 {
            return Err(ConfigError::invalid("retry.factor", "must be finite and >= 1"));
        }
        if retry.base_delay_ms > retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }

        let quality = &self.quality;
        if !quality.gap_tolerance.is_finite() || quality.gap_tolerance < 1.0 {
            return Err(ConfigError::invalid(
                "quality.gap_tolerance",
                "must be finite and >= 1",
            ));
        }
        if !quality.outlier_threshold.is_finite() || quality.outlier_threshold <= 0.0 {
            return Err(ConfigError::invalid(
                "quality.outlier_threshold",
                "must be finite and > 0",
            ));
        }
        if !quality.max_price_change.is_finite() || quality.max_price_change <= 0.0 {
            return Err(ConfigError::invalid(
                "quality.max_price_change",
                "must be finite and > 0",
            ));
        }
        if quality.outlier_window < 2 {
            return Err(ConfigError::invalid("quality.outlier_window", "must be at least 2"));
        }

        let rollups = &self.aggregates.rollups;
        for (index, rollup) in rollups.iter().enumerate() {
            Rollup::new(rollup.from, rollup.to).map_err(|error: ValidationError| {
                ConfigError::invalid("aggregates.rollups", error.to_string())
            })?;
            if rollups[..index].iter().any(|earlier| earlier.to == rollup.to) {
                return Err(ConfigError::invalid(
                    "aggregates.rollups",
                    format!("more than one rollup produces {}", rollup.to),
                ));
            }
        }

        if self.cache.enabled && (self.cache.ttl_secs == 0 || self.cache.max_entries == 0) {
            return Err(ConfigError::invalid(
                "cache",
                "ttl_secs and max_entries must be positive when enabled",
            ));
        }

        crate::logging::default_filter(&self.logging.level)?;
        Ok(())
    }
}
