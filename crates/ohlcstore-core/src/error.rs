use thiserror::Error;

use ohlcstore_warehouse::WarehouseError;

use crate::config::ConfigError;
use crate::provider::ProviderError;

/// Validation and contract errors exposed by `ohlcstore-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("symbol cannot be empty")]
    EmptySymbol,
    #[error("symbol length {len} exceeds max {max}")]
    SymbolTooLong { len: usize, max: usize },
    #[error("symbol must start with an ASCII letter: '{ch}'")]
    SymbolInvalidStart { ch: char },
    #[error("symbol contains invalid character '{ch}' at index {index}")]
    SymbolInvalidChar { ch: char, index: usize },

    #[error("invalid timeframe '{value}', expected one of 1m, 5m, 15m, 30m, 1h, 4h, 1d, 1w")]
    InvalidTimeframe { value: String },
    #[error("invalid provider '{value}', expected one of yahoo, alpaca, polygon, fixture, rollup")]
    InvalidProvider { value: String },

    #[error("invalid currency code '{value}', expected 3-letter ISO code")]
    InvalidCurrency { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("timestamp is outside the supported range: {value}")]
    TimestampOutOfRange { value: i64 },
    #[error("time range start must be before end")]
    EmptyRange,

    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be non-negative")]
    NegativeValue { field: &'static str },

    #[error("bar high must be >= low")]
    InvalidBarRange,
    #[error("bar open/close must be within high/low range")]
    InvalidBarBounds,

    #[error("rollup {to} is not a whole multiple of {from}")]
    InvalidRollup { from: String, to: String },
}

/// Storage failure while reading or committing bars.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("storage task failed: {0}")]
    Task(String),

    #[error("stored row is invalid: {0}")]
    CorruptRow(#[from] ValidationError),
}

/// Top-level error type for core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<WarehouseError> for CoreError {
    fn from(error: WarehouseError) -> Self {
        Self::Storage(StorageError::Warehouse(error))
    }
}
