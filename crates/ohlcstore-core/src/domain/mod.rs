//! # Domain Models
//!
//! Strongly-typed bars, series keys and audit records. Construction and
//! [`Bar::validate`] enforce the invariants every stored bar satisfies:
//!
//! - prices are finite and non-negative
//! - `low <= open, close <= high`
//! - `volume >= 0`, `trade_count >= 0` when present
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Bar`] | OHLCV bar keyed by `(time, symbol, timeframe)` |
//! | [`AggregateBar`] | Rolled-up bar with bucket bounds and closed flag |
//! | [`Symbol`] | Validated uppercase ticker |
//! | [`Timeframe`] | Fixed-width bar interval (1m .. 1w) |
//! | [`UtcDateTime`] | UTC instant with microsecond precision |
//! | [`SymbolMeta`] | Reference metadata for a symbol |
//! | [`IngestionJobRecord`] | Audit record of one ingestion job |
//! | [`QualityRecord`] | Quality scan summary with categorized issues |

mod models;
mod symbol;
mod timeframe;
mod timestamp;

pub use models::{
    bounded_error_detail, round_to_scale, validate_currency_code, AggregateBar, AssetClass, Bar,
    IngestionJobRecord, JobStatus, OutlierMetric, QualityIssue, QualityRecord, SymbolMeta,
};
pub use symbol::Symbol;
pub use timeframe::Timeframe;
pub use timestamp::UtcDateTime;
