use serde::{Deserialize, Serialize};
use time::Date;

use crate::{ProviderId, Symbol, Timeframe, UtcDateTime, ValidationError};

const MAX_ERROR_DETAIL_LEN: usize = 512;
const MAX_ISSUE_NOTE_LEN: usize = 256;

/// Canonical instrument class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    Equity,
    Etf,
    Index,
    Crypto,
    Forex,
    Future,
    Other,
}

/// Reference metadata for a tradable symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub symbol: Symbol,
    pub name: String,
    pub exchange: Option<String>,
    pub asset_class: AssetClass,
    pub currency: String,
    pub is_active: bool,
    pub listed_on: Option<Date>,
    pub delisted_on: Option<Date>,
}

impl SymbolMeta {
    pub fn new(
        symbol: Symbol,
        name: impl Into<String>,
        asset_class: AssetClass,
        currency: impl AsRef<str>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            symbol,
            name: name.into(),
            exchange: None,
            asset_class,
            currency: validate_currency_code(currency.as_ref())?,
            is_active: true,
            listed_on: None,
            delisted_on: None,
        })
    }

    /// Whether the symbol was trading on `date`.
    pub fn is_listed_on(&self, date: Date) -> bool {
        let listed = self.listed_on.map_or(true, |listed| listed <= date);
        let not_delisted = self.delisted_on.map_or(true, |delisted| date < delisted);
        listed && not_delisted
    }
}

/// One OHLCV bar. Key is `(time, symbol, timeframe)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: UtcDateTime,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub trade_count: Option<i64>,
    pub vwap: Option<f64>,
    pub source: ProviderId,
}

impl Bar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        time: UtcDateTime,
        symbol: Symbol,
        timeframe: Timeframe,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: i64,
        source: ProviderId,
    ) -> Result<Self, ValidationError> {
        let bar = Self {
            time,
            symbol,
            timeframe,
            open,
            high,
            low,
            close,
            volume,
            trade_count: None,
            vwap: None,
            source,
        };
        bar.validate()?;
        Ok(bar)
    }

    /// Check price, volume and range invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_non_negative("open", self.open)?;
        validate_non_negative("high", self.high)?;
        validate_non_negative("low", self.low)?;
        validate_non_negative("close", self.close)?;
        validate_optional_non_negative("vwap", self.vwap)?;

        if self.volume < 0 {
            return Err(ValidationError::NegativeValue { field: "volume" });
        }
        if self.trade_count.is_some_and(|count| count < 0) {
            return Err(ValidationError::NegativeValue {
                field: "trade_count",
            });
        }

        if self.high < self.low {
            return Err(ValidationError::InvalidBarRange);
        }

        let within = |price: f64| price >= self.low && price <= self.high;
        if !within(self.open) || !within(self.close) {
            return Err(ValidationError::InvalidBarBounds);
        }

        Ok(())
    }

    /// Round every price to `scale` fractional digits.
    pub fn round_prices(&mut self, scale: u32) {
        self.open = round_to_scale(self.open, scale);
        self.high = round_to_scale(self.high, scale);
        self.low = round_to_scale(self.low, scale);
        self.close = round_to_scale(self.close, scale);
        self.vwap = self.vwap.map(|vwap| round_to_scale(vwap, scale));
    }

    pub fn with_trade_count(mut self, trade_count: i64) -> Self {
        self.trade_count = Some(trade_count);
        self
    }

    pub fn with_vwap(mut self, vwap: f64) -> Self {
        self.vwap = Some(vwap);
        self
    }

    /// Exclusive end of the interval this bar covers.
    pub fn end_time(&self) -> UtcDateTime {
        self.time.saturating_add(self.timeframe.duration())
    }
}

/// Bar derived by rolling a finer timeframe into a coarser bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateBar {
    /// Bucket start lives in `bar.time`, target timeframe in `bar.timeframe`.
    pub bar: Bar,
    pub bucket_end: UtcDateTime,
    pub source_timeframe: Timeframe,
    pub source_count: usize,
    pub closed: bool,
}

impl AggregateBar {
    pub fn bucket_start(&self) -> UtcDateTime {
        self.bar.time
    }
}

/// Outcome of one ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Success,
    Partial,
    Failed,
}

impl JobStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Audit record of one provider fetch and upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionJobRecord {
    pub job_id: String,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub provider: ProviderId,
    pub range_start: UtcDateTime,
    pub range_end: UtcDateTime,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_rejected: usize,
    pub retries: u32,
    pub status: JobStatus,
    pub error_detail: Option<String>,
    pub duration_ms: u64,
    pub started_at: UtcDateTime,
}

impl IngestionJobRecord {
    pub fn rows_written(&self) -> usize {
        self.rows_inserted + self.rows_updated
    }
}

/// Cap an error message at the audit column bound.
pub fn bounded_error_detail(detail: impl AsRef<str>) -> String {
    truncate_chars(detail.as_ref(), MAX_ERROR_DETAIL_LEN)
}

/// One categorized finding of a quality scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityIssue {
    Gap {
        after: UtcDateTime,
        before: UtcDateTime,
        missing: usize,
    },
    NearDuplicate {
        first: UtcDateTime,
        second: UtcDateTime,
    },
    /// `z_score` holds the signed fractional move for
    /// [`OutlierMetric::PriceJump`].
    Outlier {
        time: UtcDateTime,
        metric: OutlierMetric,
        z_score: f64,
    },
    ZeroVolume {
        time: UtcDateTime,
    },
    Other {
        note: String,
    },
}

impl QualityIssue {
    /// Uncategorized finding with its text capped.
    pub fn other(note: impl AsRef<str>) -> Self {
        Self::Other {
            note: truncate_chars(note.as_ref(), MAX_ISSUE_NOTE_LEN),
        }
    }
}

/// Measured quantity behind an outlier finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMetric {
    Range,
    Volume,
    /// Close moved more than the configured fraction from the prior close.
    PriceJump,
}

/// Quality summary of a series over a time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityRecord {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    /// `YYYY-MM-DD` of the scan.
    pub check_date: String,
    pub range_start: UtcDateTime,
    pub range_end: UtcDateTime,
    pub total_bars: usize,
    pub missing_count: usize,
    pub duplicate_count: usize,
    pub outlier_count: usize,
    pub zero_volume_count: usize,
    pub score: f64,
    pub issues: Vec<QualityIssue>,
}

impl QualityRecord {
    pub fn total_expected_bars(&self) -> usize {
        self.total_bars + self.missing_count
    }
}

/// Validate and normalize currency to uppercase 3-letter code.
pub fn validate_currency_code(input: &str) -> Result<String, ValidationError> {
    let normalized = input.trim().to_ascii_uppercase();
    let is_valid = normalized.len() == 3 && normalized.chars().all(|ch| ch.is_ascii_alphabetic());

    if !is_valid {
        return Err(ValidationError::InvalidCurrency {
            value: input.to_owned(),
        });
    }

    Ok(normalized)
}

/// Round half away from zero to `scale` fractional digits.
pub fn round_to_scale(value: f64, scale: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    let factor = 10_f64.powi(i32::try_from(scale).unwrap_or(i32::MAX));
    if !factor.is_finite() {
        return value;
    }
    let scaled = (value * factor).round() / factor;
    if scaled.is_finite() {
        scaled
    } else {
        value
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((index, _)) => value[..index].to_owned(),
        None => value.to_owned(),
    }
}

fn validate_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue { field });
    }
    if value < 0.0 {
        return Err(ValidationError::NegativeValue { field });
    }
    Ok(())
}

fn validate_optional_non_negative(
    field: &'static str,
    value: Option<f64>,
) -> Result<(), ValidationError> {
    if let Some(value) = value {
        validate_non_negative(field, value)?;
    }
    Ok(())
}
