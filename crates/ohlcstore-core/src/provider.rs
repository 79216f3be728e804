//! Provider adapter contract.
//!
//! An adapter turns `(symbol, timeframe, [start, end))` into raw bars from
//! one upstream. Errors are classified as transient (worth retrying) or
//! permanent; the ingestion pipeline retries only the former.
//!
//! | Kind | Variants |
//! |------|----------|
//! | Transient | `Timeout`, `RateLimited`, `Unavailable` |
//! | Permanent | `InvalidSymbol`, `UnsupportedTimeframe`, `InvalidRequest`, `Internal` |

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::http_client::HttpError;
use crate::{Symbol, Timeframe, UtcDateTime, ValidationError};

/// Upstream a bar came from. `Rollup` tags bars derived by the aggregate engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Yahoo,
    Alpaca,
    Polygon,
    Fixture,
    Rollup,
}

impl ProviderId {
    pub const ALL: [Self; 5] = [
        Self::Yahoo,
        Self::Alpaca,
        Self::Polygon,
        Self::Fixture,
        Self::Rollup,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Yahoo => "yahoo",
            Self::Alpaca => "alpaca",
            Self::Polygon => "polygon",
            Self::Fixture => "fixture",
            Self::Rollup => "rollup",
        }
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "yahoo" => Ok(Self::Yahoo),
            "alpaca" => Ok(Self::Alpaca),
            "polygon" => Ok(Self::Polygon),
            "fixture" => Ok(Self::Fixture),
            "rollup" => Ok(Self::Rollup),
            other => Err(ValidationError::InvalidProvider {
                value: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Timeout,
    RateLimited,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    InvalidSymbol,
    UnsupportedTimeframe,
    InvalidRequest,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transient(TransientKind),
    Permanent(PermanentKind),
}

/// Classified adapter failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    kind: ProviderErrorKind,
    message: String,
}

impl ProviderError {
    fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Transient(TransientKind::Timeout), message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(
            ProviderErrorKind::Transient(TransientKind::RateLimited),
            message,
        )
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            ProviderErrorKind::Transient(TransientKind::Unavailable),
            message,
        )
    }

    pub fn invalid_symbol(symbol: &Symbol) -> Self {
        Self::new(
            ProviderErrorKind::Permanent(PermanentKind::InvalidSymbol),
            format!("symbol '{symbol}' is not known to the provider"),
        )
    }

    pub fn unsupported_timeframe(provider: ProviderId, timeframe: Timeframe) -> Self {
        Self::new(
            ProviderErrorKind::Permanent(PermanentKind::UnsupportedTimeframe),
            format!("provider '{provider}' does not serve {timeframe} bars"),
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(
            ProviderErrorKind::Permanent(PermanentKind::InvalidRequest),
            message,
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Permanent(PermanentKind::Internal), message)
    }

    /// Map a non-2xx status to its error class.
    pub fn from_status(status: u16, symbol: &Symbol, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        match status {
            404 => Self::invalid_symbol(symbol),
            408 => Self::timeout(format!("upstream timeout (408): {snippet}")),
            429 => Self::rate_limited(format!("rate limited (429): {snippet}")),
            500..=599 => Self::unavailable(format!("upstream error ({status}): {snippet}")),
            _ => Self::invalid_request(format!("request rejected ({status}): {snippet}")),
        }
    }

    pub const fn kind(&self) -> ProviderErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::Transient(_))
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            ProviderErrorKind::Transient(TransientKind::Timeout) => "provider.timeout",
            ProviderErrorKind::Transient(TransientKind::RateLimited) => "provider.rate_limited",
            ProviderErrorKind::Transient(TransientKind::Unavailable) => "provider.unavailable",
            ProviderErrorKind::Permanent(PermanentKind::InvalidSymbol) => {
                "provider.invalid_symbol"
            }
            ProviderErrorKind::Permanent(PermanentKind::UnsupportedTimeframe) => {
                "provider.unsupported_timeframe"
            }
            ProviderErrorKind::Permanent(PermanentKind::InvalidRequest) => {
                "provider.invalid_request"
            }
            ProviderErrorKind::Permanent(PermanentKind::Internal) => "provider.internal",
        }
    }
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for ProviderError {}

impl From<HttpError> for ProviderError {
    fn from(error: HttpError) -> Self {
        if error.timed_out() {
            Self::timeout(error.message())
        } else {
            Self::unavailable(error.message())
        }
    }
}

/// Fetch window for one adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub start: UtcDateTime,
    pub end: UtcDateTime,
}

impl FetchRequest {
    pub fn new(
        symbol: Symbol,
        timeframe: Timeframe,
        start: UtcDateTime,
        end: UtcDateTime,
    ) -> Result<Self, ValidationError> {
        if start >= end {
            return Err(ValidationError::EmptyRange);
        }
        Ok(Self {
            symbol,
            timeframe,
            start,
            end,
        })
    }
}

/// Bar as delivered by a provider, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBar {
    /// May carry any UTC offset.
    pub time: OffsetDateTime,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub trade_count: Option<i64>,
    pub vwap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCapabilities {
    pub timeframes: Vec<Timeframe>,
    pub max_bars_per_request: usize,
}

impl ProviderCapabilities {
    pub fn supports(&self, timeframe: Timeframe) -> bool {
        self.timeframes.contains(&timeframe)
    }
}

/// Upstream bar source.
///
/// Implementations must be `Send + Sync`; the pipeline shares one adapter
/// across concurrent jobs.
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Fetch bars with `start <= time < end`, in any order.
    ///
    /// # Errors
    ///
    /// Returns a transient [`ProviderError`] for timeouts, throttling and
    /// upstream outages, a permanent one for anything a retry cannot fix.
    fn fetch<'a>(
        &'a self,
        request: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawBar>, ProviderError>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ProviderError::timeout("slow").retryable());
        assert!(ProviderError::rate_limited("429").retryable());
        assert!(!ProviderError::invalid_request("bad").retryable());
        assert!(
            !ProviderError::unsupported_timeframe(ProviderId::Yahoo, Timeframe::FourHours)
                .retryable()
        );
    }

    #[test]
    fn status_codes_map_to_error_classes() {
        let symbol = Symbol::parse("AAPL").expect("symbol");
        assert_eq!(
            ProviderError::from_status(429, &symbol, "").code(),
            "provider.rate_limited"
        );
        assert_eq!(
            ProviderError::from_status(503, &symbol, "").code(),
            "provider.unavailable"
        );
        assert_eq!(
            ProviderError::from_status(404, &symbol, "").code(),
            "provider.invalid_symbol"
        );
        assert_eq!(
            ProviderError::from_status(401, &symbol, "").code(),
            "provider.invalid_request"
        );
    }

    #[test]
    fn http_timeouts_stay_transient() {
        let error = ProviderError::from(HttpError::timeout("deadline"));
        assert_eq!(
            error.kind(),
            ProviderErrorKind::Transient(TransientKind::Timeout)
        );
    }

    #[test]
    fn fetch_request_requires_non_empty_window() {
        let at = UtcDateTime::parse("2024-01-01T00:00:00Z").expect("timestamp");
        let err = FetchRequest::new(
            Symbol::parse("AAPL").expect("symbol"),
            Timeframe::OneDay,
            at,
            at,
        )
        .expect_err("empty window");
        assert_eq!(err, ValidationError::EmptyRange);
    }
}
