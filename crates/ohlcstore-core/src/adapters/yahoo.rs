use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::http_client::{HttpClient, HttpRequest, ReqwestHttpClient};
use crate::provider::{FetchRequest, ProviderAdapter, ProviderCapabilities, ProviderError, RawBar};
use crate::{ProviderId, Symbol, Timeframe};

const CHART_BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

/// Yahoo Finance chart API adapter.
#[derive(Clone)]
pub struct YahooAdapter {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    timeout_ms: u64,
}

impl Default for YahooAdapter {
    fn default() -> Self {
        Self::with_http_client(Arc::new(ReqwestHttpClient::new()))
    }
}

impl YahooAdapter {
    pub fn with_http_client(http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            http_client,
            base_url: String::from(CHART_BASE_URL),
            timeout_ms: 10_000,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    async fn fetch_chart(&self, request: &FetchRequest) -> Result<Vec<RawBar>, ProviderError> {
        let interval = chart_interval(request.timeframe).ok_or_else(|| {
            ProviderError::unsupported_timeframe(ProviderId::Yahoo, request.timeframe)
        })?;

        let http_request = HttpRequest::get(format!(
            "{}/{}",
            self.base_url,
            urlencoding::encode(request.symbol.as_str())
        ))
        .with_query("period1", request.start.into_inner().unix_timestamp().to_string())
        .with_query("period2", request.end.into_inner().unix_timestamp().to_string())
        .with_query("interval", interval)
        .with_query("includePrePost", "false")
        .with_header("referer", "https://finance.yahoo.com/")
        .with_timeout_ms(self.timeout_ms);

        let response = self.http_client.execute(http_request).await?;
        if !response.is_success() {
            return Err(ProviderError::from_status(
                response.status,
                &request.symbol,
                &response.body,
            ));
        }

        parse_chart(&response.body, &request.symbol, request.timeframe)
    }
}

impl ProviderAdapter for YahooAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Yahoo
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            timeframes: Timeframe::ALL
                .into_iter()
                .filter(|timeframe| chart_interval(*timeframe).is_some())
                .collect(),
            max_bars_per_request: 2_000,
        }
    }

    fn fetch<'a>(
        &'a self,
        request: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawBar>, ProviderError>> + Send + 'a>> {
        Box::pin(async move { self.fetch_chart(&request).await })
    }
}

const fn chart_interval(timeframe: Timeframe) -> Option<&'static str> {
    match timeframe {
        Timeframe::OneMinute => Some("1m"),
        Timeframe::FiveMinutes => Some("5m"),
        Timeframe::FifteenMinutes => Some("15m"),
        Timeframe::ThirtyMinutes => Some("30m"),
        Timeframe::OneHour => Some("60m"),
        Timeframe::OneDay => Some("1d"),
        Timeframe::OneWeek => Some("1wk"),
        Timeframe::FourHours => None,
    }
}

fn parse_chart(
    body: &str,
    symbol: &Symbol,
    timeframe: Timeframe,
) -> Result<Vec<RawBar>, ProviderError> {
    let chart: ChartResponse = serde_json::from_str(body)
        .map_err(|error| ProviderError::internal(format!("failed to parse yahoo chart: {error}")))?;

    if let Some(error) = chart.chart.error {
        return Err(if error.code == "Not Found" {
            ProviderError::invalid_symbol(symbol)
        } else {
            ProviderError::invalid_request(format!(
                "yahoo chart error {}: {}",
                error.code,
                error.description.unwrap_or_default()
            ))
        });
    }

    let Some(result) = chart.chart.result.and_then(|mut results| results.pop()) else {
        return Ok(Vec::new());
    };
    let Some(timestamps) = result.timestamp else {
        return Ok(Vec::new());
    };
    let Some(quote) = result.indicators.quote.into_iter().next() else {
        return Ok(Vec::new());
    };

    let mut bars = Vec::with_capacity(timestamps.len());
    for (index, seconds) in timestamps.into_iter().enumerate() {
        // Yahoo emits null rows for halted or pre-listing sessions.
        let (Some(open), Some(high), Some(low), Some(close)) = (
            cell(&quote.open, index),
            cell(&quote.high, index),
            cell(&quote.low, index),
            cell(&quote.close, index),
        ) else {
            continue;
        };

        let time = OffsetDateTime::from_unix_timestamp(seconds).map_err(|error| {
            ProviderError::internal(format!("invalid yahoo timestamp {seconds}: {error}"))
        })?;

        bars.push(RawBar {
            time: align_session_stamp(time, timeframe),
            open,
            high,
            low,
            close,
            volume: cell(&quote.volume, index).unwrap_or(0),
            trade_count: None,
            vwap: None,
        });
    }

    Ok(bars)
}

fn cell<T: Copy>(series: &[Option<T>], index: usize) -> Option<T> {
    series.get(index).copied().flatten()
}

/// Daily and weekly stamps arrive at the session open; snap them to the bucket.
fn align_session_stamp(time: OffsetDateTime, timeframe: Timeframe) -> OffsetDateTime {
    if !matches!(timeframe, Timeframe::OneDay | Timeframe::OneWeek) {
        return time;
    }
    let micros = i64::try_from(time.unix_timestamp_nanos() / 1_000).unwrap_or(i64::MAX);
    let aligned = timeframe.bucket_start_us(micros);
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(aligned) * 1_000).unwrap_or(time)
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartEnvelope,
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    timestamp: Option<Vec<i64>>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    quote: Vec<ChartQuote>,
}

#[derive(Debug, Deserialize)]
struct ChartQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<i64>>,
}
