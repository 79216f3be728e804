use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::http_client::{HttpAuth, HttpClient, HttpRequest, ReqwestHttpClient};
use crate::provider::{FetchRequest, ProviderAdapter, ProviderCapabilities, ProviderError, RawBar};
use crate::{ProviderId, Timeframe};

const BARS_BASE_URL: &str = "https://data.alpaca.markets/v2/stocks";
const PAGE_LIMIT: usize = 10_000;
const MAX_PAGES: usize = 50;

/// Alpaca market data v2 bars adapter.
#[derive(Clone)]
pub struct AlpacaAdapter {
    http_client: Arc<dyn HttpClient>,
    auth: HttpAuth,
    base_url: String,
    feed: String,
}

impl Default for AlpacaAdapter {
    fn default() -> Self {
        Self::with_http_client(
            Arc::new(ReqwestHttpClient::new()),
            std::env::var("OHLCSTORE_ALPACA_API_KEY").unwrap_or_default(),
            std::env::var("OHLCSTORE_ALPACA_SECRET_KEY").unwrap_or_default(),
        )
    }
}

impl AlpacaAdapter {
    pub fn with_http_client(
        http_client: Arc<dyn HttpClient>,
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            auth: HttpAuth::HeaderPair {
                key_header: String::from("APCA-API-KEY-ID"),
                key: api_key.into(),
                secret_header: String::from("APCA-API-SECRET-KEY"),
                secret: secret_key.into(),
            },
            base_url: String::from(BARS_BASE_URL),
            feed: String::from("iex"),
        }
    }

    pub fn with_feed(mut self, feed: impl Into<String>) -> Self {
        self.feed = feed.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn fetch_pages(&self, request: &FetchRequest) -> Result<Vec<RawBar>, ProviderError> {
        let timeframe = bars_timeframe(request.timeframe);
        let endpoint = format!(
            "{}/{}/bars",
            self.base_url,
            urlencoding::encode(request.symbol.as_str())
        );

        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let mut http_request = HttpRequest::get(endpoint.as_str())
                .with_query("timeframe", timeframe)
                .with_query("start", request.start.format_rfc3339())
                .with_query("end", request.end.format_rfc3339())
                .with_query("limit", PAGE_LIMIT.to_string())
                .with_query("adjustment", "raw")
                .with_query("feed", self.feed.as_str())
                .with_auth(&self.auth);
            if let Some(token) = page_token.take() {
                http_request = http_request.with_query("page_token", token);
            }

            let response = self.http_client.execute(http_request).await?;
            if response.status == 422 {
                return Err(ProviderError::invalid_symbol(&request.symbol));
            }
            if !response.is_success() {
                return Err(ProviderError::from_status(
                    response.status,
                    &request.symbol,
                    &response.body,
                ));
            }

            let page: BarsPage = serde_json::from_str(&response.body).map_err(|error| {
                ProviderError::internal(format!("failed to parse alpaca bars: {error}"))
            })?;
            for bar in page.bars.unwrap_or_default() {
                bars.push(bar.into_raw()?);
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(bars),
            }
        }

        Err(ProviderError::internal(format!(
            "alpaca pagination exceeded {MAX_PAGES} pages for {}",
            request.symbol
        )))
    }
}

impl ProviderAdapter for AlpacaAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Alpaca
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities {
            timeframes: Timeframe::ALL.to_vec(),
            max_bars_per_request: PAGE_LIMIT,
        }
    }

    fn fetch<'a>(
        &'a self,
        request: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawBar>, ProviderError>> + Send + 'a>> {
        Box::pin(async move { self.fetch_pages(&request).await })
    }
}

const fn bars_timeframe(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::OneMinute => "1Min",
        Timeframe::FiveMinutes => "5Min",
        Timeframe::FifteenMinutes => "15Min",
        Timeframe::ThirtyMinutes => "30Min",
        Timeframe::OneHour => "1Hour",
        Timeframe::FourHours => "4Hour",
        Timeframe::OneDay => "1Day",
        Timeframe::OneWeek => "1Week",
    }
}

#[derive(Debug, Deserialize)]
struct BarsPage {
    bars: Option<Vec<AlpacaBar>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    t: String,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: i64,
    n: Option<i64>,
    vw: Option<f64>,
}

impl AlpacaBar {
    fn into_raw(self) -> Result<RawBar, ProviderError> {
        let time = OffsetDateTime::parse(&self.t, &Rfc3339).map_err(|error| {
            ProviderError::internal(format!("invalid alpaca timestamp '{}': {error}", self.t))
        })?;
        Ok(RawBar {
            time,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
            trade_count: self.n,
            vwap: self.vw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{block_on, RecordingHttpClient};
    use crate::http_client::HttpResponse;
    use crate::{Symbol, UtcDateTime};

    fn request() -> FetchRequest {
        FetchRequest::new(
            Symbol::parse("MSFT").expect("symbol"),
            Timeframe::OneHour,
            UtcDateTime::parse("2024-03-04T14:00:00Z").expect("start"),
            UtcDateTime::parse("2024-03-04T17:00:00Z").expect("end"),
        )
        .expect("request")
    }

    #[test]
    fn follows_page_tokens_and_sends_key_headers() {
        let first = r#"{"bars":[{"t":"2024-03-04T14:00:00Z","o":410.1,"h":412.0,"l":409.5,"c":411.2,"v":1200,"n":40,"vw":410.9}],"symbol":"MSFT","next_page_token":"abc"}"#;
        let second = r#"{"bars":[{"t":"2024-03-04T15:00:00Z","o":411.2,"h":413.0,"l":410.0,"c":412.5,"v":900,"n":31,"vw":411.7}],"symbol":"MSFT","next_page_token":null}"#;
        let client = Arc::new(RecordingHttpClient::replying(vec![
            Ok(HttpResponse::ok_json(first)),
            Ok(HttpResponse::ok_json(second)),
        ]));
        let adapter = AlpacaAdapter::with_http_client(client.clone(), "key-id", "secret");

        let bars = block_on(adapter.fetch(request())).expect("fetch");

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].trade_count, Some(40));
        assert_eq!(bars[1].vwap, Some(411.7));

        let requests = client.recorded_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].headers.get("apca-api-key-id").map(String::as_str),
            Some("key-id")
        );
        assert!(requests[0].full_url().contains("timeframe=1Hour"));
        assert!(requests[1].full_url().ends_with("page_token=abc"));
    }

    #[test]
    fn unprocessable_symbol_is_permanent() {
        let client = Arc::new(RecordingHttpClient::replying(vec![Ok(HttpResponse::new(
            422,
            r#"{"message":"invalid symbol"}"#,
        ))]));
        let adapter = AlpacaAdapter::with_http_client(client, "key-id", "secret");

        let error = block_on(adapter.fetch(request())).expect_err("invalid symbol");
        assert_eq!(error.code(), "provider.invalid_symbol");
    }

    #[test]
    fn empty_page_yields_no_bars() {
        let client = Arc::new(RecordingHttpClient::replying(vec![Ok(HttpResponse::ok_json(
            r#"{"bars":null,"symbol":"MSFT","next_page_token":null}"#,
        ))]));
        let adapter = AlpacaAdapter::with_http_client(client, "key-id", "secret");

        assert!(block_on(adapter.fetch(request())).expect("fetch").is_empty());
    }
}
