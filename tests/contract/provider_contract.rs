//! Contract tests every provider adapter must satisfy.
//!
//! Each case drives an adapter through the ingestion pipeline over a
//! scripted transport, so the checks cover what ends up stored rather
//! than adapter internals.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ohlcstore_core::adapters::{AlpacaAdapter, FixtureAdapter, YahooAdapter};
use ohlcstore_core::http_client::{HttpClient, HttpError, HttpRequest, HttpResponse};
use ohlcstore_core::provider::{ProviderAdapter, RawBar};
use ohlcstore_core::retry::RetryConfig;
use ohlcstore_core::store::BarStore;
use ohlcstore_core::{
    IngestionPipeline, JobStatus, ProviderId, Symbol, Timeframe, UtcDateTime,
};
use ohlcstore_warehouse::{Warehouse, WarehouseConfig, MICROS_PER_DAY};
use tempfile::tempdir;
use time::macros::datetime;

const YAHOO_CHART: &str = r#"{
    "chart": {
        "result": [{
            "meta": {"symbol": "AAPL"},
            "timestamp": [1704205800, 1704292200, 1704378600],
            "indicators": {"quote": [{
                "open":   [187.15, null, 182.15],
                "high":   [188.44, null, 183.09],
                "low":    [183.89, null, 180.88],
                "close":  [185.64, null, 181.91],
                "volume": [82488700, null, 71983600]
            }]}
        }],
        "error": null
    }
}"#;

const ALPACA_DAILY: &str = r#"{"bars":[
    {"t":"2024-01-02T05:00:00Z","o":187.15,"h":188.44,"l":183.89,"c":185.64,"v":82488700,"n":1009074,"vw":185.9},
    {"t":"2024-01-04T05:00:00Z","o":182.15,"h":183.09,"l":180.88,"c":181.91,"v":71983600,"n":812425,"vw":181.97}
],"symbol":"AAPL","next_page_token":null}"#;

/// Replays scripted responses in order and counts calls.
struct ScriptedHttpClient {
    responses: Mutex<Vec<Result<HttpResponse, HttpError>>>,
    calls: Mutex<Vec<HttpRequest>>,
}

impl ScriptedHttpClient {
    fn new(mut responses: Vec<Result<HttpResponse, HttpError>>) -> Self {
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().expect("call log should not be poisoned").len()
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        self.calls
            .lock()
            .expect("call log should not be poisoned")
            .push(request);
        let response = self
            .responses
            .lock()
            .expect("response script should not be poisoned")
            .pop()
            .unwrap_or_else(|| Err(HttpError::new("script exhausted")));
        Box::pin(async move { response })
    }
}

struct ProviderCase {
    id: ProviderId,
    build: fn(Arc<ScriptedHttpClient>) -> Arc<dyn ProviderAdapter>,
    success_body: &'static str,
    not_found: HttpResponse,
}

fn provider_cases() -> Vec<ProviderCase> {
    vec![
        ProviderCase {
            id: ProviderId::Yahoo,
            build: |client| Arc::new(YahooAdapter::with_http_client(client)),
            success_body: YAHOO_CHART,
            not_found: HttpResponse::new(404, "Not Found"),
        },
        ProviderCase {
            id: ProviderId::Alpaca,
            build: |client| Arc::new(AlpacaAdapter::with_http_client(client, "key-id", "secret")),
            success_body: ALPACA_DAILY,
            not_found: HttpResponse::new(422, r#"{"message":"invalid symbol"}"#),
        },
    ]
}

fn open_store(dir: &Path) -> BarStore {
    BarStore::new(
        Warehouse::open(WarehouseConfig {
            home: dir.to_path_buf(),
            db_path: dir.join("contract.duckdb"),
            max_pool_size: 2,
            chunk_width_us: 7 * MICROS_PER_DAY,
        })
        .expect("warehouse open"),
    )
}

fn window() -> (UtcDateTime, UtcDateTime) {
    (
        UtcDateTime::from_any_offset(datetime!(2024-01-02 00:00 UTC)),
        UtcDateTime::from_any_offset(datetime!(2024-01-05 00:00 UTC)),
    )
}

fn aapl() -> Symbol {
    Symbol::parse("AAPL").expect("symbol")
}

fn pipeline(dir: &Path, adapter: Arc<dyn ProviderAdapter>) -> IngestionPipeline {
    IngestionPipeline::new(open_store(dir))
        .with_provider(adapter)
        .with_retry(RetryConfig::fixed(Duration::from_millis(5), 2))
}

#[tokio::test]
async fn successful_fetch_stores_valid_bars_for_all_providers() {
    for case in provider_cases() {
        let temp = tempdir().expect("tempdir");
        let client = Arc::new(ScriptedHttpClient::new(vec![Ok(HttpResponse::ok_json(
            case.success_body,
        ))]));
        let pipeline = pipeline(temp.path(), (case.build)(client));
        let (start, end) = window();

        let job = pipeline
            .ingest(aapl(), Timeframe::OneDay, start, end, case.id)
            .await
            .expect("ingest");

        assert_eq!(job.status, JobStatus::Success, "provider '{}': status", case.id);
        assert_eq!(job.rows_inserted, 2, "provider '{}': rows", case.id);

        let stored = pipeline
            .store()
            .query(&aapl(), Timeframe::OneDay, start, end)
            .await
            .expect("query");
        assert_eq!(stored.len(), 2, "provider '{}': stored", case.id);
        for bar in &stored {
            bar.validate()
                .unwrap_or_else(|error| panic!("provider '{}' stored invalid bar: {error}", case.id));
            assert_eq!(bar.source, case.id, "provider '{}': source", case.id);
            assert!(bar.time >= start && bar.time < end);
        }
        assert!(stored.windows(2).all(|pair| pair[0].time < pair[1].time));
    }
}

#[tokio::test]
async fn upstream_outage_is_retried_for_all_providers() {
    for case in provider_cases() {
        let temp = tempdir().expect("tempdir");
        let client = Arc::new(ScriptedHttpClient::new(vec![
            Ok(HttpResponse::new(503, "Service Unavailable")),
            Ok(HttpResponse::ok_json(case.success_body)),
        ]));
        let pipeline = pipeline(temp.path(), (case.build)(Arc::clone(&client)));
        let (start, end) = window();

        let job = pipeline
            .ingest(aapl(), Timeframe::OneDay, start, end, case.id)
            .await
            .expect("ingest");

        assert_eq!(job.status, JobStatus::Success, "provider '{}': status", case.id);
        assert_eq!(job.retries, 1, "provider '{}': retries", case.id);
        assert_eq!(client.call_count(), 2, "provider '{}': calls", case.id);
    }
}

#[tokio::test]
async fn transport_timeout_is_retried_for_all_providers() {
    for case in provider_cases() {
        let temp = tempdir().expect("tempdir");
        let client = Arc::new(ScriptedHttpClient::new(vec![
            Err(HttpError::timeout("request timed out")),
            Ok(HttpResponse::ok_json(case.success_body)),
        ]));
        let pipeline = pipeline(temp.path(), (case.build)(Arc::clone(&client)));
        let (start, end) = window();

        let job = pipeline
            .ingest(aapl(), Timeframe::OneDay, start, end, case.id)
            .await
            .expect("ingest");

        assert_eq!(job.status, JobStatus::Success, "provider '{}': status", case.id);
        assert_eq!(job.retries, 1, "provider '{}': retries", case.id);
    }
}

#[tokio::test]
async fn unknown_symbol_fails_without_retry_for_all_providers() {
    for case in provider_cases() {
        let temp = tempdir().expect("tempdir");
        let client = Arc::new(ScriptedHttpClient::new(vec![Ok(case.not_found.clone())]));
        let pipeline = pipeline(temp.path(), (case.build)(Arc::clone(&client)));
        let (start, end) = window();

        let job = pipeline
            .ingest(aapl(), Timeframe::OneDay, start, end, case.id)
            .await
            .expect("ingest");

        assert_eq!(job.status, JobStatus::Failed, "provider '{}': status", case.id);
        assert_eq!(job.retries, 0, "provider '{}': retries", case.id);
        assert_eq!(client.call_count(), 1, "provider '{}': calls", case.id);
        assert!(
            job.error_detail
                .as_deref()
                .is_some_and(|detail| detail.contains("provider.invalid_symbol")),
            "provider '{}': detail {:?}",
            case.id,
            job.error_detail
        );
    }
}

#[tokio::test]
async fn fixture_serves_only_the_requested_window() {
    let temp = tempdir().expect("tempdir");
    let bars: Vec<RawBar> = ohlcstore_core::adapters::synthetic_series(
        datetime!(2024-01-01 00:00 UTC),
        Timeframe::OneDay,
        10,
    );
    let fixture = Arc::new(FixtureAdapter::new(bars));
    let pipeline = pipeline(temp.path(), fixture.clone());
    let (start, end) = window();

    let job = pipeline
        .ingest(aapl(), Timeframe::OneDay, start, end, ProviderId::Fixture)
        .await
        .expect("ingest");

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.rows_inserted, 3);
    let requests = fixture.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!((requests[0].start, requests[0].end), (start, end));
}
