use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

use crate::provider::{FetchRequest, ProviderAdapter, ProviderCapabilities, ProviderError, RawBar};
use crate::{ProviderId, Timeframe};

/// In-memory provider for tests and replays.
///
/// Serves a fixed set of bars filtered to the requested window. Scripted
/// failures queued with [`FixtureAdapter::fail_next`] are returned first,
/// one per call.
pub struct FixtureAdapter {
    id: ProviderId,
    capabilities: ProviderCapabilities,
    bars: Mutex<Vec<RawBar>>,
    failures: Mutex<VecDeque<ProviderError>>,
    requests: Mutex<Vec<FetchRequest>>,
    calls: AtomicUsize,
    latency: Option<Duration>,
}

impl Default for FixtureAdapter {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FixtureAdapter {
    pub fn new(bars: Vec<RawBar>) -> Self {
        Self {
            id: ProviderId::Fixture,
            capabilities: ProviderCapabilities {
                timeframes: Timeframe::ALL.to_vec(),
                max_bars_per_request: 10_000,
            },
            bars: Mutex::new(bars),
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            latency: None,
        }
    }

    /// Report a different provider id, e.g. to replay recorded Yahoo data.
    pub fn with_id(mut self, id: ProviderId) -> Self {
        self.id = id;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue one failure for the next call.
    pub fn fail_next(&self, error: ProviderError) {
        self.failures
            .lock()
            .expect("fixture failure queue should not be poisoned")
            .push_back(error);
    }

    /// Replace the served bars.
    pub fn set_bars(&self, bars: Vec<RawBar>) {
        *self
            .bars
            .lock()
            .expect("fixture bars should not be poisoned") = bars;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests
            .lock()
            .expect("fixture request log should not be poisoned")
            .clone()
    }

    fn serve(&self, request: &FetchRequest) -> Result<Vec<RawBar>, ProviderError> {
        if let Some(error) = self
            .failures
            .lock()
            .expect("fixture failure queue should not be poisoned")
            .pop_front()
        {
            return Err(error);
        }

        let start = request.start.into_inner();
        let end = request.end.into_inner();
        Ok(self
            .bars
            .lock()
            .expect("fixture bars should not be poisoned")
            .iter()
            .filter(|bar| bar.time >= start && bar.time < end)
            .cloned()
            .collect())
    }
}

impl ProviderAdapter for FixtureAdapter {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    fn fetch<'a>(
        &'a self,
        request: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<RawBar>, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .expect("fixture request log should not be poisoned")
                .push(request.clone());
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            self.serve(&request)
        })
    }
}

/// Deterministic, valid bars spaced one `timeframe` apart.
pub fn synthetic_series(start: OffsetDateTime, timeframe: Timeframe, count: usize) -> Vec<RawBar> {
    (0..count)
        .map(|index| {
            let step = i32::try_from(index).unwrap_or(i32::MAX);
            let offset = timeframe.duration() * step;
            let wave = f64::from(step % 7) * 0.25;
            let open = 100.0 + wave;
            let close = open + 0.5;
            RawBar {
                time: start + offset,
                open,
                high: close + 0.25,
                low: open - 0.25,
                close,
                volume: 1_000 + i64::from(step % 5) * 100,
                trade_count: Some(10),
                vwap: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::adapters::test_support::block_on;
    use crate::{Symbol, UtcDateTime};

    fn request(start: OffsetDateTime, end: OffsetDateTime) -> FetchRequest {
        FetchRequest::new(
            Symbol::parse("SPY").expect("symbol"),
            Timeframe::OneDay,
            UtcDateTime::from_any_offset(start),
            UtcDateTime::from_any_offset(end),
        )
        .expect("request")
    }

    #[test]
    fn serves_bars_inside_window_only() {
        let start = datetime!(2024-01-01 00:00 UTC);
        let adapter = FixtureAdapter::new(synthetic_series(start, Timeframe::OneDay, 10));

        let bars = block_on(adapter.fetch(request(
            datetime!(2024-01-03 00:00 UTC),
            datetime!(2024-01-06 00:00 UTC),
        )))
        .expect("fetch");

        assert_eq!(bars.len(), 3);
        assert_eq!(bars[0].time, datetime!(2024-01-03 00:00 UTC));
        assert_eq!(adapter.call_count(), 1);
    }

    #[test]
    fn scripted_failures_come_first() {
        let start = datetime!(2024-01-01 00:00 UTC);
        let adapter = FixtureAdapter::new(synthetic_series(start, Timeframe::OneDay, 2));
        adapter.fail_next(ProviderError::unavailable("scripted outage"));

        let window = request(start, datetime!(2024-01-10 00:00 UTC));
        assert!(block_on(adapter.fetch(window.clone())).is_err());
        assert_eq!(block_on(adapter.fetch(window)).expect("second call").len(), 2);
        assert_eq!(adapter.requests().len(), 2);
    }

    #[test]
    fn synthetic_bars_satisfy_bar_bounds() {
        for bar in synthetic_series(datetime!(2024-01-01 00:00 UTC), Timeframe::OneMinute, 50) {
            assert!(bar.low <= bar.open && bar.open <= bar.high);
            assert!(bar.low <= bar.close && bar.close <= bar.high);
        }
    }
}
