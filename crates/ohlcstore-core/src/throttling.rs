use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

use crate::ProviderId;

/// Request quota of one upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderPolicy {
    pub provider_id: ProviderId,
    pub quota_window: Duration,
    pub quota_limit: u32,
}

impl ProviderPolicy {
    pub fn yahoo_default() -> Self {
        Self {
            provider_id: ProviderId::Yahoo,
            quota_window: Duration::from_secs(60),
            quota_limit: 60,
        }
    }

    pub fn alpaca_default() -> Self {
        Self {
            provider_id: ProviderId::Alpaca,
            quota_window: Duration::from_secs(60),
            quota_limit: 200,
        }
    }

    pub fn polygon_default() -> Self {
        Self {
            provider_id: ProviderId::Polygon,
            quota_window: Duration::from_secs(60),
            quota_limit: 5,
        }
    }

    /// Local providers are only bounded to keep runaway loops in check.
    pub fn local_default(provider_id: ProviderId) -> Self {
        Self {
            provider_id,
            quota_window: Duration::from_secs(1),
            quota_limit: 10_000,
        }
    }

    pub fn default_for(provider_id: ProviderId) -> Self {
        match provider_id {
            ProviderId::Yahoo => Self::yahoo_default(),
            ProviderId::Alpaca => Self::alpaca_default(),
            ProviderId::Polygon => Self::polygon_default(),
            ProviderId::Fixture | ProviderId::Rollup => Self::local_default(provider_id),
        }
    }
}

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate gate shared by every job that calls one provider.
#[derive(Clone)]
pub struct ThrottlingQueue {
    limiter: Arc<DirectRateLimiter>,
    clock: DefaultClock,
    waiting: Arc<AtomicUsize>,
}

impl ThrottlingQueue {
    pub fn new(quota_window: Duration, quota_limit: u32) -> Self {
        let clock = DefaultClock::default();
        let quota = quota_from_window(quota_window, quota_limit);
        Self {
            limiter: Arc::new(RateLimiter::direct_with_clock(quota, &clock)),
            clock,
            waiting: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_policy(policy: &ProviderPolicy) -> Self {
        Self::new(policy.quota_window, policy.quota_limit)
    }

    /// Take one cell of budget now, or report how long until one frees up.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(self.clock.now()))
    }

    /// Wait until budget is available, then take it.
    pub async fn acquire(&self) {
        let _waiting = WaitingGuard::enter(&self.waiting);
        self.limiter.until_ready().await;
    }

    /// Number of callers currently parked in [`ThrottlingQueue::acquire`].
    pub fn waiting_len(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn quota_from_window(quota_window: Duration, quota_limit: u32) -> Quota {
    let burst = NonZeroU32::new(quota_limit).unwrap_or(NonZeroU32::MIN);
    let seconds_per_cell = (quota_window.as_secs_f64() / f64::from(burst.get())).max(0.000_1);

    Quota::with_period(Duration::from_secs_f64(seconds_per_cell))
        .map_or_else(|| Quota::per_second(burst), |quota| quota.allow_burst(burst))
}
