//! Retry logic with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::ProviderError;

/// Delay schedule between provider attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * factor^attempt`, capped at `max`, optionally jittered by +/- 50%.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(200),
            factor: 2.0,
            max: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds = (base.as_secs_f64() * factor.powi(exponent)).min(max.as_secs_f64());
                let delay = Duration::from_secs_f64(seconds.max(0.0));
                if jitter {
                    apply_jitter(delay)
                } else {
                    delay
                }
            }
        }
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let spread = millis / 2;
    let low = millis - spread;
    Duration::from_millis(fastrand::u64(low..=millis.saturating_add(spread)))
}

/// Provider retry policy. Total attempts are `max_retries + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            enabled: true,
            max_retries,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    const fn retry_budget(&self) -> u32 {
        if self.enabled {
            self.max_retries
        } else {
            0
        }
    }
}

/// Result of a retried call plus the number of retries it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ProviderError>,
    pub retries: u32,
}

/// Run `operation` until it succeeds, fails permanently, or the retry
/// budget is spent. The closure receives the 0-based attempt number.
pub async fn retry_provider_call<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let budget = config.retry_budget();
    let mut retries = 0_u32;
    loop {
        match operation(retries).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    retries,
                }
            }
            Err(error) if error.retryable() && retries < budget => {
                let delay = config.delay_for_attempt(retries);
                tracing::warn!(
                    code = error.code(),
                    attempt = retries + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "provider call failed, retrying: {}",
                    error.message()
                );
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            Err(error) => {
                return Attempted {
                    result: Err(error),
                    retries,
                }
            }
        }
    }
}

/// Retry settings as they appear in the engine config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            factor: 2.0,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            enabled: settings.max_retries > 0,
            max_retries: settings.max_retries,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(settings.base_delay_ms),
                factor: settings.factor,
                max: Duration::from_millis(settings.max_delay_ms),
                jitter: settings.jitter,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(200),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(200));
        assert_eq!(backoff.delay(1), Duration::from_millis(400));
        assert_eq!(backoff.delay(2), Duration::from_millis(800));
        assert_eq!(backoff.delay(3), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_of_delay() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: true,
        };

        for _ in 0..20 {
            let millis = backoff.delay(2).as_millis();
            assert!((200..=600).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn settings_convert_to_config() {
        let config = RetryConfig::from(&RetrySettings::default());
        assert!(config.enabled);
        assert_eq!(config.max_retries, 3);

        let disabled = RetryConfig::from(&RetrySettings {
            max_retries: 0,
            ..RetrySettings::default()
        });
        assert!(!disabled.enabled);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let config = RetryConfig::fixed(Duration::from_millis(1), 3);
        let calls = AtomicU32::new(0);

        let attempted = retry_provider_call(&config, |_| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 2 {
                    Err(ProviderError::unavailable("503"))
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(attempted.result.expect("third call succeeds"), 2);
        assert_eq!(attempted.retries, 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let config = RetryConfig::fixed(Duration::from_millis(1), 3);
        let calls = AtomicU32::new(0);

        let attempted: Attempted<()> = retry_provider_call(&config, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::invalid_request("bad range")) }
        })
        .await;

        assert!(attempted.result.is_err());
        assert_eq!(attempted.retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let config = RetryConfig::fixed(Duration::from_millis(1), 2);
        let calls = AtomicU32::new(0);

        let attempted: Attempted<()> = retry_provider_call(&config, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::timeout("slow")) }
        })
        .await;

        assert_eq!(attempted.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
