// SPDX-License-Identifier: MIT
//! Backoff strategies for external calls.
//!
//! Two distinct jittered formulas are used across this crate:
//!
//! - [`full_jitter_delay`] — used for outbound call retries: the delay is
//!   drawn uniformly from `[0, min(maxDelay, baseDelay * 2^attempt)]`. A full
//!   random draw, rather than a multiplicative jitter window, avoids
//!   synchronized retry storms across many charging stations retrying the
//!   same call at once.
//! - [`reconnect_jitter_delay`] — used for the client reconnect loop:
//!   `min(backoffMax, backoffMin * 2^(n-1) * (0.5 + rand*0.5))`. Proportional
//!   jitter around a rising baseline, so the delay never drops arbitrarily
//!   close to zero the way a full jitter draw could.
//!
//! [`retry_with_backoff`] remains the plain multiplicative-backoff helper
//! for internal operations that do not need jitter (e.g. one-shot startup
//! checks).

use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for [`retry_with_backoff`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    ///
    /// Default: 3
    pub max_attempts: u32,
    /// Delay before the second attempt.
    ///
    /// Each subsequent delay is multiplied by `multiplier`.
    /// Default: 500 ms
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    ///
    /// Default: 30 s
    pub max_delay: Duration,
    /// Multiplier applied to the previous delay on each retry.
    ///
    /// Default: 2.0 (doubles each time)
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config suitable for quick unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    /// Create a config with a single attempt (no retries).
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Calls `f()` up to `config.max_attempts` times. On each failure, waits for
/// the computed backoff delay before trying again. The delay starts at
/// `config.initial_delay` and is multiplied by `config.multiplier` after each
/// attempt, capped at `config.max_delay`.
///
/// Returns `Ok(result)` on the first success, or `Err(last_error)` after all
/// attempts have been exhausted.
///
/// # Panics
/// Panics if `config.max_attempts` is 0 (would never attempt the operation).
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    assert!(
        config.max_attempts > 0,
        "RetryConfig.max_attempts must be at least 1"
    );

    let mut delay = config.initial_delay;
    let mut last_err: Option<E> = None;

    for attempt in 1..=config.max_attempts {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt < config.max_attempts {
                    warn!(
                        attempt,
                        max = config.max_attempts,
                        delay_ms = delay.as_millis(),
                        err = ?e,
                        "attempt failed — retrying"
                    );
                    tokio::time::sleep(delay).await;
                    let next_ms = (delay.as_millis() as f64 * config.multiplier) as u128;
                    delay = Duration::from_millis(next_ms.min(config.max_delay.as_millis()) as u64);
                } else {
                    warn!(
                        attempt,
                        max = config.max_attempts,
                        err = ?e,
                        "all retry attempts exhausted"
                    );
                    last_err = Some(e);
                }
            }
        }
    }

    Err(last_err.expect("retry loop ended without setting last_err"))
}

/// Convenience wrapper: retry with the default config.
pub async fn retry<F, Fut, T, E>(f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    retry_with_backoff(&RetryConfig::default(), f).await
}

/// Full-jitter delay for outbound call retries: uniformly drawn from
/// `[0, min(maxDelay, baseDelay * 2^attempt)]`.
///
/// `attempt` is zero-based (the first retry uses `attempt == 0`).
pub fn full_jitter_delay(base_delay: Duration, max_delay: Duration, attempt: u32) -> Duration {
    use rand::Rng;
    let exp = 2f64.powi(attempt as i32);
    let upper_ms = (base_delay.as_millis() as f64 * exp).min(max_delay.as_millis() as f64);
    let upper_ms = upper_ms.max(0.0) as u64;
    if upper_ms == 0 {
        return Duration::ZERO;
    }
    let drawn = rand::thread_rng().gen_range(0..=upper_ms);
    Duration::from_millis(drawn)
}

/// Proportional-jitter delay for the client reconnect loop:
/// `min(backoffMax, backoffMin * 2^(n-1) * (0.5 + rand*0.5))`.
///
/// `attempt` is one-based (`n` in the formula — the first reconnect attempt
/// uses `attempt == 1`).
pub fn reconnect_jitter_delay(backoff_min: Duration, backoff_max: Duration, attempt: u32) -> Duration {
    use rand::Rng;
    let attempt = attempt.max(1);
    let exp = 2f64.powi((attempt - 1) as i32);
    let jitter = 0.5 + rand::thread_rng().gen::<f64>() * 0.5;
    let ms = backoff_min.as_millis() as f64 * exp * jitter;
    let capped = ms.min(backoff_max.as_millis() as f64).max(0.0) as u64;
    Duration::from_millis(capped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let cfg = RetryConfig::instant();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(&cfg, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let cfg = RetryConfig::instant();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(&cfg, || {
            let c = calls2.clone();
            async move {
                let n = c.fetch_add(1, Ordering::Relaxed) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn returns_last_error_after_all_attempts() {
        let cfg = RetryConfig {
            max_attempts: 3,
            ..RetryConfig::instant()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_with_backoff(&cfg, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err("permanent error".to_string())
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn full_jitter_never_exceeds_cap() {
        let max = Duration::from_millis(100);
        for attempt in 0..10 {
            for _ in 0..50 {
                let d = full_jitter_delay(Duration::from_millis(10), max, attempt);
                assert!(d <= max);
            }
        }
    }

    #[test]
    fn full_jitter_can_return_zero() {
        // With enough draws at attempt 0 and a small base, we should see variety
        // down toward zero rather than a fixed constant every time.
        let mut saw_small = false;
        for _ in 0..200 {
            let d = full_jitter_delay(Duration::from_millis(10), Duration::from_millis(100), 0);
            if d < Duration::from_millis(3) {
                saw_small = true;
            }
        }
        assert!(saw_small, "expected some draws near zero");
    }

    #[test]
    fn reconnect_jitter_grows_and_caps() {
        let min = Duration::from_millis(100);
        let max = Duration::from_secs(5);
        let d1 = reconnect_jitter_delay(min, max, 1);
        assert!(d1 >= Duration::from_millis(50) && d1 <= Duration::from_millis(100));

        for attempt in 1..30 {
            let d = reconnect_jitter_delay(min, max, attempt);
            assert!(d <= max);
        }
    }
}
