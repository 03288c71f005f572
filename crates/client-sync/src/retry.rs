//! Bounded exponential backoff for batch sends.
//!
//! The default policy performs no retries: a failed telemetry batch is
//! dropped. Raising `max_retries` trades memory and latency for delivery.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use client_sync_core::{Config, NetworkError};

/// Retry configuration for [`crate::flush::FlushScheduler`] sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRetryPolicy {
    /// Maximum number of retry attempts after the first send (default: 0).
    pub max_retries: u32,
    /// Base delay for the first retry (default: 500ms).
    pub base_delay: Duration,
    /// Maximum delay cap (default: 8s).
    pub max_delay: Duration,
}

impl Default for FlushRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl FlushRetryPolicy {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.flush_max_retries,
            base_delay: config.flush_retry_base_delay,
            max_delay: config.flush_retry_max_delay,
        }
    }

    /// Calculate the delay for a given retry (0-indexed).
    ///
    /// Formula: `min(base_delay * 2^attempt, max_delay)` + ±25% jitter.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        #[allow(clippy::cast_possible_wrap)]
        let exponent = attempt.min(30) as i32;
        let raw = (base_ms * 2.0_f64.powi(exponent)).min(max_ms);

        let jittered = raw.mul_add(0.25 * jitter_factor(), raw);
        // minimum 10ms
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ms = jittered.max(10.0) as u64;
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. Returns the last result and the attempts made.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> (Result<T, NetworkError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, NetworkError>>,
    {
        let mut attempt = 0;
        loop {
            let result = op().await;
            attempt += 1;
            match result {
                Err(err) if attempt <= self.max_retries && is_retryable(&err) => {
                    let delay = self.delay_for_attempt(attempt - 1);
                    tracing::debug!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying batch send"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return (other, attempt),
            }
        }
    }
}

/// Transient failures worth another attempt. Client errors other than
/// 408/429 will fail the same way again.
#[must_use]
pub const fn is_retryable(err: &NetworkError) -> bool {
    match err {
        NetworkError::Timeout(_) | NetworkError::Connectivity(_) | NetworkError::Aborted(_) => true,
        NetworkError::Status { code, .. } => *code >= 500 || *code == 408 || *code == 429,
        NetworkError::Decode(_) => false,
    }
}

/// Generate a jitter factor in `[-1.0, 1.0]` using a simple LCG.
fn jitter_factor() -> f64 {
    static SEED: AtomicU64 = AtomicU64::new(0);

    // Mix in current time on first use.
    if SEED.load(Ordering::Relaxed) == 0 {
        let init = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(12345, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX));
        SEED.compare_exchange(0, init, Ordering::Relaxed, Ordering::Relaxed)
            .ok();
    }

    // LCG: x' = (a*x + c) mod 2^64
    let a: u64 = 6_364_136_223_846_793_005;
    let c: u64 = 1_442_695_040_888_963_407;
    let val = SEED
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
            Some(x.wrapping_mul(a).wrapping_add(c))
        })
        .unwrap_or(42);

    // Map to [-1.0, 1.0]
    #[allow(clippy::cast_precision_loss)]
    let mapped = (val as f64 / u64::MAX as f64).mul_add(2.0, -1.0);
    mapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = FlushRetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        for _ in 0..50 {
            let d0 = policy.delay_for_attempt(0).as_millis();
            assert!((75..=125).contains(&d0), "attempt 0 delay {d0}");
            let d2 = policy.delay_for_attempt(2).as_millis();
            assert!((300..=500).contains(&d2), "attempt 2 delay {d2}");
            let d9 = policy.delay_for_attempt(9).as_millis();
            assert!((750..=1250).contains(&d9), "capped delay {d9}");
        }
    }

    #[test]
    fn delay_has_floor() {
        let policy = FlushRetryPolicy {
            max_retries: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(10));
    }

    #[test]
    fn retryable_classification() {
        assert!(is_retryable(&NetworkError::Timeout("x".into())));
        assert!(is_retryable(&NetworkError::status(503, "x")));
        assert!(is_retryable(&NetworkError::status(429, "x")));
        assert!(!is_retryable(&NetworkError::status(400, "x")));
        assert!(!is_retryable(&NetworkError::Decode("x".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn default_policy_does_not_retry() {
        let calls = AtomicU32::new(0);
        let (result, attempts) = FlushRetryPolicy::default()
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(NetworkError::Connectivity("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = FlushRetryPolicy {
            max_retries: 3,
            ..FlushRetryPolicy::default()
        };
        let (result, attempts) = policy
            .run(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(NetworkError::Timeout("slow".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let policy = FlushRetryPolicy {
            max_retries: 3,
            ..FlushRetryPolicy::default()
        };
        let (result, attempts) = policy
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(NetworkError::status(400, "bad batch"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
}
