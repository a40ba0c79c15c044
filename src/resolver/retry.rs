//! Bounded exponential backoff and call spacing for upstream services

use crate::config::{RateLimit, RetryPolicy};
use crate::error::ProviderError;
use rand::Rng;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Run `call` until it succeeds, fails non-transiently, or the attempt
/// budget is spent
///
/// The delay before retry `k` (0-based) is `base_delay * 2^k` plus uniform
/// jitter in `[0, max_jitter]`. The last error is returned on exhaustion.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: impl FnMut() -> Result<T, ProviderError>,
) -> Result<T, ProviderError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let jitter = if policy.max_jitter_ms > 0 {
                    rand::thread_rng().gen_range(0..=policy.max_jitter_ms)
                } else {
                    0
                };
                let delay = policy.backoff(attempt) + Duration::from_millis(jitter);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient upstream failure, retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Enforces a minimum interval between successive calls
///
/// Callers block in `wait` until the interval since the previous call has
/// elapsed; concurrent callers queue on the internal lock.
pub struct RateLimiter {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: &RateLimit) -> Self {
        Self {
            min_interval: Duration::from_millis(limit.min_interval_ms),
            last_call: Mutex::new(None),
        }
    }

    pub fn wait(&self) {
        let mut last = match self.last_call.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                thread::sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_jitter_ms: 0,
        }
    }

    #[test]
    fn test_transient_then_success() {
        let calls = Cell::new(0);
        let result = retry_with_backoff(&fast_policy(3), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(ProviderError::Transient("timeout".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_exhaustion_returns_last_error() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast_policy(3), "test", || {
            calls.set(calls.get() + 1);
            Err(ProviderError::Transient("HTTP 503".into()))
        });
        assert_eq!(result.unwrap_err(), ProviderError::Transient("HTTP 503".into()));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_fatal_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry_with_backoff(&fast_policy(3), "test", || {
            calls.set(calls.get() + 1);
            Err(ProviderError::Fatal("HTTP 400".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_rate_limiter_spaces_calls() {
        let limiter = RateLimiter::new(&RateLimit { min_interval_ms: 30 });
        let start = Instant::now();
        limiter.wait();
        limiter.wait();
        limiter.wait();
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
