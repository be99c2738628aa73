//! Bounded retry with exponential backoff and jitter
//!
//! [`RetryPolicy::run`] re-invokes a fallible operation while it reports
//! [`Outcome::Failure`], whatever the fault. `Value` and `Empty` are final
//! answers and are returned immediately. Work done on the result outside the
//! wrapped call (decoding, for instance) is never retried. Backoff suspends
//! only the calling task.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::ErrorRecord;
use crate::outcome::Outcome;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    config: RetryConfig,
}

/// Per-invocation bookkeeping, never persisted
#[derive(Debug)]
struct RetryState {
    attempts_remaining: u32,
    last_error: Option<ErrorRecord>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before retry number `retry` (0-based), without jitter
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.delay_ms(retry, 0.0))
    }

    /// Delay before retry number `retry` (0-based), jittered with `rng`
    pub fn delay_for<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let spread = self.config.jitter.abs();
        let jitter = if spread > 0.0 {
            rng.gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_millis(self.delay_ms(retry, jitter))
    }

    fn delay_ms(&self, retry: u32, jitter: f64) -> u64 {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let nominal = self.config.base_delay_ms as f64 * self.config.factor.powi(exponent);
        let jittered = nominal * (1.0 + jitter);
        let capped = jittered.clamp(0.0, self.config.max_delay_ms as f64);
        // float-to-int `as` saturates; NaN maps to zero
        capped.round() as u64
    }

    /// Run `operation` until it stops failing or the budget is spent
    ///
    /// The operation is invoked at most `max_attempts` times. Exhaustion yields
    /// a `RetryLimitExceeded` failure wrapping the last fault.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> Outcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Outcome<T>>,
    {
        let budget = self.config.max_attempts.max(1);
        let mut state = RetryState {
            attempts_remaining: budget,
            last_error: None,
        };

        while state.attempts_remaining > 0 {
            state.attempts_remaining -= 1;
            let record = match f().await {
                Outcome::Failure(record) => record,
                done => return done,
            };

            if state.attempts_remaining > 0 {
                let attempt = budget - state.attempts_remaining;
                let delay = self.delay_for(attempt - 1, &mut rand::thread_rng());
                warn!(
                    operation,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %record,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            state.last_error = Some(record);
        }

        debug!(operation, attempts = budget, "retry budget exhausted");
        Outcome::Failure(ErrorRecord::retry_limit_exceeded(
            operation,
            budget,
            state.last_error,
        ))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
