//! Retry controller
//!
//! Re-runs an operation on retryable failures with a bounded attempt budget.

use crate::monitoring::metrics;
use crate::tool::error::DbError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    pub delay: Duration,
    /// Delay multiplier per failed attempt; 1.0 keeps the delay fixed.
    pub backoff: f64,
    pub jitter: Duration,
}

/// Upper bound on the backed-off delay between two attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

pub const RETRY_OPT: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    delay: Duration::from_secs(1),
    backoff: 1.0,
    jitter: Duration::ZERO,
};

impl Default for RetryPolicy {
    fn default() -> Self {
        RETRY_OPT
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            ..RETRY_OPT
        }
    }

    pub fn with_backoff(mut self, backoff: f64) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before attempt `failed + 1`, after `failed` failures.
    ///
    /// The backed-off part never exceeds [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff.max(1.0).powi(exponent);
        let base = if self.delay.is_zero() {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(self.delay.as_secs_f64() * factor)
                .unwrap_or(MAX_RETRY_DELAY)
                .min(MAX_RETRY_DELAY)
        };

        let jitter_ms = self.jitter.as_millis().min(u64::MAX as u128) as u64;
        if jitter_ms == 0 {
            return base;
        }
        // 지터 추가
        base.saturating_add(Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms)))
    }

    /// Run `operation` under this policy. See [`with_retry`].
    pub async fn execute<T, F, Fut>(
        &self,
        operation_name: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        with_retry(self, operation_name, cancel, operation).await
    }
}

/// Invoke `operation` until it succeeds, fails permanently, the budget runs
/// out, or `cancel` fires.
///
/// - retryable failures ([`DbError::is_retryable`]) wait and try again;
/// - other failures are returned unchanged at once;
/// - exhaustion yields [`DbError::RetryExhausted`] with the last cause;
/// - cancellation, checked before every attempt and during the wait, yields
///   [`DbError::Cancelled`].
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DbError>>,
{
    if policy.max_attempts == 0 {
        return Err(DbError::InvalidInput(format!(
            "retry policy for '{}' allows no attempts",
            operation_name
        )));
    }
    if !policy.backoff.is_finite() {
        return Err(DbError::InvalidInput(format!(
            "retry policy for '{}' has a non-finite backoff",
            operation_name
        )));
    }

    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled(operation_name, attempts));
        }

        attempts += 1;
        let err = match operation().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!("'{}' succeeded on attempt {}", operation_name, attempts);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if matches!(err, DbError::Cancelled { .. }) {
            return Err(cancelled(operation_name, attempts));
        }

        if !err.is_retryable() {
            debug!("'{}' failed permanently: {}", operation_name, err);
            return Err(err);
        }

        if attempts >= policy.max_attempts {
            metrics::RETRIES_EXHAUSTED.inc();
            error!(
                "All {} attempts exhausted for '{}': {}",
                attempts, operation_name, err
            );
            return Err(DbError::RetryExhausted {
                operation: operation_name.to_string(),
                attempts,
                last: Box::new(err),
            });
        }

        let delay = policy.delay_for(attempts);
        metrics::RETRY_ATTEMPTS.inc();
        warn!(
            "'{}' attempt {}/{} failed: {}. Retrying in {:?}",
            operation_name, attempts, policy.max_attempts, err, delay
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(operation_name, attempts)),
            _ = sleep(delay) => {}
        }
    }
}

fn cancelled(operation_name: &str, attempts: u32) -> DbError {
    warn!("'{}' cancelled after {} attempts", operation_name, attempts);
    DbError::Cancelled {
        operation: operation_name.to_string(),
        attempts,
    }
}
