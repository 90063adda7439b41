//! Retry policies for block dispatch and commit requests.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{ErrorCode, StorageError, StorageResult};

/// How failed requests are retried.
///
/// Only errors whose code is [retryable](ErrorCode::is_retryable) are
/// resent; client errors and failed preconditions surface immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Every request is sent exactly once.
    None,
    /// Retries after a constant delay.
    Linear { max_retries: u32, delay: Duration },
    /// Retries after a delay that doubles on every attempt, up to `max_delay`.
    Exponential {
        max_retries: u32,
        base: Duration,
        max_delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            max_retries: 3,
            base: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::None => 0,
            RetryPolicy::Linear { max_retries, .. } | RetryPolicy::Exponential { max_retries, .. } => {
                *max_retries
            }
        }
    }

    /// Delay to wait before sending attempt number `attempt` (1-based retry).
    pub fn backoff(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::None => Duration::ZERO,
            RetryPolicy::Linear { delay, .. } => *delay,
            RetryPolicy::Exponential {
                base, max_delay, ..
            } => {
                let factor = 1u32 << attempt.saturating_sub(1).min(16);
                base.saturating_mul(factor).min(*max_delay)
            }
        }
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. `op` receives the zero-based attempt number.
    pub async fn run<F, Fut, T>(&self, mut op: F) -> StorageResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.code.is_retryable() && attempt < self.max_retries() => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(
                        "Request failed with {}, retrying in {:?} (attempt {}/{})",
                        e.code.as_str(),
                        delay,
                        attempt,
                        self.max_retries()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether an append failure seen on a retry can mean that an earlier attempt
/// already landed.
///
/// Only a position mismatch qualifies. A retry sent at the right position
/// that fails the size limit proves the block is not there.
pub fn is_absorbable(err: &StorageError) -> bool {
    err.code == ErrorCode::AppendPositionConditionNotMet
}
