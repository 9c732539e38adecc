//! Bounded retry for optimistic-concurrency conflicts.

use crate::error::{StoreError, StoreResult};
use crate::resilience::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, warn};

/// How often and how patiently contended writes are retried
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreRetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Run `attempt` until it succeeds, fails with a non-contention error, or the attempt
/// budget is spent. Each call of `attempt` must re-read the record it modifies.
pub async fn with_contention_retry<T, F, Fut>(
    policy: &StoreRetryPolicy,
    operation: &str,
    mut attempt: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut tries = 0;

    loop {
        tries += 1;
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_contention() && tries < max_attempts => {
                let delay = policy.backoff.next(tries - 1);
                debug!(operation, attempt = tries, delay_ms = delay.as_millis() as u64, error = %err, "Write contention, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) if err.is_contention() => {
                warn!(operation, attempts = tries, error = %err, "Write contention did not resolve");
                return Err(StoreError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: tries,
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }
}
