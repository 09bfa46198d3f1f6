//! Exponential backoff for transient store failures.

use crate::config::StoreConfig;
use crate::metrics::STORE_RETRIES_TOTAL;
use crate::store::StoreError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total calls including the first one.
    pub attempts: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            factor: config.retry_factor.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(100),
            factor: 2,
        }
    }
}

/// Run `call` until it succeeds, fails permanently or the attempts run out.
///
/// The last error is handed back to the caller instead of being raised further, so
/// the caller decides what happens to the work that could not be stored.
pub async fn retry_transient<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    cancel_token: &CancellationToken,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 0;
    let mut backoff = policy.base_delay.max(Duration::from_millis(1));

    loop {
        let err = match call().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => err,
        };

        attempt += 1;
        if attempt >= policy.attempts {
            return Err(err);
        }

        STORE_RETRIES_TOTAL.inc();
        warn!(
            operation,
            attempt,
            max_attempts = policy.attempts,
            error = %err,
            "transient store failure; retrying with backoff"
        );

        if !sleep_or_cancel(backoff, cancel_token).await {
            return Err(err);
        }
        backoff = std::cmp::min(backoff.saturating_mul(policy.factor), MAX_BACKOFF);
    }
}

/// Sleep for `duration`; `false` when cancelled first.
pub async fn sleep_or_cancel(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel_token.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
