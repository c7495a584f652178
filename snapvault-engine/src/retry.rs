//! Per-object retry with exponential backoff.
//!
//! Only errors the store marks as transient are retried. Each object retries
//! on its own schedule, so one throttled key never holds back its siblings.

use crate::config::RetryConfig;
use crate::store::StoreError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `operation` until it succeeds, fails permanently, runs out of
/// attempts, or `cancel` fires during a backoff sleep.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    what: &str,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= config.max_attempts || !e.is_transient() {
                    return Err(e);
                }

                tracing::debug!(target_object = %what, attempt, error = %e, "Retrying after transient error");
                if !wait_before_retry(config, attempt, cancel).await {
                    return Err(e);
                }
            }
        }
    }
}

/// Sleep out the backoff that follows failed attempt number `attempt`.
/// Returns `false` if `cancel` fired first.
pub async fn wait_before_retry(
    config: &RetryConfig,
    attempt: u32,
    cancel: &CancellationToken,
) -> bool {
    let backoff = calculate_backoff(config, attempt);
    tokio::select! {
        _ = tokio::time::sleep(backoff) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Exponential backoff, `initial * 2^(attempt-1)` capped at the maximum,
/// plus up to 10% jitter.
fn calculate_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base_ms = config
        .initial_backoff_ms
        .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let capped_ms = base_ms.min(config.max_backoff_ms);
    Duration::from_millis(capped_ms + jitter(capped_ms / 10))
}

fn jitter(max: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    nanos % max.max(1)
}
