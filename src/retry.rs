//! Retry policies for the periodic tasks.
//!
//! Both policies are exponential with jitter and a small retry budget. When a
//! budget is exhausted the caller runs its own fallback; nothing here
//! swallows errors.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `clock_sync_policy` | 1s | 60s | 3 | Time server exchange |
//! | `partition_refresh_policy` | 1s | 30s | 3 | Whole refresh cycle |
//! | `fast_policy` | 5ms | 100ms | 3 | Tests, local retries |
//!
//! # Example
//!
//! ```rust,no_run
//! use synthwatch::retry;
//! use backon::Retryable;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let result = (|| async { Ok::<_, std::io::Error>(()) })
//!         .retry(retry::clock_sync_policy())
//!         .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!         .await?;
//!
//!     Ok(result)
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::constants::{
    CLOCK_SYNC_MAX_BACKOFF, CLOCK_SYNC_MAX_RETRIES, PARTITION_REFRESH_MAX_BACKOFF,
    PARTITION_REFRESH_MAX_RETRIES,
};

/// Policy for a single time-server exchange.
///
/// The same server is retried; rotating to the next server is the caller's
/// fallback once this policy gives up.
pub fn clock_sync_policy() -> ExponentialBuilder {
    clock_sync_policy_with_min_delay(Duration::from_secs(1))
}

/// [`clock_sync_policy`] with a custom first delay. Tests use millisecond
/// delays to keep the suite fast.
pub fn clock_sync_policy_with_min_delay(min_delay: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(CLOCK_SYNC_MAX_BACKOFF)
        .with_max_times(CLOCK_SYNC_MAX_RETRIES)
        .with_jitter()
}

/// Policy for one partition refresh cycle.
///
/// Exhaustion permanently disables the rebalancer.
pub fn partition_refresh_policy() -> ExponentialBuilder {
    partition_refresh_policy_with_min_delay(Duration::from_secs(1))
}

/// [`partition_refresh_policy`] with a custom first delay.
pub fn partition_refresh_policy_with_min_delay(min_delay: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(PARTITION_REFRESH_MAX_BACKOFF)
        .with_max_times(PARTITION_REFRESH_MAX_RETRIES)
        .with_jitter()
}

/// Policy for hot path retries (minimal delay).
pub fn fast_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(100))
        .with_max_times(3)
        .with_jitter()
}

/// Execute an async operation with the given policy, counting attempts in
/// the retry metrics under `policy_name`.
///
/// Only errors for which `condition` returns true are retried.
pub async fn with_policy<F, Fut, T, E, C>(
    policy_name: &'static str,
    policy: ExponentialBuilder,
    operation: F,
    mut condition: C,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::error::Error,
    C: FnMut(&E) -> bool,
{
    let mut attempt = 0u32;
    let result = operation
        .retry(policy)
        .when(|e| condition(e))
        .notify(|e, delay| {
            attempt += 1;
            record_retry_attempt(policy_name, attempt);
            tracing::debug!(
                policy = policy_name,
                attempt,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Retrying after failure"
            );
        })
        .await;

    match &result {
        Ok(_) => record_retry_success(policy_name),
        Err(_) => record_retry_exhausted(policy_name),
    }
    result
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: u32) {
    crate::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(policy_name: &str) {
    crate::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

/// Record a retry success.
pub fn record_retry_success(policy_name: &str) {
    crate::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}
