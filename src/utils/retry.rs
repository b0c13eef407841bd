//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Connection retries to
//! the broker go through `lifecycle::RetryPolicy` instead; these builders
//! cover in-process retries such as consumer handler re-invocation.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for re-invoking a failed envelope handler.
///
/// - Min delay: `min_delay`
/// - Max delay: 5s
/// - Max attempts: `retries` (after the first call)
/// - Jitter enabled
pub fn handler_backoff(min_delay: Duration, retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(retries)
        .with_jitter()
}
