//! Backoff configurations shared by the producer and consumer.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for broker publishes.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max retries: 5
/// - Jitter enabled
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Backoff for redelivering a message to a handler that failed transiently.
///
/// `max_attempts` counts the first delivery, so at most `max_attempts - 1`
/// retries follow it.
pub fn delivery_backoff(
    max_attempts: usize,
    min_delay: Duration,
    max_delay: Duration,
) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay)
        .with_max_times(max_attempts.saturating_sub(1))
        .with_jitter()
}
