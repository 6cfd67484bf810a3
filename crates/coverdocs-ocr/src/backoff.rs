//! Retry backoff schedule.
//!
//! `delay(n) = min(base * 2^(n-1) + jitter, max)` with
//! `jitter ∈ [0, base/2)`. The delay is written to the job's `_not_before`
//! visibility timestamp, so a backing-off job is simply invisible to the
//! lease predicate rather than held anywhere in memory.

use std::time::Duration;

use rand::Rng;

use coverdocs_core::RetryConfig;

/// Backoff delay for the given 1-based attempt, with random jitter.
pub fn backoff_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let half_base_ms = config.backoff_base.as_millis() as u64 / 2;
    let jitter_ms = if half_base_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..half_base_ms)
    };
    backoff_delay_with_jitter(attempt, config, Duration::from_millis(jitter_ms))
}

/// Deterministic variant used by tests; `jitter` is added before capping.
pub fn backoff_delay_with_jitter(
    attempt: u32,
    config: &RetryConfig,
    jitter: Duration,
) -> Duration {
    let base_ms = config.backoff_base.as_millis() as u64;
    let exponent = attempt.saturating_sub(1).min(32);
    let exponential_ms = base_ms.saturating_mul(1u64 << exponent);
    let delay = Duration::from_millis(exponential_ms).saturating_add(jitter);
    delay.min(config.backoff_max)
}
