//! Reconnect delays: exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;
use switchyard_types::ReconnectPolicy;

/// Delay before reconnect attempt `attempt` (0-indexed).
///
/// `min(initial * 2^attempt, max) * (1 + r * jitter)` with `r` in `[0, 1)`,
/// clamped to `max_delay_ms`.
pub fn compute_backoff(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let base = policy
        .initial_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(policy.max_delay_ms);

    if policy.jitter <= 0.0 {
        return Duration::from_millis(capped);
    }

    let frac: f64 = rand::thread_rng().gen();
    let with_jitter = (capped as f64) * (1.0 + frac * policy.jitter);
    Duration::from_millis((with_jitter as u64).min(policy.max_delay_ms))
}
