//! Exponential backoff and jitter.

use std::time::Duration;

/// `min(base * multiplier^attempt, max)` for a zero-based attempt number.
pub fn exponential_delay(base: Duration, multiplier: f64, attempt: u32, max: Duration) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * multiplier.powi(exponent);
    // f64::min drops NaN, so an overflowing product still lands on the cap
    Duration::from_secs_f64(secs.min(max.as_secs_f64()).max(0.0))
}

/// Spread `delay` over `delay * (1 - jitter + rand * jitter)` using chrono-machines.
///
/// A factor of zero (or below) returns `delay` unchanged.
pub fn jittered(delay: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return delay;
    }

    // the policy arithmetic is unit-agnostic; feed it microseconds so
    // sub-millisecond delays keep their precision
    let delay_us = delay.as_micros().min(u128::from(u64::MAX)) as u64;
    let policy = chrono_machines::Policy {
        max_attempts: 1,
        base_delay_ms: delay_us,
        multiplier: 1.0,
        max_delay_ms: delay_us,
    };
    let jittered_us = policy.calculate_delay(1, jitter_factor.min(1.0));
    Duration::from_micros(jittered_us)
}
