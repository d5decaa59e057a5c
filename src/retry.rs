use std::time::Duration;

use rand::Rng;

pub const RETRY_MAX_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const RETRY_MAX_DELAY_MS: u64 = 8_000;
pub const RETRY_JITTER_FACTOR: f64 = 0.3;

/// Exponential delay for `attempt` (zero based) before jitter.
pub fn exponential_delay_ms(attempt: u32) -> u64 {
    RETRY_BASE_DELAY_MS
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
        .min(RETRY_MAX_DELAY_MS)
}

pub fn calculate_backoff(attempt: u32) -> Duration {
    calculate_backoff_with(attempt, &mut rand::thread_rng())
}

/// `min(base * 2^attempt, max)` shifted by up to 30% in either direction, never
/// below zero.
pub fn calculate_backoff_with<R: Rng + ?Sized>(attempt: u32, rng: &mut R) -> Duration {
    let delay = exponential_delay_ms(attempt) as f64;
    let jitter = delay * RETRY_JITTER_FACTOR * rng.gen_range(-1.0..1.0);
    Duration::from_millis((delay + jitter).max(0.0).floor() as u64)
}
