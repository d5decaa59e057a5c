//! Rolling connect-latency history per destination and the adaptive connect timeout
//! derived from it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use lru::LruCache;
use parking_lot::Mutex;

use crate::stats::{Stats, incr};

pub const LATENCY_HISTORY_SIZE: usize = 10;
pub const TIMEOUT_MIN_MS: u64 = 8_000;
pub const TIMEOUT_MAX_MS: u64 = 45_000;
pub const TIMEOUT_DEFAULT_MS: u64 = 25_000;
pub const TIMEOUT_MULTIPLIER: f64 = 3.5;

const MAX_TRACKED_DESTINATIONS: usize = 100;
const CLEANUP_BATCH: usize = 20;

pub fn latency_key(address: &str, port: u16) -> String {
    format!("{address}:{port}")
}

pub struct LatencyTracker {
    // Recency ordered: lookups and new samples move a key to the front, so cleanup
    // drops the destinations that were used least recently.
    history: Mutex<LruCache<String, VecDeque<u64>>>,
    stats: Arc<Stats>,
}

impl LatencyTracker {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self {
            history: Mutex::new(LruCache::unbounded()),
            stats,
        }
    }

    pub fn record_latency(&self, key: &str, latency_ms: u64) {
        let mut history = self.history.lock();
        if let Some(samples) = history.get_mut(key) {
            samples.push_back(latency_ms);
            if samples.len() > LATENCY_HISTORY_SIZE {
                samples.pop_front();
            }
            return;
        }
        let mut samples = VecDeque::with_capacity(LATENCY_HISTORY_SIZE + 1);
        samples.push_back(latency_ms);
        history.put(key.to_string(), samples);
    }

    /// P95 of the recorded samples times [`TIMEOUT_MULTIPLIER`], clamped to
    /// `[TIMEOUT_MIN_MS, TIMEOUT_MAX_MS]`. Without history this is exactly
    /// [`TIMEOUT_DEFAULT_MS`].
    pub fn calculate_timeout_ms(&self, key: &str) -> u64 {
        let mut sorted: Vec<u64> = {
            let mut history = self.history.lock();
            match history.get(key) {
                Some(samples) if !samples.is_empty() => samples.iter().copied().collect(),
                _ => {
                    incr(&self.stats.timeout.default);
                    return TIMEOUT_DEFAULT_MS;
                }
            }
        };
        sorted.sort_unstable();

        let p95_index = ((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1);
        let p95 = sorted[p95_index];
        let timeout = ((p95 as f64 * TIMEOUT_MULTIPLIER).floor() as u64)
            .clamp(TIMEOUT_MIN_MS, TIMEOUT_MAX_MS);

        incr(&self.stats.timeout.adaptive);
        debug!(
            "adaptive timeout for {key}: {timeout}ms (p95 {p95}ms, {} samples)",
            sorted.len()
        );
        timeout
    }

    pub fn calculate_timeout(&self, key: &str) -> Duration {
        Duration::from_millis(self.calculate_timeout_ms(key))
    }

    /// Forgets the 20 least recently used destinations once more than 100 are tracked.
    pub fn cleanup(&self) {
        let mut history = self.history.lock();
        if history.len() <= MAX_TRACKED_DESTINATIONS {
            return;
        }
        for _ in 0..CLEANUP_BATCH {
            if history.pop_lru().is_none() {
                break;
            }
        }
    }

    pub fn tracked_destinations(&self) -> usize {
        self.history.lock().len()
    }

    pub fn samples(&self, key: &str) -> Vec<u64> {
        self.history
            .lock()
            .peek(key)
            .map(|samples| samples.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn tracker() -> LatencyTracker {
        LatencyTracker::new(Arc::new(Stats::new()))
    }

    #[test]
    fn test_default_timeout_without_history() {
        let tracker = tracker();
        assert_eq!(tracker.calculate_timeout_ms("1.1.1.1:443"), TIMEOUT_DEFAULT_MS);
        assert_eq!(tracker.stats.timeout.default.load(Ordering::Relaxed), 1);
        assert_eq!(tracker.stats.timeout.adaptive.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_timeout_is_p95_times_multiplier() {
        let tracker = tracker();
        let key = latency_key("example.com", 443);
        for ms in [3000, 2000, 4000] {
            tracker.record_latency(&key, ms);
        }
        // floor(3 * 0.95) = 2, sorted[2] = 4000 -> 14000
        assert_eq!(tracker.calculate_timeout_ms(&key), 14_000);
        assert_eq!(tracker.stats.timeout.adaptive.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_timeout_is_clamped() {
        let tracker = tracker();
        tracker.record_latency("fast:80", 1);
        assert_eq!(tracker.calculate_timeout_ms("fast:80"), TIMEOUT_MIN_MS);

        tracker.record_latency("slow:80", 60_000);
        assert_eq!(tracker.calculate_timeout_ms("slow:80"), TIMEOUT_MAX_MS);

        for n in 1..=LATENCY_HISTORY_SIZE as u64 {
            tracker.record_latency("mixed:80", n * 1_700);
            let timeout = tracker.calculate_timeout_ms("mixed:80");
            assert!((TIMEOUT_MIN_MS..=TIMEOUT_MAX_MS).contains(&timeout));
        }
    }

    #[test]
    fn test_history_keeps_last_ten() {
        let tracker = tracker();
        for ms in 1..=15 {
            tracker.record_latency("k:1", ms);
        }
        assert_eq!(tracker.samples("k:1"), (6..=15).collect::<Vec<_>>());
    }

    #[test]
    fn test_cleanup_drops_least_recent_keys() {
        let tracker = tracker();
        for i in 0..101 {
            tracker.record_latency(&latency_key("host", i), 100);
        }
        // Touch the oldest key so it survives the sweep.
        tracker.calculate_timeout_ms(&latency_key("host", 0));

        tracker.cleanup();
        assert_eq!(tracker.tracked_destinations(), 81);
        assert!(!tracker.samples(&latency_key("host", 0)).is_empty());
        assert!(tracker.samples(&latency_key("host", 1)).is_empty());
        assert!(tracker.samples(&latency_key("host", 20)).is_empty());
        assert!(!tracker.samples(&latency_key("host", 21)).is_empty());
    }

    #[test]
    fn test_cleanup_noop_under_limit() {
        let tracker = tracker();
        for i in 0..100 {
            tracker.record_latency(&latency_key("host", i), 100);
        }
        tracker.cleanup();
        assert_eq!(tracker.tracked_destinations(), 100);
    }
}
