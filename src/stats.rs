//! Process-wide relay counters, shared by every stream through `SharedState`.

use std::sync::atomic::{AtomicU64, Ordering};

#[inline]
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

#[inline]
fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

#[derive(Debug, Default)]
pub struct BufferStats {
    pub backpressure_events: AtomicU64,
    pub queue_overflows: AtomicU64,
    pub total_queued: AtomicU64,
    pub max_queue_depth: AtomicU64,
}

impl BufferStats {
    pub fn observe_queue_depth(&self, depth: usize) {
        self.max_queue_depth
            .fetch_max(depth as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct TimeoutStats {
    pub adaptive: AtomicU64,
    pub default: AtomicU64,
    pub fast_fail: AtomicU64,
    pub slow_success: AtomicU64,
}

#[derive(Debug, Default)]
pub struct BatchStats {
    pub batched: AtomicU64,
    pub unbatched: AtomicU64,
    pub savings: AtomicU64,
}

#[derive(Debug, Default)]
pub struct RetryStats {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub total_delay_ms: AtomicU64,
}

#[derive(Debug, Default)]
pub struct StreamingStats {
    pub active: AtomicU64,
    pub total: AtomicU64,
    pub bytes: AtomicU64,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub pool: PoolStats,
    pub buffer: BufferStats,
    pub timeout: TimeoutStats,
    pub batch: BatchStats,
    pub retry: RetryStats,
    pub streaming: StreamingStats,
}

/// One compact line per counter group, in a stable order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSummary {
    pub pool: String,
    pub buffer: String,
    pub timeout: String,
    pub retry: String,
    pub batch: String,
    pub streaming: String,
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "pool[{}] buffer[{}] timeout[{}] retry[{}] batch[{}] streaming[{}]",
            self.pool, self.buffer, self.timeout, self.retry, self.batch, self.streaming
        )
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_started(&self) {
        incr(&self.streaming.active);
        incr(&self.streaming.total);
    }

    pub fn stream_finished(&self) {
        let _ = self
            .streaming
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            pool: format!(
                "h={} m={} e={}",
                get(&self.pool.hits),
                get(&self.pool.misses),
                get(&self.pool.evictions)
            ),
            buffer: format!(
                "bp={} qo={} qd={}",
                get(&self.buffer.backpressure_events),
                get(&self.buffer.queue_overflows),
                get(&self.buffer.max_queue_depth)
            ),
            timeout: format!(
                "adp={} def={} ff={} ss={}",
                get(&self.timeout.adaptive),
                get(&self.timeout.default),
                get(&self.timeout.fast_fail),
                get(&self.timeout.slow_success)
            ),
            retry: format!(
                "att={} suc={} fail={}",
                get(&self.retry.attempts),
                get(&self.retry.successes),
                get(&self.retry.failures)
            ),
            batch: format!(
                "b={} ub={} sav={}",
                get(&self.batch.batched),
                get(&self.batch.unbatched),
                get(&self.batch.savings)
            ),
            streaming: format!(
                "act={} tot={} bytes={}KB",
                get(&self.streaming.active),
                get(&self.streaming.total),
                get(&self.streaming.bytes) / 1024
            ),
        }
    }
}
