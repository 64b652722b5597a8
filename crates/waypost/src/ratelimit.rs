//! Per-key token-bucket admission control.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Buckets idle longer than this are evicted by the sweeper.
const BUCKET_MAX_IDLE: Duration = Duration::from_secs(10 * 60);

/// Sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Mutable bucket state. Also embedded directly on WebSocket connections for
/// their per-connection inbound budget.
#[derive(Debug, Clone, Copy)]
pub struct Bucket {
    tokens: f64,
    last: Instant,
}

impl Bucket {
    pub fn new(burst: f64) -> Self {
        Self {
            tokens: burst,
            last: Instant::now(),
        }
    }

    /// Refill for elapsed time (capped at burst), then spend one token or
    /// reject leaving the state untouched by the spend.
    pub fn allow(&mut self, rate: f64, burst: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// A keyed limiter: one bucket per key, created on first sight.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Arc<Self> {
        Arc::new(Self {
            rate,
            burst,
            buckets: DashMap::new(),
        })
    }

    /// Admit or reject one unit of work for `key`.
    pub fn allow(&self, key: &str) -> bool {
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(self.burst));
        bucket.allow(self.rate, self.burst)
    }

    /// Evict buckets whose last access is older than [`BUCKET_MAX_IDLE`].
    fn sweep(&self) {
        let cutoff = Instant::now() - BUCKET_MAX_IDLE;
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.last > cutoff);
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.buckets.len(), "rate limiter sweep");
        }
    }

    /// Periodic eviction so one-off keys do not accumulate forever.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let limiter = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => limiter.sweep(),
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_spent_then_rejected() {
        let limiter = RateLimiter::new(1.0, 3.0);
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(1.0, 1.0);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_restores_capacity_up_to_burst() {
        let limiter = RateLimiter::new(2.0, 4.0);
        for _ in 0..4 {
            assert!(limiter.allow("k"));
        }
        assert!(!limiter.allow("k"));

        // 1.5 virtual seconds at 2 tokens/s refills 3 tokens.
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_idle_buckets_only() {
        let limiter = RateLimiter::new(1.0, 1.0);
        limiter.allow("old");
        tokio::time::advance(BUCKET_MAX_IDLE + Duration::from_secs(1)).await;
        limiter.allow("fresh");
        limiter.sweep();
        assert_eq!(limiter.bucket_count(), 1);
    }
}
