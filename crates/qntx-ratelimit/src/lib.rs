//! qntx-ratelimit
//!
//! One token bucket per watcher (§4.C3). Rate = `max_fires_per_minute / 60`
//! tokens/sec, burst = 1. Deterministic core logic (`refill`/`try_acquire_at`
//! take an explicit instant) so tests never depend on wall-clock sleeps,
//! matching this codebase's pure-function-plus-state convention.

use std::collections::HashMap;
use std::time::{Duration, Instant};

const BURST: f64 = 1.0;

/// Token bucket for a single watcher.
///
/// **Zero-rate contract:** a limiter built from `max_fires_per_minute == 0`
/// never grants a token, ever — zero is not converted to "unlimited" or to
/// "use a default rate".
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rate_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(max_fires_per_minute: u32) -> Self {
        Self::new_at(max_fires_per_minute, Instant::now())
    }

    pub fn new_at(max_fires_per_minute: u32, now: Instant) -> Self {
        let rate_per_sec = max_fires_per_minute as f64 / 60.0;
        Self {
            rate_per_sec,
            // Start full so the first dispatch after load doesn't wait a
            // full refill period, except when the rate is genuinely zero.
            tokens: if rate_per_sec > 0.0 { BURST } else { 0.0 },
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.rate_per_sec <= 0.0 {
            self.tokens = 0.0;
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let added = elapsed.as_secs_f64() * self.rate_per_sec;
        self.tokens = (self.tokens + added).min(BURST);
        self.last_refill = now;
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.rate_per_sec <= 0.0 {
            return false;
        }
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-watcher registry. Re-created wholesale on every watcher reload
/// (§4.C3: "Limiters are re-created on every watcher reload"), never mutated
/// incrementally in place.
#[derive(Debug, Clone, Default)]
pub struct RateLimiterRegistry {
    limiters: HashMap<String, RateLimiter>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn build<'a>(entries: impl IntoIterator<Item = (&'a str, u32)>) -> Self {
        let mut limiters = HashMap::new();
        for (watcher_id, max_fires_per_minute) in entries {
            limiters.insert(watcher_id.to_string(), RateLimiter::new(max_fires_per_minute));
        }
        Self { limiters }
    }

    pub fn try_acquire(&mut self, watcher_id: &str) -> bool {
        match self.limiters.get_mut(watcher_id) {
            Some(limiter) => limiter.try_acquire(),
            None => false,
        }
    }

    pub fn insert(&mut self, watcher_id: impl Into<String>, limiter: RateLimiter) {
        self.limiters.insert(watcher_id.into(), limiter);
    }
}

pub fn seconds(n: u64) -> Duration {
    Duration::from_secs(n)
}
