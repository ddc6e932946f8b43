//! Per-source token bucket.
//!
//! Refills at the source's base rate, capped at its max rate. Purely
//! non-blocking: a failed acquire means the adapter skips this tick
//! and reports `RATE_LIMITED`; the runner's tick is the timing
//! authority.

use std::sync::Mutex;
use std::time::Instant;

pub struct RateLimiter {
    inner: Mutex<Bucket>,
}

struct Bucket {
    /// Tokens added per second.
    rate: f64,
    /// Bucket capacity (burst ceiling).
    cap: f64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// A fresh limiter starts with a full bucket so a newly enabled
    /// source can answer its first tick immediately.
    pub fn new(base_rps: u32, max_rps: u32) -> Self {
        let rate = f64::from(base_rps.max(1));
        let cap = f64::from(max_rps.max(1)).max(rate);
        Self {
            inner: Mutex::new(Bucket {
                rate,
                cap,
                tokens: cap,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&self, now: Instant) -> bool {
        let mut bucket = lock(&self.inner);
        bucket.refill(now);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Swap in new limits. A single guard covers rate, cap, and the
    /// token count, so concurrent acquires see either the old or the
    /// new configuration, never a mix.
    pub fn update(&self, base_rps: u32, max_rps: u32) {
        let mut bucket = lock(&self.inner);
        bucket.rate = f64::from(base_rps.max(1));
        bucket.cap = f64::from(max_rps.max(1)).max(bucket.rate);
        bucket.tokens = bucket.tokens.min(bucket.cap);
    }
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.cap);
    }
}

fn lock(mutex: &Mutex<Bucket>) -> std::sync::MutexGuard<'_, Bucket> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_up_to_cap() {
        let limiter = RateLimiter::new(1, 3);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0));
        assert!(!limiter.try_acquire_at(t0));
    }

    #[test]
    fn test_refills_at_base_rate() {
        let limiter = RateLimiter::new(2, 2);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0));
        assert!(!limiter.try_acquire_at(t0));

        // 2 rps: half a second buys one token back
        assert!(limiter.try_acquire_at(t0 + Duration::from_millis(500)));
        assert!(!limiter.try_acquire_at(t0 + Duration::from_millis(500)));
    }

    #[test]
    fn test_refill_never_exceeds_cap() {
        let limiter = RateLimiter::new(10, 3);
        let t0 = Instant::now();
        // long idle period, still only cap tokens available
        let later = t0 + Duration::from_secs(60);
        assert!(limiter.try_acquire_at(later));
        assert!(limiter.try_acquire_at(later));
        assert!(limiter.try_acquire_at(later));
        assert!(!limiter.try_acquire_at(later));
    }

    #[test]
    fn test_update_clamps_tokens() {
        let limiter = RateLimiter::new(1, 10);
        limiter.update(1, 2);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0));
        assert!(!limiter.try_acquire_at(t0));
    }
}
