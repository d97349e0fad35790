//! Token-bucket rate limiting keyed by an arbitrary string (typically a
//! remote address).
//!
//! Buckets refill continuously at `rate` tokens per `period` up to `burst`
//! capacity. Token counts are scaled by 1000 internally for sub-token
//! precision without floating point.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const SCALE: u64 = 1000;

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// A set of token buckets sharing one configuration, keyed by string.
#[derive(Debug)]
pub struct KeyedRateLimiter {
    buckets: Mutex<HashMap<String, BucketState>>,
    rate: u64,
    period: Duration,
    burst: u64,
}

impl KeyedRateLimiter {
    /// `rate` tokens replenish every `period`, up to `burst` capacity.
    /// New keys start with a full bucket.
    pub fn new(rate: u64, period: Duration, burst: u64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate,
            period,
            burst,
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed_ms = now.duration_since(state.last_refill).as_millis() as u64;
        if elapsed_ms == 0 {
            return;
        }
        let period_ms = self.period.as_millis().max(1) as u64;
        let added = elapsed_ms.saturating_mul(self.rate).saturating_mul(SCALE) / period_ms;
        state.tokens = (state.tokens + added).min(self.burst * SCALE);
        state.last_refill = now;
    }

    /// Take one token for the key. Returns `false` when the bucket is empty.
    pub fn take(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let state = buckets.entry(key.to_string()).or_insert(BucketState {
            tokens: self.burst * SCALE,
            last_refill: now,
        });
        self.refill(state, now);
        if state.tokens < SCALE {
            return false;
        }
        state.tokens -= SCALE;
        true
    }

    /// Return `count` tokens to the key's bucket (e.g. after a successful
    /// password check undoes the attempt charge).
    pub fn restore(&self, key: &str, count: u64) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        if let Some(state) = buckets.get_mut(key) {
            self.refill(state, now);
            state.tokens = (state.tokens + count * SCALE).min(self.burst * SCALE);
        }
    }

    /// Tokens currently available for the key. Keys never seen report the
    /// full burst.
    pub fn remaining(&self, key: &str) -> u64 {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        match buckets.get_mut(key) {
            Some(state) => {
                self.refill(state, now);
                state.tokens / SCALE
            }
            None => self.burst,
        }
    }

    /// Drop buckets that have refilled completely; they are indistinguishable
    /// from fresh ones.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let full = self.burst * SCALE;
        buckets.retain(|_, state| {
            let elapsed_ms = now.duration_since(state.last_refill).as_millis() as u64;
            let period_ms = self.period.as_millis().max(1) as u64;
            let added = elapsed_ms.saturating_mul(self.rate).saturating_mul(SCALE) / period_ms;
            state.tokens.saturating_add(added) < full
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_empty() {
        let limiter = KeyedRateLimiter::new(1, Duration::from_secs(3600), 3);
        assert!(limiter.take("a"));
        assert!(limiter.take("a"));
        assert!(limiter.take("a"));
        assert!(!limiter.take("a"));
        // other keys unaffected
        assert!(limiter.take("b"));
    }

    #[test]
    fn restore_returns_tokens() {
        let limiter = KeyedRateLimiter::new(1, Duration::from_secs(3600), 1);
        assert!(limiter.take("a"));
        assert!(!limiter.take("a"));
        limiter.restore("a", 1);
        assert!(limiter.take("a"));
    }

    #[test]
    fn remaining_reports_full_for_unseen_keys() {
        let limiter = KeyedRateLimiter::new(1, Duration::from_secs(1), 5);
        assert_eq!(limiter.remaining("never"), 5);
        limiter.take("seen");
        assert_eq!(limiter.remaining("seen"), 4);
    }

    #[test]
    fn refills_over_time() {
        let limiter = KeyedRateLimiter::new(1000, Duration::from_millis(100), 2);
        assert!(limiter.take("a"));
        assert!(limiter.take("a"));
        assert!(!limiter.take("a"));
        std::thread::sleep(Duration::from_millis(5));
        // 1000 per 100ms refills well within 5ms
        assert!(limiter.take("a"));
    }
}
