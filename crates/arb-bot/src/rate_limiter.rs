//! Adaptive token buckets for submits and cancels.
//!
//! Each bucket refills at an effective rate that starts at the configured
//! nominal rate. A venue rate-limit reject halves the effective rate; a
//! sustained run of successful dispatches recovers it additively back
//! toward nominal. Reservations also bound in-flight dispatches and are
//! released when the dispatch completes.

use chrono::{DateTime, Utc};

/// Fraction of nominal the effective rate can decay to.
const MIN_RATE_DIVISOR: f64 = 32.0;
/// Successful dispatches required before one additive recovery step.
const RECOVERY_WINDOW: u32 = 10;

#[derive(Debug, Clone)]
pub struct BucketConfig {
    pub rate_per_sec: u32,
    pub capacity: u32,
    pub max_in_flight: usize,
}

#[derive(Debug)]
pub struct AdaptiveBucket {
    nominal_rate: f64,
    effective_rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: DateTime<Utc>,
    success_streak: u32,
    in_flight: usize,
    max_in_flight: usize,
}

impl AdaptiveBucket {
    pub fn new(cfg: BucketConfig, now: DateTime<Utc>) -> Self {
        let rate = f64::from(cfg.rate_per_sec.max(1));
        let capacity = f64::from(cfg.capacity.max(1));
        Self {
            nominal_rate: rate,
            effective_rate: rate,
            capacity,
            tokens: capacity,
            last_refill: now,
            success_streak: 0,
            in_flight: 0,
            max_in_flight: cfg.max_in_flight.max(1),
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_refill).num_milliseconds().max(0) as f64 / 1000.0;
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.effective_rate).min(self.capacity);
    }

    /// Take a token and an in-flight slot. Fails without consuming anything
    /// when either is exhausted.
    pub fn try_reserve(&mut self, now: DateTime<Utc>) -> bool {
        self.refill(now);
        if self.in_flight >= self.max_in_flight || self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        self.in_flight += 1;
        true
    }

    /// Release the in-flight slot when the dispatch completes. The rate
    /// token is spent either way.
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Venue said 429: halve the effective rate.
    pub fn on_rate_limited(&mut self) {
        let floor = self.nominal_rate / MIN_RATE_DIVISOR;
        self.effective_rate = (self.effective_rate / 2.0).max(floor);
        self.success_streak = 0;
    }

    /// Successful dispatch: after a sustained window, recover one unit of
    /// rate back toward nominal.
    pub fn on_success(&mut self) {
        self.success_streak += 1;
        if self.success_streak >= RECOVERY_WINDOW {
            self.success_streak = 0;
            self.effective_rate = (self.effective_rate + 1.0).min(self.nominal_rate);
        }
    }

    pub fn effective_rate(&self) -> f64 {
        self.effective_rate
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

/// The pair of buckets the order manager reserves from.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    pub submit: AdaptiveBucket,
    pub cancel: AdaptiveBucket,
}

impl AdaptiveRateLimiter {
    pub fn new(submit: BucketConfig, cancel: BucketConfig, now: DateTime<Utc>) -> Self {
        Self {
            submit: AdaptiveBucket::new(submit, now),
            cancel: AdaptiveBucket::new(cancel, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn cfg(rate: u32, capacity: u32) -> BucketConfig {
        BucketConfig {
            rate_per_sec: rate,
            capacity,
            max_in_flight: 4,
        }
    }

    #[test]
    fn test_reserve_until_capacity_exhausted() {
        let now = Utc::now();
        let mut bucket = AdaptiveBucket::new(
            BucketConfig { rate_per_sec: 1, capacity: 2, max_in_flight: 10 },
            now,
        );
        assert!(bucket.try_reserve(now));
        assert!(bucket.try_reserve(now));
        assert!(!bucket.try_reserve(now));
    }

    #[test]
    fn test_tokens_refill_over_time() {
        let now = Utc::now();
        let mut bucket = AdaptiveBucket::new(
            BucketConfig { rate_per_sec: 10, capacity: 1, max_in_flight: 10 },
            now,
        );
        assert!(bucket.try_reserve(now));
        bucket.release();
        assert!(!bucket.try_reserve(now));
        let later = now + Duration::milliseconds(150);
        assert!(bucket.try_reserve(later));
    }

    #[test]
    fn test_in_flight_ceiling() {
        let now = Utc::now();
        let mut bucket = AdaptiveBucket::new(cfg(100, 100), now);
        for _ in 0..4 {
            assert!(bucket.try_reserve(now));
        }
        assert!(!bucket.try_reserve(now));
        bucket.release();
        assert!(bucket.try_reserve(now));
    }

    #[test]
    fn test_rate_limit_halves_effective_rate() {
        let now = Utc::now();
        let mut bucket = AdaptiveBucket::new(cfg(16, 16), now);
        bucket.on_rate_limited();
        assert_eq!(bucket.effective_rate(), 8.0);
        bucket.on_rate_limited();
        assert_eq!(bucket.effective_rate(), 4.0);
    }

    #[test]
    fn test_rate_floor_holds() {
        let now = Utc::now();
        let mut bucket = AdaptiveBucket::new(cfg(32, 32), now);
        for _ in 0..20 {
            bucket.on_rate_limited();
        }
        assert_eq!(bucket.effective_rate(), 1.0);
    }

    #[test]
    fn test_additive_recovery_after_sustained_success() {
        let now = Utc::now();
        let mut bucket = AdaptiveBucket::new(cfg(16, 16), now);
        bucket.on_rate_limited();
        assert_eq!(bucket.effective_rate(), 8.0);
        for _ in 0..RECOVERY_WINDOW {
            bucket.on_success();
        }
        assert_eq!(bucket.effective_rate(), 9.0);
    }

    #[test]
    fn test_recovery_capped_at_nominal() {
        let now = Utc::now();
        let mut bucket = AdaptiveBucket::new(cfg(4, 4), now);
        for _ in 0..100 {
            bucket.on_success();
        }
        assert_eq!(bucket.effective_rate(), 4.0);
    }

    #[test]
    fn test_failure_resets_recovery_streak() {
        let now = Utc::now();
        let mut bucket = AdaptiveBucket::new(cfg(16, 16), now);
        bucket.on_rate_limited();
        for _ in 0..(RECOVERY_WINDOW - 1) {
            bucket.on_success();
        }
        bucket.on_rate_limited();
        for _ in 0..(RECOVERY_WINDOW - 1) {
            bucket.on_success();
        }
        assert_eq!(bucket.effective_rate(), 4.0);
    }
}
