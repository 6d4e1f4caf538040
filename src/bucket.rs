//! Token bucket rate limiter.
//!
//! Each worker owns its own bucket over the shared `--rate`. `consume`
//! advances the bucket by wall-clock time and parks the caller in ≤1 ms
//! sleeps until a token is available, so a stop request is observed within
//! about a millisecond. Rate 0 disables throttling entirely.

use std::time::{Duration, Instant};

/// Maximum single sleep while waiting for a token.
const SLEEP_QUANTUM: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct Bucket {
    rate: u64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    /// A bucket refilling at `rate` tokens per second, starting full.
    /// Capacity equals the rate, i.e. a one-second burst.
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            tokens: rate as f64,
            last: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate as f64).min(self.rate as f64);
    }

    /// Refill, then wait until at least one token is available or
    /// `cancelled` reports true. A no-op when the rate is unlimited.
    pub fn consume<F: Fn() -> bool>(&mut self, cancelled: F) {
        if self.rate == 0 {
            return;
        }
        self.refill();
        while self.tokens < 1.0 && !cancelled() {
            // Sleep only as long as the deficit requires, capped at the
            // quantum to stay responsive.
            let deficit = 1.0 - self.tokens;
            let wait = Duration::from_secs_f64(deficit / self.rate as f64).min(SLEEP_QUANTUM);
            std::thread::sleep(wait);
            self.refill();
        }
    }

    /// Charge one token. Callers debit only after the unit of work
    /// actually happened (packet enqueued or injected).
    pub fn debit(&mut self) {
        if self.rate > 0 {
            self.tokens -= 1.0;
        }
    }

    /// True when a unit of work may proceed.
    pub fn has_token(&self) -> bool {
        self.rate == 0 || self.tokens >= 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_zero_never_blocks() {
        let mut bucket = Bucket::new(0);
        let start = Instant::now();
        for _ in 0..10_000 {
            bucket.consume(|| false);
            assert!(bucket.has_token());
            bucket.debit();
        }
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "unlimited bucket must be a cheap no-op"
        );
    }

    #[test]
    fn test_starts_with_full_burst() {
        let mut bucket = Bucket::new(100);
        for _ in 0..100 {
            bucket.consume(|| false);
            assert!(bucket.has_token());
            bucket.debit();
        }
    }

    #[test]
    fn test_blocks_when_exhausted() {
        let mut bucket = Bucket::new(50);
        for _ in 0..50 {
            bucket.consume(|| false);
            bucket.debit();
        }
        // Bucket is empty: the next consume must wait for a refill
        // (1/50 s = 20 ms per token).
        let start = Instant::now();
        bucket.consume(|| false);
        assert!(bucket.has_token());
        assert!(
            start.elapsed() >= Duration::from_millis(10),
            "consume on an empty bucket must wait for refill"
        );
    }

    #[test]
    fn test_emission_bounded_by_rate() {
        // Rate R over T seconds may emit at most R*T plus the initial burst.
        let rate = 1000u64;
        let mut bucket = Bucket::new(rate);
        let mut emitted = 0u64;
        let start = Instant::now();
        let window = Duration::from_millis(300);
        while start.elapsed() < window {
            bucket.consume(|| false);
            if bucket.has_token() {
                bucket.debit();
                emitted += 1;
            }
        }
        let bound = rate * 300 / 1000 + rate;
        assert!(
            emitted <= bound,
            "emitted {emitted} tokens, bound {bound}"
        );
        // And the limiter must not starve: at least half the steady rate.
        assert!(emitted >= 150, "emitted only {emitted} tokens in 300ms");
    }

    #[test]
    fn test_cancel_unblocks_quickly() {
        let mut bucket = Bucket::new(1);
        bucket.consume(|| false);
        bucket.debit(); // now empty; next token is 1 s away
        let start = Instant::now();
        bucket.consume(|| start.elapsed() > Duration::from_millis(5));
        assert!(
            start.elapsed() < Duration::from_millis(100),
            "cancelled consume must return within a few sleep quanta"
        );
    }

    #[test]
    fn test_burst_capped_at_one_second() {
        let mut bucket = Bucket::new(10);
        std::thread::sleep(Duration::from_millis(50));
        bucket.consume(|| false);
        // Even after idling, at most `rate` tokens are available.
        let mut available = 0;
        while bucket.has_token() {
            bucket.debit();
            available += 1;
        }
        assert!(available <= 10, "burst of {available} exceeds rate cap");
    }
}
