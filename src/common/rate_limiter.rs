//! Request pacing for venue REST clients
//!
//! A drip-style token bucket: capacity tokens per interval, earned
//! continuously from elapsed time rather than refilled in batches. Callers
//! take one token per request; an empty bucket makes `acquire` sleep until
//! the next token has dripped in. Cloning shares the bucket, so every
//! clone of a connector paces against the same budget.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Rate limiter configuration: `requests_per_interval` tokens per
/// `interval`, which is also the burst ceiling.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub requests_per_interval: u32,
    pub interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_interval: 10,
            interval: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    /// Requests allowed per second (keeps the one-second interval).
    pub fn with_rate(mut self, requests_per_second: usize) -> Self {
        self.requests_per_interval = requests_per_second.max(1) as u32;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    /// The instant the bucket state was last settled. Advanced by whole
    /// earned-token steps so fractional drip time is never lost.
    settled_at: Instant,
}

#[derive(Debug)]
struct Shared {
    capacity: u32,
    interval: Duration,
    bucket: Mutex<Bucket>,
}

/// Drip token bucket. Starts full.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    shared: Arc<Shared>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let capacity = config.requests_per_interval.max(1);
        Self {
            shared: Arc::new(Shared {
                capacity,
                interval: config.interval,
                bucket: Mutex::new(Bucket {
                    tokens: capacity,
                    settled_at: Instant::now(),
                }),
            }),
        }
    }

    pub fn with_rate(requests_per_second: usize) -> Self {
        Self::new(RateLimiterConfig::default().with_rate(requests_per_second))
    }

    /// Time one token takes to drip in.
    fn drip_period(&self) -> Duration {
        self.shared.interval / self.shared.capacity
    }

    /// Settle the bucket: credit every token earned since `settled_at`,
    /// capped at capacity, and move the settle point forward by exactly
    /// the time those tokens took.
    fn settle(&self, bucket: &mut Bucket) {
        let elapsed = bucket.settled_at.elapsed();
        let period = self.drip_period();
        if period.is_zero() {
            bucket.tokens = self.shared.capacity;
            bucket.settled_at = Instant::now();
            return;
        }

        let earned = (elapsed.as_nanos() / period.as_nanos()).min(u32::MAX as u128) as u32;
        if earned == 0 {
            return;
        }

        if bucket.tokens.saturating_add(earned) >= self.shared.capacity {
            bucket.tokens = self.shared.capacity;
            // A full bucket earns nothing; restart the clock.
            bucket.settled_at = Instant::now();
        } else {
            bucket.tokens += earned;
            bucket.settled_at += period * earned;
        }
    }

    /// Take one token, sleeping until one drips in if the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.shared.bucket.lock().unwrap();
                self.settle(&mut bucket);
                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return;
                }
                self.drip_period()
                    .saturating_sub(bucket.settled_at.elapsed())
                    .max(Duration::from_millis(1))
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token without waiting. Returns false on an empty bucket.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.shared.bucket.lock().unwrap();
        self.settle(&mut bucket);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket.
    pub fn available(&self) -> u32 {
        let mut bucket = self.shared.bucket.lock().unwrap();
        self.settle(&mut bucket);
        bucket.tokens
    }
}
