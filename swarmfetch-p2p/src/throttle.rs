//! Upload rate limiting.
//!
//! A single token bucket shared by every WAN upload. Tokens are bytes and
//! are added on a fixed 100 ms tick at the current ceiling; the bucket holds
//! at most one second of budget (or one chunk, if larger).

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Refill granularity.
pub const TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    rate: u64,
    last_tick: Instant,
}

impl Bucket {
    /// Add tokens for every whole tick elapsed since the last refill.
    fn refill(&mut self, now: Instant, burst: f64) {
        let elapsed = now.saturating_duration_since(self.last_tick);
        let ticks = (elapsed.as_millis() / TICK.as_millis()) as u32;
        if ticks > 0 {
            let per_tick = self.rate as f64 * TICK.as_secs_f64();
            self.tokens = (self.tokens + per_tick * ticks as f64).min(burst);
            self.last_tick += TICK * ticks;
        }
    }
}

/// Shared byte-rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a limiter allowing `rate` bytes per second, starting full.
    pub fn new(rate: u64) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                tokens: rate as f64,
                rate: rate.max(1),
                last_tick: Instant::now(),
            }),
        }
    }

    /// Current rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.bucket.lock().rate
    }

    /// Change the rate. Accumulated tokens are capped to the new budget.
    pub fn set_rate(&self, rate: u64) {
        let mut bucket = self.bucket.lock();
        bucket.rate = rate.max(1);
        bucket.tokens = bucket.tokens.min(bucket.rate as f64);
    }

    /// Try to take `bytes` tokens now. On failure returns how long to wait.
    fn try_take(&self, bytes: usize, now: Instant) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        let needed = bytes as f64;
        let burst = (bucket.rate as f64).max(needed);
        bucket.refill(now, burst);

        if bucket.tokens >= needed {
            bucket.tokens -= needed;
            return Ok(());
        }

        let per_tick = bucket.rate as f64 * TICK.as_secs_f64();
        let ticks = ((needed - bucket.tokens) / per_tick).ceil().max(1.0) as u32;
        let next_tick = bucket.last_tick + TICK * ticks;
        Err(next_tick.saturating_duration_since(now).max(Duration::from_millis(1)))
    }

    /// Wait until `bytes` may be sent.
    pub async fn acquire(&self, bytes: usize) {
        loop {
            match self.try_take(bytes, Instant::now()) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}
