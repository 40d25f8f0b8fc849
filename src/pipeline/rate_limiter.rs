//! Token-bucket rate limiter for data loading.
//!
//! Bursts up to the bucket capacity pass through immediately; sustained
//! load is smoothed to the refill rate. The limiter gates the start of new
//! loader fetches only; cache hits never consume tokens.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Default refill rate in tokens per second.
pub(crate) const DEFAULT_RATE: f64 = 25.0;

/// Default burst capacity in tokens.
pub(crate) const DEFAULT_CAPACITY: f64 = 80.0;

/// An async token bucket.
pub(crate) struct RateLimiter {
    state: Mutex<Bucket>,
    rate: f64,
    capacity: f64,
}

struct Bucket {
    available: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Creates a limiter with the given refill rate (tokens/second) and
    /// burst capacity. The bucket starts full.
    pub fn new(rate: f64, capacity: f64) -> Self {
        assert!(rate > 0.0, "rate must be > 0");
        assert!(capacity >= 1.0, "capacity must be >= 1");
        Self {
            state: Mutex::new(Bucket {
                available: capacity,
                last_refill: Instant::now(),
            }),
            rate,
            capacity,
        }
    }

    /// Limiter with the pipeline defaults (~80 token burst, 25/second).
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_CAPACITY)
    }

    /// Takes one token, sleeping until the bucket refills when empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.available = (bucket.available + elapsed * self.rate).min(self.capacity);
                bucket.last_refill = now;
                if bucket.available >= 1.0 {
                    bucket.available -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - bucket.available) / self.rate)
            };
            trace!(?wait, "rate limiter backoff");
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available (for diagnostics).
    #[cfg(test)]
    fn available(&self) -> f64 {
        self.state.lock().unwrap().available
    }
}
