//! Token-bucket rate limiter with continuous (fractional) refill.
//!
//! One continuously refilling bucket shared across callers, rather than a
//! fixed window per key. Two acquisition modes share one `refill`: a
//! suspending [`RateLimiter::acquire`] for the worker engine, and a
//! non-suspending [`RateLimiter::try_acquire`] for the mock HTTP service to
//! answer with 429 instead of waiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Configuration: `capacity` tokens refill over `window`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub capacity: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimiter {
    bucket: Arc<Mutex<Bucket>>,
    capacity: f64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: limit.capacity as f64,
                last_refill: Instant::now(),
            })),
            capacity: limit.capacity as f64,
            window: limit.window,
        }
    }

    fn refill(bucket: &mut Bucket, capacity: f64, window: Duration) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            let refilled = elapsed * capacity / window.as_secs_f64();
            bucket.tokens = (bucket.tokens + refilled).min(capacity);
            bucket.last_refill = now;
        }
    }

    /// Suspends until a token is available, then consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                Self::refill(&mut bucket, self.capacity, self.window);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - bucket.tokens;
                let wait_secs = (deficit * self.window.as_secs_f64() / self.capacity).max(0.0);
                Duration::from_secs_f64(wait_secs).max(Duration::from_millis(1))
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Attempts to consume a token without waiting. Returns `false` (and
    /// leaves the bucket untouched) if none is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        Self::refill(&mut bucket, self.capacity, self.window);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Approximate time until the next token regenerates, for callers that
    /// need a `Retry-After` value (e.g. `tem-mock`'s 429 responses).
    pub fn retry_after_hint(&self) -> Duration {
        Duration::from_secs_f64(self.window.as_secs_f64() / self.capacity)
    }
}
