//! A minimal async token bucket.
//!
//! None of the example crates in this workspace's lineage carry a rate
//! limiting dependency, so this is hand-rolled rather than reaching for an
//! unexercised crate — it is deliberately small: one bucket, refilled at a
//! fixed rate, shared behind a mutex.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate_per_sec: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate_per_sec,
            burst,
        }
    }

    /// Wait until a token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate_per_sec))
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_allows_immediate_acquire() {
        let bucket = TokenBucket::new(1.0, 1.0);
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_second_acquire_waits() {
        let bucket = TokenBucket::new(10.0, 1.0);
        bucket.acquire().await;
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
