//! Rate limiter using token bucket algorithm.
//!
//! The bucket is local to one process. Several processes running the
//! fallback path at the same time each get the full budget, so together
//! they can exceed the provider's limit.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Token bucket rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<RateLimiterState>>,
}

struct RateLimiterState {
    tokens: f64,
    last_update: Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    /// Create a limiter allowing `requests_per_second` on average, with a
    /// burst of at most one second's worth of requests.
    pub fn new(requests_per_second: f64) -> Self {
        let refill_rate = requests_per_second.max(0.01);
        let max_tokens = refill_rate.max(1.0);

        Self {
            state: Arc::new(Mutex::new(RateLimiterState {
                tokens: max_tokens,
                last_update: Instant::now(),
                max_tokens,
                refill_rate,
            })),
        }
    }

    /// Acquire a token, waiting if necessary
    pub async fn acquire(&self) {
        let delay = {
            let mut state = self.state.lock().await;

            // Refill tokens
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_update).as_secs_f64();
            state.tokens = (state.tokens + elapsed * state.refill_rate).min(state.max_tokens);
            state.last_update = now;

            if state.tokens >= 1.0 {
                state.tokens -= 1.0;
                Duration::ZERO
            } else {
                // The token we wait for is spent by this caller.
                let wait_time = (1.0 - state.tokens) / state.refill_rate;
                state.tokens -= 1.0;
                Duration::from_secs_f64(wait_time)
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}
