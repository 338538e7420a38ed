//! Fixed-window token bucket used for the global and guild ceilings.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{RateLimitConfig, RateLimiter};

/// Token bucket rate limiter.
///
/// The bucket holds `capacity` tokens and is refilled to capacity once per
/// window. Each request consumes one token. Time is read from tokio's clock so
/// paused-time tests are deterministic.
pub struct TokenBucket {
    /// Maximum tokens (bucket capacity).
    capacity: u32,

    /// Time between refills.
    refill_interval: Duration,

    /// Current token count.
    tokens: AtomicU32,

    /// Start of the current window.
    last_refill: Mutex<Instant>,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_interval", &self.refill_interval)
            .field("tokens", &self.tokens.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TokenBucket {
    /// Create a new token bucket rate limiter.
    ///
    /// # Arguments
    ///
    /// * `requests_per_window` - Maximum requests allowed per window
    /// * `window` - Duration of the rate limit window
    #[must_use]
    pub fn new(requests_per_window: u32, window: Duration) -> Self {
        Self {
            capacity: requests_per_window,
            refill_interval: window,
            tokens: AtomicU32::new(requests_per_window),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// Create from configuration.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_window, config.window)
    }

    /// Refill tokens based on elapsed time.
    fn refill(&self) {
        let mut last_refill = self.last_refill.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(*last_refill);

        if elapsed >= self.refill_interval && !self.refill_interval.is_zero() {
            let periods = u32::try_from(elapsed.as_nanos() / self.refill_interval.as_nanos())
                .unwrap_or(u32::MAX);

            self.tokens.store(self.capacity, Ordering::Release);

            // Advance by whole periods so the window phase is preserved.
            *last_refill += self.refill_interval.saturating_mul(periods);
        }
    }

    /// Calculate time until the next window starts.
    fn time_until_token(&self) -> Duration {
        let last_refill = *self.last_refill.lock();
        let elapsed = Instant::now().duration_since(last_refill);

        self.refill_interval.saturating_sub(elapsed)
    }
}

#[async_trait]
impl RateLimiter for TokenBucket {
    async fn try_acquire(&self) -> bool {
        self.refill();

        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }

    async fn wait_time(&self) -> Duration {
        self.refill();
        if self.tokens.load(Ordering::Acquire) > 0 {
            Duration::ZERO
        } else {
            self.time_until_token()
        }
    }
}
