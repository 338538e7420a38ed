//! Limits that sit above individual route buckets.
//!
//! A request must clear its route bucket *and* every ceiling the resolver
//! attached to it: the bot-wide global limit (including any pause imposed by
//! a global 429) and, when configured, a per-guild cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, warn};

use crate::{Ceiling, RateLimitConfig, RateLimiter, TokenBucket};

/// The bot-wide global limit.
#[derive(Debug)]
pub struct GlobalLimiter {
    window: TokenBucket,
    paused_until: Mutex<Option<Instant>>,
}

impl GlobalLimiter {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: TokenBucket::from_config(config),
            paused_until: Mutex::new(None),
        }
    }

    /// Pause every non-exempt request for `delay` after a global 429.
    ///
    /// An existing, longer pause is kept.
    pub fn pause(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut paused = self.paused_until.lock();
        if paused.is_none_or(|current| current < until) {
            warn!(delay_ms = delay.as_millis(), "Global rate limit hit, pausing all buckets");
            *paused = Some(until);
        }
    }

    /// Remaining pause time, if a global pause is active.
    #[must_use]
    pub fn paused_for(&self) -> Option<Duration> {
        let now = Instant::now();
        let paused = *self.paused_until.lock();
        paused.filter(|until| *until > now).map(|until| until - now)
    }

    /// Wait out any global pause, then take a token from the global window.
    pub async fn acquire(&self) {
        loop {
            let paused = *self.paused_until.lock();
            if let Some(until) = paused {
                if until > Instant::now() {
                    sleep_until(until).await;
                    continue;
                }
            }

            if self.window.try_acquire().await {
                return;
            }

            let wait = self.window.wait_time().await;
            debug!(wait_ms = wait.as_millis(), "Global window exhausted");
            sleep(wait).await;
        }
    }

    #[must_use]
    pub const fn window(&self) -> &TokenBucket {
        &self.window
    }
}

/// Global limiter plus lazily created per-guild limiters.
#[derive(Debug)]
pub struct Ceilings {
    global: GlobalLimiter,
    guild_config: Option<RateLimitConfig>,
    guilds: RwLock<HashMap<u64, Arc<TokenBucket>>>,
}

impl Ceilings {
    #[must_use]
    pub fn new(global: &RateLimitConfig, guild: Option<RateLimitConfig>) -> Self {
        Self {
            global: GlobalLimiter::new(global),
            guild_config: guild,
            guilds: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn global(&self) -> &GlobalLimiter {
        &self.global
    }

    /// Wait until every listed ceiling admits one more request.
    pub async fn acquire(&self, ceilings: &[Ceiling]) {
        for ceiling in ceilings {
            match ceiling {
                Ceiling::Global => self.global.acquire().await,
                Ceiling::Guild(guild_id) => {
                    if let Some(limiter) = self.guild_limiter(*guild_id) {
                        while !limiter.try_acquire().await {
                            let wait = limiter.wait_time().await;
                            debug!(guild_id, wait_ms = wait.as_millis(), "Guild ceiling exhausted");
                            sleep(wait).await;
                        }
                    }
                }
            }
        }
    }

    fn guild_limiter(&self, guild_id: u64) -> Option<Arc<TokenBucket>> {
        let config = self.guild_config?;
        if let Some(limiter) = self.guilds.read().get(&guild_id) {
            return Some(Arc::clone(limiter));
        }
        let mut guilds = self.guilds.write();
        Some(Arc::clone(
            guilds
                .entry(guild_id)
                .or_insert_with(|| Arc::new(TokenBucket::from_config(&config))),
        ))
    }
}
