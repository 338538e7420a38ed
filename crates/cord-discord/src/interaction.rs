//! Tracks which interaction tokens already received their primary response.
//!
//! Each interaction accepts exactly one callback; everything after that must
//! go through the followup webhook. Tokens stay valid for 15 minutes, after
//! which a record is meaningless and reads as absent.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// How long Discord honors an interaction token.
pub const INTERACTION_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug)]
pub struct InteractionTokenGuard {
    ttl: Duration,
    responded: Mutex<HashMap<String, Instant>>,
}

impl InteractionTokenGuard {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            responded: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record that `token` received its primary response.
    pub fn mark_primary_sent(&self, token: &str) {
        let now = Instant::now();
        let mut responded = self.responded.lock();
        responded.retain(|_, sent_at| !self.is_expired(*sent_at, now));
        responded.insert(token.to_string(), now);
    }

    /// Whether `token` received its primary response within the validity
    /// window.
    #[must_use]
    pub fn has_primary_response(&self, token: &str) -> bool {
        let now = Instant::now();
        self.responded
            .lock()
            .get(token)
            .is_some_and(|sent_at| !self.is_expired(*sent_at, now))
    }

    /// Take the primary response slot for `token`.
    ///
    /// Returns `false` if another caller already holds it. The check and the
    /// record happen under one lock.
    pub fn claim_primary(&self, token: &str) -> bool {
        let now = Instant::now();
        let mut responded = self.responded.lock();
        if responded
            .get(token)
            .is_some_and(|sent_at| !self.is_expired(*sent_at, now))
        {
            return false;
        }
        responded.retain(|_, sent_at| !self.is_expired(*sent_at, now));
        responded.insert(token.to_string(), now);
        true
    }

    /// Drop expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut responded = self.responded.lock();
        let before = responded.len();
        responded.retain(|_, sent_at| !self.is_expired(*sent_at, now));
        let purged = before - responded.len();
        if purged > 0 {
            debug!(purged, "Purged expired interaction tokens");
        }
        purged
    }

    /// Number of stored records, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.responded.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, sent_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(sent_at) >= self.ttl
    }
}

impl Default for InteractionTokenGuard {
    fn default() -> Self {
        Self::new(INTERACTION_TOKEN_TTL)
    }
}
