//! Per-bucket FIFO queue and quota state.
//!
//! A bucket moves through `Idle → Draining → Throttled → Idle`. Entries take
//! the bucket in arrival order through a fair async mutex; the holder of a
//! [`BucketSlot`] is the single in-flight request for that bucket. Quota is
//! only ever written from response headers (or a 429) by the slot holder.
//!
//! A queue outlives the discovery of its server bucket hash: the first queue
//! to report a hash is adopted as that hash's queue, so entries waiting on it
//! and entries arriving afterwards share one line.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::{BucketKey, RateLimitHeaders};

/// Observable phase of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketPhase {
    /// Quota available, nothing in flight.
    Idle,
    /// The head entry is in flight.
    Draining,
    /// Quota exhausted until the reset deadline.
    Throttled,
}

#[derive(Debug, Default)]
struct BucketState {
    limit: Option<u32>,
    remaining: Option<u32>,
    reset_at: Option<Instant>,
    reset_after: Option<Duration>,
    in_flight: bool,
    released_at: Option<Instant>,
}

impl BucketState {
    fn wait_time(&self, now: Instant) -> Option<Duration> {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset_at)) if reset_at > now => Some(reset_at - now),
            _ => None,
        }
    }

    /// Consume one unit of quota for a dispatch.
    fn take(&mut self, now: Instant) {
        if self.reset_at.is_some_and(|reset_at| reset_at <= now) {
            // Window elapsed: assume a full bucket until the server says otherwise.
            self.remaining = self.limit;
            self.reset_at = None;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        self.in_flight = true;
    }

    fn update(&mut self, headers: &RateLimitHeaders, now: Instant) {
        if let Some(limit) = headers.limit {
            self.limit = Some(limit);
        }
        if let Some(remaining) = headers.remaining {
            self.remaining = Some(remaining);
        }
        if let Some(reset_after) = headers.reset_after {
            self.reset_after = Some(reset_after);
            self.reset_at = Some(now + reset_after);
        }
    }

    fn throttle(&mut self, retry_after: Duration, now: Instant) {
        self.remaining = Some(0);
        self.reset_after = Some(retry_after);
        self.reset_at = Some(now + retry_after);
    }

    fn phase(&self, now: Instant) -> BucketPhase {
        if self.wait_time(now).is_some() {
            BucketPhase::Throttled
        } else if self.in_flight {
            BucketPhase::Draining
        } else {
            BucketPhase::Idle
        }
    }
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub key: String,
    pub phase: BucketPhase,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    /// Time left until the reset deadline, if one is known and in the future.
    pub resets_in: Option<Duration>,
    /// Server-reported window length from the last response.
    pub reset_after: Option<Duration>,
    /// Entries waiting for the bucket (not counting the in-flight one).
    pub queued: usize,
}

/// FIFO queue for one rate-limit bucket.
#[derive(Debug)]
pub struct BucketQueue {
    key: BucketKey,
    learned: Mutex<Option<BucketKey>>,
    turn: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<BucketState>,
    waiting: AtomicUsize,
}

impl BucketQueue {
    #[must_use]
    pub fn new(key: BucketKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            learned: Mutex::new(None),
            turn: Arc::new(tokio::sync::Mutex::new(())),
            state: Mutex::new(BucketState::default()),
            waiting: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub const fn key(&self) -> &BucketKey {
        &self.key
    }

    /// Wait for this entry's turn at the head of the queue.
    ///
    /// Entries are granted in arrival order. Dropping the returned future
    /// before it resolves removes the entry without touching bucket state.
    pub async fn acquire(self: &Arc<Self>) -> BucketSlot {
        let _waiting = WaitingGuard::new(&self.waiting);
        let turn = Arc::clone(&self.turn).lock_owned().await;
        BucketSlot {
            queue: Arc::clone(self),
            _turn: turn,
        }
    }

    /// Key to report for this queue: the learned one once adopted.
    #[must_use]
    pub fn current_key(&self) -> BucketKey {
        self.learned
            .lock()
            .clone()
            .unwrap_or_else(|| self.key.clone())
    }

    /// Record that this queue now serves the learned bucket `key`.
    pub fn adopt(&self, key: BucketKey) {
        *self.learned.lock() = Some(key);
    }

    /// Apply quota reported through a different queue on the same bucket.
    pub fn seed(&self, headers: &RateLimitHeaders) {
        self.state.lock().update(headers, Instant::now());
    }

    /// Whether an entry holds the bucket or waits for it.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.waiting.load(Ordering::Acquire) > 0 || self.turn.try_lock().is_err()
    }

    /// How long the queue has had nothing to do, or `None` while busy.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        if self.is_busy() {
            return None;
        }
        let released_at = self.state.lock().released_at;
        Some(released_at.map_or(Duration::MAX, |at| now.saturating_duration_since(at)))
    }

    #[must_use]
    pub fn snapshot(&self) -> BucketSnapshot {
        let now = Instant::now();
        let key = self.current_key().to_string();
        let state = self.state.lock();
        BucketSnapshot {
            key,
            phase: state.phase(now),
            limit: state.limit,
            remaining: state.remaining,
            resets_in: state.wait_time(now).or_else(|| {
                state
                    .reset_at
                    .filter(|reset_at| *reset_at > now)
                    .map(|reset_at| reset_at - now)
            }),
            reset_after: state.reset_after,
            queued: self.waiting.load(Ordering::Acquire),
        }
    }
}

/// Exclusive right to dispatch on a bucket.
///
/// Held for every attempt of one request, so a retry keeps its place ahead of
/// entries that queued after it.
#[derive(Debug)]
pub struct BucketSlot {
    queue: Arc<BucketQueue>,
    _turn: OwnedMutexGuard<()>,
}

impl BucketSlot {
    #[must_use]
    pub fn key(&self) -> &BucketKey {
        &self.queue.key
    }

    /// The queue this slot was taken from.
    #[must_use]
    pub const fn queue(&self) -> &Arc<BucketQueue> {
        &self.queue
    }

    /// Wait until the bucket has quota, then consume one unit.
    ///
    /// Returns how long the bucket was throttled.
    pub async fn wait_for_quota(&self) -> Duration {
        let start = Instant::now();
        loop {
            let wait = {
                let mut state = self.queue.state.lock();
                let now = Instant::now();
                if let Some(wait) = state.wait_time(now) {
                    state.in_flight = false;
                    Some((now + wait, wait))
                } else {
                    state.take(now);
                    None
                }
            };

            match wait {
                Some((deadline, wait)) => {
                    debug!(
                        bucket = %self.queue.key,
                        wait_ms = wait.as_millis(),
                        "Bucket throttled"
                    );
                    sleep_until(deadline).await;
                }
                None => return start.elapsed(),
            }
        }
    }

    /// Overwrite quota from a response's headers.
    pub fn record_response(&self, headers: &RateLimitHeaders) {
        self.queue.state.lock().update(headers, Instant::now());
    }

    /// Throttle the bucket for exactly `retry_after`, whatever the cached
    /// quota says.
    pub fn throttle(&self, retry_after: Duration) {
        self.queue.state.lock().throttle(retry_after, Instant::now());
    }
}

impl Drop for BucketSlot {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        state.in_flight = false;
        state.released_at = Some(Instant::now());
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
