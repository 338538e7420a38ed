//! Request coordinator: resolve, queue, wait, dispatch, learn, retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::{Instant, sleep, timeout};
use tracing::{Instrument, debug, instrument, warn};

use crate::{
    ApiErrorBody, AttemptResult, BucketKey, BucketQueue, BucketResolver, BucketSlot,
    BucketSnapshot, Ceiling, Ceilings, FailureClass, RateLimitConfig, RateLimitHeaders,
    RateLimitedBody, Request, RequestError, ResolvedBucket, Response, RetryDecision, RetryPolicy,
    RetryScope, RetryState, Route, Transport, TransportError, rate_limit_delay,
};

/// Delay applied to a 429 that carries neither a body nor a usable header.
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Interaction and webhook tokens stop working after 15 minutes.
pub const TOKEN_QUEUE_IDLE_TTL: Duration = Duration::from_secs(15 * 60);

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub retry: RetryPolicy,

    /// Deadline for a single attempt.
    pub attempt_timeout: Duration,

    /// Bot-wide global limit.
    pub global: RateLimitConfig,

    /// Optional per-guild cap.
    pub guild: Option<RateLimitConfig>,

    /// Idle time after which queues keyed by an interaction or webhook token
    /// are dropped.
    pub token_queue_ttl: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(30),
            global: RateLimitConfig::discord_global(),
            guild: None,
            token_queue_ttl: TOKEN_QUEUE_IDLE_TTL,
        }
    }
}

/// Schedules requests over a [`Transport`] so the bot never exceeds a known
/// limit.
///
/// Cheap to clone; clones share queues, ceilings and the resolver.
pub struct Coordinator<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Coordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> std::fmt::Debug for Coordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("queue_keys", &self.inner.queues.read().len())
            .field("learned", &self.inner.resolver.learned_len())
            .finish_non_exhaustive()
    }
}

struct Inner<T> {
    transport: T,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    resolver: Arc<BucketResolver>,
    ceilings: Ceilings,
    token_queue_ttl: Duration,
    /// Provisional and learned keys; several keys may share one queue.
    queues: RwLock<HashMap<BucketKey, Arc<BucketQueue>>>,
}

impl<T: Transport> Coordinator<T> {
    /// Create a coordinator with its own resolver.
    pub fn new(transport: T, config: CoordinatorConfig) -> Self {
        Self::with_resolver(transport, config, Arc::new(BucketResolver::new()))
    }

    /// Create a coordinator sharing an existing resolver.
    pub fn with_resolver(
        transport: T,
        config: CoordinatorConfig,
        resolver: Arc<BucketResolver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                retry: config.retry,
                attempt_timeout: config.attempt_timeout,
                resolver,
                ceilings: Ceilings::new(&config.global, config.guild),
                token_queue_ttl: config.token_queue_ttl,
                queues: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Execute a request, honoring bucket order, quota and ceilings.
    ///
    /// Dropping the returned future while the request is still queued removes
    /// it without side effects. Once dispatched, the request runs to
    /// completion in the background and its result is discarded.
    ///
    /// # Errors
    ///
    /// Returns a [`RequestError`] carrying the bucket, the last status and the
    /// number of attempts.
    #[instrument(
        skip(self, request),
        fields(method = %request.route.method(), route = %request.route.template())
    )]
    pub async fn execute(&self, request: Request) -> Result<Response, RequestError> {
        let resolved = self.inner.resolver.resolve(&request.route);
        let queue = self.inner.queue_for(&request.route, &resolved);
        let bucket = resolved.key.to_string();

        let slot = queue.acquire().await;
        debug!(bucket = %bucket, "Bucket slot acquired");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run(slot, resolved, request).await }.in_current_span())
            .await
            .map_err(|err| RequestError::Dispatch {
                bucket,
                message: err.to_string(),
            })?
    }

    /// Snapshots of every bucket seen so far, ordered by key.
    #[must_use]
    pub fn buckets(&self) -> Vec<BucketSnapshot> {
        let queues = self.inner.queues.read();
        let mut unique: Vec<&Arc<BucketQueue>> = Vec::with_capacity(queues.len());
        for queue in queues.values() {
            if !unique.iter().any(|seen| Arc::ptr_eq(seen, queue)) {
                unique.push(queue);
            }
        }
        let mut snapshots: Vec<_> = unique.into_iter().map(|queue| queue.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<BucketResolver> {
        &self.inner.resolver
    }

    /// Remaining global pause, if a global 429 is in effect.
    #[must_use]
    pub fn global_paused_for(&self) -> Option<Duration> {
        self.inner.ceilings.global().paused_for()
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }
}

impl<T: Transport> Inner<T> {
    /// Pick the queue a new request joins.
    ///
    /// A route keeps using its current queue while that queue has work, so
    /// learning a bucket hash never lets a later request pass an earlier one.
    /// Once idle, the route moves to the queue of its learned bucket.
    fn queue_for(&self, route: &Route, resolved: &ResolvedBucket) -> Arc<BucketQueue> {
        let lane = BucketKey::provisional(route);
        {
            let queues = self.queues.read();
            if let Some(current) = queues.get(&lane) {
                let settled = !resolved.key.is_learned()
                    || queues
                        .get(&resolved.key)
                        .is_some_and(|shared| Arc::ptr_eq(shared, current));
                if settled || current.is_busy() {
                    return Arc::clone(current);
                }
            }
        }

        let mut queues = self.queues.write();
        if let Some(current) = queues.get(&lane) {
            if !resolved.key.is_learned() || current.is_busy() {
                return Arc::clone(current);
            }
        }

        if lane.major.is_token_scoped() {
            self.prune_token_queues(&mut queues);
        }

        let queue = if resolved.key.is_learned() {
            let shared = queues
                .entry(resolved.key.clone())
                .or_insert_with(|| BucketQueue::new(resolved.key.clone()));
            Arc::clone(shared)
        } else {
            BucketQueue::new(lane.clone())
        };
        queues.insert(lane, Arc::clone(&queue));
        queue
    }

    /// Share the queue that reported `learned` with every route mapped to it.
    fn adopt(&self, learned: BucketKey, slot: &BucketSlot, headers: &RateLimitHeaders) {
        let mut queues = self.queues.write();
        match queues.get(&learned) {
            Some(shared) if !Arc::ptr_eq(shared, slot.queue()) => shared.seed(headers),
            Some(_) => {}
            None => {
                debug!(bucket = %learned, "Adopting queue for learned bucket");
                slot.queue().adopt(learned.clone());
                queues.insert(learned, Arc::clone(slot.queue()));
            }
        }
    }

    fn prune_token_queues(&self, queues: &mut HashMap<BucketKey, Arc<BucketQueue>>) {
        let now = Instant::now();
        let before = queues.len();
        queues.retain(|key, queue| {
            !key.major.is_token_scoped()
                || queue
                    .idle_for(now)
                    .is_none_or(|idle| idle < self.token_queue_ttl)
        });
        let pruned = before - queues.len();
        if pruned > 0 {
            debug!(pruned, "Dropped idle token-scoped queues");
        }
    }

    async fn run(
        &self,
        slot: BucketSlot,
        resolved: ResolvedBucket,
        request: Request,
    ) -> Result<Response, RequestError> {
        let bucket = resolved.key.to_string();
        let mut state = RetryState::default();

        loop {
            slot.wait_for_quota().await;
            self.ceilings.acquire(&resolved.ceilings).await;

            state.attempts += 1;
            debug!(bucket = %bucket, attempt = state.attempts, "Dispatching request");

            let (result, response, failure) =
                match timeout(self.attempt_timeout, self.transport.send(&request)).await {
                    Ok(Ok(response)) => {
                        let result = self.apply_response(&slot, &request, &response);
                        (result, Some(response), None)
                    }
                    Ok(Err(err)) if !err.is_transient() => {
                        return Err(RequestError::Dispatch {
                            bucket,
                            message: err.to_string(),
                        });
                    }
                    Ok(Err(err)) => (AttemptResult::TransportFailure, None, Some(err)),
                    Err(_) => (AttemptResult::TimedOut, None, Some(TransportError::Timeout)),
                };

            match self.retry.decide(&result, &mut state) {
                RetryDecision::Accept => {
                    return response.ok_or_else(|| RequestError::Dispatch {
                        bucket,
                        message: "accepted attempt without a response".into(),
                    });
                }
                RetryDecision::Retry { delay, scope } => {
                    debug!(
                        bucket = %bucket,
                        attempt = state.attempts,
                        delay_ms = delay.as_millis(),
                        ?scope,
                        "Retrying request"
                    );
                    match scope {
                        RetryScope::Backoff => sleep(delay).await,
                        // Exempt routes are not held back by the global pause
                        RetryScope::Global if !resolved.ceilings.contains(&Ceiling::Global) => {
                            sleep(delay).await;
                        }
                        RetryScope::Global | RetryScope::Bucket => {}
                    }
                }
                RetryDecision::GiveUp(class) => {
                    let err = terminal_error(class, bucket, &state, &result, response, failure);
                    warn!(error = %err, "Request failed");
                    return Err(err);
                }
            }
        }
    }

    /// Apply a response's headers to bucket and ceilings, and classify it.
    fn apply_response(
        &self,
        slot: &BucketSlot,
        request: &Request,
        response: &Response,
    ) -> AttemptResult {
        let headers = RateLimitHeaders::parse(&response.headers);
        slot.record_response(&headers);

        if let Some(hash) = headers.bucket.as_deref() {
            if let Some(learned) = self.resolver.learn(&request.route, hash) {
                self.adopt(learned, slot, &headers);
            }
        }

        if response.status != 429 {
            return AttemptResult::from_status(response.status);
        }

        let body = RateLimitedBody::parse(&response.body);
        let (retry_after, global) =
            rate_limit_delay(&headers, body.as_ref()).unwrap_or((FALLBACK_RETRY_AFTER, false));

        if global {
            self.ceilings.global().pause(retry_after);
        } else {
            warn!(
                bucket = %slot.key(),
                retry_after_ms = retry_after.as_millis(),
                scope = ?headers.scope,
                "Rate limited"
            );
            slot.throttle(retry_after);
        }

        AttemptResult::RateLimited {
            retry_after,
            global,
        }
    }
}

fn terminal_error(
    class: FailureClass,
    bucket: String,
    state: &RetryState,
    result: &AttemptResult,
    response: Option<Response>,
    failure: Option<TransportError>,
) -> RequestError {
    let attempts = state.attempts;
    match (class, result) {
        (FailureClass::RateLimited, AttemptResult::RateLimited { retry_after, global }) => {
            RequestError::RateLimited {
                bucket,
                attempts,
                retry_after: *retry_after,
                global: *global,
            }
        }
        (FailureClass::ClientRejected, _) => {
            let status = response.as_ref().map_or(400, |r| r.status);
            let body = response
                .map(|r| ApiErrorBody::parse(&r.body))
                .unwrap_or_default();
            RequestError::ClientRejected {
                bucket,
                status,
                attempts,
                body,
            }
        }
        _ => {
            let status = response.as_ref().map(|r| r.status);
            let message = match (failure, response) {
                (Some(err), _) => err.to_string(),
                (None, Some(r)) => ApiErrorBody::parse(&r.body).message,
                (None, None) => "no response".into(),
            };
            RequestError::TransientServer {
                bucket,
                status,
                attempts,
                message,
            }
        }
    }
}
