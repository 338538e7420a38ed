//! End-to-end coordinator scenarios over a scripted transport.
//!
//! All tests run on a paused tokio clock, so dispatch times are exact.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cord_ratelimit::{
    BucketPhase, Coordinator, CoordinatorConfig, ExponentialBackoff, Method, Request,
    RequestError, Response, RetryPolicy, TOKEN_QUEUE_IDLE_TTL, Transport, TransportError,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Scripted transport
// ============================================================================

enum Step {
    Reply(Response),
    Delayed(Duration, Response),
    Fail(TransportError),
    Stall,
}

struct ScriptedTransport {
    start: Instant,
    script: Mutex<HashMap<String, VecDeque<Step>>>,
    sent: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedTransport {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            script: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn script(self, path: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.script
            .lock()
            .entry(path.to_string())
            .or_default()
            .extend(steps);
        self
    }

    /// Paths in dispatch order, with the time since the test started.
    fn sent(&self) -> Vec<(String, Duration)> {
        self.sent.lock().clone()
    }

    fn sent_to(&self, path: &str) -> Vec<Duration> {
        self.sent()
            .into_iter()
            .filter(|(p, _)| p == path)
            .map(|(_, at)| at)
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let path = request.route.path().to_string();
        self.sent.lock().push((path.clone(), self.start.elapsed()));

        let step = self
            .script
            .lock()
            .get_mut(&path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Step::Reply(Response::new(200)));

        match step {
            Step::Reply(response) => Ok(response),
            Step::Delayed(delay, response) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Step::Fail(err) => Err(err),
            Step::Stall => std::future::pending().await,
        }
    }
}

fn config() -> CoordinatorConfig {
    cord_testkit::init_test_tracing();
    CoordinatorConfig {
        retry: RetryPolicy::new(
            3,
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1)),
        ),
        attempt_timeout: Duration::from_secs(5),
        ..CoordinatorConfig::default()
    }
}

fn ok_with_quota(limit: u32, remaining: u32, reset_after: &str) -> Response {
    Response::new(200)
        .with_header("x-ratelimit-limit", limit.to_string())
        .with_header("x-ratelimit-remaining", remaining.to_string())
        .with_header("x-ratelimit-reset-after", reset_after)
}

fn rate_limited(retry_after_secs: f64, global: bool) -> Response {
    let body = serde_json::json!({
        "message": "You are being rate limited.",
        "retry_after": retry_after_secs,
        "global": global,
    });
    let mut response = Response::new(429)
        .with_header("retry-after", format!("{}", retry_after_secs.ceil()))
        .with_body(serde_json::to_vec(&body).unwrap());
    if global {
        response = response.with_header("x-ratelimit-global", "true");
    }
    response
}

fn get(path: &str) -> Request {
    Request::new(Method::Get, path).unwrap()
}

/// Spawn `execute` and let it reach its queue before returning.
async fn spawn_execute(
    coordinator: &Coordinator<ScriptedTransport>,
    request: Request,
) -> JoinHandle<Result<Response, RequestError>> {
    let coordinator = coordinator.clone();
    let handle = tokio::spawn(async move { coordinator.execute(request).await });
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
    handle
}

// ============================================================================
// Bucket ordering and quota
// ============================================================================

#[tokio::test(start_paused = true)]
async fn queued_requests_wait_for_reset_and_settle_in_order() {
    // Given a bucket with limit 5 and a single request left for the next second
    let transport = ScriptedTransport::new()
        .script(
            "/channels/1/messages?warmup",
            [Step::Reply(
                ok_with_quota(5, 1, "1.0").with_header("x-ratelimit-bucket", "msgs"),
            )],
        )
        .script("/channels/1/messages?n=1", [Step::Reply(ok_with_quota(5, 0, "1.0"))])
        .script("/channels/1/messages?n=2", [Step::Reply(ok_with_quota(5, 4, "1.0"))])
        .script("/channels/1/messages?n=3", [Step::Reply(ok_with_quota(5, 3, "1.0"))]);
    let coordinator = Coordinator::new(transport, config());
    coordinator
        .execute(get("/channels/1/messages?warmup"))
        .await
        .unwrap();

    // When three requests are queued back to back
    let first = spawn_execute(&coordinator, get("/channels/1/messages?n=1")).await;
    let second = spawn_execute(&coordinator, get("/channels/1/messages?n=2")).await;
    let third = spawn_execute(&coordinator, get("/channels/1/messages?n=3")).await;

    for handle in [first, second, third] {
        assert_eq!(handle.await.unwrap().unwrap().status, 200);
    }

    // Then the first goes out immediately and the rest only after the reset
    let sent = coordinator.transport().sent();
    let paths: Vec<_> = sent.iter().map(|(p, _)| p.as_str()).collect();
    assert_eq!(
        paths,
        [
            "/channels/1/messages?warmup",
            "/channels/1/messages?n=1",
            "/channels/1/messages?n=2",
            "/channels/1/messages?n=3",
        ]
    );
    assert_eq!(sent[1].1, Duration::ZERO);
    assert_eq!(sent[2].1, Duration::from_secs(1));
    assert_eq!(sent[3].1, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn distinct_buckets_do_not_block_each_other() {
    let transport = ScriptedTransport::new()
        .script("/channels/1/messages", [Step::Reply(ok_with_quota(1, 0, "10"))])
        .script("/channels/2/messages", [Step::Reply(ok_with_quota(1, 0, "10"))]);
    let coordinator = Coordinator::new(transport, config());

    coordinator.execute(get("/channels/1/messages")).await.unwrap();
    coordinator.execute(get("/channels/2/messages")).await.unwrap();

    // Channel 1 is exhausted, channel 2 was dispatched anyway
    assert_eq!(
        coordinator.transport().sent_to("/channels/2/messages"),
        [Duration::ZERO]
    );
    assert!(
        coordinator
            .buckets()
            .iter()
            .all(|b| b.phase == BucketPhase::Throttled)
    );
}

// ============================================================================
// 429 handling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn rate_limited_request_blocks_bucket_then_retries_once() {
    // Given a request that is rate limited for 2000ms
    let transport = ScriptedTransport::new().script(
        "/channels/1/messages?a",
        [Step::Reply(rate_limited(2.0, false)), Step::Reply(Response::new(200))],
    );
    let coordinator = Coordinator::new(transport, config());

    // When it and a follower on the same bucket are executed
    let first = spawn_execute(&coordinator, get("/channels/1/messages?a")).await;
    let follower = spawn_execute(&coordinator, get("/channels/1/messages?b")).await;

    assert_eq!(first.await.unwrap().unwrap().status, 200);
    follower.await.unwrap().unwrap();

    // Then nothing hits the bucket for 2000ms, the retry goes first, once
    let sent = coordinator.transport().sent();
    assert_eq!(
        sent,
        [
            ("/channels/1/messages?a".to_string(), Duration::ZERO),
            ("/channels/1/messages?a".to_string(), Duration::from_secs(2)),
            ("/channels/1/messages?b".to_string(), Duration::from_secs(2)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn body_retry_after_beats_header_and_cached_quota() {
    // Cached quota says 4 left, the 429 says wait 1.5s
    let limited = rate_limited(1.5, false)
        .with_header("x-ratelimit-limit", "5")
        .with_header("x-ratelimit-remaining", "4")
        .with_header("x-ratelimit-reset-after", "30");
    let transport = ScriptedTransport::new()
        .script("/channels/1/typing", [Step::Reply(limited)]);
    let coordinator = Coordinator::new(transport, config());

    let request = Request::new(Method::Post, "/channels/1/typing").unwrap();
    coordinator.execute(request).await.unwrap();

    assert_eq!(
        coordinator.transport().sent_to("/channels/1/typing"),
        [Duration::ZERO, Duration::from_millis(1500)]
    );
}

#[tokio::test(start_paused = true)]
async fn global_rate_limit_pauses_other_buckets() {
    let transport = ScriptedTransport::new()
        .script("/channels/1/messages", [Step::Reply(rate_limited(1.5, true))]);
    let coordinator = Coordinator::new(transport, config());

    // Given a global 429 on one bucket
    let limited = spawn_execute(&coordinator, get("/channels/1/messages")).await;
    assert_eq!(
        coordinator.global_paused_for(),
        Some(Duration::from_millis(1500))
    );

    // When another bucket and an exempt interaction callback are executed
    let other = spawn_execute(&coordinator, get("/channels/2/messages")).await;
    let callback = Request::new(Method::Post, "/interactions/9/tok/callback").unwrap();
    coordinator.execute(callback).await.unwrap();

    limited.await.unwrap().unwrap();
    other.await.unwrap().unwrap();

    // Then only the exempt route went out during the pause
    let transport = coordinator.transport();
    assert_eq!(
        transport.sent_to("/interactions/9/tok/callback"),
        [Duration::ZERO]
    );
    assert_eq!(
        transport.sent_to("/channels/2/messages"),
        [Duration::from_millis(1500)]
    );
    assert_eq!(
        transport.sent_to("/channels/1/messages"),
        [Duration::ZERO, Duration::from_millis(1500)]
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limit_wait_is_bounded_per_request() {
    let transport = ScriptedTransport::new().script(
        "/guilds/1/roles",
        [
            Step::Reply(rate_limited(2.0, false)),
            Step::Reply(rate_limited(2.0, false)),
        ],
    );
    let config = CoordinatorConfig {
        retry: config()
            .retry
            .with_max_rate_limit_wait(Duration::from_secs(3)),
        ..config()
    };
    let coordinator = Coordinator::new(transport, config);

    let err = coordinator
        .execute(get("/guilds/1/roles"))
        .await
        .unwrap_err();

    match err {
        RequestError::RateLimited {
            attempts,
            retry_after,
            global,
            ..
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(retry_after, Duration::from_secs(2));
            assert!(!global);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

// ============================================================================
// Transient and client failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn server_errors_back_off_and_give_up() {
    let transport = ScriptedTransport::new().script(
        "/channels/1",
        [
            Step::Reply(Response::new(502)),
            Step::Reply(Response::new(503)),
            Step::Reply(Response::new(500).with_body(r#"{"message":"oops","code":0}"#)),
        ],
    );
    let coordinator = Coordinator::new(transport, config());

    let err = coordinator.execute(get("/channels/1")).await.unwrap_err();

    assert!(matches!(err, RequestError::TransientServer { .. }));
    assert_eq!(err.status(), Some(500));
    assert_eq!(err.attempts(), 3);
    assert!(err.is_retryable());
    assert_eq!(
        coordinator.transport().sent_to("/channels/1"),
        [
            Duration::ZERO,
            Duration::from_millis(100),
            Duration::from_millis(300)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn transient_failure_then_success() {
    let transport = ScriptedTransport::new().script(
        "/channels/1",
        [
            Step::Fail(TransportError::Connect("connection reset".into())),
            Step::Reply(Response::new(200)),
        ],
    );
    let coordinator = Coordinator::new(transport, config());

    let response = coordinator.execute(get("/channels/1")).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(coordinator.transport().sent_to("/channels/1").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn stalled_attempts_time_out() {
    let transport = ScriptedTransport::new()
        .script("/channels/1", [Step::Stall, Step::Stall, Step::Stall]);
    let config = CoordinatorConfig {
        attempt_timeout: Duration::from_secs(1),
        ..config()
    };
    let coordinator = Coordinator::new(transport, config);

    let err = coordinator.execute(get("/channels/1")).await.unwrap_err();

    match err {
        RequestError::TransientServer {
            status,
            attempts,
            message,
            ..
        } => {
            assert_eq!(status, None);
            assert_eq!(attempts, 3);
            assert_eq!(message, "Request timed out");
        }
        other => panic!("expected TransientServer, got {other:?}"),
    }
    assert_eq!(
        coordinator.transport().sent_to("/channels/1"),
        [
            Duration::ZERO,
            Duration::from_millis(1100),
            Duration::from_millis(2300)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn client_errors_surface_immediately() {
    let transport = ScriptedTransport::new().script(
        "/channels/404",
        [Step::Reply(
            Response::new(404).with_body(r#"{"message":"Unknown Channel","code":10003}"#),
        )],
    );
    let coordinator = Coordinator::new(transport, config());

    let err = coordinator.execute(get("/channels/404")).await.unwrap_err();

    match err {
        RequestError::ClientRejected {
            status,
            attempts,
            body,
            ..
        } => {
            assert_eq!(status, 404);
            assert_eq!(attempts, 1);
            assert_eq!(body.code, Some(10003));
            assert_eq!(body.message, "Unknown Channel");
        }
        other => panic!("expected ClientRejected, got {other:?}"),
    }
    assert_eq!(coordinator.transport().sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unbuildable_request_is_not_retried() {
    let transport = ScriptedTransport::new().script(
        "/channels/1",
        [Step::Fail(TransportError::Other("bad header value".into()))],
    );
    let coordinator = Coordinator::new(transport, config());

    let err = coordinator.execute(get("/channels/1")).await.unwrap_err();

    assert!(matches!(err, RequestError::Dispatch { .. }));
    assert!(!err.is_retryable());
    assert_eq!(coordinator.transport().sent().len(), 1);
}

// ============================================================================
// Bucket learning
// ============================================================================

#[tokio::test(start_paused = true)]
async fn routes_reporting_the_same_hash_share_a_bucket() {
    let shared = || ok_with_quota(5, 2, "5").with_header("x-ratelimit-bucket", "abcd");
    let transport = ScriptedTransport::new()
        .script("/channels/1/messages", [Step::Reply(shared())])
        .script("/channels/1/messages/7", [Step::Reply(shared())]);
    let coordinator = Coordinator::new(transport, config());

    let create = Request::new(Method::Post, "/channels/1/messages").unwrap();
    let edit = Request::new(Method::Patch, "/channels/1/messages/7").unwrap();
    let (create_route, edit_route) = (create.route.clone(), edit.route.clone());

    coordinator.execute(create).await.unwrap();
    coordinator.execute(edit).await.unwrap();

    let resolver = coordinator.resolver();
    assert_eq!(resolver.learned_len(), 2);
    let key = resolver.resolve(&create_route).key;
    assert!(key.is_learned());
    assert_eq!(key, resolver.resolve(&edit_route).key);

    // The learned bucket was seeded from the response that taught it
    let learned = coordinator
        .buckets()
        .into_iter()
        .find(|b| b.key == key.to_string())
        .unwrap();
    assert_eq!(learned.limit, Some(5));
    assert_eq!(learned.remaining, Some(2));
}

fn sent_paths(coordinator: &Coordinator<ScriptedTransport>) -> Vec<(String, Duration)> {
    coordinator
        .transport()
        .sent()
        .into_iter()
        .map(|(path, at)| (path.trim_start_matches("/channels/1/messages").to_string(), at))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn retry_after_learning_a_hash_stays_ahead_of_later_arrivals() {
    // Given a request whose 502 first names the bucket, and one queued behind it
    let transport = ScriptedTransport::new().script(
        "/channels/1/messages?a",
        [Step::Delayed(
            Duration::from_secs(1),
            Response::new(502).with_header("x-ratelimit-bucket", "h"),
        )],
    );
    let coordinator = Coordinator::new(transport, config());
    let a = spawn_execute(&coordinator, get("/channels/1/messages?a")).await;
    let b = spawn_execute(&coordinator, get("/channels/1/messages?b")).await;

    // When a third request arrives while the first backs off
    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(coordinator.resolver().learned_len(), 1);
    let d = spawn_execute(&coordinator, get("/channels/1/messages?d")).await;

    for handle in [a, b, d] {
        handle.await.unwrap().unwrap();
    }

    // Then the retry goes first and the late request keeps its place
    let retry_at = Duration::from_millis(1100);
    assert_eq!(
        sent_paths(&coordinator),
        [
            ("?a".to_string(), Duration::ZERO),
            ("?a".to_string(), retry_at),
            ("?b".to_string(), retry_at),
            ("?d".to_string(), retry_at),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn rate_limit_that_names_the_bucket_keeps_queue_order() {
    let limited = rate_limited(2.0, false)
        .with_header("x-ratelimit-bucket", "h")
        .with_header("x-ratelimit-limit", "5")
        .with_header("x-ratelimit-remaining", "0")
        .with_header("x-ratelimit-reset-after", "2");
    let transport = ScriptedTransport::new().script(
        "/channels/1/messages?a",
        [Step::Delayed(Duration::from_secs(1), limited)],
    );
    let coordinator = Coordinator::new(transport, config());
    let a = spawn_execute(&coordinator, get("/channels/1/messages?a")).await;
    let b = spawn_execute(&coordinator, get("/channels/1/messages?b")).await;

    tokio::time::sleep(Duration::from_millis(1001)).await;
    let d = spawn_execute(&coordinator, get("/channels/1/messages?d")).await;

    for handle in [a, b, d] {
        handle.await.unwrap().unwrap();
    }

    let reset = Duration::from_secs(3);
    assert_eq!(
        sent_paths(&coordinator),
        [
            ("?a".to_string(), Duration::ZERO),
            ("?a".to_string(), reset),
            ("?b".to_string(), reset),
            ("?d".to_string(), reset),
        ]
    );
    // One queue serves both the route and its learned bucket
    assert_eq!(coordinator.buckets().len(), 1);
    assert!(coordinator.buckets()[0].key.starts_with("h@"));
}

#[tokio::test(start_paused = true)]
async fn shared_resolver_carries_learned_buckets() {
    let transport = ScriptedTransport::new().script(
        "/guilds/1/members/2",
        [Step::Reply(Response::new(200).with_header("x-ratelimit-bucket", "m"))],
    );
    let first = Coordinator::new(transport, config());
    first.execute(get("/guilds/1/members/2")).await.unwrap();

    let second = Coordinator::with_resolver(
        ScriptedTransport::new(),
        config(),
        Arc::clone(first.resolver()),
    );
    let route = get("/guilds/1/members/3").route;
    assert_eq!(second.resolver().learned_bucket(&route).as_deref(), Some("m"));
}

#[tokio::test(start_paused = true)]
async fn idle_interaction_queues_are_dropped_after_token_lifetime() {
    let coordinator = Coordinator::new(ScriptedTransport::new(), config());
    let callback = |id: u64| {
        Request::new(Method::Post, &format!("/interactions/{id}/tok{id}/callback")).unwrap()
    };

    coordinator.execute(callback(1)).await.unwrap();
    coordinator.execute(get("/channels/1/messages")).await.unwrap();
    assert_eq!(coordinator.buckets().len(), 2);

    tokio::time::sleep(TOKEN_QUEUE_IDLE_TTL).await;
    coordinator.execute(callback(2)).await.unwrap();

    let keys: Vec<_> = coordinator.buckets().into_iter().map(|b| b.key).collect();
    assert_eq!(keys.len(), 2, "{keys:?}");
    assert!(keys.iter().any(|k| k.ends_with("@interaction:2")));
    assert!(keys.iter().any(|k| k.ends_with("@channel:1")));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn abandoned_queued_request_is_never_sent() {
    let transport = ScriptedTransport::new().script(
        "/channels/1/messages?slow",
        [Step::Delayed(Duration::from_secs(1), Response::new(200))],
    );
    let coordinator = Coordinator::new(transport, config());

    let slow = spawn_execute(&coordinator, get("/channels/1/messages?slow")).await;
    let abandoned = spawn_execute(&coordinator, get("/channels/1/messages?gone")).await;
    let last = spawn_execute(&coordinator, get("/channels/1/messages?last")).await;

    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());

    slow.await.unwrap().unwrap();
    last.await.unwrap().unwrap();

    let paths: Vec<_> = coordinator
        .transport()
        .sent()
        .into_iter()
        .map(|(p, _)| p)
        .collect();
    assert_eq!(
        paths,
        ["/channels/1/messages?slow", "/channels/1/messages?last"]
    );
    assert!(coordinator.buckets().iter().all(|b| b.queued == 0));
}

#[tokio::test(start_paused = true)]
async fn in_flight_request_completes_after_caller_leaves() {
    let transport = ScriptedTransport::new().script(
        "/channels/1/messages",
        [Step::Delayed(
            Duration::from_secs(1),
            ok_with_quota(5, 0, "10"),
        )],
    );
    let coordinator = Coordinator::new(transport, config());

    let caller = spawn_execute(&coordinator, get("/channels/1/messages")).await;
    assert_eq!(coordinator.transport().sent().len(), 1);
    caller.abort();
    let _ = caller.await;

    tokio::time::sleep(Duration::from_secs(2)).await;

    // The response was still applied to the bucket
    let buckets = coordinator.buckets();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].remaining, Some(0));
    assert_eq!(buckets[0].phase, BucketPhase::Throttled);
}
