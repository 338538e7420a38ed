//! Mock Discord REST API for HTTP-level tests.
//!
//! Wraps wiremock with helpers for Discord's rate-limit headers and 429 bodies.

use std::time::Duration;

use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::fixtures;

/// A mock Discord API server.
pub struct MockApiServer {
    server: MockServer,
}

/// Rate limit headers attached to a mocked response.
#[derive(Debug, Clone, Default)]
pub struct BucketHeaders {
    pub bucket: Option<String>,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: f64,
}

impl BucketHeaders {
    #[must_use]
    pub fn new(limit: u32, remaining: u32, reset_after: f64) -> Self {
        Self {
            bucket: None,
            limit,
            remaining,
            reset_after,
        }
    }

    #[must_use]
    pub fn with_bucket(mut self, bucket: &str) -> Self {
        self.bucket = Some(bucket.to_string());
        self
    }

    fn apply(&self, mut template: ResponseTemplate) -> ResponseTemplate {
        template = template
            .insert_header("x-ratelimit-limit", self.limit.to_string().as_str())
            .insert_header("x-ratelimit-remaining", self.remaining.to_string().as_str())
            .insert_header("x-ratelimit-reset-after", self.reset_after.to_string().as_str());
        if let Some(bucket) = &self.bucket {
            template = template.insert_header("x-ratelimit-bucket", bucket.as_str());
        }
        template
    }
}

fn json_response(status: u16, body: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(status)
        .set_body_json(body)
        .insert_header("content-type", "application/json")
}

impl MockApiServer {
    /// Start a new mock server.
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Base URL to use as the client's API URL.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.server.uri()
    }

    /// The underlying wiremock server for custom mocks.
    #[must_use]
    pub const fn inner(&self) -> &MockServer {
        &self.server
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Response Setup
    // ─────────────────────────────────────────────────────────────────────────────

    /// Respond to `GET request_path` with JSON.
    pub async fn expect_get(&self, request_path: &str, response: serde_json::Value) {
        self.expect_json("GET", request_path, 200, response).await;
    }

    /// Respond to `POST request_path` with JSON.
    pub async fn expect_post(&self, request_path: &str, response: serde_json::Value) {
        self.expect_json("POST", request_path, 200, response).await;
    }

    /// Respond to `POST request_path` only when the body matches exactly.
    pub async fn expect_post_with_body(
        &self,
        request_path: &str,
        expected_body: serde_json::Value,
        response: serde_json::Value,
    ) {
        Mock::given(method("POST"))
            .and(path(request_path))
            .and(body_json(&expected_body))
            .respond_with(json_response(200, response))
            .mount(&self.server)
            .await;
    }

    /// Respond to any request with the given method and path.
    pub async fn expect_json(
        &self,
        http_method: &str,
        request_path: &str,
        status: u16,
        response: serde_json::Value,
    ) {
        Mock::given(method(http_method))
            .and(path(request_path))
            .respond_with(json_response(status, response))
            .mount(&self.server)
            .await;
    }

    /// Respond with `204 No Content`.
    pub async fn expect_no_content(&self, http_method: &str, request_path: &str) {
        Mock::given(method(http_method))
            .and(path(request_path))
            .respond_with(ResponseTemplate::new(204))
            .mount(&self.server)
            .await;
    }

    /// Respond with JSON and rate limit headers.
    pub async fn expect_with_bucket(
        &self,
        http_method: &str,
        request_path: &str,
        bucket: &BucketHeaders,
        response: serde_json::Value,
    ) {
        Mock::given(method(http_method))
            .and(path(request_path))
            .respond_with(bucket.apply(json_response(200, response)))
            .mount(&self.server)
            .await;
    }

    /// Respond with a Discord error body.
    pub async fn expect_error(
        &self,
        http_method: &str,
        request_path: &str,
        status: u16,
        code: i64,
        message: &str,
    ) {
        self.expect_json(
            http_method,
            request_path,
            status,
            fixtures::json::error(code, message),
        )
        .await;
    }

    /// Respond with a 429 for the next `times` matching requests.
    ///
    /// Mount this before the success mock for the same route: wiremock
    /// prefers the earlier mock until its budget is spent.
    pub async fn expect_rate_limited(
        &self,
        http_method: &str,
        request_path: &str,
        retry_after: Duration,
        global: bool,
        times: u64,
    ) {
        let secs = retry_after.as_secs_f64();
        let mut template = json_response(429, fixtures::json::rate_limited(secs, global))
            .insert_header("retry-after", secs.ceil().to_string().as_str());
        if global {
            template = template
                .insert_header("x-ratelimit-global", "true")
                .insert_header("x-ratelimit-scope", "global");
        } else {
            template = template.insert_header("x-ratelimit-scope", "user");
        }

        Mock::given(method(http_method))
            .and(path(request_path))
            .respond_with(template)
            .up_to_n_times(times)
            .mount(&self.server)
            .await;
    }

    /// Respond with JSON only when a header is present with the given value.
    pub async fn expect_with_header(
        &self,
        http_method: &str,
        request_path: &str,
        header_name: &str,
        header_value: &str,
        response: serde_json::Value,
    ) {
        Mock::given(method(http_method))
            .and(path(request_path))
            .and(header(header_name, header_value))
            .respond_with(json_response(200, response))
            .mount(&self.server)
            .await;
    }

    /// Respond after a delay.
    pub async fn expect_delayed(
        &self,
        http_method: &str,
        request_path: &str,
        delay: Duration,
        response: serde_json::Value,
    ) {
        Mock::given(method(http_method))
            .and(path(request_path))
            .respond_with(json_response(200, response).set_delay(delay))
            .mount(&self.server)
            .await;
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Verification
    // ─────────────────────────────────────────────────────────────────────────────

    /// All received requests, in arrival order.
    pub async fn received_requests(&self) -> Vec<wiremock::Request> {
        self.server.received_requests().await.unwrap_or_default()
    }

    /// Received requests to `request_path`.
    pub async fn requests_to(&self, request_path: &str) -> Vec<wiremock::Request> {
        self.received_requests()
            .await
            .into_iter()
            .filter(|r| r.url.path() == request_path)
            .collect()
    }

    /// Verify the total number of received requests.
    ///
    /// # Panics
    ///
    /// Panics if the count doesn't match.
    pub async fn assert_request_count(&self, expected: usize) {
        let received = self.received_requests().await;
        assert_eq!(
            received.len(),
            expected,
            "Expected {expected} requests but received {}: {:?}",
            received.len(),
            received.iter().map(|r| r.url.path()).collect::<Vec<_>>()
        );
    }

    /// Verify that at least one request was received to the given path.
    ///
    /// # Panics
    ///
    /// Panics if no matching request was found.
    pub async fn assert_received(&self, request_path: &str) {
        let received = self.received_requests().await;
        assert!(
            received.iter().any(|r| r.url.path() == request_path),
            "No request received to path '{request_path}'. Received: {:?}",
            received.iter().map(|r| r.url.path()).collect::<Vec<_>>()
        );
    }

    /// Verify that no requests were received.
    ///
    /// # Panics
    ///
    /// Panics if any requests were received.
    pub async fn assert_no_requests(&self) {
        self.assert_request_count(0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bucket_headers_are_attached() {
        let api = MockApiServer::start().await;
        api.expect_with_bucket(
            "GET",
            "/channels/1",
            &BucketHeaders::new(5, 4, 1.5).with_bucket("abc"),
            fixtures::json::channel(1, None),
        )
        .await;

        let response = reqwest::get(format!("{}/channels/1", api.base_url()))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-limit"], "5");
        assert_eq!(headers["x-ratelimit-remaining"], "4");
        assert_eq!(headers["x-ratelimit-reset-after"], "1.5");
        assert_eq!(headers["x-ratelimit-bucket"], "abc");
    }

    #[tokio::test]
    async fn test_rate_limited_then_success() {
        let api = MockApiServer::start().await;
        api.expect_rate_limited("GET", "/users/@me", Duration::from_millis(250), false, 1)
            .await;
        api.expect_get("/users/@me", fixtures::json::user(1, "cord")).await;

        let url = format!("{}/users/@me", api.base_url());
        let first = reqwest::get(&url).await.unwrap();
        assert_eq!(first.status(), 429);
        assert_eq!(first.headers()["retry-after"], "1");
        let body: serde_json::Value = first.json().await.unwrap();
        assert_eq!(body["retry_after"], 0.25);

        let second = reqwest::get(&url).await.unwrap();
        assert_eq!(second.status(), 200);
        api.assert_request_count(2).await;
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let api = MockApiServer::start().await;
        api.expect_error("DELETE", "/channels/1/messages/2", 403, 50013, "Missing Permissions")
            .await;

        let response = reqwest::Client::new()
            .delete(format!("{}/channels/1/messages/2", api.base_url()))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), 403);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], 50013);
        assert_eq!(body["message"], "Missing Permissions");
        assert_eq!(api.requests_to("/channels/1/messages/2").await.len(), 1);
    }
}
