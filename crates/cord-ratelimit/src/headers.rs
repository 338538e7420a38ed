//! Rate limit header parsing.
//!
//! Discord reports bucket state on every REST response through the
//! `x-ratelimit-*` headers. A 429 additionally carries a JSON body whose
//! `retry_after` is the authoritative delay.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Value of the `x-ratelimit-scope` header sent with a 429.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    /// Per-bot or per-user limit.
    User,
    /// The bot's global limit.
    Global,
    /// Limit shared with other users of the resource.
    Shared,
}

impl RateLimitScope {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "global" => Some(Self::Global),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }
}

/// Parsed rate limit information from a Discord response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    /// Server-assigned bucket hash (`x-ratelimit-bucket`).
    pub bucket: Option<String>,

    /// Requests allowed per window.
    pub limit: Option<u32>,

    /// Requests left in the current window.
    pub remaining: Option<u32>,

    /// Time until the window resets.
    pub reset_after: Option<Duration>,

    /// `retry-after` header (429 only).
    pub retry_after: Option<Duration>,

    /// Whether the limit hit was the global one.
    pub global: bool,

    /// Scope reported with a 429.
    pub scope: Option<RateLimitScope>,
}

impl RateLimitHeaders {
    /// Create empty headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse headers from a lowercase-keyed header map.
    #[must_use]
    pub fn parse(headers: &HashMap<String, String>) -> Self {
        Self {
            bucket: headers
                .get("x-ratelimit-bucket")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            limit: parse_header_u32(headers, "x-ratelimit-limit"),
            remaining: parse_header_u32(headers, "x-ratelimit-remaining"),
            reset_after: parse_header_secs(headers, "x-ratelimit-reset-after"),
            retry_after: parse_header_secs(headers, "retry-after"),
            global: headers
                .get("x-ratelimit-global")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            scope: headers
                .get("x-ratelimit-scope")
                .and_then(|v| RateLimitScope::parse(v)),
        }
    }

    /// Whether a 429 with these headers applies to every bucket.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.global || self.scope == Some(RateLimitScope::Global)
    }
}

/// JSON body of a 429 response.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitedBody {
    /// Human readable message.
    #[serde(default)]
    pub message: String,

    /// Seconds to wait before retrying.
    pub retry_after: f64,

    /// Whether the global limit was hit.
    #[serde(default)]
    pub global: bool,

    /// Discord error code, if any.
    #[serde(default)]
    pub code: Option<i64>,
}

impl RateLimitedBody {
    /// Parse a 429 body, returning `None` for anything that is not the
    /// documented shape.
    #[must_use]
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    /// The delay as a duration.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        secs_to_duration(self.retry_after)
    }
}

/// Delay and scope of a 429, combining body and headers.
///
/// The body value wins over the `retry-after` header, which Discord rounds up
/// to whole seconds.
#[must_use]
pub fn rate_limit_delay(
    headers: &RateLimitHeaders,
    body: Option<&RateLimitedBody>,
) -> Option<(Duration, bool)> {
    let global = headers.is_global() || body.is_some_and(|b| b.global);
    body.and_then(RateLimitedBody::retry_after)
        .or(headers.retry_after)
        .or(headers.reset_after)
        .map(|delay| (delay, global))
}

fn parse_header_u32(headers: &HashMap<String, String>, key: &str) -> Option<u32> {
    headers.get(key).and_then(|v| v.trim().parse().ok())
}

fn parse_header_f64(headers: &HashMap<String, String>, key: &str) -> Option<f64> {
    headers
        .get(key)
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn parse_header_secs(headers: &HashMap<String, String>, key: &str) -> Option<Duration> {
    parse_header_f64(headers, key).and_then(secs_to_duration)
}

fn secs_to_duration(secs: f64) -> Option<Duration> {
    if secs.is_finite() && secs >= 0.0 {
        Duration::try_from_secs_f64(secs).ok()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_parse_bucket_headers() {
        let headers = map(&[
            ("x-ratelimit-bucket", "abcd1234"),
            ("x-ratelimit-limit", "5"),
            ("x-ratelimit-remaining", "4"),
            ("x-ratelimit-reset-after", "1.5"),
        ]);

        let parsed = RateLimitHeaders::parse(&headers);

        assert_eq!(parsed.bucket.as_deref(), Some("abcd1234"));
        assert_eq!(parsed.limit, Some(5));
        assert_eq!(parsed.remaining, Some(4));
        assert_eq!(parsed.reset_after, Some(Duration::from_millis(1500)));
        assert!(!parsed.is_global());
    }

    #[test]
    fn test_parse_global_429() {
        let headers = map(&[
            ("retry-after", "2"),
            ("x-ratelimit-global", "true"),
            ("x-ratelimit-scope", "global"),
        ]);

        let parsed = RateLimitHeaders::parse(&headers);

        assert_eq!(parsed.retry_after, Some(Duration::from_secs(2)));
        assert!(parsed.global);
        assert_eq!(parsed.scope, Some(RateLimitScope::Global));
        assert!(parsed.is_global());
    }

    #[test]
    fn test_garbage_values_are_ignored() {
        let headers = map(&[
            ("x-ratelimit-limit", "lots"),
            ("x-ratelimit-reset-after", "-3"),
            ("retry-after", "NaN"),
            ("x-ratelimit-bucket", "  "),
        ]);

        let parsed = RateLimitHeaders::parse(&headers);

        assert_eq!(parsed, RateLimitHeaders::new());
    }

    #[test]
    fn test_body_retry_after_wins_over_header() {
        let headers = map(&[("retry-after", "3"), ("x-ratelimit-scope", "user")]);
        let parsed = RateLimitHeaders::parse(&headers);
        let body = RateLimitedBody::parse(
            br#"{"message":"You are being rate limited.","retry_after":2.25,"global":false}"#,
        )
        .unwrap();

        let (delay, global) = rate_limit_delay(&parsed, Some(&body)).unwrap();
        assert_eq!(delay, Duration::from_millis(2250));
        assert!(!global);

        // Header alone is used when the body is missing
        let (delay, _) = rate_limit_delay(&parsed, None).unwrap();
        assert_eq!(delay, Duration::from_secs(3));
    }

    #[test]
    fn test_body_global_flag() {
        let body = RateLimitedBody::parse(br#"{"retry_after":0.5,"global":true}"#).unwrap();
        let (delay, global) =
            rate_limit_delay(&RateLimitHeaders::new(), Some(&body)).unwrap();
        assert_eq!(delay, Duration::from_millis(500));
        assert!(global);
    }
}
