//! Terminal errors of [`crate::Coordinator::execute`].

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::RateLimitError;

/// Discord's JSON error payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ApiErrorBody {
    /// Discord error code (not the HTTP status).
    #[serde(default)]
    pub code: Option<i64>,

    #[serde(default)]
    pub message: String,

    /// Field-level validation errors.
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
}

impl ApiErrorBody {
    /// Parse an error body, falling back to the raw text as the message.
    #[must_use]
    pub fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_else(|_| Self {
            code: None,
            message: String::from_utf8_lossy(body).into_owned(),
            errors: None,
        })
    }
}

/// A request that could not be completed.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Rate limited beyond the configured total wait.
    #[error("Rate limited on {bucket} after {attempts} attempts, retry after {retry_after:?}")]
    RateLimited {
        bucket: String,
        attempts: u32,
        retry_after: Duration,
        global: bool,
    },

    /// 5xx, transport failure or timeout, after exhausting retries.
    #[error("Transient failure on bucket {bucket} after {attempts} attempts: {message}")]
    TransientServer {
        bucket: String,
        status: Option<u16>,
        attempts: u32,
        message: String,
    },

    /// 4xx other than 429. Never retried.
    #[error("Request rejected on bucket {bucket} with status {status}: {}", .body.message)]
    ClientRejected {
        bucket: String,
        status: u16,
        attempts: u32,
        body: ApiErrorBody,
    },

    /// The request path could not be mapped to a route.
    #[error(transparent)]
    InvalidRoute(#[from] RateLimitError),

    /// The request never produced a usable attempt.
    #[error("Dispatch failed on bucket {bucket}: {message}")]
    Dispatch { bucket: String, message: String },
}

impl RequestError {
    /// HTTP status of the last attempt, if one was received.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::RateLimited { .. } => Some(429),
            Self::TransientServer { status, .. } => *status,
            Self::ClientRejected { status, .. } => Some(*status),
            Self::InvalidRoute(_) | Self::Dispatch { .. } => None,
        }
    }

    /// Attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::RateLimited { attempts, .. }
            | Self::TransientServer { attempts, .. }
            | Self::ClientRejected { attempts, .. } => *attempts,
            Self::InvalidRoute(_) | Self::Dispatch { .. } => 0,
        }
    }

    /// Bucket the request was queued on.
    #[must_use]
    pub fn bucket(&self) -> Option<&str> {
        match self {
            Self::RateLimited { bucket, .. }
            | Self::TransientServer { bucket, .. }
            | Self::ClientRejected { bucket, .. }
            | Self::Dispatch { bucket, .. } => Some(bucket),
            Self::InvalidRoute(_) => None,
        }
    }

    /// Whether retrying at a higher level may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::TransientServer { .. })
    }

    /// Suggested delay before a higher-level retry.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_discord_error_body() {
        let body = ApiErrorBody::parse(
            br#"{"code":50013,"message":"Missing Permissions","errors":{"name":{"_errors":[]}}}"#,
        );
        assert_eq!(body.code, Some(50013));
        assert_eq!(body.message, "Missing Permissions");
        assert!(body.errors.is_some());
    }

    #[test]
    fn test_parse_non_json_error_body() {
        let body = ApiErrorBody::parse(b"upstream connect error");
        assert_eq!(body.code, None);
        assert_eq!(body.message, "upstream connect error");
    }

    #[test]
    fn test_error_accessors() {
        let err = RequestError::ClientRejected {
            bucket: "b".into(),
            status: 403,
            attempts: 1,
            body: ApiErrorBody::default(),
        };
        assert_eq!(err.status(), Some(403));
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.bucket(), Some("b"));
        assert!(!err.is_retryable());

        let err = RequestError::RateLimited {
            bucket: "b".into(),
            attempts: 7,
            retry_after: Duration::from_secs(4),
            global: true,
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(4)));
        assert!(err.to_string().contains("after 7 attempts"));
    }
}
