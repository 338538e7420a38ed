//! Discord client error types.

use std::time::Duration;

use cord_ratelimit::{RateLimitError, RequestError};
use thiserror::Error;

use crate::permissions::PrivilegeError;

/// Discord client errors.
#[derive(Error, Debug)]
pub enum DiscordError {
    /// HTTP client could not be built
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The request failed after coordination and retries
    #[error(transparent)]
    Request(#[from] RequestError),

    /// Refused locally by the role privilege check
    #[error("Privilege check failed: {0}")]
    PrivilegeDenied(#[from] PrivilegeError),

    /// The call would break Discord's protocol, e.g. a second primary
    /// interaction response
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A required setting or bootstrap step is missing
    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<RateLimitError> for DiscordError {
    fn from(err: RateLimitError) -> Self {
        Self::Request(RequestError::InvalidRoute(err))
    }
}

impl DiscordError {
    /// Check if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Request(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Get the suggested retry delay.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Request(err) => err.retry_after(),
            _ => None,
        }
    }

    /// HTTP status of the failed request, if the server answered.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Request(err) => err.status(),
            _ => None,
        }
    }

    /// Discord's JSON error code, for rejected requests.
    #[must_use]
    pub const fn api_code(&self) -> Option<i64> {
        match self {
            Self::Request(RequestError::ClientRejected { body, .. }) => body.code,
            _ => None,
        }
    }
}

/// Result type for Discord operations.
pub type DiscordResult<T> = Result<T, DiscordError>;
