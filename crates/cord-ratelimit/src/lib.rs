//! cord-ratelimit - Bucket-aware request coordination for the Discord REST API
//!
//! This crate owns everything between "a caller wants to hit a route" and
//! "bytes go out on the wire":
//!
//! - **Bucket resolution**: route templates, major parameters, learned bucket hashes
//! - **Bucket queues**: strict FIFO per bucket, quota learned from response headers
//! - **Ceilings**: the bot-wide global limit and optional per-guild caps
//! - **Retry policy**: 429 delays, exponential backoff for transient failures
//! - **Coordinator**: [`Coordinator::execute`] ties it together over a [`Transport`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cord_ratelimit::{Coordinator, CoordinatorConfig, Method, Request};
//!
//! let coordinator = Coordinator::new(my_transport, CoordinatorConfig::default());
//! let request = Request::new(Method::Get, "/channels/123/messages")?;
//! let response = coordinator.execute(request).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod bucket;
mod ceiling;
mod coordinator;
mod error;
mod headers;
mod retry;
mod route;
mod token_bucket;
mod transport;

pub use bucket::*;
pub use ceiling::*;
pub use coordinator::*;
pub use error::*;
pub use headers::*;
pub use retry::*;
pub use route::*;
pub use token_bucket::*;
pub use transport::*;

use std::time::Duration;

use async_trait::async_trait;

/// Common trait for window limiters used as ceilings.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take a permit if one is free. Never blocks.
    async fn try_acquire(&self) -> bool;

    /// Time until the next permit frees up; zero if one is free now.
    async fn wait_time(&self) -> Duration;
}

/// Rate limit error.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// Invalid configuration.
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    /// Path could not be mapped to a route.
    #[error("Invalid route: {0}")]
    InvalidRoute(String),
}

/// Configuration for a window limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RateLimitConfig {
    /// Maximum requests per window.
    pub requests_per_window: u32,

    /// Window duration.
    pub window: Duration,
}

impl RateLimitConfig {
    /// Create a new rate limit configuration.
    #[must_use]
    pub const fn new(requests_per_window: u32, window: Duration) -> Self {
        Self {
            requests_per_window,
            window,
        }
    }

    /// Discord's default global limit: 50 requests per second.
    #[must_use]
    pub const fn discord_global() -> Self {
        Self::new(50, Duration::from_secs(1))
    }

    /// Reject zero-sized limits.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::InvalidConfig`] when either field is zero.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.requests_per_window == 0 {
            return Err(RateLimitError::InvalidConfig(
                "requests_per_window must be > 0".into(),
            ));
        }
        if self.window.is_zero() {
            return Err(RateLimitError::InvalidConfig("window must be > 0".into()));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::discord_global()
    }
}
