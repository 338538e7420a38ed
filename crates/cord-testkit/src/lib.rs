//! cord-testkit - Test infrastructure for the cord crates
//!
//! - [`MockApiServer`] - wiremock-backed Discord REST API with rate-limit helpers
//! - [`fixtures`] - JSON payloads for users, channels, messages, guilds and errors
//! - Tracing configuration for test output
//!
//! # Example
//!
//! ```rust,ignore
//! use cord_testkit::{MockApiServer, fixtures};
//!
//! #[tokio::test]
//! async fn test_get_channel() {
//!     cord_testkit::init_test_tracing();
//!
//!     let api = MockApiServer::start().await;
//!     api.expect_get("/channels/1", fixtures::json::channel(1, Some(10))).await;
//!
//!     // point the client at api.base_url()
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod fixtures;
mod mock_server;
mod tracing_config;

pub use mock_server::*;
pub use tracing_config::*;
