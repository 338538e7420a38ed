//! Discord REST client built on `cord-ratelimit`.
//!
//! Provides:
//! - Rate-limit coordinated REST calls for users, channels, guilds and members
//! - Interaction responses with single primary response tracking
//! - Local role privilege checks against a pluggable guild cache
//!
//! ```no_run
//! use cord_discord::{CreateMessage, DiscordApiClient, DiscordConfig};
//!
//! # async fn run() -> cord_discord::DiscordResult<()> {
//! let client = DiscordApiClient::new(&DiscordConfig::new("token"))?;
//! client.connect().await?;
//! client.create_message(1234, &CreateMessage::text("hello")).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod api;
mod cache;
mod config;
mod error;
mod http;
mod interaction;
mod permissions;
mod types;

pub use api::*;
pub use cache::*;
pub use config::*;
pub use error::*;
pub use http::*;
pub use interaction::*;
pub use permissions::*;
pub use types::*;
