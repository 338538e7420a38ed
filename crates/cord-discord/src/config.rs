//! Discord client configuration.

use std::time::Duration;

use cord_ratelimit::{CoordinatorConfig, ExponentialBackoff, RateLimitConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{DiscordError, DiscordResult};

/// Configuration for the Discord client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Bot token from the Discord Developer Portal
    pub bot_token: String,

    /// Application ID, required for interaction followups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,

    /// Base URL for the Discord API (default: https://discord.com/api/v10)
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Per-attempt request timeout
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Bot-wide request ceiling per second
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,

    /// Optional per-guild request ceiling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_limit: Option<GuildLimitConfig>,

    /// How long an interaction token is remembered as answered
    #[serde(default = "default_interaction_token_ttl_secs")]
    pub interaction_token_ttl_secs: u64,
}

fn default_api_url() -> String {
    "https://discord.com/api/v10".into()
}

const fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

const fn default_global_requests_per_second() -> u32 {
    50
}

const fn default_interaction_token_ttl_secs() -> u64 {
    15 * 60
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts when failures are transient (5xx, network, timeout)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter factor (0.0-1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Upper bound on total time one request may spend rate limited
    #[serde(default = "default_max_rate_limit_wait_ms")]
    pub max_rate_limit_wait_ms: u64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_delay_ms() -> u64 {
    500
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_jitter() -> f64 {
    0.1
}

const fn default_max_rate_limit_wait_ms() -> u64 {
    5 * 60 * 1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_rate_limit_wait_ms: default_max_rate_limit_wait_ms(),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter);

        RetryPolicy::new(self.max_attempts, backoff)
            .with_max_rate_limit_wait(Duration::from_millis(self.max_rate_limit_wait_ms))
    }
}

/// Per-guild request ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GuildLimitConfig {
    pub requests: u32,
    pub window_ms: u64,
}

impl DiscordConfig {
    /// A configuration with defaults for everything but the token.
    #[must_use]
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            ..Self::default()
        }
    }

    /// Check the configuration before building a client.
    ///
    /// # Errors
    ///
    /// Returns [`DiscordError::NotConfigured`] without a token, and
    /// [`DiscordError::InvalidConfig`] for malformed values.
    pub fn validate(&self) -> DiscordResult<()> {
        if self.bot_token.trim().is_empty() {
            return Err(DiscordError::NotConfigured("bot_token is empty".into()));
        }
        Url::parse(&self.api_url)
            .map_err(|e| DiscordError::InvalidConfig(format!("api_url: {e}")))?;
        self.application_id()?;

        if self.retry.max_attempts == 0 {
            return Err(DiscordError::InvalidConfig(
                "retry.max_attempts must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(DiscordError::InvalidConfig(
                "retry.jitter must be within 0.0..=1.0".into(),
            ));
        }

        if self.interaction_token_ttl_secs == 0 {
            return Err(DiscordError::InvalidConfig(
                "interaction_token_ttl_secs must be > 0".into(),
            ));
        }

        let coordinator = self.coordinator_config();
        coordinator
            .global
            .validate()
            .map_err(|e| DiscordError::InvalidConfig(format!("global limit: {e}")))?;
        if let Some(guild) = coordinator.guild {
            guild
                .validate()
                .map_err(|e| DiscordError::InvalidConfig(format!("guild_limit: {e}")))?;
        }
        Ok(())
    }

    /// Parsed application id.
    ///
    /// # Errors
    ///
    /// Returns [`DiscordError::InvalidConfig`] if it is not a snowflake.
    pub fn application_id(&self) -> DiscordResult<Option<u64>> {
        self.application_id
            .as_deref()
            .map(|id| {
                id.trim().parse().map_err(|_| {
                    DiscordError::InvalidConfig(format!("application_id is not a snowflake: {id}"))
                })
            })
            .transpose()
    }

    /// Coordinator settings derived from this configuration.
    #[must_use]
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            retry: self.retry.policy(),
            attempt_timeout: self.timeout,
            global: RateLimitConfig::new(self.global_requests_per_second, Duration::from_secs(1)),
            guild: self.guild_limit.map(|limit| {
                RateLimitConfig::new(limit.requests, Duration::from_millis(limit.window_ms))
            }),
            token_queue_ttl: self.interaction_token_ttl(),
        }
    }

    #[must_use]
    pub const fn interaction_token_ttl(&self) -> Duration {
        Duration::from_secs(self.interaction_token_ttl_secs)
    }
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            application_id: None,
            api_url: default_api_url(),
            timeout: default_timeout(),
            retry: RetryConfig::default(),
            global_requests_per_second: default_global_requests_per_second(),
            guild_limit: None,
            interaction_token_ttl_secs: default_interaction_token_ttl_secs(),
        }
    }
}
