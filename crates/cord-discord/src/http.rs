//! reqwest-backed [`Transport`] for the Discord REST API.

use std::collections::HashMap;

use async_trait::async_trait;
use cord_ratelimit::{Method, Request, Response, Transport, TransportError};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::debug;

use crate::config::DiscordConfig;
use crate::error::DiscordResult;

/// Header carrying the audit log reason for moderation actions.
pub const AUDIT_LOG_REASON: &str = "x-audit-log-reason";

/// Sends single attempts over HTTPS with bot authentication.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    authorization: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("authorization", &"Bot [REDACTED]")
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Build a transport from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DiscordError::Http`] if the HTTP client cannot be
    /// built.
    pub fn new(config: &DiscordConfig) -> DiscordResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(format!(
                "DiscordBot ({}, {})",
                env!("CARGO_PKG_REPOSITORY"),
                env!("CARGO_PKG_VERSION")
            ))
            .build()?;

        // Normalize token (remove "Bot " prefix if present)
        let token = config
            .bot_token
            .trim()
            .strip_prefix("Bot ")
            .unwrap_or(config.bot_token.trim());

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            authorization: format!("Bot {token}"),
        })
    }
}

const fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() {
        TransportError::Other(err.to_string())
    } else {
        TransportError::Connect(err.to_string())
    }
}

/// Percent-encode an audit log reason.
#[must_use]
pub fn encode_audit_reason(reason: &str) -> String {
    // form encoding turns spaces into '+' and escapes literal '+' as %2B
    url::form_urlencoded::byte_serialize(reason.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let url = format!("{}{}", self.base_url, request.route.path());
        debug!(
            method = %request.route.method(),
            route = %request.route.template(),
            "Sending Discord API request"
        );

        let mut builder = self
            .client
            .request(to_reqwest(request.route.method()), &url)
            .header(AUTHORIZATION, &self.authorization);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = builder.send().await.map_err(|e| classify(&e))?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| classify(&e))?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_audit_reason() {
        assert_eq!(encode_audit_reason("Spam cleanup"), "Spam%20cleanup");
        assert_eq!(encode_audit_reason("a+b/c"), "a%2Bb%2Fc");
        assert_eq!(encode_audit_reason("héllo"), "h%C3%A9llo");
    }

    #[test]
    fn test_token_prefix_is_normalized() {
        let transport = HttpTransport::new(&DiscordConfig::new("Bot abc")).unwrap();
        assert_eq!(transport.authorization, "Bot abc");
        assert!(!format!("{transport:?}").contains("abc"));

        let transport = HttpTransport::new(&DiscordConfig::new("abc")).unwrap();
        assert_eq!(transport.authorization, "Bot abc");
    }
}
