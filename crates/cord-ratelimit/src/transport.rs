//! The seam between the coordinator and the network.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

use crate::{Method, RateLimitError, Route};

/// An outbound REST request.
#[derive(Debug, Clone)]
pub struct Request {
    pub route: Route,
    pub body: Option<Bytes>,
    /// Extra headers, e.g. `x-audit-log-reason`.
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Create a body-less request.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::InvalidRoute`] if the path cannot be parsed.
    pub fn new(method: Method, path: &str) -> Result<Self, RateLimitError> {
        Ok(Self {
            route: Route::parse(method, path)?,
            body: None,
            headers: Vec::new(),
        })
    }

    /// Attach a JSON body.
    ///
    /// # Errors
    ///
    /// Returns the serialization error if `body` cannot be encoded.
    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, serde_json::Error> {
        self.body = Some(Bytes::from(serde_json::to_vec(body)?));
        Ok(self)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A response as seen by the coordinator.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Response {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the decode error for malformed or mismatched bodies.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Failure to obtain a response at all.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established or was reset.
    #[error("Connection error: {0}")]
    Connect(String),

    /// The transport's own deadline elapsed.
    #[error("Request timed out")]
    Timeout,

    /// The request could not be built or sent for a non-network reason.
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether the failure is a network condition worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout)
    }
}

/// Sends one attempt of a request.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: &Request) -> Result<Response, TransportError>;
}
