//! Route parsing and bucket resolution.
//!
//! Discord buckets requests by route template plus a "major parameter" (the
//! channel, guild, webhook or interaction the route is rooted at). The server
//! may later reveal, through `x-ratelimit-bucket`, that several templates
//! share one quota; [`BucketResolver`] remembers those hashes so later
//! requests queue behind each other.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use tracing::debug;

use crate::RateLimitError;

/// HTTP method of a REST request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Upper-case method name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The top-level resource a route is rooted at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MajorParam {
    /// Route has no major parameter (e.g. `/users/@me`).
    None,
    Channel(u64),
    Guild(u64),
    /// Webhook id and, when present, the webhook token.
    Webhook(u64, Option<String>),
    /// Interaction id and token.
    Interaction(u64, String),
}

impl MajorParam {
    /// Rooted at an interaction or webhook token, which expires.
    #[must_use]
    pub const fn is_token_scoped(&self) -> bool {
        matches!(self, Self::Interaction(..) | Self::Webhook(_, Some(_)))
    }
}

impl fmt::Display for MajorParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("-"),
            Self::Channel(id) => write!(f, "channel:{id}"),
            Self::Guild(id) => write!(f, "guild:{id}"),
            Self::Webhook(id, None) => write!(f, "webhook:{id}"),
            // Tokens are credentials; keep them out of keys that reach logs.
            Self::Webhook(id, Some(_)) => write!(f, "webhook:{id}:token"),
            Self::Interaction(id, _) => write!(f, "interaction:{id}"),
        }
    }
}

/// A parsed REST route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Method,
    path: String,
    template: String,
    major: MajorParam,
}

impl Route {
    /// Parse a concrete request path such as `/channels/123/messages?limit=5`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::InvalidRoute`] if the path is not absolute or
    /// a major parameter is not a snowflake.
    pub fn parse(method: Method, path: &str) -> Result<Self, RateLimitError> {
        if !path.starts_with('/') {
            return Err(RateLimitError::InvalidRoute(format!(
                "path must start with '/': {path}"
            )));
        }

        let bare = path.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = bare
            .trim_end_matches('/')
            .split('/')
            .skip(1)
            .filter(|s| !s.is_empty())
            .collect();

        let mut template = String::with_capacity(bare.len());
        let mut major = MajorParam::None;
        let mut idx = 0;

        while idx < segments.len() {
            let segment = segments[idx];
            template.push('/');
            template.push_str(segment);

            let next = segments.get(idx + 1).copied();
            match (segment, next) {
                ("channels", Some(id)) if idx == 0 => {
                    major = MajorParam::Channel(parse_snowflake(id, path)?);
                    template.push_str("/{channel_id}");
                    idx += 2;
                }
                ("guilds", Some(id)) if idx == 0 && id != "templates" => {
                    major = MajorParam::Guild(parse_snowflake(id, path)?);
                    template.push_str("/{guild_id}");
                    idx += 2;
                }
                ("webhooks", Some(id)) if idx == 0 => {
                    let token = segments.get(idx + 2).map(|t| (*t).to_string());
                    major = MajorParam::Webhook(parse_snowflake(id, path)?, token.clone());
                    template.push_str("/{webhook_id}");
                    if token.is_some() {
                        template.push_str("/{webhook_token}");
                        idx += 1;
                    }
                    idx += 2;
                }
                ("interactions", Some(id)) if idx == 0 => {
                    let token = segments.get(idx + 2).ok_or_else(|| {
                        RateLimitError::InvalidRoute(format!(
                            "interaction route without token: {path}"
                        ))
                    })?;
                    major =
                        MajorParam::Interaction(parse_snowflake(id, path)?, (*token).to_string());
                    template.push_str("/{interaction_id}/{interaction_token}");
                    idx += 3;
                }
                ("reactions", Some(_)) => {
                    // Every reaction sub-route on a message shares one bucket.
                    template.push_str("/*");
                    idx = segments.len();
                }
                (_, Some(id)) if is_snowflake(id) => {
                    template.push_str("/{id}");
                    idx += 2;
                }
                _ => idx += 1,
            }
        }

        if template.is_empty() {
            template.push('/');
        }

        Ok(Self {
            method,
            path: path.to_string(),
            template,
            major,
        })
    }

    #[must_use]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// The concrete path, including any query string.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The path with ids replaced by placeholders.
    #[must_use]
    pub fn template(&self) -> &str {
        &self.template
    }

    #[must_use]
    pub const fn major(&self) -> &MajorParam {
        &self.major
    }

    /// Route key shared by every request with this method and template.
    #[must_use]
    pub fn route_key(&self) -> String {
        format!("{} {}", self.method, self.template)
    }

    /// Interaction callbacks and token-authenticated webhook routes are not
    /// bound by the bot's global limit.
    #[must_use]
    pub const fn is_global_exempt(&self) -> bool {
        self.major.is_token_scoped()
    }

    /// Guild the route is rooted at, if any.
    #[must_use]
    pub const fn guild_id(&self) -> Option<u64> {
        match self.major {
            MajorParam::Guild(id) => Some(id),
            _ => None,
        }
    }
}

fn is_snowflake(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

fn parse_snowflake(segment: &str, path: &str) -> Result<u64, RateLimitError> {
    if segment == "@me" {
        return Ok(0);
    }
    segment
        .parse()
        .map_err(|_| RateLimitError::InvalidRoute(format!("invalid id '{segment}' in {path}")))
}

/// Identity of a bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketId {
    /// Derived from the route before the server named the bucket.
    Provisional(String),
    /// Hash reported by `x-ratelimit-bucket`.
    Learned(String),
}

/// Key of a bucket queue: bucket identity plus major parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub id: BucketId,
    pub major: MajorParam,
}

impl BucketKey {
    /// The key a route uses before any bucket hash is known.
    #[must_use]
    pub fn provisional(route: &Route) -> Self {
        Self {
            id: BucketId::Provisional(route.route_key()),
            major: route.major().clone(),
        }
    }

    #[must_use]
    pub const fn is_learned(&self) -> bool {
        matches!(self.id, BucketId::Learned(_))
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            BucketId::Provisional(route) => write!(f, "[{route}]@{}", self.major),
            BucketId::Learned(hash) => write!(f, "{hash}@{}", self.major),
        }
    }
}

/// A broader limit that applies on top of the route bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ceiling {
    /// The bot-wide global limit.
    Global,
    /// Per-guild cap shared by all routes rooted at the guild.
    Guild(u64),
}

/// Output of [`BucketResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBucket {
    pub key: BucketKey,
    pub ceilings: Vec<Ceiling>,
}

/// Maps routes to bucket keys and remembers server-assigned bucket hashes.
///
/// One resolver is created per client and shared with its coordinator; the
/// learned table lives exactly as long as the resolver.
#[derive(Debug, Default)]
pub struct BucketResolver {
    learned: RwLock<HashMap<String, String>>,
}

impl BucketResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the bucket and ceilings for a route.
    #[must_use]
    pub fn resolve(&self, route: &Route) -> ResolvedBucket {
        let key = self.learned.read().get(&route.route_key()).map_or_else(
            || BucketKey::provisional(route),
            |hash| BucketKey {
                id: BucketId::Learned(hash.clone()),
                major: route.major().clone(),
            },
        );

        let mut ceilings = Vec::with_capacity(2);
        if !route.is_global_exempt() {
            ceilings.push(Ceiling::Global);
        }
        if let Some(guild_id) = route.guild_id() {
            ceilings.push(Ceiling::Guild(guild_id));
        }

        ResolvedBucket { key, ceilings }
    }

    /// Record the bucket hash the server reported for a route.
    ///
    /// Returns the new key when the mapping changed. Concurrent learners race
    /// with last-writer-wins; the server reports the same hash either way.
    pub fn learn(&self, route: &Route, bucket: &str) -> Option<BucketKey> {
        let route_key = route.route_key();
        {
            let learned = self.learned.read();
            if learned.get(&route_key).is_some_and(|known| known == bucket) {
                return None;
            }
        }

        debug!(route = %route_key, bucket, "Learned rate limit bucket");
        self.learned.write().insert(route_key, bucket.to_string());

        Some(BucketKey {
            id: BucketId::Learned(bucket.to_string()),
            major: route.major().clone(),
        })
    }

    /// The hash learned for a route, if any.
    #[must_use]
    pub fn learned_bucket(&self, route: &Route) -> Option<String> {
        self.learned.read().get(&route.route_key()).cloned()
    }

    /// Number of routes with a learned bucket.
    #[must_use]
    pub fn learned_len(&self) -> usize {
        self.learned.read().len()
    }
}
