//! Discord REST API client.

use std::sync::Arc;

use cord_ratelimit::{BucketResolver, BucketSnapshot, Coordinator, Method, Request, Response};
use parking_lot::RwLock;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, instrument};

use crate::cache::{GuildCache, InMemoryCache};
use crate::config::DiscordConfig;
use crate::error::{DiscordError, DiscordResult};
use crate::http::{AUDIT_LOG_REASON, HttpTransport, encode_audit_reason};
use crate::interaction::InteractionTokenGuard;
use crate::permissions::{Permissions, check_role_privilege};
use crate::types::{
    Channel, CreateMessage, EditMessage, Guild, InteractionCallbackData, InteractionResponse,
    Member, Message, Role, User,
};

/// Outcome of [`DiscordApiClient::respond_to_interaction`].
#[derive(Debug, Clone)]
pub enum InteractionReply {
    /// Sent as the interaction's primary callback.
    Primary,
    /// The primary slot was taken; sent as a followup message.
    Followup(Message),
}

/// Discord REST API client.
///
/// Every call goes through one rate-limit coordinator, so concurrent callers
/// share bucket state and the global limit.
#[derive(Clone)]
pub struct DiscordApiClient {
    coordinator: Coordinator<HttpTransport>,
    interactions: Arc<InteractionTokenGuard>,
    cache: Arc<dyn GuildCache>,
    application_id: Option<u64>,
    bot_user_id: Arc<RwLock<Option<u64>>>,
}

impl std::fmt::Debug for DiscordApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordApiClient")
            .field("coordinator", &self.coordinator)
            .field("application_id", &self.application_id)
            .field("bot_user_id", &*self.bot_user_id.read())
            .finish_non_exhaustive()
    }
}

impl DiscordApiClient {
    /// Create a new API client from configuration.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or the HTTP client cannot be
    /// built.
    pub fn new(config: &DiscordConfig) -> DiscordResult<Self> {
        Self::with_resolver(config, Arc::new(BucketResolver::new()))
    }

    /// Create a client that shares learned bucket mappings through
    /// `resolver`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::new`].
    pub fn with_resolver(
        config: &DiscordConfig,
        resolver: Arc<BucketResolver>,
    ) -> DiscordResult<Self> {
        config.validate()?;
        let transport = HttpTransport::new(config)?;

        Ok(Self {
            coordinator: Coordinator::with_resolver(
                transport,
                config.coordinator_config(),
                resolver,
            ),
            interactions: Arc::new(InteractionTokenGuard::new(config.interaction_token_ttl())),
            cache: Arc::new(InMemoryCache::new()),
            application_id: config.application_id()?,
            bot_user_id: Arc::new(RwLock::new(None)),
        })
    }

    /// Use `cache` for privilege checks instead of the built-in one.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn GuildCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Set the bot user id without calling [`Self::connect`].
    #[must_use]
    pub fn with_bot_user_id(self, user_id: u64) -> Self {
        *self.bot_user_id.write() = Some(user_id);
        self
    }

    /// Verify the token and record the bot's user id.
    ///
    /// # Errors
    ///
    /// Returns the request error if Discord rejects the token.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> DiscordResult<User> {
        let user = self.get_current_user().await?;
        *self.bot_user_id.write() = Some(user.id);
        info!(user_id = user.id, username = %user.username, "Authenticated with Discord");
        Ok(user)
    }

    #[must_use]
    pub fn bot_user_id(&self) -> Option<u64> {
        *self.bot_user_id.read()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn GuildCache> {
        &self.cache
    }

    #[must_use]
    pub fn interactions(&self) -> &InteractionTokenGuard {
        &self.interactions
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Coordinator<HttpTransport> {
        &self.coordinator
    }

    /// Current state of every rate-limit bucket seen so far.
    #[must_use]
    pub fn buckets(&self) -> Vec<BucketSnapshot> {
        self.coordinator.buckets()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Request plumbing
    // ─────────────────────────────────────────────────────────────────────────

    async fn execute(&self, request: Request) -> DiscordResult<Response> {
        Ok(self.coordinator.execute(request).await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> DiscordResult<T> {
        let response = self.execute(Request::new(Method::Get, path)?).await?;
        Ok(response.json()?)
    }

    async fn send_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> DiscordResult<T> {
        let request = Request::new(method, path)?.with_json(body)?;
        let response = self.execute(request).await?;
        Ok(response.json()?)
    }

    /// Send a request whose success response has no body worth reading.
    async fn send_empty(
        &self,
        method: Method,
        path: &str,
        reason: Option<&str>,
    ) -> DiscordResult<()> {
        let mut request = Request::new(method, path)?;
        if let Some(reason) = reason {
            request = request.with_header(AUDIT_LOG_REASON, encode_audit_reason(reason));
        }
        self.execute(request).await?;
        Ok(())
    }

    fn application_id(&self) -> DiscordResult<u64> {
        self.application_id.ok_or_else(|| {
            DiscordError::NotConfigured(
                "application_id is required for interaction webhooks".into(),
            )
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // User endpoints
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the current bot user.
    pub async fn get_current_user(&self) -> DiscordResult<User> {
        self.get("/users/@me").await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Channel endpoints
    // ─────────────────────────────────────────────────────────────────────────

    #[instrument(skip(self))]
    pub async fn get_channel(&self, channel_id: u64) -> DiscordResult<Channel> {
        self.get(&format!("/channels/{channel_id}")).await
    }

    /// Create a message in a channel.
    #[instrument(skip(self, message))]
    pub async fn create_message(
        &self,
        channel_id: u64,
        message: &CreateMessage,
    ) -> DiscordResult<Message> {
        self.send_json(Method::Post, &format!("/channels/{channel_id}/messages"), message)
            .await
    }

    #[instrument(skip(self, edit))]
    pub async fn edit_message(
        &self,
        channel_id: u64,
        message_id: u64,
        edit: &EditMessage,
    ) -> DiscordResult<Message> {
        self.send_json(
            Method::Patch,
            &format!("/channels/{channel_id}/messages/{message_id}"),
            edit,
        )
        .await
    }

    #[instrument(skip(self))]
    pub async fn delete_message(&self, channel_id: u64, message_id: u64) -> DiscordResult<()> {
        self.send_empty(
            Method::Delete,
            &format!("/channels/{channel_id}/messages/{message_id}"),
            None,
        )
        .await
    }

    /// Trigger typing indicator.
    #[instrument(skip(self))]
    pub async fn trigger_typing(&self, channel_id: u64) -> DiscordResult<()> {
        self.send_empty(Method::Post, &format!("/channels/{channel_id}/typing"), None)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Guild endpoints
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a guild by ID. The guild cache is refreshed from the response.
    #[instrument(skip(self))]
    pub async fn get_guild(&self, guild_id: u64) -> DiscordResult<Guild> {
        let guild: Guild = self.get(&format!("/guilds/{guild_id}")).await?;
        self.cache.update_guild(&guild);
        Ok(guild)
    }

    #[instrument(skip(self))]
    pub async fn get_guild_channels(&self, guild_id: u64) -> DiscordResult<Vec<Channel>> {
        self.get(&format!("/guilds/{guild_id}/channels")).await
    }

    #[instrument(skip(self))]
    pub async fn get_guild_roles(&self, guild_id: u64) -> DiscordResult<Vec<Role>> {
        let roles: Vec<Role> = self.get(&format!("/guilds/{guild_id}/roles")).await?;
        self.cache.update_roles(guild_id, &roles);
        Ok(roles)
    }

    #[instrument(skip(self))]
    pub async fn get_guild_member(&self, guild_id: u64, user_id: u64) -> DiscordResult<Member> {
        let member: Member = self
            .get(&format!("/guilds/{guild_id}/members/{user_id}"))
            .await?;
        self.cache.update_member(guild_id, &member);
        Ok(member)
    }

    /// Give `role_id` to a member.
    ///
    /// Checked locally first: the bot's highest role must be above the role
    /// and it must hold `MANAGE_ROLES`. A refused check makes no request.
    ///
    /// # Errors
    ///
    /// [`DiscordError::PrivilegeDenied`] on a failed check,
    /// [`DiscordError::NotConfigured`] if the bot user id is unknown.
    #[instrument(skip(self, reason))]
    pub async fn add_member_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: Option<&str>,
    ) -> DiscordResult<()> {
        self.require_role_privilege(guild_id, role_id)?;
        self.send_empty(
            Method::Put,
            &format!("/guilds/{guild_id}/members/{user_id}/roles/{role_id}"),
            reason,
        )
        .await
    }

    /// Take `role_id` from a member. Checked like [`Self::add_member_role`].
    ///
    /// # Errors
    ///
    /// Same as [`Self::add_member_role`].
    #[instrument(skip(self, reason))]
    pub async fn remove_member_role(
        &self,
        guild_id: u64,
        user_id: u64,
        role_id: u64,
        reason: Option<&str>,
    ) -> DiscordResult<()> {
        self.require_role_privilege(guild_id, role_id)?;
        self.send_empty(
            Method::Delete,
            &format!("/guilds/{guild_id}/members/{user_id}/roles/{role_id}"),
            reason,
        )
        .await
    }

    fn require_role_privilege(&self, guild_id: u64, role_id: u64) -> DiscordResult<()> {
        let actor_id = self.bot_user_id().ok_or_else(|| {
            DiscordError::NotConfigured("bot user id unknown; call connect() first".into())
        })?;
        check_role_privilege(
            self.cache.as_ref(),
            guild_id,
            actor_id,
            role_id,
            Permissions::MANAGE_ROLES,
        )?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Interactions
    // ─────────────────────────────────────────────────────────────────────────

    /// Send the primary response to an interaction.
    ///
    /// Mentions are suppressed unless the data sets `allowed_mentions`.
    ///
    /// # Errors
    ///
    /// [`DiscordError::ProtocolViolation`] if this token was already answered,
    /// before any network call.
    #[instrument(skip(self, token, response))]
    pub async fn create_interaction_response(
        &self,
        interaction_id: u64,
        token: &str,
        response: InteractionResponse,
    ) -> DiscordResult<()> {
        if !self.interactions.claim_primary(token) {
            return Err(DiscordError::ProtocolViolation(format!(
                "interaction {interaction_id} already has a primary response"
            )));
        }
        self.send_interaction_callback(interaction_id, token, response)
            .await
    }

    /// Answer an interaction, falling back to a followup message once the
    /// primary response slot is used.
    ///
    /// # Errors
    ///
    /// Request errors from whichever endpoint was used.
    /// [`DiscordError::ProtocolViolation`] for a deferral once the slot is
    /// used, before any network call.
    #[instrument(skip(self, token, response))]
    pub async fn respond_to_interaction(
        &self,
        interaction_id: u64,
        token: &str,
        response: InteractionResponse,
    ) -> DiscordResult<InteractionReply> {
        if self.interactions.claim_primary(token) {
            self.send_interaction_callback(interaction_id, token, response)
                .await?;
            return Ok(InteractionReply::Primary);
        }

        let Some(data) = response.data else {
            return Err(DiscordError::ProtocolViolation(format!(
                "interaction {interaction_id} already has a primary response; \
                 a deferral has no followup form"
            )));
        };
        debug!(interaction_id, "Primary response already sent, using followup");
        self.create_followup_message(token, data)
            .await
            .map(InteractionReply::Followup)
    }

    async fn send_interaction_callback(
        &self,
        interaction_id: u64,
        token: &str,
        mut response: InteractionResponse,
    ) -> DiscordResult<()> {
        if let Some(data) = response.data.as_mut() {
            data.normalize();
        }
        let request = Request::new(
            Method::Post,
            &format!("/interactions/{interaction_id}/{token}/callback"),
        )?
        .with_json(&response)?;
        self.execute(request).await?;
        Ok(())
    }

    /// Send a followup message through the interaction webhook.
    ///
    /// # Errors
    ///
    /// [`DiscordError::NotConfigured`] without an application id.
    #[instrument(skip(self, token, data))]
    pub async fn create_followup_message(
        &self,
        token: &str,
        mut data: InteractionCallbackData,
    ) -> DiscordResult<Message> {
        let application_id = self.application_id()?;
        data.normalize();
        self.send_json(Method::Post, &format!("/webhooks/{application_id}/{token}"), &data)
            .await
    }

    /// Edit the primary response, typically after a deferred callback.
    ///
    /// # Errors
    ///
    /// [`DiscordError::NotConfigured`] without an application id.
    #[instrument(skip(self, token, edit))]
    pub async fn edit_original_interaction_response(
        &self,
        token: &str,
        edit: &EditMessage,
    ) -> DiscordResult<Message> {
        let application_id = self.application_id()?;
        self.send_json(
            Method::Patch,
            &format!("/webhooks/{application_id}/{token}/messages/@original"),
            edit,
        )
        .await
    }
}
