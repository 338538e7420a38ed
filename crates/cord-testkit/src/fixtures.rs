//! Discord JSON payloads for tests.
//!
//! Snowflakes are serialized as strings, as the API does.

// ─────────────────────────────────────────────────────────────────────────────
// JSON Fixtures
// ─────────────────────────────────────────────────────────────────────────────

/// API response bodies.
pub mod json {
    use serde_json::{Value, json};

    /// A user object.
    #[must_use]
    pub fn user(id: u64, username: &str) -> Value {
        json!({
            "id": id.to_string(),
            "username": username,
            "discriminator": "0",
            "global_name": null,
            "avatar": null,
            "bot": true
        })
    }

    /// A text channel, optionally in a guild.
    #[must_use]
    pub fn channel(id: u64, guild_id: Option<u64>) -> Value {
        let mut channel = json!({
            "id": id.to_string(),
            "type": 0,
            "name": "general",
            "topic": null
        });
        if let Some(guild_id) = guild_id {
            channel["guild_id"] = json!(guild_id.to_string());
        }
        channel
    }

    /// A message posted by `author`.
    #[must_use]
    pub fn message(id: u64, channel_id: u64, content: &str) -> Value {
        json!({
            "id": id.to_string(),
            "channel_id": channel_id.to_string(),
            "author": user(1, "cord"),
            "content": content,
            "timestamp": "2024-01-01T00:00:00.000000+00:00",
            "tts": false,
            "attachments": [],
            "embeds": []
        })
    }

    /// A role with a position and permission bitset.
    #[must_use]
    pub fn role(id: u64, name: &str, position: i64, permissions: u64) -> Value {
        json!({
            "id": id.to_string(),
            "name": name,
            "color": 0,
            "hoist": false,
            "position": position,
            "permissions": permissions.to_string(),
            "managed": false,
            "mentionable": false
        })
    }

    /// A guild with its roles.
    #[must_use]
    pub fn guild(id: u64, owner_id: u64, roles: &[Value]) -> Value {
        json!({
            "id": id.to_string(),
            "name": "Test Guild",
            "icon": null,
            "owner_id": owner_id.to_string(),
            "roles": roles
        })
    }

    /// A guild member holding `role_ids`.
    #[must_use]
    pub fn member(user_id: u64, role_ids: &[u64]) -> Value {
        json!({
            "user": user(user_id, "member"),
            "nick": null,
            "roles": role_ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "joined_at": "2024-01-01T00:00:00.000000+00:00",
            "deaf": false,
            "mute": false
        })
    }

    /// Discord's error body.
    #[must_use]
    pub fn error(code: i64, message: &str) -> Value {
        json!({
            "code": code,
            "message": message
        })
    }

    /// Form validation error body with a nested `errors` object.
    #[must_use]
    pub fn invalid_form(field: &str, code: &str, message: &str) -> Value {
        json!({
            "code": 50035,
            "message": "Invalid Form Body",
            "errors": {
                field: {
                    "_errors": [{ "code": code, "message": message }]
                }
            }
        })
    }

    /// 429 body.
    #[must_use]
    pub fn rate_limited(retry_after: f64, global: bool) -> Value {
        json!({
            "message": "You are being rate limited.",
            "retry_after": retry_after,
            "global": global
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Fixtures
// ─────────────────────────────────────────────────────────────────────────────

/// Client configuration documents.
pub mod config {
    use serde_json::{Value, json};

    /// Minimal configuration pointing at `api_url`.
    #[must_use]
    pub fn bot(token: &str, api_url: &str) -> Value {
        json!({
            "bot_token": token,
            "application_id": "4242",
            "api_url": api_url,
            "timeout": 5,
            "retry": {
                "max_attempts": 3,
                "initial_delay_ms": 10,
                "max_delay_ms": 100,
                "jitter": 0.0
            }
        })
    }
}
