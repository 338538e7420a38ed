//! Guild permissions and the role privilege check.
//!
//! Discord rejects role changes unless the actor's highest role sits strictly
//! above the target role and the actor holds `MANAGE_ROLES`. Checking locally
//! against the cache avoids spending a request (and rate limit budget) on a
//! call that is bound to fail.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::debug;

use crate::cache::{CachedGuild, CachedMember, GuildCache};

bitflags::bitflags! {
    /// Guild permission bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u64 {
        const CREATE_INSTANT_INVITE = 1 << 0;
        const KICK_MEMBERS = 1 << 1;
        const BAN_MEMBERS = 1 << 2;
        /// Implies every other permission.
        const ADMINISTRATOR = 1 << 3;
        const MANAGE_CHANNELS = 1 << 4;
        const MANAGE_GUILD = 1 << 5;
        const ADD_REACTIONS = 1 << 6;
        const VIEW_AUDIT_LOG = 1 << 7;
        const VIEW_CHANNEL = 1 << 10;
        const SEND_MESSAGES = 1 << 11;
        const MANAGE_MESSAGES = 1 << 13;
        const EMBED_LINKS = 1 << 14;
        const ATTACH_FILES = 1 << 15;
        const READ_MESSAGE_HISTORY = 1 << 16;
        const MENTION_EVERYONE = 1 << 17;
        const CHANGE_NICKNAME = 1 << 26;
        const MANAGE_NICKNAMES = 1 << 27;
        const MANAGE_ROLES = 1 << 28;
        const MANAGE_WEBHOOKS = 1 << 29;
        const MODERATE_MEMBERS = 1 << 40;
    }
}

impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.bits())
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }

        let bits = match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom)?,
            Raw::Num(n) => n,
        };
        // Keep bits this crate does not name; Discord adds new ones regularly.
        Ok(Self::from_bits_retain(bits))
    }
}

/// Why a privileged action was refused locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrivilegeError {
    #[error("Guild {0} is not cached")]
    UnknownGuild(u64),

    #[error("Member {user_id} of guild {guild_id} is not cached")]
    UnknownMember { guild_id: u64, user_id: u64 },

    #[error("Role {role_id} of guild {guild_id} is not cached")]
    UnknownRole { guild_id: u64, role_id: u64 },

    /// The actor's highest role does not outrank the target role.
    #[error("Role {role_id} at {role_position} is not below actor top role {actor_position}")]
    RoleHierarchy {
        role_id: u64,
        role_position: i64,
        actor_position: i64,
    },

    #[error("Missing permissions: {}", PermissionNames(*missing))]
    MissingPermissions { missing: Permissions },
}

struct PermissionNames(Permissions);

impl fmt::Display for PermissionNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(&self.0, f)
    }
}

/// Effective guild-level permissions of one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionSnapshot {
    pub permissions: Permissions,
    /// Position of the member's highest role (`@everyone` counts as 0).
    pub highest_position: i64,
    pub is_owner: bool,
}

impl PermissionSnapshot {
    /// Compute from a cached guild and member.
    ///
    /// Roles missing from the guild are ignored. Owners and administrators
    /// receive every permission.
    #[must_use]
    pub fn compute(guild: &CachedGuild, member: &CachedMember) -> Self {
        let mut permissions = guild
            .roles
            .get(&guild.id)
            .map_or(Permissions::empty(), |everyone| everyone.permissions);
        let mut highest_position = 0;

        for role in member.roles.iter().filter_map(|id| guild.roles.get(id)) {
            permissions |= role.permissions;
            highest_position = highest_position.max(role.position);
        }

        let is_owner = guild.owner_id == member.user_id;
        if is_owner || permissions.contains(Permissions::ADMINISTRATOR) {
            permissions = Permissions::all();
        }

        Self {
            permissions,
            highest_position,
            is_owner,
        }
    }

    /// Permissions in `required` that this member lacks.
    #[must_use]
    pub const fn missing(&self, required: Permissions) -> Permissions {
        required.difference(self.permissions)
    }
}

/// Check that `actor_id` may grant or revoke `role_id` in `guild_id`.
///
/// The actor's highest role must be strictly above the target role, and the
/// actor must hold every permission in `required`. Anything missing from the
/// cache denies.
///
/// # Errors
///
/// Returns the first failed condition as a [`PrivilegeError`].
pub fn check_role_privilege<C: GuildCache + ?Sized>(
    cache: &C,
    guild_id: u64,
    actor_id: u64,
    role_id: u64,
    required: Permissions,
) -> Result<PermissionSnapshot, PrivilegeError> {
    let guild = cache
        .guild(guild_id)
        .ok_or(PrivilegeError::UnknownGuild(guild_id))?;
    let member = cache
        .member(guild_id, actor_id)
        .ok_or(PrivilegeError::UnknownMember {
            guild_id,
            user_id: actor_id,
        })?;
    let role = guild
        .roles
        .get(&role_id)
        .ok_or(PrivilegeError::UnknownRole { guild_id, role_id })?;

    let snapshot = PermissionSnapshot::compute(&guild, &member);

    if snapshot.highest_position <= role.position {
        debug!(
            guild_id,
            actor_id,
            role_id,
            role_position = role.position,
            actor_position = snapshot.highest_position,
            "Role privilege denied by hierarchy"
        );
        return Err(PrivilegeError::RoleHierarchy {
            role_id,
            role_position: role.position,
            actor_position: snapshot.highest_position,
        });
    }

    let missing = snapshot.missing(required);
    if !missing.is_empty() {
        debug!(guild_id, actor_id, ?missing, "Role privilege denied by permissions");
        return Err(PrivilegeError::MissingPermissions { missing });
    }

    Ok(snapshot)
}
