//! Guild cache collaborator used by privilege checks.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::permissions::Permissions;
use crate::types::{Guild, Member, Role};

/// A role as far as privilege checks are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedRole {
    pub id: u64,
    pub position: i64,
    pub permissions: Permissions,
}

impl From<&Role> for CachedRole {
    fn from(role: &Role) -> Self {
        Self {
            id: role.id,
            position: role.position,
            permissions: role.permissions,
        }
    }
}

/// A guild with its owner and roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedGuild {
    pub id: u64,
    pub owner_id: u64,
    /// Keyed by role id; `@everyone` has the guild's id.
    pub roles: HashMap<u64, CachedRole>,
}

/// A member's role ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMember {
    pub user_id: u64,
    pub roles: Vec<u64>,
}

/// Read access to cached guild state, plus hooks for the client to keep it
/// current from REST responses.
///
/// The update hooks default to no-ops for caches fed from elsewhere
/// (typically a gateway connection).
pub trait GuildCache: Send + Sync {
    fn guild(&self, guild_id: u64) -> Option<CachedGuild>;

    fn member(&self, guild_id: u64, user_id: u64) -> Option<CachedMember>;

    fn update_guild(&self, _guild: &Guild) {}

    fn update_roles(&self, _guild_id: u64, _roles: &[Role]) {}

    fn update_member(&self, _guild_id: u64, _member: &Member) {}
}

/// A [`GuildCache`] held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    guilds: RwLock<HashMap<u64, CachedGuild>>,
    members: RwLock<HashMap<(u64, u64), CachedMember>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_guild(&self, guild: CachedGuild) {
        self.guilds.write().insert(guild.id, guild);
    }

    pub fn put_member(&self, guild_id: u64, member: CachedMember) {
        self.members
            .write()
            .insert((guild_id, member.user_id), member);
    }

    /// Insert or replace one role of a cached guild.
    ///
    /// Returns `false` if the guild is not cached.
    pub fn put_role(&self, guild_id: u64, role: CachedRole) -> bool {
        self.guilds.write().get_mut(&guild_id).is_some_and(|guild| {
            guild.roles.insert(role.id, role);
            true
        })
    }

    pub fn remove_role(&self, guild_id: u64, role_id: u64) {
        if let Some(guild) = self.guilds.write().get_mut(&guild_id) {
            guild.roles.remove(&role_id);
        }
    }

    /// Drop a guild and every member cached for it.
    pub fn remove_guild(&self, guild_id: u64) {
        self.guilds.write().remove(&guild_id);
        self.members.write().retain(|(g, _), _| *g != guild_id);
    }

    #[must_use]
    pub fn guild_count(&self) -> usize {
        self.guilds.read().len()
    }
}

impl GuildCache for InMemoryCache {
    fn guild(&self, guild_id: u64) -> Option<CachedGuild> {
        self.guilds.read().get(&guild_id).cloned()
    }

    fn member(&self, guild_id: u64, user_id: u64) -> Option<CachedMember> {
        self.members.read().get(&(guild_id, user_id)).cloned()
    }

    fn update_guild(&self, guild: &Guild) {
        // Partial guild payloads carry no owner; keep what we know.
        let mut guilds = self.guilds.write();
        let owner_id = guild
            .owner_id
            .or_else(|| guilds.get(&guild.id).map(|g| g.owner_id))
            .unwrap_or_default();
        let roles = if guild.roles.is_empty() {
            guilds
                .get(&guild.id)
                .map(|g| g.roles.clone())
                .unwrap_or_default()
        } else {
            guild
                .roles
                .iter()
                .map(|role| (role.id, CachedRole::from(role)))
                .collect()
        };
        guilds.insert(
            guild.id,
            CachedGuild {
                id: guild.id,
                owner_id,
                roles,
            },
        );
    }

    fn update_roles(&self, guild_id: u64, roles: &[Role]) {
        if let Some(guild) = self.guilds.write().get_mut(&guild_id) {
            guild.roles = roles
                .iter()
                .map(|role| (role.id, CachedRole::from(role)))
                .collect();
        }
    }

    fn update_member(&self, guild_id: u64, member: &Member) {
        if let Some(user) = &member.user {
            self.put_member(
                guild_id,
                CachedMember {
                    user_id: user.id,
                    roles: member.roles.clone(),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role_dto(id: u64, position: i64, permissions: Permissions) -> Role {
        Role {
            id,
            name: format!("role-{id}"),
            color: 0,
            hoist: false,
            position,
            permissions,
            managed: false,
            mentionable: false,
        }
    }

    #[test]
    fn test_update_guild_from_dto() {
        let cache = InMemoryCache::new();
        cache.update_guild(&Guild {
            id: 1,
            name: "g".into(),
            icon: None,
            owner_id: Some(9),
            roles: vec![
                role_dto(1, 0, Permissions::VIEW_CHANNEL),
                role_dto(2, 4, Permissions::MANAGE_ROLES),
            ],
        });

        let guild = cache.guild(1).unwrap();
        assert_eq!(guild.owner_id, 9);
        assert_eq!(guild.roles[&2].position, 4);
        assert_eq!(cache.guild_count(), 1);
    }

    #[test]
    fn test_partial_guild_keeps_known_state() {
        let cache = InMemoryCache::new();
        cache.update_guild(&Guild {
            id: 1,
            name: "g".into(),
            icon: None,
            owner_id: Some(9),
            roles: vec![role_dto(2, 4, Permissions::MANAGE_ROLES)],
        });
        cache.update_guild(&Guild {
            id: 1,
            name: "renamed".into(),
            icon: None,
            owner_id: None,
            roles: vec![],
        });

        let guild = cache.guild(1).unwrap();
        assert_eq!(guild.owner_id, 9);
        assert!(guild.roles.contains_key(&2));
    }

    #[test]
    fn test_roles_and_members() {
        let cache = InMemoryCache::new();
        assert!(!cache.put_role(1, CachedRole::from(&role_dto(2, 1, Permissions::empty()))));

        cache.put_guild(CachedGuild {
            id: 1,
            owner_id: 9,
            roles: HashMap::new(),
        });
        cache.update_roles(1, &[role_dto(2, 1, Permissions::empty())]);
        assert!(cache.guild(1).unwrap().roles.contains_key(&2));

        cache.remove_role(1, 2);
        assert!(cache.guild(1).unwrap().roles.is_empty());

        cache.put_member(1, CachedMember { user_id: 5, roles: vec![2] });
        assert_eq!(cache.member(1, 5).unwrap().roles, vec![2]);

        cache.remove_guild(1);
        assert!(cache.guild(1).is_none());
        assert!(cache.member(1, 5).is_none());
    }
}
