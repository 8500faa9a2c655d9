//! Cache key schema for guild resources.
//!
//! Keys are deterministic per resource so that concurrent fetches of the same
//! resource produce the same key, which the task queue also uses for
//! deduplication.

use std::fmt;

/// Guild resource kinds, each with its own key prefix and TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Guild snapshot (name, icon, counts)
    Snapshot,
    /// Member list
    Members,
    /// Channel list
    Channels,
    /// Role list
    Roles,
    /// Per-user presence
    Presence,
}

impl ResourceKind {
    /// Key segment identifying this resource kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            ResourceKind::Snapshot => "snapshot",
            ResourceKind::Members => "members",
            ResourceKind::Channels => "channels",
            ResourceKind::Roles => "roles",
            ResourceKind::Presence => "presence",
        }
    }

    /// Cache TTL in seconds. Presence data changes quickly, so it expires
    /// much sooner than structural guild data.
    pub fn ttl_secs(&self) -> u64 {
        match self {
            ResourceKind::Snapshot => 300,
            ResourceKind::Members => 300,
            ResourceKind::Channels => 300,
            ResourceKind::Roles => 300,
            ResourceKind::Presence => 60,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A fully-qualified cache key for one guild resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    kind: ResourceKind,
    guild_id: String,
    user_id: Option<String>,
}

impl CacheKey {
    /// Key for a guild-wide resource.
    pub fn guild(kind: ResourceKind, guild_id: impl Into<String>) -> Self {
        Self {
            kind,
            guild_id: guild_id.into(),
            user_id: None,
        }
    }

    /// Key for a single user's presence within a guild.
    pub fn presence(guild_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Presence,
            guild_id: guild_id.into(),
            user_id: Some(user_id.into()),
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    /// Render the key string. Presence keys carry the user id as a final
    /// segment; all other kinds are guild-scoped.
    pub fn render(&self) -> String {
        match &self.user_id {
            Some(user_id) => format!("guild:{}:{}:{}", self.kind.prefix(), self.guild_id, user_id),
            None => format!("guild:{}:{}", self.kind.prefix(), self.guild_id),
        }
    }

    /// Glob pattern matching every presence key of a guild, for invalidation.
    pub fn presence_pattern(guild_id: &str) -> String {
        format!("guild:{}:{}:*", ResourceKind::Presence.prefix(), guild_id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
