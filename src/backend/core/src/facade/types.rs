//! Guild resource shapes as cached and served to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Top-level guild summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildSnapshot {
    pub id: String,
    pub name: String,
    pub icon_url: Option<String>,
    pub member_count: u64,
    pub owner_id: String,
}

/// One guild member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildMember {
    pub user_id: String,
    pub username: String,
    pub nickname: Option<String>,
    pub role_ids: Vec<String>,
    pub joined_at: DateTime<Utc>,
}

/// Channel category as far as ticket routing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Text,
    Voice,
    Category,
    Thread,
    Other,
}

/// One guild channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildChannel {
    pub id: String,
    pub name: String,
    pub kind: ChannelKind,
    pub position: i32,
    pub parent_id: Option<String>,
}

/// One guild role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuildRole {
    pub id: String,
    pub name: String,
    pub color: u32,
    pub position: i32,
    pub permissions: u64,
}

/// Online status values the remote API reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Offline,
}

/// A user's presence within a guild.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
    pub status: PresenceStatus,
    pub activity: Option<String>,
}
