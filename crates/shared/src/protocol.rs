use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, ChannelKind, GuildId, MessageId, RemoteUserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub id: RemoteUserId,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildInfo {
    pub id: GuildId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub icon: Option<String>,
    /// Outage placeholder: only the ID is trustworthy.
    #[serde(default)]
    pub unavailable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadySnapshot {
    pub user: RemoteUser,
    pub guilds: Vec<GuildInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub kind: ChannelKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub recipients: Vec<RemoteUser>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPins {
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub author: RemoteUser,
    #[serde(default)]
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeletion {
    pub id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionInfo {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    pub user_id: RemoteUserId,
    pub emoji: String,
}

/// Everything a gateway session can report. Delivery is at-least-once
/// with no ordering across variants or sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum GatewayEvent {
    Ready(ReadySnapshot),
    Connected,
    Disconnected,
    GuildCreate(GuildInfo),
    GuildUpdate(GuildInfo),
    GuildDelete { guild_id: GuildId },
    ChannelCreate(ChannelInfo),
    ChannelUpdate(ChannelInfo),
    ChannelDelete(ChannelInfo),
    ChannelPinsUpdate(ChannelPins),
    MessageCreate(MessageInfo),
    MessageUpdate(MessageInfo),
    MessageDelete(MessageDeletion),
    ReactionAdd(ReactionInfo),
    ReactionRemove(ReactionInfo),
}

impl GatewayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::Ready(_) => "ready",
            GatewayEvent::Connected => "connected",
            GatewayEvent::Disconnected => "disconnected",
            GatewayEvent::GuildCreate(_) => "guild_create",
            GatewayEvent::GuildUpdate(_) => "guild_update",
            GatewayEvent::GuildDelete { .. } => "guild_delete",
            GatewayEvent::ChannelCreate(_) => "channel_create",
            GatewayEvent::ChannelUpdate(_) => "channel_update",
            GatewayEvent::ChannelDelete(_) => "channel_delete",
            GatewayEvent::ChannelPinsUpdate(_) => "channel_pins_update",
            GatewayEvent::MessageCreate(_) => "message_create",
            GatewayEvent::MessageUpdate(_) => "message_update",
            GatewayEvent::MessageDelete(_) => "message_delete",
            GatewayEvent::ReactionAdd(_) => "reaction_add",
            GatewayEvent::ReactionRemove(_) => "reaction_remove",
        }
    }
}
