use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

// Remote gateway network identifiers.
id_newtype!(RemoteUserId);
id_newtype!(GuildId);
id_newtype!(ChannelId);
id_newtype!(MessageId);

// Federated (Matrix) side identifiers.
id_newtype!(MatrixUserId);
id_newtype!(RoomId);
id_newtype!(EventId);
id_newtype!(ContentUri);

impl MatrixUserId {
    /// `@localpart:server` -> `localpart`.
    pub fn localpart(&self) -> Option<&str> {
        let rest = self.0.strip_prefix('@')?;
        rest.split_once(':').map(|(local, _)| local)
    }

    /// `@localpart:server` -> `server`.
    pub fn server_name(&self) -> Option<&str> {
        let rest = self.0.strip_prefix('@')?;
        rest.split_once(':').map(|(_, server)| server)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    GuildText,
    Dm,
    GuildVoice,
    GroupDm,
    GuildCategory,
    GuildNews,
    Thread,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::GuildText => "guild_text",
            ChannelKind::Dm => "dm",
            ChannelKind::GuildVoice => "guild_voice",
            ChannelKind::GroupDm => "group_dm",
            ChannelKind::GuildCategory => "guild_category",
            ChannelKind::GuildNews => "guild_news",
            ChannelKind::Thread => "thread",
        }
    }

    /// Unknown values fall back to a plain guild text channel.
    pub fn parse(value: &str) -> Self {
        match value {
            "dm" => ChannelKind::Dm,
            "guild_voice" => ChannelKind::GuildVoice,
            "group_dm" => ChannelKind::GroupDm,
            "guild_category" => ChannelKind::GuildCategory,
            "guild_news" => ChannelKind::GuildNews,
            "thread" => ChannelKind::Thread,
            _ => ChannelKind::GuildText,
        }
    }

    /// One-to-one conversations, the only kind that lands in the direct chat list.
    pub fn is_direct(self) -> bool {
        matches!(self, ChannelKind::Dm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Invite,
    Join,
    Leave,
    Ban,
}

/// Identity of a portal. DM channel IDs are only unique per receiving
/// account, so the receiver is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortalKey {
    pub channel_id: ChannelId,
    pub receiver: RemoteUserId,
}

impl PortalKey {
    pub fn new(channel_id: ChannelId, receiver: RemoteUserId) -> Self {
        Self {
            channel_id,
            receiver,
        }
    }
}

impl fmt::Display for PortalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.channel_id, self.receiver)
    }
}
