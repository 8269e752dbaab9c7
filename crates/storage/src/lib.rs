use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    ChannelId, ChannelKind, ContentUri, EventId, GuildId, MatrixUserId, MessageId, PortalKey,
    RemoteUserId, RoomId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub mxid: MatrixUserId,
    pub remote_id: Option<RemoteUserId>,
    pub token: Option<String>,
    pub management_room: Option<RoomId>,
}

impl UserRecord {
    pub fn new(mxid: MatrixUserId) -> Self {
        Self {
            mxid,
            remote_id: None,
            token: None,
            management_room: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildRecord {
    pub id: GuildId,
    pub room_id: Option<RoomId>,
    pub name: String,
    pub name_set: bool,
    pub avatar: Option<String>,
    pub avatar_url: Option<ContentUri>,
    pub avatar_set: bool,
}

impl GuildRecord {
    pub fn new(id: GuildId) -> Self {
        Self {
            id,
            room_id: None,
            name: String::new(),
            name_set: false,
            avatar: None,
            avatar_url: None,
            avatar_set: false,
        }
    }
}

/// One account's view of a guild it belongs to. `bridge` is bridge-local
/// policy and is never derived from gateway data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildMembership {
    pub owner_id: RemoteUserId,
    pub guild_id: GuildId,
    pub guild_name: String,
    pub bridge: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRecord {
    pub key: PortalKey,
    pub guild_id: Option<GuildId>,
    pub kind: ChannelKind,
    pub name: String,
    pub topic: String,
    pub dm_user: Option<RemoteUserId>,
    pub room_id: Option<RoomId>,
}

impl PortalRecord {
    pub fn new(key: PortalKey) -> Self {
        Self {
            key,
            guild_id: None,
            kind: ChannelKind::GuildText,
            name: String::new(),
            topic: String::new(),
            dm_user: None,
            room_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PuppetRecord {
    pub remote_id: RemoteUserId,
    pub custom_mxid: Option<MatrixUserId>,
    pub access_token: Option<String>,
}

impl PuppetRecord {
    pub fn new(remote_id: RemoteUserId) -> Self {
        Self {
            remote_id,
            custom_mxid: None,
            access_token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub key: PortalKey,
    pub remote_id: MessageId,
    pub sender: RemoteUserId,
    pub room_id: RoomId,
    pub event_id: EventId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRecord {
    pub key: PortalKey,
    pub message_id: MessageId,
    pub sender: RemoteUserId,
    pub emoji: String,
    pub event_id: EventId,
}

/// Durable source of truth behind the in-memory registries. Every call
/// completes synchronously from the caller's point of view.
#[async_trait]
pub trait BridgeStore: Send + Sync {
    async fn get_user_by_mxid(&self, mxid: &MatrixUserId) -> Result<Option<UserRecord>>;
    async fn get_user_by_remote_id(&self, remote_id: &RemoteUserId)
        -> Result<Option<UserRecord>>;
    async fn get_all_users(&self) -> Result<Vec<UserRecord>>;
    async fn insert_user(&self, user: &UserRecord) -> Result<()>;
    async fn update_user(&self, user: &UserRecord) -> Result<()>;

    async fn get_guild(&self, guild_id: &GuildId) -> Result<Option<GuildRecord>>;
    async fn get_guild_by_room(&self, room_id: &RoomId) -> Result<Option<GuildRecord>>;
    async fn get_all_guilds(&self) -> Result<Vec<GuildRecord>>;
    async fn insert_guild(&self, guild: &GuildRecord) -> Result<()>;
    async fn update_guild(&self, guild: &GuildRecord) -> Result<()>;

    async fn get_guild_memberships(&self, owner_id: &RemoteUserId)
        -> Result<Vec<GuildMembership>>;
    async fn upsert_guild_membership(&self, membership: &GuildMembership) -> Result<()>;
    async fn delete_guild_membership(
        &self,
        owner_id: &RemoteUserId,
        guild_id: &GuildId,
    ) -> Result<()>;
    /// Deletes every membership of `owner_id` whose guild is not in `keep`.
    async fn prune_guild_memberships(
        &self,
        owner_id: &RemoteUserId,
        keep: &[GuildId],
    ) -> Result<u64>;

    async fn get_portal(&self, key: &PortalKey) -> Result<Option<PortalRecord>>;
    async fn get_portal_by_room(&self, room_id: &RoomId) -> Result<Option<PortalRecord>>;
    async fn get_all_portals(&self) -> Result<Vec<PortalRecord>>;
    async fn insert_portal(&self, portal: &PortalRecord) -> Result<()>;
    async fn update_portal(&self, portal: &PortalRecord) -> Result<()>;
    async fn find_private_chats(&self, receiver: &RemoteUserId) -> Result<Vec<PortalRecord>>;

    async fn get_puppet(&self, remote_id: &RemoteUserId) -> Result<Option<PuppetRecord>>;
    async fn get_puppet_by_custom_mxid(&self, mxid: &MatrixUserId)
        -> Result<Option<PuppetRecord>>;
    async fn get_puppets_with_custom_mxid(&self) -> Result<Vec<PuppetRecord>>;
    async fn insert_puppet(&self, puppet: &PuppetRecord) -> Result<()>;
    async fn update_puppet(&self, puppet: &PuppetRecord) -> Result<()>;

    async fn get_message(
        &self,
        key: &PortalKey,
        message_id: &MessageId,
    ) -> Result<Option<MessageRecord>>;
    async fn insert_message(&self, message: &MessageRecord) -> Result<()>;
    async fn delete_message(&self, key: &PortalKey, message_id: &MessageId) -> Result<()>;

    async fn get_reaction(
        &self,
        key: &PortalKey,
        message_id: &MessageId,
        sender: &RemoteUserId,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>>;
    async fn insert_reaction(&self, reaction: &ReactionRecord) -> Result<()>;
    async fn delete_reaction(&self, reaction: &ReactionRecord) -> Result<()>;
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database.
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Flips the bridge flag of an existing membership. Returns false when
    /// the account has no such membership.
    pub async fn set_guild_bridging(
        &self,
        owner_id: &RemoteUserId,
        guild_id: &GuildId,
        bridge: bool,
    ) -> Result<bool> {
        let affected =
            sqlx::query("UPDATE user_guilds SET bridge = ? WHERE owner_id = ? AND guild_id = ?")
                .bind(bridge)
                .bind(owner_id.as_str())
                .bind(guild_id.as_str())
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(affected > 0)
    }
}

const USER_COLUMNS: &str = "mxid, remote_id, token, management_room";
const GUILD_COLUMNS: &str = "id, room_id, name, name_set, avatar, avatar_url, avatar_set";
const PORTAL_COLUMNS: &str = "channel_id, receiver, guild_id, kind, name, topic, dm_user, room_id";
const PUPPET_COLUMNS: &str = "remote_id, custom_mxid, access_token";

fn user_from_row(row: &SqliteRow) -> UserRecord {
    UserRecord {
        mxid: MatrixUserId(row.get::<String, _>("mxid")),
        remote_id: row.get::<Option<String>, _>("remote_id").map(RemoteUserId),
        token: row.get::<Option<String>, _>("token"),
        management_room: row.get::<Option<String>, _>("management_room").map(RoomId),
    }
}

fn guild_from_row(row: &SqliteRow) -> GuildRecord {
    GuildRecord {
        id: GuildId(row.get::<String, _>("id")),
        room_id: row.get::<Option<String>, _>("room_id").map(RoomId),
        name: row.get::<String, _>("name"),
        name_set: row.get::<bool, _>("name_set"),
        avatar: row.get::<Option<String>, _>("avatar"),
        avatar_url: row.get::<Option<String>, _>("avatar_url").map(ContentUri),
        avatar_set: row.get::<bool, _>("avatar_set"),
    }
}

fn membership_from_row(row: &SqliteRow) -> GuildMembership {
    GuildMembership {
        owner_id: RemoteUserId(row.get::<String, _>("owner_id")),
        guild_id: GuildId(row.get::<String, _>("guild_id")),
        guild_name: row.get::<String, _>("guild_name"),
        bridge: row.get::<bool, _>("bridge"),
    }
}

fn portal_from_row(row: &SqliteRow) -> PortalRecord {
    PortalRecord {
        key: PortalKey::new(
            ChannelId(row.get::<String, _>("channel_id")),
            RemoteUserId(row.get::<String, _>("receiver")),
        ),
        guild_id: row.get::<Option<String>, _>("guild_id").map(GuildId),
        kind: ChannelKind::parse(&row.get::<String, _>("kind")),
        name: row.get::<String, _>("name"),
        topic: row.get::<String, _>("topic"),
        dm_user: row.get::<Option<String>, _>("dm_user").map(RemoteUserId),
        room_id: row.get::<Option<String>, _>("room_id").map(RoomId),
    }
}

fn puppet_from_row(row: &SqliteRow) -> PuppetRecord {
    PuppetRecord {
        remote_id: RemoteUserId(row.get::<String, _>("remote_id")),
        custom_mxid: row.get::<Option<String>, _>("custom_mxid").map(MatrixUserId),
        access_token: row.get::<Option<String>, _>("access_token"),
    }
}

#[async_trait]
impl BridgeStore for Storage {
    async fn get_user_by_mxid(&self, mxid: &MatrixUserId) -> Result<Option<UserRecord>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE mxid = ?"))
            .bind(mxid.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn get_user_by_remote_id(
        &self,
        remote_id: &RemoteUserId,
    ) -> Result<Option<UserRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE remote_id = ?"
        ))
        .bind(remote_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn get_all_users(&self) -> Result<Vec<UserRecord>> {
        let rows = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY mxid"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    async fn insert_user(&self, user: &UserRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (mxid, remote_id, token, management_room) VALUES (?, ?, ?, ?)",
        )
        .bind(user.mxid.as_str())
        .bind(user.remote_id.as_ref().map(RemoteUserId::as_str))
        .bind(user.token.as_deref())
        .bind(user.management_room.as_ref().map(RoomId::as_str))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert user {}", user.mxid))?;
        Ok(())
    }

    async fn update_user(&self, user: &UserRecord) -> Result<()> {
        sqlx::query(
            "UPDATE users SET remote_id = ?, token = ?, management_room = ? WHERE mxid = ?",
        )
        .bind(user.remote_id.as_ref().map(RemoteUserId::as_str))
        .bind(user.token.as_deref())
        .bind(user.management_room.as_ref().map(RoomId::as_str))
        .bind(user.mxid.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update user {}", user.mxid))?;
        Ok(())
    }

    async fn get_guild(&self, guild_id: &GuildId) -> Result<Option<GuildRecord>> {
        let row = sqlx::query(&format!("SELECT {GUILD_COLUMNS} FROM guilds WHERE id = ?"))
            .bind(guild_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(guild_from_row))
    }

    async fn get_guild_by_room(&self, room_id: &RoomId) -> Result<Option<GuildRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {GUILD_COLUMNS} FROM guilds WHERE room_id = ?"
        ))
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(guild_from_row))
    }

    async fn get_all_guilds(&self) -> Result<Vec<GuildRecord>> {
        let rows = sqlx::query(&format!("SELECT {GUILD_COLUMNS} FROM guilds ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(guild_from_row).collect())
    }

    async fn insert_guild(&self, guild: &GuildRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO guilds (id, room_id, name, name_set, avatar, avatar_url, avatar_set)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(guild.id.as_str())
        .bind(guild.room_id.as_ref().map(RoomId::as_str))
        .bind(&guild.name)
        .bind(guild.name_set)
        .bind(guild.avatar.as_deref())
        .bind(guild.avatar_url.as_ref().map(ContentUri::as_str))
        .bind(guild.avatar_set)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert guild {}", guild.id))?;
        Ok(())
    }

    async fn update_guild(&self, guild: &GuildRecord) -> Result<()> {
        sqlx::query(
            "UPDATE guilds
             SET room_id = ?, name = ?, name_set = ?, avatar = ?, avatar_url = ?, avatar_set = ?
             WHERE id = ?",
        )
        .bind(guild.room_id.as_ref().map(RoomId::as_str))
        .bind(&guild.name)
        .bind(guild.name_set)
        .bind(guild.avatar.as_deref())
        .bind(guild.avatar_url.as_ref().map(ContentUri::as_str))
        .bind(guild.avatar_set)
        .bind(guild.id.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update guild {}", guild.id))?;
        Ok(())
    }

    async fn get_guild_memberships(
        &self,
        owner_id: &RemoteUserId,
    ) -> Result<Vec<GuildMembership>> {
        let rows = sqlx::query(
            "SELECT owner_id, guild_id, guild_name, bridge
             FROM user_guilds
             WHERE owner_id = ?
             ORDER BY guild_id",
        )
        .bind(owner_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(membership_from_row).collect())
    }

    async fn upsert_guild_membership(&self, membership: &GuildMembership) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_guilds (owner_id, guild_id, guild_name, bridge) VALUES (?, ?, ?, ?)
             ON CONFLICT(owner_id, guild_id) DO UPDATE SET
                guild_name = excluded.guild_name,
                bridge = excluded.bridge",
        )
        .bind(membership.owner_id.as_str())
        .bind(membership.guild_id.as_str())
        .bind(&membership.guild_name)
        .bind(membership.bridge)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_guild_membership(
        &self,
        owner_id: &RemoteUserId,
        guild_id: &GuildId,
    ) -> Result<()> {
        sqlx::query("DELETE FROM user_guilds WHERE owner_id = ? AND guild_id = ?")
            .bind(owner_id.as_str())
            .bind(guild_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_guild_memberships(
        &self,
        owner_id: &RemoteUserId,
        keep: &[GuildId],
    ) -> Result<u64> {
        let sql = if keep.is_empty() {
            "DELETE FROM user_guilds WHERE owner_id = ?".to_string()
        } else {
            let placeholders = vec!["?"; keep.len()].join(", ");
            format!("DELETE FROM user_guilds WHERE owner_id = ? AND guild_id NOT IN ({placeholders})")
        };

        let mut query = sqlx::query(&sql).bind(owner_id.as_str());
        for guild_id in keep {
            query = query.bind(guild_id.as_str());
        }
        let pruned = query
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to prune guild memberships for {owner_id}"))?
            .rows_affected();
        Ok(pruned)
    }

    async fn get_portal(&self, key: &PortalKey) -> Result<Option<PortalRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PORTAL_COLUMNS} FROM portals WHERE channel_id = ? AND receiver = ?"
        ))
        .bind(key.channel_id.as_str())
        .bind(key.receiver.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(portal_from_row))
    }

    async fn get_portal_by_room(&self, room_id: &RoomId) -> Result<Option<PortalRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PORTAL_COLUMNS} FROM portals WHERE room_id = ?"
        ))
        .bind(room_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(portal_from_row))
    }

    async fn get_all_portals(&self) -> Result<Vec<PortalRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PORTAL_COLUMNS} FROM portals ORDER BY channel_id, receiver"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(portal_from_row).collect())
    }

    async fn insert_portal(&self, portal: &PortalRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO portals (channel_id, receiver, guild_id, kind, name, topic, dm_user, room_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(portal.key.channel_id.as_str())
        .bind(portal.key.receiver.as_str())
        .bind(portal.guild_id.as_ref().map(GuildId::as_str))
        .bind(portal.kind.as_str())
        .bind(&portal.name)
        .bind(&portal.topic)
        .bind(portal.dm_user.as_ref().map(RemoteUserId::as_str))
        .bind(portal.room_id.as_ref().map(RoomId::as_str))
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert portal {}", portal.key))?;
        Ok(())
    }

    async fn update_portal(&self, portal: &PortalRecord) -> Result<()> {
        sqlx::query(
            "UPDATE portals
             SET guild_id = ?, kind = ?, name = ?, topic = ?, dm_user = ?, room_id = ?
             WHERE channel_id = ? AND receiver = ?",
        )
        .bind(portal.guild_id.as_ref().map(GuildId::as_str))
        .bind(portal.kind.as_str())
        .bind(&portal.name)
        .bind(&portal.topic)
        .bind(portal.dm_user.as_ref().map(RemoteUserId::as_str))
        .bind(portal.room_id.as_ref().map(RoomId::as_str))
        .bind(portal.key.channel_id.as_str())
        .bind(portal.key.receiver.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update portal {}", portal.key))?;
        Ok(())
    }

    async fn find_private_chats(&self, receiver: &RemoteUserId) -> Result<Vec<PortalRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PORTAL_COLUMNS} FROM portals
             WHERE receiver = ? AND kind = ?
             ORDER BY channel_id"
        ))
        .bind(receiver.as_str())
        .bind(ChannelKind::Dm.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(portal_from_row).collect())
    }

    async fn get_puppet(&self, remote_id: &RemoteUserId) -> Result<Option<PuppetRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PUPPET_COLUMNS} FROM puppets WHERE remote_id = ?"
        ))
        .bind(remote_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(puppet_from_row))
    }

    async fn get_puppet_by_custom_mxid(
        &self,
        mxid: &MatrixUserId,
    ) -> Result<Option<PuppetRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {PUPPET_COLUMNS} FROM puppets WHERE custom_mxid = ?"
        ))
        .bind(mxid.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(puppet_from_row))
    }

    async fn get_puppets_with_custom_mxid(&self) -> Result<Vec<PuppetRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PUPPET_COLUMNS} FROM puppets WHERE custom_mxid IS NOT NULL ORDER BY remote_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(puppet_from_row).collect())
    }

    async fn insert_puppet(&self, puppet: &PuppetRecord) -> Result<()> {
        sqlx::query("INSERT INTO puppets (remote_id, custom_mxid, access_token) VALUES (?, ?, ?)")
            .bind(puppet.remote_id.as_str())
            .bind(puppet.custom_mxid.as_ref().map(MatrixUserId::as_str))
            .bind(puppet.access_token.as_deref())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to insert puppet {}", puppet.remote_id))?;
        Ok(())
    }

    async fn update_puppet(&self, puppet: &PuppetRecord) -> Result<()> {
        sqlx::query("UPDATE puppets SET custom_mxid = ?, access_token = ? WHERE remote_id = ?")
            .bind(puppet.custom_mxid.as_ref().map(MatrixUserId::as_str))
            .bind(puppet.access_token.as_deref())
            .bind(puppet.remote_id.as_str())
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to update puppet {}", puppet.remote_id))?;
        Ok(())
    }

    async fn get_message(
        &self,
        key: &PortalKey,
        message_id: &MessageId,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(
            "SELECT sender, room_id, event_id FROM messages
             WHERE channel_id = ? AND receiver = ? AND remote_id = ?",
        )
        .bind(key.channel_id.as_str())
        .bind(key.receiver.as_str())
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| MessageRecord {
            key: key.clone(),
            remote_id: message_id.clone(),
            sender: RemoteUserId(r.get::<String, _>(0)),
            room_id: RoomId(r.get::<String, _>(1)),
            event_id: EventId(r.get::<String, _>(2)),
        }))
    }

    async fn insert_message(&self, message: &MessageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages (channel_id, receiver, remote_id, sender, room_id, event_id)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message.key.channel_id.as_str())
        .bind(message.key.receiver.as_str())
        .bind(message.remote_id.as_str())
        .bind(message.sender.as_str())
        .bind(message.room_id.as_str())
        .bind(message.event_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_message(&self, key: &PortalKey, message_id: &MessageId) -> Result<()> {
        sqlx::query("DELETE FROM messages WHERE channel_id = ? AND receiver = ? AND remote_id = ?")
            .bind(key.channel_id.as_str())
            .bind(key.receiver.as_str())
            .bind(message_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_reaction(
        &self,
        key: &PortalKey,
        message_id: &MessageId,
        sender: &RemoteUserId,
        emoji: &str,
    ) -> Result<Option<ReactionRecord>> {
        let row = sqlx::query(
            "SELECT event_id FROM reactions
             WHERE channel_id = ? AND receiver = ? AND message_id = ? AND sender = ? AND emoji = ?",
        )
        .bind(key.channel_id.as_str())
        .bind(key.receiver.as_str())
        .bind(message_id.as_str())
        .bind(sender.as_str())
        .bind(emoji)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| ReactionRecord {
            key: key.clone(),
            message_id: message_id.clone(),
            sender: sender.clone(),
            emoji: emoji.to_owned(),
            event_id: EventId(r.get::<String, _>(0)),
        }))
    }

    async fn insert_reaction(&self, reaction: &ReactionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO reactions (channel_id, receiver, message_id, sender, emoji, event_id)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(reaction.key.channel_id.as_str())
        .bind(reaction.key.receiver.as_str())
        .bind(reaction.message_id.as_str())
        .bind(reaction.sender.as_str())
        .bind(&reaction.emoji)
        .bind(reaction.event_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_reaction(&self, reaction: &ReactionRecord) -> Result<()> {
        sqlx::query(
            "DELETE FROM reactions
             WHERE channel_id = ? AND receiver = ? AND message_id = ? AND sender = ? AND emoji = ?",
        )
        .bind(reaction.key.channel_id.as_str())
        .bind(reaction.key.receiver.as_str())
        .bind(reaction.message_id.as_str())
        .bind(reaction.sender.as_str())
        .bind(&reaction.emoji)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
