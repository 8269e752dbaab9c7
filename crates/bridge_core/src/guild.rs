use std::sync::Arc;

use anyhow::{Context, Result};
use gateway::guild_icon_url;
use serde_json::json;
use shared::{
    domain::{GuildId, RoomId},
    protocol::GuildInfo,
};
use storage::{BridgeStore, GuildRecord};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    config::BridgeConfig,
    matrix::{
        BridgeInfo, BridgeInfoSection, CreateRoomRequest, Intent, MatrixClient, StateEvent,
        EVENT_ROOM_AVATAR,
    },
    user::User,
    Bridge,
};

/// Bridge-wide view of a remote guild and the Space that mirrors it.
pub struct Guild {
    pub id: GuildId,
    store: Arc<dyn BridgeStore>,
    pub(crate) record: Mutex<GuildRecord>,
    room_create_lock: Mutex<()>,
}

impl Guild {
    pub(crate) fn new(record: GuildRecord, store: Arc<dyn BridgeStore>) -> Self {
        Self {
            id: record.id.clone(),
            store,
            record: Mutex::new(record),
            room_create_lock: Mutex::new(()),
        }
    }

    pub async fn record(&self) -> GuildRecord {
        self.record.lock().await.clone()
    }

    pub async fn room_id(&self) -> Option<RoomId> {
        self.record.lock().await.room_id.clone()
    }

    pub async fn save(&self) -> Result<()> {
        let record = self.record().await;
        self.store.update_guild(&record).await
    }

    pub async fn reload(&self) -> Result<()> {
        if let Some(record) = self.store.get_guild(&self.id).await? {
            *self.record.lock().await = record;
        }
        Ok(())
    }

    /// Returns whether the stored name changed. `name_set` only becomes true
    /// once the Space actually carries the name.
    pub async fn update_name(&self, matrix: &dyn MatrixClient, name: &str) -> bool {
        let mut record = self.record.lock().await;
        if record.name == name && record.name_set {
            return false;
        }
        record.name = name.to_owned();
        record.name_set = false;
        if let Some(room_id) = record.room_id.clone() {
            match matrix.set_room_name(&Intent::Bot, &room_id, name).await {
                Ok(()) => record.name_set = true,
                Err(err) => {
                    warn!(guild_id = %self.id, %room_id, error = %err, "failed to update space name")
                }
            }
        }
        true
    }

    pub async fn update_avatar(&self, matrix: &dyn MatrixClient, icon: Option<&str>) -> bool {
        let icon = icon.filter(|icon| !icon.is_empty());
        let mut record = self.record.lock().await;
        if record.avatar.as_deref() == icon && record.avatar_set {
            return false;
        }
        record.avatar = icon.map(str::to_owned);
        record.avatar_url = None;
        record.avatar_set = false;

        if let Some(icon) = icon {
            match matrix.upload_avatar(&guild_icon_url(&self.id, icon)).await {
                Ok(url) => record.avatar_url = Some(url),
                Err(err) => {
                    warn!(guild_id = %self.id, error = %err, "failed to reupload guild avatar");
                    return true;
                }
            }
        }

        if let Some(room_id) = record.room_id.clone() {
            match matrix
                .set_room_avatar(&Intent::Bot, &room_id, record.avatar_url.as_ref())
                .await
            {
                Ok(()) => record.avatar_set = true,
                Err(err) => {
                    warn!(guild_id = %self.id, %room_id, error = %err, "failed to update space avatar")
                }
            }
        }
        true
    }

    /// Applies a fresh guild snapshot, refreshing bridge info and saving
    /// when anything changed. Outage placeholders are ignored.
    pub async fn update_info(
        &self,
        matrix: &dyn MatrixClient,
        config: &BridgeConfig,
        info: &GuildInfo,
    ) -> Result<bool> {
        if info.unavailable {
            return Ok(false);
        }
        let name_changed = self.update_name(matrix, &info.name).await;
        let avatar_changed = self.update_avatar(matrix, info.icon.as_deref()).await;
        let changed = name_changed || avatar_changed;
        if changed {
            self.update_bridge_info(matrix, config).await;
            self.save().await?;
        }
        Ok(changed)
    }

    pub async fn bridge_info(&self, config: &BridgeConfig) -> (String, BridgeInfo) {
        let record = self.record.lock().await;
        let info = BridgeInfo {
            bridgebot: config.bot_mxid(),
            creator: config.bot_mxid(),
            protocol: BridgeInfo::protocol_section(config),
            network: None,
            channel: BridgeInfoSection {
                id: self.id.to_string(),
                displayname: record.name.clone(),
                avatar_url: record.avatar_url.clone(),
                external_url: None,
            },
        };
        (config.guild_bridge_state_key(&self.id), info)
    }

    /// Pushes both bridge info state events. Failures are logged only.
    pub async fn update_bridge_info(&self, matrix: &dyn MatrixClient, config: &BridgeConfig) {
        let Some(room_id) = self.room_id().await else {
            debug!(guild_id = %self.id, "no space yet, skipping bridge info update");
            return;
        };
        let (state_key, info) = self.bridge_info(config).await;
        let events = match info.state_events(&state_key) {
            Ok(events) => events,
            Err(err) => {
                warn!(guild_id = %self.id, error = %err, "failed to encode bridge info");
                return;
            }
        };
        debug!(guild_id = %self.id, %room_id, "updating bridge info");
        for event in &events {
            if let Err(err) = matrix.send_state_event(&Intent::Bot, &room_id, event).await {
                warn!(
                    guild_id = %self.id,
                    %room_id,
                    event_type = %event.event_type,
                    error = %err,
                    "failed to update bridge info"
                );
            }
        }
    }
}

impl Bridge {
    /// Brings a bridged guild's Space in line with `info`, creating the
    /// Space on first sight. Errors are logged.
    pub(crate) async fn sync_guild(&self, user: &Arc<User>, info: &GuildInfo) {
        let guild = match self.get_guild_by_id(&info.id, true).await {
            Ok(Some(guild)) => guild,
            Ok(None) => return,
            Err(err) => {
                warn!(guild_id = %info.id, error = %err, "failed to load guild");
                return;
            }
        };
        let result = match guild.room_id().await {
            Some(room_id) => {
                let updated = guild
                    .update_info(self.matrix.as_ref(), &self.config, info)
                    .await;
                self.ensure_invited(user, &Intent::Bot, &room_id, false)
                    .await;
                updated.map(|_| ())
            }
            None => self.create_guild_space(user, &guild, info).await.map(|_| ()),
        };
        if let Err(err) = result {
            warn!(user = %user.mxid, guild_id = %info.id, error = %err, "failed to sync guild space");
        }
    }

    /// Creates the guild's Space at most once, then makes sure `user` is
    /// invited to it.
    pub async fn create_guild_space(
        &self,
        user: &Arc<User>,
        guild: &Arc<Guild>,
        info: &GuildInfo,
    ) -> Result<RoomId> {
        let creating = guild.room_create_lock.lock().await;
        if let Some(room_id) = guild.room_id().await {
            drop(creating);
            self.ensure_invited(user, &Intent::Bot, &room_id, false)
                .await;
            return Ok(room_id);
        }

        info!(guild_id = %guild.id, "creating space for guild");
        guild
            .update_info(self.matrix.as_ref(), &self.config, info)
            .await?;

        let (state_key, bridge_info) = guild.bridge_info(&self.config).await;
        let mut initial_state = bridge_info.state_events(&state_key)?;
        let (name, avatar_url) = {
            let record = guild.record.lock().await;
            (record.name.clone(), record.avatar_url.clone())
        };
        if let Some(url) = &avatar_url {
            initial_state.push(StateEvent::new(
                EVENT_ROOM_AVATAR,
                "",
                json!({ "url": url }),
            ));
        }

        let request = CreateRoomRequest {
            name,
            topic: String::new(),
            is_space: true,
            is_direct: false,
            federate: self.config.federate_rooms,
            parent: None,
            invite: Vec::new(),
            initial_state,
        };
        let room_id = self
            .matrix
            .create_room(&Intent::Bot, request)
            .await
            .with_context(|| format!("failed to create space for guild {}", guild.id))?;

        {
            let mut record = guild.record.lock().await;
            record.room_id = Some(room_id.clone());
            record.name_set = true;
            record.avatar_set = record.avatar.is_none() || record.avatar_url.is_some();
        }
        if let Err(err) = guild.save().await {
            guild.record.lock().await.room_id = None;
            return Err(err.context(format!("failed to save space for guild {}", guild.id)));
        }
        self.register_guild_room(guild, &room_id).await;
        info!(guild_id = %guild.id, %room_id, "space created");

        self.ensure_invited(user, &Intent::Bot, &room_id, false).await;
        Ok(room_id)
    }
}

#[cfg(test)]
#[path = "tests/guild_tests.rs"]
mod tests;
