use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use shared::domain::{GuildId, MatrixUserId, PortalKey, RemoteUserId, RoomId};
use storage::{GuildRecord, PortalRecord, PuppetRecord, UserRecord};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{guild::Guild, portal::Portal, puppet::Puppet, user::User, Bridge};

#[derive(Default)]
pub(crate) struct UserIndex {
    by_mxid: HashMap<MatrixUserId, Arc<User>>,
    by_remote_id: HashMap<RemoteUserId, Arc<User>>,
}

#[derive(Default)]
pub(crate) struct GuildIndex {
    by_id: HashMap<GuildId, Arc<Guild>>,
    by_room: HashMap<RoomId, Arc<Guild>>,
}

#[derive(Default)]
pub(crate) struct PortalIndex {
    by_key: HashMap<PortalKey, Arc<Portal>>,
    by_room: HashMap<RoomId, Arc<Portal>>,
}

#[derive(Default)]
pub(crate) struct PuppetIndex {
    by_id: HashMap<RemoteUserId, Arc<Puppet>>,
    by_custom_mxid: HashMap<MatrixUserId, Arc<Puppet>>,
}

/// In-memory identity maps. Each lock is held across the store round trip
/// so a miss can never create the same entity twice.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) users: Mutex<UserIndex>,
    pub(crate) management_rooms: Mutex<HashMap<RoomId, Arc<User>>>,
    pub(crate) guilds: Mutex<GuildIndex>,
    pub(crate) portals: Mutex<PortalIndex>,
    pub(crate) puppets: Mutex<PuppetIndex>,
}

impl Bridge {
    async fn load_user(&self, index: &mut UserIndex, record: UserRecord) -> Result<Arc<User>> {
        let user = Arc::new(User::new(record, Arc::clone(&self.store)));
        if let Some(remote_id) = user.remote_id().await {
            {
                let mut guilds = user.guilds.lock().await;
                user.load_guilds(&mut guilds, &remote_id).await?;
            }
            index.by_remote_id.insert(remote_id, Arc::clone(&user));
        }
        if let Some(room_id) = user.management_room().await {
            self.registry
                .management_rooms
                .lock()
                .await
                .insert(room_id, Arc::clone(&user));
        }
        index.by_mxid.insert(user.mxid.clone(), Arc::clone(&user));
        Ok(user)
    }

    /// Loads or creates the user record for a federated account. Bridge
    /// ghosts and the bot never become users and yield `None`.
    pub async fn get_user_by_mxid(&self, mxid: &MatrixUserId) -> Result<Option<Arc<User>>> {
        if self.config.is_bridge_account(mxid) {
            return Ok(None);
        }
        let mut index = self.registry.users.lock().await;
        if let Some(user) = index.by_mxid.get(mxid) {
            return Ok(Some(Arc::clone(user)));
        }
        let record = match self.store.get_user_by_mxid(mxid).await? {
            Some(record) => record,
            None => {
                let record = UserRecord::new(mxid.clone());
                self.store
                    .insert_user(&record)
                    .await
                    .with_context(|| format!("failed to create user {mxid}"))?;
                debug!(user = %mxid, "created user");
                record
            }
        };
        self.load_user(&mut index, record).await.map(Some)
    }

    pub async fn get_user_by_remote_id(&self, remote_id: &RemoteUserId) -> Result<Option<Arc<User>>> {
        let mut index = self.registry.users.lock().await;
        if let Some(user) = index.by_remote_id.get(remote_id) {
            return Ok(Some(Arc::clone(user)));
        }
        match self.store.get_user_by_remote_id(remote_id).await? {
            Some(record) => {
                if let Some(user) = index.by_mxid.get(&record.mxid) {
                    return Ok(Some(Arc::clone(user)));
                }
                self.load_user(&mut index, record).await.map(Some)
            }
            None => Ok(None),
        }
    }

    pub async fn get_user_by_management_room(&self, room_id: &RoomId) -> Option<Arc<User>> {
        self.registry
            .management_rooms
            .lock()
            .await
            .get(room_id)
            .cloned()
    }

    /// Every stored user, loading the ones not yet in memory.
    pub async fn all_users(&self) -> Result<Vec<Arc<User>>> {
        let mut index = self.registry.users.lock().await;
        let mut users = Vec::new();
        for record in self.store.get_all_users().await? {
            let user = match index.by_mxid.get(&record.mxid) {
                Some(user) => Arc::clone(user),
                None => self.load_user(&mut index, record).await?,
            };
            users.push(user);
        }
        Ok(users)
    }

    /// Links `user` to `remote_id`. A different user still linked to the
    /// same remote account is detached first. Memory only follows the store
    /// once each save succeeded.
    pub(crate) async fn register_user_remote_id(&self, user: &Arc<User>, remote_id: &RemoteUserId) -> Result<()> {
        let mut index = self.registry.users.lock().await;
        let mut updated = user.record().await;
        if updated.remote_id.as_ref() == Some(remote_id) {
            index
                .by_remote_id
                .insert(remote_id.clone(), Arc::clone(user));
            return Ok(());
        }

        if let Some(holder) = self.store.get_user_by_remote_id(remote_id).await? {
            if holder.mxid != user.mxid {
                self.detach_remote_id(&index, holder).await?;
                warn!(user = %user.mxid, %remote_id, "remote account moved over from another user");
            }
        }

        let previous = updated.remote_id.replace(remote_id.clone());
        self.store
            .update_user(&updated)
            .await
            .with_context(|| format!("failed to link {} to {remote_id}", user.mxid))?;
        user.record.lock().await.remote_id = Some(remote_id.clone());
        if let Some(previous) = previous {
            index.by_remote_id.remove(&previous);
        }
        index
            .by_remote_id
            .insert(remote_id.clone(), Arc::clone(user));
        Ok(())
    }

    async fn detach_remote_id(&self, index: &UserIndex, stored: UserRecord) -> Result<()> {
        let loaded = index.by_mxid.get(&stored.mxid).cloned();
        let mut detached = match &loaded {
            Some(holder) => holder.record().await,
            None => stored,
        };
        detached.remote_id = None;
        self.store
            .update_user(&detached)
            .await
            .with_context(|| format!("failed to unlink {}", detached.mxid))?;
        if let Some(holder) = loaded {
            holder.record.lock().await.remote_id = None;
            holder.guilds.lock().await.clear();
        }
        Ok(())
    }

    async fn load_guild(&self, index: &mut GuildIndex, record: GuildRecord) -> Arc<Guild> {
        let guild = Arc::new(Guild::new(record, Arc::clone(&self.store)));
        if let Some(room_id) = guild.room_id().await {
            index.by_room.insert(room_id, Arc::clone(&guild));
        }
        index.by_id.insert(guild.id.clone(), Arc::clone(&guild));
        guild
    }

    pub async fn get_guild_by_id(&self, guild_id: &GuildId, create: bool) -> Result<Option<Arc<Guild>>> {
        let mut index = self.registry.guilds.lock().await;
        if let Some(guild) = index.by_id.get(guild_id) {
            return Ok(Some(Arc::clone(guild)));
        }
        let record = match self.store.get_guild(guild_id).await? {
            Some(record) => record,
            None if create => {
                let record = GuildRecord::new(guild_id.clone());
                self.store
                    .insert_guild(&record)
                    .await
                    .with_context(|| format!("failed to create guild {guild_id}"))?;
                debug!(%guild_id, "created guild");
                record
            }
            None => return Ok(None),
        };
        Ok(Some(self.load_guild(&mut index, record).await))
    }

    pub async fn get_guild_by_room(&self, room_id: &RoomId) -> Result<Option<Arc<Guild>>> {
        let mut index = self.registry.guilds.lock().await;
        if let Some(guild) = index.by_room.get(room_id) {
            return Ok(Some(Arc::clone(guild)));
        }
        match self.store.get_guild_by_room(room_id).await? {
            Some(record) => {
                if let Some(guild) = index.by_id.get(&record.id) {
                    return Ok(Some(Arc::clone(guild)));
                }
                Ok(Some(self.load_guild(&mut index, record).await))
            }
            None => Ok(None),
        }
    }

    pub async fn all_guilds(&self) -> Result<Vec<Arc<Guild>>> {
        let mut index = self.registry.guilds.lock().await;
        let mut guilds = Vec::new();
        for record in self.store.get_all_guilds().await? {
            let guild = match index.by_id.get(&record.id) {
                Some(guild) => Arc::clone(guild),
                None => self.load_guild(&mut index, record).await,
            };
            guilds.push(guild);
        }
        Ok(guilds)
    }

    pub(crate) async fn register_guild_room(&self, guild: &Arc<Guild>, room_id: &RoomId) {
        self.registry
            .guilds
            .lock()
            .await
            .by_room
            .insert(room_id.clone(), Arc::clone(guild));
    }

    async fn load_portal(&self, index: &mut PortalIndex, record: PortalRecord) -> Arc<Portal> {
        let portal = Portal::new(
            record,
            Arc::clone(&self.store),
            self.config.portal_queue_capacity,
            self.self_ref.clone(),
        );
        if let Some(room_id) = portal.room_id().await {
            index.by_room.insert(room_id, Arc::clone(&portal));
        }
        index.by_key.insert(portal.key.clone(), Arc::clone(&portal));
        portal
    }

    pub async fn get_portal_by_key(&self, key: &PortalKey) -> Result<Arc<Portal>> {
        let mut index = self.registry.portals.lock().await;
        if let Some(portal) = index.by_key.get(key) {
            return Ok(Arc::clone(portal));
        }
        let record = match self.store.get_portal(key).await? {
            Some(record) => record,
            None => {
                let record = PortalRecord::new(key.clone());
                self.store
                    .insert_portal(&record)
                    .await
                    .with_context(|| format!("failed to create portal {key}"))?;
                debug!(portal = %key, "created portal");
                record
            }
        };
        Ok(self.load_portal(&mut index, record).await)
    }

    pub async fn get_portal_by_room(&self, room_id: &RoomId) -> Result<Option<Arc<Portal>>> {
        let mut index = self.registry.portals.lock().await;
        if let Some(portal) = index.by_room.get(room_id) {
            return Ok(Some(Arc::clone(portal)));
        }
        match self.store.get_portal_by_room(room_id).await? {
            Some(record) => {
                if let Some(portal) = index.by_key.get(&record.key) {
                    return Ok(Some(Arc::clone(portal)));
                }
                Ok(Some(self.load_portal(&mut index, record).await))
            }
            None => Ok(None),
        }
    }

    pub(crate) async fn register_portal_room(&self, portal: &Arc<Portal>, room_id: &RoomId) {
        self.registry
            .portals
            .lock()
            .await
            .by_room
            .insert(room_id.clone(), Arc::clone(portal));
    }

    async fn load_puppet(&self, index: &mut PuppetIndex, record: PuppetRecord) -> Arc<Puppet> {
        let mxid = self.config.format_puppet_mxid(&record.remote_id);
        let custom_mxid = record.custom_mxid.clone();
        let puppet = Arc::new(Puppet::new(record, mxid, Arc::clone(&self.store)));
        if let Some(custom_mxid) = custom_mxid {
            index.by_custom_mxid.insert(custom_mxid, Arc::clone(&puppet));
        }
        index.by_id.insert(puppet.id.clone(), Arc::clone(&puppet));
        puppet
    }

    pub async fn get_puppet_by_id(&self, remote_id: &RemoteUserId) -> Result<Arc<Puppet>> {
        let mut index = self.registry.puppets.lock().await;
        if let Some(puppet) = index.by_id.get(remote_id) {
            return Ok(Arc::clone(puppet));
        }
        let record = match self.store.get_puppet(remote_id).await? {
            Some(record) => record,
            None => {
                let record = PuppetRecord::new(remote_id.clone());
                self.store
                    .insert_puppet(&record)
                    .await
                    .with_context(|| format!("failed to create puppet {remote_id}"))?;
                record
            }
        };
        Ok(self.load_puppet(&mut index, record).await)
    }

    /// Resolves a ghost account back to its puppet.
    pub async fn get_puppet_by_mxid(&self, mxid: &MatrixUserId) -> Result<Option<Arc<Puppet>>> {
        match self.config.parse_puppet_mxid(mxid) {
            Some(remote_id) => self.get_puppet_by_id(&remote_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// Finds the puppet double-puppeted by a real federated account.
    pub async fn get_puppet_by_custom_mxid(&self, mxid: &MatrixUserId) -> Result<Option<Arc<Puppet>>> {
        let mut index = self.registry.puppets.lock().await;
        if let Some(puppet) = index.by_custom_mxid.get(mxid) {
            return Ok(Some(Arc::clone(puppet)));
        }
        match self.store.get_puppet_by_custom_mxid(mxid).await? {
            Some(record) => {
                if let Some(puppet) = index.by_id.get(&record.remote_id).cloned() {
                    // Loaded before the custom mxid was bound elsewhere.
                    puppet.reload().await?;
                    index.by_custom_mxid.insert(mxid.clone(), Arc::clone(&puppet));
                    return Ok(Some(puppet));
                }
                Ok(Some(self.load_puppet(&mut index, record).await))
            }
            None => Ok(None),
        }
    }

    pub async fn all_puppets_with_custom_mxid(&self) -> Result<Vec<Arc<Puppet>>> {
        let mut index = self.registry.puppets.lock().await;
        let mut puppets = Vec::new();
        for record in self.store.get_puppets_with_custom_mxid().await? {
            let puppet = match index.by_id.get(&record.remote_id) {
                Some(puppet) => Arc::clone(puppet),
                None => self.load_puppet(&mut index, record).await,
            };
            puppets.push(puppet);
        }
        Ok(puppets)
    }

    pub(crate) async fn reindex_puppet_custom_mxid(
        &self,
        puppet: &Arc<Puppet>,
        previous: Option<&MatrixUserId>,
        current: Option<&MatrixUserId>,
    ) {
        let mut index = self.registry.puppets.lock().await;
        if let Some(previous) = previous {
            index.by_custom_mxid.remove(previous);
        }
        if let Some(current) = current {
            index
                .by_custom_mxid
                .insert(current.clone(), Arc::clone(puppet));
        }
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
