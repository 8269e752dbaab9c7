use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use gateway::GatewaySession;
use serde::Serialize;
use shared::domain::{GuildId, MatrixUserId, RemoteUserId, RoomId};
use storage::{BridgeStore, GuildMembership, UserRecord};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{dispatch::SessionHandler, Bridge, SessionError};

/// A federated account that may link one remote account.
pub struct User {
    pub mxid: MatrixUserId,
    store: Arc<dyn BridgeStore>,
    pub(crate) record: Mutex<UserRecord>,
    /// Guild memberships of the linked remote account, keyed by guild.
    pub(crate) guilds: Mutex<HashMap<GuildId, GuildMembership>>,
    pub(crate) session: Mutex<Option<Arc<dyn GatewaySession>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStatus {
    pub mxid: MatrixUserId,
    pub remote_id: Option<RemoteUserId>,
    pub logged_in: bool,
    pub connected: bool,
    pub bridged_guilds: usize,
}

impl User {
    pub(crate) fn new(record: UserRecord, store: Arc<dyn BridgeStore>) -> Self {
        Self {
            mxid: record.mxid.clone(),
            store,
            record: Mutex::new(record),
            guilds: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
        }
    }

    pub async fn record(&self) -> UserRecord {
        self.record.lock().await.clone()
    }

    pub async fn remote_id(&self) -> Option<RemoteUserId> {
        self.record
            .lock()
            .await
            .remote_id
            .clone()
            .filter(|id| !id.is_empty())
    }

    pub async fn management_room(&self) -> Option<RoomId> {
        self.record.lock().await.management_room.clone()
    }

    pub async fn logged_in(&self) -> bool {
        self.record
            .lock()
            .await
            .token
            .as_deref()
            .is_some_and(|token| !token.is_empty())
    }

    pub async fn connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn save(&self) -> Result<()> {
        let record = self.record().await;
        self.store.update_user(&record).await
    }

    pub async fn reload(&self) -> Result<()> {
        if let Some(record) = self.store.get_user_by_mxid(&self.mxid).await? {
            *self.record.lock().await = record;
        }
        Ok(())
    }

    pub async fn guild_memberships(&self) -> Vec<GuildMembership> {
        let mut memberships: Vec<_> = self.guilds.lock().await.values().cloned().collect();
        memberships.sort_by(|a, b| a.guild_id.cmp(&b.guild_id));
        memberships
    }

    /// Replaces `guilds` with what the store holds for `owner`.
    pub(crate) async fn load_guilds(
        &self,
        guilds: &mut HashMap<GuildId, GuildMembership>,
        owner: &RemoteUserId,
    ) -> Result<()> {
        let stored = self.store.get_guild_memberships(owner).await?;
        guilds.clear();
        guilds.extend(
            stored
                .into_iter()
                .map(|membership| (membership.guild_id.clone(), membership)),
        );
        Ok(())
    }

    /// Events outside any guild always bridge; guild events only when the
    /// user enabled bridging for that guild.
    pub async fn should_bridge(&self, guild_id: Option<&GuildId>) -> bool {
        let Some(guild_id) = guild_id.filter(|id| !id.is_empty()) else {
            return true;
        };
        let bridged = self
            .guilds
            .lock()
            .await
            .get(guild_id)
            .is_some_and(|membership| membership.bridge);
        if !bridged {
            debug!(user = %self.mxid, %guild_id, "ignoring event for non-bridged guild");
        }
        bridged
    }

    pub async fn status(&self) -> UserStatus {
        let bridged_guilds = self
            .guilds
            .lock()
            .await
            .values()
            .filter(|membership| membership.bridge)
            .count();
        UserStatus {
            mxid: self.mxid.clone(),
            remote_id: self.remote_id().await,
            logged_in: self.logged_in().await,
            connected: self.connected().await,
            bridged_guilds,
        }
    }
}

impl Bridge {
    /// Stores `token` and opens a gateway session with it.
    pub async fn login(&self, user: &Arc<User>, token: &str) -> Result<(), SessionError> {
        if token.trim().is_empty() {
            return Err(SessionError::MissingToken);
        }
        user.record.lock().await.token = Some(token.trim().to_owned());
        user.save()
            .await
            .map_err(|source| SessionError::Store { source })?;
        self.connect(user).await
    }

    pub async fn connect(&self, user: &Arc<User>) -> Result<(), SessionError> {
        let mut session = user.session.lock().await;
        if session.is_some() {
            debug!(user = %user.mxid, "gateway session already open");
            return Ok(());
        }
        let token = user
            .record
            .lock()
            .await
            .token
            .clone()
            .filter(|token| !token.is_empty())
            .ok_or(SessionError::NotLoggedIn)?;

        debug!(user = %user.mxid, "connecting to gateway");
        let sink = Arc::new(SessionHandler::new(
            self.self_ref.clone(),
            Arc::downgrade(user),
        ));
        let live = self
            .connector
            .connect(&token, sink)
            .await
            .map_err(|source| SessionError::Gateway { source })?;
        *session = Some(live);
        info!(user = %user.mxid, "gateway session opened");
        Ok(())
    }

    /// Closes the session under the connect lock. The handle is dropped
    /// even when closing fails.
    pub async fn disconnect(&self, user: &Arc<User>) -> Result<(), SessionError> {
        let mut session = user.session.lock().await;
        let live = session.take().ok_or(SessionError::NotConnected)?;
        debug!(user = %user.mxid, "disconnecting from gateway");
        live.close()
            .await
            .map_err(|source| SessionError::Gateway { source })
    }

    /// Full sign-out: drops the double puppet, closes the session and
    /// forgets the token. A double-puppet failure is logged and skipped.
    pub async fn logout(&self, user: &Arc<User>) -> Result<(), SessionError> {
        let mut session = user.session.lock().await;
        let live = session.take().ok_or(SessionError::NotLoggedIn)?;

        if let Err(err) = self.logout_double_puppet(user).await {
            warn!(user = %user.mxid, error = %err, "failed to log out double puppet, continuing gateway logout");
        }

        let closed = live.close().await;
        user.record.lock().await.token = None;
        user.save()
            .await
            .map_err(|source| SessionError::Store { source })?;
        closed.map_err(|source| SessionError::Gateway { source })?;
        info!(user = %user.mxid, "logged out of gateway");
        Ok(())
    }

    /// Points `user` at `room_id`. A user who previously owned that room
    /// loses it.
    pub async fn set_management_room(&self, user: &Arc<User>, room_id: &RoomId) -> Result<()> {
        let mut rooms = self.registry.management_rooms.lock().await;

        if let Some(existing) = rooms.get(room_id).cloned() {
            if Arc::ptr_eq(&existing, user) {
                return Ok(());
            }
            let mut detached = existing.record().await;
            detached.management_room = None;
            self.store.update_user(&detached).await?;
            existing.record.lock().await.management_room = None;
            rooms.remove(room_id);
            debug!(room_id = %room_id, previous = %existing.mxid, "management room taken over");
        }

        let mut updated = user.record().await;
        let previous = updated.management_room.replace(room_id.clone());
        self.store.update_user(&updated).await?;
        user.record.lock().await.management_room = Some(room_id.clone());
        if let Some(previous) = previous {
            rooms.remove(&previous);
        }
        rooms.insert(room_id.clone(), Arc::clone(user));
        Ok(())
    }

    /// Flips the bridge flag of one of the user's guild memberships.
    /// Returns `false` when the user is not in that guild.
    pub async fn set_guild_bridging(
        &self,
        user: &Arc<User>,
        guild_id: &GuildId,
        enabled: bool,
    ) -> Result<bool> {
        let mut guilds = user.guilds.lock().await;
        let Some(current) = guilds.get(guild_id) else {
            return Ok(false);
        };
        if current.bridge != enabled {
            let mut updated = current.clone();
            updated.bridge = enabled;
            self.store.upsert_guild_membership(&updated).await?;
            guilds.insert(guild_id.clone(), updated);
            info!(user = %user.mxid, %guild_id, enabled, "guild bridging changed");
        }
        Ok(true)
    }
}

#[cfg(test)]
#[path = "tests/user_tests.rs"]
mod tests;
