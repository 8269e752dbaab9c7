use std::sync::{Arc, Weak};

use anyhow::Result;
use async_trait::async_trait;
use gateway::GatewayEventSink;
use shared::{
    domain::{ChannelId, GuildId, PortalKey, RemoteUserId},
    protocol::{GatewayEvent, GuildInfo, ReadySnapshot},
};
use storage::GuildMembership;
use tracing::{debug, info, warn};

use crate::{
    portal::{PortalEvent, PortalMessage},
    user::User,
    Bridge,
};

/// Sink handed to a gateway session. Holds weak references so a session
/// never keeps its user or the bridge alive.
pub(crate) struct SessionHandler {
    bridge: Weak<Bridge>,
    user: Weak<User>,
}

impl SessionHandler {
    pub(crate) fn new(bridge: Weak<Bridge>, user: Weak<User>) -> Self {
        Self { bridge, user }
    }
}

#[async_trait]
impl GatewayEventSink for SessionHandler {
    async fn dispatch(&self, event: GatewayEvent) {
        let (Some(bridge), Some(user)) = (self.bridge.upgrade(), self.user.upgrade()) else {
            debug!(event = event.kind(), "dropping gateway event for released session");
            return;
        };
        bridge.ingest(&user, event).await;
    }
}

impl Bridge {
    /// Routes one gateway event observed by `user`'s session. Handler
    /// failures are logged and never reach the session.
    pub async fn ingest(&self, user: &Arc<User>, event: GatewayEvent) {
        let kind = event.kind();
        let result = match event {
            GatewayEvent::Ready(snapshot) => self.handle_ready(user, snapshot).await,
            GatewayEvent::Connected => {
                debug!(user = %user.mxid, "gateway connected");
                self.try_automatic_double_puppeting(user).await;
                Ok(())
            }
            GatewayEvent::Disconnected => {
                debug!(user = %user.mxid, "gateway disconnected");
                Ok(())
            }
            GatewayEvent::GuildCreate(info) => self.handle_guild_create(user, info).await,
            GatewayEvent::GuildUpdate(info) => self.handle_guild_update(user, info).await,
            GatewayEvent::GuildDelete { guild_id } => {
                self.handle_guild_delete(user, &guild_id).await
            }
            GatewayEvent::ChannelCreate(info) => {
                if user.should_bridge(info.guild_id.as_ref()).await {
                    self.sync_portal_channel(user, &info, true).await
                } else {
                    Ok(())
                }
            }
            GatewayEvent::ChannelUpdate(info) => {
                if user.should_bridge(info.guild_id.as_ref()).await {
                    self.sync_portal_channel(user, &info, false).await
                } else {
                    Ok(())
                }
            }
            GatewayEvent::ChannelDelete(info) => {
                debug!(user = %user.mxid, channel_id = %info.id, "channel deleted");
                Ok(())
            }
            GatewayEvent::ChannelPinsUpdate(pins) => {
                debug!(user = %user.mxid, channel_id = %pins.channel_id, "channel pins updated");
                Ok(())
            }
            GatewayEvent::MessageCreate(message) => {
                let (guild_id, channel_id) = (message.guild_id.clone(), message.channel_id.clone());
                self.enqueue_portal_event(user, guild_id, channel_id, PortalEvent::MessageCreate(message))
                    .await
            }
            GatewayEvent::MessageUpdate(message) => {
                let (guild_id, channel_id) = (message.guild_id.clone(), message.channel_id.clone());
                self.enqueue_portal_event(user, guild_id, channel_id, PortalEvent::MessageUpdate(message))
                    .await
            }
            GatewayEvent::MessageDelete(deletion) => {
                let (guild_id, channel_id) =
                    (deletion.guild_id.clone(), deletion.channel_id.clone());
                self.enqueue_portal_event(user, guild_id, channel_id, PortalEvent::MessageDelete(deletion))
                    .await
            }
            GatewayEvent::ReactionAdd(reaction) => {
                let (guild_id, channel_id) =
                    (reaction.guild_id.clone(), reaction.channel_id.clone());
                self.enqueue_portal_event(user, guild_id, channel_id, PortalEvent::ReactionAdd(reaction))
                    .await
            }
            GatewayEvent::ReactionRemove(reaction) => {
                let (guild_id, channel_id) =
                    (reaction.guild_id.clone(), reaction.channel_id.clone());
                self.enqueue_portal_event(user, guild_id, channel_id, PortalEvent::ReactionRemove(reaction))
                    .await
            }
        };
        if let Err(err) = result {
            warn!(user = %user.mxid, event = kind, error = %err, "failed to handle gateway event");
        }
    }

    async fn enqueue_portal_event(
        &self,
        user: &Arc<User>,
        guild_id: Option<GuildId>,
        channel_id: ChannelId,
        event: PortalEvent,
    ) -> Result<()> {
        if !user.should_bridge(guild_id.as_ref()).await {
            return Ok(());
        }
        let Some(receiver) = user.remote_id().await else {
            debug!(user = %user.mxid, %channel_id, "ignoring portal event before ready");
            return Ok(());
        };
        let portal = self
            .get_portal_by_key(&PortalKey::new(channel_id, receiver))
            .await?;
        portal
            .enqueue(PortalMessage {
                user: Arc::clone(user),
                guild_id,
                event,
            })
            .await
    }

    fn new_membership(&self, owner: &RemoteUserId, info: &GuildInfo) -> GuildMembership {
        GuildMembership {
            owner_id: owner.clone(),
            guild_id: info.id.clone(),
            guild_name: if info.unavailable {
                String::new()
            } else {
                info.name.clone()
            },
            bridge: self.config.default_guild_bridging,
        }
    }

    /// Reconciles the user's guild memberships with the ready snapshot.
    /// Bridge flags of known guilds are kept as stored, guilds missing
    /// from the snapshot are pruned, and the cache is reloaded afterwards.
    async fn handle_ready(&self, user: &Arc<User>, snapshot: ReadySnapshot) -> Result<()> {
        let remote_id = snapshot.user.id.clone();
        info!(user = %user.mxid, %remote_id, guilds = snapshot.guilds.len(), "gateway session ready");
        self.register_user_remote_id(user, &remote_id).await?;

        let bridged: Vec<GuildInfo> = {
            let mut guilds = user.guilds.lock().await;
            // Flags may have been flipped in the store out of band.
            user.load_guilds(&mut guilds, &remote_id).await?;
            let mut current = Vec::with_capacity(snapshot.guilds.len());
            for info in &snapshot.guilds {
                current.push(info.id.clone());
                let membership = match guilds.get(&info.id) {
                    Some(existing) => {
                        let mut membership = existing.clone();
                        if !info.unavailable {
                            membership.guild_name = info.name.clone();
                        }
                        membership
                    }
                    None => self.new_membership(&remote_id, info),
                };
                self.store.upsert_guild_membership(&membership).await?;
                guilds.insert(info.id.clone(), membership);
            }
            let pruned = self
                .store
                .prune_guild_memberships(&remote_id, &current)
                .await?;
            if pruned > 0 {
                debug!(user = %user.mxid, pruned, "pruned stale guild memberships");
            }
            user.load_guilds(&mut guilds, &remote_id).await?;

            snapshot
                .guilds
                .iter()
                .filter(|info| {
                    !info.unavailable && guilds.get(&info.id).is_some_and(|m| m.bridge)
                })
                .cloned()
                .collect()
        };

        for info in &bridged {
            self.sync_guild(user, info).await;
        }
        Ok(())
    }

    async fn handle_guild_create(&self, user: &Arc<User>, info: GuildInfo) -> Result<()> {
        let Some(owner) = user.remote_id().await else {
            debug!(user = %user.mxid, guild_id = %info.id, "ignoring guild create before ready");
            return Ok(());
        };
        let bridge = {
            let mut guilds = user.guilds.lock().await;
            let membership = match guilds.get(&info.id) {
                Some(existing) => {
                    let mut membership = existing.clone();
                    if !info.unavailable {
                        membership.guild_name = info.name.clone();
                    }
                    membership
                }
                None => self.new_membership(&owner, &info),
            };
            self.store.upsert_guild_membership(&membership).await?;
            let bridge = membership.bridge;
            guilds.insert(info.id.clone(), membership);
            bridge
        };
        debug!(user = %user.mxid, guild_id = %info.id, bridge, "guild joined");
        if bridge && !info.unavailable {
            self.sync_guild(user, &info).await;
        }
        Ok(())
    }

    async fn handle_guild_update(&self, user: &Arc<User>, info: GuildInfo) -> Result<()> {
        if info.unavailable {
            return Ok(());
        }
        let bridge = {
            let mut guilds = user.guilds.lock().await;
            let Some(existing) = guilds.get(&info.id) else {
                debug!(user = %user.mxid, guild_id = %info.id, "ignoring update of unknown guild");
                return Ok(());
            };
            let bridge = existing.bridge;
            if existing.guild_name != info.name {
                let mut membership = existing.clone();
                membership.guild_name = info.name.clone();
                self.store.upsert_guild_membership(&membership).await?;
                guilds.insert(info.id.clone(), membership);
            }
            bridge
        };
        if bridge {
            self.sync_guild(user, &info).await;
        }
        Ok(())
    }

    /// Forgets the membership. The guild's Space is left alone since other
    /// users may still bridge it.
    async fn handle_guild_delete(&self, user: &Arc<User>, guild_id: &GuildId) -> Result<()> {
        let Some(owner) = user.remote_id().await else {
            return Ok(());
        };
        let mut guilds = user.guilds.lock().await;
        if guilds.remove(guild_id).is_some() {
            self.store.delete_guild_membership(&owner, guild_id).await?;
            debug!(user = %user.mxid, %guild_id, "left guild");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
