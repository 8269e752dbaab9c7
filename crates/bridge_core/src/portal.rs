use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{ChannelKind, GuildId, PortalKey, RemoteUserId, RoomId},
    protocol::{ChannelInfo, MessageDeletion, MessageInfo, ReactionInfo},
};
use storage::{BridgeStore, MessageRecord, PortalRecord, ReactionRecord};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    matrix::{BridgeInfo, BridgeInfoSection, CreateRoomRequest, Intent},
    membership::DirectChats,
    queue::{OrderedQueue, QueueConsumer},
    user::User,
    Bridge,
};

#[derive(Debug, Clone)]
pub enum PortalEvent {
    MessageCreate(MessageInfo),
    MessageUpdate(MessageInfo),
    MessageDelete(MessageDeletion),
    ReactionAdd(ReactionInfo),
    ReactionRemove(ReactionInfo),
}

impl PortalEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PortalEvent::MessageCreate(_) => "message_create",
            PortalEvent::MessageUpdate(_) => "message_update",
            PortalEvent::MessageDelete(_) => "message_delete",
            PortalEvent::ReactionAdd(_) => "reaction_add",
            PortalEvent::ReactionRemove(_) => "reaction_remove",
        }
    }
}

/// One queued unit of work: the event plus the user whose session saw it.
pub struct PortalMessage {
    pub user: Arc<User>,
    pub guild_id: Option<GuildId>,
    pub event: PortalEvent,
}

/// A remote channel as seen by one receiving account, mirrored into a room.
pub struct Portal {
    pub key: PortalKey,
    store: Arc<dyn BridgeStore>,
    pub(crate) record: Mutex<PortalRecord>,
    room_create_lock: Mutex<()>,
    queue: OrderedQueue<PortalMessage>,
}

struct PortalConsumer {
    bridge: Weak<Bridge>,
    portal: Weak<Portal>,
}

#[async_trait]
impl QueueConsumer<PortalMessage> for PortalConsumer {
    async fn consume(&self, message: PortalMessage) {
        let (Some(bridge), Some(portal)) = (self.bridge.upgrade(), self.portal.upgrade()) else {
            return;
        };
        bridge.handle_portal_message(&portal, message).await;
    }
}

impl Portal {
    /// Builds the portal and spawns the consumer for its event queue.
    pub(crate) fn new(
        record: PortalRecord,
        store: Arc<dyn BridgeStore>,
        queue_capacity: usize,
        bridge: Weak<Bridge>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|portal| {
            let consumer = Arc::new(PortalConsumer {
                bridge,
                portal: portal.clone(),
            });
            Self {
                key: record.key.clone(),
                store,
                queue: OrderedQueue::spawn(record.key.to_string(), queue_capacity, consumer),
                record: Mutex::new(record),
                room_create_lock: Mutex::new(()),
            }
        })
    }

    pub async fn record(&self) -> PortalRecord {
        self.record.lock().await.clone()
    }

    pub async fn room_id(&self) -> Option<RoomId> {
        self.record.lock().await.room_id.clone()
    }

    pub async fn save(&self) -> Result<()> {
        let record = self.record().await;
        self.store.update_portal(&record).await
    }

    pub async fn reload(&self) -> Result<()> {
        if let Some(record) = self.store.get_portal(&self.key).await? {
            *self.record.lock().await = record;
        }
        Ok(())
    }

    /// Waits while the queue is full.
    pub async fn enqueue(&self, message: PortalMessage) -> Result<()> {
        self.queue
            .push(message)
            .await
            .with_context(|| format!("portal {} stopped accepting events", self.key))
    }

    /// A guild-less channel that was never described and first shows up
    /// through a message is a one-to-one chat with that message's author.
    async fn adopt_direct_chat(&self, author: &RemoteUserId) -> Result<()> {
        let mut updated = self.record().await;
        if updated.room_id.is_some()
            || updated.guild_id.is_some()
            || updated.kind != ChannelKind::GuildText
        {
            return Ok(());
        }
        updated.kind = ChannelKind::Dm;
        if !author.is_empty() && *author != updated.key.receiver {
            updated.dm_user = Some(author.clone());
        }
        self.store
            .update_portal(&updated)
            .await
            .with_context(|| format!("failed to save direct chat portal {}", self.key))?;
        *self.record.lock().await = updated;
        Ok(())
    }

    /// Copies channel metadata into the record. Returns whether the name or
    /// topic changed.
    async fn apply_channel_info(&self, info: &ChannelInfo) -> (bool, bool) {
        let mut record = self.record.lock().await;
        if record.guild_id.is_none() {
            record.guild_id = info.guild_id.clone().filter(|id| !id.is_empty());
        }
        record.kind = info.kind;
        if info.kind.is_direct() && record.dm_user.is_none() {
            let receiver = record.key.receiver.clone();
            record.dm_user = info
                .recipients
                .iter()
                .map(|recipient| recipient.id.clone())
                .find(|id| !id.is_empty() && *id != receiver);
        }
        let name_changed = record.name != info.name;
        let topic_changed = record.topic != info.topic;
        record.name = info.name.clone();
        record.topic = info.topic.clone();
        (name_changed, topic_changed)
    }
}

impl Bridge {
    /// Creates the portal's room at most once. Guild channels are placed
    /// under the guild Space, one-to-one chats land in the direct chat list.
    pub async fn create_portal_room(&self, portal: &Arc<Portal>, user: &Arc<User>) -> Result<RoomId> {
        let _creating = portal.room_create_lock.lock().await;
        if let Some(room_id) = portal.room_id().await {
            return Ok(room_id);
        }
        let record = portal.record().await;
        info!(portal = %portal.key, kind = record.kind.as_str(), "creating room for portal");

        let guild = match &record.guild_id {
            Some(guild_id) => self.get_guild_by_id(guild_id, false).await?,
            None => None,
        };
        let (parent, network) = match &guild {
            Some(guild) => {
                let guild_record = guild.record().await;
                let network = BridgeInfoSection {
                    id: guild.id.to_string(),
                    displayname: guild_record.name,
                    avatar_url: guild_record.avatar_url,
                    external_url: None,
                };
                (guild_record.room_id, Some(network))
            }
            None => (None, None),
        };
        let is_direct = record.kind.is_direct();
        let state_key = self
            .config
            .portal_bridge_state_key(record.guild_id.as_ref(), &record.key.channel_id);
        let bridge_info = BridgeInfo {
            bridgebot: self.config.bot_mxid(),
            creator: self.config.bot_mxid(),
            protocol: BridgeInfo::protocol_section(&self.config),
            network,
            channel: BridgeInfoSection {
                id: record.key.channel_id.to_string(),
                displayname: record.name.clone(),
                avatar_url: None,
                external_url: None,
            },
        };

        let request = CreateRoomRequest {
            name: record.name.clone(),
            topic: record.topic.clone(),
            is_space: false,
            is_direct,
            federate: self.config.federate_rooms,
            parent,
            invite: Vec::new(),
            initial_state: bridge_info.state_events(&state_key)?,
        };
        let room_id = self
            .matrix
            .create_room(&Intent::Bot, request)
            .await
            .with_context(|| format!("failed to create room for portal {}", portal.key))?;

        portal.record.lock().await.room_id = Some(room_id.clone());
        if let Err(err) = portal.save().await {
            portal.record.lock().await.room_id = None;
            return Err(err.context(format!("failed to save room for portal {}", portal.key)));
        }
        self.register_portal_room(portal, &room_id).await;
        info!(portal = %portal.key, %room_id, "portal room created");

        self.ensure_invited(user, &Intent::Bot, &room_id, is_direct)
            .await;

        if is_direct {
            if let Some(dm_user) = &record.dm_user {
                let ghost = self.config.format_puppet_mxid(dm_user);
                if let Err(err) = self
                    .ensure_joined(&Intent::Ghost(ghost.clone()), &room_id, false)
                    .await
                {
                    warn!(portal = %portal.key, error = %err, "failed to join direct chat ghost");
                }
                let chats = DirectChats::from([(ghost, vec![room_id.clone()])]);
                self.update_direct_chats(user, Some(chats)).await;
            }
        }
        Ok(room_id)
    }

    pub(crate) async fn sync_portal_channel(
        &self,
        user: &Arc<User>,
        info: &ChannelInfo,
        create: bool,
    ) -> Result<()> {
        let Some(receiver) = user.remote_id().await else {
            debug!(user = %user.mxid, channel_id = %info.id, "ignoring channel event before ready");
            return Ok(());
        };
        let portal = self
            .get_portal_by_key(&PortalKey::new(info.id.clone(), receiver))
            .await?;
        let (name_changed, topic_changed) = portal.apply_channel_info(info).await;
        portal.save().await?;

        let Some(room_id) = portal.room_id().await else {
            if create {
                self.create_portal_room(&portal, user).await?;
            }
            return Ok(());
        };
        if name_changed && info.kind != ChannelKind::Dm {
            if let Err(err) = self
                .matrix
                .set_room_name(&Intent::Bot, &room_id, &info.name)
                .await
            {
                warn!(portal = %portal.key, %room_id, error = %err, "failed to update room name");
            }
        }
        if topic_changed {
            if let Err(err) = self
                .matrix
                .set_room_topic(&Intent::Bot, &room_id, &info.topic)
                .await
            {
                warn!(portal = %portal.key, %room_id, error = %err, "failed to update room topic");
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_portal_message(&self, portal: &Arc<Portal>, message: PortalMessage) {
        let kind = message.event.kind();
        if let Err(err) = self.apply_portal_event(portal, message).await {
            warn!(portal = %portal.key, event = kind, error = %err, "failed to bridge portal event");
        }
    }

    async fn apply_portal_event(&self, portal: &Arc<Portal>, message: PortalMessage) -> Result<()> {
        let PortalMessage {
            user,
            guild_id,
            event,
        } = message;
        if let Some(guild_id) = guild_id.filter(|id| !id.is_empty()) {
            let adopted = {
                let mut record = portal.record.lock().await;
                if record.guild_id.is_none() {
                    record.guild_id = Some(guild_id);
                    true
                } else {
                    false
                }
            };
            if adopted {
                portal.save().await?;
            }
        }
        match event {
            PortalEvent::MessageCreate(message) => {
                self.bridge_message_create(portal, &user, message).await
            }
            PortalEvent::MessageUpdate(message) => self.bridge_message_update(portal, message).await,
            PortalEvent::MessageDelete(deletion) => {
                self.bridge_message_delete(portal, deletion).await
            }
            PortalEvent::ReactionAdd(reaction) => self.bridge_reaction_add(portal, reaction).await,
            PortalEvent::ReactionRemove(reaction) => {
                self.bridge_reaction_remove(portal, reaction).await
            }
        }
    }

    /// The double puppet of `sender` when active, otherwise their ghost,
    /// joined to `room_id` either way.
    async fn sender_intent(&self, sender: &RemoteUserId, room_id: &RoomId) -> Result<Intent> {
        let puppet = self.get_puppet_by_id(sender).await?;
        let intent = match puppet.custom_intent().await {
            Some(intent) => intent,
            None => puppet.ghost_intent(),
        };
        self.ensure_joined(&intent, room_id, false).await?;
        Ok(intent)
    }

    async fn bridge_message_create(
        &self,
        portal: &Arc<Portal>,
        user: &Arc<User>,
        message: MessageInfo,
    ) -> Result<()> {
        if self
            .store
            .get_message(&portal.key, &message.id)
            .await?
            .is_some()
        {
            debug!(portal = %portal.key, message_id = %message.id, "ignoring duplicate message");
            return Ok(());
        }
        let room_id = match portal.room_id().await {
            Some(room_id) => room_id,
            None => {
                if message.guild_id.as_ref().map_or(true, |id| id.is_empty()) {
                    portal.adopt_direct_chat(&message.author.id).await?;
                }
                self.create_portal_room(portal, user).await?
            }
        };
        let intent = self.sender_intent(&message.author.id, &room_id).await?;
        let event_id = self
            .relay
            .relay_message(&intent, &room_id, &message)
            .await
            .with_context(|| format!("failed to relay message {}", message.id))?;
        self.store
            .insert_message(&MessageRecord {
                key: portal.key.clone(),
                remote_id: message.id.clone(),
                sender: message.author.id.clone(),
                room_id,
                event_id: event_id.clone(),
            })
            .await?;
        debug!(portal = %portal.key, message_id = %message.id, %event_id, "message bridged");
        Ok(())
    }

    async fn bridge_message_update(&self, portal: &Arc<Portal>, message: MessageInfo) -> Result<()> {
        let Some(existing) = self.store.get_message(&portal.key, &message.id).await? else {
            debug!(portal = %portal.key, message_id = %message.id, "ignoring edit of unknown message");
            return Ok(());
        };
        let intent = self
            .sender_intent(&message.author.id, &existing.room_id)
            .await?;
        self.relay
            .relay_edit(&intent, &existing.room_id, &existing.event_id, &message)
            .await
            .with_context(|| format!("failed to relay edit of message {}", message.id))?;
        Ok(())
    }

    async fn bridge_message_delete(&self, portal: &Arc<Portal>, deletion: MessageDeletion) -> Result<()> {
        let Some(existing) = self.store.get_message(&portal.key, &deletion.id).await? else {
            debug!(portal = %portal.key, message_id = %deletion.id, "ignoring deletion of unknown message");
            return Ok(());
        };
        self.relay
            .relay_redaction(&Intent::Bot, &existing.room_id, &existing.event_id)
            .await
            .with_context(|| format!("failed to redact message {}", deletion.id))?;
        self.store.delete_message(&portal.key, &deletion.id).await
    }

    async fn bridge_reaction_add(&self, portal: &Arc<Portal>, reaction: ReactionInfo) -> Result<()> {
        let Some(target) = self
            .store
            .get_message(&portal.key, &reaction.message_id)
            .await?
        else {
            debug!(portal = %portal.key, message_id = %reaction.message_id, "ignoring reaction to unknown message");
            return Ok(());
        };
        if self
            .store
            .get_reaction(
                &portal.key,
                &reaction.message_id,
                &reaction.user_id,
                &reaction.emoji,
            )
            .await?
            .is_some()
        {
            debug!(portal = %portal.key, message_id = %reaction.message_id, "ignoring duplicate reaction");
            return Ok(());
        }
        let intent = self.sender_intent(&reaction.user_id, &target.room_id).await?;
        let event_id = self
            .relay
            .relay_reaction(&intent, &target.room_id, &target.event_id, &reaction.emoji)
            .await
            .context("failed to relay reaction")?;
        self.store
            .insert_reaction(&ReactionRecord {
                key: portal.key.clone(),
                message_id: reaction.message_id,
                sender: reaction.user_id,
                emoji: reaction.emoji,
                event_id,
            })
            .await
    }

    async fn bridge_reaction_remove(&self, portal: &Arc<Portal>, reaction: ReactionInfo) -> Result<()> {
        let Some(existing) = self
            .store
            .get_reaction(
                &portal.key,
                &reaction.message_id,
                &reaction.user_id,
                &reaction.emoji,
            )
            .await?
        else {
            debug!(portal = %portal.key, message_id = %reaction.message_id, "ignoring removal of unknown reaction");
            return Ok(());
        };
        let Some(target) = self
            .store
            .get_message(&portal.key, &reaction.message_id)
            .await?
        else {
            return self.store.delete_reaction(&existing).await;
        };
        let intent = self.sender_intent(&reaction.user_id, &target.room_id).await?;
        self.relay
            .relay_redaction(&intent, &target.room_id, &existing.event_id)
            .await
            .context("failed to redact reaction")?;
        self.store.delete_reaction(&existing).await
    }
}

#[cfg(test)]
#[path = "tests/portal_tests.rs"]
mod tests;
