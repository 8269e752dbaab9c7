use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::{
    domain::{ContentUri, EventId, MatrixUserId, RoomId},
    protocol::MessageInfo,
};

use crate::config::BridgeConfig;

pub const EVENT_BRIDGE: &str = "m.bridge";
pub const EVENT_HALF_SHOT_BRIDGE: &str = "uk.half-shot.bridge";
pub const EVENT_ROOM_AVATAR: &str = "m.room.avatar";
pub const ACCOUNT_DATA_DIRECT_CHATS: &str = "m.direct";

/// Whose credentials a homeserver call is made with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Intent {
    Bot,
    Ghost(MatrixUserId),
    DoublePuppet {
        mxid: MatrixUserId,
        access_token: String,
    },
}

impl Intent {
    pub fn user_id(&self, config: &BridgeConfig) -> MatrixUserId {
        match self {
            Intent::Bot => config.bot_mxid(),
            Intent::Ghost(mxid) => mxid.clone(),
            Intent::DoublePuppet { mxid, .. } => mxid.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateEvent {
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

impl StateEvent {
    pub fn new(event_type: &str, state_key: &str, content: Value) -> Self {
        Self {
            event_type: event_type.to_owned(),
            state_key: state_key.to_owned(),
            content,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateRoomRequest {
    pub name: String,
    pub topic: String,
    pub is_space: bool,
    pub is_direct: bool,
    pub federate: bool,
    pub parent: Option<RoomId>,
    pub invite: Vec<MatrixUserId>,
    pub initial_state: Vec<StateEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InviteOptions {
    pub is_direct: bool,
    /// The invitee has a double puppet that joins right after.
    pub will_auto_accept: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeInfoSection {
    pub id: String,
    pub displayname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<ContentUri>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
}

/// Content of the `m.bridge` / `uk.half-shot.bridge` state events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeInfo {
    pub bridgebot: MatrixUserId,
    pub creator: MatrixUserId,
    pub protocol: BridgeInfoSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<BridgeInfoSection>,
    pub channel: BridgeInfoSection,
}

impl BridgeInfo {
    pub fn protocol_section(config: &BridgeConfig) -> BridgeInfoSection {
        BridgeInfoSection {
            id: config.protocol_id.clone(),
            displayname: config.protocol_name.clone(),
            avatar_url: config.bot_avatar.clone(),
            external_url: Some(config.protocol_url.clone()),
        }
    }

    /// Both bridge state events carrying the same content.
    pub fn state_events(&self, state_key: &str) -> Result<Vec<StateEvent>> {
        let content = serde_json::to_value(self)?;
        Ok(vec![
            StateEvent::new(EVENT_BRIDGE, state_key, content.clone()),
            StateEvent::new(EVENT_HALF_SHOT_BRIDGE, state_key, content),
        ])
    }
}

/// Homeserver operations the bridge needs. Implemented by the appservice
/// transport; tests use an in-memory fake.
#[async_trait]
pub trait MatrixClient: Send + Sync {
    async fn create_room(&self, intent: &Intent, request: CreateRoomRequest) -> Result<RoomId>;
    async fn set_room_name(&self, intent: &Intent, room_id: &RoomId, name: &str) -> Result<()>;
    async fn set_room_topic(&self, intent: &Intent, room_id: &RoomId, topic: &str)
        -> Result<()>;
    async fn set_room_avatar(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        url: Option<&ContentUri>,
    ) -> Result<()>;
    /// Fetches `source_url` and stores it in the homeserver media repository.
    async fn upload_avatar(&self, source_url: &str) -> Result<ContentUri>;
    async fn send_state_event(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        event: &StateEvent,
    ) -> Result<EventId>;
    async fn invite_user(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        user_id: &MatrixUserId,
        options: InviteOptions,
    ) -> Result<()>;
    async fn join_room(&self, intent: &Intent, room_id: &RoomId) -> Result<()>;
    async fn get_account_data(&self, intent: &Intent, event_type: &str) -> Result<Value>;
    async fn set_account_data(&self, intent: &Intent, event_type: &str, content: Value)
        -> Result<()>;
    async fn whoami(&self, intent: &Intent) -> Result<MatrixUserId>;
    async fn login_with_shared_secret(&self, user_id: &MatrixUserId, secret: &str)
        -> Result<String>;
    async fn logout(&self, intent: &Intent) -> Result<()>;
}

pub struct MissingMatrixClient;

fn homeserver_unavailable() -> anyhow::Error {
    anyhow!("homeserver client is not configured")
}

#[async_trait]
impl MatrixClient for MissingMatrixClient {
    async fn create_room(&self, _intent: &Intent, _request: CreateRoomRequest) -> Result<RoomId> {
        Err(homeserver_unavailable())
    }

    async fn set_room_name(&self, _intent: &Intent, _room_id: &RoomId, _name: &str) -> Result<()> {
        Err(homeserver_unavailable())
    }

    async fn set_room_topic(
        &self,
        _intent: &Intent,
        _room_id: &RoomId,
        _topic: &str,
    ) -> Result<()> {
        Err(homeserver_unavailable())
    }

    async fn set_room_avatar(
        &self,
        _intent: &Intent,
        _room_id: &RoomId,
        _url: Option<&ContentUri>,
    ) -> Result<()> {
        Err(homeserver_unavailable())
    }

    async fn upload_avatar(&self, _source_url: &str) -> Result<ContentUri> {
        Err(homeserver_unavailable())
    }

    async fn send_state_event(
        &self,
        _intent: &Intent,
        _room_id: &RoomId,
        _event: &StateEvent,
    ) -> Result<EventId> {
        Err(homeserver_unavailable())
    }

    async fn invite_user(
        &self,
        _intent: &Intent,
        _room_id: &RoomId,
        _user_id: &MatrixUserId,
        _options: InviteOptions,
    ) -> Result<()> {
        Err(homeserver_unavailable())
    }

    async fn join_room(&self, _intent: &Intent, _room_id: &RoomId) -> Result<()> {
        Err(homeserver_unavailable())
    }

    async fn get_account_data(&self, _intent: &Intent, _event_type: &str) -> Result<Value> {
        Err(homeserver_unavailable())
    }

    async fn set_account_data(
        &self,
        _intent: &Intent,
        _event_type: &str,
        _content: Value,
    ) -> Result<()> {
        Err(homeserver_unavailable())
    }

    async fn whoami(&self, _intent: &Intent) -> Result<MatrixUserId> {
        Err(homeserver_unavailable())
    }

    async fn login_with_shared_secret(
        &self,
        _user_id: &MatrixUserId,
        _secret: &str,
    ) -> Result<String> {
        Err(homeserver_unavailable())
    }

    async fn logout(&self, _intent: &Intent) -> Result<()> {
        Err(homeserver_unavailable())
    }
}

/// Converts remote message content into room events. Formatting and media
/// handling live behind this seam.
#[async_trait]
pub trait MessageRelay: Send + Sync {
    async fn relay_message(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        message: &MessageInfo,
    ) -> Result<EventId>;
    async fn relay_edit(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        target: &EventId,
        message: &MessageInfo,
    ) -> Result<EventId>;
    async fn relay_redaction(&self, intent: &Intent, room_id: &RoomId, target: &EventId)
        -> Result<()>;
    async fn relay_reaction(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        target: &EventId,
        emoji: &str,
    ) -> Result<EventId>;
}

pub struct MissingMessageRelay;

#[async_trait]
impl MessageRelay for MissingMessageRelay {
    async fn relay_message(
        &self,
        _intent: &Intent,
        _room_id: &RoomId,
        _message: &MessageInfo,
    ) -> Result<EventId> {
        Err(anyhow!("message relay is unavailable"))
    }

    async fn relay_edit(
        &self,
        _intent: &Intent,
        _room_id: &RoomId,
        _target: &EventId,
        _message: &MessageInfo,
    ) -> Result<EventId> {
        Err(anyhow!("message relay is unavailable"))
    }

    async fn relay_redaction(
        &self,
        _intent: &Intent,
        _room_id: &RoomId,
        _target: &EventId,
    ) -> Result<()> {
        Err(anyhow!("message relay is unavailable"))
    }

    async fn relay_reaction(
        &self,
        _intent: &Intent,
        _room_id: &RoomId,
        _target: &EventId,
        _emoji: &str,
    ) -> Result<EventId> {
        Err(anyhow!("message relay is unavailable"))
    }
}

/// The homeserver refuses invites for users that already joined. That is
/// success for the bridge, so it is the one invite failure we swallow.
pub fn is_already_in_room_error(err: &anyhow::Error) -> bool {
    format!("{err:#}")
        .to_ascii_lowercase()
        .contains("is already in the room")
}
