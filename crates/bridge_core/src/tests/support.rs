use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use gateway::{GatewayConnector, GatewayEventSink, GatewaySession};
use serde_json::Value;
use shared::{
    domain::{
        ChannelId, ContentUri, EventId, GuildId, MatrixUserId, MessageId, RemoteUserId, RoomId,
    },
    protocol::{GatewayEvent, GuildInfo, MessageInfo, ReadySnapshot, RemoteUser},
};
use storage::Storage;
use tokio::sync::Mutex;

use crate::{
    matrix::{CreateRoomRequest, InviteOptions, StateEvent},
    Bridge, BridgeConfig, Intent, MatrixClient, MessageRelay, User,
};

#[derive(Debug, Clone, PartialEq)]
pub enum MatrixCall {
    CreateRoom(CreateRoomRequest),
    SetRoomName {
        room_id: RoomId,
        name: String,
    },
    SetRoomTopic {
        room_id: RoomId,
        topic: String,
    },
    SetRoomAvatar {
        room_id: RoomId,
        url: Option<ContentUri>,
    },
    UploadAvatar(String),
    SendState {
        room_id: RoomId,
        event_type: String,
        state_key: String,
    },
    Invite {
        room_id: RoomId,
        user_id: MatrixUserId,
        options: InviteOptions,
    },
    Join {
        intent: Intent,
        room_id: RoomId,
    },
    SetAccountData {
        event_type: String,
        content: Value,
    },
    Whoami(Intent),
    SharedSecretLogin(MatrixUserId),
    Logout(Intent),
}

#[derive(Default)]
pub struct FakeMatrix {
    pub calls: Mutex<Vec<MatrixCall>>,
    pub fail_room_name: AtomicBool,
    pub fail_room_avatar: AtomicBool,
    pub fail_create_room: AtomicBool,
    pub fail_logout: AtomicBool,
    pub invite_error: Mutex<Option<String>>,
    pub account_data: Mutex<HashMap<String, Value>>,
    pub create_room_delay_ms: AtomicU64,
    rooms_created: AtomicUsize,
}

impl FakeMatrix {
    async fn record(&self, call: MatrixCall) {
        self.calls.lock().await.push(call);
    }

    pub async fn calls(&self) -> Vec<MatrixCall> {
        self.calls.lock().await.clone()
    }

    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    pub async fn created_rooms(&self) -> Vec<CreateRoomRequest> {
        self.calls()
            .await
            .into_iter()
            .filter_map(|call| match call {
                MatrixCall::CreateRoom(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub async fn count(&self, matches: impl Fn(&MatrixCall) -> bool) -> usize {
        self.calls.lock().await.iter().filter(|call| matches(call)).count()
    }
}

#[async_trait]
impl MatrixClient for FakeMatrix {
    async fn create_room(&self, _intent: &Intent, request: CreateRoomRequest) -> Result<RoomId> {
        let delay = self.create_room_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.record(MatrixCall::CreateRoom(request)).await;
        if self.fail_create_room.load(Ordering::SeqCst) {
            return Err(anyhow!("M_UNKNOWN: room creation failed"));
        }
        let n = self.rooms_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RoomId::new(format!("!room{n}:example.org")))
    }

    async fn set_room_name(&self, _intent: &Intent, room_id: &RoomId, name: &str) -> Result<()> {
        self.record(MatrixCall::SetRoomName {
            room_id: room_id.clone(),
            name: name.to_owned(),
        })
        .await;
        if self.fail_room_name.load(Ordering::SeqCst) {
            return Err(anyhow!("M_FORBIDDEN: cannot rename"));
        }
        Ok(())
    }

    async fn set_room_topic(&self, _intent: &Intent, room_id: &RoomId, topic: &str) -> Result<()> {
        self.record(MatrixCall::SetRoomTopic {
            room_id: room_id.clone(),
            topic: topic.to_owned(),
        })
        .await;
        Ok(())
    }

    async fn set_room_avatar(
        &self,
        _intent: &Intent,
        room_id: &RoomId,
        url: Option<&ContentUri>,
    ) -> Result<()> {
        self.record(MatrixCall::SetRoomAvatar {
            room_id: room_id.clone(),
            url: url.cloned(),
        })
        .await;
        if self.fail_room_avatar.load(Ordering::SeqCst) {
            return Err(anyhow!("M_FORBIDDEN: cannot set avatar"));
        }
        Ok(())
    }

    async fn upload_avatar(&self, source_url: &str) -> Result<ContentUri> {
        self.record(MatrixCall::UploadAvatar(source_url.to_owned()))
            .await;
        let name = source_url.rsplit('/').next().unwrap_or(source_url);
        Ok(ContentUri::new(format!("mxc://example.org/{name}")))
    }

    async fn send_state_event(
        &self,
        _intent: &Intent,
        room_id: &RoomId,
        event: &StateEvent,
    ) -> Result<EventId> {
        self.record(MatrixCall::SendState {
            room_id: room_id.clone(),
            event_type: event.event_type.clone(),
            state_key: event.state_key.clone(),
        })
        .await;
        Ok(EventId::from("$state"))
    }

    async fn invite_user(
        &self,
        _intent: &Intent,
        room_id: &RoomId,
        user_id: &MatrixUserId,
        options: InviteOptions,
    ) -> Result<()> {
        self.record(MatrixCall::Invite {
            room_id: room_id.clone(),
            user_id: user_id.clone(),
            options,
        })
        .await;
        match self.invite_error.lock().await.clone() {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }

    async fn join_room(&self, intent: &Intent, room_id: &RoomId) -> Result<()> {
        self.record(MatrixCall::Join {
            intent: intent.clone(),
            room_id: room_id.clone(),
        })
        .await;
        Ok(())
    }

    async fn get_account_data(&self, _intent: &Intent, event_type: &str) -> Result<Value> {
        Ok(self
            .account_data
            .lock()
            .await
            .get(event_type)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn set_account_data(&self, _intent: &Intent, event_type: &str, content: Value) -> Result<()> {
        self.record(MatrixCall::SetAccountData {
            event_type: event_type.to_owned(),
            content: content.clone(),
        })
        .await;
        self.account_data
            .lock()
            .await
            .insert(event_type.to_owned(), content);
        Ok(())
    }

    async fn whoami(&self, intent: &Intent) -> Result<MatrixUserId> {
        self.record(MatrixCall::Whoami(intent.clone())).await;
        match intent {
            Intent::Bot => Ok(MatrixUserId::from("@discordbot:example.org")),
            Intent::Ghost(mxid) => Ok(mxid.clone()),
            Intent::DoublePuppet { access_token, .. } if access_token.starts_with("expired") => {
                Err(anyhow!("M_UNKNOWN_TOKEN: invalid access token"))
            }
            Intent::DoublePuppet { access_token, .. } if access_token.starts_with("stolen") => {
                Ok(MatrixUserId::from("@mallory:example.org"))
            }
            Intent::DoublePuppet { mxid, .. } => Ok(mxid.clone()),
        }
    }

    async fn login_with_shared_secret(&self, user_id: &MatrixUserId, _secret: &str) -> Result<String> {
        self.record(MatrixCall::SharedSecretLogin(user_id.clone()))
            .await;
        Ok(format!("token-{}", user_id.localpart().unwrap_or_default()))
    }

    async fn logout(&self, intent: &Intent) -> Result<()> {
        self.record(MatrixCall::Logout(intent.clone())).await;
        if self.fail_logout.load(Ordering::SeqCst) {
            return Err(anyhow!("M_UNKNOWN: logout failed"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayCall {
    Message {
        intent: Intent,
        room_id: RoomId,
        message_id: MessageId,
        content: String,
    },
    Edit {
        intent: Intent,
        room_id: RoomId,
        target: EventId,
        content: String,
    },
    Redaction {
        intent: Intent,
        room_id: RoomId,
        target: EventId,
    },
    Reaction {
        intent: Intent,
        room_id: RoomId,
        target: EventId,
        emoji: String,
    },
}

#[derive(Default)]
pub struct FakeRelay {
    pub calls: Mutex<Vec<RelayCall>>,
    pub rejected_messages: Mutex<Vec<MessageId>>,
    next_event: AtomicUsize,
}

impl FakeRelay {
    fn next_event_id(&self) -> EventId {
        let n = self.next_event.fetch_add(1, Ordering::SeqCst) + 1;
        EventId::new(format!("$event{n}"))
    }

    pub async fn calls(&self) -> Vec<RelayCall> {
        self.calls.lock().await.clone()
    }

    /// Polls until at least `count` calls were relayed.
    pub async fn wait_for_calls(&self, count: usize) -> Vec<RelayCall> {
        for _ in 0..300 {
            {
                let calls = self.calls.lock().await;
                if calls.len() >= count {
                    return calls.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.calls().await
    }
}

#[async_trait]
impl MessageRelay for FakeRelay {
    async fn relay_message(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        message: &MessageInfo,
    ) -> Result<EventId> {
        if self.rejected_messages.lock().await.contains(&message.id) {
            return Err(anyhow!("relay rejected message {}", message.id));
        }
        self.calls.lock().await.push(RelayCall::Message {
            intent: intent.clone(),
            room_id: room_id.clone(),
            message_id: message.id.clone(),
            content: message.content.clone(),
        });
        Ok(self.next_event_id())
    }

    async fn relay_edit(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        target: &EventId,
        message: &MessageInfo,
    ) -> Result<EventId> {
        self.calls.lock().await.push(RelayCall::Edit {
            intent: intent.clone(),
            room_id: room_id.clone(),
            target: target.clone(),
            content: message.content.clone(),
        });
        Ok(self.next_event_id())
    }

    async fn relay_redaction(&self, intent: &Intent, room_id: &RoomId, target: &EventId) -> Result<()> {
        self.calls.lock().await.push(RelayCall::Redaction {
            intent: intent.clone(),
            room_id: room_id.clone(),
            target: target.clone(),
        });
        Ok(())
    }

    async fn relay_reaction(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        target: &EventId,
        emoji: &str,
    ) -> Result<EventId> {
        self.calls.lock().await.push(RelayCall::Reaction {
            intent: intent.clone(),
            room_id: room_id.clone(),
            target: target.clone(),
            emoji: emoji.to_owned(),
        });
        Ok(self.next_event_id())
    }
}

#[derive(Default)]
pub struct FakeSession {
    pub closed: AtomicBool,
    fail_close: bool,
}

#[async_trait]
impl GatewaySession for FakeSession {
    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(anyhow!("websocket already gone"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeConnector {
    pub tokens: Mutex<Vec<String>>,
    pub sinks: Mutex<Vec<Arc<dyn GatewayEventSink>>>,
    pub sessions: Mutex<Vec<Arc<FakeSession>>>,
    pub fail_connect: AtomicBool,
    pub fail_close: AtomicBool,
}

#[async_trait]
impl GatewayConnector for FakeConnector {
    async fn connect(
        &self,
        token: &str,
        sink: Arc<dyn GatewayEventSink>,
    ) -> Result<Arc<dyn GatewaySession>> {
        self.tokens.lock().await.push(token.to_owned());
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(anyhow!("4004: authentication failed"));
        }
        self.sinks.lock().await.push(sink);
        let session = Arc::new(FakeSession {
            closed: AtomicBool::new(false),
            fail_close: self.fail_close.load(Ordering::SeqCst),
        });
        self.sessions.lock().await.push(Arc::clone(&session));
        Ok(session)
    }
}

pub struct Harness {
    pub bridge: Arc<Bridge>,
    pub storage: Storage,
    pub matrix: Arc<FakeMatrix>,
    pub relay: Arc<FakeRelay>,
    pub connector: Arc<FakeConnector>,
}

pub fn test_config() -> BridgeConfig {
    BridgeConfig {
        homeserver_domain: "example.org".to_owned(),
        sync_direct_chat_list: true,
        ..BridgeConfig::default()
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(config: BridgeConfig) -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let matrix = Arc::new(FakeMatrix::default());
    let relay = Arc::new(FakeRelay::default());
    let connector = Arc::new(FakeConnector::default());
    let bridge = Bridge::new_with_dependencies(
        config,
        Arc::new(storage.clone()),
        connector.clone(),
        matrix.clone(),
        relay.clone(),
    );
    Harness {
        bridge,
        storage,
        matrix,
        relay,
        connector,
    }
}

pub fn guild(id: &str, name: &str, icon: Option<&str>) -> GuildInfo {
    GuildInfo {
        id: GuildId::from(id),
        name: name.to_owned(),
        icon: icon.map(str::to_owned),
        unavailable: false,
    }
}

pub fn remote_user(id: &str) -> RemoteUser {
    RemoteUser {
        id: RemoteUserId::from(id),
        username: format!("user{id}"),
        avatar: None,
    }
}

pub fn ready(remote_id: &str, guilds: Vec<GuildInfo>) -> GatewayEvent {
    GatewayEvent::Ready(ReadySnapshot {
        user: remote_user(remote_id),
        guilds,
    })
}

pub fn message(id: &str, channel: &str, guild: Option<&str>, author: &str, content: &str) -> MessageInfo {
    MessageInfo {
        id: MessageId::from(id),
        channel_id: ChannelId::from(channel),
        guild_id: guild.map(GuildId::from),
        author: remote_user(author),
        content: content.to_owned(),
        timestamp: Utc::now(),
    }
}

impl Harness {
    pub async fn user(&self, mxid: &str) -> Arc<User> {
        self.bridge
            .get_user_by_mxid(&MatrixUserId::from(mxid))
            .await
            .expect("user lookup")
            .expect("real account")
    }

    /// A user whose gateway session reported ready with `guilds`.
    pub async fn ready_user(&self, mxid: &str, remote_id: &str, guilds: Vec<GuildInfo>) -> Arc<User> {
        let user = self.user(mxid).await;
        self.bridge.ingest(&user, ready(remote_id, guilds)).await;
        user
    }
}
