use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use anyhow::{Context, Result};
use shared::domain::{MatrixUserId, Membership, RoomId};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{
    is_already_in_room_error,
    matrix::{Intent, InviteOptions, ACCOUNT_DATA_DIRECT_CHATS},
    user::User,
    Bridge,
};

/// Content of the `m.direct` account data event.
pub type DirectChats = BTreeMap<MatrixUserId, Vec<RoomId>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectChatMode {
    /// Incremental update, existing ghost entries survive.
    Merge,
    /// Full resync, ghost entries become exactly what the bridge computed.
    Replace,
}

/// Combines the homeserver's direct chat list with the bridge's view.
/// Entries of non-bridge accounts always survive; ghost entries the
/// bridge did not compute survive only a merge.
pub fn merge_direct_chats(
    existing: DirectChats,
    mut desired: DirectChats,
    mode: DirectChatMode,
    is_bridge_account: impl Fn(&MatrixUserId) -> bool,
) -> DirectChats {
    for (user_id, rooms) in existing {
        if !is_bridge_account(&user_id) {
            desired.insert(user_id, rooms);
        } else if mode == DirectChatMode::Merge {
            desired.entry(user_id).or_insert(rooms);
        }
    }
    desired
}

/// Last membership the bridge observed or caused, per room and account.
#[derive(Default)]
pub struct MembershipCache {
    members: RwLock<HashMap<(RoomId, MatrixUserId), Membership>>,
}

impl MembershipCache {
    pub async fn get(&self, room_id: &RoomId, user_id: &MatrixUserId) -> Option<Membership> {
        self.members
            .read()
            .await
            .get(&(room_id.clone(), user_id.clone()))
            .copied()
    }

    pub async fn set(&self, room_id: &RoomId, user_id: &MatrixUserId, membership: Membership) {
        self.members
            .write()
            .await
            .insert((room_id.clone(), user_id.clone()), membership);
    }

    pub async fn is_joined(&self, room_id: &RoomId, user_id: &MatrixUserId) -> bool {
        self.get(room_id, user_id).await == Some(Membership::Join)
    }
}

impl Bridge {
    /// Invites `user` into `room_id` via `intent` and, when the user has a
    /// double puppet, joins on their behalf. Failures are logged; the
    /// return value says whether the user can reach the room.
    pub async fn ensure_invited(
        &self,
        user: &Arc<User>,
        intent: &Intent,
        room_id: &RoomId,
        is_direct: bool,
    ) -> bool {
        let custom_intent = match self.get_puppet_by_custom_mxid(&user.mxid).await {
            Ok(Some(puppet)) => puppet.custom_intent().await,
            Ok(None) => None,
            Err(err) => {
                warn!(user = %user.mxid, error = %err, "failed to look up double puppet");
                None
            }
        };
        let options = InviteOptions {
            is_direct,
            will_auto_accept: custom_intent.is_some(),
        };

        let mut invited = match self
            .matrix
            .invite_user(intent, room_id, &user.mxid, options)
            .await
        {
            Ok(()) => {
                self.memberships
                    .set(room_id, &user.mxid, Membership::Invite)
                    .await;
                true
            }
            Err(err) if is_already_in_room_error(&err) => {
                self.memberships
                    .set(room_id, &user.mxid, Membership::Join)
                    .await;
                true
            }
            Err(err) => {
                warn!(user = %user.mxid, %room_id, error = %err, "failed to invite user to room");
                false
            }
        };

        if let Some(custom_intent) = custom_intent {
            match self.ensure_joined(&custom_intent, room_id, true).await {
                Ok(()) => invited = true,
                Err(err) => {
                    warn!(user = %user.mxid, %room_id, error = %err, "failed to auto-join room with double puppet");
                    invited = false;
                }
            }
        }
        invited
    }

    /// Joins `room_id` as `intent` unless the cache already says joined.
    /// Non-bot accounts that cannot join get invited by the bot first.
    pub async fn ensure_joined(
        &self,
        intent: &Intent,
        room_id: &RoomId,
        ignore_cache: bool,
    ) -> Result<()> {
        let user_id = intent.user_id(&self.config);
        if !ignore_cache && self.memberships.is_joined(room_id, &user_id).await {
            return Ok(());
        }
        if let Err(join_err) = self.matrix.join_room(intent, room_id).await {
            if *intent == Intent::Bot {
                return Err(join_err.context(format!("bot failed to join {room_id}")));
            }
            debug!(%user_id, %room_id, error = %join_err, "join failed, inviting first");
            match self
                .matrix
                .invite_user(&Intent::Bot, room_id, &user_id, InviteOptions::default())
                .await
            {
                Ok(()) => {}
                Err(err) if is_already_in_room_error(&err) => {
                    self.memberships
                        .set(room_id, &user_id, Membership::Join)
                        .await;
                    return Ok(());
                }
                Err(err) => {
                    return Err(err.context(format!("failed to invite {user_id} to {room_id}")))
                }
            }
            self.matrix
                .join_room(intent, room_id)
                .await
                .with_context(|| format!("{user_id} failed to join {room_id}"))?;
        }
        self.memberships
            .set(room_id, &user_id, Membership::Join)
            .await;
        Ok(())
    }

    /// The bridge's view of `user`'s one-to-one chats: ghost of the other
    /// participant to the portal room.
    pub async fn get_direct_chats(&self, user: &Arc<User>) -> Result<DirectChats> {
        let mut chats = DirectChats::new();
        let Some(remote_id) = user.remote_id().await else {
            return Ok(chats);
        };
        for portal in self.store.find_private_chats(&remote_id).await? {
            let (Some(room_id), Some(dm_user)) = (portal.room_id, portal.dm_user) else {
                continue;
            };
            chats
                .entry(self.config.format_puppet_mxid(&dm_user))
                .or_default()
                .push(room_id);
        }
        Ok(chats)
    }

    /// Writes `user`'s direct chat list through their double puppet.
    /// `Some(chats)` merges those entries in; `None` recomputes and replaces
    /// the whole list. Does nothing without an active double puppet.
    pub async fn update_direct_chats(&self, user: &Arc<User>, chats: Option<DirectChats>) {
        if !self.config.sync_direct_chat_list {
            return;
        }
        let intent = match self.get_puppet_by_custom_mxid(&user.mxid).await {
            Ok(Some(puppet)) => match puppet.custom_intent().await {
                Some(intent) => intent,
                None => return,
            },
            Ok(None) => return,
            Err(err) => {
                warn!(user = %user.mxid, error = %err, "failed to look up double puppet");
                return;
            }
        };

        let (mode, desired) = match chats {
            Some(chats) => (DirectChatMode::Merge, chats),
            None => match self.get_direct_chats(user).await {
                Ok(chats) => (DirectChatMode::Replace, chats),
                Err(err) => {
                    warn!(user = %user.mxid, error = %err, "failed to collect direct chats");
                    return;
                }
            },
        };

        debug!(user = %user.mxid, ?mode, "updating direct chat list");
        let existing = match self
            .matrix
            .get_account_data(&intent, ACCOUNT_DATA_DIRECT_CHATS)
            .await
            .and_then(|value| {
                if value.is_null() {
                    Ok(DirectChats::new())
                } else {
                    serde_json::from_value(value).context("malformed direct chat list")
                }
            }) {
            Ok(existing) => existing,
            Err(err) => {
                warn!(user = %user.mxid, error = %err, "failed to fetch direct chat list");
                return;
            }
        };

        let merged = merge_direct_chats(existing, desired, mode, |user_id| {
            self.config.is_bridge_account(user_id)
        });
        let content = match serde_json::to_value(&merged) {
            Ok(content) => content,
            Err(err) => {
                warn!(user = %user.mxid, error = %err, "failed to encode direct chat list");
                return;
            }
        };
        if let Err(err) = self
            .matrix
            .set_account_data(&intent, ACCOUNT_DATA_DIRECT_CHATS, content)
            .await
        {
            warn!(user = %user.mxid, error = %err, "failed to update direct chat list");
        }
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
