use std::sync::atomic::Ordering;

use futures::future::join_all;
use shared::domain::{ContentUri, Membership};

use super::*;
use crate::{
    matrix::{InviteOptions, EVENT_BRIDGE, EVENT_HALF_SHOT_BRIDGE},
    test_support::*,
};

async fn guild_with_space(h: &Harness, id: &str, name: &str) -> Arc<Guild> {
    let guild = h
        .bridge
        .get_guild_by_id(&GuildId::from(id), true)
        .await
        .expect("lookup")
        .expect("created");
    {
        let mut record = guild.record.lock().await;
        record.room_id = Some(RoomId::from("!space:example.org"));
        record.name = name.to_owned();
        record.name_set = true;
        record.avatar_set = true;
    }
    guild
}

#[tokio::test]
async fn unchanged_name_makes_no_remote_calls() {
    let h = harness().await;
    let guild = guild_with_space(&h, "g1", "Rust").await;

    assert!(!guild.update_name(h.matrix.as_ref(), "Rust").await);
    assert!(!guild.update_avatar(h.matrix.as_ref(), None).await);
    assert!(h.matrix.calls().await.is_empty());
}

#[tokio::test]
async fn failed_name_push_is_retried_on_the_next_update() {
    let h = harness().await;
    let guild = guild_with_space(&h, "g1", "Rust").await;
    h.matrix.fail_room_name.store(true, Ordering::SeqCst);

    assert!(guild.update_name(h.matrix.as_ref(), "Rustaceans").await);
    assert!(!guild.record().await.name_set);

    assert!(guild.update_name(h.matrix.as_ref(), "Rustaceans").await);
    let renames = |call: &MatrixCall| matches!(call, MatrixCall::SetRoomName { .. });
    assert_eq!(h.matrix.count(renames).await, 2);

    h.matrix.fail_room_name.store(false, Ordering::SeqCst);
    assert!(guild.update_name(h.matrix.as_ref(), "Rustaceans").await);
    assert!(guild.record().await.name_set);
    assert!(!guild.update_name(h.matrix.as_ref(), "Rustaceans").await);
    assert_eq!(h.matrix.count(renames).await, 3);
}

#[tokio::test]
async fn avatar_is_reuploaded_and_applied_to_the_space() {
    let h = harness().await;
    let guild = guild_with_space(&h, "g1", "Rust").await;

    assert!(guild.update_avatar(h.matrix.as_ref(), Some("abc")).await);
    let record = guild.record().await;
    assert_eq!(record.avatar.as_deref(), Some("abc"));
    assert_eq!(
        record.avatar_url,
        Some(ContentUri::from("mxc://example.org/abc.png"))
    );
    assert!(record.avatar_set);
    assert_eq!(
        h.matrix.calls().await,
        vec![
            MatrixCall::UploadAvatar("https://cdn.discordapp.com/icons/g1/abc.png".to_owned()),
            MatrixCall::SetRoomAvatar {
                room_id: RoomId::from("!space:example.org"),
                url: Some(ContentUri::from("mxc://example.org/abc.png")),
            },
        ]
    );

    h.matrix.clear_calls().await;
    h.matrix.fail_room_avatar.store(true, Ordering::SeqCst);
    assert!(guild.update_avatar(h.matrix.as_ref(), Some("def")).await);
    assert!(!guild.record().await.avatar_set);
}

#[tokio::test]
async fn changed_info_refreshes_bridge_state_and_persists() {
    let h = harness().await;
    let guild = guild_with_space(&h, "g1", "Rust").await;

    let changed = guild
        .update_info(h.matrix.as_ref(), h.bridge.config(), &guild_info("g1", "Rust 2024"))
        .await
        .expect("update");
    assert!(changed);

    let state_events: Vec<_> = h
        .matrix
        .calls()
        .await
        .into_iter()
        .filter_map(|call| match call {
            MatrixCall::SendState {
                event_type,
                state_key,
                ..
            } => Some((event_type, state_key)),
            _ => None,
        })
        .collect();
    assert_eq!(
        state_events,
        vec![
            (EVENT_BRIDGE.to_owned(), "fi.mau.discord://discord/g1".to_owned()),
            (
                EVENT_HALF_SHOT_BRIDGE.to_owned(),
                "fi.mau.discord://discord/g1".to_owned()
            ),
        ]
    );
    let stored = h
        .storage
        .get_guild(&GuildId::from("g1"))
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(stored.name, "Rust 2024");
    assert!(stored.name_set);

    let unavailable = GuildInfo {
        unavailable: true,
        ..guild_info("g1", "")
    };
    assert!(!guild
        .update_info(h.matrix.as_ref(), h.bridge.config(), &unavailable)
        .await
        .expect("update"));
}

fn guild_info(id: &str, name: &str) -> GuildInfo {
    guild(id, name, None)
}

#[tokio::test]
async fn concurrent_space_creation_creates_one_room() {
    let h = harness().await;
    h.matrix.create_room_delay_ms.store(30, Ordering::SeqCst);
    let alice = h.user("@alice:example.org").await;
    let guild = h
        .bridge
        .get_guild_by_id(&GuildId::from("g1"), true)
        .await
        .expect("lookup")
        .expect("created");
    let info = guild_info("g1", "Rust");

    let results =
        join_all((0..5).map(|_| h.bridge.create_guild_space(&alice, &guild, &info))).await;
    let rooms: Vec<_> = results.into_iter().map(|r| r.expect("space")).collect();

    assert!(rooms.iter().all(|room| *room == rooms[0]));
    assert_eq!(h.matrix.created_rooms().await.len(), 1);
    assert_eq!(guild.room_id().await, Some(rooms[0].clone()));
    let by_room = h
        .bridge
        .get_guild_by_room(&rooms[0])
        .await
        .expect("lookup")
        .expect("indexed");
    assert!(Arc::ptr_eq(&by_room, &guild));
}

#[tokio::test]
async fn users_racing_for_the_space_are_all_invited() {
    let h = harness().await;
    h.matrix.create_room_delay_ms.store(30, Ordering::SeqCst);
    let alice = h.user("@alice:example.org").await;
    let bob = h.user("@bob:example.org").await;
    let guild = h
        .bridge
        .get_guild_by_id(&GuildId::from("g1"), true)
        .await
        .expect("lookup")
        .expect("created");
    let info = guild_info("g1", "Rust");

    let (first, second) = tokio::join!(
        h.bridge.create_guild_space(&alice, &guild, &info),
        h.bridge.create_guild_space(&bob, &guild, &info),
    );
    let room_id = first.expect("alice space");
    assert_eq!(second.expect("bob space"), room_id);
    assert_eq!(h.matrix.created_rooms().await.len(), 1);

    for user in [&alice, &bob] {
        assert_eq!(
            h.bridge.memberships().get(&room_id, &user.mxid).await,
            Some(Membership::Invite),
            "{}",
            user.mxid
        );
    }
}

#[tokio::test]
async fn space_is_created_with_bridge_state_and_the_user_invited() {
    let h = harness().await;
    let alice = h.user("@alice:example.org").await;
    let info = guild("g1", "Rust", Some("abc"));
    let guild = h
        .bridge
        .get_guild_by_id(&GuildId::from("g1"), true)
        .await
        .expect("lookup")
        .expect("created");

    let room_id = h
        .bridge
        .create_guild_space(&alice, &guild, &info)
        .await
        .expect("space");

    let created = h.matrix.created_rooms().await;
    assert_eq!(created.len(), 1);
    let request = &created[0];
    assert!(request.is_space);
    assert_eq!(request.name, "Rust");
    let types: Vec<_> = request
        .initial_state
        .iter()
        .map(|event| event.event_type.as_str())
        .collect();
    assert_eq!(types, [EVENT_BRIDGE, EVENT_HALF_SHOT_BRIDGE, "m.room.avatar"]);
    assert_eq!(
        request.initial_state[0].content["channel"]["displayname"],
        "Rust"
    );
    assert_eq!(
        request.initial_state[2].content["url"],
        "mxc://example.org/abc.png"
    );

    let record = guild.record().await;
    assert!(record.name_set);
    assert!(record.avatar_set);
    assert!(h.matrix.calls().await.contains(&MatrixCall::Invite {
        room_id: room_id.clone(),
        user_id: alice.mxid.clone(),
        options: InviteOptions::default(),
    }));
    assert_eq!(
        h.bridge.memberships().get(&room_id, &alice.mxid).await,
        Some(Membership::Invite)
    );
}

#[tokio::test]
async fn failed_space_creation_can_be_retried() {
    let h = harness().await;
    let alice = h.user("@alice:example.org").await;
    let guild = h
        .bridge
        .get_guild_by_id(&GuildId::from("g1"), true)
        .await
        .expect("lookup")
        .expect("created");
    let info = guild_info("g1", "Rust");

    h.matrix.fail_create_room.store(true, Ordering::SeqCst);
    assert!(h
        .bridge
        .create_guild_space(&alice, &guild, &info)
        .await
        .is_err());
    assert_eq!(guild.room_id().await, None);

    h.matrix.fail_create_room.store(false, Ordering::SeqCst);
    let room_id = h
        .bridge
        .create_guild_space(&alice, &guild, &info)
        .await
        .expect("retry");
    assert_eq!(guild.room_id().await, Some(room_id));
    assert_eq!(h.matrix.created_rooms().await.len(), 2);
}
