use super::*;

async fn memory_storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

fn owner() -> RemoteUserId {
    RemoteUserId::from("1000")
}

fn membership(guild: &str, bridge: bool) -> GuildMembership {
    GuildMembership {
        owner_id: owner(),
        guild_id: GuildId::from(guild),
        guild_name: format!("guild {guild}"),
        bridge,
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = memory_storage().await;
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("bridge_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("bridge.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn user_lookup_by_mxid_and_remote_id() {
    let storage = memory_storage().await;
    let mut user = UserRecord::new(MatrixUserId::from("@alice:example.org"));
    storage.insert_user(&user).await.expect("insert");

    assert!(storage
        .get_user_by_remote_id(&owner())
        .await
        .expect("lookup")
        .is_none());

    user.remote_id = Some(owner());
    user.token = Some("secret".into());
    user.management_room = Some(RoomId::from("!mgmt:example.org"));
    storage.update_user(&user).await.expect("update");

    let by_remote = storage
        .get_user_by_remote_id(&owner())
        .await
        .expect("lookup")
        .expect("user");
    assert_eq!(by_remote, user);
    assert_eq!(storage.get_all_users().await.expect("all").len(), 1);
}

#[tokio::test]
async fn inserting_same_user_twice_fails() {
    let storage = memory_storage().await;
    let user = UserRecord::new(MatrixUserId::from("@alice:example.org"));
    storage.insert_user(&user).await.expect("first insert");
    assert!(storage.insert_user(&user).await.is_err());
}

#[tokio::test]
async fn guild_round_trips_applied_flags() {
    let storage = memory_storage().await;
    let mut guild = GuildRecord::new(GuildId::from("42"));
    storage.insert_guild(&guild).await.expect("insert");

    guild.name = "rustaceans".into();
    guild.name_set = true;
    guild.avatar = Some("abc".into());
    guild.avatar_url = Some(ContentUri::from("mxc://example.org/abc"));
    guild.room_id = Some(RoomId::from("!space:example.org"));
    storage.update_guild(&guild).await.expect("update");

    let by_room = storage
        .get_guild_by_room(&RoomId::from("!space:example.org"))
        .await
        .expect("lookup")
        .expect("guild");
    assert_eq!(by_room, guild);
    assert!(!by_room.avatar_set);
}

#[tokio::test]
async fn prune_keeps_only_listed_memberships() {
    let storage = memory_storage().await;
    for guild in ["1", "2", "3"] {
        storage
            .upsert_guild_membership(&membership(guild, guild == "2"))
            .await
            .expect("upsert");
    }

    let pruned = storage
        .prune_guild_memberships(&owner(), &[GuildId::from("2"), GuildId::from("9")])
        .await
        .expect("prune");
    assert_eq!(pruned, 2);

    let remaining = storage.get_guild_memberships(&owner()).await.expect("list");
    assert_eq!(remaining, vec![membership("2", true)]);
}

#[tokio::test]
async fn prune_with_empty_keep_set_clears_owner_only() {
    let storage = memory_storage().await;
    storage
        .upsert_guild_membership(&membership("1", false))
        .await
        .expect("upsert");
    let mut other = membership("1", false);
    other.owner_id = RemoteUserId::from("2000");
    storage.upsert_guild_membership(&other).await.expect("upsert");

    storage
        .prune_guild_memberships(&owner(), &[])
        .await
        .expect("prune");

    assert!(storage
        .get_guild_memberships(&owner())
        .await
        .expect("list")
        .is_empty());
    assert_eq!(
        storage
            .get_guild_memberships(&RemoteUserId::from("2000"))
            .await
            .expect("list")
            .len(),
        1
    );
}

#[tokio::test]
async fn set_guild_bridging_reports_missing_membership() {
    let storage = memory_storage().await;
    storage
        .upsert_guild_membership(&membership("1", false))
        .await
        .expect("upsert");

    assert!(storage
        .set_guild_bridging(&owner(), &GuildId::from("1"), true)
        .await
        .expect("flip"));
    assert!(!storage
        .set_guild_bridging(&owner(), &GuildId::from("404"), true)
        .await
        .expect("flip"));
    assert!(storage.get_guild_memberships(&owner()).await.expect("list")[0].bridge);
}

#[tokio::test]
async fn finds_only_direct_portals_of_receiver() {
    let storage = memory_storage().await;
    let mut dm = PortalRecord::new(PortalKey::new(ChannelId::from("10"), owner()));
    dm.kind = ChannelKind::Dm;
    dm.dm_user = Some(RemoteUserId::from("77"));
    dm.room_id = Some(RoomId::from("!dm:example.org"));
    storage.insert_portal(&dm).await.expect("dm");

    let text = PortalRecord::new(PortalKey::new(ChannelId::from("11"), owner()));
    storage.insert_portal(&text).await.expect("text");

    let mut foreign = PortalRecord::new(PortalKey::new(
        ChannelId::from("12"),
        RemoteUserId::from("2000"),
    ));
    foreign.kind = ChannelKind::Dm;
    storage.insert_portal(&foreign).await.expect("foreign");

    let private = storage.find_private_chats(&owner()).await.expect("find");
    assert_eq!(private, vec![dm.clone()]);
    assert_eq!(
        storage
            .get_portal_by_room(&RoomId::from("!dm:example.org"))
            .await
            .expect("lookup"),
        Some(dm)
    );
}

#[tokio::test]
async fn puppet_custom_mxid_index() {
    let storage = memory_storage().await;
    let mut puppet = PuppetRecord::new(RemoteUserId::from("77"));
    storage.insert_puppet(&puppet).await.expect("insert");
    assert!(storage
        .get_puppets_with_custom_mxid()
        .await
        .expect("list")
        .is_empty());

    puppet.custom_mxid = Some(MatrixUserId::from("@alice:example.org"));
    puppet.access_token = Some("token".into());
    storage.update_puppet(&puppet).await.expect("update");

    let found = storage
        .get_puppet_by_custom_mxid(&MatrixUserId::from("@alice:example.org"))
        .await
        .expect("lookup");
    assert_eq!(found, Some(puppet));
}

#[tokio::test]
async fn message_and_reaction_mappings() {
    let storage = memory_storage().await;
    let key = PortalKey::new(ChannelId::from("10"), owner());
    let message = MessageRecord {
        key: key.clone(),
        remote_id: MessageId::from("500"),
        sender: RemoteUserId::from("77"),
        room_id: RoomId::from("!room:example.org"),
        event_id: EventId::from("$event"),
    };
    storage.insert_message(&message).await.expect("insert");
    assert!(storage.insert_message(&message).await.is_err());

    let reaction = ReactionRecord {
        key: key.clone(),
        message_id: message.remote_id.clone(),
        sender: RemoteUserId::from("78"),
        emoji: "👍".into(),
        event_id: EventId::from("$reaction"),
    };
    storage.insert_reaction(&reaction).await.expect("reaction");
    assert_eq!(
        storage
            .get_reaction(&key, &message.remote_id, &reaction.sender, "👍")
            .await
            .expect("lookup"),
        Some(reaction.clone())
    );

    storage.delete_reaction(&reaction).await.expect("delete");
    storage
        .delete_message(&key, &message.remote_id)
        .await
        .expect("delete");
    assert!(storage
        .get_message(&key, &message.remote_id)
        .await
        .expect("lookup")
        .is_none());
}
