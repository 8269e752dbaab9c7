use std::sync::atomic::Ordering;

use shared::domain::{MatrixUserId, RemoteUserId};
use storage::{PuppetRecord, UserRecord};

use super::*;
use crate::test_support::*;

async fn seed_user(h: &Harness, mxid: &str, token: Option<&str>) {
    h.storage
        .insert_user(&UserRecord {
            token: token.map(str::to_owned),
            ..UserRecord::new(MatrixUserId::from(mxid))
        })
        .await
        .expect("seed user");
}

#[tokio::test]
async fn start_users_connects_logged_in_users_only() {
    let h = harness().await;
    seed_user(&h, "@alice:example.org", Some("token-a")).await;
    seed_user(&h, "@bob:example.org", None).await;

    h.bridge.start_users().await.expect("start");

    assert_eq!(*h.connector.tokens.lock().await, vec!["token-a"]);
    assert!(h.user("@alice:example.org").await.connected().await);
    assert!(!h.user("@bob:example.org").await.connected().await);
}

#[tokio::test]
async fn start_users_survives_connect_failures() {
    let h = harness().await;
    seed_user(&h, "@alice:example.org", Some("token-a")).await;
    h.connector.fail_connect.store(true, Ordering::SeqCst);

    h.bridge.start_users().await.expect("start");

    let alice = h.user("@alice:example.org").await;
    assert!(!alice.connected().await);
    assert!(alice.logged_in().await);
}

#[tokio::test]
async fn start_users_revalidates_stored_double_puppets() {
    let mut config = test_config();
    config
        .double_puppet_secrets
        .insert("example.org".to_owned(), "shared".to_owned());
    let h = harness_with(config).await;
    h.storage
        .insert_puppet(&PuppetRecord {
            remote_id: RemoteUserId::from("100"),
            custom_mxid: Some(MatrixUserId::from("@alice:example.org")),
            access_token: Some("expired-token".to_owned()),
        })
        .await
        .expect("seed puppet");

    h.bridge.start_users().await.expect("start");

    let puppet = h
        .bridge
        .get_puppet_by_custom_mxid(&MatrixUserId::from("@alice:example.org"))
        .await
        .expect("lookup")
        .expect("double puppet");
    assert_eq!(
        puppet.custom_intent().await,
        Some(Intent::DoublePuppet {
            mxid: MatrixUserId::from("@alice:example.org"),
            access_token: "token-alice".to_owned(),
        })
    );
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let h = harness().await;
    seed_user(&h, "@alice:example.org", Some("token-a")).await;
    seed_user(&h, "@bob:example.org", Some("token-b")).await;
    h.bridge.start_users().await.expect("start");

    h.bridge.shutdown().await;

    let sessions = h.connector.sessions.lock().await;
    assert_eq!(sessions.len(), 2);
    assert!(sessions
        .iter()
        .all(|session| session.closed.load(Ordering::SeqCst)));
    drop(sessions);
    assert!(!h.user("@alice:example.org").await.connected().await);
}

#[tokio::test]
async fn statuses_report_every_known_user() {
    let h = harness().await;
    let alice = h
        .ready_user("@alice:example.org", "100", vec![guild("g1", "Rust", None)])
        .await;
    h.bridge.login(&alice, "token-a").await.expect("login");
    h.user("@bob:example.org").await;

    let mut statuses = h.bridge.user_statuses().await.expect("statuses");
    statuses.sort_by(|a, b| a.mxid.as_str().cmp(b.mxid.as_str()));

    let value = serde_json::to_value(&statuses).expect("serialize");
    assert_eq!(value[0]["mxid"], "@alice:example.org");
    assert_eq!(value[0]["remote_id"], "100");
    assert_eq!(value[0]["logged_in"], true);
    assert_eq!(value[0]["connected"], true);
    assert_eq!(value[0]["bridged_guilds"], 0);
    assert_eq!(value[1]["mxid"], "@bob:example.org");
    assert_eq!(value[1]["logged_in"], false);
}

#[test]
fn session_errors_map_to_api_codes() {
    assert_eq!(SessionError::NotLoggedIn.code(), ErrorCode::NotAuthenticated);
    assert_eq!(SessionError::MissingToken.code(), ErrorCode::NotAuthenticated);
    assert_eq!(SessionError::NotConnected.code(), ErrorCode::NotConnected);
    let err = SessionError::Store {
        source: anyhow::anyhow!("disk full"),
    };
    assert_eq!(err.code(), ErrorCode::Internal);
    assert_eq!(err.to_string(), "failed to persist user: disk full");
}
