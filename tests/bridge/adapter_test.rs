//! `BridgeAdapter` lifecycle, forwarding and outbound delivery.

use std::time::Duration;

use serde_json::json;

use instagram_puppet::bridge::{BridgeError, RemoteRoom};
use instagram_puppet::login::LoginData;
use instagram_puppet::session::SessionError;

use crate::fake_platform::{text_item, thread, Failure};
use crate::{adapter, wait_until, HostCall};

fn password() -> LoginData {
    LoginData::Password {
        username: "me".to_owned(),
        password: "pw".to_owned(),
    }
}

fn room() -> RemoteRoom {
    RemoteRoom {
        puppet_id: 1,
        room_id: "t1".to_owned(),
    }
}

#[tokio::test(start_paused = true)]
async fn new_puppet_connects_and_reports_login() {
    let (adapter, _platform, host) = adapter();

    adapter.new_puppet(1, password()).await.expect("start puppet");
    assert_eq!(adapter.puppet_ids(), vec![1]);
    assert_eq!(adapter.puppet_data(1), Some(password()));

    wait_until(|| !host.statuses().is_empty()).await;
    assert_eq!(host.statuses(), vec!["Logged in as Me".to_owned()]);
    adapter.shutdown();
}

#[tokio::test(start_paused = true)]
async fn failed_connect_removes_puppet_and_notifies() {
    let (adapter, platform, host) = adapter();
    platform.fail_login(Failure::BadCredentials);

    let err = adapter.new_puppet(1, password()).await.expect_err("bad creds");
    assert!(matches!(err, SessionError::Authentication(_)));
    assert!(adapter.puppet_ids().is_empty());
    let statuses = host.statuses();
    assert_eq!(statuses.len(), 1);
    assert!(statuses[0].starts_with("Failed to connect"));
}

#[tokio::test(start_paused = true)]
async fn inbound_items_are_forwarded_to_the_room() {
    let (adapter, platform, host) = adapter();
    platform.set_inbox(vec![thread("t1", "Alice", vec![text_item("i1", 1_000, "old")])]);
    adapter.new_puppet(1, password()).await.expect("start puppet");
    wait_until(|| platform.inbox_calls() >= 1).await;

    platform.set_inbox(vec![thread(
        "t1",
        "Alice",
        vec![
            json!({ "item_id": "i3", "user_id": 7, "timestamp": "3000000", "item_type": "reel_share",
                    "reel_share": { "text": "lol", "media": { "image_versions2": { "candidates": [{ "url": "https://cdn/story.jpg" }] } } } }),
            text_item("i2", 2_000, "hello"),
            text_item("i1", 1_000, "old"),
        ],
    )]);

    wait_until(|| host.calls().len() >= 4).await;
    let calls = host.calls();
    match &calls[1] {
        HostCall::Message(params, body) => {
            assert_eq!(body, "hello");
            assert_eq!(params.room.puppet_id, 1);
            assert_eq!(params.room.room_id, "t1");
            assert_eq!(params.user_id, "7");
            assert!(params.is_direct);
            assert_eq!(params.event_id.as_deref(), Some("i2"));
        }
        other => panic!("expected message, got {other:?}"),
    }
    assert!(matches!(&calls[2], HostCall::Message(_, body) if body == "lol"));
    assert!(matches!(&calls[3], HostCall::File(_, url) if url == "https://cdn/story.jpg"));
    adapter.shutdown();
}

#[tokio::test(start_paused = true)]
async fn user_updates_reach_the_framework() {
    let (adapter, platform, host) = adapter();
    platform.set_inbox(vec![thread("t1", "Alice", vec![])]);
    adapter.new_puppet(1, password()).await.expect("start puppet");
    wait_until(|| platform.inbox_calls() >= 1).await;

    let info = adapter.create_user(1, "7").expect("known user");
    assert_eq!(info.name, "Alice");
    assert!(adapter.create_user(1, "999").is_none());
    assert!(adapter.create_user(2, "7").is_none());

    platform.set_inbox(vec![thread("t1", "Alice B", vec![])]);
    wait_until(|| host.calls().iter().any(|c| matches!(c, HostCall::User(_)))).await;
    let update = host
        .calls()
        .into_iter()
        .find_map(|c| match c {
            HostCall::User(user) => Some(user),
            _ => None,
        })
        .expect("user update");
    assert_eq!(update.puppet_id, 1);
    assert_eq!(update.user_id, "7");
    assert_eq!(update.name, "Alice B");
    adapter.shutdown();
}

#[tokio::test(start_paused = true)]
async fn outbound_message_stores_event_pair() {
    let (adapter, platform, host) = adapter();
    adapter.new_puppet(1, password()).await.expect("start puppet");

    adapter
        .handle_bridge_message(&room(), "$event1", "hi from matrix")
        .await
        .expect("deliver");

    assert_eq!(platform.sent()[0].text, "hi from matrix");
    assert!(host
        .calls()
        .contains(&HostCall::Stored(1, "$event1".to_owned(), "m-1".to_owned())));
    adapter.shutdown();
}

#[tokio::test(start_paused = true)]
async fn outbound_without_remote_id_stores_nothing() {
    let (adapter, platform, host) = adapter();
    adapter.new_puppet(1, password()).await.expect("start puppet");
    platform.return_ids(false);

    adapter
        .handle_bridge_message(&room(), "$event1", "hi")
        .await
        .expect("deliver");
    assert!(!host
        .calls()
        .iter()
        .any(|c| matches!(c, HostCall::Stored(..))));
    adapter.shutdown();
}

#[tokio::test(start_paused = true)]
async fn outbound_image_and_file() {
    let (adapter, platform, host) = adapter();
    adapter.new_puppet(1, password()).await.expect("start puppet");

    adapter
        .handle_bridge_image(&room(), "$img", "https://matrix.example/media/abc")
        .await
        .expect("image");
    adapter
        .handle_bridge_file(&room(), "$file", "notes.txt", "https://matrix.example/media/def")
        .await
        .expect("file");

    let sent = platform.sent();
    assert_eq!(sent[0].kind, "photo");
    assert_eq!(sent[1].kind, "link");
    assert_eq!(sent[1].text, "notes.txt: https://matrix.example/media/def");

    let stored: Vec<_> = host
        .calls()
        .into_iter()
        .filter(|c| matches!(c, HostCall::Stored(..)))
        .collect();
    assert_eq!(stored.len(), 2);
    adapter.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unknown_puppet_is_rejected() {
    let (adapter, platform, _host) = adapter();
    let err = adapter
        .handle_bridge_message(&room(), "$e", "hi")
        .await
        .expect_err("no puppet");
    assert!(matches!(err, BridgeError::UnknownPuppet(1)));
    assert!(platform.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn delete_puppet_stops_session() {
    let (adapter, platform, _host) = adapter();
    adapter.new_puppet(1, password()).await.expect("start puppet");
    let session = adapter.session(1).expect("session");

    adapter.delete_puppet(1);
    adapter.delete_puppet(1);
    adapter.delete_puppet(42);
    assert!(adapter.puppet_ids().is_empty());

    let calls = platform.inbox_calls();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(platform.inbox_calls(), calls);
    assert!(session.send_message("t1", "x").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn new_puppet_replaces_existing_instance() {
    let (adapter, _platform, _host) = adapter();
    adapter.new_puppet(1, password()).await.expect("first");
    let first = adapter.session(1).expect("session");

    let token = LoginData::SessionToken {
        session_id: "tok".to_owned(),
    };
    adapter.new_puppet(1, token.clone()).await.expect("second");

    assert_eq!(adapter.puppet_ids(), vec![1]);
    assert_eq!(adapter.puppet_data(1), Some(token));
    assert!(first.send_message("t1", "x").await.is_err(), "old session stopped");
    adapter.shutdown();
}

#[tokio::test(start_paused = true)]
async fn logout_asks_to_relink_and_tears_down() {
    let (adapter, platform, host) = adapter();
    adapter.new_puppet(1, password()).await.expect("start puppet");
    wait_until(|| platform.inbox_calls() >= 1).await;

    platform.fail_inbox(Failure::LoginRequired);
    wait_until(|| adapter.puppet_ids().is_empty()).await;

    let statuses = host.statuses();
    assert_eq!(statuses.len(), 2);
    assert!(statuses[1].contains("link your account again"));
}
