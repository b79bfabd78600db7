//! Inbox polling through a connected `SessionClient`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use instagram_puppet::login::LoginData;
use instagram_puppet::session::{ConnectionState, SessionClient, SessionEvent};

use crate::fake_platform::{text_item, thread, Failure, FakePlatform};

async fn connected(platform: &Arc<FakePlatform>) -> (SessionClient, mpsc::Receiver<SessionEvent>) {
    let (tx, mut rx) = mpsc::channel(32);
    let client = SessionClient::new(
        platform.clone(),
        LoginData::Password {
            username: "me".to_owned(),
            password: "pw".to_owned(),
        },
        tx,
    );
    client.connect().await.expect("connect");
    assert!(matches!(rx.recv().await, Some(SessionEvent::Auth(_))));
    wait_until(|| platform.inbox_calls() >= 1).await;
    (client, rx)
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached");
}

async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test(start_paused = true)]
async fn history_is_seeded_then_new_items_are_delivered() {
    let platform = FakePlatform::new();
    platform.set_inbox(vec![thread(
        "t1",
        "Alice",
        vec![text_item("i2", 2_000, "old two"), text_item("i1", 1_000, "old one")],
    )]);
    let (client, mut rx) = connected(&platform).await;

    platform.set_inbox(vec![thread(
        "t1",
        "Alice",
        vec![
            text_item("i4", 4_000, "new two"),
            text_item("i3", 3_000, "new one"),
            text_item("i2", 2_000, "old two"),
        ],
    )]);

    for expected in ["new one", "new two"] {
        match next_event(&mut rx).await {
            SessionEvent::Message { origin, text } => {
                assert_eq!(text, expected);
                assert_eq!(origin.thread_id, "t1");
                assert_eq!(origin.user_id, "7");
                assert!(origin.is_private);
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    // Nothing replays on later polls.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn own_send_is_not_echoed_back() {
    let platform = FakePlatform::new();
    platform.set_inbox(vec![thread("t1", "Alice", vec![text_item("i1", 1_000, "hi")])]);
    let (client, mut rx) = connected(&platform).await;

    let id = client
        .send_message("t1", "from matrix")
        .await
        .expect("send")
        .expect("remote id");

    let mut echo = text_item(&id, 2_000, "from matrix");
    echo["user_id"] = serde_json::json!(1);
    platform.set_inbox(vec![thread(
        "t1",
        "Alice",
        vec![text_item("i3", 3_000, "reply"), echo, text_item("i1", 1_000, "hi")],
    )]);

    match next_event(&mut rx).await {
        SessionEvent::Message { origin, text } => {
            assert_eq!(origin.event_id, "i3");
            assert_eq!(text, "reply");
        }
        other => panic!("expected reply, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn renamed_participant_emits_one_update() {
    let platform = FakePlatform::new();
    platform.set_inbox(vec![thread("t1", "Alice", vec![])]);
    let (client, mut rx) = connected(&platform).await;
    assert_eq!(client.get_user("7").map(|u| u.name), Some("Alice".to_owned()));

    platform.set_inbox(vec![thread("t1", "Alice Cooper", vec![])]);
    match next_event(&mut rx).await {
        SessionEvent::UserUpdate(user) => {
            assert_eq!(user.user_id, "7");
            assert_eq!(user.name, "Alice Cooper");
        }
        other => panic!("expected user update, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(rx.try_recv().is_err(), "update is emitted once");
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn expired_session_logs_out_once_and_stops() {
    let platform = FakePlatform::new();
    let (client, mut rx) = connected(&platform).await;

    platform.fail_inbox(Failure::LoginRequired);
    assert!(matches!(next_event(&mut rx).await, SessionEvent::Logout));

    let calls = platform.inbox_calls();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(platform.inbox_calls(), calls, "polling stopped");
    assert!(rx.try_recv().is_err(), "only one logout");
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn transient_errors_keep_polling() {
    let platform = FakePlatform::new();
    platform.set_inbox(vec![thread("t1", "Alice", vec![text_item("i1", 1_000, "hi")])]);
    let (client, mut rx) = connected(&platform).await;

    platform.fail_inbox(Failure::Api("503".to_owned()));
    let before = platform.inbox_calls();
    wait_until(|| platform.inbox_calls() >= before + 3).await;
    assert_eq!(client.state(), ConnectionState::Connected);

    platform.set_inbox(vec![thread(
        "t1",
        "Alice",
        vec![text_item("i2", 2_000, "after outage"), text_item("i1", 1_000, "hi")],
    )]);
    match next_event(&mut rx).await {
        SessionEvent::Message { text, .. } => assert_eq!(text, "after outage"),
        other => panic!("expected message, got {other:?}"),
    }
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn idle_inbox_backs_off() {
    let platform = FakePlatform::new();
    let (client, _rx) = connected(&platform).await;

    // Ten half-second polls, then the ladder stretches out to ten seconds.
    let start = platform.inbox_calls();
    tokio::time::sleep(Duration::from_secs(60)).await;
    let first_minute = platform.inbox_calls() - start;

    let start = platform.inbox_calls();
    tokio::time::sleep(Duration::from_secs(60)).await;
    let second_minute = platform.inbox_calls() - start;

    assert!(first_minute > second_minute, "{first_minute} vs {second_minute}");
    assert!(second_minute <= 7, "settled at ten-second polls, got {second_minute}");
    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn malformed_item_does_not_block_other_threads() {
    let platform = FakePlatform::new();
    platform.set_inbox(vec![
        thread("t1", "Alice", vec![text_item("a1", 1_000, "old")]),
        thread("t2", "Alice", vec![text_item("b1", 1_000, "old")]),
    ]);
    let (client, mut rx) = connected(&platform).await;

    let broken = serde_json::json!({
        "item_id": "a2", "user_id": 7, "timestamp": "2000000",
        "item_type": "voice_media", "voice_media": { "media": { "audio": { "audio_src": 42 } } }
    });
    platform.set_inbox(vec![
        thread("t1", "Alice", vec![broken.clone(), text_item("a1", 1_000, "old")]),
        thread("t2", "Alice", vec![text_item("b2", 2_000, "hello"), text_item("b1", 1_000, "old")]),
    ]);

    match next_event(&mut rx).await {
        SessionEvent::Message { origin, text } => {
            assert_eq!(text, "hello");
            assert_eq!(origin.thread_id, "t2");
        }
        other => panic!("expected message, got {other:?}"),
    }

    // The broken item was consumed, so the next one in its thread arrives.
    platform.set_inbox(vec![thread(
        "t1",
        "Alice",
        vec![text_item("a3", 3_000, "after"), broken, text_item("a1", 1_000, "old")],
    )]);
    match next_event(&mut rx).await {
        SessionEvent::Message { origin, text } => {
            assert_eq!(text, "after");
            assert_eq!(origin.thread_id, "t1");
        }
        other => panic!("expected message, got {other:?}"),
    }
    client.disconnect();
}
