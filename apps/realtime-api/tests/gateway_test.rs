mod common;

use std::time::Duration;

use chrono::Utc;
use futures_util::SinkExt;
use tokio_tungstenite::tungstenite;
use uuid::Uuid;

use realtime_api::models::conversation::ConversationStatus;
use realtime_api::models::message::{Message, MessageKind};

fn http_status(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(resp) => resp.status().as_u16(),
        other => panic!("expected an HTTP refusal, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Status sockets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_socket_tracks_online_and_offline() {
    let server = common::start_server().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let mut a = common::connect(server.addr, "/ws/status", alice).await;
    let snapshot = common::next_event(&mut a).await;
    assert_eq!(snapshot["type"], "user_status_initial");
    assert_eq!(snapshot["data"], serde_json::json!([]));

    let mut b = common::connect(server.addr, "/ws/status", bob).await;
    let snapshot = common::next_event(&mut b).await;
    assert_eq!(snapshot["type"], "user_status_initial");
    assert_eq!(snapshot["data"], serde_json::json!([alice]));

    let online = common::next_event(&mut a).await;
    assert_eq!(online["type"], "user_online");
    assert_eq!(online["data"]["user_id"], bob.to_string());
    assert!(server.state.service.is_user_online(bob));

    b.close(None).await.expect("close");
    let offline = common::next_event(&mut a).await;
    assert_eq!(offline["type"], "user_offline");
    assert_eq!(offline["data"]["user_id"], bob.to_string());

    let service = server.state.service.clone();
    common::wait_until(move || !service.is_user_online(bob)).await;
}

#[tokio::test]
async fn second_status_socket_is_not_announced() {
    let server = common::start_server().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

    let mut a = common::connect(server.addr, "/ws/status", alice).await;
    common::next_event(&mut a).await;

    let mut b1 = common::connect(server.addr, "/ws/status", bob).await;
    common::next_event(&mut b1).await;
    assert_eq!(common::next_event(&mut a).await["type"], "user_online");

    let mut b2 = common::connect(server.addr, "/ws/status", bob).await;
    assert_eq!(common::next_event(&mut b2).await["type"], "user_status_initial");
    common::expect_silence(&mut a, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn upgrade_without_token_is_unauthorized() {
    let server = common::start_server().await;
    let err = common::try_connect(server.addr, "/ws/status", None)
        .await
        .expect_err("upgrade should be refused");
    assert_eq!(http_status(err), 401);

    let err = common::try_connect(server.addr, "/ws/status", Some("not-a-jwt"))
        .await
        .expect_err("upgrade should be refused");
    assert_eq!(http_status(err), 401);
}

// ---------------------------------------------------------------------------
// Chat sockets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chat_upgrade_requires_membership() {
    let server = common::start_server().await;
    let (alice, bob, mallory) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let active =
        common::conversation_between(&server.conversations, alice, bob, ConversationStatus::Connected);
    let dropped =
        common::conversation_between(&server.conversations, alice, bob, ConversationStatus::Dropped);

    let path = format!("/ws/chat/{}", active.id);
    let err = common::try_connect(server.addr, &path, Some(&common::token_for(mallory)))
        .await
        .expect_err("outsider should be refused");
    assert_eq!(http_status(err), 403);

    let path = format!("/ws/chat/{}", dropped.id);
    let err = common::try_connect(server.addr, &path, Some(&common::token_for(alice)))
        .await
        .expect_err("dropped conversation should be refused");
    assert_eq!(http_status(err), 403);

    let path = format!("/ws/chat/{}", Uuid::new_v4());
    let err = common::try_connect(server.addr, &path, Some(&common::token_for(alice)))
        .await
        .expect_err("unknown conversation should be refused");
    assert_eq!(http_status(err), 404);

    assert_eq!(server.state.service.chat().scope_count(), 0);
}

#[tokio::test]
async fn new_message_fans_out_to_peer_only() {
    let server = common::start_server().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation =
        common::conversation_between(&server.conversations, alice, bob, ConversationStatus::Connected);
    let path = format!("/ws/chat/{}", conversation.id);

    let mut a = common::connect(server.addr, &path, alice).await;
    let mut b = common::connect(server.addr, &path, bob).await;

    let chat = server.state.service.chat().clone();
    let scope = conversation.id;
    common::wait_until(move || chat.member_count(scope) == 2).await;

    let message = Message {
        id: Uuid::new_v4(),
        conversation_id: conversation.id,
        sender_id: alice,
        receiver_id: bob,
        kind: MessageKind::Text,
        content: Some("hey".to_string()),
        media_url: None,
        media_type: None,
        is_read: false,
        created_at: Utc::now(),
        read_at: None,
    };
    assert_eq!(server.state.service.broadcast_new_message(&message), 1);

    let event = common::next_event(&mut b).await;
    assert_eq!(event["type"], "message_new");
    assert_eq!(event["data"]["message"]["content"], "hey");
    assert_eq!(event["data"]["conversation_id"], conversation.id.to_string());
    assert!(event["message_id"].is_string());
    common::expect_silence(&mut a, Duration::from_millis(200)).await;

    b.close(None).await.expect("close");
    let chat = server.state.service.chat().clone();
    common::wait_until(move || chat.member_count(scope) == 1).await;
}

// ---------------------------------------------------------------------------
// Typing sockets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn typing_frame_is_relayed_to_peer() {
    let server = common::start_server().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation =
        common::conversation_between(&server.conversations, alice, bob, ConversationStatus::Connected);
    let path = format!("/ws/typing/{}", conversation.id);

    let mut a = common::connect(server.addr, &path, alice).await;
    let mut b = common::connect(server.addr, &path, bob).await;

    let typing = server.state.service.typing().clone();
    let scope = conversation.id;
    common::wait_until(move || typing.member_count(scope) == 2).await;

    let frame = serde_json::json!({
        "type": "message_typing",
        "data": { "conversation_id": conversation.id, "is_typing": true },
        "timestamp": Utc::now(),
        "message_id": Uuid::new_v4(),
    });
    a.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send typing");

    let event = common::next_event(&mut b).await;
    assert_eq!(event["type"], "message_typing");
    assert_eq!(event["data"]["user_id"], alice.to_string());
    assert_eq!(event["data"]["is_typing"], true);
    common::expect_silence(&mut a, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn unknown_and_malformed_frames_keep_the_socket_open() {
    let server = common::start_server().await;
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    let conversation =
        common::conversation_between(&server.conversations, alice, bob, ConversationStatus::Connected);
    let path = format!("/ws/typing/{}", conversation.id);

    let mut a = common::connect(server.addr, &path, alice).await;
    let mut b = common::connect(server.addr, &path, bob).await;

    let typing = server.state.service.typing().clone();
    let scope = conversation.id;
    common::wait_until(move || typing.member_count(scope) == 2).await;

    for junk in [r#"{"type":"message_new","data":{}}"#, "{not json"] {
        a.send(tungstenite::Message::Text(junk.into()))
            .await
            .expect("send junk");
    }

    // Still registered and still relaying.
    server.state.service.broadcast_typing(conversation.id, bob, false);
    let event = common::next_event(&mut a).await;
    assert_eq!(event["type"], "message_typing");
    assert_eq!(event["data"]["is_typing"], false);
    assert_eq!(server.state.service.typing().member_count(scope), 2);
    common::expect_silence(&mut b, Duration::from_millis(100)).await;
}
