#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use realtime_api::auth::tokens;
use realtime_api::config::Config;
use realtime_api::db::conversations::MemoryConversationStore;
use realtime_api::gateway::presence::PresenceHub;
use realtime_api::gateway::scoped::{ChatHub, TypingHub};
use realtime_api::gateway::service::HubService;
use realtime_api::models::conversation::{Conversation, ConversationStatus};
use realtime_api::AppState;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const TEST_SECRET: &str = "test-secret-do-not-use-in-production";

pub fn test_config() -> Config {
    Config {
        jwt_secret: TEST_SECRET.to_string(),
        port: 0,
        outbound_queue_capacity: 64,
        hub_command_capacity: 64,
        pong_wait_secs: 60,
        write_wait_secs: 5,
        sweep_interval_secs: 3600,
        probe_timeout_secs: 1,
        max_message_size: 512,
    }
}

/// Build a test AppState with fresh hubs and an empty conversation store.
pub fn test_state() -> (AppState, Arc<MemoryConversationStore>) {
    let config = test_config();
    let settings = config.hub_settings();
    let conversations = Arc::new(MemoryConversationStore::new());

    let state = AppState {
        config: Arc::new(config),
        conversations: conversations.clone(),
        service: HubService::new(
            ChatHub::spawn(settings),
            TypingHub::spawn(settings),
            PresenceHub::spawn(settings),
        ),
    };
    (state, conversations)
}

/// Build the full application router wired to a fresh test state.
pub fn test_app() -> (Router, AppState, Arc<MemoryConversationStore>) {
    let (state, conversations) = test_state();
    let app = realtime_api::routes::router().with_state(state.clone());
    (app, state, conversations)
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub conversations: Arc<MemoryConversationStore>,
}

/// Start an actual TCP server for WebSocket testing. The server runs in the
/// background for the rest of the test.
pub async fn start_server() -> TestServer {
    let (app, state, conversations) = test_app();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        state,
        conversations,
    }
}

pub fn token_for(user_id: Uuid) -> String {
    tokens::issue_access_token(TEST_SECRET, user_id, 3600).expect("mint test token")
}

/// Store a conversation between `a` and `b` and return it.
pub fn conversation_between(
    store: &MemoryConversationStore,
    a: Uuid,
    b: Uuid,
    status: ConversationStatus,
) -> Conversation {
    let conversation = Conversation {
        id: Uuid::new_v4(),
        user_a_id: a,
        user_b_id: b,
        status,
        connected_at: Utc::now(),
    };
    store.insert(conversation.clone());
    conversation
}

/// Open a WebSocket at `path` with `token` as bearer credentials.
pub async fn try_connect(
    addr: SocketAddr,
    path: &str,
    token: Option<&str>,
) -> Result<WsStream, tungstenite::Error> {
    let mut request = format!("ws://{addr}{path}")
        .into_client_request()
        .expect("valid ws url");
    if let Some(token) = token {
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {token}").parse().expect("header value"),
        );
    }
    tokio_tungstenite::connect_async(request)
        .await
        .map(|(ws, _)| ws)
}

pub async fn connect(addr: SocketAddr, path: &str, user_id: Uuid) -> WsStream {
    try_connect(addr, path, Some(&token_for(user_id)))
        .await
        .expect("ws connect")
}

/// Read the next JSON event, skipping control frames.
pub async fn next_event(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("event is json"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert no JSON event arrives within `wait`.
pub async fn expect_silence(ws: &mut WsStream, wait: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = time::timeout(wait, ws.next()).await {
        panic!("unexpected event: {}", text.as_str());
    }
}

/// Poll `cond` until it holds or five seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    time::timeout(Duration::from_secs(5), async {
        while !cond() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
