//! WebSocket upgrade endpoints.
//!
//! Authentication and conversation membership are checked before the
//! handshake; a refused request never becomes a socket.

use std::sync::Arc;

use axum::extract::ws::WebSocket;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;

use crate::auth::middleware::AuthUser;
use crate::db::conversations::authorize_participant;
use crate::error::ApiError;
use crate::AppState;

use super::connection::{self, Connection, Outbox};
use super::scoped::{ScopeKind, ScopedHub, TypingHub};
use super::{ConversationId, HubSettings, UserId};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/chat/{conversation_id}", get(chat_upgrade))
        .route("/ws/typing/{conversation_id}", get(typing_upgrade))
        .route("/ws/status", get(status_upgrade))
}

async fn chat_upgrade(
    auth: AuthUser,
    Path(conversation_id): Path<ConversationId>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    authorize_participant(state.conversations.as_ref(), auth.user_id, conversation_id).await?;
    let hub = state.service.chat().clone();
    Ok(upgrade_scoped(ws, hub, None, auth.user_id, conversation_id))
}

async fn typing_upgrade(
    auth: AuthUser,
    Path(conversation_id): Path<ConversationId>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    authorize_participant(state.conversations.as_ref(), auth.user_id, conversation_id).await?;
    let hub = state.service.typing().clone();
    let relay = hub.clone();
    Ok(upgrade_scoped(ws, hub, Some(relay), auth.user_id, conversation_id))
}

async fn status_upgrade(
    auth: AuthUser,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.service.presence().clone();
    let settings = *hub.settings();

    ws.max_message_size(settings.max_message_size)
        .on_upgrade(move |socket| async move {
            let (conn, outbox) = hub.connect(auth.user_id);
            if let Err(err) = hub.register(conn.clone()).await {
                tracing::warn!(user_id = %auth.user_id, %err, "status socket refused");
                conn.close();
                return;
            }
            tracing::info!(user_id = %auth.user_id, connection_id = %conn.id(), "status socket open");
            pump(socket, conn, outbox, None, settings).await;
        })
}

fn upgrade_scoped<K: ScopeKind>(
    ws: WebSocketUpgrade,
    hub: ScopedHub<K>,
    typing: Option<TypingHub>,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Response {
    let settings = *hub.settings();

    ws.max_message_size(settings.max_message_size)
        .on_upgrade(move |socket| async move {
            let (conn, outbox) = hub.connect(user_id, conversation_id);
            if let Err(err) = hub.register(conn.clone()).await {
                tracing::warn!(hub = K::NAME, %user_id, %err, "socket refused");
                conn.close();
                return;
            }
            tracing::info!(
                hub = K::NAME,
                %user_id,
                %conversation_id,
                connection_id = %conn.id(),
                "socket open"
            );
            pump(socket, conn, outbox, typing, settings).await;
        })
}

/// Run both loops for an upgraded socket until each has exited.
async fn pump(
    socket: WebSocket,
    conn: Arc<Connection>,
    outbox: Outbox,
    typing: Option<TypingHub>,
    settings: HubSettings,
) {
    let (sink, stream) = socket.split();

    let writer = tokio::spawn(connection::write_loop(
        conn.clone(),
        sink,
        outbox,
        settings.ping_period,
        settings.write_wait,
    ));
    connection::read_loop(conn.clone(), stream, typing, settings.pong_wait).await;

    if let Err(err) = writer.await {
        tracing::error!(connection_id = %conn.id(), %err, "write loop ended abnormally");
    }
    tracing::info!(connection_id = %conn.id(), user_id = %conn.user_id(), "socket closed");
}
