//! Presence query endpoints.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::middleware::AuthUser;
use crate::db::conversations::authorize_participant;
use crate::error::{ApiError, ApiErrorBody};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws/online-users", get(online_users))
        .route(
            "/ws/conversations/{conversation_id}/status",
            get(conversation_status),
        )
}

// ---------------------------------------------------------------------------
// GET /ws/online-users
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct OnlineUsersResponse {
    pub online_users: Vec<Uuid>,
    pub count: usize,
}

#[utoipa::path(
    get,
    path = "/ws/online-users",
    tag = "Presence",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Users with a live status socket", body = OnlineUsersResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn online_users(
    _auth: AuthUser,
    State(state): State<AppState>,
) -> Json<OnlineUsersResponse> {
    let online_users = state.service.online_users();
    Json(OnlineUsersResponse {
        count: online_users.len(),
        online_users,
    })
}

// ---------------------------------------------------------------------------
// GET /ws/conversations/:conversation_id/status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct ConversationStatusResponse {
    pub conversation_id: Uuid,
    /// Online flag per participant.
    pub users: HashMap<Uuid, bool>,
}

#[utoipa::path(
    get,
    path = "/ws/conversations/{conversation_id}/status",
    tag = "Presence",
    security(("bearer" = [])),
    params(("conversation_id" = Uuid, Path, description = "Conversation id")),
    responses(
        (status = 200, description = "Online state of both participants", body = ConversationStatusResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Not a participant, or conversation inactive", body = ApiErrorBody),
        (status = 404, description = "Conversation not found", body = ApiErrorBody),
    ),
)]
pub async fn conversation_status(
    auth: AuthUser,
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
) -> Result<Json<ConversationStatusResponse>, ApiError> {
    let conversation =
        authorize_participant(state.conversations.as_ref(), auth.user_id, conversation_id).await?;

    let users = conversation
        .participants()
        .into_iter()
        .map(|user| (user, state.service.is_user_online(user)))
        .collect();

    Ok(Json(ConversationStatusResponse {
        conversation_id,
        users,
    }))
}
