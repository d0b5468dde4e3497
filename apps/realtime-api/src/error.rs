use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

/// Structured API error returned to clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// Application-level error type that converts into an HTTP response.
///
/// Upgrade requests are refused with one of these before any socket
/// handshake takes place.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND".to_string(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED".to_string(),
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "FORBIDDEN".to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR".to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Failures inside the realtime hubs. None of these escape a single
/// connection: callers log them and carry on.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The socket failed to read or write.
    #[error("transport error: {0}")]
    Transport(String),

    /// An inbound frame could not be decoded.
    #[error("malformed frame: {0}")]
    Protocol(#[from] serde_json::Error),

    /// An outbound envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(serde_json::Error),

    /// The outbound queue was full; the connection has been closed.
    #[error("outbound queue full ({capacity} frames), connection closed")]
    Overflow { capacity: usize },

    /// The connection no longer accepts sends.
    #[error("connection is closed")]
    Closed,

    /// The hub's event loop has stopped.
    #[error("hub is shut down")]
    HubClosed,

    /// A scoped hub was handed a connection without a conversation.
    #[error("connection has no conversation scope")]
    Unscoped,

    /// The connection did not answer a liveness probe in time.
    #[error("connection failed its liveness probe")]
    Stale,
}
