//! Wire envelope, event types, inbound frames and outbound payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use axum::extract::ws::Utf8Bytes;

use crate::error::HubError;
use crate::models::connection_request::ConnectionRequest;
use crate::models::conversation::Conversation;
use crate::models::message::Message;

use super::{ConversationId, UserId};

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Every event tag the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageNew,
    MessageRead,
    MessageTyping,
    UserOnline,
    UserOffline,
    UserAway,
    UserStatusInitial,
    ConnectionRequest,
    ConnectionAccepted,
    ConnectionDropped,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MessageNew => "message_new",
            Self::MessageRead => "message_read",
            Self::MessageTyping => "message_typing",
            Self::UserOnline => "user_online",
            Self::UserOffline => "user_offline",
            Self::UserAway => "user_away",
            Self::UserStatusInitial => "user_status_initial",
            Self::ConnectionRequest => "connection_request",
            Self::ConnectionAccepted => "connection_accepted",
            Self::ConnectionDropped => "connection_dropped",
            Self::Error => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The unit on the wire, in both directions.
///
/// Built once, serialized, and never kept around afterwards.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    event: EventType,
    data: T,
    timestamp: DateTime<Utc>,
    message_id: Uuid,
}

impl<T: Serialize> Envelope<T> {
    pub fn new(event: EventType, data: T) -> Self {
        Self {
            event,
            data,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4(),
        }
    }

    /// Serialize into a text frame ready for any number of outbound queues.
    pub fn to_frame(&self) -> Result<Utf8Bytes, HubError> {
        serde_json::to_string(self)
            .map(Utf8Bytes::from)
            .map_err(HubError::Encode)
    }
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Loose shape every inbound frame is first read into.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Payload of an inbound `message_typing` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct TypingInput {
    /// Checked against the connection's own scope when present.
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub is_typing: bool,
}

/// Frames a client may send. Anything else decodes to `Unrecognized` and
/// is ignored by the read loop.
#[derive(Debug)]
pub enum InboundEvent {
    Typing(TypingInput),
    Unrecognized(String),
}

impl InboundEvent {
    pub const TYPING: &'static str = "message_typing";

    /// Decode one inbound text frame. Malformed JSON, or a recognized type
    /// with a bad payload, is a protocol error.
    pub fn parse(text: &str) -> Result<Self, HubError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        match raw.kind.as_str() {
            Self::TYPING => Ok(Self::Typing(serde_json::from_value(raw.data)?)),
            _ => Ok(Self::Unrecognized(raw.kind)),
        }
    }
}

// ---------------------------------------------------------------------------
// Server → Client payloads
// ---------------------------------------------------------------------------

/// `message_new`
#[derive(Debug, Clone, Serialize)]
pub struct MessageEvent {
    pub message: Message,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
}

/// `message_read`. A bulk read carries no `message_id` and the number of
/// messages marked read instead.
#[derive(Debug, Clone, Serialize)]
pub struct MessageReadEvent {
    pub message_id: Option<Uuid>,
    pub conversation_id: ConversationId,
    pub read_by: UserId,
    pub read_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
}

/// `message_typing`
#[derive(Debug, Clone, Serialize)]
pub struct TypingEvent {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
    Away,
}

impl PresenceStatus {
    pub fn event_type(self) -> EventType {
        match self {
            Self::Online => EventType::UserOnline,
            Self::Offline => EventType::UserOffline,
            Self::Away => EventType::UserAway,
        }
    }
}

/// `user_online`, `user_offline`, `user_away`
#[derive(Debug, Clone, Serialize)]
pub struct UserStatusEvent {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestAction {
    New,
    Accepted,
    Declined,
}

/// `connection_request`
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRequestEvent {
    pub request: ConnectionRequest,
    pub action: RequestAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionAction {
    Established,
    Dropped,
}

/// `connection_accepted`, `connection_dropped`
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub connection: Conversation,
    pub action: ConnectionAction,
}

/// `error`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub code: u16,
    pub message: String,
}
