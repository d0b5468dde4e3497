//! The one entry point business logic uses to push realtime events.
//!
//! Every method is fire-and-forget: delivery failures are logged and never
//! reach the caller, so a broken socket can never fail a write request.

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::models::connection_request::ConnectionRequest;
use crate::models::conversation::Conversation;
use crate::models::message::Message;

use super::events::{
    ConnectionAction, ConnectionEvent, ConnectionRequestEvent, ErrorEvent, EventType, MessageEvent,
    MessageReadEvent, RequestAction, TypingEvent,
};
use super::presence::PresenceHub;
use super::scoped::{ChatHub, TypingHub};
use super::{ConversationId, UserId};

#[derive(Clone)]
pub struct HubService {
    chat: ChatHub,
    typing: TypingHub,
    presence: PresenceHub,
}

impl HubService {
    pub fn new(chat: ChatHub, typing: TypingHub, presence: PresenceHub) -> Self {
        Self {
            chat,
            typing,
            presence,
        }
    }

    pub fn chat(&self) -> &ChatHub {
        &self.chat
    }

    pub fn typing(&self) -> &TypingHub {
        &self.typing
    }

    pub fn presence(&self) -> &PresenceHub {
        &self.presence
    }

    // -- conversation scoped ------------------------------------------------

    /// Push an already-persisted message to the other participants of its
    /// conversation.
    pub fn broadcast_new_message(&self, message: &Message) -> usize {
        let event = MessageEvent {
            message: message.clone(),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            receiver_id: message.receiver_id,
        };
        let delivered = self.chat.broadcast(
            message.conversation_id,
            EventType::MessageNew,
            &event,
            message.sender_id,
        );
        tracing::debug!(
            message_id = %message.id,
            conversation_id = %message.conversation_id,
            delivered,
            "new message broadcast"
        );
        delivered
    }

    pub fn broadcast_message_read(
        &self,
        message_id: Uuid,
        conversation_id: ConversationId,
        read_by: UserId,
    ) -> usize {
        let event = MessageReadEvent {
            message_id: Some(message_id),
            conversation_id,
            read_by,
            read_at: Utc::now(),
            message_count: None,
        };
        self.chat
            .broadcast(conversation_id, EventType::MessageRead, &event, read_by)
    }

    /// Every unread message in the conversation was marked read at once.
    pub fn broadcast_conversation_read(
        &self,
        conversation_id: ConversationId,
        read_by: UserId,
        message_count: usize,
    ) -> usize {
        let event = MessageReadEvent {
            message_id: None,
            conversation_id,
            read_by,
            read_at: Utc::now(),
            message_count: Some(message_count),
        };
        self.chat
            .broadcast(conversation_id, EventType::MessageRead, &event, read_by)
    }

    pub fn broadcast_typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    ) -> usize {
        let event = TypingEvent {
            conversation_id,
            user_id,
            is_typing,
            updated_at: Utc::now(),
        };
        self.typing
            .broadcast(conversation_id, EventType::MessageTyping, &event, user_id)
    }

    // -- user targeted ------------------------------------------------------

    /// Tell the receiver about a new request.
    pub fn notify_connection_request(&self, request: &ConnectionRequest) -> usize {
        self.request_event(request.receiver_id, request, RequestAction::New)
    }

    /// Tell the sender their request was accepted, then tell both sides the
    /// conversation now exists.
    pub fn notify_connection_accepted(
        &self,
        request: &ConnectionRequest,
        conversation: &Conversation,
    ) -> usize {
        let mut delivered = self.request_event(request.sender_id, request, RequestAction::Accepted);
        let event = ConnectionEvent {
            connection: conversation.clone(),
            action: ConnectionAction::Established,
        };
        for user in [request.sender_id, request.receiver_id] {
            delivered += self
                .presence
                .broadcast_to_user(user, EventType::ConnectionAccepted, &event);
        }
        delivered
    }

    /// Tell the sender their request was declined.
    pub fn notify_connection_declined(&self, request: &ConnectionRequest) -> usize {
        self.request_event(request.sender_id, request, RequestAction::Declined)
    }

    /// Tell both participants the conversation was dropped.
    pub fn notify_connection_dropped(&self, conversation: &Conversation) -> usize {
        let event = ConnectionEvent {
            connection: conversation.clone(),
            action: ConnectionAction::Dropped,
        };
        conversation
            .participants()
            .into_iter()
            .map(|user| {
                self.presence
                    .broadcast_to_user(user, EventType::ConnectionDropped, &event)
            })
            .sum()
    }

    fn request_event(&self, user: UserId, request: &ConnectionRequest, action: RequestAction) -> usize {
        let event = ConnectionRequestEvent {
            request: request.clone(),
            action,
        };
        self.presence
            .broadcast_to_user(user, EventType::ConnectionRequest, &event)
    }

    /// Arbitrary event to every status socket of `user`.
    pub fn send_direct<T: Serialize>(&self, user: UserId, event: EventType, data: &T) -> usize {
        self.presence.broadcast_to_user(user, event, data)
    }

    pub fn send_error(&self, user: UserId, code: u16, message: impl Into<String>) -> usize {
        let event = ErrorEvent {
            code,
            message: message.into(),
        };
        self.presence.broadcast_to_user(user, EventType::Error, &event)
    }

    // -- presence -----------------------------------------------------------

    pub fn set_user_away(&self, user: UserId) -> bool {
        self.presence.set_away(user)
    }

    pub fn set_user_online(&self, user: UserId) -> bool {
        self.presence.set_online(user)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.presence.online_users()
    }

    pub fn is_user_online(&self, user: UserId) -> bool {
        self.presence.is_online(user)
    }

    /// Users with a live chat socket open on `conversation_id`.
    pub fn conversation_members(&self, conversation_id: ConversationId) -> Vec<UserId> {
        self.chat.members(conversation_id)
    }

    /// Stop all three hubs, closing every connection they hold.
    pub async fn shutdown(&self) {
        self.chat.shutdown().await;
        self.typing.shutdown().await;
        self.presence.shutdown().await;
        tracing::info!("realtime hubs stopped");
    }
}
