use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::ApiError;
use crate::gateway::{ConversationId, UserId};
use crate::models::conversation::Conversation;

/// Lookup of conversations for upgrade authorization.
///
/// The realtime service never writes conversations; whatever owns them
/// (the matching API, a database) sits behind this trait.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>, ApiError>;
}

/// Load `conversation_id` and check that `user_id` may use it: it must
/// exist, be active, and include the user.
pub async fn authorize_participant(
    store: &dyn ConversationStore,
    user_id: UserId,
    conversation_id: ConversationId,
) -> Result<Conversation, ApiError> {
    let conversation = store
        .get(conversation_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Connection not found"))?;

    if !conversation.is_active() {
        return Err(ApiError::forbidden("Connection is not active"));
    }
    if !conversation.includes(user_id) {
        return Err(ApiError::forbidden("Not a participant of this connection"));
    }
    Ok(conversation)
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryConversationStore {
    data: RwLock<HashMap<ConversationId, Conversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a conversation.
    pub fn insert(&self, conversation: Conversation) {
        self.data.write().insert(conversation.id, conversation);
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>, ApiError> {
        Ok(self.data.read().get(&id).cloned())
    }
}
