use std::collections::HashMap;

use tokio::sync::RwLock;

use frontdesk_core::domain::conversation::ConversationMessage;
use frontdesk_core::domain::envelope::MessageId;

use super::{ConversationRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryConversationRepository {
    messages: RwLock<HashMap<String, ConversationMessage>>,
}

impl InMemoryConversationRepository {
    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn all(&self) -> Vec<ConversationMessage> {
        let mut messages: Vec<_> = self.messages.read().await.values().cloned().collect();
        messages.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        messages
    }
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn create_message(
        &self,
        message: ConversationMessage,
    ) -> Result<ConversationMessage, RepositoryError> {
        let mut messages = self.messages.write().await;
        let stored =
            messages.entry(message.message_id.as_str().to_owned()).or_insert(message).clone();
        Ok(stored)
    }

    async fn find_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<ConversationMessage>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages.get(message_id.as_str()).cloned())
    }

    async fn list_session(
        &self,
        tenant_id: &str,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        let mut session: Vec<ConversationMessage> = self
            .messages
            .read()
            .await
            .values()
            .filter(|message| message.tenant_id == tenant_id && message.session_id == session_id)
            .cloned()
            .collect();
        session.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        let skip = session.len().saturating_sub(limit as usize);
        Ok(session.split_off(skip))
    }
}
