use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use frontdesk_core::domain::conversation::{ConversationMessage, MessageDirection};
use frontdesk_core::domain::envelope::MessageId;

use super::{parse_timestamp, timestamp, ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn message_from_row(row: &SqliteRow) -> Result<ConversationMessage, RepositoryError> {
    let direction: String = row.try_get("direction")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(ConversationMessage {
        message_id: MessageId(row.try_get("message_id")?),
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        session_id: row.try_get("session_id")?,
        direction: MessageDirection::parse(&direction)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown direction `{direction}`")))?,
        content: row.try_get("content")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn create_message(
        &self,
        message: ConversationMessage,
    ) -> Result<ConversationMessage, RepositoryError> {
        sqlx::query(
            "INSERT INTO conversation_message (message_id, tenant_id, user_id, session_id,
                                               direction, content, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO NOTHING",
        )
        .bind(message.message_id.as_str())
        .bind(&message.tenant_id)
        .bind(&message.user_id)
        .bind(&message.session_id)
        .bind(message.direction.as_str())
        .bind(&message.content)
        .bind(timestamp(message.created_at))
        .execute(&self.pool)
        .await?;

        self.find_by_message_id(&message.message_id).await?.ok_or_else(|| {
            RepositoryError::Decode(format!(
                "conversation message {} vanished after insert",
                message.message_id.as_str()
            ))
        })
    }

    async fn find_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<ConversationMessage>, RepositoryError> {
        let row = sqlx::query(
            "SELECT message_id, tenant_id, user_id, session_id, direction, content, created_at
             FROM conversation_message WHERE message_id = ?",
        )
        .bind(message_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn list_session(
        &self,
        tenant_id: &str,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT message_id, tenant_id, user_id, session_id, direction, content, created_at
             FROM conversation_message
             WHERE tenant_id = ? AND session_id = ?
             ORDER BY created_at DESC
             LIMIT ?",
        )
        .bind(tenant_id)
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows.iter().map(message_from_row).collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}
