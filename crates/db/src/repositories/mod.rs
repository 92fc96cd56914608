use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use frontdesk_core::dedup::DedupError;
use frontdesk_core::domain::conversation::ConversationMessage;
use frontdesk_core::domain::envelope::MessageId;
use frontdesk_core::ledger::LedgerError;

pub mod conversation;
pub mod dedup;
pub mod ledger;
pub mod memory;

pub use conversation::SqlConversationRepository;
pub use dedup::SqlDedupStore;
pub use ledger::SqlLedgerStore;
pub use memory::InMemoryConversationRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for LedgerError {
    fn from(value: RepositoryError) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<RepositoryError> for DedupError {
    fn from(value: RepositoryError) -> Self {
        Self::Storage(value.to_string())
    }
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// Idempotent on `message_id`: a repeated create returns the stored record unchanged.
    async fn create_message(
        &self,
        message: ConversationMessage,
    ) -> Result<ConversationMessage, RepositoryError>;

    async fn find_by_message_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<ConversationMessage>, RepositoryError>;

    /// Most recent `limit` messages of a session, oldest first.
    async fn list_session(
        &self,
        tenant_id: &str,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<ConversationMessage>, RepositoryError>;
}

/// Fixed-width UTC timestamps so stored values order lexicographically.
pub(crate) fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid timestamp `{value}`: {error}")))
}

pub(crate) fn to_db_int(value: u64) -> Result<i64, RepositoryError> {
    i64::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("value {value} exceeds storage range")))
}

pub(crate) fn from_db_int(value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value)
        .map_err(|_| RepositoryError::Decode(format!("negative stored counter {value}")))
}
