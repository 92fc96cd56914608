use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::envelope::{Envelope, MessageId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "inbound" => Some(Self::Inbound),
            "outbound" => Some(Self::Outbound),
            _ => None,
        }
    }
}

/// One persisted conversation message; `message_id` is the idempotency key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub message_id: MessageId,
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
    pub direction: MessageDirection,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn from_envelope(envelope: &Envelope, direction: MessageDirection) -> Self {
        Self {
            message_id: envelope.message_id.clone(),
            tenant_id: envelope.tenant_id.clone(),
            user_id: envelope.user_id.clone(),
            session_id: envelope.session_id.clone(),
            direction,
            content: envelope.payload.content.clone(),
            created_at: envelope.timestamp,
        }
    }
}
