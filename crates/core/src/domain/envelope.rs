use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeType {
    #[serde(rename = "user.message")]
    UserMessage,
    #[serde(rename = "agent.response")]
    AgentResponse,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user.message",
            Self::AgentResponse => "agent.response",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvelopePayload {
    pub content: String,
    #[serde(default)]
    pub context: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: String,
    pub message_id: MessageId,
    #[serde(rename = "type")]
    pub envelope_type: EnvelopeType,
    pub payload: EnvelopePayload,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Builds the outbound reply for `inbound`, keeping its tenant/user/session correlation.
    pub fn response_to(inbound: &Envelope, content: impl Into<String>, context: Value) -> Self {
        Self {
            tenant_id: inbound.tenant_id.clone(),
            user_id: inbound.user_id.clone(),
            session_id: inbound.session_id.clone(),
            message_id: MessageId::generate(),
            envelope_type: EnvelopeType::AgentResponse,
            payload: EnvelopePayload { content: content.into(), context },
            timestamp: Utc::now(),
        }
    }

    /// Messages sharing a key stay on one partition, so a conversation is consumed in order.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.tenant_id, self.session_id)
    }
}

/// Structured view over `payload.context`. Every field is optional because the
/// conversational front-ends populate it inconsistently.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageContext {
    pub location_id: Option<String>,
    pub permissions: Option<Vec<String>>,
    pub business_type: Option<String>,
    pub history: Vec<ConversationTurn>,
    pub raw: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

impl MessageContext {
    pub fn from_value(raw: &Value) -> Self {
        let location_id = string_field(raw, &["locationId", "location_id"]);
        let business_type = string_field(raw, &["businessType", "business_type"]);
        let permissions = raw.get("permissions").and_then(Value::as_array).map(|values| {
            values.iter().filter_map(Value::as_str).map(str::to_owned).collect::<Vec<_>>()
        });
        let history = ["conversationHistory", "history"]
            .iter()
            .find_map(|key| raw.get(*key).and_then(Value::as_array))
            .map(|turns| turns.iter().filter_map(parse_turn).collect())
            .unwrap_or_default();

        Self { location_id, permissions, business_type, history, raw: raw.clone() }
    }
}

fn string_field(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| raw.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn parse_turn(value: &Value) -> Option<ConversationTurn> {
    let content = value.get("content").and_then(Value::as_str)?;
    let role = value.get("role").and_then(Value::as_str).unwrap_or("user");
    Some(ConversationTurn { role: role.to_owned(), content: content.to_owned() })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Envelope, EnvelopeType, MessageContext};

    #[test]
    fn envelope_decodes_wire_shape() {
        let envelope: Envelope = serde_json::from_value(json!({
            "tenantId": "dental-1",
            "userId": "patient-9",
            "sessionId": "s-1",
            "messageId": "m-1",
            "type": "user.message",
            "payload": { "content": "Can I move my cleaning to Friday?", "context": {} },
            "timestamp": "2026-03-01T10:00:00Z"
        }))
        .expect("envelope should decode");

        assert_eq!(envelope.envelope_type, EnvelopeType::UserMessage);
        assert_eq!(envelope.message_id.as_str(), "m-1");
        assert_eq!(envelope.partition_key(), "dental-1:s-1");
    }

    #[test]
    fn response_keeps_correlation_with_fresh_message_id() {
        let inbound: Envelope = serde_json::from_value(json!({
            "tenantId": "gym-2",
            "userId": "member-4",
            "sessionId": "s-7",
            "messageId": "m-42",
            "type": "user.message",
            "payload": { "content": "hi" },
            "timestamp": "2026-03-01T10:00:00Z"
        }))
        .expect("envelope should decode");

        let reply = Envelope::response_to(&inbound, "hello", json!({}));

        assert_eq!(reply.envelope_type, EnvelopeType::AgentResponse);
        assert_eq!(reply.tenant_id, "gym-2");
        assert_eq!(reply.session_id, "s-7");
        assert_ne!(reply.message_id, inbound.message_id);
        let encoded = serde_json::to_value(&reply).expect("encode");
        assert_eq!(encoded["type"], "agent.response");
    }

    #[test]
    fn context_parsing_tolerates_missing_and_mistyped_fields() {
        let context = MessageContext::from_value(&json!({
            "locationId": "  downtown ",
            "permissions": ["communication:send", 7, "resources:write"],
            "conversationHistory": [
                { "role": "user", "content": "Do you have rooms?" },
                { "role": "assistant" },
                { "content": "For two nights" }
            ]
        }));

        assert_eq!(context.location_id.as_deref(), Some("downtown"));
        assert_eq!(
            context.permissions,
            Some(vec!["communication:send".to_owned(), "resources:write".to_owned()])
        );
        assert_eq!(context.history.len(), 2);
        assert_eq!(context.history[1].role, "user");

        let empty = MessageContext::from_value(&json!(null));
        assert!(empty.permissions.is_none());
        assert!(empty.history.is_empty());
    }
}
