use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

use frontdesk_core::domain::action::{ActionContext, ActionType};

use super::{optional_str, required_str, ActionHandler, HandlerError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    Email,
    Sms,
    Call,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Call => "call",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: DeliveryChannel,
    pub tenant_id: String,
    pub location_id: Option<String>,
    pub recipient: String,
    pub subject: Option<String>,
    pub body: String,
    pub cc: Vec<String>,
    pub scheduled_at: Option<String>,
    pub duration_minutes: Option<i64>,
}

/// Outbound email, SMS and call-scheduling provider.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Returns the provider's delivery id.
    async fn deliver(&self, notification: &Notification) -> Result<String, HandlerError>;
}

/// Accepts every notification and logs it. Built with `recording`, it also keeps a
/// copy of each one for inspection.
#[derive(Clone, Default)]
pub struct LoggingNotificationGateway {
    delivered: Option<Arc<Mutex<Vec<Notification>>>>,
}

impl LoggingNotificationGateway {
    pub fn recording() -> Self {
        Self { delivered: Some(Arc::new(Mutex::new(Vec::new()))) }
    }

    pub fn delivered(&self) -> Vec<Notification> {
        let Some(delivered) = &self.delivered else {
            return Vec::new();
        };
        match delivered.lock() {
            Ok(delivered) => delivered.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl NotificationGateway for LoggingNotificationGateway {
    async fn deliver(&self, notification: &Notification) -> Result<String, HandlerError> {
        let delivery_id = Uuid::new_v4().to_string();
        info!(
            event_name = "dispatch.notification.delivered",
            tenant_id = %notification.tenant_id,
            channel = notification.channel.as_str(),
            delivery_id = %delivery_id,
            "notification handed to logging gateway"
        );
        if let Some(delivered) = &self.delivered {
            match delivered.lock() {
                Ok(mut delivered) => delivered.push(notification.clone()),
                Err(poisoned) => poisoned.into_inner().push(notification.clone()),
            }
        }
        Ok(delivery_id)
    }
}

pub struct CommunicationHandler {
    gateway: Arc<dyn NotificationGateway>,
}

impl CommunicationHandler {
    pub const ACTION_TYPES: &'static [&'static str] = &["send_email", "send_sms", "schedule_call"];

    pub fn new(gateway: Arc<dyn NotificationGateway>) -> Self {
        Self { gateway }
    }

    fn notification(
        action_type: &ActionType,
        parameters: &Map<String, Value>,
        context: &ActionContext,
    ) -> Result<Notification, HandlerError> {
        let recipient = required_str(parameters, "to")?.to_owned();
        let base = Notification {
            channel: DeliveryChannel::Email,
            tenant_id: context.tenant_id.clone(),
            location_id: context.location_id.clone(),
            recipient,
            subject: None,
            body: String::new(),
            cc: Vec::new(),
            scheduled_at: None,
            duration_minutes: None,
        };

        match action_type.as_str() {
            "send_email" => Ok(Notification {
                subject: Some(required_str(parameters, "subject")?.to_owned()),
                body: required_str(parameters, "body")?.to_owned(),
                cc: parameters
                    .get("cc")
                    .and_then(Value::as_array)
                    .map(|cc| cc.iter().filter_map(Value::as_str).map(str::to_owned).collect())
                    .unwrap_or_default(),
                ..base
            }),
            "send_sms" => Ok(Notification {
                channel: DeliveryChannel::Sms,
                body: required_str(parameters, "message")?.to_owned(),
                ..base
            }),
            "schedule_call" => {
                let duration = parameters.get("duration_minutes").and_then(Value::as_i64);
                if duration.is_some_and(|minutes| minutes <= 0) {
                    return Err(HandlerError::InvalidInput(
                        "`duration_minutes` must be positive".to_owned(),
                    ));
                }
                Ok(Notification {
                    channel: DeliveryChannel::Call,
                    body: optional_str(parameters, "notes").unwrap_or_default().to_owned(),
                    scheduled_at: Some(required_str(parameters, "scheduled_at")?.to_owned()),
                    duration_minutes: duration,
                    ..base
                })
            }
            other => Err(HandlerError::InvalidInput(format!(
                "communication handler cannot run `{other}`"
            ))),
        }
    }
}

#[async_trait]
impl ActionHandler for CommunicationHandler {
    async fn handle(
        &self,
        action_type: &ActionType,
        parameters: &Map<String, Value>,
        context: &ActionContext,
    ) -> Result<Value, HandlerError> {
        let notification = Self::notification(action_type, parameters, context)?;
        let delivery_id = self.gateway.deliver(&notification).await?;
        let status = match notification.channel {
            DeliveryChannel::Call => "scheduled",
            DeliveryChannel::Email | DeliveryChannel::Sms => "queued",
        };

        Ok(json!({
            "deliveryId": delivery_id,
            "channel": notification.channel.as_str(),
            "recipient": notification.recipient,
            "status": status,
        }))
    }
}
