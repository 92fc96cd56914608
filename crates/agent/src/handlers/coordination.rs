use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use frontdesk_core::domain::action::{ActionContext, ActionType};

use super::{optional_str, required_str, ActionHandler, HandlerError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    Approval,
    Escalation,
}

impl TicketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approval => "approval",
            Self::Escalation => "escalation",
        }
    }
}

/// Work item handed to a human: an approval request or an escalation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoordinationTicket {
    pub ticket_id: String,
    pub kind: TicketKind,
    pub tenant_id: String,
    pub requested_by: String,
    pub session_id: Option<String>,
    pub summary: String,
    /// Approver role for approvals, urgency for escalations.
    pub routing: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ApprovalQueue: Send + Sync {
    async fn enqueue(&self, ticket: CoordinationTicket) -> Result<CoordinationTicket, HandlerError>;
}

#[derive(Clone, Default)]
pub struct InMemoryApprovalQueue {
    tickets: Arc<Mutex<Vec<CoordinationTicket>>>,
}

impl InMemoryApprovalQueue {
    pub fn pending(&self, tenant_id: &str) -> Vec<CoordinationTicket> {
        let tickets = match self.tickets.lock() {
            Ok(tickets) => tickets.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        tickets.into_iter().filter(|ticket| ticket.tenant_id == tenant_id).collect()
    }
}

#[async_trait]
impl ApprovalQueue for InMemoryApprovalQueue {
    async fn enqueue(
        &self,
        ticket: CoordinationTicket,
    ) -> Result<CoordinationTicket, HandlerError> {
        match self.tickets.lock() {
            Ok(mut tickets) => tickets.push(ticket.clone()),
            Err(poisoned) => poisoned.into_inner().push(ticket.clone()),
        }
        Ok(ticket)
    }
}

pub struct CoordinationHandler {
    queue: Arc<dyn ApprovalQueue>,
}

impl CoordinationHandler {
    pub const ACTION_TYPES: &'static [&'static str] = &["request_approval", "escalate_to_human"];

    pub fn new(queue: Arc<dyn ApprovalQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl ActionHandler for CoordinationHandler {
    async fn handle(
        &self,
        action_type: &ActionType,
        parameters: &Map<String, Value>,
        context: &ActionContext,
    ) -> Result<Value, HandlerError> {
        let (kind, summary, routing) = match action_type.as_str() {
            "request_approval" => (
                TicketKind::Approval,
                required_str(parameters, "summary")?,
                optional_str(parameters, "approver_role").unwrap_or("manager"),
            ),
            "escalate_to_human" => (
                TicketKind::Escalation,
                required_str(parameters, "reason")?,
                optional_str(parameters, "urgency").unwrap_or("normal"),
            ),
            other => {
                return Err(HandlerError::InvalidInput(format!(
                    "coordination handler cannot run `{other}`"
                )))
            }
        };

        let ticket = self
            .queue
            .enqueue(CoordinationTicket {
                ticket_id: Uuid::new_v4().to_string(),
                kind,
                tenant_id: context.tenant_id.clone(),
                requested_by: context.user_id.clone(),
                session_id: context.session_id.clone(),
                summary: summary.to_owned(),
                routing: routing.to_owned(),
                details: parameters.get("details").cloned().unwrap_or(Value::Null),
                created_at: Utc::now(),
            })
            .await?;

        Ok(json!({
            "ticketId": ticket.ticket_id,
            "kind": ticket.kind.as_str(),
            "routing": ticket.routing,
            "status": "pending",
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use frontdesk_core::domain::action::{ActionContext, ActionType};

    use super::{CoordinationHandler, InMemoryApprovalQueue, TicketKind};
    use crate::handlers::ActionHandler;

    #[tokio::test]
    async fn escalation_lands_in_the_tenant_queue() {
        let queue = InMemoryApprovalQueue::default();
        let handler = CoordinationHandler::new(Arc::new(queue.clone()));
        let context = ActionContext {
            tenant_id: "gym-4".to_owned(),
            user_id: "member-8".to_owned(),
            location_id: None,
            session_id: Some("s-9".to_owned()),
        };

        let result = handler
            .handle(
                &ActionType::new("escalate_to_human"),
                json!({ "reason": "billing dispute", "urgency": "high" })
                    .as_object()
                    .expect("object"),
                &context,
            )
            .await
            .expect("escalate");

        assert_eq!(result["kind"], "escalation");
        assert_eq!(result["status"], "pending");
        let pending = queue.pending("gym-4");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, TicketKind::Escalation);
        assert_eq!(pending[0].routing, "high");
        assert_eq!(pending[0].session_id.as_deref(), Some("s-9"));
        assert!(queue.pending("gym-5").is_empty());
    }
}
