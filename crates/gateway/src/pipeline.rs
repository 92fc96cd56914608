//! Per-message state machine: claim, persist, decide, dispatch, reply, publish.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use frontdesk_agent::decision::{DecisionEngine, DecisionError, DecisionInput};
use frontdesk_agent::dispatcher::ActionDispatcher;
use frontdesk_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use frontdesk_core::dedup::{DedupClaim, DedupError, DedupState, DedupStore};
use frontdesk_core::domain::action::{ActionExecutionResult, DecisionResult};
use frontdesk_core::domain::conversation::{ConversationMessage, MessageDirection};
use frontdesk_core::domain::envelope::{ConversationTurn, Envelope, EnvelopeType};
use frontdesk_core::errors::ApplicationError;
use frontdesk_db::repositories::{ConversationRepository, RepositoryError};

use crate::bus::{BusError, MessageBus};
use crate::events::{EnvelopeHandler, HandlerOutcome};
use crate::responder::{ResponseError, ResponseGenerator};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Dedup(#[from] DedupError),
    #[error(transparent)]
    Persistence(#[from] RepositoryError),
    #[error(transparent)]
    Decision(#[from] DecisionError),
    #[error(transparent)]
    Response(#[from] ResponseError),
    #[error(transparent)]
    Publish(#[from] BusError),
}

impl From<PipelineError> for ApplicationError {
    fn from(value: PipelineError) -> Self {
        match value {
            PipelineError::Dedup(error) => error.into(),
            PipelineError::Persistence(error) => Self::Persistence(error.to_string()),
            PipelineError::Decision(error) => error.into(),
            PipelineError::Response(error) => Self::Integration(error.to_string()),
            PipelineError::Publish(error) => Self::Integration(error.to_string()),
        }
    }
}

pub struct MessagePipeline {
    dedup: Arc<dyn DedupStore>,
    conversations: Arc<dyn ConversationRepository>,
    engine: Arc<DecisionEngine>,
    dispatcher: Arc<ActionDispatcher>,
    responder: Arc<dyn ResponseGenerator>,
    bus: Arc<dyn MessageBus>,
    audit: Arc<dyn AuditSink>,
    outbound_topic: String,
    history_turns: usize,
}

pub struct MessagePipelineParts {
    pub dedup: Arc<dyn DedupStore>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub engine: Arc<DecisionEngine>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub responder: Arc<dyn ResponseGenerator>,
    pub bus: Arc<dyn MessageBus>,
    pub audit: Arc<dyn AuditSink>,
    pub outbound_topic: String,
    pub history_turns: usize,
}

/// How far a failed message got; decides whether a redelivery may retry it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Progress {
    NothingDispatched,
    Dispatched,
}

impl MessagePipeline {
    pub fn new(parts: MessagePipelineParts) -> Self {
        Self {
            dedup: parts.dedup,
            conversations: parts.conversations,
            engine: parts.engine,
            dispatcher: parts.dispatcher,
            responder: parts.responder,
            bus: parts.bus,
            audit: parts.audit,
            outbound_topic: parts.outbound_topic,
            history_turns: parts.history_turns,
        }
    }

    pub async fn process(&self, inbound: &Envelope) -> Result<HandlerOutcome, PipelineError> {
        let message_id = &inbound.message_id;
        let audit = AuditContext::new(
            inbound.tenant_id.clone(),
            Some(inbound.session_id.clone()),
            message_id.as_str(),
            inbound.user_id.clone(),
        );

        if let DedupClaim::Duplicate(state) = self.dedup.claim(message_id).await? {
            info!(
                event_name = "ingress.bus.duplicate_skipped",
                tenant_id = %inbound.tenant_id,
                message_id = %message_id.as_str(),
                state = state.as_str(),
                "message already seen inside dedup window"
            );
            self.audit.emit(
                audit
                    .event(
                        "ingress.message.duplicate",
                        AuditCategory::Ingress,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("state", state.as_str()),
            );
            return Ok(HandlerOutcome::Duplicate);
        }

        let mut progress = Progress::NothingDispatched;
        match self.respond(inbound, &mut progress).await {
            Ok(outbound) => {
                if let Err(error) = self.dedup.mark(message_id, DedupState::Responded).await {
                    warn!(
                        event_name = "ingress.dedup.mark_failed",
                        message_id = %message_id.as_str(),
                        error = %error,
                        "response published but dedup state not updated"
                    );
                }
                self.audit.emit(
                    audit
                        .event(
                            "egress.message.responded",
                            AuditCategory::Ingress,
                            AuditOutcome::Success,
                        )
                        .with_metadata("response_message_id", outbound.message_id.as_str()),
                );
                Ok(HandlerOutcome::Responded(Box::new(outbound)))
            }
            Err(error) => {
                let settled = match progress {
                    Progress::NothingDispatched => self.dedup.release(message_id).await,
                    Progress::Dispatched => self.dedup.mark(message_id, DedupState::Failed).await,
                };
                if let Err(dedup_error) = settled {
                    warn!(
                        event_name = "ingress.dedup.settle_failed",
                        message_id = %message_id.as_str(),
                        error = %dedup_error,
                        "could not settle dedup entry after failure"
                    );
                }
                let retryable = progress == Progress::NothingDispatched;
                self.audit.emit(
                    audit
                        .event(
                            "ingress.message.failed",
                            AuditCategory::Ingress,
                            AuditOutcome::Failed,
                        )
                        .with_metadata("error", error.to_string())
                        .with_metadata("retryable", retryable.to_string()),
                );
                Err(error)
            }
        }
    }

    async fn respond(
        &self,
        inbound: &Envelope,
        progress: &mut Progress,
    ) -> Result<Envelope, PipelineError> {
        self.conversations
            .create_message(ConversationMessage::from_envelope(
                inbound,
                MessageDirection::Inbound,
            ))
            .await?;

        let history = self.history(inbound).await?;
        let input = DecisionInput::from_envelope(inbound).with_fallback_history(history);
        let decision = self.engine.decide(&input).await?;

        if !decision.actions.is_empty() {
            *progress = Progress::Dispatched;
        }
        let results = self.dispatch_all(inbound, &decision).await;

        let reply = self.responder.generate(inbound, &decision, &results).await?;
        let outbound =
            Envelope::response_to(inbound, reply, response_context(inbound, &decision, &results));

        self.conversations
            .create_message(ConversationMessage::from_envelope(
                &outbound,
                MessageDirection::Outbound,
            ))
            .await?;
        self.bus.publish(&self.outbound_topic, &outbound).await?;

        info!(
            event_name = "egress.bus.response_published",
            tenant_id = %inbound.tenant_id,
            session_id = %inbound.session_id,
            message_id = %inbound.message_id.as_str(),
            response_message_id = %outbound.message_id.as_str(),
            actions = results.len(),
            decision_level = decision.decision_level.as_str(),
            "response published"
        );
        Ok(outbound)
    }

    /// Earlier turns of the session, excluding the message being processed.
    async fn history(&self, inbound: &Envelope) -> Result<Vec<ConversationTurn>, PipelineError> {
        let limit = u32::try_from(self.history_turns.saturating_add(1)).unwrap_or(u32::MAX);
        let stored = self
            .conversations
            .list_session(&inbound.tenant_id, &inbound.session_id, limit)
            .await?;
        let mut turns: Vec<ConversationTurn> = stored
            .into_iter()
            .filter(|message| message.message_id != inbound.message_id)
            .map(|message| ConversationTurn {
                role: match message.direction {
                    MessageDirection::Inbound => "user".to_owned(),
                    MessageDirection::Outbound => "assistant".to_owned(),
                },
                content: message.content,
            })
            .collect();
        let excess = turns.len().saturating_sub(self.history_turns);
        turns.drain(..excess);
        Ok(turns)
    }

    /// Each action runs on its own; one failure does not stop the others.
    async fn dispatch_all(
        &self,
        inbound: &Envelope,
        decision: &DecisionResult,
    ) -> Vec<ActionExecutionResult> {
        let mut results = Vec::with_capacity(decision.actions.len());
        for action in &decision.actions {
            let mut request = action.clone();
            request.metadata = Some(json!({
                "correlationId": inbound.message_id.as_str(),
                "decisionLevel": decision.decision_level.as_str(),
            }));
            results.push(self.dispatcher.execute(request).await);
        }
        results
    }
}

fn response_context(
    inbound: &Envelope,
    decision: &DecisionResult,
    results: &[ActionExecutionResult],
) -> serde_json::Value {
    json!({
        "inReplyTo": inbound.message_id.as_str(),
        "decisionLevel": decision.decision_level.as_str(),
        "requiresHumanInput": decision.requires_human_input,
        "confidence": decision.confidence,
        "actions": results
            .iter()
            .map(|result| json!({
                "type": result.action_type.as_str(),
                "success": result.success,
                "tokensUsed": result.tokens_used,
            }))
            .collect::<Vec<_>>(),
        "excluded": decision
            .excluded
            .iter()
            .map(|excluded| json!({
                "type": excluded.action_type.as_str(),
                "reason": excluded.reason.as_str(),
            }))
            .collect::<Vec<_>>(),
    })
}

#[async_trait]
impl EnvelopeHandler for MessagePipeline {
    fn envelope_type(&self) -> EnvelopeType {
        EnvelopeType::UserMessage
    }

    async fn handle(&self, envelope: &Envelope) -> Result<HandlerOutcome, PipelineError> {
        self.process(envelope).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use frontdesk_agent::authz::StaticPermissionResolver;
    use frontdesk_agent::decision::DecisionEngine;
    use frontdesk_agent::dispatcher::ActionDispatcher;
    use frontdesk_agent::handlers::communication::LoggingNotificationGateway;
    use frontdesk_agent::handlers::coordination::InMemoryApprovalQueue;
    use frontdesk_agent::handlers::resources::InMemoryResourceService;
    use frontdesk_agent::handlers::HandlerRegistry;
    use frontdesk_agent::llm::ScriptedLlmClient;
    use frontdesk_core::audit::InMemoryAuditSink;
    use frontdesk_core::catalog::ActionCatalog;
    use frontdesk_core::dedup::{DedupClaim, DedupState, DedupStore, InMemoryDedupCache};
    use frontdesk_core::domain::envelope::{Envelope, EnvelopePayload, EnvelopeType, MessageId};
    use frontdesk_core::domain::policy::PolicyEntry;
    use frontdesk_core::ledger::{OperationCostTable, ResourceLedger};
    use frontdesk_core::policy::PolicyStore;
    use frontdesk_db::repositories::InMemoryConversationRepository;

    use super::{MessagePipeline, MessagePipelineParts, PipelineError};
    use crate::bus::InMemoryBus;
    use crate::events::HandlerOutcome;
    use crate::responder::SummaryResponseGenerator;

    const OUTBOUND: &str = "agent.outbound";

    struct Harness {
        pipeline: MessagePipeline,
        llm: Arc<ScriptedLlmClient>,
        ledger: ResourceLedger,
        dedup: Arc<InMemoryDedupCache>,
        conversations: Arc<InMemoryConversationRepository>,
        notifications: LoggingNotificationGateway,
        bus: InMemoryBus,
        audit: Arc<InMemoryAuditSink>,
    }

    fn harness(llm: ScriptedLlmClient) -> Harness {
        let costs = OperationCostTable::default();
        let catalog = Arc::new(ActionCatalog::standard(&costs));
        let ledger = ResourceLedger::in_memory(costs);
        let llm = Arc::new(llm);
        let audit = Arc::new(InMemoryAuditSink::default());
        let notifications = LoggingNotificationGateway::recording();
        let handlers = HandlerRegistry::builtin(
            Arc::new(notifications.clone()),
            Arc::new(InMemoryResourceService::default()),
            Arc::new(InMemoryApprovalQueue::default()),
        );
        let engine = DecisionEngine::new(
            catalog.clone(),
            ledger.clone(),
            Arc::new(PolicyStore::with_default(PolicyEntry::allow_all())),
            Arc::new(StaticPermissionResolver::new(vec!["*".to_owned()])),
            llm.clone(),
            "test-model",
        );
        let dispatcher =
            ActionDispatcher::new(catalog, Arc::new(handlers), ledger.clone(), audit.clone());
        let dedup = Arc::new(InMemoryDedupCache::new(3600));
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let bus = InMemoryBus::recording(2);

        let pipeline = MessagePipeline::new(MessagePipelineParts {
            dedup: dedup.clone(),
            conversations: conversations.clone(),
            engine: Arc::new(engine),
            dispatcher: Arc::new(dispatcher),
            responder: Arc::new(SummaryResponseGenerator),
            bus: Arc::new(bus.clone()),
            audit: audit.clone(),
            outbound_topic: OUTBOUND.to_owned(),
            history_turns: 10,
        });
        Harness { pipeline, llm, ledger, dedup, conversations, notifications, bus, audit }
    }

    fn sms_proposal() -> String {
        json!({
            "actions": [
                {
                    "type": "send_sms",
                    "parameters": { "to": "+15550100", "message": "See you at 3" }
                }
            ],
            "reasoning": "confirm the booking",
            "confidence": 90
        })
        .to_string()
    }

    fn inbound(content: &str) -> Envelope {
        Envelope {
            tenant_id: "salon-2".to_owned(),
            user_id: "client-5".to_owned(),
            session_id: "s-77".to_owned(),
            message_id: MessageId::generate(),
            envelope_type: EnvelopeType::UserMessage,
            payload: EnvelopePayload { content: content.to_owned(), context: json!({}) },
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn redelivered_message_is_answered_once() {
        let harness = harness(ScriptedLlmClient::new().with_response(sms_proposal()));
        harness.ledger.credit("salon-2", None, 10).await.expect("credit");
        let message = inbound("Can you confirm my 3pm?");

        let first = harness.pipeline.process(&message).await.expect("first delivery");
        let second = harness.pipeline.process(&message).await.expect("second delivery");

        let HandlerOutcome::Responded(reply) = first else {
            panic!("first delivery should be answered");
        };
        assert_eq!(reply.payload.content, "Done: send sms.");
        assert_eq!(reply.payload.context["inReplyTo"], message.message_id.as_str());
        assert_eq!(reply.payload.context["decisionLevel"], "AUTOMATIC");
        assert!(matches!(second, HandlerOutcome::Duplicate));

        assert_eq!(harness.bus.published(OUTBOUND).len(), 1);
        assert_eq!(harness.conversations.len().await, 2);
        assert_eq!(harness.notifications.delivered().len(), 1);
        assert_eq!(harness.llm.prompts().len(), 1);
        let account = harness.ledger.get_or_create("salon-2", None).await.expect("account");
        assert_eq!(account.available, 7);
        assert_eq!(
            harness.dedup.claim(&message.message_id).await.expect("claim"),
            DedupClaim::Duplicate(DedupState::Responded)
        );
        assert_eq!(harness.audit.events_of_type("ingress.message.duplicate").len(), 1);
    }

    #[tokio::test]
    async fn failure_before_dispatch_lets_redelivery_retry() {
        let harness = harness(
            ScriptedLlmClient::new().with_failure("model offline").with_response(sms_proposal()),
        );
        harness.ledger.credit("salon-2", None, 10).await.expect("credit");
        let message = inbound("Can you confirm my 3pm?");

        let error = harness.pipeline.process(&message).await.expect_err("model is down");
        assert!(matches!(error, PipelineError::Decision(_)));
        assert!(harness.bus.published(OUTBOUND).is_empty());

        let retried = harness.pipeline.process(&message).await.expect("redelivery");
        assert!(matches!(retried, HandlerOutcome::Responded(_)));
        assert_eq!(harness.bus.published(OUTBOUND).len(), 1);
        assert_eq!(harness.notifications.delivered().len(), 1);
    }

    #[tokio::test]
    async fn failed_action_does_not_stop_the_next_one() {
        let proposal = json!({
            "actions": [
                {
                    "type": "update_resource",
                    "parameters": {
                        "resource_type": "appointment",
                        "resource_id": "missing-appt",
                        "data": { "time": "15:00" }
                    }
                },
                {
                    "type": "send_sms",
                    "parameters": { "to": "+15550100", "message": "See you at 3" }
                }
            ],
            "reasoning": "move the booking and confirm",
            "confidence": 90
        })
        .to_string();
        let harness = harness(ScriptedLlmClient::new().with_response(proposal));
        harness.ledger.credit("salon-2", None, 10).await.expect("credit");

        let outcome =
            harness.pipeline.process(&inbound("Move me to 3pm please")).await.expect("process");

        let HandlerOutcome::Responded(reply) = outcome else {
            panic!("message should be answered");
        };
        assert_eq!(harness.notifications.delivered().len(), 1);
        assert_eq!(harness.bus.published(OUTBOUND).len(), 1);
        let actions = &reply.payload.context["actions"];
        assert_eq!(actions[0]["type"], "update_resource");
        assert_eq!(actions[0]["success"], false);
        assert_eq!(actions[0]["tokensUsed"], 0);
        assert_eq!(actions[1]["type"], "send_sms");
        assert_eq!(actions[1]["success"], true);
        assert!(reply.payload.content.contains("I couldn't complete: update resource."));
        let account = harness.ledger.get_or_create("salon-2", None).await.expect("account");
        assert_eq!(account.available, 7);
    }

    #[tokio::test]
    async fn earlier_turns_reach_the_prompt() {
        let idle = json!({ "actions": [], "reasoning": "", "confidence": 50 }).to_string();
        let harness =
            harness(ScriptedLlmClient::new().with_response(sms_proposal()).with_response(idle));
        harness.ledger.credit("salon-2", None, 10).await.expect("credit");

        harness.pipeline.process(&inbound("Can you confirm my 3pm?")).await.expect("first");
        harness.pipeline.process(&inbound("Thanks, see you then")).await.expect("second");

        let prompts = harness.llm.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[0].contains("Done: send sms."));
        assert!(prompts[1].contains("Can you confirm my 3pm?"));
        assert!(prompts[1].contains("Done: send sms."));
    }
}
