use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use frontdesk_agent::llm::{LlmClient, LlmError};
use frontdesk_core::domain::action::{ActionExecutionResult, DecisionResult};
use frontdesk_core::domain::envelope::Envelope;

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error(transparent)]
    Model(#[from] LlmError),
}

/// Produces the participant-facing reply text for a processed message.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(
        &self,
        inbound: &Envelope,
        decision: &DecisionResult,
        results: &[ActionExecutionResult],
    ) -> Result<String, ResponseError>;
}

/// Deterministic reply built from the decision and the execution results.
#[derive(Clone, Copy, Debug, Default)]
pub struct SummaryResponseGenerator;

impl SummaryResponseGenerator {
    pub fn summarize(decision: &DecisionResult, results: &[ActionExecutionResult]) -> String {
        let completed: Vec<&str> = results
            .iter()
            .filter(|result| result.success)
            .map(|result| result.action_type.as_str())
            .collect();
        let failed: Vec<&str> = results
            .iter()
            .filter(|result| !result.success)
            .map(|result| result.action_type.as_str())
            .collect();

        if results.is_empty() && !decision.requires_human_input {
            return "Thanks for your message. A member of our team will follow up if \
                    anything else is needed."
                .to_owned();
        }

        let mut reply = String::new();
        if !completed.is_empty() {
            let _ = write!(reply, "Done: {}.", humanize(&completed));
        }
        if !failed.is_empty() {
            let _ = write!(
                reply,
                "{}I couldn't complete: {}.",
                if reply.is_empty() { "" } else { " " },
                humanize(&failed)
            );
        }
        if decision.requires_human_input {
            let _ = write!(
                reply,
                "{}I've passed your request to our team for review.",
                if reply.is_empty() { "" } else { " " }
            );
        }
        reply
    }
}

#[async_trait]
impl ResponseGenerator for SummaryResponseGenerator {
    async fn generate(
        &self,
        _inbound: &Envelope,
        decision: &DecisionResult,
        results: &[ActionExecutionResult],
    ) -> Result<String, ResponseError> {
        Ok(Self::summarize(decision, results))
    }
}

/// Asks the model to phrase the reply; falls back to the summary when the model
/// fails or answers with nothing.
pub struct LlmResponseGenerator {
    llm: Arc<dyn LlmClient>,
}

impl LlmResponseGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn prompt(inbound: &Envelope, decision: &DecisionResult, summary: &str) -> String {
        format!(
            "Write a short, friendly reply to a customer of a small business.\n\
             Customer message: {}\n\
             What was done: {}\n\
             Needs staff review: {}\n\
             Reply with the message text only.",
            inbound.payload.content,
            summary,
            if decision.requires_human_input { "yes" } else { "no" }
        )
    }
}

#[async_trait]
impl ResponseGenerator for LlmResponseGenerator {
    async fn generate(
        &self,
        inbound: &Envelope,
        decision: &DecisionResult,
        results: &[ActionExecutionResult],
    ) -> Result<String, ResponseError> {
        let summary = SummaryResponseGenerator::summarize(decision, results);
        match self.llm.complete(&Self::prompt(inbound, decision, &summary)).await {
            Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_owned()),
            Ok(_) => Ok(summary),
            Err(error) => {
                warn!(
                    event_name = "egress.reply.llm_fallback",
                    tenant_id = %inbound.tenant_id,
                    message_id = %inbound.message_id.as_str(),
                    error = %error,
                    "reply model failed, using summary"
                );
                Ok(summary)
            }
        }
    }
}

fn humanize(items: &[&str]) -> String {
    items.iter().map(|item| item.replace('_', " ")).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use frontdesk_agent::llm::ScriptedLlmClient;
    use frontdesk_core::domain::action::{
        ActionErrorKind, ActionExecutionResult, ActionType, DecisionLevel, DecisionResult,
    };
    use frontdesk_core::domain::envelope::{Envelope, EnvelopePayload, EnvelopeType, MessageId};

    use super::{LlmResponseGenerator, ResponseGenerator, SummaryResponseGenerator};

    fn decision(level: DecisionLevel) -> DecisionResult {
        DecisionResult {
            actions: Vec::new(),
            decision_level: level,
            reasoning: String::new(),
            confidence: 70,
            requires_human_input: level != DecisionLevel::Automatic,
            excluded: Vec::new(),
        }
    }

    fn success(action_type: &str) -> ActionExecutionResult {
        ActionExecutionResult {
            action_type: ActionType::new(action_type),
            success: true,
            result: Some(json!({})),
            tokens_used: 1,
            charged: true,
            execution_time_ms: 3,
            error: None,
            error_kind: None,
        }
    }

    fn inbound() -> Envelope {
        Envelope {
            tenant_id: "dental-1".to_owned(),
            user_id: "patient-1".to_owned(),
            session_id: "s-1".to_owned(),
            message_id: MessageId::generate(),
            envelope_type: EnvelopeType::UserMessage,
            payload: EnvelopePayload { content: "Move my visit".to_owned(), context: json!({}) },
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn summary_lists_outcomes_and_review() {
        let results = vec![
            success("send_sms"),
            ActionExecutionResult::failure(
                ActionType::new("schedule_call"),
                ActionErrorKind::ExternalCollaborator,
                "timeout",
                30,
            ),
        ];

        let text =
            SummaryResponseGenerator::summarize(&decision(DecisionLevel::Consultation), &results);

        assert_eq!(
            text,
            "Done: send sms. I couldn't complete: schedule call. \
             I've passed your request to our team for review."
        );
    }

    #[test]
    fn summary_without_actions_is_an_acknowledgement() {
        let text = SummaryResponseGenerator::summarize(&decision(DecisionLevel::Automatic), &[]);
        assert!(text.starts_with("Thanks for your message."));
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_summary() {
        let generator =
            LlmResponseGenerator::new(Arc::new(ScriptedLlmClient::new().with_failure("down")));

        let text = generator
            .generate(&inbound(), &decision(DecisionLevel::Automatic), &[success("send_email")])
            .await
            .expect("reply");

        assert_eq!(text, "Done: send email.");
    }

    #[tokio::test]
    async fn model_reply_is_trimmed() {
        let llm = Arc::new(ScriptedLlmClient::new().with_response("  All set for Friday!  "));
        let generator = LlmResponseGenerator::new(llm.clone());

        let text = generator
            .generate(&inbound(), &decision(DecisionLevel::Automatic), &[success("send_sms")])
            .await
            .expect("reply");

        assert_eq!(text, "All set for Friday!");
        assert!(llm.prompts()[0].contains("Move my visit"));
    }
}
