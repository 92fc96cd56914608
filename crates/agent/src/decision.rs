//! Turns one inbound message into a filtered, priced set of proposed actions.
//!
//! The model is asked exactly once per call. Everything it returns is treated as
//! untrusted input: each proposal is checked against the catalog, the caller's
//! permissions, tenant policy, the ledger and the suggestion rate cap, and every
//! proposal that does not survive is reported in `DecisionResult::excluded`.

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use frontdesk_core::catalog::ActionCatalog;
use frontdesk_core::domain::action::{
    ActionContext, ActionDefinition, ActionRequest, ActionType, DecisionLevel, DecisionResult,
    ExcludedAction, ExclusionReason, Priority,
};
use frontdesk_core::domain::envelope::{ConversationTurn, Envelope, MessageContext};
use frontdesk_core::errors::{ApplicationError, DomainError};
use frontdesk_core::ledger::ResourceLedger;
use frontdesk_core::policy::PolicyStore;

use crate::authz::{AuthzError, PermissionResolver};
use crate::guardrails::{GuardrailDecision, PolicyGuardrail};
use crate::llm::{LlmClient, LlmError};
use crate::prompt::{PromptBuilder, PromptError, PromptInput};

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("model `{model}` is not allowed for tenant `{tenant_id}`")]
    ModelNotAllowed { tenant_id: String, model: String },
    #[error(transparent)]
    Permissions(#[from] AuthzError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Model(#[from] LlmError),
}

impl From<DecisionError> for ApplicationError {
    fn from(value: DecisionError) -> Self {
        match value {
            DecisionError::ModelNotAllowed { .. } => {
                Self::Domain(DomainError::Authorization(value.to_string()))
            }
            DecisionError::Prompt(error) => {
                Self::Domain(DomainError::InvariantViolation(error.to_string()))
            }
            DecisionError::Permissions(error) => Self::Integration(error.to_string()),
            DecisionError::Model(error) => Self::Integration(error.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DecisionInput {
    pub tenant_id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub message: String,
    pub context: MessageContext,
}

impl DecisionInput {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            tenant_id: envelope.tenant_id.clone(),
            user_id: envelope.user_id.clone(),
            session_id: Some(envelope.session_id.clone()),
            message: envelope.payload.content.clone(),
            context: MessageContext::from_value(&envelope.payload.context),
        }
    }

    /// Uses `history` unless the message already carried its own.
    pub fn with_fallback_history(mut self, history: Vec<ConversationTurn>) -> Self {
        if self.context.history.is_empty() {
            self.context.history = history;
        }
        self
    }

    fn action_context(&self) -> ActionContext {
        ActionContext {
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            location_id: self.context.location_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}

pub struct DecisionEngine {
    catalog: Arc<ActionCatalog>,
    ledger: ResourceLedger,
    guardrail: PolicyGuardrail,
    permissions: Arc<dyn PermissionResolver>,
    llm: Arc<dyn LlmClient>,
    prompt: PromptBuilder,
    model: String,
}

impl DecisionEngine {
    pub fn new(
        catalog: Arc<ActionCatalog>,
        ledger: ResourceLedger,
        policies: Arc<PolicyStore>,
        permissions: Arc<dyn PermissionResolver>,
        llm: Arc<dyn LlmClient>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            catalog,
            ledger,
            guardrail: PolicyGuardrail::new(policies),
            permissions,
            llm,
            prompt: PromptBuilder::default(),
            model: model.into(),
        }
    }

    pub fn with_prompt_builder(mut self, prompt: PromptBuilder) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn catalog(&self) -> &ActionCatalog {
        &self.catalog
    }

    pub async fn decide(&self, input: &DecisionInput) -> Result<DecisionResult, DecisionError> {
        let tenant_id = input.tenant_id.as_str();
        if !self.guardrail.model_allowed(tenant_id, &self.model) {
            return Err(DecisionError::ModelNotAllowed {
                tenant_id: tenant_id.to_owned(),
                model: self.model.clone(),
            });
        }

        let permissions = match &input.context.permissions {
            Some(permissions) => permissions.clone(),
            None => {
                self.permissions
                    .get_user_permissions(
                        tenant_id,
                        &input.user_id,
                        input.context.location_id.as_deref(),
                    )
                    .await?
            }
        };
        let permitted = self.catalog.permitted_for(&permissions);

        let prompt = self.prompt.build(&PromptInput {
            tenant_id,
            business_type: input.context.business_type.as_deref(),
            message: &input.message,
            context: &input.context.raw,
            history: &input.context.history,
            actions: &permitted,
        })?;

        let raw = self.llm.complete(&prompt).await?;
        let Some(response) = ModelResponse::parse(&raw) else {
            warn!(
                event_name = "decision.model.parse_failure",
                tenant_id,
                response_len = raw.len(),
                "model response was not a JSON object"
            );
            return Ok(DecisionResult::parse_failure());
        };

        let action_context = input.action_context();
        let mut actions = Vec::new();
        let mut levels = Vec::new();
        let mut excluded = Vec::new();

        for element in &response.actions {
            match self.screen(element, &permitted, &action_context).await {
                Ok((request, level)) => {
                    levels.push(level);
                    actions.push(request);
                }
                Err(exclusion) => {
                    warn!(
                        event_name = "decision.action.excluded",
                        tenant_id,
                        action_type = %exclusion.action_type,
                        reason = exclusion.reason.as_str(),
                        detail = %exclusion.detail,
                        "proposed action excluded"
                    );
                    excluded.push(exclusion);
                }
            }
        }

        let decision_level = DecisionLevel::aggregate(levels);
        info!(
            event_name = "decision.engine.completed",
            tenant_id,
            proposed = response.actions.len(),
            accepted = actions.len(),
            excluded = excluded.len(),
            decision_level = decision_level.as_str(),
            confidence = response.confidence,
            "decision completed"
        );

        Ok(DecisionResult {
            actions,
            decision_level,
            reasoning: response.reasoning,
            confidence: response.confidence,
            requires_human_input: decision_level != DecisionLevel::Automatic,
            excluded,
        })
    }

    /// Runs one proposal through every gate, in order. The rate cap comes last so
    /// that only proposals that would otherwise be returned consume a unit.
    async fn screen(
        &self,
        element: &Value,
        permitted: &[&ActionDefinition],
        context: &ActionContext,
    ) -> Result<(ActionRequest, DecisionLevel), ExcludedAction> {
        let proposal = Proposal::parse(element)?;
        let action_type = proposal.action_type;

        let Some(definition) = self.catalog.get(&action_type) else {
            return Err(exclude(action_type, ExclusionReason::UnknownAction, "not in catalog"));
        };
        if !permitted.iter().any(|allowed| allowed.action_type == action_type) {
            return Err(exclude(
                action_type,
                ExclusionReason::NotPermitted,
                "caller lacks the required permissions",
            ));
        }

        let report = self.catalog.validate_parameters(&action_type, &proposal.parameters);
        if !report.valid {
            return Err(exclude(
                action_type,
                ExclusionReason::InvalidParameters,
                report.errors.join("; "),
            ));
        }

        if let GuardrailDecision::Deny { reason, detail } =
            self.guardrail.evaluate_access(&context.tenant_id, definition)
        {
            return Err(exclude(action_type, reason, detail));
        }

        match self
            .ledger
            .check_availability(
                &context.tenant_id,
                context.location_id.as_deref(),
                &definition.operation,
            )
            .await
        {
            Ok(availability) if availability.sufficient => {}
            Ok(availability) => {
                return Err(exclude(
                    action_type,
                    ExclusionReason::InsufficientTokens,
                    format!(
                        "requires {} tokens, {} available",
                        availability.required, availability.available
                    ),
                ));
            }
            Err(error) => {
                return Err(exclude(
                    action_type,
                    ExclusionReason::LedgerUnavailable,
                    error.to_string(),
                ));
            }
        }

        if let GuardrailDecision::Deny { reason, detail } =
            self.guardrail.evaluate_rate(&context.tenant_id, definition)
        {
            return Err(exclude(action_type, reason, detail));
        }

        let request = ActionRequest {
            action_type,
            context: context.clone(),
            parameters: proposal.parameters,
            priority: proposal.priority,
            metadata: None,
        };
        Ok((request, definition.default_level))
    }
}

fn exclude(
    action_type: ActionType,
    reason: ExclusionReason,
    detail: impl Into<String>,
) -> ExcludedAction {
    ExcludedAction { action_type, reason, detail: detail.into() }
}

#[derive(Debug, PartialEq)]
struct ModelResponse {
    actions: Vec<Value>,
    reasoning: String,
    confidence: u8,
}

impl ModelResponse {
    fn parse(raw: &str) -> Option<Self> {
        let object = extract_json_object(raw)?;
        let actions = object.get("actions").and_then(Value::as_array).cloned().unwrap_or_default();
        let reasoning =
            object.get("reasoning").and_then(Value::as_str).unwrap_or_default().to_owned();
        let confidence = object
            .get("confidence")
            .and_then(Value::as_f64)
            .map(|value| value.clamp(0.0, 100.0).round() as u8)
            .unwrap_or(0);
        Some(Self { actions, reasoning, confidence })
    }
}

struct Proposal {
    action_type: ActionType,
    parameters: Map<String, Value>,
    priority: Priority,
}

impl Proposal {
    fn parse(element: &Value) -> Result<Self, ExcludedAction> {
        let Some(action_type) = element.get("type").and_then(Value::as_str).map(str::trim) else {
            return Err(exclude(
                ActionType::new(""),
                ExclusionReason::InvalidParameters,
                "proposal has no action type",
            ));
        };
        let action_type = ActionType::new(action_type);

        let parameters = match element.get("parameters") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(parameters)) => parameters.clone(),
            Some(_) => {
                return Err(exclude(
                    action_type,
                    ExclusionReason::InvalidParameters,
                    "parameters must be an object",
                ));
            }
        };

        let priority = element
            .get("priority")
            .and_then(Value::as_str)
            .and_then(Priority::parse)
            .unwrap_or_default();

        Ok(Self { action_type, parameters, priority })
    }
}

/// Finds the JSON object in a model reply that may be wrapped in prose or a code fence.
fn extract_json_object(raw: &str) -> Option<Map<String, Value>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let candidates = [Some(trimmed), fenced_block(trimmed), outermost_braces(trimmed)];
    candidates.into_iter().flatten().find_map(|candidate| {
        match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(object)) => Some(object),
            _ => None,
        }
    })
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn outermost_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
