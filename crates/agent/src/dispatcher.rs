use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{error, info, warn};

use frontdesk_core::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink};
use frontdesk_core::catalog::ActionCatalog;
use frontdesk_core::domain::action::{
    ActionErrorKind, ActionExecutionResult, ActionRequest, Priority,
};
use frontdesk_core::domain::ledger::DebitOutcome;
use frontdesk_core::ledger::{DebitRequest, ResourceLedger};

use crate::handlers::HandlerRegistry;

pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Executes validated action requests and bills them after the side effect happened.
pub struct ActionDispatcher {
    catalog: Arc<ActionCatalog>,
    handlers: Arc<HandlerRegistry>,
    ledger: ResourceLedger,
    audit: Arc<dyn AuditSink>,
    handler_timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(
        catalog: Arc<ActionCatalog>,
        handlers: Arc<HandlerRegistry>,
        ledger: ResourceLedger,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { catalog, handlers, ledger, audit, handler_timeout: DEFAULT_HANDLER_TIMEOUT }
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Never fails: every outcome, including collaborator errors, is a result value.
    pub async fn execute(&self, request: ActionRequest) -> ActionExecutionResult {
        let started = Instant::now();
        let result = self.run(&request, started).await;

        let outcome = match (result.success, result.error_kind) {
            (true, _) => AuditOutcome::Success,
            (false, Some(ActionErrorKind::ExternalCollaborator)) => AuditOutcome::Failed,
            (false, _) => AuditOutcome::Rejected,
        };
        let context = AuditContext::new(
            request.context.tenant_id.clone(),
            request.context.session_id.clone(),
            request
                .metadata
                .as_ref()
                .and_then(|metadata| metadata.get("correlationId"))
                .and_then(|value| value.as_str())
                .unwrap_or("dispatch")
                .to_owned(),
            request.context.user_id.clone(),
        );
        let mut event = context
            .event("dispatch.action.executed", AuditCategory::Dispatch, outcome)
            .with_metadata("action_type", request.action_type.as_str())
            .with_metadata("priority", request.priority.as_str())
            .with_metadata("tokens_used", result.tokens_used.to_string())
            .with_metadata("charged", result.charged.to_string())
            .with_metadata("execution_time_ms", result.execution_time_ms.to_string());
        if let Some(error) = &result.error {
            event = event.with_metadata("error", error.clone());
        }
        self.audit.emit(event);

        result
    }

    /// Runs requests in order. A failed urgent request stops the batch; later
    /// requests get no result.
    pub async fn execute_batch(&self, requests: Vec<ActionRequest>) -> Vec<ActionExecutionResult> {
        let mut results = Vec::with_capacity(requests.len());
        let total = requests.len();

        for request in requests {
            let urgent = request.priority == Priority::Urgent;
            let result = self.execute(request).await;
            let failed = !result.success;
            results.push(result);

            if urgent && failed {
                warn!(
                    event_name = "dispatch.batch.halted",
                    executed = results.len(),
                    skipped = total - results.len(),
                    "urgent action failed, stopping batch"
                );
                break;
            }
        }

        results
    }

    async fn run(&self, request: &ActionRequest, started: Instant) -> ActionExecutionResult {
        let action_type = &request.action_type;
        let context = &request.context;
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let Some(definition) = self.catalog.get(action_type) else {
            return ActionExecutionResult::failure(
                action_type.clone(),
                ActionErrorKind::UnknownAction,
                format!("unknown action type `{action_type}`"),
                elapsed_ms(),
            );
        };

        let report = self.catalog.validate_parameters(action_type, &request.parameters);
        if !report.valid {
            return ActionExecutionResult::failure(
                action_type.clone(),
                ActionErrorKind::Validation,
                format!("invalid parameters: {}", report.errors.join("; ")),
                elapsed_ms(),
            );
        }

        let Some(handler) = self.handlers.get(action_type) else {
            return ActionExecutionResult::failure(
                action_type.clone(),
                ActionErrorKind::ExternalCollaborator,
                format!("no handler registered for `{action_type}`"),
                elapsed_ms(),
            );
        };

        let parameters = self.catalog.with_defaults(action_type, &request.parameters);
        let handled = tokio::time::timeout(
            self.handler_timeout,
            handler.handle(action_type, &parameters, context),
        )
        .await;

        let payload = match handled {
            Ok(Ok(payload)) => payload,
            Ok(Err(error)) => {
                warn!(
                    event_name = "dispatch.action.failed",
                    tenant_id = %context.tenant_id,
                    action_type = %action_type,
                    error = %error,
                    "action handler failed"
                );
                return ActionExecutionResult::failure(
                    action_type.clone(),
                    error.kind(),
                    error.to_string(),
                    elapsed_ms(),
                );
            }
            Err(_) => {
                warn!(
                    event_name = "dispatch.action.timed_out",
                    tenant_id = %context.tenant_id,
                    action_type = %action_type,
                    timeout_ms = self.handler_timeout.as_millis() as u64,
                    "action handler timed out"
                );
                return ActionExecutionResult::failure(
                    action_type.clone(),
                    ActionErrorKind::ExternalCollaborator,
                    format!("handler timed out after {}ms", self.handler_timeout.as_millis()),
                    elapsed_ms(),
                );
            }
        };

        let debit = self
            .ledger
            .debit(DebitRequest {
                tenant_id: context.tenant_id.clone(),
                location_id: context.location_id.clone(),
                operation: definition.operation.clone(),
                user_id: Some(context.user_id.clone()),
                session_id: context.session_id.clone(),
                description: format!("{action_type} action"),
                metadata: json!({
                    "actionType": action_type.as_str(),
                    "priority": request.priority.as_str(),
                }),
            })
            .await;

        // The side effect already happened, so a failed debit never flips success.
        let tokens_used = match debit {
            Ok(DebitOutcome::Charged { entry, .. }) => Some(entry.tokens),
            Ok(DebitOutcome::Insufficient { required, available }) => {
                warn!(
                    event_name = "ledger.debit.insufficient",
                    tenant_id = %context.tenant_id,
                    action_type = %action_type,
                    required,
                    available,
                    "action executed but could not be charged"
                );
                None
            }
            Err(ledger_error) => {
                error!(
                    event_name = "ledger.debit.failed",
                    tenant_id = %context.tenant_id,
                    action_type = %action_type,
                    error = %ledger_error,
                    "action executed but debit failed"
                );
                None
            }
        };

        let execution_time_ms = elapsed_ms();
        info!(
            event_name = "dispatch.action.completed",
            tenant_id = %context.tenant_id,
            action_type = %action_type,
            tokens_used = tokens_used.unwrap_or(0),
            charged = tokens_used.is_some(),
            execution_time_ms,
            "action executed"
        );

        ActionExecutionResult {
            action_type: action_type.clone(),
            success: true,
            result: Some(payload),
            tokens_used: tokens_used.unwrap_or(0),
            charged: tokens_used.is_some(),
            execution_time_ms,
            error: None,
            error_kind: None,
        }
    }
}
