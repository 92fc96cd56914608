//! Operator HTTP API over the catalog, dispatcher, ledger and inbound topic.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use frontdesk_agent::dispatcher::ActionDispatcher;
use frontdesk_core::catalog::ActionCatalog;
use frontdesk_core::domain::action::{ActionDefinition, ActionExecutionResult, ActionRequest};
use frontdesk_core::domain::envelope::{Envelope, EnvelopeType};
use frontdesk_core::domain::ledger::LedgerAccount;
use frontdesk_core::errors::{ApplicationError, DomainError, InterfaceError};
use frontdesk_core::ledger::ResourceLedger;
use frontdesk_gateway::MessageBus;

#[derive(Clone)]
pub struct ApiState {
    pub catalog: Arc<ActionCatalog>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub ledger: ResourceLedger,
    pub bus: Arc<dyn MessageBus>,
    pub inbound_topic: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LedgerQuery {
    pub location: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreditRequest {
    pub tokens: u64,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedMessage {
    pub message_id: String,
    pub topic: String,
}

/// Error body: a user-safe message plus the correlation id to grep logs for.
#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn from_application(error: ApplicationError) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        warn!(
            event_name = "api.request.failed",
            correlation_id = %correlation_id,
            error = %error,
            "operator api request failed"
        );
        Self(error.into_interface(correlation_id))
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::from_application(ApplicationError::Domain(DomainError::Validation(message.into())))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.0.user_message(),
            "correlationId": self.0.correlation_id(),
        });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/catalog", get(list_catalog))
        .route("/v1/actions/execute", post(execute_action))
        .route("/v1/actions/batch", post(execute_batch))
        .route("/v1/tenants/{tenant_id}/ledger", get(ledger_account))
        .route("/v1/tenants/{tenant_id}/ledger/credit", post(credit_ledger))
        .route("/v1/messages", post(submit_message))
        .with_state(state)
}

pub async fn list_catalog(State(state): State<ApiState>) -> Json<Vec<ActionDefinition>> {
    Json(state.catalog.definitions().into_iter().cloned().collect())
}

pub async fn execute_action(
    State(state): State<ApiState>,
    Json(request): Json<ActionRequest>,
) -> Json<ActionExecutionResult> {
    Json(state.dispatcher.execute(request).await)
}

pub async fn execute_batch(
    State(state): State<ApiState>,
    Json(requests): Json<Vec<ActionRequest>>,
) -> Json<Vec<ActionExecutionResult>> {
    Json(state.dispatcher.execute_batch(requests).await)
}

pub async fn ledger_account(
    Path(tenant_id): Path<String>,
    Query(query): Query<LedgerQuery>,
    State(state): State<ApiState>,
) -> Result<Json<LedgerAccount>, ApiError> {
    state
        .ledger
        .get_or_create(&tenant_id, query.location.as_deref())
        .await
        .map(Json)
        .map_err(|error| ApiError::from_application(error.into()))
}

pub async fn credit_ledger(
    Path(tenant_id): Path<String>,
    State(state): State<ApiState>,
    Json(request): Json<CreditRequest>,
) -> Result<Json<LedgerAccount>, ApiError> {
    if request.tokens == 0 {
        return Err(ApiError::bad_request("tokens must be greater than zero"));
    }
    let account = state
        .ledger
        .credit(&tenant_id, request.location.as_deref(), request.tokens)
        .await
        .map_err(|error| ApiError::from_application(error.into()))?;
    info!(
        event_name = "ledger.credit.applied",
        tenant_id = %tenant_id,
        location_id = request.location.as_deref().unwrap_or("none"),
        tokens = request.tokens,
        available = account.available,
        "ledger credited"
    );
    Ok(Json(account))
}

/// Publishes a `user.message` envelope onto the inbound topic.
pub async fn submit_message(
    State(state): State<ApiState>,
    Json(envelope): Json<Envelope>,
) -> Result<(StatusCode, Json<AcceptedMessage>), ApiError> {
    if envelope.envelope_type != EnvelopeType::UserMessage {
        return Err(ApiError::bad_request(format!(
            "only `{}` envelopes can be submitted",
            EnvelopeType::UserMessage.as_str()
        )));
    }
    if envelope.tenant_id.trim().is_empty() || envelope.session_id.trim().is_empty() {
        return Err(ApiError::bad_request("tenantId and sessionId are required"));
    }

    state.bus.publish(&state.inbound_topic, &envelope).await.map_err(|error| {
        ApiError::from_application(ApplicationError::Integration(error.to_string()))
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedMessage {
            message_id: envelope.message_id.as_str().to_owned(),
            topic: state.inbound_topic.clone(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use frontdesk_agent::dispatcher::ActionDispatcher;
    use frontdesk_agent::handlers::communication::LoggingNotificationGateway;
    use frontdesk_agent::handlers::coordination::InMemoryApprovalQueue;
    use frontdesk_agent::handlers::resources::InMemoryResourceService;
    use frontdesk_agent::handlers::HandlerRegistry;
    use frontdesk_core::audit::InMemoryAuditSink;
    use frontdesk_core::catalog::ActionCatalog;
    use frontdesk_core::ledger::{OperationCostTable, ResourceLedger};
    use frontdesk_gateway::InMemoryBus;

    use super::{router, ApiState};

    struct Harness {
        app: axum::Router,
        ledger: ResourceLedger,
        bus: InMemoryBus,
    }

    fn harness() -> Harness {
        let costs = OperationCostTable::default();
        let catalog = Arc::new(ActionCatalog::standard(&costs));
        let ledger = ResourceLedger::in_memory(costs);
        let handlers = HandlerRegistry::builtin(
            Arc::new(LoggingNotificationGateway::default()),
            Arc::new(InMemoryResourceService::default()),
            Arc::new(InMemoryApprovalQueue::default()),
        );
        let dispatcher = ActionDispatcher::new(
            catalog.clone(),
            Arc::new(handlers),
            ledger.clone(),
            Arc::new(InMemoryAuditSink::default()),
        );
        let bus = InMemoryBus::recording(2);
        let app = router(ApiState {
            catalog,
            dispatcher: Arc::new(dispatcher),
            ledger: ledger.clone(),
            bus: Arc::new(bus.clone()),
            inbound_topic: "agent.inbound".to_owned(),
        });
        Harness { app, ledger, bus }
    }

    async fn send(
        app: axum::Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |value| Body::from(value.to_string())))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    #[tokio::test]
    async fn catalog_lists_standard_actions() {
        let harness = harness();

        let (status, body) = send(harness.app, "GET", "/v1/catalog", None).await;

        assert_eq!(status, StatusCode::OK);
        let types: Vec<&str> = body
            .as_array()
            .expect("array")
            .iter()
            .filter_map(|item| item["action_type"].as_str())
            .collect();
        assert!(types.contains(&"send_sms"));
        assert!(types.contains(&"escalate_to_human"));
    }

    #[tokio::test]
    async fn execute_debits_the_tenant_ledger() {
        let harness = harness();
        harness.ledger.credit("hotel-1", None, 10).await.expect("credit");

        let (status, body) = send(
            harness.app,
            "POST",
            "/v1/actions/execute",
            Some(json!({
                "type": "send_sms",
                "context": { "tenantId": "hotel-1", "userId": "guest-3" },
                "parameters": { "to": "+15550123", "message": "Your room is ready" }
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["tokensUsed"], 3);
        let account = harness.ledger.get_or_create("hotel-1", None).await.expect("account");
        assert_eq!(account.available, 7);
    }

    #[tokio::test]
    async fn unknown_action_reports_failure_without_charging() {
        let harness = harness();
        harness.ledger.credit("hotel-1", None, 10).await.expect("credit");

        let (status, body) = send(
            harness.app,
            "POST",
            "/v1/actions/batch",
            Some(json!([{
                "type": "launch_rocket",
                "context": { "tenantId": "hotel-1", "userId": "guest-3" },
                "parameters": {}
            }])),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["success"], false);
        assert_eq!(body[0]["tokensUsed"], 0);
        let account = harness.ledger.get_or_create("hotel-1", None).await.expect("account");
        assert_eq!(account.available, 10);
    }

    #[tokio::test]
    async fn credit_then_read_location_account() {
        let harness = harness();

        let (status, _) = send(
            harness.app.clone(),
            "POST",
            "/v1/tenants/gym-2/ledger/credit",
            Some(json!({ "tokens": 40, "location": "downtown" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            send(harness.app, "GET", "/v1/tenants/gym-2/ledger?location=downtown", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["available"], 40);
        assert_eq!(body["lifetime_purchased"], 40);
    }

    #[tokio::test]
    async fn zero_credit_is_rejected_with_safe_message() {
        let harness = harness();

        let (status, body) = send(
            harness.app,
            "POST",
            "/v1/tenants/gym-2/ledger/credit",
            Some(json!({ "tokens": 0 })),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            "The request could not be processed. Check inputs and try again."
        );
        assert!(body["correlationId"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn submitted_message_lands_on_the_inbound_topic() {
        let harness = harness();

        let (status, body) = send(
            harness.app,
            "POST",
            "/v1/messages",
            Some(json!({
                "tenantId": "dental-4",
                "userId": "patient-1",
                "sessionId": "s-1",
                "messageId": "m-42",
                "type": "user.message",
                "payload": { "content": "Can I move my appointment?", "context": {} },
                "timestamp": "2026-03-02T10:00:00Z"
            })),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["messageId"], "m-42");
        let published = harness.bus.published("agent.inbound");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload.content, "Can I move my appointment?");
    }
}
