use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

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
use frontdesk_core::domain::envelope::{Envelope, EnvelopePayload, EnvelopeType, MessageId};
use frontdesk_core::domain::policy::PolicyEntry;
use frontdesk_core::ledger::{OperationCostTable, ResourceLedger};
use frontdesk_core::policy::PolicyStore;
use frontdesk_db::{
    connect_with_settings, migrations, ConversationRepository, SqlConversationRepository,
    SqlDedupStore, SqlLedgerStore,
};
use frontdesk_gateway::{
    EnvelopeDispatcher, GatewayConsumer, InMemoryBus, MessageBus, MessagePipeline,
    MessagePipelineParts, SubscribePolicy, SummaryResponseGenerator,
};

const INBOUND: &str = "agent.inbound";
const OUTBOUND: &str = "agent.outbound";

fn message(id: &str, session_id: &str, content: &str) -> Envelope {
    Envelope {
        tenant_id: "spa-9".to_owned(),
        user_id: "guest-4".to_owned(),
        session_id: session_id.to_owned(),
        message_id: MessageId(id.to_owned()),
        envelope_type: EnvelopeType::UserMessage,
        payload: EnvelopePayload {
            content: content.to_owned(),
            context: json!({ "businessType": "spa" }),
        },
        timestamp: Utc::now(),
    }
}

fn email_proposal(subject: &str) -> String {
    json!({
        "actions": [{
            "type": "send_email",
            "parameters": { "to": "guest@example.com", "subject": subject, "body": "See you soon" }
        }],
        "reasoning": "confirm by email",
        "confidence": 85
    })
    .to_string()
}

#[tokio::test]
async fn consumer_answers_each_message_once_over_sqlite_stores() {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");

    let costs = OperationCostTable::default();
    let catalog = Arc::new(ActionCatalog::standard(&costs));
    let ledger = ResourceLedger::new(Arc::new(SqlLedgerStore::new(pool.clone())), costs);
    ledger.credit("spa-9", None, 10).await.expect("credit");

    let llm = Arc::new(
        ScriptedLlmClient::new()
            .with_response(email_proposal("Massage booked"))
            .with_response(email_proposal("Sauna booked")),
    );
    let notifications = LoggingNotificationGateway::recording();
    let audit = Arc::new(InMemoryAuditSink::default());
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
    let conversations = Arc::new(SqlConversationRepository::new(pool.clone()));
    let bus = InMemoryBus::recording(4);
    bus.declare(INBOUND);

    let pipeline = MessagePipeline::new(MessagePipelineParts {
        dedup: Arc::new(SqlDedupStore::new(pool.clone(), 300)),
        conversations: conversations.clone(),
        engine: Arc::new(engine),
        dispatcher: Arc::new(dispatcher),
        responder: Arc::new(SummaryResponseGenerator),
        bus: Arc::new(bus.clone()),
        audit,
        outbound_topic: OUTBOUND.to_owned(),
        history_turns: 10,
    });
    let mut envelopes = EnvelopeDispatcher::new();
    envelopes.register(Arc::new(pipeline));

    let first = message("m-1", "s-1", "Book me a massage tomorrow");
    bus.publish(INBOUND, &first).await.expect("publish");
    bus.publish(INBOUND, &first).await.expect("redeliver");
    bus.publish(INBOUND, &message("m-2", "s-1", "And the sauna after")).await.expect("publish");
    bus.close(INBOUND);

    let (_shutdown_tx, shutdown) = watch::channel(false);
    let consumer = GatewayConsumer::new(
        Arc::new(bus.clone()),
        Arc::new(envelopes),
        INBOUND,
        SubscribePolicy { max_retries: 1, base_delay_ms: 0, max_delay_ms: 0 },
    );
    let report = consumer.run(shutdown).await;

    assert!(report.subscribed);
    assert_eq!(report.responded(), 2);
    assert_eq!(report.duplicates(), 1);
    assert_eq!(report.failed(), 0);

    let published = bus.published(OUTBOUND);
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].payload.context["inReplyTo"], "m-1");
    assert_eq!(published[1].payload.context["inReplyTo"], "m-2");
    assert!(published.iter().all(|reply| reply.envelope_type == EnvelopeType::AgentResponse));

    assert_eq!(notifications.delivered().len(), 2);
    let account = ledger.get_or_create("spa-9", None).await.expect("account");
    assert_eq!(account.available, 6);
    assert_eq!(ledger.usage_log("spa-9", None).await.expect("usage").len(), 2);

    let session = conversations.list_session("spa-9", "s-1", 10).await.expect("history");
    assert_eq!(session.len(), 4);
    assert!(llm.prompts()[1].contains("Book me a massage tomorrow"));
}
