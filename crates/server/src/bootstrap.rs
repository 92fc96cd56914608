use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use frontdesk_agent::authz::StaticPermissionResolver;
use frontdesk_agent::decision::DecisionEngine;
use frontdesk_agent::dispatcher::ActionDispatcher;
use frontdesk_agent::handlers::communication::LoggingNotificationGateway;
use frontdesk_agent::handlers::coordination::InMemoryApprovalQueue;
use frontdesk_agent::handlers::resources::InMemoryResourceService;
use frontdesk_agent::handlers::HandlerRegistry;
use frontdesk_agent::llm::{HttpLlmClient, LlmClient, LlmError};
use frontdesk_agent::prompt::PromptBuilder;
use frontdesk_core::audit::AuditSink;
use frontdesk_core::catalog::ActionCatalog;
use frontdesk_core::config::{
    AppConfig, ConfigError, DedupBackend, LoadOptions, PolicyConfig, ReplyMode,
};
use frontdesk_core::dedup::{DedupStore, InMemoryDedupCache};
use frontdesk_core::domain::policy::PolicyDocument;
use frontdesk_core::ledger::ResourceLedger;
use frontdesk_core::policy::PolicyStore;
use frontdesk_db::{
    connect_with_settings, migrations, DbPool, SqlConversationRepository, SqlDedupStore,
    SqlLedgerStore,
};
use frontdesk_gateway::{
    EnvelopeDispatcher, GatewayConsumer, InMemoryBus, LlmResponseGenerator, MessageBus,
    MessagePipeline, MessagePipelineParts, ResponseGenerator, SubscribePolicy,
    SummaryResponseGenerator, TracingAuditSink,
};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub catalog: Arc<ActionCatalog>,
    pub ledger: ResourceLedger,
    pub dispatcher: Arc<ActionDispatcher>,
    pub bus: Arc<dyn MessageBus>,
    pub dedup: Arc<dyn DedupStore>,
    pub consumer: GatewayConsumer,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("could not read policy file `{path}`: {source}")]
    PolicyRead { path: PathBuf, source: std::io::Error },
    #[error("could not parse policy file `{path}`: {source}")]
    PolicyParse { path: PathBuf, source: toml::de::Error },
    #[error("language model client could not be built: {0}")]
    Llm(#[from] LlmError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let costs = config.metering.costs.clone();
    let catalog = Arc::new(ActionCatalog::standard(&costs));
    let ledger = ResourceLedger::new(Arc::new(SqlLedgerStore::new(db_pool.clone())), costs);
    let policies = Arc::new(load_policies(&config.policy)?);
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::from_config(&config.llm)?);
    let engine = DecisionEngine::new(
        catalog.clone(),
        ledger.clone(),
        policies,
        Arc::new(StaticPermissionResolver::new(catalog_permissions(&catalog))),
        llm.clone(),
        config.llm.model.clone(),
    )
    .with_prompt_builder(PromptBuilder::new(config.gateway.history_turns));

    let handlers = HandlerRegistry::builtin(
        Arc::new(LoggingNotificationGateway::default()),
        Arc::new(InMemoryResourceService::default()),
        Arc::new(InMemoryApprovalQueue::default()),
    );
    let dispatcher = Arc::new(
        ActionDispatcher::new(catalog.clone(), Arc::new(handlers), ledger.clone(), audit.clone())
            .with_handler_timeout(Duration::from_secs(config.dispatch.handler_timeout_secs)),
    );

    let in_process_bus = InMemoryBus::new(config.gateway.partitions);
    in_process_bus.declare(&config.gateway.inbound_topic);
    let bus: Arc<dyn MessageBus> = Arc::new(in_process_bus);
    let dedup = build_dedup(&config, &db_pool);
    let pipeline = MessagePipeline::new(MessagePipelineParts {
        dedup: dedup.clone(),
        conversations: Arc::new(SqlConversationRepository::new(db_pool.clone())),
        engine: Arc::new(engine),
        dispatcher: dispatcher.clone(),
        responder: build_responder(config.gateway.reply_mode, llm),
        bus: bus.clone(),
        audit,
        outbound_topic: config.gateway.outbound_topic.clone(),
        history_turns: config.gateway.history_turns,
    });
    let mut envelopes = EnvelopeDispatcher::new();
    envelopes.register(Arc::new(pipeline));

    let consumer = GatewayConsumer::new(
        bus.clone(),
        Arc::new(envelopes),
        config.gateway.inbound_topic.clone(),
        SubscribePolicy::from_config(&config.gateway),
    );

    info!(
        event_name = "system.bootstrap.completed",
        correlation_id = "bootstrap",
        actions = catalog.len(),
        llm_provider = config.llm.provider.as_str(),
        dedup_backend = config.gateway.dedup_backend.as_str(),
        reply_mode = config.gateway.reply_mode.as_str(),
        "pipeline wired"
    );

    Ok(Application { config, db_pool, catalog, ledger, dispatcher, bus, dedup, consumer })
}

/// Policy store from the configured file, or only the configured default entry.
pub fn load_policies(config: &PolicyConfig) -> Result<PolicyStore, BootstrapError> {
    let fallback = config.default_entry();
    let Some(path) = &config.policy_file else {
        return Ok(PolicyStore::with_default(fallback));
    };

    let raw = std::fs::read_to_string(path)
        .map_err(|source| BootstrapError::PolicyRead { path: path.clone(), source })?;
    let document: PolicyDocument = toml::from_str(&raw)
        .map_err(|source| BootstrapError::PolicyParse { path: path.clone(), source })?;
    info!(
        event_name = "system.bootstrap.policies_loaded",
        correlation_id = "bootstrap",
        tenants = document.tenants.len(),
        path = %path.display(),
        "tenant policies loaded"
    );
    Ok(PolicyStore::from_document(document, fallback))
}

fn build_dedup(config: &AppConfig, db_pool: &DbPool) -> Arc<dyn DedupStore> {
    match config.gateway.dedup_backend {
        DedupBackend::Memory => Arc::new(InMemoryDedupCache::new(config.gateway.dedup_ttl_secs)),
        DedupBackend::Sql => {
            Arc::new(SqlDedupStore::new(db_pool.clone(), config.gateway.dedup_ttl_secs))
        }
    }
}

fn build_responder(mode: ReplyMode, llm: Arc<dyn LlmClient>) -> Arc<dyn ResponseGenerator> {
    match mode {
        ReplyMode::Summary => Arc::new(SummaryResponseGenerator),
        ReplyMode::Llm => Arc::new(LlmResponseGenerator::new(llm)),
    }
}

/// Callers hold every permission the catalog uses; tenant policy does the narrowing.
fn catalog_permissions(catalog: &ActionCatalog) -> Vec<String> {
    catalog
        .definitions()
        .into_iter()
        .flat_map(|definition| definition.permissions.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
