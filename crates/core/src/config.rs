use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ledger::OperationType;
use crate::domain::policy::{PolicyEntry, RateLimit};
use crate::ledger::OperationCostTable;

pub const DEFAULT_CONFIG_FILE: &str = "frontdesk.toml";
pub const ENV_PREFIX: &str = "FRONTDESK_";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub dispatch: DispatchConfig,
    pub metering: MeteringConfig,
    pub policy: PolicyConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub inbound_topic: String,
    pub outbound_topic: String,
    pub partitions: u32,
    pub dedup_ttl_secs: u64,
    pub dedup_backend: DedupBackend,
    pub reply_mode: ReplyMode,
    pub history_turns: usize,
    pub subscribe_max_retries: u32,
    pub subscribe_backoff_ms: u64,
}

#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub handler_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct MeteringConfig {
    pub costs: OperationCostTable,
}

#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub suggestion_rate_limit: u32,
    pub rate_window_secs: u64,
    pub policy_file: Option<PathBuf>,
    pub allowed_models: Vec<String>,
}

impl PolicyConfig {
    /// Entry installed for the `default` tenant: everything allowed, capped suggestions.
    pub fn default_entry(&self) -> PolicyEntry {
        let mut entry = PolicyEntry::allow_all();
        if self.suggestion_rate_limit > 0 {
            entry.conditions.suggestion_rate_limit = Some(RateLimit {
                max_actions: self.suggestion_rate_limit,
                window_secs: self.rate_window_secs,
            });
        }
        entry.conditions.allowed_models = self.allowed_models.clone();
        entry
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupBackend {
    Memory,
    Sql,
}

impl DedupBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sql => "sql",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    Summary,
    Llm,
}

impl ReplyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Llm => "llm",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub dedup_backend: Option<DedupBackend>,
    pub policy_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://frontdesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
            },
            gateway: GatewayConfig {
                inbound_topic: "frontdesk.inbound".to_string(),
                outbound_topic: "frontdesk.outbound".to_string(),
                partitions: 4,
                dedup_ttl_secs: 300,
                dedup_backend: DedupBackend::Memory,
                reply_mode: ReplyMode::Summary,
                history_turns: 10,
                subscribe_max_retries: 5,
                subscribe_backoff_ms: 500,
            },
            dispatch: DispatchConfig { handler_timeout_secs: 30 },
            metering: MeteringConfig { costs: OperationCostTable::default() },
            policy: PolicyConfig {
                suggestion_rate_limit: 20,
                rate_window_secs: 60,
                policy_file: None,
                allowed_models: Vec::new(),
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl std::str::FromStr for DedupBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sql" => Ok(Self::Sql),
            other => Err(ConfigError::Validation(format!(
                "unsupported dedup backend `{other}` (expected memory|sql)"
            ))),
        }
    }
}

impl std::str::FromStr for ReplyMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "summary" => Ok(Self::Summary),
            "llm" => Ok(Self::Llm),
            other => Err(ConfigError::Validation(format!(
                "unsupported reply mode `{other}` (expected summary|llm)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(gateway) = patch.gateway {
            if let Some(inbound_topic) = gateway.inbound_topic {
                self.gateway.inbound_topic = inbound_topic;
            }
            if let Some(outbound_topic) = gateway.outbound_topic {
                self.gateway.outbound_topic = outbound_topic;
            }
            if let Some(partitions) = gateway.partitions {
                self.gateway.partitions = partitions;
            }
            if let Some(dedup_ttl_secs) = gateway.dedup_ttl_secs {
                self.gateway.dedup_ttl_secs = dedup_ttl_secs;
            }
            if let Some(dedup_backend) = gateway.dedup_backend {
                self.gateway.dedup_backend = dedup_backend;
            }
            if let Some(reply_mode) = gateway.reply_mode {
                self.gateway.reply_mode = reply_mode;
            }
            if let Some(history_turns) = gateway.history_turns {
                self.gateway.history_turns = history_turns;
            }
            if let Some(subscribe_max_retries) = gateway.subscribe_max_retries {
                self.gateway.subscribe_max_retries = subscribe_max_retries;
            }
            if let Some(subscribe_backoff_ms) = gateway.subscribe_backoff_ms {
                self.gateway.subscribe_backoff_ms = subscribe_backoff_ms;
            }
        }

        if let Some(dispatch) = patch.dispatch {
            if let Some(handler_timeout_secs) = dispatch.handler_timeout_secs {
                self.dispatch.handler_timeout_secs = handler_timeout_secs;
            }
        }

        if let Some(metering) = patch.metering {
            for (operation, tokens) in metering.costs.unwrap_or_default() {
                self.metering.costs.set_cost(operation, tokens);
            }
        }

        if let Some(policy) = patch.policy {
            if let Some(suggestion_rate_limit) = policy.suggestion_rate_limit {
                self.policy.suggestion_rate_limit = suggestion_rate_limit;
            }
            if let Some(rate_window_secs) = policy.rate_window_secs {
                self.policy.rate_window_secs = rate_window_secs;
            }
            if let Some(policy_file) = policy.policy_file {
                self.policy.policy_file = Some(policy_file);
            }
            if let Some(allowed_models) = policy.allowed_models {
                self.policy.allowed_models = allowed_models;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("FRONTDESK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("FRONTDESK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("FRONTDESK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("FRONTDESK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("FRONTDESK_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("FRONTDESK_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("FRONTDESK_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("FRONTDESK_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("FRONTDESK_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("FRONTDESK_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("FRONTDESK_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("FRONTDESK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_GATEWAY_INBOUND_TOPIC") {
            self.gateway.inbound_topic = value;
        }
        if let Some(value) = read_env("FRONTDESK_GATEWAY_OUTBOUND_TOPIC") {
            self.gateway.outbound_topic = value;
        }
        if let Some(value) = read_env("FRONTDESK_GATEWAY_PARTITIONS") {
            self.gateway.partitions = parse_u32("FRONTDESK_GATEWAY_PARTITIONS", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_GATEWAY_DEDUP_TTL_SECS") {
            self.gateway.dedup_ttl_secs = parse_u64("FRONTDESK_GATEWAY_DEDUP_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_GATEWAY_DEDUP_BACKEND") {
            self.gateway.dedup_backend = value.parse()?;
        }
        if let Some(value) = read_env("FRONTDESK_GATEWAY_REPLY_MODE") {
            self.gateway.reply_mode = value.parse()?;
        }
        if let Some(value) = read_env("FRONTDESK_GATEWAY_HISTORY_TURNS") {
            self.gateway.history_turns = parse_usize("FRONTDESK_GATEWAY_HISTORY_TURNS", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_DISPATCH_HANDLER_TIMEOUT_SECS") {
            self.dispatch.handler_timeout_secs =
                parse_u64("FRONTDESK_DISPATCH_HANDLER_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("FRONTDESK_POLICY_SUGGESTION_RATE_LIMIT") {
            self.policy.suggestion_rate_limit =
                parse_u32("FRONTDESK_POLICY_SUGGESTION_RATE_LIMIT", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_POLICY_RATE_WINDOW_SECS") {
            self.policy.rate_window_secs =
                parse_u64("FRONTDESK_POLICY_RATE_WINDOW_SECS", &value)?;
        }
        if let Some(value) = read_env("FRONTDESK_POLICY_FILE") {
            self.policy.policy_file = Some(PathBuf::from(value));
        }

        let log_level =
            read_env("FRONTDESK_LOGGING_LEVEL").or_else(|| read_env("FRONTDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("FRONTDESK_LOGGING_FORMAT").or_else(|| read_env("FRONTDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(dedup_backend) = overrides.dedup_backend {
            self.gateway.dedup_backend = dedup_backend;
        }
        if let Some(policy_file) = overrides.policy_file {
            self.policy.policy_file = Some(policy_file);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_gateway(&self.gateway)?;
        validate_dispatch(&self.dispatch)?;
        validate_metering(&self.metering)?;
        validate_policy(&self.policy)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from(DEFAULT_CONFIG_FILE), PathBuf::from("config").join(DEFAULT_CONFIG_FILE)]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi | LlmProvider::Anthropic => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for openai/anthropic providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_gateway(gateway: &GatewayConfig) -> Result<(), ConfigError> {
    if gateway.inbound_topic.trim().is_empty() || gateway.outbound_topic.trim().is_empty() {
        return Err(ConfigError::Validation(
            "gateway.inbound_topic and gateway.outbound_topic must not be empty".to_string(),
        ));
    }

    if gateway.inbound_topic == gateway.outbound_topic {
        return Err(ConfigError::Validation(
            "gateway.outbound_topic must differ from gateway.inbound_topic".to_string(),
        ));
    }

    if gateway.partitions == 0 || gateway.partitions > 256 {
        return Err(ConfigError::Validation(
            "gateway.partitions must be in range 1..=256".to_string(),
        ));
    }

    if gateway.dedup_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "gateway.dedup_ttl_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_dispatch(dispatch: &DispatchConfig) -> Result<(), ConfigError> {
    if dispatch.handler_timeout_secs == 0 || dispatch.handler_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "dispatch.handler_timeout_secs must be in range 1..=600".to_string(),
        ));
    }
    Ok(())
}

fn validate_metering(metering: &MeteringConfig) -> Result<(), ConfigError> {
    let required = [
        OperationType::EMAIL_SEND,
        OperationType::SMS_SEND,
        OperationType::CALL_SCHEDULE,
        OperationType::RESOURCE_WRITE,
        OperationType::COORDINATION,
        OperationType::MONTHLY_FEE,
    ];
    for operation in required {
        if metering.costs.cost(&OperationType::new(operation)).is_none() {
            return Err(ConfigError::Validation(format!(
                "metering.costs.{operation} must be configured"
            )));
        }
    }
    Ok(())
}

fn validate_policy(policy: &PolicyConfig) -> Result<(), ConfigError> {
    if policy.suggestion_rate_limit > 0 && policy.rate_window_secs == 0 {
        return Err(ConfigError::Validation(
            "policy.rate_window_secs must be greater than zero when a rate limit is set"
                .to_string(),
        ));
    }

    if let Some(path) = &policy.policy_file {
        if !path.exists() {
            return Err(ConfigError::Validation(format!(
                "policy.policy_file `{}` does not exist",
                path.display()
            )));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    gateway: Option<GatewayPatch>,
    dispatch: Option<DispatchPatch>,
    metering: Option<MeteringPatch>,
    policy: Option<PolicyPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct GatewayPatch {
    inbound_topic: Option<String>,
    outbound_topic: Option<String>,
    partitions: Option<u32>,
    dedup_ttl_secs: Option<u64>,
    dedup_backend: Option<DedupBackend>,
    reply_mode: Option<ReplyMode>,
    history_turns: Option<usize>,
    subscribe_max_retries: Option<u32>,
    subscribe_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DispatchPatch {
    handler_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct MeteringPatch {
    costs: Option<BTreeMap<String, u64>>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyPatch {
    suggestion_rate_limit: Option<u32>,
    rate_window_secs: Option<u64>,
    policy_file: Option<PathBuf>,
    allowed_models: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{
        AppConfig, ConfigError, ConfigOverrides, DedupBackend, LlmProvider, LoadOptions,
        LogFormat, ReplyMode,
    };
    use crate::domain::ledger::OperationType;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn defaults_validate_without_any_file() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let config = AppConfig::load(LoadOptions::default())
            .map_err(|err| format!("config load failed: {err}"))?;

        ensure(config.llm.provider == LlmProvider::Ollama, "default provider should be ollama")?;
        ensure(config.gateway.dedup_ttl_secs == 300, "default dedup ttl should be five minutes")?;
        ensure(
            matches!(config.gateway.dedup_backend, DedupBackend::Memory),
            "default dedup backend should be memory",
        )?;
        ensure(
            matches!(config.logging.format, LogFormat::Compact),
            "default logging format should be compact",
        )
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_FRONTDESK_LLM_KEY", "sk-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("frontdesk.toml");
            fs::write(
                &path,
                r#"
[llm]
provider = "openai"
api_key = "${TEST_FRONTDESK_LLM_KEY}"
model = "gpt-4o-mini"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.llm.provider == LlmProvider::OpenAi, "provider should come from file")?;
            ensure(
                config.llm.api_key.as_ref().map(|key| key.expose_secret() == "sk-from-env")
                    == Some(true),
                "api key should be interpolated from environment",
            )?;
            Ok(())
        })();

        clear_vars(&["TEST_FRONTDESK_LLM_KEY"]);
        result
    }

    #[test]
    fn provider_names_deserialize_as_displayed() -> Result<(), String> {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            provider: LlmProvider,
        }

        for provider in [LlmProvider::OpenAi, LlmProvider::Anthropic, LlmProvider::Ollama] {
            let raw = format!("provider = \"{}\"", provider.as_str());
            let parsed: Wrapper = toml::from_str(&raw).map_err(|err| err.to_string())?;
            ensure(parsed.provider == provider, "provider name should round through toml")?;
        }
        Ok(())
    }

    #[test]
    fn metering_costs_merge_over_defaults() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
        let path = dir.path().join("frontdesk.toml");
        fs::write(
            &path,
            r#"
[metering.costs]
sms_send = 4
voice_note = 6

[gateway]
reply_mode = "llm"
partitions = 8
"#,
        )
        .map_err(|err| err.to_string())?;

        let config =
            AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                .map_err(|err| format!("config load failed: {err}"))?;

        let costs = &config.metering.costs;
        ensure(
            costs.cost(&OperationType::new(OperationType::SMS_SEND)) == Some(4),
            "file cost should override default",
        )?;
        ensure(
            costs.cost(&OperationType::new(OperationType::EMAIL_SEND)) == Some(2),
            "unlisted costs should keep defaults",
        )?;
        ensure(
            costs.cost(&OperationType::new("voice_note")) == Some(6),
            "new operations should be priced",
        )?;
        ensure(config.gateway.reply_mode == ReplyMode::Llm, "reply mode should come from file")?;
        ensure(config.gateway.partitions == 8, "partitions should come from file")
    }

    #[test]
    fn logging_env_aliases_are_supported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FRONTDESK_LOG_LEVEL", "warn");
        env::set_var("FRONTDESK_LOG_FORMAT", "pretty");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.logging.level == "warn", "warning log level should be set from env var")?;
            ensure(
                matches!(config.logging.format, LogFormat::Pretty),
                "pretty logging format should be set from env var",
            )?;
            Ok(())
        })();

        clear_vars(&["FRONTDESK_LOG_LEVEL", "FRONTDESK_LOG_FORMAT"]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FRONTDESK_DATABASE_URL", "sqlite://from-env.db");
        env::set_var("FRONTDESK_GATEWAY_DEDUP_TTL_SECS", "120");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("frontdesk.toml");
            fs::write(
                &path,
                r#"
[database]
url = "sqlite://from-file.db"

[gateway]
dedup_ttl_secs = 60
dedup_backend = "memory"

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    database_url: Some("sqlite://from-override.db".to_string()),
                    log_level: Some("debug".to_string()),
                    dedup_backend: Some(DedupBackend::Sql),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.database.url == "sqlite://from-override.db",
                "override database url should win",
            )?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.gateway.dedup_ttl_secs == 120, "env ttl should win over file")?;
            ensure(
                config.gateway.dedup_backend == DedupBackend::Sql,
                "override dedup backend should win over file",
            )?;
            Ok(())
        })();

        clear_vars(&["FRONTDESK_DATABASE_URL", "FRONTDESK_GATEWAY_DEDUP_TTL_SECS"]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FRONTDESK_LLM_PROVIDER", "anthropic");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("llm.api_key")
            );
            ensure(has_message, "validation failure should mention llm.api_key")
        })();

        clear_vars(&["FRONTDESK_LLM_PROVIDER"]);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FRONTDESK_GATEWAY_PARTITIONS", "many");

        let result = match AppConfig::load(LoadOptions::default()) {
            Err(ConfigError::InvalidEnvOverride { key, .. }) => ensure(
                key == "FRONTDESK_GATEWAY_PARTITIONS",
                "error should name the offending variable",
            ),
            Err(other) => Err(format!("unexpected error: {other}")),
            Ok(_) => Err("expected invalid override failure".to_string()),
        };

        clear_vars(&["FRONTDESK_GATEWAY_PARTITIONS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("FRONTDESK_LLM_PROVIDER", "openai");
        env::set_var("FRONTDESK_LLM_API_KEY", "sk-secret-value");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(!debug.contains("sk-secret-value"), "debug output should not contain api key")
        })();

        clear_vars(&["FRONTDESK_LLM_PROVIDER", "FRONTDESK_LLM_API_KEY"]);
        result
    }

    #[test]
    fn default_policy_entry_carries_rate_cap() {
        let config = AppConfig::default();
        let entry = config.policy.default_entry();

        assert!(entry.grants("send_sms", "communication"));
        assert_eq!(entry.conditions.suggestion_rate_limit.map(|limit| limit.max_actions), Some(20));
    }
}
