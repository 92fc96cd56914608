use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use frontdesk_core::config::{AppConfig, LoadOptions, DEFAULT_CONFIG_FILE};
use secrecy::ExposeSecret;
use toml::Value;

struct SourceContext {
    doc: Option<Value>,
    path: Option<PathBuf>,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let path = detect_config_path();
    let context = SourceContext { doc: load_config_file_doc(path.as_deref()), path };

    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_token(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());
    let policy_file = config
        .policy
        .policy_file
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "<unset>".to_string());

    let fields: Vec<(&str, &str, String)> = vec![
        ("database.url", "DATABASE_URL", config.database.url.clone()),
        (
            "database.max_connections",
            "DATABASE_MAX_CONNECTIONS",
            config.database.max_connections.to_string(),
        ),
        (
            "database.timeout_secs",
            "DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs.to_string(),
        ),
        ("llm.provider", "LLM_PROVIDER", config.llm.provider.as_str().to_string()),
        ("llm.model", "LLM_MODEL", config.llm.model.clone()),
        (
            "llm.base_url",
            "LLM_BASE_URL",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
        ),
        ("llm.api_key", "LLM_API_KEY", api_key),
        ("llm.timeout_secs", "LLM_TIMEOUT_SECS", config.llm.timeout_secs.to_string()),
        ("server.bind_address", "SERVER_BIND_ADDRESS", config.server.bind_address.clone()),
        (
            "server.health_check_port",
            "SERVER_HEALTH_CHECK_PORT",
            config.server.health_check_port.to_string(),
        ),
        ("gateway.inbound_topic", "GATEWAY_INBOUND_TOPIC", config.gateway.inbound_topic.clone()),
        (
            "gateway.outbound_topic",
            "GATEWAY_OUTBOUND_TOPIC",
            config.gateway.outbound_topic.clone(),
        ),
        ("gateway.partitions", "GATEWAY_PARTITIONS", config.gateway.partitions.to_string()),
        (
            "gateway.dedup_backend",
            "GATEWAY_DEDUP_BACKEND",
            config.gateway.dedup_backend.as_str().to_string(),
        ),
        (
            "gateway.dedup_ttl_secs",
            "GATEWAY_DEDUP_TTL_SECS",
            config.gateway.dedup_ttl_secs.to_string(),
        ),
        (
            "gateway.reply_mode",
            "GATEWAY_REPLY_MODE",
            config.gateway.reply_mode.as_str().to_string(),
        ),
        (
            "gateway.history_turns",
            "GATEWAY_HISTORY_TURNS",
            config.gateway.history_turns.to_string(),
        ),
        (
            "dispatch.handler_timeout_secs",
            "DISPATCH_HANDLER_TIMEOUT_SECS",
            config.dispatch.handler_timeout_secs.to_string(),
        ),
        ("policy.policy_file", "POLICY_FILE", policy_file),
        (
            "policy.suggestion_rate_limit",
            "POLICY_SUGGESTION_RATE_LIMIT",
            config.policy.suggestion_rate_limit.to_string(),
        ),
        (
            "policy.rate_window_secs",
            "POLICY_RATE_WINDOW_SECS",
            config.policy.rate_window_secs.to_string(),
        ),
        ("logging.level", "LOGGING_LEVEL", config.logging.level.clone()),
        ("logging.format", "LOGGING_FORMAT", format!("{:?}", config.logging.format)),
    ];

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key_path, env_suffix, value) in fields {
        let env_key = format!("FRONTDESK_{env_suffix}");
        lines.push(render_line(key_path, &value, field_source(key_path, &env_key, &context)));
    }
    lines.join("\n")
}

fn detect_config_path() -> Option<PathBuf> {
    let root = PathBuf::from(DEFAULT_CONFIG_FILE);
    if root.exists() {
        return Some(root);
    }

    let nested = Path::new("config").join(DEFAULT_CONFIG_FILE);
    if nested.exists() {
        return Some(nested);
    }

    None
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(key_path: &str, env_key: &str, context: &SourceContext) -> String {
    if env::var_os(env_key).is_some() {
        return format!("env ({env_key})");
    }

    if let Some(doc) = &context.doc {
        if contains_path(doc, key_path) {
            let file_path = context
                .path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
