use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use frontdesk_core::config::{LlmConfig, LlmProvider};

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model transport failed: {0}")]
    Transport(String),
    #[error("model returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model response could not be decoded: {0}")]
    Decode(String),
    #[error("model client misconfigured: {0}")]
    Configuration(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Completion client for the hosted chat APIs and a local Ollama daemon.
pub struct HttpLlmClient {
    client: reqwest::Client,
    provider: LlmProvider,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    timeout: Duration,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        if config.provider != LlmProvider::Ollama && config.api_key.is_none() {
            return Err(LlmError::Configuration(format!(
                "provider `{}` requires an api key",
                config.provider.as_str()
            )));
        }

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_owned())
            .trim_end_matches('/')
            .to_owned();

        Ok(Self {
            client: reqwest::Client::new(),
            provider: config.provider,
            base_url,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, prompt: &str) -> reqwest::RequestBuilder {
        let builder = match self.provider {
            LlmProvider::OpenAi => self
                .client
                .post(format!("{}/v1/chat/completions", self.base_url))
                .json(&json!({
                    "model": self.model,
                    "messages": [{ "role": "user", "content": prompt }],
                    "temperature": 0.0,
                })),
            LlmProvider::Anthropic => self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("anthropic-version", "2023-06-01")
                .json(&json!({
                    "model": self.model,
                    "max_tokens": 1024,
                    "messages": [{ "role": "user", "content": prompt }],
                })),
            LlmProvider::Ollama => self
                .client
                .post(format!("{}/api/generate", self.base_url))
                .json(&json!({ "model": self.model, "prompt": prompt, "stream": false })),
        };

        let builder = match (&self.api_key, self.provider) {
            (Some(key), LlmProvider::Anthropic) => {
                builder.header("x-api-key", key.expose_secret())
            }
            (Some(key), _) => builder.bearer_auth(key.expose_secret()),
            (None, _) => builder,
        };
        builder.timeout(self.timeout)
    }

    async fn send(&self, prompt: &str) -> Result<String, LlmError> {
        let response = self
            .request(prompt)
            .send()
            .await
            .map_err(|error| LlmError::Transport(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status: status.as_u16(), body });
        }

        let body: Value =
            response.json().await.map_err(|error| LlmError::Decode(error.to_string()))?;
        extract_completion(self.provider, &body)
            .ok_or_else(|| LlmError::Decode("completion text missing from response".to_owned()))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    /// One request per call; failures surface to the caller unretried.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        self.send(prompt).await.map_err(|error| {
            warn!(
                event_name = "decision.llm.failed",
                provider = self.provider.as_str(),
                error = %error,
                "model completion failed"
            );
            error
        })
    }
}

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "https://api.openai.com",
        LlmProvider::Anthropic => "https://api.anthropic.com",
        LlmProvider::Ollama => "http://localhost:11434",
    }
}

fn extract_completion(provider: LlmProvider, body: &Value) -> Option<String> {
    let text = match provider {
        LlmProvider::OpenAi => body.pointer("/choices/0/message/content"),
        LlmProvider::Anthropic => body.pointer("/content/0/text"),
        LlmProvider::Ollama => body.get("response"),
    }?;
    text.as_str().map(str::to_owned)
}

/// Replays canned completions in order and records every prompt it was given.
#[derive(Default)]
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.push(Err(message.into()));
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        match self.prompts.lock() {
            Ok(prompts) => prompts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, entry: Result<String, String>) {
        match self.responses.lock() {
            Ok(mut responses) => responses.push_back(entry),
            Err(poisoned) => poisoned.into_inner().push_back(entry),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        match self.prompts.lock() {
            Ok(mut prompts) => prompts.push(prompt.to_owned()),
            Err(poisoned) => poisoned.into_inner().push(prompt.to_owned()),
        }
        let next = match self.responses.lock() {
            Ok(mut responses) => responses.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(LlmError::Transport(message)),
            None => Err(LlmError::Transport("script exhausted".to_owned())),
        }
    }
}
