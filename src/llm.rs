//! OpenAI-compatible chat completion client.
//!
//! Any server that implements `POST {base_url}/chat/completions` works
//! (OpenAI, Ollama, llama.cpp, vLLM). `OPENAI_API_KEY` is sent as a bearer
//! token when set.
//!
//! Requests are retried with exponential backoff (1s, 2s, 4s, ... capped at
//! 32s) on 429, 5xx and transport errors; other 4xx responses fail at once.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::KbError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Returns the assistant reply to `messages`.
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String>;
}

/// Builds the client selected by `[llm].provider`.
pub fn client_from_config(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    if !config.is_enabled() {
        return Ok(Arc::new(DisabledLlm));
    }
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiClient::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Fails every request; used when `[llm].provider = "disabled"`.
pub struct DisabledLlm;

#[async_trait]
impl LlmClient for DisabledLlm {
    async fn complete(&self, _messages: &[LlmMessage]) -> Result<String> {
        Err(KbError::Disabled("llm (set [llm].provider)".to_string()).into())
    }
}

pub struct OpenAiClient {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required when provider is 'openai'"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model,
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[LlmMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        debug!(model = %self.model, messages = messages.len(), "chat completion");

        let response = send_with_retry(self.max_retries, "chat completion", || {
            let req = self.client.post(&self.url).json(&body);
            match &self.api_key {
                Some(key) => req.bearer_auth(key),
                None => req,
            }
        })
        .await?;
        let json: serde_json::Value = response.json().await?;
        parse_completion(&json)
    }
}

/// Sends the request built by `build`, retrying rate limits, server errors
/// and transport failures with exponential backoff.
pub(crate) async fn send_with_retry<F>(
    max_retries: u32,
    what: &str,
    build: F,
) -> Result<reqwest::Response>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }
                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(attempt, %status, "{} failed; retrying", what);
                    last_err = Some(anyhow!("{} API error {}: {}", what, status, body_text));
                    continue;
                }
                bail!("{} API error {}: {}", what, status, body_text);
            }
            Err(e) => {
                warn!(attempt, error = %e, "{} request failed; retrying", what);
                last_err = Some(e.into());
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} failed after retries", what)))
}

fn parse_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|c| c.trim().to_string())
        .ok_or_else(|| anyhow!("Invalid completion response: missing choices[0].message.content"))
}
