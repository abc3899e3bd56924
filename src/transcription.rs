//! Speech-to-text for audio uploads.
//!
//! `OpenAiTranscriber` posts the audio as multipart form data to
//! `{llm.base_url}/audio/transcriptions`, sharing the chat client's base
//! URL, timeout and retry policy.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::KbError;
use crate::extract::{self, MediaClass};
use crate::files;
use crate::index::refresh_fts;
use crate::llm::send_with_retry;
use crate::models::{Task, TaskKind};
use crate::storage;
use crate::summarize::chain_summary;
use crate::tasks::{TaskHandler, TaskQueue};

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, name: &str, audio: Vec<u8>) -> Result<String>;
}

pub fn transcriber_from_config(config: &Config) -> Result<Arc<dyn Transcriber>> {
    match config.transcription.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledTranscriber)),
        "openai" => Ok(Arc::new(OpenAiTranscriber::new(config)?)),
        other => bail!("Unknown transcription provider: {}", other),
    }
}

pub struct DisabledTranscriber;

#[async_trait]
impl Transcriber for DisabledTranscriber {
    async fn transcribe(&self, _name: &str, _audio: Vec<u8>) -> Result<String> {
        Err(KbError::Disabled("transcription (set [transcription].provider)".to_string()).into())
    }
}

pub struct OpenAiTranscriber {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl OpenAiTranscriber {
    pub fn new(config: &Config) -> Result<Self> {
        // Audio uploads take longer than chat turns.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm.timeout_secs.saturating_mul(5)))
            .build()?;
        Ok(Self {
            client,
            url: format!(
                "{}/audio/transcriptions",
                config.llm.base_url.trim_end_matches('/')
            ),
            model: config.transcription.model.clone(),
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            max_retries: config.llm.max_retries,
        })
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, name: &str, audio: Vec<u8>) -> Result<String> {
        debug!(model = %self.model, bytes = audio.len(), "transcription request");
        let response = send_with_retry(self.max_retries, "transcription", || {
            let form = Form::new()
                .text("model", self.model.clone())
                .part("file", Part::bytes(audio.clone()).file_name(name.to_string()));
            let req = self.client.post(&self.url).multipart(form);
            match &self.api_key {
                Some(key) => req.bearer_auth(key),
                None => req,
            }
        })
        .await?;
        let json: serde_json::Value = response.json().await?;
        json.get("text")
            .and_then(|t| t.as_str())
            .map(|t| t.trim().to_string())
            .ok_or_else(|| anyhow!("Invalid transcription response: missing text"))
    }
}

pub struct TranscriptionHandler {
    pool: SqlitePool,
    config: Arc<Config>,
    transcriber: Arc<dyn Transcriber>,
    summaries: TaskQueue,
}

impl TranscriptionHandler {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        transcriber: Arc<dyn Transcriber>,
        summaries: TaskQueue,
    ) -> Self {
        Self {
            pool,
            config,
            transcriber,
            summaries,
        }
    }
}

#[async_trait]
impl TaskHandler for TranscriptionHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Transcription
    }

    async fn run(&self, task: &Task) -> Result<Option<String>> {
        let file = files::get_file(&self.pool, &task.target_id).await?;
        if extract::classify(&file.mime_type) != MediaClass::Audio {
            return Err(KbError::invalid(format!(
                "transcription target: {} is {}, not audio",
                file.name, file.mime_type
            )));
        }

        let audio = storage::read_bytes(&self.config, &file).await?;
        let transcript = self.transcriber.transcribe(&file.name, audio).await?;
        if transcript.is_empty() {
            return Ok(Some("empty transcript".to_string()));
        }

        files::append_content(
            &self.pool,
            &file.id,
            &transcript,
            self.config.index.max_content_chars,
        )
        .await?;
        refresh_fts(&self.pool, &file.id).await?;
        info!(file_id = %file.id, chars = transcript.chars().count(), "transcript stored");

        chain_summary(&self.summaries, &self.config, task).await?;
        Ok(Some(format!("{} characters transcribed", transcript.chars().count())))
    }
}
