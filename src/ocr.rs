//! Optical character recognition for image uploads.
//!
//! The default engine shells out to the `tesseract` CLI:
//!
//! ```text
//! tesseract <path> stdout -l <languages>
//! ```
//!
//! Recognised text is appended to the file's content so it becomes
//! searchable, and a summary can be chained afterwards.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{Config, OcrConfig};
use crate::error::KbError;
use crate::extract::{self, MediaClass};
use crate::files;
use crate::index::refresh_fts;
use crate::models::{Task, TaskKind};
use crate::storage;
use crate::summarize::chain_summary;
use crate::tasks::{TaskHandler, TaskQueue};

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, path: &Path) -> Result<String>;
}

pub fn engine_from_config(config: &OcrConfig) -> Result<Arc<dyn OcrEngine>> {
    match config.engine.as_str() {
        "disabled" => Ok(Arc::new(DisabledOcr)),
        "tesseract" => Ok(Arc::new(TesseractEngine {
            command: PathBuf::from(&config.command),
            languages: config.languages.clone(),
        })),
        other => bail!("Unknown ocr engine: {}", other),
    }
}

pub struct DisabledOcr;

#[async_trait]
impl OcrEngine for DisabledOcr {
    async fn recognize(&self, _path: &Path) -> Result<String> {
        Err(KbError::Disabled("ocr (set [ocr].engine)".to_string()).into())
    }
}

pub struct TesseractEngine {
    pub command: PathBuf,
    pub languages: String,
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    async fn recognize(&self, path: &Path) -> Result<String> {
        let output = tokio::process::Command::new(&self.command)
            .arg(path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.languages)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.command.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.command.display(),
                output.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

pub struct OcrHandler {
    pool: SqlitePool,
    config: Arc<Config>,
    engine: Arc<dyn OcrEngine>,
    summaries: TaskQueue,
}

impl OcrHandler {
    pub fn new(
        pool: SqlitePool,
        config: Arc<Config>,
        engine: Arc<dyn OcrEngine>,
        summaries: TaskQueue,
    ) -> Self {
        Self {
            pool,
            config,
            engine,
            summaries,
        }
    }
}

#[async_trait]
impl TaskHandler for OcrHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Ocr
    }

    async fn run(&self, task: &Task) -> Result<Option<String>> {
        let file = files::get_file(&self.pool, &task.target_id).await?;
        if extract::classify(&file.mime_type) != MediaClass::Image {
            return Err(KbError::invalid(format!(
                "ocr target: {} is {}, not an image",
                file.name, file.mime_type
            )));
        }

        let path = storage::stored_file_path(&self.config, &file);
        let text = self.engine.recognize(&path).await?;
        if text.is_empty() {
            debug!(file_id = %file.id, "no text recognised");
            return Ok(Some("no text recognised".to_string()));
        }

        files::append_content(&self.pool, &file.id, &text, self.config.index.max_content_chars)
            .await?;
        refresh_fts(&self.pool, &file.id).await?;
        info!(file_id = %file.id, chars = text.chars().count(), "ocr text stored");

        chain_summary(&self.summaries, &self.config, task).await?;
        Ok(Some(format!("{} characters recognised", text.chars().count())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::models::{IndexDepth, TaskStatus};
    use crate::search::{search_files, FileQuery};
    use crate::tasks::TaskFilter;

    struct FixedOcr(&'static str);

    #[async_trait]
    impl OcrEngine for FixedOcr {
        async fn recognize(&self, path: &Path) -> Result<String> {
            assert!(path.exists(), "engine must see the stored file");
            Ok(self.0.to_string())
        }
    }

    fn handler(app: &App, engine: Arc<dyn OcrEngine>) -> OcrHandler {
        OcrHandler::new(
            app.pool.clone(),
            app.config.clone(),
            engine,
            app.queues.queue(TaskKind::Summarization).clone(),
        )
    }

    #[tokio::test]
    async fn recognised_text_becomes_searchable_and_chains_summary() {
        let (_tmp, app) = App::test().await;
        let up = storage::store_upload(&app, "receipt.png", "", b"\x89PNG", IndexDepth::Deep)
            .await
            .unwrap();
        let task = up.tasks[0].clone();

        let result = handler(&app, Arc::new(FixedOcr("Hardware store total 42")))
            .run(&task)
            .await
            .unwrap();
        assert!(result.unwrap().contains("characters"));

        let hits = search_files(
            &app.pool,
            &FileQuery {
                text: Some("hardware".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 1);

        let summaries = app
            .queues
            .store()
            .list(&TaskFilter {
                kind: Some(TaskKind::Summarization),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn rejects_non_images() {
        let (_tmp, app) = App::test().await;
        let up = storage::store_upload(&app, "a.txt", "", b"text", IndexDepth::Shallow)
            .await
            .unwrap();
        let task = app
            .queues
            .submit(TaskKind::Ocr, &up.file.id, None)
            .await
            .unwrap();
        let err = handler(&app, Arc::new(FixedOcr("x"))).run(&task).await.unwrap_err();
        assert!(err.to_string().contains("not an image"));
    }

    #[tokio::test]
    async fn disabled_engine_fails_clearly() {
        let (_tmp, app) = App::test().await;
        let up = storage::store_upload(&app, "scan.jpg", "", b"\xff\xd8", IndexDepth::Shallow)
            .await
            .unwrap();
        let task = app
            .queues
            .submit(TaskKind::Ocr, &up.file.id, None)
            .await
            .unwrap();
        let err = handler(&app, Arc::new(DisabledOcr)).run(&task).await.unwrap_err();
        assert!(err.to_string().contains("ocr"));
        assert!(err.to_string().contains("disabled"));
    }
}
