//! LLM summaries of file content.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::error::KbError;
use crate::files::{self, truncate_chars};
use crate::index::{refresh_fts, SUMMARIZE_AFTER};
use crate::llm::{LlmClient, LlmMessage};
use crate::models::{Task, TaskKind};
use crate::tasks::{TaskHandler, TaskQueue};

const SYSTEM_PROMPT: &str = "You summarize files for a personal knowledge base. \
Reply with the summary only: no preamble, no headings.";

/// Queues a summary of `task`'s target when the task asked for one or
/// `auto_summarize` is on. The target's text just changed, so a summary
/// already running on the old text does not count.
pub(crate) async fn chain_summary(summaries: &TaskQueue, config: &Config, task: &Task) -> Result<()> {
    let requested = task
        .payload
        .as_ref()
        .and_then(|p| p.get(SUMMARIZE_AFTER))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if requested || config.index.auto_summarize {
        summaries.submit_after_change(&task.target_id, None).await?;
    }
    Ok(())
}

pub(crate) fn summary_prompt(name: &str, text: &str, max_words: usize) -> Vec<LlmMessage> {
    vec![
        LlmMessage::system(SYSTEM_PROMPT),
        LlmMessage::user(format!(
            "Summarize the file \"{}\" in at most {} words.\n\n{}",
            name, max_words, text
        )),
    ]
}

pub struct SummarizeHandler {
    pool: SqlitePool,
    config: Arc<Config>,
    llm: Arc<dyn LlmClient>,
}

impl SummarizeHandler {
    pub fn new(pool: SqlitePool, config: Arc<Config>, llm: Arc<dyn LlmClient>) -> Self {
        Self { pool, config, llm }
    }
}

#[async_trait]
impl TaskHandler for SummarizeHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Summarization
    }

    async fn run(&self, task: &Task) -> Result<Option<String>> {
        let file = files::get_file(&self.pool, &task.target_id).await?;
        let content = file.content.as_deref().map(str::trim).unwrap_or("");
        if content.is_empty() {
            return Err(KbError::invalid(format!(
                "summary target: {} has no text (index it at standard depth or run ocr/transcription first)",
                file.name
            )));
        }

        let text = truncate_chars(content, self.config.llm.max_context_chars);
        let prompt = summary_prompt(&file.name, text, self.config.llm.summary_max_words);
        let summary = self.llm.complete(&prompt).await?;
        if summary.is_empty() {
            anyhow::bail!("llm returned an empty summary");
        }

        files::set_summary(&self.pool, &file.id, &summary).await?;
        refresh_fts(&self.pool, &file.id).await?;
        info!(file_id = %file.id, words = summary.split_whitespace().count(), "summary stored");
        Ok(Some(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::llm::tests::FakeLlm;
    use crate::models::{IndexDepth, TaskStatus};
    use crate::search::{search_files, FileQuery};
    use crate::storage;
    use crate::tasks::TaskFilter;

    #[tokio::test]
    async fn stores_summary_and_indexes_it() {
        let (_tmp, app) = App::test().await;
        let up = storage::store_upload(&app, "n.txt", "", b"long meeting notes", IndexDepth::Standard)
            .await
            .unwrap();
        let task = app
            .queues
            .submit(TaskKind::Summarization, &up.file.id, None)
            .await
            .unwrap();

        let llm = FakeLlm::new("Budget approved for zeppelin");
        let handler = SummarizeHandler::new(app.pool.clone(), app.config.clone(), llm.clone());
        let result = handler.run(&task).await.unwrap();
        assert_eq!(result.as_deref(), Some("Budget approved for zeppelin"));

        let prompt = &llm.seen.lock().unwrap()[0];
        assert!(prompt[1].content.contains("long meeting notes"));
        assert!(prompt[1].content.contains("200 words"));

        let hits = search_files(
            &app.pool,
            &FileQuery {
                text: Some("zeppelin".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file.summary.as_deref(), Some("Budget approved for zeppelin"));
    }

    #[tokio::test]
    async fn empty_content_fails() {
        let (_tmp, app) = App::test().await;
        let up = storage::store_upload(&app, "n.txt", "", b"words", IndexDepth::Shallow)
            .await
            .unwrap();
        let task = app
            .queues
            .submit(TaskKind::Summarization, &up.file.id, None)
            .await
            .unwrap();
        let handler =
            SummarizeHandler::new(app.pool.clone(), app.config.clone(), FakeLlm::new("x"));
        assert!(handler.run(&task).await.is_err());
    }

    #[tokio::test]
    async fn chains_only_when_requested() {
        let (_tmp, app) = App::test().await;
        let up = storage::store_upload(&app, "a.png", "", b"\x89PNG", IndexDepth::Shallow)
            .await
            .unwrap();
        let summaries = app.queues.queue(TaskKind::Summarization);

        let plain = app.queues.submit(TaskKind::Ocr, &up.file.id, None).await.unwrap();
        chain_summary(summaries, &app.config, &plain).await.unwrap();
        assert_eq!(app.queues.store().count_active().await.unwrap(), 1);

        let mut chained = plain.clone();
        chained.payload = Some(serde_json::json!({ SUMMARIZE_AFTER: true }));
        chain_summary(summaries, &app.config, &chained).await.unwrap();
        assert_eq!(app.queues.store().count_active().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn chained_summary_queues_behind_a_running_one() {
        let (_tmp, app) = App::test().await;
        let up = storage::store_upload(&app, "scan.png", "", b"\x89PNG", IndexDepth::Shallow)
            .await
            .unwrap();
        let store = app.queues.store();
        let summaries = app.queues.queue(TaskKind::Summarization);

        // A summary of the old text is already running.
        let running = summaries.submit(&up.file.id, None).await.unwrap();
        store.mark_in_progress(&running.id).await.unwrap();

        let mut ocr = app.queues.submit(TaskKind::Ocr, &up.file.id, None).await.unwrap();
        ocr.payload = Some(serde_json::json!({ SUMMARIZE_AFTER: true }));
        chain_summary(summaries, &app.config, &ocr).await.unwrap();
        chain_summary(summaries, &app.config, &ocr).await.unwrap();

        let queued = store
            .list(&TaskFilter {
                kind: Some(TaskKind::Summarization),
                target_id: Some(up.file.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
        let pending: Vec<_> = queued
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        assert_eq!(pending.len(), 1);
        assert_ne!(pending[0].id, running.id);
    }
}
