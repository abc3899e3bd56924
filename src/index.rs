//! Tiered file indexing.
//!
//! | Depth | What runs |
//! |-------|-----------|
//! | `shallow` | nothing beyond the metadata already in `files` |
//! | `standard` | local text extraction ([`crate::extract`]) |
//! | `deep` | standard + OCR for images, transcription for audio, and a summary once text exists |
//!
//! Every pass ends by rebuilding the file's `files_fts` row so search sees
//! the new text immediately.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::app::App;
use crate::extract::{self, MediaClass};
use crate::files::{self, truncate_chars};
use crate::models::{FileRecord, IndexDepth, Task, TaskKind};
use crate::storage;

#[derive(Debug, Clone, Serialize)]
pub struct IndexOutcome {
    pub file: FileRecord,
    pub tasks: Vec<Task>,
}

/// Payload flag asking OCR/transcription to chain a summary.
pub const SUMMARIZE_AFTER: &str = "summarize";

pub async fn index_file(app: &App, id: &str, depth: IndexDepth) -> Result<IndexOutcome> {
    let file = files::get_file(&app.pool, id).await?;
    let class = extract::classify(&file.mime_type);

    let extracted = if depth >= IndexDepth::Standard && class == MediaClass::Document {
        extract_content(app, &file).await
    } else {
        None
    };
    files::set_indexed(&app.pool, id, depth, extracted.as_deref()).await?;
    refresh_fts(&app.pool, id).await?;

    let file = files::get_file(&app.pool, id).await?;
    let has_text = file
        .content
        .as_deref()
        .map(|c| !c.trim().is_empty())
        .unwrap_or(false);

    let mut tasks = Vec::new();
    let wants_summary = depth == IndexDepth::Deep
        || (depth == IndexDepth::Standard && app.config.index.auto_summarize);

    if depth == IndexDepth::Deep {
        let chain = serde_json::json!({ SUMMARIZE_AFTER: true });
        match class {
            MediaClass::Image => {
                tasks.push(app.queues.submit(TaskKind::Ocr, id, Some(chain)).await?);
            }
            MediaClass::Audio => {
                tasks.push(
                    app.queues
                        .submit(TaskKind::Transcription, id, Some(chain))
                        .await?,
                );
            }
            MediaClass::Document | MediaClass::Other => {}
        }
    }
    if wants_summary && has_text && class == MediaClass::Document {
        tasks.push(app.queues.submit(TaskKind::Summarization, id, None).await?);
    }

    debug!(file_id = %id, %depth, tasks = tasks.len(), "indexed");
    Ok(IndexOutcome { file, tasks })
}

async fn extract_content(app: &App, file: &FileRecord) -> Option<String> {
    let bytes = match storage::read_bytes(&app.config, file).await {
        Ok(b) => b,
        Err(e) => {
            warn!(file_id = %file.id, error = %e, "cannot read stored bytes");
            return None;
        }
    };

    let mime = file.mime_type.clone();
    // pdf-extract and the OOXML readers are CPU bound.
    let result = tokio::task::spawn_blocking(move || extract::extract_text(&bytes, &mime)).await;
    match result {
        Ok(Ok(text)) => {
            let text = truncate_chars(text.trim(), app.config.index.max_content_chars);
            Some(text.to_string())
        }
        Ok(Err(e)) => {
            warn!(file_id = %file.id, error = %e, "text extraction failed");
            None
        }
        Err(e) => {
            warn!(file_id = %file.id, error = %e, "text extraction panicked");
            None
        }
    }
}

/// Re-runs indexing for every stored file.
pub async fn reindex_all(app: &App, depth: IndexDepth) -> Result<(u64, u64)> {
    let mut indexed = 0u64;
    let mut queued = 0u64;
    for id in files::all_file_ids(&app.pool).await? {
        match index_file(app, &id, depth).await {
            Ok(outcome) => {
                indexed += 1;
                queued += outcome.tasks.len() as u64;
            }
            Err(e) => warn!(file_id = %id, error = %e, "reindex failed"),
        }
    }
    Ok((indexed, queued))
}

/// Rebuilds the full-text row of a file from its current name, folder,
/// content, summary, tags and projects.
pub async fn refresh_fts(pool: &SqlitePool, id: &str) -> Result<()> {
    let file = match files::find_file(pool, id).await? {
        Some(f) => f,
        None => return Ok(()),
    };

    let tags: Vec<String> = sqlx::query_scalar(
        "SELECT t.name FROM tags t JOIN file_tags ft ON ft.tag_id = t.id WHERE ft.file_id = ? ORDER BY t.name",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;
    let projects: Vec<String> = sqlx::query_scalar(
        "SELECT p.name FROM projects p JOIN file_projects fp ON fp.project_id = p.id WHERE fp.file_id = ? ORDER BY p.name",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;
    let labels = tags
        .iter()
        .chain(projects.iter())
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM files_fts WHERE file_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "INSERT INTO files_fts (file_id, name, folder, content, summary, labels) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(&file.name)
    .bind(file.folder.replace('/', " "))
    .bind(file.content.as_deref().unwrap_or(""))
    .bind(file.summary.as_deref().unwrap_or(""))
    .bind(&labels)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use crate::tasks::TaskFilter;

    #[tokio::test]
    async fn shallow_skips_extraction() {
        let (_tmp, app) = App::test().await;
        let out = storage::store_upload(&app, "a.txt", "", b"hidden words", IndexDepth::Shallow)
            .await
            .unwrap();
        assert!(out.file.content.is_none());
        assert_eq!(out.file.index_depth.as_deref(), Some("shallow"));

        let upgraded = index_file(&app, &out.file.id, IndexDepth::Standard).await.unwrap();
        assert_eq!(upgraded.file.content.as_deref(), Some("hidden words"));
    }

    #[tokio::test]
    async fn deep_queues_ocr_for_images_and_summary_for_text() {
        let (_tmp, app) = App::test().await;
        let img = storage::store_upload(&app, "scan.png", "", b"\x89PNGfake", IndexDepth::Deep)
            .await
            .unwrap();
        assert_eq!(img.tasks.len(), 1);
        assert_eq!(img.tasks[0].kind, TaskKind::Ocr);
        assert_eq!(img.tasks[0].status, TaskStatus::Pending);

        let doc = storage::store_upload(&app, "n.txt", "", b"some text", IndexDepth::Deep)
            .await
            .unwrap();
        assert_eq!(doc.tasks.len(), 1);
        assert_eq!(doc.tasks[0].kind, TaskKind::Summarization);

        let audio = storage::store_upload(&app, "memo.mp3", "", b"ID3", IndexDepth::Deep)
            .await
            .unwrap();
        assert_eq!(audio.tasks[0].kind, TaskKind::Transcription);
    }

    #[tokio::test]
    async fn reindex_does_not_duplicate_active_tasks() {
        let (_tmp, app) = App::test().await;
        let img = storage::store_upload(&app, "scan.png", "", b"\x89PNG", IndexDepth::Deep)
            .await
            .unwrap();
        index_file(&app, &img.file.id, IndexDepth::Deep).await.unwrap();

        let tasks = app
            .queues
            .store()
            .list(&TaskFilter {
                target_id: Some(img.file.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn image_text_survives_reindex() {
        let (_tmp, app) = App::test().await;
        let img = storage::store_upload(&app, "scan.png", "", b"\x89PNG", IndexDepth::Shallow)
            .await
            .unwrap();
        files::append_content(&app.pool, &img.file.id, "receipt total 42", 1000)
            .await
            .unwrap();
        let out = index_file(&app, &img.file.id, IndexDepth::Standard).await.unwrap();
        assert_eq!(out.file.content.as_deref(), Some("receipt total 42"));
    }
}
