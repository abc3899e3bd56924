//! Chat sessions with an LLM that can see referenced files and activities.
//!
//! Sending a message stores it immediately and queues a `chat` task; the
//! assistant reply is written by [`ChatHandler`] when the task runs. The
//! prompt sent to the model is:
//!
//! 1. a system instruction,
//! 2. a context block built from every file and activity referenced in the
//!    session, bounded by `[llm].max_context_chars`,
//! 3. the last [`HISTORY_MESSAGES`] messages up to the one being answered.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::app::App;
use crate::calendar;
use crate::config::Config;
use crate::error::KbError;
use crate::files::{self, truncate_chars};
use crate::llm::{LlmClient, LlmMessage};
use crate::models::{ChatMessage, ChatReference, ChatSession, Task, TaskKind};
use crate::tasks::TaskHandler;

pub const HISTORY_MESSAGES: i64 = 20;
const DEFAULT_TITLE: &str = "New chat";
const TITLE_CHARS: usize = 60;

const SYSTEM_PROMPT: &str = "You are the assistant of a personal knowledge base. \
Answer using the provided context about the user's files and calendar when it is relevant. \
If the context does not contain the answer, say so.";

#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub message: ChatMessage,
    pub task: Task,
}

fn session_from_row(row: &SqliteRow) -> ChatSession {
    ChatSession {
        id: row.get("id"),
        title: row.get("title"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn message_from_row(row: &SqliteRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        session_id: row.get("session_id"),
        role: row.get("role"),
        content: row.get("content"),
        created_at: row.get("created_at"),
        task_id: row.get("task_id"),
        references: Vec::new(),
    }
}

fn reference_from_parts(kind: &str, id: &str) -> Option<ChatReference> {
    match kind {
        "file" => Some(ChatReference::File(id.to_string())),
        "activity" => id.parse().ok().map(ChatReference::Activity),
        _ => None,
    }
}

fn reference_parts(r: &ChatReference) -> (&'static str, String) {
    match r {
        ChatReference::File(id) => ("file", id.clone()),
        ChatReference::Activity(id) => ("activity", id.to_string()),
    }
}

// ============ Sessions ============

pub async fn create_session(pool: &SqlitePool, title: Option<&str>) -> Result<ChatSession> {
    let title = title
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TITLE);
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    sqlx::query("INSERT INTO chat_sessions (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;
    info!(session_id = %id, "created chat session");
    get_session(pool, &id).await
}

pub async fn get_session(pool: &SqlitePool, id: &str) -> Result<ChatSession> {
    let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref()
        .map(session_from_row)
        .ok_or_else(|| KbError::not_found(format!("chat session {}", id)))
}

/// Sessions, most recently active first.
pub async fn list_sessions(pool: &SqlitePool) -> Result<Vec<ChatSession>> {
    let rows = sqlx::query("SELECT * FROM chat_sessions ORDER BY updated_at DESC, created_at DESC")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(session_from_row).collect())
}

pub async fn rename_session(pool: &SqlitePool, id: &str, title: &str) -> Result<ChatSession> {
    let title = title.trim();
    if title.is_empty() {
        return Err(KbError::invalid("session title: must not be empty"));
    }
    let updated = sqlx::query("UPDATE chat_sessions SET title = ? WHERE id = ?")
        .bind(title)
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(KbError::not_found(format!("chat session {}", id)));
    }
    get_session(pool, id).await
}

/// Deletes a session with its messages and their references.
pub async fn delete_session(pool: &SqlitePool, id: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM chat_references WHERE message_id IN (SELECT id FROM chat_messages WHERE session_id = ?)",
    )
    .bind(id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM chat_messages WHERE session_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query("DELETE FROM chat_sessions WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(KbError::not_found(format!("chat session {}", id)));
    }
    tx.commit().await?;
    info!(session_id = %id, "deleted chat session");
    Ok(())
}

/// Every message of a session in order, with references.
pub async fn history(pool: &SqlitePool, session_id: &str) -> Result<Vec<ChatMessage>> {
    get_session(pool, session_id).await?;
    let rows = sqlx::query("SELECT * FROM chat_messages WHERE session_id = ? ORDER BY id ASC")
        .bind(session_id)
        .fetch_all(pool)
        .await?;
    let mut messages: Vec<ChatMessage> = rows.iter().map(message_from_row).collect();

    let mut refs = session_references(pool, session_id).await?;
    for m in &mut messages {
        if let Some(r) = refs.remove(&m.id) {
            m.references = r;
        }
    }
    Ok(messages)
}

async fn session_references(
    pool: &SqlitePool,
    session_id: &str,
) -> Result<HashMap<i64, Vec<ChatReference>>> {
    let rows = sqlx::query(
        "SELECT r.message_id, r.ref_kind, r.ref_id FROM chat_references r
         JOIN chat_messages m ON m.id = r.message_id
         WHERE m.session_id = ? ORDER BY r.message_id ASC, r.rowid ASC",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    let mut map: HashMap<i64, Vec<ChatReference>> = HashMap::new();
    for row in &rows {
        let kind: String = row.get("ref_kind");
        let id: String = row.get("ref_id");
        if let Some(r) = reference_from_parts(&kind, &id) {
            map.entry(row.get("message_id")).or_default().push(r);
        }
    }
    Ok(map)
}

async fn insert_message(
    pool: &SqlitePool,
    session_id: &str,
    role: &str,
    content: &str,
    task_id: Option<&str>,
    references: &[ChatReference],
) -> Result<i64> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;
    let id = sqlx::query(
        "INSERT INTO chat_messages (session_id, role, content, created_at, task_id) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(session_id)
    .bind(role)
    .bind(content)
    .bind(now)
    .bind(task_id)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();
    for r in references {
        let (kind, ref_id) = reference_parts(r);
        sqlx::query("INSERT OR IGNORE INTO chat_references (message_id, ref_kind, ref_id) VALUES (?, ?, ?)")
            .bind(id)
            .bind(kind)
            .bind(ref_id)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(id)
}

async fn get_message(pool: &SqlitePool, id: i64) -> Result<ChatMessage> {
    let row = sqlx::query("SELECT * FROM chat_messages WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let mut message = row
        .as_ref()
        .map(message_from_row)
        .ok_or_else(|| KbError::not_found(format!("chat message {}", id)))?;
    let rows = sqlx::query("SELECT ref_kind, ref_id FROM chat_references WHERE message_id = ? ORDER BY rowid ASC")
        .bind(id)
        .fetch_all(pool)
        .await?;
    message.references = rows
        .iter()
        .filter_map(|r| {
            let kind: String = r.get("ref_kind");
            let id: String = r.get("ref_id");
            reference_from_parts(&kind, &id)
        })
        .collect();
    Ok(message)
}

// ============ Sending ============

/// Stores a user message and queues the assistant reply.
pub async fn send_message(
    app: &App,
    session_id: &str,
    content: &str,
    references: &[ChatReference],
) -> Result<SendOutcome> {
    let content = content.trim();
    if content.is_empty() {
        return Err(KbError::invalid("message: must not be empty"));
    }
    let session = get_session(&app.pool, session_id).await?;
    for r in references {
        match r {
            ChatReference::File(id) => {
                files::get_file(&app.pool, id).await?;
            }
            ChatReference::Activity(id) => {
                calendar::get_activity(&app.pool, *id).await?;
            }
        }
    }

    let message_id =
        insert_message(&app.pool, session_id, "user", content, None, references).await?;
    if session.title == DEFAULT_TITLE {
        let title = truncate_chars(content.lines().next().unwrap_or(content), TITLE_CHARS);
        rename_session(&app.pool, session_id, title).await?;
    }

    let task = app
        .queues
        .submit(
            TaskKind::Chat,
            session_id,
            Some(serde_json::json!({ "message_id": message_id })),
        )
        .await?;
    sqlx::query("UPDATE chat_messages SET task_id = ? WHERE id = ?")
        .bind(&task.id)
        .bind(message_id)
        .execute(&app.pool)
        .await?;

    let message = get_message(&app.pool, message_id).await?;
    Ok(SendOutcome { message, task })
}

// ============ Handler ============

pub struct ChatHandler {
    pool: SqlitePool,
    config: Arc<Config>,
    llm: Arc<dyn LlmClient>,
}

impl ChatHandler {
    pub fn new(pool: SqlitePool, config: Arc<Config>, llm: Arc<dyn LlmClient>) -> Self {
        Self { pool, config, llm }
    }

    /// Messages up to and including `up_to`, oldest first.
    async fn recent_messages(&self, session_id: &str, up_to: i64) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM (
                SELECT * FROM chat_messages WHERE session_id = ? AND id <= ?
                ORDER BY id DESC LIMIT ?
             ) ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(up_to)
        .bind(HISTORY_MESSAGES)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Distinct references made in the session up to `up_to`, latest first.
    async fn context_references(&self, session_id: &str, up_to: i64) -> Result<Vec<ChatReference>> {
        let refs = session_references(&self.pool, session_id).await?;
        let mut ids: Vec<&i64> = refs.keys().filter(|id| **id <= up_to).collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));

        let mut out: Vec<ChatReference> = Vec::new();
        for id in ids {
            for r in &refs[id] {
                if !out.contains(r) {
                    out.push(r.clone());
                }
            }
        }
        Ok(out)
    }

    async fn describe(&self, r: &ChatReference, budget: usize) -> Result<Option<String>> {
        match r {
            ChatReference::File(id) => {
                let file = match files::find_file(&self.pool, id).await? {
                    Some(f) => f,
                    None => return Ok(None),
                };
                let body = match (&file.summary, &file.content) {
                    (Some(s), _) if !s.trim().is_empty() => format!("Summary: {}", s.trim()),
                    (_, Some(c)) if !c.trim().is_empty() => format!("Content: {}", c.trim()),
                    _ => "(no text available)".to_string(),
                };
                let folder = if file.folder.is_empty() {
                    String::new()
                } else {
                    format!(" in {}", file.folder)
                };
                let text = format!("[file] {}{}\n{}", file.name, folder, body);
                Ok(Some(truncate_chars(&text, budget).to_string()))
            }
            ChatReference::Activity(id) => {
                let a = match calendar::get_activity(&self.pool, *id).await {
                    Ok(a) => a,
                    Err(_) => return Ok(None),
                };
                let end = a
                    .end_at
                    .map(calendar::format_time)
                    .unwrap_or_else(|| "running".to_string());
                let mut text = format!(
                    "[activity] {} from {} to {} UTC",
                    a.title,
                    calendar::format_time(a.start_at),
                    end
                );
                if let Some(p) = &a.project {
                    text.push_str(&format!(", project {}", p));
                }
                if let Some(d) = &a.description {
                    text.push_str(&format!("\n{}", d));
                }
                Ok(Some(truncate_chars(&text, budget).to_string()))
            }
        }
    }

    async fn build_prompt(&self, session_id: &str, up_to: i64) -> Result<Vec<LlmMessage>> {
        let mut prompt = vec![LlmMessage::system(SYSTEM_PROMPT)];

        let refs = self.context_references(session_id, up_to).await?;
        if !refs.is_empty() {
            let total = self.config.llm.max_context_chars;
            let budget = (total / refs.len()).max(1);
            let mut block = String::from("Context:\n");
            for r in &refs {
                if let Some(text) = self.describe(r, budget).await? {
                    block.push_str(&text);
                    block.push_str("\n\n");
                }
            }
            prompt.push(LlmMessage::system(truncate_chars(block.trim_end(), total)));
        }

        for m in self.recent_messages(session_id, up_to).await? {
            prompt.push(match m.role.as_str() {
                "assistant" => LlmMessage::assistant(m.content),
                _ => LlmMessage::user(m.content),
            });
        }
        Ok(prompt)
    }
}

#[async_trait]
impl TaskHandler for ChatHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Chat
    }

    async fn run(&self, task: &Task) -> Result<Option<String>> {
        let session_id = &task.target_id;
        get_session(&self.pool, session_id).await?;
        let up_to = task
            .payload
            .as_ref()
            .and_then(|p| p.get("message_id"))
            .and_then(|v| v.as_i64())
            .unwrap_or(i64::MAX);

        let prompt = self.build_prompt(session_id, up_to).await?;
        debug!(%session_id, messages = prompt.len(), "chat prompt built");
        let reply = self.llm.complete(&prompt).await?;

        let id = insert_message(&self.pool, session_id, "assistant", &reply, Some(&task.id), &[])
            .await?;
        info!(%session_id, message_id = id, "assistant replied");
        Ok(Some(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::NewActivity;
    use crate::llm::tests::FakeLlm;
    use crate::models::{IndexDepth, TaskStatus};
    use crate::storage::store_upload;

    #[tokio::test]
    async fn sessions_list_by_activity() {
        let (_tmp, app) = App::test().await;
        let a = create_session(&app.pool, Some("first")).await.unwrap();
        let b = create_session(&app.pool, None).await.unwrap();
        assert_eq!(b.title, DEFAULT_TITLE);

        sqlx::query("UPDATE chat_sessions SET updated_at = updated_at + 100 WHERE id = ?")
            .bind(&a.id)
            .execute(&app.pool)
            .await
            .unwrap();
        let list = list_sessions(&app.pool).await.unwrap();
        assert_eq!(list[0].id, a.id);

        rename_session(&app.pool, &b.id, "renamed").await.unwrap();
        delete_session(&app.pool, &a.id).await.unwrap();
        let list = list_sessions(&app.pool).await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "renamed");
    }

    #[tokio::test]
    async fn send_stores_message_and_queues_task() {
        let (_tmp, app) = App::test().await;
        let session = create_session(&app.pool, None).await.unwrap();
        let f = store_upload(&app, "plan.txt", "", b"launch in may", IndexDepth::Standard)
            .await
            .unwrap();

        let out = send_message(
            &app,
            &session.id,
            "When is the launch?",
            &[ChatReference::File(f.file.id.clone())],
        )
        .await
        .unwrap();
        assert_eq!(out.task.kind, TaskKind::Chat);
        assert_eq!(out.task.status, TaskStatus::Pending);
        assert_eq!(out.message.task_id.as_deref(), Some(out.task.id.as_str()));
        assert_eq!(out.message.references, vec![ChatReference::File(f.file.id)]);

        let session = get_session(&app.pool, &session.id).await.unwrap();
        assert_eq!(session.title, "When is the launch?");
    }

    #[tokio::test]
    async fn send_rejects_unknown_references() {
        let (_tmp, app) = App::test().await;
        let session = create_session(&app.pool, None).await.unwrap();
        let err = send_message(&app, &session.id, "hi", &[ChatReference::Activity(99)])
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<KbError>(), Some(KbError::NotFound(_))));
        assert!(history(&app.pool, &session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_answers_with_context() {
        let (_tmp, app) = App::test().await;
        let session = create_session(&app.pool, None).await.unwrap();
        let f = store_upload(&app, "plan.txt", "work", b"launch in may", IndexDepth::Standard)
            .await
            .unwrap();
        let activity = calendar::create_activity(
            &app.pool,
            NewActivity {
                title: "Launch review".into(),
                start_at: 1_700_000_000,
                end_at: Some(1_700_003_600),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let out = send_message(
            &app,
            &session.id,
            "When is the launch?",
            &[
                ChatReference::File(f.file.id.clone()),
                ChatReference::Activity(activity.id),
            ],
        )
        .await
        .unwrap();

        let llm = FakeLlm::new("In May.");
        let handler = ChatHandler::new(app.pool.clone(), app.config.clone(), llm.clone());
        let result = handler.run(&out.task).await.unwrap().unwrap();

        let prompt = llm.seen.lock().unwrap()[0].clone();
        assert_eq!(prompt[0].role, "system");
        assert!(prompt[1].content.contains("launch in may"));
        assert!(prompt[1].content.contains("Launch review"));
        assert_eq!(prompt.last().unwrap().content, "When is the launch?");

        let messages = history(&app.pool, &session.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "In May.");
        assert_eq!(messages[1].id.to_string(), result);
        assert_eq!(messages[1].task_id.as_deref(), Some(out.task.id.as_str()));
    }

    #[tokio::test]
    async fn history_window_is_bounded() {
        let (_tmp, app) = App::test().await;
        let session = create_session(&app.pool, Some("long")).await.unwrap();
        let mut last = 0;
        for i in 0..30 {
            last = insert_message(&app.pool, &session.id, "user", &format!("m{}", i), None, &[])
                .await
                .unwrap();
        }
        let handler = ChatHandler::new(app.pool.clone(), app.config.clone(), FakeLlm::new("ok"));
        let recent = handler.recent_messages(&session.id, last).await.unwrap();
        assert_eq!(recent.len(), HISTORY_MESSAGES as usize);
        assert_eq!(recent[0].content, "m10");
        assert_eq!(recent.last().unwrap().content, "m29");
    }
}
