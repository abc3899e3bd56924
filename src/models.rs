//! Core data models shared by the store, the task queues, and the API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How much work the indexer spends on a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexDepth {
    /// Name, folder, mime type and size only.
    Shallow,
    /// Shallow plus locally extracted text.
    #[default]
    Standard,
    /// Standard plus OCR, transcription and summarization tasks.
    Deep,
}

impl IndexDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexDepth::Shallow => "shallow",
            IndexDepth::Standard => "standard",
            IndexDepth::Deep => "deep",
        }
    }
}

impl FromStr for IndexDepth {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shallow" => Ok(IndexDepth::Shallow),
            "standard" => Ok(IndexDepth::Standard),
            "deep" => Ok(IndexDepth::Deep),
            other => anyhow::bail!(
                "invalid index depth: '{}'. Use shallow, standard, or deep.",
                other
            ),
        }
    }
}

impl fmt::Display for IndexDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TaskStatus::Pending),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => anyhow::bail!("invalid task status: '{}'", s),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which queue a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Ocr,
    Transcription,
    Summarization,
    Chat,
}

impl TaskKind {
    pub const ALL: [TaskKind; 4] = [
        TaskKind::Ocr,
        TaskKind::Transcription,
        TaskKind::Summarization,
        TaskKind::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Ocr => "ocr",
            TaskKind::Transcription => "transcription",
            TaskKind::Summarization => "summarization",
            TaskKind::Chat => "chat",
        }
    }
}

impl FromStr for TaskKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ocr" => Ok(TaskKind::Ocr),
            "transcription" => Ok(TaskKind::Transcription),
            "summarization" | "summary" => Ok(TaskKind::Summarization),
            "chat" => Ok(TaskKind::Chat),
            other => anyhow::bail!(
                "invalid task kind: '{}'. Use ocr, transcription, summarization, or chat.",
                other
            ),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An uploaded file and its indexed text.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    /// Subfolder relative to the storage root; empty for the root.
    pub folder: String,
    /// Path of the stored bytes relative to the storage root.
    pub stored_path: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub indexed_at: Option<i64>,
    pub index_depth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub file_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub archived: bool,
    pub created_at: i64,
    pub file_count: i64,
}

/// A calendar entry. `end_at` is `None` while the timer is running.
#[derive(Debug, Clone, Serialize)]
pub struct Activity {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub project: Option<String>,
    pub start_at: i64,
    pub end_at: Option<i64>,
}

impl Activity {
    /// Seconds of this activity inside `[from, to)`, counting a running one
    /// up to `now`.
    pub fn seconds_within(&self, from: i64, to: i64, now: i64) -> i64 {
        let start = self.start_at.max(from);
        let end = self.end_at.unwrap_or(now).min(to);
        (end - start).max(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub target_id: String,
    pub status: TaskStatus,
    pub payload: Option<serde_json::Value>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub id: i64,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: i64,
    pub task_id: Option<String>,
    pub references: Vec<ChatReference>,
}

/// Something a chat message points at for context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ChatReference {
    File(String),
    Activity(i64),
}
