//! Background task store and single-consumer work queues.
//!
//! OCR, transcription, summarization and chat all share one pattern: a
//! task row is written as `PENDING`, its id is pushed onto an in-memory
//! channel, and one worker per [`TaskKind`] pulls ids off the channel and
//! runs them one at a time:
//!
//! ```text
//! submit() ──▶ tasks (PENDING) ──▶ mpsc ──▶ worker
//!                                            │ mark IN_PROGRESS
//!                                            │ handler.run()
//!                                            ▼
//!                                  COMPLETED(result) | FAILED(error)
//! ```
//!
//! The `tasks` table is the source of truth for polling. Every transition
//! is also published as a [`TaskEvent`] on a broadcast channel so the HTTP
//! server can stream status to clients.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::KbError;
use crate::models::{Task, TaskKind, TaskStatus};

/// Capacity of the broadcast channel carrying [`TaskEvent`]s.
pub const EVENT_CAPACITY: usize = 256;

/// How often [`wait_for`] re-reads the store. Another process may own the
/// task, and its transitions never reach this process's event channel.
const WAIT_POLL: Duration = Duration::from_millis(500);

const ACTIVE: &[TaskStatus] = &[TaskStatus::Pending, TaskStatus::InProgress];
const PENDING: &[TaskStatus] = &[TaskStatus::Pending];

/// Persistence for task rows.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

/// Filters for [`TaskStore::list`].
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub status: Option<TaskStatus>,
    pub target_id: Option<String>,
    pub limit: Option<i64>,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        kind: TaskKind,
        target_id: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<Task> {
        match self.insert(kind, target_id, payload, None).await? {
            Some(task) => Ok(task),
            None => Err(KbError::conflict(format!("pending {} task for {}", kind, target_id))),
        }
    }

    /// Inserts a `PENDING` task unless one of `kind` for `target_id` is
    /// already in one of `blocking`. The check and the insert are one
    /// statement, so concurrent callers cannot both get through.
    async fn insert(
        &self,
        kind: TaskKind,
        target_id: &str,
        payload: Option<serde_json::Value>,
        blocking: Option<&[TaskStatus]>,
    ) -> Result<Option<Task>> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let payload_json = payload.as_ref().map(|p| p.to_string());

        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO tasks (id, kind, target_id, status, payload_json, created_at) SELECT ",
        );
        qb.push_bind(id.clone())
            .push(", ")
            .push_bind(kind.as_str())
            .push(", ")
            .push_bind(target_id)
            .push(", ")
            .push_bind(TaskStatus::Pending.as_str())
            .push(", ")
            .push_bind(payload_json)
            .push(", ")
            .push_bind(now);
        match blocking {
            Some(statuses) if !statuses.is_empty() => {
                qb.push(" WHERE NOT EXISTS (SELECT 1 FROM tasks WHERE kind = ")
                    .push_bind(kind.as_str())
                    .push(" AND target_id = ")
                    .push_bind(target_id)
                    .push(" AND status IN (");
                let mut sep = qb.separated(", ");
                for status in statuses {
                    sep.push_bind(status.as_str());
                }
                qb.push("))");
            }
            _ => {
                qb.push(" WHERE true");
            }
        }
        // The partial unique index allows one PENDING task per target.
        qb.push(" ON CONFLICT DO NOTHING");

        let inserted = qb.build().execute(&self.pool).await?.rows_affected();
        if inserted == 0 {
            return Ok(None);
        }

        Ok(Some(Task {
            id,
            kind,
            target_id: target_id.to_string(),
            status: TaskStatus::Pending,
            payload,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
        }))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Claims a pending task. Returns `None` when the task is not pending
    /// (already claimed, finished, or deleted).
    pub async fn mark_in_progress(&self, id: &str) -> Result<Option<Task>> {
        let now = chrono::Utc::now().timestamp();
        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, started_at = ? WHERE id = ? AND status = ?",
        )
        .bind(TaskStatus::InProgress.as_str())
        .bind(now)
        .bind(id)
        .bind(TaskStatus::Pending.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    /// Finishes a claimed task. `None` means the claim was lost: the task is
    /// no longer `IN_PROGRESS` (failed as interrupted, or deleted) and keeps
    /// its terminal state.
    pub async fn mark_completed(&self, id: &str, result: Option<&str>) -> Result<Option<Task>> {
        self.finish(id, TaskStatus::Completed, result, None).await
    }

    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<Option<Task>> {
        self.finish(id, TaskStatus::Failed, None, Some(error)).await
    }

    async fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<Option<Task>> {
        let now = chrono::Utc::now().timestamp();
        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, result = ?, error = ?, finished_at = ? WHERE id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(result)
        .bind(error)
        .bind(now)
        .bind(id)
        .bind(TaskStatus::InProgress.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.get(id).await
    }

    /// Newest first.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE (?1 IS NULL OR kind = ?1)
              AND (?2 IS NULL OR status = ?2)
              AND (?3 IS NULL OR target_id = ?3)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?4
            "#,
        )
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.target_id)
        .bind(filter.limit.unwrap_or(100))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    /// A `PENDING` or `IN_PROGRESS` task of `kind` for `target_id`, if any.
    pub async fn find_active(&self, kind: TaskKind, target_id: &str) -> Result<Option<Task>> {
        self.find_in(kind, target_id, ACTIVE).await
    }

    /// Oldest task of `kind` for `target_id` whose status is in `statuses`.
    async fn find_in(
        &self,
        kind: TaskKind,
        target_id: &str,
        statuses: &[TaskStatus],
    ) -> Result<Option<Task>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM tasks WHERE kind = ");
        qb.push_bind(kind.as_str())
            .push(" AND target_id = ")
            .push_bind(target_id)
            .push(" AND status IN (");
        let mut sep = qb.separated(", ");
        for status in statuses {
            sep.push_bind(status.as_str());
        }
        qb.push(") ORDER BY created_at ASC, rowid ASC LIMIT 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(task_from_row).transpose()
    }

    /// Pending tasks of `kind`, oldest first.
    pub async fn pending(&self, kind: TaskKind) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE kind = ? AND status = 'PENDING' ORDER BY created_at ASC, rowid ASC",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    pub async fn count_active(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE status IN ('PENDING', 'IN_PROGRESS')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    /// Marks tasks left `IN_PROGRESS` by a previous process as failed.
    ///
    /// Only a resident worker process may call this: it cannot tell a dead
    /// process's claim from a live one's.
    pub async fn fail_interrupted(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let n = sqlx::query(
            "UPDATE tasks SET status = 'FAILED', error = 'interrupted', finished_at = ? WHERE status = 'IN_PROGRESS'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(n)
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let kind: String = row.get("kind");
    let status: String = row.get("status");
    let payload_json: Option<String> = row.get("payload_json");
    Ok(Task {
        id: row.get("id"),
        kind: kind.parse()?,
        target_id: row.get("target_id"),
        status: status.parse()?,
        payload: payload_json.and_then(|p| serde_json::from_str(&p).ok()),
        result: row.get("result"),
        error: row.get("error"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
    })
}

/// A task state transition, as streamed to clients.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub kind: TaskKind,
    pub target_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: i64,
}

impl TaskEvent {
    fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            kind: task.kind,
            target_id: task.target_id.clone(),
            status: task.status,
            error: task.error.clone(),
            at: chrono::Utc::now().timestamp(),
        }
    }
}

/// The work behind one queue.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Runs one task. `Ok` carries the optional result text stored on the
    /// task row; `Err` marks the task failed with the error message.
    async fn run(&self, task: &Task) -> Result<Option<String>>;
}

/// Handle to one kind's queue. Cheap to clone.
///
/// A detached queue (no worker in this process) only persists tasks as
/// `PENDING`; they are picked up the next time a worker starts.
#[derive(Clone)]
pub struct TaskQueue {
    kind: TaskKind,
    store: TaskStore,
    sender: Option<mpsc::UnboundedSender<String>>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskQueue {
    /// Spawns the worker for `handler.kind()` and returns its queue handle.
    ///
    /// The worker exits once every clone of the returned queue is dropped.
    pub fn start(
        store: TaskStore,
        handler: Arc<dyn TaskHandler>,
        events: broadcast::Sender<TaskEvent>,
    ) -> (Self, JoinHandle<()>) {
        let kind = handler.kind();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(store.clone(), handler, rx, events.clone()));
        let queue = Self {
            kind,
            store,
            sender: Some(tx),
            events,
        };
        (queue, worker)
    }

    pub fn detached(kind: TaskKind, store: TaskStore, events: broadcast::Sender<TaskEvent>) -> Self {
        Self {
            kind,
            store,
            sender: None,
            events,
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Persists a new task and hands it to the worker.
    ///
    /// Non-chat tasks are deduplicated per target: if one is already
    /// pending or running, that task is returned instead.
    pub async fn submit(
        &self,
        target_id: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<Task> {
        if self.kind == TaskKind::Chat {
            return self.submit_deduped(target_id, payload, None).await;
        }
        self.submit_deduped(target_id, payload, Some(ACTIVE)).await
    }

    /// Like [`submit`](Self::submit), but only a `PENDING` task absorbs the
    /// request. Used after the target's input changed: a running task is
    /// working on the old input, so a new one is queued behind it.
    pub async fn submit_after_change(
        &self,
        target_id: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<Task> {
        self.submit_deduped(target_id, payload, Some(PENDING)).await
    }

    async fn submit_deduped(
        &self,
        target_id: &str,
        payload: Option<serde_json::Value>,
        blocking: Option<&[TaskStatus]>,
    ) -> Result<Task> {
        loop {
            if let Some(task) = self
                .store
                .insert(self.kind, target_id, payload.clone(), blocking)
                .await?
            {
                info!(task_id = %task.id, kind = %self.kind, target_id, "task queued");
                let _ = self.events.send(TaskEvent::from_task(&task));
                self.enqueue(&task.id);
                return Ok(task);
            }

            let statuses = blocking.unwrap_or(PENDING);
            if let Some(existing) = self.store.find_in(self.kind, target_id, statuses).await? {
                debug!(task_id = %existing.id, kind = %self.kind, "task already active");
                // It may have been queued by a process without a worker.
                if existing.status == TaskStatus::Pending {
                    self.enqueue(&existing.id);
                }
                return Ok(existing);
            }
            // The blocking task finished between the insert and the read.
        }
    }

    /// Re-enqueues tasks persisted as `PENDING`, oldest first.
    pub async fn resume(&self) -> Result<usize> {
        if self.sender.is_none() {
            return Ok(0);
        }
        let pending = self.store.pending(self.kind).await?;
        for task in &pending {
            self.enqueue(&task.id);
        }
        if !pending.is_empty() {
            info!(kind = %self.kind, count = pending.len(), "resumed pending tasks");
        }
        Ok(pending.len())
    }

    fn enqueue(&self, task_id: &str) {
        if let Some(tx) = &self.sender {
            if tx.send(task_id.to_string()).is_err() {
                warn!(task_id, kind = %self.kind, "worker stopped; task left pending");
            }
        }
    }
}

async fn run_worker(
    store: TaskStore,
    handler: Arc<dyn TaskHandler>,
    mut rx: mpsc::UnboundedReceiver<String>,
    events: broadcast::Sender<TaskEvent>,
) {
    let kind = handler.kind();
    debug!(%kind, "worker started");

    while let Some(task_id) = rx.recv().await {
        let task = match store.mark_in_progress(&task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => continue,
            Err(e) => {
                error!(%task_id, %kind, error = %e, "could not claim task");
                continue;
            }
        };
        let _ = events.send(TaskEvent::from_task(&task));

        // A panicking handler fails its task instead of killing the worker.
        let outcome = {
            let handler = handler.clone();
            let task = task.clone();
            tokio::spawn(async move { handler.run(&task).await }).await
        };

        let finished = match outcome {
            Ok(Ok(result)) => {
                info!(%task_id, %kind, "task completed");
                store.mark_completed(&task_id, result.as_deref()).await
            }
            Ok(Err(e)) => {
                error!(%task_id, %kind, error = %format!("{:#}", e), "task failed");
                store.mark_failed(&task_id, &format!("{:#}", e)).await
            }
            Err(join_err) => {
                error!(%task_id, %kind, error = %join_err, "task panicked");
                store.mark_failed(&task_id, "worker panicked").await
            }
        };

        match finished {
            Ok(Some(task)) => {
                let _ = events.send(TaskEvent::from_task(&task));
            }
            Ok(None) => warn!(%task_id, %kind, "task no longer in progress; result dropped"),
            Err(e) => error!(%task_id, %kind, error = %e, "could not persist task result"),
        }
    }

    debug!(%kind, "worker stopped");
}

/// Waits until `task_id` reaches a terminal state and returns it.
pub async fn wait_for(
    store: &TaskStore,
    events: &broadcast::Sender<TaskEvent>,
    task_id: &str,
) -> Result<Task> {
    // Subscribe before reading so a transition cannot slip in between.
    let mut rx = events.subscribe();
    loop {
        let task = match store.get(task_id).await? {
            Some(t) => t,
            None => bail!("task not found: {}", task_id),
        };
        if task.status.is_terminal() {
            return Ok(task);
        }

        loop {
            match tokio::time::timeout(WAIT_POLL, rx.recv()).await {
                Ok(Ok(ev)) if ev.task_id == task_id && ev.status.is_terminal() => break,
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) | Err(_) => break,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    bail!("task queue shut down while waiting for {}", task_id)
                }
            }
        }
    }
}
