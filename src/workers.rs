//! The four task queues of the application.
//!
//! [`Queues::detached`] only records tasks (CLI commands that exit right
//! away). [`Queues::start`] spawns workers as the [`WorkerMode`] says: a
//! resident process runs every kind and recovers what a previous process
//! left behind, a one-shot command runs only the kind it waits on.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::chat::ChatHandler;
use crate::config::Config;
use crate::llm::{self, LlmClient};
use crate::models::{Task, TaskKind};
use crate::ocr::{self, OcrEngine, OcrHandler};
use crate::summarize::SummarizeHandler;
use crate::tasks::{self, TaskEvent, TaskHandler, TaskQueue, TaskStore, EVENT_CAPACITY};
use crate::transcription::{self, Transcriber, TranscriptionHandler};

/// External engines the handlers call out to.
#[derive(Clone)]
pub struct Services {
    pub ocr: Arc<dyn OcrEngine>,
    pub transcriber: Arc<dyn Transcriber>,
    pub llm: Arc<dyn LlmClient>,
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            ocr: ocr::engine_from_config(&config.ocr)?,
            transcriber: transcription::transcriber_from_config(config)?,
            llm: llm::client_from_config(&config.llm)?,
        })
    }
}

/// Which workers a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// `serve` and `tasks run`: every kind runs, tasks left `IN_PROGRESS`
    /// are failed as interrupted and `PENDING` ones are resumed.
    Resident,
    /// A command that waits on one task of this kind and exits. Other
    /// kinds stay detached and nothing is swept or resumed, so work it did
    /// not ask for is never left half done.
    OneShot(TaskKind),
}

impl WorkerMode {
    fn runs(&self, kind: TaskKind) -> bool {
        match self {
            WorkerMode::Resident => true,
            WorkerMode::OneShot(only) => *only == kind,
        }
    }
}

#[derive(Clone)]
pub struct Queues {
    store: TaskStore,
    events: broadcast::Sender<TaskEvent>,
    ocr: TaskQueue,
    transcription: TaskQueue,
    summarization: TaskQueue,
    chat: TaskQueue,
}

impl Queues {
    pub fn detached(pool: SqlitePool) -> Self {
        let store = TaskStore::new(pool);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let queue = |kind| TaskQueue::detached(kind, store.clone(), events.clone());
        Self {
            ocr: queue(TaskKind::Ocr),
            transcription: queue(TaskKind::Transcription),
            summarization: queue(TaskKind::Summarization),
            chat: queue(TaskKind::Chat),
            store,
            events,
        }
    }

    /// Spawns the workers `mode` asks for; the other kinds are detached.
    pub async fn start(
        config: Arc<Config>,
        pool: SqlitePool,
        services: Services,
        mode: WorkerMode,
    ) -> Result<Self> {
        let store = TaskStore::new(pool.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        if mode == WorkerMode::Resident {
            let interrupted = store.fail_interrupted().await?;
            if interrupted > 0 {
                warn!(count = interrupted, "marked interrupted tasks as failed");
            }
        }

        let spawn = |handler: Arc<dyn TaskHandler>| {
            let kind = handler.kind();
            if mode.runs(kind) {
                TaskQueue::start(store.clone(), handler, events.clone()).0
            } else {
                TaskQueue::detached(kind, store.clone(), events.clone())
            }
        };

        let summarization = spawn(Arc::new(SummarizeHandler::new(
            pool.clone(),
            config.clone(),
            services.llm.clone(),
        )));
        let ocr = spawn(Arc::new(OcrHandler::new(
            pool.clone(),
            config.clone(),
            services.ocr,
            summarization.clone(),
        )));
        let transcription = spawn(Arc::new(TranscriptionHandler::new(
            pool.clone(),
            config.clone(),
            services.transcriber,
            summarization.clone(),
        )));
        let chat = spawn(Arc::new(ChatHandler::new(pool, config, services.llm)));

        let queues = Self {
            store,
            events,
            ocr,
            transcription,
            summarization,
            chat,
        };
        if mode == WorkerMode::Resident {
            let mut resumed = 0;
            for kind in TaskKind::ALL {
                resumed += queues.queue(kind).resume().await?;
            }
            info!(resumed, "task workers started");
        } else {
            debug!(?mode, "task worker started");
        }
        Ok(queues)
    }

    pub fn queue(&self, kind: TaskKind) -> &TaskQueue {
        match kind {
            TaskKind::Ocr => &self.ocr,
            TaskKind::Transcription => &self.transcription,
            TaskKind::Summarization => &self.summarization,
            TaskKind::Chat => &self.chat,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub async fn submit(
        &self,
        kind: TaskKind,
        target_id: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<Task> {
        self.queue(kind).submit(target_id, payload).await
    }

    /// Resolves once `task_id` is `COMPLETED` or `FAILED`.
    pub async fn wait(&self, task_id: &str) -> Result<Task> {
        tasks::wait_for(&self.store, &self.events, task_id).await
    }

    /// Resolves once no task is pending or running, including tasks that
    /// finished work chains on the way.
    pub async fn drain(&self) -> Result<()> {
        let mut rx = self.events.subscribe();
        loop {
            if self.store.count_active().await? == 0 {
                return Ok(());
            }
            match rx.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::llm::tests::FakeLlm;
    use crate::models::{IndexDepth, TaskStatus};
    use crate::storage::store_upload;
    use async_trait::async_trait;
    use std::path::Path;

    struct FixedOcr;

    #[async_trait]
    impl OcrEngine for FixedOcr {
        async fn recognize(&self, _path: &Path) -> Result<String> {
            Ok("invoice number 7".to_string())
        }
    }

    fn services() -> Services {
        Services {
            ocr: Arc::new(FixedOcr),
            transcriber: Arc::new(transcription::DisabledTranscriber),
            llm: FakeLlm::new("An invoice."),
        }
    }

    #[tokio::test]
    async fn deep_image_runs_ocr_then_summary() {
        let (_tmp, app) = App::test_with(services()).await;
        let up = store_upload(&app, "inv.png", "", b"\x89PNG", IndexDepth::Deep)
            .await
            .unwrap();
        let ocr_task = app.queues.wait(&up.tasks[0].id).await.unwrap();
        assert_eq!(ocr_task.status, TaskStatus::Completed);

        app.queues.drain().await.unwrap();
        let file = crate::files::get_file(&app.pool, &up.file.id).await.unwrap();
        assert_eq!(file.content.as_deref(), Some("invoice number 7"));
        assert_eq!(file.summary.as_deref(), Some("An invoice."));
    }

    #[tokio::test]
    async fn disabled_service_fails_task() {
        let (_tmp, app) = App::test_with(services()).await;
        let up = store_upload(&app, "memo.mp3", "", b"ID3", IndexDepth::Deep)
            .await
            .unwrap();
        let task = app.queues.wait(&up.tasks[0].id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn one_shot_leaves_other_work_alone() {
        let (tmp, pool) = crate::db::test_pool().await;
        let store = TaskStore::new(pool.clone());
        let running = store.create(TaskKind::Summarization, "busy", None).await.unwrap();
        store.mark_in_progress(&running.id).await.unwrap();
        let waiting = store.create(TaskKind::Ocr, "scan", None).await.unwrap();

        let config = Arc::new(Config::minimal(tmp.path()));
        let queues = Queues::start(config, pool, services(), WorkerMode::OneShot(TaskKind::Chat))
            .await
            .unwrap();

        // Nothing swept, nothing resumed, no worker for other kinds.
        let running = store.get(&running.id).await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::InProgress);
        let again = queues.submit(TaskKind::Ocr, "scan", None).await.unwrap();
        assert_eq!(again.id, waiting.id);
        tokio::task::yield_now().await;
        let waiting = store.get(&waiting.id).await.unwrap().unwrap();
        assert_eq!(waiting.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn resident_sweeps_and_resumes() {
        let (tmp, pool) = crate::db::test_pool().await;
        let store = TaskStore::new(pool.clone());
        let stale = store.create(TaskKind::Summarization, "old", None).await.unwrap();
        store.mark_in_progress(&stale.id).await.unwrap();

        let config = Arc::new(Config::minimal(tmp.path()));
        let queues = Queues::start(config, pool, services(), WorkerMode::Resident)
            .await
            .unwrap();

        let stale = store.get(&stale.id).await.unwrap().unwrap();
        assert_eq!(stale.status, TaskStatus::Failed);
        assert_eq!(stale.error.as_deref(), Some("interrupted"));
        queues.drain().await.unwrap();
    }
}
