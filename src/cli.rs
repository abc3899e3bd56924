//! Command implementations behind the `pkb` binary.
//!
//! Commands that only record work open the database with detached queues:
//! the tasks they create stay `PENDING` until `pkb serve` or
//! `pkb tasks run` starts the workers. Commands invoked with `--wait` (and
//! `pkb chat send`, always) start only the worker for their task's kind and
//! block until that task finishes; other pending work is left alone.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::app::App;
use crate::calendar::{self, NewActivity};
use crate::chat;
use crate::config::Config;
use crate::files;
use crate::index;
use crate::migrate;
use crate::models::{ChatReference, IndexDepth, Task, TaskKind, TaskStatus};
use crate::progress::ProgressMode;
use crate::projects;
use crate::server;
use crate::storage;
use crate::tags;
use crate::tasks::TaskFilter;
use crate::workers::WorkerMode;

fn print_task(task: &Task) {
    let mut line = format!(
        "{}  {:<13}  {:<11}  target {}",
        task.id, task.kind, task.status, task.target_id
    );
    if let Some(err) = &task.error {
        line.push_str(&format!("  error: {}", err));
    }
    println!("{}", line);
}

fn print_queued(tasks: &[Task]) {
    for task in tasks {
        println!("  queued {} task {}", task.kind, task.id);
    }
}

// ============ Setup ============

pub async fn run_init(config: &Config) -> Result<()> {
    std::fs::create_dir_all(&config.storage.root).with_context(|| {
        format!(
            "Failed to create storage root: {}",
            config.storage.root.display()
        )
    })?;
    migrate::run_migrations(config).await?;
    println!("Database initialized successfully.");
    Ok(())
}

pub async fn run_serve(config: Config) -> Result<()> {
    let app = App::start(config, WorkerMode::Resident).await?;
    println!("Listening on http://{}", app.config.server.bind);
    server::run_server(app).await
}

// ============ Files ============

pub async fn run_add(
    config: Config,
    paths: &[PathBuf],
    folder: &str,
    depth: Option<IndexDepth>,
) -> Result<()> {
    let app = App::open(config).await?;
    let depth = depth.unwrap_or(app.config.index.default_depth);
    let mut queued = 0;

    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("Not a file path: {}", path.display()))?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let outcome = storage::store_upload(&app, &name, folder, &bytes, depth).await?;
        if outcome.duplicate {
            println!("duplicate  {}  {}", outcome.file.id, name);
        } else {
            println!("stored     {}  {}", outcome.file.id, name);
        }
        print_queued(&outcome.tasks);
        queued += outcome.tasks.len();
    }

    if queued > 0 {
        println!("{} task(s) pending; run `pkb tasks run` or `pkb serve` to process them.", queued);
    }
    Ok(())
}

pub async fn run_import(
    config: Config,
    dir: &Path,
    into: &str,
    depth: Option<IndexDepth>,
    progress: ProgressMode,
) -> Result<()> {
    let app = App::open(config).await?;
    let depth = depth.unwrap_or(app.config.index.default_depth);
    let reporter = progress.reporter();
    let stats = storage::import_directory(&app, dir, into, depth, reporter.as_ref()).await?;

    println!("Import complete:");
    println!("  scanned: {}", stats.scanned);
    println!("  stored: {}", stats.stored);
    println!("  duplicates: {}", stats.duplicates);
    println!("  failed: {}", stats.failed);
    println!("  tasks queued: {}", stats.tasks_queued);
    Ok(())
}

pub async fn run_get(config: Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let file = files::get_file(&app.pool, id).await?;
    let tags = tags::tags_for_file(&app.pool, id).await?;
    let projects = projects::projects_for_file(&app.pool, id).await?;

    println!("id: {}", file.id);
    println!("name: {}", file.name);
    println!("folder: {}", if file.folder.is_empty() { "/" } else { file.folder.as_str() });
    println!("type: {}", file.mime_type);
    println!("size: {} bytes", file.size_bytes);
    println!("added: {}", calendar::format_time(file.created_at));
    println!("index depth: {}", file.index_depth.as_deref().unwrap_or("none"));
    if !tags.is_empty() {
        println!("tags: {}", tags.join(", "));
    }
    if !projects.is_empty() {
        println!("projects: {}", projects.join(", "));
    }
    if let Some(summary) = &file.summary {
        println!("\n--- summary ---\n{}", summary);
    }
    if let Some(content) = &file.content {
        println!("\n--- content ---\n{}", content);
    }
    Ok(())
}

pub async fn run_rm(config: Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let file = storage::delete_file(&app, id).await?;
    println!("deleted {} ({})", file.name, file.id);
    Ok(())
}

pub async fn run_reindex(config: Config, depth: Option<IndexDepth>) -> Result<()> {
    let app = App::open(config).await?;
    let depth = depth.unwrap_or(app.config.index.default_depth);
    let (indexed, queued) = index::reindex_all(&app, depth).await?;
    println!("Reindexed {} file(s) at {} depth; {} task(s) queued.", indexed, depth, queued);
    Ok(())
}

// ============ Tags & projects ============

pub async fn run_tag_list(config: Config) -> Result<()> {
    let app = App::open(config).await?;
    let tags = tags::list_tags(&app.pool).await?;
    if tags.is_empty() {
        println!("No tags.");
    }
    for tag in tags {
        println!("{:<24} {} file(s)", tag.name, tag.file_count);
    }
    Ok(())
}

pub async fn run_tag_add(config: Config, name: &str) -> Result<()> {
    let app = App::open(config).await?;
    let tag = tags::create_tag(&app.pool, name).await?;
    println!("tag {}", tag.name);
    Ok(())
}

pub async fn run_tag_rm(config: Config, name: &str) -> Result<()> {
    let app = App::open(config).await?;
    tags::delete_tag(&app.pool, name).await?;
    println!("deleted tag {}", tags::normalize_tag(name));
    Ok(())
}

pub async fn run_tag_assign(config: Config, file_id: &str, names: &[String], assign: bool) -> Result<()> {
    let app = App::open(config).await?;
    for name in names {
        if assign {
            tags::assign_tag(&app.pool, file_id, name).await?;
        } else {
            tags::unassign_tag(&app.pool, file_id, name).await?;
        }
    }
    let now = tags::tags_for_file(&app.pool, file_id).await?;
    println!("{}: {}", file_id, if now.is_empty() { "(no tags)".to_string() } else { now.join(", ") });
    Ok(())
}

pub async fn run_project_list(config: Config, all: bool) -> Result<()> {
    let app = App::open(config).await?;
    let list = projects::list_projects(&app.pool, all).await?;
    if list.is_empty() {
        println!("No projects.");
    }
    for p in list {
        let archived = if p.archived { "  [archived]" } else { "" };
        println!("{:<24} {} file(s){}", p.name, p.file_count, archived);
        if let Some(d) = &p.description {
            println!("    {}", d);
        }
    }
    Ok(())
}

pub async fn run_project_add(config: Config, name: &str, description: Option<&str>) -> Result<()> {
    let app = App::open(config).await?;
    let p = projects::create_project(&app.pool, name, description).await?;
    println!("project {}", p.name);
    Ok(())
}

pub async fn run_project_archive(config: Config, name: &str, archived: bool) -> Result<()> {
    let app = App::open(config).await?;
    let p = projects::set_archived(&app.pool, name, archived).await?;
    println!("{} {}", if p.archived { "archived" } else { "unarchived" }, p.name);
    Ok(())
}

pub async fn run_project_rm(config: Config, name: &str) -> Result<()> {
    let app = App::open(config).await?;
    projects::delete_project(&app.pool, name).await?;
    println!("deleted project {}", name.trim());
    Ok(())
}

pub async fn run_project_assign(config: Config, name: &str, file_id: &str, assign: bool) -> Result<()> {
    let app = App::open(config).await?;
    if assign {
        projects::add_file(&app.pool, name, file_id).await?;
    } else {
        projects::remove_file(&app.pool, name, file_id).await?;
    }
    let now = projects::projects_for_file(&app.pool, file_id).await?;
    println!("{}: {}", file_id, if now.is_empty() { "(no projects)".to_string() } else { now.join(", ") });
    Ok(())
}

// ============ Calendar ============

fn print_activity(a: &crate::models::Activity) {
    let end = a
        .end_at
        .map(calendar::format_time)
        .unwrap_or_else(|| "running".to_string());
    let project = a.project.as_deref().map(|p| format!("  [{}]", p)).unwrap_or_default();
    println!(
        "{:>5}  {} → {}  {}{}",
        a.id,
        calendar::format_time(a.start_at),
        end,
        a.title,
        project
    );
}

fn opt_time(s: Option<&str>) -> Result<Option<i64>> {
    s.map(calendar::parse_time).transpose()
}

pub async fn run_activity_list(config: Config, from: Option<&str>, to: Option<&str>) -> Result<()> {
    let app = App::open(config).await?;
    let list = calendar::list_activities(&app.pool, opt_time(from)?, opt_time(to)?).await?;
    if list.is_empty() {
        println!("No activities.");
    }
    for a in &list {
        print_activity(a);
    }
    Ok(())
}

pub async fn run_activity_add(
    config: Config,
    title: &str,
    start: &str,
    end: &str,
    project: Option<&str>,
    description: Option<&str>,
) -> Result<()> {
    let app = App::open(config).await?;
    let a = calendar::create_activity(
        &app.pool,
        NewActivity {
            title: title.to_string(),
            description: description.map(String::from),
            project: project.map(String::from),
            start_at: calendar::parse_time(start)?,
            end_at: Some(calendar::parse_time(end)?),
        },
    )
    .await?;
    print_activity(&a);
    Ok(())
}

pub async fn run_activity_start(config: Config, title: &str, project: Option<&str>) -> Result<()> {
    let app = App::open(config).await?;
    let a = calendar::start_timer(&app.pool, title, project, None).await?;
    print_activity(&a);
    Ok(())
}

pub async fn run_activity_stop(config: Config) -> Result<()> {
    let app = App::open(config).await?;
    let a = calendar::stop_timer(&app.pool).await?;
    print_activity(&a);
    Ok(())
}

pub async fn run_activity_rm(config: Config, id: i64) -> Result<()> {
    let app = App::open(config).await?;
    calendar::delete_activity(&app.pool, id).await?;
    println!("deleted activity {}", id);
    Ok(())
}

fn format_duration(secs: i64) -> String {
    format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
}

pub async fn run_activity_report(config: Config, from: Option<&str>, to: Option<&str>) -> Result<()> {
    let app = App::open(config).await?;
    let now = chrono::Utc::now().timestamp();
    let to = opt_time(to)?.unwrap_or(now);
    let from = opt_time(from)?.unwrap_or(to - 7 * 24 * 3600);
    let report = calendar::time_report(&app.pool, from, to, now).await?;

    println!(
        "{} → {}",
        calendar::format_time(report.from),
        calendar::format_time(report.to)
    );
    for p in &report.projects {
        println!(
            "  {:<24} {:>9}  ({} activities)",
            p.project.as_deref().unwrap_or("(no project)"),
            format_duration(p.seconds),
            p.activities
        );
    }
    println!("  {:<24} {:>9}", "total", format_duration(report.total_seconds));
    Ok(())
}

// ============ Tasks ============

pub async fn run_tasks_list(
    config: Config,
    kind: Option<TaskKind>,
    status: Option<TaskStatus>,
    limit: Option<i64>,
) -> Result<()> {
    let app = App::open(config).await?;
    let tasks = app
        .queues
        .store()
        .list(&TaskFilter {
            kind,
            status,
            target_id: None,
            limit,
        })
        .await?;
    if tasks.is_empty() {
        println!("No tasks.");
    }
    for task in &tasks {
        print_task(task);
    }
    Ok(())
}

pub async fn run_tasks_show(config: Config, id: &str) -> Result<()> {
    let app = App::open(config).await?;
    let task = app
        .queues
        .store()
        .get(id)
        .await?
        .with_context(|| format!("task not found: {}", id))?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

/// Starts the workers and returns once nothing is pending or running.
pub async fn run_tasks_run(config: Config) -> Result<()> {
    let app = App::start(config, WorkerMode::Resident).await?;
    app.queues.drain().await?;
    let failed = app
        .queues
        .store()
        .list(&TaskFilter {
            status: Some(TaskStatus::Failed),
            limit: Some(20),
            ..Default::default()
        })
        .await?;
    println!("All tasks processed.");
    if !failed.is_empty() {
        println!("Recently failed:");
        for task in &failed {
            print_task(task);
        }
    }
    Ok(())
}

/// Queues one task for a file, optionally waiting for it.
pub async fn run_file_task(config: Config, kind: TaskKind, file_id: &str, wait: bool) -> Result<()> {
    let app = if wait {
        App::start(config, WorkerMode::OneShot(kind)).await?
    } else {
        App::open(config).await?
    };
    files::get_file(&app.pool, file_id).await?;
    let task = app.queues.submit(kind, file_id, None).await?;
    if !wait {
        print_task(&task);
        return Ok(());
    }

    let task = app.queues.wait(&task.id).await?;
    print_task(&task);
    match task.status {
        TaskStatus::Completed => {
            if let Some(result) = &task.result {
                println!("{}", result);
            }
            Ok(())
        }
        _ => bail!("{} task failed: {}", kind, task.error.unwrap_or_default()),
    }
}

// ============ Chat ============

pub async fn run_chat_sessions(config: Config) -> Result<()> {
    let app = App::open(config).await?;
    let sessions = chat::list_sessions(&app.pool).await?;
    if sessions.is_empty() {
        println!("No chat sessions.");
    }
    for s in sessions {
        println!("{}  {}  {}", s.id, calendar::format_time(s.updated_at), s.title);
    }
    Ok(())
}

pub async fn run_chat_new(config: Config, title: Option<&str>) -> Result<()> {
    let app = App::open(config).await?;
    let session = chat::create_session(&app.pool, title).await?;
    println!("{}", session.id);
    Ok(())
}

pub async fn run_chat_send(
    config: Config,
    session_id: &str,
    message: &str,
    files: Vec<String>,
    activities: Vec<i64>,
) -> Result<()> {
    let app = App::start(config, WorkerMode::OneShot(TaskKind::Chat)).await?;
    let refs: Vec<ChatReference> = files
        .into_iter()
        .map(ChatReference::File)
        .chain(activities.into_iter().map(ChatReference::Activity))
        .collect();
    let sent = chat::send_message(&app, session_id, message, &refs).await?;
    let task = app.queues.wait(&sent.task.id).await?;
    if task.status != TaskStatus::Completed {
        bail!("chat task failed: {}", task.error.unwrap_or_default());
    }

    let history = chat::history(&app.pool, session_id).await?;
    let reply = task
        .result
        .as_deref()
        .and_then(|id| id.parse::<i64>().ok())
        .and_then(|id| history.iter().find(|m| m.id == id));
    match reply {
        Some(m) => println!("{}", m.content),
        None => bail!("assistant reply missing for task {}", task.id),
    }
    Ok(())
}
