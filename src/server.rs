//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Health check (returns version) |
//! | `POST` | `/files` | Multipart upload: `file`, optional `folder` and `depth` |
//! | `GET` | `/files` | Search: `q`, `from`, `to`, `tags`, `projects`, `folder`, `subfolders`, `mime`, `limit`, `offset` |
//! | `GET` / `DELETE` | `/files/{id}` | File with text, tags and projects / delete |
//! | `GET` | `/files/{id}/content` | Stored bytes with their mime type |
//! | `POST` | `/files/{id}/index` | Re-index at `?depth=` |
//! | `POST` | `/files/{id}/summarize`, `/ocr`, `/transcribe` | Queue a task (202) |
//! | `PUT` / `DELETE` | `/files/{id}/tags/{tag}` | Assign / unassign a tag |
//! | `PUT` / `DELETE` | `/files/{id}/projects/{project}` | Link / unlink a project |
//! | `GET` / `POST` | `/tags` | List / create; `PATCH` / `DELETE` `/tags/{name}` |
//! | `GET` / `POST` | `/projects` | List (`?archived=true`) / create; `PATCH` / `DELETE` `/projects/{name}` |
//! | `GET` / `POST` | `/activities` | List (`?from&to`) / create; `GET` / `PATCH` / `DELETE` `/activities/{id}` |
//! | `POST` | `/activities/timer/start`, `/activities/timer/stop` | Timer |
//! | `GET` | `/activities/report` | Time per project (`?from&to`) |
//! | `GET` | `/tasks`, `/tasks/{id}` | Task polling |
//! | `GET` | `/tasks/events` | Server-sent task events |
//! | `GET` / `POST` | `/chat/sessions` | List / create; `PATCH` / `DELETE` `/chat/sessions/{id}` |
//! | `GET` / `POST` | `/chat/sessions/{id}/messages` | History / send (202) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "file 3f2a... not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `payload_too_large` (413), `internal` (500).

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::app::App;
use crate::calendar::{self, ActivityUpdate, NewActivity};
use crate::chat;
use crate::error::KbError;
use crate::files;
use crate::index;
use crate::models::{
    Activity, ChatMessage, ChatReference, ChatSession, FileRecord, IndexDepth, Project, Tag, Task,
    TaskKind, TaskStatus,
};
use crate::projects;
use crate::search::{self, FileQuery};
use crate::storage;
use crate::tags;
use crate::tasks::TaskFilter;

/// Starts the HTTP server with running task workers.
///
/// Binds to `[server].bind` and runs until the process is terminated.
pub async fn run_server(app: App) -> anyhow::Result<()> {
    let bind_addr = app.config.server.bind.clone();
    let router = router(app);

    info!(addr = %bind_addr, "server listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn router(app: App) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    // Multipart framing adds a little on top of the file itself.
    let body_limit = app.config.storage.max_file_bytes as usize + 64 * 1024;

    Router::new()
        .route("/health", get(handle_health))
        .route("/files", post(handle_upload).get(handle_search))
        .route("/files/{id}", get(handle_get_file).delete(handle_delete_file))
        .route("/files/{id}/content", get(handle_file_content))
        .route("/files/{id}/index", post(handle_reindex))
        .route("/files/{id}/summarize", post(handle_summarize))
        .route("/files/{id}/ocr", post(handle_ocr))
        .route("/files/{id}/transcribe", post(handle_transcribe))
        .route(
            "/files/{id}/tags/{tag}",
            put(handle_assign_tag).delete(handle_unassign_tag),
        )
        .route(
            "/files/{id}/projects/{project}",
            put(handle_link_project).delete(handle_unlink_project),
        )
        .route("/tags", get(handle_list_tags).post(handle_create_tag))
        .route(
            "/tags/{name}",
            axum::routing::patch(handle_rename_tag).delete(handle_delete_tag),
        )
        .route("/projects", get(handle_list_projects).post(handle_create_project))
        .route(
            "/projects/{name}",
            get(handle_get_project)
                .patch(handle_update_project)
                .delete(handle_delete_project),
        )
        .route(
            "/activities",
            get(handle_list_activities).post(handle_create_activity),
        )
        .route("/activities/report", get(handle_time_report))
        .route("/activities/timer/start", post(handle_start_timer))
        .route("/activities/timer/stop", post(handle_stop_timer))
        .route(
            "/activities/{id}",
            get(handle_get_activity)
                .patch(handle_update_activity)
                .delete(handle_delete_activity),
        )
        .route("/tasks", get(handle_list_tasks))
        .route("/tasks/events", get(handle_task_events))
        .route("/tasks/{id}", get(handle_get_task))
        .route(
            "/chat/sessions",
            get(handle_list_sessions).post(handle_create_session),
        )
        .route(
            "/chat/sessions/{id}",
            axum::routing::patch(handle_rename_session).delete(handle_delete_session),
        )
        .route(
            "/chat/sessions/{id}/messages",
            get(handle_history).post(handle_send_message),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(app)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: &'static str,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

/// Maps domain errors carried in `anyhow` to status codes; anything else
/// is a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let (status, code) = match err.downcast_ref::<KbError>() {
            Some(KbError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            Some(KbError::Invalid(_)) | Some(KbError::Disabled(_)) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            Some(KbError::Conflict(_)) => (StatusCode::CONFLICT, "conflict"),
            Some(KbError::TooLarge(_)) => (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large"),
            None => {
                error!(error = %format!("{:#}", err), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message: format!("{:#}", err),
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

fn parse_depth(depth: Option<&str>, default: IndexDepth) -> ApiResult<IndexDepth> {
    match depth.map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) => d.parse().map_err(|e: anyhow::Error| bad_request(e.to_string())),
        None => Ok(default),
    }
}

fn split_list(s: Option<&str>) -> Vec<String> {
    s.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

fn parse_opt_time(s: Option<&str>) -> ApiResult<Option<i64>> {
    match s.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Ok(Some(calendar::parse_time(s)?)),
        None => Ok(None),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ Files ============

async fn handle_upload(
    State(app): State<App>,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<storage::UploadOutcome>)> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut folder = String::new();
    let mut depth: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| bad_request("file field must carry a filename"))?;
                let bytes = field.bytes().await.map_err(|e| AppError {
                    status: StatusCode::PAYLOAD_TOO_LARGE,
                    code: "payload_too_large",
                    message: e.to_string(),
                })?;
                upload = Some((file_name, bytes.to_vec()));
            }
            "folder" => {
                folder = field.text().await.map_err(|e| bad_request(e.to_string()))?;
            }
            "depth" => {
                depth = Some(field.text().await.map_err(|e| bad_request(e.to_string()))?);
            }
            _ => {}
        }
    }

    let (file_name, bytes) = upload.ok_or_else(|| bad_request("missing 'file' field"))?;
    let depth = parse_depth(depth.as_deref(), app.config.index.default_depth)?;
    let outcome = storage::store_upload(&app, &file_name, &folder, &bytes, depth).await?;
    let status = if outcome.duplicate {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)))
}

#[derive(Deserialize, Default)]
struct SearchParams {
    q: Option<String>,
    from: Option<String>,
    to: Option<String>,
    tags: Option<String>,
    projects: Option<String>,
    folder: Option<String>,
    #[serde(default)]
    subfolders: bool,
    mime: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<search::FileHit>,
}

async fn handle_search(
    State(app): State<App>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let date = |s: &Option<String>| -> ApiResult<_> {
        match s.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => Ok(Some(search::parse_date(s)?)),
            None => Ok(None),
        }
    };
    let query = FileQuery {
        text: params.q.clone(),
        from: date(&params.from)?,
        to: date(&params.to)?,
        tags: split_list(params.tags.as_deref()),
        projects: split_list(params.projects.as_deref()),
        folder: params.folder.clone(),
        include_subfolders: params.subfolders,
        mime: params.mime.clone(),
        limit: params.limit,
        offset: params.offset,
    };
    let results = search::search_files(&app.pool, &query).await?;
    Ok(Json(SearchResponse { results }))
}

#[derive(Serialize)]
struct FileDetail {
    #[serde(flatten)]
    file: FileRecord,
    tags: Vec<String>,
    projects: Vec<String>,
}

async fn handle_get_file(
    State(app): State<App>,
    Path(id): Path<String>,
) -> ApiResult<Json<FileDetail>> {
    let file = files::get_file(&app.pool, &id).await?;
    Ok(Json(FileDetail {
        tags: tags::tags_for_file(&app.pool, &id).await?,
        projects: projects::projects_for_file(&app.pool, &id).await?,
        file,
    }))
}

async fn handle_delete_file(
    State(app): State<App>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    storage::delete_file(&app, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_file_content(
    State(app): State<App>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let file = files::get_file(&app.pool, &id).await?;
    let bytes = storage::read_bytes(&app.config, &file).await?;
    let disposition = format!("inline; filename=\"{}\"", file.name.replace('"', ""));
    Ok((
        [
            (header::CONTENT_TYPE, file.mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Deserialize, Default)]
struct DepthParams {
    depth: Option<String>,
}

async fn handle_reindex(
    State(app): State<App>,
    Path(id): Path<String>,
    Query(params): Query<DepthParams>,
) -> ApiResult<Json<index::IndexOutcome>> {
    let depth = parse_depth(params.depth.as_deref(), app.config.index.default_depth)?;
    Ok(Json(index::index_file(&app, &id, depth).await?))
}

async fn enqueue(app: &App, kind: TaskKind, id: &str) -> ApiResult<(StatusCode, Json<Task>)> {
    files::get_file(&app.pool, id).await?;
    let task = app.queues.submit(kind, id, None).await?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

async fn handle_summarize(
    State(app): State<App>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    enqueue(&app, TaskKind::Summarization, &id).await
}

async fn handle_ocr(
    State(app): State<App>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    enqueue(&app, TaskKind::Ocr, &id).await
}

async fn handle_transcribe(
    State(app): State<App>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    enqueue(&app, TaskKind::Transcription, &id).await
}

async fn handle_assign_tag(
    State(app): State<App>,
    Path((id, tag)): Path<(String, String)>,
) -> ApiResult<Json<Tag>> {
    Ok(Json(tags::assign_tag(&app.pool, &id, &tag).await?))
}

async fn handle_unassign_tag(
    State(app): State<App>,
    Path((id, tag)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    tags::unassign_tag(&app.pool, &id, &tag).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_link_project(
    State(app): State<App>,
    Path((id, project)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    projects::add_file(&app.pool, &project, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_unlink_project(
    State(app): State<App>,
    Path((id, project)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    projects::remove_file(&app.pool, &project, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Tags ============

#[derive(Deserialize)]
struct NameBody {
    name: String,
}

async fn handle_list_tags(State(app): State<App>) -> ApiResult<Json<Vec<Tag>>> {
    Ok(Json(tags::list_tags(&app.pool).await?))
}

async fn handle_create_tag(
    State(app): State<App>,
    Json(body): Json<NameBody>,
) -> ApiResult<(StatusCode, Json<Tag>)> {
    Ok((StatusCode::CREATED, Json(tags::create_tag(&app.pool, &body.name).await?)))
}

async fn handle_rename_tag(
    State(app): State<App>,
    Path(name): Path<String>,
    Json(body): Json<NameBody>,
) -> ApiResult<Json<Tag>> {
    Ok(Json(tags::rename_tag(&app.pool, &name, &body.name).await?))
}

async fn handle_delete_tag(
    State(app): State<App>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    tags::delete_tag(&app.pool, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Projects ============

#[derive(Deserialize, Default)]
struct ProjectListParams {
    #[serde(default)]
    archived: bool,
}

#[derive(Deserialize)]
struct CreateProjectBody {
    name: String,
    description: Option<String>,
}

#[derive(Deserialize)]
struct UpdateProjectBody {
    description: Option<String>,
    archived: Option<bool>,
}

async fn handle_list_projects(
    State(app): State<App>,
    Query(params): Query<ProjectListParams>,
) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(projects::list_projects(&app.pool, params.archived).await?))
}

async fn handle_create_project(
    State(app): State<App>,
    Json(body): Json<CreateProjectBody>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let project =
        projects::create_project(&app.pool, &body.name, body.description.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

#[derive(Serialize)]
struct ProjectDetail {
    #[serde(flatten)]
    project: Project,
    files: Vec<FileRecord>,
}

async fn handle_get_project(
    State(app): State<App>,
    Path(name): Path<String>,
) -> ApiResult<Json<ProjectDetail>> {
    let project = projects::get_project(&app.pool, &name).await?;
    let files = projects::files_in_project(&app.pool, &name).await?;
    Ok(Json(ProjectDetail { project, files }))
}

async fn handle_update_project(
    State(app): State<App>,
    Path(name): Path<String>,
    Json(body): Json<UpdateProjectBody>,
) -> ApiResult<Json<Project>> {
    let mut project = projects::get_project(&app.pool, &name).await?;
    if let Some(description) = &body.description {
        project = projects::update_description(&app.pool, &name, Some(description)).await?;
    }
    if let Some(archived) = body.archived {
        project = projects::set_archived(&app.pool, &name, archived).await?;
    }
    Ok(Json(project))
}

async fn handle_delete_project(
    State(app): State<App>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    projects::delete_project(&app.pool, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Activities ============

#[derive(Deserialize, Default)]
struct RangeParams {
    from: Option<String>,
    to: Option<String>,
}

#[derive(Deserialize)]
struct CreateActivityBody {
    title: String,
    description: Option<String>,
    project: Option<String>,
    start: String,
    end: Option<String>,
}

/// `project: null` clears the project; an absent key leaves it unchanged.
#[derive(Deserialize, Default)]
struct UpdateActivityBody {
    title: Option<String>,
    description: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    project: Option<Option<String>>,
    start: Option<String>,
    end: Option<String>,
}

fn double_option<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(de).map(Some)
}

#[derive(Deserialize)]
struct StartTimerBody {
    title: String,
    project: Option<String>,
    description: Option<String>,
}

async fn handle_list_activities(
    State(app): State<App>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<Vec<Activity>>> {
    let from = parse_opt_time(params.from.as_deref())?;
    let to = parse_opt_time(params.to.as_deref())?;
    Ok(Json(calendar::list_activities(&app.pool, from, to).await?))
}

async fn handle_create_activity(
    State(app): State<App>,
    Json(body): Json<CreateActivityBody>,
) -> ApiResult<(StatusCode, Json<Activity>)> {
    let activity = calendar::create_activity(
        &app.pool,
        NewActivity {
            title: body.title,
            description: body.description,
            project: body.project,
            start_at: calendar::parse_time(&body.start)?,
            end_at: parse_opt_time(body.end.as_deref())?,
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(activity)))
}

async fn handle_get_activity(
    State(app): State<App>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Activity>> {
    Ok(Json(calendar::get_activity(&app.pool, id).await?))
}

async fn handle_update_activity(
    State(app): State<App>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateActivityBody>,
) -> ApiResult<Json<Activity>> {
    let update = ActivityUpdate {
        title: body.title,
        description: body.description,
        project: body.project,
        start_at: parse_opt_time(body.start.as_deref())?,
        end_at: parse_opt_time(body.end.as_deref())?,
    };
    Ok(Json(calendar::update_activity(&app.pool, id, update).await?))
}

async fn handle_delete_activity(
    State(app): State<App>,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    calendar::delete_activity(&app.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_start_timer(
    State(app): State<App>,
    Json(body): Json<StartTimerBody>,
) -> ApiResult<(StatusCode, Json<Activity>)> {
    let activity = calendar::start_timer(
        &app.pool,
        &body.title,
        body.project.as_deref(),
        body.description.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(activity)))
}

async fn handle_stop_timer(State(app): State<App>) -> ApiResult<Json<Activity>> {
    Ok(Json(calendar::stop_timer(&app.pool).await?))
}

/// Defaults to the seven days up to now.
async fn handle_time_report(
    State(app): State<App>,
    Query(params): Query<RangeParams>,
) -> ApiResult<Json<calendar::TimeReport>> {
    let now = chrono::Utc::now().timestamp();
    let to = parse_opt_time(params.to.as_deref())?.unwrap_or(now);
    let from = parse_opt_time(params.from.as_deref())?.unwrap_or(to - 7 * 24 * 3600);
    Ok(Json(calendar::time_report(&app.pool, from, to, now).await?))
}

// ============ Tasks ============

#[derive(Deserialize, Default)]
struct TaskParams {
    kind: Option<String>,
    status: Option<String>,
    target: Option<String>,
    limit: Option<i64>,
}

async fn handle_list_tasks(
    State(app): State<App>,
    Query(params): Query<TaskParams>,
) -> ApiResult<Json<Vec<Task>>> {
    let kind = match params.kind.as_deref() {
        Some(k) => Some(k.parse::<TaskKind>().map_err(|e| bad_request(e.to_string()))?),
        None => None,
    };
    let status = match params.status.as_deref() {
        Some(s) => Some(s.parse::<TaskStatus>().map_err(|e| bad_request(e.to_string()))?),
        None => None,
    };
    let filter = TaskFilter {
        kind,
        status,
        target_id: params.target,
        limit: params.limit,
    };
    Ok(Json(app.queues.store().list(&filter).await?))
}

async fn handle_get_task(
    State(app): State<App>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    let task = app
        .queues
        .store()
        .get(&id)
        .await?
        .ok_or_else(|| KbError::not_found(format!("task {}", id)))?;
    Ok(Json(task))
}

/// Streams every task transition as an SSE `task` event. Events missed by a
/// slow client are dropped; clients can re-sync via `GET /tasks`.
async fn handle_task_events(
    State(app): State<App>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(app.queues.subscribe()).filter_map(|msg| {
        let ev = msg.ok()?;
        Event::default().event("task").json_data(&ev).ok().map(Ok)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============ Chat ============

#[derive(Deserialize, Default)]
struct SessionBody {
    title: Option<String>,
}

#[derive(Deserialize)]
struct SendBody {
    content: String,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    activities: Vec<i64>,
}

async fn handle_list_sessions(
    State(app): State<App>,
) -> ApiResult<Json<Vec<ChatSession>>> {
    Ok(Json(chat::list_sessions(&app.pool).await?))
}

async fn handle_create_session(
    State(app): State<App>,
    body: Option<Json<SessionBody>>,
) -> ApiResult<(StatusCode, Json<ChatSession>)> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let session = chat::create_session(&app.pool, body.title.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn handle_rename_session(
    State(app): State<App>,
    Path(id): Path<String>,
    Json(body): Json<SessionBody>,
) -> ApiResult<Json<ChatSession>> {
    let title = body.title.ok_or_else(|| bad_request("missing 'title'"))?;
    Ok(Json(chat::rename_session(&app.pool, &id, &title).await?))
}

async fn handle_delete_session(
    State(app): State<App>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    chat::delete_session(&app.pool, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_history(
    State(app): State<App>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ChatMessage>>> {
    Ok(Json(chat::history(&app.pool, &id).await?))
}

async fn handle_send_message(
    State(app): State<App>,
    Path(id): Path<String>,
    Json(body): Json<SendBody>,
) -> ApiResult<(StatusCode, Json<chat::SendOutcome>)> {
    let refs: Vec<ChatReference> = body
        .files
        .into_iter()
        .map(ChatReference::File)
        .chain(body.activities.into_iter().map(ChatReference::Activity))
        .collect();
    let outcome = chat::send_message(&app, &id, &body.content, &refs).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn call(app: &App, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = router(app.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn multipart_request(file_name: &str, contents: &str, folder: &str) -> Request<Body> {
        let boundary = "pkbtestboundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"folder\"\r\n\r\n{folder}\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n{contents}\r\n--{b}--\r\n",
            b = boundary,
            folder = folder,
            name = file_name,
            contents = contents
        );
        Request::builder()
            .method("POST")
            .uri("/files")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_version() {
        let (_tmp, app) = App::test().await;
        let (status, json) = call(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn upload_then_search_and_tag() {
        let (_tmp, app) = App::test().await;
        let (status, json) = call(
            &app,
            multipart_request("notes.md", "the ferry leaves at noon", "travel/2024"),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json["file"]["id"].as_str().unwrap().to_string();
        assert_eq!(json["file"]["folder"], "travel/2024");

        let (status, _) = call(
            &app,
            Request::put(format!("/files/{}/tags/Trips", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, json) = call(
            &app,
            Request::get("/files?q=ferry&tags=trips&folder=travel&subfolders=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let results = json["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["id"], id.as_str());
        assert_eq!(results[0]["tags"][0], "trips");
    }

    #[tokio::test]
    async fn errors_use_the_error_contract() {
        let (_tmp, app) = App::test().await;
        let (status, json) = call(
            &app,
            Request::get("/files/does-not-exist").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"]["code"], "not_found");

        let (status, json) = call(
            &app,
            Request::get("/files?from=yesterday").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], "bad_request");

        call(&app, json_request("POST", "/projects", serde_json::json!({ "name": "p" }))).await;
        let (status, json) =
            call(&app, json_request("POST", "/projects", serde_json::json!({ "name": "p" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"]["code"], "conflict");
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let (_tmp, mut app) = App::test().await;
        let mut config = (*app.config).clone();
        config.storage.max_file_bytes = 4;
        app.config = std::sync::Arc::new(config);

        let (status, json) = call(&app, multipart_request("a.txt", "way too long", "")).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json["error"]["code"], "payload_too_large");
    }

    #[tokio::test]
    async fn activities_and_report() {
        let (_tmp, app) = App::test().await;
        let (status, _) = call(
            &app,
            json_request(
                "POST",
                "/activities",
                serde_json::json!({
                    "title": "Deep work",
                    "start": "2024-05-01 09:00",
                    "end": "2024-05-01 11:00"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, json) = call(
            &app,
            Request::get("/activities/report?from=2024-05-01&to=2024-05-02")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total_seconds"], 7200);
    }

    #[tokio::test]
    async fn chat_send_queues_a_task() {
        let (_tmp, app) = App::test().await;
        let (status, session) =
            call(&app, json_request("POST", "/chat/sessions", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = session["id"].as_str().unwrap();

        let (status, json) = call(
            &app,
            json_request(
                "POST",
                &format!("/chat/sessions/{}/messages", id),
                serde_json::json!({ "content": "hello" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["task"]["status"], "PENDING");
        let task_id = json["task"]["id"].as_str().unwrap();

        let (status, json) = call(
            &app,
            Request::get(format!("/tasks/{}", task_id)).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["kind"], "chat");
    }

    #[tokio::test]
    async fn task_events_stream_as_sse_frames() {
        use crate::llm::tests::FakeLlm;
        use crate::models::IndexDepth;
        use crate::workers::Services;
        use std::time::Duration;

        let (_tmp, app) = App::test_with(Services {
            ocr: std::sync::Arc::new(crate::ocr::DisabledOcr),
            transcriber: std::sync::Arc::new(crate::transcription::DisabledTranscriber),
            llm: FakeLlm::new("Ferry timetable."),
        })
        .await;
        let up = storage::store_upload(
            &app,
            "ferry.md",
            "",
            b"the ferry leaves at noon",
            IndexDepth::Standard,
        )
        .await
        .unwrap();

        let resp = router(app.clone())
            .oneshot(Request::get("/tasks/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        let mut body = resp.into_body().into_data_stream();

        let (status, task) = call(
            &app,
            Request::post(format!("/files/{}/summarize", up.file.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let task_id = task["id"].as_str().unwrap().to_string();

        let mut buf = String::new();
        let mut seen: Vec<String> = Vec::new();
        while seen.last().map(String::as_str) != Some("COMPLETED") {
            let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
                .await
                .expect("no task event within 5s")
                .expect("event stream ended")
                .unwrap();
            buf.push_str(std::str::from_utf8(&chunk).unwrap());

            while let Some(end) = buf.find("\n\n") {
                let frame: String = buf.drain(..end + 2).collect();
                if !frame.lines().any(|l| l == "event: task") {
                    continue;
                }
                let data = frame
                    .lines()
                    .find_map(|l| l.strip_prefix("data: "))
                    .unwrap();
                let ev: serde_json::Value = serde_json::from_str(data).unwrap();
                if ev["task_id"] == task_id.as_str() {
                    seen.push(ev["status"].as_str().unwrap().to_string());
                }
            }
        }
        assert_eq!(seen, ["PENDING", "IN_PROGRESS", "COMPLETED"]);
    }
}
