//! # Personal knowledge base CLI (`pkb`)
//!
//! ```bash
//! pkb --config ./config/pkb.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pkb init` | Create the storage root and the SQLite schema |
//! | `pkb serve` | Start the HTTP API and the task workers |
//! | `pkb add <paths..>` | Store and index files |
//! | `pkb import <dir>` | Store every file below a directory |
//! | `pkb search [query]` | Full-text search with filters |
//! | `pkb tag ...`, `pkb project ...` | Organize files |
//! | `pkb activity ...` | Calendar and time tracking |
//! | `pkb tasks ...` | Inspect and process background tasks |
//! | `pkb chat ...` | Ask questions about files and activities |
//!
//! ```bash
//! pkb add scan.png notes.pdf --folder inbox --depth deep
//! pkb tasks run
//! pkb search invoice --tag finance --from 2024-01-01
//! pkb activity start "Review" --project website
//! pkb chat send <session> "What did I spend on hosting?" --file <id>
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use personal_kb::cli;
use personal_kb::config;
use personal_kb::logging;
use personal_kb::models::{IndexDepth, TaskKind, TaskStatus};
use personal_kb::progress::ProgressMode;
use personal_kb::search::{self, FileQuery};

/// Personal knowledge base: files, tags, projects, a time-tracking calendar
/// and LLM chat over all of it.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pkb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "pkb",
    about = "Personal knowledge base with search, time tracking and LLM chat",
    version,
    long_about = "pkb stores your files, extracts and indexes their text (with optional OCR, \
    audio transcription and LLM summaries), tracks time on a calendar, and answers questions \
    about your files and activities through an LLM chat. Everything is available through \
    this CLI and an HTTP API."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pkb.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the storage root and the database schema.
    ///
    /// Idempotent; running it again only applies missing migrations.
    Init,

    /// Start the HTTP API together with the task workers.
    Serve,

    /// Store files and index them.
    ///
    /// A file whose content already exists in the target folder is reported
    /// as a duplicate and not stored again.
    Add {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Folder inside the knowledge base, e.g. `work/invoices`.
        #[arg(long, default_value = "")]
        folder: String,

        /// Index depth: shallow, standard or deep.
        #[arg(long)]
        depth: Option<IndexDepth>,
    },

    /// Store every file below a directory, keeping its subfolder layout.
    Import {
        dir: PathBuf,

        /// Folder the directory's contents land in.
        #[arg(long, default_value = "")]
        into: String,

        #[arg(long)]
        depth: Option<IndexDepth>,

        /// Print one JSON object per stored file on stderr.
        #[arg(long)]
        progress_json: bool,

        /// Suppress progress output.
        #[arg(long, conflicts_with = "progress_json")]
        quiet: bool,
    },

    /// Search files by text, date, tags, projects, folder and type.
    ///
    /// Without a query the matching files are listed newest first.
    Search {
        query: Option<String>,

        /// Only files added on or after this date (YYYY-MM-DD).
        #[arg(long)]
        from: Option<String>,

        /// Only files added on or before this date (YYYY-MM-DD).
        #[arg(long)]
        to: Option<String>,

        /// Require this tag; repeat to require several.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Match files in any of these projects.
        #[arg(long = "project")]
        projects: Vec<String>,

        #[arg(long)]
        folder: Option<String>,

        /// Include subfolders of `--folder`.
        #[arg(long, short = 'r')]
        recursive: bool,

        /// MIME type or prefix, e.g. `image/` or `application/pdf`.
        #[arg(long)]
        mime: Option<String>,

        #[arg(long)]
        limit: Option<i64>,

        #[arg(long)]
        offset: Option<i64>,
    },

    /// Show a file's metadata, summary and extracted text.
    Get { id: String },

    /// Delete a file and its stored bytes.
    Rm { id: String },

    /// Re-extract text for every file and queue the tasks its depth needs.
    Reindex {
        #[arg(long)]
        depth: Option<IndexDepth>,
    },

    /// Manage tags.
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Calendar activities and time tracking.
    Activity {
        #[command(subcommand)]
        action: ActivityAction,
    },

    /// Inspect and process background tasks.
    Tasks {
        #[command(subcommand)]
        action: TasksAction,
    },

    /// Queue an LLM summary of a file.
    Summarize {
        id: String,
        /// Process the task now and print its result.
        #[arg(long)]
        wait: bool,
    },

    /// Queue OCR for an image file.
    Ocr {
        id: String,
        #[arg(long)]
        wait: bool,
    },

    /// Queue transcription for an audio file.
    Transcribe {
        id: String,
        #[arg(long)]
        wait: bool,
    },

    /// Chat with the LLM about files and activities.
    Chat {
        #[command(subcommand)]
        action: ChatAction,
    },
}

#[derive(Subcommand)]
enum TagAction {
    List,
    Add { name: String },
    Rm { name: String },
    /// Attach tags to a file, creating them as needed.
    Assign {
        file_id: String,
        #[arg(required = true)]
        tags: Vec<String>,
    },
    Unassign {
        file_id: String,
        #[arg(required = true)]
        tags: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    List {
        /// Include archived projects.
        #[arg(long)]
        all: bool,
    },
    Add {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Archive {
        name: String,
        /// Restore an archived project.
        #[arg(long)]
        undo: bool,
    },
    Rm { name: String },
    Assign { project: String, file_id: String },
    Unassign { project: String, file_id: String },
}

#[derive(Subcommand)]
enum ActivityAction {
    /// List activities overlapping a time range.
    List {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Record a finished activity.
    Add {
        title: String,
        /// Start time, e.g. `2024-05-01 09:00` (UTC).
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Start the timer.
    Start {
        title: String,
        #[arg(long)]
        project: Option<String>,
    },
    /// Stop the running timer.
    Stop,
    /// Time per project; defaults to the last seven days.
    Report {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    Rm { id: i64 },
}

#[derive(Subcommand)]
enum TasksAction {
    List {
        #[arg(long)]
        kind: Option<TaskKind>,
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        limit: Option<i64>,
    },
    Show { id: String },
    /// Process pending tasks and exit when none are left.
    Run,
}

#[derive(Subcommand)]
enum ChatAction {
    Sessions,
    New { title: Option<String> },
    /// Send a message and print the reply.
    Send {
        session: String,
        message: String,
        /// Reference a file by id; repeatable.
        #[arg(long = "file")]
        files: Vec<String>,
        /// Reference an activity by id; repeatable.
        #[arg(long = "activity")]
        activities: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let long_running = matches!(
        cli.command,
        Commands::Serve
            | Commands::Tasks {
                action: TasksAction::Run
            }
    );
    logging::init(if long_running { "info" } else { "warn" }, cli.log_json);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => cli::run_init(&cfg).await?,
        Commands::Serve => cli::run_serve(cfg).await?,
        Commands::Add {
            paths,
            folder,
            depth,
        } => cli::run_add(cfg, &paths, &folder, depth).await?,
        Commands::Import {
            dir,
            into,
            depth,
            progress_json,
            quiet,
        } => {
            let progress = if quiet {
                ProgressMode::Off
            } else if progress_json {
                ProgressMode::Json
            } else {
                ProgressMode::default_for_tty()
            };
            cli::run_import(cfg, &dir, &into, depth, progress).await?;
        }
        Commands::Search {
            query,
            from,
            to,
            tags,
            projects,
            folder,
            recursive,
            mime,
            limit,
            offset,
        } => {
            let query = FileQuery {
                text: query,
                from: from.as_deref().map(search::parse_date).transpose()?,
                to: to.as_deref().map(search::parse_date).transpose()?,
                tags,
                projects,
                folder,
                include_subfolders: recursive,
                mime,
                limit,
                offset,
            };
            search::run_search(&cfg, &query).await?;
        }
        Commands::Get { id } => cli::run_get(cfg, &id).await?,
        Commands::Rm { id } => cli::run_rm(cfg, &id).await?,
        Commands::Reindex { depth } => cli::run_reindex(cfg, depth).await?,
        Commands::Tag { action } => match action {
            TagAction::List => cli::run_tag_list(cfg).await?,
            TagAction::Add { name } => cli::run_tag_add(cfg, &name).await?,
            TagAction::Rm { name } => cli::run_tag_rm(cfg, &name).await?,
            TagAction::Assign { file_id, tags } => {
                cli::run_tag_assign(cfg, &file_id, &tags, true).await?
            }
            TagAction::Unassign { file_id, tags } => {
                cli::run_tag_assign(cfg, &file_id, &tags, false).await?
            }
        },
        Commands::Project { action } => match action {
            ProjectAction::List { all } => cli::run_project_list(cfg, all).await?,
            ProjectAction::Add { name, description } => {
                cli::run_project_add(cfg, &name, description.as_deref()).await?
            }
            ProjectAction::Archive { name, undo } => {
                cli::run_project_archive(cfg, &name, !undo).await?
            }
            ProjectAction::Rm { name } => cli::run_project_rm(cfg, &name).await?,
            ProjectAction::Assign { project, file_id } => {
                cli::run_project_assign(cfg, &project, &file_id, true).await?
            }
            ProjectAction::Unassign { project, file_id } => {
                cli::run_project_assign(cfg, &project, &file_id, false).await?
            }
        },
        Commands::Activity { action } => match action {
            ActivityAction::List { from, to } => {
                cli::run_activity_list(cfg, from.as_deref(), to.as_deref()).await?
            }
            ActivityAction::Add {
                title,
                start,
                end,
                project,
                description,
            } => {
                cli::run_activity_add(
                    cfg,
                    &title,
                    &start,
                    &end,
                    project.as_deref(),
                    description.as_deref(),
                )
                .await?
            }
            ActivityAction::Start { title, project } => {
                cli::run_activity_start(cfg, &title, project.as_deref()).await?
            }
            ActivityAction::Stop => cli::run_activity_stop(cfg).await?,
            ActivityAction::Report { from, to } => {
                cli::run_activity_report(cfg, from.as_deref(), to.as_deref()).await?
            }
            ActivityAction::Rm { id } => cli::run_activity_rm(cfg, id).await?,
        },
        Commands::Tasks { action } => match action {
            TasksAction::List {
                kind,
                status,
                limit,
            } => cli::run_tasks_list(cfg, kind, status, limit).await?,
            TasksAction::Show { id } => cli::run_tasks_show(cfg, &id).await?,
            TasksAction::Run => cli::run_tasks_run(cfg).await?,
        },
        Commands::Summarize { id, wait } => {
            cli::run_file_task(cfg, TaskKind::Summarization, &id, wait).await?
        }
        Commands::Ocr { id, wait } => cli::run_file_task(cfg, TaskKind::Ocr, &id, wait).await?,
        Commands::Transcribe { id, wait } => {
            cli::run_file_task(cfg, TaskKind::Transcription, &id, wait).await?
        }
        Commands::Chat { action } => match action {
            ChatAction::Sessions => cli::run_chat_sessions(cfg).await?,
            ChatAction::New { title } => cli::run_chat_new(cfg, title.as_deref()).await?,
            ChatAction::Send {
                session,
                message,
                files,
                activities,
            } => cli::run_chat_send(cfg, &session, &message, files, activities).await?,
        },
    }

    Ok(())
}
