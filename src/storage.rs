//! Upload storage.
//!
//! Uploaded bytes live under `[storage].root`, mirroring the user's
//! subfolder layout: `<root>/<folder>/<uuid>-<name>`. The `files` table
//! records the relative path, mime type and SHA-256 of every upload.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::app::App;
use crate::config::Config;
use crate::error::KbError;
use crate::extract;
use crate::files;
use crate::index;
use crate::models::{FileRecord, IndexDepth, Task};
use crate::progress::{ImportProgressEvent, ImportProgressReporter};

/// Result of storing one upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub file: FileRecord,
    /// True when identical bytes already existed in the same folder.
    pub duplicate: bool,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportStats {
    pub scanned: u64,
    pub stored: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub tasks_queued: u64,
}

/// Validates and normalizes a user-supplied subfolder: `/`-separated,
/// no leading/trailing slash, no `.` / `..` / absolute components.
pub fn normalize_folder(folder: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in folder.split(['/', '\\']) {
        match part.trim() {
            "" | "." => continue,
            ".." => return Err(KbError::invalid(format!("folder '{}': must not contain '..'", folder))),
            p if p.contains(':') => return Err(KbError::invalid(format!("folder '{}'", folder))),
            p => parts.push(p.to_string()),
        }
    }
    Ok(parts.join("/"))
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(KbError::invalid("file name: must not be empty"));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(KbError::invalid(format!("file name '{}'", name)));
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Absolute path of a stored file.
pub fn stored_file_path(config: &Config, file: &FileRecord) -> PathBuf {
    let mut path = config.storage.root.clone();
    for part in file.stored_path.split('/') {
        path.push(part);
    }
    path
}

pub async fn read_bytes(config: &Config, file: &FileRecord) -> Result<Vec<u8>> {
    let path = stored_file_path(config, file);
    tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read stored file: {}", path.display()))
}

/// Stores an upload and indexes it at `depth`.
pub async fn store_upload(
    app: &App,
    name: &str,
    folder: &str,
    bytes: &[u8],
    depth: IndexDepth,
) -> Result<UploadOutcome> {
    validate_name(name)?;
    let folder = normalize_folder(folder)?;
    let max = app.config.storage.max_file_bytes;
    if bytes.len() as u64 > max {
        return Err(KbError::TooLarge(format!(
            "file too large: {} is {} bytes (limit {} bytes)",
            name,
            bytes.len(),
            max
        ))
        .into());
    }

    let sha256 = sha256_hex(bytes);
    if let Some(existing) = files::find_duplicate(&app.pool, &folder, &sha256).await? {
        info!(file_id = %existing.id, name, "duplicate upload");
        return Ok(UploadOutcome {
            file: existing,
            duplicate: true,
            tasks: Vec::new(),
        });
    }

    let id = Uuid::new_v4().to_string();
    let stored_name = format!("{}-{}", id, name);
    let stored_path = if folder.is_empty() {
        stored_name
    } else {
        format!("{}/{}", folder, stored_name)
    };

    let now = chrono::Utc::now().timestamp();
    let record = FileRecord {
        id: id.clone(),
        name: name.to_string(),
        folder,
        stored_path,
        mime_type: extract::mime_for_name(name).to_string(),
        size_bytes: bytes.len() as i64,
        sha256,
        created_at: now,
        updated_at: now,
        indexed_at: None,
        index_depth: None,
        content: None,
        summary: None,
    };

    let path = stored_file_path(&app.config, &record);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    if let Err(e) = files::insert_file(&app.pool, &record).await {
        let _ = tokio::fs::remove_file(&path).await;
        return Err(e);
    }
    info!(file_id = %id, name, mime = %record.mime_type, "stored upload");

    let outcome = index::index_file(app, &id, depth).await?;
    Ok(UploadOutcome {
        file: outcome.file,
        duplicate: false,
        tasks: outcome.tasks,
    })
}

/// Stores every matching file below `dir`, keeping relative subfolders
/// under `into`.
pub async fn import_directory(
    app: &App,
    dir: &Path,
    into: &str,
    depth: IndexDepth,
    progress: &dyn ImportProgressReporter,
) -> Result<ImportStats> {
    if !dir.is_dir() {
        return Err(KbError::not_found(format!("import directory {}", dir.display())));
    }
    let into = normalize_folder(into)?;
    let import = &app.config.import;
    let include_set = build_globset(&import.include_globs)?;
    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(import.exclude_globs.clone());
    let exclude_set = build_globset(&excludes)?;

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(import.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let rel_str = relative.to_string_lossy().replace('\\', "/");
        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        paths.push((entry.path().to_path_buf(), relative.to_path_buf()));
    }
    paths.sort();

    let total = paths.len() as u64;
    let mut stats = ImportStats {
        scanned: total,
        ..Default::default()
    };

    for (n, (path, relative)) in paths.iter().enumerate() {
        progress.report(ImportProgressEvent {
            n: n as u64 + 1,
            total,
            path: relative.display().to_string(),
        });

        let name = match relative.file_name() {
            Some(n) => n.to_string_lossy().to_string(),
            None => continue,
        };
        let sub = relative
            .parent()
            .map(|p| {
                p.components()
                    .filter_map(|c| match c {
                        Component::Normal(s) => Some(s.to_string_lossy().to_string()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();
        let folder = match (into.is_empty(), sub.is_empty()) {
            (true, _) => sub,
            (false, true) => into.clone(),
            (false, false) => format!("{}/{}", into, sub),
        };

        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable file");
                stats.failed += 1;
                continue;
            }
        };

        match store_upload(app, &name, &folder, &bytes, depth).await {
            Ok(outcome) if outcome.duplicate => stats.duplicates += 1,
            Ok(outcome) => {
                stats.stored += 1;
                stats.tasks_queued += outcome.tasks.len() as u64;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping file");
                stats.failed += 1;
            }
        }
    }

    Ok(stats)
}

/// Deletes a file's bytes and rows. Pending tasks for it fail when run.
pub async fn delete_file(app: &App, id: &str) -> Result<FileRecord> {
    let file = files::delete_file_row(&app.pool, id).await?;
    let path = stored_file_path(&app.config, &file);
    if let Err(e) = tokio::fs::remove_file(&path).await {
        warn!(file_id = %id, path = %path.display(), error = %e, "stored bytes already gone");
    }
    info!(file_id = %id, name = %file.name, "deleted file");
    Ok(file)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
