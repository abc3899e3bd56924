//! File records: row access shared by upload, indexing, search and the
//! task handlers.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::KbError;
use crate::models::{FileRecord, IndexDepth};

pub(crate) fn file_from_row(row: &SqliteRow, with_content: bool) -> FileRecord {
    FileRecord {
        id: row.get("id"),
        name: row.get("name"),
        folder: row.get("folder"),
        stored_path: row.get("stored_path"),
        mime_type: row.get("mime_type"),
        size_bytes: row.get("size_bytes"),
        sha256: row.get("sha256"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        indexed_at: row.get("indexed_at"),
        index_depth: row.get("index_depth"),
        content: if with_content {
            row.get("content")
        } else {
            None
        },
        summary: row.get("summary"),
    }
}

pub async fn find_file(pool: &SqlitePool, id: &str) -> Result<Option<FileRecord>> {
    let row = sqlx::query("SELECT * FROM files WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| file_from_row(&r, true)))
}

/// Like [`find_file`], but a missing file is an error.
pub async fn get_file(pool: &SqlitePool, id: &str) -> Result<FileRecord> {
    match find_file(pool, id).await? {
        Some(f) => Ok(f),
        None => Err(KbError::not_found(format!("file {}", id))),
    }
}

pub async fn find_duplicate(pool: &SqlitePool, folder: &str, sha256: &str) -> Result<Option<FileRecord>> {
    let row = sqlx::query("SELECT * FROM files WHERE folder = ? AND sha256 = ? LIMIT 1")
        .bind(folder)
        .bind(sha256)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| file_from_row(&r, false)))
}

pub async fn insert_file(pool: &SqlitePool, file: &FileRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO files (id, name, folder, stored_path, mime_type, size_bytes, sha256, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&file.id)
    .bind(&file.name)
    .bind(&file.folder)
    .bind(&file.stored_path)
    .bind(&file.mime_type)
    .bind(file.size_bytes)
    .bind(&file.sha256)
    .bind(file.created_at)
    .bind(file.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn all_file_ids(pool: &SqlitePool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar("SELECT id FROM files ORDER BY created_at ASC, id ASC")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Records the outcome of an indexing pass. `content: None` keeps the
/// current text.
pub async fn set_indexed(
    pool: &SqlitePool,
    id: &str,
    depth: IndexDepth,
    content: Option<&str>,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE files SET content = COALESCE(?, content), index_depth = ?, indexed_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(content)
    .bind(depth.as_str())
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Appends recognised text (OCR, transcript) below any extracted text.
pub async fn append_content(pool: &SqlitePool, id: &str, text: &str, max_chars: usize) -> Result<String> {
    let file = get_file(pool, id).await?;
    let merged = match file.content.as_deref().map(str::trim) {
        Some(existing) if !existing.is_empty() && existing != text.trim() => {
            format!("{}\n\n{}", existing, text.trim())
        }
        _ => text.trim().to_string(),
    };
    let merged = truncate_chars(&merged, max_chars).to_string();

    let now = chrono::Utc::now().timestamp();
    sqlx::query("UPDATE files SET content = ?, updated_at = ? WHERE id = ?")
        .bind(&merged)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(merged)
}

pub async fn set_summary(pool: &SqlitePool, id: &str, summary: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let updated = sqlx::query("UPDATE files SET summary = ?, updated_at = ? WHERE id = ?")
        .bind(summary)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(KbError::not_found(format!("file {}", id)));
    }
    Ok(())
}

/// Removes the row, its FTS entry, links and chat references.
/// Returns the record that was deleted.
pub async fn delete_file_row(pool: &SqlitePool, id: &str) -> Result<FileRecord> {
    let file = get_file(pool, id).await?;
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM files_fts WHERE file_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chat_references WHERE ref_kind = 'file' AND ref_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM file_tags WHERE file_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM file_projects WHERE file_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM files WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(file)
}

/// Cuts `s` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
