//! Free-form file labels.
//!
//! Tag names are trimmed and lowercased, so `Finance` and ` finance ` are
//! the same tag. Every link change rebuilds the affected files' FTS rows,
//! which index tag names alongside the text.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::KbError;
use crate::files;
use crate::index::refresh_fts;
use crate::models::Tag;

pub fn normalize_tag(name: &str) -> String {
    name.trim().to_lowercase()
}

fn checked_name(name: &str) -> Result<String> {
    let name = normalize_tag(name);
    if name.is_empty() {
        return Err(KbError::invalid("tag name: must not be empty"));
    }
    Ok(name)
}

async fn tag_id(pool: &SqlitePool, name: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar("SELECT id FROM tags WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

async fn files_with_tag(pool: &SqlitePool, tag_id: i64) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar("SELECT file_id FROM file_tags WHERE tag_id = ?")
        .bind(tag_id)
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Creates a tag, or returns the existing one with that name.
pub async fn create_tag(pool: &SqlitePool, name: &str) -> Result<Tag> {
    let name = checked_name(name)?;
    sqlx::query("INSERT INTO tags (name, created_at) VALUES (?, ?) ON CONFLICT(name) DO NOTHING")
        .bind(&name)
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;
    get_tag(pool, &name).await
}

pub async fn get_tag(pool: &SqlitePool, name: &str) -> Result<Tag> {
    let name = normalize_tag(name);
    let row = sqlx::query(
        "SELECT t.id, t.name, COUNT(ft.file_id) AS file_count
         FROM tags t LEFT JOIN file_tags ft ON ft.tag_id = t.id
         WHERE t.name = ? GROUP BY t.id",
    )
    .bind(&name)
    .fetch_optional(pool)
    .await?;
    match row {
        Some(row) => Ok(Tag {
            id: row.get("id"),
            name: row.get("name"),
            file_count: row.get("file_count"),
        }),
        None => Err(KbError::not_found(format!("tag '{}'", name))),
    }
}

/// All tags with the number of files carrying each, by name.
pub async fn list_tags(pool: &SqlitePool) -> Result<Vec<Tag>> {
    let rows = sqlx::query(
        "SELECT t.id, t.name, COUNT(ft.file_id) AS file_count
         FROM tags t LEFT JOIN file_tags ft ON ft.tag_id = t.id
         GROUP BY t.id ORDER BY t.name ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|row| Tag {
            id: row.get("id"),
            name: row.get("name"),
            file_count: row.get("file_count"),
        })
        .collect())
}

pub async fn rename_tag(pool: &SqlitePool, old: &str, new: &str) -> Result<Tag> {
    let old = normalize_tag(old);
    let new = checked_name(new)?;
    let id = tag_id(pool, &old)
        .await?
        .ok_or_else(|| KbError::not_found(format!("tag '{}'", old)))?;
    if old == new {
        return get_tag(pool, &new).await;
    }
    if tag_id(pool, &new).await?.is_some() {
        return Err(KbError::conflict(format!("tag '{}'", new)));
    }

    sqlx::query("UPDATE tags SET name = ? WHERE id = ?")
        .bind(&new)
        .bind(id)
        .execute(pool)
        .await?;
    for file_id in files_with_tag(pool, id).await? {
        refresh_fts(pool, &file_id).await?;
    }
    info!(from = %old, to = %new, "renamed tag");
    get_tag(pool, &new).await
}

/// Deletes a tag and unlinks it from every file.
pub async fn delete_tag(pool: &SqlitePool, name: &str) -> Result<()> {
    let name = normalize_tag(name);
    let id = tag_id(pool, &name)
        .await?
        .ok_or_else(|| KbError::not_found(format!("tag '{}'", name)))?;
    let affected = files_with_tag(pool, id).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM file_tags WHERE tag_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM tags WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    for file_id in affected {
        refresh_fts(pool, &file_id).await?;
    }
    info!(tag = %name, "deleted tag");
    Ok(())
}

/// Tags a file, creating the tag on first use. Assigning twice is a no-op.
pub async fn assign_tag(pool: &SqlitePool, file_id: &str, name: &str) -> Result<Tag> {
    files::get_file(pool, file_id).await?;
    let tag = create_tag(pool, name).await?;
    sqlx::query("INSERT OR IGNORE INTO file_tags (file_id, tag_id) VALUES (?, ?)")
        .bind(file_id)
        .bind(tag.id)
        .execute(pool)
        .await?;
    refresh_fts(pool, file_id).await?;
    get_tag(pool, &tag.name).await
}

pub async fn unassign_tag(pool: &SqlitePool, file_id: &str, name: &str) -> Result<()> {
    files::get_file(pool, file_id).await?;
    let name = normalize_tag(name);
    let id = tag_id(pool, &name)
        .await?
        .ok_or_else(|| KbError::not_found(format!("tag '{}'", name)))?;
    sqlx::query("DELETE FROM file_tags WHERE file_id = ? AND tag_id = ?")
        .bind(file_id)
        .bind(id)
        .execute(pool)
        .await?;
    refresh_fts(pool, file_id).await?;
    Ok(())
}

/// Names of the tags on a file, sorted.
pub async fn tags_for_file(pool: &SqlitePool, file_id: &str) -> Result<Vec<String>> {
    let names = sqlx::query_scalar(
        "SELECT t.name FROM tags t JOIN file_tags ft ON ft.tag_id = t.id
         WHERE ft.file_id = ? ORDER BY t.name ASC",
    )
    .bind(file_id)
    .fetch_all(pool)
    .await?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::models::IndexDepth;
    use crate::search::{search_files, FileQuery};
    use crate::storage::store_upload;

    #[tokio::test]
    async fn create_is_idempotent_and_normalized() {
        let (_tmp, app) = App::test().await;
        let a = create_tag(&app.pool, " Finance ").await.unwrap();
        let b = create_tag(&app.pool, "finance").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, "finance");
        assert!(create_tag(&app.pool, "   ").await.is_err());
    }

    #[tokio::test]
    async fn assignment_is_searchable_and_counted() {
        let (_tmp, app) = App::test().await;
        let f = store_upload(&app, "a.txt", "", b"plain words", IndexDepth::Standard)
            .await
            .unwrap();
        assign_tag(&app.pool, &f.file.id, "Receipts").await.unwrap();
        assign_tag(&app.pool, &f.file.id, "receipts").await.unwrap();

        let tags = list_tags(&app.pool).await.unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].file_count, 1);

        let hits = search_files(
            &app.pool,
            &FileQuery {
                text: Some("receipts".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tags, vec!["receipts".to_string()]);
    }

    #[tokio::test]
    async fn rename_conflicts_with_existing_name() {
        let (_tmp, app) = App::test().await;
        create_tag(&app.pool, "a").await.unwrap();
        create_tag(&app.pool, "b").await.unwrap();
        let err = rename_tag(&app.pool, "a", "B").await.unwrap_err();
        assert!(matches!(err.downcast_ref::<KbError>(), Some(KbError::Conflict(_))));
        let renamed = rename_tag(&app.pool, "a", "c").await.unwrap();
        assert_eq!(renamed.name, "c");
    }

    #[tokio::test]
    async fn delete_unlinks_files() {
        let (_tmp, app) = App::test().await;
        let f = store_upload(&app, "a.txt", "", b"x", IndexDepth::Standard)
            .await
            .unwrap();
        assign_tag(&app.pool, &f.file.id, "old").await.unwrap();
        delete_tag(&app.pool, "old").await.unwrap();
        assert!(tags_for_file(&app.pool, &f.file.id).await.unwrap().is_empty());
        assert!(delete_tag(&app.pool, "old").await.is_err());
    }

    #[tokio::test]
    async fn unassign_removes_only_that_tag() {
        let (_tmp, app) = App::test().await;
        let f = store_upload(&app, "a.txt", "", b"x", IndexDepth::Standard)
            .await
            .unwrap();
        assign_tag(&app.pool, &f.file.id, "one").await.unwrap();
        assign_tag(&app.pool, &f.file.id, "two").await.unwrap();
        unassign_tag(&app.pool, &f.file.id, "one").await.unwrap();
        assert_eq!(
            tags_for_file(&app.pool, &f.file.id).await.unwrap(),
            vec!["two".to_string()]
        );
    }
}
