//! Projects group files and calendar activities.
//!
//! Unlike tags, project names keep their case and must be created
//! explicitly. Archived projects stay linked but drop out of the default
//! listing.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::KbError;
use crate::files::{self, file_from_row};
use crate::index::refresh_fts;
use crate::models::{FileRecord, Project};

const SELECT_PROJECT: &str = "SELECT p.id, p.name, p.description, p.archived, p.created_at,
        (SELECT COUNT(*) FROM file_projects fp WHERE fp.project_id = p.id) AS file_count
     FROM projects p";

fn project_from_row(row: &SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        archived: row.get::<i64, _>("archived") != 0,
        created_at: row.get("created_at"),
        file_count: row.get("file_count"),
    }
}

pub async fn find_project(pool: &SqlitePool, name: &str) -> Result<Option<Project>> {
    let row = sqlx::query(&format!("{} WHERE p.name = ?", SELECT_PROJECT))
        .bind(name.trim())
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(project_from_row))
}

pub async fn get_project(pool: &SqlitePool, name: &str) -> Result<Project> {
    find_project(pool, name)
        .await?
        .ok_or_else(|| KbError::not_found(format!("project '{}'", name.trim())))
}

pub async fn create_project(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
) -> Result<Project> {
    let name = name.trim();
    if name.is_empty() {
        return Err(KbError::invalid("project name: must not be empty"));
    }
    if find_project(pool, name).await?.is_some() {
        return Err(KbError::conflict(format!("project '{}'", name)));
    }
    sqlx::query("INSERT INTO projects (name, description, archived, created_at) VALUES (?, ?, 0, ?)")
        .bind(name)
        .bind(description.map(str::trim).filter(|d| !d.is_empty()))
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;
    info!(project = name, "created project");
    get_project(pool, name).await
}

pub async fn list_projects(pool: &SqlitePool, include_archived: bool) -> Result<Vec<Project>> {
    let sql = if include_archived {
        format!("{} ORDER BY p.name ASC", SELECT_PROJECT)
    } else {
        format!("{} WHERE p.archived = 0 ORDER BY p.name ASC", SELECT_PROJECT)
    };
    let rows = sqlx::query(&sql).fetch_all(pool).await?;
    Ok(rows.iter().map(project_from_row).collect())
}

pub async fn update_description(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
) -> Result<Project> {
    let project = get_project(pool, name).await?;
    sqlx::query("UPDATE projects SET description = ? WHERE id = ?")
        .bind(description.map(str::trim).filter(|d| !d.is_empty()))
        .bind(project.id)
        .execute(pool)
        .await?;
    get_project(pool, &project.name).await
}

pub async fn set_archived(pool: &SqlitePool, name: &str, archived: bool) -> Result<Project> {
    let project = get_project(pool, name).await?;
    sqlx::query("UPDATE projects SET archived = ? WHERE id = ?")
        .bind(archived as i64)
        .bind(project.id)
        .execute(pool)
        .await?;
    info!(project = %project.name, archived, "updated project");
    get_project(pool, &project.name).await
}

/// Deletes a project. Files are unlinked; activities keep their times but
/// lose the project.
pub async fn delete_project(pool: &SqlitePool, name: &str) -> Result<()> {
    let project = get_project(pool, name).await?;
    let affected: Vec<String> =
        sqlx::query_scalar("SELECT file_id FROM file_projects WHERE project_id = ?")
            .bind(project.id)
            .fetch_all(pool)
            .await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM file_projects WHERE project_id = ?")
        .bind(project.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE activities SET project_id = NULL WHERE project_id = ?")
        .bind(project.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(project.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    for file_id in affected {
        refresh_fts(pool, &file_id).await?;
    }
    info!(project = %project.name, "deleted project");
    Ok(())
}

pub async fn add_file(pool: &SqlitePool, project: &str, file_id: &str) -> Result<()> {
    let project = get_project(pool, project).await?;
    files::get_file(pool, file_id).await?;
    sqlx::query("INSERT OR IGNORE INTO file_projects (file_id, project_id) VALUES (?, ?)")
        .bind(file_id)
        .bind(project.id)
        .execute(pool)
        .await?;
    refresh_fts(pool, file_id).await
}

pub async fn remove_file(pool: &SqlitePool, project: &str, file_id: &str) -> Result<()> {
    let project = get_project(pool, project).await?;
    files::get_file(pool, file_id).await?;
    sqlx::query("DELETE FROM file_projects WHERE file_id = ? AND project_id = ?")
        .bind(file_id)
        .bind(project.id)
        .execute(pool)
        .await?;
    refresh_fts(pool, file_id).await
}

pub async fn projects_for_file(pool: &SqlitePool, file_id: &str) -> Result<Vec<String>> {
    let names = sqlx::query_scalar(
        "SELECT p.name FROM projects p JOIN file_projects fp ON fp.project_id = p.id
         WHERE fp.file_id = ? ORDER BY p.name ASC",
    )
    .bind(file_id)
    .fetch_all(pool)
    .await?;
    Ok(names)
}

/// Files linked to a project, newest first.
pub async fn files_in_project(pool: &SqlitePool, project: &str) -> Result<Vec<FileRecord>> {
    let project = get_project(pool, project).await?;
    let rows = sqlx::query(
        "SELECT f.* FROM files f JOIN file_projects fp ON fp.file_id = f.id
         WHERE fp.project_id = ? ORDER BY f.created_at DESC, f.id ASC",
    )
    .bind(project.id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|r| file_from_row(r, false)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::models::IndexDepth;
    use crate::storage::store_upload;

    #[tokio::test]
    async fn names_are_unique() {
        let (_tmp, app) = App::test().await;
        create_project(&app.pool, "Thesis", Some("writing")).await.unwrap();
        let err = create_project(&app.pool, " Thesis ", None).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<KbError>(), Some(KbError::Conflict(_))));
    }

    #[tokio::test]
    async fn archived_projects_are_hidden_by_default() {
        let (_tmp, app) = App::test().await;
        create_project(&app.pool, "old", None).await.unwrap();
        create_project(&app.pool, "new", None).await.unwrap();
        set_archived(&app.pool, "old", true).await.unwrap();

        let active = list_projects(&app.pool, false).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "new");
        assert_eq!(list_projects(&app.pool, true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_links_round_trip() {
        let (_tmp, app) = App::test().await;
        create_project(&app.pool, "alpha", None).await.unwrap();
        let f = store_upload(&app, "a.txt", "", b"x", IndexDepth::Standard)
            .await
            .unwrap();
        add_file(&app.pool, "alpha", &f.file.id).await.unwrap();
        add_file(&app.pool, "alpha", &f.file.id).await.unwrap();

        assert_eq!(get_project(&app.pool, "alpha").await.unwrap().file_count, 1);
        assert_eq!(files_in_project(&app.pool, "alpha").await.unwrap().len(), 1);

        remove_file(&app.pool, "alpha", &f.file.id).await.unwrap();
        assert!(projects_for_file(&app.pool, &f.file.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_unlinks_files() {
        let (_tmp, app) = App::test().await;
        create_project(&app.pool, "gone", None).await.unwrap();
        let f = store_upload(&app, "a.txt", "", b"x", IndexDepth::Standard)
            .await
            .unwrap();
        add_file(&app.pool, "gone", &f.file.id).await.unwrap();
        delete_project(&app.pool, "gone").await.unwrap();
        assert!(projects_for_file(&app.pool, &f.file.id).await.unwrap().is_empty());
        assert!(find_project(&app.pool, "gone").await.unwrap().is_none());
    }
}
