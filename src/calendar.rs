//! Calendar of time-tracked activities.
//!
//! An activity spans `[start_at, end_at)` in Unix seconds (UTC). An
//! activity without `end_at` is the running timer; at most one exists at a
//! time.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::info;

use crate::error::KbError;
use crate::models::Activity;
use crate::projects;

const SELECT_ACTIVITY: &str = "SELECT a.id, a.title, a.description, a.start_at, a.end_at, p.name AS project
     FROM activities a LEFT JOIN projects p ON p.id = a.project_id";

/// Fields for a new activity.
#[derive(Debug, Clone, Default)]
pub struct NewActivity {
    pub title: String,
    pub description: Option<String>,
    pub project: Option<String>,
    pub start_at: i64,
    pub end_at: Option<i64>,
}

/// Partial update; `None` leaves a field unchanged. `project: Some(None)`
/// clears the project.
#[derive(Debug, Clone, Default)]
pub struct ActivityUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub project: Option<Option<String>>,
    pub start_at: Option<i64>,
    pub end_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectTime {
    /// `None` collects activities without a project.
    pub project: Option<String>,
    pub seconds: i64,
    pub activities: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeReport {
    pub from: i64,
    pub to: i64,
    pub total_seconds: i64,
    pub projects: Vec<ProjectTime>,
}

/// Parses `YYYY-MM-DD HH:MM[:SS]`, `YYYY-MM-DDTHH:MM[:SS]`, a bare date
/// (midnight) or RFC 3339. Times without an offset are UTC.
pub fn parse_time(s: &str) -> Result<i64> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp());
    }
    for fmt in ["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = d.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    Err(KbError::invalid(format!(
        "time '{}': expected YYYY-MM-DD HH:MM or RFC 3339",
        s
    )))
}

pub fn format_time(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn activity_from_row(row: &SqliteRow) -> Activity {
    Activity {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        project: row.get("project"),
        start_at: row.get("start_at"),
        end_at: row.get("end_at"),
    }
}

fn check_range(start_at: i64, end_at: Option<i64>) -> Result<()> {
    if let Some(end) = end_at {
        if end <= start_at {
            return Err(KbError::invalid("activity: end must be after start"));
        }
    }
    Ok(())
}

fn check_title(title: &str) -> Result<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(KbError::invalid("activity title: must not be empty"));
    }
    Ok(title.to_string())
}

async fn project_id(pool: &SqlitePool, project: Option<&str>) -> Result<Option<i64>> {
    match project.map(str::trim).filter(|p| !p.is_empty()) {
        Some(name) => Ok(Some(projects::get_project(pool, name).await?.id)),
        None => Ok(None),
    }
}

pub async fn running_activity(pool: &SqlitePool) -> Result<Option<Activity>> {
    let row = sqlx::query(&format!(
        "{} WHERE a.end_at IS NULL ORDER BY a.start_at DESC LIMIT 1",
        SELECT_ACTIVITY
    ))
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(activity_from_row))
}

pub async fn get_activity(pool: &SqlitePool, id: i64) -> Result<Activity> {
    let row = sqlx::query(&format!("{} WHERE a.id = ?", SELECT_ACTIVITY))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref()
        .map(activity_from_row)
        .ok_or_else(|| KbError::not_found(format!("activity {}", id)))
}

pub async fn create_activity(pool: &SqlitePool, new: NewActivity) -> Result<Activity> {
    let title = check_title(&new.title)?;
    check_range(new.start_at, new.end_at)?;
    if new.end_at.is_none() {
        if let Some(running) = running_activity(pool).await? {
            return Err(KbError::conflict(format!("running activity {}", running.id)));
        }
    }
    let project_id = project_id(pool, new.project.as_deref()).await?;

    let id = sqlx::query(
        "INSERT INTO activities (title, description, project_id, start_at, end_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&title)
    .bind(new.description.as_deref())
    .bind(project_id)
    .bind(new.start_at)
    .bind(new.end_at)
    .execute(pool)
    .await?
    .last_insert_rowid();
    info!(activity_id = id, title = %title, "created activity");
    get_activity(pool, id).await
}

/// Starts the timer now. Fails while another activity is running.
pub async fn start_timer(
    pool: &SqlitePool,
    title: &str,
    project: Option<&str>,
    description: Option<&str>,
) -> Result<Activity> {
    create_activity(
        pool,
        NewActivity {
            title: title.to_string(),
            description: description.map(str::to_string),
            project: project.map(str::to_string),
            start_at: Utc::now().timestamp(),
            end_at: None,
        },
    )
    .await
}

/// Ends the running activity now.
pub async fn stop_timer(pool: &SqlitePool) -> Result<Activity> {
    let running = running_activity(pool)
        .await?
        .ok_or_else(|| KbError::not_found("running activity"))?;
    // A timer stopped within the same second still gets a non-empty span.
    let end = Utc::now().timestamp().max(running.start_at + 1);
    sqlx::query("UPDATE activities SET end_at = ? WHERE id = ?")
        .bind(end)
        .bind(running.id)
        .execute(pool)
        .await?;
    info!(activity_id = running.id, "stopped timer");
    get_activity(pool, running.id).await
}

/// Activities overlapping `[from, to)`, by start time. A running activity
/// extends to now.
pub async fn list_activities(
    pool: &SqlitePool,
    from: Option<i64>,
    to: Option<i64>,
) -> Result<Vec<Activity>> {
    let now = Utc::now().timestamp();
    let rows = sqlx::query(&format!(
        "{} WHERE a.start_at < ? AND COALESCE(a.end_at, ?) > ? ORDER BY a.start_at ASC, a.id ASC",
        SELECT_ACTIVITY
    ))
    .bind(to.unwrap_or(i64::MAX))
    .bind(now)
    .bind(from.unwrap_or(i64::MIN))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(activity_from_row).collect())
}

pub async fn update_activity(pool: &SqlitePool, id: i64, update: ActivityUpdate) -> Result<Activity> {
    let current = get_activity(pool, id).await?;
    let title = match &update.title {
        Some(t) => check_title(t)?,
        None => current.title.clone(),
    };
    let start_at = update.start_at.unwrap_or(current.start_at);
    let end_at = update.end_at.or(current.end_at);
    check_range(start_at, end_at)?;
    let description = match update.description {
        Some(d) if d.trim().is_empty() => None,
        Some(d) => Some(d),
        None => current.description.clone(),
    };
    let project = match update.project {
        Some(p) => p,
        None => current.project.clone(),
    };
    let project_id = project_id(pool, project.as_deref()).await?;

    sqlx::query(
        "UPDATE activities SET title = ?, description = ?, project_id = ?, start_at = ?, end_at = ? WHERE id = ?",
    )
    .bind(&title)
    .bind(description.as_deref())
    .bind(project_id)
    .bind(start_at)
    .bind(end_at)
    .bind(id)
    .execute(pool)
    .await?;
    get_activity(pool, id).await
}

pub async fn delete_activity(pool: &SqlitePool, id: i64) -> Result<()> {
    let deleted = sqlx::query("DELETE FROM activities WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(KbError::not_found(format!("activity {}", id)));
    }
    sqlx::query("DELETE FROM chat_references WHERE ref_kind = 'activity' AND ref_id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Tracked seconds per project within `[from, to)`. Activities are clipped
/// to the range; the running one counts up to `now`.
pub async fn time_report(pool: &SqlitePool, from: i64, to: i64, now: i64) -> Result<TimeReport> {
    if to <= from {
        return Err(KbError::invalid("report range: end must be after start"));
    }
    let activities = list_activities(pool, Some(from), Some(to)).await?;

    let mut per_project: BTreeMap<Option<String>, (i64, i64)> = BTreeMap::new();
    for a in &activities {
        let seconds = a.seconds_within(from, to, now);
        if seconds == 0 {
            continue;
        }
        let entry = per_project.entry(a.project.clone()).or_default();
        entry.0 += seconds;
        entry.1 += 1;
    }

    let mut projects: Vec<ProjectTime> = per_project
        .into_iter()
        .map(|(project, (seconds, activities))| ProjectTime {
            project,
            seconds,
            activities,
        })
        .collect();
    projects.sort_by(|a, b| b.seconds.cmp(&a.seconds).then_with(|| a.project.cmp(&b.project)));
    let total_seconds = projects.iter().map(|p| p.seconds).sum();

    Ok(TimeReport {
        from,
        to,
        total_seconds,
        projects,
    })
}
