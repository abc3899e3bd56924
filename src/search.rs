//! File search: FTS5 text matching combined with relational filters.
//!
//! With query text, candidates come from `files_fts` ranked by BM25 (name
//! and labels weigh more than body text); without text the same filters run
//! directly against `files`, newest first. Filters:
//!
//! | Filter | Semantics |
//! |--------|-----------|
//! | `from` / `to` | inclusive dates on `created_at` |
//! | `tags` | file carries **all** of them |
//! | `projects` | file belongs to **any** of them |
//! | `folder` | exact folder, or the whole subtree with `include_subfolders` |
//! | `mime` | exact type, or a family such as `image/*` |

use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::error::KbError;
use crate::files::file_from_row;
use crate::models::FileRecord;
use crate::projects;
use crate::storage::normalize_folder;
use crate::tags;

pub const DEFAULT_LIMIT: i64 = 50;
pub const MAX_LIMIT: i64 = 500;

#[derive(Debug, Default, Clone)]
pub struct FileQuery {
    pub text: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub tags: Vec<String>,
    pub projects: Vec<String>,
    pub folder: Option<String>,
    pub include_subfolders: bool,
    pub mime: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileHit {
    #[serde(flatten)]
    pub file: FileRecord,
    pub tags: Vec<String>,
    pub projects: Vec<String>,
    /// Higher is better; `None` for filter-only listings.
    pub score: Option<f64>,
    pub snippet: Option<String>,
}

/// Parses a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| KbError::invalid(format!("date '{}': expected YYYY-MM-DD", s)))
}

/// Quotes every whitespace-separated token so user input can never be read
/// as FTS5 syntax. A trailing `*` is kept as a prefix match.
pub fn sanitize_fts_query(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split_whitespace()
        .filter_map(|raw| {
            let prefix = raw.ends_with('*');
            let word: String = raw.chars().filter(|c| *c != '"' && *c != '*').collect();
            if word.is_empty() {
                None
            } else if prefix {
                Some(format!("\"{}\"*", word))
            } else {
                Some(format!("\"{}\"", word))
            }
        })
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

pub async fn search_files(pool: &SqlitePool, query: &FileQuery) -> Result<Vec<FileHit>> {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(KbError::invalid(format!(
                "date range: from {} is after to {}",
                from, to
            )));
        }
    }
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);
    let fts = query.text.as_deref().and_then(sanitize_fts_query);

    let mut qb: QueryBuilder<Sqlite> = match &fts {
        Some(m) => {
            let mut qb = QueryBuilder::new(
                "SELECT f.*, bm25(files_fts, 0.0, 8.0, 2.0, 1.0, 3.0, 6.0) AS rank, \
                 snippet(files_fts, -1, '[', ']', '...', 16) AS snippet \
                 FROM files_fts JOIN files f ON f.id = files_fts.file_id \
                 WHERE files_fts MATCH ",
            );
            qb.push_bind(m.clone());
            qb
        }
        None => QueryBuilder::new(
            "SELECT f.*, NULL AS rank, NULL AS snippet FROM files f WHERE 1 = 1",
        ),
    };

    if let Some(from) = query.from {
        let ts = from.and_hms_opt(0, 0, 0).map(|d| d.and_utc().timestamp()).unwrap_or(0);
        qb.push(" AND f.created_at >= ").push_bind(ts);
    }
    if let Some(to) = query.to {
        let ts = to
            .and_hms_opt(23, 59, 59)
            .map(|d| d.and_utc().timestamp())
            .unwrap_or(i64::MAX);
        qb.push(" AND f.created_at <= ").push_bind(ts);
    }

    for tag in &query.tags {
        qb.push(
            " AND EXISTS (SELECT 1 FROM file_tags ft JOIN tags t ON t.id = ft.tag_id \
             WHERE ft.file_id = f.id AND t.name = ",
        )
        .push_bind(tags::normalize_tag(tag))
        .push(")");
    }

    if !query.projects.is_empty() {
        qb.push(
            " AND EXISTS (SELECT 1 FROM file_projects fp JOIN projects p ON p.id = fp.project_id \
             WHERE fp.file_id = f.id AND p.name IN (",
        );
        {
            let mut sep = qb.separated(", ");
            for p in &query.projects {
                sep.push_bind(p.trim().to_string());
            }
        }
        qb.push("))");
    }

    if let Some(folder) = &query.folder {
        let folder = normalize_folder(folder)?;
        if query.include_subfolders {
            if !folder.is_empty() {
                qb.push(" AND (f.folder = ")
                    .push_bind(folder.clone())
                    .push(" OR f.folder LIKE ")
                    .push_bind(format!("{}/%", escape_like(&folder)))
                    .push(" ESCAPE '\\')");
            }
        } else {
            qb.push(" AND f.folder = ").push_bind(folder);
        }
    }

    if let Some(mime) = query.mime.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        match mime.strip_suffix("/*") {
            Some(family) => {
                qb.push(" AND f.mime_type LIKE ")
                    .push_bind(format!("{}/%", escape_like(family)))
                    .push(" ESCAPE '\\'");
            }
            None => {
                qb.push(" AND f.mime_type = ").push_bind(mime.to_string());
            }
        }
    }

    if fts.is_some() {
        qb.push(" ORDER BY rank ASC, f.created_at DESC, f.id ASC");
    } else {
        qb.push(" ORDER BY f.created_at DESC, f.id ASC");
    }
    qb.push(" LIMIT ").push_bind(limit);
    qb.push(" OFFSET ").push_bind(offset);

    let rows = qb.build().fetch_all(pool).await?;

    let mut hits = Vec::with_capacity(rows.len());
    for row in &rows {
        let file = file_from_row(row, false);
        let rank: Option<f64> = row.get("rank");
        let snippet: Option<String> = row.get("snippet");
        hits.push(FileHit {
            tags: tags::tags_for_file(pool, &file.id).await?,
            projects: projects::projects_for_file(pool, &file.id).await?,
            file,
            score: rank.map(|r| -r), // negate so higher = better
            snippet: snippet.filter(|s| !s.trim().is_empty()),
        });
    }
    Ok(hits)
}

/// CLI entry point: runs a search and prints the hits.
pub async fn run_search(config: &Config, query: &FileQuery) -> Result<()> {
    let pool = db::connect(config).await?;
    crate::migrate::migrate_pool(&pool).await?;
    let hits = search_files(&pool, query).await?;
    pool.close().await;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(hit.file.created_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let path = if hit.file.folder.is_empty() {
            hit.file.name.clone()
        } else {
            format!("{}/{}", hit.file.folder, hit.file.name)
        };
        match hit.score {
            Some(score) => println!("{}. [{:.2}] {}", i + 1, score, path),
            None => println!("{}. {}", i + 1, path),
        }
        println!("    added: {}  type: {}", date, hit.file.mime_type);
        if !hit.tags.is_empty() {
            println!("    tags: {}", hit.tags.join(", "));
        }
        if !hit.projects.is_empty() {
            println!("    projects: {}", hit.projects.join(", "));
        }
        if let Some(ref snippet) = hit.snippet {
            println!("    excerpt: \"{}\"", snippet.replace('\n', " ").trim());
        }
        println!("    id: {}", hit.file.id);
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::App;
    use crate::models::IndexDepth;
    use crate::storage::store_upload;

    #[test]
    fn sanitize_quotes_tokens() {
        assert_eq!(
            sanitize_fts_query("rust OR \"crab\"").as_deref(),
            Some("\"rust\" \"OR\" \"crab\"")
        );
        assert_eq!(sanitize_fts_query("deploy*").as_deref(), Some("\"deploy\"*"));
        assert_eq!(sanitize_fts_query("   "), None);
        assert_eq!(sanitize_fts_query("\"\""), None);
    }

    #[test]
    fn like_patterns_are_escaped() {
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
    }

    async fn seeded() -> (tempfile::TempDir, App, Vec<String>) {
        let (tmp, app) = App::test().await;
        let mut ids = Vec::new();
        for (name, folder, body) in [
            ("budget.txt", "work", "quarterly budget for the rust team"),
            ("trip.md", "personal", "packing list for the mountain trip"),
            ("minutes.txt", "work/meetings", "budget review meeting minutes"),
            ("photo.png", "personal", ""),
        ] {
            let out = store_upload(&app, name, folder, body.as_bytes(), IndexDepth::Standard)
                .await
                .unwrap();
            ids.push(out.file.id);
        }
        (tmp, app, ids)
    }

    #[tokio::test]
    async fn text_search_ranks_matches() {
        let (_tmp, app, ids) = seeded().await;
        let hits = search_files(
            &app.pool,
            &FileQuery {
                text: Some("budget".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let found: Vec<&str> = hits.iter().map(|h| h.file.id.as_str()).collect();
        assert_eq!(found.len(), 2);
        assert!(found.contains(&ids[0].as_str()));
        assert!(found.contains(&ids[2].as_str()));
        assert!(hits.iter().all(|h| h.score.is_some()));
        assert!(hits[0].snippet.as_deref().unwrap_or("").contains('['));
    }

    #[tokio::test]
    async fn empty_text_lists_everything_newest_first() {
        let (_tmp, app, _ids) = seeded().await;
        let hits = search_files(
            &app.pool,
            &FileQuery {
                text: Some("  ".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 4);
        assert!(hits.iter().all(|h| h.score.is_none()));
    }

    #[tokio::test]
    async fn folder_filter_with_and_without_subfolders() {
        let (_tmp, app, ids) = seeded().await;
        let only = search_files(
            &app.pool,
            &FileQuery {
                folder: Some("work".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].file.id, ids[0]);

        let tree = search_files(
            &app.pool,
            &FileQuery {
                folder: Some("work".into()),
                include_subfolders: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(tree.len(), 2);
    }

    #[tokio::test]
    async fn mime_family_filter() {
        let (_tmp, app, ids) = seeded().await;
        let hits = search_files(
            &app.pool,
            &FileQuery {
                mime: Some("image/*".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file.id, ids[3]);
    }

    #[tokio::test]
    async fn tags_require_all_projects_require_any() {
        let (_tmp, app, ids) = seeded().await;
        tags::assign_tag(&app.pool, &ids[0], "finance").await.unwrap();
        tags::assign_tag(&app.pool, &ids[0], "2024").await.unwrap();
        tags::assign_tag(&app.pool, &ids[2], "finance").await.unwrap();
        projects::create_project(&app.pool, "alpha", None).await.unwrap();
        projects::create_project(&app.pool, "beta", None).await.unwrap();
        projects::add_file(&app.pool, "alpha", &ids[1]).await.unwrap();
        projects::add_file(&app.pool, "beta", &ids[2]).await.unwrap();

        let both = search_files(
            &app.pool,
            &FileQuery {
                tags: vec!["Finance".into(), "2024".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].file.id, ids[0]);
        assert_eq!(both[0].tags, vec!["2024", "finance"]);

        let any = search_files(
            &app.pool,
            &FileQuery {
                projects: vec!["alpha".into(), "beta".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(any.len(), 2);

        let tagged_text = search_files(
            &app.pool,
            &FileQuery {
                text: Some("finance".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(tagged_text.len(), 2, "tag names are searchable");
    }

    #[tokio::test]
    async fn date_range_filters_created_at() {
        let (_tmp, app, ids) = seeded().await;
        sqlx::query("UPDATE files SET created_at = ? WHERE id = ?")
            .bind(parse_date("2020-01-15").unwrap().and_hms_opt(12, 0, 0).unwrap().and_utc().timestamp())
            .bind(&ids[1])
            .execute(&app.pool)
            .await
            .unwrap();

        let hits = search_files(
            &app.pool,
            &FileQuery {
                from: Some(parse_date("2020-01-15").unwrap()),
                to: Some(parse_date("2020-01-15").unwrap()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file.id, ids[1]);

        let bad = search_files(
            &app.pool,
            &FileQuery {
                from: Some(parse_date("2021-01-01").unwrap()),
                to: Some(parse_date("2020-01-01").unwrap()),
                ..Default::default()
            },
        )
        .await;
        assert!(bad.is_err());
    }
}
