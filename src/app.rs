//! Shared application handle: configuration, database pool and task queues.

use anyhow::Result;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::workers::{Queues, Services, WorkerMode};

#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub queues: Queues,
}

impl App {
    /// Opens the database without starting workers; submitted tasks stay
    /// `PENDING` until a process with workers picks them up.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self {
            config: Arc::new(config),
            queues: Queues::detached(pool.clone()),
            pool,
        })
    }

    /// Opens the database and starts the workers `mode` asks for.
    pub async fn start(config: Config, mode: WorkerMode) -> Result<Self> {
        let services = Services::from_config(&config)?;
        Self::start_with(config, services, mode).await
    }

    pub async fn start_with(config: Config, services: Services, mode: WorkerMode) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::migrate_pool(&pool).await?;
        let config = Arc::new(config);
        let queues = Queues::start(config.clone(), pool.clone(), services, mode).await?;
        Ok(Self {
            config,
            pool,
            queues,
        })
    }

    #[cfg(test)]
    pub(crate) async fn test() -> (tempfile::TempDir, App) {
        let tmp = tempfile::TempDir::new().unwrap();
        let app = App::open(Config::minimal(tmp.path())).await.unwrap();
        (tmp, app)
    }

    #[cfg(test)]
    pub(crate) async fn test_with(services: Services) -> (tempfile::TempDir, App) {
        let tmp = tempfile::TempDir::new().unwrap();
        let app = App::start_with(Config::minimal(tmp.path()), services, WorkerMode::Resident)
            .await
            .unwrap();
        (tmp, app)
    }
}
