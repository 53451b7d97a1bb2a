//! SQLite persistence for the taskloom orchestration service.
//!
//! Provides sqlx-backed implementations of every repository trait in
//! `taskloom-core`, plus pool construction and migrations.

mod common;
mod contexts;
mod events;
mod projects;
mod tasks;
mod tokens;

pub use contexts::{SqliteContextCacheRepository, SqliteContextRepository, SqliteDelegationRepository};
pub use events::SqliteEventStore;
pub use projects::{SqliteAgentRepository, SqliteBranchRepository, SqliteProjectRepository};
pub use tasks::{SqliteSubtaskRepository, SqliteTaskRepository};
pub use tokens::SqliteTokenRepository;

use std::sync::Arc;

use sqlx::{migrate::MigrateDatabase, Sqlite, SqlitePool};
use taskloom_core::{
    error::{Result, TaskError},
    repository::Repositories,
};

/// Connection-pool wrapper with migration support.
///
/// File databases run in WAL mode; `:memory:` keeps the in-memory journal
/// for tests.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Connect (creating the database file when missing).
    ///
    /// # Arguments
    /// * `database_url` - SQLite URL (`sqlite://path.sqlite` or `:memory:`)
    pub async fn connect(database_url: &str) -> Result<Self> {
        let db_url = if database_url.starts_with(":memory:") || database_url.starts_with("sqlite:")
        {
            database_url.to_string()
        } else {
            format!("sqlite://{database_url}")
        };

        if !db_url.contains(":memory:") && !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            Sqlite::create_database(&db_url).await.map_err(|e| {
                TaskError::Database(format!("Failed to create database: {e}"))
            })?;
            tracing::info!("Database created successfully");
        }

        let in_memory = db_url.contains(":memory:");
        let options = if in_memory {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(":memory:")
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Memory)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        } else {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(db_url.replace("sqlite://", ""))
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        };

        // An in-memory database exists per connection, so the pool must
        // stay at exactly one connection or migrations and queries would
        // see different databases.
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(options)
            .await
            .map_err(common::sqlx_error_to_task_error)?;

        Ok(Self { pool })
    }

    /// Apply all pending migrations. Safe to call repeatedly.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| TaskError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Build the full (tenant-agnostic) repository set over this pool.
    pub fn repositories(&self) -> Repositories {
        Repositories {
            tasks: Arc::new(SqliteTaskRepository::new(self.pool.clone())),
            subtasks: Arc::new(SqliteSubtaskRepository::new(self.pool.clone())),
            projects: Arc::new(SqliteProjectRepository::new(self.pool.clone())),
            branches: Arc::new(SqliteBranchRepository::new(self.pool.clone())),
            agents: Arc::new(SqliteAgentRepository::new(self.pool.clone())),
            contexts: Arc::new(SqliteContextRepository::new(self.pool.clone())),
            delegations: Arc::new(SqliteDelegationRepository::new(self.pool.clone())),
            context_cache: Arc::new(SqliteContextCacheRepository::new(self.pool.clone())),
            tokens: Arc::new(SqliteTokenRepository::new(self.pool.clone())),
            events: Arc::new(SqliteEventStore::new(self.pool.clone())),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
