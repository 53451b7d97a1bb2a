use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use database::SqliteDatabase;
use mcp_protocol::{FacadeConfig, McpServer, OrchestrationFacade, RateLimitConfig, TokenValidator};
use tracing::info;

use crate::config::Config;

/// Make sure the directory holding a file-backed database exists.
pub fn ensure_database_directory(config: &Config) -> Result<()> {
    let url = config.database_url();
    if url.contains(":memory:") {
        return Ok(());
    }
    let path = url.trim_start_matches("sqlite://");
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {parent:?}"))?;
            info!(?parent, "Created database directory");
        }
    }
    Ok(())
}

/// Connect, migrate, and wire the validator, facade and HTTP server.
pub async fn initialize_app(config: &Config) -> Result<McpServer> {
    let db = SqliteDatabase::connect(&config.database_url())
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;

    let repositories = db.repositories();

    spawn_cache_sweeper(repositories.context_cache.clone());

    let validator = Arc::new(TokenValidator::with_cache_ttl(
        repositories.tokens.clone(),
        RateLimitConfig {
            requests_per_minute: config.rate_limit.per_minute,
            requests_per_hour: config.rate_limit.per_hour,
            burst_limit: config.rate_limit.burst,
        },
        Duration::from_secs(config.token_cache.ttl_seconds),
    ));

    let facade = Arc::new(OrchestrationFacade::new(
        repositories,
        validator.clone(),
        FacadeConfig {
            cache_ttl_hours: config.context_cache.ttl_hours,
            cache_pressure_threshold: config.context_cache.pressure_threshold,
        },
    ));

    Ok(McpServer::new(facade, validator, config.auth.required))
}

/// Periodically drop expired and invalidated cache rows; the read-miss
/// path cleans up eagerly, this sweep catches entries nobody reads.
fn spawn_cache_sweeper(cache: Arc<dyn taskloom_core::ContextCacheRepository>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match cache.sweep(chrono::Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "Cache sweep removed dead entries"),
                Err(err) => tracing::warn!(error = %err, "Cache sweep failed"),
            }
        }
    });
}
