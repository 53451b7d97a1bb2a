//! SQLite API-token repository. Only token hashes ever touch this table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use taskloom_core::{
    error::{Result, TaskError},
    repository::TokenRepository,
    token::ApiToken,
};
use uuid::Uuid;

use crate::common::{parse_datetime, parse_datetime_opt, parse_json, parse_uuid, sqlx_error_to_task_error};

/// SQLite implementation of [`TokenRepository`].
#[derive(Debug, Clone)]
pub struct SqliteTokenRepository {
    pool: SqlitePool,
}

impl SqliteTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_token(row: &SqliteRow) -> Result<ApiToken> {
        Ok(ApiToken {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            user_id: row.get("user_id"),
            name: row.get("name"),
            token_hash: row.get("token_hash"),
            scopes: parse_json(&row.get::<String, _>("scopes"), "scopes")?,
            rate_limit: row.get::<i64, _>("rate_limit") as u32,
            expires_at: parse_datetime_opt(row.get("expires_at"))?,
            last_used_at: parse_datetime_opt(row.get("last_used_at"))?,
            usage_count: row.get("usage_count"),
            is_active: row.get::<i64, _>("is_active") != 0,
            metadata: parse_json(&row.get::<String, _>("metadata"), "metadata")?,
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
        })
    }
}

#[async_trait]
impl TokenRepository for SqliteTokenRepository {
    async fn create(&self, token: ApiToken) -> Result<ApiToken> {
        if token.name.trim().is_empty() {
            return Err(TaskError::empty_field("name"));
        }

        sqlx::query(
            r#"
            INSERT INTO api_tokens (
                id, user_id, name, token_hash, scopes, rate_limit, expires_at,
                last_used_at, usage_count, is_active, metadata, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(token.id.to_string())
        .bind(&token.user_id)
        .bind(&token.name)
        .bind(&token.token_hash)
        .bind(serde_json::to_string(&token.scopes)?)
        .bind(token.rate_limit as i64)
        .bind(token.expires_at.map(|d| d.to_rfc3339()))
        .bind(token.last_used_at.map(|d| d.to_rfc3339()))
        .bind(token.usage_count)
        .bind(token.is_active as i64)
        .bind(serde_json::to_string(&token.metadata)?)
        .bind(token.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        Ok(token)
    }

    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>> {
        let row = sqlx::query("SELECT * FROM api_tokens WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_token).transpose()
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ApiToken>> {
        let row = sqlx::query("SELECT * FROM api_tokens WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_token).transpose()
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ApiToken>> {
        let rows = sqlx::query("SELECT * FROM api_tokens WHERE user_id = ? ORDER BY created_at ASC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(Self::row_to_token).collect()
    }

    async fn save(&self, token: ApiToken) -> Result<ApiToken> {
        // Tokens are immutable except for usage tracking and active state.
        let result = sqlx::query(
            r#"
            UPDATE api_tokens SET last_used_at = ?, usage_count = ?, is_active = ?
            WHERE id = ?
            "#,
        )
        .bind(token.last_used_at.map(|d| d.to_rfc3339()))
        .bind(token.usage_count)
        .bind(token.is_active as i64)
        .bind(token.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        if result.rows_affected() == 0 {
            return Err(TaskError::not_found("Token", token.id));
        }
        Ok(token)
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE api_tokens SET usage_count = usage_count + 1, last_used_at = ? WHERE id = ?",
        )
        .bind(at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM api_tokens WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE api_tokens SET is_active = 0 WHERE is_active = 1 AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(result.rows_affected())
    }
}
