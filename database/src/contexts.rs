//! SQLite repositories for context rows, delegations and the resolved
//! context cache.
//!
//! Context rows store the full record as a JSON payload keyed by
//! `(level, context_id, user_id)`; the typed columns exist for lookups
//! and hierarchy walks only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use taskloom_core::{
    context::{ContextCacheEntry, ContextDelegation, ContextLevel, ContextRecord, TriggerType},
    error::{Result, TaskError},
    repository::{ContextCacheRepository, ContextRepository, DelegationRepository},
};
use uuid::Uuid;

use crate::common::{parse_datetime, parse_datetime_opt, parse_json, parse_uuid, sqlx_error_to_task_error};

/// SQLite implementation of [`ContextRepository`].
#[derive(Debug, Clone)]
pub struct SqliteContextRepository {
    pool: SqlitePool,
}

impl SqliteContextRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &SqliteRow) -> Result<ContextRecord> {
        let payload: String = row.get("payload");
        parse_json(&payload, "payload")
    }
}

#[async_trait]
impl ContextRepository for SqliteContextRepository {
    async fn get(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
    ) -> Result<Option<ContextRecord>> {
        let row = sqlx::query(
            "SELECT payload FROM contexts WHERE level = ? AND context_id = ? AND user_id = ?",
        )
        .bind(level.as_str())
        .bind(context_id.to_string())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn get_shared(
        &self,
        level: ContextLevel,
        context_id: Uuid,
    ) -> Result<Option<ContextRecord>> {
        let row = sqlx::query(
            "SELECT payload FROM contexts WHERE level = ? AND context_id = ? AND user_id IS NULL",
        )
        .bind(level.as_str())
        .bind(context_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn upsert(&self, record: ContextRecord) -> Result<ContextRecord> {
        let payload = serde_json::to_string(&record)?;
        let parent_id = record.parent().map(|(_, id)| id.to_string());
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO contexts (row_id, level, context_id, parent_id, user_id, version, payload, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (level, context_id, user_id) DO UPDATE SET
                parent_id = excluded.parent_id,
                version = excluded.version,
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.row_id().to_string())
        .bind(record.level().as_str())
        .bind(record.context_id().to_string())
        .bind(parent_id)
        .bind(record.user_id())
        .bind(record.version())
        .bind(payload)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        Ok(record)
    }

    async fn delete(&self, level: ContextLevel, context_id: Uuid, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM contexts WHERE level = ? AND context_id = ? AND user_id = ?")
            .bind(level.as_str())
            .bind(context_id.to_string())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    async fn children(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
    ) -> Result<Vec<ContextRecord>> {
        let child_level = match level {
            ContextLevel::Global => ContextLevel::Project,
            ContextLevel::Project => ContextLevel::Branch,
            ContextLevel::Branch => ContextLevel::Task,
            ContextLevel::Task => return Ok(vec![]),
        };

        // Every project context hangs off the per-user global singleton,
        // so the global's children are simply all project rows.
        let rows = if level == ContextLevel::Global {
            sqlx::query("SELECT payload FROM contexts WHERE level = ? AND user_id = ?")
                .bind(child_level.as_str())
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query(
                "SELECT payload FROM contexts WHERE level = ? AND parent_id = ? AND user_id = ?",
            )
            .bind(child_level.as_str())
            .bind(context_id.to_string())
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(sqlx_error_to_task_error)?;

        rows.iter().map(Self::row_to_record).collect()
    }
}

/// SQLite implementation of [`DelegationRepository`].
#[derive(Debug, Clone)]
pub struct SqliteDelegationRepository {
    pool: SqlitePool,
}

impl SqliteDelegationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_delegation(row: &SqliteRow) -> Result<ContextDelegation> {
        let source_level: String = row.get("source_level");
        let target_level: String = row.get("target_level");
        let trigger: String = row.get("trigger_type");
        Ok(ContextDelegation {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            source_level: source_level.parse::<ContextLevel>().map_err(TaskError::Database)?,
            source_id: parse_uuid(&row.get::<String, _>("source_id"))?,
            target_level: target_level.parse::<ContextLevel>().map_err(TaskError::Database)?,
            target_id: parse_uuid(&row.get::<String, _>("target_id"))?,
            delegated_data: parse_json(&row.get::<String, _>("delegated_data"), "delegated_data")?,
            delegation_reason: row.get("delegation_reason"),
            trigger_type: trigger.parse::<TriggerType>().map_err(TaskError::Database)?,
            auto_delegated: row.get::<i64, _>("auto_delegated") != 0,
            confidence_score: row.get("confidence_score"),
            processed: row.get::<i64, _>("processed") != 0,
            approved: row.get::<Option<i64>, _>("approved").map(|v| v != 0),
            user_id: row.get("user_id"),
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            processed_at: parse_datetime_opt(row.get("processed_at"))?,
        })
    }

    async fn write(&self, delegation: &ContextDelegation, insert: bool) -> Result<()> {
        let sql = if insert {
            r#"
            INSERT INTO context_delegations (
                id, source_level, source_id, target_level, target_id, delegated_data,
                delegation_reason, trigger_type, auto_delegated, confidence_score,
                processed, approved, user_id, created_at, processed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        } else {
            r#"
            UPDATE context_delegations SET
                source_level = ?2, source_id = ?3, target_level = ?4, target_id = ?5,
                delegated_data = ?6, delegation_reason = ?7, trigger_type = ?8,
                auto_delegated = ?9, confidence_score = ?10, processed = ?11,
                approved = ?12, user_id = ?13, created_at = ?14, processed_at = ?15
            WHERE id = ?1
            "#
        };

        sqlx::query(sql)
            .bind(delegation.id.to_string())
            .bind(delegation.source_level.as_str())
            .bind(delegation.source_id.to_string())
            .bind(delegation.target_level.as_str())
            .bind(delegation.target_id.to_string())
            .bind(serde_json::to_string(&delegation.delegated_data)?)
            .bind(&delegation.delegation_reason)
            .bind(delegation.trigger_type.as_str())
            .bind(delegation.auto_delegated as i64)
            .bind(delegation.confidence_score)
            .bind(delegation.processed as i64)
            .bind(delegation.approved.map(|v| v as i64))
            .bind(&delegation.user_id)
            .bind(delegation.created_at.to_rfc3339())
            .bind(delegation.processed_at.map(|d| d.to_rfc3339()))
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }
}

#[async_trait]
impl DelegationRepository for SqliteDelegationRepository {
    async fn create(&self, delegation: ContextDelegation) -> Result<ContextDelegation> {
        self.write(&delegation, true).await?;
        Ok(delegation)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ContextDelegation>> {
        let row = sqlx::query("SELECT * FROM context_delegations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_delegation).transpose()
    }

    async fn list(&self, user_id: &str, processed: Option<bool>) -> Result<Vec<ContextDelegation>> {
        let rows = match processed {
            Some(processed) => {
                sqlx::query(
                    "SELECT * FROM context_delegations WHERE user_id = ? AND processed = ? ORDER BY created_at ASC",
                )
                .bind(user_id)
                .bind(processed as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM context_delegations WHERE user_id = ? ORDER BY created_at ASC",
                )
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(Self::row_to_delegation).collect()
    }

    async fn save(&self, delegation: ContextDelegation) -> Result<ContextDelegation> {
        self.write(&delegation, false).await?;
        Ok(delegation)
    }
}

/// SQLite implementation of [`ContextCacheRepository`].
#[derive(Debug, Clone)]
pub struct SqliteContextCacheRepository {
    pool: SqlitePool,
}

impl SqliteContextCacheRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &SqliteRow) -> Result<ContextCacheEntry> {
        let level: String = row.get("context_level");
        let parent_chain: Vec<String> =
            parse_json(&row.get::<String, _>("parent_chain"), "parent_chain")?;
        Ok(ContextCacheEntry {
            context_id: parse_uuid(&row.get::<String, _>("context_id"))?,
            context_level: level.parse::<ContextLevel>().map_err(TaskError::Database)?,
            resolved_context: parse_json(
                &row.get::<String, _>("resolved_context"),
                "resolved_context",
            )?,
            dependencies_hash: row.get("dependencies_hash"),
            resolution_path: parse_json(
                &row.get::<String, _>("resolution_path"),
                "resolution_path",
            )?,
            parent_chain: parent_chain
                .iter()
                .map(|s| parse_uuid(s))
                .collect::<Result<Vec<_>>>()?,
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            expires_at: parse_datetime(&row.get::<String, _>("expires_at"))?,
            hit_count: row.get("hit_count"),
            last_hit: parse_datetime(&row.get::<String, _>("last_hit"))?,
            cache_size_bytes: row.get("cache_size_bytes"),
            invalidated: row.get::<i64, _>("invalidated") != 0,
            invalidation_reason: row.get("invalidation_reason"),
            user_id: row.get("user_id"),
        })
    }
}

#[async_trait]
impl ContextCacheRepository for SqliteContextCacheRepository {
    async fn get(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
    ) -> Result<Option<ContextCacheEntry>> {
        let row = sqlx::query(
            "SELECT * FROM context_inheritance_cache WHERE context_id = ? AND context_level = ? AND user_id = ?",
        )
        .bind(context_id.to_string())
        .bind(level.as_str())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn upsert(&self, entry: ContextCacheEntry) -> Result<()> {
        let parent_chain: Vec<String> =
            entry.parent_chain.iter().map(|id| id.to_string()).collect();

        sqlx::query(
            r#"
            INSERT INTO context_inheritance_cache (
                context_id, context_level, user_id, resolved_context, dependencies_hash,
                resolution_path, parent_chain, created_at, expires_at, hit_count, last_hit,
                cache_size_bytes, invalidated, invalidation_reason
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (context_id, context_level, user_id) DO UPDATE SET
                resolved_context = excluded.resolved_context,
                dependencies_hash = excluded.dependencies_hash,
                resolution_path = excluded.resolution_path,
                parent_chain = excluded.parent_chain,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                hit_count = excluded.hit_count,
                last_hit = excluded.last_hit,
                cache_size_bytes = excluded.cache_size_bytes,
                invalidated = excluded.invalidated,
                invalidation_reason = excluded.invalidation_reason
            "#,
        )
        .bind(entry.context_id.to_string())
        .bind(entry.context_level.as_str())
        .bind(&entry.user_id)
        .bind(serde_json::to_string(&entry.resolved_context)?)
        .bind(&entry.dependencies_hash)
        .bind(serde_json::to_string(&entry.resolution_path)?)
        .bind(serde_json::to_string(&parent_chain)?)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.expires_at.to_rfc3339())
        .bind(entry.hit_count)
        .bind(entry.last_hit.to_rfc3339())
        .bind(entry.cache_size_bytes)
        .bind(entry.invalidated as i64)
        .bind(&entry.invalidation_reason)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    async fn record_hit(&self, level: ContextLevel, context_id: Uuid, user_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE context_inheritance_cache SET hit_count = hit_count + 1, last_hit = ?
            WHERE context_id = ? AND context_level = ? AND user_id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(context_id.to_string())
        .bind(level.as_str())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    async fn invalidate(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
        reason: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE context_inheritance_cache SET invalidated = 1, invalidation_reason = ?
            WHERE context_id = ? AND context_level = ? AND user_id = ? AND invalidated = 0
            "#,
        )
        .bind(reason)
        .bind(context_id.to_string())
        .bind(level.as_str())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(result.rows_affected())
    }

    async fn invalidate_descendants(
        &self,
        ancestor_id: Uuid,
        user_id: &str,
        reason: &str,
    ) -> Result<u64> {
        // parent_chain is a JSON array of uuid strings; a containment
        // check on the quoted id is sufficient and uses no extension.
        let needle = format!("%\"{ancestor_id}\"%");
        let result = sqlx::query(
            r#"
            UPDATE context_inheritance_cache SET invalidated = 1, invalidation_reason = ?
            WHERE user_id = ? AND invalidated = 0 AND parent_chain LIKE ?
            "#,
        )
        .bind(reason)
        .bind(user_id)
        .bind(needle)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(result.rows_affected())
    }

    async fn invalidate_all(&self, user_id: &str, reason: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE context_inheritance_cache SET invalidated = 1, invalidation_reason = ?
            WHERE user_id = ? AND invalidated = 0
            "#,
        )
        .bind(reason)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(result.rows_affected())
    }

    async fn remove(&self, level: ContextLevel, context_id: Uuid, user_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM context_inheritance_cache WHERE context_id = ? AND context_level = ? AND user_id = ?",
        )
        .bind(context_id.to_string())
        .bind(level.as_str())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM context_inheritance_cache WHERE invalidated = 1 OR expires_at <= ?",
        )
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(result.rows_affected())
    }

    async fn count(&self, user_id: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM context_inheritance_cache WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(row.get::<i64, _>("n") as u64)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ContextCacheEntry>> {
        let rows = sqlx::query("SELECT * FROM context_inheritance_cache WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(Self::row_to_entry).collect()
    }
}
