//! SQLite event store: one append-only table shared by events and
//! snapshots.

use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use taskloom_core::{
    error::Result,
    events::{EventFilter, EventStore, StoredEvent},
};
use uuid::Uuid;

use crate::common::{parse_datetime, parse_uuid, parse_uuid_opt, sqlx_error_to_task_error};

/// SQLite implementation of [`EventStore`].
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

impl SqliteEventStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_event(row: &SqliteRow) -> Result<StoredEvent> {
        let metadata: Option<String> = row.get("metadata");
        Ok(StoredEvent {
            event_id: parse_uuid(&row.get::<String, _>("event_id"))?,
            event_type: row.get("event_type"),
            event_data: serde_json::from_str(&row.get::<String, _>("event_data"))?,
            aggregate_id: parse_uuid_opt(row.get("aggregate_id"))?,
            aggregate_type: row.get("aggregate_type"),
            timestamp: parse_datetime(&row.get::<String, _>("timestamp"))?,
            version: row.get("version"),
            metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append(&self, event: StoredEvent) -> Result<Uuid> {
        sqlx::query(
            r#"
            INSERT INTO events (
                event_id, event_type, event_data, aggregate_id, aggregate_type,
                timestamp, version, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(&event.event_type)
        .bind(serde_json::to_string(&event.event_data)?)
        .bind(event.aggregate_id.map(|id| id.to_string()))
        .bind(&event.aggregate_type)
        .bind(event.timestamp.to_rfc3339())
        .bind(event.version)
        .bind(
            event
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        Ok(event.event_id)
    }

    async fn get(&self, filter: EventFilter) -> Result<Vec<StoredEvent>> {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new("SELECT * FROM events WHERE 1=1");

        if let Some(aggregate_id) = filter.aggregate_id {
            builder.push(" AND aggregate_id = ");
            builder.push_bind(aggregate_id.to_string());
        }
        if let Some(event_type) = filter.event_type {
            builder.push(" AND event_type = ");
            builder.push_bind(event_type);
        }
        if let Some(from) = filter.from_timestamp {
            builder.push(" AND timestamp >= ");
            builder.push_bind(from.to_rfc3339());
        }
        if let Some(to) = filter.to_timestamp {
            builder.push(" AND timestamp <= ");
            builder.push_bind(to.to_rfc3339());
        }

        builder.push(" ORDER BY timestamp DESC");
        builder.push(" LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(100) as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn get_aggregate(
        &self,
        aggregate_id: Uuid,
        from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>> {
        let rows = match from_version {
            Some(version) => {
                sqlx::query(
                    "SELECT * FROM events WHERE aggregate_id = ? AND version > ? ORDER BY version ASC, timestamp ASC",
                )
                .bind(aggregate_id.to_string())
                .bind(version)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM events WHERE aggregate_id = ? ORDER BY version ASC, timestamp ASC",
                )
                .bind(aggregate_id.to_string())
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn latest_snapshot(&self, aggregate_id: Uuid) -> Result<Option<StoredEvent>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM events
            WHERE aggregate_id = ? AND event_type LIKE '%Snapshot'
            ORDER BY timestamp DESC LIMIT 1
            "#,
        )
        .bind(aggregate_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_event).transpose()
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM events")
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        tracing::warn!("All events cleared from event store");
        Ok(())
    }
}
