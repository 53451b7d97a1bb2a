use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};
use taskloom_core::{
    error::{Result, TaskError},
    models::{Priority, TaskStatus},
};
use uuid::Uuid;

/// Parse a TEXT uuid column.
pub fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| TaskError::Database(format!("Invalid uuid in database: '{value}': {e}")))
}

/// Parse an optional TEXT uuid column.
pub fn parse_uuid_opt(value: Option<String>) -> Result<Option<Uuid>> {
    value.as_deref().map(parse_uuid).transpose()
}

/// Parse a TEXT status column.
pub fn parse_status(value: &str) -> Result<TaskStatus> {
    value
        .parse()
        .map_err(|e: String| TaskError::Database(format!("Invalid status in database: {e}")))
}

/// Priority is stored as its numeric level (1..=5).
pub fn parse_priority(level: i64) -> Result<Priority> {
    u8::try_from(level)
        .ok()
        .and_then(Priority::from_level)
        .ok_or_else(|| TaskError::Database(format!("Invalid priority level in database: {level}")))
}

/// Parse a RFC 3339 TEXT timestamp column.
pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TaskError::Database(format!("Invalid timestamp in database: '{value}': {e}")))
}

pub fn parse_datetime_opt(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_datetime).transpose()
}

/// Parse a JSON-typed TEXT column into any deserialisable value.
pub fn parse_json<T: serde::de::DeserializeOwned>(value: &str, column: &str) -> Result<T> {
    serde_json::from_str(value)
        .map_err(|e| TaskError::Database(format!("Invalid JSON in column '{column}': {e}")))
}

/// Read a string-list JSON column, defaulting to empty on NULL.
pub fn get_string_list(row: &SqliteRow, column: &str) -> Vec<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Convert a sqlx error to the domain error type, classifying unique
/// constraint violations as duplicate names.
pub fn sqlx_error_to_task_error(err: sqlx::Error) -> TaskError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            if message.contains("UNIQUE constraint failed") {
                let field = message
                    .rsplit("failed: ")
                    .next()
                    .unwrap_or("unknown")
                    .to_string();
                TaskError::DuplicateName(field)
            } else {
                TaskError::Database(format!("Database constraint error: {message}"))
            }
        }
        sqlx::Error::RowNotFound => {
            // Absence is handled at the application level; reaching here
            // means a query shape bug.
            TaskError::Database("Unexpected RowNotFound error".to_string())
        }
        sqlx::Error::PoolTimedOut => TaskError::Database("Connection pool timeout".to_string()),
        sqlx::Error::Io(io_err) => TaskError::Database(format!("Database I/O error: {io_err}")),
        _ => TaskError::Database(format!("Database operation failed: {err}")),
    }
}
