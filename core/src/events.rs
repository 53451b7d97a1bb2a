//! Append-only domain event log.
//!
//! Every state change of interest is appended as a [`StoredEvent`];
//! snapshots share the same table with a `{type}Snapshot` suffix and
//! `metadata.is_snapshot = true`. Aggregate replay starts from the latest
//! snapshot and applies subsequent events in version order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Result;
use crate::models::TaskStatus;

/// A persisted event with its envelope metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_data: Value,
    pub aggregate_id: Option<Uuid>,
    pub aggregate_type: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub version: i64,
    pub metadata: Option<Value>,
}

impl StoredEvent {
    /// Build a new event for an aggregate at a given version.
    pub fn new(
        event_type: impl Into<String>,
        event_data: Value,
        aggregate_id: Option<Uuid>,
        aggregate_type: Option<&str>,
        version: i64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            event_data,
            aggregate_id,
            aggregate_type: aggregate_type.map(String::from),
            timestamp: Utc::now(),
            version,
            metadata: None,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("is_snapshot"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Filter criteria for querying events; fields combine with AND.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub aggregate_id: Option<Uuid>,
    pub event_type: Option<String>,
    pub from_timestamp: Option<DateTime<Utc>>,
    pub to_timestamp: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

/// Event persistence interface.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event; returns its id.
    async fn append(&self, event: StoredEvent) -> Result<Uuid>;

    /// Query events, newest first.
    async fn get(&self, filter: EventFilter) -> Result<Vec<StoredEvent>>;

    /// All events for one aggregate in ascending version order, optionally
    /// starting after `from_version`.
    async fn get_aggregate(
        &self,
        aggregate_id: Uuid,
        from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>>;

    /// Store an aggregate snapshot; returns the snapshot event id.
    async fn snapshot(
        &self,
        aggregate_id: Uuid,
        aggregate_type: &str,
        data: Value,
        version: i64,
    ) -> Result<Uuid> {
        let mut event = StoredEvent::new(
            format!("{aggregate_type}Snapshot"),
            data,
            Some(aggregate_id),
            Some(aggregate_type),
            version,
        );
        event.metadata = Some(json!({"is_snapshot": true}));
        self.append(event).await
    }

    /// The most recent snapshot for an aggregate, if any.
    async fn latest_snapshot(&self, aggregate_id: Uuid) -> Result<Option<StoredEvent>>;

    /// Replay an aggregate: latest snapshot (if present) plus every later
    /// event, in order.
    async fn replay(&self, aggregate_id: Uuid) -> Result<Vec<StoredEvent>> {
        match self.latest_snapshot(aggregate_id).await? {
            Some(snapshot) => {
                let from = snapshot.version;
                let mut events = vec![snapshot];
                events.extend(self.get_aggregate(aggregate_id, Some(from)).await?);
                Ok(events)
            }
            None => self.get_aggregate(aggregate_id, None).await,
        }
    }

    /// Remove every event. Reserved for test harnesses.
    async fn clear(&self) -> Result<()>;
}

// Constructors for the event types the orchestration core emits. Kept as
// plain functions so components never depend on each other's modules just
// to raise an event.

pub fn task_created(task_id: Uuid, title: &str, user_id: &str, version: i64) -> StoredEvent {
    StoredEvent::new(
        "TaskCreated",
        json!({"task_id": task_id, "title": title, "user_id": user_id}),
        Some(task_id),
        Some("Task"),
        version,
    )
}

pub fn task_state_changed(
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    user_id: &str,
    version: i64,
) -> StoredEvent {
    StoredEvent::new(
        "TaskStateChanged",
        json!({
            "task_id": task_id,
            "from": from.as_str(),
            "to": to.as_str(),
            "user_id": user_id,
        }),
        Some(task_id),
        Some("Task"),
        version,
    )
}

pub fn task_completed(task_id: Uuid, completion_summary: &str, user_id: &str, version: i64) -> StoredEvent {
    StoredEvent::new(
        "TaskCompleted",
        json!({
            "task_id": task_id,
            "completion_summary": completion_summary,
            "user_id": user_id,
        }),
        Some(task_id),
        Some("Task"),
        version,
    )
}

pub fn context_delegated(
    delegation_id: Uuid,
    target_id: Uuid,
    applied: bool,
    user_id: &str,
) -> StoredEvent {
    StoredEvent::new(
        "ContextDelegated",
        json!({
            "delegation_id": delegation_id,
            "target_id": target_id,
            "applied": applied,
            "user_id": user_id,
        }),
        Some(target_id),
        Some("Context"),
        1,
    )
}

pub fn hint_generated(hint_id: Uuid, task_id: Uuid, rule_name: &str, user_id: &str) -> StoredEvent {
    StoredEvent::new(
        "HintGenerated",
        json!({
            "hint_id": hint_id,
            "task_id": task_id,
            "rule": rule_name,
            "user_id": user_id,
        }),
        Some(task_id),
        Some("Task"),
        1,
    )
}

pub fn hint_accepted(hint_id: Uuid, task_id: Uuid, rule_name: &str, user_id: &str) -> StoredEvent {
    StoredEvent::new(
        "HintAccepted",
        json!({"hint_id": hint_id, "task_id": task_id, "rule": rule_name, "user_id": user_id}),
        Some(task_id),
        Some("Task"),
        1,
    )
}

pub fn hint_dismissed(
    hint_id: Uuid,
    task_id: Uuid,
    rule_name: &str,
    reason: Option<&str>,
    user_id: &str,
) -> StoredEvent {
    StoredEvent::new(
        "HintDismissed",
        json!({
            "hint_id": hint_id,
            "task_id": task_id,
            "rule": rule_name,
            "reason": reason,
            "user_id": user_id,
        }),
        Some(task_id),
        Some("Task"),
        1,
    )
}

pub fn hint_feedback(
    hint_id: Uuid,
    task_id: Uuid,
    rule_name: &str,
    helpful: bool,
    user_id: &str,
) -> StoredEvent {
    StoredEvent::new(
        "HintFeedbackProvided",
        json!({
            "hint_id": hint_id,
            "task_id": task_id,
            "rule": rule_name,
            "helpful": helpful,
            "user_id": user_id,
        }),
        Some(task_id),
        Some("Task"),
        1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_construction() {
        let task_id = Uuid::new_v4();
        let event = task_state_changed(task_id, TaskStatus::Todo, TaskStatus::InProgress, "u1", 2);
        assert_eq!(event.event_type, "TaskStateChanged");
        assert_eq!(event.aggregate_id, Some(task_id));
        assert_eq!(event.aggregate_type.as_deref(), Some("Task"));
        assert_eq!(event.event_data["from"], "todo");
        assert_eq!(event.event_data["to"], "in_progress");
        assert_eq!(event.version, 2);
        assert!(!event.is_snapshot());
    }

    #[test]
    fn test_snapshot_marker() {
        let mut event = StoredEvent::new("TaskSnapshot", json!({}), Some(Uuid::new_v4()), Some("Task"), 7);
        assert!(!event.is_snapshot());
        event.metadata = Some(json!({"is_snapshot": true}));
        assert!(event.is_snapshot());
    }
}
