//! Tool-call parameter types and the canonical response envelope.
//!
//! Every `manage_*` tool accepts an `action` plus action-specific fields;
//! the structs here are the typed shapes the facade deserialises request
//! arguments into. The envelope helpers build the stable success/failure
//! documents of the RPC surface.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::TaskError;
use crate::models::{Priority, TaskStatus};

/// Success envelope: `{success, data, workflow_guidance?, meta?}`.
pub fn success(data: Value) -> Value {
    json!({"success": true, "data": data})
}

/// Success with workflow-guidance enrichment (success paths only).
pub fn success_with_guidance(data: Value, guidance: Value) -> Value {
    json!({"success": true, "data": data, "workflow_guidance": guidance})
}

/// Failure envelope with the stable error code, plus field metadata for
/// missing-field errors. Infrastructure detail never leaks: those map to
/// a generic message with a correlation id for the logs.
pub fn failure(operation: &str, error: &TaskError) -> Value {
    let (message, metadata) = match error {
        TaskError::MissingField {
            field,
            expected,
            hint,
        } => (
            error.to_string(),
            json!({"field": field, "expected": expected, "hint": hint}),
        ),
        TaskError::DependenciesUnsatisfied { task_id, blockers } => (
            error.to_string(),
            json!({"task_id": task_id, "blockers": blockers}),
        ),
        err if err.is_infrastructure() => {
            let correlation_id = Uuid::new_v4();
            tracing::error!(%correlation_id, error = %err, operation, "Infrastructure failure");
            (
                "An internal error occurred".to_string(),
                json!({"correlation_id": correlation_id}),
            )
        }
        err => (err.to_string(), json!({})),
    };

    json!({
        "success": false,
        "error": {"message": message, "code": error.code().as_str()},
        "operation": operation,
        "metadata": metadata,
    })
}

/// Simple next-step guidance attached to successful mutations.
pub fn guidance(next_actions: &[&str]) -> Value {
    json!({"next_actions": next_actions})
}

// -- manage_task ---------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskParams {
    pub branch_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub details: Option<String>,
    pub estimated_effort: Option<String>,
    pub due_date: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateTaskParams {
    pub task_id: Uuid,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub details: Option<String>,
    pub estimated_effort: Option<String>,
    pub due_date: Option<chrono::DateTime<chrono::Utc>>,
    pub testing_notes: Option<String>,
    pub assignees: Option<Vec<String>>,
    pub labels: Option<Vec<String>>,
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetTaskParams {
    pub task_id: Uuid,
    #[serde(default)]
    pub include_context: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListTasksParams {
    pub branch_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchTasksParams {
    pub query: String,
    #[serde(flatten)]
    pub filter: ListTasksParams,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NextTaskParams {
    pub assignee: Option<String>,
    pub project_id: Option<Uuid>,
    pub branch_id: Option<Uuid>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub include_context: bool,
    /// Optional hint-type filter for the enrichment (`recommendation`,
    /// `warning`, `opportunity`, `blocker`).
    #[serde(default)]
    pub hint_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteTaskParams {
    pub task_id: Uuid,
    pub completion_summary: Option<String>,
    pub testing_notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteTaskParams {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DependencyParams {
    pub task_id: Uuid,
    pub depends_on_task_id: Uuid,
}

// -- manage_subtask ------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubtaskParams {
    pub task_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignees: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSubtaskParams {
    pub subtask_id: Uuid,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assignees: Option<Vec<String>>,
    pub progress_percentage: Option<f64>,
    pub progress_notes: Option<String>,
    pub blockers: Option<String>,
    pub insights_found: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetSubtaskParams {
    pub subtask_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListSubtasksParams {
    pub task_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompleteSubtaskParams {
    pub subtask_id: Uuid,
    pub completion_summary: Option<String>,
    pub impact_on_parent: Option<String>,
}

// -- manage_project ------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectParams {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectIdParams {
    pub project_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateProjectParams {
    pub project_id: Uuid,
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBranchParams {
    pub project_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

// -- manage_context ------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ContextParams {
    pub level: String,
    pub context_id: Option<Uuid>,
    #[serde(default)]
    pub data: Value,
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelegateContextParams {
    pub source_level: String,
    pub source_id: Uuid,
    pub target_level: String,
    pub target_id: Uuid,
    pub data: Value,
    #[serde(default)]
    pub reason: String,
    pub trigger_type: Option<String>,
    pub confidence_score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddInsightParams {
    pub task_id: Uuid,
    pub content: String,
    #[serde(default = "default_insight_category")]
    pub category: String,
}

fn default_insight_category() -> String {
    "insight".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddProgressParams {
    pub task_id: Uuid,
    pub content: String,
    pub progress_percentage: Option<f64>,
}

// -- manage_agent --------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterAgentParams {
    pub project_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentIdParams {
    pub agent_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignAgentParams {
    pub agent_id: Uuid,
    pub branch_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnassignAgentParams {
    pub branch_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateAgentParams {
    pub agent_id: Uuid,
    pub name: Option<String>,
    pub description: Option<String>,
    pub role: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub status: Option<String>,
    pub availability_score: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListAgentsParams {
    pub project_id: Uuid,
}

// -- manage_token --------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTokenParams {
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub rate_limit: Option<u32>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenIdParams {
    pub token_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateTokenParams {
    pub token: String,
}

// -- hints (enrichment of manage_task) -----------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct HintFeedbackParams {
    pub hint_id: Uuid,
    pub helpful: Option<bool>,
    pub score: Option<f64>,
    pub reason: Option<String>,
}

/// Deserialise a params struct from the raw argument object, mapping
/// missing/invalid fields to the structured error shape.
pub fn parse_params<T: serde::de::DeserializeOwned>(
    args: &Map<String, Value>,
) -> Result<T, TaskError> {
    serde_json::from_value(Value::Object(args.clone())).map_err(|err| {
        let text = err.to_string();
        if let Some(field) = text
            .strip_prefix("missing field `")
            .and_then(|rest| rest.split('`').next())
        {
            TaskError::missing_field(field, "required", &format!("provide '{field}' in the request"))
        } else {
            TaskError::Validation(format!("Invalid parameters: {text}"))
        }
    })
}

/// Serialise an entity into the `data` payload, flattening serializer
/// errors into the internal error channel.
pub fn to_data<T: Serialize>(value: &T) -> Result<Value, TaskError> {
    serde_json::to_value(value).map_err(TaskError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope() {
        let env = success(json!({"id": 1}));
        assert_eq!(env["success"], json!(true));
        assert_eq!(env["data"]["id"], json!(1));
        assert!(env.get("workflow_guidance").is_none());
    }

    #[test]
    fn test_failure_envelope_missing_field() {
        let err = TaskError::missing_field("title", "string", "give the task a title");
        let env = failure("manage_task.create", &err);
        assert_eq!(env["success"], json!(false));
        assert_eq!(env["error"]["code"], json!("MISSING_FIELD"));
        assert_eq!(env["operation"], json!("manage_task.create"));
        assert_eq!(env["metadata"]["field"], json!("title"));
        assert_eq!(env["metadata"]["hint"], json!("give the task a title"));
    }

    #[test]
    fn test_failure_envelope_hides_infrastructure_detail() {
        let err = TaskError::Database("connection refused to db.internal:5432".to_string());
        let env = failure("manage_task.list", &err);
        assert_eq!(env["error"]["code"], json!("INTERNAL_ERROR"));
        let message = env["error"]["message"].as_str().unwrap();
        assert!(!message.contains("db.internal"));
        assert!(env["metadata"]["correlation_id"].is_string());
    }

    #[test]
    fn test_parse_params_maps_missing_field() {
        let args = json!({"title": "x"});
        let err = parse_params::<CreateTaskParams>(args.as_object().unwrap()).unwrap_err();
        match err {
            TaskError::MissingField { field, .. } => assert_eq!(field, "branch_id"),
            other => panic!("expected MissingField, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_params_happy_path() {
        let branch_id = Uuid::new_v4();
        let args = json!({
            "branch_id": branch_id,
            "title": "Implement feature",
            "priority": "high",
            "labels": ["backend"],
        });
        let params: CreateTaskParams = parse_params(args.as_object().unwrap()).unwrap();
        assert_eq!(params.branch_id, branch_id);
        assert_eq!(params.priority, Some(Priority::High));
        assert_eq!(params.labels, vec!["backend"]);
        assert!(params.dependencies.is_empty());
    }
}
