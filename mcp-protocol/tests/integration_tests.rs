//! End-to-end scenarios through the orchestration facade, backed by the
//! in-memory repositories from the mocks crate.

use std::sync::Arc;

use mcp_protocol::{FacadeConfig, OrchestrationFacade, RateLimitConfig, TokenValidator};
use mocks::InMemoryStore;
use serde_json::{json, Map, Value};
use uuid::Uuid;

const USER: &str = "user-1";
const OTHER: &str = "user-2";

fn facade() -> (Arc<InMemoryStore>, OrchestrationFacade) {
    let store = InMemoryStore::new();
    let base = store.repositories();
    let validator = Arc::new(TokenValidator::new(
        base.tokens.clone(),
        RateLimitConfig::default(),
    ));
    let facade = OrchestrationFacade::new(base, validator, FacadeConfig::default());
    (store, facade)
}

fn args(value: Value) -> Map<String, Value> {
    value.as_object().expect("object literal").clone()
}

fn assert_success(envelope: &Value) -> &Value {
    assert_eq!(
        envelope["success"],
        json!(true),
        "expected success, got: {envelope}"
    );
    &envelope["data"]
}

fn assert_failure(envelope: &Value, code: &str) {
    assert_eq!(
        envelope["success"],
        json!(false),
        "expected failure, got: {envelope}"
    );
    assert_eq!(envelope["error"]["code"], json!(code), "envelope: {envelope}");
}

async fn create_workspace(facade: &OrchestrationFacade, user: &str) -> (Uuid, Uuid) {
    let envelope = facade
        .dispatch(
            "manage_project",
            "create",
            args(json!({"name": format!("Project for {user}")})),
            user,
        )
        .await;
    let project_id: Uuid =
        serde_json::from_value(assert_success(&envelope)["id"].clone()).unwrap();

    let envelope = facade
        .dispatch(
            "manage_project",
            "create_branch",
            args(json!({"project_id": project_id, "name": "main"})),
            user,
        )
        .await;
    let branch_id: Uuid = serde_json::from_value(assert_success(&envelope)["id"].clone()).unwrap();
    (project_id, branch_id)
}

async fn create_task(
    facade: &OrchestrationFacade,
    user: &str,
    branch_id: Uuid,
    title: &str,
    extra: Value,
) -> Uuid {
    let mut request = args(json!({"branch_id": branch_id, "title": title}));
    for (k, v) in extra.as_object().cloned().unwrap_or_default() {
        request.insert(k, v);
    }
    let envelope = facade.dispatch("manage_task", "create", request, user).await;
    serde_json::from_value(assert_success(&envelope)["id"].clone()).unwrap()
}

// T1 high/todo, T2 critical/todo depending on T1: next returns T1
// because T2, though higher priority, is blocked.
#[tokio::test]
async fn test_happy_path_create_and_next() {
    let (_store, facade) = facade();
    let (_project_id, branch_id) = create_workspace(&facade, USER).await;

    let t1 = create_task(&facade, USER, branch_id, "T1", json!({"priority": "high"})).await;
    let _t2 = create_task(
        &facade,
        USER,
        branch_id,
        "T2",
        json!({"priority": "critical", "dependencies": [t1]}),
    )
    .await;

    let envelope = facade
        .dispatch("manage_task", "next", args(json!({})), USER)
        .await;
    let data = assert_success(&envelope);
    assert_eq!(data["has_next"], json!(true));
    assert_eq!(data["task"]["title"], json!("T1"));
}

// With only the auto-materialised contexts in place, the project
// resolution inherits organization_name and global_settings with depth 2
// and chain [global, project].
#[tokio::test]
async fn test_context_inheritance_depth_and_chain() {
    let (_store, facade) = facade();
    let (project_id, _branch_id) = create_workspace(&facade, USER).await;

    let envelope = facade
        .dispatch(
            "manage_context",
            "get",
            args(json!({"level": "project", "context_id": project_id})),
            USER,
        )
        .await;
    let document = assert_success(&envelope);

    assert_eq!(document["organization_name"], json!("Default Organization"));
    assert!(document.get("global_settings").is_some());
    assert_eq!(document["_inheritance"]["inheritance_depth"], json!(2));
    assert_eq!(document["_inheritance"]["chain"], json!(["global", "project"]));
}

// Completion is gated on the completion summary and on every subtask
// being closed.
#[tokio::test]
async fn test_completion_with_subtasks() {
    let (_store, facade) = facade();
    let (_project_id, branch_id) = create_workspace(&facade, USER).await;
    let task_id = create_task(&facade, USER, branch_id, "T", json!({})).await;

    let s1 = facade
        .dispatch(
            "manage_subtask",
            "create",
            args(json!({"task_id": task_id, "title": "S1"})),
            USER,
        )
        .await;
    let s1_id: Uuid = serde_json::from_value(assert_success(&s1)["id"].clone()).unwrap();
    let s2 = facade
        .dispatch(
            "manage_subtask",
            "create",
            args(json!({"task_id": task_id, "title": "S2"})),
            USER,
        )
        .await;
    let s2_id: Uuid = serde_json::from_value(assert_success(&s2)["id"].clone()).unwrap();

    // Close S1; S2 stays open.
    let envelope = facade
        .dispatch(
            "manage_subtask",
            "complete",
            args(json!({"subtask_id": s1_id, "completion_summary": "done"})),
            USER,
        )
        .await;
    assert_success(&envelope);

    // Completing the parent now fails, citing the open subtask.
    let envelope = facade
        .dispatch(
            "manage_task",
            "complete",
            args(json!({"task_id": task_id, "completion_summary": "done"})),
            USER,
        )
        .await;
    assert_failure(&envelope, "VALIDATION_ERROR");
    assert!(envelope["error"]["message"]
        .as_str()
        .unwrap()
        .contains("incomplete subtask"));

    // Without a summary the gate is a missing field.
    let envelope = facade
        .dispatch(
            "manage_task",
            "complete",
            args(json!({"task_id": task_id})),
            USER,
        )
        .await;
    assert_failure(&envelope, "MISSING_FIELD");

    // Close S2, then completion succeeds and sets completed_at.
    let envelope = facade
        .dispatch(
            "manage_subtask",
            "complete",
            args(json!({"subtask_id": s2_id, "completion_summary": "x"})),
            USER,
        )
        .await;
    assert_success(&envelope);

    let envelope = facade
        .dispatch(
            "manage_task",
            "complete",
            args(json!({"task_id": task_id, "completion_summary": "done"})),
            USER,
        )
        .await;
    let data = assert_success(&envelope);
    assert_eq!(data["status"], json!("done"));
    assert!(data["completed_at"].is_string());
    assert_eq!(data["progress_percentage"], json!(100.0));
}

// A foreign task reads as absent; updating it leaks nothing.
#[tokio::test]
async fn test_cross_tenant_denial() {
    let (_store, facade) = facade();
    let (_p, branch_id) = create_workspace(&facade, USER).await;
    let task_id = create_task(&facade, USER, branch_id, "Private", json!({})).await;

    let envelope = facade
        .dispatch("manage_task", "get", args(json!({"task_id": task_id})), OTHER)
        .await;
    assert_failure(&envelope, "NOT_FOUND");

    let envelope = facade
        .dispatch(
            "manage_task",
            "update",
            args(json!({"task_id": task_id, "title": "hijacked"})),
            OTHER,
        )
        .await;
    assert_failure(&envelope, "NOT_FOUND");

    // The owner still sees the original title.
    let envelope = facade
        .dispatch("manage_task", "get", args(json!({"task_id": task_id})), USER)
        .await;
    assert_eq!(assert_success(&envelope)["title"], json!("Private"));
}

// An auto delegation with confidence 0.9 applies immediately and
// descendant resolutions pick the keys up.
#[tokio::test]
async fn test_delegation_auto_apply() {
    let (_store, facade) = facade();
    let (project_id, branch_id) = create_workspace(&facade, USER).await;
    let task_id = create_task(&facade, USER, branch_id, "T", json!({})).await;

    // Materialise branch and task contexts under the project.
    let envelope = facade
        .dispatch(
            "manage_context",
            "create",
            args(json!({"level": "branch", "context_id": branch_id, "parent_id": project_id})),
            USER,
        )
        .await;
    assert_success(&envelope);
    let envelope = facade
        .dispatch(
            "manage_context",
            "create",
            args(json!({"level": "task", "context_id": task_id, "parent_id": branch_id})),
            USER,
        )
        .await;
    assert_success(&envelope);

    // Warm the task resolution cache.
    let envelope = facade
        .dispatch(
            "manage_context",
            "resolve",
            args(json!({"level": "task", "context_id": task_id})),
            USER,
        )
        .await;
    let before = assert_success(&envelope).clone();
    assert!(before.get("error_pattern").is_none());

    let envelope = facade
        .dispatch(
            "manage_context",
            "delegate",
            args(json!({
                "source_level": "task",
                "source_id": task_id,
                "target_level": "project",
                "target_id": project_id,
                "data": {"error_pattern": "retry with backoff"},
                "reason": "seen three times",
                "trigger_type": "auto_pattern",
                "confidence_score": 0.9,
            })),
            USER,
        )
        .await;
    let delegation = assert_success(&envelope);
    assert_eq!(delegation["processed"], json!(true));
    assert_eq!(delegation["approved"], json!(true));

    // The project context now carries the key...
    let envelope = facade
        .dispatch(
            "manage_context",
            "get",
            args(json!({"level": "project", "context_id": project_id})),
            USER,
        )
        .await;
    assert_eq!(
        assert_success(&envelope)["error_pattern"],
        json!("retry with backoff")
    );

    // ...and a fresh task resolve shows it despite the warmed cache.
    let envelope = facade
        .dispatch(
            "manage_context",
            "resolve",
            args(json!({"level": "task", "context_id": task_id})),
            USER,
        )
        .await;
    assert_eq!(
        assert_success(&envelope)["error_pattern"],
        json!("retry with backoff")
    );
}

// Keys passed at context creation come back from resolve, both free-form
// and named sections.
#[tokio::test]
async fn test_context_create_resolve_round_trip() {
    let (_store, facade) = facade();
    let (project_id, branch_id) = create_workspace(&facade, USER).await;

    let envelope = facade
        .dispatch(
            "manage_context",
            "create",
            args(json!({
                "level": "branch", "context_id": branch_id, "parent_id": project_id,
                "data": {
                    "workstream": "payments",
                    "feature_flags": {"dark_mode": true},
                },
            })),
            USER,
        )
        .await;
    assert_success(&envelope);

    let envelope = facade
        .dispatch(
            "manage_context",
            "resolve",
            args(json!({"level": "branch", "context_id": branch_id})),
            USER,
        )
        .await;
    let document = assert_success(&envelope);
    assert_eq!(document["workstream"], json!("payments"));
    assert_eq!(document["feature_flags"]["dark_mode"], json!(true));
    assert_eq!(document["_inheritance"]["inheritance_depth"], json!(3));
    assert_eq!(
        document["_inheritance"]["chain"],
        json!(["global", "project", "branch"])
    );
}

// Low-confidence and manual delegations queue instead of applying.
#[tokio::test]
async fn test_delegation_queueing() {
    let (_store, facade) = facade();
    let (project_id, branch_id) = create_workspace(&facade, USER).await;
    facade
        .dispatch(
            "manage_context",
            "create",
            args(json!({"level": "branch", "context_id": branch_id, "parent_id": project_id})),
            USER,
        )
        .await;

    let envelope = facade
        .dispatch(
            "manage_context",
            "delegate",
            args(json!({
                "source_level": "branch",
                "source_id": branch_id,
                "target_level": "project",
                "target_id": project_id,
                "data": {"tentative": true},
                "trigger_type": "auto_threshold",
                "confidence_score": 0.4,
            })),
            USER,
        )
        .await;
    let delegation = assert_success(&envelope);
    assert_eq!(delegation["processed"], json!(false));

    // Target context is untouched.
    let envelope = facade
        .dispatch(
            "manage_context",
            "get",
            args(json!({"level": "project", "context_id": project_id})),
            USER,
        )
        .await;
    assert!(assert_success(&envelope).get("tentative").is_none());

    // Downward delegation is rejected outright.
    let envelope = facade
        .dispatch(
            "manage_context",
            "delegate",
            args(json!({
                "source_level": "project",
                "source_id": project_id,
                "target_level": "branch",
                "target_id": branch_id,
                "data": {"x": 1},
            })),
            USER,
        )
        .await;
    assert_failure(&envelope, "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_dependency_cycle_rejected() {
    let (_store, facade) = facade();
    let (_p, branch_id) = create_workspace(&facade, USER).await;

    let a = create_task(&facade, USER, branch_id, "A", json!({})).await;
    let b = create_task(&facade, USER, branch_id, "B", json!({})).await;

    let envelope = facade
        .dispatch(
            "manage_task",
            "add_dependency",
            args(json!({"task_id": a, "depends_on_task_id": b})),
            USER,
        )
        .await;
    assert_success(&envelope);

    // Repeating the edge is a no-op.
    let envelope = facade
        .dispatch(
            "manage_task",
            "add_dependency",
            args(json!({"task_id": a, "depends_on_task_id": b})),
            USER,
        )
        .await;
    let data = assert_success(&envelope);
    assert_eq!(data["dependencies"], json!([b]));

    // Closing the loop is refused.
    let envelope = facade
        .dispatch(
            "manage_task",
            "add_dependency",
            args(json!({"task_id": b, "depends_on_task_id": a})),
            USER,
        )
        .await;
    assert_failure(&envelope, "VALIDATION_ERROR");

    // Self dependency as well.
    let envelope = facade
        .dispatch(
            "manage_task",
            "add_dependency",
            args(json!({"task_id": a, "depends_on_task_id": a})),
            USER,
        )
        .await;
    assert_failure(&envelope, "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_update_into_in_progress_requires_satisfied_dependencies() {
    let (_store, facade) = facade();
    let (_p, branch_id) = create_workspace(&facade, USER).await;

    let blocker = create_task(&facade, USER, branch_id, "Blocker", json!({})).await;
    let blocked = create_task(
        &facade,
        USER,
        branch_id,
        "Blocked",
        json!({"dependencies": [blocker]}),
    )
    .await;

    let envelope = facade
        .dispatch(
            "manage_task",
            "update",
            args(json!({"task_id": blocked, "status": "in_progress"})),
            USER,
        )
        .await;
    assert_failure(&envelope, "DEPENDENCIES_UNSATISFIED");
    assert_eq!(envelope["metadata"]["blockers"], json!([blocker]));
}

#[tokio::test]
async fn test_status_mismatch_gates_next() {
    let (_store, facade) = facade();
    let (_p, branch_id) = create_workspace(&facade, USER).await;
    let task_id = create_task(&facade, USER, branch_id, "T", json!({})).await;

    // Create a task context whose mirrored status diverges from the row.
    let envelope = facade
        .dispatch(
            "manage_context",
            "create",
            args(json!({
                "level": "branch", "context_id": branch_id,
                "parent_id": serde_json::Value::Null,
            })),
            USER,
        )
        .await;
    // Branch context creation needs the project id as parent.
    assert_failure(&envelope, "MISSING_FIELD");

    let project_id: Uuid = {
        let envelope = facade
            .dispatch("manage_project", "list", args(json!({})), USER)
            .await;
        serde_json::from_value(assert_success(&envelope)["projects"][0]["id"].clone()).unwrap()
    };
    facade
        .dispatch(
            "manage_context",
            "create",
            args(json!({"level": "branch", "context_id": branch_id, "parent_id": project_id})),
            USER,
        )
        .await;
    facade
        .dispatch(
            "manage_context",
            "create",
            args(json!({
                "level": "task", "context_id": task_id, "parent_id": branch_id,
                "data": {"task_data": {"status": "done"}},
            })),
            USER,
        )
        .await;

    let envelope = facade
        .dispatch("manage_task", "next", args(json!({})), USER)
        .await;
    let data = assert_success(&envelope);
    assert_eq!(data["kind"], json!("status_mismatch"));
    assert_eq!(data["has_next"], json!(false));
    assert_eq!(data["mismatches"][0]["task_status"], json!("todo"));
    assert_eq!(data["mismatches"][0]["context_status"], json!("done"));
}

#[tokio::test]
async fn test_next_attaches_hints_for_stalled_work() {
    let (store, facade) = facade();
    let (_p, branch_id) = create_workspace(&facade, USER).await;
    let task_id = create_task(
        &facade,
        USER,
        branch_id,
        "Stalled work",
        json!({"status": "in_progress"}),
    )
    .await;

    // Age the task beyond the stall threshold.
    {
        let mut tasks = store.tasks.lock();
        let task = tasks.get_mut(&task_id).unwrap();
        task.updated_at = chrono::Utc::now() - chrono::Duration::hours(72);
    }

    let envelope = facade
        .dispatch("manage_task", "next", args(json!({})), USER)
        .await;
    let data = assert_success(&envelope);
    assert_eq!(data["has_next"], json!(true));
    let hints = data["hints"].as_array().expect("hints attached");
    assert!(hints
        .iter()
        .any(|h| h["metadata"]["rule_name"] == json!("stalled_progress")));
}

#[tokio::test]
async fn test_token_lifecycle_via_facade() {
    let (_store, facade) = facade();

    let envelope = facade
        .dispatch(
            "manage_token",
            "create",
            args(json!({"name": "ci", "scopes": ["tasks:read", "tasks:write"], "rate_limit": 5})),
            USER,
        )
        .await;
    let data = assert_success(&envelope).clone();
    let token_id: Uuid = serde_json::from_value(data["id"].clone()).unwrap();
    let raw = data["token"].as_str().expect("raw token returned once").to_string();
    assert_eq!(raw.len(), 64);

    // Listing never exposes raw tokens or hashes.
    let envelope = facade
        .dispatch("manage_token", "list", args(json!({})), USER)
        .await;
    let listing = assert_success(&envelope).clone();
    assert_eq!(listing["count"], json!(1));
    assert!(listing["tokens"][0].get("token").is_none());
    assert!(listing["tokens"][0].get("token_hash").is_none());

    // validate → revoke → validate
    let envelope = facade
        .dispatch(
            "manage_token",
            "validate",
            args(json!({"token": raw})),
            USER,
        )
        .await;
    assert_eq!(assert_success(&envelope)["valid"], json!(true));

    let envelope = facade
        .dispatch(
            "manage_token",
            "revoke",
            args(json!({"token_id": token_id})),
            USER,
        )
        .await;
    assert_eq!(assert_success(&envelope)["is_active"], json!(false));

    let envelope = facade
        .dispatch(
            "manage_token",
            "validate",
            args(json!({"token": raw})),
            USER,
        )
        .await;
    assert_eq!(assert_success(&envelope)["valid"], json!(false));

    // rotate mints a new raw token and kills the old one
    let envelope = facade
        .dispatch(
            "manage_token",
            "reactivate",
            args(json!({"token_id": token_id})),
            USER,
        )
        .await;
    assert_success(&envelope);
    let envelope = facade
        .dispatch(
            "manage_token",
            "rotate",
            args(json!({"token_id": token_id})),
            USER,
        )
        .await;
    let rotated = assert_success(&envelope).clone();
    assert_ne!(rotated["token"].as_str().unwrap(), raw);
    assert_eq!(rotated["rotated_from"], json!(token_id));
}

// Infrastructure failures reach the caller as a generic INTERNAL_ERROR
// with a correlation id; the database detail stays in the logs.
#[tokio::test]
async fn test_infrastructure_failure_is_masked() {
    let (store, facade) = facade();
    let (_p, branch_id) = create_workspace(&facade, USER).await;

    store.inject_error(taskloom_core::TaskError::Database(
        "connection refused to sqlite".to_string(),
    ));
    let envelope = facade
        .dispatch(
            "manage_task",
            "create",
            args(json!({"branch_id": branch_id, "title": "T"})),
            USER,
        )
        .await;
    assert_failure(&envelope, "INTERNAL_ERROR");
    assert!(!envelope["error"]["message"]
        .as_str()
        .unwrap()
        .contains("sqlite"));
    assert!(envelope["metadata"]["correlation_id"].is_string());
}

#[tokio::test]
async fn test_unknown_action_envelope() {
    let (_store, facade) = facade();
    let envelope = facade
        .dispatch("manage_task", "frobnicate", args(json!({})), USER)
        .await;
    assert_failure(&envelope, "UNKNOWN_ACTION");
    assert_eq!(envelope["operation"], json!("manage_task.frobnicate"));
}

#[tokio::test]
async fn test_missing_field_envelope_shape() {
    let (_store, facade) = facade();
    let envelope = facade
        .dispatch("manage_task", "create", args(json!({"title": "no branch"})), USER)
        .await;
    assert_failure(&envelope, "MISSING_FIELD");
    assert_eq!(envelope["metadata"]["field"], json!("branch_id"));
    assert!(envelope["metadata"]["hint"].is_string());
}

#[tokio::test]
async fn test_agent_assignment_rules() {
    let (_store, facade) = facade();
    let (project_id, branch_id) = create_workspace(&facade, USER).await;

    let a1 = facade
        .dispatch(
            "manage_agent",
            "register",
            args(json!({"project_id": project_id, "name": "coder-1"})),
            USER,
        )
        .await;
    let a1_id: Uuid = serde_json::from_value(assert_success(&a1)["id"].clone()).unwrap();
    let a2 = facade
        .dispatch(
            "manage_agent",
            "register",
            args(json!({"project_id": project_id, "name": "coder-2"})),
            USER,
        )
        .await;
    let a2_id: Uuid = serde_json::from_value(assert_success(&a2)["id"].clone()).unwrap();

    // First assignment lands.
    let envelope = facade
        .dispatch(
            "manage_agent",
            "assign",
            args(json!({"agent_id": a1_id, "branch_id": branch_id})),
            USER,
        )
        .await;
    assert_success(&envelope);

    // Re-assigning the same agent is idempotent.
    let envelope = facade
        .dispatch(
            "manage_agent",
            "assign",
            args(json!({"agent_id": a1_id, "branch_id": branch_id})),
            USER,
        )
        .await;
    assert_success(&envelope);

    // A different agent is rejected while the branch is held.
    let envelope = facade
        .dispatch(
            "manage_agent",
            "assign",
            args(json!({"agent_id": a2_id, "branch_id": branch_id})),
            USER,
        )
        .await;
    assert_failure(&envelope, "VALIDATION_ERROR");

    // After unassign, the other agent can take it.
    facade
        .dispatch(
            "manage_agent",
            "unassign",
            args(json!({"branch_id": branch_id})),
            USER,
        )
        .await;
    let envelope = facade
        .dispatch(
            "manage_agent",
            "assign",
            args(json!({"agent_id": a2_id, "branch_id": branch_id})),
            USER,
        )
        .await;
    assert_success(&envelope);
}

#[tokio::test]
async fn test_rebalance_assigns_free_agents() {
    let (_store, facade) = facade();
    let (project_id, _branch_id) = create_workspace(&facade, USER).await;
    facade
        .dispatch(
            "manage_project",
            "create_branch",
            args(json!({"project_id": project_id, "name": "feature-x"})),
            USER,
        )
        .await;

    for name in ["agent-a", "agent-b"] {
        facade
            .dispatch(
                "manage_agent",
                "register",
                args(json!({"project_id": project_id, "name": name})),
                USER,
            )
            .await;
    }

    let envelope = facade
        .dispatch(
            "manage_agent",
            "rebalance",
            args(json!({"project_id": project_id})),
            USER,
        )
        .await;
    let data = assert_success(&envelope);
    assert_eq!(data["assigned_count"], json!(2));

    // A second pass has nothing left to assign.
    let envelope = facade
        .dispatch(
            "manage_agent",
            "rebalance",
            args(json!({"project_id": project_id})),
            USER,
        )
        .await;
    assert_eq!(assert_success(&envelope)["assigned_count"], json!(0));
}

// Cache coherence: after a context update every resolve sees the new data.
#[tokio::test]
async fn test_cache_coherence_after_update() {
    let (_store, facade) = facade();
    let (project_id, _branch_id) = create_workspace(&facade, USER).await;

    // Warm the cache.
    let envelope = facade
        .dispatch(
            "manage_context",
            "resolve",
            args(json!({"level": "project", "context_id": project_id})),
            USER,
        )
        .await;
    assert!(assert_success(&envelope).get("team_size").is_none());

    facade
        .dispatch(
            "manage_context",
            "update",
            args(json!({
                "level": "project", "context_id": project_id,
                "data": {"team_size": 4},
            })),
            USER,
        )
        .await;

    let envelope = facade
        .dispatch(
            "manage_context",
            "resolve",
            args(json!({"level": "project", "context_id": project_id})),
            USER,
        )
        .await;
    assert_eq!(assert_success(&envelope)["team_size"], json!(4));
}

#[tokio::test]
async fn test_project_health_and_integrity() {
    let (_store, facade) = facade();
    let (project_id, branch_id) = create_workspace(&facade, USER).await;
    create_task(&facade, USER, branch_id, "T1", json!({})).await;
    create_task(&facade, USER, branch_id, "T2", json!({"status": "in_progress"})).await;

    let envelope = facade
        .dispatch(
            "manage_project",
            "project_health_check",
            args(json!({"project_id": project_id})),
            USER,
        )
        .await;
    let health = assert_success(&envelope);
    assert_eq!(health["task_count"], json!(2));
    assert_eq!(health["branch_count"], json!(1));
    assert_eq!(health["tasks_by_status"]["todo"], json!(1));
    assert_eq!(health["unassigned_branches"], json!(["main"]));

    let envelope = facade
        .dispatch(
            "manage_project",
            "validate_integrity",
            args(json!({"project_id": project_id})),
            USER,
        )
        .await;
    assert_eq!(assert_success(&envelope)["valid"], json!(true));
}
