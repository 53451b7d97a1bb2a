//! Integration tests against an in-memory SQLite database.

use database::SqliteDatabase;
use serde_json::json;
use taskloom_core::{
    context::{ContextCacheEntry, ContextLevel, ContextRecord, ProjectContext},
    events::{EventFilter, StoredEvent},
    models::{NewBranch, NewProject, NewSubtask, NewTask, TaskDependency, TaskFilter, TaskStatus,
        UpdateSubtask, UpdateTask},
    repository::Repositories,
    scoped::scope_repositories,
    token::{ApiToken, Scope},
    DependencyType,
};
use uuid::Uuid;

async fn setup() -> (SqliteDatabase, Repositories) {
    let db = SqliteDatabase::connect(":memory:").await.expect("connect");
    db.migrate().await.expect("migrate");
    let repos = db.repositories();
    (db, repos)
}

/// Create a project + branch for a user and return the branch id.
async fn seed_branch(repos: &Repositories, user_id: &str) -> Uuid {
    let scoped = scope_repositories(repos, user_id);
    let project = scoped
        .projects
        .create(NewProject {
            name: format!("project-{user_id}"),
            description: String::new(),
            user_id: String::new(),
        })
        .await
        .expect("create project");
    let branch = scoped
        .branches
        .create(NewBranch {
            project_id: project.id,
            name: "main".to_string(),
            description: String::new(),
            user_id: String::new(),
        })
        .await
        .expect("create branch");
    branch.id
}

#[tokio::test]
async fn test_migrations_create_core_tables() {
    let (db, _) = setup().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
    )
    .fetch_all(db.pool())
    .await
    .expect("query tables");

    let names: Vec<String> = tables.into_iter().map(|t| t.0).collect();
    for expected in [
        "projects",
        "branches",
        "tasks",
        "task_dependencies",
        "task_subtasks",
        "task_assignees",
        "agents",
        "contexts",
        "context_delegations",
        "context_inheritance_cache",
        "api_tokens",
        "events",
    ] {
        assert!(names.contains(&expected.to_string()), "missing table {expected}");
    }
}

#[tokio::test]
async fn test_task_crud_round_trip() {
    let (_db, repos) = setup().await;
    let branch_id = seed_branch(&repos, "u1").await;
    let scoped = scope_repositories(&repos, "u1");

    let mut new_task = NewTask::new(branch_id, "Implement login", "JWT based auth");
    new_task.assignees = vec!["backend-dev".to_string()];
    new_task.labels = vec!["auth".to_string()];
    let task = scoped.tasks.create(new_task).await.expect("create");

    assert_eq!(task.status, TaskStatus::Todo);
    assert_eq!(task.user_id, "u1");
    assert_eq!(task.version, 1);

    let fetched = scoped.tasks.get_by_id(task.id).await.expect("get").expect("some");
    assert_eq!(fetched, task);

    let updated = scoped
        .tasks
        .update(
            task.id,
            UpdateTask {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            },
        )
        .await
        .expect("update");
    assert_eq!(updated.status, TaskStatus::InProgress);
    assert_eq!(updated.version, 2);
    assert!(updated.completed_at.is_none());

    // Branch counters track the task
    let branch = scoped.branches.get_by_id(branch_id).await.unwrap().unwrap();
    assert_eq!(branch.task_count, 1);
    assert_eq!(branch.completed_task_count, 0);

    scoped.tasks.delete(task.id).await.expect("delete");
    assert!(scoped.tasks.get_by_id(task.id).await.unwrap().is_none());
    let branch = scoped.branches.get_by_id(branch_id).await.unwrap().unwrap();
    assert_eq!(branch.task_count, 0);
}

#[tokio::test]
async fn test_completed_at_tracks_done_status() {
    let (_db, repos) = setup().await;
    let branch_id = seed_branch(&repos, "u1").await;
    let scoped = scope_repositories(&repos, "u1");

    let task = scoped
        .tasks
        .create(NewTask::new(branch_id, "T", "d"))
        .await
        .unwrap();

    let updated = scoped
        .tasks
        .update(
            task.id,
            UpdateTask {
                status: Some(TaskStatus::Done),
                completion_summary: Some("did it".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(updated.completed_at.is_some());

    let branch = scoped.branches.get_by_id(branch_id).await.unwrap().unwrap();
    assert_eq!(branch.completed_task_count, 1);
}

#[tokio::test]
async fn test_optimistic_concurrency() {
    let (_db, repos) = setup().await;
    let branch_id = seed_branch(&repos, "u1").await;
    let scoped = scope_repositories(&repos, "u1");

    let task = scoped
        .tasks
        .create(NewTask::new(branch_id, "T", "d"))
        .await
        .unwrap();

    // Stale expected version is rejected
    let err = scoped
        .tasks
        .update(
            task.id,
            UpdateTask {
                title: Some("new title".to_string()),
                expected_version: Some(99),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    // Correct version succeeds
    let updated = scoped
        .tasks
        .update(
            task.id,
            UpdateTask {
                title: Some("new title".to_string()),
                expected_version: Some(task.version),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.title, "new title");
}

#[tokio::test]
async fn test_tenant_isolation_reads_and_writes() {
    let (_db, repos) = setup().await;
    let branch_id = seed_branch(&repos, "u1").await;

    let u1 = scope_repositories(&repos, "u1");
    let u2 = scope_repositories(&repos, "u2");

    let task = u1
        .tasks
        .create(NewTask::new(branch_id, "Private", "mine"))
        .await
        .unwrap();

    // Reads by the other tenant see nothing
    assert!(u2.tasks.get_by_id(task.id).await.unwrap().is_none());
    assert!(u2.tasks.list(TaskFilter::default()).await.unwrap().is_empty());

    // Update/delete by the other tenant look like not-found
    assert!(u2
        .tasks
        .update(task.id, UpdateTask::default())
        .await
        .unwrap_err()
        .is_not_found());
    assert!(u2.tasks.delete(task.id).await.unwrap_err().is_not_found());

    // Entity-level save against a foreign branch is a cross-tenant write
    let branch = u1.branches.get_by_id(branch_id).await.unwrap().unwrap();
    let err = u2.branches.save(branch).await.unwrap_err();
    assert_eq!(
        err.code(),
        taskloom_core::ErrorCode::CrossTenantWrite
    );
}

#[tokio::test]
async fn test_dependency_idempotence_and_lookup() {
    let (_db, repos) = setup().await;
    let branch_id = seed_branch(&repos, "u1").await;
    let scoped = scope_repositories(&repos, "u1");

    let t1 = scoped.tasks.create(NewTask::new(branch_id, "T1", "d")).await.unwrap();
    let t2 = scoped.tasks.create(NewTask::new(branch_id, "T2", "d")).await.unwrap();

    let edge = TaskDependency {
        task_id: t2.id,
        depends_on_task_id: t1.id,
        dependency_type: DependencyType::Blocks,
        user_id: String::new(),
    };
    scoped.tasks.add_dependency(edge.clone()).await.unwrap();
    // Duplicate edge is a no-op
    scoped.tasks.add_dependency(edge).await.unwrap();

    let deps = scoped.tasks.dependencies_of(t2.id).await.unwrap();
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].depends_on_task_id, t1.id);

    let dependents = scoped.tasks.dependents_of(t1.id).await.unwrap();
    assert_eq!(dependents.len(), 1);
    assert_eq!(dependents[0].task_id, t2.id);

    // Hydrated onto the task row
    let t2_loaded = scoped.tasks.get_by_id(t2.id).await.unwrap().unwrap();
    assert_eq!(t2_loaded.dependencies, vec![t1.id]);

    // Deleting an endpoint removes the edge
    scoped.tasks.delete(t1.id).await.unwrap();
    assert!(scoped.tasks.dependencies_of(t2.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_subtask_rollup_updates_parent() {
    let (_db, repos) = setup().await;
    let branch_id = seed_branch(&repos, "u1").await;
    let scoped = scope_repositories(&repos, "u1");

    let task = scoped.tasks.create(NewTask::new(branch_id, "T", "d")).await.unwrap();

    let s1 = scoped
        .subtasks
        .create(NewSubtask {
            task_id: task.id,
            title: "S1".to_string(),
            description: String::new(),
            priority: None,
            assignees: vec![],
            user_id: String::new(),
        })
        .await
        .unwrap();
    scoped
        .subtasks
        .create(NewSubtask {
            task_id: task.id,
            title: "S2".to_string(),
            description: String::new(),
            priority: None,
            assignees: vec![],
            user_id: String::new(),
        })
        .await
        .unwrap();

    // Completing one of two subtasks puts the parent at 50%
    scoped
        .subtasks
        .update(
            s1.id,
            UpdateSubtask {
                status: Some(TaskStatus::Done),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let parent = scoped.tasks.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(parent.progress_percentage, 50.0);
}

#[tokio::test]
async fn test_duplicate_project_name_per_user() {
    let (_db, repos) = setup().await;
    let u1 = scope_repositories(&repos, "u1");
    let u2 = scope_repositories(&repos, "u2");

    u1.projects
        .create(NewProject {
            name: "Apollo".to_string(),
            description: String::new(),
            user_id: String::new(),
        })
        .await
        .unwrap();

    // Same name for the same user collides
    let err = u1
        .projects
        .create(NewProject {
            name: "Apollo".to_string(),
            description: String::new(),
            user_id: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), taskloom_core::ErrorCode::DuplicateName);

    // Same name for another user is fine
    assert!(u2
        .projects
        .create(NewProject {
            name: "Apollo".to_string(),
            description: String::new(),
            user_id: String::new(),
        })
        .await
        .is_ok());
}

#[tokio::test]
async fn test_context_rows_and_shared_templates() {
    let (_db, repos) = setup().await;
    let scoped = scope_repositories(&repos, "u1");

    let project_id = Uuid::new_v4();
    let mut ctx = ProjectContext::new(project_id, json!({"stack": ["rust"]}), "u1");
    scoped
        .contexts
        .upsert(ContextRecord::Project(ctx.clone()))
        .await
        .unwrap();

    let loaded = scoped
        .contexts
        .get(ContextLevel::Project, project_id, "u1")
        .await
        .unwrap()
        .expect("row");
    assert_eq!(loaded.context_id(), project_id);
    assert_eq!(loaded.version(), 1);

    // Upsert replaces in place
    ctx.version = 2;
    scoped
        .contexts
        .upsert(ContextRecord::Project(ctx))
        .await
        .unwrap();
    let reloaded = scoped
        .contexts
        .get(ContextLevel::Project, project_id, "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.version(), 2);

    // A shared template (user_id NULL) is visible through the scoped union
    let shared_id = Uuid::new_v4();
    let mut shared = ProjectContext::new(shared_id, json!({"template": true}), "ignored");
    shared.user_id = None;
    repos
        .contexts
        .upsert(ContextRecord::Project(shared))
        .await
        .unwrap();
    let via_union = scoped
        .contexts
        .get(ContextLevel::Project, shared_id, "u1")
        .await
        .unwrap();
    assert!(via_union.is_some());
}

#[tokio::test]
async fn test_cache_entry_lifecycle() {
    let (_db, repos) = setup().await;
    let now = chrono::Utc::now();
    let context_id = Uuid::new_v4();
    let parent = Uuid::new_v4();

    let entry = ContextCacheEntry {
        context_id,
        context_level: ContextLevel::Task,
        resolved_context: json!({"k": 1}),
        dependencies_hash: "h".to_string(),
        resolution_path: vec!["global".to_string(), "task".to_string()],
        parent_chain: vec![parent],
        created_at: now,
        expires_at: now + chrono::Duration::hours(1),
        hit_count: 0,
        last_hit: now,
        cache_size_bytes: 8,
        invalidated: false,
        invalidation_reason: None,
        user_id: "u1".to_string(),
    };
    repos.context_cache.upsert(entry).await.unwrap();

    repos
        .context_cache
        .record_hit(ContextLevel::Task, context_id, "u1")
        .await
        .unwrap();
    let loaded = repos
        .context_cache
        .get(ContextLevel::Task, context_id, "u1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.hit_count, 1);
    assert_eq!(loaded.parent_chain, vec![parent]);

    // Descendant invalidation matches on the parent chain
    let n = repos
        .context_cache
        .invalidate_descendants(parent, "u1", "parent_changed")
        .await
        .unwrap();
    assert_eq!(n, 1);
    let loaded = repos
        .context_cache
        .get(ContextLevel::Task, context_id, "u1")
        .await
        .unwrap()
        .unwrap();
    assert!(loaded.invalidated);
    assert_eq!(loaded.invalidation_reason.as_deref(), Some("parent_changed"));

    // Sweep removes the dead row
    let swept = repos.context_cache.sweep(chrono::Utc::now()).await.unwrap();
    assert_eq!(swept, 1);
    assert_eq!(repos.context_cache.count("u1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_token_storage_only_holds_hashes() {
    let (db, repos) = setup().await;
    let now = chrono::Utc::now();

    let raw = taskloom_core::token::generate_raw_token();
    // The validator stores the SHA-256 digest; any distinct 64-hex string
    // stands in for it here.
    let token = ApiToken {
        id: Uuid::new_v4(),
        user_id: "u1".to_string(),
        name: "ci".to_string(),
        token_hash: "f".repeat(64),
        scopes: vec![Scope::parse("tasks:read").unwrap()],
        rate_limit: 5,
        expires_at: None,
        last_used_at: None,
        usage_count: 0,
        is_active: true,
        metadata: json!({}),
        created_at: now,
    };
    repos.tokens.create(token.clone()).await.unwrap();

    // The raw token never appears in storage
    let rows: Vec<(String,)> = sqlx::query_as("SELECT token_hash FROM api_tokens")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_ne!(rows[0].0, raw);

    // Lookup is by hash only
    let found = repos.tokens.get_by_hash(&token.token_hash).await.unwrap();
    assert!(found.is_some());

    // Usage tracking
    repos.tokens.touch(token.id, now).await.unwrap();
    let touched = repos.tokens.get_by_id(token.id).await.unwrap().unwrap();
    assert_eq!(touched.usage_count, 1);
    assert!(touched.last_used_at.is_some());
}

#[tokio::test]
async fn test_token_cleanup_deactivates_expired() {
    let (_db, repos) = setup().await;
    let now = chrono::Utc::now();

    let expired = ApiToken {
        id: Uuid::new_v4(),
        user_id: "u1".to_string(),
        name: "old".to_string(),
        token_hash: "a".repeat(64),
        scopes: vec![],
        rate_limit: 0,
        expires_at: Some(now - chrono::Duration::hours(1)),
        last_used_at: None,
        usage_count: 0,
        is_active: true,
        metadata: json!({}),
        created_at: now,
    };
    repos.tokens.create(expired.clone()).await.unwrap();

    let n = repos.tokens.cleanup_expired(now).await.unwrap();
    assert_eq!(n, 1);
    let reloaded = repos.tokens.get_by_id(expired.id).await.unwrap().unwrap();
    assert!(!reloaded.is_active);
}

#[tokio::test]
async fn test_event_store_append_query_and_snapshots() {
    let (_db, repos) = setup().await;
    let aggregate = Uuid::new_v4();

    for version in 1..=3 {
        repos
            .events
            .append(StoredEvent::new(
                "TaskStateChanged",
                json!({"version": version}),
                Some(aggregate),
                Some("Task"),
                version,
            ))
            .await
            .unwrap();
    }

    let all = repos
        .events
        .get(EventFilter {
            aggregate_id: Some(aggregate),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 3);

    let typed = repos
        .events
        .get(EventFilter {
            event_type: Some("TaskStateChanged".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(typed.len(), 3);

    // Snapshot + replay from snapshot
    repos
        .events
        .snapshot(aggregate, "Task", json!({"state": "done"}), 3)
        .await
        .unwrap();
    let snapshot = repos.events.latest_snapshot(aggregate).await.unwrap().unwrap();
    assert!(snapshot.is_snapshot());
    assert_eq!(snapshot.version, 3);

    let replay = repos.events.replay(aggregate).await.unwrap();
    assert_eq!(replay[0].event_id, snapshot.event_id);
    // No events past version 3, so replay is just the snapshot
    assert_eq!(replay.len(), 1);

    repos.events.clear().await.unwrap();
    let empty = repos.events.get(EventFilter::default()).await.unwrap();
    assert!(empty.is_empty());
}
