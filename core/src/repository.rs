//! Repository traits for all persisted entities.
//!
//! Implementations must be thread-safe and support concurrent access.
//! The traits here are tenant-agnostic: rows come back for any user unless
//! a filter narrows them. Tenant enforcement is layered on top by the
//! decorators in [`crate::scoped`]; services and the facade only ever see
//! the scoped wrappers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::context::{ContextCacheEntry, ContextDelegation, ContextLevel, ContextRecord};
use crate::error::Result;
use crate::models::{
    Agent, Branch, NewAgent, NewBranch, NewProject, NewSubtask, NewTask, Project, Subtask, Task,
    TaskDependency, TaskFilter, UpdateAgent, UpdateProject, UpdateSubtask, UpdateTask,
};
use crate::token::ApiToken;

/// Task persistence and dependency-graph storage.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Create a new task; `task.user_id` must already be stamped.
    async fn create(&self, task: NewTask) -> Result<Task>;

    /// Apply partial updates; fails with `CONCURRENT_MODIFICATION` when
    /// `updates.expected_version` is set and stale.
    async fn update(&self, id: Uuid, updates: UpdateTask) -> Result<Task>;

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Task>>;

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>>;

    /// Full-text-ish search over title/description/details, narrowed by
    /// the same filter as [`list`](Self::list).
    async fn search(&self, query: &str, filter: TaskFilter) -> Result<Vec<Task>>;

    /// Delete the task and every dependency edge touching it.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Insert a `blocks` edge. Duplicate edges are a no-op.
    async fn add_dependency(&self, dependency: TaskDependency) -> Result<()>;

    async fn remove_dependency(&self, task_id: Uuid, depends_on: Uuid) -> Result<()>;

    /// Edges where `task_id` is the dependent.
    async fn dependencies_of(&self, task_id: Uuid) -> Result<Vec<TaskDependency>>;

    /// Edges where `task_id` is the blocker.
    async fn dependents_of(&self, task_id: Uuid) -> Result<Vec<TaskDependency>>;
}

/// Subtask persistence.
#[async_trait]
pub trait SubtaskRepository: Send + Sync {
    async fn create(&self, subtask: NewSubtask) -> Result<Subtask>;
    async fn update(&self, id: Uuid, updates: UpdateSubtask) -> Result<Subtask>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Subtask>>;
    /// Subtasks of a task in creation order.
    async fn list_for_task(&self, task_id: Uuid) -> Result<Vec<Subtask>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// Project persistence. Names are unique per user.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn create(&self, project: NewProject) -> Result<Project>;
    async fn update(&self, id: Uuid, updates: UpdateProject) -> Result<Project>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Project>>;
    async fn get_by_name(&self, name: &str, user_id: &str) -> Result<Option<Project>>;
    async fn list(&self, user_id: Option<&str>) -> Result<Vec<Project>>;
    /// Deleting a project cascades to branches and their tasks.
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// Branch (workspace) persistence. Names are unique within a project.
#[async_trait]
pub trait BranchRepository: Send + Sync {
    async fn create(&self, branch: NewBranch) -> Result<Branch>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Branch>>;
    async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Branch>>;
    async fn list(&self, user_id: Option<&str>) -> Result<Vec<Branch>>;
    /// Persist agent assignment and task-counter changes.
    async fn save(&self, branch: Branch) -> Result<Branch>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// Agent registry persistence.
#[async_trait]
pub trait AgentRepository: Send + Sync {
    async fn create(&self, agent: NewAgent) -> Result<Agent>;
    async fn update(&self, id: Uuid, updates: UpdateAgent) -> Result<Agent>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Agent>>;
    async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Agent>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// Context-row persistence across all four levels.
///
/// Rows are keyed by `(level, context_id, user)` where `context_id` is the
/// id of the entity the context attaches to (the nil uuid for global).
/// Rows with `user_id IS NULL` are shared templates visible to every
/// tenant through [`get_shared`](Self::get_shared).
#[async_trait]
pub trait ContextRepository: Send + Sync {
    async fn get(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
    ) -> Result<Option<ContextRecord>>;

    /// Shared-template row (`user_id IS NULL`) for the same key, if any.
    async fn get_shared(&self, level: ContextLevel, context_id: Uuid)
        -> Result<Option<ContextRecord>>;

    /// Insert or replace a row; returns the stored record.
    async fn upsert(&self, record: ContextRecord) -> Result<ContextRecord>;

    async fn delete(&self, level: ContextLevel, context_id: Uuid, user_id: &str) -> Result<()>;

    /// Direct children of a context (project → its branch contexts, branch
    /// → its task contexts). Global answers the user's project contexts.
    async fn children(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
    ) -> Result<Vec<ContextRecord>>;
}

/// Delegation-record persistence.
#[async_trait]
pub trait DelegationRepository: Send + Sync {
    async fn create(&self, delegation: ContextDelegation) -> Result<ContextDelegation>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<ContextDelegation>>;
    /// Pending (unprocessed) first, newest last.
    async fn list(&self, user_id: &str, processed: Option<bool>) -> Result<Vec<ContextDelegation>>;
    async fn save(&self, delegation: ContextDelegation) -> Result<ContextDelegation>;
}

/// Storage for resolved-context cache entries, unique per
/// `(context_id, context_level, user)`.
#[async_trait]
pub trait ContextCacheRepository: Send + Sync {
    async fn get(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
    ) -> Result<Option<ContextCacheEntry>>;

    async fn upsert(&self, entry: ContextCacheEntry) -> Result<()>;

    /// Bump hit statistics after a cache hit.
    async fn record_hit(&self, level: ContextLevel, context_id: Uuid, user_id: &str) -> Result<()>;

    /// Mark one entry invalidated.
    async fn invalidate(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
        reason: &str,
    ) -> Result<u64>;

    /// Mark every entry whose `parent_chain` contains `ancestor_id`
    /// (descendant resolutions of a changed context).
    async fn invalidate_descendants(
        &self,
        ancestor_id: Uuid,
        user_id: &str,
        reason: &str,
    ) -> Result<u64>;

    /// Mark every entry for the user; used on global updates.
    async fn invalidate_all(&self, user_id: &str, reason: &str) -> Result<u64>;

    async fn remove(&self, level: ContextLevel, context_id: Uuid, user_id: &str) -> Result<()>;

    /// Drop expired or invalidated rows; returns how many went away.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn count(&self, user_id: &str) -> Result<u64>;

    /// Every live entry for the user (the eviction pass sorts these).
    async fn list(&self, user_id: &str) -> Result<Vec<ContextCacheEntry>>;
}

/// API-token persistence. Only hashes are stored.
#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn create(&self, token: ApiToken) -> Result<ApiToken>;
    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<ApiToken>>;
    async fn list(&self, user_id: &str) -> Result<Vec<ApiToken>>;
    /// Persist mutable fields (`is_active`, `usage_count`, `last_used_at`).
    async fn save(&self, token: ApiToken) -> Result<ApiToken>;
    /// Record one use.
    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<()>;
    /// Deactivate tokens whose expiry has passed; returns how many.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Everything the facade needs bundled together, so wiring stays in one
/// place (mirrors the handler-over-`Arc<R>` shape of the protocol layer).
#[derive(Clone)]
pub struct Repositories {
    pub tasks: std::sync::Arc<dyn TaskRepository>,
    pub subtasks: std::sync::Arc<dyn SubtaskRepository>,
    pub projects: std::sync::Arc<dyn ProjectRepository>,
    pub branches: std::sync::Arc<dyn BranchRepository>,
    pub agents: std::sync::Arc<dyn AgentRepository>,
    pub contexts: std::sync::Arc<dyn ContextRepository>,
    pub delegations: std::sync::Arc<dyn DelegationRepository>,
    pub context_cache: std::sync::Arc<dyn ContextCacheRepository>,
    pub tokens: std::sync::Arc<dyn TokenRepository>,
    pub events: std::sync::Arc<dyn crate::events::EventStore>,
}
