//! User-scoped repository decorators.
//!
//! Every repository the services and the facade touch is wrapped exactly
//! once (no deeper chains) with the authenticated `user_id`:
//!
//! - reads compose the tenant filter, so foreign rows are indistinguishable
//!   from absent rows;
//! - creates stamp the tenant onto the new row;
//! - entity-level saves against a row owned by someone else fail with
//!   `CROSS_TENANT_WRITE`;
//! - deletes are gated by a tenant-filtered read first.
//!
//! Context reads union the user's rows with shared templates
//! (`user_id IS NULL`); writes always attach the current user, and global
//! contexts cannot be deleted.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::context::{ContextCacheEntry, ContextDelegation, ContextLevel, ContextRecord};
use crate::error::{Result, TaskError};
use crate::models::{
    Agent, Branch, NewAgent, NewBranch, NewProject, NewSubtask, NewTask, Project, Subtask, Task,
    TaskDependency, TaskFilter, UpdateAgent, UpdateProject, UpdateSubtask, UpdateTask,
};
use crate::repository::{
    AgentRepository, BranchRepository, ContextCacheRepository, ContextRepository,
    DelegationRepository, ProjectRepository, Repositories, SubtaskRepository, TaskRepository,
    TokenRepository,
};
use crate::token::ApiToken;

/// Tasks, filtered to one tenant.
pub struct ScopedTaskRepository {
    inner: Arc<dyn TaskRepository>,
    user_id: String,
}

impl ScopedTaskRepository {
    pub fn new(inner: Arc<dyn TaskRepository>, user_id: impl Into<String>) -> Self {
        Self {
            inner,
            user_id: user_id.into(),
        }
    }

    fn scope_filter(&self, mut filter: TaskFilter) -> TaskFilter {
        filter.user_id = Some(self.user_id.clone());
        filter
    }

    async fn owned(&self, id: Uuid) -> Result<Option<Task>> {
        Ok(self
            .inner
            .get_by_id(id)
            .await?
            .filter(|task| task.user_id == self.user_id))
    }
}

#[async_trait]
impl TaskRepository for ScopedTaskRepository {
    async fn create(&self, mut task: NewTask) -> Result<Task> {
        task.user_id = self.user_id.clone();
        self.inner.create(task).await
    }

    async fn update(&self, id: Uuid, updates: UpdateTask) -> Result<Task> {
        if self.owned(id).await?.is_none() {
            return Err(TaskError::not_found("Task", id));
        }
        self.inner.update(id, updates).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Task>> {
        self.owned(id).await
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        self.inner.list(self.scope_filter(filter)).await
    }

    async fn search(&self, query: &str, filter: TaskFilter) -> Result<Vec<Task>> {
        self.inner.search(query, self.scope_filter(filter)).await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        if self.owned(id).await?.is_none() {
            return Err(TaskError::not_found("Task", id));
        }
        self.inner.delete(id).await
    }

    async fn add_dependency(&self, mut dependency: TaskDependency) -> Result<()> {
        // Both endpoints must be visible to this tenant.
        if self.owned(dependency.task_id).await?.is_none() {
            return Err(TaskError::not_found("Task", dependency.task_id));
        }
        if self.owned(dependency.depends_on_task_id).await?.is_none() {
            return Err(TaskError::not_found("Task", dependency.depends_on_task_id));
        }
        dependency.user_id = self.user_id.clone();
        self.inner.add_dependency(dependency).await
    }

    async fn remove_dependency(&self, task_id: Uuid, depends_on: Uuid) -> Result<()> {
        if self.owned(task_id).await?.is_none() {
            return Err(TaskError::not_found("Task", task_id));
        }
        self.inner.remove_dependency(task_id, depends_on).await
    }

    async fn dependencies_of(&self, task_id: Uuid) -> Result<Vec<TaskDependency>> {
        let edges = self.inner.dependencies_of(task_id).await?;
        Ok(edges
            .into_iter()
            .filter(|edge| edge.user_id == self.user_id)
            .collect())
    }

    async fn dependents_of(&self, task_id: Uuid) -> Result<Vec<TaskDependency>> {
        let edges = self.inner.dependents_of(task_id).await?;
        Ok(edges
            .into_iter()
            .filter(|edge| edge.user_id == self.user_id)
            .collect())
    }
}

/// Subtasks, filtered to one tenant.
pub struct ScopedSubtaskRepository {
    inner: Arc<dyn SubtaskRepository>,
    user_id: String,
}

impl ScopedSubtaskRepository {
    pub fn new(inner: Arc<dyn SubtaskRepository>, user_id: impl Into<String>) -> Self {
        Self {
            inner,
            user_id: user_id.into(),
        }
    }

    async fn owned(&self, id: Uuid) -> Result<Option<Subtask>> {
        Ok(self
            .inner
            .get_by_id(id)
            .await?
            .filter(|subtask| subtask.user_id == self.user_id))
    }
}

#[async_trait]
impl SubtaskRepository for ScopedSubtaskRepository {
    async fn create(&self, mut subtask: NewSubtask) -> Result<Subtask> {
        subtask.user_id = self.user_id.clone();
        self.inner.create(subtask).await
    }

    async fn update(&self, id: Uuid, updates: UpdateSubtask) -> Result<Subtask> {
        if self.owned(id).await?.is_none() {
            return Err(TaskError::not_found("Subtask", id));
        }
        self.inner.update(id, updates).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Subtask>> {
        self.owned(id).await
    }

    async fn list_for_task(&self, task_id: Uuid) -> Result<Vec<Subtask>> {
        let subtasks = self.inner.list_for_task(task_id).await?;
        Ok(subtasks
            .into_iter()
            .filter(|s| s.user_id == self.user_id)
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        if self.owned(id).await?.is_none() {
            return Err(TaskError::not_found("Subtask", id));
        }
        self.inner.delete(id).await
    }
}

/// Projects, filtered to one tenant.
pub struct ScopedProjectRepository {
    inner: Arc<dyn ProjectRepository>,
    user_id: String,
}

impl ScopedProjectRepository {
    pub fn new(inner: Arc<dyn ProjectRepository>, user_id: impl Into<String>) -> Self {
        Self {
            inner,
            user_id: user_id.into(),
        }
    }

    async fn owned(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self
            .inner
            .get_by_id(id)
            .await?
            .filter(|project| project.user_id == self.user_id))
    }
}

#[async_trait]
impl ProjectRepository for ScopedProjectRepository {
    async fn create(&self, mut project: NewProject) -> Result<Project> {
        project.user_id = self.user_id.clone();
        self.inner.create(project).await
    }

    async fn update(&self, id: Uuid, updates: UpdateProject) -> Result<Project> {
        if self.owned(id).await?.is_none() {
            return Err(TaskError::not_found("Project", id));
        }
        self.inner.update(id, updates).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Project>> {
        self.owned(id).await
    }

    async fn get_by_name(&self, name: &str, _user_id: &str) -> Result<Option<Project>> {
        self.inner.get_by_name(name, &self.user_id).await
    }

    async fn list(&self, _user_id: Option<&str>) -> Result<Vec<Project>> {
        self.inner.list(Some(&self.user_id)).await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        if self.owned(id).await?.is_none() {
            return Err(TaskError::not_found("Project", id));
        }
        self.inner.delete(id).await
    }
}

/// Branches, filtered to one tenant.
pub struct ScopedBranchRepository {
    inner: Arc<dyn BranchRepository>,
    user_id: String,
}

impl ScopedBranchRepository {
    pub fn new(inner: Arc<dyn BranchRepository>, user_id: impl Into<String>) -> Self {
        Self {
            inner,
            user_id: user_id.into(),
        }
    }

    async fn owned(&self, id: Uuid) -> Result<Option<Branch>> {
        Ok(self
            .inner
            .get_by_id(id)
            .await?
            .filter(|branch| branch.user_id == self.user_id))
    }
}

#[async_trait]
impl BranchRepository for ScopedBranchRepository {
    async fn create(&self, mut branch: NewBranch) -> Result<Branch> {
        branch.user_id = self.user_id.clone();
        self.inner.create(branch).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Branch>> {
        self.owned(id).await
    }

    async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Branch>> {
        let branches = self.inner.list_for_project(project_id).await?;
        Ok(branches
            .into_iter()
            .filter(|b| b.user_id == self.user_id)
            .collect())
    }

    async fn list(&self, _user_id: Option<&str>) -> Result<Vec<Branch>> {
        self.inner.list(Some(&self.user_id)).await
    }

    async fn save(&self, branch: Branch) -> Result<Branch> {
        // Entity-level save: a row owned by another tenant is a hard
        // cross-tenant write, not a silent not-found.
        if let Some(stored) = self.inner.get_by_id(branch.id).await? {
            if stored.user_id != self.user_id {
                return Err(TaskError::cross_tenant_write("Branch", branch.id));
            }
        }
        let mut branch = branch;
        branch.user_id = self.user_id.clone();
        self.inner.save(branch).await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        if self.owned(id).await?.is_none() {
            return Err(TaskError::not_found("Branch", id));
        }
        self.inner.delete(id).await
    }
}

/// Agents, filtered to one tenant.
pub struct ScopedAgentRepository {
    inner: Arc<dyn AgentRepository>,
    user_id: String,
}

impl ScopedAgentRepository {
    pub fn new(inner: Arc<dyn AgentRepository>, user_id: impl Into<String>) -> Self {
        Self {
            inner,
            user_id: user_id.into(),
        }
    }

    async fn owned(&self, id: Uuid) -> Result<Option<Agent>> {
        Ok(self
            .inner
            .get_by_id(id)
            .await?
            .filter(|agent| agent.user_id == self.user_id))
    }
}

#[async_trait]
impl AgentRepository for ScopedAgentRepository {
    async fn create(&self, mut agent: NewAgent) -> Result<Agent> {
        agent.user_id = self.user_id.clone();
        self.inner.create(agent).await
    }

    async fn update(&self, id: Uuid, updates: UpdateAgent) -> Result<Agent> {
        if self.owned(id).await?.is_none() {
            return Err(TaskError::not_found("Agent", id));
        }
        self.inner.update(id, updates).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Agent>> {
        self.owned(id).await
    }

    async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Agent>> {
        let agents = self.inner.list_for_project(project_id).await?;
        Ok(agents
            .into_iter()
            .filter(|a| a.user_id == self.user_id)
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        if self.owned(id).await?.is_none() {
            return Err(TaskError::not_found("Agent", id));
        }
        self.inner.delete(id).await
    }
}

/// Context rows, with the union-read nuance: the user's own row wins, a
/// shared template (`user_id IS NULL`) fills in behind it.
pub struct ScopedContextRepository {
    inner: Arc<dyn ContextRepository>,
    user_id: String,
}

impl ScopedContextRepository {
    pub fn new(inner: Arc<dyn ContextRepository>, user_id: impl Into<String>) -> Self {
        Self {
            inner,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

#[async_trait]
impl ContextRepository for ScopedContextRepository {
    async fn get(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        _user_id: &str,
    ) -> Result<Option<ContextRecord>> {
        if let Some(record) = self.inner.get(level, context_id, &self.user_id).await? {
            return Ok(Some(record));
        }
        self.inner.get_shared(level, context_id).await
    }

    async fn get_shared(
        &self,
        level: ContextLevel,
        context_id: Uuid,
    ) -> Result<Option<ContextRecord>> {
        self.inner.get_shared(level, context_id).await
    }

    async fn upsert(&self, mut record: ContextRecord) -> Result<ContextRecord> {
        // Writes always attach the current user, including globals.
        if let Some(owner) = record.user_id() {
            if owner != self.user_id {
                return Err(TaskError::cross_tenant_write(
                    "Context",
                    record.context_id(),
                ));
            }
        }
        record.set_user_id(&self.user_id);
        self.inner.upsert(record).await
    }

    async fn delete(&self, level: ContextLevel, context_id: Uuid, _user_id: &str) -> Result<()> {
        if level == ContextLevel::Global {
            return Err(TaskError::Validation(
                "Global context cannot be deleted".to_string(),
            ));
        }
        self.inner.delete(level, context_id, &self.user_id).await
    }

    async fn children(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        _user_id: &str,
    ) -> Result<Vec<ContextRecord>> {
        self.inner.children(level, context_id, &self.user_id).await
    }
}

/// Delegations, filtered to one tenant.
pub struct ScopedDelegationRepository {
    inner: Arc<dyn DelegationRepository>,
    user_id: String,
}

impl ScopedDelegationRepository {
    pub fn new(inner: Arc<dyn DelegationRepository>, user_id: impl Into<String>) -> Self {
        Self {
            inner,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl DelegationRepository for ScopedDelegationRepository {
    async fn create(&self, mut delegation: ContextDelegation) -> Result<ContextDelegation> {
        delegation.user_id = self.user_id.clone();
        self.inner.create(delegation).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ContextDelegation>> {
        Ok(self
            .inner
            .get_by_id(id)
            .await?
            .filter(|d| d.user_id == self.user_id))
    }

    async fn list(&self, _user_id: &str, processed: Option<bool>) -> Result<Vec<ContextDelegation>> {
        self.inner.list(&self.user_id, processed).await
    }

    async fn save(&self, delegation: ContextDelegation) -> Result<ContextDelegation> {
        if let Some(stored) = self.inner.get_by_id(delegation.id).await? {
            if stored.user_id != self.user_id {
                return Err(TaskError::cross_tenant_write("Delegation", delegation.id));
            }
        }
        self.inner.save(delegation).await
    }
}

/// Cache entries, filtered to one tenant.
pub struct ScopedCacheRepository {
    inner: Arc<dyn ContextCacheRepository>,
    user_id: String,
}

impl ScopedCacheRepository {
    pub fn new(inner: Arc<dyn ContextCacheRepository>, user_id: impl Into<String>) -> Self {
        Self {
            inner,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl ContextCacheRepository for ScopedCacheRepository {
    async fn get(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        _user_id: &str,
    ) -> Result<Option<ContextCacheEntry>> {
        self.inner.get(level, context_id, &self.user_id).await
    }

    async fn upsert(&self, mut entry: ContextCacheEntry) -> Result<()> {
        entry.user_id = self.user_id.clone();
        self.inner.upsert(entry).await
    }

    async fn record_hit(&self, level: ContextLevel, context_id: Uuid, _user_id: &str) -> Result<()> {
        self.inner.record_hit(level, context_id, &self.user_id).await
    }

    async fn invalidate(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        _user_id: &str,
        reason: &str,
    ) -> Result<u64> {
        self.inner
            .invalidate(level, context_id, &self.user_id, reason)
            .await
    }

    async fn invalidate_descendants(
        &self,
        ancestor_id: Uuid,
        _user_id: &str,
        reason: &str,
    ) -> Result<u64> {
        self.inner
            .invalidate_descendants(ancestor_id, &self.user_id, reason)
            .await
    }

    async fn invalidate_all(&self, _user_id: &str, reason: &str) -> Result<u64> {
        self.inner.invalidate_all(&self.user_id, reason).await
    }

    async fn remove(&self, level: ContextLevel, context_id: Uuid, _user_id: &str) -> Result<()> {
        self.inner.remove(level, context_id, &self.user_id).await
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        self.inner.sweep(now).await
    }

    async fn count(&self, _user_id: &str) -> Result<u64> {
        self.inner.count(&self.user_id).await
    }

    async fn list(&self, _user_id: &str) -> Result<Vec<ContextCacheEntry>> {
        self.inner.list(&self.user_id).await
    }
}

/// Tokens, filtered to one tenant. `get_by_hash` stays unscoped because it
/// runs before authentication exists.
pub struct ScopedTokenRepository {
    inner: Arc<dyn TokenRepository>,
    user_id: String,
}

impl ScopedTokenRepository {
    pub fn new(inner: Arc<dyn TokenRepository>, user_id: impl Into<String>) -> Self {
        Self {
            inner,
            user_id: user_id.into(),
        }
    }

    async fn owned(&self, id: Uuid) -> Result<Option<ApiToken>> {
        Ok(self
            .inner
            .get_by_id(id)
            .await?
            .filter(|token| token.user_id == self.user_id))
    }
}

#[async_trait]
impl TokenRepository for ScopedTokenRepository {
    async fn create(&self, mut token: ApiToken) -> Result<ApiToken> {
        token.user_id = self.user_id.clone();
        self.inner.create(token).await
    }

    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>> {
        self.inner.get_by_hash(token_hash).await
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ApiToken>> {
        self.owned(id).await
    }

    async fn list(&self, _user_id: &str) -> Result<Vec<ApiToken>> {
        self.inner.list(&self.user_id).await
    }

    async fn save(&self, token: ApiToken) -> Result<ApiToken> {
        if let Some(stored) = self.inner.get_by_id(token.id).await? {
            if stored.user_id != self.user_id {
                return Err(TaskError::cross_tenant_write("Token", token.id));
            }
        }
        self.inner.save(token).await
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.inner.touch(id, at).await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        if self.owned(id).await?.is_none() {
            return Err(TaskError::not_found("Token", id));
        }
        self.inner.delete(id).await
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.inner.cleanup_expired(now).await
    }
}

/// Build the full scoped set for one authenticated user.
pub fn scope_repositories(repos: &Repositories, user_id: &str) -> Repositories {
    Repositories {
        tasks: Arc::new(ScopedTaskRepository::new(repos.tasks.clone(), user_id)),
        subtasks: Arc::new(ScopedSubtaskRepository::new(repos.subtasks.clone(), user_id)),
        projects: Arc::new(ScopedProjectRepository::new(repos.projects.clone(), user_id)),
        branches: Arc::new(ScopedBranchRepository::new(repos.branches.clone(), user_id)),
        agents: Arc::new(ScopedAgentRepository::new(repos.agents.clone(), user_id)),
        contexts: Arc::new(ScopedContextRepository::new(repos.contexts.clone(), user_id)),
        delegations: Arc::new(ScopedDelegationRepository::new(
            repos.delegations.clone(),
            user_id,
        )),
        context_cache: Arc::new(ScopedCacheRepository::new(
            repos.context_cache.clone(),
            user_id,
        )),
        tokens: Arc::new(ScopedTokenRepository::new(repos.tokens.clone(), user_id)),
        events: repos.events.clone(),
    }
}
