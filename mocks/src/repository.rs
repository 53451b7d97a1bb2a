//! Thread-safe in-memory implementations of every repository trait.
//!
//! One [`InMemoryStore`] holds all tables behind parking_lot mutexes; the
//! per-trait wrappers share it via `Arc`. The task repository supports
//! error injection and call tracking for failure-path tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use taskloom_core::{
    context::{ContextCacheEntry, ContextDelegation, ContextLevel, ContextRecord},
    error::{Result, TaskError},
    events::{EventFilter, EventStore, StoredEvent},
    models::{
        rollup_progress, Agent, AgentStatus, Branch, NewAgent, NewBranch, NewProject, NewSubtask,
        NewTask, Project, Subtask, Task, TaskDependency, TaskFilter, TaskStatus, UpdateAgent,
        UpdateProject, UpdateSubtask, UpdateTask,
    },
    repository::{
        AgentRepository, BranchRepository, ContextCacheRepository, ContextRepository,
        DelegationRepository, ProjectRepository, Repositories, SubtaskRepository, TaskRepository,
        TokenRepository,
    },
    token::ApiToken,
};
use uuid::Uuid;

/// All in-memory tables plus the test instrumentation.
#[derive(Default)]
pub struct InMemoryStore {
    pub tasks: Mutex<HashMap<Uuid, Task>>,
    pub edges: Mutex<Vec<TaskDependency>>,
    pub subtasks: Mutex<HashMap<Uuid, Subtask>>,
    pub projects: Mutex<HashMap<Uuid, Project>>,
    pub branches: Mutex<HashMap<Uuid, Branch>>,
    pub agents: Mutex<HashMap<Uuid, Agent>>,
    pub contexts: Mutex<Vec<ContextRecord>>,
    pub delegations: Mutex<Vec<ContextDelegation>>,
    pub cache_entries: Mutex<Vec<ContextCacheEntry>>,
    pub tokens: Mutex<HashMap<Uuid, ApiToken>>,
    pub events: Mutex<Vec<StoredEvent>>,

    error_injection: Mutex<Option<TaskError>>,
    call_history: Mutex<Vec<String>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build the tenant-agnostic repository set backed by this store.
    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            tasks: Arc::new(InMemoryTaskRepository(self.clone())),
            subtasks: Arc::new(InMemorySubtaskRepository(self.clone())),
            projects: Arc::new(InMemoryProjectRepository(self.clone())),
            branches: Arc::new(InMemoryBranchRepository(self.clone())),
            agents: Arc::new(InMemoryAgentRepository(self.clone())),
            contexts: Arc::new(InMemoryContextRepository(self.clone())),
            delegations: Arc::new(InMemoryDelegationRepository(self.clone())),
            context_cache: Arc::new(InMemoryCacheRepository(self.clone())),
            tokens: Arc::new(InMemoryTokenRepository(self.clone())),
            events: Arc::new(InMemoryEventStore(self.clone())),
        }
    }

    /// Inject an error for the next task-repository operation.
    pub fn inject_error(&self, error: TaskError) {
        *self.error_injection.lock() = Some(error);
    }

    pub fn call_history(&self) -> Vec<String> {
        self.call_history.lock().clone()
    }

    pub fn assert_called(&self, method: &str) {
        let history = self.call_history.lock();
        assert!(
            history.iter().any(|call| call.contains(method)),
            "Method '{}' was not called. Call history: {:?}",
            method,
            *history
        );
    }

    fn record_call(&self, method: &str) {
        self.call_history.lock().push(method.to_string());
    }

    fn take_injected_error(&self) -> Result<()> {
        match self.error_injection.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn rollup_parent(&self, task_id: Uuid) {
        let subtasks: Vec<Subtask> = self
            .subtasks
            .lock()
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        if let Some(task) = self.tasks.lock().get_mut(&task_id) {
            task.progress_percentage = rollup_progress(&subtasks);
            task.updated_at = Utc::now();
        }
    }

    fn refresh_branch_counters(&self, branch_id: Uuid) {
        let tasks = self.tasks.lock();
        let total = tasks.values().filter(|t| t.branch_id == branch_id).count() as i64;
        let done = tasks
            .values()
            .filter(|t| t.branch_id == branch_id && t.status == TaskStatus::Done)
            .count() as i64;
        drop(tasks);
        if let Some(branch) = self.branches.lock().get_mut(&branch_id) {
            branch.task_count = total;
            branch.completed_task_count = done;
            branch.updated_at = Utc::now();
        }
    }
}

pub struct InMemoryTaskRepository(Arc<InMemoryStore>);

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn create(&self, task: NewTask) -> Result<Task> {
        self.0.record_call("tasks.create");
        self.0.take_injected_error()?;

        if task.title.trim().is_empty() {
            return Err(TaskError::empty_field("title"));
        }

        let now = Utc::now();
        let stored = Task {
            id: Uuid::new_v4(),
            branch_id: task.branch_id,
            title: task.title,
            description: task.description,
            status: task.status.unwrap_or(TaskStatus::Todo),
            priority: task.priority.unwrap_or_default(),
            details: task.details,
            estimated_effort: task.estimated_effort,
            due_date: task.due_date,
            completed_at: None,
            completion_summary: None,
            testing_notes: None,
            context_id: None,
            progress_percentage: 0.0,
            assignees: task.assignees,
            labels: task.labels,
            dependencies: task.dependencies.clone(),
            user_id: task.user_id.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        self.0.tasks.lock().insert(stored.id, stored.clone());

        let mut edges = self.0.edges.lock();
        for depends_on in &task.dependencies {
            edges.push(TaskDependency {
                task_id: stored.id,
                depends_on_task_id: *depends_on,
                dependency_type: taskloom_core::DependencyType::Blocks,
                user_id: task.user_id.clone(),
            });
        }
        drop(edges);

        self.0.refresh_branch_counters(stored.branch_id);
        Ok(stored)
    }

    async fn update(&self, id: Uuid, updates: UpdateTask) -> Result<Task> {
        self.0.record_call("tasks.update");
        self.0.take_injected_error()?;

        let mut tasks = self.0.tasks.lock();
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| TaskError::not_found("Task", id))?;

        if let Some(expected) = updates.expected_version {
            if expected != task.version {
                return Err(TaskError::concurrent_modification("Task", id));
            }
        }

        if let Some(title) = updates.title {
            task.title = title;
        }
        if let Some(description) = updates.description {
            task.description = description;
        }
        if let Some(status) = updates.status {
            task.status = status;
            task.completed_at = (status == TaskStatus::Done).then(Utc::now);
        }
        if let Some(priority) = updates.priority {
            task.priority = priority;
        }
        if let Some(details) = updates.details {
            task.details = Some(details);
        }
        if let Some(effort) = updates.estimated_effort {
            task.estimated_effort = Some(effort);
        }
        if let Some(due) = updates.due_date {
            task.due_date = Some(due);
        }
        if let Some(summary) = updates.completion_summary {
            task.completion_summary = Some(summary);
        }
        if let Some(notes) = updates.testing_notes {
            task.testing_notes = Some(notes);
        }
        if let Some(context_id) = updates.context_id {
            task.context_id = Some(context_id);
        }
        if let Some(progress) = updates.progress_percentage {
            task.progress_percentage = progress;
        }
        if let Some(assignees) = updates.assignees {
            task.assignees = assignees;
        }
        if let Some(labels) = updates.labels {
            task.labels = labels;
        }
        task.version += 1;
        task.updated_at = Utc::now();
        let result = task.clone();
        let branch_id = task.branch_id;
        drop(tasks);

        self.0.refresh_branch_counters(branch_id);
        Ok(result)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Task>> {
        self.0.record_call("tasks.get_by_id");
        self.0.take_injected_error()?;
        Ok(self.0.tasks.lock().get(&id).cloned())
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        self.0.record_call("tasks.list");
        self.0.take_injected_error()?;

        let branch_scope: Option<Vec<Uuid>> = filter.project_id.map(|project_id| {
            self.0
                .branches
                .lock()
                .values()
                .filter(|b| b.project_id == project_id)
                .map(|b| b.id)
                .collect()
        });

        let mut tasks: Vec<Task> = self
            .0
            .tasks
            .lock()
            .values()
            .filter(|t| {
                filter.user_id.as_ref().map(|u| &t.user_id == u).unwrap_or(true)
                    && filter.branch_id.map(|b| t.branch_id == b).unwrap_or(true)
                    && branch_scope
                        .as_ref()
                        .map(|scope| scope.contains(&t.branch_id))
                        .unwrap_or(true)
                    && filter.status.map(|s| t.status == s).unwrap_or(true)
                    && filter.priority.map(|p| t.priority == p).unwrap_or(true)
                    && filter
                        .assignee
                        .as_ref()
                        .map(|a| t.assignees.contains(a))
                        .unwrap_or(true)
                    && (filter.labels.is_empty()
                        || filter.labels.iter().any(|l| t.labels.contains(l)))
            })
            .cloned()
            .collect();

        tasks.sort_by_key(|t| t.created_at);
        if let Some(offset) = filter.offset {
            tasks = tasks.into_iter().skip(offset as usize).collect();
        }
        if let Some(limit) = filter.limit {
            tasks.truncate(limit as usize);
        }
        Ok(tasks)
    }

    async fn search(&self, query: &str, filter: TaskFilter) -> Result<Vec<Task>> {
        self.0.record_call("tasks.search");
        let query = query.to_lowercase();
        let mut tasks = self.list(filter).await?;
        tasks.retain(|t| {
            t.title.to_lowercase().contains(&query)
                || t.description.to_lowercase().contains(&query)
                || t.details
                    .as_ref()
                    .map(|d| d.to_lowercase().contains(&query))
                    .unwrap_or(false)
        });
        Ok(tasks)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.0.record_call("tasks.delete");
        self.0.take_injected_error()?;

        let removed = self
            .0
            .tasks
            .lock()
            .remove(&id)
            .ok_or_else(|| TaskError::not_found("Task", id))?;
        self.0
            .edges
            .lock()
            .retain(|e| e.task_id != id && e.depends_on_task_id != id);
        self.0.subtasks.lock().retain(|_, s| s.task_id != id);
        self.0.refresh_branch_counters(removed.branch_id);
        Ok(())
    }

    async fn add_dependency(&self, dependency: TaskDependency) -> Result<()> {
        self.0.record_call("tasks.add_dependency");
        self.0.take_injected_error()?;

        if dependency.task_id == dependency.depends_on_task_id {
            return Err(TaskError::Validation(
                "A task cannot depend on itself".to_string(),
            ));
        }
        let mut edges = self.0.edges.lock();
        let exists = edges.iter().any(|e| {
            e.task_id == dependency.task_id
                && e.depends_on_task_id == dependency.depends_on_task_id
        });
        if !exists {
            if let Some(task) = self.0.tasks.lock().get_mut(&dependency.task_id) {
                task.dependencies.push(dependency.depends_on_task_id);
            }
            edges.push(dependency);
        }
        Ok(())
    }

    async fn remove_dependency(&self, task_id: Uuid, depends_on: Uuid) -> Result<()> {
        self.0.record_call("tasks.remove_dependency");
        self.0
            .edges
            .lock()
            .retain(|e| !(e.task_id == task_id && e.depends_on_task_id == depends_on));
        if let Some(task) = self.0.tasks.lock().get_mut(&task_id) {
            task.dependencies.retain(|d| *d != depends_on);
        }
        Ok(())
    }

    async fn dependencies_of(&self, task_id: Uuid) -> Result<Vec<TaskDependency>> {
        Ok(self
            .0
            .edges
            .lock()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn dependents_of(&self, task_id: Uuid) -> Result<Vec<TaskDependency>> {
        Ok(self
            .0
            .edges
            .lock()
            .iter()
            .filter(|e| e.depends_on_task_id == task_id)
            .cloned()
            .collect())
    }
}

pub struct InMemorySubtaskRepository(Arc<InMemoryStore>);

#[async_trait]
impl SubtaskRepository for InMemorySubtaskRepository {
    async fn create(&self, subtask: NewSubtask) -> Result<Subtask> {
        if subtask.title.trim().is_empty() {
            return Err(TaskError::empty_field("title"));
        }
        let now = Utc::now();
        let stored = Subtask {
            id: Uuid::new_v4(),
            task_id: subtask.task_id,
            title: subtask.title,
            description: subtask.description,
            status: TaskStatus::Todo,
            priority: subtask.priority.unwrap_or_default(),
            assignees: subtask.assignees,
            progress_percentage: 0.0,
            progress_notes: String::new(),
            blockers: String::new(),
            completion_summary: None,
            impact_on_parent: None,
            insights_found: vec![],
            user_id: subtask.user_id,
            created_at: now,
            updated_at: now,
        };
        self.0.subtasks.lock().insert(stored.id, stored.clone());
        self.0.rollup_parent(stored.task_id);
        Ok(stored)
    }

    async fn update(&self, id: Uuid, updates: UpdateSubtask) -> Result<Subtask> {
        let mut subtasks = self.0.subtasks.lock();
        let subtask = subtasks
            .get_mut(&id)
            .ok_or_else(|| TaskError::not_found("Subtask", id))?;

        if let Some(title) = updates.title {
            subtask.title = title;
        }
        if let Some(description) = updates.description {
            subtask.description = description;
        }
        if let Some(status) = updates.status {
            subtask.status = status;
            if status == TaskStatus::Done {
                subtask.progress_percentage = 100.0;
            }
        }
        if let Some(priority) = updates.priority {
            subtask.priority = priority;
        }
        if let Some(assignees) = updates.assignees {
            subtask.assignees = assignees;
        }
        if let Some(progress) = updates.progress_percentage {
            subtask.progress_percentage = progress;
        }
        if let Some(notes) = updates.progress_notes {
            subtask.progress_notes = notes;
        }
        if let Some(blockers) = updates.blockers {
            subtask.blockers = blockers;
        }
        if let Some(summary) = updates.completion_summary {
            subtask.completion_summary = Some(summary);
        }
        if let Some(impact) = updates.impact_on_parent {
            subtask.impact_on_parent = Some(impact);
        }
        if let Some(insights) = updates.insights_found {
            subtask.insights_found = insights;
        }
        subtask.updated_at = Utc::now();
        let result = subtask.clone();
        drop(subtasks);

        self.0.rollup_parent(result.task_id);
        Ok(result)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Subtask>> {
        Ok(self.0.subtasks.lock().get(&id).cloned())
    }

    async fn list_for_task(&self, task_id: Uuid) -> Result<Vec<Subtask>> {
        let mut subtasks: Vec<Subtask> = self
            .0
            .subtasks
            .lock()
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        subtasks.sort_by_key(|s| s.created_at);
        Ok(subtasks)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let removed = self
            .0
            .subtasks
            .lock()
            .remove(&id)
            .ok_or_else(|| TaskError::not_found("Subtask", id))?;
        self.0.rollup_parent(removed.task_id);
        Ok(())
    }
}

pub struct InMemoryProjectRepository(Arc<InMemoryStore>);

#[async_trait]
impl ProjectRepository for InMemoryProjectRepository {
    async fn create(&self, project: NewProject) -> Result<Project> {
        if project.name.trim().is_empty() {
            return Err(TaskError::empty_field("name"));
        }
        let mut projects = self.0.projects.lock();
        if projects
            .values()
            .any(|p| p.user_id == project.user_id && p.name == project.name)
        {
            return Err(TaskError::DuplicateName(project.name));
        }
        let now = Utc::now();
        let stored = Project {
            id: Uuid::new_v4(),
            name: project.name,
            description: project.description,
            status: "active".to_string(),
            user_id: project.user_id,
            created_at: now,
            updated_at: now,
        };
        projects.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, id: Uuid, updates: UpdateProject) -> Result<Project> {
        let mut projects = self.0.projects.lock();
        let project = projects
            .get_mut(&id)
            .ok_or_else(|| TaskError::not_found("Project", id))?;
        if let Some(name) = updates.name {
            project.name = name;
        }
        if let Some(description) = updates.description {
            project.description = description;
        }
        if let Some(status) = updates.status {
            project.status = status;
        }
        project.updated_at = Utc::now();
        Ok(project.clone())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Project>> {
        Ok(self.0.projects.lock().get(&id).cloned())
    }

    async fn get_by_name(&self, name: &str, user_id: &str) -> Result<Option<Project>> {
        Ok(self
            .0
            .projects
            .lock()
            .values()
            .find(|p| p.name == name && p.user_id == user_id)
            .cloned())
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> = self
            .0
            .projects
            .lock()
            .values()
            .filter(|p| user_id.map(|u| p.user_id == u).unwrap_or(true))
            .cloned()
            .collect();
        projects.sort_by_key(|p| p.created_at);
        Ok(projects)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.0.projects.lock().remove(&id);
        // Cascade: branches, their tasks, and agents of the project
        let branch_ids: Vec<Uuid> = self
            .0
            .branches
            .lock()
            .values()
            .filter(|b| b.project_id == id)
            .map(|b| b.id)
            .collect();
        self.0.branches.lock().retain(|_, b| b.project_id != id);
        self.0
            .tasks
            .lock()
            .retain(|_, t| !branch_ids.contains(&t.branch_id));
        self.0.agents.lock().retain(|_, a| a.project_id != id);
        Ok(())
    }
}

pub struct InMemoryBranchRepository(Arc<InMemoryStore>);

#[async_trait]
impl BranchRepository for InMemoryBranchRepository {
    async fn create(&self, branch: NewBranch) -> Result<Branch> {
        if branch.name.trim().is_empty() {
            return Err(TaskError::empty_field("name"));
        }
        let mut branches = self.0.branches.lock();
        if branches
            .values()
            .any(|b| b.project_id == branch.project_id && b.name == branch.name)
        {
            return Err(TaskError::DuplicateName(branch.name));
        }
        let now = Utc::now();
        let stored = Branch {
            id: Uuid::new_v4(),
            project_id: branch.project_id,
            name: branch.name,
            description: branch.description,
            assigned_agent_id: None,
            status: "active".to_string(),
            task_count: 0,
            completed_task_count: 0,
            user_id: branch.user_id,
            created_at: now,
            updated_at: now,
        };
        branches.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Branch>> {
        Ok(self.0.branches.lock().get(&id).cloned())
    }

    async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Branch>> {
        let mut branches: Vec<Branch> = self
            .0
            .branches
            .lock()
            .values()
            .filter(|b| b.project_id == project_id)
            .cloned()
            .collect();
        branches.sort_by_key(|b| b.created_at);
        Ok(branches)
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<Branch>> {
        let mut branches: Vec<Branch> = self
            .0
            .branches
            .lock()
            .values()
            .filter(|b| user_id.map(|u| b.user_id == u).unwrap_or(true))
            .cloned()
            .collect();
        branches.sort_by_key(|b| b.created_at);
        Ok(branches)
    }

    async fn save(&self, branch: Branch) -> Result<Branch> {
        let mut branches = self.0.branches.lock();
        if !branches.contains_key(&branch.id) {
            return Err(TaskError::not_found("Branch", branch.id));
        }
        branches.insert(branch.id, branch.clone());
        Ok(branch)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.0.branches.lock().remove(&id);
        self.0.tasks.lock().retain(|_, t| t.branch_id != id);
        Ok(())
    }
}

pub struct InMemoryAgentRepository(Arc<InMemoryStore>);

#[async_trait]
impl AgentRepository for InMemoryAgentRepository {
    async fn create(&self, agent: NewAgent) -> Result<Agent> {
        if agent.name.trim().is_empty() {
            return Err(TaskError::empty_field("name"));
        }
        let now = Utc::now();
        let stored = Agent {
            id: Uuid::new_v4(),
            project_id: agent.project_id,
            name: agent.name,
            description: agent.description,
            role: agent.role,
            capabilities: agent.capabilities,
            status: AgentStatus::Available,
            availability_score: 1.0,
            user_id: agent.user_id,
            created_at: now,
            updated_at: now,
        };
        self.0.agents.lock().insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update(&self, id: Uuid, updates: UpdateAgent) -> Result<Agent> {
        let mut agents = self.0.agents.lock();
        let agent = agents
            .get_mut(&id)
            .ok_or_else(|| TaskError::not_found("Agent", id))?;
        if let Some(name) = updates.name {
            agent.name = name;
        }
        if let Some(description) = updates.description {
            agent.description = description;
        }
        if let Some(role) = updates.role {
            agent.role = role;
        }
        if let Some(capabilities) = updates.capabilities {
            agent.capabilities = capabilities;
        }
        if let Some(status) = updates.status {
            agent.status = status;
        }
        if let Some(score) = updates.availability_score {
            agent.availability_score = score;
        }
        agent.updated_at = Utc::now();
        Ok(agent.clone())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Agent>> {
        Ok(self.0.agents.lock().get(&id).cloned())
    }

    async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Agent>> {
        let mut agents: Vec<Agent> = self
            .0
            .agents
            .lock()
            .values()
            .filter(|a| a.project_id == project_id)
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.0.agents.lock().remove(&id);
        for branch in self.0.branches.lock().values_mut() {
            if branch.assigned_agent_id == Some(id) {
                branch.assigned_agent_id = None;
            }
        }
        Ok(())
    }
}

pub struct InMemoryContextRepository(Arc<InMemoryStore>);

#[async_trait]
impl ContextRepository for InMemoryContextRepository {
    async fn get(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
    ) -> Result<Option<ContextRecord>> {
        Ok(self
            .0
            .contexts
            .lock()
            .iter()
            .find(|r| {
                r.level() == level && r.context_id() == context_id && r.user_id() == Some(user_id)
            })
            .cloned())
    }

    async fn get_shared(
        &self,
        level: ContextLevel,
        context_id: Uuid,
    ) -> Result<Option<ContextRecord>> {
        Ok(self
            .0
            .contexts
            .lock()
            .iter()
            .find(|r| r.level() == level && r.context_id() == context_id && r.user_id().is_none())
            .cloned())
    }

    async fn upsert(&self, record: ContextRecord) -> Result<ContextRecord> {
        let mut contexts = self.0.contexts.lock();
        contexts.retain(|r| {
            !(r.level() == record.level()
                && r.context_id() == record.context_id()
                && r.user_id() == record.user_id())
        });
        contexts.push(record.clone());
        Ok(record)
    }

    async fn delete(&self, level: ContextLevel, context_id: Uuid, user_id: &str) -> Result<()> {
        self.0.contexts.lock().retain(|r| {
            !(r.level() == level && r.context_id() == context_id && r.user_id() == Some(user_id))
        });
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
        Ok(self
            .0
            .contexts
            .lock()
            .iter()
            .filter(|r| {
                r.level() == child_level
                    && r.user_id() == Some(user_id)
                    && (level == ContextLevel::Global
                        || r.parent().map(|(_, id)| id) == Some(context_id))
            })
            .cloned()
            .collect())
    }
}

pub struct InMemoryDelegationRepository(Arc<InMemoryStore>);

#[async_trait]
impl DelegationRepository for InMemoryDelegationRepository {
    async fn create(&self, delegation: ContextDelegation) -> Result<ContextDelegation> {
        self.0.delegations.lock().push(delegation.clone());
        Ok(delegation)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ContextDelegation>> {
        Ok(self
            .0
            .delegations
            .lock()
            .iter()
            .find(|d| d.id == id)
            .cloned())
    }

    async fn list(&self, user_id: &str, processed: Option<bool>) -> Result<Vec<ContextDelegation>> {
        let mut delegations: Vec<ContextDelegation> = self
            .0
            .delegations
            .lock()
            .iter()
            .filter(|d| {
                d.user_id == user_id && processed.map(|p| d.processed == p).unwrap_or(true)
            })
            .cloned()
            .collect();
        delegations.sort_by_key(|d| d.created_at);
        Ok(delegations)
    }

    async fn save(&self, delegation: ContextDelegation) -> Result<ContextDelegation> {
        let mut delegations = self.0.delegations.lock();
        match delegations.iter_mut().find(|d| d.id == delegation.id) {
            Some(existing) => {
                *existing = delegation.clone();
                Ok(delegation)
            }
            None => Err(TaskError::not_found("Delegation", delegation.id)),
        }
    }
}

pub struct InMemoryCacheRepository(Arc<InMemoryStore>);

#[async_trait]
impl ContextCacheRepository for InMemoryCacheRepository {
    async fn get(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
    ) -> Result<Option<ContextCacheEntry>> {
        Ok(self
            .0
            .cache_entries
            .lock()
            .iter()
            .find(|e| {
                e.context_level == level && e.context_id == context_id && e.user_id == user_id
            })
            .cloned())
    }

    async fn upsert(&self, entry: ContextCacheEntry) -> Result<()> {
        let mut entries = self.0.cache_entries.lock();
        entries.retain(|e| {
            !(e.context_level == entry.context_level
                && e.context_id == entry.context_id
                && e.user_id == entry.user_id)
        });
        entries.push(entry);
        Ok(())
    }

    async fn record_hit(&self, level: ContextLevel, context_id: Uuid, user_id: &str) -> Result<()> {
        if let Some(entry) = self.0.cache_entries.lock().iter_mut().find(|e| {
            e.context_level == level && e.context_id == context_id && e.user_id == user_id
        }) {
            entry.hit_count += 1;
            entry.last_hit = Utc::now();
        }
        Ok(())
    }

    async fn invalidate(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        user_id: &str,
        reason: &str,
    ) -> Result<u64> {
        let mut count = 0;
        for entry in self.0.cache_entries.lock().iter_mut() {
            if entry.context_level == level
                && entry.context_id == context_id
                && entry.user_id == user_id
                && !entry.invalidated
            {
                entry.invalidated = true;
                entry.invalidation_reason = Some(reason.to_string());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn invalidate_descendants(
        &self,
        ancestor_id: Uuid,
        user_id: &str,
        reason: &str,
    ) -> Result<u64> {
        let mut count = 0;
        for entry in self.0.cache_entries.lock().iter_mut() {
            if entry.user_id == user_id
                && !entry.invalidated
                && entry.parent_chain.contains(&ancestor_id)
            {
                entry.invalidated = true;
                entry.invalidation_reason = Some(reason.to_string());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn invalidate_all(&self, user_id: &str, reason: &str) -> Result<u64> {
        let mut count = 0;
        for entry in self.0.cache_entries.lock().iter_mut() {
            if entry.user_id == user_id && !entry.invalidated {
                entry.invalidated = true;
                entry.invalidation_reason = Some(reason.to_string());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn remove(&self, level: ContextLevel, context_id: Uuid, user_id: &str) -> Result<()> {
        self.0.cache_entries.lock().retain(|e| {
            !(e.context_level == level && e.context_id == context_id && e.user_id == user_id)
        });
        Ok(())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.0.cache_entries.lock();
        let before = entries.len();
        entries.retain(|e| !e.invalidated && e.expires_at > now);
        Ok((before - entries.len()) as u64)
    }

    async fn count(&self, user_id: &str) -> Result<u64> {
        Ok(self
            .0
            .cache_entries
            .lock()
            .iter()
            .filter(|e| e.user_id == user_id)
            .count() as u64)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ContextCacheEntry>> {
        Ok(self
            .0
            .cache_entries
            .lock()
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }
}

pub struct InMemoryTokenRepository(Arc<InMemoryStore>);

#[async_trait]
impl TokenRepository for InMemoryTokenRepository {
    async fn create(&self, token: ApiToken) -> Result<ApiToken> {
        let mut tokens = self.0.tokens.lock();
        if tokens.values().any(|t| t.token_hash == token.token_hash) {
            return Err(TaskError::DuplicateName("token_hash".to_string()));
        }
        tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn get_by_hash(&self, token_hash: &str) -> Result<Option<ApiToken>> {
        Ok(self
            .0
            .tokens
            .lock()
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<ApiToken>> {
        Ok(self.0.tokens.lock().get(&id).cloned())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ApiToken>> {
        let mut tokens: Vec<ApiToken> = self
            .0
            .tokens
            .lock()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.created_at);
        Ok(tokens)
    }

    async fn save(&self, token: ApiToken) -> Result<ApiToken> {
        let mut tokens = self.0.tokens.lock();
        let existing = tokens
            .get_mut(&token.id)
            .ok_or_else(|| TaskError::not_found("Token", token.id))?;
        existing.is_active = token.is_active;
        existing.usage_count = token.usage_count;
        existing.last_used_at = token.last_used_at;
        Ok(existing.clone())
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(token) = self.0.tokens.lock().get_mut(&id) {
            token.usage_count += 1;
            token.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.0.tokens.lock().remove(&id);
        Ok(())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut count = 0;
        for token in self.0.tokens.lock().values_mut() {
            if token.is_active && token.is_expired(now) {
                token.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }
}

pub struct InMemoryEventStore(Arc<InMemoryStore>);

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: StoredEvent) -> Result<Uuid> {
        let id = event.event_id;
        self.0.events.lock().push(event);
        Ok(id)
    }

    async fn get(&self, filter: EventFilter) -> Result<Vec<StoredEvent>> {
        let mut events: Vec<StoredEvent> = self
            .0
            .events
            .lock()
            .iter()
            .filter(|e| {
                filter
                    .aggregate_id
                    .map(|id| e.aggregate_id == Some(id))
                    .unwrap_or(true)
                    && filter
                        .event_type
                        .as_ref()
                        .map(|t| &e.event_type == t)
                        .unwrap_or(true)
                    && filter.from_timestamp.map(|t| e.timestamp >= t).unwrap_or(true)
                    && filter.to_timestamp.map(|t| e.timestamp <= t).unwrap_or(true)
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(filter.limit.unwrap_or(100) as usize);
        Ok(events)
    }

    async fn get_aggregate(
        &self,
        aggregate_id: Uuid,
        from_version: Option<i64>,
    ) -> Result<Vec<StoredEvent>> {
        let mut events: Vec<StoredEvent> = self
            .0
            .events
            .lock()
            .iter()
            .filter(|e| {
                e.aggregate_id == Some(aggregate_id)
                    && from_version.map(|v| e.version > v).unwrap_or(true)
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| a.version.cmp(&b.version).then(a.timestamp.cmp(&b.timestamp)));
        Ok(events)
    }

    async fn latest_snapshot(&self, aggregate_id: Uuid) -> Result<Option<StoredEvent>> {
        Ok(self
            .0
            .events
            .lock()
            .iter()
            .filter(|e| e.aggregate_id == Some(aggregate_id) && e.is_snapshot())
            .max_by_key(|e| e.timestamp)
            .cloned())
    }

    async fn clear(&self) -> Result<()> {
        self.0.events.lock().clear();
        Ok(())
    }
}
