//! Orchestration facade: routes `manage_*` tool calls to the core
//! services and maps results into the canonical response envelope.
//!
//! The facade resolves the authenticated user, scopes every repository,
//! validates required fields per action, and attaches workflow guidance
//! on success paths only.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use taskloom_core::{
    context::{ContextLevel, ContextRecord, TriggerType},
    context_cache::ContextCacheService,
    error::{Result, TaskError},
    events,
    hierarchy::ContextHierarchyService,
    hint_engine::HintEngine,
    hints::{HintType, RuleContext},
    models::{
        NewAgent, NewBranch, NewProject, NewSubtask, NewTask, Task, TaskDependency, TaskFilter,
        TaskStatus, UpdateAgent, UpdateProject, UpdateSubtask, UpdateTask,
    },
    protocol::{self, parse_params, to_data},
    repository::Repositories,
    scoped::scope_repositories,
    selector::{NextTaskResult, NextTaskSelector, SelectorFilters},
    token::{ApiToken, Scope},
    validation::{DependencyGraph, Validator},
    DependencyType,
};

use crate::auth::{hash_token, TokenValidator};

/// Wiring knobs the facade needs from configuration.
#[derive(Debug, Clone)]
pub struct FacadeConfig {
    pub cache_ttl_hours: i64,
    pub cache_pressure_threshold: u64,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        Self {
            cache_ttl_hours: taskloom_core::context_cache::DEFAULT_TTL_HOURS,
            cache_pressure_threshold: taskloom_core::context_cache::DEFAULT_PRESSURE_THRESHOLD,
        }
    }
}

/// The composition root for RPC operations.
pub struct OrchestrationFacade {
    base: Repositories,
    hints: Arc<HintEngine>,
    validator: Arc<TokenValidator>,
    config: FacadeConfig,
    /// Cache services per user; holds the single-flight maps, so the same
    /// instance must serve every request of a user.
    cache_services: Mutex<HashMap<String, Arc<ContextCacheService>>>,
}

impl OrchestrationFacade {
    pub fn new(
        base: Repositories,
        validator: Arc<TokenValidator>,
        config: FacadeConfig,
    ) -> Self {
        let hints = Arc::new(HintEngine::new(base.events.clone()));
        Self {
            base,
            hints,
            validator,
            config,
            cache_services: Mutex::new(HashMap::new()),
        }
    }

    fn scoped(&self, user_id: &str) -> Repositories {
        scope_repositories(&self.base, user_id)
    }

    async fn cache_service(&self, user_id: &str) -> Arc<ContextCacheService> {
        let mut services = self.cache_services.lock().await;
        services
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let scoped_cache = Arc::new(taskloom_core::scoped::ScopedCacheRepository::new(
                    self.base.context_cache.clone(),
                    user_id,
                ));
                Arc::new(ContextCacheService::new(
                    scoped_cache,
                    self.config.cache_ttl_hours,
                    self.config.cache_pressure_threshold,
                    user_id,
                ))
            })
            .clone()
    }

    async fn hierarchy(&self, scoped: &Repositories, user_id: &str) -> Arc<ContextHierarchyService> {
        Arc::new(ContextHierarchyService::new(
            scoped.contexts.clone(),
            scoped.delegations.clone(),
            self.cache_service(user_id).await,
            scoped.events.clone(),
            user_id,
        ))
    }

    /// Route one tool call. Always answers with an envelope; errors never
    /// escape as panics or transport failures.
    pub async fn dispatch(
        &self,
        tool: &str,
        action: &str,
        args: Map<String, Value>,
        user_id: &str,
    ) -> Value {
        let operation = format!("{tool}.{action}");
        debug!(%operation, %user_id, "Dispatching tool call");

        let result = match tool {
            "manage_task" => self.manage_task(action, &args, user_id).await,
            "manage_subtask" => self.manage_subtask(action, &args, user_id).await,
            "manage_project" => self.manage_project(action, &args, user_id).await,
            "manage_context" => self.manage_context(action, &args, user_id).await,
            "manage_agent" => self.manage_agent(action, &args, user_id).await,
            "manage_token" => self.manage_token(action, &args, user_id).await,
            _ => Err(TaskError::unknown_action(tool, action)),
        };

        match result {
            Ok(envelope) => envelope,
            Err(error) => protocol::failure(&operation, &error),
        }
    }

    // -- manage_task -----------------------------------------------------

    async fn manage_task(&self, action: &str, args: &Map<String, Value>, user_id: &str) -> Result<Value> {
        let scoped = self.scoped(user_id);
        match action {
            "create" => {
                let params: protocol::CreateTaskParams = parse_params(args)?;
                Validator::validate_name("title", &params.title)?;
                Validator::validate_description(&params.description)?;

                scoped
                    .branches
                    .get_by_id(params.branch_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Branch", params.branch_id))?;
                for dep in &params.dependencies {
                    scoped
                        .tasks
                        .get_by_id(*dep)
                        .await?
                        .ok_or_else(|| TaskError::not_found("Task", dep))?;
                }

                let task = scoped
                    .tasks
                    .create(NewTask {
                        branch_id: params.branch_id,
                        title: params.title,
                        description: params.description,
                        status: params.status,
                        priority: params.priority,
                        details: params.details,
                        estimated_effort: params.estimated_effort,
                        due_date: params.due_date,
                        assignees: params.assignees,
                        labels: params.labels,
                        dependencies: params.dependencies,
                        user_id: String::new(),
                    })
                    .await?;

                self.append_event(events::task_created(task.id, &task.title, user_id, task.version))
                    .await;

                Ok(protocol::success_with_guidance(
                    to_data(&task)?,
                    protocol::guidance(&[
                        "Create subtasks to break the work down",
                        "Call manage_task(action='next') to pick up work",
                    ]),
                ))
            }
            "update" => {
                let params: protocol::UpdateTaskParams = parse_params(args)?;
                let task = self.require_task(&scoped, params.task_id).await?;

                if let Some(next_status) = params.status {
                    self.gate_status_change(&scoped, &task, next_status).await?;
                }

                let previous_status = task.status;
                let updated = scoped
                    .tasks
                    .update(
                        params.task_id,
                        UpdateTask {
                            title: params.title,
                            description: params.description,
                            status: params.status,
                            priority: params.priority,
                            details: params.details,
                            estimated_effort: params.estimated_effort,
                            due_date: params.due_date,
                            testing_notes: params.testing_notes,
                            assignees: params.assignees,
                            labels: params.labels,
                            expected_version: params.expected_version,
                            ..Default::default()
                        },
                    )
                    .await?;

                if previous_status != updated.status {
                    self.after_status_change(&scoped, &updated, previous_status, user_id)
                        .await;
                }
                Ok(protocol::success(to_data(&updated)?))
            }
            "get" => {
                let params: protocol::GetTaskParams = parse_params(args)?;
                let task = self.require_task(&scoped, params.task_id).await?;
                let mut data = to_data(&task)?;

                if params.include_context {
                    let hierarchy = self.hierarchy(&scoped, user_id).await;
                    match hierarchy.resolve(ContextLevel::Task, task.id).await {
                        Ok(document) => {
                            data["context_data"] = document;
                            data["context_available"] = json!(true);
                        }
                        Err(err) => {
                            debug!(task_id = %task.id, error = %err, "Context unavailable for get");
                            data["context_available"] = json!(false);
                        }
                    }
                }
                Ok(protocol::success(data))
            }
            "list" => {
                let params: protocol::ListTasksParams = parse_params(args)?;
                let tasks = scoped.tasks.list(list_filter(&params)).await?;
                Ok(protocol::success(json!({
                    "count": tasks.len(),
                    "tasks": to_data(&tasks)?,
                })))
            }
            "search" => {
                let params: protocol::SearchTasksParams = parse_params(args)?;
                if params.query.trim().is_empty() {
                    return Err(TaskError::missing_field(
                        "query",
                        "non-empty string",
                        "provide a search query",
                    ));
                }
                let tasks = scoped
                    .tasks
                    .search(&params.query, list_filter(&params.filter))
                    .await?;
                Ok(protocol::success(json!({
                    "count": tasks.len(),
                    "tasks": to_data(&tasks)?,
                })))
            }
            "next" => {
                let params: protocol::NextTaskParams = parse_params(args)?;
                let hierarchy = self.hierarchy(&scoped, user_id).await;
                let selector = NextTaskSelector::new(
                    scoped.tasks.clone(),
                    scoped.subtasks.clone(),
                    scoped.branches.clone(),
                    scoped.contexts.clone(),
                    hierarchy.clone(),
                    user_id,
                );
                let filters = SelectorFilters {
                    assignee: params.assignee,
                    project_id: params.project_id,
                    branch_id: params.branch_id,
                    labels: params.labels,
                };
                let result = selector.next(&filters, params.include_context).await?;

                // Hint enrichment rides along when a task was selected.
                let type_filter = parse_hint_types(&params.hint_types)?;
                let hints = match &result {
                    NextTaskResult::Next { task, context, .. } => {
                        let ctx = self
                            .build_rule_context(&scoped, task.clone(), context.clone())
                            .await?;
                        let types = (!type_filter.is_empty()).then_some(type_filter.as_slice());
                        self.hints.generate(ctx, types, user_id).await?
                    }
                    _ => vec![],
                };

                let mut data = to_data(&result)?;
                data["has_next"] = json!(matches!(result, NextTaskResult::Next { .. }));
                if !hints.is_empty() {
                    data["hints"] = to_data(&hints)?;
                }
                Ok(protocol::success(data))
            }
            "complete" => {
                let params: protocol::CompleteTaskParams = parse_params(args)?;
                self.complete_task(&scoped, params, user_id).await
            }
            "delete" => {
                let params: protocol::DeleteTaskParams = parse_params(args)?;
                scoped.tasks.delete(params.task_id).await?;
                Ok(protocol::success(json!({"deleted": params.task_id})))
            }
            "add_dependency" => {
                let params: protocol::DependencyParams = parse_params(args)?;
                if params.task_id == params.depends_on_task_id {
                    return Err(TaskError::Validation(
                        "A task cannot depend on itself".to_string(),
                    ));
                }

                // Cycle gate over the user's whole graph, cross-branch
                // edges included.
                let all_tasks = scoped.tasks.list(TaskFilter::default()).await?;
                let mut graph = DependencyGraph::new(all_tasks.iter().map(|t| t.id));
                for task in &all_tasks {
                    for dep in &task.dependencies {
                        graph.add_edge(task.id, *dep);
                    }
                }
                if graph.would_create_cycle(params.task_id, params.depends_on_task_id) {
                    return Err(TaskError::Validation(format!(
                        "Dependency {} -> {} would create a cycle",
                        params.task_id, params.depends_on_task_id
                    )));
                }

                scoped
                    .tasks
                    .add_dependency(TaskDependency {
                        task_id: params.task_id,
                        depends_on_task_id: params.depends_on_task_id,
                        dependency_type: DependencyType::Blocks,
                        user_id: String::new(),
                    })
                    .await?;
                let task = self.require_task(&scoped, params.task_id).await?;
                Ok(protocol::success(to_data(&task)?))
            }
            "remove_dependency" => {
                let params: protocol::DependencyParams = parse_params(args)?;
                scoped
                    .tasks
                    .remove_dependency(params.task_id, params.depends_on_task_id)
                    .await?;
                let task = self.require_task(&scoped, params.task_id).await?;
                Ok(protocol::success(to_data(&task)?))
            }
            "accept_hint" => {
                let params: protocol::HintFeedbackParams = parse_params(args)?;
                self.hints.accept(params.hint_id, user_id).await?;
                Ok(protocol::success(json!({"accepted": params.hint_id})))
            }
            "dismiss_hint" => {
                let params: protocol::HintFeedbackParams = parse_params(args)?;
                self.hints
                    .dismiss(params.hint_id, params.reason.as_deref(), user_id)
                    .await?;
                Ok(protocol::success(json!({"dismissed": params.hint_id})))
            }
            "hint_feedback" => {
                let params: protocol::HintFeedbackParams = parse_params(args)?;
                let helpful = params.helpful.ok_or_else(|| {
                    TaskError::missing_field("helpful", "boolean", "state whether the hint helped")
                })?;
                self.hints
                    .feedback(params.hint_id, helpful, params.score, user_id)
                    .await?;
                Ok(protocol::success(json!({"recorded": params.hint_id})))
            }
            other => Err(TaskError::unknown_action("manage_task", other)),
        }
    }

    async fn require_task(&self, scoped: &Repositories, task_id: Uuid) -> Result<Task> {
        scoped
            .tasks
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| TaskError::not_found("Task", task_id))
    }

    /// State-machine and dependency gates for an explicit status change.
    async fn gate_status_change(
        &self,
        scoped: &Repositories,
        task: &Task,
        next_status: TaskStatus,
    ) -> Result<()> {
        Validator::validate_transition(task.status, next_status)?;

        if next_status == TaskStatus::InProgress && !task.dependencies.is_empty() {
            let mut blockers = Vec::new();
            for dep in &task.dependencies {
                let done = scoped
                    .tasks
                    .get_by_id(*dep)
                    .await?
                    .map(|t| t.status == TaskStatus::Done)
                    .unwrap_or(false);
                if !done {
                    blockers.push(*dep);
                }
            }
            if !blockers.is_empty() {
                return Err(TaskError::DependenciesUnsatisfied {
                    task_id: task.id,
                    blockers,
                });
            }
        }

        if next_status == TaskStatus::Done {
            let subtasks = scoped.subtasks.list_for_task(task.id).await?;
            Validator::validate_completion(task.completion_summary.as_deref(), &subtasks)?;
        }
        Ok(())
    }

    /// Event + context mirroring after a committed status change. Both are
    /// best-effort relative to the already-committed task write.
    async fn after_status_change(
        &self,
        scoped: &Repositories,
        task: &Task,
        previous: TaskStatus,
        user_id: &str,
    ) {
        self.append_event(events::task_state_changed(
            task.id,
            previous,
            task.status,
            user_id,
            task.version,
        ))
        .await;

        let hierarchy = self.hierarchy(scoped, user_id).await;
        if let Err(err) = hierarchy.mirror_task_status(task.id, task.status).await {
            warn!(task_id = %task.id, error = %err, "Failed to mirror status into task context");
        }
    }

    async fn complete_task(
        &self,
        scoped: &Repositories,
        params: protocol::CompleteTaskParams,
        user_id: &str,
    ) -> Result<Value> {
        let task = self.require_task(scoped, params.task_id).await?;

        if task.status == TaskStatus::Done {
            return Err(TaskError::Validation("Task is already done".to_string()));
        }
        if task.status.is_terminal() {
            return Err(TaskError::Validation(
                "Cancelled tasks cannot be completed".to_string(),
            ));
        }
        if task.status == TaskStatus::Blocked {
            return Err(TaskError::InvalidStateTransition(task.status, TaskStatus::Done));
        }

        let summary = params
            .completion_summary
            .or_else(|| task.completion_summary.clone());
        let subtasks = scoped.subtasks.list_for_task(task.id).await?;
        Validator::validate_completion(summary.as_deref(), &subtasks)?;
        let summary = summary.unwrap_or_default();

        let previous_status = task.status;
        let updated = scoped
            .tasks
            .update(
                task.id,
                UpdateTask {
                    status: Some(TaskStatus::Done),
                    completion_summary: Some(summary.clone()),
                    testing_notes: params.testing_notes,
                    progress_percentage: Some(100.0),
                    ..Default::default()
                },
            )
            .await?;

        // The task row is already committed as done; the context mirror
        // and the audit events must not turn a transient failure into a
        // failure envelope for work that completed. Stale context entries
        // heal on the next read-miss or by TTL.
        let hierarchy = self.hierarchy(scoped, user_id).await;
        if let Err(err) = hierarchy
            .mirror_task_status(updated.id, TaskStatus::Done)
            .await
        {
            warn!(
                task_id = %updated.id,
                error = %err,
                "Failed to mirror completion into task context"
            );
        }

        self.append_event(events::task_state_changed(
            updated.id,
            previous_status,
            TaskStatus::Done,
            user_id,
            updated.version,
        ))
        .await;
        self.append_event(events::task_completed(
            updated.id,
            &summary,
            user_id,
            updated.version,
        ))
        .await;

        Ok(protocol::success_with_guidance(
            to_data(&updated)?,
            protocol::guidance(&["Call manage_task(action='next') for the next task"]),
        ))
    }

    /// Load everything the hint rules inspect for one task.
    async fn build_rule_context(
        &self,
        scoped: &Repositories,
        task: Task,
        resolved_context: Option<Value>,
    ) -> Result<RuleContext> {
        let subtasks = scoped.subtasks.list_for_task(task.id).await?;

        // Related: same-branch tasks plus cross-branch dependency
        // endpoints in either direction.
        let mut related = scoped
            .tasks
            .list(TaskFilter {
                branch_id: Some(task.branch_id),
                ..Default::default()
            })
            .await?;
        related.retain(|t| t.id != task.id);

        let mut extra_ids: Vec<Uuid> = task.dependencies.clone();
        for edge in scoped.tasks.dependents_of(task.id).await? {
            extra_ids.push(edge.task_id);
        }
        for id in extra_ids {
            if related.iter().all(|t| t.id != id) {
                if let Some(t) = scoped.tasks.get_by_id(id).await? {
                    related.push(t);
                }
            }
        }

        let mut ctx = RuleContext::new(task);
        ctx.task_context = resolved_context;
        ctx.subtasks = subtasks;
        ctx.related_tasks = related;
        Ok(ctx)
    }

    // -- manage_subtask --------------------------------------------------

    async fn manage_subtask(&self, action: &str, args: &Map<String, Value>, user_id: &str) -> Result<Value> {
        let scoped = self.scoped(user_id);
        match action {
            "create" => {
                let params: protocol::CreateSubtaskParams = parse_params(args)?;
                Validator::validate_name("title", &params.title)?;
                self.require_task(&scoped, params.task_id).await?;

                let subtask = scoped
                    .subtasks
                    .create(NewSubtask {
                        task_id: params.task_id,
                        title: params.title,
                        description: params.description,
                        priority: params.priority,
                        assignees: params.assignees,
                        user_id: String::new(),
                    })
                    .await?;
                Ok(protocol::success(to_data(&subtask)?))
            }
            "update" => {
                let params: protocol::UpdateSubtaskParams = parse_params(args)?;
                let current = scoped
                    .subtasks
                    .get_by_id(params.subtask_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Subtask", params.subtask_id))?;

                if let Some(next_status) = params.status {
                    Validator::validate_transition(current.status, next_status)?;
                }
                if let Some(progress) = params.progress_percentage {
                    Validator::validate_progress(progress)?;
                }

                let updated = scoped
                    .subtasks
                    .update(
                        params.subtask_id,
                        UpdateSubtask {
                            title: params.title,
                            description: params.description,
                            status: params.status,
                            priority: params.priority,
                            assignees: params.assignees,
                            progress_percentage: params.progress_percentage,
                            progress_notes: params.progress_notes,
                            blockers: params.blockers,
                            insights_found: params.insights_found,
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(protocol::success(to_data(&updated)?))
            }
            "get" => {
                let params: protocol::GetSubtaskParams = parse_params(args)?;
                let subtask = scoped
                    .subtasks
                    .get_by_id(params.subtask_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Subtask", params.subtask_id))?;
                Ok(protocol::success(to_data(&subtask)?))
            }
            "list" => {
                let params: protocol::ListSubtasksParams = parse_params(args)?;
                self.require_task(&scoped, params.task_id).await?;
                let subtasks = scoped.subtasks.list_for_task(params.task_id).await?;
                Ok(protocol::success(json!({
                    "count": subtasks.len(),
                    "subtasks": to_data(&subtasks)?,
                })))
            }
            "complete" => {
                let params: protocol::CompleteSubtaskParams = parse_params(args)?;
                let summary = params
                    .completion_summary
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| {
                        TaskError::missing_field(
                            "completion_summary",
                            "non-empty string",
                            "a completion summary is required to complete a subtask",
                        )
                    })?;

                let current = scoped
                    .subtasks
                    .get_by_id(params.subtask_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Subtask", params.subtask_id))?;
                if current.status.is_terminal() {
                    return Err(TaskError::Validation(
                        "Subtask is already closed".to_string(),
                    ));
                }

                let updated = scoped
                    .subtasks
                    .update(
                        params.subtask_id,
                        UpdateSubtask {
                            status: Some(TaskStatus::Done),
                            progress_percentage: Some(100.0),
                            completion_summary: Some(summary),
                            impact_on_parent: params.impact_on_parent,
                            ..Default::default()
                        },
                    )
                    .await?;

                let parent = self.require_task(&scoped, updated.task_id).await?;
                Ok(protocol::success_with_guidance(
                    to_data(&updated)?,
                    json!({
                        "parent_progress": parent.progress_percentage,
                        "next_actions": ["Complete the parent task once every subtask is closed"],
                    }),
                ))
            }
            "delete" => {
                let params: protocol::GetSubtaskParams = parse_params(args)?;
                scoped.subtasks.delete(params.subtask_id).await?;
                Ok(protocol::success(json!({"deleted": params.subtask_id})))
            }
            other => Err(TaskError::unknown_action("manage_subtask", other)),
        }
    }

    // -- manage_project --------------------------------------------------

    async fn manage_project(&self, action: &str, args: &Map<String, Value>, user_id: &str) -> Result<Value> {
        let scoped = self.scoped(user_id);
        match action {
            "create" => {
                let params: protocol::CreateProjectParams = parse_params(args)?;
                Validator::validate_name("name", &params.name)?;

                let project = scoped
                    .projects
                    .create(NewProject {
                        name: params.name,
                        description: params.description,
                        user_id: String::new(),
                    })
                    .await?;

                // Project context materialises with the project.
                let hierarchy = self.hierarchy(&scoped, user_id).await;
                hierarchy
                    .create(ContextLevel::Project, project.id, json!({}), None)
                    .await?;

                Ok(protocol::success_with_guidance(
                    to_data(&project)?,
                    protocol::guidance(&["Create a branch with manage_project(action='create_branch')"]),
                ))
            }
            "get" => {
                let params: protocol::ProjectIdParams = parse_params(args)?;
                let project = scoped
                    .projects
                    .get_by_id(params.project_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Project", params.project_id))?;
                let branches = scoped.branches.list_for_project(project.id).await?;
                Ok(protocol::success(json!({
                    "project": to_data(&project)?,
                    "branches": to_data(&branches)?,
                })))
            }
            "update" => {
                let params: protocol::UpdateProjectParams = parse_params(args)?;
                let updated = scoped
                    .projects
                    .update(
                        params.project_id,
                        UpdateProject {
                            name: params.name,
                            description: params.description,
                            status: params.status,
                        },
                    )
                    .await?;
                Ok(protocol::success(to_data(&updated)?))
            }
            "list" => {
                let projects = scoped.projects.list(None).await?;
                Ok(protocol::success(json!({
                    "count": projects.len(),
                    "projects": to_data(&projects)?,
                })))
            }
            "create_branch" => {
                let params: protocol::CreateBranchParams = parse_params(args)?;
                Validator::validate_name("name", &params.name)?;
                scoped
                    .projects
                    .get_by_id(params.project_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Project", params.project_id))?;

                let branch = scoped
                    .branches
                    .create(NewBranch {
                        project_id: params.project_id,
                        name: params.name,
                        description: params.description,
                        user_id: String::new(),
                    })
                    .await?;
                Ok(protocol::success(to_data(&branch)?))
            }
            "list_branches" => {
                let params: protocol::ProjectIdParams = parse_params(args)?;
                let branches = scoped.branches.list_for_project(params.project_id).await?;
                Ok(protocol::success(json!({
                    "count": branches.len(),
                    "branches": to_data(&branches)?,
                })))
            }
            "project_health_check" => {
                let params: protocol::ProjectIdParams = parse_params(args)?;
                let project = scoped
                    .projects
                    .get_by_id(params.project_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Project", params.project_id))?;

                let branches = scoped.branches.list_for_project(project.id).await?;
                let agents = scoped.agents.list_for_project(project.id).await?;
                let tasks = scoped
                    .tasks
                    .list(TaskFilter {
                        project_id: Some(project.id),
                        ..Default::default()
                    })
                    .await?;

                let mut by_status: HashMap<&'static str, usize> = HashMap::new();
                for task in &tasks {
                    *by_status.entry(task.status.as_str()).or_default() += 1;
                }
                let unassigned_branches: Vec<&str> = branches
                    .iter()
                    .filter(|b| b.assigned_agent_id.is_none())
                    .map(|b| b.name.as_str())
                    .collect();

                Ok(protocol::success(json!({
                    "project_id": project.id,
                    "status": project.status,
                    "branch_count": branches.len(),
                    "agent_count": agents.len(),
                    "task_count": tasks.len(),
                    "tasks_by_status": by_status,
                    "unassigned_branches": unassigned_branches,
                })))
            }
            "cleanup_obsolete" => {
                let params: protocol::ProjectIdParams = parse_params(args)?;
                let branches = scoped.branches.list_for_project(params.project_id).await?;

                let mut removed = Vec::new();
                for branch in branches {
                    let obsolete = branch.assigned_agent_id.is_none()
                        && branch.task_count > 0
                        && branch.task_count == branch.completed_task_count;
                    let empty = branch.task_count == 0 && branch.assigned_agent_id.is_none();
                    if obsolete || empty {
                        scoped.branches.delete(branch.id).await?;
                        removed.push(json!({"branch_id": branch.id, "name": branch.name}));
                    }
                }
                Ok(protocol::success(json!({
                    "removed_count": removed.len(),
                    "removed": removed,
                })))
            }
            "validate_integrity" => {
                let params: protocol::ProjectIdParams = parse_params(args)?;
                scoped
                    .projects
                    .get_by_id(params.project_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Project", params.project_id))?;

                let branches = scoped.branches.list_for_project(params.project_id).await?;
                let mut issues = Vec::new();

                let mut seen_names = std::collections::HashSet::new();
                for branch in &branches {
                    if !seen_names.insert(branch.name.clone()) {
                        issues.push(json!({
                            "kind": "duplicate_branch_name",
                            "branch": branch.name,
                        }));
                    }
                    let tasks = scoped
                        .tasks
                        .list(TaskFilter {
                            branch_id: Some(branch.id),
                            ..Default::default()
                        })
                        .await?;
                    let done = tasks.iter().filter(|t| t.status == TaskStatus::Done).count() as i64;
                    if branch.task_count != tasks.len() as i64
                        || branch.completed_task_count != done
                    {
                        issues.push(json!({
                            "kind": "counter_drift",
                            "branch_id": branch.id,
                            "stored": {
                                "task_count": branch.task_count,
                                "completed_task_count": branch.completed_task_count,
                            },
                            "actual": {"task_count": tasks.len(), "completed_task_count": done},
                        }));
                    }
                    for task in &tasks {
                        if task.completed_at.is_some() != (task.status == TaskStatus::Done) {
                            issues.push(json!({
                                "kind": "completed_at_mismatch",
                                "task_id": task.id,
                            }));
                        }
                    }
                }

                Ok(protocol::success(json!({
                    "valid": issues.is_empty(),
                    "issues": issues,
                })))
            }
            "rebalance_agents" => {
                let params: protocol::ProjectIdParams = parse_params(args)?;
                let assignments = self.rebalance(&scoped, params.project_id).await?;
                Ok(protocol::success(json!({
                    "assigned_count": assignments.len(),
                    "assignments": assignments,
                })))
            }
            other => Err(TaskError::unknown_action("manage_project", other)),
        }
    }

    /// Assign free available agents to unassigned branches, busiest
    /// branches first, most-available agents first.
    async fn rebalance(&self, scoped: &Repositories, project_id: Uuid) -> Result<Vec<Value>> {
        scoped
            .projects
            .get_by_id(project_id)
            .await?
            .ok_or_else(|| TaskError::not_found("Project", project_id))?;

        let branches = scoped.branches.list_for_project(project_id).await?;
        let agents = scoped.agents.list_for_project(project_id).await?;

        let held: std::collections::HashSet<Uuid> = branches
            .iter()
            .filter_map(|b| b.assigned_agent_id)
            .collect();

        let mut free_agents: Vec<_> = agents
            .into_iter()
            .filter(|a| {
                a.status == taskloom_core::AgentStatus::Available && !held.contains(&a.id)
            })
            .collect();
        free_agents.sort_by(|a, b| {
            b.availability_score
                .partial_cmp(&a.availability_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut open_branches: Vec<_> = branches
            .into_iter()
            .filter(|b| b.assigned_agent_id.is_none())
            .collect();
        open_branches.sort_by(|a, b| {
            (b.task_count - b.completed_task_count).cmp(&(a.task_count - a.completed_task_count))
        });

        let mut assignments = Vec::new();
        for (mut branch, agent) in open_branches.into_iter().zip(free_agents) {
            branch.assigned_agent_id = Some(agent.id);
            let saved = scoped.branches.save(branch).await?;
            assignments.push(json!({
                "branch_id": saved.id,
                "branch": saved.name,
                "agent_id": agent.id,
                "agent": agent.name,
            }));
        }
        Ok(assignments)
    }

    // -- manage_context --------------------------------------------------

    async fn manage_context(&self, action: &str, args: &Map<String, Value>, user_id: &str) -> Result<Value> {
        let scoped = self.scoped(user_id);
        let hierarchy = self.hierarchy(&scoped, user_id).await;

        match action {
            "create" => {
                let params: protocol::ContextParams = parse_params(args)?;
                let level = parse_level(&params.level)?;
                let context_id = context_id_for(level, params.context_id)?;
                let record = hierarchy
                    .create(level, context_id, params.data, params.parent_id)
                    .await?;

                // Task rows carry a link to their context document.
                if let ContextRecord::Task(ctx) = &record {
                    let _ = scoped
                        .tasks
                        .update(
                            ctx.task_id,
                            UpdateTask {
                                context_id: Some(ctx.id),
                                ..Default::default()
                            },
                        )
                        .await;
                }
                Ok(protocol::success(to_data(&record)?))
            }
            "get" => {
                let params: protocol::ContextParams = parse_params(args)?;
                let level = parse_level(&params.level)?;
                let context_id = context_id_for(level, params.context_id)?;
                // `get` answers the resolved view; the raw row is an
                // implementation detail of the hierarchy.
                let document = hierarchy.resolve(level, context_id).await?;
                Ok(protocol::success(document))
            }
            "resolve" => {
                let params: protocol::ContextParams = parse_params(args)?;
                let level = parse_level(&params.level)?;
                let context_id = context_id_for(level, params.context_id)?;
                let document = hierarchy.resolve(level, context_id).await?;
                Ok(protocol::success(document))
            }
            "update" => {
                let params: protocol::ContextParams = parse_params(args)?;
                let level = parse_level(&params.level)?;
                let context_id = context_id_for(level, params.context_id)?;
                let patch = params
                    .data
                    .as_object()
                    .cloned()
                    .ok_or_else(|| TaskError::Validation("data must be an object".to_string()))?;
                let record = hierarchy.update(level, context_id, &patch).await?;
                Ok(protocol::success(to_data(&record)?))
            }
            "delete" => {
                let params: protocol::ContextParams = parse_params(args)?;
                let level = parse_level(&params.level)?;
                let context_id = context_id_for(level, params.context_id)?;
                hierarchy.delete(level, context_id).await?;
                Ok(protocol::success(json!({"deleted": context_id, "level": level.as_str()})))
            }
            "delegate" => {
                let params: protocol::DelegateContextParams = parse_params(args)?;
                let source_level = parse_level(&params.source_level)?;
                let target_level = parse_level(&params.target_level)?;
                let trigger = match params.trigger_type.as_deref() {
                    None => TriggerType::Manual,
                    Some(raw) => raw
                        .parse::<TriggerType>()
                        .map_err(TaskError::Validation)?,
                };
                let delegation = hierarchy
                    .delegate(
                        source_level,
                        params.source_id,
                        target_level,
                        params.target_id,
                        params.data,
                        &params.reason,
                        trigger,
                        params.confidence_score,
                    )
                    .await?;
                Ok(protocol::success(to_data(&delegation)?))
            }
            "add_insight" => {
                let params: protocol::AddInsightParams = parse_params(args)?;
                if params.content.trim().is_empty() {
                    return Err(TaskError::empty_field("content"));
                }
                let insight = json!({
                    "content": params.content,
                    "category": params.category,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                let mut patch = Map::new();
                patch.insert("agent_insights".to_string(), json!([insight]));
                let record = hierarchy
                    .update(ContextLevel::Task, params.task_id, &patch)
                    .await?;
                Ok(protocol::success(to_data(&record)?))
            }
            "add_progress" => {
                let params: protocol::AddProgressParams = parse_params(args)?;
                if params.content.trim().is_empty() {
                    return Err(TaskError::empty_field("content"));
                }
                if let Some(progress) = params.progress_percentage {
                    Validator::validate_progress(progress)?;
                }
                let note = json!({
                    "content": params.content,
                    "progress_percentage": params.progress_percentage,
                    "timestamp": Utc::now().to_rfc3339(),
                });
                let mut patch = Map::new();
                patch.insert("progress_notes".to_string(), json!([note]));
                let record = hierarchy
                    .update(ContextLevel::Task, params.task_id, &patch)
                    .await?;
                Ok(protocol::success(to_data(&record)?))
            }
            other => Err(TaskError::unknown_action("manage_context", other)),
        }
    }

    // -- manage_agent ----------------------------------------------------

    async fn manage_agent(&self, action: &str, args: &Map<String, Value>, user_id: &str) -> Result<Value> {
        let scoped = self.scoped(user_id);
        match action {
            "register" => {
                let params: protocol::RegisterAgentParams = parse_params(args)?;
                Validator::validate_name("name", &params.name)?;
                scoped
                    .projects
                    .get_by_id(params.project_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Project", params.project_id))?;

                let agent = scoped
                    .agents
                    .create(NewAgent {
                        project_id: params.project_id,
                        name: params.name,
                        description: params.description,
                        role: params.role,
                        capabilities: params.capabilities,
                        user_id: String::new(),
                    })
                    .await?;
                Ok(protocol::success(to_data(&agent)?))
            }
            "assign" => {
                let params: protocol::AssignAgentParams = parse_params(args)?;
                let agent = scoped
                    .agents
                    .get_by_id(params.agent_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Agent", params.agent_id))?;
                let mut branch = scoped
                    .branches
                    .get_by_id(params.branch_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Branch", params.branch_id))?;

                // One branch per agent, one agent per branch.
                match branch.assigned_agent_id {
                    Some(existing) if existing != agent.id => {
                        return Err(TaskError::Validation(format!(
                            "Branch '{}' is already assigned to another agent",
                            branch.name
                        )));
                    }
                    _ => {}
                }
                let holding = scoped
                    .branches
                    .list(None)
                    .await?
                    .into_iter()
                    .find(|b| b.assigned_agent_id == Some(agent.id) && b.id != branch.id);
                if let Some(other) = holding {
                    return Err(TaskError::Validation(format!(
                        "Agent '{}' already holds branch '{}'",
                        agent.name, other.name
                    )));
                }

                branch.assigned_agent_id = Some(agent.id);
                let saved = scoped.branches.save(branch).await?;
                Ok(protocol::success(json!({
                    "agent": to_data(&agent)?,
                    "branch": to_data(&saved)?,
                })))
            }
            "unassign" => {
                let params: protocol::UnassignAgentParams = parse_params(args)?;
                let mut branch = scoped
                    .branches
                    .get_by_id(params.branch_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Branch", params.branch_id))?;
                branch.assigned_agent_id = None;
                let saved = scoped.branches.save(branch).await?;
                Ok(protocol::success(to_data(&saved)?))
            }
            "get" => {
                let params: protocol::AgentIdParams = parse_params(args)?;
                let agent = scoped
                    .agents
                    .get_by_id(params.agent_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Agent", params.agent_id))?;
                Ok(protocol::success(to_data(&agent)?))
            }
            "list" => {
                let params: protocol::ListAgentsParams = parse_params(args)?;
                let agents = scoped.agents.list_for_project(params.project_id).await?;
                Ok(protocol::success(json!({
                    "count": agents.len(),
                    "agents": to_data(&agents)?,
                })))
            }
            "update" => {
                let params: protocol::UpdateAgentParams = parse_params(args)?;
                let status = params
                    .status
                    .as_deref()
                    .map(str::parse)
                    .transpose()
                    .map_err(TaskError::Validation)?;
                if let Some(score) = params.availability_score {
                    Validator::validate_availability_score(score)?;
                }
                let updated = scoped
                    .agents
                    .update(
                        params.agent_id,
                        UpdateAgent {
                            name: params.name,
                            description: params.description,
                            role: params.role,
                            capabilities: params.capabilities,
                            status,
                            availability_score: params.availability_score,
                        },
                    )
                    .await?;
                Ok(protocol::success(to_data(&updated)?))
            }
            "unregister" => {
                let params: protocol::AgentIdParams = parse_params(args)?;
                scoped.agents.delete(params.agent_id).await?;
                Ok(protocol::success(json!({"unregistered": params.agent_id})))
            }
            "rebalance" => {
                let params: protocol::ProjectIdParams = parse_params(args)?;
                let assignments = self.rebalance(&scoped, params.project_id).await?;
                Ok(protocol::success(json!({
                    "assigned_count": assignments.len(),
                    "assignments": assignments,
                })))
            }
            other => Err(TaskError::unknown_action("manage_agent", other)),
        }
    }

    // -- manage_token ----------------------------------------------------

    async fn manage_token(&self, action: &str, args: &Map<String, Value>, user_id: &str) -> Result<Value> {
        let scoped = self.scoped(user_id);
        match action {
            "create" => {
                let params: protocol::CreateTokenParams = parse_params(args)?;
                Validator::validate_name("name", &params.name)?;
                let (token, raw) = self.mint_token(&scoped, &params, user_id).await?;

                // The raw token crosses the boundary exactly once.
                let mut data = token_view(&token);
                data["token"] = json!(raw);
                Ok(protocol::success_with_guidance(
                    data,
                    protocol::guidance(&["Store the raw token now; it cannot be recovered later"]),
                ))
            }
            "list" => {
                let tokens = scoped.tokens.list(user_id).await?;
                let views: Vec<Value> = tokens.iter().map(token_view).collect();
                Ok(protocol::success(json!({
                    "count": views.len(),
                    "tokens": views,
                })))
            }
            "get" => {
                let params: protocol::TokenIdParams = parse_params(args)?;
                let token = scoped
                    .tokens
                    .get_by_id(params.token_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Token", params.token_id))?;
                Ok(protocol::success(token_view(&token)))
            }
            "revoke" => {
                let params: protocol::TokenIdParams = parse_params(args)?;
                let mut token = scoped
                    .tokens
                    .get_by_id(params.token_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Token", params.token_id))?;
                token.is_active = false;
                let saved = scoped.tokens.save(token).await?;
                self.validator.forget(&saved.token_hash).await;
                Ok(protocol::success(token_view(&saved)))
            }
            "reactivate" => {
                let params: protocol::TokenIdParams = parse_params(args)?;
                let mut token = scoped
                    .tokens
                    .get_by_id(params.token_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Token", params.token_id))?;
                if token.is_expired(Utc::now()) {
                    return Err(TaskError::Validation(
                        "Expired tokens cannot be reactivated".to_string(),
                    ));
                }
                token.is_active = true;
                let saved = scoped.tokens.save(token).await?;
                Ok(protocol::success(token_view(&saved)))
            }
            "rotate" => {
                let params: protocol::TokenIdParams = parse_params(args)?;
                let mut old = scoped
                    .tokens
                    .get_by_id(params.token_id)
                    .await?
                    .ok_or_else(|| TaskError::not_found("Token", params.token_id))?;

                let create = protocol::CreateTokenParams {
                    name: old.name.clone(),
                    scopes: old.scopes.iter().map(|s| s.to_string()).collect(),
                    rate_limit: Some(old.rate_limit),
                    expires_at: old.expires_at,
                    metadata: old.metadata.clone(),
                };
                let (new_token, raw) = self.mint_token(&scoped, &create, user_id).await?;

                old.is_active = false;
                let old = scoped.tokens.save(old).await?;
                self.validator.forget(&old.token_hash).await;

                let mut data = token_view(&new_token);
                data["token"] = json!(raw);
                data["rotated_from"] = json!(old.id);
                Ok(protocol::success(data))
            }
            "validate" => {
                let params: protocol::ValidateTokenParams = parse_params(args)?;
                let hash = hash_token(&params.token);
                let valid = match scoped.tokens.get_by_hash(&hash).await? {
                    Some(token) => token.is_active && !token.is_expired(Utc::now()),
                    None => false,
                };
                Ok(protocol::success(json!({"valid": valid})))
            }
            "stats" => {
                let tokens = scoped.tokens.list(user_id).await?;
                let active = tokens.iter().filter(|t| t.is_active).count();
                let total_usage: i64 = tokens.iter().map(|t| t.usage_count).sum();
                let validator_stats = self.validator.stats().await;
                Ok(protocol::success(json!({
                    "token_count": tokens.len(),
                    "active_count": active,
                    "total_usage": total_usage,
                    "validator": validator_stats,
                })))
            }
            "cleanup" => {
                let deactivated = scoped.tokens.cleanup_expired(Utc::now()).await?;
                Ok(protocol::success(json!({"deactivated": deactivated})))
            }
            other => Err(TaskError::unknown_action("manage_token", other)),
        }
    }

    async fn mint_token(
        &self,
        scoped: &Repositories,
        params: &protocol::CreateTokenParams,
        user_id: &str,
    ) -> Result<(ApiToken, String)> {
        let scopes = params
            .scopes
            .iter()
            .map(|s| Scope::parse(s))
            .collect::<Result<Vec<_>>>()?;
        if scopes.is_empty() {
            return Err(TaskError::missing_field(
                "scopes",
                "list of entity:action strings",
                "grant at least one scope, e.g. tasks:read",
            ));
        }

        let raw = taskloom_core::token::generate_raw_token();
        let token = ApiToken {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            name: params.name.clone(),
            token_hash: hash_token(&raw),
            scopes,
            rate_limit: params.rate_limit.unwrap_or(0),
            expires_at: params.expires_at,
            last_used_at: None,
            usage_count: 0,
            is_active: true,
            metadata: if params.metadata.is_null() {
                json!({})
            } else {
                params.metadata.clone()
            },
            created_at: Utc::now(),
        };
        let stored = scoped.tokens.create(token).await?;
        Ok((stored, raw))
    }

    async fn append_event(&self, event: taskloom_core::StoredEvent) {
        if let Err(err) = self.base.events.append(event).await {
            warn!(error = %err, "Failed to append domain event");
        }
    }

    /// Expose the hint engine for server-side wiring and tests.
    pub fn hint_engine(&self) -> Arc<HintEngine> {
        self.hints.clone()
    }
}

fn list_filter(params: &protocol::ListTasksParams) -> TaskFilter {
    TaskFilter {
        branch_id: params.branch_id,
        project_id: params.project_id,
        status: params.status,
        priority: params.priority,
        assignee: params.assignee.clone(),
        labels: params.labels.clone(),
        user_id: None,
        limit: params.limit,
        offset: params.offset,
    }
}

fn parse_level(raw: &str) -> Result<ContextLevel> {
    raw.parse::<ContextLevel>().map_err(TaskError::Validation)
}

/// Global contexts address the per-user singleton; every other level
/// requires an explicit id.
fn context_id_for(level: ContextLevel, context_id: Option<Uuid>) -> Result<Uuid> {
    match (level, context_id) {
        (ContextLevel::Global, _) => Ok(taskloom_core::GLOBAL_CONTEXT_ID),
        (_, Some(id)) => Ok(id),
        (_, None) => Err(TaskError::missing_field(
            "context_id",
            "uuid",
            "non-global contexts require the owning entity id",
        )),
    }
}

/// Public view of a token; the hash and raw value stay out of it.
fn token_view(token: &ApiToken) -> Value {
    json!({
        "id": token.id,
        "name": token.name,
        "scopes": token.scopes,
        "rate_limit": token.rate_limit,
        "expires_at": token.expires_at,
        "last_used_at": token.last_used_at,
        "usage_count": token.usage_count,
        "is_active": token.is_active,
        "metadata": token.metadata,
        "created_at": token.created_at,
    })
}

/// Hint types parsed from a request's optional `types` list.
fn parse_hint_types(raw: &[String]) -> Result<Vec<HintType>> {
    raw.iter()
        .map(|s| s.parse::<HintType>().map_err(TaskError::Validation))
        .collect()
}
