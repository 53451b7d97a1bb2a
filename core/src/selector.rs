//! Next-task selection.
//!
//! The selection itself ([`select`]) is a pure function over loaded data
//! so the ordering, gating and readiness rules are directly testable; the
//! [`NextTaskSelector`] service wraps it with repository loading and
//! optional context resolution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::ContextLevel;
use crate::error::Result;
use crate::hierarchy::ContextHierarchyService;
use crate::models::{Subtask, Task, TaskFilter, TaskStatus};
use crate::repository::{BranchRepository, ContextRepository, SubtaskRepository, TaskRepository};

/// Filters accepted by the `next` operation.
#[derive(Debug, Clone, Default)]
pub struct SelectorFilters {
    pub assignee: Option<String>,
    pub project_id: Option<Uuid>,
    pub branch_id: Option<Uuid>,
    pub labels: Vec<String>,
}

/// A task whose context reports a different status than the task row.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusMismatch {
    pub task_id: Uuid,
    pub title: String,
    pub task_status: TaskStatus,
    pub context_status: TaskStatus,
    pub fix_action: String,
    pub suggested_command: String,
}

/// One blocked task and the predecessors holding it up.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BlockedTask {
    pub task_id: Uuid,
    pub title: String,
    pub priority: String,
    pub blocked_by: Vec<BlockerInfo>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BlockerInfo {
    pub task_id: Uuid,
    pub title: String,
    pub status: TaskStatus,
}

/// Summary returned when every filtered task is done.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CompletionSummary {
    pub total_completed: usize,
    pub priority_breakdown: HashMap<String, usize>,
    pub completion_rate: f64,
}

/// Standing of the winning task within the wider graph.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskInsight {
    pub can_start: bool,
    pub dependency_count: usize,
    pub blocking_count: usize,
    pub overall_completed: usize,
    pub overall_total: usize,
    pub overall_percentage: f64,
}

/// What the selector handed back.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextTaskResult {
    /// An actionable task (or its first incomplete subtask).
    Next {
        task: Task,
        /// Set when the next unit of work is a subtask of `task`.
        subtask: Option<Subtask>,
        insight: TaskInsight,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<Value>,
        context_available: bool,
        message: String,
    },
    /// Nothing exists yet.
    NoTasks { message: String },
    /// Tasks exist but none match the filters.
    NoMatch { message: String },
    /// Every filtered task is done.
    AllComplete {
        summary: CompletionSummary,
        message: String,
    },
    /// Filtered tasks exist but none is actionable (review/testing/…).
    NoneActionable { message: String },
    /// Every actionable task waits on unfinished predecessors.
    Blocked {
        blocked_tasks: Vec<BlockedTask>,
        message: String,
    },
    /// Task/context statuses diverge; nothing is picked until fixed.
    StatusMismatch {
        mismatches: Vec<StatusMismatch>,
        message: String,
    },
}

/// Pure selection over preloaded state.
///
/// `context_statuses` carries the reported status of each task context
/// that exists; `subtasks` maps task id to its ordered subtasks.
pub fn select(
    all_tasks: &[Task],
    subtasks: &HashMap<Uuid, Vec<Subtask>>,
    context_statuses: &HashMap<Uuid, TaskStatus>,
    project_branches: Option<&HashSet<Uuid>>,
    filters: &SelectorFilters,
) -> NextTaskResult {
    if all_tasks.is_empty() {
        return NextTaskResult::NoTasks {
            message: "No tasks found. Create a task to get started.".to_string(),
        };
    }

    // Consistency gate: a diverging context status anywhere stops
    // selection outright with a structured fix suggestion.
    let mismatches: Vec<StatusMismatch> = all_tasks
        .iter()
        .filter_map(|task| {
            let reported = *context_statuses.get(&task.id)?;
            (reported != task.status).then(|| StatusMismatch {
                task_id: task.id,
                title: task.title.clone(),
                task_status: task.status,
                context_status: reported,
                fix_action: format!(
                    "Update context status from '{}' to '{}' or vice versa",
                    reported, task.status
                ),
                suggested_command: format!(
                    "manage_context(action='update', level='task', context_id='{}', data={{\"task_data\": {{\"status\": \"{}\"}}}})",
                    task.id, task.status
                ),
            })
        })
        .collect();
    if !mismatches.is_empty() {
        let message = format!(
            "Found {} task(s) with mismatched task/context status. Fix required before proceeding.",
            mismatches.len()
        );
        return NextTaskResult::StatusMismatch { mismatches, message };
    }

    let filtered: Vec<&Task> = all_tasks
        .iter()
        .filter(|task| {
            if let Some(assignee) = &filters.assignee {
                if !task.assignees.iter().any(|a| a == assignee) {
                    return false;
                }
            }
            if let Some(branch_id) = filters.branch_id {
                if task.branch_id != branch_id {
                    return false;
                }
            }
            if let Some(branches) = project_branches {
                if !branches.contains(&task.branch_id) {
                    return false;
                }
            }
            if !filters.labels.is_empty()
                && !filters.labels.iter().any(|l| task.labels.contains(l))
            {
                return false;
            }
            true
        })
        .collect();

    if filtered.is_empty() {
        return NextTaskResult::NoMatch {
            message: "No tasks match filters.".to_string(),
        };
    }

    let actionable: Vec<&Task> = filtered
        .iter()
        .copied()
        .filter(|t| t.status.is_actionable())
        .collect();

    if actionable.is_empty() {
        let done = filtered
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .count();
        if done == filtered.len() {
            let mut priority_breakdown: HashMap<String, usize> = HashMap::new();
            for task in &filtered {
                *priority_breakdown
                    .entry(task.priority.as_str().to_string())
                    .or_default() += 1;
            }
            return NextTaskResult::AllComplete {
                summary: CompletionSummary {
                    total_completed: filtered.len(),
                    priority_breakdown,
                    completion_rate: 100.0,
                },
                message: "All tasks completed.".to_string(),
            };
        }
        return NextTaskResult::NoneActionable {
            message: "No actionable tasks found.".to_string(),
        };
    }

    // (priority desc, todo before in_progress, older first)
    let mut sorted = actionable;
    sorted.sort_by(|a, b| {
        a.priority
            .selector_rank()
            .cmp(&b.priority.selector_rank())
            .then(a.status.selector_rank().cmp(&b.status.selector_rank()))
            .then(a.created_at.cmp(&b.created_at))
    });

    let done_ids: HashSet<Uuid> = all_tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.id)
        .collect();

    for task in &sorted {
        if !task.is_ready(&done_ids) {
            continue;
        }

        let insight = task_insight(task, all_tasks, &done_ids);
        let next_subtask = subtasks
            .get(&task.id)
            .and_then(|subs| subs.iter().find(|s| s.is_open()).cloned());

        let message = match &next_subtask {
            Some(sub) => format!(
                "Next action: Work on subtask '{}' in task '{}'",
                sub.title, task.title
            ),
            None => format!("Next action: Work on task '{}'", task.title),
        };
        return NextTaskResult::Next {
            task: (*task).clone(),
            subtask: next_subtask,
            insight,
            context: None,
            context_available: false,
            message,
        };
    }

    // Everything actionable waits on predecessors: explain what on whom.
    let by_id: HashMap<Uuid, &Task> = all_tasks.iter().map(|t| (t.id, t)).collect();
    let blocked_tasks: Vec<BlockedTask> = sorted
        .iter()
        .map(|task| BlockedTask {
            task_id: task.id,
            title: task.title.clone(),
            priority: task.priority.as_str().to_string(),
            blocked_by: task
                .dependencies
                .iter()
                .filter(|dep| !done_ids.contains(dep))
                .map(|dep| match by_id.get(dep) {
                    Some(blocker) => BlockerInfo {
                        task_id: blocker.id,
                        title: blocker.title.clone(),
                        status: blocker.status,
                    },
                    None => BlockerInfo {
                        task_id: *dep,
                        title: "(missing task)".to_string(),
                        status: TaskStatus::Todo,
                    },
                })
                .collect(),
        })
        .collect();

    NextTaskResult::Blocked {
        blocked_tasks,
        message: "All remaining tasks are blocked by dependencies. Complete prerequisite tasks first."
            .to_string(),
    }
}

fn task_insight(task: &Task, all_tasks: &[Task], done_ids: &HashSet<Uuid>) -> TaskInsight {
    let blocking_count = all_tasks
        .iter()
        .filter(|t| t.dependencies.contains(&task.id))
        .count();
    let total = all_tasks.len();
    let completed = done_ids.len();
    TaskInsight {
        can_start: task.is_ready(done_ids),
        dependency_count: task.dependencies.len(),
        blocking_count,
        overall_completed: completed,
        overall_total: total,
        overall_percentage: if total > 0 {
            ((completed as f64 / total as f64) * 1000.0).round() / 10.0
        } else {
            0.0
        },
    }
}

/// Repository-backed selector for one authenticated user.
pub struct NextTaskSelector {
    tasks: Arc<dyn TaskRepository>,
    subtasks: Arc<dyn SubtaskRepository>,
    branches: Arc<dyn BranchRepository>,
    contexts: Arc<dyn ContextRepository>,
    hierarchy: Arc<ContextHierarchyService>,
    user_id: String,
}

impl NextTaskSelector {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        subtasks: Arc<dyn SubtaskRepository>,
        branches: Arc<dyn BranchRepository>,
        contexts: Arc<dyn ContextRepository>,
        hierarchy: Arc<ContextHierarchyService>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            tasks,
            subtasks,
            branches,
            contexts,
            hierarchy,
            user_id: user_id.into(),
        }
    }

    /// Run the full next-task pipeline: load, gate, filter, rank, check
    /// readiness, drill into subtasks, optionally resolve context.
    pub async fn next(
        &self,
        filters: &SelectorFilters,
        include_context: bool,
    ) -> Result<NextTaskResult> {
        let all_tasks = self.tasks.list(TaskFilter::default()).await?;

        let mut context_statuses = HashMap::new();
        for task in &all_tasks {
            if let Some(crate::context::ContextRecord::Task(ctx)) = self
                .contexts
                .get(ContextLevel::Task, task.id, &self.user_id)
                .await?
            {
                if let Some(status) = ctx.reported_status() {
                    context_statuses.insert(task.id, status);
                }
            }
        }

        let project_branches = match filters.project_id {
            Some(project_id) => {
                let branches = self.branches.list_for_project(project_id).await?;
                Some(branches.iter().map(|b| b.id).collect::<HashSet<_>>())
            }
            None => None,
        };

        let mut subtask_map: HashMap<Uuid, Vec<Subtask>> = HashMap::new();
        for task in &all_tasks {
            if task.status.is_actionable() {
                let subs = self.subtasks.list_for_task(task.id).await?;
                if !subs.is_empty() {
                    subtask_map.insert(task.id, subs);
                }
            }
        }

        let mut result = select(
            &all_tasks,
            &subtask_map,
            &context_statuses,
            project_branches.as_ref(),
            filters,
        );

        if include_context {
            if let NextTaskResult::Next {
                task,
                context,
                context_available,
                ..
            } = &mut result
            {
                // Resolution failure degrades gracefully; the selection
                // itself already happened.
                match self.hierarchy.resolve(ContextLevel::Task, task.id).await {
                    Ok(document) => {
                        *context = Some(document);
                        *context_available = true;
                    }
                    Err(err) => {
                        warn!(task_id = %task.id, error = %err, "Context resolution failed for next task");
                        *context = None;
                        *context_available = false;
                    }
                }
            }
        }

        debug!(user_id = %self.user_id, "Next-task selection complete");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use chrono::{Duration, Utc};

    fn task(title: &str, status: TaskStatus, priority: Priority) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            title: title.to_string(),
            description: String::new(),
            status,
            priority,
            details: None,
            estimated_effort: None,
            due_date: None,
            completed_at: None,
            completion_summary: None,
            testing_notes: None,
            context_id: None,
            progress_percentage: 0.0,
            assignees: vec![],
            labels: vec![],
            dependencies: vec![],
            user_id: "u1".to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn no_subtasks() -> HashMap<Uuid, Vec<Subtask>> {
        HashMap::new()
    }

    fn no_contexts() -> HashMap<Uuid, TaskStatus> {
        HashMap::new()
    }

    #[test]
    fn test_empty_repository() {
        let result = select(&[], &no_subtasks(), &no_contexts(), None, &SelectorFilters::default());
        assert!(matches!(result, NextTaskResult::NoTasks { .. }));
    }

    #[test]
    fn test_priority_wins_over_age() {
        let mut low = task("low", TaskStatus::Todo, Priority::Low);
        low.created_at = Utc::now() - Duration::days(10);
        let high = task("high", TaskStatus::Todo, Priority::High);

        let tasks = vec![low, high];
        let result = select(&tasks, &no_subtasks(), &no_contexts(), None, &SelectorFilters::default());
        match result {
            NextTaskResult::Next { task, .. } => assert_eq!(task.title, "high"),
            other => panic!("expected Next, got {other:?}"),
        }
    }

    #[test]
    fn test_todo_ranks_before_in_progress_and_age_breaks_ties() {
        let mut older = task("older", TaskStatus::Todo, Priority::Medium);
        older.created_at = Utc::now() - Duration::days(2);
        let newer = task("newer", TaskStatus::Todo, Priority::Medium);
        let in_progress = task("running", TaskStatus::InProgress, Priority::Medium);

        let tasks = vec![newer, in_progress, older];
        let result = select(&tasks, &no_subtasks(), &no_contexts(), None, &SelectorFilters::default());
        match result {
            NextTaskResult::Next { task, .. } => assert_eq!(task.title, "older"),
            other => panic!("expected Next, got {other:?}"),
        }
    }

    #[test]
    fn test_blocked_higher_priority_is_skipped() {
        // Scenario: T1 high/todo, T2 critical/todo depending on T1.
        // T2 outranks T1 but is unready, so T1 wins.
        let t1 = task("T1", TaskStatus::Todo, Priority::High);
        let mut t2 = task("T2", TaskStatus::Todo, Priority::Critical);
        t2.dependencies = vec![t1.id];

        let tasks = vec![t1.clone(), t2];
        let result = select(&tasks, &no_subtasks(), &no_contexts(), None, &SelectorFilters::default());
        match result {
            NextTaskResult::Next { task, insight, .. } => {
                assert_eq!(task.id, t1.id);
                assert_eq!(insight.blocking_count, 1);
            }
            other => panic!("expected Next, got {other:?}"),
        }
    }

    #[test]
    fn test_ready_after_dependency_done() {
        let mut t1 = task("T1", TaskStatus::Done, Priority::High);
        t1.completed_at = Some(Utc::now());
        let mut t2 = task("T2", TaskStatus::Todo, Priority::Critical);
        t2.dependencies = vec![t1.id];

        let tasks = vec![t1, t2.clone()];
        let result = select(&tasks, &no_subtasks(), &no_contexts(), None, &SelectorFilters::default());
        match result {
            NextTaskResult::Next { task, .. } => assert_eq!(task.id, t2.id),
            other => panic!("expected Next, got {other:?}"),
        }
    }

    #[test]
    fn test_all_actionable_blocked_summarises_blockers() {
        let blocker = task("blocker", TaskStatus::Review, Priority::Medium);
        let mut blocked = task("blocked", TaskStatus::Todo, Priority::High);
        blocked.dependencies = vec![blocker.id];

        let tasks = vec![blocker.clone(), blocked.clone()];
        let result = select(&tasks, &no_subtasks(), &no_contexts(), None, &SelectorFilters::default());
        match result {
            NextTaskResult::Blocked { blocked_tasks, .. } => {
                assert_eq!(blocked_tasks.len(), 1);
                assert_eq!(blocked_tasks[0].task_id, blocked.id);
                assert_eq!(blocked_tasks[0].blocked_by.len(), 1);
                assert_eq!(blocked_tasks[0].blocked_by[0].task_id, blocker.id);
                assert_eq!(blocked_tasks[0].blocked_by[0].status, TaskStatus::Review);
            }
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[test]
    fn test_all_complete_summary() {
        let mut t1 = task("a", TaskStatus::Done, Priority::High);
        t1.completed_at = Some(Utc::now());
        let mut t2 = task("b", TaskStatus::Done, Priority::High);
        t2.completed_at = Some(Utc::now());
        let mut t3 = task("c", TaskStatus::Done, Priority::Low);
        t3.completed_at = Some(Utc::now());

        let tasks = vec![t1, t2, t3];
        let result = select(&tasks, &no_subtasks(), &no_contexts(), None, &SelectorFilters::default());
        match result {
            NextTaskResult::AllComplete { summary, .. } => {
                assert_eq!(summary.total_completed, 3);
                assert_eq!(summary.completion_rate, 100.0);
                assert_eq!(summary.priority_breakdown.get("high"), Some(&2));
                assert_eq!(summary.priority_breakdown.get("low"), Some(&1));
            }
            other => panic!("expected AllComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_none_actionable_when_tasks_in_review() {
        let tasks = vec![
            task("r", TaskStatus::Review, Priority::High),
            task("t", TaskStatus::Testing, Priority::High),
        ];
        let result = select(&tasks, &no_subtasks(), &no_contexts(), None, &SelectorFilters::default());
        assert!(matches!(result, NextTaskResult::NoneActionable { .. }));
    }

    #[test]
    fn test_filters_narrow_candidates() {
        let mut assigned = task("mine", TaskStatus::Todo, Priority::Low);
        assigned.assignees = vec!["agent-a".to_string()];
        let other = task("other", TaskStatus::Todo, Priority::Critical);

        let tasks = vec![assigned.clone(), other];
        let filters = SelectorFilters {
            assignee: Some("agent-a".to_string()),
            ..Default::default()
        };
        let result = select(&tasks, &no_subtasks(), &no_contexts(), None, &filters);
        match result {
            NextTaskResult::Next { task, .. } => assert_eq!(task.id, assigned.id),
            other => panic!("expected Next, got {other:?}"),
        }

        let filters = SelectorFilters {
            assignee: Some("nobody".to_string()),
            ..Default::default()
        };
        let result = select(&tasks, &no_subtasks(), &no_contexts(), None, &filters);
        assert!(matches!(result, NextTaskResult::NoMatch { .. }));
    }

    #[test]
    fn test_label_filter() {
        let mut tagged = task("tagged", TaskStatus::Todo, Priority::Low);
        tagged.labels = vec!["backend".to_string()];
        let untagged = task("untagged", TaskStatus::Todo, Priority::Critical);

        let tasks = vec![tagged.clone(), untagged];
        let filters = SelectorFilters {
            labels: vec!["backend".to_string()],
            ..Default::default()
        };
        let result = select(&tasks, &no_subtasks(), &no_contexts(), None, &filters);
        match result {
            NextTaskResult::Next { task, .. } => assert_eq!(task.id, tagged.id),
            other => panic!("expected Next, got {other:?}"),
        }
    }

    #[test]
    fn test_status_mismatch_stops_selection() {
        let t = task("t", TaskStatus::InProgress, Priority::High);
        let mut contexts = HashMap::new();
        contexts.insert(t.id, TaskStatus::Done);

        let tasks = vec![t.clone()];
        let result = select(&tasks, &no_subtasks(), &contexts, None, &SelectorFilters::default());
        match result {
            NextTaskResult::StatusMismatch { mismatches, .. } => {
                assert_eq!(mismatches.len(), 1);
                assert_eq!(mismatches[0].task_id, t.id);
                assert_eq!(mismatches[0].task_status, TaskStatus::InProgress);
                assert_eq!(mismatches[0].context_status, TaskStatus::Done);
                assert!(mismatches[0].suggested_command.contains("manage_context"));
            }
            other => panic!("expected StatusMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_matching_context_status_passes_gate() {
        let t = task("t", TaskStatus::InProgress, Priority::High);
        let mut contexts = HashMap::new();
        contexts.insert(t.id, TaskStatus::InProgress);

        let tasks = vec![t];
        let result = select(&tasks, &no_subtasks(), &contexts, None, &SelectorFilters::default());
        assert!(matches!(result, NextTaskResult::Next { .. }));
    }

    #[test]
    fn test_incomplete_subtask_is_surfaced() {
        let t = task("parent", TaskStatus::InProgress, Priority::High);
        let now = Utc::now();
        let make_sub = |title: &str, status: TaskStatus| Subtask {
            id: Uuid::new_v4(),
            task_id: t.id,
            title: title.to_string(),
            description: String::new(),
            status,
            priority: Priority::Medium,
            assignees: vec![],
            progress_percentage: 0.0,
            progress_notes: String::new(),
            blockers: String::new(),
            completion_summary: None,
            impact_on_parent: None,
            insights_found: vec![],
            user_id: "u1".to_string(),
            created_at: now,
            updated_at: now,
        };

        let mut subtasks = HashMap::new();
        subtasks.insert(
            t.id,
            vec![
                make_sub("done", TaskStatus::Done),
                make_sub("open", TaskStatus::Todo),
                make_sub("later", TaskStatus::Todo),
            ],
        );

        let tasks = vec![t.clone()];
        let result = select(&tasks, &subtasks, &no_contexts(), None, &SelectorFilters::default());
        match result {
            NextTaskResult::Next { task, subtask, message, .. } => {
                assert_eq!(task.id, t.id);
                let sub = subtask.expect("subtask expected");
                assert_eq!(sub.title, "open");
                assert!(message.contains("subtask 'open'"));
            }
            other => panic!("expected Next, got {other:?}"),
        }
    }

    #[test]
    fn test_project_branch_scope() {
        let in_scope = task("in", TaskStatus::Todo, Priority::Low);
        let out_of_scope = task("out", TaskStatus::Todo, Priority::Critical);

        let branches: HashSet<Uuid> = [in_scope.branch_id].into_iter().collect();
        let tasks = vec![in_scope.clone(), out_of_scope];
        let filters = SelectorFilters {
            project_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let result = select(&tasks, &no_subtasks(), &no_contexts(), Some(&branches), &filters);
        match result {
            NextTaskResult::Next { task, .. } => assert_eq!(task.id, in_scope.id),
            other => panic!("expected Next, got {other:?}"),
        }
    }
}
