//! Builders for test entities with sensible defaults.

use chrono::{DateTime, Utc};
use serde_json::json;
use taskloom_core::{
    models::{Priority, Subtask, Task, TaskStatus},
    token::{ApiToken, Scope},
};
use uuid::Uuid;

/// Build a [`Task`] for tests; defaults to a fresh `todo`/medium task
/// owned by `test-user`.
pub struct TaskBuilder {
    task: Task,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskBuilder {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            task: Task {
                id: Uuid::new_v4(),
                branch_id: Uuid::new_v4(),
                title: "Test task".to_string(),
                description: "A task used in tests".to_string(),
                status: TaskStatus::Todo,
                priority: Priority::Medium,
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
                user_id: "test-user".to_string(),
                version: 1,
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.task.title = title.to_string();
        self
    }

    pub fn branch(mut self, branch_id: Uuid) -> Self {
        self.task.branch_id = branch_id;
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        if status == TaskStatus::Done {
            self.task.completed_at = Some(Utc::now());
        }
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.task.user_id = user_id.to_string();
        self
    }

    pub fn assignees(mut self, assignees: &[&str]) -> Self {
        self.task.assignees = assignees.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn labels(mut self, labels: &[&str]) -> Self {
        self.task.labels = labels.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, task_ids: &[Uuid]) -> Self {
        self.task.dependencies = task_ids.to_vec();
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.task.progress_percentage = progress;
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.updated_at = at;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Build a [`Subtask`] for tests.
pub struct SubtaskBuilder {
    subtask: Subtask,
}

impl SubtaskBuilder {
    pub fn for_task(task_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            subtask: Subtask {
                id: Uuid::new_v4(),
                task_id,
                title: "Test subtask".to_string(),
                description: String::new(),
                status: TaskStatus::Todo,
                priority: Priority::Medium,
                assignees: vec![],
                progress_percentage: 0.0,
                progress_notes: String::new(),
                blockers: String::new(),
                completion_summary: None,
                impact_on_parent: None,
                insights_found: vec![],
                user_id: "test-user".to_string(),
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub fn title(mut self, title: &str) -> Self {
        self.subtask.title = title.to_string();
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.subtask.status = status;
        if status == TaskStatus::Done {
            self.subtask.progress_percentage = 100.0;
        }
        self
    }

    pub fn user(mut self, user_id: &str) -> Self {
        self.subtask.user_id = user_id.to_string();
        self
    }

    pub fn build(self) -> Subtask {
        self.subtask
    }
}

/// Build an [`ApiToken`] for tests; active, unexpired, with read/write
/// scopes on every entity unless narrowed.
pub struct TokenBuilder {
    token: ApiToken,
}

impl TokenBuilder {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            token: ApiToken {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                name: "test-token".to_string(),
                token_hash: String::new(),
                scopes: ["projects", "tasks", "contexts", "agents", "tokens"]
                    .iter()
                    .flat_map(|entity| {
                        vec![
                            Scope::parse(&format!("{entity}:read")).expect("scope"),
                            Scope::parse(&format!("{entity}:manage")).expect("scope"),
                        ]
                    })
                    .collect(),
                rate_limit: 0,
                expires_at: None,
                last_used_at: None,
                usage_count: 0,
                is_active: true,
                metadata: json!({}),
                created_at: Utc::now(),
            },
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.token.name = name.to_string();
        self
    }

    pub fn hash(mut self, token_hash: &str) -> Self {
        self.token.token_hash = token_hash.to_string();
        self
    }

    pub fn scopes(mut self, scopes: &[&str]) -> Self {
        self.token.scopes = scopes
            .iter()
            .map(|s| Scope::parse(s).expect("valid scope"))
            .collect();
        self
    }

    pub fn rate_limit(mut self, per_minute: u32) -> Self {
        self.token.rate_limit = per_minute;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.token.expires_at = Some(at);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.token.is_active = false;
        self
    }

    pub fn build(self) -> ApiToken {
        self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder_defaults() {
        let task = TaskBuilder::new().build();
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.priority, Priority::Medium);
        assert_eq!(task.user_id, "test-user");
    }

    #[test]
    fn test_done_status_sets_completed_at() {
        let task = TaskBuilder::new().status(TaskStatus::Done).build();
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_token_builder_scope_narrowing() {
        let token = TokenBuilder::for_user("u1").scopes(&["tasks:read"]).build();
        assert_eq!(token.scopes.len(), 1);
        assert!(token.has_scope(&Scope::parse("tasks:read").unwrap()));
        assert!(!token.has_scope(&Scope::parse("tasks:write").unwrap()));
    }
}
