//! SQLite task and subtask repositories.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use taskloom_core::{
    error::{Result, TaskError},
    models::{
        rollup_progress, DependencyType, NewSubtask, NewTask, Subtask, Task, TaskDependency,
        TaskFilter, TaskStatus, UpdateSubtask, UpdateTask,
    },
    repository::{SubtaskRepository, TaskRepository},
};
use uuid::Uuid;

use crate::common::{
    get_string_list, parse_datetime, parse_datetime_opt, parse_priority, parse_status, parse_uuid,
    parse_uuid_opt, sqlx_error_to_task_error,
};

const TASK_COLUMNS: &str = "id, branch_id, title, description, status, priority, details, \
     estimated_effort, due_date, completed_at, completion_summary, testing_notes, context_id, \
     progress_percentage, assignees, labels, user_id, version, created_at, updated_at";

/// SQLite implementation of [`TaskRepository`].
#[derive(Debug, Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> Result<Task> {
        Ok(Task {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            branch_id: parse_uuid(&row.get::<String, _>("branch_id"))?,
            title: row.get("title"),
            description: row.get("description"),
            status: parse_status(&row.get::<String, _>("status"))?,
            priority: parse_priority(row.get::<i64, _>("priority"))?,
            details: row.get("details"),
            estimated_effort: row.get("estimated_effort"),
            due_date: parse_datetime_opt(row.get("due_date"))?,
            completed_at: parse_datetime_opt(row.get("completed_at"))?,
            completion_summary: row.get("completion_summary"),
            testing_notes: row.get("testing_notes"),
            context_id: parse_uuid_opt(row.get("context_id"))?,
            progress_percentage: row.get("progress_percentage"),
            assignees: get_string_list(row, "assignees"),
            labels: get_string_list(row, "labels"),
            dependencies: Vec::new(),
            user_id: row.get("user_id"),
            version: row.get("version"),
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
        })
    }

    /// Hydrate `dependencies` onto a set of tasks in one query.
    async fn attach_dependencies(&self, tasks: &mut [Task]) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(
            "SELECT task_id, depends_on_task_id FROM task_dependencies WHERE task_id IN (",
        );
        let mut separated = builder.separated(", ");
        for task in tasks.iter() {
            separated.push_bind(task.id.to_string());
        }
        separated.push_unseparated(")");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;

        for row in rows {
            let task_id = parse_uuid(&row.get::<String, _>("task_id"))?;
            let depends_on = parse_uuid(&row.get::<String, _>("depends_on_task_id"))?;
            if let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) {
                task.dependencies.push(depends_on);
            }
        }
        Ok(())
    }

    async fn sync_assignees(&self, task_id: Uuid, assignees: &[String], user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM task_assignees WHERE task_id = ?")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        for assignee in assignees {
            sqlx::query(
                "INSERT OR IGNORE INTO task_assignees (task_id, assignee_id, user_id) VALUES (?, ?, ?)",
            )
            .bind(task_id.to_string())
            .bind(assignee)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        }
        Ok(())
    }

    /// Recompute the owning branch's task counters.
    async fn refresh_branch_counters(&self, branch_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE branches SET
                task_count = (SELECT COUNT(*) FROM tasks WHERE tasks.branch_id = branches.id),
                completed_task_count =
                    (SELECT COUNT(*) FROM tasks WHERE tasks.branch_id = branches.id AND status = 'done'),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(branch_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    fn filter_query(filter: &TaskFilter, search: Option<&str>) -> sqlx::QueryBuilder<'static, sqlx::Sqlite> {
        let mut builder: sqlx::QueryBuilder<sqlx::Sqlite> =
            sqlx::QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE 1=1"));

        if let Some(user_id) = filter.user_id.clone() {
            builder.push(" AND user_id = ");
            builder.push_bind(user_id);
        }
        if let Some(branch_id) = filter.branch_id {
            builder.push(" AND branch_id = ");
            builder.push_bind(branch_id.to_string());
        }
        if let Some(project_id) = filter.project_id {
            builder.push(" AND branch_id IN (SELECT id FROM branches WHERE project_id = ");
            builder.push_bind(project_id.to_string());
            builder.push(")");
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(priority) = filter.priority {
            builder.push(" AND priority = ");
            builder.push_bind(priority.level() as i64);
        }
        if let Some(assignee) = filter.assignee.clone() {
            builder.push(
                " AND EXISTS (SELECT 1 FROM task_assignees WHERE task_assignees.task_id = tasks.id AND task_assignees.assignee_id = ",
            );
            builder.push_bind(assignee);
            builder.push(")");
        }
        if let Some(query) = search {
            let pattern = format!("%{query}%");
            builder.push(" AND (title LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR description LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR details LIKE ");
            builder.push_bind(pattern);
            builder.push(")");
        }

        builder.push(" ORDER BY created_at ASC");

        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }
        if let Some(offset) = filter.offset {
            builder.push(" OFFSET ");
            builder.push_bind(offset as i64);
        }
        builder
    }

    async fn fetch_filtered(&self, filter: &TaskFilter, search: Option<&str>) -> Result<Vec<Task>> {
        let mut builder = Self::filter_query(filter, search);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;

        let mut tasks = rows
            .iter()
            .map(Self::row_to_task)
            .collect::<Result<Vec<_>>>()?;

        // Label matching happens here rather than in SQL; labels live in a
        // JSON column.
        if !filter.labels.is_empty() {
            tasks.retain(|t| filter.labels.iter().any(|l| t.labels.contains(l)));
        }

        self.attach_dependencies(&mut tasks).await?;
        Ok(tasks)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: NewTask) -> Result<Task> {
        if task.title.trim().is_empty() {
            return Err(TaskError::empty_field("title"));
        }
        if task.user_id.is_empty() {
            return Err(TaskError::Validation(
                "Task create requires a stamped user_id".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let status = task.status.unwrap_or(TaskStatus::Todo);
        let priority = task.priority.unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, branch_id, title, description, status, priority, details,
                estimated_effort, due_date, progress_percentage, assignees, labels,
                user_id, version, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(task.branch_id.to_string())
        .bind(&task.title)
        .bind(&task.description)
        .bind(status.as_str())
        .bind(priority.level() as i64)
        .bind(&task.details)
        .bind(&task.estimated_effort)
        .bind(task.due_date.map(|d| d.to_rfc3339()))
        .bind(serde_json::to_string(&task.assignees)?)
        .bind(serde_json::to_string(&task.labels)?)
        .bind(&task.user_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        self.sync_assignees(id, &task.assignees, &task.user_id).await?;
        for depends_on in &task.dependencies {
            self.add_dependency(TaskDependency {
                task_id: id,
                depends_on_task_id: *depends_on,
                dependency_type: DependencyType::Blocks,
                user_id: task.user_id.clone(),
            })
            .await?;
        }
        self.refresh_branch_counters(task.branch_id).await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::Internal("Task vanished after insert".to_string()))
    }

    async fn update(&self, id: Uuid, updates: UpdateTask) -> Result<Task> {
        let mut current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::not_found("Task", id))?;

        if let Some(expected) = updates.expected_version {
            if expected != current.version {
                return Err(TaskError::concurrent_modification("Task", id));
            }
        }
        let old_version = current.version;

        if let Some(title) = updates.title {
            if title.trim().is_empty() {
                return Err(TaskError::empty_field("title"));
            }
            current.title = title;
        }
        if let Some(description) = updates.description {
            current.description = description;
        }
        if let Some(status) = updates.status {
            current.status = status;
            // completed_at tracks done-ness exactly
            current.completed_at = (status == TaskStatus::Done).then(Utc::now);
        }
        if let Some(priority) = updates.priority {
            current.priority = priority;
        }
        if let Some(details) = updates.details {
            current.details = Some(details);
        }
        if let Some(effort) = updates.estimated_effort {
            current.estimated_effort = Some(effort);
        }
        if let Some(due) = updates.due_date {
            current.due_date = Some(due);
        }
        if let Some(summary) = updates.completion_summary {
            current.completion_summary = Some(summary);
        }
        if let Some(notes) = updates.testing_notes {
            current.testing_notes = Some(notes);
        }
        if let Some(context_id) = updates.context_id {
            current.context_id = Some(context_id);
        }
        if let Some(progress) = updates.progress_percentage {
            current.progress_percentage = progress;
        }
        if let Some(assignees) = updates.assignees {
            current.assignees = assignees;
        }
        if let Some(labels) = updates.labels {
            current.labels = labels;
        }

        current.version = old_version + 1;
        current.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                title = ?, description = ?, status = ?, priority = ?, details = ?,
                estimated_effort = ?, due_date = ?, completed_at = ?, completion_summary = ?,
                testing_notes = ?, context_id = ?, progress_percentage = ?, assignees = ?,
                labels = ?, version = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&current.title)
        .bind(&current.description)
        .bind(current.status.as_str())
        .bind(current.priority.level() as i64)
        .bind(&current.details)
        .bind(&current.estimated_effort)
        .bind(current.due_date.map(|d| d.to_rfc3339()))
        .bind(current.completed_at.map(|d| d.to_rfc3339()))
        .bind(&current.completion_summary)
        .bind(&current.testing_notes)
        .bind(current.context_id.map(|c| c.to_string()))
        .bind(current.progress_percentage)
        .bind(serde_json::to_string(&current.assignees)?)
        .bind(serde_json::to_string(&current.labels)?)
        .bind(current.version)
        .bind(current.updated_at.to_rfc3339())
        .bind(id.to_string())
        .bind(old_version)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        if result.rows_affected() == 0 {
            // Someone else advanced the version between our read and write.
            return Err(TaskError::concurrent_modification("Task", id));
        }

        self.sync_assignees(id, &current.assignees, &current.user_id).await?;
        self.refresh_branch_counters(current.branch_id).await?;
        Ok(current)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;

        match row {
            Some(row) => {
                let mut tasks = vec![Self::row_to_task(&row)?];
                self.attach_dependencies(&mut tasks).await?;
                Ok(tasks.pop())
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>> {
        self.fetch_filtered(&filter, None).await
    }

    async fn search(&self, query: &str, filter: TaskFilter) -> Result<Vec<Task>> {
        self.fetch_filtered(&filter, Some(query)).await
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let task = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::not_found("Task", id))?;

        // Dependency edges on either endpoint go with the task.
        sqlx::query("DELETE FROM task_dependencies WHERE task_id = ? OR depends_on_task_id = ?")
            .bind(id.to_string())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;

        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;

        self.refresh_branch_counters(task.branch_id).await?;
        Ok(())
    }

    async fn add_dependency(&self, dependency: TaskDependency) -> Result<()> {
        if dependency.task_id == dependency.depends_on_task_id {
            return Err(TaskError::Validation(
                "A task cannot depend on itself".to_string(),
            ));
        }
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_task_id, dependency_type, user_id)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(dependency.task_id.to_string())
        .bind(dependency.depends_on_task_id.to_string())
        .bind(dependency.dependency_type.as_str())
        .bind(&dependency.user_id)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    async fn remove_dependency(&self, task_id: Uuid, depends_on: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM task_dependencies WHERE task_id = ? AND depends_on_task_id = ?")
            .bind(task_id.to_string())
            .bind(depends_on.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }

    async fn dependencies_of(&self, task_id: Uuid) -> Result<Vec<TaskDependency>> {
        let rows = sqlx::query(
            "SELECT task_id, depends_on_task_id, dependency_type, user_id FROM task_dependencies WHERE task_id = ?",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(row_to_dependency).collect()
    }

    async fn dependents_of(&self, task_id: Uuid) -> Result<Vec<TaskDependency>> {
        let rows = sqlx::query(
            "SELECT task_id, depends_on_task_id, dependency_type, user_id FROM task_dependencies WHERE depends_on_task_id = ?",
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(row_to_dependency).collect()
    }
}

fn row_to_dependency(row: &SqliteRow) -> Result<TaskDependency> {
    Ok(TaskDependency {
        task_id: parse_uuid(&row.get::<String, _>("task_id"))?,
        depends_on_task_id: parse_uuid(&row.get::<String, _>("depends_on_task_id"))?,
        dependency_type: DependencyType::Blocks,
        user_id: row.get("user_id"),
    })
}

const SUBTASK_COLUMNS: &str = "id, task_id, title, description, status, priority, assignees, \
     progress_percentage, progress_notes, blockers, completion_summary, impact_on_parent, \
     insights_found, user_id, created_at, updated_at";

/// SQLite implementation of [`SubtaskRepository`]. Every write rolls the
/// parent task's progress up from its subtasks.
#[derive(Debug, Clone)]
pub struct SqliteSubtaskRepository {
    pool: SqlitePool,
}

impl SqliteSubtaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_subtask(row: &SqliteRow) -> Result<Subtask> {
        Ok(Subtask {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            task_id: parse_uuid(&row.get::<String, _>("task_id"))?,
            title: row.get("title"),
            description: row.get("description"),
            status: parse_status(&row.get::<String, _>("status"))?,
            priority: parse_priority(row.get::<i64, _>("priority"))?,
            assignees: get_string_list(row, "assignees"),
            progress_percentage: row.get("progress_percentage"),
            progress_notes: row.get("progress_notes"),
            blockers: row.get("blockers"),
            completion_summary: row.get("completion_summary"),
            impact_on_parent: row.get("impact_on_parent"),
            insights_found: get_string_list(row, "insights_found"),
            user_id: row.get("user_id"),
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
        })
    }

    async fn rollup_parent(&self, task_id: Uuid) -> Result<()> {
        let subtasks = self.list_for_task(task_id).await?;
        let progress = rollup_progress(&subtasks);
        sqlx::query("UPDATE tasks SET progress_percentage = ?, updated_at = ? WHERE id = ?")
            .bind(progress)
            .bind(Utc::now().to_rfc3339())
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }
}

#[async_trait]
impl SubtaskRepository for SqliteSubtaskRepository {
    async fn create(&self, subtask: NewSubtask) -> Result<Subtask> {
        if subtask.title.trim().is_empty() {
            return Err(TaskError::empty_field("title"));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let priority = subtask.priority.unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO task_subtasks (
                id, task_id, title, description, status, priority, assignees,
                progress_percentage, progress_notes, blockers, insights_found,
                user_id, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 'todo', ?, ?, 0, '', '', '[]', ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(subtask.task_id.to_string())
        .bind(&subtask.title)
        .bind(&subtask.description)
        .bind(priority.level() as i64)
        .bind(serde_json::to_string(&subtask.assignees)?)
        .bind(&subtask.user_id)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        self.rollup_parent(subtask.task_id).await?;
        self.get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::Internal("Subtask vanished after insert".to_string()))
    }

    async fn update(&self, id: Uuid, updates: UpdateSubtask) -> Result<Subtask> {
        let mut current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::not_found("Subtask", id))?;

        if let Some(title) = updates.title {
            if title.trim().is_empty() {
                return Err(TaskError::empty_field("title"));
            }
            current.title = title;
        }
        if let Some(description) = updates.description {
            current.description = description;
        }
        if let Some(status) = updates.status {
            current.status = status;
            if status == TaskStatus::Done {
                current.progress_percentage = 100.0;
            }
        }
        if let Some(priority) = updates.priority {
            current.priority = priority;
        }
        if let Some(assignees) = updates.assignees {
            current.assignees = assignees;
        }
        if let Some(progress) = updates.progress_percentage {
            current.progress_percentage = progress;
        }
        if let Some(notes) = updates.progress_notes {
            current.progress_notes = notes;
        }
        if let Some(blockers) = updates.blockers {
            current.blockers = blockers;
        }
        if let Some(summary) = updates.completion_summary {
            current.completion_summary = Some(summary);
        }
        if let Some(impact) = updates.impact_on_parent {
            current.impact_on_parent = Some(impact);
        }
        if let Some(insights) = updates.insights_found {
            current.insights_found = insights;
        }
        current.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE task_subtasks SET
                title = ?, description = ?, status = ?, priority = ?, assignees = ?,
                progress_percentage = ?, progress_notes = ?, blockers = ?,
                completion_summary = ?, impact_on_parent = ?, insights_found = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&current.title)
        .bind(&current.description)
        .bind(current.status.as_str())
        .bind(current.priority.level() as i64)
        .bind(serde_json::to_string(&current.assignees)?)
        .bind(current.progress_percentage)
        .bind(&current.progress_notes)
        .bind(&current.blockers)
        .bind(&current.completion_summary)
        .bind(&current.impact_on_parent)
        .bind(serde_json::to_string(&current.insights_found)?)
        .bind(current.updated_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        self.rollup_parent(current.task_id).await?;
        Ok(current)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Subtask>> {
        let row = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM task_subtasks WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        row.as_ref().map(Self::row_to_subtask).transpose()
    }

    async fn list_for_task(&self, task_id: Uuid) -> Result<Vec<Subtask>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM task_subtasks WHERE task_id = ? ORDER BY created_at ASC"
        ))
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        rows.iter().map(Self::row_to_subtask).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let subtask = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::not_found("Subtask", id))?;

        sqlx::query("DELETE FROM task_subtasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;

        self.rollup_parent(subtask.task_id).await?;
        Ok(())
    }
}
