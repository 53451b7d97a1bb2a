//! SQLite project, branch and agent repositories.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use taskloom_core::{
    error::{Result, TaskError},
    models::{
        Agent, AgentStatus, Branch, NewAgent, NewBranch, NewProject, Project, UpdateAgent,
        UpdateProject,
    },
    repository::{AgentRepository, BranchRepository, ProjectRepository},
};
use uuid::Uuid;

use crate::common::{
    get_string_list, parse_datetime, parse_uuid, parse_uuid_opt, sqlx_error_to_task_error,
};

/// SQLite implementation of [`ProjectRepository`].
#[derive(Debug, Clone)]
pub struct SqliteProjectRepository {
    pool: SqlitePool,
}

impl SqliteProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_project(row: &SqliteRow) -> Result<Project> {
        Ok(Project {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            name: row.get("name"),
            description: row.get("description"),
            status: row.get("status"),
            user_id: row.get("user_id"),
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
        })
    }
}

#[async_trait]
impl ProjectRepository for SqliteProjectRepository {
    async fn create(&self, project: NewProject) -> Result<Project> {
        if project.name.trim().is_empty() {
            return Err(TaskError::empty_field("name"));
        }

        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO projects (id, name, description, status, user_id, created_at, updated_at)
            VALUES (?, ?, ?, 'active', ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&project.name)
        .bind(&project.description)
        .bind(&project.user_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::Internal("Project vanished after insert".to_string()))
    }

    async fn update(&self, id: Uuid, updates: UpdateProject) -> Result<Project> {
        let mut current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::not_found("Project", id))?;

        if let Some(name) = updates.name {
            if name.trim().is_empty() {
                return Err(TaskError::empty_field("name"));
            }
            current.name = name;
        }
        if let Some(description) = updates.description {
            current.description = description;
        }
        if let Some(status) = updates.status {
            current.status = status;
        }
        current.updated_at = Utc::now();

        sqlx::query("UPDATE projects SET name = ?, description = ?, status = ?, updated_at = ? WHERE id = ?")
            .bind(&current.name)
            .bind(&current.description)
            .bind(&current.status)
            .bind(current.updated_at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;

        Ok(current)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_project).transpose()
    }

    async fn get_by_name(&self, name: &str, user_id: &str) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT * FROM projects WHERE name = ? AND user_id = ?")
            .bind(name)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_project).transpose()
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<Project>> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query("SELECT * FROM projects WHERE user_id = ? ORDER BY created_at ASC")
                    .bind(user_id)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM projects ORDER BY created_at ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(Self::row_to_project).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        // Branch and task rows cascade via foreign keys.
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }
}

/// SQLite implementation of [`BranchRepository`].
#[derive(Debug, Clone)]
pub struct SqliteBranchRepository {
    pool: SqlitePool,
}

impl SqliteBranchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_branch(row: &SqliteRow) -> Result<Branch> {
        Ok(Branch {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            project_id: parse_uuid(&row.get::<String, _>("project_id"))?,
            name: row.get("name"),
            description: row.get("description"),
            assigned_agent_id: parse_uuid_opt(row.get("assigned_agent_id"))?,
            status: row.get("status"),
            task_count: row.get("task_count"),
            completed_task_count: row.get("completed_task_count"),
            user_id: row.get("user_id"),
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
        })
    }
}

#[async_trait]
impl BranchRepository for SqliteBranchRepository {
    async fn create(&self, branch: NewBranch) -> Result<Branch> {
        if branch.name.trim().is_empty() {
            return Err(TaskError::empty_field("name"));
        }

        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO branches (id, project_id, name, description, status, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'active', ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(branch.project_id.to_string())
        .bind(&branch.name)
        .bind(&branch.description)
        .bind(&branch.user_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::Internal("Branch vanished after insert".to_string()))
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Branch>> {
        let row = sqlx::query("SELECT * FROM branches WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_branch).transpose()
    }

    async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Branch>> {
        let rows = sqlx::query("SELECT * FROM branches WHERE project_id = ? ORDER BY created_at ASC")
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(Self::row_to_branch).collect()
    }

    async fn list(&self, user_id: Option<&str>) -> Result<Vec<Branch>> {
        let rows = match user_id {
            Some(user_id) => {
                sqlx::query("SELECT * FROM branches WHERE user_id = ? ORDER BY created_at ASC")
                    .bind(user_id)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM branches ORDER BY created_at ASC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(Self::row_to_branch).collect()
    }

    async fn save(&self, branch: Branch) -> Result<Branch> {
        sqlx::query(
            r#"
            UPDATE branches SET
                name = ?, description = ?, assigned_agent_id = ?, status = ?,
                task_count = ?, completed_task_count = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&branch.name)
        .bind(&branch.description)
        .bind(branch.assigned_agent_id.map(|a| a.to_string()))
        .bind(&branch.status)
        .bind(branch.task_count)
        .bind(branch.completed_task_count)
        .bind(Utc::now().to_rfc3339())
        .bind(branch.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        self.get_by_id(branch.id)
            .await?
            .ok_or_else(|| TaskError::not_found("Branch", branch.id))
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM branches WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }
}

/// SQLite implementation of [`AgentRepository`].
#[derive(Debug, Clone)]
pub struct SqliteAgentRepository {
    pool: SqlitePool,
}

impl SqliteAgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_agent(row: &SqliteRow) -> Result<Agent> {
        let status: String = row.get("status");
        Ok(Agent {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            project_id: parse_uuid(&row.get::<String, _>("project_id"))?,
            name: row.get("name"),
            description: row.get("description"),
            role: row.get("role"),
            capabilities: get_string_list(row, "capabilities"),
            status: status
                .parse::<AgentStatus>()
                .map_err(TaskError::Database)?,
            availability_score: row.get("availability_score"),
            user_id: row.get("user_id"),
            created_at: parse_datetime(&row.get::<String, _>("created_at"))?,
            updated_at: parse_datetime(&row.get::<String, _>("updated_at"))?,
        })
    }
}

#[async_trait]
impl AgentRepository for SqliteAgentRepository {
    async fn create(&self, agent: NewAgent) -> Result<Agent> {
        if agent.name.trim().is_empty() {
            return Err(TaskError::empty_field("name"));
        }

        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO agents (id, project_id, name, description, role, capabilities,
                                status, availability_score, user_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'available', 1.0, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(agent.project_id.to_string())
        .bind(&agent.name)
        .bind(&agent.description)
        .bind(&agent.role)
        .bind(serde_json::to_string(&agent.capabilities)?)
        .bind(&agent.user_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::Internal("Agent vanished after insert".to_string()))
    }

    async fn update(&self, id: Uuid, updates: UpdateAgent) -> Result<Agent> {
        let mut current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| TaskError::not_found("Agent", id))?;

        if let Some(name) = updates.name {
            if name.trim().is_empty() {
                return Err(TaskError::empty_field("name"));
            }
            current.name = name;
        }
        if let Some(description) = updates.description {
            current.description = description;
        }
        if let Some(role) = updates.role {
            current.role = role;
        }
        if let Some(capabilities) = updates.capabilities {
            current.capabilities = capabilities;
        }
        if let Some(status) = updates.status {
            current.status = status;
        }
        if let Some(score) = updates.availability_score {
            current.availability_score = score;
        }
        current.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE agents SET name = ?, description = ?, role = ?, capabilities = ?,
                              status = ?, availability_score = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&current.name)
        .bind(&current.description)
        .bind(&current.role)
        .bind(serde_json::to_string(&current.capabilities)?)
        .bind(current.status.as_str())
        .bind(current.availability_score)
        .bind(current.updated_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_task_error)?;

        Ok(current)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        row.as_ref().map(Self::row_to_agent).transpose()
    }

    async fn list_for_project(&self, project_id: Uuid) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE project_id = ? ORDER BY created_at ASC")
            .bind(project_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        rows.iter().map(Self::row_to_agent).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        // Release any branch held by this agent first.
        sqlx::query("UPDATE branches SET assigned_agent_id = NULL WHERE assigned_agent_id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;

        sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_task_error)?;
        Ok(())
    }
}
