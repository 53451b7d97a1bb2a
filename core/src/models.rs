use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task lifecycle states.
///
/// The typical flow is: `todo → in_progress → {review|testing|done}`, with
/// `blocked` as a temporary detour and `cancelled` available from any
/// non-terminal state that is not blocked.
///
/// # State Transitions
///
/// - `todo` → `in_progress`, `cancelled`
/// - `in_progress` → `review`, `testing`, `blocked`, `done`, `cancelled`
/// - `blocked` → `in_progress`
/// - `review` → `in_progress`, `done`, `cancelled`
/// - `testing` → `in_progress`, `done`, `cancelled`
/// - `done`, `cancelled` → (terminal)
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Newly created, not yet started
    Todo,
    /// Actively being worked on
    InProgress,
    /// Cannot proceed until a blocker clears
    Blocked,
    /// Ready for review
    Review,
    /// Under test
    Testing,
    /// Completed
    Done,
    /// Abandoned
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Review => "review",
            Self::Testing => "testing",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Actionable means the selector may hand this task to an agent.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::Todo | Self::InProgress)
    }

    /// Rank used by the next-task selector: `todo` before `in_progress`,
    /// everything else after.
    pub fn selector_rank(&self) -> u8 {
        match self {
            Self::Todo => 0,
            Self::InProgress => 1,
            _ => 2,
        }
    }

    /// Check whether the state machine permits moving to `new_status`.
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        use TaskStatus::*;

        match (*self, new_status) {
            // No self transitions
            (current, new) if current == new => false,

            (Todo, InProgress | Cancelled) => true,
            (InProgress, Review | Testing | Blocked | Done | Cancelled) => true,
            (Blocked, InProgress) => true,
            (Review, InProgress | Done | Cancelled) => true,
            (Testing, InProgress | Done | Cancelled) => true,

            // Terminal states allow nothing
            (Done | Cancelled, _) => false,

            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "review" => Ok(Self::Review),
            "testing" => Ok(Self::Testing),
            "done" => Ok(Self::Done),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            other => Err(format!("Unknown task status: '{other}'")),
        }
    }
}

/// Task priority levels, ordered `low < medium < high < urgent < critical`.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        }
    }

    /// Numeric level carried at the storage boundary (`low` = 1 … `critical` = 5).
    pub fn level(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Urgent => 4,
            Self::Critical => 5,
        }
    }

    /// Rank used by the next-task selector, ascending: `critical` = 0 … `low` = 4.
    pub fn selector_rank(&self) -> u8 {
        5 - self.level()
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            4 => Some(Self::Urgent),
            5 => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            "critical" => Ok(Self::Critical),
            other => Err(format!("Unknown priority: '{other}'")),
        }
    }
}

/// A project groups branches (workspaces) for one tenant. Names are unique
/// per user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data transfer object for creating projects
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Stamped by the user-scoped repository layer; any caller-supplied
    /// value is overwritten.
    #[serde(default)]
    pub user_id: String,
}

/// Data transfer object for updating projects
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProject {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
}

/// A branch is a project sub-scope that owns tasks, analogous to a git
/// feature branch. Names are unique within a project; deleting the project
/// cascades.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: String,
    /// Agent currently holding this branch, if any. An assignment is
    /// rejected unless the branch is unassigned or held by the same agent.
    pub assigned_agent_id: Option<Uuid>,
    pub status: String,
    pub task_count: i64,
    pub completed_task_count: i64,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBranch {
    pub project_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub user_id: String,
}

/// The kind of edge in the dependency graph. Only blocking edges exist
/// today; the discriminator is stored so the collection can grow.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Blocks,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
        }
    }
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed edge: `task_id` cannot progress until `depends_on_task_id`
/// is done. Self edges are forbidden; cross-branch edges are allowed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on_task_id: Uuid,
    pub dependency_type: DependencyType,
    pub user_id: String,
}

/// Core task representation.
///
/// A task is a unit of work owned by a branch, tracked through the
/// [`TaskStatus`] state machine, and optionally linked to a task-level
/// context document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub details: Option<String>,
    pub estimated_effort: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    /// Set exactly when `status == done`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Required to transition into `done`.
    pub completion_summary: Option<String>,
    pub testing_notes: Option<String>,
    /// Link to the task-level context document, if one was materialised.
    pub context_id: Option<Uuid>,
    /// Rolled up from subtasks; range `[0, 100]`, one decimal.
    pub progress_percentage: f64,
    pub assignees: Vec<String>,
    pub labels: Vec<String>,
    /// Ids of tasks this task depends on (`blocks` edges, hydrated from
    /// the dependency collection).
    pub dependencies: Vec<Uuid>,
    pub user_id: String,
    /// Optimistic concurrency counter, bumped on every write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Check whether the state machine permits moving to `new_status`.
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// True when every listed dependency appears in `done` within `done_ids`.
    pub fn is_ready(&self, done_ids: &std::collections::HashSet<Uuid>) -> bool {
        self.dependencies.iter().all(|dep| done_ids.contains(dep))
    }
}

/// Data transfer object for creating tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub branch_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub details: Option<String>,
    pub estimated_effort: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub user_id: String,
}

impl NewTask {
    pub fn new(branch_id: Uuid, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            branch_id,
            title: title.into(),
            description: description.into(),
            status: None,
            priority: None,
            details: None,
            estimated_effort: None,
            due_date: None,
            assignees: vec![],
            labels: vec![],
            dependencies: vec![],
            user_id: String::new(),
        }
    }
}

/// Data transfer object for updating tasks. Only `Some` fields are applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub details: Option<String>,
    pub estimated_effort: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub completion_summary: Option<String>,
    pub testing_notes: Option<String>,
    pub context_id: Option<Uuid>,
    pub progress_percentage: Option<f64>,
    pub assignees: Option<Vec<String>>,
    pub labels: Option<Vec<String>>,
    /// When set, the write fails with `CONCURRENT_MODIFICATION` unless the
    /// stored version matches.
    pub expected_version: Option<i64>,
}

/// Filter criteria for querying tasks. Fields combine with AND logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub branch_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
    /// Composed by the user-scoped repository layer; callers leave it unset.
    pub user_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// A subtask belongs to exactly one task. A task cannot complete while any
/// subtask is still open.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subtask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub assignees: Vec<String>,
    pub progress_percentage: f64,
    pub progress_notes: String,
    pub blockers: String,
    pub completion_summary: Option<String>,
    pub impact_on_parent: Option<String>,
    pub insights_found: Vec<String>,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subtask {
    /// Open means the subtask still counts against parent completion.
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubtask {
    pub task_id: Uuid,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Option<Priority>,
    #[serde(default)]
    pub assignees: Vec<String>,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSubtask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub assignees: Option<Vec<String>>,
    pub progress_percentage: Option<f64>,
    pub progress_notes: Option<String>,
    pub blockers: Option<String>,
    pub completion_summary: Option<String>,
    pub impact_on_parent: Option<String>,
    pub insights_found: Option<Vec<String>>,
}

/// Compute a task's progress from its subtasks: the mean of subtask
/// progress percentages, rounded to one decimal. Empty input yields 0.
pub fn rollup_progress(subtasks: &[Subtask]) -> f64 {
    if subtasks.is_empty() {
        return 0.0;
    }
    let total: f64 = subtasks.iter().map(|s| s.progress_percentage).sum();
    let pct = total / subtasks.len() as f64;
    (pct * 10.0).round() / 10.0
}

/// Agent availability states
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    Offline,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Available
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "available" => Ok(Self::Available),
            "busy" => Ok(Self::Busy),
            "offline" => Ok(Self::Offline),
            other => Err(format!("Unknown agent status: '{other}'")),
        }
    }
}

/// An agent registered to a project. At most one branch assignment at a
/// time, tracked on [`Branch::assigned_agent_id`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: String,
    pub role: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
    /// Scheduling weight in `[0, 1]`; higher means more available.
    pub availability_score: f64,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAgent {
    pub project_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub user_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateAgent {
    pub name: Option<String>,
    pub description: Option<String>,
    pub role: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub status: Option<AgentStatus>,
    pub availability_score: Option<f64>,
}
