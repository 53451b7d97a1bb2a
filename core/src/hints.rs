//! Workflow hints: value objects and the pluggable rule contract.
//!
//! A rule is a pure function of a [`RuleContext`]; it never mutates its
//! inputs. Rules are values registered on the engine, not subclasses.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{Subtask, Task, TaskStatus};

/// Kinds of hints the pipeline can emit.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HintType {
    Recommendation,
    Warning,
    Opportunity,
    Blocker,
}

impl HintType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recommendation => "recommendation",
            Self::Warning => "warning",
            Self::Opportunity => "opportunity",
            Self::Blocker => "blocker",
        }
    }
}

impl std::str::FromStr for HintType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "recommendation" => Ok(Self::Recommendation),
            "warning" => Ok(Self::Warning),
            "opportunity" => Ok(Self::Opportunity),
            "blocker" => Ok(Self::Blocker),
            other => Err(format!("Unknown hint type: '{other}'")),
        }
    }
}

/// How much a hint matters if followed (or ignored).
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ImpactLevel {
    /// Base weight feeding the urgency score.
    pub fn weight(&self) -> f64 {
        match self {
            Self::Low => 0.25,
            Self::Medium => 0.5,
            Self::High => 0.75,
            Self::Critical => 1.0,
        }
    }
}

/// Per-hint bookkeeping attached by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HintMetadata {
    /// Rule that produced the hint.
    pub rule_name: String,
    /// Historical acceptance EWMA for the rule; 0.5 when unknown.
    pub effectiveness_score: f64,
    /// Impact weight scaled by expiry proximity, capped at 1.0.
    pub urgency_score: f64,
}

/// A single workflow hint. Ephemeral unless accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowHint {
    pub id: Uuid,
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub hint_type: HintType,
    pub title: String,
    pub description: String,
    pub impact: ImpactLevel,
    pub suggested_actions: Vec<String>,
    /// Workflow objectives the hint bears on (delivery, quality, …).
    pub affected_objectives: Vec<String>,
    pub affected_tasks: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: HintMetadata,
}

impl WorkflowHint {
    pub fn new(
        task_id: Uuid,
        hint_type: HintType,
        impact: ImpactLevel,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            hint_type,
            title: title.into(),
            description: description.into(),
            impact,
            suggested_actions: vec![],
            affected_objectives: vec![],
            affected_tasks: vec![],
            created_at: Utc::now(),
            expires_at: None,
            metadata: HintMetadata {
                rule_name: String::new(),
                effectiveness_score: 0.5,
                urgency_score: impact.weight(),
            },
        }
    }

    pub fn with_actions(mut self, actions: Vec<String>) -> Self {
        self.suggested_actions = actions;
        self
    }

    pub fn with_objectives(mut self, objectives: &[&str]) -> Self {
        self.affected_objectives = objectives.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Urgency combines the impact weight with expiry proximity: ×1.5
    /// when expiring within a day, ×1.2 within a week, capped at 1.0.
    pub fn urgency(&self, now: DateTime<Utc>) -> f64 {
        let mut score = self.impact.weight();
        if let Some(expires) = self.expires_at {
            let remaining = expires - now;
            if remaining <= Duration::days(1) {
                score *= 1.5;
            } else if remaining <= Duration::days(7) {
                score *= 1.2;
            }
        }
        score.min(1.0)
    }
}

/// Everything a rule may look at. Rules never see repositories.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub task: Task,
    /// Resolved task-level context document, when one exists.
    pub task_context: Option<Value>,
    pub subtasks: Vec<Subtask>,
    /// Same-branch tasks plus cross-branch dependency endpoints.
    pub related_tasks: Vec<Task>,
    /// Per-rule acceptance history keyed by rule name.
    pub historical_patterns: HashMap<String, f64>,
    pub now: DateTime<Utc>,
}

impl RuleContext {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            task_context: None,
            subtasks: vec![],
            related_tasks: vec![],
            historical_patterns: HashMap::new(),
            now: Utc::now(),
        }
    }

    /// Predecessors of the task that are not yet done. A dependency with
    /// no loaded counterpart counts as unsatisfied.
    pub fn unsatisfied_dependencies(&self) -> Vec<Uuid> {
        self.task
            .dependencies
            .iter()
            .filter(|dep| {
                !self
                    .related_tasks
                    .iter()
                    .any(|t| t.id == **dep && t.status == TaskStatus::Done)
            })
            .copied()
            .collect()
    }

    fn subtask_done_ratio(&self) -> f64 {
        if self.subtasks.is_empty() {
            return 0.0;
        }
        let done = self
            .subtasks
            .iter()
            .filter(|s| s.status == TaskStatus::Done)
            .count();
        done as f64 / self.subtasks.len() as f64
    }
}

/// The two-method rule contract. Implementations are pure.
pub trait HintRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_applicable(&self, ctx: &RuleContext) -> bool;

    /// Zero or one hint. Only called when [`is_applicable`](Self::is_applicable)
    /// answered true.
    fn generate_hint(&self, ctx: &RuleContext) -> Option<WorkflowHint>;
}

/// In-progress task untouched for more than 48 hours.
pub struct StalledProgressRule;

impl HintRule for StalledProgressRule {
    fn name(&self) -> &'static str {
        "stalled_progress"
    }

    fn is_applicable(&self, ctx: &RuleContext) -> bool {
        ctx.task.status == TaskStatus::InProgress
            && ctx.now - ctx.task.updated_at > Duration::hours(48)
    }

    fn generate_hint(&self, ctx: &RuleContext) -> Option<WorkflowHint> {
        let idle_hours = (ctx.now - ctx.task.updated_at).num_hours();
        Some(
            WorkflowHint::new(
                ctx.task.id,
                HintType::Warning,
                ImpactLevel::High,
                format!("Task '{}' has stalled", ctx.task.title),
                format!("No updates for {idle_hours} hours while in progress."),
            )
            .with_actions(vec![
                "Record current progress or blockers".to_string(),
                "Move the task to blocked if it cannot proceed".to_string(),
            ])
            .with_objectives(&["delivery cadence"]),
        )
    }
}

/// Most subtasks done but no testing notes yet.
pub struct ImplementationReadyForTestingRule;

impl HintRule for ImplementationReadyForTestingRule {
    fn name(&self) -> &'static str {
        "implementation_ready_for_testing"
    }

    fn is_applicable(&self, ctx: &RuleContext) -> bool {
        !ctx.subtasks.is_empty()
            && ctx.subtask_done_ratio() >= 0.8
            && ctx
                .task
                .testing_notes
                .as_deref()
                .map(str::trim)
                .map(str::is_empty)
                .unwrap_or(true)
    }

    fn generate_hint(&self, ctx: &RuleContext) -> Option<WorkflowHint> {
        Some(
            WorkflowHint::new(
                ctx.task.id,
                HintType::Recommendation,
                ImpactLevel::Medium,
                "Implementation looks ready for testing".to_string(),
                format!(
                    "{:.0}% of subtasks are done and no testing notes are recorded.",
                    ctx.subtask_done_ratio() * 100.0
                ),
            )
            .with_actions(vec![
                "Run the test suite and record testing notes".to_string(),
                "Move the task to testing".to_string(),
            ])
            .with_objectives(&["quality assurance"]),
        )
    }
}

/// In-progress task with no resolved context data.
pub struct MissingContextRule;

impl HintRule for MissingContextRule {
    fn name(&self) -> &'static str {
        "missing_context"
    }

    fn is_applicable(&self, ctx: &RuleContext) -> bool {
        if ctx.task.status != TaskStatus::InProgress {
            return false;
        }
        match &ctx.task_context {
            None => true,
            Some(Value::Object(map)) => map.is_empty(),
            Some(Value::Null) => true,
            Some(_) => false,
        }
    }

    fn generate_hint(&self, ctx: &RuleContext) -> Option<WorkflowHint> {
        Some(
            WorkflowHint::new(
                ctx.task.id,
                HintType::Warning,
                ImpactLevel::Medium,
                "Task is running without context".to_string(),
                "Work in progress has no resolved context; decisions and insights are not being captured.".to_string(),
            )
            .with_actions(vec!["Create a task context and record the current state".to_string()])
            .with_objectives(&["knowledge capture"]),
        )
    }
}

/// Three or more unsatisfied predecessors.
pub struct ComplexDependencyRule;

impl HintRule for ComplexDependencyRule {
    fn name(&self) -> &'static str {
        "complex_dependency"
    }

    fn is_applicable(&self, ctx: &RuleContext) -> bool {
        ctx.unsatisfied_dependencies().len() >= 3
    }

    fn generate_hint(&self, ctx: &RuleContext) -> Option<WorkflowHint> {
        let blockers = ctx.unsatisfied_dependencies();
        let mut hint = WorkflowHint::new(
            ctx.task.id,
            HintType::Blocker,
            ImpactLevel::High,
            format!("Task '{}' is gated on {} prerequisites", ctx.task.title, blockers.len()),
            "Consider splitting the task or re-ordering the dependency chain.".to_string(),
        )
        .with_actions(vec![
            "Review whether every dependency is still required".to_string(),
            "Prioritise the blocking tasks".to_string(),
        ])
        .with_objectives(&["dependency management"]);
        hint.affected_tasks = blockers;
        Some(hint)
    }
}

/// Progress at 90% or more but not done yet.
pub struct NearCompletionRule;

impl HintRule for NearCompletionRule {
    fn name(&self) -> &'static str {
        "near_completion"
    }

    fn is_applicable(&self, ctx: &RuleContext) -> bool {
        ctx.task.progress_percentage >= 90.0 && ctx.task.status != TaskStatus::Done
    }

    fn generate_hint(&self, ctx: &RuleContext) -> Option<WorkflowHint> {
        Some(
            WorkflowHint::new(
                ctx.task.id,
                HintType::Opportunity,
                ImpactLevel::Medium,
                format!("Task '{}' is nearly complete", ctx.task.title),
                format!(
                    "Progress is at {:.1}%. Close out the remaining work and write the completion summary.",
                    ctx.task.progress_percentage
                ),
            )
            .with_actions(vec![
                "Finish the remaining subtasks".to_string(),
                "Write the completion summary and complete the task".to_string(),
            ])
            .with_objectives(&["completion"]),
        )
    }
}

/// Several assignees but no recent activity.
pub struct CollaborationNeededRule;

impl HintRule for CollaborationNeededRule {
    fn name(&self) -> &'static str {
        "collaboration_needed"
    }

    fn is_applicable(&self, ctx: &RuleContext) -> bool {
        ctx.task.assignees.len() > 1 && ctx.now - ctx.task.updated_at > Duration::hours(24)
    }

    fn generate_hint(&self, ctx: &RuleContext) -> Option<WorkflowHint> {
        Some(
            WorkflowHint::new(
                ctx.task.id,
                HintType::Recommendation,
                ImpactLevel::Medium,
                "Multi-assignee task has gone quiet".to_string(),
                format!(
                    "{} assignees and no updates in the last day; the group may be waiting on each other.",
                    ctx.task.assignees.len()
                ),
            )
            .with_actions(vec!["Sync the assignees and record who owns the next step".to_string()])
            .with_objectives(&["team coordination"]),
        )
    }
}

/// The standard rule set in its stable execution order.
pub fn standard_rules() -> Vec<std::sync::Arc<dyn HintRule>> {
    vec![
        std::sync::Arc::new(StalledProgressRule),
        std::sync::Arc::new(ImplementationReadyForTestingRule),
        std::sync::Arc::new(MissingContextRule),
        std::sync::Arc::new(ComplexDependencyRule),
        std::sync::Arc::new(NearCompletionRule),
        std::sync::Arc::new(CollaborationNeededRule),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use serde_json::json;

    fn base_task(status: TaskStatus) -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            title: "Test".to_string(),
            description: String::new(),
            status,
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
            user_id: "u1".to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    fn subtask(task_id: Uuid, status: TaskStatus) -> Subtask {
        let now = Utc::now();
        Subtask {
            id: Uuid::new_v4(),
            task_id,
            title: "s".to_string(),
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
        }
    }

    #[test]
    fn test_stalled_progress_rule() {
        let rule = StalledProgressRule;

        let mut task = base_task(TaskStatus::InProgress);
        task.updated_at = Utc::now() - Duration::hours(72);
        let ctx = RuleContext::new(task);
        assert!(rule.is_applicable(&ctx));
        let hint = rule.generate_hint(&ctx).unwrap();
        assert_eq!(hint.hint_type, HintType::Warning);
        assert_eq!(hint.impact, ImpactLevel::High);

        // Fresh in-progress task: not stalled
        let ctx = RuleContext::new(base_task(TaskStatus::InProgress));
        assert!(!rule.is_applicable(&ctx));

        // Old but not in progress: not stalled
        let mut task = base_task(TaskStatus::Todo);
        task.updated_at = Utc::now() - Duration::hours(72);
        assert!(!rule.is_applicable(&RuleContext::new(task)));
    }

    #[test]
    fn test_ready_for_testing_rule() {
        let rule = ImplementationReadyForTestingRule;

        let task = base_task(TaskStatus::InProgress);
        let task_id = task.id;
        let mut ctx = RuleContext::new(task);
        ctx.subtasks = vec![
            subtask(task_id, TaskStatus::Done),
            subtask(task_id, TaskStatus::Done),
            subtask(task_id, TaskStatus::Done),
            subtask(task_id, TaskStatus::Done),
            subtask(task_id, TaskStatus::Todo),
        ];
        // 4/5 = 80%
        assert!(rule.is_applicable(&ctx));

        // Testing notes already present: rule stands down
        ctx.task.testing_notes = Some("covered by integration suite".to_string());
        assert!(!rule.is_applicable(&ctx));

        // No subtasks at all: nothing to be ready
        ctx.task.testing_notes = None;
        ctx.subtasks.clear();
        assert!(!rule.is_applicable(&ctx));
    }

    #[test]
    fn test_missing_context_rule() {
        let rule = MissingContextRule;

        let mut ctx = RuleContext::new(base_task(TaskStatus::InProgress));
        assert!(rule.is_applicable(&ctx));

        ctx.task_context = Some(json!({}));
        assert!(rule.is_applicable(&ctx));

        ctx.task_context = Some(json!({"task_data": {"status": "in_progress"}}));
        assert!(!rule.is_applicable(&ctx));

        let mut ctx = RuleContext::new(base_task(TaskStatus::Todo));
        ctx.task_context = None;
        assert!(!rule.is_applicable(&ctx));
    }

    #[test]
    fn test_complex_dependency_rule() {
        let rule = ComplexDependencyRule;

        let mut task = base_task(TaskStatus::Todo);
        task.dependencies = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let ctx = RuleContext::new(task.clone());
        assert!(rule.is_applicable(&ctx));
        let hint = rule.generate_hint(&ctx).unwrap();
        assert_eq!(hint.hint_type, HintType::Blocker);
        assert_eq!(hint.affected_tasks.len(), 3);

        // One predecessor done: below threshold
        let mut done_dep = base_task(TaskStatus::Done);
        done_dep.id = task.dependencies[0];
        let mut ctx = RuleContext::new(task);
        ctx.related_tasks = vec![done_dep];
        assert!(!rule.is_applicable(&ctx));
    }

    #[test]
    fn test_near_completion_rule() {
        let rule = NearCompletionRule;

        let mut task = base_task(TaskStatus::InProgress);
        task.progress_percentage = 92.0;
        assert!(rule.is_applicable(&RuleContext::new(task.clone())));

        task.progress_percentage = 89.9;
        assert!(!rule.is_applicable(&RuleContext::new(task.clone())));

        task.progress_percentage = 100.0;
        task.status = TaskStatus::Done;
        assert!(!rule.is_applicable(&RuleContext::new(task)));
    }

    #[test]
    fn test_collaboration_needed_rule() {
        let rule = CollaborationNeededRule;

        let mut task = base_task(TaskStatus::InProgress);
        task.assignees = vec!["a".to_string(), "b".to_string()];
        task.updated_at = Utc::now() - Duration::hours(30);
        assert!(rule.is_applicable(&RuleContext::new(task.clone())));

        task.assignees = vec!["a".to_string()];
        assert!(!rule.is_applicable(&RuleContext::new(task.clone())));

        task.assignees = vec!["a".to_string(), "b".to_string()];
        task.updated_at = Utc::now();
        assert!(!rule.is_applicable(&RuleContext::new(task)));
    }

    #[test]
    fn test_urgency_scaling() {
        let now = Utc::now();
        let task_id = Uuid::new_v4();

        let plain = WorkflowHint::new(task_id, HintType::Warning, ImpactLevel::Medium, "t", "d");
        assert_eq!(plain.urgency(now), 0.5);

        let soon = plain.clone().with_expiry(now + Duration::hours(6));
        assert_eq!(soon.urgency(now), 0.75);

        let this_week = plain.clone().with_expiry(now + Duration::days(3));
        assert!((this_week.urgency(now) - 0.6).abs() < 1e-9);

        // Critical impact expiring soon caps at 1.0
        let capped = WorkflowHint::new(task_id, HintType::Blocker, ImpactLevel::Critical, "t", "d")
            .with_expiry(now + Duration::hours(1));
        assert_eq!(capped.urgency(now), 1.0);
    }

    #[test]
    fn test_rules_name_affected_objectives() {
        // Every standard rule tags the objectives its hint bears on, and
        // the field survives serialization.
        let mut task = base_task(TaskStatus::InProgress);
        task.updated_at = Utc::now() - Duration::hours(72);
        let ctx = RuleContext::new(task);

        let hint = StalledProgressRule.generate_hint(&ctx).unwrap();
        assert_eq!(hint.affected_objectives, vec!["delivery cadence"]);

        let json = serde_json::to_value(&hint).unwrap();
        assert_eq!(json["affected_objectives"], json!(["delivery cadence"]));

        let mut task = base_task(TaskStatus::Todo);
        task.dependencies = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let hint = ComplexDependencyRule
            .generate_hint(&RuleContext::new(task))
            .unwrap();
        assert_eq!(hint.affected_objectives, vec!["dependency management"]);
    }

    #[test]
    fn test_standard_rule_order_is_stable() {
        let names: Vec<&str> = standard_rules().iter().map(|r| r.name()).collect();
        assert_eq!(
            names,
            vec![
                "stalled_progress",
                "implementation_ready_for_testing",
                "missing_context",
                "complex_dependency",
                "near_completion",
                "collaboration_needed",
            ]
        );
    }
}
