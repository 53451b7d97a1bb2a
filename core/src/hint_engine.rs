//! Hint generation pipeline and the effectiveness feedback loop.
//!
//! The engine runs the registered rules in a stable order over a prepared
//! [`RuleContext`], annotates each hint with the rule's historical
//! effectiveness, ranks by urgency, and appends the hint events to the
//! event store. Feedback (accept / dismiss / score) feeds a per-rule EWMA
//! that future generations read back.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, TaskError};
use crate::events::{self, EventStore};
use crate::hints::{standard_rules, HintRule, HintType, RuleContext, WorkflowHint};

/// EWMA decay applied per feedback update.
const EFFECTIVENESS_DECAY: f64 = 0.1;

/// Effectiveness assumed for a rule with no history yet.
const DEFAULT_EFFECTIVENESS: f64 = 0.5;

/// Hints kept in the ephemeral registry so feedback can find them.
const HINT_REGISTRY_CAP: usize = 1024;

/// Process-wide hint engine. Rules are registered values; adding one is a
/// registration, not a subclass.
pub struct HintEngine {
    rules: Vec<Arc<dyn HintRule>>,
    events: Arc<dyn EventStore>,
    /// Per-rule acceptance EWMA, keyed by rule name.
    effectiveness: RwLock<HashMap<String, f64>>,
    /// Recently generated hints; hints are ephemeral unless accepted.
    recent: RwLock<HashMap<Uuid, WorkflowHint>>,
}

impl HintEngine {
    /// Engine with the six standard rules.
    pub fn new(events: Arc<dyn EventStore>) -> Self {
        Self::with_rules(standard_rules(), events)
    }

    pub fn with_rules(rules: Vec<Arc<dyn HintRule>>, events: Arc<dyn EventStore>) -> Self {
        Self {
            rules,
            events,
            effectiveness: RwLock::new(HashMap::new()),
            recent: RwLock::new(HashMap::new()),
        }
    }

    /// Register an additional rule at the end of the execution order.
    pub fn register(&mut self, rule: Arc<dyn HintRule>) {
        self.rules.push(rule);
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Run the pipeline for one task.
    ///
    /// `types` filters the output; ranking is `(urgency desc,
    /// effectiveness desc)`. Every emitted hint is recorded as a
    /// `HintGenerated` event.
    pub async fn generate(
        &self,
        mut ctx: RuleContext,
        types: Option<&[HintType]>,
        user_id: &str,
    ) -> Result<Vec<WorkflowHint>> {
        ctx.historical_patterns = self.effectiveness.read().await.clone();

        let mut hints = Vec::new();
        for rule in &self.rules {
            if !rule.is_applicable(&ctx) {
                continue;
            }
            let Some(mut hint) = rule.generate_hint(&ctx) else {
                continue;
            };
            hint.metadata.rule_name = rule.name().to_string();
            hint.metadata.effectiveness_score = ctx
                .historical_patterns
                .get(rule.name())
                .copied()
                .unwrap_or(DEFAULT_EFFECTIVENESS);
            hint.metadata.urgency_score = hint.urgency(ctx.now);
            hints.push(hint);
        }

        if let Some(types) = types {
            hints.retain(|h| types.contains(&h.hint_type));
        }

        hints.sort_by(|a, b| {
            b.metadata
                .urgency_score
                .partial_cmp(&a.metadata.urgency_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.metadata
                        .effectiveness_score
                        .partial_cmp(&a.metadata.effectiveness_score)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });

        for hint in &hints {
            if let Err(err) = self
                .events
                .append(events::hint_generated(
                    hint.id,
                    hint.task_id,
                    &hint.metadata.rule_name,
                    user_id,
                ))
                .await
            {
                warn!(error = %err, "Failed to append HintGenerated event");
            }
        }

        self.remember(&hints).await;
        debug!(task_id = %ctx.task.id, count = hints.len(), "Generated hints");
        Ok(hints)
    }

    async fn remember(&self, hints: &[WorkflowHint]) {
        let mut recent = self.recent.write().await;
        // Bound the registry; feedback on evicted hints just misses.
        if recent.len() + hints.len() > HINT_REGISTRY_CAP {
            recent.clear();
        }
        for hint in hints {
            recent.insert(hint.id, hint.clone());
        }
    }

    async fn take_hint(&self, hint_id: Uuid) -> Result<WorkflowHint> {
        self.recent
            .read()
            .await
            .get(&hint_id)
            .cloned()
            .ok_or_else(|| TaskError::not_found("Hint", hint_id))
    }

    /// Record acceptance: full-strength positive signal.
    pub async fn accept(&self, hint_id: Uuid, user_id: &str) -> Result<()> {
        let hint = self.take_hint(hint_id).await?;
        self.update_effectiveness(&hint.metadata.rule_name, 1.0).await;
        self.events
            .append(events::hint_accepted(
                hint.id,
                hint.task_id,
                &hint.metadata.rule_name,
                user_id,
            ))
            .await?;
        Ok(())
    }

    /// Record dismissal: full-strength negative signal.
    pub async fn dismiss(&self, hint_id: Uuid, reason: Option<&str>, user_id: &str) -> Result<()> {
        let hint = self.take_hint(hint_id).await?;
        self.update_effectiveness(&hint.metadata.rule_name, 0.0).await;
        self.events
            .append(events::hint_dismissed(
                hint.id,
                hint.task_id,
                &hint.metadata.rule_name,
                reason,
                user_id,
            ))
            .await?;
        Ok(())
    }

    /// Record graded feedback. `score` overrides the boolean when given.
    pub async fn feedback(
        &self,
        hint_id: Uuid,
        helpful: bool,
        score: Option<f64>,
        user_id: &str,
    ) -> Result<()> {
        let hint = self.take_hint(hint_id).await?;
        let signal = score
            .map(|s| s.clamp(0.0, 1.0))
            .unwrap_or(if helpful { 1.0 } else { 0.0 });
        self.update_effectiveness(&hint.metadata.rule_name, signal).await;
        self.events
            .append(events::hint_feedback(
                hint.id,
                hint.task_id,
                &hint.metadata.rule_name,
                helpful,
                user_id,
            ))
            .await?;
        Ok(())
    }

    async fn update_effectiveness(&self, rule_name: &str, signal: f64) {
        let mut map = self.effectiveness.write().await;
        let current = map.get(rule_name).copied().unwrap_or(DEFAULT_EFFECTIVENESS);
        let updated = current * (1.0 - EFFECTIVENESS_DECAY) + signal * EFFECTIVENESS_DECAY;
        map.insert(rule_name.to_string(), updated);
    }

    /// Current EWMA for a rule (default 0.5 when unknown).
    pub async fn effectiveness_of(&self, rule_name: &str) -> f64 {
        self.effectiveness
            .read()
            .await
            .get(rule_name)
            .copied()
            .unwrap_or(DEFAULT_EFFECTIVENESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, StoredEvent};
    use crate::hints::ImpactLevel;
    use crate::models::{Priority, Task, TaskStatus};
    use async_trait::async_trait;
    use chrono::{Duration, Utc};

    #[derive(Default)]
    struct StubEventStore {
        appended: tokio::sync::Mutex<Vec<StoredEvent>>,
    }

    #[async_trait]
    impl EventStore for StubEventStore {
        async fn append(&self, event: StoredEvent) -> Result<Uuid> {
            let id = event.event_id;
            self.appended.lock().await.push(event);
            Ok(id)
        }

        async fn get(&self, _filter: EventFilter) -> Result<Vec<StoredEvent>> {
            Ok(self.appended.lock().await.clone())
        }

        async fn get_aggregate(
            &self,
            aggregate_id: Uuid,
            _from_version: Option<i64>,
        ) -> Result<Vec<StoredEvent>> {
            Ok(self
                .appended
                .lock()
                .await
                .iter()
                .filter(|e| e.aggregate_id == Some(aggregate_id))
                .cloned()
                .collect())
        }

        async fn latest_snapshot(&self, _aggregate_id: Uuid) -> Result<Option<StoredEvent>> {
            Ok(None)
        }

        async fn clear(&self) -> Result<()> {
            self.appended.lock().await.clear();
            Ok(())
        }
    }

    fn stalled_task() -> Task {
        let now = Utc::now();
        Task {
            id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            title: "Stalled".to_string(),
            description: String::new(),
            status: TaskStatus::InProgress,
            priority: Priority::High,
            details: None,
            estimated_effort: None,
            due_date: None,
            completed_at: None,
            completion_summary: None,
            testing_notes: None,
            context_id: None,
            progress_percentage: 95.0,
            assignees: vec![],
            labels: vec![],
            dependencies: vec![],
            user_id: "u1".to_string(),
            version: 1,
            created_at: now - Duration::days(5),
            updated_at: now - Duration::days(3),
        }
    }

    #[tokio::test]
    async fn test_generate_runs_rules_and_records_events() {
        let store = Arc::new(StubEventStore::default());
        let engine = HintEngine::new(store.clone());

        let ctx = RuleContext::new(stalled_task());
        let hints = engine.generate(ctx, None, "u1").await.unwrap();

        // Stalled (no context, in progress, 95% done): stalled_progress,
        // missing_context and near_completion all fire.
        let rules: Vec<&str> = hints.iter().map(|h| h.metadata.rule_name.as_str()).collect();
        assert!(rules.contains(&"stalled_progress"));
        assert!(rules.contains(&"missing_context"));
        assert!(rules.contains(&"near_completion"));

        let events = store.appended.lock().await;
        assert_eq!(events.len(), hints.len());
        assert!(events.iter().all(|e| e.event_type == "HintGenerated"));
    }

    #[tokio::test]
    async fn test_ranking_by_urgency_then_effectiveness() {
        let store = Arc::new(StubEventStore::default());
        let engine = HintEngine::new(store);

        let ctx = RuleContext::new(stalled_task());
        let hints = engine.generate(ctx, None, "u1").await.unwrap();

        for pair in hints.windows(2) {
            assert!(pair[0].metadata.urgency_score >= pair[1].metadata.urgency_score);
        }
        // stalled_progress (high impact, 0.75) outranks the medium ones
        assert_eq!(hints[0].metadata.rule_name, "stalled_progress");
    }

    #[tokio::test]
    async fn test_type_filter() {
        let store = Arc::new(StubEventStore::default());
        let engine = HintEngine::new(store);

        let ctx = RuleContext::new(stalled_task());
        let hints = engine
            .generate(ctx, Some(&[HintType::Opportunity]), "u1")
            .await
            .unwrap();
        assert!(!hints.is_empty());
        assert!(hints.iter().all(|h| h.hint_type == HintType::Opportunity));
    }

    #[tokio::test]
    async fn test_feedback_moves_ewma() {
        let store = Arc::new(StubEventStore::default());
        let engine = HintEngine::new(store);

        let ctx = RuleContext::new(stalled_task());
        let hints = engine.generate(ctx, None, "u1").await.unwrap();
        let hint = &hints[0];
        let rule = hint.metadata.rule_name.clone();

        assert_eq!(engine.effectiveness_of(&rule).await, 0.5);

        engine.accept(hint.id, "u1").await.unwrap();
        let after_accept = engine.effectiveness_of(&rule).await;
        assert!((after_accept - 0.55).abs() < 1e-9);

        // Dismissals pull it back down
        let ctx = RuleContext::new(stalled_task());
        let hints = engine.generate(ctx, None, "u1").await.unwrap();
        let hint = hints
            .iter()
            .find(|h| h.metadata.rule_name == rule)
            .unwrap();
        engine.dismiss(hint.id, Some("not useful"), "u1").await.unwrap();
        let after_dismiss = engine.effectiveness_of(&rule).await;
        assert!(after_dismiss < after_accept);
    }

    #[tokio::test]
    async fn test_generation_reads_updated_effectiveness() {
        let store = Arc::new(StubEventStore::default());
        let engine = HintEngine::new(store);

        let hints = engine
            .generate(RuleContext::new(stalled_task()), None, "u1")
            .await
            .unwrap();
        let rule = hints[0].metadata.rule_name.clone();
        engine.accept(hints[0].id, "u1").await.unwrap();

        let hints = engine
            .generate(RuleContext::new(stalled_task()), None, "u1")
            .await
            .unwrap();
        let hint = hints.iter().find(|h| h.metadata.rule_name == rule).unwrap();
        assert!((hint.metadata.effectiveness_score - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_feedback_on_unknown_hint_is_not_found() {
        let store = Arc::new(StubEventStore::default());
        let engine = HintEngine::new(store);
        let err = engine.accept(Uuid::new_v4(), "u1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_graded_feedback_clamps_score() {
        let store = Arc::new(StubEventStore::default());
        let engine = HintEngine::new(store);

        let hints = engine
            .generate(RuleContext::new(stalled_task()), None, "u1")
            .await
            .unwrap();
        let rule = hints[0].metadata.rule_name.clone();
        engine
            .feedback(hints[0].id, true, Some(7.5), "u1")
            .await
            .unwrap();
        // Clamped to 1.0 → same as a plain accept
        assert!((engine.effectiveness_of(&rule).await - 0.55).abs() < 1e-9);
    }

    struct AlwaysRule;

    impl HintRule for AlwaysRule {
        fn name(&self) -> &'static str {
            "always"
        }
        fn is_applicable(&self, _ctx: &RuleContext) -> bool {
            true
        }
        fn generate_hint(&self, ctx: &RuleContext) -> Option<WorkflowHint> {
            Some(WorkflowHint::new(
                ctx.task.id,
                HintType::Recommendation,
                ImpactLevel::Low,
                "always",
                "fires for every task",
            ))
        }
    }

    #[tokio::test]
    async fn test_registering_a_rule_is_enough() {
        let store = Arc::new(StubEventStore::default());
        let mut engine = HintEngine::new(store);
        engine.register(Arc::new(AlwaysRule));

        let mut task = stalled_task();
        task.status = TaskStatus::Todo;
        task.progress_percentage = 0.0;
        task.updated_at = Utc::now();

        let hints = engine.generate(RuleContext::new(task), None, "u1").await.unwrap();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].metadata.rule_name, "always");
    }
}
