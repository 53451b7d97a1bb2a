//! Context hierarchy engine: resolve, create, update, delete, delegate.
//!
//! Resolution walks the parent chain up to the per-user global root and
//! merges contributions child-over-parent. The resolved document is cached
//! with a dependencies hash over every contributing row's version; any
//! write invalidates the affected scope before returning.

use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::{
    merge_chain, BranchContext, ContextDelegation, ContextLevel, ContextRecord, GlobalContext,
    ProjectContext, ResolvedContext, TaskContext, TriggerType, GLOBAL_CONTEXT_ID,
};
use crate::context_cache::ContextCacheService;
use crate::error::{Result, TaskError};
use crate::events::{self, EventStore};
use crate::models::TaskStatus;
use crate::repository::{ContextRepository, DelegationRepository};

/// Confidence at or above which an auto-triggered delegation applies
/// immediately instead of queueing for approval.
pub const AUTO_DELEGATION_CONFIDENCE: f64 = 0.8;

/// The hierarchy engine for one authenticated user. Repositories are the
/// scoped decorators; constructing one per request is cheap.
pub struct ContextHierarchyService {
    contexts: Arc<dyn ContextRepository>,
    delegations: Arc<dyn DelegationRepository>,
    cache: Arc<ContextCacheService>,
    events: Arc<dyn EventStore>,
    user_id: String,
}

impl ContextHierarchyService {
    pub fn new(
        contexts: Arc<dyn ContextRepository>,
        delegations: Arc<dyn DelegationRepository>,
        cache: Arc<ContextCacheService>,
        events: Arc<dyn EventStore>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            contexts,
            delegations,
            cache,
            events,
            user_id: user_id.into(),
        }
    }

    // -- Resolution ------------------------------------------------------

    /// Resolve the context at `(level, id)` into its merged document,
    /// serving from cache when possible. Concurrent misses for one key
    /// perform a single resolution.
    pub async fn resolve(&self, level: ContextLevel, context_id: Uuid) -> Result<Value> {
        if let Some(document) = self.cache.get(level, context_id).await? {
            return Ok(document);
        }

        let guard = self.cache.flight_guard(level, context_id).await;
        let _held = guard.lock().await;

        // Another flight may have resolved while we waited for the guard.
        if let Some(document) = self.cache.get(level, context_id).await? {
            return Ok(document);
        }

        let resolved = self.resolve_fresh(level, context_id).await?;
        let document = resolved.clone().into_document();
        self.cache.store(&resolved, &document).await;
        Ok(document)
    }

    /// Resolve without touching the cache.
    pub async fn resolve_fresh(&self, level: ContextLevel, context_id: Uuid) -> Result<ResolvedContext> {
        let records = self.load_chain(level, context_id).await?;

        // inheritance_disabled truncates the walk: the deepest disabled
        // level and everything below it still contribute, levels above are
        // excluded. force_local_only on a task keeps only the task itself.
        let start = if records
            .last()
            .map(|r| r.force_local_only())
            .unwrap_or(false)
        {
            records.len() - 1
        } else {
            records
                .iter()
                .rposition(|r| r.inheritance_disabled())
                .unwrap_or(0)
        };
        let effective = &records[start..];

        let chain: Vec<ContextLevel> = effective.iter().map(|r| r.level()).collect();
        let contributions: Vec<Map<String, Value>> =
            effective.iter().map(|r| r.contribution()).collect();
        let document = Value::Object(merge_chain(contributions));

        let parent_chain: Vec<Uuid> = records
            .iter()
            .map(|r| r.context_id())
            .filter(|id| *id != context_id)
            .collect();

        Ok(ResolvedContext {
            level,
            context_id,
            document,
            inheritance_depth: chain.len(),
            dependencies_hash: dependencies_hash(effective),
            chain,
            parent_chain,
        })
    }

    /// Load the full record chain global → … → `(level, id)`. The global
    /// root auto-materialises; every other record must already exist, as
    /// must each intermediate parent.
    async fn load_chain(&self, level: ContextLevel, context_id: Uuid) -> Result<Vec<ContextRecord>> {
        let target = match level {
            ContextLevel::Global => ContextRecord::Global(self.global(true).await?),
            _ => self
                .contexts
                .get(level, context_id, &self.user_id)
                .await?
                .ok_or_else(|| {
                    TaskError::NotFound(format!("{} context {} not found", level, context_id))
                })?,
        };

        let mut records = vec![target];
        loop {
            let parent = match records.last().and_then(|r| r.parent()) {
                Some(parent) => parent,
                None => break,
            };
            let record = match parent {
                (ContextLevel::Global, _) => ContextRecord::Global(self.global(true).await?),
                (parent_level, parent_id) => self
                    .contexts
                    .get(parent_level, parent_id, &self.user_id)
                    .await?
                    .ok_or_else(|| {
                        TaskError::NotFound(format!(
                            "{} context {} missing from the hierarchy",
                            parent_level, parent_id
                        ))
                    })?,
            };
            records.push(record);
        }
        records.reverse();
        Ok(records)
    }

    /// The user's global context, creating it on first access when
    /// `materialise` is set.
    async fn global(&self, materialise: bool) -> Result<GlobalContext> {
        if let Some(ContextRecord::Global(ctx)) = self
            .contexts
            .get(ContextLevel::Global, GLOBAL_CONTEXT_ID, &self.user_id)
            .await?
        {
            return Ok(ctx);
        }
        if !materialise {
            return Err(TaskError::not_found("Global context", GLOBAL_CONTEXT_ID));
        }
        debug!(user_id = %self.user_id, "Materialising global context on first access");
        let created = self
            .contexts
            .upsert(ContextRecord::Global(GlobalContext::materialise(&self.user_id)))
            .await?;
        match created {
            ContextRecord::Global(ctx) => Ok(ctx),
            _ => Err(TaskError::Internal("Global upsert returned wrong level".into())),
        }
    }

    // -- CRUD ------------------------------------------------------------

    /// Create a context at a level. The parent at the next-higher level
    /// must exist first (global excepted, which auto-materialises).
    pub async fn create(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        data: Value,
        parent_id: Option<Uuid>,
    ) -> Result<ContextRecord> {
        if level != ContextLevel::Global
            && self
                .contexts
                .get(level, context_id, &self.user_id)
                .await?
                .is_some()
        {
            return Err(TaskError::Validation(format!(
                "{level} context {context_id} already exists"
            )));
        }

        let mut record = match level {
            ContextLevel::Global => ContextRecord::Global(self.global(true).await?),
            ContextLevel::Project => {
                self.global(true).await?;
                ContextRecord::Project(ProjectContext::new(context_id, Value::Null, &self.user_id))
            }
            ContextLevel::Branch => {
                let project_id = parent_id.ok_or_else(|| {
                    TaskError::missing_field(
                        "parent_id",
                        "uuid",
                        "branch contexts require the owning project id",
                    )
                })?;
                self.require_exists(ContextLevel::Project, project_id).await?;
                ContextRecord::Branch(BranchContext::new(
                    context_id,
                    project_id,
                    Value::Null,
                    &self.user_id,
                ))
            }
            ContextLevel::Task => {
                let branch_id = parent_id.ok_or_else(|| {
                    TaskError::missing_field(
                        "parent_id",
                        "uuid",
                        "task contexts require the owning branch id",
                    )
                })?;
                let parent = self.require_exists(ContextLevel::Branch, branch_id).await?;
                let mut ctx = TaskContext::new(context_id, branch_id, Value::Null, &self.user_id);
                ctx.parent_branch_context_id = Some(parent.row_id());
                ContextRecord::Task(ctx)
            }
        };

        // Route the initial data through the patch logic so named sections
        // (task_data, technology_stack, …) land in their typed slots.
        if let Value::Object(patch) = data {
            if !patch.is_empty() {
                record.apply_patch(&patch);
            }
        }

        let stored = self.contexts.upsert(record).await?;
        self.invalidate(level, context_id, "context_created").await;
        Ok(stored)
    }

    async fn require_exists(&self, level: ContextLevel, context_id: Uuid) -> Result<ContextRecord> {
        self.contexts
            .get(level, context_id, &self.user_id)
            .await?
            .ok_or_else(|| {
                TaskError::Validation(format!(
                    "Parent {level} context {context_id} must exist before creating a child"
                ))
            })
    }

    /// Fetch the raw record (no inheritance) at a level.
    pub async fn get(&self, level: ContextLevel, context_id: Uuid) -> Result<Option<ContextRecord>> {
        if level == ContextLevel::Global {
            return Ok(Some(ContextRecord::Global(self.global(true).await?)));
        }
        self.contexts.get(level, context_id, &self.user_id).await
    }

    /// Apply a patch to a context, bump its version, and invalidate every
    /// cached resolution the change can affect.
    pub async fn update(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        patch: &Map<String, Value>,
    ) -> Result<ContextRecord> {
        let mut record = match level {
            ContextLevel::Global => ContextRecord::Global(self.global(true).await?),
            _ => self
                .contexts
                .get(level, context_id, &self.user_id)
                .await?
                .ok_or_else(|| {
                    TaskError::NotFound(format!("{level} context {context_id} not found"))
                })?,
        };

        record.apply_patch(patch);
        let stored = self.contexts.upsert(record).await?;
        self.invalidate(level, context_id, "context_updated").await;
        Ok(stored)
    }

    /// Delete a context and its descendants. Global cannot be deleted.
    pub async fn delete(&self, level: ContextLevel, context_id: Uuid) -> Result<()> {
        if level == ContextLevel::Global {
            return Err(TaskError::Validation(
                "Global context cannot be deleted".to_string(),
            ));
        }
        if self
            .contexts
            .get(level, context_id, &self.user_id)
            .await?
            .is_none()
        {
            return Err(TaskError::NotFound(format!(
                "{level} context {context_id} not found"
            )));
        }

        self.delete_subtree(level, context_id).await?;
        self.invalidate(level, context_id, "context_deleted").await;
        Ok(())
    }

    fn delete_subtree<'a>(
        &'a self,
        level: ContextLevel,
        context_id: Uuid,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let children = self.contexts.children(level, context_id, &self.user_id).await?;
            for child in children {
                self.delete_subtree(child.level(), child.context_id()).await?;
            }
            self.contexts.delete(level, context_id, &self.user_id).await
        })
    }

    // -- Delegation ------------------------------------------------------

    /// Record (and possibly apply) a promotion of data from a lower level
    /// to a higher one. Manual delegations queue for approval; auto
    /// delegations with confidence ≥ 0.8 apply immediately.
    #[allow(clippy::too_many_arguments)]
    pub async fn delegate(
        &self,
        source_level: ContextLevel,
        source_id: Uuid,
        target_level: ContextLevel,
        target_id: Uuid,
        delegated_data: Value,
        reason: &str,
        trigger: TriggerType,
        confidence_score: Option<f64>,
    ) -> Result<ContextDelegation> {
        if source_level.specificity() >= target_level.specificity() {
            return Err(TaskError::Validation(format!(
                "Delegation must flow upward: {source_level} does not delegate to {target_level}"
            )));
        }
        if !delegated_data.is_object() {
            return Err(TaskError::Validation(
                "delegated_data must be an object".to_string(),
            ));
        }

        let auto_apply = trigger.is_auto()
            && confidence_score
                .map(|c| c >= AUTO_DELEGATION_CONFIDENCE)
                .unwrap_or(false);

        let mut delegation = ContextDelegation {
            id: Uuid::new_v4(),
            source_level,
            source_id,
            target_level,
            target_id,
            delegated_data: delegated_data.clone(),
            delegation_reason: reason.to_string(),
            trigger_type: trigger,
            auto_delegated: trigger.is_auto(),
            confidence_score,
            processed: false,
            approved: None,
            user_id: self.user_id.clone(),
            created_at: chrono::Utc::now(),
            processed_at: None,
        };

        if auto_apply {
            // Target update and the delegation record commit together; the
            // cache invalidation afterwards is best-effort.
            let patch = delegated_data
                .as_object()
                .cloned()
                .unwrap_or_default();
            self.update(target_level, target_id, &patch).await?;
            delegation.processed = true;
            delegation.approved = Some(true);
            delegation.processed_at = Some(chrono::Utc::now());
        } else if target_level != ContextLevel::Global {
            // Queued delegations still require a real target.
            self.require_exists(target_level, target_id).await?;
        }

        let stored = self.delegations.create(delegation).await?;
        if let Err(err) = self
            .events
            .append(events::context_delegated(
                stored.id,
                target_id,
                auto_apply,
                &self.user_id,
            ))
            .await
        {
            warn!(error = %err, "Failed to append delegation event");
        }
        Ok(stored)
    }

    /// Mirror a task's status into its context document, if one exists.
    /// Used by the completion flow to keep task and context aligned.
    pub async fn mirror_task_status(&self, task_id: Uuid, status: TaskStatus) -> Result<bool> {
        let record = self
            .contexts
            .get(ContextLevel::Task, task_id, &self.user_id)
            .await?;
        let Some(ContextRecord::Task(mut ctx)) = record else {
            return Ok(false);
        };
        ctx.set_reported_status(status);
        ctx.version += 1;
        self.contexts.upsert(ContextRecord::Task(ctx)).await?;
        self.invalidate(ContextLevel::Task, task_id, "task_status_mirrored")
            .await;
        Ok(true)
    }

    /// Invalidate cached resolutions affected by a change; failures are
    /// logged, never surfaced (stale entries age out via TTL).
    async fn invalidate(&self, level: ContextLevel, context_id: Uuid, reason: &str) {
        if let Err(err) = self.cache.invalidate_scope(level, context_id, reason).await {
            warn!(
                level = %level,
                context_id = %context_id,
                error = %err,
                "Cache invalidation failed; stale entries will expire by TTL"
            );
        }
    }
}

/// Digest over every contributing row's identity, version and flags. Any
/// change to the chain changes the hash, which is what cache coherence
/// hangs off.
pub fn dependencies_hash(records: &[ContextRecord]) -> String {
    let mut hasher = Sha256::new();
    for record in records {
        hasher.update(record.level().as_str().as_bytes());
        hasher.update(b":");
        hasher.update(record.context_id().as_bytes());
        hasher.update(b":");
        hasher.update(record.version().to_le_bytes());
        hasher.update(&[
            u8::from(record.inheritance_disabled()),
            u8::from(record.force_local_only()),
        ]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dependencies_hash_changes_with_version() {
        let project_id = Uuid::new_v4();
        let mut ctx = ProjectContext::new(project_id, json!({}), "u1");
        let h1 = dependencies_hash(&[ContextRecord::Project(ctx.clone())]);

        ctx.version += 1;
        let h2 = dependencies_hash(&[ContextRecord::Project(ctx.clone())]);
        assert_ne!(h1, h2);

        ctx.inheritance_disabled = true;
        let h3 = dependencies_hash(&[ContextRecord::Project(ctx)]);
        assert_ne!(h2, h3);
    }

    #[test]
    fn test_dependencies_hash_is_chain_sensitive() {
        let global = ContextRecord::Global(GlobalContext::materialise("u1"));
        let project =
            ContextRecord::Project(ProjectContext::new(Uuid::new_v4(), json!({}), "u1"));

        let alone = dependencies_hash(std::slice::from_ref(&project));
        let chained = dependencies_hash(&[global, project]);
        assert_ne!(alone, chained);
    }
}
