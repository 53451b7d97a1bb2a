//! Caching for resolved contexts.
//!
//! Entries are keyed `(level, context_id)` per user, carry a dependencies
//! hash over the contributing chain, and expire after a TTL (default one
//! hour). Invalidation cascades downward: a change at a level marks every
//! dependent resolution beneath it. Concurrent misses for one key share a
//! single upstream resolution through per-key flight guards.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::context::{ContextCacheEntry, ContextLevel, ResolvedContext};
use crate::error::Result;
use crate::repository::ContextCacheRepository;

/// Default TTL for cached resolutions, in hours.
pub const DEFAULT_TTL_HOURS: i64 = 1;

/// Entry count above which the low-value eviction pass runs.
pub const DEFAULT_PRESSURE_THRESHOLD: u64 = 500;

/// Entries evicted per pressure pass, at most.
const EVICTIONS_PER_PASS: usize = 50;

/// Entries below this hit count are eviction candidates.
const LOW_VALUE_HITS: i64 = 2;

/// Aggregate statistics over a user's cache entries.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_hits: i64,
    pub total_size_bytes: i64,
    pub invalidated: u64,
}

/// Service wrapping cache storage with TTL checks, hit accounting,
/// cascade invalidation and pressure eviction.
pub struct ContextCacheService {
    repo: Arc<dyn ContextCacheRepository>,
    ttl: Duration,
    pressure_threshold: u64,
    user_id: String,
    /// Per-key guards so simultaneous misses resolve once (single-flight).
    flights: tokio::sync::Mutex<HashMap<(ContextLevel, Uuid), Arc<tokio::sync::Mutex<()>>>>,
}

impl ContextCacheService {
    pub fn new(
        repo: Arc<dyn ContextCacheRepository>,
        ttl_hours: i64,
        pressure_threshold: u64,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            ttl: Duration::hours(ttl_hours.max(1)),
            pressure_threshold,
            user_id: user_id.into(),
            flights: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Cached document for `(level, id)` if present, live and unexpired.
    /// Expired or invalidated rows are removed on this miss path.
    pub async fn get(&self, level: ContextLevel, context_id: Uuid) -> Result<Option<Value>> {
        let entry = match self.repo.get(level, context_id, &self.user_id).await? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        if entry.invalidated {
            debug!(level = %level, context_id = %context_id, "Cache entry invalidated, removing");
            self.repo.remove(level, context_id, &self.user_id).await?;
            return Ok(None);
        }

        if Utc::now() > entry.expires_at {
            debug!(level = %level, context_id = %context_id, "Cache entry expired, removing");
            self.repo.remove(level, context_id, &self.user_id).await?;
            return Ok(None);
        }

        self.repo.record_hit(level, context_id, &self.user_id).await?;
        Ok(Some(entry.resolved_context))
    }

    /// Store a fresh resolution. Failures are logged and swallowed: a cold
    /// cache is never worth failing the resolve for.
    pub async fn store(&self, resolved: &ResolvedContext, document: &Value) {
        let serialised = document.to_string();
        let now = Utc::now();
        let entry = ContextCacheEntry {
            context_id: resolved.context_id,
            context_level: resolved.level,
            resolved_context: document.clone(),
            dependencies_hash: resolved.dependencies_hash.clone(),
            resolution_path: resolved.chain.iter().map(|l| l.as_str().to_string()).collect(),
            parent_chain: resolved.parent_chain.clone(),
            created_at: now,
            expires_at: now + self.ttl,
            hit_count: 0,
            last_hit: now,
            cache_size_bytes: serialised.len() as i64,
            invalidated: false,
            invalidation_reason: None,
            user_id: self.user_id.clone(),
        };

        if let Err(err) = self.repo.upsert(entry).await {
            warn!(
                level = %resolved.level,
                context_id = %resolved.context_id,
                error = %err,
                "Failed to cache resolved context"
            );
            return;
        }

        if let Err(err) = self.maybe_evict().await {
            warn!(error = %err, "Cache eviction pass failed");
        }
    }

    /// Invalidate everything affected by an update at `(level, id)`:
    ///
    /// - global → every entry for the user;
    /// - project/branch → the entry itself plus all descendant resolutions
    ///   (entries whose parent chain contains the changed id);
    /// - task → that task's entry only.
    pub async fn invalidate_scope(
        &self,
        level: ContextLevel,
        context_id: Uuid,
        reason: &str,
    ) -> Result<u64> {
        let invalidated = match level {
            ContextLevel::Global => self.repo.invalidate_all(&self.user_id, reason).await?,
            ContextLevel::Project | ContextLevel::Branch => {
                let own = self
                    .repo
                    .invalidate(level, context_id, &self.user_id, reason)
                    .await?;
                let below = self
                    .repo
                    .invalidate_descendants(context_id, &self.user_id, reason)
                    .await?;
                own + below
            }
            ContextLevel::Task => {
                self.repo
                    .invalidate(level, context_id, &self.user_id, reason)
                    .await?
            }
        };
        debug!(level = %level, context_id = %context_id, invalidated, reason, "Cache invalidation");
        Ok(invalidated)
    }

    /// Acquire the flight guard for a key. Hold the returned mutex while
    /// resolving so concurrent misses wait instead of duplicating work.
    pub async fn flight_guard(&self, level: ContextLevel, context_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut flights = self.flights.lock().await;
        flights
            .entry((level, context_id))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Low-value eviction: when the user's entry count exceeds the
    /// pressure threshold, remove up to fifty entries with fewer than two
    /// hits, coldest first.
    pub async fn maybe_evict(&self) -> Result<u64> {
        let total = self.repo.count(&self.user_id).await?;
        if total <= self.pressure_threshold {
            return Ok(0);
        }

        let mut entries = self.repo.list(&self.user_id).await?;
        entries.retain(|e| e.hit_count < LOW_VALUE_HITS);
        entries.sort_by(|a, b| {
            a.hit_count
                .cmp(&b.hit_count)
                .then(a.last_hit.cmp(&b.last_hit))
        });

        let mut evicted = 0u64;
        for entry in entries.into_iter().take(EVICTIONS_PER_PASS) {
            self.repo
                .remove(entry.context_level, entry.context_id, &self.user_id)
                .await?;
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, total, "Evicted low-value cache entries");
        }
        Ok(evicted)
    }

    /// Drop expired and invalidated rows (background sweep).
    pub async fn sweep(&self) -> Result<u64> {
        self.repo.sweep(Utc::now()).await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let entries = self.repo.list(&self.user_id).await?;
        Ok(CacheStats {
            entries: entries.len() as u64,
            total_hits: entries.iter().map(|e| e.hit_count).sum(),
            total_size_bytes: entries.iter().map(|e| e.cache_size_bytes).sum(),
            invalidated: entries.iter().filter(|e| e.invalidated).count() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use serde_json::json;

    /// In-memory cache storage covering exactly what the service needs.
    #[derive(Default)]
    struct StubCacheRepo {
        entries: tokio::sync::Mutex<Vec<ContextCacheEntry>>,
    }

    #[async_trait]
    impl ContextCacheRepository for StubCacheRepo {
        async fn get(
            &self,
            level: ContextLevel,
            context_id: Uuid,
            user_id: &str,
        ) -> Result<Option<ContextCacheEntry>> {
            Ok(self
                .entries
                .lock()
                .await
                .iter()
                .find(|e| {
                    e.context_level == level && e.context_id == context_id && e.user_id == user_id
                })
                .cloned())
        }

        async fn upsert(&self, entry: ContextCacheEntry) -> Result<()> {
            let mut entries = self.entries.lock().await;
            entries.retain(|e| {
                !(e.context_level == entry.context_level
                    && e.context_id == entry.context_id
                    && e.user_id == entry.user_id)
            });
            entries.push(entry);
            Ok(())
        }

        async fn record_hit(
            &self,
            level: ContextLevel,
            context_id: Uuid,
            user_id: &str,
        ) -> Result<()> {
            let mut entries = self.entries.lock().await;
            if let Some(e) = entries.iter_mut().find(|e| {
                e.context_level == level && e.context_id == context_id && e.user_id == user_id
            }) {
                e.hit_count += 1;
                e.last_hit = Utc::now();
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
            let mut entries = self.entries.lock().await;
            let mut n = 0;
            for e in entries.iter_mut().filter(|e| {
                e.context_level == level && e.context_id == context_id && e.user_id == user_id
            }) {
                e.invalidated = true;
                e.invalidation_reason = Some(reason.to_string());
                n += 1;
            }
            Ok(n)
        }

        async fn invalidate_descendants(
            &self,
            ancestor_id: Uuid,
            user_id: &str,
            reason: &str,
        ) -> Result<u64> {
            let mut entries = self.entries.lock().await;
            let mut n = 0;
            for e in entries
                .iter_mut()
                .filter(|e| e.user_id == user_id && e.parent_chain.contains(&ancestor_id))
            {
                e.invalidated = true;
                e.invalidation_reason = Some(reason.to_string());
                n += 1;
            }
            Ok(n)
        }

        async fn invalidate_all(&self, user_id: &str, reason: &str) -> Result<u64> {
            let mut entries = self.entries.lock().await;
            let mut n = 0;
            for e in entries.iter_mut().filter(|e| e.user_id == user_id) {
                e.invalidated = true;
                e.invalidation_reason = Some(reason.to_string());
                n += 1;
            }
            Ok(n)
        }

        async fn remove(&self, level: ContextLevel, context_id: Uuid, user_id: &str) -> Result<()> {
            self.entries.lock().await.retain(|e| {
                !(e.context_level == level && e.context_id == context_id && e.user_id == user_id)
            });
            Ok(())
        }

        async fn sweep(&self, now: DateTime<Utc>) -> Result<u64> {
            let mut entries = self.entries.lock().await;
            let before = entries.len();
            entries.retain(|e| !e.invalidated && e.expires_at > now);
            Ok((before - entries.len()) as u64)
        }

        async fn count(&self, user_id: &str) -> Result<u64> {
            Ok(self
                .entries
                .lock()
                .await
                .iter()
                .filter(|e| e.user_id == user_id)
                .count() as u64)
        }

        async fn list(&self, user_id: &str) -> Result<Vec<ContextCacheEntry>> {
            Ok(self
                .entries
                .lock()
                .await
                .iter()
                .filter(|e| e.user_id == user_id)
                .cloned()
                .collect())
        }
    }

    fn resolved(level: ContextLevel, id: Uuid, parents: Vec<Uuid>) -> ResolvedContext {
        ResolvedContext {
            level,
            context_id: id,
            document: json!({"k": "v"}),
            chain: vec![ContextLevel::Global, level],
            inheritance_depth: 2,
            dependencies_hash: "hash".to_string(),
            parent_chain: parents,
        }
    }

    fn service(repo: Arc<StubCacheRepo>) -> ContextCacheService {
        ContextCacheService::new(repo, 1, 500, "u1")
    }

    #[tokio::test]
    async fn test_store_then_hit_counts() {
        let repo = Arc::new(StubCacheRepo::default());
        let cache = service(repo.clone());

        let id = Uuid::new_v4();
        let res = resolved(ContextLevel::Task, id, vec![]);
        cache.store(&res, &json!({"doc": 1})).await;

        assert_eq!(cache.get(ContextLevel::Task, id).await.unwrap(), Some(json!({"doc": 1})));
        assert_eq!(cache.get(ContextLevel::Task, id).await.unwrap(), Some(json!({"doc": 1})));

        let entry = repo.get(ContextLevel::Task, id, "u1").await.unwrap().unwrap();
        assert_eq!(entry.hit_count, 2);
    }

    #[tokio::test]
    async fn test_invalidated_entry_never_served() {
        let repo = Arc::new(StubCacheRepo::default());
        let cache = service(repo.clone());

        let id = Uuid::new_v4();
        cache
            .store(&resolved(ContextLevel::Task, id, vec![]), &json!({"doc": 1}))
            .await;
        cache
            .invalidate_scope(ContextLevel::Task, id, "test")
            .await
            .unwrap();

        assert_eq!(cache.get(ContextLevel::Task, id).await.unwrap(), None);
        // The miss path removed the dead row
        assert_eq!(repo.count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_project_invalidation_cascades_to_descendants() {
        let repo = Arc::new(StubCacheRepo::default());
        let cache = service(repo.clone());

        let project_id = Uuid::new_v4();
        let branch_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let other_task = Uuid::new_v4();

        cache
            .store(&resolved(ContextLevel::Project, project_id, vec![]), &json!({}))
            .await;
        cache
            .store(
                &resolved(ContextLevel::Branch, branch_id, vec![project_id]),
                &json!({}),
            )
            .await;
        cache
            .store(
                &resolved(ContextLevel::Task, task_id, vec![project_id, branch_id]),
                &json!({}),
            )
            .await;
        // A task under some other project is untouched
        cache
            .store(
                &resolved(ContextLevel::Task, other_task, vec![Uuid::new_v4()]),
                &json!({}),
            )
            .await;

        let n = cache
            .invalidate_scope(ContextLevel::Project, project_id, "project_updated")
            .await
            .unwrap();
        assert_eq!(n, 3);

        assert!(cache.get(ContextLevel::Project, project_id).await.unwrap().is_none());
        assert!(cache.get(ContextLevel::Branch, branch_id).await.unwrap().is_none());
        assert!(cache.get(ContextLevel::Task, task_id).await.unwrap().is_none());
        assert!(cache.get(ContextLevel::Task, other_task).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_global_invalidation_marks_everything() {
        let repo = Arc::new(StubCacheRepo::default());
        let cache = service(repo.clone());

        for _ in 0..3 {
            cache
                .store(&resolved(ContextLevel::Task, Uuid::new_v4(), vec![]), &json!({}))
                .await;
        }
        let n = cache
            .invalidate_scope(ContextLevel::Global, crate::context::GLOBAL_CONTEXT_ID, "global_updated")
            .await
            .unwrap();
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn test_pressure_eviction() {
        let repo = Arc::new(StubCacheRepo::default());
        // Threshold 10 so the pass triggers quickly
        let cache = ContextCacheService::new(repo.clone(), 1, 10, "u1");

        let mut hot = Vec::new();
        for i in 0..15 {
            let id = Uuid::new_v4();
            cache
                .store(&resolved(ContextLevel::Task, id, vec![]), &json!({"i": i}))
                .await;
            if i < 5 {
                // Heat up the first five past the low-value threshold
                cache.get(ContextLevel::Task, id).await.unwrap();
                cache.get(ContextLevel::Task, id).await.unwrap();
                hot.push(id);
            }
        }

        let evicted = cache.maybe_evict().await.unwrap();
        assert!(evicted > 0);

        // Hot entries survive the pass
        for id in hot {
            assert!(cache.get(ContextLevel::Task, id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_single_flight_guard_is_shared() {
        let repo = Arc::new(StubCacheRepo::default());
        let cache = service(repo);

        let id = Uuid::new_v4();
        let a = cache.flight_guard(ContextLevel::Task, id).await;
        let b = cache.flight_guard(ContextLevel::Task, id).await;
        assert!(Arc::ptr_eq(&a, &b));

        let other = cache.flight_guard(ContextLevel::Branch, id).await;
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
