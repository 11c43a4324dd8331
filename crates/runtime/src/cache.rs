//! Cache Layer (SPEC_FULL.md §4.3): fingerprint-keyed exact + semantic
//! lookup with a true single-flight guarantee.
//!
//! The exact/semantic lookup and persistence live in the Retrieval Store
//! (`cache_entries` table); this module adds the in-process coordination
//! that the store cannot express: deduplicating concurrent builds of the
//! same fingerprint. Unlike the reject-with-409 pattern in
//! `examples/other_examples/.../mcp-gateway/src/idempotency.rs`, SPEC_FULL.md
//! §4.3 requires the second (and Nth) caller to *wait* and receive the same
//! result as the first, so this uses a pending-builds map keyed by
//! fingerprint, each entry holding a `Notify` plus a slot for the shared
//! result.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;

use crate::store::{CacheEntry, RetrievalStore};
use crate::types::{Embedding, ResearchError};

struct PendingBuild {
    notify: Notify,
    result: parking_lot::Mutex<Option<Result<Value, ResearchError>>>,
}

pub struct CacheLayer {
    store: Arc<dyn RetrievalStore>,
    ttl: chrono::Duration,
    max_entries: usize,
    similarity_threshold: f32,
    pending: DashMap<String, Arc<PendingBuild>>,
}

impl CacheLayer {
    pub fn new(
        store: Arc<dyn RetrievalStore>,
        ttl: Duration,
        max_entries: usize,
        similarity_threshold: f32,
    ) -> Self {
        Self {
            store,
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1)),
            max_entries,
            similarity_threshold,
            pending: DashMap::new(),
        }
    }

    /// Exact-key lookup, falling back to semantic similarity within `bucket`
    /// when a query embedding is supplied (SPEC_FULL.md §4.3).
    pub async fn lookup(
        &self,
        fingerprint: &str,
        bucket: &str,
        query_embedding: Option<&Embedding>,
    ) -> Result<Option<CacheEntry>, ResearchError> {
        if let Some(entry) = self.store.cache_lookup_exact(fingerprint).await? {
            return Ok(Some(entry));
        }
        if let Some(embedding) = query_embedding {
            if let Some(entry) = self
                .store
                .cache_lookup_semantic(bucket, embedding, self.similarity_threshold)
                .await?
            {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub async fn fill(
        &self,
        fingerprint: &str,
        bucket: &str,
        result: Value,
        query_embedding: Option<Embedding>,
    ) -> Result<(), ResearchError> {
        let now = chrono::Utc::now();
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            bucket: bucket.to_string(),
            result,
            query_embedding,
            created_at: now,
            expires_at: now + self.ttl,
            hit_count: 0,
        };
        self.store.cache_fill(&entry).await?;
        Ok(())
    }

    /// Run `build` at most once per fingerprint across all concurrent
    /// callers. Every caller — the one that actually runs `build` and every
    /// other caller that arrived while it was running — receives the same
    /// `Result`.
    pub async fn single_flight<F, Fut>(
        &self,
        fingerprint: &str,
        build: F,
    ) -> Result<Value, ResearchError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Value, ResearchError>>,
    {
        // Fast path: someone is already building this fingerprint.
        if let Some(pending) = self.pending.get(fingerprint).map(|e| e.value().clone()) {
            return Self::wait_for(&pending).await;
        }

        let pending = Arc::new(PendingBuild {
            notify: Notify::new(),
            result: parking_lot::Mutex::new(None),
        });

        // Only the caller that wins the insert becomes the builder; anyone
        // racing us onto the same key falls back to the winner's entry.
        match self.pending.entry(fingerprint.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                let pending = occupied.get().clone();
                return Self::wait_for(&pending).await;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(pending.clone());
            }
        }

        let result = build().await;
        *pending.result.lock() = Some(result.clone());
        self.pending.remove(fingerprint);
        pending.notify.notify_waiters();

        result
    }

    async fn wait_for(pending: &Arc<PendingBuild>) -> Result<Value, ResearchError> {
        loop {
            let notified = pending.notify.notified();
            if let Some(result) = pending.result.lock().clone() {
                return result;
            }
            notified.await;
            if let Some(result) = pending.result.lock().clone() {
                return result;
            }
        }
    }

    /// Sweep expired entries and overflow beyond `max_entries`. Intended to
    /// be called from a background task at most once per throttle window
    /// (default every 5 minutes, SPEC_FULL.md §4.3).
    pub async fn prune(&self) -> Result<usize, ResearchError> {
        self.store
            .cache_prune(self.max_entries)
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteRetrievalStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn layer() -> CacheLayer {
        let store = Arc::new(SqliteRetrievalStore::open_in_memory().unwrap());
        CacheLayer::new(store, StdDuration::from_secs(3600), 1000, 0.85)
    }

    #[tokio::test]
    async fn fill_then_lookup_exact_hit() {
        let cache = layer();
        cache
            .fill("fp1", "research", serde_json::json!({"ok": true}), None)
            .await
            .unwrap();
        let hit = cache.lookup("fp1", "research", None).await.unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn lookup_miss_returns_none() {
        let cache = layer();
        let hit = cache.lookup("missing", "research", None).await.unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn single_flight_runs_build_once_for_concurrent_callers() {
        let cache = Arc::new(layer());
        let build_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            let build_count = build_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .single_flight("shared-fp", || async move {
                        build_count.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(StdDuration::from_millis(20)).await;
                        Ok(serde_json::json!({"value": 42}))
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(build_count.load(Ordering::SeqCst), 1);
        for r in results {
            assert_eq!(r, serde_json::json!({"value": 42}));
        }
    }

    #[tokio::test]
    async fn single_flight_propagates_error_to_all_waiters() {
        let cache = Arc::new(layer());
        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .single_flight("fails", || async move {
                        Err(ResearchError::Fatal("boom".to_string()))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_err());
        }
    }
}
