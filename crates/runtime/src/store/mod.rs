//! Retrieval Store: persistent storage for jobs, events, idempotency
//! records, reports, indexed documents and cache entries (SPEC_FULL.md §4.1).

mod fingerprint;
mod schema;
mod sqlite_store;

pub use fingerprint::{fingerprint, sanitize_client_key};
pub use sqlite_store::SqliteRetrievalStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Embedding, EventId, JobId, JobKind, JobStatus, ReportId, StoreError};

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub params: Value,
    pub status: JobStatus,
    pub idempotency_key: Option<String>,
    pub retry_of: Option<JobId>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub progress: u8,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A single append-only job event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub event_id: EventId,
    pub event_type: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

/// Result of attempting to insert a new job under an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    Created(JobId),
    Duplicate(JobId),
}

/// A persisted research report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: ReportId,
    pub original_query: String,
    pub final_report: String,
    pub query_embedding: Embedding,
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    /// User-supplied 1-5 rating. The only field mutable after creation.
    pub rating: Option<u8>,
}

/// A document available to the hybrid retrieval index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub source_type: String,
    pub source_id: String,
    pub title: String,
    pub content: String,
    pub doc_embedding: Option<Embedding>,
    pub doc_len: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which corpora `hybrid_search` should scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Both,
    ReportsOnly,
    DocsOnly,
}

/// Relative weight of the BM25 and vector-similarity score columns.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalWeights {
    pub bm25: f32,
    pub vector: f32,
}

/// A persisted cache entry (Cache Layer, SPEC_FULL.md §4.3). Owned by the
/// Retrieval Store like every other persisted entity; the Cache Layer's
/// in-process single-flight coordination is layered on top in `cache.rs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub bucket: String,
    pub result: Value,
    pub query_embedding: Option<Embedding>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: u64,
}

/// A single hybrid search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hit {
    pub source_type: String,
    pub source_id: String,
    pub title: String,
    pub score: f32,
    pub bm25_score: f32,
    pub vector_score: f32,
}

/// Outcome of a hybrid search, including whether it degraded to a single
/// scoring component because one index was unavailable.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub hits: Vec<Hit>,
    pub degraded: bool,
}

/// Persistent storage contract (SPEC_FULL.md §4.1). Implemented by
/// [`SqliteRetrievalStore`]; kept as a trait so an alternative backend
/// (e.g. a future Postgres-backed store) can be substituted without
/// touching callers.
#[async_trait]
pub trait RetrievalStore: Send + Sync {
    async fn insert_job(
        &self,
        kind: JobKind,
        params: Value,
        idempotency_key: &str,
        key_ttl: chrono::Duration,
        retry_of: Option<JobId>,
    ) -> Result<EnqueueResult, StoreError>;

    async fn claim_next_leased_job(
        &self,
        worker_id: &str,
        lease_ms: u64,
    ) -> Result<Option<Job>, StoreError>;

    async fn heartbeat(&self, job_id: JobId, worker_id: &str, lease_ms: u64) -> Result<bool, StoreError>;

    async fn mark_running(&self, job_id: JobId, worker_id: &str) -> Result<(), StoreError>;

    async fn update_progress(&self, job_id: JobId, progress: u8) -> Result<(), StoreError>;

    async fn append_event(
        &self,
        job_id: JobId,
        event_type: &str,
        payload: Value,
    ) -> Result<EventId, StoreError>;

    async fn read_events(
        &self,
        job_id: JobId,
        since_event_id: i64,
        limit: usize,
    ) -> Result<Vec<JobEvent>, StoreError>;

    async fn max_event_id(&self, job_id: JobId) -> Result<i64, StoreError>;

    /// Moves a leased job to a terminal status and appends its terminal
    /// event. Returns `Some(event_id)` when this call performed the write;
    /// returns `None` when the job was already terminal (e.g. a concurrent
    /// `request_cancel` won the race) so the caller knows not to publish a
    /// duplicate event under its own idea of what happened.
    async fn finish_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        status: JobStatus,
        result: Value,
    ) -> Result<Option<EventId>, StoreError>;

    /// Flips a non-terminal job to `canceled` and appends the terminal
    /// `job.canceled` event in the same store operation. Returns the status
    /// the job had *before* this call, plus the new event id when a
    /// transition (and thus an event) actually happened — `None` if the job
    /// was already terminal and nothing was written.
    async fn request_cancel(&self, job_id: JobId) -> Result<(JobStatus, Option<EventId>), StoreError>;

    async fn requeue(&self, job_id: JobId) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    async fn insert_report(&self, report: &Report) -> Result<ReportId, StoreError>;

    async fn get_report(&self, report_id: ReportId) -> Result<Option<Report>, StoreError>;

    /// Set or clear a report's user rating. The only mutation reports permit
    /// after creation (SPEC_FULL.md §3 Report lifecycle).
    async fn rate_report(&self, report_id: ReportId, rating: Option<u8>) -> Result<(), StoreError>;

    async fn insert_document(&self, doc: &IndexedDocument) -> Result<(), StoreError>;

    async fn hybrid_search(
        &self,
        query_text: &str,
        query_embedding: Option<&Embedding>,
        k: usize,
        scope: SearchScope,
        weights: RetrievalWeights,
        bm25_k1: f32,
        bm25_b: f32,
    ) -> Result<SearchResult, StoreError>;

    async fn reap_expired(&self, older_than: chrono::Duration) -> Result<usize, StoreError>;

    /// Exact-key cache lookup; bumps `hit_count` on hit. Returns `None` if
    /// absent or expired.
    async fn cache_lookup_exact(&self, fingerprint: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Scan unexpired entries in `bucket` and return the one with the
    /// highest cosine similarity to `query_embedding`, if any meets
    /// `threshold`.
    async fn cache_lookup_semantic(
        &self,
        bucket: &str,
        query_embedding: &Embedding,
        threshold: f32,
    ) -> Result<Option<CacheEntry>, StoreError>;

    async fn cache_fill(&self, entry: &CacheEntry) -> Result<(), StoreError>;

    /// Remove expired entries and, if the bucket exceeds `max_entries`,
    /// the least-recently-used overflow (by `hit_count` then age).
    async fn cache_prune(&self, max_entries: usize) -> Result<usize, StoreError>;
}
