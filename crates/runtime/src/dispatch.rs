//! Job API & Dispatch (SPEC_FULL.md §4.8, §6): per-kind parameter schemas,
//! fingerprint-based idempotency, and tagged-sum dispatch from a `JobKind`
//! to its handler — a `match`, never a reflective registry lookup
//! (SPEC_FULL.md §9).

use std::sync::Arc;

use regex::Regex;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::bus::EventBus;
use crate::config::ResearchConfig;
use crate::embedding::EmbeddingProvider;
use crate::store::{
    fingerprint, sanitize_client_key, EnqueueResult, IndexedDocument, JobEvent, RetrievalStore,
    RetrievalWeights, SearchResult, SearchScope,
};
use crate::types::{DispatchError, JobId, JobKind, JobStatus, PipelineError, ReportId, ResearchError};
use crate::worker::{HandlerOutcome, JobContext, JobHandler, WorkerPool};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CostPreference {
    Low,
    High,
}

impl Default for CostPreference {
    fn default() -> Self {
        CostPreference::Low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AudienceLevel {
    Beginner,
    Intermediate,
    Expert,
}

impl Default for AudienceLevel {
    fn default() -> Self {
        AudienceLevel::Intermediate
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Report,
    Briefing,
    BulletPoints,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Report
    }
}

/// Parameters for `submit_research` (SPEC_FULL.md §6 tool table). Wire
/// field names are camelCase to match the tool table exactly
/// (`costPreference`, `audienceLevel`, ...); `idempotency_key` and `async`
/// are the table's two snake_case/keyword exceptions and are pinned with
/// explicit `rename`s.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResearchParams {
    pub query: String,
    #[serde(default)]
    pub cost_preference: CostPreference,
    #[serde(default)]
    pub audience_level: AudienceLevel,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default = "default_true")]
    pub include_sources: bool,
    #[serde(default)]
    pub images: Vec<Value>,
    #[serde(default)]
    pub text_documents: Vec<Value>,
    #[serde(default)]
    pub structured_data: Vec<Value>,
    #[serde(default = "default_true", rename = "async")]
    pub run_async: bool,
    #[serde(default, rename = "idempotency_key")]
    pub idempotency_key: Option<String>,
}

impl Default for ResearchParams {
    fn default() -> Self {
        Self {
            query: String::new(),
            cost_preference: CostPreference::default(),
            audience_level: AudienceLevel::default(),
            output_format: OutputFormat::default(),
            include_sources: true,
            images: Vec::new(),
            text_documents: Vec::new(),
            structured_data: Vec::new(),
            run_async: true,
            idempotency_key: None,
        }
    }
}

/// Parameters for `batch_research` (SPEC_FULL.md §6 tool table: camelCase).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchResearchParams {
    pub queries: Vec<String>,
    #[serde(default)]
    pub wait_for_completion: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub cost_preference: CostPreference,
}

fn default_timeout_ms() -> u64 {
    300_000
}

/// Parameters shared by `index` and `ingest` job kinds: both add a document
/// to the hybrid retrieval index (SPEC_FULL.md §1 notes these as a
/// collaborating subsystem, not a spec-exposed tool; they still need to be
/// real `JobKind` arms for the dispatch match to stay exhaustive).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocumentParams {
    pub source_type: String,
    pub source_id: String,
    pub title: String,
    pub content: String,
}

/// [`JobHandler`] for [`JobKind::Index`] and [`JobKind::Ingest`]: embeds and
/// upserts one document into the hybrid retrieval index (SPEC_FULL.md §3
/// Indexed Document, §4.9). Both job kinds share this handler — `ingest` is
/// the externally-triggered variant of the same upsert `index` performs
/// internally, and neither needs different storage semantics.
pub struct IndexHandler {
    store: Arc<dyn RetrievalStore>,
    embeddings: Arc<dyn EmbeddingProvider>,
    config: Arc<ResearchConfig>,
}

impl IndexHandler {
    pub fn new(
        store: Arc<dyn RetrievalStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
        config: Arc<ResearchConfig>,
    ) -> Self {
        Self { store, embeddings, config }
    }
}

#[async_trait::async_trait]
impl JobHandler for IndexHandler {
    async fn handle(&self, ctx: JobContext) -> HandlerOutcome {
        let params: IndexDocumentParams = serde_json::from_value(ctx.params.clone())
            .map_err(|e| PipelineError::Provider(format!("invalid index params: {e}")))?;

        let _ = ctx.events.emit("tool.started", json!({"stage": "index"})).await;

        let content: String = params
            .content
            .chars()
            .take(self.config.index_max_content_chars)
            .collect();
        let doc_embedding = self.embeddings.embed(&content).await.ok();
        let now = chrono::Utc::now();
        let doc = IndexedDocument {
            source_type: params.source_type,
            source_id: params.source_id,
            title: params.title,
            doc_len: content.split_whitespace().count() as u32,
            content,
            doc_embedding,
            created_at: now,
            updated_at: now,
        };

        self.store
            .insert_document(&doc)
            .await
            .map_err(|e| PipelineError::Provider(e.to_string()))?;

        let result = json!({
            "sourceType": doc.source_type,
            "sourceId": doc.source_id,
            "indexed": true,
        });
        let _ = ctx
            .events
            .emit("tool.completed", json!({"stage": "index"}))
            .await;
        Ok(result)
    }

    fn retry_on_failure(&self) -> bool {
        // Upsert keyed by (source_type, source_id): safe to retry.
        true
    }
}

/// Parameters for a follow-up job against a prior report.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FollowupParams {
    pub report_id: i64,
    pub query: String,
    #[serde(default)]
    pub cost_preference: CostPreference,
    #[serde(default = "default_true", rename = "async")]
    pub run_async: bool,
    #[serde(default, rename = "idempotency_key")]
    pub idempotency_key: Option<String>,
}

fn validate_and_parse<T>(raw: &Value, kind: &str) -> Result<T, DispatchError>
where
    T: JsonSchema + DeserializeOwned,
{
    let schema = schemars::schema_for!(T);
    let schema_value = serde_json::to_value(&schema).map_err(|e| DispatchError::SchemaValidation {
        kind: kind.to_string(),
        reason: e.to_string(),
    })?;
    let compiled = jsonschema::JSONSchema::compile(&schema_value).map_err(|e| {
        DispatchError::SchemaValidation {
            kind: kind.to_string(),
            reason: e.to_string(),
        }
    })?;
    if let Err(errors) = compiled.validate(raw) {
        let reason = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(DispatchError::SchemaValidation {
            kind: kind.to_string(),
            reason,
        });
    }
    serde_json::from_value(raw.clone()).map_err(|e| DispatchError::SchemaValidation {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Canonicalise `params` for fingerprinting (SPEC_FULL.md §6.1): lowercase
/// and trim the query, keep the coarse preference fields, and for every
/// non-empty multi-modal array fold it down to a short content hash plus a
/// count rather than hashing the full payload.
pub fn normalize_research_fingerprint(params: &ResearchParams) -> Value {
    let mut map = serde_json::Map::new();
    map.insert("query".to_string(), json!(params.query.trim().to_lowercase()));
    map.insert("costPreference".to_string(), json!(params.cost_preference));
    map.insert("audienceLevel".to_string(), json!(params.audience_level));
    map.insert("outputFormat".to_string(), json!(params.output_format));
    map.insert("includeSources".to_string(), json!(params.include_sources));
    for (key, arr) in [
        ("images", &params.images),
        ("textDocuments", &params.text_documents),
        ("structuredData", &params.structured_data),
    ] {
        if !arr.is_empty() {
            let bytes = serde_json::to_vec(&arr[0]).unwrap_or_default();
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            let hex = hex::encode(hasher.finalize());
            map.insert(format!("{key}Hash"), json!(hex[..16.min(hex.len())]));
            map.insert(format!("{key}Count"), json!(arr.len()));
        }
    }
    Value::Object(map)
}

fn report_id_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Report ID:\s*(\d+)").unwrap())
}

/// Resolve a report id out of a terminal job payload (SPEC_FULL.md §9 Open
/// Question): a `reportId`/`report_id` field first, then a `Report ID: N`
/// line inside a free-text `message`, then a bare numeric string.
fn extract_report_id(payload: &Value) -> Option<i64> {
    if let Some(v) = payload.get("reportId").or_else(|| payload.get("report_id")) {
        if let Some(n) = v.as_i64() {
            return Some(n);
        }
        if let Some(s) = v.as_str() {
            if let Ok(n) = s.parse() {
                return Some(n);
            }
        }
    }
    if let Some(s) = payload.get("message").and_then(|m| m.as_str()) {
        if let Some(caps) = report_id_regex().captures(s) {
            if let Ok(n) = caps[1].parse() {
                return Some(n);
            }
        }
        if let Ok(n) = s.trim().parse() {
            return Some(n);
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFormat {
    Summary,
    Full,
    Events,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub report_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<crate::store::JobEvent>>,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Queued { job_id: JobId, existing: bool },
    Completed { job_id: JobId, status: JobStatus, result: Value },
}

/// Entry point for all tool invocations. Owns no state of its own beyond
/// handles to the components that do.
pub struct Dispatch {
    store: Arc<dyn RetrievalStore>,
    bus: Arc<EventBus>,
    workers: Arc<WorkerPool>,
    embeddings: Arc<dyn EmbeddingProvider>,
    config: Arc<ResearchConfig>,
}

impl Dispatch {
    pub fn new(
        store: Arc<dyn RetrievalStore>,
        bus: Arc<EventBus>,
        workers: Arc<WorkerPool>,
        embeddings: Arc<dyn EmbeddingProvider>,
        config: Arc<ResearchConfig>,
    ) -> Self {
        Self { store, bus, workers, embeddings, config }
    }

    async fn await_terminal(&self, job_id: JobId) -> Result<(JobStatus, Value), ResearchError> {
        let mut rx = self.bus.subscribe(job_id, 0).await;
        while let Some(event) = rx.recv().await {
            match event.event_type.as_str() {
                "job.succeeded" => return Ok((JobStatus::Succeeded, event.payload)),
                "job.failed" => return Ok((JobStatus::Failed, event.payload)),
                "job.canceled" => return Ok((JobStatus::Canceled, event.payload)),
                _ => continue,
            }
        }
        Err(ResearchError::Fatal(
            "event stream closed before job reached a terminal state".to_string(),
        ))
    }

    pub async fn submit_research(
        &self,
        raw_params: Value,
        client_key: Option<String>,
    ) -> Result<SubmitOutcome, ResearchError> {
        let params: ResearchParams = validate_and_parse(&raw_params, "research")
            .map_err(ResearchError::Dispatch)?;

        let key = match client_key {
            Some(k) => sanitize_client_key(&k)
                .ok_or_else(|| ResearchError::InvalidParams(format!("invalid idempotency key: {k}")))?,
            None => fingerprint(&normalize_research_fingerprint(&params), self.config.fingerprint_key_length),
        };

        let enqueue = self
            .store
            .insert_job(
                JobKind::Research,
                serde_json::to_value(&params).map_err(|e| ResearchError::InvalidParams(e.to_string()))?,
                &key,
                chrono::Duration::seconds(self.config.job_ttl_secs as i64),
                None,
            )
            .await?;
        let (job_id, existing) = match enqueue {
            EnqueueResult::Created(id) => (id, false),
            EnqueueResult::Duplicate(id) => (id, true),
        };

        if !params.run_async {
            let (status, result) = self.await_terminal(job_id).await?;
            return Ok(SubmitOutcome::Completed { job_id, status, result });
        }
        Ok(SubmitOutcome::Queued { job_id, existing })
    }

    pub async fn batch_research(
        &self,
        raw_params: Value,
    ) -> Result<Vec<(String, Result<SubmitOutcome, ResearchError>)>, ResearchError> {
        let params: BatchResearchParams =
            validate_and_parse(&raw_params, "batch_research").map_err(ResearchError::Dispatch)?;
        if params.queries.is_empty() || params.queries.len() > 10 {
            return Err(ResearchError::InvalidParams(
                "batch_research accepts 1 to 10 queries".to_string(),
            ));
        }

        let mut out = Vec::with_capacity(params.queries.len());
        for query in &params.queries {
            let research_params = json!({
                "query": query,
                "costPreference": params.cost_preference,
                "async": true,
            });
            let outcome = self.submit_research(research_params, None).await;
            out.push((query.clone(), outcome));
        }

        if !params.wait_for_completion {
            return Ok(out);
        }

        // waitForCompletion: poll every queued job's terminal status up to the
        // shared timeout budget, converting whichever ones finish in time into
        // Completed outcomes in place. Jobs still running past the deadline are
        // left as Queued so the caller can keep polling `get_job_status`.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(params.timeout_ms);
        let mut upgraded = Vec::with_capacity(out.len());
        for (query, outcome) in out {
            let job_id = match &outcome {
                Ok(SubmitOutcome::Queued { job_id, .. }) => Some(*job_id),
                _ => None,
            };
            let Some(job_id) = job_id else {
                upgraded.push((query, outcome));
                continue;
            };
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, self.await_terminal(job_id)).await {
                Ok(Ok((status, result))) => {
                    upgraded.push((query, Ok(SubmitOutcome::Completed { job_id, status, result })))
                }
                Ok(Err(e)) => upgraded.push((query, Err(e))),
                Err(_) => upgraded.push((query, outcome)),
            }
        }
        Ok(upgraded)
    }

    pub async fn status(
        &self,
        job_id: JobId,
        format: StatusFormat,
        since_event_id: Option<i64>,
        max_events: usize,
    ) -> Result<StatusView, ResearchError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| ResearchError::NotFound(job_id.to_string()))?;
        let report_id = job.result.as_ref().and_then(extract_report_id);
        let events = match format {
            StatusFormat::Summary => None,
            StatusFormat::Full | StatusFormat::Events => Some(
                self.store
                    .read_events(job_id, since_event_id.unwrap_or(0), max_events)
                    .await?,
            ),
        };
        Ok(StatusView {
            job_id,
            status: job.status,
            progress: job.progress,
            report_id,
            events,
        })
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatus, ResearchError> {
        let (previous, event_id) = self.store.request_cancel(job_id).await?;
        if let Some(event_id) = event_id {
            self.bus.publish(
                job_id,
                JobEvent {
                    job_id,
                    event_id,
                    event_type: "job.canceled".to_string(),
                    payload: json!({}),
                    ts: chrono::Utc::now(),
                },
            );
        }
        self.workers.cancel(job_id);
        Ok(previous)
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        scope: SearchScope,
        _rerank: bool,
    ) -> Result<SearchResult, ResearchError> {
        let embedding = self
            .embeddings
            .embed(query)
            .await
            .ok();
        self.store
            .hybrid_search(
                query,
                embedding.as_ref(),
                k,
                scope,
                RetrievalWeights {
                    bm25: self.config.retrieval_weight_bm25,
                    vector: self.config.retrieval_weight_vector,
                },
                self.config.bm25_k1,
                self.config.bm25_b,
            )
            .await
            .map_err(Into::into)
    }

    /// Set or clear a report's user rating (1-5). The only field the Report
    /// entity permits mutating after creation.
    pub async fn rate_report(&self, report_id: ReportId, rating: Option<u8>) -> Result<(), ResearchError> {
        if let Some(r) = rating {
            if r == 0 || r > 5 {
                return Err(ResearchError::InvalidParams(
                    "rating must be between 1 and 5".to_string(),
                ));
            }
        }
        self.store.rate_report(report_id, rating).await.map_err(Into::into)
    }

    /// Dispatch a claimed job's kind to its param type, validating the
    /// stored params were well-formed (defence in depth: `submit_research`
    /// already validated at submission time). Used by non-research handlers
    /// that don't go through the pipeline (index/ingest/followup).
    pub fn kind_of(params: &Value, kind: JobKind) -> Result<Value, DispatchError> {
        match kind {
            JobKind::Research => validate_and_parse::<ResearchParams>(params, "research")
                .and_then(|p| serde_json::to_value(p).map_err(|e| DispatchError::SchemaValidation {
                    kind: "research".to_string(),
                    reason: e.to_string(),
                })),
            JobKind::Followup => validate_and_parse::<FollowupParams>(params, "followup")
                .and_then(|p| serde_json::to_value(p).map_err(|e| DispatchError::SchemaValidation {
                    kind: "followup".to_string(),
                    reason: e.to_string(),
                })),
            JobKind::Batch => Err(DispatchError::UnknownKind(
                "batch jobs are fanned out into individual research jobs, not dispatched directly".to_string(),
            )),
            JobKind::Index | JobKind::Ingest => {
                validate_and_parse::<IndexDocumentParams>(params, "index").and_then(|p| {
                    serde_json::to_value(p).map_err(|e| DispatchError::SchemaValidation {
                        kind: "index".to_string(),
                        reason: e.to_string(),
                    })
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_trims_query() {
        let params = ResearchParams {
            query: "  Hello World  ".to_string(),
            ..Default::default()
        };
        let normalized = normalize_research_fingerprint(&params);
        assert_eq!(normalized["query"], json!("hello world"));
    }

    #[test]
    fn fingerprint_is_stable_across_field_order() {
        let a = ResearchParams { query: "x".to_string(), ..Default::default() };
        let b = a.clone();
        assert_eq!(
            fingerprint(&normalize_research_fingerprint(&a), 16),
            fingerprint(&normalize_research_fingerprint(&b), 16)
        );
    }

    #[test]
    fn extract_report_id_prefers_structured_field() {
        assert_eq!(extract_report_id(&json!({"reportId": 42})), Some(42));
        assert_eq!(extract_report_id(&json!({"report_id": "7"})), Some(7));
    }

    #[test]
    fn extract_report_id_falls_back_to_regex_then_bare_number() {
        assert_eq!(
            extract_report_id(&json!({"message": "done. Report ID: 99"})),
            Some(99)
        );
        assert_eq!(extract_report_id(&json!({"message": "123"})), Some(123));
        assert_eq!(extract_report_id(&json!({"message": "no id here"})), None);
    }

    #[test]
    fn research_params_schema_rejects_missing_query() {
        let err = validate_and_parse::<ResearchParams>(&json!({}), "research").unwrap_err();
        assert!(matches!(err, DispatchError::SchemaValidation { .. }));
    }

    #[test]
    fn batch_research_schema_accepts_minimal_payload() {
        let parsed: BatchResearchParams =
            validate_and_parse(&json!({"queries": ["a", "b"]}), "batch_research").unwrap();
        assert_eq!(parsed.queries.len(), 2);
        assert_eq!(parsed.timeout_ms, 300_000);
    }

    #[tokio::test]
    async fn index_handler_upserts_document_and_makes_it_searchable() {
        use crate::embedding::MockEmbeddingProvider;
        use crate::store::{SearchScope, SqliteRetrievalStore};
        use crate::worker::EventEmitter;

        let store: Arc<dyn RetrievalStore> =
            Arc::new(SqliteRetrievalStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(store.clone(), 16));
        let handler = IndexHandler::new(
            store.clone(),
            Arc::new(MockEmbeddingProvider),
            Arc::new(ResearchConfig::default()),
        );

        let job_id = JobId::new();
        let ctx = JobContext {
            job_id,
            params: json!({
                "sourceType": "doc",
                "sourceId": "readme-1",
                "title": "Async runtime overview",
                "content": "tokio powers the async runtime scheduling internals",
            }),
            attempt_count: 0,
            worker_id: "test-worker".to_string(),
            cancellation: tokio_util::sync::CancellationToken::new(),
            events: EventEmitter::new(store.clone(), bus.clone(), job_id),
        };

        let result = handler.handle(ctx).await.expect("handler succeeds");
        assert_eq!(result["indexed"], json!(true));
        assert_eq!(result["sourceId"], json!("readme-1"));

        let search = store
            .hybrid_search(
                "async runtime scheduling",
                None,
                5,
                SearchScope::DocsOnly,
                RetrievalWeights { bm25: 1.0, vector: 0.0 },
                1.2,
                0.75,
            )
            .await
            .expect("search succeeds");
        assert!(search
            .hits
            .iter()
            .any(|h| h.source_id == "readme-1"));
    }
}
