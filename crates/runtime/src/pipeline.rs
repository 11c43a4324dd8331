//! Research Pipeline (SPEC_FULL.md §4.7): plan → parallel sub-research →
//! synthesis, with cache short-circuiting and cooperative cancellation
//! checked at every stage and token boundary.
//!
//! The three-stage shape and token-delta event vocabulary (`tool.started`,
//! `tool.delta`, `tool.completed`) are grounded in the runtime's original
//! `reasoning/loop.rs` observe-decide-act cycle; the `LlmProvider` trait
//! boundary plays the role the teacher's `InferenceProvider` trait plays
//! there, kept intentionally small since the actual chat-completion
//! transport is out of scope here.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::cache::CacheLayer;
use crate::config::ResearchConfig;
use crate::dispatch::{normalize_research_fingerprint, ResearchParams};
use crate::embedding::EmbeddingProvider;
use crate::store::{fingerprint, Report, RetrievalStore};
use crate::types::{Embedding, PipelineError, ReportId, ResearchError};
use crate::worker::{EventEmitter, HandlerOutcome, JobContext, JobHandler};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
    }
}

pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

pub struct Plan {
    pub sub_queries: Vec<String>,
    pub usage: Usage,
}

/// The external chat-completion collaborator (SPEC_FULL.md §1: out of scope
/// to implement for real — assumed a blackbox streaming-capable provider).
/// Kept minimal: plan, research one sub-query, synthesize. Token-level
/// streaming to subscribers is produced locally in [`stream_deltas`] from
/// whatever text the provider returns, rather than threaded through this
/// trait, so a real streaming backend can be dropped in later without
/// touching the pipeline's event emission.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn plan(&self, query: &str, max_agents: usize) -> Result<Plan, PipelineError>;
    async fn research(&self, sub_query: &str) -> Result<Completion, PipelineError>;
    async fn synthesize(&self, query: &str, sub_results: &[String]) -> Result<Completion, PipelineError>;
}

/// Deterministic provider used by default and in tests: splits the query on
/// conjunctions into a bounded number of sub-queries, and "researches" each
/// by echoing back a templated finding.
pub struct MockLlmProvider;

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn plan(&self, query: &str, max_agents: usize) -> Result<Plan, PipelineError> {
        let parts: Vec<String> = query
            .split([',', ';'])
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        let sub_queries = if parts.len() > 1 {
            parts.into_iter().take(max_agents.max(1)).collect()
        } else {
            let n = max_agents.clamp(1, 3);
            (1..=n).map(|i| format!("{query} (aspect {i}/{n})")).collect()
        };
        Ok(Plan {
            usage: Usage {
                prompt_tokens: (query.len() as u32 / 4).max(1),
                completion_tokens: (sub_queries.len() as u32) * 8,
            },
            sub_queries,
        })
    }

    async fn research(&self, sub_query: &str) -> Result<Completion, PipelineError> {
        let text = format!(
            "Findings for \"{sub_query}\": no external sources were consulted (mock provider); \
             this is a deterministic placeholder finding."
        );
        Ok(Completion {
            usage: Usage {
                prompt_tokens: (sub_query.len() as u32 / 4).max(1),
                completion_tokens: (text.len() as u32 / 4).max(1),
            },
            text,
        })
    }

    async fn synthesize(&self, query: &str, sub_results: &[String]) -> Result<Completion, PipelineError> {
        let mut text = format!("# Research report: {query}\n\n");
        for (i, result) in sub_results.iter().enumerate() {
            text.push_str(&format!("## Finding {}\n{}\n\n", i + 1, result));
        }
        Ok(Completion {
            usage: Usage {
                prompt_tokens: (sub_results.iter().map(|s| s.len()).sum::<usize>() as u32 / 4).max(1),
                completion_tokens: (text.len() as u32 / 4).max(1),
            },
            text,
        })
    }
}

/// Talks to an OpenAI-compatible chat completions endpoint, one request per
/// stage, non-streaming. The spec treats the real provider as an external
/// blackbox; this is a thin, faithful-enough stub of that boundary.
pub struct HttpLlmProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLlmProvider {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            model,
            api_key,
        }
    }

    async fn chat(&self, system: &str, user: &str) -> Result<Completion, PipelineError> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: RespMsg,
        }
        #[derive(Deserialize)]
        struct RespMsg {
            content: String,
        }
        #[derive(Deserialize)]
        struct Usage2 {
            prompt_tokens: u32,
            completion_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
            #[serde(default)]
            usage: Option<Usage2>,
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&Req {
            model: &self.model,
            messages: vec![
                Msg { role: "system", content: system },
                Msg { role: "user", content: user },
            ],
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::Provider(format!("llm request failed: {e}")))?;
        let parsed: Resp = response
            .json()
            .await
            .map_err(|e| PipelineError::Provider(format!("malformed llm response: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Provider("llm response had no choices".to_string()))?
            .message
            .content;
        let usage = parsed
            .usage
            .map(|u| Usage { prompt_tokens: u.prompt_tokens, completion_tokens: u.completion_tokens })
            .unwrap_or_default();
        Ok(Completion { text, usage })
    }
}

#[async_trait]
impl LlmProvider for HttpLlmProvider {
    async fn plan(&self, query: &str, max_agents: usize) -> Result<Plan, PipelineError> {
        let completion = self
            .chat(
                &format!(
                    "Decompose the user's research query into at most {max_agents} independent \
                     sub-questions, one per line, no numbering."
                ),
                query,
            )
            .await?;
        let sub_queries: Vec<String> = completion
            .text
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .take(max_agents.max(1))
            .collect();
        if sub_queries.is_empty() {
            return Err(PipelineError::PlanFailed("provider returned no sub-queries".to_string()));
        }
        Ok(Plan { sub_queries, usage: completion.usage })
    }

    async fn research(&self, sub_query: &str) -> Result<Completion, PipelineError> {
        self.chat("Research the following question thoroughly and concisely.", sub_query)
            .await
    }

    async fn synthesize(&self, query: &str, sub_results: &[String]) -> Result<Completion, PipelineError> {
        let user = format!(
            "Original query: {query}\n\nSub-findings:\n{}",
            sub_results
                .iter()
                .enumerate()
                .map(|(i, r)| format!("{}. {r}", i + 1))
                .collect::<Vec<_>>()
                .join("\n")
        );
        self.chat(
            "Synthesize the sub-findings into one coherent research report.",
            &user,
        )
        .await
    }
}

async fn stream_deltas(
    events: &EventEmitter,
    stage: &str,
    sub_id: Option<&str>,
    text: &str,
    cancellation: &CancellationToken,
) -> Result<(), PipelineError> {
    for chunk in text.split_inclusive(' ') {
        if cancellation.is_cancelled() {
            return Err(PipelineError::Canceled { stage: stage.to_string() });
        }
        let mut payload = json!({"stage": stage, "delta": chunk});
        if let Some(id) = sub_id {
            payload["sub_id"] = json!(id);
        }
        let _ = events.emit("tool.delta", payload).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_research(
    query: &str,
    max_agents: usize,
    parallelism: usize,
    events: &EventEmitter,
    cancellation: &CancellationToken,
    provider: &dyn LlmProvider,
    store: &dyn RetrievalStore,
    query_embedding: Embedding,
) -> Result<Value, PipelineError> {
    if cancellation.is_cancelled() {
        return Err(PipelineError::Canceled { stage: "plan".to_string() });
    }

    let _ = events.emit("tool.started", json!({"stage": "plan"})).await;
    let plan = provider.plan(query, max_agents).await?;
    let _ = events
        .emit("tool.completed", json!({"stage": "plan", "sub_queries": plan.sub_queries.len()}))
        .await;

    let mut total_usage = plan.usage.clone();

    let mut results: Vec<(usize, Result<Completion, PipelineError>)> = stream::iter(
        plan.sub_queries.iter().cloned().enumerate(),
    )
    .map(|(i, sub_query)| async move {
        if cancellation.is_cancelled() {
            return (i, Err(PipelineError::Canceled { stage: "research".to_string() }));
        }
        let sub_id = format!("sub-{i}");
        let _ = events
            .emit("tool.started", json!({"stage": "research", "sub_id": sub_id}))
            .await;
        let outcome = provider.research(&sub_query).await;
        match &outcome {
            Ok(completion) => {
                let _ = stream_deltas(events, "research", Some(&sub_id), &completion.text, cancellation).await;
                let _ = events
                    .emit("tool.completed", json!({"stage": "research", "sub_id": sub_id}))
                    .await;
            }
            Err(e) => {
                let _ = events
                    .emit(
                        "tool.completed",
                        json!({"stage": "research", "sub_id": sub_id, "error": e.to_string()}),
                    )
                    .await;
            }
        }
        (i, outcome)
    })
    .buffer_unordered(parallelism.max(1))
    .collect()
    .await;

    results.sort_by_key(|(i, _)| *i);
    let attempted = results.len();
    let mut succeeded = 0usize;
    let mut sub_texts = Vec::new();
    let mut missing = Vec::new();
    for (i, outcome) in results {
        match outcome {
            Ok(completion) => {
                succeeded += 1;
                total_usage.add(&completion.usage);
                sub_texts.push(completion.text);
            }
            Err(_) => missing.push(format!("sub-{i}")),
        }
    }

    if succeeded * 2 < attempted {
        return Err(PipelineError::PartialFailure { succeeded, attempted });
    }

    if cancellation.is_cancelled() {
        return Err(PipelineError::Canceled { stage: "synthesis".to_string() });
    }
    let _ = events.emit("tool.started", json!({"stage": "synthesis"})).await;
    let synthesis = provider.synthesize(query, &sub_texts).await?;
    stream_deltas(events, "synthesis", None, &synthesis.text, cancellation).await?;
    let _ = events.emit("tool.completed", json!({"stage": "synthesis"})).await;
    total_usage.add(&synthesis.usage);

    let report = Report {
        id: ReportId(0),
        original_query: query.to_string(),
        final_report: synthesis.text.clone(),
        query_embedding,
        metadata: Some(json!({"usage": total_usage, "missing_sub_ids": missing})),
        created_at: chrono::Utc::now(),
        rating: None,
    };
    let report_id = store
        .insert_report(&report)
        .await
        .map_err(|e| PipelineError::SynthesisFailed(e.to_string()))?;

    Ok(json!({
        "reportId": report_id.0,
        "report": synthesis.text,
        "usage": total_usage,
        "missingSubIds": missing,
    }))
}

/// [`JobHandler`] for [`crate::types::JobKind::Research`] (and, sharing the
/// same logic over a slightly different param shape, `Followup`).
pub struct ResearchHandler {
    provider: Arc<dyn LlmProvider>,
    cache: Arc<CacheLayer>,
    store: Arc<dyn RetrievalStore>,
    embeddings: Arc<dyn EmbeddingProvider>,
    config: Arc<ResearchConfig>,
}

impl ResearchHandler {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        cache: Arc<CacheLayer>,
        store: Arc<dyn RetrievalStore>,
        embeddings: Arc<dyn EmbeddingProvider>,
        config: Arc<ResearchConfig>,
    ) -> Self {
        Self { provider, cache, store, embeddings, config }
    }
}

#[async_trait]
impl JobHandler for ResearchHandler {
    async fn handle(&self, ctx: JobContext) -> HandlerOutcome {
        let params: ResearchParams = serde_json::from_value(ctx.params.clone())
            .map_err(|e| PipelineError::PlanFailed(format!("invalid research params: {e}")))?;

        let fp_input = normalize_research_fingerprint(&params);
        let fp = fingerprint(&fp_input, self.config.fingerprint_key_length);

        let query_embedding = self
            .embeddings
            .embed(&params.query)
            .await
            .map_err(|e| PipelineError::Provider(e.to_string()))?;

        if let Some(entry) = self
            .cache
            .lookup(&fp, "research", Some(&query_embedding))
            .await
            .map_err(|e| PipelineError::Provider(e.to_string()))?
        {
            let _ = ctx.events.emit("cache.hit", json!({"fingerprint": fp})).await;
            return Ok(entry.result);
        }

        let provider = self.provider.clone();
        let store = self.store.clone();
        let cache = self.cache.clone();
        let config = self.config.clone();
        let events = ctx.events.clone();
        let cancellation = ctx.cancellation.clone();
        let query = params.query.clone();
        let embedding_for_build = query_embedding.clone();
        let fp_for_fill = fp.clone();

        let build_result = self
            .cache
            .single_flight(&fp, move || async move {
                let result = run_research(
                    &query,
                    config.max_agents,
                    config.research_parallelism,
                    &events,
                    &cancellation,
                    provider.as_ref(),
                    store.as_ref(),
                    embedding_for_build.clone(),
                )
                .await
                .map_err(ResearchError::Pipeline)?;

                let _ = cache
                    .fill(&fp_for_fill, "research", result.clone(), Some(embedding_for_build))
                    .await;

                Ok(result)
            })
            .await;

        build_result.map_err(|e| match e {
            ResearchError::Pipeline(p) => p,
            other => PipelineError::Provider(other.to_string()),
        })
    }

    fn retry_on_failure(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::ResearchConfig;
    use crate::embedding::MockEmbeddingProvider;
    use crate::store::SqliteRetrievalStore;
    use crate::types::{JobId, JobKind};

    fn harness() -> (Arc<dyn RetrievalStore>, Arc<EventBus>, Arc<CacheLayer>) {
        let store: Arc<dyn RetrievalStore> = Arc::new(SqliteRetrievalStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(store.clone(), 64));
        let cache = Arc::new(CacheLayer::new(
            store.clone(),
            std::time::Duration::from_secs(3600),
            1000,
            0.85,
        ));
        (store, bus, cache)
    }

    #[tokio::test]
    async fn research_handler_produces_report_and_fills_cache() {
        let (store, bus, cache) = harness();
        let handler = ResearchHandler::new(
            Arc::new(MockLlmProvider),
            cache.clone(),
            store.clone(),
            Arc::new(MockEmbeddingProvider),
            Arc::new(ResearchConfig::default()),
        );

        let job_id = match store
            .insert_job(
                JobKind::Research,
                json!({"query": "impact of caching on latency"}),
                "k1",
                chrono::Duration::hours(1),
                None,
            )
            .await
            .unwrap()
        {
            crate::store::EnqueueResult::Created(id) => id,
            _ => unreachable!(),
        };

        let ctx = JobContext {
            job_id,
            params: json!({"query": "impact of caching on latency"}),
            attempt_count: 1,
            worker_id: "w1".to_string(),
            cancellation: CancellationToken::new(),
            events: EventEmitter::new(store.clone(), bus.clone(), job_id),
        };

        let result = handler.handle(ctx).await.unwrap();
        assert!(result.get("reportId").is_some());
        assert!(result.get("report").is_some());

        let fp = fingerprint(
            &normalize_research_fingerprint(&ResearchParams {
                query: "impact of caching on latency".to_string(),
                ..Default::default()
            }),
            16,
        );
        let cached = cache.lookup(&fp, "research", None).await.unwrap();
        assert!(cached.is_some());
    }

    #[tokio::test]
    async fn cancellation_before_plan_short_circuits() {
        let (store, bus, cache) = harness();
        let handler = ResearchHandler::new(
            Arc::new(MockLlmProvider),
            cache,
            store.clone(),
            Arc::new(MockEmbeddingProvider),
            Arc::new(ResearchConfig::default()),
        );
        let job_id = JobId::new();
        let token = CancellationToken::new();
        token.cancel();
        let ctx = JobContext {
            job_id,
            params: json!({"query": "x"}),
            attempt_count: 1,
            worker_id: "w1".to_string(),
            cancellation: token,
            events: EventEmitter::new(store, bus, job_id),
        };
        let err = handler.handle(ctx).await.unwrap_err();
        assert!(matches!(err, PipelineError::Canceled { .. }));
    }
}
