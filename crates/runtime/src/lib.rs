//! Symbiont Research Server
//!
//! Async job orchestration, hybrid retrieval, and a three-stage research
//! pipeline behind stdio (MCP), HTTP+SSE, and WebSocket transports. A
//! [`ResearchServer`] wires together the Retrieval Store, Embedding
//! Provider, Cache Layer, Event Bus, Worker Pool, and Research Pipeline,
//! and hands the result to whichever transport the caller selects.

pub mod bus;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod embedding;
pub mod pipeline;
pub mod retrieval;
pub mod store;
pub mod transport;
pub mod types;
pub mod worker;

use std::collections::HashMap;
use std::sync::Arc;

use crate::bus::EventBus;
use crate::cache::CacheLayer;
use crate::config::ResearchConfig;
use crate::dispatch::{Dispatch, IndexHandler};
use crate::embedding::{EmbeddingProvider, MockEmbeddingProvider};
use crate::pipeline::{LlmProvider, MockLlmProvider, ResearchHandler};
use crate::store::{RetrievalStore, SqliteRetrievalStore};
use crate::types::{ConfigError, JobKind};
use crate::worker::{JobHandler, WorkerPool};

/// A fully wired research server: store, bus, cache, worker pool, and
/// dispatch layer, plus whatever background maintenance tasks it spawned.
pub struct ResearchServer {
    pub config: Arc<ResearchConfig>,
    pub store: Arc<dyn RetrievalStore>,
    pub bus: Arc<EventBus>,
    pub cache: Arc<CacheLayer>,
    pub workers: Arc<WorkerPool>,
    pub dispatch: Arc<Dispatch>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

/// Pluggable providers injected into the research pipeline. Defaults to the
/// deterministic mock providers, which is enough to run the server without
/// any outbound network access (tests, demos, offline development).
pub struct ResearchServerDeps {
    pub llm_provider: Arc<dyn LlmProvider>,
    pub embedding_provider: Arc<dyn EmbeddingProvider>,
}

impl Default for ResearchServerDeps {
    fn default() -> Self {
        Self {
            llm_provider: Arc::new(MockLlmProvider),
            embedding_provider: Arc::new(MockEmbeddingProvider),
        }
    }
}

impl ResearchServer {
    pub async fn new(
        config: ResearchConfig,
        deps: ResearchServerDeps,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let store: Arc<dyn RetrievalStore> = Arc::new(
            SqliteRetrievalStore::open(&config.sqlite_path)
                .map_err(|e| ConfigError::Io(e.to_string()))?,
        );
        let bus = Arc::new(EventBus::new(store.clone(), config.event_ring_capacity));
        let cache = Arc::new(CacheLayer::new(
            store.clone(),
            std::time::Duration::from_secs(config.cache_ttl_secs),
            config.cache_max_entries,
            config.cache_similarity_threshold,
        ));

        let research_handler: Arc<dyn JobHandler> = Arc::new(ResearchHandler::new(
            deps.llm_provider.clone(),
            cache.clone(),
            store.clone(),
            deps.embedding_provider.clone(),
            config.clone(),
        ));

        let index_handler: Arc<dyn JobHandler> = Arc::new(IndexHandler::new(
            store.clone(),
            deps.embedding_provider.clone(),
            config.clone(),
        ));

        let mut handlers: HashMap<JobKind, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert(JobKind::Research, research_handler.clone());
        handlers.insert(JobKind::Followup, research_handler);
        handlers.insert(JobKind::Index, index_handler.clone());
        handlers.insert(JobKind::Ingest, index_handler);

        let workers = Arc::new(WorkerPool::new(
            store.clone(),
            bus.clone(),
            handlers,
            config.clone(),
        ));
        let mut background = workers.spawn();

        let dispatch = Arc::new(Dispatch::new(
            store.clone(),
            bus.clone(),
            workers.clone(),
            deps.embedding_provider.clone(),
            config.clone(),
        ));

        let prune_handle = {
            let cache = cache.clone();
            let interval = std::time::Duration::from_secs(config.cache_prune_interval_secs);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(e) = cache.prune().await {
                        tracing::warn!(error = %e, "cache prune failed");
                    }
                }
            })
        };
        background.push(prune_handle);

        let reap_handle = {
            let store = store.clone();
            let interval = std::time::Duration::from_secs(config.reap_interval_secs);
            let ttl = chrono::Duration::seconds(config.job_ttl_secs as i64);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match store.reap_expired(ttl).await {
                        Ok(n) if n > 0 => tracing::debug!(reaped = n, "retention reaper swept terminal jobs"),
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "retention reap failed"),
                    }
                }
            })
        };
        background.push(reap_handle);

        Ok(Self {
            config,
            store,
            bus,
            cache,
            workers,
            dispatch,
            background,
        })
    }

    /// Stop accepting new work, cancel background tasks, and wait for
    /// in-flight claim loops to observe the shutdown signal.
    pub async fn shutdown(self) {
        self.workers.shutdown();
        for handle in self.background {
            handle.abort();
            let _ = handle.await;
        }
    }
}
