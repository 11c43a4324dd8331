//! Worker Pool (SPEC_FULL.md §4.5): a fixed-size pool of claim loops that
//! lease jobs, heartbeat while a handler runs, and report terminal state.
//!
//! The claim-heartbeat-finish shape is grounded in the runtime's original
//! `scheduler/job_store.rs`; the jittered idle backoff and heartbeat-while-
//! running vocabulary additionally draws on
//! `examples/other_examples/2cf189ea_fourthplaces-mntogether__packages-server-src-kernel-jobs-queue.rs.rs`.
//! Cooperative cancellation is a per-job `tokio_util::sync::CancellationToken`
//! kept in an in-process map, never persisted — the durable source of truth
//! for "is this job canceled" is the `jobs.status` column, which
//! `Store::request_cancel` can set even while no worker is watching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::config::ResearchConfig;
use crate::store::{Job, JobEvent, RetrievalStore};
use crate::types::{JobId, JobKind, JobStatus, PipelineError, StoreError};

/// Capability passed to handlers so they can report progress without
/// knowing who, if anyone, is listening (SPEC_FULL.md §9).
#[derive(Clone)]
pub struct EventEmitter {
    store: Arc<dyn RetrievalStore>,
    bus: Arc<EventBus>,
    job_id: JobId,
}

impl EventEmitter {
    pub fn new(store: Arc<dyn RetrievalStore>, bus: Arc<EventBus>, job_id: JobId) -> Self {
        Self { store, bus, job_id }
    }

    pub async fn emit(&self, event_type: &str, payload: Value) -> Result<(), StoreError> {
        let event_id = self
            .store
            .append_event(self.job_id, event_type, payload.clone())
            .await?;
        self.bus.publish(
            self.job_id,
            JobEvent {
                job_id: self.job_id,
                event_id,
                event_type: event_type.to_string(),
                payload,
                ts: chrono::Utc::now(),
            },
        );
        Ok(())
    }

    pub async fn progress(&self, pct: u8) -> Result<(), StoreError> {
        self.store.update_progress(self.job_id, pct).await?;
        self.emit("job.progress", serde_json::json!({"progress": pct})).await
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}

/// What a handler returns on success: persisted as both the job's `result`
/// column and the terminal event's payload.
pub type HandlerOutcome = Result<Value, PipelineError>;

/// Everything a handler needs to run a job to completion.
pub struct JobContext {
    pub job_id: JobId,
    pub params: Value,
    pub attempt_count: u32,
    pub worker_id: String,
    pub cancellation: CancellationToken,
    pub events: EventEmitter,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> HandlerOutcome;

    /// Whether a failure from this handler should be requeued (subject to
    /// `max_retry_attempts`) rather than marked terminally failed. Handlers
    /// whose side effects are unsafe to repeat should override this.
    fn retry_on_failure(&self) -> bool {
        false
    }
}

pub struct WorkerPool {
    store: Arc<dyn RetrievalStore>,
    bus: Arc<EventBus>,
    handlers: Arc<HashMap<JobKind, Arc<dyn JobHandler>>>,
    config: Arc<ResearchConfig>,
    cancellations: Arc<DashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn RetrievalStore>,
        bus: Arc<EventBus>,
        handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
        config: Arc<ResearchConfig>,
    ) -> Self {
        Self {
            store,
            bus,
            handlers: Arc::new(handlers),
            config,
            cancellations: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn `worker_count` claim loops.
    pub fn spawn(&self) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|i| {
                let worker_id = format!("worker-{i}");
                tokio::spawn(run_worker(
                    worker_id,
                    self.store.clone(),
                    self.bus.clone(),
                    self.handlers.clone(),
                    self.config.clone(),
                    self.cancellations.clone(),
                    self.shutdown.clone(),
                ))
            })
            .collect()
    }

    /// Signal cancellation to whichever worker currently holds `job_id`, if
    /// any. A no-op if the job isn't currently claimed by a worker — in that
    /// case the store-level status change (see `Dispatch::cancel`) is what
    /// actually takes effect.
    pub fn cancel(&self, job_id: JobId) {
        if let Some(token) = self.cancellations.get(&job_id) {
            token.cancel();
        }
    }

    /// Stop claiming new work; in-flight jobs run to completion or observe
    /// `shutdown` at their next cancellation check-point.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker(
    worker_id: String,
    store: Arc<dyn RetrievalStore>,
    bus: Arc<EventBus>,
    handlers: Arc<HashMap<JobKind, Arc<dyn JobHandler>>>,
    config: Arc<ResearchConfig>,
    cancellations: Arc<DashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match store
            .claim_next_leased_job(&worker_id, config.lease_duration_ms)
            .await
        {
            Ok(Some(job)) => {
                process_job(
                    &worker_id,
                    job,
                    &store,
                    &bus,
                    &handlers,
                    &config,
                    &cancellations,
                    &shutdown,
                )
                .await;
            }
            Ok(None) => {
                let jitter_ms = rand::thread_rng().gen_range(50..250);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(jitter_ms)) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
            Err(e) => {
                tracing::warn!(worker_id = %worker_id, error = %e, "claim failed, backing off");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_job(
    worker_id: &str,
    job: Job,
    store: &Arc<dyn RetrievalStore>,
    bus: &Arc<EventBus>,
    handlers: &Arc<HashMap<JobKind, Arc<dyn JobHandler>>>,
    config: &Arc<ResearchConfig>,
    cancellations: &Arc<DashMap<JobId, CancellationToken>>,
    shutdown: &CancellationToken,
) {
    let job_id = job.id;
    let token = CancellationToken::new();
    cancellations.insert(job_id, token.clone());

    let events = EventEmitter {
        store: store.clone(),
        bus: bus.clone(),
        job_id,
    };
    let _ = events
        .emit("job.started", serde_json::json!({"attempt": job.attempt_count}))
        .await;

    if let Err(e) = store.mark_running(job_id, worker_id).await {
        tracing::warn!(job_id = %job_id, error = %e, "lost lease before run started");
        cancellations.remove(&job_id);
        return;
    }

    let heartbeat_handle = {
        let store = store.clone();
        let worker_id = worker_id.to_string();
        let interval = Duration::from_millis(config.heartbeat_interval_ms);
        let lease_ms = config.lease_duration_ms;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.heartbeat(job_id, &worker_id, lease_ms).await {
                    Ok(true) => continue,
                    _ => return,
                }
            }
        })
    };

    let handler = handlers.get(&job.kind).cloned();
    let retry_requested = handler.as_ref().map(|h| h.retry_on_failure()).unwrap_or(false);
    let outcome = match handler {
        None => Err(PipelineError::Provider(format!(
            "no handler registered for job kind {:?}",
            job.kind
        ))),
        Some(handler) => {
            let ctx = JobContext {
                job_id,
                params: job.params.clone(),
                attempt_count: job.attempt_count,
                worker_id: worker_id.to_string(),
                cancellation: token.child_token(),
                events: events.clone(),
            };
            tokio::select! {
                result = handler.handle(ctx) => result,
                _ = token.cancelled() => Err(PipelineError::Canceled { stage: "unknown".to_string() }),
                _ = shutdown.cancelled() => Err(PipelineError::Canceled { stage: "shutdown".to_string() }),
            }
        }
    };

    heartbeat_handle.abort();
    cancellations.remove(&job_id);

    // Publishes the terminal event returned by `finish_job` to the live bus —
    // `None` means a concurrent `request_cancel` already won the race and
    // published its own terminal event, so there's nothing left to send.
    let publish_terminal = |event_type: &'static str, payload: serde_json::Value, event_id: Option<crate::types::EventId>| {
        if let Some(event_id) = event_id {
            bus.publish(
                job_id,
                JobEvent {
                    job_id,
                    event_id,
                    event_type: event_type.to_string(),
                    payload,
                    ts: chrono::Utc::now(),
                },
            );
        }
    };

    match outcome {
        Ok(result) => match store.finish_job(job_id, worker_id, JobStatus::Succeeded, result.clone()).await {
            Ok(event_id) => publish_terminal("job.succeeded", result, event_id),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "failed to record success"),
        },
        Err(PipelineError::Canceled { stage }) => {
            // `finish_job` treats "already canceled by a concurrent
            // request_cancel" as a no-op rather than a lease error, so this
            // is safe to call even if the race already wrote the terminal
            // event.
            let payload = serde_json::json!({"kind": "canceled", "stage": stage});
            if let Ok(event_id) = store
                .finish_job(job_id, worker_id, JobStatus::Canceled, payload.clone())
                .await
            {
                publish_terminal("job.canceled", payload, event_id);
            }
        }
        Err(e) => {
            if retry_requested && job.attempt_count < config.max_retry_attempts {
                tracing::info!(
                    job_id = %job_id,
                    attempt = job.attempt_count,
                    error = %e,
                    "requeueing after failure"
                );
                let _ = store.requeue(job_id).await;
            } else {
                let payload = serde_json::json!({"kind": "failed", "message": e.to_string()});
                if let Ok(event_id) = store
                    .finish_job(job_id, worker_id, JobStatus::Failed, payload.clone())
                    .await
                {
                    publish_terminal("job.failed", payload, event_id);
                }
            }
        }
    }

    bus.retire(job_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteRetrievalStore;
    use crate::types::JobKind;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, ctx: JobContext) -> HandlerOutcome {
            Ok(json!({"echo": ctx.params}))
        }
    }

    struct StallingHandler;

    #[async_trait]
    impl JobHandler for StallingHandler {
        async fn handle(&self, ctx: JobContext) -> HandlerOutcome {
            loop {
                if ctx.cancellation.is_cancelled() {
                    return Err(PipelineError::Canceled {
                        stage: "stalling".to_string(),
                    });
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }

    fn config() -> Arc<ResearchConfig> {
        let mut c = ResearchConfig::default();
        c.heartbeat_interval_ms = 20;
        c.lease_duration_ms = 200;
        Arc::new(c)
    }

    #[tokio::test]
    async fn claimed_job_runs_handler_and_reaches_succeeded() {
        let store: Arc<dyn RetrievalStore> = Arc::new(SqliteRetrievalStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(store.clone(), 64));
        let mut handlers: HashMap<JobKind, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert(JobKind::Research, Arc::new(EchoHandler));

        let pool = WorkerPool::new(store.clone(), bus, handlers, config());
        let job_id = match store
            .insert_job(JobKind::Research, json!({"query": "x"}), "k1", chrono::Duration::hours(1), None)
            .await
            .unwrap()
        {
            crate::store::EnqueueResult::Created(id) => id,
            _ => unreachable!(),
        };

        let handles = pool.spawn();
        for _ in 0..50 {
            if let Some(job) = store.get_job(job_id).await.unwrap() {
                if job.status.is_terminal() {
                    assert_eq!(job.status, JobStatus::Succeeded);
                    pool.shutdown();
                    for h in handles {
                        let _ = h.await;
                    }
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn unknown_job_kind_fails_terminally() {
        let store: Arc<dyn RetrievalStore> = Arc::new(SqliteRetrievalStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(store.clone(), 64));
        let pool = WorkerPool::new(store.clone(), bus, HashMap::new(), config());
        let job_id = match store
            .insert_job(JobKind::Ingest, json!({}), "k2", chrono::Duration::hours(1), None)
            .await
            .unwrap()
        {
            crate::store::EnqueueResult::Created(id) => id,
            _ => unreachable!(),
        };

        let handles = pool.spawn();
        for _ in 0..50 {
            if let Some(job) = store.get_job(job_id).await.unwrap() {
                if job.status.is_terminal() {
                    assert_eq!(job.status, JobStatus::Failed);
                    pool.shutdown();
                    for h in handles {
                        let _ = h.await;
                    }
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn cancel_signals_running_handler() {
        let store: Arc<dyn RetrievalStore> = Arc::new(SqliteRetrievalStore::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(store.clone(), 64));
        let mut handlers: HashMap<JobKind, Arc<dyn JobHandler>> = HashMap::new();
        handlers.insert(JobKind::Research, Arc::new(StallingHandler));
        let pool = Arc::new(WorkerPool::new(store.clone(), bus, handlers, config()));
        let job_id = match store
            .insert_job(JobKind::Research, json!({}), "k3", chrono::Duration::hours(1), None)
            .await
            .unwrap()
        {
            crate::store::EnqueueResult::Created(id) => id,
            _ => unreachable!(),
        };

        let handles = pool.spawn();
        // Give a worker time to claim and register a cancellation token.
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.cancel(job_id);

        for _ in 0..50 {
            if let Some(job) = store.get_job(job_id).await.unwrap() {
                if job.status.is_terminal() {
                    assert_eq!(job.status, JobStatus::Canceled);
                    pool.shutdown();
                    for h in handles {
                        let _ = h.await;
                    }
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("canceled job never reached a terminal state");
    }
}
