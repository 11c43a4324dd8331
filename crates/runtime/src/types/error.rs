//! Error taxonomy for the research server.
//!
//! Mirrors the runtime's original composition pattern: one top-level enum
//! aggregating per-subsystem error enums via `#[from]`, so call sites can
//! propagate with `?` regardless of which layer failed.

use thiserror::Error;

use crate::types::{JobId, ReportId};

/// Top-level error type returned by public APIs.
#[derive(Error, Debug, Clone)]
pub enum ResearchError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transient error, retry: {0}")]
    Transient(String),

    #[error("canceled")]
    Canceled,

    #[error("partial failure: {succeeded}/{attempted} sub-queries succeeded")]
    PartialFailure { succeeded: usize, attempted: usize },

    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("event bus error: {0}")]
    Bus(#[from] BusError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl ResearchError {
    /// Whether a caller may retry this error as-is (as opposed to surfacing
    /// it to the client immediately).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResearchError::Transient(_) | ResearchError::Store(StoreError::Transient(_))
        )
    }
}

/// Retrieval Store errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("fatal storage error: {0}")]
    Fatal(String),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("report not found: {0}")]
    ReportNotFound(ReportId),

    #[error("idempotency key conflict: {0}")]
    KeyConflict(String),

    #[error("lease no longer held by worker {worker_id} for job {job_id}")]
    LeaseLost { job_id: JobId, worker_id: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimensionMismatch { expected: usize, actual: usize },
}

/// Cache Layer errors.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("build for fingerprint {0} failed: {1}")]
    BuildFailed(String, String),

    #[error("single-flight wait interrupted for fingerprint {0}")]
    WaitInterrupted(String),
}

/// Event Bus errors.
#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("subscriber queue full, disconnected: job {0}")]
    SubscriberSlow(JobId),

    #[error("unknown job for subscription: {0}")]
    UnknownJob(JobId),
}

/// Research Pipeline errors.
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("planning stage failed: {0}")]
    PlanFailed(String),

    #[error("synthesis stage failed: {0}")]
    SynthesisFailed(String),

    #[error("partial failure: {succeeded}/{attempted} sub-queries succeeded")]
    PartialFailure { succeeded: usize, attempted: usize },

    #[error("canceled during stage {stage}")]
    Canceled { stage: String },

    #[error("llm provider error: {0}")]
    Provider(String),
}

/// Job API & Dispatch errors.
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("schema validation failed for {kind}: {reason}")]
    SchemaValidation { kind: String, reason: String },

    #[error("unknown job kind: {0}")]
    UnknownKind(String),

    #[error("invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),
}

/// Transport Adapter errors.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("stream closed")]
    StreamClosed,
}

/// Configuration errors.
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("failed to read configuration file: {0}")]
    Io(String),

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

pub type ResearchResult<T> = Result<T, ResearchError>;
