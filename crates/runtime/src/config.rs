//! Configuration for the research server.
//!
//! Mirrors the runtime's original configuration module: a single struct
//! assembled by [`ResearchConfig::from_env`], optionally loaded from a TOML
//! file via [`ResearchConfig::from_file`], and checked by [`ResearchConfig::validate`]
//! before the server starts serving.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::ConfigError;

/// Tunables for the research server. All fields have sane defaults;
/// environment variables override them field by field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    pub worker_count: usize,
    pub heartbeat_interval_ms: u64,
    pub lease_duration_ms: u64,
    pub job_ttl_secs: u64,
    pub max_retry_attempts: u32,
    pub reap_interval_secs: u64,

    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    pub cache_similarity_threshold: f32,
    pub cache_prune_interval_secs: u64,

    pub bm25_k1: f32,
    pub bm25_b: f32,
    pub retrieval_weight_bm25: f32,
    pub retrieval_weight_vector: f32,

    pub llm_call_timeout_secs: u64,
    pub fingerprint_key_length: usize,
    pub event_ring_capacity: usize,

    pub max_agents: usize,
    pub research_parallelism: usize,

    pub sqlite_path: PathBuf,
    pub log_level: String,

    /// Optional bearer token required by the HTTP/WebSocket transports.
    /// stdio is implicitly trusted (same-process parent).
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,

    pub http_host: String,
    pub http_port: u16,

    pub embedding_provider: String,
    pub embedding_api_base_url: Option<String>,
    pub embedding_model: Option<String>,

    /// Indexed document content is truncated to this many characters before
    /// storage (SPEC_FULL.md §3 Indexed Document).
    pub index_max_content_chars: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            heartbeat_interval_ms: 2_000,
            lease_duration_ms: 30_000,
            job_ttl_secs: 3_600,
            max_retry_attempts: 3,
            reap_interval_secs: 600,

            cache_ttl_secs: 3_600,
            cache_max_entries: 10_000,
            cache_similarity_threshold: 0.85,
            cache_prune_interval_secs: 300,

            bm25_k1: 1.2,
            bm25_b: 0.75,
            retrieval_weight_bm25: 0.7,
            retrieval_weight_vector: 0.3,

            llm_call_timeout_secs: 120,
            fingerprint_key_length: 16,
            event_ring_capacity: 512,

            max_agents: 5,
            research_parallelism: 4,

            sqlite_path: Self::default_sqlite_path(),
            log_level: "info".to_string(),

            auth_token: None,
            http_host: "127.0.0.1".to_string(),
            http_port: 8090,

            embedding_provider: "mock".to_string(),
            embedding_api_base_url: None,
            embedding_model: None,

            index_max_content_chars: 8_000,
        }
    }
}

impl ResearchConfig {
    /// Default database path: `$XDG_DATA_HOME/symbi-research/research.db`
    pub fn default_sqlite_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("symbi-research").join("research.db")
    }

    /// Load configuration from environment variables layered over defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(v) = env::var("WORKER_COUNT") {
            config.worker_count = parse_env("WORKER_COUNT", &v)?;
        }
        if let Ok(v) = env::var("HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval_ms = parse_env("HEARTBEAT_INTERVAL_MS", &v)?;
        }
        if let Ok(v) = env::var("LEASE_DURATION_MS") {
            config.lease_duration_ms = parse_env("LEASE_DURATION_MS", &v)?;
        }
        if let Ok(v) = env::var("JOB_TTL_SECS") {
            config.job_ttl_secs = parse_env("JOB_TTL_SECS", &v)?;
        }
        if let Ok(v) = env::var("MAX_RETRY_ATTEMPTS") {
            config.max_retry_attempts = parse_env("MAX_RETRY_ATTEMPTS", &v)?;
        }
        if let Ok(v) = env::var("REAP_INTERVAL_SECS") {
            config.reap_interval_secs = parse_env("REAP_INTERVAL_SECS", &v)?;
        }
        if let Ok(v) = env::var("CACHE_TTL_SECS") {
            config.cache_ttl_secs = parse_env("CACHE_TTL_SECS", &v)?;
        }
        if let Ok(v) = env::var("CACHE_MAX_ENTRIES") {
            config.cache_max_entries = parse_env("CACHE_MAX_ENTRIES", &v)?;
        }
        if let Ok(v) = env::var("CACHE_SIMILARITY_THRESHOLD") {
            config.cache_similarity_threshold = parse_env("CACHE_SIMILARITY_THRESHOLD", &v)?;
        }
        if let Ok(v) = env::var("BM25_K1") {
            config.bm25_k1 = parse_env("BM25_K1", &v)?;
        }
        if let Ok(v) = env::var("BM25_B") {
            config.bm25_b = parse_env("BM25_B", &v)?;
        }
        if let Ok(v) = env::var("RETRIEVAL_WEIGHT_BM25") {
            config.retrieval_weight_bm25 = parse_env("RETRIEVAL_WEIGHT_BM25", &v)?;
        }
        if let Ok(v) = env::var("RETRIEVAL_WEIGHT_VECTOR") {
            config.retrieval_weight_vector = parse_env("RETRIEVAL_WEIGHT_VECTOR", &v)?;
        }
        if let Ok(v) = env::var("LLM_CALL_TIMEOUT_SECS") {
            config.llm_call_timeout_secs = parse_env("LLM_CALL_TIMEOUT_SECS", &v)?;
        }
        if let Ok(v) = env::var("FINGERPRINT_KEY_LENGTH") {
            config.fingerprint_key_length = parse_env("FINGERPRINT_KEY_LENGTH", &v)?;
        }
        if let Ok(v) = env::var("EVENT_RING_CAPACITY") {
            config.event_ring_capacity = parse_env("EVENT_RING_CAPACITY", &v)?;
        }
        if let Ok(v) = env::var("MAX_RESEARCH_AGENTS") {
            config.max_agents = parse_env("MAX_RESEARCH_AGENTS", &v)?;
        }
        if let Ok(v) = env::var("RESEARCH_PARALLELISM") {
            config.research_parallelism = parse_env("RESEARCH_PARALLELISM", &v)?;
        }
        if let Ok(v) = env::var("SQLITE_PATH") {
            config.sqlite_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("LOG_LEVEL").or_else(|_| env::var("RUST_LOG")) {
            config.log_level = v;
        }
        if let Ok(v) = env::var("HTTP_HOST") {
            config.http_host = v;
        }
        if let Ok(v) = env::var("HTTP_PORT") {
            config.http_port = parse_env("HTTP_PORT", &v)?;
        }
        if let Ok(token) = env::var("RESEARCH_AUTH_TOKEN") {
            match Self::validate_auth_token(&token) {
                Ok(validated) => config.auth_token = Some(validated),
                Err(e) => {
                    tracing::error!("invalid RESEARCH_AUTH_TOKEN: {}", e);
                    return Err(e);
                }
            }
        }
        if let Ok(v) = env::var("EMBEDDING_PROVIDER") {
            config.embedding_provider = v;
        }
        if let Ok(v) = env::var("EMBEDDING_API_BASE_URL") {
            config.embedding_api_base_url = Some(v);
        }
        if let Ok(v) = env::var("EMBEDDING_MODEL") {
            config.embedding_model = Some(v);
        }
        if let Ok(v) = env::var("INDEX_MAX_CONTENT_CHARS") {
            config.index_max_content_chars = parse_env("INDEX_MAX_CONTENT_CHARS", &v)?;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file, bypassing environment overlay.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject out-of-range tunables before the server starts serving.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "worker_count".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if self.lease_duration_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "lease_duration_ms".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if self.heartbeat_interval_ms == 0 || self.heartbeat_interval_ms >= self.lease_duration_ms
        {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_interval_ms".to_string(),
                reason: "must be > 0 and less than lease_duration_ms".to_string(),
            });
        }
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        let level = self
            .log_level
            .split(',')
            .next()
            .unwrap_or(&self.log_level);
        if !valid_levels.contains(&level) {
            return Err(ConfigError::InvalidValue {
                key: "log_level".to_string(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }
        if !(0.0..=1.0).contains(&self.cache_similarity_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "cache_similarity_threshold".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.bm25_b) {
            return Err(ConfigError::InvalidValue {
                key: "bm25_b".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if self.bm25_k1 < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "bm25_k1".to_string(),
                reason: "must be >= 0".to_string(),
            });
        }
        if self.retrieval_weight_bm25 < 0.0 || self.retrieval_weight_vector < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "retrieval_weight".to_string(),
                reason: "weights must be non-negative".to_string(),
            });
        }
        if self.max_agents == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_agents".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if self.research_parallelism == 0 {
            return Err(ConfigError::InvalidValue {
                key: "research_parallelism".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        if self.index_max_content_chars == 0 {
            return Err(ConfigError::InvalidValue {
                key: "index_max_content_chars".to_string(),
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Validate an authentication token for security best practices.
    ///
    /// Rejects empty, too-short (< 8 chars), and known weak/default tokens.
    /// Returns the trimmed token on success.
    fn validate_auth_token(token: &str) -> Result<String, ConfigError> {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "auth_token".to_string(),
                reason: "token cannot be empty".to_string(),
            });
        }
        let weak_tokens = [
            "dev", "test", "password", "secret", "token", "api_key", "12345678", "admin", "root",
            "default", "changeme", "letmein", "qwerty", "abc123", "password123",
        ];
        if weak_tokens.contains(&trimmed.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "auth_token".to_string(),
                reason: format!("'{trimmed}' is a known weak/default token"),
            });
        }
        if trimmed.len() < 8 {
            return Err(ConfigError::InvalidValue {
                key: "auth_token".to_string(),
                reason: "token must be at least 8 characters".to_string(),
            });
        }
        Ok(trimmed.to_string())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("could not parse '{value}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_pass_validation() {
        let config = ResearchConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn from_env_overrides_worker_count() {
        std::env::set_var("WORKER_COUNT", "8");
        let config = ResearchConfig::from_env().unwrap();
        assert_eq!(config.worker_count, 8);
        std::env::remove_var("WORKER_COUNT");
    }

    #[test]
    #[serial]
    fn from_env_rejects_weak_auth_token() {
        std::env::set_var("RESEARCH_AUTH_TOKEN", "password");
        let result = ResearchConfig::from_env();
        assert!(result.is_err());
        std::env::remove_var("RESEARCH_AUTH_TOKEN");
    }

    #[test]
    #[serial]
    fn from_env_accepts_strong_auth_token() {
        std::env::set_var("RESEARCH_AUTH_TOKEN", "a-sufficiently-random-token-value");
        let config = ResearchConfig::from_env().unwrap();
        assert_eq!(
            config.auth_token.as_deref(),
            Some("a-sufficiently-random-token-value")
        );
        std::env::remove_var("RESEARCH_AUTH_TOKEN");
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = ResearchConfig::default();
        config.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_similarity_threshold_out_of_range() {
        let mut config = ResearchConfig::default();
        config.cache_similarity_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_heartbeat_not_less_than_lease() {
        let mut config = ResearchConfig::default();
        config.heartbeat_interval_ms = config.lease_duration_ms;
        assert!(config.validate().is_err());
    }
}
