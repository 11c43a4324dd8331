//! Embedding Provider (SPEC_FULL.md §4.2).
//!
//! Grounded in the runtime's original `context/embedding.rs` and
//! `context/vector_db.rs`: environment-variable provider selection with a
//! deterministic mock fallback so the rest of the system runs offline.
//! Unlike the teacher (which let dimension vary by provider), this
//! implementation fixes the dimension at [`EMBEDDING_DIM`] for every
//! provider; a provider that would return a different dimension is
//! rejected eagerly.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::types::{Embedding, StoreError, EMBEDDING_DIM};

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Embedding, StoreError>;

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Embedding>, StoreError> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

fn check_dimension(v: &Embedding) -> Result<(), StoreError> {
    if v.len() != EMBEDDING_DIM {
        return Err(StoreError::EmbeddingDimensionMismatch {
            expected: EMBEDDING_DIM,
            actual: v.len(),
        });
    }
    Ok(())
}

/// Deterministic, hash-derived embedding used when no remote provider is
/// configured. Two calls with the same text produce the same vector.
pub struct MockEmbeddingProvider;

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Embedding, StoreError> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();

        let mut embedding = vec![0.0f32; EMBEDDING_DIM];
        for (i, val) in embedding.iter_mut().enumerate() {
            let byte = digest[i % digest.len()];
            *val = (byte as f32 / 255.0) * 2.0 - 1.0;
        }
        let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for v in &mut embedding {
                *v /= magnitude;
            }
        }
        Ok(embedding)
    }
}

/// HTTP-backed provider talking to a local or cloud embeddings endpoint
/// (e.g. an Ollama-compatible `/api/embeddings` or an OpenAI-compatible
/// `/v1/embeddings`). Selected via `EMBEDDING_PROVIDER`/`EMBEDDING_API_BASE_URL`/
/// `EMBEDDING_MODEL`.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            model,
            api_key,
        }
    }
}

#[derive(serde::Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(serde::Deserialize)]
struct OpenAiStyleResponse {
    data: Vec<OpenAiStyleEmbedding>,
}

#[derive(serde::Deserialize)]
struct OpenAiStyleEmbedding {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Embedding, StoreError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let mut request = self.client.post(&url).json(&EmbeddingRequest {
            model: &self.model,
            input: text,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transient(format!("embedding request failed: {e}")))?;
        let parsed: OpenAiStyleResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Fatal(format!("malformed embedding response: {e}")))?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Fatal("embedding response had no data".to_string()))?
            .embedding;
        check_dimension(&embedding)?;
        Ok(embedding)
    }
}

/// Resolve the configured provider, falling back to the deterministic mock
/// when no remote endpoint is configured.
pub fn resolve_provider(
    provider: &str,
    base_url: Option<&str>,
    model: Option<&str>,
) -> Box<dyn EmbeddingProvider> {
    match provider {
        "http" | "ollama" | "openai" => Box::new(HttpEmbeddingProvider::new(
            base_url.unwrap_or("http://localhost:11434/api").to_string(),
            model.unwrap_or("nomic-embed-text").to_string(),
            std::env::var("EMBEDDING_API_KEY").ok(),
        )),
        _ => Box::new(MockEmbeddingProvider),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedding_has_fixed_dimension() {
        let provider = MockEmbeddingProvider;
        let v = provider.embed("hello world").await.unwrap();
        assert_eq!(v.len(), EMBEDDING_DIM);
    }

    #[tokio::test]
    async fn mock_embedding_is_deterministic() {
        let provider = MockEmbeddingProvider;
        let a = provider.embed("hello world").await.unwrap();
        let b = provider.embed("hello world").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn mock_embedding_differs_across_inputs() {
        let provider = MockEmbeddingProvider;
        let a = provider.embed("hello").await.unwrap();
        let b = provider.embed("world").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn mock_embedding_batches_preserve_order() {
        let provider = MockEmbeddingProvider;
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let batch = provider.embed_many(&texts).await.unwrap();
        for (text, vector) in texts.iter().zip(batch.iter()) {
            assert_eq!(vector, &provider.embed(text).await.unwrap());
        }
    }
}
