//! C4 — Embedder.
//!
//! A single, shared, long-lived `reqwest::Client` talks to an external
//! embedding service for the lifetime of the process — never constructed
//! per call, the anti-pattern this module's contract explicitly forbids.
//! Batches are embedded in one request where the service allows it; a chunk
//! whose individual embedding fails (rather than the whole batch) is marked
//! with a zero vector so ingestion can proceed without it blocking on a
//! single bad chunk, and the caller can still detect it via `is_zero()`.

use crate::error::EmbeddingError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of passages, preserving order and count: the output
    /// `Vec` always has exactly `texts.len()` entries. An entry whose
    /// embedding could not be produced is a zero vector of `dimension()`
    /// length rather than an absence, so callers never have to reconcile a
    /// shorter output against the input batch.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    /// Embed a single query string (same model, no batching overhead).
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn dimension(&self) -> usize;
}

pub fn is_zero(vector: &[f32]) -> bool {
    vector.iter().all(|&x| x == 0.0)
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Serialize)]
struct EmbedQueryRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponseItem {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedResponseItem>,
}

/// External-service-backed embedder: one `reqwest::Client` built once at
/// wiring time and held across every call, matching this engine's own
/// long-lived external-provider client pattern.
pub struct ExternalEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    batch_size: usize,
}

impl ExternalEmbedder {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        dimension: usize,
        batch_size: usize,
        timeout_s: u64,
    ) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(timeout_s))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            model,
            dimension,
            batch_size,
        })
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, EmbeddingError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EmbeddingError::RequestFailed(e.to_string()))?;
        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(EmbeddingError::RequestFailed(format!(
                "embedding service returned HTML instead of JSON (HTTP {}): {}",
                status, preview
            )));
        }
        serde_json::from_str::<T>(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            EmbeddingError::RequestFailed(format!(
                "failed to parse embedding response (HTTP {}): {}. Body: {}",
                status, e, preview
            ))
        })
    }

    async fn embed_raw(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut request = self.client.post(&self.endpoint).json(&EmbedRequest {
            input: texts,
            model: &self.model,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let parsed: EmbedResponse = Self::parse_json(response).await?;

        if parsed.data.len() != texts.len() {
            return Err(EmbeddingError::RequestFailed(format!(
                "embedding service returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }

        for item in &parsed.data {
            if item.embedding.len() != self.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension,
                    actual: item.embedding.len(),
                });
            }
        }

        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[async_trait]
impl Embedder for ExternalEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size.max(1)) {
            match self.embed_raw(batch).await {
                Ok(vectors) => out.extend(vectors),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        batch_size = batch.len(),
                        "embedding batch failed; falling back to zero vectors for this batch"
                    );
                    out.extend(std::iter::repeat(vec![0.0; self.dimension]).take(batch.len()));
                }
            }
        }

        Ok(out)
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut request = self.client.post(&self.endpoint).json(&EmbedQueryRequest {
            input: text,
            model: &self.model,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let parsed: EmbedResponse = Self::parse_json(response).await?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| EmbeddingError::RequestFailed("empty embedding response".into()))?;

        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Fixed-vector test double so downstream components never need a live
/// embedding service under test.
pub struct NullEmbedder {
    dimension: usize,
}

impl NullEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for NullEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|_| vec![0.1; self.dimension]).collect())
    }

    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(vec![0.1; self.dimension])
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_embedder_preserves_batch_order_and_count() {
        let embedder = NullEmbedder::new(8);
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), texts.len());
        assert!(vectors.iter().all(|v| v.len() == 8));
    }

    #[test]
    fn is_zero_detects_all_zero_vectors() {
        assert!(is_zero(&[0.0, 0.0, 0.0]));
        assert!(!is_zero(&[0.0, 0.1, 0.0]));
    }
}
