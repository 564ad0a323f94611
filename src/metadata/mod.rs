//! C3 — Metadata Extractor.
//!
//! LLM-backed structured metadata extraction, gated by a bounded semaphore so
//! ingesting a large document never opens more than `concurrency` concurrent
//! requests against the metadata service — the same connection-pool shape
//! used elsewhere in this codebase for rate-limiting a shared backend.
//! Document-level metadata is extracted once per document and cached by
//! content fingerprint for the life of the process; chunk-level metadata is
//! extracted per chunk and degrades gracefully (all fields absent) rather
//! than failing ingestion when the service is unavailable or a chunk
//! exhausts its retries.

use crate::error::MetadataError;
use crate::types::{ChunkMetadata, DataFormat, DocumentMetadata, NumericRange};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Bounds concurrent in-flight metadata-extraction requests. Mirrors the
/// `OllamaConnectionPool`/`ConnectionPermit` pattern: a permit is held for the
/// duration of one extraction call and releases itself on drop.
struct ExtractionGate {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
}

impl ExtractionGate {
    fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
        }
    }

    async fn acquire(&self) -> ExtractionPermit {
        let available = self.semaphore.available_permits();
        if available == 0 {
            warn!(
                max_concurrency = self.max_concurrency,
                "metadata extraction gate saturated, waiting for a free slot"
            );
        }
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        debug!(
            in_flight = self.max_concurrency - self.semaphore.available_permits(),
            max_concurrency = self.max_concurrency,
            "acquired metadata extraction permit"
        );
        ExtractionPermit {
            _permit: permit,
            max_concurrency: self.max_concurrency,
            semaphore: self.semaphore.clone(),
        }
    }
}

struct ExtractionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
    max_concurrency: usize,
    semaphore: Arc<Semaphore>,
}

impl Drop for ExtractionPermit {
    fn drop(&mut self) {
        debug!(
            in_flight = self.max_concurrency - self.semaphore.available_permits(),
            max_concurrency = self.max_concurrency,
            "released metadata extraction permit"
        );
    }
}

#[derive(Deserialize)]
struct ChunkMetadataResponse {
    company_name: Option<String>,
    business_unit: Option<String>,
    metric_category: Option<String>,
    metric_type: Option<String>,
    time_period: Option<String>,
    geographic_region: Option<String>,
    currency: Option<String>,
    report_type: Option<String>,
    data_format: Option<String>,
    semantic_summary: Option<String>,
    #[serde(default)]
    key_entities: Vec<String>,
    #[serde(default)]
    numeric_ranges: HashMap<String, NumericRange>,
    fiscal_period: Option<String>,
    department_name: Option<String>,
}

impl From<ChunkMetadataResponse> for ChunkMetadata {
    fn from(r: ChunkMetadataResponse) -> Self {
        ChunkMetadata {
            company_name: r.company_name,
            business_unit: r.business_unit,
            metric_category: r.metric_category,
            metric_type: r.metric_type,
            time_period: r.time_period,
            geographic_region: r.geographic_region,
            currency: r.currency,
            report_type: r.report_type,
            data_format: r.data_format.and_then(|s| match s.as_str() {
                "table" => Some(DataFormat::Table),
                "narrative" => Some(DataFormat::Narrative),
                "chart" => Some(DataFormat::Chart),
                _ => None,
            }),
            semantic_summary: r.semantic_summary,
            key_entities: r.key_entities,
            numeric_ranges: r.numeric_ranges,
            fiscal_period: r.fiscal_period,
            department_name: r.department_name,
        }
    }
}

#[derive(Deserialize)]
struct DocumentMetadataResponse {
    fiscal_period: Option<String>,
    company_name: Option<String>,
    department_name: Option<String>,
}

impl From<DocumentMetadataResponse> for DocumentMetadata {
    fn from(r: DocumentMetadataResponse) -> Self {
        DocumentMetadata {
            fiscal_period: r.fiscal_period,
            company_name: r.company_name,
            department_name: r.department_name,
        }
    }
}

/// LLM-backed extractor for both document-level and chunk-level metadata.
pub struct MetadataExtractor {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    gate: ExtractionGate,
    timeout: Duration,
    retries: u32,
    document_cache: DashMap<String, DocumentMetadata>,
}

impl MetadataExtractor {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        concurrency: usize,
        timeout_s: u64,
        retries: u32,
    ) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(timeout_s))
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(MetadataError::Http)?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            model,
            gate: ExtractionGate::new(concurrency.max(1)),
            timeout: Duration::from_secs(timeout_s),
            retries,
            document_cache: DashMap::new(),
        })
    }

    /// Extract document-level metadata once per document, cached by content
    /// fingerprint for the life of the process (cold on restart).
    pub async fn extract_document_metadata(
        &self,
        document_hash: &str,
        sample_text: &str,
    ) -> DocumentMetadata {
        if let Some(cached) = self.document_cache.get(document_hash) {
            return cached.clone();
        }

        let prompt = format!(
            "Extract the fiscal period, company name, and department name from this \
             financial document excerpt. Respond as JSON with keys fiscal_period, \
             company_name, department_name (null if unknown):\n\n{}",
            truncate(sample_text, 4000)
        );

        let result = self
            .call_with_retries::<DocumentMetadataResponse>(&prompt)
            .await;

        let metadata = match result {
            Ok(r) => r.into(),
            Err(err) => {
                warn!(
                    document_hash,
                    error = %err,
                    "document metadata extraction failed; proceeding with empty metadata"
                );
                DocumentMetadata::default()
            }
        };

        self.document_cache
            .insert(document_hash.to_string(), metadata.clone());
        metadata
    }

    /// Extract chunk-level metadata. On exhausted retries this degrades
    /// gracefully to an all-`None`/empty `ChunkMetadata` rather than failing
    /// the chunk — it remains searchable via vector and BM25, just absent
    /// from metadata-filtered SQL queries.
    pub async fn extract_chunk_metadata(&self, text: &str) -> ChunkMetadata {
        let _permit = self.gate.acquire().await;

        let prompt = format!(
            "Extract structured financial metadata from this document chunk as JSON \
             with keys company_name, business_unit, metric_category, metric_type, \
             time_period, geographic_region, currency, report_type, data_format \
             (one of \"table\", \"narrative\", \"chart\"), semantic_summary, \
             key_entities (array of strings), numeric_ranges (object of \
             {{name: {{min, max}}}}), fiscal_period, department_name. Use null for \
             anything not present in the text:\n\n{}",
            truncate(text, 4000)
        );

        match self.call_with_retries::<ChunkMetadataResponse>(&prompt).await {
            Ok(r) => r.into(),
            Err(err) => {
                warn!(error = %err, "chunk metadata extraction failed; storing chunk with empty metadata");
                ChunkMetadata::default()
            }
        }
    }

    async fn call_with_retries<T: serde::de::DeserializeOwned>(
        &self,
        prompt: &str,
    ) -> Result<T, MetadataError> {
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(self.timeout, self.call_once::<T>(prompt)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) if attempt < self.retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "metadata extraction call failed, retrying");
                }
                Ok(Err(err)) => return Err(err),
                Err(_) if attempt < self.retries => {
                    attempt += 1;
                    warn!(attempt, "metadata extraction call timed out, retrying");
                }
                Err(_) => return Err(MetadataError::Timeout(self.timeout.as_secs())),
            }
        }
    }

    async fn call_once<T: serde::de::DeserializeOwned>(&self, prompt: &str) -> Result<T, MetadataError> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "response_format": {"type": "json_object"},
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MetadataError::RequestFailed(e.to_string()))?;

        let trimmed = text.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(MetadataError::InvalidResponse(format!(
                "metadata service returned HTML instead of JSON (HTTP {}): {}",
                status, preview
            )));
        }

        serde_json::from_str(&text).map_err(|e| {
            let preview: String = text.chars().take(300).collect();
            MetadataError::InvalidResponse(format!(
                "failed to parse metadata response (HTTP {}): {}. Body: {}",
                status, e, preview
            ))
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extraction_gate_releases_permit_on_drop() {
        let gate = ExtractionGate::new(1);
        let permit = gate.acquire().await;
        assert_eq!(gate.semaphore.available_permits(), 0);
        drop(permit);
        assert_eq!(gate.semaphore.available_permits(), 1);
    }

    #[test]
    fn truncate_is_char_boundary_safe_and_bounded() {
        let long = "a".repeat(5000);
        assert_eq!(truncate(&long, 4000).chars().count(), 4000);
        assert_eq!(truncate("short", 4000), "short");
    }
}
