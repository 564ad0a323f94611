//! MCP-style tool surface.
//!
//! Plain serde request/response structs for the two tool operations
//! spec.md §6 names (ingest, query), plus a dispatcher over
//! `wiring::RagLiteSystem`. The transport (stdio framing, JSON-RPC, …) is
//! out of scope here and left to the binary entry point; this module only
//! defines the envelope shape and strips adapter-layer error detail down
//! to a category + message before it reaches a caller, per spec.md §7
//! "Propagation policy".

use crate::error::RagLiteError;
use crate::query::classifier::Classification;
use crate::types::{IngestOutcome, RetrievalTrace, SearchResult};
use crate::wiring::RagLiteSystem;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub outcome: IngestOutcome,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filters: Option<HashMap<String, String>>,
    #[serde(default)]
    pub classification_override: Option<Classification>,
}

/// Per-index hit counts, surfaced alongside the hydrated results so a
/// caller can tell a hybrid answer from a degraded single-index one
/// without reading the full `trace`.
#[derive(Debug, Serialize)]
pub struct IndexHits {
    pub vector: usize,
    pub sql: usize,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub retrieval_ms: u64,
    pub classification: String,
    pub index_hits: IndexHits,
    pub trace: RetrievalTrace,
}

/// Uniform error shape surfaced to a tool caller instead of a raw
/// `RagLiteError` — callers see a stable category and a human-readable
/// message, never the adapter-level error chain.
#[derive(Debug, Serialize)]
pub struct ToolError {
    pub category: String,
    pub message: String,
}

impl From<&RagLiteError> for ToolError {
    fn from(err: &RagLiteError) -> Self {
        Self {
            category: err.category().to_string(),
            message: err.to_string(),
        }
    }
}

pub async fn handle_ingest(
    system: &RagLiteSystem,
    request: IngestRequest,
) -> Result<IngestResponse, ToolError> {
    system
        .ingest
        .ingest(&request.path)
        .await
        .map(|outcome| IngestResponse { outcome })
        .map_err(|e| ToolError::from(&e))
}

pub async fn handle_query(
    system: &RagLiteSystem,
    request: QueryRequest,
) -> Result<QueryResponse, ToolError> {
    let retrieval_start = std::time::Instant::now();
    system
        .query
        .retrieve(
            &request.query,
            request.top_k,
            request.filters.as_ref(),
            request.classification_override,
        )
        .await
        .map(|(results, trace)| QueryResponse {
            query: request.query,
            retrieval_ms: retrieval_start.elapsed().as_millis() as u64,
            classification: trace.classification.clone(),
            index_hits: IndexHits {
                vector: trace.vector_hits,
                sql: trace.sql_hits,
            },
            results,
            trace,
        })
        .map_err(|e| ToolError::from(&e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_carries_category_and_message() {
        let err = RagLiteError::NotFound("doc-123".to_string());
        let tool_err = ToolError::from(&err);
        assert_eq!(tool_err.category, "not_found");
        assert!(tool_err.message.contains("doc-123"));
    }
}
