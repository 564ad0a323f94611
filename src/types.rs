//! Core data model: Document, Chunk, ChunkMetadata, Embedding, SearchResult.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A single page-attributed element yielded by the document parser adapter (C1).
#[derive(Debug, Clone)]
pub enum ParsedElement {
    TextBlock {
        text: String,
        page_number: usize,
    },
    Table {
        rows: Vec<Vec<String>>,
        header_rows: Vec<Vec<String>>,
        caption: Option<String>,
        page_number: usize,
        continuation_page_numbers: Vec<usize>,
    },
    Heading {
        text: String,
        level: u8,
        page_number: usize,
    },
}

/// Lexical category a chunk's content was classified as during extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    Table,
    Narrative,
    Chart,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Table => "table",
            DataFormat::Narrative => "narrative",
            DataFormat::Chart => "chart",
        }
    }
}

/// Document-level metadata, extracted once per document and cached by fingerprint (C3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub fiscal_period: Option<String>,
    pub company_name: Option<String>,
    pub department_name: Option<String>,
}

/// A document tracked by the system. Identity is the content hash of the source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub path: String,
    pub page_count: usize,
    pub ingested_at: chrono::DateTime<chrono::Utc>,
}

/// The unit of retrieval, owned by exactly one Document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: String,
    pub chunk_ordinal: u32,
    pub text: String,
    pub token_count: usize,
    /// Pages the chunk's source spanned (a single page for most text chunks,
    /// multiple for split tables).
    pub page_numbers: Vec<usize>,
    pub is_table: bool,
    /// e.g. "2 of 5" for the second part of a five-part table split.
    pub table_part: Option<String>,
    pub table_caption: Option<String>,
}

impl Chunk {
    /// Deterministic chunk id derived from (document_hash, chunk_ordinal), per spec §3.
    pub fn derive_id(document_hash: &str, chunk_ordinal: u32) -> Uuid {
        Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{document_hash}:{chunk_ordinal}").as_bytes(),
        )
    }

    pub fn primary_page(&self) -> usize {
        self.page_numbers.first().copied().unwrap_or(0)
    }
}

/// The 14-field structured metadata extracted per chunk (C3). All fields are
/// optional — absence means extraction did not run or did not populate them,
/// never that the value is known to be empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub company_name: Option<String>,
    pub business_unit: Option<String>,
    pub metric_category: Option<String>,
    pub metric_type: Option<String>,
    pub time_period: Option<String>,
    pub geographic_region: Option<String>,
    pub currency: Option<String>,
    pub report_type: Option<String>,
    pub data_format: Option<DataFormat>,
    pub semantic_summary: Option<String>,
    pub key_entities: Vec<String>,
    pub numeric_ranges: HashMap<String, NumericRange>,
    pub fiscal_period: Option<String>,
    pub department_name: Option<String>,
}

impl ChunkMetadata {
    /// Union-merge two metadata records for the same chunk_id, non-null winning
    /// over null; on conflict, `self` (the vector-side payload) takes precedence.
    /// See spec §4.11 "Dedupe".
    pub fn merge(self, other: ChunkMetadata) -> ChunkMetadata {
        ChunkMetadata {
            company_name: self.company_name.or(other.company_name),
            business_unit: self.business_unit.or(other.business_unit),
            metric_category: self.metric_category.or(other.metric_category),
            metric_type: self.metric_type.or(other.metric_type),
            time_period: self.time_period.or(other.time_period),
            geographic_region: self.geographic_region.or(other.geographic_region),
            currency: self.currency.or(other.currency),
            report_type: self.report_type.or(other.report_type),
            data_format: self.data_format.or(other.data_format),
            semantic_summary: self.semantic_summary.or(other.semantic_summary),
            key_entities: if self.key_entities.is_empty() {
                other.key_entities
            } else {
                self.key_entities
            },
            numeric_ranges: if self.numeric_ranges.is_empty() {
                other.numeric_ranges
            } else {
                self.numeric_ranges
            },
            fiscal_period: self.fiscal_period.or(other.fiscal_period),
            department_name: self.department_name.or(other.department_name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: f64,
    pub max: f64,
}

/// A fixed-dimension dense embedding, linked to a Chunk by shared id.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub chunk_id: Uuid,
    pub vector: Vec<f32>,
}

/// Which index a result (or a vote contributing to a fused result) came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultSource {
    Vector,
    Sql,
    Both,
}

impl ResultSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultSource::Vector => "vector",
            ResultSource::Sql => "sql",
            ResultSource::Both => "both",
        }
    }
}

/// Citation attached to every returned result for attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub document_name: String,
    pub page_number: usize,
    pub table_part: Option<String>,
}

/// Transient result of a query, after fusion and attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: Uuid,
    pub text: String,
    pub source: ResultSource,
    pub document_id: String,
    pub page_number: usize,
    pub raw_score: f32,
    pub fused_score: f32,
    pub citation: Citation,
}

/// A degradation/fallback event logged during retrieval, per spec §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegradationReason {
    VectorUnavailable,
    SqlUnavailable,
    SqlEmptyFallback,
    DeadlineExceeded,
}

impl DegradationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationReason::VectorUnavailable => "vector",
            DegradationReason::SqlUnavailable => "sql",
            DegradationReason::SqlEmptyFallback => "sql_empty_fallback",
            DegradationReason::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// Observable outcomes of an ingestion run, per spec §4.8.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub parsed_elements: usize,
    pub text_chunks: usize,
    pub table_chunks: usize,
    pub chunks_with_metadata: usize,
    pub embeddings_generated: usize,
    pub upsert_successes: usize,
    pub total_ms: u64,
    pub parse_ms: u64,
    pub chunk_ms: u64,
    pub metadata_ms: u64,
    pub embed_ms: u64,
    pub upsert_ms: u64,
}

/// Per-query observability record, per spec §4.10.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalTrace {
    pub classification: String,
    pub classifier_version: String,
    pub vector_hits: usize,
    pub sql_hits: usize,
    pub classification_ms: u64,
    pub embed_ms: u64,
    pub vector_search_ms: u64,
    pub sql_search_ms: u64,
    pub fusion_ms: u64,
    pub degraded: Option<DegradationReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_is_deterministic() {
        let a = Chunk::derive_id("abc123", 4);
        let b = Chunk::derive_id("abc123", 4);
        assert_eq!(a, b);
        let c = Chunk::derive_id("abc123", 5);
        assert_ne!(a, c);
    }

    #[test]
    fn metadata_merge_prefers_non_null() {
        let a = ChunkMetadata {
            company_name: Some("Acme".to_string()),
            ..Default::default()
        };
        let b = ChunkMetadata {
            company_name: Some("Other".to_string()),
            time_period: Some("Q3 2025".to_string()),
            ..Default::default()
        };
        let merged = a.merge(b);
        assert_eq!(merged.company_name.as_deref(), Some("Acme"));
        assert_eq!(merged.time_period.as_deref(), Some("Q3 2025"));
    }
}
