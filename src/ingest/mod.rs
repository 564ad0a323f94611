//! C8 — Ingestion Orchestrator.
//!
//! Wires C1→C2→C3→C4→C5+C6+C7: parse, chunk, extract metadata (document-level
//! serialized and cached, then chunk-level concurrent through the shared
//! client's own semaphore), embed in batches, then upsert all three stores
//! in parallel. Only after every upsert for the new document id has
//! succeeded does the orchestrator delete the chunk set it superseded, so a
//! failed ingest leaves the previous, working document set untouched.
//!
//! Document identity is the content hash of the source bytes (spec §3), but
//! "re-ingesting a document" in the operational sense spec.md describes
//! (same path, new content fully replaces the old chunk set) requires a
//! stable handle that survives a content change. The `documents` table in
//! the structured store tracks path → current document id so a re-ingest of
//! the same path can find and purge the document id it is superseding, even
//! though that id differs from the new one.

use crate::chunking::{ChunkDraft, Chunker};
use crate::embedding::{is_zero, Embedder};
use crate::error::RagLiteError;
use crate::index::bm25::Bm25Index;
use crate::metadata::MetadataExtractor;
use crate::parsing::DocumentParserAdapter;
use crate::storage::structured::StructuredStore;
use crate::storage::vector::{VectorRecord, VectorStore};
use crate::types::{Chunk, ChunkMetadata, IngestOutcome};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Content fingerprint used as Document identity (spec §3) and as the seed
/// for deterministic chunk ids.
pub fn document_fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{:x}", digest)
}

fn chunk_draft_to_chunk(draft: &ChunkDraft, document_id: &str, ordinal: u32) -> Chunk {
    Chunk {
        id: Chunk::derive_id(document_id, ordinal),
        document_id: document_id.to_string(),
        chunk_ordinal: ordinal,
        text: draft.text.clone(),
        token_count: draft.token_count,
        page_numbers: draft.page_numbers.clone(),
        is_table: draft.is_table,
        table_part: draft.table_part.clone(),
        table_caption: draft.table_caption.clone(),
    }
}

fn has_any_field(meta: &ChunkMetadata) -> bool {
    meta.company_name.is_some()
        || meta.business_unit.is_some()
        || meta.metric_category.is_some()
        || meta.metric_type.is_some()
        || meta.time_period.is_some()
        || meta.geographic_region.is_some()
        || meta.currency.is_some()
        || meta.report_type.is_some()
        || meta.data_format.is_some()
        || meta.semantic_summary.is_some()
        || !meta.key_entities.is_empty()
        || !meta.numeric_ranges.is_empty()
        || meta.fiscal_period.is_some()
        || meta.department_name.is_some()
}

pub struct IngestionOrchestrator {
    parser: Arc<dyn DocumentParserAdapter>,
    chunker: Chunker,
    metadata: Arc<MetadataExtractor>,
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<VectorStore>,
    structured_store: Arc<StructuredStore>,
    bm25: Arc<Bm25Index>,
}

impl IngestionOrchestrator {
    pub fn new(
        parser: Arc<dyn DocumentParserAdapter>,
        chunker: Chunker,
        metadata: Arc<MetadataExtractor>,
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<VectorStore>,
        structured_store: Arc<StructuredStore>,
        bm25: Arc<Bm25Index>,
    ) -> Self {
        Self {
            parser,
            chunker,
            metadata,
            embedder,
            vector_store,
            structured_store,
            bm25,
        }
    }

    /// Replace whatever chunk set `path` previously pointed at, if the new
    /// document id differs from it, across all three stores.
    async fn supersede_previous(&self, path_key: &str, document_id: &str) {
        if let Ok(Some(previous_id)) = self.structured_store.previous_document_id(path_key).await {
            if previous_id != document_id {
                info!(
                    previous_id = %previous_id,
                    document_id = %document_id,
                    path = %path_key,
                    "re-ingest supersedes previous chunk set"
                );
                let _ = self.vector_store.delete_by_document(&previous_id).await;
                let _ = self.structured_store.delete_by_document(&previous_id).await;
                let _ = self.bm25.delete_by_document(&previous_id);
            }
        }
    }

    pub async fn ingest(&self, path: &Path) -> Result<IngestOutcome, RagLiteError> {
        let total_start = Instant::now();
        let path_key = path.display().to_string();

        let bytes = std::fs::read(path)?;
        let document_id = document_fingerprint(&bytes);

        // --- Parse (C1) ---
        let parse_start = Instant::now();
        let elements = self.parser.parse(path)?;
        let parse_ms = parse_start.elapsed().as_millis() as u64;
        let parsed_elements = elements.len();
        let page_count = elements
            .iter()
            .map(|e| match e {
                crate::types::ParsedElement::TextBlock { page_number, .. }
                | crate::types::ParsedElement::Heading { page_number, .. } => *page_number,
                crate::types::ParsedElement::Table { page_number, .. } => *page_number,
            })
            .max()
            .unwrap_or(0);

        if elements.is_empty() {
            self.supersede_previous(&path_key, &document_id).await;
            self.structured_store
                .upsert_document(&path_key, &document_id, 0, &chrono::Utc::now().to_rfc3339())
                .await
                .map_err(RagLiteError::Storage)?;
            return Ok(IngestOutcome {
                document_id,
                parsed_elements: 0,
                total_ms: total_start.elapsed().as_millis() as u64,
                parse_ms,
                ..Default::default()
            });
        }

        // --- Chunk (C2) ---
        let chunk_start = Instant::now();
        let doc_title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| document_id.clone());
        let drafts = self.chunker.chunk_elements(&elements, &doc_title, &path_key)?;
        let chunk_ms = chunk_start.elapsed().as_millis() as u64;
        let text_chunks = drafts.iter().filter(|d| !d.is_table).count();
        let table_chunks = drafts.iter().filter(|d| d.is_table).count();

        let chunks: Vec<Chunk> = drafts
            .iter()
            .enumerate()
            .map(|(i, d)| chunk_draft_to_chunk(d, &document_id, i as u32))
            .collect();

        // --- Metadata (C3): document-level cached/serialized, chunk-level concurrent ---
        let metadata_start = Instant::now();
        let sample: String = drafts
            .iter()
            .take(6)
            .map(|d| d.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let doc_metadata = self
            .metadata
            .extract_document_metadata(&document_id, &sample)
            .await;

        let chunk_metadata_futures = drafts
            .iter()
            .map(|d| self.metadata.extract_chunk_metadata(&d.contextualized_text));
        let raw_chunk_metadata = futures::future::join_all(chunk_metadata_futures).await;
        let metadata_ms = metadata_start.elapsed().as_millis() as u64;

        let doc_level_fallback = ChunkMetadata {
            company_name: doc_metadata.company_name.clone(),
            fiscal_period: doc_metadata.fiscal_period.clone(),
            department_name: doc_metadata.department_name.clone(),
            ..Default::default()
        };
        let mut chunks_with_metadata = 0usize;
        let metadata_map: HashMap<Uuid, ChunkMetadata> = chunks
            .iter()
            .zip(raw_chunk_metadata.into_iter())
            .map(|(chunk, chunk_meta)| {
                if has_any_field(&chunk_meta) {
                    chunks_with_metadata += 1;
                }
                let merged = chunk_meta.merge(doc_level_fallback.clone());
                (chunk.id, merged)
            })
            .collect();

        // --- Embed (C4) ---
        let embed_start = Instant::now();
        let texts: Vec<String> = drafts.iter().map(|d| d.contextualized_text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        let embed_ms = embed_start.elapsed().as_millis() as u64;
        let embeddings_generated = vectors.iter().filter(|v| !is_zero(v)).count();

        // --- Upsert (C5 + C6 + C7), in parallel, staged under the new document id ---
        let upsert_start = Instant::now();
        let now = chrono::Utc::now();
        let vector_records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors.iter())
            .map(|(chunk, vector)| {
                let meta = metadata_map.get(&chunk.id).cloned().unwrap_or_default();
                VectorRecord {
                    id: chunk.id.to_string(),
                    document_id: chunk.document_id.clone(),
                    chunk_ordinal: chunk.chunk_ordinal,
                    text: chunk.text.clone(),
                    page_number: chunk.primary_page() as u32,
                    is_table: chunk.is_table,
                    table_part: chunk.table_part.clone().unwrap_or_default(),
                    company_name: meta.company_name.clone().unwrap_or_default(),
                    metric_category: meta.metric_category.clone().unwrap_or_default(),
                    time_period: meta.time_period.clone().unwrap_or_default(),
                    metadata_json: serde_json::to_string(&meta).unwrap_or_else(|_| "{}".to_string()),
                    vector: vector.clone(),
                    created_at: now.timestamp(),
                }
            })
            .collect();

        let bm25_batch: Vec<(String, String, String)> = chunks
            .iter()
            .map(|c| (c.id.to_string(), c.text.clone(), c.document_id.clone()))
            .collect();

        let bm25 = self.bm25.clone();
        let bm25_task = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            bm25.index_chunks_batch(&bm25_batch)?;
            bm25.commit()
        });

        let (vector_result, structured_result, bm25_join) = tokio::join!(
            self.vector_store.upsert_chunks(vector_records),
            self.structured_store.upsert_chunks(&chunks, &metadata_map),
            bm25_task,
        );
        let bm25_result: anyhow::Result<()> = match bm25_join {
            Ok(inner) => inner,
            Err(join_err) => Err(anyhow::anyhow!("bm25 upsert task panicked: {join_err}")),
        };

        if let Err(err) = check_upsert_results(&vector_result, &structured_result, &bm25_result) {
            warn!(
                document_id = %document_id,
                error = %err,
                "ingest upsert failed; rolling back staged writes for this document id"
            );
            let _ = self.vector_store.delete_by_document(&document_id).await;
            let _ = self.structured_store.delete_by_document(&document_id).await;
            let _ = self.bm25.delete_by_document(&document_id);
            return Err(RagLiteError::Storage(crate::error::StorageError::VectorStore(err)));
        }

        // --- Atomic replace: purge the chunk set this path previously pointed at ---
        self.supersede_previous(&path_key, &document_id).await;

        self.structured_store
            .upsert_document(&path_key, &document_id, page_count, &now.to_rfc3339())
            .await
            .map_err(RagLiteError::Storage)?;

        let upsert_ms = upsert_start.elapsed().as_millis() as u64;
        let total_ms = total_start.elapsed().as_millis() as u64;

        info!(
            document_id = %document_id,
            parsed_elements,
            text_chunks,
            table_chunks,
            chunks_with_metadata,
            embeddings_generated,
            total_ms,
            "ingest complete"
        );

        Ok(IngestOutcome {
            document_id,
            parsed_elements,
            text_chunks,
            table_chunks,
            chunks_with_metadata,
            embeddings_generated,
            upsert_successes: 3,
            total_ms,
            parse_ms,
            chunk_ms,
            metadata_ms,
            embed_ms,
            upsert_ms,
        })
    }
}

fn check_upsert_results(
    vector: &anyhow::Result<()>,
    structured: &Result<(), crate::error::StorageError>,
    bm25: &anyhow::Result<()>,
) -> Result<(), String> {
    if let Err(e) = vector {
        return Err(format!("vector store upsert failed: {e}"));
    }
    if let Err(e) = structured {
        return Err(format!("structured store upsert failed: {e}"));
    }
    if let Err(e) = bm25 {
        return Err(format!("bm25 upsert failed: {e}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_and_content_sensitive() {
        let a = document_fingerprint(b"hello world");
        let b = document_fingerprint(b"hello world");
        let c = document_fingerprint(b"hello world!");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn has_any_field_detects_empty_metadata() {
        assert!(!has_any_field(&ChunkMetadata::default()));
        assert!(has_any_field(&ChunkMetadata {
            company_name: Some("Acme".to_string()),
            ..Default::default()
        }));
    }
}
