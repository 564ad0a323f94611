//! Composition root.
//!
//! Builds every adapter once at process startup from `RagLiteConfig` and
//! `ServiceCredentials`, holds them behind `Arc` for the life of the
//! process, and exposes the two orchestrators the tool surface drives.
//! Shaped after this engine's own `RAGEngine::new` constructor: one place
//! wires concrete adapters into the orchestrators, so nothing downstream
//! constructs a client or opens a store connection per call.

use crate::chunking::Chunker;
use crate::config::{RagLiteConfig, ServiceCredentials};
use crate::embedding::{Embedder, ExternalEmbedder};
use crate::error::{RagLiteError, StorageError};
use crate::index::bm25::Bm25Index;
use crate::ingest::IngestionOrchestrator;
use crate::metadata::MetadataExtractor;
use crate::parsing::{DocumentParserAdapter, PdfParserAdapter};
use crate::query::retrieval::RetrievalOrchestrator;
use crate::storage::structured::StructuredStore;
use crate::storage::vector::VectorStore;
use std::sync::Arc;

const METADATA_MODEL: &str = "financial-metadata-extractor-v1";
const EMBEDDING_MODEL: &str = "finance-embedding-v1";

/// Everything the `mcp` tool surface needs: one ingestion pipeline, one
/// retrieval pipeline, both sharing the same store and client handles.
pub struct RagLiteSystem {
    pub ingest: IngestionOrchestrator,
    pub query: RetrievalOrchestrator,
}

impl RagLiteSystem {
    pub async fn build(
        config: RagLiteConfig,
        credentials: ServiceCredentials,
    ) -> Result<Self, RagLiteError> {
        config.validate().map_err(RagLiteError::Config)?;
        std::fs::create_dir_all(&config.data_dir)?;

        let parser: Arc<dyn DocumentParserAdapter> = Arc::new(PdfParserAdapter::new());
        let chunker = Chunker::new(
            config.chunking.chunk_size,
            config.chunking.chunk_overlap,
            config.chunking.max_table_tokens,
        );

        let metadata = Arc::new(
            MetadataExtractor::new(
                credentials.llm_endpoint.clone(),
                credentials.llm_api_key.clone(),
                METADATA_MODEL.to_string(),
                config.metadata.concurrency,
                config.metadata.timeout_s,
                config.metadata.retries,
            )
            .map_err(RagLiteError::Metadata)?,
        );

        let embedder: Arc<dyn Embedder> = Arc::new(
            ExternalEmbedder::new(
                credentials.embedder_endpoint.clone(),
                credentials.embedder_api_key.clone(),
                EMBEDDING_MODEL.to_string(),
                config.embedding.dimension,
                config.embedding.batch_size,
                config.embedding.timeout_s,
            )
            .map_err(RagLiteError::Embedding)?,
        );

        let vector_store = Arc::new(
            VectorStore::new(&credentials.vector_store_url, config.embedding.dimension)
                .await
                .map_err(|e| RagLiteError::Storage(StorageError::VectorStore(e.to_string())))?,
        );
        vector_store
            .create_index_if_needed()
            .await
            .map_err(|e| RagLiteError::Storage(StorageError::VectorStore(e.to_string())))?;

        let structured_store = Arc::new(StructuredStore::new(&credentials.structured_store_url).await?);

        let bm25 = Arc::new(
            Bm25Index::new(&config.data_dir.display().to_string())
                .map_err(|e| RagLiteError::Storage(StorageError::FullText(e.to_string())))?,
        );

        let ingest = IngestionOrchestrator::new(
            parser,
            chunker,
            metadata,
            embedder.clone(),
            vector_store.clone(),
            structured_store.clone(),
            bm25.clone(),
        );

        let query = RetrievalOrchestrator::new(
            embedder,
            vector_store,
            structured_store,
            bm25,
            config.retrieval.clone(),
        );

        Ok(Self { ingest, query })
    }
}
