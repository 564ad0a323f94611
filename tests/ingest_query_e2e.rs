//! End-to-end ingest-then-query scenarios over real storage adapters
//! (LanceDB, SQLite, Tantivy), a content-addressed document held in a
//! temp directory, and doubles for the two external-service dependents
//! (metadata extraction, embedding) since neither service is reachable
//! in a test environment.

use async_trait::async_trait;
use raglite::chunking::Chunker;
use raglite::config::{FusionMode, RetrievalConfig};
use raglite::embedding::Embedder;
use raglite::error::{EmbeddingError, QueryError, RagLiteError};
use raglite::index::bm25::Bm25Index;
use raglite::ingest::IngestionOrchestrator;
use raglite::metadata::MetadataExtractor;
use raglite::parsing::NullParserAdapter;
use raglite::query::classifier::Classification;
use raglite::query::retrieval::RetrievalOrchestrator;
use raglite::storage::structured::StructuredStore;
use raglite::storage::vector::VectorStore;
use raglite::types::{DegradationReason, ParsedElement, ResultSource};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

const DIM: usize = 32;
/// Unreachable-fast address: nothing listens on port 1, so connection
/// attempts refuse immediately instead of timing out.
const DEAD_ENDPOINT: &str = "http://127.0.0.1:1";

/// Deterministic bag-of-words hashing embedding. Not a real embedding
/// model, but it separates the fixture documents by vocabulary well
/// enough to exercise ranking without a live embedding service.
struct HashingEmbedder;

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(hash_embed(text))
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

/// Always errors, simulating an embedding service (and so, by extension,
/// the vector search path) that's gone unreachable mid-session.
struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::RequestFailed("embedding service unreachable".to_string()))
    }

    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::RequestFailed("embedding service unreachable".to_string()))
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0f32; DIM];
    for word in text.split_whitespace() {
        let normalized: String = word.chars().filter(|c| c.is_alphanumeric()).collect::<String>().to_lowercase();
        if normalized.is_empty() {
            continue;
        }
        let mut hasher = DefaultHasher::new();
        normalized.hash(&mut hasher);
        let bucket = (hasher.finish() % DIM as u64) as usize;
        v[bucket] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

fn narrative_elements() -> Vec<ParsedElement> {
    vec![
        ParsedElement::Heading {
            text: "Portugal Operations".to_string(),
            level: 1,
            page_number: 1,
        },
        ParsedElement::TextBlock {
            text: "Variable costs rose this quarter due to higher raw material prices \
                   and energy costs across the cement plants in Iberia."
                .to_string(),
            page_number: 10,
        },
        ParsedElement::Table {
            header_rows: vec![vec!["Metric".to_string(), "Value".to_string()]],
            rows: vec![
                vec!["Variable cost per ton".to_string(), "23.2 EUR/ton".to_string()],
                vec![
                    "EBITDA margin".to_string(),
                    "18.4% (Portugal Cement, August 2025)".to_string(),
                ],
            ],
            caption: Some("Portugal Cement Operating Metrics".to_string()),
            page_number: 46,
            continuation_page_numbers: vec![],
        },
    ]
}

struct Fixture {
    _dir: tempfile::TempDir,
    vector_store: Arc<VectorStore>,
    structured_store: Arc<StructuredStore>,
    bm25: Arc<Bm25Index>,
    retrieval: RetrievalOrchestrator,
    document_id: String,
}

async fn build_fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = Arc::new(VectorStore::new(dir.path().join("vectors").to_str().unwrap(), DIM).await.unwrap());
    let structured_store = Arc::new(StructuredStore::new("sqlite::memory:").await.unwrap());
    let bm25 = Arc::new(Bm25Index::new(dir.path().to_str().unwrap()).unwrap());
    let metadata = Arc::new(MetadataExtractor::new(DEAD_ENDPOINT.to_string(), None, "test-model".to_string(), 4, 1, 0).unwrap());
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder);
    let chunker = Chunker::new(512, 50, 4096);

    let ingest = IngestionOrchestrator::new(
        Arc::new(NullParserAdapter::new(narrative_elements())),
        chunker,
        metadata,
        embedder.clone(),
        vector_store.clone(),
        structured_store.clone(),
        bm25.clone(),
    );

    let doc_path = dir.path().join("report.pdf");
    std::fs::write(&doc_path, b"stand-in bytes, only the fingerprint is used").unwrap();
    let outcome = ingest.ingest(&doc_path).await.unwrap();
    assert_eq!(outcome.text_chunks, 1);
    assert_eq!(outcome.table_chunks, 1);

    let retrieval_config = RetrievalConfig {
        hybrid_alpha: 0.6,
        hybrid_deadline_s: 5,
        fusion_mode: FusionMode::WeightedSum,
        rrf_k: 60,
        top_k: 10,
        classifier_version: "v1".to_string(),
    };
    let retrieval = RetrievalOrchestrator::new(
        embedder,
        vector_store.clone(),
        structured_store.clone(),
        bm25.clone(),
        retrieval_config,
    );

    Fixture {
        _dir: dir,
        vector_store,
        structured_store,
        bm25,
        retrieval,
        document_id: outcome.document_id,
    }
}

#[tokio::test]
async fn table_precision_query_surfaces_the_exact_row() {
    let fx = build_fixture().await;
    let query = "variable cost per ton Portugal Cement August 2025";
    assert_eq!(Classification::SqlOnly, raglite::query::classifier::classify(query));

    let (results, trace) = fx.retrieval.retrieve(query, None, None, None).await.unwrap();
    assert!(trace.degraded.is_none());
    assert!(results.iter().any(|r| r.text.contains("23.2")));
    assert!(results.iter().any(|r| r.page_number == 46));
}

#[tokio::test]
async fn narrative_question_is_vector_only_and_avoids_the_table() {
    let fx = build_fixture().await;
    let query = "Explain why variable costs rose in Iberia";
    assert_eq!(Classification::VectorOnly, raglite::query::classifier::classify(query));

    let (results, trace) = fx.retrieval.retrieve(query, None, None, None).await.unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| matches!(r.source, ResultSource::Vector)));
    assert!(results[0].fused_score >= 0.0);
    assert_eq!(trace.sql_hits, 0);
}

#[tokio::test]
async fn hybrid_query_ranks_the_table_chunk_in_the_top_results() {
    let fx = build_fixture().await;
    let query = "explain the EBITDA margin table for Portugal Cement in August 2025";
    assert_eq!(Classification::Hybrid, raglite::query::classifier::classify(query));

    let (results, trace) = fx.retrieval.retrieve(query, None, None, None).await.unwrap();
    assert!(trace.vector_hits > 0);
    assert!(trace.sql_hits > 0);
    assert!(results.iter().take(3).any(|r| r.page_number == 46));
}

#[tokio::test]
async fn zero_deadline_under_hybrid_returns_empty_result_without_erroring() {
    let fx = build_fixture().await;
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder);
    let zero_deadline_retrieval = RetrievalOrchestrator::new(
        embedder,
        fx.vector_store.clone(),
        fx.structured_store.clone(),
        fx.bm25.clone(),
        RetrievalConfig {
            hybrid_alpha: 0.6,
            hybrid_deadline_s: 0,
            fusion_mode: FusionMode::WeightedSum,
            rrf_k: 60,
            top_k: 10,
            classifier_version: "v1".to_string(),
        },
    );

    let query = "explain the EBITDA margin table for Portugal Cement in August 2025";
    assert_eq!(Classification::Hybrid, raglite::query::classifier::classify(query));

    let (results, trace) = zero_deadline_retrieval.retrieve(query, None, None, None).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(trace.degraded, Some(DegradationReason::DeadlineExceeded));
}

#[tokio::test]
async fn sql_only_query_with_no_lexical_hits_falls_back_to_vector_search() {
    let fx = build_fixture().await;
    // "column" satisfies the table-keyword branch; the rest are nonsense
    // tokens absent from every chunk, on both the SQL (AND) and BM25 (OR)
    // sides, guaranteeing zero lexical hits.
    let query = "column zzqraptor wobbuquark fnorbitz";
    assert_eq!(Classification::SqlOnly, raglite::query::classifier::classify(query));

    let (results, trace) = fx.retrieval.retrieve(query, None, None, None).await.unwrap();
    assert_eq!(trace.degraded, Some(DegradationReason::SqlEmptyFallback));
    assert!(!results.is_empty());
}

#[tokio::test]
async fn reingesting_the_same_path_supersedes_the_previous_chunk_set() {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = Arc::new(VectorStore::new(dir.path().join("vectors").to_str().unwrap(), DIM).await.unwrap());
    let structured_store = Arc::new(StructuredStore::new("sqlite::memory:").await.unwrap());
    let bm25 = Arc::new(Bm25Index::new(dir.path().to_str().unwrap()).unwrap());
    let metadata = Arc::new(MetadataExtractor::new(DEAD_ENDPOINT.to_string(), None, "test-model".to_string(), 4, 1, 0).unwrap());
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder);

    let doc_path = dir.path().join("quarterly.pdf");

    let ingest_v1 = IngestionOrchestrator::new(
        Arc::new(NullParserAdapter::new(vec![ParsedElement::TextBlock {
            text: "Q1 2025 revenue grew by 4 percent year over year.".to_string(),
            page_number: 1,
        }])),
        Chunker::new(512, 50, 4096),
        metadata.clone(),
        embedder.clone(),
        vector_store.clone(),
        structured_store.clone(),
        bm25.clone(),
    );
    std::fs::write(&doc_path, b"version one").unwrap();
    let outcome_v1 = ingest_v1.ingest(&doc_path).await.unwrap();

    let ingest_v2 = IngestionOrchestrator::new(
        Arc::new(NullParserAdapter::new(vec![ParsedElement::TextBlock {
            text: "Q1 2025 revenue grew by 6 percent year over year, restated.".to_string(),
            page_number: 1,
        }])),
        Chunker::new(512, 50, 4096),
        metadata,
        embedder,
        vector_store.clone(),
        structured_store.clone(),
        bm25.clone(),
    );
    std::fs::write(&doc_path, b"version two, materially different").unwrap();
    let outcome_v2 = ingest_v2.ingest(&doc_path).await.unwrap();

    assert_ne!(outcome_v1.document_id, outcome_v2.document_id);
    assert_eq!(vector_store.count_for_document(&outcome_v1.document_id).await.unwrap(), 0);
    assert_eq!(vector_store.count_for_document(&outcome_v2.document_id).await.unwrap(), 1);
    assert_eq!(structured_store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn vector_store_failure_degrades_hybrid_search_to_sql_only() {
    let fx = build_fixture().await;
    let broken_embedder: Arc<dyn Embedder> = Arc::new(BrokenEmbedder);
    let degraded_retrieval = RetrievalOrchestrator::new(
        broken_embedder,
        fx.vector_store.clone(),
        fx.structured_store.clone(),
        fx.bm25.clone(),
        RetrievalConfig {
            hybrid_alpha: 0.6,
            hybrid_deadline_s: 5,
            fusion_mode: FusionMode::WeightedSum,
            rrf_k: 60,
            top_k: 10,
            classifier_version: "v1".to_string(),
        },
    );

    let query = "explain the EBITDA margin table for Portugal Cement in August 2025";
    let (results, trace) = degraded_retrieval.retrieve(query, None, None, None).await.unwrap();
    assert_eq!(trace.degraded, Some(DegradationReason::VectorUnavailable));
    assert_eq!(trace.vector_hits, 0);
    assert!(trace.sql_hits > 0);
    assert!(!results.is_empty());
}

#[tokio::test]
async fn top_k_override_bounds_the_result_count() {
    let fx = build_fixture().await;
    let (results, _trace) = fx
        .retrieval
        .retrieve("explain the EBITDA margin table for Portugal Cement", Some(1), None, None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn classification_override_forces_vector_only_search() {
    let fx = build_fixture().await;
    // Would classify SqlOnly on its own (table keyword, no semantic word);
    // the override should route it through vector search instead.
    let (_results, trace) = fx
        .retrieval
        .retrieve("show me the table of variable costs", None, None, Some(Classification::VectorOnly))
        .await
        .unwrap();
    assert_eq!(trace.classification, "vector_only");
    assert_eq!(trace.sql_hits, 0);
}

#[tokio::test]
async fn empty_query_is_rejected_before_classification() {
    let fx = build_fixture().await;
    let err = fx.retrieval.retrieve("   ", None, None, None).await.unwrap_err();
    assert!(matches!(err, RagLiteError::Query(QueryError::InvalidQuery(_))));
}

/// Breaks the 1:1 linkage invariant on the structured side (its chunk rows
/// are deleted while the vector entries remain) and confirms the vector hit
/// is treated as an orphaned_chunk: excluded from results, no error raised.
#[tokio::test]
async fn structured_row_deleted_out_from_under_a_vector_hit_is_excluded_as_orphaned() {
    let fx = build_fixture().await;
    fx.structured_store.delete_by_document(&fx.document_id).await.unwrap();

    let query = "Explain why variable costs rose in Iberia";
    assert_eq!(Classification::VectorOnly, raglite::query::classifier::classify(query));

    let (results, _trace) = fx.retrieval.retrieve(query, None, None, None).await.unwrap();
    assert!(results.is_empty());
}
