//! C10 — Retrieval Orchestrator.
//!
//! Classifies the query (C9), dispatches to the index or indexes the
//! classification calls for, fuses vector and lexical rank lists (C11), and
//! hydrates the fused ids back into displayable `SearchResult`s with
//! citations. The hybrid path fans vector search and lexical search (SQL
//! full-text plus BM25, merged) out concurrently and wraps the whole
//! fan-out in a deadline; a single index failing degrades to the other
//! rather than returning an error, per this engine's graceful-degradation
//! posture for metadata and embedding calls generalized to retrieval — only
//! both indexes failing, or the deadline firing with nothing usable yet,
//! surfaces as an error to the caller.

use crate::config::{FusionMode, RetrievalConfig};
use crate::embedding::Embedder;
use crate::error::{QueryError, RagLiteError, StorageError};
use crate::index::bm25::Bm25Index;
use crate::query::classifier::{classify, Classification};
use crate::query::fusion;
use crate::storage::structured::{ChunkFilter, ChunkRow, StructuredStore};
use crate::storage::vector::{VectorHit, VectorStore};
use crate::types::{Citation, DegradationReason, ResultSource, RetrievalTrace, SearchResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Jaccard-similarity threshold above which two results are treated as the
/// same underlying passage surfaced twice (e.g. from overlapping sliding
/// windows) rather than independently ranked. See
/// `fusion::dedupe_near_duplicates`.
const NEAR_DUPLICATE_THRESHOLD: f32 = 0.75;

/// Outcome of the hybrid fan-out once both sides have been awaited: either
/// both indexes answered and were fused, or exactly one failed and the
/// other carries the query alone. Both failing is reported to the caller
/// as an error rather than folded in here, since there's nothing left to
/// degrade to.
enum HybridOutcome {
    Fused {
        fused: Vec<(String, f32, ResultSource)>,
        embed_ms: u64,
        vector_search_ms: u64,
        sql_search_ms: u64,
        hit_map: HashMap<String, VectorHit>,
    },
    Degraded {
        list: Vec<(String, f32, ResultSource)>,
        embed_ms: u64,
        vector_search_ms: u64,
        sql_search_ms: u64,
        hit_map: HashMap<String, VectorHit>,
        reason: DegradationReason,
    },
}

pub struct RetrievalOrchestrator {
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<VectorStore>,
    structured_store: Arc<StructuredStore>,
    bm25: Arc<Bm25Index>,
    config: RetrievalConfig,
}

impl RetrievalOrchestrator {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<VectorStore>,
        structured_store: Arc<StructuredStore>,
        bm25: Arc<Bm25Index>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            vector_store,
            structured_store,
            bm25,
            config,
        }
    }

    /// `top_k`, `filters` and `classification_override` default to the
    /// configured top-k, no metadata restriction and the regex classifier
    /// respectively — all three may be supplied by a caller per query.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        filters: Option<&HashMap<String, String>>,
        classification_override: Option<Classification>,
    ) -> Result<(Vec<SearchResult>, RetrievalTrace), RagLiteError> {
        if query.trim().is_empty() {
            return Err(RagLiteError::Query(QueryError::InvalidQuery(
                "query must not be empty".to_string(),
            )));
        }

        let classify_start = Instant::now();
        let classification = classification_override.unwrap_or_else(|| classify(query));
        let classification_ms = classify_start.elapsed().as_millis() as u64;
        let top_k = top_k.unwrap_or(self.config.top_k);
        let sql_filter = filters.map(ChunkFilter::from_map);
        let vector_filter = filters.and_then(|f| build_vector_predicate(f));

        let mut degraded = None;
        let mut embed_ms = 0u64;
        let mut vector_search_ms = 0u64;
        let mut sql_search_ms = 0u64;
        let mut hit_map: HashMap<String, VectorHit> = HashMap::new();
        let fused: Vec<(String, f32, ResultSource)>;

        match classification {
            Classification::VectorOnly => {
                let (list, e_ms, v_ms, map) = self
                    .vector_rank_list(query, top_k, vector_filter.as_deref())
                    .await?;
                embed_ms = e_ms;
                vector_search_ms = v_ms;
                hit_map = map;
                fused = list.into_iter().map(|(id, s, _)| (id, s, ResultSource::Vector)).collect();
            }
            Classification::SqlOnly => {
                match self
                    .lexical_rank_list(query, top_k, true, sql_filter.as_ref())
                    .await
                {
                    Ok((list, s_ms)) if !list.is_empty() => {
                        sql_search_ms = s_ms;
                        fused = list.into_iter().map(|(id, s, _)| (id, s, ResultSource::Sql)).collect();
                    }
                    Ok((_, s_ms)) => {
                        sql_search_ms = s_ms;
                        warn!(event = "sql_empty_fallback", query, "sql-only classification produced no hits; degrading to vector search");
                        degraded = Some(DegradationReason::SqlEmptyFallback);
                        let (list, e_ms, v_ms, map) = self
                            .vector_rank_list(query, top_k, vector_filter.as_deref())
                            .await?;
                        embed_ms = e_ms;
                        vector_search_ms = v_ms;
                        hit_map = map;
                        fused = list.into_iter().map(|(id, s, _)| (id, s, ResultSource::Vector)).collect();
                    }
                    Err(err) => {
                        warn!(event = "degraded_retrieval", side = "sql", error = %err, "structured store unavailable; degrading to vector-only");
                        degraded = Some(DegradationReason::SqlUnavailable);
                        let (list, e_ms, v_ms, map) = self
                            .vector_rank_list(query, top_k, vector_filter.as_deref())
                            .await?;
                        embed_ms = e_ms;
                        vector_search_ms = v_ms;
                        hit_map = map;
                        fused = list.into_iter().map(|(id, s, _)| (id, s, ResultSource::Vector)).collect();
                    }
                }
            }
            Classification::Hybrid => {
                // A deadline of 0 is a valid, spec-named boundary case: both
                // sub-searches get canceled and the query returns an empty
                // result rather than hanging, erroring, or re-running a
                // fresh, un-timed search after the fact. Each side is timed
                // against the same deadline individually (rather than the
                // whole fan-out against one outer timeout) so a slow side
                // degrades to whichever side actually produced a result,
                // not to a do-over.
                let deadline = Duration::from_secs(self.config.hybrid_deadline_s);
                match self
                    .hybrid_fanout(query, top_k, vector_filter.as_deref(), sql_filter.as_ref(), deadline)
                    .await?
                {
                    HybridOutcome::Fused {
                        fused: list,
                        embed_ms: e_ms,
                        vector_search_ms: v_ms,
                        sql_search_ms: s_ms,
                        hit_map: map,
                    } => {
                        embed_ms = e_ms;
                        vector_search_ms = v_ms;
                        sql_search_ms = s_ms;
                        hit_map = map;
                        fused = list;
                    }
                    HybridOutcome::Degraded {
                        list,
                        embed_ms: e_ms,
                        vector_search_ms: v_ms,
                        sql_search_ms: s_ms,
                        hit_map: map,
                        reason,
                    } => {
                        embed_ms = e_ms;
                        vector_search_ms = v_ms;
                        sql_search_ms = s_ms;
                        hit_map = map;
                        degraded = Some(reason);
                        fused = list;
                    }
                }
            }
        }

        let fusion_start = Instant::now();
        let hydrated = self.hydrate(fused, &hit_map).await?;
        let hydrated = fusion::dedupe_near_duplicates(hydrated, NEAR_DUPLICATE_THRESHOLD);
        let fusion_ms = fusion_start.elapsed().as_millis() as u64;

        let vector_hits = hydrated
            .iter()
            .filter(|r| matches!(r.source, ResultSource::Vector | ResultSource::Both))
            .count();
        let sql_hits = hydrated
            .iter()
            .filter(|r| matches!(r.source, ResultSource::Sql | ResultSource::Both))
            .count();

        let trace = RetrievalTrace {
            classification: classification.as_str().to_string(),
            classifier_version: self.config.classifier_version.clone(),
            vector_hits,
            sql_hits,
            classification_ms,
            embed_ms,
            vector_search_ms,
            sql_search_ms,
            fusion_ms,
            degraded,
        };

        Ok((hydrated, trace))
    }

    /// Rank list entries carry `(chunk_id, score, chunk_ordinal)` — the
    /// ordinal rides along purely so `fusion::finish` can apply spec.md:176's
    /// deterministic tie-break (fused score, then vector score, then chunk
    /// ordinal) without a second round-trip to storage.
    async fn vector_rank_list(
        &self,
        query: &str,
        k: usize,
        filter: Option<&str>,
    ) -> Result<(Vec<(String, f32, u32)>, u64, u64, HashMap<String, VectorHit>), RagLiteError> {
        let t0 = Instant::now();
        let query_vec = self.embedder.embed_query(query).await?;
        let embed_ms = t0.elapsed().as_millis() as u64;

        let t1 = Instant::now();
        let hits = self
            .vector_store
            .vector_search(&query_vec, k, filter)
            .await
            .map_err(|e| RagLiteError::Storage(StorageError::VectorStore(e.to_string())))?;
        let search_ms = t1.elapsed().as_millis() as u64;

        let mut list = Vec::with_capacity(hits.len());
        let mut map = HashMap::with_capacity(hits.len());
        for hit in hits {
            list.push((hit.id.clone(), hit.score, hit.chunk_ordinal));
            map.insert(hit.id.clone(), hit);
        }
        Ok((list, embed_ms, search_ms, map))
    }

    /// SQL full-text plus BM25, merged by taking the max score per chunk id —
    /// the two lexical signals agreeing on a chunk shouldn't rank it lower
    /// than either alone. Neither lexical source carries chunk ordinal
    /// natively, so the merged id set is batch-hydrated against the
    /// structured store once to attach it.
    async fn lexical_rank_list(
        &self,
        query: &str,
        k: usize,
        prefer_tables: bool,
        filter: Option<&ChunkFilter>,
    ) -> Result<(Vec<(String, f32, u32)>, u64), RagLiteError> {
        let t0 = Instant::now();
        let sql_list = self
            .structured_store
            .search_tables(query, k, filter, prefer_tables)
            .await?;

        let bm25 = self.bm25.clone();
        let owned_query = query.to_string();
        let bm25_list = tokio::task::spawn_blocking(move || bm25.search(&owned_query, k))
            .await
            .map_err(|e| {
                RagLiteError::Storage(StorageError::FullText(format!(
                    "bm25 search task panicked: {e}"
                )))
            })?
            .map_err(|e| RagLiteError::Storage(StorageError::FullText(e.to_string())))?;

        let merged = merge_lexical(sql_list, bm25_list);
        let ids: Vec<String> = merged.iter().map(|(id, _)| id.clone()).collect();
        let ordinals: HashMap<String, u32> = self
            .structured_store
            .fetch_chunks_by_ids(&ids)
            .await?
            .into_iter()
            .map(|row| (row.chunk_id, row.chunk_ordinal))
            .collect();
        let merged = merged
            .into_iter()
            .map(|(id, score)| {
                let ordinal = ordinals.get(&id).copied().unwrap_or(0);
                (id, score, ordinal)
            })
            .collect();
        let ms = t0.elapsed().as_millis() as u64;
        Ok((merged, ms))
    }

    /// Runs vector and lexical search concurrently, each individually bounded
    /// by `deadline` (not the whole fan-out by one outer timeout) so that
    /// whichever side actually produced a result before the deadline is the
    /// one hybrid degrades to — never a fresh, un-timed retry after the
    /// fact. If one side errors or times out the other's results still
    /// stand (degrading to vector-only or SQL-only respectively); both
    /// timing out returns an empty, non-error degraded result (deadline = 0
    /// is the boundary case this exists for); both failing with a genuine
    /// error is the only case propagated to the caller as an error.
    async fn hybrid_fanout(
        &self,
        query: &str,
        k: usize,
        vector_filter: Option<&str>,
        sql_filter: Option<&ChunkFilter>,
        deadline: Duration,
    ) -> Result<HybridOutcome, RagLiteError> {
        let (vector_res, lexical_res) = tokio::join!(
            tokio::time::timeout(deadline, self.vector_rank_list(query, k, vector_filter)),
            tokio::time::timeout(deadline, self.lexical_rank_list(query, k, false, sql_filter)),
        );

        match (vector_res, lexical_res) {
            (Ok(Ok((vector_list, embed_ms, vector_search_ms, hit_map))), Ok(Ok((lexical_list, sql_search_ms)))) => {
                let fused = match self.config.fusion_mode {
                    FusionMode::WeightedSum => {
                        fusion::weighted_fusion(&vector_list, &lexical_list, self.config.hybrid_alpha, k)
                    }
                    FusionMode::Rrf => {
                        fusion::reciprocal_rank_fusion(&vector_list, &lexical_list, self.config.rrf_k, k)
                    }
                };
                Ok(HybridOutcome::Fused {
                    fused,
                    embed_ms,
                    vector_search_ms,
                    sql_search_ms,
                    hit_map,
                })
            }
            (Ok(Ok((vector_list, embed_ms, vector_search_ms, hit_map))), lexical_res) => {
                let reason = match &lexical_res {
                    Err(_) => DegradationReason::DeadlineExceeded,
                    Ok(Err(err)) => {
                        warn!(event = "degraded_retrieval", side = "sql", error = %err, "structured store unavailable during hybrid fan-out; degrading to vector-only");
                        DegradationReason::SqlUnavailable
                    }
                    Ok(Ok(_)) => unreachable!("handled by the first match arm"),
                };
                if matches!(reason, DegradationReason::DeadlineExceeded) {
                    warn!(event = "degraded_retrieval", side = "sql", deadline_s = deadline.as_secs(), "sql search did not complete within the hybrid deadline; degrading to vector-only");
                }
                let list = vector_list
                    .into_iter()
                    .map(|(id, s, _)| (id, s, ResultSource::Vector))
                    .collect();
                Ok(HybridOutcome::Degraded {
                    list,
                    embed_ms,
                    vector_search_ms,
                    sql_search_ms: 0,
                    hit_map,
                    reason,
                })
            }
            (vector_res, Ok(Ok((lexical_list, sql_search_ms)))) => {
                let reason = match &vector_res {
                    Err(_) => DegradationReason::DeadlineExceeded,
                    Ok(Err(err)) => {
                        warn!(event = "degraded_retrieval", side = "vector", error = %err, "vector store unavailable during hybrid fan-out; degrading to sql-only");
                        DegradationReason::VectorUnavailable
                    }
                    Ok(Ok(_)) => unreachable!("handled by the first match arm"),
                };
                if matches!(reason, DegradationReason::DeadlineExceeded) {
                    warn!(event = "degraded_retrieval", side = "vector", deadline_s = deadline.as_secs(), "vector search did not complete within the hybrid deadline; degrading to sql-only");
                }
                let list = lexical_list
                    .into_iter()
                    .map(|(id, s, _)| (id, s, ResultSource::Sql))
                    .collect();
                Ok(HybridOutcome::Degraded {
                    list,
                    embed_ms: 0,
                    vector_search_ms: 0,
                    sql_search_ms,
                    hit_map: HashMap::new(),
                    reason,
                })
            }
            (vector_res, lexical_res) => {
                // Neither side produced a result. Both timing out is the
                // deadline=0 boundary case: no crash, no error, just nothing
                // to return. A genuine error on at least one side (as
                // opposed to merely running out of time) is fatal per the
                // "both indexes unreachable" query-fatal case.
                if vector_res.is_err() && lexical_res.is_err() {
                    warn!(
                        event = "degraded_retrieval",
                        deadline_s = deadline.as_secs(),
                        "neither index completed within the hybrid deadline; returning an empty result"
                    );
                    return Ok(HybridOutcome::Degraded {
                        list: Vec::new(),
                        embed_ms: 0,
                        vector_search_ms: 0,
                        sql_search_ms: 0,
                        hit_map: HashMap::new(),
                        reason: DegradationReason::DeadlineExceeded,
                    });
                }
                let vector_err = match vector_res {
                    Ok(Err(err)) => err.to_string(),
                    Err(_) => "deadline exceeded".to_string(),
                    Ok(Ok(_)) => unreachable!("handled above"),
                };
                let lexical_err = match lexical_res {
                    Ok(Err(err)) => err.to_string(),
                    Err(_) => "deadline exceeded".to_string(),
                    Ok(Ok(_)) => unreachable!("handled above"),
                };
                warn!(vector_err, lexical_err, "both indexes failed during hybrid retrieval");
                Err(RagLiteError::Query(QueryError::AllIndexesFailed))
            }
        }
    }

    /// Attach text, provenance and a citation to each fused id: vector hits
    /// already carry their payload, lexical-only ids are hydrated from the
    /// structured store. Also enforces the 1:1 linkage invariant (spec §3):
    /// a vector hit with no structured row, or a lexical hit with no vector
    /// entry, is an `orphaned_chunk` — logged and excluded from results
    /// rather than failing the query.
    async fn hydrate(
        &self,
        fused: Vec<(String, f32, ResultSource)>,
        hit_map: &HashMap<String, VectorHit>,
    ) -> Result<Vec<SearchResult>, RagLiteError> {
        let missing_ids: Vec<String> = fused
            .iter()
            .filter(|(id, _, _)| !hit_map.contains_key(id))
            .map(|(id, _, _)| id.clone())
            .collect();
        let rows = self.structured_store.fetch_chunks_by_ids(&missing_ids).await?;
        let row_map: HashMap<String, ChunkRow> =
            rows.into_iter().map(|r| (r.chunk_id.clone(), r)).collect();

        let vector_sourced_ids: Vec<String> = fused
            .iter()
            .filter(|(id, _, _)| hit_map.contains_key(id))
            .map(|(id, _, _)| id.clone())
            .collect();
        let vector_confirmed = self
            .structured_store
            .fetch_chunks_by_ids(&vector_sourced_ids)
            .await?
            .into_iter()
            .map(|r| r.chunk_id)
            .collect::<std::collections::HashSet<_>>();
        // If the vector store can't be reached for this check, don't treat
        // every lexical-only hit as orphaned — skip the lexical-side check
        // rather than mass-excluding results on a transient failure.
        let lexical_confirmed = match self.vector_store.existing_ids(&missing_ids).await {
            Ok(ids) => Some(ids),
            Err(err) => {
                warn!(error = %err, "could not verify vector-side linkage for lexical hits; skipping check");
                None
            }
        };

        let mut results = Vec::with_capacity(fused.len());
        for (id, score, source) in fused {
            if hit_map.contains_key(&id) && !vector_confirmed.contains(&id) {
                warn!(event = "orphaned_chunk", chunk_id = %id, "vector entry has no matching structured row; excluding from results");
                continue;
            }
            if !hit_map.contains_key(&id) && row_map.contains_key(&id) {
                if let Some(confirmed) = &lexical_confirmed {
                    if !confirmed.contains(&id) {
                        warn!(event = "orphaned_chunk", chunk_id = %id, "structured row has no matching vector entry; excluding from results");
                        continue;
                    }
                }
            }

            let (text, document_id, page_number, table_part) = if let Some(hit) = hit_map.get(&id) {
                (
                    hit.text.clone(),
                    hit.document_id.clone(),
                    hit.page_number as usize,
                    if hit.table_part.is_empty() {
                        None
                    } else {
                        Some(hit.table_part.clone())
                    },
                )
            } else if let Some(row) = row_map.get(&id) {
                (row.content.clone(), row.document_id.clone(), row.page_number, row.table_part.clone())
            } else {
                // Ranked by an index but vanished from storage before hydration
                // (e.g. deleted between search and fetch); skip rather than fail.
                continue;
            };

            let chunk_id = match uuid::Uuid::parse_str(&id) {
                Ok(u) => u,
                Err(_) => continue,
            };

            let document_name = self
                .structured_store
                .document_path(&document_id)
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| document_id.clone());

            results.push(SearchResult {
                chunk_id,
                text,
                source,
                document_id,
                page_number,
                raw_score: score,
                fused_score: score,
                citation: Citation {
                    document_name,
                    page_number,
                    table_part,
                },
            });
        }
        Ok(results)
    }
}

/// Translates the caller-supplied filter map into a LanceDB `only_if`
/// predicate over the columns the vector store carries natively
/// (`company_name`, `metric_category`, `time_period`); other filter keys
/// apply only on the SQL side via `ChunkFilter`.
fn build_vector_predicate(filters: &HashMap<String, String>) -> Option<String> {
    let mut clauses = Vec::new();
    for column in ["company_name", "metric_category", "time_period"] {
        if let Some(value) = filters.get(column) {
            clauses.push(format!("{column} = '{}'", value.replace('\'', "''")));
        }
    }
    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

fn merge_lexical(sql: Vec<(String, f32)>, bm25: Vec<(String, f32)>) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    for (id, score) in sql.into_iter().chain(bm25.into_iter()) {
        scores
            .entry(id)
            .and_modify(|s| *s = s.max(score))
            .or_insert(score);
    }
    let mut merged: Vec<(String, f32)> = scores.into_iter().collect();
    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_lexical_takes_max_score_on_overlap() {
        let sql = vec![("a".to_string(), 0.4), ("b".to_string(), 0.9)];
        let bm25 = vec![("a".to_string(), 0.7)];
        let merged = merge_lexical(sql, bm25);
        let a_score = merged.iter().find(|(id, _)| id == "a").unwrap().1;
        assert_eq!(a_score, 0.7);
        assert_eq!(merged[0].0, "b");
    }

    #[test]
    fn vector_predicate_is_none_for_empty_or_unfiltered_map() {
        assert!(build_vector_predicate(&HashMap::new()).is_none());
        let mut only_unknown = HashMap::new();
        only_unknown.insert("report_type".to_string(), "10-K".to_string());
        assert!(build_vector_predicate(&only_unknown).is_none());
    }

    #[test]
    fn vector_predicate_escapes_quotes_and_combines_known_columns() {
        let mut filters = HashMap::new();
        filters.insert("company_name".to_string(), "O'Reilly".to_string());
        filters.insert("metric_category".to_string(), "ebitda".to_string());
        let predicate = build_vector_predicate(&filters).unwrap();
        assert!(predicate.contains("company_name = 'O''Reilly'"));
        assert!(predicate.contains("metric_category = 'ebitda'"));
        assert!(predicate.contains(" AND "));
    }
}
