//! C11 — Scoring & Fusion.
//!
//! Merges ranked id lists from the vector store and the structured/lexical
//! store into one ranked list of `(chunk_id, fused_score, source)` triples.
//! The three fusion algorithms below are unchanged in shape from this
//! engine's original hybrid-search module — they operate purely on
//! `(String, f32, u32)` rank lists (id, score, chunk ordinal) — only the
//! result type they emit into has changed, from a document-search wrapper to
//! `ResultSource`.

use crate::types::{ResultSource, SearchResult};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Accumulator for one chunk id while a fusion pass folds both rank lists
/// together. `vector_score` and `ordinal` exist purely to feed the final
/// tie-break — they are dropped once `finish` sorts and truncates.
struct ScoreEntry {
    score: f32,
    source: ResultSource,
    vector_score: Option<f32>,
    ordinal: u32,
}

/// Reciprocal Rank Fusion — merges ranked lists without score normalization.
/// Formula: rrf_score(doc) = Σ 1/(k + rank_i) for each list containing doc.
pub fn reciprocal_rank_fusion(
    vector_results: &[(String, f32, u32)],
    sql_results: &[(String, f32, u32)],
    k: usize,
    top_k: usize,
) -> Vec<(String, f32, ResultSource)> {
    let mut scores: HashMap<String, ScoreEntry> = HashMap::new();

    for (rank, (id, score, ordinal)) in vector_results.iter().enumerate() {
        let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
        scores
            .entry(id.clone())
            .and_modify(|e| {
                e.score += rrf;
                e.source = ResultSource::Both;
            })
            .or_insert(ScoreEntry {
                score: rrf,
                source: ResultSource::Vector,
                vector_score: Some(*score),
                ordinal: *ordinal,
            });
    }

    for (rank, (id, _score, ordinal)) in sql_results.iter().enumerate() {
        let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
        scores
            .entry(id.clone())
            .and_modify(|e| {
                e.score += rrf;
                e.source = ResultSource::Both;
            })
            .or_insert(ScoreEntry {
                score: rrf,
                source: ResultSource::Sql,
                vector_score: None,
                ordinal: *ordinal,
            });
    }

    finish(scores, top_k, true)
}

/// Standard RRF weighted by normalized original similarity/BM25 scores, so
/// high-confidence matches get a boost instead of being reduced to rank alone.
/// `score_weight` of 0.0 degenerates to plain RRF.
pub fn score_aware_rrf(
    vector_results: &[(String, f32, u32)],
    sql_results: &[(String, f32, u32)],
    k: usize,
    top_k: usize,
    score_weight: f32,
) -> Vec<(String, f32, ResultSource)> {
    let vec_norm = normalize_minmax(vector_results);
    let sql_norm = normalize_minmax(sql_results);

    let mut scores: HashMap<String, ScoreEntry> = HashMap::new();

    for (rank, (id, score, ordinal)) in vector_results.iter().enumerate() {
        let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
        let orig = vec_norm.get(id).copied().unwrap_or(0.0);
        let combined = rrf * (1.0 + score_weight * orig);
        scores
            .entry(id.clone())
            .and_modify(|e| {
                e.score += combined;
                e.source = ResultSource::Both;
            })
            .or_insert(ScoreEntry {
                score: combined,
                source: ResultSource::Vector,
                vector_score: Some(*score),
                ordinal: *ordinal,
            });
    }

    for (rank, (id, _score, ordinal)) in sql_results.iter().enumerate() {
        let rrf = 1.0 / (k as f32 + rank as f32 + 1.0);
        let orig = sql_norm.get(id).copied().unwrap_or(0.0);
        let combined = rrf * (1.0 + score_weight * orig);
        scores
            .entry(id.clone())
            .and_modify(|e| {
                e.score += combined;
                e.source = ResultSource::Both;
            })
            .or_insert(ScoreEntry {
                score: combined,
                source: ResultSource::Sql,
                vector_score: None,
                ordinal: *ordinal,
            });
    }

    finish(scores, top_k, true)
}

/// Alpha-blends min-max normalized vector and SQL/lexical scores.
pub fn weighted_fusion(
    vector_results: &[(String, f32, u32)],
    sql_results: &[(String, f32, u32)],
    alpha: f32,
    top_k: usize,
) -> Vec<(String, f32, ResultSource)> {
    let norm_vec = normalize_minmax(vector_results);
    let norm_sql = normalize_minmax(sql_results);
    let raw_vec_scores: HashMap<String, f32> =
        vector_results.iter().map(|(id, s, _)| (id.clone(), *s)).collect();
    let ordinals: HashMap<String, u32> = vector_results
        .iter()
        .map(|(id, _, o)| (id.clone(), *o))
        .chain(sql_results.iter().map(|(id, _, o)| (id.clone(), *o)))
        .collect();

    let mut scores: HashMap<String, ScoreEntry> = HashMap::new();

    for (id, score) in &norm_vec {
        scores.insert(
            id.clone(),
            ScoreEntry {
                score: alpha * score,
                source: ResultSource::Vector,
                vector_score: raw_vec_scores.get(id).copied(),
                ordinal: ordinals.get(id).copied().unwrap_or(0),
            },
        );
    }

    for (id, score) in &norm_sql {
        scores
            .entry(id.clone())
            .and_modify(|e| {
                e.score += (1.0 - alpha) * score;
                e.source = ResultSource::Both;
            })
            .or_insert(ScoreEntry {
                score: (1.0 - alpha) * score,
                source: ResultSource::Sql,
                vector_score: None,
                ordinal: ordinals.get(id).copied().unwrap_or(0),
            });
    }

    finish(scores, top_k, false)
}

fn normalize_minmax(results: &[(String, f32, u32)]) -> HashMap<String, f32> {
    if results.is_empty() {
        return HashMap::new();
    }
    let max = results.iter().map(|(_, s, _)| *s).fold(f32::MIN, f32::max);
    let min = results.iter().map(|(_, s, _)| *s).fold(f32::MAX, f32::min);
    if (max - min).abs() < 1e-9 {
        return results.iter().map(|(id, _, _)| (id.clone(), 0.5)).collect();
    }
    let range = max - min;
    results
        .iter()
        .map(|(id, s, _)| (id.clone(), (s - min) / range))
        .collect()
}

/// Descending comparison of optional vector scores for the tie-break: a
/// chunk that was actually seen by the vector store outranks one that
/// wasn't, and higher raw vector score outranks lower.
fn cmp_vector_score_desc(a: &Option<f32>, b: &Option<f32>) -> Ordering {
    match (a, b) {
        (Some(av), Some(bv)) => bv.partial_cmp(av).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Sorts by fused score descending, ties broken by vector score then by
/// chunk ordinal per spec.md:176, truncates to `top_k`, and — for the RRF
/// variants, whose raw scores live in a 0.01-0.05 range — rescales by the
/// top score so `fused_score` lands in `[0, 1]` per invariant 4.
fn finish(
    scores: HashMap<String, ScoreEntry>,
    top_k: usize,
    rescale_to_unit: bool,
) -> Vec<(String, f32, ResultSource)> {
    let mut merged: Vec<(String, ScoreEntry)> = scores.into_iter().collect();

    merged.sort_by(|a, b| {
        b.1.score
            .partial_cmp(&a.1.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| cmp_vector_score_desc(&a.1.vector_score, &b.1.vector_score))
            .then_with(|| a.1.ordinal.cmp(&b.1.ordinal))
    });
    merged.truncate(top_k);

    let mut merged: Vec<(String, f32, ResultSource)> = merged
        .into_iter()
        .map(|(id, e)| (id, e.score, e.source))
        .collect();

    if rescale_to_unit {
        if let Some(max_score) = merged.first().map(|(_, s, _)| *s) {
            if max_score > 0.0 {
                for item in &mut merged {
                    item.1 = (item.1 / max_score).clamp(0.0, 1.0);
                }
            }
        }
    } else {
        for item in &mut merged {
            item.1 = item.1.clamp(0.0, 1.0);
        }
    }

    merged
}

/// Collapses near-duplicate results by word-set Jaccard similarity on their
/// text, highest-`fused_score` survivor kept per cluster. This is a separate
/// concern from the exact-`chunk_id` dedupe `finish` already performs above:
/// overlapping sliding-window text chunks (spec §4.2's `chunk_overlap`) can
/// produce two distinct chunk ids whose text is nearly identical, which
/// exact-id dedupe does not catch. Results are assumed already sorted
/// descending by `fused_score`; ties and ordering are preserved among
/// survivors.
pub fn dedupe_near_duplicates(results: Vec<SearchResult>, threshold: f32) -> Vec<SearchResult> {
    let word_sets: Vec<HashSet<&str>> = results
        .iter()
        .map(|r| r.text.split_whitespace().collect())
        .collect();

    let mut kept_indices = Vec::new();
    for i in 0..results.len() {
        let mut is_dup = false;
        for &j in &kept_indices {
            let intersection = word_sets[i].intersection(&word_sets[j]).count();
            let union = word_sets[i].union(&word_sets[j]).count();
            if union > 0 && (intersection as f32 / union as f32) > threshold {
                is_dup = true;
                break;
            }
        }
        if !is_dup {
            kept_indices.push(i);
        }
    }

    let keep: HashSet<usize> = kept_indices.into_iter().collect();
    results
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, r)| r)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rrf_prefers_items_ranked_highly_in_both_lists() {
        let vector = vec![("a".to_string(), 0.9, 0), ("b".to_string(), 0.5, 1)];
        let sql = vec![("a".to_string(), 0.8, 0), ("c".to_string(), 0.4, 2)];
        let fused = reciprocal_rank_fusion(&vector, &sql, 60, 10);
        assert_eq!(fused[0].0, "a");
        assert_eq!(fused[0].2, ResultSource::Both);
    }

    #[test]
    fn fused_scores_stay_within_unit_interval() {
        let vector = vec![("a".to_string(), 5.0, 0), ("b".to_string(), 1.0, 1)];
        let sql = vec![("b".to_string(), 3.0, 1)];
        for fused in [
            reciprocal_rank_fusion(&vector, &sql, 60, 10),
            score_aware_rrf(&vector, &sql, 60, 10, 0.5),
            weighted_fusion(&vector, &sql, 0.6, 10),
        ] {
            for (_, score, _) in fused {
                assert!((0.0..=1.0).contains(&score));
            }
        }
    }

    #[test]
    fn equal_fused_and_vector_score_falls_back_to_chunk_ordinal() {
        // "b" and "a" have identical raw vector scores and no sql side, so
        // their fused scores and vector scores tie exactly; the final
        // tie-break must be ascending chunk ordinal, not chunk id.
        let vector = vec![("b".to_string(), 1.0, 9), ("a".to_string(), 1.0, 3)];
        let sql: Vec<(String, f32, u32)> = vec![];
        let fused = weighted_fusion(&vector, &sql, 0.6, 10);
        assert_eq!(fused[0].0, "a");
        assert_eq!(fused[1].0, "b");
    }

    #[test]
    fn equal_fused_score_with_a_vector_hit_outranks_a_lexical_only_hit() {
        // Both "a" (vector-only, rank 0) and "b" (sql-only, rank 0) earn the
        // same rrf contribution from their sole list, but "a" carries a
        // vector score and "b" does not — "a" must sort first.
        let vector = vec![("a".to_string(), 0.3, 0)];
        let sql = vec![("b".to_string(), 0.9, 1)];
        let fused = reciprocal_rank_fusion(&vector, &sql, 60, 10);
        assert_eq!(fused[0].0, "a");
        assert_eq!(fused[1].0, "b");
    }

    #[test]
    fn weighted_fusion_is_monotonic_in_one_sides_score() {
        let vector = vec![("a".to_string(), 0.2, 0), ("b".to_string(), 0.9, 1), ("c".to_string(), 0.4, 2)];
        let sql_lower = vec![("a".to_string(), 0.0, 0), ("b".to_string(), 1.0, 1), ("c".to_string(), 0.5, 2)];
        let sql_higher = vec![("a".to_string(), 0.0, 0), ("b".to_string(), 1.0, 1), ("c".to_string(), 0.7, 2)];

        let fused_lower = weighted_fusion(&vector, &sql_lower, 0.6, 10);
        let fused_higher = weighted_fusion(&vector, &sql_higher, 0.6, 10);

        let score_lower = fused_lower.iter().find(|(id, _, _)| id == "c").unwrap().1;
        let score_higher = fused_higher.iter().find(|(id, _, _)| id == "c").unwrap().1;
        assert!(
            score_higher >= score_lower,
            "raising c's sql score must not lower its fused score: {score_higher} < {score_lower}"
        );
    }

    #[test]
    fn fused_lists_never_duplicate_a_chunk_id() {
        let vector = vec![("a".to_string(), 0.9, 0), ("b".to_string(), 0.5, 1)];
        let sql = vec![("a".to_string(), 0.8, 0), ("b".to_string(), 0.3, 1), ("c".to_string(), 0.4, 2)];
        for fused in [
            reciprocal_rank_fusion(&vector, &sql, 60, 10),
            score_aware_rrf(&vector, &sql, 60, 10, 0.5),
            weighted_fusion(&vector, &sql, 0.6, 10),
        ] {
            let mut ids: Vec<&str> = fused.iter().map(|(id, _, _)| id.as_str()).collect();
            let count_before = ids.len();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), count_before, "fused list contained a duplicate chunk id");
        }
    }

    fn sample_result(chunk_id: uuid::Uuid, text: &str, fused_score: f32) -> SearchResult {
        SearchResult {
            chunk_id,
            text: text.to_string(),
            source: ResultSource::Vector,
            document_id: "doc-1".to_string(),
            page_number: 1,
            raw_score: fused_score,
            fused_score,
            citation: crate::types::Citation {
                document_name: "doc.pdf".to_string(),
                page_number: 1,
                table_part: None,
            },
        }
    }

    #[test]
    fn near_duplicate_collapse_keeps_the_higher_scoring_survivor() {
        let a = sample_result(uuid::Uuid::new_v4(), "variable cost per ton rose in Iberia this quarter", 0.9);
        let b = sample_result(uuid::Uuid::new_v4(), "variable cost per ton rose in Iberia this quarter.", 0.7);
        let c = sample_result(uuid::Uuid::new_v4(), "headcount declined across the cement division", 0.5);

        let deduped = dedupe_near_duplicates(vec![a.clone(), b, c], 0.75);

        assert_eq!(deduped.len(), 2);
        assert!(deduped.iter().any(|r| r.chunk_id == a.chunk_id));
    }

    #[test]
    fn near_duplicate_collapse_keeps_genuinely_distinct_results() {
        let a = sample_result(uuid::Uuid::new_v4(), "variable cost per ton rose in Iberia", 0.9);
        let b = sample_result(uuid::Uuid::new_v4(), "EBITDA margin improved in Portugal Cement", 0.8);

        let deduped = dedupe_near_duplicates(vec![a, b], 0.75);
        assert_eq!(deduped.len(), 2);
    }
}
