//! C9 — Query Classifier.
//!
//! Heuristic, regex-only router: no LLM call sits on this path, so a query
//! classifies in well under a millisecond. The pattern sets and decision
//! tree are fixed by this engine's classifier contract — first match wins.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    VectorOnly,
    SqlOnly,
    Hybrid,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::VectorOnly => "vector_only",
            Classification::SqlOnly => "sql_only",
            Classification::Hybrid => "hybrid",
        }
    }
}

fn word_pattern(words: &[&str]) -> String {
    format!(r"(?i)\b({})\b", words.join("|"))
}

static TABLE_KEYWORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(&word_pattern(&["table", "row", "column", "cell"])).unwrap());

static SEMANTIC_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&word_pattern(&[
        "explain", "summarize", "why", "describe", "compare", "analyze", "how",
    ]))
    .unwrap()
});

static PRECISION_KEYWORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(&word_pattern(&["exact", "precise", "specific"])).unwrap());

static METRIC_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&word_pattern(&[
        "revenue",
        "ebitda",
        "margin",
        "cost",
        "expense",
        "capex",
        "opex",
        "production",
        "volume",
        "headcount",
        "fte",
        "variable cost",
        "fixed cost",
        "per ton",
        "raw materials",
    ]))
    .unwrap()
});

static TEMPORAL_TERMS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(q[1-4]|january|february|march|april|may|june|july|august|september|october|november|december|ytd|h1|h2|fy\s*\d{2,4}|last quarter|this year|current|latest|recent|historical|\d{4})\b",
    )
    .unwrap()
});

static NUMERIC_REFERENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d").unwrap());

/// Classifies a natural-language query in pure regex work, no LLM round-trip.
pub fn classify(query: &str) -> Classification {
    let has_table = TABLE_KEYWORDS.is_match(query);
    let has_semantic = SEMANTIC_KEYWORDS.is_match(query);
    let has_precision = PRECISION_KEYWORDS.is_match(query);
    let has_metric = METRIC_TERMS.is_match(query);
    let has_temporal = TEMPORAL_TERMS.is_match(query);
    let has_numeric = NUMERIC_REFERENCE.is_match(query);

    if has_table && !has_semantic {
        return Classification::SqlOnly;
    }
    if has_table && has_semantic {
        return Classification::Hybrid;
    }
    if has_semantic && (has_metric || has_temporal || has_numeric) {
        return Classification::Hybrid;
    }
    if has_semantic {
        return Classification::VectorOnly;
    }
    if has_metric && has_temporal {
        return Classification::SqlOnly;
    }
    if has_precision && has_metric && has_temporal {
        return Classification::SqlOnly;
    }
    Classification::Hybrid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_without_semantic_is_sql_only() {
        assert_eq!(classify("show me the table of production volumes"), Classification::SqlOnly);
    }

    #[test]
    fn table_with_semantic_is_hybrid() {
        assert_eq!(
            classify("explain this table of production volumes"),
            Classification::Hybrid
        );
    }

    #[test]
    fn semantic_alone_is_vector_only() {
        assert_eq!(classify("explain what happened this quarter"), Classification::VectorOnly);
    }

    #[test]
    fn semantic_with_metric_and_temporal_is_hybrid() {
        assert_eq!(
            classify("why did revenue change in Q3 2025"),
            Classification::Hybrid
        );
    }

    #[test]
    fn metric_and_temporal_without_semantic_is_sql_only() {
        assert_eq!(classify("revenue in Q3 2025"), Classification::SqlOnly);
    }

    #[test]
    fn no_matching_keywords_defaults_to_hybrid_not_vector_only() {
        assert_eq!(classify("what happened at the plant"), Classification::Hybrid);
    }

    #[test]
    fn empty_query_defaults_to_hybrid() {
        assert_eq!(classify(""), Classification::Hybrid);
    }

    #[test]
    fn runs_well_under_fifty_milliseconds() {
        let start = std::time::Instant::now();
        for _ in 0..1000 {
            classify("explain the exact revenue and ebitda for Q2 2025 in the table");
        }
        assert!(start.elapsed().as_millis() < 50);
    }
}
