//! C2 — Chunker.
//!
//! Splits parsed document elements into token-budgeted chunks: narrative text
//! via a sliding window with sentence-boundary backtracking, tables kept
//! atomic when they fit and split by row group (repeating the header) when
//! they don't. Headings are folded into the context prefix of the following
//! chunk rather than emitted as chunks of their own. Every chunk carries two
//! strings: `text` (stored, shown to the user) and `contextualized_text`
//! (document-context prefix prepended, used for embedding and full-text
//! indexing) — the contextual-retrieval approach of prefixing "Document: X.
//! Source: Y. Section: Z." before indexing, ported unchanged from this
//! engine's original character-based chunker.

use crate::error::ChunkingError;
use crate::types::ParsedElement;
use tiktoken_rs::CoreBPE;
use tracing::warn;

/// One structure-aware chunk before ordinal assignment and embedding.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub text: String,
    pub contextualized_text: String,
    pub page_numbers: Vec<usize>,
    pub is_table: bool,
    pub table_part: Option<String>,
    pub table_caption: Option<String>,
    pub token_count: usize,
}

pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    max_table_tokens: usize,
    bpe: CoreBPE,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize, max_table_tokens: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            max_table_tokens,
            // cl100k_base is the encoding used by the embedding/metadata LLMs this
            // engine talks to; token budgets are only meaningful relative to it.
            bpe: tiktoken_rs::cl100k_base().expect("cl100k_base vocab is bundled"),
        }
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Chunk a full element stream from the parser adapter into drafts ready
    /// for metadata extraction and embedding.
    pub fn chunk_elements(
        &self,
        elements: &[ParsedElement],
        doc_title: &str,
        doc_source: &str,
    ) -> Result<Vec<ChunkDraft>, ChunkingError> {
        if elements.is_empty() {
            return Ok(Vec::new());
        }

        let mut drafts = Vec::new();
        let mut pending_heading: Option<String> = None;

        for element in elements {
            match element {
                ParsedElement::Heading { text, .. } => {
                    pending_heading = Some(text.clone());
                }
                ParsedElement::TextBlock { text, page_number } => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let section = pending_heading.take();
                    let page_source = format!("{} (Page {})", doc_source, page_number);
                    for (chunk_text, token_count) in self.chunk_text_by_tokens(trimmed) {
                        let ctx = context_prefix(
                            doc_title,
                            &page_source,
                            section.as_deref().unwrap_or(&format!("Page {}", page_number)),
                        );
                        drafts.push(ChunkDraft {
                            contextualized_text: format!("{}{}", ctx, chunk_text),
                            text: chunk_text,
                            page_numbers: vec![*page_number],
                            is_table: false,
                            table_part: None,
                            table_caption: None,
                            token_count,
                        });
                    }
                }
                ParsedElement::Table {
                    rows,
                    header_rows,
                    caption,
                    page_number,
                    continuation_page_numbers,
                } => {
                    if rows.is_empty() {
                        continue;
                    }
                    let cap = caption.clone().or_else(|| pending_heading.take());
                    pending_heading = None;

                    let mut pages = vec![*page_number];
                    pages.extend(continuation_page_numbers.iter().copied());

                    let table_drafts = self.chunk_table(
                        header_rows,
                        rows,
                        cap.as_deref(),
                        doc_title,
                        doc_source,
                        &pages,
                    );
                    drafts.extend(table_drafts);
                }
            }
        }

        Ok(drafts)
    }

    /// Sliding-window token chunking with sentence-boundary backtracking.
    /// Encodes the whole section once, then walks the token stream in
    /// `chunk_size`-token windows, snapping each window's end back to the
    /// nearest paragraph/sentence/line/word boundary in the decoded text
    /// (paragraph > sentence > line > word, in that priority order) so chunks
    /// never end mid-sentence unless the text genuinely has no nearby break.
    fn chunk_text_by_tokens(&self, text: &str) -> Vec<(String, usize)> {
        let tokens = self.bpe.encode_with_special_tokens(text);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut result = Vec::new();
        let mut start = 0usize;

        while start < tokens.len() {
            let end = (start + self.chunk_size).min(tokens.len());
            let is_last = end >= tokens.len();
            let raw = self
                .bpe
                .decode(tokens[start..end].to_vec())
                .unwrap_or_default();

            let candidate = if is_last {
                raw
            } else {
                find_break_point(&raw).unwrap_or(raw)
            };

            let candidate = candidate.trim().to_string();
            if candidate.is_empty() {
                break;
            }
            let count = self.count_tokens(&candidate);
            result.push((candidate, count));

            let consumed = count.max(1);
            let step = if consumed > self.chunk_overlap {
                consumed - self.chunk_overlap
            } else {
                consumed
            };
            start += step;
        }

        result
    }

    /// Atomic-if-fits-else-split-by-row-group table chunking. Headers are
    /// repeated on every split part (invariant: a table split never loses its
    /// header). A single row that alone exceeds `max_table_tokens` is still
    /// emitted — as its own over-budget chunk — rather than corrupted by a
    /// mid-row split; see the per-chunk warning this logs.
    fn chunk_table(
        &self,
        header_rows: &[Vec<String>],
        rows: &[Vec<String>],
        caption: Option<&str>,
        doc_title: &str,
        doc_source: &str,
        pages: &[usize],
    ) -> Vec<ChunkDraft> {
        let cap = caption.unwrap_or("Table");
        let header_block = render_rows(header_rows);
        let page = pages.first().copied().unwrap_or(0);

        let full_body = format!("{}\n{}", header_block, render_rows(rows));
        let full_tokens = self.count_tokens(&full_body);

        if full_tokens <= self.max_table_tokens {
            let ctx = context_prefix(doc_title, doc_source, &format!("{} (Page {})", cap, page));
            return vec![ChunkDraft {
                contextualized_text: format!("{}{}", ctx, full_body),
                text: full_body,
                page_numbers: pages.to_vec(),
                is_table: true,
                table_part: None,
                table_caption: Some(cap.to_string()),
                token_count: full_tokens,
            }];
        }

        let header_tokens = self.count_tokens(&header_block);
        let mut drafts = Vec::new();
        let mut row_start = 0usize;

        while row_start < rows.len() {
            let mut row_end = row_start;
            let mut running = header_tokens;

            loop {
                if row_end >= rows.len() {
                    break;
                }
                let row_text = render_rows(&rows[row_end..row_end + 1]);
                let row_tokens = self.count_tokens(&row_text);

                if row_end == row_start && header_tokens + row_tokens > self.max_table_tokens {
                    // This single row cannot fit even alone under the header.
                    // Emit it over-budget rather than split mid-row.
                    warn!(
                        rows = row_end - row_start + 1,
                        tokens = header_tokens + row_tokens,
                        budget = self.max_table_tokens,
                        "table row exceeds max_table_tokens; emitting over-budget chunk"
                    );
                    row_end += 1;
                    running = header_tokens + row_tokens;
                    break;
                }
                if running + row_tokens > self.max_table_tokens {
                    break;
                }
                running += row_tokens;
                row_end += 1;
            }
            if row_end == row_start {
                row_end = row_start + 1;
            }

            let body = format!("{}\n{}", header_block, render_rows(&rows[row_start..row_end]));
            let part_no = drafts.len() + 1;
            let ctx = context_prefix(
                doc_title,
                doc_source,
                &format!("{} (Page {}, part {})", cap, page, part_no),
            );
            drafts.push(ChunkDraft {
                contextualized_text: format!("{}{}", ctx, body),
                token_count: self.count_tokens(&body),
                text: body,
                page_numbers: pages.to_vec(),
                is_table: true,
                table_part: Some(format!("{} of ?", part_no)),
                table_caption: Some(cap.to_string()),
            });

            row_start = row_end;
        }

        let total = drafts.len();
        for (i, draft) in drafts.iter_mut().enumerate() {
            draft.table_part = Some(format!("{} of {}", i + 1, total));
        }

        drafts
    }
}

fn render_rows(rows: &[Vec<String>]) -> String {
    rows.iter()
        .map(|row| format!("| {} |", row.join(" | ")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn context_prefix(doc_title: &str, doc_source: &str, section: &str) -> String {
    format!(
        "Document: \"{}\". Source: {}. Section: {}. ",
        doc_title, doc_source, section
    )
}

/// Search the tail of `text` for a break point, preferring a paragraph break,
/// then a sentence end, then a line break, then a word break.
fn find_break_point(text: &str) -> Option<String> {
    let tail_start = if text.len() > 400 { text.len() - 400 } else { 0 };
    let tail_start = snap_to_char_boundary(text, tail_start);
    let search_region = &text[tail_start..];

    let cut = if let Some(pos) = search_region.rfind("\n\n") {
        Some(tail_start + pos + 2)
    } else if let Some(pos) = search_region.rfind(". ") {
        Some(tail_start + pos + 2)
    } else if let Some(pos) = search_region.rfind(".\n") {
        Some(tail_start + pos + 2)
    } else if let Some(pos) = search_region.rfind('\n') {
        Some(tail_start + pos + 1)
    } else {
        search_region.rfind(' ').map(|pos| tail_start + pos + 1)
    };

    cut.map(|c| text[..snap_to_char_boundary(text, c)].to_string())
}

fn snap_to_char_boundary(text: &str, pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    let mut p = pos;
    while p > 0 && !text.is_char_boundary(p) {
        p -= 1;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker() -> Chunker {
        Chunker::new(50, 10, 200)
    }

    #[test]
    fn empty_input_yields_zero_chunks() {
        let c = chunker();
        assert_eq!(c.chunk_elements(&[], "doc", "doc.pdf").unwrap(), Vec::new());
    }

    #[test]
    fn small_text_block_yields_single_chunk() {
        let c = chunker();
        let elements = vec![ParsedElement::TextBlock {
            text: "Revenue grew 12% year over year.".to_string(),
            page_number: 1,
        }];
        let drafts = c.chunk_elements(&elements, "10-K", "10-k.pdf").unwrap();
        assert_eq!(drafts.len(), 1);
        assert!(!drafts[0].is_table);
        assert!(drafts[0].contextualized_text.contains("10-K"));
    }

    #[test]
    fn small_table_stays_atomic() {
        let c = chunker();
        let elements = vec![ParsedElement::Table {
            header_rows: vec![vec!["Metric".to_string(), "Value".to_string()]],
            rows: vec![vec!["Revenue".to_string(), "120".to_string()]],
            caption: Some("Q3 Revenue".to_string()),
            page_number: 4,
            continuation_page_numbers: vec![],
        }];
        let drafts = c.chunk_elements(&elements, "10-K", "10-k.pdf").unwrap();
        assert_eq!(drafts.len(), 1);
        assert!(drafts[0].is_table);
        assert!(drafts[0].table_part.is_none());
    }

    #[test]
    fn table_exactly_at_max_table_tokens_is_one_chunk() {
        let header_rows = vec![vec!["Metric".to_string(), "Value".to_string()]];
        let rows = vec![vec!["Revenue".to_string(), "120".to_string()]];
        let probe = Chunker::new(50, 10, usize::MAX);
        let full_body = format!("{}\n{}", render_rows(&header_rows), render_rows(&rows));
        let exact = probe.count_tokens(&full_body);

        let c = Chunker::new(50, 10, exact);
        let elements = vec![ParsedElement::Table {
            header_rows,
            rows,
            caption: Some("Q3 Revenue".to_string()),
            page_number: 4,
            continuation_page_numbers: vec![],
        }];
        let drafts = c.chunk_elements(&elements, "10-K", "10-k.pdf").unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].token_count, exact);
        assert!(drafts[0].table_part.is_none());
    }

    #[test]
    fn table_one_token_over_budget_splits_into_multiple_parts() {
        let header_rows = vec![vec!["Metric".to_string(), "Value".to_string()]];
        let rows = vec![
            vec!["Revenue".to_string(), "120".to_string()],
            vec!["Expenses".to_string(), "80".to_string()],
        ];
        let probe = Chunker::new(50, 10, usize::MAX);
        let full_body = format!("{}\n{}", render_rows(&header_rows), render_rows(&rows));
        let exact = probe.count_tokens(&full_body);

        let c = Chunker::new(50, 10, exact - 1);
        let elements = vec![ParsedElement::Table {
            header_rows,
            rows,
            caption: Some("Q3 Revenue".to_string()),
            page_number: 4,
            continuation_page_numbers: vec![],
        }];
        let drafts = c.chunk_elements(&elements, "10-K", "10-k.pdf").unwrap();
        assert!(drafts.len() >= 2);
        for d in &drafts {
            assert!(d.text.contains("Metric"));
            assert!(d.table_part.is_some());
        }
    }

    #[test]
    fn large_table_splits_with_repeated_header() {
        let c = Chunker::new(50, 10, 40);
        let rows: Vec<Vec<String>> = (0..50)
            .map(|i| vec![format!("Line item {i}"), format!("{}", i * 10)])
            .collect();
        let elements = vec![ParsedElement::Table {
            header_rows: vec![vec!["Metric".to_string(), "Value".to_string()]],
            rows,
            caption: Some("Expense Breakdown".to_string()),
            page_number: 9,
            continuation_page_numbers: vec![10],
        }];
        let drafts = c.chunk_elements(&elements, "10-K", "10-k.pdf").unwrap();
        assert!(drafts.len() > 1);
        for d in &drafts {
            assert!(d.text.contains("Metric"));
            assert!(d.table_part.is_some());
        }
    }

    #[test]
    fn heading_is_folded_into_following_chunk_context_not_its_own_chunk() {
        let c = chunker();
        let elements = vec![
            ParsedElement::Heading {
                text: "Liquidity".to_string(),
                level: 1,
                page_number: 2,
            },
            ParsedElement::TextBlock {
                text: "Cash and equivalents totaled $40M at quarter end.".to_string(),
                page_number: 2,
            },
        ];
        let drafts = c.chunk_elements(&elements, "10-K", "10-k.pdf").unwrap();
        assert_eq!(drafts.len(), 1);
        assert!(drafts[0].contextualized_text.contains("Liquidity"));
    }
}
