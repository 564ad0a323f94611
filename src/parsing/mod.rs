//! C1 — Document Parser Adapter.
//!
//! Wraps PDF text/table/structure extraction behind a small trait so the
//! ingestion orchestrator never depends on a concrete parser. The real
//! implementation layers `pdf-extract` (fast path) over `lopdf` content-stream
//! parsing (fallback + structured extraction of form fields, annotations and
//! heading/table candidates), mirroring the two-layer strategy used for plain
//! PDF text extraction elsewhere in the ecosystem.

pub mod lopdf_parser;

use crate::error::ParseError;
use crate::types::ParsedElement;
use std::path::Path;
use tracing::debug;

/// `parse(path) -> ordered stream of ParsedElement` (spec §4.1). The stream is
/// single-pass, finite, restartable only by re-parsing.
pub trait DocumentParserAdapter: Send + Sync {
    fn parse(&self, path: &Path) -> Result<Vec<ParsedElement>, ParseError>;
}

/// The production adapter: pdf-extract for fast linear text, lopdf for
/// content-stream fallback, form fields and per-page structure.
pub struct PdfParserAdapter;

impl PdfParserAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Score how likely extracted text is garbled from multi-column merging.
    /// 0.0 (clean) to 1.0 (heavily garbled). Lines with 3+ consecutive spaces
    /// or repeated tabs are the hallmark of column-merge artifacts that
    /// `pdf_extract` introduces on multi-column financial reports.
    fn column_garble_score(text: &str) -> f64 {
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() < 3 {
            return 0.0;
        }

        let mut garbled_lines = 0usize;
        let mut scored_lines = 0usize;

        for line in &lines {
            if line.len() < 15 {
                continue;
            }
            scored_lines += 1;

            let gap_count = line
                .as_bytes()
                .windows(3)
                .filter(|w| w.iter().all(|&b| b == b' '))
                .count();
            let tab_count = line.chars().filter(|&c| c == '\t').count();

            if gap_count >= 1 || tab_count >= 2 {
                garbled_lines += 1;
            }
        }

        if scored_lines == 0 {
            return 0.0;
        }
        garbled_lines as f64 / scored_lines as f64
    }

    /// Split a page's raw text into `ParsedElement`s: consecutive lines with a
    /// regular multi-column whitespace/pipe layout become a `Table`; a short
    /// all-caps or title-cased standalone line becomes a `Heading`; everything
    /// else accumulates into `TextBlock`s.
    fn segment_page(&self, page_number: usize, text: &str) -> Vec<ParsedElement> {
        let mut elements = Vec::new();
        let lines: Vec<&str> = text.lines().collect();
        let mut i = 0;
        let mut text_buf = String::new();

        let flush_text = |buf: &mut String, elements: &mut Vec<ParsedElement>| {
            let trimmed = buf.trim();
            if !trimmed.is_empty() {
                elements.push(ParsedElement::TextBlock {
                    text: trimmed.to_string(),
                    page_number,
                });
            }
            buf.clear();
        };

        while i < lines.len() {
            let line = lines[i];

            if is_heading_candidate(line) {
                flush_text(&mut text_buf, &mut elements);
                elements.push(ParsedElement::Heading {
                    text: line.trim().to_string(),
                    level: 1,
                    page_number,
                });
                i += 1;
                continue;
            }

            if is_table_row(line) {
                let mut table_lines = vec![line];
                let mut j = i + 1;
                while j < lines.len() && is_table_row(lines[j]) {
                    table_lines.push(lines[j]);
                    j += 1;
                }
                if table_lines.len() >= 2 {
                    flush_text(&mut text_buf, &mut elements);
                    let mut rows: Vec<Vec<String>> = table_lines
                        .iter()
                        .map(|l| split_table_row(l))
                        .collect();
                    let header_rows = vec![rows.remove(0)];
                    elements.push(ParsedElement::Table {
                        rows,
                        header_rows,
                        caption: None,
                        page_number,
                        continuation_page_numbers: Vec::new(),
                    });
                    i = j;
                    continue;
                }
            }

            text_buf.push_str(line);
            text_buf.push('\n');
            i += 1;
        }

        flush_text(&mut text_buf, &mut elements);
        elements
    }
}

impl Default for PdfParserAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentParserAdapter for PdfParserAdapter {
    fn parse(&self, path: &Path) -> Result<Vec<ParsedElement>, ParseError> {
        let bytes = std::fs::read(path).map_err(|source| ParseError::Io {
            path: path.display().to_string(),
            source,
        })?;

        // Layer 1: pdf_extract for fast text extraction.
        let fast_text = pdf_extract::extract_text_from_mem(&bytes).ok().map(|t| {
            t.lines()
                .map(|l| l.trim())
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        });

        let use_fast_path = fast_text
            .as_ref()
            .map(|t| !t.is_empty() && Self::column_garble_score(t) < 0.25)
            .unwrap_or(false);

        if use_fast_path {
            let text = fast_text.unwrap();
            // pdf_extract does not carry page boundaries; treat as one page.
            return Ok(self.segment_page(1, &text));
        }

        // Layer 2: lopdf content-stream parsing, with real per-page boundaries.
        let parsed = lopdf_parser::LoPdfParser::parse(path)
            .map_err(|e| ParseError::MalformedPdf(e.to_string()))?;

        debug!(
            pages = parsed.page_count(),
            chars = parsed.full_text().len(),
            "lopdf content-stream parse complete"
        );

        if parsed.pages.iter().all(|p| p.text.trim().is_empty()) {
            if let Some(text) = fast_text.filter(|t| !t.trim().is_empty()) {
                return Ok(self.segment_page(1, &text));
            }
            // No flowing narrative text at all (e.g. a pure form/cover sheet);
            // fall back to whatever form fields and annotations lopdf found so
            // a document with real content doesn't hard-fail extraction.
            let relationship_text = parsed.build_relationship_text();
            if !relationship_text.trim().is_empty() {
                return Ok(vec![ParsedElement::TextBlock {
                    text: relationship_text,
                    page_number: 0,
                }]);
            }
            return Err(ParseError::NoExtractableText(path.display().to_string()));
        }

        let mut elements = Vec::new();
        for page in &parsed.pages {
            if page.text.trim().is_empty() {
                continue;
            }
            elements.extend(self.segment_page(page.page_number, &page.text));
        }

        let form_pairs = parsed.form_field_pairs();
        if !form_pairs.is_empty() {
            let mut body = String::new();
            for (k, v) in &form_pairs {
                body.push_str(k);
                body.push_str(": ");
                body.push_str(v);
                body.push('\n');
            }
            elements.push(ParsedElement::TextBlock {
                text: body.trim().to_string(),
                page_number: 0,
            });
        }

        let named_annotations: Vec<(String, String)> = parsed
            .annotation_pairs()
            .into_iter()
            .filter(|(name, _)| !name.is_empty())
            .collect();
        if !named_annotations.is_empty() {
            let mut body = String::new();
            for (k, v) in &named_annotations {
                body.push_str(k);
                body.push_str(": ");
                body.push_str(v);
                body.push('\n');
            }
            elements.push(ParsedElement::TextBlock {
                text: body.trim().to_string(),
                page_number: 0,
            });
        }

        if elements.is_empty() {
            return Err(ParseError::NoExtractableText(path.display().to_string()));
        }

        Ok(elements)
    }
}

/// A short, title-cased or all-caps line with no trailing punctuation is
/// treated as a heading rather than narrative text.
fn is_heading_candidate(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.len() > 80 {
        return false;
    }
    if trimmed.ends_with('.') || trimmed.ends_with(',') {
        return false;
    }
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if words.is_empty() || words.len() > 10 {
        return false;
    }
    let all_caps = trimmed.chars().filter(|c| c.is_alphabetic()).all(|c| c.is_uppercase());
    let title_case = words.iter().all(|w| {
        w.chars()
            .next()
            .map(|c| c.is_uppercase())
            .unwrap_or(true)
    });
    all_caps || title_case
}

/// A row with 2+ whitespace-gap or pipe-delimited columns, the hallmark of a
/// tabular line in extracted PDF text.
fn is_table_row(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.matches('|').count() >= 2 {
        return true;
    }
    let gap_runs = count_column_gaps(trimmed);
    gap_runs >= 2
}

fn count_column_gaps(line: &str) -> usize {
    let bytes = line.as_bytes();
    let mut gaps = 0;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b' ' && bytes[i + 1] == b' ' {
            gaps += 1;
            while i < bytes.len() && bytes[i] == b' ' {
                i += 1;
            }
        } else {
            i += 1;
        }
    }
    gaps
}

fn split_table_row(line: &str) -> Vec<String> {
    let trimmed = line.trim();
    if trimmed.matches('|').count() >= 2 {
        return trimmed
            .split('|')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
    }
    trimmed
        .split("  ")
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

/// Test double that replays a fixed element list, used by chunker/ingest tests
/// so they do not depend on real PDF bytes.
pub struct NullParserAdapter {
    elements: Vec<ParsedElement>,
}

impl NullParserAdapter {
    pub fn new(elements: Vec<ParsedElement>) -> Self {
        Self { elements }
    }
}

impl DocumentParserAdapter for NullParserAdapter {
    fn parse(&self, _path: &Path) -> Result<Vec<ParsedElement>, ParseError> {
        Ok(self.elements.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading_candidate_detects_title_case_short_line() {
        assert!(is_heading_candidate("Financial Summary"));
        assert!(!is_heading_candidate(
            "This is a long narrative sentence that ends with a period."
        ));
    }

    #[test]
    fn table_row_detects_pipe_and_gap_layouts() {
        assert!(is_table_row("Revenue | 120.5 | 98.2"));
        assert!(is_table_row("Revenue        120.5        98.2"));
        assert!(!is_table_row("This is a normal sentence."));
    }

    #[test]
    fn null_adapter_replays_fixed_elements() {
        let elements = vec![ParsedElement::TextBlock {
            text: "hello".to_string(),
            page_number: 1,
        }];
        let adapter = NullParserAdapter::new(elements.clone());
        let out = adapter.parse(Path::new("irrelevant.pdf")).unwrap();
        assert_eq!(out.len(), 1);
    }
}
