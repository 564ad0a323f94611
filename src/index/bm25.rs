//! C7 — BM25 Index (Tantivy).
//!
//! Sparse lexical index over chunk text, rebuilt alongside the vector store
//! on every ingest so the two stay linked 1:1 per document (invariant 1).
//! `id` is indexed as `STRING | STORED` rather than `STORED`-only — a
//! stored-only id field makes `delete_term` silently a no-op, a migration
//! this engine has hit before, so a schema check rebuilds any index that
//! predates the fix.

use anyhow::{Context, Result};
use std::path::Path;
use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{self, Schema, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

pub struct Bm25Index {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    id_field: schema::Field,
    text_field: schema::Field,
    document_id_field: schema::Field,
}

impl Bm25Index {
    fn build_schema() -> (Schema, schema::Field, schema::Field, schema::Field) {
        let mut sb = Schema::builder();
        let id_field = sb.add_text_field("id", STRING | STORED);
        let text_field = sb.add_text_field("text", TEXT | STORED);
        let document_id_field = sb.add_text_field("document_id", STRING | STORED);
        (sb.build(), id_field, text_field, document_id_field)
    }

    fn needs_schema_migration(index: &Index) -> bool {
        let schema = index.schema();
        let id_field = match schema.get_field("id") {
            Ok(f) => f,
            Err(_) => return true,
        };
        !schema.get_field_entry(id_field).is_indexed()
    }

    pub fn new(path: &str) -> Result<Self> {
        let index_path = Path::new(path).join("tantivy_index");
        std::fs::create_dir_all(&index_path).ok();

        let (schema, id_field, text_field, document_id_field) = Self::build_schema();

        let needs_rebuild = {
            let dir = tantivy::directory::MmapDirectory::open(&index_path)?;
            if Index::exists(&dir)? {
                let existing = Index::open_in_dir(&index_path)?;
                let migrate = Self::needs_schema_migration(&existing);
                drop(existing);
                migrate
            } else {
                false
            }
        };

        let index = if needs_rebuild {
            tracing::warn!(
                "Tantivy index has a STORED-only id field; rebuilding with STRING|STORED \
                 so deletions take effect. Existing entries will be re-indexed on next ingest."
            );
            std::fs::remove_dir_all(&index_path).ok();
            std::fs::create_dir_all(&index_path)?;
            Index::create_in_dir(&index_path, schema.clone())?
        } else {
            let dir = tantivy::directory::MmapDirectory::open(&index_path)?;
            if Index::exists(&dir)? {
                Index::open_in_dir(&index_path)?
            } else {
                Index::create_in_dir(&index_path, schema.clone())?
            }
        };

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("failed to create Tantivy reader")?;
        let writer = index.writer(50_000_000).context("failed to create Tantivy writer")?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            id_field,
            text_field,
            document_id_field,
        })
    }

    pub fn index_chunk(&self, id: &str, text: &str, document_id: &str) -> Result<()> {
        let writer = self.writer.lock();
        writer.add_document(doc!(
            self.id_field => id,
            self.text_field => text,
            self.document_id_field => document_id,
        ))?;
        Ok(())
    }

    pub fn index_chunks_batch(&self, chunks: &[(String, String, String)]) -> Result<()> {
        let writer = self.writer.lock();
        for (id, text, document_id) in chunks {
            writer.add_document(doc!(
                self.id_field => id.as_str(),
                self.text_field => text.as_str(),
                self.document_id_field => document_id.as_str(),
            ))?;
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.commit().context("Tantivy commit failed")?;
        self.reader.reload()?;
        Ok(())
    }

    pub fn search(&self, query: &str, k: usize) -> Result<Vec<(String, f32)>> {
        let searcher = self.reader.searcher();
        let query_parser = QueryParser::for_index(&self.index, vec![self.text_field]);

        let parsed_query = match query_parser.parse_query(query) {
            Ok(q) => q,
            Err(_) => {
                let escaped = query.replace('"', "");
                query_parser.parse_query(&format!("\"{}\"", escaped))?
            }
        };

        let top_docs = searcher.search(&parsed_query, &TopDocs::with_limit(k))?;
        let mut results = Vec::with_capacity(top_docs.len());
        for (score, doc_address) in top_docs {
            if let Ok(doc) = searcher.doc::<TantivyDocument>(doc_address) {
                if let Some(id_val) = doc.get_first(self.id_field) {
                    if let Some(id_text) = id_val.as_str() {
                        results.push((id_text.to_string(), score));
                    }
                }
            }
        }
        Ok(results)
    }

    pub fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        self.reader.reload().ok();
        let searcher = self.reader.searcher();
        let mut writer = self.writer.lock();
        let mut deleted = 0usize;

        for segment_reader in searcher.segment_readers() {
            let store_reader = segment_reader.get_store_reader(64)?;
            for doc_id in 0..segment_reader.max_doc() {
                if segment_reader.is_deleted(doc_id) {
                    continue;
                }
                if let Ok(doc) = store_reader.get::<TantivyDocument>(doc_id) {
                    let matches = doc
                        .get_first(self.document_id_field)
                        .and_then(|v| v.as_str())
                        .map(|s| s == document_id)
                        .unwrap_or(false);
                    if matches {
                        if let Some(id_val) = doc.get_first(self.id_field) {
                            if let Some(id_text) = id_val.as_str() {
                                let term = tantivy::Term::from_field_text(self.id_field, id_text);
                                writer.delete_term(term);
                                deleted += 1;
                            }
                        }
                    }
                }
            }
        }

        if deleted > 0 {
            writer.commit().context("Tantivy commit after delete failed")?;
            self.reader.reload()?;
        }
        Ok(deleted)
    }

    pub fn count(&self) -> Result<usize> {
        let searcher = self.reader.searcher();
        Ok(searcher.num_docs() as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.count().unwrap_or(0) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_index() -> (tempfile::TempDir, Bm25Index) {
        let dir = tempfile::tempdir().unwrap();
        let index = Bm25Index::new(dir.path().to_str().unwrap()).unwrap();
        (dir, index)
    }

    #[test]
    fn indexes_and_searches_a_chunk_by_text() {
        let (_dir, index) = open_index();
        index
            .index_chunk("chunk-1", "variable cost per ton rose in the Iberia cement plants", "doc-1")
            .unwrap();
        index.commit().unwrap();

        let hits = index.search("variable cost per ton", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "chunk-1");
        assert_eq!(index.count().unwrap(), 1);
        assert!(!index.is_empty());
    }

    #[test]
    fn delete_by_document_removes_only_its_chunks() {
        let (_dir, index) = open_index();
        index
            .index_chunks_batch(&[
                ("a".to_string(), "ebitda margin improved".to_string(), "doc-1".to_string()),
                ("b".to_string(), "headcount declined".to_string(), "doc-1".to_string()),
                ("c".to_string(), "revenue grew in Q3".to_string(), "doc-2".to_string()),
            ])
            .unwrap();
        index.commit().unwrap();
        assert_eq!(index.count().unwrap(), 3);

        let deleted = index.delete_by_document("doc-1").unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(index.count().unwrap(), 1);

        let hits = index.search("revenue", 5).unwrap();
        assert_eq!(hits[0].0, "c");
    }

    #[test]
    fn search_falls_back_to_phrase_query_on_unparseable_input() {
        let (_dir, index) = open_index();
        index.index_chunk("a", "capex guidance for fiscal 2025", "doc-1").unwrap();
        index.commit().unwrap();

        // An unbalanced parenthesis is invalid QueryParser syntax; the
        // phrase-query fallback (quotes stripped, then requoted) should
        // still find the chunk via its stripped text.
        let hits = index.search("(capex guidance", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a");
    }

    #[test]
    fn reopening_an_up_to_date_index_does_not_trigger_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        {
            let index = Bm25Index::new(path).unwrap();
            index.index_chunk("a", "opex trends", "doc-1").unwrap();
            index.commit().unwrap();
        }
        let reopened = Bm25Index::new(path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
    }
}
