//! C6 — Structured Store Adapter.
//!
//! The realization of the relational/lexical store spec.md describes in
//! Postgres terms (GIN index, tsvector) on top of SQLite: a `chunks` table
//! carrying every `ChunkMetadata` field as its own column for filterable
//! structured queries, plus an FTS5 virtual table (SQLite's bundled inverted
//! index) kept in sync via triggers for lexical ranking. Every query against
//! this store is built with bound parameters — no interpolation of query
//! text — matching this engine's own SQLite usage elsewhere.

use crate::error::StorageError;
use crate::types::{Chunk, ChunkMetadata};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;

/// Optional equality filters over the structured metadata columns, used by
/// the SQL-only and hybrid retrieval paths.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub company_name: Option<String>,
    pub metric_category: Option<String>,
    pub time_period: Option<String>,
    pub fiscal_period: Option<String>,
    pub report_type: Option<String>,
}

impl ChunkFilter {
    /// Builds a filter from a caller-supplied map of column name to equality
    /// value (the `filters` argument of the query tool), ignoring keys that
    /// don't name a filterable column.
    pub fn from_map(map: &std::collections::HashMap<String, String>) -> Self {
        Self {
            company_name: map.get("company_name").cloned(),
            metric_category: map.get("metric_category").cloned(),
            time_period: map.get("time_period").cloned(),
            fiscal_period: map.get("fiscal_period").cloned(),
            report_type: map.get("report_type").cloned(),
        }
    }

    fn is_empty(&self) -> bool {
        self.company_name.is_none()
            && self.metric_category.is_none()
            && self.time_period.is_none()
            && self.fiscal_period.is_none()
            && self.report_type.is_none()
    }
}

pub struct StructuredStore {
    pool: SqlitePool,
}

impl StructuredStore {
    pub async fn new(database_url: &str) -> Result<Self, StorageError> {
        let url = normalize_sqlite_url(database_url);
        let pool = SqlitePool::connect(&url).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_ordinal INTEGER NOT NULL,
                page_number INTEGER NOT NULL,
                content TEXT NOT NULL,
                is_table INTEGER NOT NULL,
                table_part TEXT,
                company_name TEXT,
                business_unit TEXT,
                metric_category TEXT,
                metric_type TEXT,
                time_period TEXT,
                geographic_region TEXT,
                currency TEXT,
                report_type TEXT,
                data_format TEXT,
                semantic_summary TEXT,
                key_entities TEXT NOT NULL DEFAULT '[]',
                numeric_ranges TEXT NOT NULL DEFAULT '{}',
                fiscal_period TEXT,
                department_name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                path TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                page_count INTEGER NOT NULL,
                ingested_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_document_id ON documents(document_id)")
            .execute(&pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunks_company_name ON chunks(company_name)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunks_metric_category ON chunks(metric_category)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunks_time_period ON chunks(time_period)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
                chunk_id UNINDEXED,
                content,
                content='chunks',
                content_rowid='rowid'
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
                INSERT INTO chunks_fts(rowid, chunk_id, content) VALUES (new.rowid, new.chunk_id, new.content);
            END
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, chunk_id, content) VALUES ('delete', old.rowid, old.chunk_id, old.content);
            END
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
                INSERT INTO chunks_fts(chunks_fts, rowid, chunk_id, content) VALUES ('delete', old.rowid, old.chunk_id, old.content);
                INSERT INTO chunks_fts(rowid, chunk_id, content) VALUES (new.rowid, new.chunk_id, new.content);
            END
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn upsert_chunks(
        &self,
        chunks: &[Chunk],
        metadata: &HashMap<uuid::Uuid, ChunkMetadata>,
    ) -> Result<(), StorageError> {
        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        for chunk in chunks {
            let meta = metadata.get(&chunk.id).cloned().unwrap_or_default();
            let key_entities_json = serde_json::to_string(&meta.key_entities).unwrap_or_else(|_| "[]".into());
            let numeric_ranges_json =
                serde_json::to_string(&meta.numeric_ranges).unwrap_or_else(|_| "{}".into());
            let data_format = meta.data_format.map(|d| d.as_str().to_string());

            sqlx::query(
                r#"
                INSERT INTO chunks (
                    chunk_id, document_id, chunk_ordinal, page_number, content, is_table,
                    table_part, company_name, business_unit, metric_category, metric_type,
                    time_period, geographic_region, currency, report_type, data_format,
                    semantic_summary, key_entities, numeric_ranges, fiscal_period,
                    department_name, created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?22
                )
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    chunk_ordinal = excluded.chunk_ordinal,
                    page_number = excluded.page_number,
                    content = excluded.content,
                    is_table = excluded.is_table,
                    table_part = excluded.table_part,
                    company_name = excluded.company_name,
                    business_unit = excluded.business_unit,
                    metric_category = excluded.metric_category,
                    metric_type = excluded.metric_type,
                    time_period = excluded.time_period,
                    geographic_region = excluded.geographic_region,
                    currency = excluded.currency,
                    report_type = excluded.report_type,
                    data_format = excluded.data_format,
                    semantic_summary = excluded.semantic_summary,
                    key_entities = excluded.key_entities,
                    numeric_ranges = excluded.numeric_ranges,
                    fiscal_period = excluded.fiscal_period,
                    department_name = excluded.department_name,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(chunk.id.to_string())
            .bind(&chunk.document_id)
            .bind(chunk.chunk_ordinal as i64)
            .bind(chunk.primary_page() as i64)
            .bind(&chunk.text)
            .bind(chunk.is_table as i64)
            .bind(&chunk.table_part)
            .bind(&meta.company_name)
            .bind(&meta.business_unit)
            .bind(&meta.metric_category)
            .bind(&meta.metric_type)
            .bind(&meta.time_period)
            .bind(&meta.geographic_region)
            .bind(&meta.currency)
            .bind(&meta.report_type)
            .bind(&data_format)
            .bind(&meta.semantic_summary)
            .bind(&key_entities_json)
            .bind(&numeric_ranges_json)
            .bind(&meta.fiscal_period)
            .bind(&meta.department_name)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_by_document(&self, document_id: &str) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Lexical search via SQLite FTS5, ranked by `bm25()` (lower is better,
    /// negated so callers can sort descending like every other score here).
    pub async fn search_lexical(&self, query: &str, k: usize) -> Result<Vec<(String, f32)>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, bm25(chunks_fts) AS rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?1
            ORDER BY rank
            LIMIT ?2
            "#,
        )
        .bind(query)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Sql)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let id: String = row.get("chunk_id");
                let rank: f64 = row.get("rank");
                (id, -(rank as f32))
            })
            .collect())
    }

    /// Full-text search over `content`, scored by lexical relevance and
    /// optionally narrowed by metadata `filter` (spec §4.6). When
    /// `prefer_tables` is set (the classifier requested table precedence),
    /// rows with `is_table = 1` are boosted ahead of narrative rows at equal
    /// rank by sorting on `(is_table DESC, rank ASC)`.
    pub async fn search_tables(
        &self,
        query: &str,
        k: usize,
        filter: Option<&ChunkFilter>,
        prefer_tables: bool,
    ) -> Result<Vec<(String, f32)>, StorageError> {
        let mut clauses = vec!["chunks_fts MATCH ?1".to_string()];
        let mut binds: Vec<String> = vec![query.to_string()];

        if let Some(filter) = filter {
            if let Some(v) = &filter.company_name {
                clauses.push("c.company_name = ?".to_string());
                binds.push(v.clone());
            }
            if let Some(v) = &filter.metric_category {
                clauses.push("c.metric_category = ?".to_string());
                binds.push(v.clone());
            }
            if let Some(v) = &filter.time_period {
                clauses.push("c.time_period = ?".to_string());
                binds.push(v.clone());
            }
            if let Some(v) = &filter.fiscal_period {
                clauses.push("c.fiscal_period = ?".to_string());
                binds.push(v.clone());
            }
            if let Some(v) = &filter.report_type {
                clauses.push("c.report_type = ?".to_string());
                binds.push(v.clone());
            }
        }

        let order = if prefer_tables {
            "c.is_table DESC, rank ASC"
        } else {
            "rank ASC"
        };
        let sql = format!(
            "SELECT f.chunk_id AS chunk_id, bm25(chunks_fts) AS rank, c.is_table AS is_table \
             FROM chunks_fts f JOIN chunks c ON c.chunk_id = f.chunk_id \
             WHERE {} ORDER BY {} LIMIT ?",
            clauses.join(" AND "),
            order
        );

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        q = q.bind(k as i64);

        let rows = q.fetch_all(&self.pool).await.map_err(StorageError::Sql)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let id: String = row.get("chunk_id");
                let rank: f64 = row.get("rank");
                (id, -(rank as f32))
            })
            .collect())
    }

    /// Filtered lookup for the SQL-only classification path: returns chunk
    /// ids matching every non-`None` field in `filter`, most recent first.
    pub async fn filter_chunks(&self, filter: &ChunkFilter, k: usize) -> Result<Vec<String>, StorageError> {
        let mut clauses = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(v) = &filter.company_name {
            clauses.push("company_name = ?");
            binds.push(v.clone());
        }
        if let Some(v) = &filter.metric_category {
            clauses.push("metric_category = ?");
            binds.push(v.clone());
        }
        if let Some(v) = &filter.time_period {
            clauses.push("time_period = ?");
            binds.push(v.clone());
        }
        if let Some(v) = &filter.fiscal_period {
            clauses.push("fiscal_period = ?");
            binds.push(v.clone());
        }
        if let Some(v) = &filter.report_type {
            clauses.push("report_type = ?");
            binds.push(v.clone());
        }

        let where_clause = if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        };
        let sql = format!(
            "SELECT chunk_id FROM chunks WHERE {} ORDER BY created_at DESC LIMIT ?",
            where_clause
        );

        let mut q = sqlx::query(&sql);
        for b in &binds {
            q = q.bind(b);
        }
        q = q.bind(k as i64);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|row| row.get::<String, _>("chunk_id")).collect())
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS c FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("c"))
    }

    /// The document id (content hash) this path was ingested under last,
    /// if any. Re-ingesting the same path with different content produces a
    /// different document id; the ingestion orchestrator uses this to find
    /// and purge the superseded chunk set (spec §3 "replaced atomically on
    /// re-ingest").
    pub async fn previous_document_id(&self, path: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT document_id FROM documents WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("document_id")))
    }

    /// Record (or update) which document id a path currently maps to.
    pub async fn upsert_document(
        &self,
        path: &str,
        document_id: &str,
        page_count: usize,
        ingested_at: &str,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO documents (path, document_id, page_count, ingested_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(path) DO UPDATE SET
                document_id = excluded.document_id,
                page_count = excluded.page_count,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(path)
        .bind(document_id)
        .bind(page_count as i64)
        .bind(ingested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The source path a document id was last ingested from, used to attach
    /// a human-readable `document_name` to query citations.
    pub async fn document_path(&self, document_id: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT path FROM documents WHERE document_id = ?1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("path")))
    }

    /// Full rows for a set of chunk ids, used to hydrate SQL-sourced search
    /// hits (which arrive as bare `(chunk_id, score)` pairs) into displayable
    /// text + provenance.
    pub async fn fetch_chunks_by_ids(&self, ids: &[String]) -> Result<Vec<ChunkRow>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT chunk_id, document_id, chunk_ordinal, page_number, content, is_table, table_part \
             FROM chunks WHERE chunk_id IN ({})",
            placeholders
        );
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| ChunkRow {
                chunk_id: row.get("chunk_id"),
                document_id: row.get("document_id"),
                chunk_ordinal: row.get::<i64, _>("chunk_ordinal") as u32,
                page_number: row.get::<i64, _>("page_number") as usize,
                content: row.get("content"),
                is_table: row.get::<i64, _>("is_table") != 0,
                table_part: row.get("table_part"),
            })
            .collect())
    }
}

/// A hydrated chunk row, used to attach text/provenance to SQL-sourced hits.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_ordinal: u32,
    pub page_number: usize,
    pub content: String,
    pub is_table: bool,
    pub table_part: Option<String>,
}

fn normalize_sqlite_url(database_url: &str) -> String {
    if database_url.contains('?') {
        if database_url.contains("mode=") {
            database_url.to_string()
        } else {
            format!("{}&mode=rwc", database_url)
        }
    } else {
        format!("{}?mode=rwc", database_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chunk, DataFormat};
    use std::collections::HashMap as StdHashMap;
    use uuid::Uuid;

    #[test]
    fn normalize_url_adds_rwc_mode_once() {
        assert_eq!(
            normalize_sqlite_url("sqlite://./data.db"),
            "sqlite://./data.db?mode=rwc"
        );
        assert_eq!(
            normalize_sqlite_url("sqlite://./data.db?mode=rwc"),
            "sqlite://./data.db?mode=rwc"
        );
    }

    #[test]
    fn chunk_filter_from_map_ignores_unknown_keys() {
        let mut map = StdHashMap::new();
        map.insert("company_name".to_string(), "Acme".to_string());
        map.insert("bogus_column".to_string(), "x".to_string());
        let filter = ChunkFilter::from_map(&map);
        assert_eq!(filter.company_name.as_deref(), Some("Acme"));
        assert!(filter.metric_category.is_none());
        assert!(!filter.is_empty());
        assert!(ChunkFilter::default().is_empty());
    }

    async fn memory_store() -> StructuredStore {
        StructuredStore::new("sqlite::memory:").await.unwrap()
    }

    fn sample_chunk(document_id: &str, ordinal: u32, text: &str, page: usize) -> Chunk {
        Chunk {
            id: Chunk::derive_id(document_id, ordinal),
            document_id: document_id.to_string(),
            chunk_ordinal: ordinal,
            text: text.to_string(),
            token_count: text.split_whitespace().count(),
            page_numbers: vec![page],
            is_table: false,
            table_part: None,
            table_caption: None,
        }
    }

    #[tokio::test]
    async fn document_registry_round_trips_path_to_id() {
        let store = memory_store().await;
        assert_eq!(store.previous_document_id("report.pdf").await.unwrap(), None);

        store
            .upsert_document("report.pdf", "hash-v1", 10, "2026-01-01T00:00:00Z")
            .await
            .unwrap();
        assert_eq!(
            store.previous_document_id("report.pdf").await.unwrap(),
            Some("hash-v1".to_string())
        );
        assert_eq!(
            store.document_path("hash-v1").await.unwrap(),
            Some("report.pdf".to_string())
        );

        store
            .upsert_document("report.pdf", "hash-v2", 12, "2026-02-01T00:00:00Z")
            .await
            .unwrap();
        assert_eq!(
            store.previous_document_id("report.pdf").await.unwrap(),
            Some("hash-v2".to_string())
        );
    }

    #[tokio::test]
    async fn search_tables_matches_content_and_honors_filter() {
        let store = memory_store().await;
        let chunk = sample_chunk("doc1", 0, "variable cost per ton rose in August", 46);
        let mut metadata: StdHashMap<Uuid, ChunkMetadata> = StdHashMap::new();
        metadata.insert(
            chunk.id,
            ChunkMetadata {
                company_name: Some("Portugal Cement".to_string()),
                data_format: Some(DataFormat::Table),
                ..Default::default()
            },
        );
        store.upsert_chunks(&[chunk.clone()], &metadata).await.unwrap();

        let hits = store
            .search_tables("variable cost", 5, None, false)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, chunk.id.to_string());

        let filter = ChunkFilter {
            company_name: Some("Other Co".to_string()),
            ..Default::default()
        };
        let filtered = store.search_tables("variable cost", 5, Some(&filter), false).await.unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn fetch_chunks_by_ids_hydrates_rows() {
        let store = memory_store().await;
        let chunk = sample_chunk("doc1", 0, "Revenue grew 12%", 3);
        store
            .upsert_chunks(&[chunk.clone()], &StdHashMap::new())
            .await
            .unwrap();

        let rows = store.fetch_chunks_by_ids(&[chunk.id.to_string()]).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].page_number, 3);
        assert_eq!(rows[0].content, "Revenue grew 12%");
    }
}
