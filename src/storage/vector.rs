//! C5 — Vector Store Adapter (LanceDB).
//!
//! Dense ANN storage over `Chunk` embeddings, widened from this engine's
//! original generic document schema to carry the filter-relevant metadata
//! fields (`company_name`, `metric_category`, `time_period`) directly as
//! Arrow columns so query-time filters don't require a metadata-JSON scan,
//! with the full `ChunkMetadata` still carried as a JSON column for fields
//! that aren't filtered on. Table creation uses the same seed-row trick as
//! the original: LanceDB infers schema from the first write, so a throwaway
//! seed record is inserted and deleted immediately to fix the schema upfront.

use anyhow::{Context, Result};
use arrow_array::{
    Array, BooleanArray, FixedSizeListArray, Float32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray, UInt32Array,
};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

/// One chunk's vector-store payload: identity, filterable fields, vector,
/// and the full metadata blob for fields that are read but not filtered on.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub document_id: String,
    pub chunk_ordinal: u32,
    pub text: String,
    pub page_number: u32,
    pub is_table: bool,
    pub table_part: String,
    pub company_name: String,
    pub metric_category: String,
    pub time_period: String,
    pub metadata_json: String,
    pub vector: Vec<f32>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    pub document_id: String,
    pub chunk_ordinal: u32,
    pub text: String,
    pub page_number: u32,
    pub is_table: bool,
    pub table_part: String,
    pub metadata_json: String,
    pub score: f32,
}

pub struct VectorStore {
    db: lancedb::Connection,
    dimension: usize,
    table_name: String,
}

impl VectorStore {
    pub async fn new(path: &str, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path)
            .execute()
            .await
            .context("failed to connect to LanceDB")?;

        let store = Self {
            db,
            dimension,
            table_name: "chunks".to_string(),
        };
        store.ensure_table().await?;
        Ok(store)
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("chunk_ordinal", DataType::UInt32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("page_number", DataType::UInt32, false),
            Field::new("is_table", DataType::Boolean, false),
            Field::new("table_part", DataType::Utf8, false),
            Field::new("company_name", DataType::Utf8, false),
            Field::new("metric_category", DataType::Utf8, false),
            Field::new("time_period", DataType::Utf8, false),
            Field::new("metadata_json", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
            Field::new("created_at", DataType::Int64, false),
        ]))
    }

    async fn ensure_table(&self) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.contains(&self.table_name) {
            return Ok(());
        }

        let schema = self.schema();
        let seed_vec = vec![0.0f32; self.dimension];
        let values = Float32Array::from(seed_vec);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec!["__seed__"])),
                Arc::new(UInt32Array::from(vec![0u32])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(UInt32Array::from(vec![0u32])),
                Arc::new(BooleanArray::from(vec![false])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec!["{}"])),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(Int64Array::from(vec![0i64])),
            ],
        )
        .context("failed to build seed RecordBatch")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.db
            .create_table(&self.table_name, Box::new(batches))
            .execute()
            .await
            .context("failed to create chunks table")?;

        let table = self.db.open_table(&self.table_name).execute().await?;
        table.delete("id = '__seed__'").await.ok();
        Ok(())
    }

    pub async fn upsert_chunks(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let table = self.db.open_table(&self.table_name).execute().await?;
        let schema = self.schema();

        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let document_ids: Vec<&str> = records.iter().map(|r| r.document_id.as_str()).collect();
        let chunk_ordinals: Vec<u32> = records.iter().map(|r| r.chunk_ordinal).collect();
        let texts: Vec<&str> = records.iter().map(|r| r.text.as_str()).collect();
        let page_numbers: Vec<u32> = records.iter().map(|r| r.page_number).collect();
        let is_tables: Vec<bool> = records.iter().map(|r| r.is_table).collect();
        let table_parts: Vec<&str> = records.iter().map(|r| r.table_part.as_str()).collect();
        let company_names: Vec<&str> = records.iter().map(|r| r.company_name.as_str()).collect();
        let metric_categories: Vec<&str> =
            records.iter().map(|r| r.metric_category.as_str()).collect();
        let time_periods: Vec<&str> = records.iter().map(|r| r.time_period.as_str()).collect();
        let metadata_jsons: Vec<&str> = records.iter().map(|r| r.metadata_json.as_str()).collect();
        let created_ats: Vec<i64> = records.iter().map(|r| r.created_at).collect();

        let flat_vectors: Vec<f32> = records.iter().flat_map(|r| r.vector.iter().copied()).collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(document_ids)),
                Arc::new(UInt32Array::from(chunk_ordinals)),
                Arc::new(StringArray::from(texts)),
                Arc::new(UInt32Array::from(page_numbers)),
                Arc::new(BooleanArray::from(is_tables)),
                Arc::new(StringArray::from(table_parts)),
                Arc::new(StringArray::from(company_names)),
                Arc::new(StringArray::from(metric_categories)),
                Arc::new(StringArray::from(time_periods)),
                Arc::new(StringArray::from(metadata_jsons)),
                Arc::new(vector_array) as Arc<dyn Array>,
                Arc::new(Int64Array::from(created_ats)),
            ],
        )
        .context("failed to build RecordBatch")?;

        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("failed to insert chunks")?;
        Ok(())
    }

    pub async fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<VectorHit>> {
        let table = self.db.open_table(&self.table_name).execute().await?;

        let mut query_builder = table.query().nearest_to(query)?;
        query_builder = query_builder
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k);
        if let Some(predicate) = filter {
            query_builder = query_builder.only_if(predicate);
        }

        let results = query_builder
            .execute()
            .await
            .context("LanceDB vector search failed")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(extract_hits(&batches))
    }

    /// Atomic-enough replace for one document: delete then insert within the
    /// same call, matching invariant 5 (re-ingest is all-or-nothing per
    /// document) as closely as LanceDB's non-transactional API allows.
    pub async fn delete_by_document(&self, document_id: &str) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        let before = table.count_rows(None).await.unwrap_or(0);
        let predicate = format!("document_id = '{}'", document_id.replace('\'', "''"));
        table.delete(&predicate).await?;
        let after = table.count_rows(None).await.unwrap_or(0);
        Ok(before - after)
    }

    pub async fn count(&self) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        Ok(table.count_rows(None).await?)
    }

    pub async fn count_for_document(&self, document_id: &str) -> Result<usize> {
        let table = self.db.open_table(&self.table_name).execute().await?;
        let predicate = format!("document_id = '{}'", document_id.replace('\'', "''"));
        let results = table
            .query()
            .only_if(predicate)
            .select(lancedb::query::Select::columns(&["id"]))
            .execute()
            .await
            .context("failed to count chunks for document")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(batches.iter().map(|b| b.num_rows()).sum())
    }

    /// Returns the subset of `ids` that actually have a row in this table —
    /// used by the retrieval path to check the vector side of the 1:1
    /// linkage invariant for chunks that were only found via the lexical
    /// path (SQL/BM25), which never touches this store directly.
    pub async fn existing_ids(&self, ids: &[String]) -> Result<std::collections::HashSet<String>> {
        if ids.is_empty() {
            return Ok(std::collections::HashSet::new());
        }
        let table = self.db.open_table(&self.table_name).execute().await?;
        let quoted: Vec<String> = ids.iter().map(|id| format!("'{}'", id.replace('\'', "''"))).collect();
        let predicate = format!("id IN ({})", quoted.join(", "));
        let results = table
            .query()
            .only_if(predicate)
            .select(lancedb::query::Select::columns(&["id"]))
            .execute()
            .await
            .context("failed to check existing ids")?;
        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        let mut found = std::collections::HashSet::with_capacity(ids.len());
        for batch in &batches {
            if let Some(ids_col) = col_str(batch, "id") {
                for i in 0..batch.num_rows() {
                    found.insert(ids_col.value(i).to_string());
                }
            }
        }
        Ok(found)
    }

    pub async fn create_index_if_needed(&self) -> Result<()> {
        let count = self.count().await?;
        if count >= 1_000 {
            let table = self.db.open_table(&self.table_name).execute().await?;
            table
                .create_index(&["vector"], lancedb::index::Index::Auto)
                .execute()
                .await
                .context("failed to create vector index")?;
        }
        Ok(())
    }
}

fn extract_hits(batches: &[RecordBatch]) -> Vec<VectorHit> {
    let mut hits = Vec::new();
    for batch in batches {
        let ids = col_str(batch, "id");
        let document_ids = col_str(batch, "document_id");
        let texts = col_str(batch, "text");
        let table_parts = col_str(batch, "table_part");
        let metadata_jsons = col_str(batch, "metadata_json");
        let chunk_ordinals = batch
            .column_by_name("chunk_ordinal")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let page_numbers = batch
            .column_by_name("page_number")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let is_tables = batch
            .column_by_name("is_table")
            .and_then(|c| c.as_any().downcast_ref::<BooleanArray>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(ids), Some(texts)) = (ids, texts) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            let score = distances.map(|d| (1.0 - d.value(i)).max(0.0)).unwrap_or(0.0);
            hits.push(VectorHit {
                id: ids.value(i).to_string(),
                document_id: document_ids.map(|c| c.value(i).to_string()).unwrap_or_default(),
                chunk_ordinal: chunk_ordinals.map(|c| c.value(i)).unwrap_or(0),
                text: texts.value(i).to_string(),
                page_number: page_numbers.map(|c| c.value(i)).unwrap_or(0),
                is_table: is_tables.map(|c| c.value(i)).unwrap_or(false),
                table_part: table_parts.map(|c| c.value(i).to_string()).unwrap_or_default(),
                metadata_json: metadata_jsons
                    .map(|c| c.value(i).to_string())
                    .unwrap_or_else(|| "{}".to_string()),
                score,
            });
        }
    }
    hits
}

fn col_str<'a>(batch: &'a RecordBatch, name: &str) -> Option<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
}
