//! Error taxonomy for the RAGLite engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RagLiteError>;

/// Top-level error type returned by every public RAGLite operation.
#[derive(Error, Debug)]
pub enum RagLiteError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("chunking error: {0}")]
    Chunking(#[from] ChunkingError),

    #[error("metadata extraction error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors raised by the document parser adapter (C1).
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    #[error("document contains no extractable text: {0}")]
    NoExtractableText(String),

    #[error("failed to read file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed PDF structure: {0}")]
    MalformedPdf(String),
}

/// Errors raised by the chunker (C2).
#[derive(Error, Debug)]
pub enum ChunkingError {
    #[error("table row exceeds max_table_tokens and cannot be split: {tokens} tokens in a single row")]
    RowExceedsBudget { tokens: usize },
}

/// Errors raised by the metadata extractor (C3).
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("invalid structured response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised by the embedder (C4).
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("embedding service request failed: {0}")]
    RequestFailed(String),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised by the storage adapters (C5/C6/C7).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("vector store error: {0}")]
    VectorStore(String),

    #[error("structured store error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("full-text index error: {0}")]
    FullText(String),

    #[error("linkage violation: chunk {0} missing from one or more indexes")]
    LinkageViolation(String),
}

/// Errors raised during retrieval/classification/fusion (C9/C10/C11).
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("retrieval deadline exceeded after {0}ms")]
    DeadlineExceeded(u64),

    #[error("all indexes failed for this query")]
    AllIndexesFailed,

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl RagLiteError {
    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagLiteError::Metadata(MetadataError::Timeout(_))
                | RagLiteError::Metadata(MetadataError::RequestFailed(_))
                | RagLiteError::Metadata(MetadataError::Http(_))
                | RagLiteError::Embedding(EmbeddingError::RequestFailed(_))
                | RagLiteError::Embedding(EmbeddingError::Http(_))
                | RagLiteError::Query(QueryError::DeadlineExceeded(_))
        )
    }

    /// Coarse category used for logging/metrics and the tool-surface error envelope.
    pub fn category(&self) -> &'static str {
        match self {
            RagLiteError::Parse(_) => "parse",
            RagLiteError::Chunking(_) => "chunking",
            RagLiteError::Metadata(_) => "metadata",
            RagLiteError::Embedding(_) => "embedding",
            RagLiteError::Storage(_) => "storage",
            RagLiteError::Query(_) => "query",
            RagLiteError::Config(_) => "config",
            RagLiteError::Io(_) => "io",
            RagLiteError::Serialization(_) => "serialization",
            RagLiteError::NotFound(_) => "not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_timeout_is_retryable() {
        let err = RagLiteError::Metadata(MetadataError::Timeout(30));
        assert!(err.is_retryable());
    }

    #[test]
    fn config_error_is_not_retryable() {
        let err = RagLiteError::Config("missing data_dir".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn categories_are_stable() {
        assert_eq!(RagLiteError::Config("x".into()).category(), "config");
        assert_eq!(
            RagLiteError::Query(QueryError::AllIndexesFailed).category(),
            "query"
        );
    }
}
