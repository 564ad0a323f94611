use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagLiteConfig {
    pub data_dir: PathBuf,
    pub chunking: ChunkingConfig,
    pub metadata: MetadataConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Token budget for narrative text chunks.
    pub chunk_size: usize,
    /// Overlap, in tokens, between adjacent text chunks.
    pub chunk_overlap: usize,
    /// Hard token ceiling for a table chunk; tables larger are split by row.
    pub max_table_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Max concurrent chunk-metadata extraction calls (bounded semaphore, §5).
    pub concurrency: usize,
    pub timeout_s: u64,
    pub retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    pub dimension: usize,
    pub timeout_s: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FusionMode {
    WeightedSum,
    Rrf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub hybrid_alpha: f32,
    pub hybrid_deadline_s: u64,
    pub fusion_mode: FusionMode,
    pub rrf_k: usize,
    pub top_k: usize,
    pub classifier_version: String,
}

impl RagLiteConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.chunking.chunk_size < 50 {
            return Err("chunking.chunk_size must be >= 50".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err("chunking.chunk_overlap must be < chunk_size".into());
        }
        if self.chunking.max_table_tokens < self.chunking.chunk_size {
            return Err("chunking.max_table_tokens must be >= chunk_size".into());
        }
        if self.retrieval.top_k == 0 {
            return Err("retrieval.top_k must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.hybrid_alpha) {
            return Err("retrieval.hybrid_alpha must be in [0.0, 1.0]".into());
        }
        if self.metadata.concurrency == 0 {
            return Err("metadata.concurrency must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, failing loudly rather than silently
    /// falling back to defaults for malformed input.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for RagLiteConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("raglite");

        Self {
            data_dir,
            chunking: ChunkingConfig {
                chunk_size: 512,
                chunk_overlap: 50,
                max_table_tokens: 4096,
            },
            metadata: MetadataConfig {
                concurrency: 20,
                timeout_s: 30,
                retries: 2,
            },
            embedding: EmbeddingConfig {
                batch_size: 32,
                dimension: 1024,
                timeout_s: 60,
            },
            retrieval: RetrievalConfig {
                hybrid_alpha: 0.6,
                hybrid_deadline_s: 5,
                fusion_mode: FusionMode::WeightedSum,
                rrf_k: 60,
                top_k: 5,
                classifier_version: "v1".to_string(),
            },
        }
    }
}

/// Credentials for the external services this crate talks to. Loaded from the
/// process environment at wiring time; never logged or serialized back out.
#[derive(Clone)]
pub struct ServiceCredentials {
    pub embedder_api_key: Option<String>,
    pub embedder_endpoint: String,
    pub llm_api_key: Option<String>,
    pub llm_endpoint: String,
    pub vector_store_url: String,
    pub structured_store_url: String,
}

impl ServiceCredentials {
    pub fn from_env() -> Self {
        Self {
            embedder_api_key: std::env::var("RAGLITE_EMBEDDER_API_KEY").ok(),
            embedder_endpoint: std::env::var("RAGLITE_EMBEDDER_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:8080/embed".to_string()),
            llm_api_key: std::env::var("RAGLITE_LLM_API_KEY").ok(),
            llm_endpoint: std::env::var("RAGLITE_LLM_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:8080/v1/chat/completions".to_string()),
            vector_store_url: std::env::var("RAGLITE_VECTOR_STORE_URL")
                .unwrap_or_else(|_| "./data/vector_store".to_string()),
            structured_store_url: std::env::var("RAGLITE_STRUCTURED_STORE_URL")
                .unwrap_or_else(|_| "sqlite://./data/structured_store.db".to_string()),
        }
    }
}

impl std::fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("embedder_api_key", &self.embedder_api_key.as_ref().map(|_| "<redacted>"))
            .field("embedder_endpoint", &self.embedder_endpoint)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "<redacted>"))
            .field("llm_endpoint", &self.llm_endpoint)
            .field("vector_store_url", &self.vector_store_url)
            .field("structured_store_url", &self.structured_store_url)
            .finish()
    }
}
