use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("no text extracted from document {0}")]
    EmptyDocument(String),

    #[error("chunk count {chunks} does not match vector count {vectors}")]
    DimensionMismatch { chunks: usize, vectors: usize },

    #[error("embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("vector store unavailable: {0}")]
    VectorStoreUnavailable(#[from] StoreError),

    #[error("rerank failed: {0}")]
    Rerank(String),

    #[error("document catalog error: {0}")]
    Catalog(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("store not configured: {0}")]
    NotConfigured(String),
}

impl StoreError {
    pub(crate) fn backend(backend: &str, details: impl Into<String>) -> Self {
        Self::BackendResponse {
            backend: backend.to_string(),
            details: details.into(),
        }
    }
}

pub type Result<T, E = RagError> = std::result::Result<T, E>;
