pub mod catalog;
pub mod chunking;
pub mod config;
pub mod context;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod models;
pub mod openai;
pub mod pipeline;
pub mod rerank;
pub mod stores;

pub use catalog::{DocumentCatalog, InMemoryCatalog, ProcessingClaim};
pub use chunking::{chunk_text, ChunkingConfig};
pub use config::{load_settings, parse_settings, Settings};
pub use context::{assemble_context, excerpt, ContextCandidate};
pub use embeddings::{
    create_embedder, embed, embed_batch, CharacterNgramEmbedder, Embedder, OpenAiEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{RagError, StoreError};
pub use ingest::{
    discover_documents, discover_text_files, document_id_for, ingest_sources_best_effort,
    DocumentSource, IngestionReport, SkippedFile,
};
pub use models::{
    record_id, Chunk, Citation, ContextRequest, DocumentRecord, Metadata, ProcessingOutcome,
    ProcessingStatus, RetrievedContext, SearchHit, StoreStats, VectorRecord,
};
pub use pipeline::RagPipeline;
pub use rerank::{LlmReranker, Reranker};
pub use stores::{
    create_backend, IndexSpec, LocalStore, PineconeStore, VectorBackend, VectorStoreAdapter,
    WeaviateStore,
};
