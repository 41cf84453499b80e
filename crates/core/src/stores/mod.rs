//! Vector store abstraction.
//!
//! Each backing store implements [`VectorBackend`]. Callers go through
//! [`VectorStoreAdapter`], which applies the same contract to every
//! backend: record IDs derived from `(document_id, index)`, a count check
//! on add, descending scores truncated to `top_k`, and search that
//! degrades to an empty result when the backend is unreachable.

pub mod local;
pub mod pinecone;
pub mod weaviate;

pub use local::LocalStore;
pub use pinecone::{IndexSpec, PineconeStore};
pub use weaviate::WeaviateStore;

use crate::config::{secret_from_env, VectorStoreSettings};
use crate::error::{RagError, StoreError};
use crate::models::{record_id, Chunk, SearchHit, StoreStats, VectorRecord};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Creates the collection/schema if missing. Must be idempotent.
    async fn prepare(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Inserts or overwrites records by `record_id`.
    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), StoreError>;

    /// Nearest records to `vector`, scored higher-is-closer.
    async fn query(
        &self,
        vector: &[f32],
        document_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError>;

    /// Removes every record of the document. Absent documents are not an error.
    async fn delete_document(&self, document_id: &str) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

#[derive(Clone)]
pub struct VectorStoreAdapter {
    backend: Arc<dyn VectorBackend>,
}

impl VectorStoreAdapter {
    pub fn new(backend: Arc<dyn VectorBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn prepare(&self) -> Result<(), RagError> {
        Ok(self.backend.prepare().await?)
    }

    pub async fn add(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model: &str,
    ) -> Result<usize, RagError> {
        if chunks.len() != vectors.len() {
            return Err(RagError::DimensionMismatch {
                chunks: chunks.len(),
                vectors: vectors.len(),
            });
        }
        if chunks.is_empty() {
            return Ok(0);
        }

        let records = build_records(document_id, chunks, vectors, model);
        self.backend.upsert(&records).await?;
        debug!(
            backend = self.backend.name(),
            document_id,
            count = records.len(),
            "vectors stored"
        );
        Ok(records.len())
    }

    /// Never fails: an unavailable backend yields no results.
    pub async fn search(
        &self,
        query_vector: &[f32],
        filter_document_ids: Option<&[String]>,
        top_k: usize,
        score_threshold: f64,
    ) -> Vec<SearchHit> {
        if top_k == 0 {
            return Vec::new();
        }
        if filter_document_ids.is_some_and(|ids| ids.is_empty()) {
            return Vec::new();
        }

        let hits = match self
            .backend
            .query(query_vector, filter_document_ids, top_k)
            .await
        {
            Ok(hits) => hits,
            Err(error) => {
                warn!(
                    backend = self.backend.name(),
                    %error,
                    "vector search failed, returning no results"
                );
                return Vec::new();
            }
        };

        rank_hits(hits, top_k, score_threshold)
    }

    pub async fn delete_by_document(&self, document_id: &str) -> Result<bool, RagError> {
        self.backend.delete_document(document_id).await?;
        Ok(true)
    }

    pub async fn stats(&self) -> Result<StoreStats, RagError> {
        Ok(self.backend.stats().await?)
    }
}

fn build_records(
    document_id: &str,
    chunks: &[Chunk],
    vectors: &[Vec<f32>],
    model: &str,
) -> Vec<VectorRecord> {
    chunks
        .iter()
        .zip(vectors)
        .enumerate()
        .map(|(index, (chunk, vector))| {
            let mut metadata = chunk.metadata.clone();
            metadata.insert("document_id".to_string(), Value::from(document_id));
            metadata.insert("chunk_index".to_string(), Value::from(index));
            metadata.insert("embedding_model".to_string(), Value::from(model));
            metadata.insert("start_offset".to_string(), Value::from(chunk.start_offset));
            metadata.insert("end_offset".to_string(), Value::from(chunk.end_offset));
            if let Some(page) = chunk.page_number {
                metadata.insert("page_number".to_string(), Value::from(page));
            }

            VectorRecord {
                record_id: record_id(document_id, index),
                document_id: document_id.to_string(),
                chunk_index: index,
                text: chunk.text.clone(),
                vector: vector.clone(),
                metadata,
                page_number: chunk.page_number,
            }
        })
        .collect()
}

fn rank_hits(hits: Vec<SearchHit>, top_k: usize, score_threshold: f64) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = hits
        .into_iter()
        .filter(|hit| hit.score >= score_threshold)
        .collect();
    hits.sort_by(|left, right| right.score.total_cmp(&left.score));
    hits.truncate(top_k);
    hits
}

/// Builds the backend named by `settings.backend`.
pub async fn create_backend(
    settings: &VectorStoreSettings,
) -> Result<Arc<dyn VectorBackend>, RagError> {
    match settings.backend.as_str() {
        "local" => {
            let store = match &settings.local.path {
                Some(path) => LocalStore::open(path).await?,
                None => LocalStore::in_memory(),
            };
            Ok(Arc::new(store))
        }
        "service_a" | "pinecone" => {
            let pinecone = &settings.pinecone;
            let api_key = secret_from_env(&pinecone.api_key_env)?;
            let spec = pinecone.index_name.as_ref().map(|name| IndexSpec {
                name: name.clone(),
                dimension: pinecone.dimension,
                cloud: pinecone.cloud.clone(),
                region: pinecone.region.clone(),
            });

            let store = match spec {
                Some(spec) if pinecone.index_host.trim().is_empty() => {
                    PineconeStore::for_index(spec, api_key, pinecone.namespace.clone())
                }
                Some(spec) => {
                    PineconeStore::new(&pinecone.index_host, api_key, pinecone.namespace.clone())?
                        .with_index(spec)
                }
                None => {
                    PineconeStore::new(&pinecone.index_host, api_key, pinecone.namespace.clone())?
                }
            };
            Ok(Arc::new(store.with_control_plane(&pinecone.control_plane_url)?))
        }
        "service_b" | "weaviate" => {
            let api_key = match &settings.weaviate.api_key_env {
                Some(variable) => Some(secret_from_env(variable)?),
                None => None,
            };
            Ok(Arc::new(WeaviateStore::new(
                &settings.weaviate.url,
                &settings.weaviate.class_name,
                api_key,
            )?))
        }
        other => Err(RagError::InvalidConfiguration(format!(
            "unknown vector store backend: {other}"
        ))),
    }
}

/// Reads a `u32` page number, treating negative sentinels as absent.
pub(crate) fn page_number_from(value: Option<&Value>) -> Option<u32> {
    value
        .and_then(Value::as_i64)
        .filter(|page| *page >= 0)
        .and_then(|page| u32::try_from(page).ok())
}
