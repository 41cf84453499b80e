//! Document ownership and processing status.
//!
//! The relational record of a document lives outside the pipeline. The
//! pipeline only needs the operations of [`DocumentCatalog`]; the
//! [`InMemoryCatalog`] implementation backs the CLI and the tests.

use crate::error::RagError;
use crate::models::{DocumentRecord, ProcessingStatus};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingClaim {
    Claimed,
    Skipped(ProcessingStatus),
}

#[async_trait]
pub trait DocumentCatalog: Send + Sync {
    async fn document(&self, document_id: &str) -> Result<Option<DocumentRecord>, RagError>;

    /// The subset of `document_ids` that `requester_id` may read.
    async fn accessible_documents(
        &self,
        requester_id: &str,
        document_ids: &[String],
    ) -> Result<HashSet<String>, RagError>;

    /// Display names for the known documents among `document_ids`.
    async fn document_names(
        &self,
        document_ids: &[String],
    ) -> Result<HashMap<String, String>, RagError>;

    /// Moves the document to `Processing` in one step, unless it is already
    /// processing, or completed and `force` is false.
    async fn begin_processing(
        &self,
        document_id: &str,
        force: bool,
    ) -> Result<ProcessingClaim, RagError>;

    /// Records chunk count and embedding model. The dimension is kept from
    /// the first successful embedding.
    async fn record_ingestion(
        &self,
        document_id: &str,
        chunk_count: usize,
        model: &str,
        dimension: Option<usize>,
    ) -> Result<(), RagError>;

    async fn mark_completed(&self, document_id: &str) -> Result<(), RagError>;

    async fn mark_failed(&self, document_id: &str, error: &str) -> Result<(), RagError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    documents: Mutex<HashMap<String, DocumentRecord>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = DocumentRecord>) -> Self {
        Self {
            documents: Mutex::new(
                records
                    .into_iter()
                    .map(|record| (record.document_id.clone(), record))
                    .collect(),
            ),
        }
    }

    pub async fn load(path: &Path) -> Result<Self, RagError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let records: Vec<DocumentRecord> = serde_json::from_slice(&bytes)
                    .map_err(|error| RagError::Catalog(error.to_string()))?;
                Ok(Self::from_records(records))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), RagError> {
        let bytes = serde_json::to_vec_pretty(&self.records()?)
            .map_err(|error| RagError::Catalog(error.to_string()))?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }

    /// Adds or replaces a document, keeping an existing record's status.
    pub fn register(&self, record: DocumentRecord) -> Result<(), RagError> {
        let mut documents = self.lock()?;
        match documents.get_mut(&record.document_id) {
            Some(existing) => {
                existing.name = record.name;
                existing.owner_id = record.owner_id;
            }
            None => {
                documents.insert(record.document_id.clone(), record);
            }
        }
        Ok(())
    }

    pub fn remove(&self, document_id: &str) -> Result<Option<DocumentRecord>, RagError> {
        Ok(self.lock()?.remove(document_id))
    }

    pub fn records(&self) -> Result<Vec<DocumentRecord>, RagError> {
        let mut records: Vec<_> = self.lock()?.values().cloned().collect();
        records.sort_by(|left, right| left.document_id.cmp(&right.document_id));
        Ok(records)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, DocumentRecord>>, RagError> {
        self.documents
            .lock()
            .map_err(|_| RagError::Catalog("catalog lock poisoned".to_string()))
    }

    fn update(
        &self,
        document_id: &str,
        apply: impl FnOnce(&mut DocumentRecord),
    ) -> Result<(), RagError> {
        let mut documents = self.lock()?;
        let record = documents
            .get_mut(document_id)
            .ok_or_else(|| RagError::Catalog(format!("unknown document {document_id}")))?;
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl DocumentCatalog for InMemoryCatalog {
    async fn document(&self, document_id: &str) -> Result<Option<DocumentRecord>, RagError> {
        Ok(self.lock()?.get(document_id).cloned())
    }

    async fn accessible_documents(
        &self,
        requester_id: &str,
        document_ids: &[String],
    ) -> Result<HashSet<String>, RagError> {
        let documents = self.lock()?;
        Ok(document_ids
            .iter()
            .filter(|id| {
                documents
                    .get(id.as_str())
                    .is_some_and(|record| record.owner_id == requester_id)
            })
            .cloned()
            .collect())
    }

    async fn document_names(
        &self,
        document_ids: &[String],
    ) -> Result<HashMap<String, String>, RagError> {
        let documents = self.lock()?;
        Ok(document_ids
            .iter()
            .filter_map(|id| {
                documents
                    .get(id.as_str())
                    .map(|record| (id.clone(), record.name.clone()))
            })
            .collect())
    }

    async fn begin_processing(
        &self,
        document_id: &str,
        force: bool,
    ) -> Result<ProcessingClaim, RagError> {
        let mut documents = self.lock()?;
        let record = documents
            .get_mut(document_id)
            .ok_or_else(|| RagError::Catalog(format!("unknown document {document_id}")))?;

        match record.status {
            ProcessingStatus::Processing => Ok(ProcessingClaim::Skipped(record.status)),
            ProcessingStatus::Completed if !force => Ok(ProcessingClaim::Skipped(record.status)),
            _ => {
                record.status = ProcessingStatus::Processing;
                record.processing_error = None;
                Ok(ProcessingClaim::Claimed)
            }
        }
    }

    async fn record_ingestion(
        &self,
        document_id: &str,
        chunk_count: usize,
        model: &str,
        dimension: Option<usize>,
    ) -> Result<(), RagError> {
        self.update(document_id, |record| {
            record.chunk_count = chunk_count;
            record.embedding_model = Some(model.to_string());
            if record.embedding_dimension.is_none() {
                record.embedding_dimension = dimension;
            }
        })
    }

    async fn mark_completed(&self, document_id: &str) -> Result<(), RagError> {
        self.update(document_id, |record| {
            record.status = ProcessingStatus::Completed;
            record.processing_error = None;
            record.processed_at = Some(Utc::now());
        })
    }

    async fn mark_failed(&self, document_id: &str, error: &str) -> Result<(), RagError> {
        self.update(document_id, |record| {
            record.status = ProcessingStatus::Failed;
            record.processing_error = Some(error.to_string());
        })
    }
}
