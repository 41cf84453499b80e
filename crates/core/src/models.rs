use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub type Metadata = BTreeMap<String, Value>;

/// A contiguous slice of document text, embedded and stored as one unit.
///
/// Offsets count characters, not bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub sequence_index: usize,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub page_number: Option<u32>,
}

/// Stable external ID shared by the chunk row and its vector record.
pub fn record_id(document_id: &str, sequence_index: usize) -> String {
    format!("{document_id}_{sequence_index}")
}

/// One record as handed to a vector backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub record_id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub record_id: String,
    pub document_id: String,
    pub text: String,
    /// Higher is more similar, whichever backend produced it.
    pub score: f64,
    pub metadata: Metadata,
    pub page_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub document_id: String,
    pub document_name: String,
    pub record_id: String,
    pub page_number: Option<u32>,
    pub relevance_score: f64,
    pub excerpt: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub context: String,
    pub citations: Vec<Citation>,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub backend: String,
    pub record_count: u64,
    pub dimension: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ContextRequest {
    pub query: String,
    pub allowed_document_ids: Option<Vec<String>>,
    pub requester_id: Option<String>,
    pub top_k: usize,
    pub score_threshold: f64,
    pub max_context_chars: usize,
}

impl ContextRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            allowed_document_ids: None,
            requester_id: None,
            top_k: 5,
            score_threshold: 0.7,
            max_context_chars: 3_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// The relational side of a document, owned by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub name: String,
    pub owner_id: String,
    pub status: ProcessingStatus,
    pub chunk_count: usize,
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<usize>,
    pub processing_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl DocumentRecord {
    pub fn new(
        document_id: impl Into<String>,
        name: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            name: name.into(),
            owner_id: owner_id.into(),
            status: ProcessingStatus::Pending,
            chunk_count: 0,
            embedding_model: None,
            embedding_dimension: None,
            processing_error: None,
            processed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Completed { chunk_count: usize },
    Skipped { status: ProcessingStatus },
    Failed { error: String },
}
