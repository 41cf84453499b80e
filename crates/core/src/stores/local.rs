//! Local persistent vector store.
//!
//! Records live in memory behind a `tokio::sync::RwLock` and, when a path
//! is configured, are written to a JSON snapshot on every mutation (temp
//! file + rename). A mutation becomes visible only after its snapshot is
//! written. Search is an exhaustive cosine scan.

use super::VectorBackend;
use crate::error::StoreError;
use crate::models::{SearchHit, StoreStats, VectorRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::info;

const BACKEND: &str = "local";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    dimension: Option<usize>,
    records: BTreeMap<String, VectorRecord>,
}

pub struct LocalStore {
    path: Option<PathBuf>,
    state: RwLock<Snapshot>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(Snapshot::default()),
        }
    }

    /// Opens the snapshot at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(error) => return Err(error.into()),
        };

        info!(
            path = %path.display(),
            records = snapshot.records.len(),
            "local vector store opened"
        );

        Ok(Self {
            path: Some(path),
            state: RwLock::new(snapshot),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec(snapshot)?;
        let mut temp = path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl VectorBackend for LocalStore {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write().await;
        let dimension = state.dimension.unwrap_or(records[0].vector.len());
        if dimension == 0 {
            return Err(StoreError::InvalidRecord("empty vector".to_string()));
        }
        if let Some(record) = records.iter().find(|record| record.vector.len() != dimension) {
            return Err(StoreError::InvalidRecord(format!(
                "record {} has dimension {}, collection uses {}",
                record.record_id,
                record.vector.len(),
                dimension
            )));
        }

        let mut next = state.clone();
        next.dimension = Some(dimension);
        for record in records {
            next.records.insert(record.record_id.clone(), record.clone());
        }

        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        document_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let state = self.state.read().await;
        if let Some(dimension) = state.dimension {
            if vector.len() != dimension {
                return Err(StoreError::InvalidRecord(format!(
                    "query dimension {} does not match collection dimension {}",
                    vector.len(),
                    dimension
                )));
            }
        }

        let allowed: Option<HashSet<&str>> =
            document_ids.map(|ids| ids.iter().map(String::as_str).collect());

        let mut hits: Vec<SearchHit> = state
            .records
            .values()
            .filter(|record| {
                allowed
                    .as_ref()
                    .map_or(true, |ids| ids.contains(record.document_id.as_str()))
            })
            .map(|record| SearchHit {
                record_id: record.record_id.clone(),
                document_id: record.document_id.clone(),
                text: record.text.clone(),
                score: f64::from(cosine_similarity(vector, &record.vector)),
                metadata: record.metadata.clone(),
                page_number: record.page_number,
            })
            .collect();

        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state
            .records
            .values()
            .any(|record| record.document_id == document_id)
        {
            return Ok(());
        }

        let mut next = state.clone();
        next.records
            .retain(|_, record| record.document_id != document_id);
        if next.records.is_empty() {
            next.dimension = None;
        }

        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let state = self.state.read().await;
        Ok(StoreStats {
            backend: BACKEND.to_string(),
            record_count: state.records.len() as u64,
            dimension: state.dimension,
        })
    }
}

/// Cosine similarity in `[-1, 1]`; `0.0` for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
