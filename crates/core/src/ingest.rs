use crate::error::RagError;
use crate::models::ProcessingOutcome;
use crate::pipeline::RagPipeline;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

const TEXT_EXTENSIONS: [&str; 3] = ["txt", "md", "markdown"];

/// A file on disk that can be ingested as one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSource {
    pub document_id: String,
    pub name: String,
    pub path: PathBuf,
}

pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

pub struct IngestionReport {
    pub outcomes: Vec<(DocumentSource, ProcessingOutcome)>,
    pub skipped_files: Vec<SkippedFile>,
}

impl IngestionReport {
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, ProcessingOutcome::Completed { .. }))
            .count()
    }
}

pub fn discover_text_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_text = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                TEXT_EXTENSIONS
                    .iter()
                    .any(|known| ext.eq_ignore_ascii_case(known))
            });

        if is_text {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Stable document ID derived from the file path.
pub fn document_id_for(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn document_source(path: &Path) -> Result<DocumentSource, RagError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            RagError::InvalidConfiguration(format!("path missing filename: {}", path.display()))
        })?;

    Ok(DocumentSource {
        document_id: document_id_for(path),
        name: name.to_string(),
        path: path.to_path_buf(),
    })
}

pub fn discover_documents(folder: &Path) -> Result<Vec<DocumentSource>, RagError> {
    let files = discover_text_files(folder);
    if files.is_empty() {
        return Err(RagError::InvalidConfiguration(format!(
            "no text files found in {}",
            folder.display()
        )));
    }

    files.iter().map(|path| document_source(path)).collect()
}

/// Processes every source, skipping files that cannot be read as UTF-8 text.
pub async fn ingest_sources_best_effort(
    pipeline: &RagPipeline,
    sources: Vec<DocumentSource>,
    force: bool,
) -> Result<IngestionReport, RagError> {
    let mut outcomes = Vec::new();
    let mut skipped_files = Vec::new();

    for source in sources {
        let text = match tokio::fs::read_to_string(&source.path).await {
            Ok(text) => text,
            Err(error) => {
                warn!(path = %source.path.display(), %error, "skipping unreadable file");
                skipped_files.push(SkippedFile {
                    path: source.path,
                    reason: error.to_string(),
                });
                continue;
            }
        };

        let outcome = pipeline
            .process_document(&source.document_id, &text, force)
            .await?;
        outcomes.push((source, outcome));
    }

    Ok(IngestionReport {
        outcomes,
        skipped_files,
    })
}
