use crate::error::RagError;
use crate::models::{Chunk, Metadata};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Sentence endings the chunker prefers to cut after. All are two characters wide.
const SENTENCE_ENDS: [[char; 2]; 4] = [['.', ' '], ['!', ' '], ['?', ' '], ['\n', '\n']];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            overlap: 200,
        }
    }
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, RagError> {
        let config = Self {
            chunk_size,
            overlap,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RagError> {
        if self.overlap >= self.chunk_size {
            return Err(RagError::InvalidConfiguration(format!(
                "chunk overlap {} must be less than chunk size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Splits `text` into overlapping windows of at most `chunk_size` characters.
///
/// A window that does not reach the end of the text is shortened to the
/// rightmost sentence ending found in `[start + overlap, end)`, so that a
/// sentence is only split when no boundary exists in range. The next window
/// begins `overlap` characters before the previous cut.
///
/// `metadata` is copied onto every chunk, together with a `content_hash`.
pub fn chunk_text(
    text: &str,
    config: ChunkingConfig,
    metadata: &Metadata,
) -> Result<Vec<Chunk>, RagError> {
    config.validate()?;

    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < total {
        let mut end = start.saturating_add(config.chunk_size).min(total);
        if end < total {
            if let Some(cut) = sentence_break(&chars, start + config.overlap, end) {
                end = cut;
            }
        }

        let window: String = chars[start..end].iter().collect();
        let trimmed = window.trim();
        if !trimmed.is_empty() {
            chunks.push(make_chunk(trimmed, start, end, chunks.len(), metadata));
        }

        if end >= total {
            break;
        }

        let next = end.saturating_sub(config.overlap);
        if next <= start {
            return Err(RagError::InvalidConfiguration(format!(
                "chunking made no progress at offset {start} (chunk size {}, overlap {})",
                config.chunk_size, config.overlap
            )));
        }
        start = next;
    }

    Ok(chunks)
}

/// Position just after the punctuation of the rightmost sentence ending that
/// lies entirely inside `[from, to)`.
fn sentence_break(chars: &[char], from: usize, to: usize) -> Option<usize> {
    if to < from + 2 {
        return None;
    }

    (from..=to - 2)
        .rev()
        .find(|&position| {
            SENTENCE_ENDS.iter().any(|delimiter| {
                chars[position] == delimiter[0] && chars[position + 1] == delimiter[1]
            })
        })
        .map(|position| position + 1)
}

fn make_chunk(
    text: &str,
    start_offset: usize,
    end_offset: usize,
    sequence_index: usize,
    metadata: &Metadata,
) -> Chunk {
    let mut metadata = metadata.clone();
    metadata.insert(
        "content_hash".to_string(),
        Value::String(content_hash(text)),
    );

    Chunk {
        text: text.to_string(),
        start_offset,
        end_offset,
        sequence_index,
        metadata,
        page_number: None,
    }
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
