use crate::config::{secret_from_env, EmbeddingSettings};
use crate::error::RagError;
use crate::openai::OpenAiClient;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// A text-to-vector provider. One `embed_texts` call is one provider request.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    /// Known output dimension, if the provider advertises one up front.
    fn dimensions(&self) -> Option<usize>;

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}

pub async fn embed(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>, RagError> {
    embedder
        .embed_texts(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| RagError::EmbeddingProvider("empty embedding response".to_string()))
}

/// Embeds `texts` in groups of at most `batch_size`, keeping up to
/// `max_concurrency` requests in flight.
///
/// Output order matches input order. The first failing group aborts the
/// remaining ones.
pub async fn embed_batch(
    embedder: &dyn Embedder,
    texts: &[String],
    batch_size: usize,
    max_concurrency: usize,
) -> Result<Vec<Vec<f32>>, RagError> {
    if batch_size == 0 {
        return Err(RagError::InvalidConfiguration(
            "embedding batch size must be > 0".to_string(),
        ));
    }
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let groups: Vec<Vec<Vec<f32>>> = stream::iter(texts.chunks(batch_size))
        .map(|group| async move {
            let vectors = embedder.embed_texts(group).await?;
            if vectors.len() != group.len() {
                return Err(RagError::EmbeddingProvider(format!(
                    "provider returned {} embeddings for {} inputs",
                    vectors.len(),
                    group.len()
                )));
            }
            Ok(vectors)
        })
        .buffered(max_concurrency.max(1))
        .try_collect()
        .await?;

    let vectors: Vec<Vec<f32>> = groups.into_iter().flatten().collect();
    ensure_uniform_dimension(&vectors)?;
    Ok(vectors)
}

fn ensure_uniform_dimension(vectors: &[Vec<f32>]) -> Result<(), RagError> {
    let Some(first) = vectors.first() else {
        return Ok(());
    };
    if first.is_empty() {
        return Err(RagError::EmbeddingProvider(
            "provider returned an empty vector".to_string(),
        ));
    }
    if let Some(odd) = vectors.iter().find(|vector| vector.len() != first.len()) {
        return Err(RagError::EmbeddingProvider(format!(
            "inconsistent embedding dimensions {} and {}",
            first.len(),
            odd.len()
        )));
    }
    Ok(())
}

pub fn create_embedder(settings: &EmbeddingSettings) -> Result<Arc<dyn Embedder>, RagError> {
    match settings.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiEmbedder::from_settings(settings)?)),
        "ngram" => Ok(Arc::new(CharacterNgramEmbedder {
            dimensions: settings.dimensions.unwrap_or(DEFAULT_EMBEDDING_DIMENSIONS),
        })),
        other => Err(RagError::InvalidConfiguration(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

/// Embedding client for `POST {base_url}/embeddings` on OpenAI-compatible APIs.
pub struct OpenAiEmbedder {
    client: OpenAiClient,
    model: String,
    dimensions: Option<usize>,
}

impl OpenAiEmbedder {
    pub fn new(client: OpenAiClient, model: impl Into<String>, dimensions: Option<usize>) -> Self {
        Self {
            client,
            model: model.into(),
            dimensions,
        }
    }

    pub fn from_settings(settings: &EmbeddingSettings) -> Result<Self, RagError> {
        let api_key = secret_from_env(&settings.api_key_env)?;
        let client = OpenAiClient::new(
            &settings.base_url,
            &api_key,
            Duration::from_secs(settings.timeout_secs),
            settings.max_retries,
        )
        .map_err(|error| RagError::EmbeddingProvider(error.to_string()))?;
        Ok(Self::new(client, settings.model.clone(), settings.dimensions))
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl EmbeddingResponse {
    fn into_ordered_vectors(mut self) -> Vec<Vec<f32>> {
        self.data.sort_by_key(|entry| entry.index);
        self.data.into_iter().map(|entry| entry.embedding).collect()
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };
        let response: EmbeddingResponse = self
            .client
            .post_json("embeddings", &request)
            .await
            .map_err(|error| RagError::EmbeddingProvider(error.to_string()))?;

        Ok(response.into_ordered_vectors())
    }
}

/// Hashed character-trigram embedder. Deterministic and offline.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_name(&self) -> &str {
        "char-trigram"
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dimensions.max(1))
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Encodes each text as `[length, first char]` and records request sizes.
    #[derive(Default)]
    struct RecordingEmbedder {
        requests: Mutex<Vec<usize>>,
        fail_on: Option<String>,
        short_on: Option<String>,
    }

    #[async_trait]
    impl Embedder for RecordingEmbedder {
        fn model_name(&self) -> &str {
            "recording"
        }

        fn dimensions(&self) -> Option<usize> {
            Some(2)
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            self.requests.lock().unwrap().push(texts.len());
            // Earlier groups finish last.
            let offset = texts[0]
                .chars()
                .next()
                .map(|c| c as u64 - 'a' as u64)
                .unwrap_or(0);
            let delay = 5 * (26 - offset);
            tokio::time::sleep(Duration::from_millis(delay)).await;

            if let Some(bad) = &self.fail_on {
                if texts.contains(bad) {
                    return Err(RagError::EmbeddingProvider("boom".to_string()));
                }
            }
            if let Some(short) = &self.short_on {
                if texts.contains(short) {
                    return Ok(texts.iter().skip(1).map(|text| encode(text)).collect());
                }
            }
            Ok(texts.iter().map(|text| encode(text)).collect())
        }
    }

    fn encode(text: &str) -> Vec<f32> {
        vec![
            text.len() as f32,
            text.chars().next().map(|c| c as u32 as f32).unwrap_or(0.0),
        ]
    }

    fn inputs() -> Vec<String> {
        ["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta"]
            .iter()
            .map(|text| text.to_string())
            .collect()
    }

    #[tokio::test]
    async fn batches_preserve_input_order() {
        let embedder = RecordingEmbedder::default();
        let texts = inputs();

        let vectors = embed_batch(&embedder, &texts, 2, 4)
            .await
            .expect("batch should succeed");

        assert_eq!(vectors.len(), texts.len());
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector, &encode(text));
        }
        let mut sizes = embedder.requests.lock().unwrap().clone();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2, 2]);
    }

    #[tokio::test]
    async fn batch_entry_matches_single_embedding() {
        let embedder = CharacterNgramEmbedder::default();
        let texts = vec!["a pump".to_string(), "b valve".to_string(), "c seal".to_string()];

        let batch = embed_batch(&embedder, &texts, 2, 2).await.expect("batch");
        let single = embed(&embedder, "b valve").await.expect("single");

        assert_eq!(batch[1], single);
    }

    #[tokio::test]
    async fn failing_group_aborts_the_batch() {
        let embedder = RecordingEmbedder {
            fail_on: Some("gamma".to_string()),
            ..Default::default()
        };

        let result = embed_batch(&embedder, &inputs(), 2, 1).await;

        assert!(matches!(result, Err(RagError::EmbeddingProvider(_))));
        assert!(embedder.requests.lock().unwrap().len() < 4);
    }

    #[tokio::test]
    async fn short_provider_response_is_an_error() {
        let embedder = RecordingEmbedder {
            short_on: Some("alpha".to_string()),
            ..Default::default()
        };

        let result = embed_batch(&embedder, &inputs(), 3, 2).await;
        assert!(matches!(result, Err(RagError::EmbeddingProvider(_))));
    }

    #[tokio::test]
    async fn zero_batch_size_is_invalid() {
        let embedder = CharacterNgramEmbedder::default();
        let result = embed_batch(&embedder, &inputs(), 0, 1).await;
        assert!(matches!(result, Err(RagError::InvalidConfiguration(_))));
    }

    #[test]
    fn mixed_dimensions_are_rejected() {
        let result = ensure_uniform_dimension(&[vec![1.0, 2.0], vec![1.0]]);
        assert!(matches!(result, Err(RagError::EmbeddingProvider(_))));
        assert!(ensure_uniform_dimension(&[vec![1.0], vec![2.0]]).is_ok());
    }

    #[test]
    fn provider_response_is_reordered_by_index() {
        let response: EmbeddingResponse = serde_json::from_value(serde_json::json!({
            "data": [
                {"embedding": [0.2], "index": 1},
                {"embedding": [0.1], "index": 0}
            ]
        }))
        .expect("response should parse");

        assert_eq!(response.into_ordered_vectors(), vec![vec![0.1], vec![0.2]]);
    }

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed_one("Hydraulic pressure and flow");
        let second = embedder.embed_one("Hydraulic pressure and flow");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed_one("abc");
        assert_eq!(vector.len(), 32);
    }
}
