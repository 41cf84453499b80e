use crate::chunking::ChunkingConfig;
use crate::error::RagError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingSettings,
    pub vector_store: VectorStoreSettings,
    pub retrieval: RetrievalSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// `"openai"` or `"ngram"`.
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub dimensions: Option<usize>,
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            dimensions: None,
            batch_size: 100,
            max_concurrent_batches: 4,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VectorStoreSettings {
    /// `"local"`, `"service_a"` or `"service_b"`.
    pub backend: String,
    pub local: LocalStoreSettings,
    pub pinecone: PineconeSettings,
    pub weaviate: WeaviateSettings,
}

impl Default for VectorStoreSettings {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            local: LocalStoreSettings::default(),
            pinecone: PineconeSettings::default(),
            weaviate: WeaviateSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalStoreSettings {
    /// Snapshot file; `None` keeps records in memory only.
    pub path: Option<PathBuf>,
}

impl Default for LocalStoreSettings {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("./vector_store.json")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PineconeSettings {
    /// Index host, e.g. `https://ragboard-abc123.svc.us-east-1.pinecone.io`.
    /// Looked up from `index_name` when empty.
    pub index_host: String,
    pub api_key_env: String,
    pub namespace: Option<String>,
    /// Serverless index to create at startup if it is missing.
    pub index_name: Option<String>,
    pub dimension: usize,
    pub cloud: String,
    pub region: String,
    pub control_plane_url: String,
}

impl Default for PineconeSettings {
    fn default() -> Self {
        Self {
            index_host: String::new(),
            api_key_env: "PINECONE_API_KEY".to_string(),
            namespace: None,
            index_name: None,
            dimension: 1536,
            cloud: "aws".to_string(),
            region: "us-east-1".to_string(),
            control_plane_url: "https://api.pinecone.io".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeaviateSettings {
    pub url: String,
    pub class_name: String,
    pub api_key_env: Option<String>,
}

impl Default for WeaviateSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            class_name: "ResourceChunk".to_string(),
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub score_threshold: f64,
    pub max_context_chars: usize,
    pub rerank: bool,
    pub rerank_model: String,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            score_threshold: 0.7,
            max_context_chars: 3_000,
            rerank: false,
            rerank_model: "gpt-3.5-turbo".to_string(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), RagError> {
        self.chunking.validate()?;

        if self.embedding.batch_size == 0 {
            return Err(RagError::InvalidConfiguration(
                "embedding.batch_size must be > 0".to_string(),
            ));
        }
        match self.embedding.provider.as_str() {
            "openai" | "ngram" => {}
            other => {
                return Err(RagError::InvalidConfiguration(format!(
                    "unknown embedding provider '{other}', expected openai or ngram"
                )))
            }
        }

        match self.vector_store.backend.as_str() {
            "local" | "service_a" | "pinecone" | "service_b" | "weaviate" => {}
            other => {
                return Err(RagError::InvalidConfiguration(format!(
                    "unknown vector store backend '{other}', expected local, service_a or service_b"
                )))
            }
        }

        if matches!(self.vector_store.backend.as_str(), "service_a" | "pinecone") {
            let pinecone = &self.vector_store.pinecone;
            if pinecone.index_host.trim().is_empty() && pinecone.index_name.is_none() {
                return Err(RagError::InvalidConfiguration(
                    "vector_store.pinecone needs index_host or index_name".to_string(),
                ));
            }
            if pinecone.dimension == 0 {
                return Err(RagError::InvalidConfiguration(
                    "vector_store.pinecone.dimension must be > 0".to_string(),
                ));
            }
        }

        if self.retrieval.top_k == 0 {
            return Err(RagError::InvalidConfiguration(
                "retrieval.top_k must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn parse_settings(content: &str) -> Result<Settings, RagError> {
    let settings: Settings = toml::from_str(content)
        .map_err(|error| RagError::InvalidConfiguration(error.to_string()))?;
    settings.validate()?;
    Ok(settings)
}

pub fn load_settings(path: &Path) -> Result<Settings, RagError> {
    let content = std::fs::read_to_string(path)?;
    parse_settings(&content)
}

/// Reads a secret from the environment variable named in the config.
pub fn secret_from_env(variable: &str) -> Result<String, RagError> {
    std::env::var(variable)
        .map_err(|_| RagError::InvalidConfiguration(format!("{variable} is not set")))
}
