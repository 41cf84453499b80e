//! Optional second-stage ordering of retrieved hits.

use crate::config::{secret_from_env, EmbeddingSettings};
use crate::context::truncate_with_ellipsis;
use crate::error::RagError;
use crate::models::SearchHit;
use crate::openai::OpenAiClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::time::Duration;

const PROMPT_EXCERPT_CHARS: usize = 500;
const SYSTEM_PROMPT: &str = "You are a relevance ranking expert.";

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Returns the same hits in a new order.
    async fn rerank(&self, query: &str, hits: Vec<SearchHit>) -> Result<Vec<SearchHit>, RagError>;
}

/// Asks a chat-completion model to order the hits by relevance.
pub struct LlmReranker {
    client: OpenAiClient,
    model: String,
}

impl LlmReranker {
    pub fn new(client: OpenAiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }

    /// Reuses the provider endpoint and credentials of the embedding settings.
    pub fn from_settings(provider: &EmbeddingSettings, model: &str) -> Result<Self, RagError> {
        let api_key = secret_from_env(&provider.api_key_env)?;
        let client = OpenAiClient::new(
            &provider.base_url,
            &api_key,
            Duration::from_secs(provider.timeout_secs),
            provider.max_retries,
        )
        .map_err(|error| RagError::Rerank(error.to_string()))?;
        Ok(Self::new(client, model))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl Reranker for LlmReranker {
    async fn rerank(&self, query: &str, hits: Vec<SearchHit>) -> Result<Vec<SearchHit>, RagError> {
        if hits.len() < 2 {
            return Ok(hits);
        }

        let prompt = ranking_prompt(query, &hits);
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.0,
            max_tokens: 100,
        };

        let response: ChatResponse = self
            .client
            .post_json("chat/completions", &request)
            .await
            .map_err(|error| RagError::Rerank(error.to_string()))?;
        let reply = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| RagError::Rerank("empty completion".to_string()))?;

        Ok(apply_ranking(hits, &parse_ranking(&reply)))
    }
}

fn ranking_prompt(query: &str, hits: &[SearchHit]) -> String {
    let mut prompt = format!(
        "Query: {query}\n\nRank these text chunks by relevance to the query. \
         Return only the indices in order of relevance.\n\n"
    );
    for (index, hit) in hits.iter().enumerate() {
        let _ = write!(
            prompt,
            "{index}. {}\n\n",
            truncate_with_ellipsis(&hit.text, PROMPT_EXCERPT_CHARS)
        );
    }
    prompt
}

/// Indices named in `reply`, in order, without duplicates. Tokens that are
/// not integers are ignored; the caller drops out-of-range indices.
fn parse_ranking(reply: &str) -> Vec<usize> {
    let mut order = Vec::new();
    for token in reply.split(|c: char| c.is_whitespace() || c == ',') {
        let token = token.trim_matches(|c: char| matches!(c, '.' | ',' | '[' | ']'));
        if let Ok(index) = token.parse::<usize>() {
            if !order.contains(&index) {
                order.push(index);
            }
        }
    }
    order
}

/// Reorders `hits` by `order`; hits the ranking omits keep their relative
/// order at the end.
fn apply_ranking(hits: Vec<SearchHit>, order: &[usize]) -> Vec<SearchHit> {
    let mut slots: Vec<Option<SearchHit>> = hits.into_iter().map(Some).collect();
    let mut ranked = Vec::with_capacity(slots.len());

    for &index in order {
        if let Some(hit) = slots.get_mut(index).and_then(Option::take) {
            ranked.push(hit);
        }
    }
    ranked.extend(slots.into_iter().flatten());
    ranked
}
