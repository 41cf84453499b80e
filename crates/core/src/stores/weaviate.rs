use super::{page_number_from, VectorBackend};
use crate::error::StoreError;
use crate::models::{Metadata, SearchHit, StoreStats, VectorRecord};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};
use tracing::warn;
use url::Url;
use uuid::Uuid;

const BACKEND: &str = "weaviate";

pub struct WeaviateStore {
    client: Client,
    endpoint: String,
    class_name: String,
    api_key: Option<String>,
}

impl WeaviateStore {
    pub fn new(
        endpoint: &str,
        class_name: &str,
        api_key: Option<String>,
    ) -> Result<Self, StoreError> {
        let parsed = Url::parse(endpoint)?;
        let valid_class = class_name
            .chars()
            .next()
            .is_some_and(|first| first.is_ascii_uppercase())
            && class_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_class {
            return Err(StoreError::NotConfigured(format!(
                "invalid weaviate class name: {class_name:?}"
            )));
        }

        Ok(Self {
            client: Client::new(),
            endpoint: parsed.as_str().trim_end_matches('/').to_string(),
            class_name: class_name.to_string(),
            api_key,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn graphql(&self, query: String) -> Result<Value, StoreError> {
        let response = self
            .authorize(self.client.post(format!("{}/v1/graphql", self.endpoint)))
            .json(&json!({ "query": query }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::backend(BACKEND, response.status().to_string()));
        }

        let body: Value = response.json().await?;
        if let Some(errors) = body
            .pointer("/errors")
            .and_then(Value::as_array)
            .filter(|errors| !errors.is_empty())
        {
            return Err(StoreError::backend(BACKEND, Value::from(errors.clone()).to_string()));
        }
        Ok(body)
    }
}

#[async_trait]
impl VectorBackend for WeaviateStore {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn prepare(&self) -> Result<(), StoreError> {
        let response = self
            .authorize(
                self.client
                    .get(format!("{}/v1/schema/{}", self.endpoint, self.class_name)),
            )
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            return Err(StoreError::backend(BACKEND, response.status().to_string()));
        }

        let response = self
            .authorize(self.client.post(format!("{}/v1/schema", self.endpoint)))
            .json(&class_definition(&self.class_name))
            .send()
            .await?;

        // 422 is returned when another writer created the class first.
        if !response.status().is_success() && response.status() != StatusCode::UNPROCESSABLE_ENTITY
        {
            return Err(StoreError::backend(
                BACKEND,
                format!("schema setup failed with {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }

        let response = self
            .authorize(
                self.client
                    .post(format!("{}/v1/batch/objects", self.endpoint)),
            )
            .json(&batch_body(&self.class_name, records)?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::backend(BACKEND, response.status().to_string()));
        }

        let body: Value = response.json().await?;
        match first_batch_error(&body) {
            Some(error) => Err(StoreError::backend(BACKEND, error)),
            None => Ok(()),
        }
    }

    async fn query(
        &self,
        vector: &[f32],
        document_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let query = near_vector_query(&self.class_name, vector, document_ids, limit)?;
        let body = self.graphql(query).await?;
        Ok(parse_hits(&body, &self.class_name))
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let response = self
            .authorize(
                self.client
                    .delete(format!("{}/v1/batch/objects", self.endpoint)),
            )
            .json(&json!({
                "match": {
                    "class": self.class_name,
                    "where": {
                        "path": ["document_id"],
                        "operator": "Equal",
                        "valueText": document_id,
                    }
                },
                "output": "minimal",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::backend(BACKEND, response.status().to_string()));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let query = format!("{{ Aggregate {{ {} {{ meta {{ count }} }} }} }}", self.class_name);
        let body = self.graphql(query).await?;
        let record_count = body
            .pointer(&format!("/data/Aggregate/{}/0/meta/count", self.class_name))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(StoreStats {
            backend: BACKEND.to_string(),
            record_count,
            dimension: None,
        })
    }
}

/// Weaviate object IDs must be UUIDs; derive one from the record ID so
/// re-adding a chunk overwrites it.
pub fn object_id(record_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, record_id.as_bytes())
}

fn class_definition(class_name: &str) -> Value {
    json!({
        "class": class_name,
        "vectorizer": "none",
        "vectorIndexConfig": { "distance": "cosine" },
        "properties": [
            {"name": "chunk_text", "dataType": ["text"]},
            {"name": "document_id", "dataType": ["text"], "tokenization": "field"},
            {"name": "record_id", "dataType": ["text"], "tokenization": "field"},
            {"name": "chunk_index", "dataType": ["int"]},
            {"name": "page_number", "dataType": ["int"]},
            {"name": "metadata", "dataType": ["text"]}
        ]
    })
}

fn batch_body(class_name: &str, records: &[VectorRecord]) -> Result<Value, StoreError> {
    let objects = records
        .iter()
        .map(|record| {
            let metadata = serde_json::to_string(&record.metadata)?;
            Ok(json!({
                "class": class_name,
                "id": object_id(&record.record_id).to_string(),
                "vector": record.vector,
                "properties": {
                    "chunk_text": record.text,
                    "document_id": record.document_id,
                    "record_id": record.record_id,
                    "chunk_index": record.chunk_index,
                    "page_number": record.page_number.map_or(-1, i64::from),
                    "metadata": metadata,
                }
            }))
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    Ok(json!({ "objects": objects }))
}

fn first_batch_error(body: &Value) -> Option<String> {
    body.as_array()?.iter().find_map(|item| {
        item.pointer("/result/errors/error")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
            .map(|error| {
                error
                    .pointer("/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown batch error")
                    .to_string()
            })
    })
}

fn near_vector_query(
    class_name: &str,
    vector: &[f32],
    document_ids: Option<&[String]>,
    limit: usize,
) -> Result<String, StoreError> {
    // JSON arrays and strings are valid GraphQL literals.
    let vector = serde_json::to_string(vector)?;
    let filter = match document_ids {
        Some(ids) => format!(
            ", where: {{ path: [\"document_id\"], operator: ContainsAny, valueTextArray: {} }}",
            serde_json::to_string(ids)?
        ),
        None => String::new(),
    };

    Ok(format!(
        "{{ Get {{ {class_name}(nearVector: {{ vector: {vector} }}, limit: {limit}{filter}) \
         {{ chunk_text document_id record_id chunk_index page_number metadata \
         _additional {{ id distance certainty }} }} }} }}"
    ))
}

/// Converts Weaviate's cosine distance into a higher-is-closer score.
fn parse_hits(body: &Value, class_name: &str) -> Vec<SearchHit> {
    let items = body
        .pointer(&format!("/data/Get/{class_name}"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    items
        .into_iter()
        .filter_map(|item| {
            let document_id = item
                .pointer("/document_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let chunk_index = item.pointer("/chunk_index").and_then(Value::as_i64).unwrap_or(0);
            let record_id = item
                .pointer("/record_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("{document_id}_{chunk_index}"));

            let score = match (
                item.pointer("/_additional/distance").and_then(Value::as_f64),
                item.pointer("/_additional/certainty").and_then(Value::as_f64),
            ) {
                (Some(distance), _) => 1.0 - distance,
                (None, Some(certainty)) => certainty,
                (None, None) => {
                    warn!(%record_id, "weaviate hit without distance, dropping");
                    return None;
                }
            };

            let metadata: Metadata = item
                .pointer("/metadata")
                .and_then(Value::as_str)
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();

            Some(SearchHit {
                record_id,
                document_id,
                text: item
                    .pointer("/chunk_text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                score,
                metadata,
                page_number: page_number_from(item.pointer("/page_number")),
            })
        })
        .collect()
}
