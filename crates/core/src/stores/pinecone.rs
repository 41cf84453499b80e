use super::{page_number_from, VectorBackend};
use crate::error::StoreError;
use crate::models::{Metadata, SearchHit, StoreStats, VectorRecord};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Map, Value};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

const BACKEND: &str = "pinecone";
const UPSERT_BATCH: usize = 100;
const DELETE_BATCH: usize = 1_000;
/// Pinecone caps metadata size per vector; chunk text is stored truncated.
const METADATA_TEXT_LIMIT: usize = 1_000;
const API_VERSION: &str = "2024-07";
const CONTROL_PLANE_URL: &str = "https://api.pinecone.io";
const READY_POLLS: u32 = 30;
const READY_INTERVAL: Duration = Duration::from_secs(2);

/// Serverless index that `prepare` creates when it does not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub dimension: usize,
    pub cloud: String,
    pub region: String,
}

pub struct PineconeStore {
    client: Client,
    control_plane: String,
    index_host: OnceLock<String>,
    index: Option<IndexSpec>,
    api_key: String,
    namespace: Option<String>,
}

#[derive(Debug, PartialEq)]
struct IndexDescription {
    host: Option<String>,
    dimension: Option<usize>,
    ready: bool,
}

impl PineconeStore {
    pub fn new(
        index_host: &str,
        api_key: impl Into<String>,
        namespace: Option<String>,
    ) -> Result<Self, StoreError> {
        if index_host.trim().is_empty() {
            return Err(StoreError::NotConfigured(
                "pinecone index host is empty".to_string(),
            ));
        }
        let parsed = Url::parse(index_host)?;

        let store = Self::unresolved(api_key.into(), namespace);
        let _ = store
            .index_host
            .set(parsed.as_str().trim_end_matches('/').to_string());
        Ok(store)
    }

    /// Store whose data-plane host is looked up (and the index created if
    /// needed) by `prepare`.
    pub fn for_index(
        spec: IndexSpec,
        api_key: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        Self::unresolved(api_key.into(), namespace).with_index(spec)
    }

    pub fn with_index(mut self, spec: IndexSpec) -> Self {
        self.index = Some(spec);
        self
    }

    pub fn with_control_plane(mut self, url: &str) -> Result<Self, StoreError> {
        let parsed = Url::parse(url)?;
        self.control_plane = parsed.as_str().trim_end_matches('/').to_string();
        Ok(self)
    }

    fn unresolved(api_key: String, namespace: Option<String>) -> Self {
        Self {
            client: Client::new(),
            control_plane: CONTROL_PLANE_URL.to_string(),
            index_host: OnceLock::new(),
            index: None,
            api_key,
            namespace,
        }
    }

    fn host(&self) -> Result<&str, StoreError> {
        self.index_host.get().map(String::as_str).ok_or_else(|| {
            StoreError::NotConfigured("pinecone index host is not resolved yet".to_string())
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
        let url = format!("{}{}", self.host()?, path);
        let response = self.authorize(self.client.post(url)).json(body).send().await?;
        read_json(response).await
    }

    fn with_namespace(&self, mut body: Value) -> Value {
        if let (Some(namespace), Some(object)) = (&self.namespace, body.as_object_mut()) {
            object.insert("namespace".to_string(), Value::from(namespace.as_str()));
        }
        body
    }

    async fn describe_index(&self, name: &str) -> Result<Option<IndexDescription>, StoreError> {
        let url = format!("{}/indexes/{}", self.control_plane, name);
        let response = self.authorize(self.client.get(url)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(parse_index_description(&read_json(response).await?)))
    }

    async fn create_index(&self, spec: &IndexSpec) -> Result<IndexDescription, StoreError> {
        info!(index = %spec.name, dimension = spec.dimension, "creating pinecone index");
        let url = format!("{}/indexes", self.control_plane);
        let response = self
            .authorize(self.client.post(url))
            .json(&create_index_body(spec))
            .send()
            .await?;

        // 409 means another writer created the index first.
        if response.status() == StatusCode::CONFLICT {
            let existing = self.describe_index(&spec.name).await?;
            return existing.ok_or_else(|| {
                StoreError::backend(BACKEND, format!("index {} was not found", spec.name))
            });
        }
        Ok(parse_index_description(&read_json(response).await?))
    }

    /// Record IDs of one document, or `None` when the index cannot list
    /// vectors (pod-based indexes answer 400).
    async fn list_record_ids(
        &self,
        document_id: &str,
    ) -> Result<Option<Vec<String>>, StoreError> {
        let prefix = format!("{document_id}_");
        let mut ids = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let url = list_url(
                self.host()?,
                &prefix,
                self.namespace.as_deref(),
                token.as_deref(),
            )?;
            let response = self.authorize(self.client.get(url)).send().await?;
            if response.status() == StatusCode::BAD_REQUEST && token.is_none() {
                return Ok(None);
            }

            let (page, next) = parse_listed_ids(&read_json(response).await?);
            ids.extend(
                page.into_iter()
                    .filter(|id| belongs_to_document(id, document_id)),
            );
            match next {
                Some(next) => token = Some(next),
                None => return Ok(Some(ids)),
            }
        }
    }
}

#[async_trait]
impl VectorBackend for PineconeStore {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn prepare(&self) -> Result<(), StoreError> {
        let Some(spec) = &self.index else {
            return Ok(());
        };

        let mut description = match self.describe_index(&spec.name).await? {
            Some(description) => description,
            None => self.create_index(spec).await?,
        };

        let mut polls = 0;
        while !description.ready {
            if polls == READY_POLLS {
                return Err(StoreError::backend(
                    BACKEND,
                    format!("index {} is not ready", spec.name),
                ));
            }
            polls += 1;
            tokio::time::sleep(READY_INTERVAL).await;
            description = self.describe_index(&spec.name).await?.ok_or_else(|| {
                StoreError::backend(BACKEND, format!("index {} disappeared", spec.name))
            })?;
        }

        if let Some(dimension) = description.dimension.filter(|dim| *dim != spec.dimension) {
            warn!(
                index = %spec.name,
                existing = dimension,
                configured = spec.dimension,
                "pinecone index dimension differs from configuration"
            );
        }

        let host = description.host.ok_or_else(|| {
            StoreError::backend(BACKEND, format!("index {} has no host", spec.name))
        })?;
        // A host given in the configuration takes precedence.
        let _ = self.index_host.set(normalize_host(&host));
        Ok(())
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<(), StoreError> {
        for batch in records.chunks(UPSERT_BATCH) {
            let body = self.with_namespace(upsert_body(batch));
            self.post("/vectors/upsert", &body).await?;
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        document_ids: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<SearchHit>, StoreError> {
        let body = self.with_namespace(query_body(vector, document_ids, limit));
        let response = self.post("/query", &body).await?;
        Ok(parse_matches(&response))
    }

    /// Serverless indexes reject metadata-filtered deletes, so the document's
    /// IDs are listed by prefix and deleted explicitly.
    async fn delete_document(&self, document_id: &str) -> Result<(), StoreError> {
        let Some(ids) = self.list_record_ids(document_id).await? else {
            debug!(document_id, "listing unsupported, deleting by metadata filter");
            let body = self.with_namespace(json!({
                "filter": { "document_id": { "$eq": document_id } }
            }));
            self.post("/vectors/delete", &body).await?;
            return Ok(());
        };

        debug!(document_id, records = ids.len(), "deleting pinecone vectors");
        for batch in ids.chunks(DELETE_BATCH) {
            let body = self.with_namespace(json!({ "ids": batch }));
            self.post("/vectors/delete", &body).await?;
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let response = self.post("/describe_index_stats", &json!({})).await?;
        Ok(parse_stats(&response, self.namespace.as_deref()))
    }
}

async fn read_json(response: Response) -> Result<Value, StoreError> {
    if !response.status().is_success() {
        let status = response.status();
        let details = response.text().await.unwrap_or_default();
        return Err(StoreError::backend(BACKEND, format!("{status}: {details}")));
    }

    let text = response.text().await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

fn create_index_body(spec: &IndexSpec) -> Value {
    json!({
        "name": spec.name,
        "dimension": spec.dimension,
        "metric": "cosine",
        "spec": {
            "serverless": { "cloud": spec.cloud, "region": spec.region }
        }
    })
}

fn parse_index_description(response: &Value) -> IndexDescription {
    IndexDescription {
        host: response
            .pointer("/host")
            .and_then(Value::as_str)
            .filter(|host| !host.is_empty())
            .map(str::to_string),
        dimension: response
            .pointer("/dimension")
            .and_then(Value::as_u64)
            .map(|dimension| dimension as usize),
        ready: response
            .pointer("/status/ready")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// The control plane reports bare hostnames.
fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{host}")
    }
}

fn list_url(
    host: &str,
    prefix: &str,
    namespace: Option<&str>,
    token: Option<&str>,
) -> Result<Url, StoreError> {
    let mut url = Url::parse(&format!("{host}/vectors/list"))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("prefix", prefix);
        if let Some(namespace) = namespace {
            query.append_pair("namespace", namespace);
        }
        if let Some(token) = token {
            query.append_pair("paginationToken", token);
        }
    }
    Ok(url)
}

fn parse_listed_ids(response: &Value) -> (Vec<String>, Option<String>) {
    let ids = response
        .pointer("/vectors")
        .and_then(Value::as_array)
        .map(|vectors| {
            vectors
                .iter()
                .filter_map(|vector| vector.pointer("/id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let next = response
        .pointer("/pagination/next")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string);
    (ids, next)
}

/// Prefix listing for `a_` also returns `a_b_0`; only `a_<index>` belongs to `a`.
fn belongs_to_document(record_id: &str, document_id: &str) -> bool {
    record_id
        .strip_prefix(document_id)
        .and_then(|rest| rest.strip_prefix('_'))
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|byte| byte.is_ascii_digit()))
}

fn upsert_body(records: &[VectorRecord]) -> Value {
    let vectors: Vec<Value> = records
        .iter()
        .map(|record| {
            let mut metadata = Map::new();
            for (key, value) in &record.metadata {
                if is_scalar(value) {
                    metadata.insert(key.clone(), value.clone());
                }
            }
            metadata.insert("document_id".to_string(), Value::from(record.document_id.as_str()));
            metadata.insert("chunk_index".to_string(), Value::from(record.chunk_index));
            metadata.insert(
                "chunk_text".to_string(),
                Value::from(truncate_chars(&record.text, METADATA_TEXT_LIMIT)),
            );
            if let Some(page) = record.page_number {
                metadata.insert("page_number".to_string(), Value::from(page));
            }

            json!({
                "id": record.record_id,
                "values": record.vector,
                "metadata": metadata,
            })
        })
        .collect();

    json!({ "vectors": vectors })
}

fn query_body(vector: &[f32], document_ids: Option<&[String]>, limit: usize) -> Value {
    let mut body = json!({
        "vector": vector,
        "topK": limit,
        "includeMetadata": true,
    });
    if let Some(ids) = document_ids {
        body["filter"] = json!({ "document_id": { "$in": ids } });
    }
    body
}

/// Pinecone cosine indexes already return similarity, higher is closer.
fn parse_matches(response: &Value) -> Vec<SearchHit> {
    let matches = response
        .pointer("/matches")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    matches
        .into_iter()
        .map(|item| {
            let record_id = item
                .pointer("/id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let score = item.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);
            let mut metadata: Metadata = item
                .pointer("/metadata")
                .and_then(Value::as_object)
                .map(|object| object.clone().into_iter().collect())
                .unwrap_or_default();

            let text = metadata
                .remove("chunk_text")
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_default();
            let document_id = metadata
                .get("document_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let page_number = page_number_from(metadata.get("page_number"));

            SearchHit {
                record_id,
                document_id,
                text,
                score,
                metadata,
                page_number,
            }
        })
        .collect()
}

fn parse_stats(response: &Value, namespace: Option<&str>) -> StoreStats {
    let record_count = match namespace {
        Some(namespace) => response
            .pointer(&format!("/namespaces/{namespace}/vectorCount"))
            .and_then(Value::as_u64),
        None => response.pointer("/totalVectorCount").and_then(Value::as_u64),
    }
    .unwrap_or(0);

    StoreStats {
        backend: BACKEND.to_string(),
        record_count,
        dimension: response
            .pointer("/dimension")
            .and_then(Value::as_u64)
            .map(|dimension| dimension as usize),
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
