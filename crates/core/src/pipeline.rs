//! Ingestion and retrieval over injected embedder, store and catalog.
//!
//! Retrieval runs `embed query -> search -> access filter -> rank -> budget
//! -> assemble`. Only a failed query embedding is reported as an error; an
//! unreachable store or catalog yields an empty context.

use crate::catalog::{DocumentCatalog, ProcessingClaim};
use crate::chunking::chunk_text;
use crate::config::Settings;
use crate::context::{assemble_context, ContextCandidate};
use crate::embeddings::{embed, embed_batch, Embedder};
use crate::error::RagError;
use crate::models::{
    ContextRequest, Metadata, ProcessingOutcome, RetrievedContext, SearchHit, StoreStats,
};
use crate::rerank::Reranker;
use crate::stores::VectorStoreAdapter;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct RagPipeline {
    embedder: Arc<dyn Embedder>,
    store: VectorStoreAdapter,
    catalog: Arc<dyn DocumentCatalog>,
    reranker: Option<Arc<dyn Reranker>>,
    settings: Settings,
}

impl RagPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: VectorStoreAdapter,
        catalog: Arc<dyn DocumentCatalog>,
        settings: Settings,
    ) -> Self {
        Self {
            embedder,
            store,
            catalog,
            reranker: None,
            settings,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// A request carrying the configured retrieval defaults.
    pub fn context_request(&self, query: impl Into<String>) -> ContextRequest {
        let retrieval = &self.settings.retrieval;
        ContextRequest {
            top_k: retrieval.top_k,
            score_threshold: retrieval.score_threshold,
            max_context_chars: retrieval.max_context_chars,
            ..ContextRequest::new(query)
        }
    }

    /// Chunks, embeds and stores `text`, replacing any previous vectors of
    /// the document. Returns the number of chunks stored. Text without any
    /// content is rejected and leaves stored vectors untouched.
    pub async fn ingest_document(
        &self,
        document_id: &str,
        text: &str,
        metadata: &Metadata,
    ) -> Result<usize, RagError> {
        let model = self.embedder.model_name().to_string();
        let chunks = chunk_text(text, self.settings.chunking, metadata)?;

        if chunks.is_empty() {
            return Err(RagError::EmptyDocument(document_id.to_string()));
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = embed_batch(
            self.embedder.as_ref(),
            &texts,
            self.settings.embedding.batch_size,
            self.settings.embedding.max_concurrent_batches,
        )
        .await?;

        self.store.delete_by_document(document_id).await?;
        let stored = self.store.add(document_id, &chunks, &vectors, &model).await?;

        let dimension = vectors.first().map(Vec::len);
        self.catalog
            .record_ingestion(document_id, stored, &model, dimension)
            .await?;

        info!(
            document_id,
            chunks = stored,
            model = %model,
            backend = self.store.backend_name(),
            "document ingested"
        );
        Ok(stored)
    }

    /// Runs [`Self::ingest_document`] under the catalog's processing status.
    ///
    /// A document already processing, or completed when `force` is false, is
    /// skipped. Ingestion failures are recorded on the document and returned
    /// as [`ProcessingOutcome::Failed`].
    pub async fn process_document(
        &self,
        document_id: &str,
        text: &str,
        force: bool,
    ) -> Result<ProcessingOutcome, RagError> {
        if let ProcessingClaim::Skipped(status) =
            self.catalog.begin_processing(document_id, force).await?
        {
            info!(document_id, ?status, "document skipped");
            return Ok(ProcessingOutcome::Skipped { status });
        }

        let mut metadata = Metadata::new();
        if let Some(record) = self.catalog.document(document_id).await? {
            metadata.insert("document_name".to_string(), Value::from(record.name));
        }

        match self.ingest_document(document_id, text, &metadata).await {
            Ok(chunk_count) => {
                self.catalog.mark_completed(document_id).await?;
                Ok(ProcessingOutcome::Completed { chunk_count })
            }
            Err(failure) => {
                let message = failure.to_string();
                error!(document_id, error = %message, "document processing failed");
                self.catalog.mark_failed(document_id, &message).await?;
                Ok(ProcessingOutcome::Failed { error: message })
            }
        }
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<bool, RagError> {
        let deleted = self.store.delete_by_document(document_id).await?;
        info!(document_id, "document vectors deleted");
        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<StoreStats, RagError> {
        self.store.stats().await
    }

    pub async fn get_context(
        &self,
        request: &ContextRequest,
    ) -> Result<RetrievedContext, RagError> {
        if request.top_k == 0 {
            return Ok(RetrievedContext::default());
        }

        let query_vector = embed(self.embedder.as_ref(), &request.query).await?;

        let candidates = self
            .store
            .search(
                &query_vector,
                request.allowed_document_ids.as_deref(),
                request.top_k.saturating_mul(2),
                request.score_threshold,
            )
            .await;
        debug!(candidates = candidates.len(), "vector search finished");
        if candidates.is_empty() {
            return Ok(RetrievedContext::default());
        }

        let mut hits = match self.filter_accessible(request, candidates).await {
            Ok(hits) => hits,
            Err(failure) => {
                warn!(error = %failure, "access check failed, returning no context");
                return Ok(RetrievedContext::default());
            }
        };
        debug!(accessible = hits.len(), "access filter applied");

        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(request.top_k);

        if let Some(reranker) = &self.reranker {
            match reranker.rerank(&request.query, hits.clone()).await {
                Ok(reranked) => hits = restrict_to_candidates(hits, reranked),
                Err(failure) => {
                    warn!(error = %failure, "rerank failed, keeping similarity order")
                }
            }
        }

        let candidates = match self.name_candidates(hits).await {
            Ok(candidates) => candidates,
            Err(failure) => {
                warn!(error = %failure, "document lookup failed, returning no context");
                return Ok(RetrievedContext::default());
            }
        };

        let context = assemble_context(candidates, request.max_context_chars);
        debug!(
            citations = context.citations.len(),
            chars = context.context.chars().count(),
            "context assembled"
        );
        Ok(context)
    }

    async fn filter_accessible(
        &self,
        request: &ContextRequest,
        mut hits: Vec<SearchHit>,
    ) -> Result<Vec<SearchHit>, RagError> {
        let Some(allowed) = &request.allowed_document_ids else {
            return Ok(hits);
        };

        let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();
        hits.retain(|hit| allowed.contains(hit.document_id.as_str()));

        if let Some(requester_id) = &request.requester_id {
            let document_ids = distinct_document_ids(&hits);
            let permitted = self
                .catalog
                .accessible_documents(requester_id, &document_ids)
                .await?;
            hits.retain(|hit| permitted.contains(&hit.document_id));
        }

        Ok(hits)
    }

    async fn name_candidates(
        &self,
        hits: Vec<SearchHit>,
    ) -> Result<Vec<ContextCandidate>, RagError> {
        let names = self
            .catalog
            .document_names(&distinct_document_ids(&hits))
            .await?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| match names.get(&hit.document_id) {
                Some(name) => Some(ContextCandidate {
                    document_name: name.clone(),
                    hit,
                }),
                None => {
                    debug!(document_id = %hit.document_id, "hit from unknown document skipped");
                    None
                }
            })
            .collect())
    }
}

/// Keeps the reranked order, but only for hits that were already candidates.
/// Candidates the reranker dropped follow in their original order.
fn restrict_to_candidates(
    candidates: Vec<SearchHit>,
    reranked: Vec<SearchHit>,
) -> Vec<SearchHit> {
    let mut remaining: Vec<Option<SearchHit>> = candidates.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(remaining.len());

    for hit in reranked {
        let slot = remaining.iter_mut().find(|slot| {
            slot.as_ref()
                .is_some_and(|candidate| candidate.record_id == hit.record_id)
        });
        match slot.and_then(Option::take) {
            Some(candidate) => ordered.push(candidate),
            None => debug!(record_id = %hit.record_id, "ignoring hit the reranker added"),
        }
    }
    ordered.extend(remaining.into_iter().flatten());
    ordered
}

fn distinct_document_ids(hits: &[SearchHit]) -> Vec<String> {
    let mut seen = HashSet::new();
    hits.iter()
        .filter(|hit| seen.insert(hit.document_id.as_str()))
        .map(|hit| hit.document_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::chunking::ChunkingConfig;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::StoreError;
    use crate::models::{DocumentRecord, ProcessingStatus};
    use crate::stores::{LocalStore, VectorBackend};
    use async_trait::async_trait;

    struct Harness {
        pipeline: RagPipeline,
        catalog: Arc<InMemoryCatalog>,
    }

    fn harness(documents: &[(&str, &str, &str)]) -> Harness {
        harness_with(
            Arc::new(CharacterNgramEmbedder::default()),
            Arc::new(LocalStore::in_memory()),
            documents,
        )
    }

    fn harness_with(
        embedder: Arc<dyn Embedder>,
        backend: Arc<dyn VectorBackend>,
        documents: &[(&str, &str, &str)],
    ) -> Harness {
        let catalog = Arc::new(InMemoryCatalog::from_records(
            documents
                .iter()
                .map(|(id, name, owner)| DocumentRecord::new(*id, *name, *owner)),
        ));
        let mut settings = Settings::default();
        settings.chunking = ChunkingConfig {
            chunk_size: 1_000,
            overlap: 200,
        };
        settings.embedding.batch_size = 2;

        let pipeline = RagPipeline::new(
            embedder,
            VectorStoreAdapter::new(backend),
            catalog.clone(),
            settings,
        );
        Harness { pipeline, catalog }
    }

    /// 2500 characters of distinct words with no sentence boundaries.
    fn long_document() -> String {
        (0..250).map(|index| format!("token{index:04} ")).collect()
    }

    fn open_request(query: &str, top_k: usize) -> ContextRequest {
        ContextRequest {
            top_k,
            score_threshold: 0.0,
            max_context_chars: 10_000,
            ..ContextRequest::new(query)
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn model_name(&self) -> &str {
            "failing"
        }

        fn dimensions(&self) -> Option<usize> {
            None
        }

        async fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
            Err(RagError::EmbeddingProvider("quota exceeded".to_string()))
        }
    }

    struct OfflineBackend;

    #[async_trait]
    impl VectorBackend for OfflineBackend {
        fn name(&self) -> &str {
            "offline"
        }

        async fn upsert(&self, _records: &[crate::models::VectorRecord]) -> Result<(), StoreError> {
            Err(StoreError::backend("offline", "connection refused"))
        }

        async fn query(
            &self,
            _vector: &[f32],
            _document_ids: Option<&[String]>,
            _limit: usize,
        ) -> Result<Vec<SearchHit>, StoreError> {
            Err(StoreError::backend("offline", "connection refused"))
        }

        async fn delete_document(&self, _document_id: &str) -> Result<(), StoreError> {
            Err(StoreError::backend("offline", "connection refused"))
        }

        async fn stats(&self) -> Result<StoreStats, StoreError> {
            Err(StoreError::backend("offline", "connection refused"))
        }
    }

    struct ReversingReranker;

    #[async_trait]
    impl Reranker for ReversingReranker {
        async fn rerank(
            &self,
            _query: &str,
            mut hits: Vec<SearchHit>,
        ) -> Result<Vec<SearchHit>, RagError> {
            hits.reverse();
            Ok(hits)
        }
    }

    /// Puts a hit from another document in front of the real ones.
    struct InjectingReranker {
        foreign: SearchHit,
    }

    #[async_trait]
    impl Reranker for InjectingReranker {
        async fn rerank(
            &self,
            _query: &str,
            hits: Vec<SearchHit>,
        ) -> Result<Vec<SearchHit>, RagError> {
            let mut reranked = vec![self.foreign.clone()];
            reranked.extend(hits.into_iter().rev());
            Ok(reranked)
        }
    }

    struct BrokenReranker;

    #[async_trait]
    impl Reranker for BrokenReranker {
        async fn rerank(
            &self,
            _query: &str,
            _hits: Vec<SearchHit>,
        ) -> Result<Vec<SearchHit>, RagError> {
            Err(RagError::Rerank("model unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn ingested_chunk_is_retrieved_with_citation() -> Result<(), RagError> {
        let harness = harness(&[("doc", "Plant handbook", "alice")]);
        let text = long_document();

        let stored = harness
            .pipeline
            .ingest_document("doc", &text, &Metadata::new())
            .await?;
        assert_eq!(stored, 3);

        let chunks = chunk_text(&text, harness.pipeline.settings().chunking, &Metadata::new())?;
        let query: String = chunks[1].text.chars().skip(50).take(900).collect();
        let context = harness
            .pipeline
            .get_context(&open_request(&query, 1))
            .await?;

        assert_eq!(context.citations.len(), 1);
        let citation = &context.citations[0];
        assert_eq!(citation.record_id, "doc_1");
        assert_eq!(citation.document_name, "Plant handbook");
        assert!(citation.relevance_score > 0.9);
        assert!(context.context.contains(&chunks[1].text));
        assert_eq!(citation.excerpt.chars().count(), 203);
        assert!(context.context.starts_with("[Source: Plant handbook]\n"));

        let record = harness.catalog.document("doc").await?.expect("document");
        assert_eq!(record.chunk_count, 3);
        assert_eq!(record.embedding_model.as_deref(), Some("char-trigram"));
        assert_eq!(record.embedding_dimension, Some(128));
        Ok(())
    }

    #[tokio::test]
    async fn reingestion_replaces_previous_vectors() -> Result<(), RagError> {
        let harness = harness(&[("doc", "Handbook", "alice")]);
        harness
            .pipeline
            .ingest_document("doc", &long_document(), &Metadata::new())
            .await?;
        harness
            .pipeline
            .ingest_document("doc", "A single short paragraph.", &Metadata::new())
            .await?;

        assert_eq!(harness.pipeline.stats().await?.record_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn access_filter_drops_hits_the_requester_cannot_read() -> Result<(), RagError> {
        let harness = harness(&[
            ("mine", "My notes", "alice"),
            ("theirs", "Their notes", "bob"),
        ]);
        harness
            .pipeline
            .ingest_document(
                "mine",
                "Pump maintenance checklist and torque values.",
                &Metadata::new(),
            )
            .await?;
        harness
            .pipeline
            .ingest_document("theirs", "Valve pressure limits for the boiler.", &Metadata::new())
            .await?;

        let mut request = open_request("Valve pressure limits for the boiler.", 5);
        request.allowed_document_ids = Some(vec!["mine".to_string(), "theirs".to_string()]);
        request.requester_id = Some("alice".to_string());

        let context = harness.pipeline.get_context(&request).await?;
        assert_eq!(context.citations.len(), 1);
        assert_eq!(context.citations[0].document_id, "mine");
        assert!(!context.context.contains("boiler"));

        request.requester_id = None;
        request.allowed_document_ids = Some(vec!["mine".to_string()]);
        let context = harness.pipeline.get_context(&request).await?;
        assert!(context.citations.iter().all(|c| c.document_id == "mine"));

        request.allowed_document_ids = Some(Vec::new());
        assert!(harness.pipeline.get_context(&request).await?.is_empty());

        request.allowed_document_ids = None;
        let context = harness.pipeline.get_context(&request).await?;
        assert_eq!(context.citations[0].document_id, "theirs");
        Ok(())
    }

    #[tokio::test]
    async fn budget_excludes_overflowing_candidate_and_the_rest() -> Result<(), RagError> {
        let harness = harness(&[("doc", "H", "alice")]);
        harness
            .pipeline
            .ingest_document("doc", &long_document(), &Metadata::new())
            .await?;

        let mut request = open_request("token0100 token0101", 3);
        request.max_context_chars = 1_100;

        let context = harness.pipeline.get_context(&request).await?;
        assert_eq!(context.citations.len(), 1);
        assert!(context.context.chars().count() <= 1_100);

        request.max_context_chars = 10;
        assert!(harness.pipeline.get_context(&request).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn hits_of_unknown_documents_are_skipped() -> Result<(), RagError> {
        let harness = harness(&[("doc", "Known", "alice")]);
        harness
            .pipeline
            .ingest_document("doc", "Known document body.", &Metadata::new())
            .await?;
        harness.catalog.remove("doc")?;

        let context = harness
            .pipeline
            .get_context(&open_request("Known document body.", 3))
            .await?;
        assert!(context.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn processing_status_guards_reprocessing() -> Result<(), RagError> {
        let harness = harness(&[("doc", "Handbook", "alice")]);
        let text = long_document();

        let outcome = harness.pipeline.process_document("doc", &text, false).await?;
        assert_eq!(outcome, ProcessingOutcome::Completed { chunk_count: 3 });

        let outcome = harness.pipeline.process_document("doc", &text, false).await?;
        assert_eq!(
            outcome,
            ProcessingOutcome::Skipped {
                status: ProcessingStatus::Completed
            }
        );

        let outcome = harness.pipeline.process_document("doc", &text, true).await?;
        assert_eq!(outcome, ProcessingOutcome::Completed { chunk_count: 3 });
        assert_eq!(harness.pipeline.stats().await?.record_count, 3);

        let record = harness.catalog.document("doc").await?.expect("document");
        assert_eq!(record.status, ProcessingStatus::Completed);
        assert!(record.processed_at.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn processing_failure_is_recorded_on_the_document() -> Result<(), RagError> {
        let harness = harness_with(
            Arc::new(FailingEmbedder),
            Arc::new(LocalStore::in_memory()),
            &[("doc", "Handbook", "alice")],
        );

        let outcome = harness
            .pipeline
            .process_document("doc", "Some text.", false)
            .await?;
        assert!(matches!(
            outcome,
            ProcessingOutcome::Failed { ref error } if error.contains("quota")
        ));

        let record = harness.catalog.document("doc").await?.expect("document");
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert!(record.processing_error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn document_without_text_fails_and_keeps_vectors() -> Result<(), RagError> {
        let harness = harness(&[("doc", "Handbook", "alice")]);
        let text = long_document();
        harness.pipeline.process_document("doc", &text, false).await?;

        let outcome = harness.pipeline.process_document("doc", " \n\t ", true).await?;
        assert!(matches!(
            outcome,
            ProcessingOutcome::Failed { ref error } if error.contains("no text extracted")
        ));

        let record = harness.catalog.document("doc").await?.expect("document");
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert_eq!(record.chunk_count, 3);
        assert_eq!(harness.pipeline.stats().await?.record_count, 3);
        Ok(())
    }

    #[tokio::test]
    async fn query_embedding_failure_is_an_error() {
        let harness = harness_with(
            Arc::new(FailingEmbedder),
            Arc::new(LocalStore::in_memory()),
            &[],
        );

        let result = harness.pipeline.get_context(&open_request("anything", 3)).await;
        assert!(matches!(result, Err(RagError::EmbeddingProvider(_))));
    }

    #[tokio::test]
    async fn unreachable_store_yields_empty_context() -> Result<(), RagError> {
        let harness = harness_with(
            Arc::new(CharacterNgramEmbedder::default()),
            Arc::new(OfflineBackend),
            &[("doc", "Handbook", "alice")],
        );

        let context = harness
            .pipeline
            .get_context(&open_request("pump", 3))
            .await?;
        assert!(context.is_empty());
        assert_eq!(context.context, "");

        let result = harness
            .pipeline
            .ingest_document("doc", "Some text.", &Metadata::new())
            .await;
        assert!(matches!(result, Err(RagError::VectorStoreUnavailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn reranker_reorders_and_failures_fall_back() -> Result<(), RagError> {
        let documents = [("doc", "Handbook", "alice")];
        let text = long_document();
        let query = "token0000 token0001 token0002";

        let plain = harness(&documents);
        plain
            .pipeline
            .ingest_document("doc", &text, &Metadata::new())
            .await?;
        let baseline: Vec<String> = plain
            .pipeline
            .get_context(&open_request(query, 3))
            .await?
            .citations
            .into_iter()
            .map(|citation| citation.record_id)
            .collect();
        assert_eq!(baseline.len(), 3);

        let mut reversed = harness(&documents);
        reversed.pipeline = reversed.pipeline.with_reranker(Arc::new(ReversingReranker));
        reversed
            .pipeline
            .ingest_document("doc", &text, &Metadata::new())
            .await?;
        let order: Vec<String> = reversed
            .pipeline
            .get_context(&open_request(query, 3))
            .await?
            .citations
            .into_iter()
            .map(|citation| citation.record_id)
            .collect();
        let mut expected = baseline.clone();
        expected.reverse();
        assert_eq!(order, expected);

        let mut broken = harness(&documents);
        broken.pipeline = broken.pipeline.with_reranker(Arc::new(BrokenReranker));
        broken
            .pipeline
            .ingest_document("doc", &text, &Metadata::new())
            .await?;
        let order: Vec<String> = broken
            .pipeline
            .get_context(&open_request(query, 3))
            .await?
            .citations
            .into_iter()
            .map(|citation| citation.record_id)
            .collect();
        assert_eq!(order, baseline);
        Ok(())
    }

    #[tokio::test]
    async fn reranker_cannot_introduce_inaccessible_hits() -> Result<(), RagError> {
        let documents = [("mine", "My notes", "alice"), ("secret", "Payroll", "bob")];
        let foreign = SearchHit {
            record_id: "secret_0".to_string(),
            document_id: "secret".to_string(),
            text: "salary table".to_string(),
            score: 1.0,
            metadata: Metadata::new(),
            page_number: None,
        };

        let mut harness = harness(&documents);
        harness.pipeline = harness
            .pipeline
            .with_reranker(Arc::new(InjectingReranker { foreign }));
        harness
            .pipeline
            .ingest_document("mine", &long_document(), &Metadata::new())
            .await?;

        let mut request = open_request("token0000 token0001", 3);
        request.allowed_document_ids = Some(vec!["mine".to_string()]);
        request.requester_id = Some("alice".to_string());

        let context = harness.pipeline.get_context(&request).await?;
        assert_eq!(context.citations.len(), 3);
        assert!(context
            .citations
            .iter()
            .all(|citation| citation.document_id == "mine"));
        assert!(!context.context.contains("salary"));
        Ok(())
    }

    #[test]
    fn reranked_order_is_limited_to_candidates() {
        let hit = |id: &str| SearchHit {
            record_id: id.to_string(),
            document_id: "doc".to_string(),
            text: id.to_string(),
            score: 0.5,
            metadata: Metadata::new(),
            page_number: None,
        };

        let ordered = restrict_to_candidates(
            vec![hit("a"), hit("b"), hit("c")],
            vec![hit("c"), hit("x"), hit("c"), hit("a")],
        );
        let ids: Vec<_> = ordered.iter().map(|hit| hit.record_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn settings_supply_request_defaults() {
        let harness = harness(&[]);
        let request = harness.pipeline.context_request("q");
        assert_eq!(request.top_k, 5);
        assert!((request.score_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(request.max_context_chars, 3_000);
        assert!(request.allowed_document_ids.is_none());
    }
}
