use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rag_pipeline_core::{
    create_backend, create_embedder, discover_documents, ingest_sources_best_effort,
    load_settings, DocumentRecord, InMemoryCatalog, LlmReranker, ProcessingOutcome, RagPipeline,
    Settings, VectorStoreAdapter,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "rag-pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML settings file. Built-in defaults apply when omitted.
    #[arg(long, env = "RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Document catalog file holding ownership and processing status.
    #[arg(long, env = "RAG_CATALOG", default_value = "./catalog.json")]
    catalog: PathBuf,

    /// Vector store backend: local, service_a or service_b.
    #[arg(long, env = "RAG_VECTOR_BACKEND")]
    backend: Option<String>,

    /// Snapshot file of the local vector store.
    #[arg(long, env = "RAG_LOCAL_STORE")]
    local_store: Option<PathBuf>,

    /// Embedding provider: openai or ngram.
    #[arg(long, env = "RAG_EMBEDDING_PROVIDER")]
    embedding_provider: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Chunk, embed and store one text file.
    Ingest {
        #[arg(long)]
        document_id: String,
        /// Display name used in context citations.
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        file: PathBuf,
        /// Reprocess a document that already completed.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Ingest every .txt/.md file under a folder, recursively.
    IngestFolder {
        #[arg(long)]
        folder: PathBuf,
        #[arg(long)]
        owner: String,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Assemble retrieval context for a query.
    Query {
        #[arg(long)]
        query: String,
        /// Only return documents this user may access.
        #[arg(long)]
        requester: Option<String>,
        /// Restrict retrieval to these document IDs. Repeatable.
        #[arg(long = "allow")]
        allow: Vec<String>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        max_context_chars: Option<usize>,
        #[arg(long)]
        score_threshold: Option<f64>,
        /// Print the context and citations as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Remove all vectors of a document.
    Delete {
        #[arg(long)]
        document_id: String,
    },
    /// Show vector store statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;

    let catalog = Arc::new(InMemoryCatalog::load(&cli.catalog).await?);
    let embedder = create_embedder(&settings.embedding)?;
    let store = VectorStoreAdapter::new(create_backend(&settings.vector_store).await?);
    store.prepare().await?;

    info!(
        version = app_version,
        backend = store.backend_name(),
        model = embedder.model_name(),
        started_at = %Utc::now().to_rfc3339(),
        "rag-pipeline boot"
    );

    let mut pipeline = RagPipeline::new(embedder, store, catalog.clone(), settings.clone());
    if settings.retrieval.rerank {
        let reranker =
            LlmReranker::from_settings(&settings.embedding, &settings.retrieval.rerank_model)?;
        pipeline = pipeline.with_reranker(Arc::new(reranker));
    }

    match cli.command {
        Command::Ingest {
            document_id,
            name,
            owner,
            file,
            force,
        } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            catalog.register(DocumentRecord::new(document_id.clone(), name, owner))?;

            let outcome = pipeline.process_document(&document_id, &text, force).await?;
            catalog.save(&cli.catalog).await?;
            println!("{document_id}: {}", describe(&outcome));
        }
        Command::IngestFolder {
            folder,
            owner,
            force,
        } => {
            let sources = discover_documents(&folder)?;
            for source in &sources {
                catalog.register(DocumentRecord::new(
                    source.document_id.clone(),
                    source.name.clone(),
                    owner.clone(),
                ))?;
            }

            let report = ingest_sources_best_effort(&pipeline, sources, force).await?;
            catalog.save(&cli.catalog).await?;

            if !report.skipped_files.is_empty() {
                warn!(
                    "skipped_files={} for folder={}",
                    report.skipped_files.len(),
                    folder.display()
                );
                for skipped in &report.skipped_files {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
                }
            }

            for (source, outcome) in &report.outcomes {
                println!("{} ({}): {}", source.name, source.document_id, describe(outcome));
            }
            println!(
                "{} of {} documents ingested at {}",
                report.completed(),
                report.outcomes.len() + report.skipped_files.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Query {
            query,
            requester,
            allow,
            top_k,
            max_context_chars,
            score_threshold,
            json,
        } => {
            let mut request = pipeline.context_request(query);
            request.requester_id = requester;
            request.allowed_document_ids = if !allow.is_empty() {
                Some(allow)
            } else if request.requester_id.is_some() {
                Some(
                    catalog
                        .records()?
                        .into_iter()
                        .map(|record| record.document_id)
                        .collect(),
                )
            } else {
                None
            };
            if let Some(top_k) = top_k {
                request.top_k = top_k;
            }
            if let Some(max_context_chars) = max_context_chars {
                request.max_context_chars = max_context_chars;
            }
            if let Some(score_threshold) = score_threshold {
                request.score_threshold = score_threshold;
            }

            let context = match pipeline.get_context(&request).await {
                Ok(context) => context,
                Err(failure) => {
                    error!(error = %failure, "retrieval failed");
                    anyhow::bail!("retrieval failed, see logs for details");
                }
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&context)?);
            } else if context.is_empty() {
                println!("no relevant context found");
            } else {
                println!("{}\n", context.context);
                for citation in &context.citations {
                    let page = citation
                        .page_number
                        .map(|page| format!(" page={page}"))
                        .unwrap_or_default();
                    println!(
                        "[{}] score={:.4} record={}{}",
                        citation.document_name, citation.relevance_score, citation.record_id, page
                    );
                    println!("  {}", citation.excerpt);
                }
            }
        }
        Command::Delete { document_id } => {
            pipeline.delete_document(&document_id).await?;
            catalog.remove(&document_id)?;
            catalog.save(&cli.catalog).await?;
            println!("{document_id}: deleted");
        }
        Command::Stats => {
            let stats = pipeline.stats().await?;
            let dimension = stats
                .dimension
                .map(|dimension| dimension.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "backend={} records={} dimension={} documents={}",
                stats.backend,
                stats.record_count,
                dimension,
                catalog.records()?.len()
            );
        }
    }

    Ok(())
}

fn resolve_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = match &cli.config {
        Some(path) => load_config(path)?,
        None => Settings::default(),
    };

    if let Some(backend) = &cli.backend {
        settings.vector_store.backend = backend.clone();
    }
    if let Some(path) = &cli.local_store {
        settings.vector_store.local.path = Some(path.clone());
    }
    if let Some(provider) = &cli.embedding_provider {
        settings.embedding.provider = provider.clone();
    }

    settings.validate()?;
    Ok(settings)
}

fn load_config(path: &Path) -> anyhow::Result<Settings> {
    load_settings(path).with_context(|| format!("loading settings from {}", path.display()))
}

fn describe(outcome: &ProcessingOutcome) -> String {
    match outcome {
        ProcessingOutcome::Completed { chunk_count } => format!("completed, {chunk_count} chunks"),
        ProcessingOutcome::Skipped { status } => format!("skipped, status {status:?}"),
        ProcessingOutcome::Failed { error } => format!("failed: {error}"),
    }
}
