use chrono::Utc;
use clap::{Parser, Subcommand};
use doc_qa_core::{
    discover_document_files, AnswerOptions, AnswerSynthesizer, BackendRegistry, CachedEmbedder,
    Document, DocumentFormat, DocumentRepository, ExtractiveBackend, FsBlobStorage,
    HashingEmbedder, HttpGenerationBackend, JobOrchestrator, JobSpec, JobStatus,
    KeywordClassifier, MemoryRepository, MemoryVectorIndex, PipelineOptions, RetrievalEngine,
    SearchOptions,
};
use doc_qa_core::DocumentPipeline;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type AppEmbedder = CachedEmbedder<HashingEmbedder>;

#[derive(Parser)]
#[command(name = "doc-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Chunk size in characters
    #[arg(long, default_value = "900")]
    chunk_size: usize,

    /// Chunk overlap in characters
    #[arg(long, default_value = "120")]
    chunk_overlap: usize,

    /// Remote generation endpoint tried before the local extractive backend
    #[arg(long, env = "DOC_QA_GENERATION_ENDPOINT")]
    generation_endpoint: Option<String>,

    /// API key for the remote generation endpoint
    #[arg(long, env = "DOC_QA_GENERATION_API_KEY")]
    generation_api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a folder of documents and print the batch report.
    Ingest {
        /// Folder scanned recursively for txt, md, html, and pdf files.
        #[arg(long)]
        folder: String,
    },
    /// Ingest a folder, then answer one or more questions about its contents.
    Ask {
        #[arg(long)]
        folder: String,
        /// Natural-language question; repeat the flag to batch questions
        #[arg(long = "question", required = true)]
        questions: Vec<String>,
        /// Preferred generation backend name
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value = "5")]
        top_k: usize,
        #[arg(long, default_value = "0.25")]
        min_relevance: f32,
        /// Concurrent question limit when batching
        #[arg(long, default_value = "4")]
        max_concurrent: usize,
    },
    /// Ingest a folder, then print ranked passages for a query.
    Search {
        #[arg(long)]
        folder: String,
        #[arg(long)]
        query: String,
        #[arg(long, default_value = "5")]
        top_k: usize,
        #[arg(long, default_value = "0.25")]
        min_relevance: f32,
    },
}

struct Stack {
    repository: Arc<MemoryRepository>,
    embedder: Arc<AppEmbedder>,
    index: Arc<MemoryVectorIndex>,
    orchestrator: JobOrchestrator,
}

fn build_stack(cli: &Cli) -> Stack {
    let repository = Arc::new(MemoryRepository::default());
    let embedder = Arc::new(CachedEmbedder::new(HashingEmbedder::default()));
    let index = Arc::new(MemoryVectorIndex::default());

    let classifier = KeywordClassifier::default()
        .with_rule("maintenance", &["inspect", "replace", "service", "repair"])
        .with_rule("safety", &["hazard", "lockout", "warning", "danger"]);

    let pipeline = Arc::new(
        DocumentPipeline::new(
            Arc::new(FsBlobStorage),
            repository.clone(),
            embedder.clone(),
            index.clone(),
            PipelineOptions {
                chunk_size: cli.chunk_size,
                chunk_overlap: cli.chunk_overlap,
                ..Default::default()
            },
        )
        .with_classifier(Arc::new(classifier)),
    );

    Stack {
        repository,
        embedder,
        index,
        orchestrator: JobOrchestrator::new(pipeline),
    }
}

async fn ingest_folder(stack: &Stack, folder: &str) -> anyhow::Result<()> {
    let files = discover_document_files(Path::new(folder));
    if files.is_empty() {
        anyhow::bail!("no ingestable documents found in {folder}");
    }

    let mut ids = Vec::new();
    for path in files {
        let locator = path.to_string_lossy().to_string();
        let document = Document::new(&locator, DocumentFormat::from_path(&locator));
        ids.push(document.document_id.clone());
        stack.repository.put_document(document).await?;
    }

    info!(folder, documents = ids.len(), "submitting batch ingestion job");
    let job_id = stack.orchestrator.submit(JobSpec::batch(ids)).await?;

    let job = loop {
        let job = stack.orchestrator.status(&job_id)?;
        if job.status.is_terminal() {
            break job;
        }
        info!(
            job_id,
            current = job.progress.current,
            total = job.progress.total,
            label = %job.progress.label,
            "ingestion in progress"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    match job.status {
        JobStatus::Success => {
            if let Some(result) = &job.result {
                println!("ingestion report: {result}");
                let failed = result["failed"].as_array().map(Vec::len).unwrap_or(0);
                if failed > 0 {
                    warn!(failed, "some documents failed to ingest");
                }
            }
            Ok(())
        }
        _ => anyhow::bail!(
            "ingestion job failed: {}",
            job.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

fn build_registry(cli: &Cli) -> BackendRegistry {
    let mut registry = BackendRegistry::default();

    if let Some(endpoint) = &cli.generation_endpoint {
        match HttpGenerationBackend::new("remote", endpoint, cli.generation_api_key.clone()) {
            Ok(backend) => registry.register(Arc::new(backend)),
            Err(error) => warn!(%error, "ignoring invalid generation endpoint"),
        }
    }
    registry.register(Arc::new(ExtractiveBackend));
    info!(backends = ?registry.backend_names(), "generation backends registered");
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let stack = build_stack(&cli);

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "doc-qa boot"
    );

    match &cli.command {
        Command::Ingest { folder } => {
            ingest_folder(&stack, folder).await?;
        }
        Command::Ask {
            folder,
            questions,
            model,
            top_k,
            min_relevance,
            max_concurrent,
        } => {
            ingest_folder(&stack, folder).await?;

            let engine = Arc::new(RetrievalEngine::new(
                stack.embedder.clone(),
                stack.index.clone(),
            ));
            let synthesizer = Arc::new(
                AnswerSynthesizer::new(engine, build_registry(&cli))
                    .with_repository(stack.repository.clone()),
            );

            let options = AnswerOptions {
                top_k: *top_k,
                min_relevance: *min_relevance,
                ..Default::default()
            };

            let records = synthesizer
                .batch_answer(
                    questions.clone(),
                    model.clone(),
                    *max_concurrent,
                    options,
                )
                .await;

            for record in records {
                println!("question: {}", record.question);
                println!("answer: {}", record.answer);
                println!(
                    "model={} confidence={:.2} sources={}",
                    record.model_used,
                    record.confidence,
                    record.source_chunk_ids.len()
                );
                for chunk_id in &record.source_chunk_ids {
                    println!("  source chunk {chunk_id}");
                }
            }
        }
        Command::Search {
            folder,
            query,
            top_k,
            min_relevance,
        } => {
            ingest_folder(&stack, folder).await?;

            let engine = RetrievalEngine::new(stack.embedder.clone(), stack.index.clone());
            let outcome = engine
                .search(
                    query,
                    &SearchOptions {
                        top_k: *top_k,
                        min_relevance: *min_relevance,
                        rerank: true,
                        filter: None,
                    },
                )
                .await;

            if outcome.degraded {
                warn!("retrieval degraded, results may be incomplete");
            }

            println!("query: {query}");
            for passage in outcome.passages {
                println!(
                    "[{}] relevance={:.4} chunk={} document_id={}",
                    passage.source, passage.relevance, passage.chunk_id, passage.document_id
                );
                println!("  passage_text:\n{}", passage.content);
            }
        }
    }

    Ok(())
}
