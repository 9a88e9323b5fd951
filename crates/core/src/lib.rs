pub mod answer;
pub mod batch;
pub mod chunking;
pub mod classify;
pub mod embeddings;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod models;
pub mod pipeline;
pub mod retrieval;
pub mod stores;
pub mod traits;

pub use answer::{
    AnswerOptions, AnswerSynthesizer, BackendRegistry, ExtractiveBackend, GeneratedText,
    GenerationBackend, HttpGenerationBackend, NO_INFORMATION_ANSWER,
};
pub use batch::BatchCoordinator;
pub use chunking::{build_chunks, chunk_text, ChunkingConfig};
pub use classify::{KeywordClassifier, TagRule};
pub use embeddings::{
    CachedEmbedder, Embedder, HashingEmbedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{GenerationError, JobError, PipelineError, RetrievalError};
pub use extract::{normalize_text, TextExtractor, MIN_EXTRACTED_CHARS};
pub use jobs::JobOrchestrator;
pub use models::{
    AnswerRecord, BatchFailure, BatchReport, Chunk, Document, DocumentFormat, DocumentStatus,
    IndexEntry, IndexFilter, IndexHit, Job, JobKind, JobProgress, JobSpec, JobStatus,
    PipelineOptions,
    PipelineReport, RetrievalOutcome, RetrievedPassage, SearchOptions,
};
pub use pipeline::DocumentPipeline;
pub use retrieval::{RerankWeights, RetrievalEngine};
pub use stores::{
    discover_document_files, FsBlobStorage, MemoryBlobStorage, MemoryRepository,
    MemoryVectorIndex, QdrantIndex,
};
pub use traits::{BlobStorage, Classifier, DocumentRepository, VectorIndex};
