use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("classification failed: {0}")]
    Classification(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("unknown document: {0}")]
    UnknownDocument(String),

    #[error("stage {stage} timed out after {millis}ms")]
    Timeout { stage: String, millis: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("index request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no generation backend available")]
    Unavailable,

    #[error("backend {backend} failed: {details}")]
    Backend { backend: String, details: String },

    #[error("generation timed out after {0}ms")]
    Timeout(u64),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown target document: {0}")]
    InvalidTarget(String),

    #[error("job already in progress for document: {0}")]
    AlreadyInProgress(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
