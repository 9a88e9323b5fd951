use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::PipelineError;

pub const MIN_CHUNK_SIZE: usize = 100;
pub const MAX_CHUNK_SIZE: usize = 5_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Html,
    Pdf,
}

impl DocumentFormat {
    pub fn from_path(path: &str) -> Self {
        let extension = path
            .rsplit('.')
            .next()
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "md" | "markdown" => DocumentFormat::Markdown,
            "html" | "htm" => DocumentFormat::Html,
            "pdf" => DocumentFormat::Pdf,
            _ => DocumentFormat::PlainText,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub locator: String,
    pub format: DocumentFormat,
    pub status: DocumentStatus,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(locator: impl Into<String>, format: DocumentFormat) -> Self {
        let locator = locator.into();
        let mut hasher = Sha256::new();
        hasher.update(locator.as_bytes());

        Self {
            document_id: format!("{:x}", hasher.finalize()),
            locator,
            format,
            status: DocumentStatus::Pending,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn title(&self) -> String {
        self.metadata.get("title").cloned().unwrap_or_else(|| {
            self.locator
                .rsplit(['/', '\\'])
                .next()
                .unwrap_or(&self.locator)
                .to_string()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: u64,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobKind {
    Single,
    Batch,
    Regenerate,
    Cleanup,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Progress,
    Success,
    Failure,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub kind: JobKind,
    pub document_ids: Vec<String>,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    pub document_ids: Vec<String>,
}

impl JobSpec {
    pub fn single(document_id: impl Into<String>) -> Self {
        Self {
            kind: JobKind::Single,
            document_ids: vec![document_id.into()],
        }
    }

    pub fn batch(document_ids: Vec<String>) -> Self {
        Self {
            kind: JobKind::Batch,
            document_ids,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHit {
    pub id: String,
    pub text: String,
    pub metadata: HashMap<String, String>,
    pub distance: f32,
    pub relevance: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFilter {
    pub document_id: Option<String>,
    pub exclude_document: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    pub relevance: f32,
    pub source: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub passages: Vec<RetrievedPassage>,
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub answer_id: String,
    pub question: String,
    pub answer: String,
    pub model_used: String,
    pub confidence: f32,
    pub source_chunk_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub min_relevance: f32,
    pub rerank: bool,
    pub filter: Option<IndexFilter>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_relevance: 0.25,
            rerank: true,
            filter: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embed: bool,
    pub classify: bool,
    pub extraction_timeout: Duration,
    pub embedding_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            chunk_size: 900,
            chunk_overlap: 120,
            embed: true,
            classify: true,
            extraction_timeout: Duration::from_secs(60),
            embedding_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.chunk_size < MIN_CHUNK_SIZE || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(PipelineError::InvalidConfig(format!(
                "chunk_size {} outside {}..={}",
                self.chunk_size, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            )));
        }

        if self.chunk_overlap >= self.chunk_size {
            return Err(PipelineError::InvalidConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub document_id: String,
    pub chunk_count: usize,
    pub embedded_count: usize,
    pub tagged_count: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub document_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub processed: Vec<String>,
    pub failed: Vec<BatchFailure>,
    pub success_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_is_stable_for_locator() {
        let first = Document::new("/data/spec.txt", DocumentFormat::PlainText);
        let second = Document::new("/data/spec.txt", DocumentFormat::PlainText);
        assert_eq!(first.document_id, second.document_id);
    }

    #[test]
    fn format_is_detected_from_extension() {
        assert_eq!(
            DocumentFormat::from_path("notes/readme.MD"),
            DocumentFormat::Markdown
        );
        assert_eq!(
            DocumentFormat::from_path("report.pdf"),
            DocumentFormat::Pdf
        );
        assert_eq!(
            DocumentFormat::from_path("plain"),
            DocumentFormat::PlainText
        );
    }

    #[test]
    fn pipeline_options_reject_invalid_chunking() {
        let too_small = PipelineOptions {
            chunk_size: 10,
            ..Default::default()
        };
        assert!(too_small.validate().is_err());

        let overlap_too_large = PipelineOptions {
            chunk_size: 200,
            chunk_overlap: 200,
            ..Default::default()
        };
        assert!(overlap_too_large.validate().is_err());

        assert!(PipelineOptions::default().validate().is_ok());
    }

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failure.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Progress.is_terminal());
    }
}
