use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::BatchCoordinator;
use crate::error::JobError;
use crate::models::{Job, JobKind, JobProgress, JobSpec, JobStatus};
use crate::pipeline::DocumentPipeline;

/// Tracks asynchronous jobs over the pipeline. Submission returns
/// immediately; execution happens on spawned worker tasks. At most one
/// active job per document is enforced at submission time.
pub struct JobOrchestrator {
    pipeline: Arc<DocumentPipeline>,
    jobs: Arc<DashMap<String, Job>>,
    active: Arc<DashMap<String, String>>,
    tokens: Arc<DashMap<String, CancellationToken>>,
}

impl JobOrchestrator {
    pub fn new(pipeline: Arc<DocumentPipeline>) -> Self {
        Self {
            pipeline,
            jobs: Arc::new(DashMap::new()),
            active: Arc::new(DashMap::new()),
            tokens: Arc::new(DashMap::new()),
        }
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<String, JobError> {
        match spec.kind {
            JobKind::Single | JobKind::Regenerate => {
                if spec.document_ids.len() != 1 {
                    return Err(JobError::InvalidSpec(
                        "exactly one target document required".to_string(),
                    ));
                }
            }
            JobKind::Batch => {
                if spec.document_ids.is_empty() {
                    return Err(JobError::InvalidSpec(
                        "at least one target document required".to_string(),
                    ));
                }
            }
            JobKind::Cleanup => {}
        }

        let repository = self.pipeline.repository();
        for document_id in &spec.document_ids {
            match repository.get_document(document_id).await {
                Ok(Some(_)) => {}
                Ok(None) => return Err(JobError::InvalidTarget(document_id.clone())),
                Err(error) => {
                    return Err(JobError::InvalidTarget(format!("{document_id}: {error}")))
                }
            }
        }

        let job_id = Uuid::new_v4().to_string();

        let mut claimed = Vec::new();
        let mut conflict = None;
        for document_id in &spec.document_ids {
            let was_claimed = match self.active.entry(document_id.clone()) {
                dashmap::mapref::entry::Entry::Occupied(_) => false,
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(job_id.clone());
                    true
                }
            };

            if was_claimed {
                claimed.push(document_id.clone());
            } else {
                conflict = Some(document_id.clone());
                break;
            }
        }

        if let Some(document_id) = conflict {
            for previous in claimed {
                self.active.remove(&previous);
            }
            return Err(JobError::AlreadyInProgress(document_id));
        }

        let total = match spec.kind {
            JobKind::Single | JobKind::Regenerate => 6,
            JobKind::Batch => spec.document_ids.len() as u64,
            JobKind::Cleanup => 1,
        };

        self.jobs.insert(
            job_id.clone(),
            Job {
                job_id: job_id.clone(),
                kind: spec.kind,
                document_ids: spec.document_ids.clone(),
                status: JobStatus::Pending,
                progress: JobProgress {
                    current: 0,
                    total,
                    label: "pending".to_string(),
                },
                result: None,
                error: None,
                submitted_at: Utc::now(),
                finished_at: None,
            },
        );

        let token = CancellationToken::new();
        self.tokens.insert(job_id.clone(), token.clone());

        let worker = Worker {
            pipeline: Arc::clone(&self.pipeline),
            jobs: Arc::clone(&self.jobs),
            active: Arc::clone(&self.active),
            tokens: Arc::clone(&self.tokens),
        };
        let spawn_id = job_id.clone();
        let kind = spec.kind;
        let document_ids = spec.document_ids;
        tokio::spawn(async move {
            worker.run(spawn_id, kind, document_ids, token).await;
        });

        Ok(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<Job, JobError> {
        self.jobs
            .get(job_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }

    /// Best-effort: cancellation only prevents stages and batch items that
    /// have not started yet. Returns whether a cancellation was signalled.
    pub fn cancel(&self, job_id: &str) -> Result<bool, JobError> {
        let job = self.status(job_id)?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        match self.tokens.get(job_id) {
            Some(token) => {
                token.cancel();
                info!(job_id, "job cancellation requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

struct Worker {
    pipeline: Arc<DocumentPipeline>,
    jobs: Arc<DashMap<String, Job>>,
    active: Arc<DashMap<String, String>>,
    tokens: Arc<DashMap<String, CancellationToken>>,
}

impl Worker {
    async fn run(
        self,
        job_id: String,
        kind: JobKind,
        document_ids: Vec<String>,
        token: CancellationToken,
    ) {
        if token.is_cancelled() {
            self.finish(
                &job_id,
                JobStatus::Failure,
                None,
                Some("cancelled before start".to_string()),
            );
            return;
        }

        if let Some(mut job) = self.jobs.get_mut(&job_id) {
            if job.status.is_terminal() {
                return;
            }
            job.status = JobStatus::Progress;
        }
        info!(job_id, ?kind, "job started");

        match kind {
            JobKind::Single | JobKind::Regenerate => {
                self.run_single(&job_id, &document_ids[0], &token).await;
            }
            JobKind::Batch => {
                self.run_batch(&job_id, &document_ids, &token).await;
            }
            JobKind::Cleanup => {
                self.run_cleanup(&job_id, &token).await;
            }
        }
    }

    async fn run_single(&self, job_id: &str, document_id: &str, token: &CancellationToken) {
        let progress = self.progress_sink(job_id);

        match self.pipeline.run(document_id, token, &progress).await {
            Ok(report) => {
                self.finish(
                    job_id,
                    JobStatus::Success,
                    Some(json!({
                        "document_id": report.document_id,
                        "chunk_count": report.chunk_count,
                        "embedded_count": report.embedded_count,
                        "tagged_count": report.tagged_count,
                        "elapsed_ms": report.elapsed_ms,
                    })),
                    None,
                );
            }
            Err(error) => {
                self.finish(job_id, JobStatus::Failure, None, Some(error.to_string()));
            }
        }
    }

    async fn run_batch(&self, job_id: &str, document_ids: &[String], token: &CancellationToken) {
        let progress = self.progress_sink(job_id);
        let coordinator = BatchCoordinator::new(Arc::clone(&self.pipeline));
        let report = coordinator.run(document_ids, token, &progress).await;

        let result = json!({
            "processed": report.processed,
            "failed": report.failed,
            "success_rate": report.success_rate,
        });

        if token.is_cancelled() {
            self.finish(
                job_id,
                JobStatus::Failure,
                Some(result),
                Some("cancelled".to_string()),
            );
        } else {
            self.finish(job_id, JobStatus::Success, Some(result), None);
        }
    }

    async fn run_cleanup(&self, job_id: &str, token: &CancellationToken) {
        let repository = self.pipeline.repository();
        let index = self.pipeline.index();

        let chunks = match repository.all_chunks().await {
            Ok(chunks) => chunks,
            Err(error) => {
                self.finish(job_id, JobStatus::Failure, None, Some(error.to_string()));
                return;
            }
        };

        let mut by_document: HashMap<String, Vec<String>> = HashMap::new();
        for chunk in chunks {
            by_document
                .entry(chunk.document_id.clone())
                .or_default()
                .push(chunk.chunk_id);
        }

        let mut known = HashSet::new();
        match repository.list_documents().await {
            Ok(documents) => {
                for document in documents {
                    known.insert(document.document_id);
                }
            }
            Err(error) => {
                self.finish(job_id, JobStatus::Failure, None, Some(error.to_string()));
                return;
            }
        }

        let orphaned: Vec<(String, Vec<String>)> = by_document
            .into_iter()
            .filter(|(document_id, _)| !known.contains(document_id))
            .collect();

        let progress = self.progress_sink(job_id);
        let total = orphaned.len().max(1) as u64;
        let mut removed = 0usize;

        for (position, (document_id, chunk_ids)) in orphaned.iter().enumerate() {
            if token.is_cancelled() {
                self.finish(
                    job_id,
                    JobStatus::Failure,
                    Some(json!({ "removed_chunks": removed })),
                    Some("cancelled".to_string()),
                );
                return;
            }

            progress(position as u64, total, document_id);
            if let Err(error) = index.delete(chunk_ids).await {
                warn!(document_id, %error, "failed to drop orphaned vectors");
            }
            if let Err(error) = repository.delete_chunks_by_id(chunk_ids).await {
                warn!(document_id, %error, "failed to drop orphaned chunks");
                continue;
            }
            removed += chunk_ids.len();
        }

        progress(total, total, "cleanup");
        self.finish(
            job_id,
            JobStatus::Success,
            Some(json!({
                "removed_chunks": removed,
                "orphaned_documents": orphaned.len(),
            })),
            None,
        );
    }

    fn progress_sink(&self, job_id: &str) -> impl Fn(u64, u64, &str) + Send + Sync {
        let jobs = Arc::clone(&self.jobs);
        let job_id = job_id.to_string();
        move |current, total, label: &str| {
            if let Some(mut job) = jobs.get_mut(&job_id) {
                if !job.status.is_terminal() {
                    job.progress = JobProgress {
                        current,
                        total,
                        label: label.to_string(),
                    };
                }
            }
        }
    }

    fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            // terminal states are write-once
            if job.status.is_terminal() {
                return;
            }
            job.status = status;
            job.result = result;
            job.error = error;
            job.finished_at = Some(Utc::now());
            if status == JobStatus::Success {
                job.progress.current = job.progress.total;
            }
        }

        if let Some(job) = self.jobs.get(job_id) {
            for document_id in &job.document_ids {
                self.active.remove(document_id);
            }
        }
        self.tokens.remove(job_id);
        info!(job_id, ?status, "job finished");
    }
}
