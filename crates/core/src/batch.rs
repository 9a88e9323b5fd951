use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::models::{BatchFailure, BatchReport};
use crate::pipeline::{DocumentPipeline, ProgressSink};

/// Fans the pipeline out over many documents. A failing document is recorded
/// and the rest of the batch keeps going; cancellation skips documents that
/// have not started yet.
pub struct BatchCoordinator {
    pipeline: Arc<DocumentPipeline>,
}

impl BatchCoordinator {
    pub fn new(pipeline: Arc<DocumentPipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn run(
        &self,
        document_ids: &[String],
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> BatchReport {
        let total = document_ids.len() as u64;
        let mut report = BatchReport::default();

        for (position, document_id) in document_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(document_id, "batch cancelled, skipping remaining documents");
                break;
            }

            progress(position as u64, total, document_id);
            match self.pipeline.run(document_id, cancel, &|_, _, _| {}).await {
                Ok(_) => report.processed.push(document_id.clone()),
                Err(error) => {
                    warn!(document_id, %error, "document failed in batch");
                    report.failed.push(BatchFailure {
                        document_id: document_id.clone(),
                        reason: error.to_string(),
                    });
                }
            }
            progress((position + 1) as u64, total, document_id);
        }

        let attempted = report.processed.len() + report.failed.len();
        report.success_rate = if attempted == 0 {
            0.0
        } else {
            report.processed.len() as f64 / attempted as f64
        };
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::models::{Document, DocumentFormat, DocumentStatus, PipelineOptions};
    use crate::stores::{MemoryBlobStorage, MemoryRepository, MemoryVectorIndex};
    use crate::traits::DocumentRepository;

    const BODY: &str = "Check the intake filters weekly. Clogged filters starve the pump \
        and cause cavitation damage that is expensive to repair.";

    async fn setup(with_blob: &[&str]) -> (Arc<DocumentPipeline>, Arc<MemoryRepository>, Vec<String>) {
        let storage = Arc::new(MemoryBlobStorage::default());
        let repository = Arc::new(MemoryRepository::default());
        let mut ids = Vec::new();

        for locator in with_blob {
            storage.put(*locator, BODY.as_bytes().to_vec());
            let document = Document::new(*locator, DocumentFormat::PlainText);
            ids.push(document.document_id.clone());
            repository.put_document(document).await.unwrap();
        }

        let missing = Document::new("missing-blob.txt", DocumentFormat::PlainText);
        ids.push(missing.document_id.clone());
        repository.put_document(missing).await.unwrap();

        let pipeline = Arc::new(DocumentPipeline::new(
            storage,
            repository.clone(),
            Arc::new(HashingEmbedder::with_dimensions(16)),
            Arc::new(MemoryVectorIndex::default()),
            PipelineOptions {
                chunk_size: 120,
                chunk_overlap: 20,
                ..Default::default()
            },
        ));

        (pipeline, repository, ids)
    }

    #[tokio::test]
    async fn failures_are_collected_without_stopping_the_batch() {
        let (pipeline, repository, ids) = setup(&["a.txt", "b.txt"]).await;
        let coordinator = BatchCoordinator::new(pipeline);

        let report = coordinator
            .run(&ids, &CancellationToken::new(), &|_, _, _| {})
            .await;

        assert_eq!(report.processed.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert!((report.success_rate - 2.0 / 3.0).abs() < 1e-9);

        let failed = repository
            .get_document(&report.failed[0].document_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, DocumentStatus::Failed);
    }

    #[tokio::test]
    async fn cancelled_batch_skips_all_documents() {
        let (pipeline, _repository, ids) = setup(&["a.txt"]).await;
        let coordinator = BatchCoordinator::new(pipeline);

        let token = CancellationToken::new();
        token.cancel();

        let report = coordinator.run(&ids, &token, &|_, _, _| {}).await;
        assert!(report.processed.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(report.success_rate, 0.0);
    }

    #[tokio::test]
    async fn progress_reflects_completed_documents() {
        let (pipeline, _repository, ids) = setup(&["a.txt", "b.txt"]).await;
        let coordinator = BatchCoordinator::new(pipeline);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        coordinator
            .run(&ids, &CancellationToken::new(), &move |current, total, _| {
                seen_cb.lock().unwrap().push((current, total));
            })
            .await;

        let seen = Arc::try_unwrap(seen).unwrap().into_inner().unwrap();
        assert_eq!(seen.first(), Some(&(0, 3)));
        assert_eq!(seen.last(), Some(&(3, 3)));
    }
}
