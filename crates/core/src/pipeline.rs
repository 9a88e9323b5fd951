use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunking::{build_chunks, ChunkingConfig};
use crate::embeddings::Embedder;
use crate::error::PipelineError;
use crate::extract::TextExtractor;
use crate::models::{
    Chunk, Document, DocumentStatus, IndexEntry, PipelineOptions, PipelineReport,
};
use crate::traits::{BlobStorage, Classifier, DocumentRepository, VectorIndex};

pub type ProgressSink = dyn Fn(u64, u64, &str) + Send + Sync;

const TOTAL_STAGES: u64 = 6;

/// Runs one document through extract, chunk, persist, embed, and classify.
/// Extraction and chunking failures are fatal; embedding and classification
/// degrade and the document still completes.
pub struct DocumentPipeline {
    storage: Arc<dyn BlobStorage>,
    repository: Arc<dyn DocumentRepository>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    classifier: Option<Arc<dyn Classifier>>,
    extractor: TextExtractor,
    options: PipelineOptions,
}

impl DocumentPipeline {
    pub fn new(
        storage: Arc<dyn BlobStorage>,
        repository: Arc<dyn DocumentRepository>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            storage,
            repository,
            embedder,
            index,
            classifier: None,
            extractor: TextExtractor::default(),
            options,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn with_extractor(mut self, extractor: TextExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn repository(&self) -> Arc<dyn DocumentRepository> {
        Arc::clone(&self.repository)
    }

    pub fn index(&self) -> Arc<dyn VectorIndex> {
        Arc::clone(&self.index)
    }

    pub async fn run(
        &self,
        document_id: &str,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<PipelineReport, PipelineError> {
        self.options.validate()?;

        let document = self
            .repository
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::UnknownDocument(document_id.to_string()))?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        self.repository
            .set_document_status(document_id, DocumentStatus::Processing)
            .await?;

        let started = Instant::now();
        let outcome = self.run_stages(&document, cancel, progress).await;

        match outcome {
            Ok((chunk_count, embedded_count, tagged_count)) => {
                self.repository
                    .set_document_status(document_id, DocumentStatus::Completed)
                    .await?;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                info!(
                    document_id,
                    chunk_count, embedded_count, elapsed_ms, "document pipeline completed"
                );
                progress(TOTAL_STAGES, TOTAL_STAGES, "finalize");
                Ok(PipelineReport {
                    document_id: document_id.to_string(),
                    chunk_count,
                    embedded_count,
                    tagged_count,
                    elapsed_ms,
                })
            }
            Err(error) => {
                if let Err(status_error) = self
                    .repository
                    .set_document_status(document_id, DocumentStatus::Failed)
                    .await
                {
                    warn!(document_id, %status_error, "failed to mark document as failed");
                }
                Err(error)
            }
        }
    }

    async fn run_stages(
        &self,
        document: &Document,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<(usize, usize, usize), PipelineError> {
        progress(0, TOTAL_STAGES, "extract");
        let extraction = timeout(
            self.options.extraction_timeout,
            self.extractor
                .extract(self.storage.as_ref(), &document.locator, document.format),
        )
        .await;
        let normalized = match extraction {
            Ok(result) => result?,
            Err(_elapsed) => {
                return Err(PipelineError::Timeout {
                    stage: "extract".to_string(),
                    millis: self.options.extraction_timeout.as_millis() as u64,
                })
            }
        };

        self.checkpoint(cancel)?;
        progress(1, TOTAL_STAGES, "chunk");
        let chunks = build_chunks(
            &document.document_id,
            &normalized,
            ChunkingConfig::from(&self.options),
        );

        self.checkpoint(cancel)?;
        progress(2, TOTAL_STAGES, "persist");
        let stale = self.repository.delete_chunks(&document.document_id).await?;
        if !stale.is_empty() {
            if let Err(error) = self.index.delete(&stale).await {
                warn!(document_id = %document.document_id, %error, "failed to drop stale vectors");
            }
        }
        self.repository.insert_chunks(chunks.clone()).await?;

        self.checkpoint(cancel)?;
        progress(3, TOTAL_STAGES, "embed");
        let embedded_count = if self.options.embed && !chunks.is_empty() {
            self.embed_and_index(document, &chunks).await
        } else {
            0
        };

        self.checkpoint(cancel)?;
        progress(4, TOTAL_STAGES, "classify");
        let tagged_count = if self.options.classify {
            self.classify_chunks(document, &chunks).await
        } else {
            0
        };

        self.checkpoint(cancel)?;
        progress(5, TOTAL_STAGES, "finalize");
        Ok((chunks.len(), embedded_count, tagged_count))
    }

    async fn embed_and_index(&self, document: &Document, chunks: &[Chunk]) -> usize {
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();

        let vectors = match timeout(
            self.options.embedding_timeout,
            self.embedder.embed_batch(&texts),
        )
        .await
        {
            Ok(Ok(vectors)) => vectors,
            Ok(Err(error)) => {
                warn!(document_id = %document.document_id, %error, "embedding failed, continuing without vectors");
                return 0;
            }
            Err(_elapsed) => {
                warn!(document_id = %document.document_id, "embedding timed out, continuing without vectors");
                return 0;
            }
        };

        let entries: Vec<IndexEntry> = chunks
            .iter()
            .zip(vectors.iter())
            .map(|(chunk, vector)| {
                IndexEntry {
                    id: chunk.chunk_id.clone(),
                    vector: vector.clone(),
                    text: chunk.content.clone(),
                    metadata: entry_metadata(document, chunk, &chunk.tags),
                }
            })
            .collect();

        let count = entries.len();
        if let Err(error) = self.index.upsert(entries).await {
            warn!(document_id = %document.document_id, %error, "vector indexing failed, continuing without vectors");
            return 0;
        }

        count
    }

    async fn classify_chunks(&self, document: &Document, chunks: &[Chunk]) -> usize {
        let classifier = match &self.classifier {
            Some(classifier) => classifier,
            None => return 0,
        };

        let classification = timeout(self.options.embedding_timeout, async {
            let mut tagged = 0usize;
            for chunk in chunks {
                let tags = match classifier.classify(&chunk.content).await {
                    Ok(tags) => tags,
                    Err(error) => {
                        warn!(chunk_id = %chunk.chunk_id, %error, "classification failed, skipping chunk");
                        continue;
                    }
                };
                if tags.is_empty() {
                    continue;
                }

                if let Err(error) = self
                    .repository
                    .update_chunk_tags(&chunk.chunk_id, tags.clone())
                    .await
                {
                    warn!(chunk_id = %chunk.chunk_id, %error, "failed to persist chunk tags");
                    continue;
                }

                if let Some(embedding) = self.stored_vector(&chunk.chunk_id).await {
                    let entry = IndexEntry {
                        id: chunk.chunk_id.clone(),
                        vector: embedding,
                        text: chunk.content.clone(),
                        metadata: entry_metadata(document, chunk, &tags),
                    };
                    if let Err(error) = self.index.upsert(vec![entry]).await {
                        warn!(chunk_id = %chunk.chunk_id, %error, "failed to refresh vector tags");
                    }
                }

                tagged += 1;
            }
            tagged
        })
        .await;

        match classification {
            Ok(tagged) => tagged,
            Err(_elapsed) => {
                warn!(document_id = %document.document_id, "classification timed out, continuing");
                0
            }
        }
    }

    async fn stored_vector(&self, chunk_id: &str) -> Option<Vec<f32>> {
        match self.index.fetch(chunk_id).await {
            Ok(Some(entry)) => Some(entry.vector),
            Ok(None) => None,
            Err(error) => {
                warn!(chunk_id, %error, "stored vector lookup failed");
                None
            }
        }
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn entry_metadata(
    document: &Document,
    chunk: &Chunk,
    tags: &[String],
) -> HashMap<String, String> {
    let mut metadata = HashMap::new();
    metadata.insert("document_id".to_string(), document.document_id.clone());
    metadata.insert("source".to_string(), document.title());
    metadata.insert("ordinal".to_string(), chunk.ordinal.to_string());
    if !tags.is_empty() {
        metadata.insert("tags".to_string(), tags.join(","));
    }
    metadata
}
