use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{PipelineError, RetrievalError};
use crate::models::{
    AnswerRecord, Chunk, Document, DocumentStatus, IndexEntry, IndexFilter, IndexHit,
};
use crate::traits::{BlobStorage, DocumentRepository, VectorIndex};

use super::relevance_from_distance;

#[derive(Default)]
pub struct MemoryBlobStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStorage {
    pub fn put(&self, locator: impl Into<String>, bytes: Vec<u8>) {
        self.blobs
            .write()
            .expect("blob lock poisoned")
            .insert(locator.into(), bytes);
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn read(&self, locator: &str) -> Result<Vec<u8>, PipelineError> {
        self.blobs
            .read()
            .expect("blob lock poisoned")
            .get(locator)
            .cloned()
            .ok_or_else(|| PipelineError::Storage(format!("no blob at {locator}")))
    }

    async fn exists(&self, locator: &str) -> Result<bool, PipelineError> {
        Ok(self
            .blobs
            .read()
            .expect("blob lock poisoned")
            .contains_key(locator))
    }

    async fn size(&self, locator: &str) -> Result<u64, PipelineError> {
        let bytes = self.read(locator).await?;
        Ok(bytes.len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryRepository {
    documents: RwLock<HashMap<String, Document>>,
    chunks: RwLock<Vec<Chunk>>,
    answers: RwLock<Vec<AnswerRecord>>,
}

#[async_trait]
impl DocumentRepository for MemoryRepository {
    async fn put_document(&self, document: Document) -> Result<(), PipelineError> {
        self.documents
            .write()
            .expect("document lock poisoned")
            .insert(document.document_id.clone(), document);
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, PipelineError> {
        Ok(self
            .documents
            .read()
            .expect("document lock poisoned")
            .get(document_id)
            .cloned())
    }

    async fn list_documents(&self) -> Result<Vec<Document>, PipelineError> {
        let mut documents: Vec<Document> = self
            .documents
            .read()
            .expect("document lock poisoned")
            .values()
            .cloned()
            .collect();
        documents.sort_by(|left, right| left.document_id.cmp(&right.document_id));
        Ok(documents)
    }

    async fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
    ) -> Result<(), PipelineError> {
        let mut documents = self.documents.write().expect("document lock poisoned");
        match documents.get_mut(document_id) {
            Some(document) => {
                document.status = status;
                Ok(())
            }
            None => Err(PipelineError::UnknownDocument(document_id.to_string())),
        }
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), PipelineError> {
        self.documents
            .write()
            .expect("document lock poisoned")
            .remove(document_id);
        Ok(())
    }

    async fn insert_chunks(&self, chunks: Vec<Chunk>) -> Result<(), PipelineError> {
        self.chunks
            .write()
            .expect("chunk lock poisoned")
            .extend(chunks);
        Ok(())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, PipelineError> {
        let mut chunks: Vec<Chunk> = self
            .chunks
            .read()
            .expect("chunk lock poisoned")
            .iter()
            .filter(|chunk| chunk.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|chunk| chunk.ordinal);
        Ok(chunks)
    }

    async fn all_chunks(&self) -> Result<Vec<Chunk>, PipelineError> {
        Ok(self.chunks.read().expect("chunk lock poisoned").clone())
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<Vec<String>, PipelineError> {
        let mut chunks = self.chunks.write().expect("chunk lock poisoned");
        let removed: Vec<String> = chunks
            .iter()
            .filter(|chunk| chunk.document_id == document_id)
            .map(|chunk| chunk.chunk_id.clone())
            .collect();
        chunks.retain(|chunk| chunk.document_id != document_id);
        Ok(removed)
    }

    async fn delete_chunks_by_id(&self, chunk_ids: &[String]) -> Result<(), PipelineError> {
        let mut chunks = self.chunks.write().expect("chunk lock poisoned");
        chunks.retain(|chunk| !chunk_ids.contains(&chunk.chunk_id));
        Ok(())
    }

    async fn update_chunk_tags(
        &self,
        chunk_id: &str,
        tags: Vec<String>,
    ) -> Result<(), PipelineError> {
        let mut chunks = self.chunks.write().expect("chunk lock poisoned");
        if let Some(chunk) = chunks.iter_mut().find(|chunk| chunk.chunk_id == chunk_id) {
            chunk.tags = tags;
        }
        Ok(())
    }

    async fn put_answer(&self, record: AnswerRecord) -> Result<(), PipelineError> {
        self.answers
            .write()
            .expect("answer lock poisoned")
            .push(record);
        Ok(())
    }

    async fn list_answers(&self) -> Result<Vec<AnswerRecord>, PipelineError> {
        Ok(self.answers.read().expect("answer lock poisoned").clone())
    }
}

/// Brute-force cosine index. Upserts are last-write-wins per id, which is
/// the contract the retrieval layer relies on under concurrent writers.
#[derive(Default)]
pub struct MemoryVectorIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl MemoryVectorIndex {
    pub fn len(&self) -> usize {
        self.entries.read().expect("index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_left = 0.0f32;
    let mut norm_right = 0.0f32;
    for (a, b) in left.iter().zip(right.iter()) {
        dot += a * b;
        norm_left += a * a;
        norm_right += b * b;
    }

    let denominator = norm_left.sqrt() * norm_right.sqrt();
    if denominator < f32::EPSILON {
        return 0.0;
    }

    dot / denominator
}

pub(crate) fn matches_filter(metadata: &HashMap<String, String>, filter: &IndexFilter) -> bool {
    if let Some(document_id) = &filter.document_id {
        if metadata.get("document_id") != Some(document_id) {
            return false;
        }
    }

    if let Some(excluded) = &filter.exclude_document {
        if metadata.get("document_id") == Some(excluded) {
            return false;
        }
    }

    if !filter.tags.is_empty() {
        let tags = crate::retrieval::tags_from_metadata(metadata);
        if !filter.tags.iter().any(|tag| tags.contains(tag)) {
            return false;
        }
    }

    true
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), RetrievalError> {
        let mut stored = self.entries.write().expect("index lock poisoned");
        for entry in entries {
            stored.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>, RetrievalError> {
        let stored = self.entries.read().expect("index lock poisoned");
        let mut hits: Vec<IndexHit> = stored
            .values()
            .filter(|entry| {
                filter
                    .map(|filter| matches_filter(&entry.metadata, filter))
                    .unwrap_or(true)
            })
            .map(|entry| {
                let distance = 1.0 - cosine_similarity(vector, &entry.vector);
                IndexHit {
                    id: entry.id.clone(),
                    text: entry.text.clone(),
                    metadata: entry.metadata.clone(),
                    distance,
                    relevance: relevance_from_distance(distance),
                }
            })
            .collect();

        hits.sort_by(|left, right| {
            left.distance
                .total_cmp(&right.distance)
                .then_with(|| left.id.cmp(&right.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn fetch(&self, id: &str) -> Result<Option<IndexEntry>, RetrievalError> {
        Ok(self
            .entries
            .read()
            .expect("index lock poisoned")
            .get(id)
            .cloned())
    }

    async fn scan(
        &self,
        filter: &IndexFilter,
        limit: usize,
    ) -> Result<Vec<IndexHit>, RetrievalError> {
        let stored = self.entries.read().expect("index lock poisoned");
        let mut hits: Vec<IndexHit> = stored
            .values()
            .filter(|entry| matches_filter(&entry.metadata, filter))
            .map(|entry| IndexHit {
                id: entry.id.clone(),
                text: entry.text.clone(),
                metadata: entry.metadata.clone(),
                distance: 0.0,
                relevance: 1.0,
            })
            .collect();

        hits.sort_by(|left, right| left.id.cmp(&right.id));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, ids: &[String]) -> Result<(), RetrievalError> {
        let mut stored = self.entries.write().expect("index lock poisoned");
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }
}
