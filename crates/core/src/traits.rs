use crate::error::{PipelineError, RetrievalError};
use crate::models::{
    AnswerRecord, Chunk, Document, DocumentStatus, IndexEntry, IndexFilter, IndexHit,
};
use async_trait::async_trait;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn read(&self, locator: &str) -> Result<Vec<u8>, PipelineError>;

    async fn exists(&self, locator: &str) -> Result<bool, PipelineError>;

    async fn size(&self, locator: &str) -> Result<u64, PipelineError>;
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn put_document(&self, document: Document) -> Result<(), PipelineError>;

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, PipelineError>;

    async fn list_documents(&self) -> Result<Vec<Document>, PipelineError>;

    async fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
    ) -> Result<(), PipelineError>;

    async fn delete_document(&self, document_id: &str) -> Result<(), PipelineError>;

    async fn insert_chunks(&self, chunks: Vec<Chunk>) -> Result<(), PipelineError>;

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, PipelineError>;

    async fn all_chunks(&self) -> Result<Vec<Chunk>, PipelineError>;

    async fn delete_chunks(&self, document_id: &str) -> Result<Vec<String>, PipelineError>;

    async fn delete_chunks_by_id(&self, chunk_ids: &[String]) -> Result<(), PipelineError>;

    async fn update_chunk_tags(&self, chunk_id: &str, tags: Vec<String>)
        -> Result<(), PipelineError>;

    async fn put_answer(&self, record: AnswerRecord) -> Result<(), PipelineError>;

    async fn list_answers(&self) -> Result<Vec<AnswerRecord>, PipelineError>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), RetrievalError>;

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>, RetrievalError>;

    async fn fetch(&self, id: &str) -> Result<Option<IndexEntry>, RetrievalError>;

    async fn scan(&self, filter: &IndexFilter, limit: usize) -> Result<Vec<IndexHit>, RetrievalError>;

    async fn delete(&self, ids: &[String]) -> Result<(), RetrievalError>;
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Vec<String>, PipelineError>;
}
