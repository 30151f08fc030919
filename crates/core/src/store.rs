use crate::error::StoreError;
use crate::models::{
    Chunk, ChunkId, ChunkRecord, Document, DocumentId, DocumentStatus, NewDocument, OwnerId,
    VectorMatch,
};
use async_trait::async_trait;

/// Document metadata store. Documents are created on upload and deleted by
/// the host application; deletion must cascade to the document's chunks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, document: NewDocument) -> Result<Document, StoreError>;

    async fn get_document(&self, document_id: DocumentId) -> Result<Option<Document>, StoreError>;

    async fn list_documents(&self, owner_id: &OwnerId) -> Result<Vec<Document>, StoreError>;

    async fn set_status(
        &self,
        document_id: DocumentId,
        status: DocumentStatus,
    ) -> Result<Document, StoreError>;

    async fn delete_document(&self, document_id: DocumentId) -> Result<bool, StoreError>;
}

/// Persistence and query surface for chunk records.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Inserts records verbatim and returns the assigned ids in input order.
    /// Embedding and processed timestamp start out absent.
    async fn insert_chunks(
        &self,
        document_id: DocumentId,
        owner_id: &OwnerId,
        records: &[ChunkRecord],
    ) -> Result<Vec<ChunkId>, StoreError>;

    async fn get_chunk(&self, chunk_id: ChunkId) -> Result<Option<Chunk>, StoreError>;

    /// All chunks of a document in ascending position order.
    async fn chunks_by_document(&self, document_id: DocumentId) -> Result<Vec<Chunk>, StoreError>;

    /// Chunks without a processed timestamp, in ascending position order.
    async fn get_unprocessed(&self, document_id: DocumentId) -> Result<Vec<Chunk>, StoreError>;

    /// Sets the embedding and the processed timestamp in one write.
    async fn set_embedding(&self, chunk_id: ChunkId, vector: Vec<f32>) -> Result<(), StoreError>;

    /// Up to `limit` matches owned by `owner_id`, best first, ties in
    /// insertion order.
    async fn vector_search(
        &self,
        owner_id: &OwnerId,
        query_vector: &[f32],
        limit: usize,
        document_filter: Option<DocumentId>,
    ) -> Result<Vec<VectorMatch>, StoreError>;

    /// Chunks of the same document within `page_window` pages of the given
    /// chunk, in position order.
    async fn get_context(&self, chunk_id: ChunkId, page_window: u32)
        -> Result<Vec<Chunk>, StoreError>;
}

/// Cosine similarity in `[-1, 1]`; zero vectors score 0.
pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    let mut dot = 0f64;
    let mut left_norm = 0f64;
    let mut right_norm = 0f64;

    for (a, b) in left.iter().zip(right.iter()) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }

    dot / (left_norm.sqrt() * right_norm.sqrt())
}
